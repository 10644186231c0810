//! Timeline manifests for playback over a time range.
//!
//! The manifest is an HLS-style playlist that concatenates segment
//! descriptors; a playback layer serves the referenced files directly.
//! Storage and query parameters are UTC epoch seconds; the playlist
//! additionally renders local wall-clock tags for display.

use std::path::{Path, PathBuf};

use catalog_store::SegmentRecord;
use chrono::{Local, TimeZone};

use crate::error::EngineError;

/// Render the playlist for segments covering `[t0, t1]`.
pub fn render_manifest(segments: &[SegmentRecord], t0: i64, t1: i64) -> String {
    let target_duration = segments
        .iter()
        .filter_map(|s| s.end_time.map(|end| end - s.start_time))
        .max()
        .unwrap_or(1)
        .max(1);

    let mut playlist = format!(
        "#EXTM3U\n\
         #EXT-X-VERSION:3\n\
         #EXT-X-PLAYLIST-TYPE:VOD\n\
         #EXT-X-TARGETDURATION:{target_duration}\n\
         #EXT-X-MEDIA-SEQUENCE:0\n"
    );

    for segment in segments {
        let Some(end) = segment.end_time else {
            continue;
        };
        // clip the advertised range to the query window
        let start = segment.start_time.max(t0);
        let stop = end.min(t1);
        if stop <= start {
            continue;
        }
        if let Some(local) = Local.timestamp_opt(segment.start_time, 0).single() {
            playlist.push_str(&format!(
                "#EXT-X-PROGRAM-DATE-TIME:{}\n",
                local.to_rfc3339()
            ));
        }
        playlist.push_str(&format!(
            "#EXTINF:{:.3},\n{}\n",
            (end - segment.start_time) as f64,
            segment.file_path
        ));
    }

    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

/// Write the manifest for a range under `manifest_dir` and return its path.
pub fn write_manifest(
    manifest_dir: &Path,
    stream: &str,
    t0: i64,
    t1: i64,
    segments: &[SegmentRecord],
) -> Result<PathBuf, EngineError> {
    std::fs::create_dir_all(manifest_dir)?;
    let path = manifest_dir.join(format!("{stream}-{t0}-{t1}.m3u8"));
    std::fs::write(&path, render_manifest(segments, t0, t1))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: i64, start: i64, end: i64) -> SegmentRecord {
        SegmentRecord {
            id,
            stream_name: "cam".to_string(),
            file_path: format!("/rec/cam/{start}-{id}.mp4"),
            start_time: start,
            end_time: Some(end),
            size_bytes: 1000,
            width: 1280,
            height: 720,
            fps: 10,
            codec: "h264".to_string(),
            is_complete: true,
            created_at: start,
        }
    }

    #[test]
    fn test_manifest_basics() {
        let segments = vec![segment(1, 1000, 1060), segment(2, 1060, 1120)];
        let manifest = render_manifest(&segments, 1000, 1120);

        assert!(manifest.starts_with("#EXTM3U"));
        assert!(manifest.contains("#EXT-X-TARGETDURATION:60"));
        assert!(manifest.contains("#EXTINF:60.000,\n/rec/cam/1000-1.mp4"));
        assert!(manifest.contains("/rec/cam/1060-2.mp4"));
        assert!(manifest.contains("#EXT-X-PROGRAM-DATE-TIME:"));
        assert!(manifest.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn test_incomplete_and_out_of_range_skipped() {
        let mut open_segment = segment(3, 2000, 0);
        open_segment.end_time = None;

        let segments = vec![segment(1, 1000, 1060), open_segment, segment(2, 5000, 5060)];
        let manifest = render_manifest(&segments, 900, 1500);

        assert!(manifest.contains("1000-1.mp4"));
        assert!(!manifest.contains("2000-3.mp4"));
        assert!(!manifest.contains("5000-2.mp4"));
    }

    #[test]
    fn test_write_manifest_path() {
        let dir = tempfile::tempdir().unwrap();
        let segments = vec![segment(1, 1000, 1060)];
        let path = write_manifest(dir.path(), "cam-front", 1000, 1120, &segments).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "cam-front-1000-1120.m3u8"
        );
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("#EXTM3U"));
    }
}
