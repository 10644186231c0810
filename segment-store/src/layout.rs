//! Path conventions for segment files.
//!
//! Final name: `<root>/recordings/<stream>/YYYY/MM/DD/<start_epoch>-<id>.mp4`.
//! A segment being written carries a trailing `.part`; a segment that could
//! not be repaired after a crash is set aside with `.corrupt`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};

/// Suffix of in-flight segment files.
pub const PART_SUFFIX: &str = "part";
/// Suffix of segments that failed crash repair.
pub const CORRUPT_SUFFIX: &str = "corrupt";

/// Resolves segment file locations under one storage root.
#[derive(Debug, Clone)]
pub struct SegmentLayout {
    root: PathBuf,
}

impl SegmentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.root.join("recordings")
    }

    pub fn stream_dir(&self, stream: &str) -> PathBuf {
        self.recordings_dir().join(stream)
    }

    /// Final path for a segment starting at `start_time` with catalog id `id`.
    pub fn segment_path(&self, stream: &str, start_time: i64, id: i64) -> PathBuf {
        let day = DateTime::<Utc>::from_timestamp(start_time, 0).unwrap_or_else(Utc::now);
        self.stream_dir(stream)
            .join(format!("{:04}", day.year()))
            .join(format!("{:02}", day.month()))
            .join(format!("{:02}", day.day()))
            .join(format!("{start_time}-{id}.mp4"))
    }

    /// Create the parent directories of `path` with mode 0755.
    pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
        }
        #[cfg(not(unix))]
        {
            std::fs::create_dir_all(parent)
        }
    }
}

/// `<path>.part` for a final segment path.
pub fn part_path(final_path: &Path) -> PathBuf {
    append_suffix(final_path, PART_SUFFIX)
}

/// `<path>.corrupt` for a final segment path.
pub fn corrupt_path(final_path: &Path) -> PathBuf {
    append_suffix(final_path, CORRUPT_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// The final path a `.part` file finalizes to, if it carries the suffix.
pub fn strip_part_suffix(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{PART_SUFFIX}"))?;
    Some(path.with_file_name(stem))
}

/// Parse `<start_epoch>-<id>.mp4` back into its components.
pub fn parse_segment_filename(name: &str) -> Option<(i64, i64)> {
    let stem = name.strip_suffix(".mp4")?;
    let (start, id) = stem.split_once('-')?;
    Some((start.parse().ok()?, id.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_path_date_tree() {
        let layout = SegmentLayout::new("/srv/nvr");
        // 2024-12-01T15:30:00Z
        let path = layout.segment_path("cam-front", 1733067000, 42);
        assert_eq!(
            path,
            PathBuf::from("/srv/nvr/recordings/cam-front/2024/12/01/1733067000-42.mp4")
        );
    }

    #[test]
    fn test_part_and_corrupt_suffixes() {
        let path = PathBuf::from("/srv/nvr/recordings/cam/2024/12/01/100-1.mp4");
        assert_eq!(
            part_path(&path),
            PathBuf::from("/srv/nvr/recordings/cam/2024/12/01/100-1.mp4.part")
        );
        assert_eq!(
            corrupt_path(&path),
            PathBuf::from("/srv/nvr/recordings/cam/2024/12/01/100-1.mp4.corrupt")
        );
        assert_eq!(strip_part_suffix(&part_path(&path)), Some(path.clone()));
        assert_eq!(strip_part_suffix(&path), None);
    }

    #[test]
    fn test_parse_segment_filename() {
        assert_eq!(parse_segment_filename("1733067000-42.mp4"), Some((1733067000, 42)));
        assert_eq!(parse_segment_filename("garbage.mp4"), None);
        assert_eq!(parse_segment_filename("123-4.part"), None);
    }
}
