//! Crash repair and fragment inspection.
//!
//! A writer that dies mid-fragment leaves a file whose tail is garbage but
//! whose prefix (init segment plus every completed `moof`+`mdat` pair) is
//! intact. Repair walks the top-level boxes, finds the end of the last
//! complete pair and truncates there.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{info, warn};

use crate::boxes::VIDEO_TRACK_ID;
use crate::error::RepairError;

/// A top-level box located in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawBox {
    kind: [u8; 4],
    offset: u64,
    /// Total box size including the header.
    size: u64,
}

impl RawBox {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Read the box header at `offset`. Returns None at clean EOF and treats a
/// header that runs past the end of the file as absent (a torn write).
fn read_box_at(file: &mut File, offset: u64, file_len: u64) -> Result<Option<RawBox>, RepairError> {
    if offset >= file_len {
        return Ok(None);
    }
    if file_len - offset < 8 {
        return Ok(None); // torn header
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; 8];
    file.read_exact(&mut header)?;

    let size32 = u32::from_be_bytes(header[0..4].try_into().unwrap()) as u64;
    let kind: [u8; 4] = header[4..8].try_into().unwrap();

    let size = match size32 {
        0 => file_len - offset, // "to end of file"
        1 => {
            if file_len - offset < 16 {
                return Ok(None);
            }
            let mut large = [0u8; 8];
            file.read_exact(&mut large)?;
            u64::from_be_bytes(large)
        }
        n => n,
    };

    if size < 8 || offset + size > file_len {
        return Ok(None); // torn box
    }
    Ok(Some(RawBox { kind, offset, size }))
}

/// Outcome of [`repair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairReport {
    /// Complete fragments retained.
    pub fragments: u32,
    /// File size after truncation.
    pub size: u64,
    /// Garbage bytes removed from the tail.
    pub truncated_bytes: u64,
}

/// Truncate a crashed segment file back to its last complete fragment.
///
/// Requires an intact `ftyp` + `moov` prefix and at least one complete
/// `moof`+`mdat` pair; anything after the last pair is cut off. The file is
/// fsynced before returning.
pub fn repair(path: &Path) -> Result<RepairReport, RepairError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let file_len = file.metadata()?.len();

    let ftyp = read_box_at(&mut file, 0, file_len)?
        .filter(|b| &b.kind == b"ftyp")
        .ok_or_else(|| RepairError::NotAnMp4("missing ftyp".into()))?;
    let moov = read_box_at(&mut file, ftyp.end(), file_len)?
        .filter(|b| &b.kind == b"moov")
        .ok_or_else(|| RepairError::NotAnMp4("missing moov".into()))?;

    let mut pos = moov.end();
    let mut last_good = pos;
    let mut fragments = 0u32;

    while let Some(moof) = read_box_at(&mut file, pos, file_len)? {
        if &moof.kind != b"moof" {
            warn!(
                path = %path.display(),
                kind = %String::from_utf8_lossy(&moof.kind),
                offset = moof.offset,
                "unexpected top-level box, stopping scan"
            );
            break;
        }
        match read_box_at(&mut file, moof.end(), file_len)? {
            Some(mdat) if &mdat.kind == b"mdat" => {
                fragments += 1;
                last_good = mdat.end();
                pos = mdat.end();
            }
            _ => break, // fragment torn mid-write
        }
    }

    if fragments == 0 {
        return Err(RepairError::NoPlayableData);
    }

    let truncated_bytes = file_len - last_good;
    if truncated_bytes > 0 {
        file.set_len(last_good)?;
        file.sync_all()?;
        info!(
            path = %path.display(),
            fragments,
            truncated_bytes,
            "segment repaired"
        );
    }

    Ok(RepairReport {
        fragments,
        size: last_good,
        truncated_bytes,
    })
}

/// One sample described by a `trun` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub duration_ms: u32,
    pub size: u32,
    pub is_keyframe: bool,
}

/// One track's run inside a fragment.
#[derive(Debug, Clone)]
pub struct TrackRunInfo {
    pub track_id: u32,
    pub base_time_ms: u64,
    /// Offset of the first sample byte, relative to the start of the moof.
    pub data_offset: i32,
    pub samples: Vec<SampleInfo>,
}

impl TrackRunInfo {
    pub fn duration_ms(&self) -> u64 {
        self.samples.iter().map(|s| s.duration_ms as u64).sum()
    }

    pub fn end_time_ms(&self) -> u64 {
        self.base_time_ms + self.duration_ms()
    }
}

/// A parsed `moof`+`mdat` pair.
#[derive(Debug, Clone)]
pub struct FragmentInfo {
    pub sequence: u32,
    pub moof_offset: u64,
    pub runs: Vec<TrackRunInfo>,
}

impl FragmentInfo {
    pub fn video_run(&self) -> Option<&TrackRunInfo> {
        self.runs.iter().find(|r| r.track_id == VIDEO_TRACK_ID)
    }
}

/// Iterate the direct children of a container box payload.
fn child_boxes(buf: &[u8]) -> Vec<([u8; 4], &[u8])> {
    let mut children = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= buf.len() {
        let size = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        if size < 8 || pos + size > buf.len() {
            break;
        }
        let kind: [u8; 4] = buf[pos + 4..pos + 8].try_into().unwrap();
        children.push((kind, &buf[pos + 8..pos + size]));
        pos += size;
    }
    children
}

fn parse_traf(payload: &[u8]) -> Option<TrackRunInfo> {
    let mut track_id = 0u32;
    let mut base_time_ms = 0u64;
    let mut data_offset = 0i32;
    let mut samples = Vec::new();

    for (kind, body) in child_boxes(payload) {
        match &kind {
            b"tfhd" => {
                if body.len() >= 8 {
                    track_id = u32::from_be_bytes(body[4..8].try_into().unwrap());
                }
            }
            b"tfdt" => {
                let version = body.first().copied().unwrap_or(0);
                if version == 1 && body.len() >= 12 {
                    base_time_ms = u64::from_be_bytes(body[4..12].try_into().unwrap());
                } else if body.len() >= 8 {
                    base_time_ms = u32::from_be_bytes(body[4..8].try_into().unwrap()) as u64;
                }
            }
            b"trun" => {
                if body.len() < 12 {
                    return None;
                }
                let flags = u32::from_be_bytes(body[0..4].try_into().unwrap()) & 0x00FF_FFFF;
                let count = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
                let mut pos = 8usize;
                if flags & 0x1 != 0 {
                    data_offset = i32::from_be_bytes(body[pos..pos + 4].try_into().ok()?);
                    pos += 4;
                }
                if flags & 0x4 != 0 {
                    pos += 4; // first sample flags
                }
                for _ in 0..count {
                    let mut duration_ms = 0u32;
                    let mut size = 0u32;
                    let mut sample_flags = 0u32;
                    if flags & 0x100 != 0 {
                        duration_ms = u32::from_be_bytes(body.get(pos..pos + 4)?.try_into().ok()?);
                        pos += 4;
                    }
                    if flags & 0x200 != 0 {
                        size = u32::from_be_bytes(body.get(pos..pos + 4)?.try_into().ok()?);
                        pos += 4;
                    }
                    if flags & 0x400 != 0 {
                        sample_flags =
                            u32::from_be_bytes(body.get(pos..pos + 4)?.try_into().ok()?);
                        pos += 4;
                    }
                    if flags & 0x800 != 0 {
                        pos += 4; // composition offset
                    }
                    samples.push(SampleInfo {
                        duration_ms,
                        size,
                        // bit 16: sample_is_non_sync_sample
                        is_keyframe: sample_flags & 0x0001_0000 == 0,
                    });
                }
            }
            _ => {}
        }
    }

    Some(TrackRunInfo {
        track_id,
        base_time_ms,
        data_offset,
        samples,
    })
}

/// Parse every complete fragment in a (possibly unrepaired) segment file.
pub fn read_fragments(path: &Path) -> Result<Vec<FragmentInfo>, RepairError> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let ftyp = read_box_at(&mut file, 0, file_len)?
        .filter(|b| &b.kind == b"ftyp")
        .ok_or_else(|| RepairError::NotAnMp4("missing ftyp".into()))?;
    let moov = read_box_at(&mut file, ftyp.end(), file_len)?
        .filter(|b| &b.kind == b"moov")
        .ok_or_else(|| RepairError::NotAnMp4("missing moov".into()))?;

    let mut fragments = Vec::new();
    let mut pos = moov.end();

    while let Some(moof) = read_box_at(&mut file, pos, file_len)? {
        if &moof.kind != b"moof" {
            break;
        }
        let mdat = match read_box_at(&mut file, moof.end(), file_len)? {
            Some(b) if &b.kind == b"mdat" => b,
            _ => break,
        };

        let mut payload = vec![0u8; (moof.size - 8) as usize];
        file.seek(SeekFrom::Start(moof.offset + 8))?;
        file.read_exact(&mut payload)?;

        let mut sequence = 0u32;
        let mut runs = Vec::new();
        for (kind, body) in child_boxes(&payload) {
            match &kind {
                b"mfhd" => {
                    if body.len() >= 8 {
                        sequence = u32::from_be_bytes(body[4..8].try_into().unwrap());
                    }
                }
                b"traf" => {
                    if let Some(run) = parse_traf(body) {
                        runs.push(run);
                    }
                }
                _ => {}
            }
        }

        fragments.push(FragmentInfo {
            sequence,
            moof_offset: moof.offset,
            runs,
        });
        pos = mdat.end();
    }

    Ok(fragments)
}

/// Media time of the last sample in the file, in milliseconds from the
/// start of the recording. None when no fragment survives.
pub fn last_media_time_ms(path: &Path) -> Result<Option<u64>, RepairError> {
    let fragments = read_fragments(path)?;
    Ok(fragments
        .iter()
        .flat_map(|f| f.runs.iter())
        .map(|r| r.end_time_ms())
        .max())
}

/// Read one track's sample payloads for a fragment back out of the file.
pub fn read_run_payloads(
    path: &Path,
    fragment: &FragmentInfo,
    run: &TrackRunInfo,
) -> Result<Vec<Vec<u8>>, RepairError> {
    let mut file = File::open(path)?;
    let mut offset = (fragment.moof_offset as i64 + run.data_offset as i64) as u64;
    let mut payloads = Vec::with_capacity(run.samples.len());
    for sample in &run.samples {
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; sample.size as usize];
        file.read_exact(&mut buf)?;
        payloads.push(buf);
        offset += sample.size as u64;
    }
    Ok(payloads)
}
