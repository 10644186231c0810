//! Filesystem capacity probing for the storage root.
//!
//! Per-stream quotas bound what the catalog records; the filesystem itself
//! is the quota of last resort. The retention cleaner compares a
//! [`DiskUsage`] snapshot against its configured reserve and frees the
//! oldest segments when the volume runs hot.

use std::path::Path;

use crate::error::StoreError;

/// Snapshot of the filesystem backing the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    /// Share of the filesystem in use, rounded down to whole percent.
    pub fn percent_used(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        ((self.used_bytes() as f64 / self.total_bytes as f64) * 100.0) as u8
    }
}

/// Stat the filesystem containing `path`.
pub fn disk_usage(path: &Path) -> Result<DiskUsage, StoreError> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| StoreError::StatvfsFailed(e.to_string()))?;
    // sizes are defined in terms of the fragment size, not the IO block size
    let fragment = stat.fragment_size() as u64;
    Ok(DiskUsage {
        total_bytes: stat.blocks() as u64 * fragment,
        available_bytes: stat.blocks_available() as u64 * fragment,
    })
}

/// Render a byte count with a binary-unit suffix, e.g. `1.5KB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0B");
        assert_eq!(human_bytes(500), "500B");
        assert_eq!(human_bytes(1024), "1.0KB");
        assert_eq!(human_bytes(1536), "1.5KB");
        assert_eq!(human_bytes(1024 * 1024), "1.0MB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.0GB");
        assert_eq!(human_bytes(u64::MAX), "16777216.0TB");
    }

    #[test]
    fn test_percent_used() {
        let usage = DiskUsage {
            total_bytes: 1000,
            available_bytes: 400,
        };
        assert_eq!(usage.used_bytes(), 600);
        assert_eq!(usage.percent_used(), 60);

        let empty = DiskUsage {
            total_bytes: 0,
            available_bytes: 0,
        };
        assert_eq!(empty.percent_used(), 0);
    }

    #[test]
    fn test_disk_usage_snapshot() {
        let path = Path::new("/tmp");
        if path.exists() {
            let usage = disk_usage(path).unwrap();
            assert!(usage.available_bytes <= usage.total_bytes);
            assert!(usage.percent_used() <= 100);
        }
    }
}
