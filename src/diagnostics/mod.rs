//! Best-effort page snapshots for operator inspection.
//!
//! Snapshots are written when a fetch fails, the site looks like it is
//! throttling us, or the listings could not be found. Nothing here may
//! fail the poll cycle: every error is logged and dropped.

use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default snapshot cap, 10KB.
pub const DEFAULT_SNAPSHOT_MAX_BYTES: usize = 10_000;

pub trait DiagnosticsSink: Send + Sync {
    fn write_snapshot(&self, label: &str, content: &str, max_bytes: usize);
}

/// Writes `page_source_<label>_<timestamp>.html` files into a directory.
#[derive(Debug, Clone)]
pub struct SnapshotDir {
    dir: PathBuf,
}

impl SnapshotDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DiagnosticsSink for SnapshotDir {
    fn write_snapshot(&self, label: &str, content: &str, max_bytes: usize) {
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let path = self
            .dir
            .join(format!("page_source_{}_{}.html", label, timestamp));
        let body = if content.is_empty() {
            "No page source available"
        } else {
            truncate_to(content, max_bytes)
        };

        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            debug!(error = %e, dir = %self.dir.display(), "cannot create snapshot dir");
            return;
        }
        match std::fs::write(&path, body) {
            Ok(()) => debug!(path = %path.display(), bytes = body.len(), "page snapshot saved"),
            Err(e) => debug!(error = %e, path = %path.display(), "page snapshot failed"),
        }
    }
}

/// Discards every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl DiagnosticsSink for NoopSink {
    fn write_snapshot(&self, _label: &str, _content: &str, _max_bytes: usize) {}
}

/// Longest prefix of `s` that fits in `max_bytes` without splitting a char.
pub fn truncate_to(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_to("hello", 10), "hello");
        assert_eq!(truncate_to("hello", 3), "hel");
        // '£' is two bytes; cutting inside it backs off to the boundary.
        assert_eq!(truncate_to("£50", 1), "");
        assert_eq!(truncate_to("£50", 2), "£");
    }

    #[test]
    fn test_snapshot_written_and_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = SnapshotDir::new(tmp.path().join("logs"));
        sink.write_snapshot("blocked", &"x".repeat(50), 20);

        let files: Vec<_> = std::fs::read_dir(sink.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("page_source_blocked_"));
        assert!(name.ends_with(".html"));
        assert_eq!(std::fs::read_to_string(&path).unwrap().len(), 20);
    }

    #[test]
    fn test_snapshot_placeholder_for_empty_page() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = SnapshotDir::new(tmp.path());
        sink.write_snapshot("fetch_error", "", 100);
        let path = std::fs::read_dir(tmp.path()).unwrap().next().unwrap().unwrap().path();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "No page source available");
    }

    #[test]
    fn test_unwritable_dir_is_swallowed() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, "occupied").unwrap();
        // Directory creation fails because a file is in the way; no panic.
        SnapshotDir::new(file.join("nested")).write_snapshot("blocked", "page", 100);
    }
}
