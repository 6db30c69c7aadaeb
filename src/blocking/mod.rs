//! Detection of throttling and rejection pages.
//!
//! The site answers a throttled client with an ordinary-looking page, so
//! detection is a case-insensitive phrase scan over the document text.

use crate::diagnostics::DiagnosticsSink;
use std::sync::Arc;
use tracing::warn;

pub const BLOCK_TERMS: &[&str] = &[
    "429 too many requests",
    "access denied",
    "blocked",
    "forbidden",
    "server error",
    "rate limit exceeded",
];

/// Phrases that suggest a challenge page when a page has no listings.
pub const DEGRADED_PAGE_TERMS: &[&str] = &["captcha", "blocked", "access denied", "forbidden"];

pub struct BlockingDetector {
    terms: Vec<String>,
    sink: Arc<dyn DiagnosticsSink>,
    snapshot_max_bytes: usize,
}

impl BlockingDetector {
    pub fn new(sink: Arc<dyn DiagnosticsSink>, snapshot_max_bytes: usize) -> Self {
        Self::with_terms(BLOCK_TERMS.iter().copied(), sink, snapshot_max_bytes)
    }

    pub fn with_terms<'a>(
        terms: impl IntoIterator<Item = &'a str>,
        sink: Arc<dyn DiagnosticsSink>,
        snapshot_max_bytes: usize,
    ) -> Self {
        Self {
            terms: terms.into_iter().map(str::to_lowercase).collect(),
            sink,
            snapshot_max_bytes,
        }
    }

    /// Every blocking phrase present in `text`, in term order.
    pub fn scan(&self, text: &str) -> Vec<&str> {
        let haystack = text.to_lowercase();
        self.terms
            .iter()
            .filter(|term| haystack.contains(term.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// True if `text` looks like a throttling/rejection page. A positive
    /// result also snapshots the page; snapshot failures are ignored.
    pub fn is_blocked(&self, text: &str) -> bool {
        let found = self.scan(text);
        if found.is_empty() {
            return false;
        }
        warn!(terms = ?found, "blocking page detected");
        self.sink
            .write_snapshot("blocked", text, self.snapshot_max_bytes);
        true
    }
}
