//! In-memory incremental validation state.
//!
//! One entry per file path. An entry is trusted only while its fingerprint
//! matches the file's current content; a mismatch drops it.

use arbiter_domain::ValidationPhaseResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationStateEntry {
    pub content_fingerprint: String,
    pub last_checked_at: DateTime<Utc>,
    pub last_result: ValidationPhaseResult,
}

#[derive(Debug, Default)]
pub struct ValidationStateCache {
    entries: HashMap<String, ValidationStateEntry>,
}

impl ValidationStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `path` must be revalidated given its current fingerprint.
    ///
    /// Files without an entry, without a readable fingerprint, or whose
    /// fingerprint changed need validation. A stale entry is removed.
    pub fn needs_validation(&mut self, path: &str, current: Option<&str>) -> bool {
        let matches = match (self.entries.get(path), current) {
            (Some(entry), Some(fp)) => entry.content_fingerprint == fp,
            (None, _) => return true,
            (Some(_), None) => false,
        };
        if !matches {
            self.entries.remove(path);
        }
        !matches
    }

    pub fn record(&mut self, path: &str, fingerprint: String, result: &ValidationPhaseResult) {
        self.entries.insert(
            path.to_string(),
            ValidationStateEntry {
                content_fingerprint: fingerprint,
                last_checked_at: Utc::now(),
                last_result: result.clone(),
            },
        );
    }

    pub fn invalidate(&mut self, path: &str) -> Option<ValidationStateEntry> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&ValidationStateEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
