//! File change events fed into the scheduler by an external watcher.

use crate::error::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What happened to a file.
///
/// Watchers report `add | change | delete`; those spellings are accepted as
/// aliases on input but events always serialize with the canonical names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    #[serde(alias = "add")]
    Added,

    #[serde(alias = "change")]
    Modified,

    #[serde(alias = "delete", alias = "unlink")]
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" | "add" => Ok(ChangeKind::Added),
            "modified" | "change" => Ok(ChangeKind::Modified),
            "removed" | "delete" | "unlink" => Ok(ChangeKind::Removed),
            other => Err(DomainError::UnknownChangeKind(other.to_string())),
        }
    }
}

/// A single observed change to a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Path of the changed file, as reported by the watcher.
    pub path: String,

    pub kind: ChangeKind,

    /// When the watcher observed the change. Defaults to receipt time when
    /// the producer leaves it out.
    #[serde(rename = "timestamp", alias = "observed_at", default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create an event observed now.
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Utc::now(),
        }
    }

    pub fn added(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Added)
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Modified)
    }

    pub fn removed(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Removed)
    }
}
