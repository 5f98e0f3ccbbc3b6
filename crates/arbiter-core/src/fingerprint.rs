//! Content fingerprints and dependency resolution used for incremental
//! file selection.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;

/// Computes a content fingerprint for a file.
#[async_trait]
pub trait Fingerprinter: Send + Sync {
    /// `None` when the file no longer exists or cannot be read.
    async fn fingerprint(&self, path: &str) -> Option<String>;
}

/// SHA-256 over file bytes, hex encoded.
#[derive(Debug, Clone, Default)]
pub struct Sha256Fingerprinter {
    /// Relative paths are resolved against this directory when set.
    root: Option<PathBuf>,
}

impl Sha256Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path),
            None => PathBuf::from(path),
        }
    }
}

/// Compute the fingerprint of an in-memory buffer.
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[async_trait]
impl Fingerprinter for Sha256Fingerprinter {
    async fn fingerprint(&self, path: &str) -> Option<String> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Some(fingerprint_bytes(&bytes)),
            Err(e) => {
                tracing::debug!(path, error = %e, "file not fingerprinted");
                None
            }
        }
    }
}

// ============================================================================
// DEPENDENCY RESOLUTION
// ============================================================================

/// Reports the files that directly depend on a path.
pub trait DependencyResolver: Send + Sync {
    fn dependents(&self, path: &str) -> Vec<String>;
}

/// Resolver with no dependency knowledge.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

impl DependencyResolver for NoopResolver {
    fn dependents(&self, _path: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Map-backed resolver: `path -> direct dependents`.
#[derive(Debug, Clone, Default)]
pub struct StaticDependencyGraph {
    edges: HashMap<String, Vec<String>>,
}

impl StaticDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` depends on `path`.
    pub fn add_dependent(&mut self, path: impl Into<String>, dependent: impl Into<String>) {
        let dependents = self.edges.entry(path.into()).or_default();
        let dependent = dependent.into();
        if !dependents.contains(&dependent) {
            dependents.push(dependent);
        }
    }

    pub fn with_dependent(mut self, path: impl Into<String>, dependent: impl Into<String>) -> Self {
        self.add_dependent(path, dependent);
        self
    }
}

impl DependencyResolver for StaticDependencyGraph {
    fn dependents(&self, path: &str) -> Vec<String> {
        self.edges.get(path).cloned().unwrap_or_default()
    }
}

/// Everything that transitively depends on `path`, excluding `path` itself.
/// Cycles are tolerated.
pub fn transitive_dependents(resolver: &dyn DependencyResolver, path: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut pending: VecDeque<String> = resolver.dependents(path).into();
    while let Some(next) = pending.pop_front() {
        if next == path || !seen.insert(next.clone()) {
            continue;
        }
        pending.extend(resolver.dependents(&next));
    }
    seen
}
