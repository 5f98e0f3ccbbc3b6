//! Pluggable phase executors.
//!
//! A phase executor is an opaque validator: given the phase name, the file
//! set selected for the batch and the batch's change events, it reports
//! `ok`, coverage and errors. Executors must not touch scheduler state.

use arbiter_domain::{ChangeEvent, Coverage, PhaseError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// What an executor reports for one phase run.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub ok: bool,
    pub coverage: Coverage,
    pub errors: Vec<PhaseError>,
}

impl PhaseOutcome {
    pub fn passed(coverage: Coverage) -> Self {
        Self {
            ok: true,
            coverage,
            errors: Vec::new(),
        }
    }

    pub fn failed(coverage: Coverage, errors: Vec<PhaseError>) -> Self {
        Self {
            ok: false,
            coverage,
            errors,
        }
    }
}

#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Run the phase. An `Err` is recorded as a failed phase, not propagated.
    async fn execute(
        &self,
        phase: &str,
        files: &[String],
        changes: &[ChangeEvent],
    ) -> anyhow::Result<PhaseOutcome>;
}

/// Executors keyed by phase name.
#[derive(Clone, Default)]
pub struct PhaseRegistry {
    executors: HashMap<String, Arc<dyn PhaseExecutor>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, phase: impl Into<String>, executor: Arc<dyn PhaseExecutor>) {
        self.executors.insert(phase.into(), executor);
    }

    pub fn with(mut self, phase: impl Into<String>, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.register(phase, executor);
        self
    }

    pub fn get(&self, phase: &str) -> Option<Arc<dyn PhaseExecutor>> {
        self.executors.get(phase).cloned()
    }

    pub fn contains(&self, phase: &str) -> bool {
        self.executors.contains_key(phase)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for PhaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.executors.keys().collect();
        names.sort();
        f.debug_struct("PhaseRegistry").field("phases", &names).finish()
    }
}
