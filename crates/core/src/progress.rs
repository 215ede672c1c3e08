//! Progress Reporting
//!
//! Fire-and-forget notifications about entity lifecycle. Implementations must
//! not block and cannot fail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::entity::SubjectEntity;

/// Lifecycle state of one entity (or of the whole run for combined phases).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    LoadStarted,
    Loaded,
    AnalysisStarted,
    AnalysisCompleted,
    CombinedAnalysisStarted,
    CombinedAnalysisCompleted,
    /// No format detector recognized the entity
    SkippedUnsupported,
    /// The entity could not be loaded
    SkippedInaccessible,
}

/// Receiver of progress notifications.
pub trait ProgressReport: Send + Sync {
    fn report_progress(&self, entity: Option<&Arc<dyn SubjectEntity>>, state: ProgressState);
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReport for NoProgress {
    fn report_progress(&self, _entity: Option<&Arc<dyn SubjectEntity>>, _state: ProgressState) {}
}

/// Snapshot of [`ProgressStats`] counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub loaded: u64,
    pub analyzed: u64,
    pub skipped_unsupported: u64,
    pub skipped_inaccessible: u64,
    pub loaded_bytes: u64,
}

/// Counts analyzed and skipped entities, optionally forwarding every
/// notification to another reporter.
#[derive(Default)]
pub struct ProgressStats {
    loaded: AtomicU64,
    analyzed: AtomicU64,
    skipped_unsupported: AtomicU64,
    skipped_inaccessible: AtomicU64,
    loaded_bytes: AtomicU64,
    forward: Option<Arc<dyn ProgressReport>>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding_to(forward: Arc<dyn ProgressReport>) -> Self {
        Self {
            forward: Some(forward),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            loaded: self.loaded.load(Ordering::Relaxed),
            analyzed: self.analyzed.load(Ordering::Relaxed),
            skipped_unsupported: self.skipped_unsupported.load(Ordering::Relaxed),
            skipped_inaccessible: self.skipped_inaccessible.load(Ordering::Relaxed),
            loaded_bytes: self.loaded_bytes.load(Ordering::Relaxed),
        }
    }
}

impl ProgressReport for ProgressStats {
    fn report_progress(&self, entity: Option<&Arc<dyn SubjectEntity>>, state: ProgressState) {
        match state {
            ProgressState::Loaded => {
                self.loaded.fetch_add(1, Ordering::Relaxed);
                if let Some(entity) = entity {
                    self.loaded_bytes.fetch_add(entity.size(), Ordering::Relaxed);
                }
            }
            ProgressState::AnalysisCompleted => {
                self.analyzed.fetch_add(1, Ordering::Relaxed);
            }
            ProgressState::SkippedUnsupported => {
                self.skipped_unsupported.fetch_add(1, Ordering::Relaxed);
            }
            ProgressState::SkippedInaccessible => {
                self.skipped_inaccessible.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        if let Some(forward) = &self.forward {
            forward.report_progress(entity, state);
        }
    }
}

/// Logs every notification through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressReport for TracingProgress {
    fn report_progress(&self, entity: Option<&Arc<dyn SubjectEntity>>, state: ProgressState) {
        match entity {
            Some(entity) => tracing::debug!(entity = %entity.path().display(), ?state, "progress"),
            None => tracing::info!(?state, "progress"),
        }
    }
}
