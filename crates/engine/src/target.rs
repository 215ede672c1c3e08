//! Analysis targets.

use std::path::PathBuf;
use std::sync::Arc;

use binscope_core::{RuleSelector, SubjectEntity};
use futures_util::stream::{self, BoxStream, StreamExt};

/// One enumerated target.
#[derive(Clone, Debug)]
pub enum TargetEntry {
    Entity {
        entity: Arc<dyn SubjectEntity>,
        /// Replaces the run selector for this entity
        selector: Option<Arc<RuleSelector>>,
    },
    /// The target exists but could not be opened or enumerated
    Inaccessible { path: PathBuf, reason: String },
}

impl TargetEntry {
    /// An entity analyzed under the run selector.
    pub fn entity(entity: Arc<dyn SubjectEntity>) -> Self {
        Self::Entity {
            entity,
            selector: None,
        }
    }

    /// Attach a target-specific selector. No effect on inaccessible entries.
    pub fn with_selector(self, selector: Option<Arc<RuleSelector>>) -> Self {
        match self {
            Self::Entity { entity, .. } => Self::Entity { entity, selector },
            inaccessible => inaccessible,
        }
    }

    pub fn path(&self) -> PathBuf {
        match self {
            Self::Entity { entity, .. } => entity.path().to_path_buf(),
            Self::Inaccessible { path, .. } => path.clone(),
        }
    }
}

/// Enumerates the entities of one analysis run.
pub trait TargetSource: Send + Sync {
    fn targets(&self) -> BoxStream<'_, TargetEntry>;
}

/// Fixed list of targets.
#[derive(Clone, Debug, Default)]
pub struct StaticTargetSource {
    entries: Vec<TargetEntry>,
}

impl StaticTargetSource {
    pub fn new(entries: Vec<TargetEntry>) -> Self {
        Self { entries }
    }

    pub fn from_entities(entities: impl IntoIterator<Item = Arc<dyn SubjectEntity>>) -> Self {
        Self::new(entities.into_iter().map(TargetEntry::entity).collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TargetSource for StaticTargetSource {
    fn targets(&self) -> BoxStream<'_, TargetEntry> {
        stream::iter(self.entries.iter().cloned()).boxed()
    }
}
