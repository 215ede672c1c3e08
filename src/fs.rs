//! Filesystem Targets
//!
//! [`FileEntity`] snapshots a file's metadata when it is enumerated and
//! opens a fresh `tokio::fs::File` for every stream request.
//! [`FsTargetSource`] walks the configured targets with the `ignore` walker
//! on a blocking thread and streams the entries back. Each [`FsTarget`]
//! carries its own depth, path filter and optional selector.

use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use binscope_core::{CoreResult, EntityStream, RuleSelector, SubjectEntity};
use binscope_engine::{TargetEntry, TargetSource};
use futures_util::stream::{BoxStream, StreamExt};
use ignore::WalkBuilder;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{AppError, AppResult};

// ============================================================================
// FileEntity
// ============================================================================

/// A regular file on disk.
pub struct FileEntity {
    path: PathBuf,
    name: String,
    size: u64,
    modified: Option<SystemTime>,
    mode: Option<u32>,
}

impl FileEntity {
    pub fn from_metadata(path: impl Into<PathBuf>, metadata: &Metadata) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            name,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            mode: unix_mode(metadata),
            path,
        }
    }

    /// Snapshot the metadata of `path`.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        Ok(Self::from_metadata(path, &metadata))
    }
}

#[cfg(unix)]
fn unix_mode(metadata: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &Metadata) -> Option<u32> {
    None
}

impl fmt::Debug for FileEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEntity")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

#[async_trait]
impl SubjectEntity for FileEntity {
    fn path(&self) -> &Path {
        &self.path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn last_write_time(&self) -> Option<SystemTime> {
        self.modified
    }

    fn unix_mode(&self) -> Option<u32> {
        self.mode
    }

    async fn open_stream(&self) -> CoreResult<Box<dyn EntityStream>> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }
}

// ============================================================================
// FsTargetSource
// ============================================================================

const WALK_BUFFER: usize = 256;

/// Include/exclude regexes searched in entry paths.
#[derive(Debug, Clone, Default)]
pub struct TargetFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TargetFilter {
    pub fn new(include: &[String], exclude: &[String]) -> AppResult<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// An empty include list admits every path.
    pub fn satisfies(&self, path: &Path) -> bool {
        if self.is_empty() {
            return true;
        }
        let path = path.to_string_lossy();
        (self.include.is_empty() || self.include.iter().any(|re| re.is_match(&path)))
            && !self.exclude.iter().any(|re| re.is_match(&path))
    }
}

fn compile(patterns: &[String]) -> AppResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .map_err(|e| AppError::validation(format!("invalid path regex '{pattern}': {e}")))
        })
        .collect()
}

/// One walk root and what applies to the entries below it.
#[derive(Debug, Clone)]
pub struct FsTarget {
    pub root: PathBuf,
    pub recursive: bool,
    pub filter: TargetFilter,
    pub selector: Option<Arc<RuleSelector>>,
}

impl FsTarget {
    pub fn new(root: impl Into<PathBuf>, recursive: bool) -> Self {
        Self {
            root: root.into(),
            recursive,
            filter: TargetFilter::default(),
            selector: None,
        }
    }

    pub fn with_filter(mut self, filter: TargetFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_selector(mut self, selector: Option<Arc<RuleSelector>>) -> Self {
        self.selector = selector;
        self
    }
}

/// Enumerates regular files below a set of targets.
#[derive(Debug, Clone)]
pub struct FsTargetSource {
    targets: Vec<FsTarget>,
}

impl FsTargetSource {
    pub fn new(targets: Vec<FsTarget>) -> Self {
        Self { targets }
    }
}

impl TargetSource for FsTargetSource {
    /// Must be polled inside a tokio runtime.
    fn targets(&self) -> BoxStream<'_, TargetEntry> {
        let (sender, receiver) = mpsc::channel(WALK_BUFFER);
        let targets = self.targets.clone();
        tokio::task::spawn_blocking(move || walk(&targets, &sender));
        ReceiverStream::new(receiver).boxed()
    }
}

fn walk(targets: &[FsTarget], sender: &mpsc::Sender<TargetEntry>) {
    for target in targets {
        let mut builder = WalkBuilder::new(&target.root);
        builder.standard_filters(false).follow_links(false);
        if !target.recursive {
            builder.max_depth(Some(1));
        }

        for result in builder.build() {
            let entry = match result {
                Ok(entry) => {
                    if !entry.file_type().is_some_and(|kind| kind.is_file()) {
                        continue;
                    }
                    match entry.metadata() {
                        Ok(metadata) => TargetEntry::entity(Arc::new(
                            FileEntity::from_metadata(entry.path(), &metadata),
                        ))
                        .with_selector(target.selector.clone()),
                        Err(err) => TargetEntry::Inaccessible {
                            path: entry.path().to_path_buf(),
                            reason: err.to_string(),
                        },
                    }
                }
                Err(err) => {
                    let path = error_path(&err).unwrap_or_else(|| target.root.clone());
                    tracing::warn!(path = %path.display(), error = %err, "cannot enumerate");
                    TargetEntry::Inaccessible {
                        path,
                        reason: err.to_string(),
                    }
                }
            };
            let path = entry.path();
            if !target.filter.satisfies(&path) {
                tracing::trace!(path = %path.display(), "filtered out");
                continue;
            }
            if sender.blocking_send(entry).is_err() {
                tracing::debug!("target consumer gone, stopping walk");
                return;
            }
        }
    }
}

fn error_path(err: &ignore::Error) -> Option<PathBuf> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.clone()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        ignore::Error::Loop { child, .. } => Some(child.clone()),
        ignore::Error::Partial(errors) => errors.iter().find_map(error_path),
        _ => None,
    }
}
