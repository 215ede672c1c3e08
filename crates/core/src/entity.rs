//! Subject Entities
//!
//! One scanned artifact. The engine references entities through
//! `Arc<dyn SubjectEntity>`; how they are discovered is up to the caller.

use std::fmt;
use std::io::{Cursor, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::error::{CoreError, CoreResult};

/// Byte stream over an entity's content.
pub trait EntityStream: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> EntityStream for T {}

/// An artifact under analysis.
#[async_trait]
pub trait SubjectEntity: Send + Sync + fmt::Debug {
    fn path(&self) -> &Path;

    /// Display name, usually the file name.
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    fn last_write_time(&self) -> Option<SystemTime>;

    /// Unix permission bits, when the platform has them.
    fn unix_mode(&self) -> Option<u32> {
        None
    }

    async fn open_stream(&self) -> CoreResult<Box<dyn EntityStream>>;
}

/// Shared reference to the entity being analyzed, seeded into every
/// entity-scoped value cache.
#[derive(Clone, Debug)]
pub struct EntityRef(pub Arc<dyn SubjectEntity>);
crate::impl_value!(EntityRef, "core.subject_entity");

// ============================================================================
// StreamProvider
// ============================================================================

/// Opens the entity stream on first use and keeps it for later readers.
pub struct StreamProvider {
    entity: Arc<dyn SubjectEntity>,
    stream: Option<Box<dyn EntityStream>>,
}

impl StreamProvider {
    pub fn new(entity: Arc<dyn SubjectEntity>) -> Self {
        Self {
            entity,
            stream: None,
        }
    }

    pub fn entity(&self) -> &Arc<dyn SubjectEntity> {
        &self.entity
    }

    /// Whether the stream has been opened yet.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// The stream, opening it if needed.
    pub async fn stream(&mut self) -> CoreResult<&mut (dyn EntityStream + 'static)> {
        if self.stream.is_none() {
            self.stream = Some(self.entity.open_stream().await?);
        }
        self.stream
            .as_deref_mut()
            .ok_or_else(|| CoreError::detector("entity stream unavailable"))
    }

    /// Read up to `len` bytes from the start of the stream.
    pub async fn read_prefix(&mut self, len: usize) -> CoreResult<Vec<u8>> {
        let stream = self.stream().await?;
        stream.seek(SeekFrom::Start(0)).await?;
        let mut buf = Vec::with_capacity(len);
        stream.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

// ============================================================================
// Stub Entities
// ============================================================================

/// Entity for a path that could not be opened or inspected.
#[derive(Debug, Clone)]
pub struct InaccessibleEntity {
    path: PathBuf,
    name: String,
    reason: String,
}

impl InaccessibleEntity {
    pub fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: display_name(&path),
            path,
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[async_trait]
impl SubjectEntity for InaccessibleEntity {
    fn path(&self) -> &Path {
        &self.path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        0
    }

    fn last_write_time(&self) -> Option<SystemTime> {
        None
    }

    async fn open_stream(&self) -> CoreResult<Box<dyn EntityStream>> {
        Err(CoreError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("{}: {}", self.path.display(), self.reason),
        )))
    }
}

/// Entity backed by an in-memory buffer.
#[derive(Clone)]
pub struct MemoryEntity {
    path: PathBuf,
    name: String,
    content: Arc<[u8]>,
    unix_mode: Option<u32>,
    last_write_time: Option<SystemTime>,
}

impl MemoryEntity {
    pub fn new(path: impl Into<PathBuf>, content: Vec<u8>) -> Self {
        let path = path.into();
        Self {
            name: display_name(&path),
            path,
            content: content.into(),
            unix_mode: None,
            last_write_time: None,
        }
    }

    pub fn with_unix_mode(mut self, mode: u32) -> Self {
        self.unix_mode = Some(mode);
        self
    }

    pub fn with_last_write_time(mut self, time: SystemTime) -> Self {
        self.last_write_time = Some(time);
        self
    }
}

impl fmt::Debug for MemoryEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEntity")
            .field("path", &self.path)
            .field("size", &self.content.len())
            .finish()
    }
}

#[async_trait]
impl SubjectEntity for MemoryEntity {
    fn path(&self) -> &Path {
        &self.path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.content.len() as u64
    }

    fn last_write_time(&self) -> Option<SystemTime> {
        self.last_write_time
    }

    fn unix_mode(&self) -> Option<u32> {
        self.unix_mode
    }

    async fn open_stream(&self) -> CoreResult<Box<dyn EntityStream>> {
        Ok(Box::new(Cursor::new(self.content.to_vec())))
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
