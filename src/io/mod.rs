//! Diagram file access and directory monitoring.

use crate::diagram::{Diagram, Image, ImageFormat};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub mod fs;

pub use fs::FsDiagramIo;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("File not found: {0:?}")]
    NotFound(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("File watcher error: {0}")]
    Watch(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl IoError {
    pub fn from_io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            IoError::NotFound(path.to_path_buf())
        } else {
            IoError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Change to a monitored directory, reported for diagram files only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Added(PathBuf),
    Deleted(PathBuf),
}

impl FsEvent {
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Added(p) | FsEvent::Deleted(p) => p,
        }
    }
}

/// Progress of a directory enumeration. `diagram` is set when the file just
/// read parsed as a diagram.
#[derive(Debug, Clone)]
pub struct ReadProgress {
    pub done: usize,
    pub total: usize,
    pub diagram: Option<Diagram>,
}

#[async_trait]
pub trait DiagramIo: Send + Sync {
    /// Reads a diagram file. `Ok(None)` if the file holds no diagram.
    async fn read(&self, file: &Path) -> Result<Option<Diagram>, IoError>;

    /// Persists the diagram's content to its path, copying the previous file
    /// aside first when `make_backup` is set.
    async fn save(&self, diagram: &Diagram, make_backup: bool) -> Result<(), IoError>;

    async fn delete(&self, diagram: &Diagram) -> Result<(), IoError>;

    /// Loads a rendered image from disk.
    async fn read_image(&self, file: &Path, format: ImageFormat) -> Result<Image, IoError>;

    /// Reads every diagram in `directory`, reporting each file on `progress`.
    /// Returns `IoError::Cancelled` when `cancel` fires between files.
    async fn read_diagrams(
        &self,
        directory: &Path,
        progress: mpsc::UnboundedSender<ReadProgress>,
        cancel: CancellationToken,
    ) -> Result<Vec<Diagram>, IoError>;

    /// True if `path` names an existing directory.
    fn is_directory(&self, path: &Path) -> bool;

    /// Starts watching `directory`, replacing any previous watch.
    fn start_monitoring(&self, directory: &Path) -> Result<(), IoError>;

    fn stop_monitoring(&self);

    /// Receives filesystem events for the monitored directory.
    fn subscribe(&self) -> broadcast::Receiver<FsEvent>;
}
