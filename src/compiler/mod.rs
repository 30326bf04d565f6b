//! Diagram rendering contract and the PlantUML-backed implementation.

use crate::diagram::{DiagramError, Image, ImageFormat};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod plantuml;

pub use plantuml::PlantUmlCompiler;

/// Result of rendering diagram text in memory.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    /// Rendered image; absent when the renderer rejected the text.
    pub image: Option<Image>,
    pub errors: Vec<DiagramError>,
}

impl CompileOutput {
    pub fn rendered(image: Image) -> Self {
        Self {
            image: Some(image),
            errors: Vec::new(),
        }
    }

    pub fn rejected(errors: Vec<DiagramError>) -> Self {
        Self {
            image: None,
            errors,
        }
    }
}

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Compilation cancelled")]
    Cancelled,
    #[error("Failed to start renderer: {0}. Is PlantUML installed?")]
    Spawn(#[source] std::io::Error),
    #[error("Renderer timed out after {0:?}")]
    Timeout(Duration),
    #[error("Diagram has {} error(s)", .0.len())]
    Diagram(Vec<DiagramError>),
    #[error("Renderer failed: {0}")]
    Failed(String),
    #[error("Diagram too large ({0} bytes)")]
    TooLarge(usize),
    #[error("Renderer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Compiler: Send + Sync {
    /// Renders diagram text to an in-memory image.
    ///
    /// Diagram-level problems come back as `CompileOutput::errors`, not as
    /// `Err`. Firing `cancel` makes the call return `CompileError::Cancelled`.
    async fn compile_to_image(
        &self,
        text: &str,
        format: ImageFormat,
        cancel: CancellationToken,
    ) -> Result<CompileOutput, CompileError>;

    /// Renders a diagram file to its image file on disk.
    async fn compile_to_file(&self, file: &Path, format: ImageFormat) -> Result<(), CompileError>;
}
