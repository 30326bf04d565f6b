//! Diagram model shared by editor sessions and the preview list.

use crate::constants::{DEFAULT_EXTENSION, DIAGRAM_EXTENSIONS};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Output formats the renderer can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageFormat {
    #[default]
    Png,
    Svg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Svg => "svg",
        }
    }

    /// PlantUML command-line switch selecting this format.
    pub fn plantuml_flag(&self) -> &'static str {
        match self {
            ImageFormat::Png => "-tpng",
            ImageFormat::Svg => "-tsvg",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        ext.parse().ok()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "svg" => Ok(ImageFormat::Svg),
            other => Err(format!("Unsupported image format: {}", other)),
        }
    }
}

/// A rendered image. Cloning shares the underlying bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    format: ImageFormat,
    bytes: Arc<[u8]>,
}

impl Image {
    pub fn new(format: ImageFormat, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            format,
            bytes: bytes.into(),
        }
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("format", &self.format)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A syntax or semantic error reported by the renderer for a diagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagramError {
    /// 1-based source line, when the renderer reports one.
    pub line: Option<usize>,
    pub message: String,
}

impl DiagramError {
    pub fn new(line: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for DiagramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// A diagram source file and what we know about its rendering.
///
/// The file path is fixed for the lifetime of the value; a rename produces a
/// new `Diagram`.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagram {
    path: PathBuf,
    pub content: String,
    pub image_file: PathBuf,
    pub image_format: ImageFormat,
    pub errors: Vec<DiagramError>,
}

impl Diagram {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        let path = path.into();
        let content = content.into();
        let image_format = ImageFormat::default();
        let image_file = image_file_for(&path, &content, image_format);
        Self {
            path,
            content,
            image_file,
            image_format,
            errors: Vec::new(),
        }
    }

    /// Builds a diagram from file content, or `None` if the text does not
    /// contain a diagram block.
    pub fn parse(path: impl Into<PathBuf>, content: impl Into<String>) -> Option<Self> {
        let content = content.into();
        if !is_diagram_text(&content) {
            return None;
        }
        let path = path.into();
        let mut diagram = Self::new(path, content);
        if let Some(format) = diagram
            .image_file
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(ImageFormat::from_extension)
        {
            diagram.image_format = format;
        }
        Some(diagram)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Re-derives the image file from the declared name in the text, if any.
    pub fn refresh_image_file(&mut self) {
        self.image_file = image_file_for(&self.path, &self.content, self.image_format);
    }

    /// Copies the persisted state of another instance of the same file.
    pub fn copy_from(&mut self, other: &Diagram) {
        debug_assert_eq!(self.path, other.path);
        self.content.clone_from(&other.content);
        self.image_file.clone_from(&other.image_file);
    }
}

/// Shared, mutable reference to one in-memory diagram instance.
///
/// A preview and an editor session for the same file hold clones of the same
/// handle, so `ptr_eq` tells whether they see the same instance.
#[derive(Clone)]
pub struct DiagramHandle {
    path: Arc<Path>,
    inner: Arc<RwLock<Diagram>>,
}

impl DiagramHandle {
    pub fn new(diagram: Diagram) -> Self {
        Self {
            path: Arc::from(diagram.path()),
            inner: Arc::new(RwLock::new(diagram)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Diagram> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Diagram> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Diagram {
        self.read().clone()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for DiagramHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DiagramHandle").field(&self.path).finish()
    }
}

fn start_tag_regex() -> &'static Regex {
    static START_TAG: OnceLock<Regex> = OnceLock::new();
    START_TAG.get_or_init(|| Regex::new(r"^\s*@start[a-z]+(?:\s+(.*?))?\s*$").unwrap())
}

/// True if the text contains a `@start…` line.
pub fn is_diagram_text(text: &str) -> bool {
    text.lines().any(|line| start_tag_regex().is_match(line))
}

/// Output file name declared on the first `@startuml <name>` line, if any.
pub fn declared_image_name(text: &str) -> Option<&str> {
    text.lines()
        .find_map(|line| start_tag_regex().captures(line))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_matches('"'))
        .filter(|name| !name.is_empty())
}

/// Image file the renderer writes for `path` with the given content.
pub fn image_file_for(path: &Path, content: &str, format: ImageFormat) -> PathBuf {
    match declared_image_name(content) {
        Some(name) => {
            let dir = path.parent().unwrap_or_else(|| Path::new(""));
            let declared = dir.join(name);
            if declared.extension().is_some() {
                declared
            } else {
                declared.with_extension(format.extension())
            }
        }
        None => path.with_extension(format.extension()),
    }
}

/// Returns the text with a leading newline if it starts with a
/// non-whitespace character. The renderer sniffs the encoding from the
/// first bytes and misreads files that start directly with content.
pub fn normalize_leading_whitespace(text: &str) -> Option<String> {
    match text.chars().next() {
        Some(c) if !c.is_whitespace() => Some(format!("\n{}", text)),
        _ => None,
    }
}

/// True if the path has one of the known diagram extensions.
pub fn is_diagram_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            DIAGRAM_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Appends the default diagram extension when the path has none.
pub fn with_default_extension(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    if path.extension().is_some() {
        path
    } else {
        path.with_extension(DEFAULT_EXTENSION)
    }
}

/// Diagram identity is the absolute path. Relative paths are resolved
/// against the working directory without touching the filesystem.
pub fn absolute_path(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    match std::path::absolute(&path) {
        Ok(absolute) => absolute,
        Err(e) => {
            tracing::warn!("Cannot resolve {:?}: {}", path, e);
            path
        }
    }
}
