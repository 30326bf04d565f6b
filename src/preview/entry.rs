use crate::constants::{EXCERPT_MAX_LINES, EXCERPT_MAX_LINE_CHARS};
use crate::diagram::{DiagramHandle, Image};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// A diagram as shown in the preview list: excerpt plus thumbnail.
///
/// Cloning shares the entry. The diagram reference never changes; saves are
/// reflected by updating the diagram's fields and the thumbnail in place.
#[derive(Clone)]
pub struct PreviewEntry {
    inner: Arc<EntryInner>,
}

struct EntryInner {
    diagram: DiagramHandle,
    thumbnail: RwLock<Option<Image>>,
}

impl PreviewEntry {
    pub fn new(diagram: DiagramHandle, thumbnail: Option<Image>) -> Self {
        Self {
            inner: Arc::new(EntryInner {
                diagram,
                thumbnail: RwLock::new(thumbnail),
            }),
        }
    }

    pub fn diagram(&self) -> &DiagramHandle {
        &self.inner.diagram
    }

    pub fn path(&self) -> &Path {
        self.inner.diagram.path()
    }

    pub fn thumbnail(&self) -> Option<Image> {
        self.inner
            .thumbnail
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_thumbnail(&self, image: Option<Image>) {
        *self
            .inner
            .thumbnail
            .write()
            .unwrap_or_else(PoisonError::into_inner) = image;
    }

    /// First few non-empty lines of the diagram text.
    pub fn excerpt(&self) -> String {
        excerpt(&self.inner.diagram.read().content)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for PreviewEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewEntry")
            .field("path", &self.path())
            .field("has_thumbnail", &self.thumbnail().is_some())
            .finish()
    }
}

pub fn excerpt(content: &str) -> String {
    content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .take(EXCERPT_MAX_LINES)
        .map(|line| match line.char_indices().nth(EXCERPT_MAX_LINE_CHARS) {
            Some((cut, _)) => format!("{}…", &line[..cut]),
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{Diagram, ImageFormat};

    #[test]
    fn test_excerpt_skips_blank_lines_and_bounds_length() {
        let long = "x".repeat(EXCERPT_MAX_LINE_CHARS + 10);
        let content = format!("\n\n@startuml\n\n{}\nA -> B\nB -> C\nC -> D\n@enduml\n", long);
        let text = excerpt(&content);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), EXCERPT_MAX_LINES);
        assert_eq!(lines[0], "@startuml");
        assert_eq!(lines[1].chars().count(), EXCERPT_MAX_LINE_CHARS + 1);
        assert!(lines[1].ends_with('…'));
        assert_eq!(lines[4], "C -> D");
    }

    #[test]
    fn test_excerpt_follows_diagram_content() {
        let handle = DiagramHandle::new(Diagram::new("/d/a.puml", "@startuml\n@enduml"));
        let entry = PreviewEntry::new(handle.clone(), None);
        handle.write().content = "@startuml\nnew line\n@enduml".to_string();
        assert_eq!(entry.excerpt(), "@startuml\nnew line\n@enduml");
    }

    #[test]
    fn test_thumbnail_is_shared_between_clones() {
        let handle = DiagramHandle::new(Diagram::new("/d/a.puml", "@startuml\n@enduml"));
        let entry = PreviewEntry::new(handle, None);
        let clone = entry.clone();
        clone.set_thumbnail(Some(Image::new(ImageFormat::Png, vec![1, 2])));
        assert_eq!(entry.thumbnail().map(|i| i.len()), Some(2));
        assert!(PreviewEntry::ptr_eq(&entry, &clone));
    }
}
