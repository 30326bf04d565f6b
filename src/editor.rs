//! The text-editing surface an editor session drives.
//!
//! The real widget (undo stack, selection, highlighting) lives in the
//! front-end; sessions only need text access, the modified flag, and the two
//! change notifications.

use crate::diagram::Diagram;
use crate::signal::{HandlerId, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type ChangedHandler = Box<dyn Fn() + Send + Sync>;
pub type ModifiedHandler = Box<dyn Fn(bool) + Send + Sync>;

pub trait CodeEditor: Send + Sync {
    fn text(&self) -> String;
    /// Replaces the whole text. Counts as an edit: emits `changed` and marks
    /// the buffer modified.
    fn set_text(&self, text: &str);
    fn is_modified(&self) -> bool;
    fn set_modified(&self, modified: bool);
    /// Connects to content changes.
    fn connect_changed(&self, handler: ChangedHandler) -> HandlerId;
    /// Connects to transitions of the modified flag.
    fn connect_modified_changed(&self, handler: ModifiedHandler) -> HandlerId;
    fn disconnect(&self, id: HandlerId);
    /// Releases the editor resource.
    fn close(&self);
}

/// Builds the editor surface for a newly opened diagram.
pub trait EditorFactory: Send + Sync {
    fn create(&self, diagram: &Diagram) -> Arc<dyn CodeEditor>;
}

#[derive(Default)]
struct BufferState {
    text: String,
    modified: bool,
}

/// In-memory editor buffer.
#[derive(Default)]
pub struct TextBuffer {
    state: Mutex<BufferState>,
    changed: Signal<()>,
    modified_changed: Signal<bool>,
    closed: AtomicBool,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer holding `text`, unmodified.
    pub fn with_text(text: impl Into<String>) -> Self {
        let buffer = Self::default();
        buffer.lock().text = text.into();
        buffer
    }

    /// Appends text as a user edit.
    pub fn append(&self, text: &str) {
        let mut combined = self.text();
        combined.push_str(text);
        self.set_text(&combined);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CodeEditor for TextBuffer {
    fn text(&self) -> String {
        self.lock().text.clone()
    }

    fn set_text(&self, text: &str) {
        let became_modified = {
            let mut st = self.lock();
            if st.text == text {
                return;
            }
            st.text = text.to_string();
            !std::mem::replace(&mut st.modified, true)
        };
        self.changed.emit(&());
        if became_modified {
            self.modified_changed.emit(&true);
        }
    }

    fn is_modified(&self) -> bool {
        self.lock().modified
    }

    fn set_modified(&self, modified: bool) {
        let changed = {
            let mut st = self.lock();
            std::mem::replace(&mut st.modified, modified) != modified
        };
        if changed {
            self.modified_changed.emit(&modified);
        }
    }

    fn connect_changed(&self, handler: ChangedHandler) -> HandlerId {
        self.changed.connect(move |_| handler())
    }

    fn connect_modified_changed(&self, handler: ModifiedHandler) -> HandlerId {
        self.modified_changed.connect(move |m| handler(*m))
    }

    fn disconnect(&self, id: HandlerId) {
        if !self.changed.disconnect(id) {
            self.modified_changed.disconnect(id);
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.changed.disconnect_all();
            self.modified_changed.disconnect_all();
        }
    }
}

/// Creates a [`TextBuffer`] seeded with the diagram's content.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextBufferFactory;

impl EditorFactory for TextBufferFactory {
    fn create(&self, diagram: &Diagram) -> Arc<dyn CodeEditor> {
        Arc::new(TextBuffer::with_text(diagram.content.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_edit_emits_changed_and_modified_once() {
        let buffer = TextBuffer::with_text("@startuml\n@enduml");
        let changes = Arc::new(AtomicUsize::new(0));
        let transitions = Arc::new(Mutex::new(Vec::new()));

        let c = changes.clone();
        buffer.connect_changed(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let t = transitions.clone();
        buffer.connect_modified_changed(Box::new(move |m| t.lock().unwrap().push(m)));

        buffer.append("\nA -> B");
        buffer.append("\nB -> C");
        assert_eq!(changes.load(Ordering::SeqCst), 2);
        assert_eq!(*transitions.lock().unwrap(), vec![true]);

        buffer.set_modified(false);
        buffer.set_modified(false);
        assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_setting_identical_text_is_not_an_edit() {
        let buffer = TextBuffer::with_text("same");
        buffer.set_text("same");
        assert!(!buffer.is_modified());
    }

    #[test]
    fn test_close_is_idempotent_and_drops_handlers() {
        let buffer = TextBuffer::new();
        let changes = Arc::new(AtomicUsize::new(0));
        let c = changes.clone();
        buffer.connect_changed(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        buffer.close();
        buffer.close();
        assert!(buffer.is_closed());
        buffer.set_text("edit after close");
        assert_eq!(changes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disconnect_by_id() {
        let buffer = TextBuffer::new();
        let transitions = Arc::new(AtomicUsize::new(0));
        let t = transitions.clone();
        let id = buffer.connect_modified_changed(Box::new(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        }));
        buffer.disconnect(id);
        buffer.set_text("x");
        assert_eq!(transitions.load(Ordering::SeqCst), 0);
    }
}
