//! In-memory collaborators for unit tests.

use crate::compiler::{CompileError, CompileOutput, Compiler};
use crate::diagram::{is_diagram_file, Diagram, DiagramError, Image, ImageFormat};
use crate::editor::{ChangedHandler, CodeEditor, EditorFactory, ModifiedHandler, TextBuffer};
use crate::io::{DiagramIo, FsEvent, IoError, ReadProgress};
use crate::session::{SessionConfig, SessionServices};
use crate::signal::HandlerId;
use crate::timer::TokioTimerFactory;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Text containing this marker is rejected by [`FakeCompiler`].
pub const SYNTAX_ERROR_MARKER: &str = "!syntax-error";

pub const SEQ: &str = "\n@startuml\nAlice -> Bob : hello\n@enduml\n";

async fn pass_gate(gate: &Mutex<Option<Arc<Semaphore>>>) {
    let gate = gate.lock().unwrap().clone();
    if let Some(gate) = gate {
        gate.acquire().await.unwrap().forget();
    }
}

fn install_gate(gate: &Mutex<Option<Arc<Semaphore>>>) -> Arc<Semaphore> {
    let semaphore = Arc::new(Semaphore::new(0));
    *gate.lock().unwrap() = Some(semaphore.clone());
    semaphore
}

/// Renders text to an image whose bytes are the text itself.
#[derive(Default)]
pub struct FakeCompiler {
    image_calls: Mutex<Vec<(String, ImageFormat)>>,
    file_calls: Mutex<Vec<(PathBuf, ImageFormat)>>,
    image_gate: Mutex<Option<Arc<Semaphore>>>,
    file_failure: Mutex<Option<Vec<DiagramError>>>,
}

impl FakeCompiler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every later `compile_to_image` wait for one permit. The fake
    /// ignores its cancellation token, like a slow external process.
    pub fn hold_images(&self) -> Arc<Semaphore> {
        install_gate(&self.image_gate)
    }

    pub fn fail_files_with(&self, errors: Option<Vec<DiagramError>>) {
        *self.file_failure.lock().unwrap() = errors;
    }

    pub fn image_calls(&self) -> Vec<(String, ImageFormat)> {
        self.image_calls.lock().unwrap().clone()
    }

    pub fn file_calls(&self) -> Vec<(PathBuf, ImageFormat)> {
        self.file_calls.lock().unwrap().clone()
    }

    pub fn image_for(text: &str, format: ImageFormat) -> Image {
        Image::new(format, text.as_bytes())
    }
}

#[async_trait]
impl Compiler for FakeCompiler {
    async fn compile_to_image(
        &self,
        text: &str,
        format: ImageFormat,
        _cancel: CancellationToken,
    ) -> Result<CompileOutput, CompileError> {
        self.image_calls
            .lock()
            .unwrap()
            .push((text.to_string(), format));
        pass_gate(&self.image_gate).await;
        if text.contains(SYNTAX_ERROR_MARKER) {
            return Ok(CompileOutput::rejected(vec![DiagramError::new(
                Some(2),
                "Syntax Error?",
            )]));
        }
        Ok(CompileOutput::rendered(Self::image_for(text, format)))
    }

    async fn compile_to_file(&self, file: &Path, format: ImageFormat) -> Result<(), CompileError> {
        self.file_calls
            .lock()
            .unwrap()
            .push((file.to_path_buf(), format));
        match self.file_failure.lock().unwrap().clone() {
            Some(errors) if errors.is_empty() => Err(CompileError::Failed("boom".to_string())),
            Some(errors) => Err(CompileError::Diagram(errors)),
            None => Ok(()),
        }
    }
}

/// In-memory file store.
pub struct FakeIo {
    files: Mutex<BTreeMap<PathBuf, String>>,
    dirs: Mutex<BTreeSet<PathBuf>>,
    saves: Mutex<Vec<(PathBuf, bool)>>,
    deletes: Mutex<Vec<PathBuf>>,
    reads: AtomicUsize,
    enumerations: AtomicUsize,
    fail_saves: AtomicBool,
    fail_deletes: AtomicBool,
    fail_enumeration: AtomicBool,
    save_gate: Mutex<Option<Arc<Semaphore>>>,
    delete_gate: Mutex<Option<Arc<Semaphore>>>,
    enumeration_gate: Mutex<Option<Arc<Semaphore>>>,
    monitored: Mutex<Option<PathBuf>>,
    events: broadcast::Sender<FsEvent>,
}

impl FakeIo {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            files: Mutex::default(),
            dirs: Mutex::default(),
            saves: Mutex::default(),
            deletes: Mutex::default(),
            reads: AtomicUsize::new(0),
            enumerations: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_enumeration: AtomicBool::new(false),
            save_gate: Mutex::default(),
            delete_gate: Mutex::default(),
            enumeration_gate: Mutex::default(),
            monitored: Mutex::default(),
            events,
        })
    }

    pub fn add_dir(&self, dir: impl Into<PathBuf>) {
        self.dirs.lock().unwrap().insert(dir.into());
    }

    pub fn put(&self, path: impl Into<PathBuf>, content: &str) {
        let path = path.into();
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        self.files.lock().unwrap().insert(path, content.to_string());
    }

    /// Removes a file behind the store's back, as an external tool would.
    pub fn remove(&self, path: &Path) {
        self.files.lock().unwrap().remove(path);
    }

    pub fn content(&self, path: &Path) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn saves(&self) -> Vec<(PathBuf, bool)> {
        self.saves.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<PathBuf> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    pub fn hold_saves(&self) -> Arc<Semaphore> {
        install_gate(&self.save_gate)
    }

    pub fn hold_deletes(&self) -> Arc<Semaphore> {
        install_gate(&self.delete_gate)
    }

    /// Makes enumeration wait for one permit before reading each file.
    pub fn hold_enumeration(&self) -> Arc<Semaphore> {
        install_gate(&self.enumeration_gate)
    }

    pub fn monitored(&self) -> Option<PathBuf> {
        self.monitored.lock().unwrap().clone()
    }

    pub fn emit(&self, event: FsEvent) {
        let _ = self.events.send(event);
    }

    fn denied(path: &Path) -> IoError {
        IoError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        }
    }
}

#[async_trait]
impl DiagramIo for FakeIo {
    async fn read(&self, file: &Path) -> Result<Option<Diagram>, IoError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.content(file) {
            Some(content) => Ok(Diagram::parse(file, content)),
            None => Err(IoError::NotFound(file.to_path_buf())),
        }
    }

    async fn save(&self, diagram: &Diagram, make_backup: bool) -> Result<(), IoError> {
        pass_gate(&self.save_gate).await;
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Self::denied(diagram.path()));
        }
        self.saves
            .lock()
            .unwrap()
            .push((diagram.path().to_path_buf(), make_backup));
        self.put(diagram.path(), &diagram.content);
        Ok(())
    }

    async fn delete(&self, diagram: &Diagram) -> Result<(), IoError> {
        pass_gate(&self.delete_gate).await;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::denied(diagram.path()));
        }
        self.deletes
            .lock()
            .unwrap()
            .push(diagram.path().to_path_buf());
        match self.files.lock().unwrap().remove(diagram.path()) {
            Some(_) => Ok(()),
            None => Err(IoError::NotFound(diagram.path().to_path_buf())),
        }
    }

    async fn read_image(&self, file: &Path, format: ImageFormat) -> Result<Image, IoError> {
        Ok(Image::new(
            format,
            format!("file image {}", file.display()).into_bytes(),
        ))
    }

    async fn read_diagrams(
        &self,
        directory: &Path,
        progress: mpsc::UnboundedSender<ReadProgress>,
        cancel: CancellationToken,
    ) -> Result<Vec<Diagram>, IoError> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        let files: Vec<PathBuf> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.parent() == Some(directory) && is_diagram_file(p))
            .cloned()
            .collect();

        let total = files.len();
        let mut diagrams = Vec::new();
        for (i, path) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(IoError::Cancelled);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(IoError::Cancelled),
                _ = pass_gate(&self.enumeration_gate) => {}
            }
            if cancel.is_cancelled() {
                return Err(IoError::Cancelled);
            }
            if self.fail_enumeration.load(Ordering::SeqCst) {
                return Err(Self::denied(path));
            }
            let diagram = self.read(path).await.ok().flatten();
            let _ = progress.send(ReadProgress {
                done: i + 1,
                total,
                diagram: diagram.clone(),
            });
            diagrams.extend(diagram);
        }
        Ok(diagrams)
    }

    fn is_directory(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }

    fn start_monitoring(&self, directory: &Path) -> Result<(), IoError> {
        *self.monitored.lock().unwrap() = Some(directory.to_path_buf());
        Ok(())
    }

    fn stop_monitoring(&self) {
        *self.monitored.lock().unwrap() = None;
    }

    fn subscribe(&self) -> broadcast::Receiver<FsEvent> {
        self.events.subscribe()
    }
}

/// Editor that counts how often it is released.
#[derive(Default)]
pub struct CountingEditor {
    buffer: TextBuffer,
    closes: AtomicUsize,
}

impl CountingEditor {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl CodeEditor for CountingEditor {
    fn text(&self) -> String {
        self.buffer.text()
    }

    fn set_text(&self, text: &str) {
        self.buffer.set_text(text)
    }

    fn is_modified(&self) -> bool {
        self.buffer.is_modified()
    }

    fn set_modified(&self, modified: bool) {
        self.buffer.set_modified(modified)
    }

    fn connect_changed(&self, handler: ChangedHandler) -> HandlerId {
        self.buffer.connect_changed(handler)
    }

    fn connect_modified_changed(&self, handler: ModifiedHandler) -> HandlerId {
        self.buffer.connect_modified_changed(handler)
    }

    fn disconnect(&self, id: HandlerId) {
        self.buffer.disconnect(id)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.buffer.close()
    }
}

/// Hands out [`CountingEditor`]s and remembers them.
#[derive(Default)]
pub struct CountingEditorFactory {
    created: Mutex<Vec<Arc<CountingEditor>>>,
}

impl CountingEditorFactory {
    pub fn created(&self) -> Vec<Arc<CountingEditor>> {
        self.created.lock().unwrap().clone()
    }
}

impl EditorFactory for CountingEditorFactory {
    fn create(&self, diagram: &Diagram) -> Arc<dyn CodeEditor> {
        let editor = Arc::new(CountingEditor::default());
        editor.buffer.set_text(&diagram.content);
        editor.buffer.set_modified(false);
        self.created.lock().unwrap().push(editor.clone());
        editor
    }
}

pub fn services(io: &Arc<FakeIo>, compiler: &Arc<FakeCompiler>) -> SessionServices {
    SessionServices {
        compiler: compiler.clone(),
        io: io.clone(),
        timers: Arc::new(TokioTimerFactory),
        editors: Arc::new(CountingEditorFactory::default()),
    }
}

/// Session settings whose timers never fire during a test.
pub fn quiet_config() -> SessionConfig {
    SessionConfig {
        auto_save_enabled: false,
        auto_save_interval: Duration::from_secs(3600),
        refresh_debounce: Duration::from_secs(3600),
    }
}

/// Yields to other tasks until `cond` holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Lets spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}
