//! Keeps the preview list of a directory in step with the filesystem.
//!
//! All list mutations happen on one actor task. Loads, file reads and deletes
//! run on spawned tasks and post their results back to the actor, and
//! filesystem notifications are received by the actor itself, so every change
//! to the list is serialized.

use super::entry::PreviewEntry;
use crate::constants::{COMMAND_CHANNEL_BUFFER, EVENT_CHANNEL_CAPACITY, NEW_DIAGRAM_TEMPLATE};
use crate::diagram::{absolute_path, with_default_extension, Diagram, DiagramHandle};
use crate::io::{DiagramIo, FsEvent, IoError, ReadProgress};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("{0:?} does not contain a diagram")]
    NotADiagram(PathBuf),
    #[error("{0:?} has no parent directory")]
    InvalidPath(PathBuf),
    #[error("Preview loader has stopped")]
    Stopped,
}

/// Terminal state of a directory load.
#[derive(Debug)]
pub enum LoadOutcome {
    Completed(usize),
    /// Cancelled by the caller or superseded by a newer load. Previews loaded
    /// so far stay in the list.
    Canceled(usize),
    Failed { loaded: usize, error: IoError },
}

impl LoadOutcome {
    pub fn summary(&self) -> LoadSummary {
        match self {
            LoadOutcome::Completed(n) => LoadSummary::Completed(*n),
            LoadOutcome::Canceled(n) => LoadSummary::Canceled(*n),
            LoadOutcome::Failed { loaded, .. } => LoadSummary::Failed(*loaded),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSummary {
    Completed(usize),
    Canceled(usize),
    Failed(usize),
}

#[derive(Debug, Clone)]
pub enum LoaderEvent {
    /// `None` when the requested directory was invalid.
    DirectoryChanged(Option<PathBuf>),
    Cleared,
    PreviewAdded(PreviewEntry),
    PreviewRemoved(PreviewEntry),
    Progress { done: usize, total: usize },
    LoadFinished(LoadSummary),
    OpenPreviewRequested(PreviewEntry),
    /// The backing file of a listed diagram was deleted outside the editor.
    DiagramDeleted(DiagramHandle),
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    SetDirectory(PathBuf, Reply<bool>),
    Load(Reply<LoadOutcome>),
    CancelLoad,
    AddNew(PathBuf, Reply<Result<PreviewEntry, LoaderError>>),
    Delete(PreviewEntry, Reply<Result<(), LoaderError>>),
    Open(PathBuf, Reply<Result<PreviewEntry, LoaderError>>),
    Previews(Reply<Vec<PreviewEntry>>),
    Find(PathBuf, Reply<Option<PreviewEntry>>),
    Directory(Reply<Option<PathBuf>>),
    Current(Reply<Option<PreviewEntry>>),
}

enum Internal {
    LoadItem {
        generation: u64,
        progress: ReadProgress,
    },
    LoadFinished {
        generation: u64,
        result: Result<usize, IoError>,
    },
    NewDiagramStored {
        path: PathBuf,
        result: Result<Option<Diagram>, IoError>,
        reply: Reply<Result<PreviewEntry, LoaderError>>,
    },
    DeleteFinished {
        entry: PreviewEntry,
        result: Result<(), IoError>,
        reply: Reply<Result<(), LoaderError>>,
    },
    OpenRead {
        path: PathBuf,
        result: Result<Option<Diagram>, IoError>,
        reply: Reply<Result<PreviewEntry, LoaderError>>,
    },
    AddedRead {
        path: PathBuf,
        result: Result<Option<Diagram>, IoError>,
    },
}

/// Handle to the preview list actor.
#[derive(Clone)]
pub struct PreviewLoader {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<LoaderEvent>,
    loading: Arc<AtomicBool>,
}

impl PreviewLoader {
    /// Starts the actor. Must be called from within a tokio runtime.
    pub fn spawn(io: Arc<dyn DiagramIo>) -> Self {
        let (tx, commands) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let loading = Arc::new(AtomicBool::new(false));
        let fs_events = io.subscribe();

        let actor = LoaderActor {
            io,
            directory: None,
            valid: false,
            previews: Vec::new(),
            current: None,
            deleting: HashSet::new(),
            load: None,
            generation: 0,
            loading: loading.clone(),
            events: events.clone(),
            internal: internal_tx,
        };
        tokio::spawn(actor.run(commands, internal, fs_events));

        Self {
            tx,
            events,
            loading,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.events.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, LoaderError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| LoaderError::Stopped)?;
        response.await.map_err(|_| LoaderError::Stopped)
    }

    /// Switches to `path` and reloads. Returns false, clearing the list and
    /// stopping monitoring, if `path` is not a directory.
    ///
    /// Paths given to the loader are made absolute, so every spelling of a
    /// file resolves to the same preview.
    pub async fn set_directory(&self, path: impl Into<PathBuf>) -> Result<bool, LoaderError> {
        let path = absolute_path(path);
        self.request(|reply| Command::SetDirectory(path, reply)).await
    }

    /// Clears the list and reloads it from the current directory.
    pub async fn load(&self) -> Result<LoadOutcome, LoaderError> {
        self.request(Command::Load).await
    }

    /// Cancels the running load, if any.
    pub async fn cancel_load(&self) -> Result<(), LoaderError> {
        self.tx
            .send(Command::CancelLoad)
            .await
            .map_err(|_| LoaderError::Stopped)
    }

    /// Creates a diagram from the starter template and requests it be opened.
    pub async fn add_new_diagram(&self, path: impl Into<PathBuf>) -> Result<PreviewEntry, LoaderError> {
        let path = absolute_path(path);
        self.request(|reply| Command::AddNew(path, reply)).await?
    }

    /// Deletes the backing file; the preview is removed only on success.
    pub async fn delete_diagram(&self, entry: PreviewEntry) -> Result<(), LoaderError> {
        self.request(|reply| Command::Delete(entry, reply)).await?
    }

    /// Resolves `path` to a preview, reading it if unknown, and requests it
    /// be opened.
    pub async fn open_diagram(&self, path: impl Into<PathBuf>) -> Result<PreviewEntry, LoaderError> {
        let path = absolute_path(path);
        self.request(|reply| Command::Open(path, reply)).await?
    }

    pub async fn open_diagram_files<I>(&self, paths: I) -> Vec<Result<PreviewEntry, LoaderError>>
    where
        I: IntoIterator,
        I::Item: Into<PathBuf>,
    {
        let mut results = Vec::new();
        for path in paths {
            results.push(self.open_diagram(path).await);
        }
        results
    }

    pub async fn previews(&self) -> Result<Vec<PreviewEntry>, LoaderError> {
        self.request(Command::Previews).await
    }

    pub async fn find(&self, path: &Path) -> Result<Option<PreviewEntry>, LoaderError> {
        let path = absolute_path(path);
        self.request(|reply| Command::Find(path, reply)).await
    }

    pub async fn directory(&self) -> Result<Option<PathBuf>, LoaderError> {
        self.request(Command::Directory).await
    }

    /// The most recently created diagram.
    pub async fn current(&self) -> Result<Option<PreviewEntry>, LoaderError> {
        self.request(Command::Current).await
    }
}

struct LoadJob {
    generation: u64,
    cancel: CancellationToken,
    reply: Option<Reply<LoadOutcome>>,
}

struct LoaderActor {
    io: Arc<dyn DiagramIo>,
    directory: Option<PathBuf>,
    valid: bool,
    previews: Vec<PreviewEntry>,
    current: Option<PreviewEntry>,
    /// Files being deleted through `delete_diagram`. Watcher events for
    /// them are not external deletions.
    deleting: HashSet<PathBuf>,
    load: Option<LoadJob>,
    generation: u64,
    loading: Arc<AtomicBool>,
    events: broadcast::Sender<LoaderEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl LoaderActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut fs_events: broadcast::Receiver<FsEvent>,
    ) {
        let mut fs_open = true;
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(msg) = internal.recv() => self.handle_internal(msg),
                event = fs_events.recv(), if fs_open => match event {
                    Ok(event) => self.handle_fs_event(event),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} filesystem events, reloading previews", missed);
                        self.start_load(None);
                    }
                    Err(RecvError::Closed) => fs_open = false,
                },
            }
        }
        self.supersede_load();
        self.io.stop_monitoring();
        tracing::debug!("Preview loader shutting down");
    }

    fn emit(&self, event: LoaderEvent) {
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetDirectory(path, reply) => {
                let valid = self.set_directory(path);
                let _ = reply.send(valid);
            }
            Command::Load(reply) => self.start_load(Some(reply)),
            Command::CancelLoad => {
                if let Some(job) = &self.load {
                    tracing::info!("Cancelling preview load");
                    job.cancel.cancel();
                }
            }
            Command::AddNew(path, reply) => self.add_new(path, reply),
            Command::Delete(entry, reply) => {
                self.deleting.insert(entry.path().to_path_buf());
                let io = self.io.clone();
                let internal = self.internal.clone();
                tokio::spawn(async move {
                    let snapshot = entry.diagram().snapshot();
                    let result = io.delete(&snapshot).await;
                    let _ = internal.send(Internal::DeleteFinished {
                        entry,
                        result,
                        reply,
                    });
                });
            }
            Command::Open(path, reply) => {
                if let Some(entry) = self.find(&path) {
                    self.emit(LoaderEvent::OpenPreviewRequested(entry.clone()));
                    let _ = reply.send(Ok(entry));
                    return;
                }
                self.read_then(path, |path, result| Internal::OpenRead {
                    path,
                    result,
                    reply,
                });
            }
            Command::Previews(reply) => {
                let _ = reply.send(self.previews.clone());
            }
            Command::Find(path, reply) => {
                let _ = reply.send(self.find(&path));
            }
            Command::Directory(reply) => {
                let _ = reply.send(self.valid_directory());
            }
            Command::Current(reply) => {
                let _ = reply.send(self.current.clone());
            }
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::LoadItem {
                generation,
                progress,
            } => {
                if !self.is_current_load(generation) {
                    return;
                }
                self.emit(LoaderEvent::Progress {
                    done: progress.done,
                    total: progress.total,
                });
                if let Some(diagram) = progress.diagram {
                    self.insert(diagram);
                }
            }
            Internal::LoadFinished { generation, result } => {
                if !self.is_current_load(generation) {
                    return;
                }
                self.finish_load(result);
            }
            Internal::NewDiagramStored {
                path,
                result,
                reply,
            } => {
                let _ = reply.send(self.new_diagram_stored(path, result));
            }
            Internal::DeleteFinished {
                entry,
                result,
                reply,
            } => {
                self.deleting.remove(entry.path());
                let result = match result {
                    Ok(()) => {
                        self.remove(entry.path());
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!("Failed to delete {:?}: {}", entry.path(), e);
                        Err(e.into())
                    }
                };
                let _ = reply.send(result);
            }
            Internal::OpenRead {
                path,
                result,
                reply,
            } => {
                let result = match result {
                    Ok(Some(diagram)) => {
                        let entry = self.materialize(diagram);
                        self.emit(LoaderEvent::OpenPreviewRequested(entry.clone()));
                        Ok(entry)
                    }
                    Ok(None) => Err(LoaderError::NotADiagram(path)),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Internal::AddedRead { path, result } => match result {
                Ok(Some(diagram)) if self.should_track(&path) => {
                    self.insert(diagram);
                }
                Ok(_) => tracing::debug!("Ignoring added file {:?}", path),
                Err(e) => tracing::debug!("Could not read added file {:?}: {}", path, e),
            },
        }
    }

    fn handle_fs_event(&mut self, event: FsEvent) {
        match event {
            FsEvent::Added(path) => {
                if !self.should_track(&path) {
                    tracing::debug!("Ignoring add event for {:?}", path);
                    return;
                }
                self.read_then(path, |path, result| Internal::AddedRead { path, result });
            }
            FsEvent::Deleted(path) if self.deleting.contains(&path) => {
                tracing::debug!("Ignoring delete event for {:?}, deletion in progress", path);
            }
            FsEvent::Deleted(path) => match self.remove(&path) {
                Some(entry) => {
                    tracing::info!("{:?} was deleted externally", path);
                    self.emit(LoaderEvent::DiagramDeleted(entry.diagram().clone()));
                }
                None => tracing::debug!("Ignoring delete event for untracked {:?}", path),
            },
        }
    }

    /// True if `path` is a direct child of the current directory and not
    /// already listed.
    fn should_track(&self, path: &Path) -> bool {
        self.find(path).is_none() && self.is_in_directory(path)
    }

    fn is_in_directory(&self, path: &Path) -> bool {
        self.valid && path.parent().is_some() && path.parent() == self.directory.as_deref()
    }

    fn valid_directory(&self) -> Option<PathBuf> {
        self.directory.clone().filter(|_| self.valid)
    }

    fn find(&self, path: &Path) -> Option<PreviewEntry> {
        self.previews.iter().find(|p| p.path() == path).cloned()
    }

    fn read_then<F>(&self, path: PathBuf, post: F)
    where
        F: FnOnce(PathBuf, Result<Option<Diagram>, IoError>) -> Internal + Send + 'static,
    {
        let io = self.io.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = io.read(&path).await;
            let _ = internal.send(post(path, result));
        });
    }

    /// Adds a preview for `diagram` unless one for the same file exists.
    fn insert(&mut self, diagram: Diagram) -> PreviewEntry {
        if let Some(existing) = self.find(diagram.path()) {
            return existing;
        }
        let entry = PreviewEntry::new(DiagramHandle::new(diagram), None);
        self.previews.push(entry.clone());
        self.load_thumbnail(&entry);
        self.emit(LoaderEvent::PreviewAdded(entry.clone()));
        entry
    }

    /// Like `insert`, but files outside the current directory get a preview
    /// that is not listed.
    fn materialize(&mut self, diagram: Diagram) -> PreviewEntry {
        if let Some(existing) = self.find(diagram.path()) {
            return existing;
        }
        if self.is_in_directory(diagram.path()) {
            return self.insert(diagram);
        }
        let entry = PreviewEntry::new(DiagramHandle::new(diagram), None);
        self.load_thumbnail(&entry);
        entry
    }

    fn remove(&mut self, path: &Path) -> Option<PreviewEntry> {
        let index = self.previews.iter().position(|p| p.path() == path)?;
        let entry = self.previews.remove(index);
        self.emit(LoaderEvent::PreviewRemoved(entry.clone()));
        Some(entry)
    }

    fn clear(&mut self) {
        self.previews.clear();
        self.emit(LoaderEvent::Cleared);
    }

    fn load_thumbnail(&self, entry: &PreviewEntry) {
        let (file, format) = {
            let d = entry.diagram().read();
            (d.image_file.clone(), d.image_format)
        };
        let io = self.io.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            match io.read_image(&file, format).await {
                Ok(image) => {
                    if entry.thumbnail().is_none() {
                        entry.set_thumbnail(Some(image));
                    }
                }
                Err(IoError::NotFound(_)) => {}
                Err(e) => tracing::debug!("No thumbnail for {:?}: {}", entry.path(), e),
            }
        });
    }

    fn set_directory(&mut self, path: PathBuf) -> bool {
        if self.io.is_directory(&path) {
            if let Err(e) = self.io.start_monitoring(&path) {
                tracing::warn!("Cannot monitor {:?}: {}", path, e);
            }
            tracing::info!("Preview directory set to {:?}", path);
            self.directory = Some(path.clone());
            self.valid = true;
            self.emit(LoaderEvent::DirectoryChanged(Some(path)));
            self.start_load(None);
            true
        } else {
            tracing::warn!("{:?} is not a directory", path);
            self.io.stop_monitoring();
            self.directory = Some(path);
            self.valid = false;
            self.supersede_load();
            self.clear();
            self.emit(LoaderEvent::DirectoryChanged(None));
            false
        }
    }

    fn is_current_load(&self, generation: u64) -> bool {
        self.load
            .as_ref()
            .is_some_and(|job| job.generation == generation)
    }

    /// Cancels the running load and reports it as canceled.
    fn supersede_load(&mut self) {
        if let Some(job) = self.load.take() {
            job.cancel.cancel();
            self.loading.store(false, Ordering::SeqCst);
            if let Some(reply) = job.reply {
                let _ = reply.send(LoadOutcome::Canceled(self.previews.len()));
            }
        }
    }

    fn start_load(&mut self, reply: Option<Reply<LoadOutcome>>) {
        self.supersede_load();
        self.clear();

        let Some(directory) = self.valid_directory() else {
            if let Some(reply) = reply {
                let _ = reply.send(LoadOutcome::Completed(0));
            }
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.load = Some(LoadJob {
            generation,
            cancel: cancel.clone(),
            reply,
        });
        self.loading.store(true, Ordering::SeqCst);
        tracing::info!("Loading previews from {:?}", directory);

        let io = self.io.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let (progress_tx, mut progress) = mpsc::unbounded_channel();
            let read = io.read_diagrams(&directory, progress_tx, cancel);
            tokio::pin!(read);

            let result = loop {
                tokio::select! {
                    Some(item) = progress.recv() => {
                        let _ = internal.send(Internal::LoadItem { generation, progress: item });
                    }
                    res = &mut read => break res,
                }
            };
            while let Ok(item) = progress.try_recv() {
                let _ = internal.send(Internal::LoadItem {
                    generation,
                    progress: item,
                });
            }
            let _ = internal.send(Internal::LoadFinished {
                generation,
                result: result.map(|diagrams| diagrams.len()),
            });
        });
    }

    fn finish_load(&mut self, result: Result<usize, IoError>) {
        let Some(job) = self.load.take() else {
            return;
        };
        self.loading.store(false, Ordering::SeqCst);

        let loaded = self.previews.len();
        let outcome = match result {
            Ok(_) => {
                tracing::info!("Loaded {} preview(s)", loaded);
                LoadOutcome::Completed(loaded)
            }
            Err(IoError::Cancelled) => {
                tracing::info!("Preview load canceled after {} preview(s)", loaded);
                LoadOutcome::Canceled(loaded)
            }
            Err(error) => {
                tracing::error!("Preview load failed after {} preview(s): {}", loaded, error);
                LoadOutcome::Failed { loaded, error }
            }
        };
        self.emit(LoaderEvent::LoadFinished(outcome.summary()));
        if let Some(reply) = job.reply {
            let _ = reply.send(outcome);
        }
    }

    fn add_new(&mut self, requested: PathBuf, reply: Reply<Result<PreviewEntry, LoaderError>>) {
        let path = with_default_extension(requested);
        if path.parent().map_or(true, |p| p.as_os_str().is_empty()) {
            let _ = reply.send(Err(LoaderError::InvalidPath(path)));
            return;
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let diagram = Diagram::new(&path, NEW_DIAGRAM_TEMPLATE.replace("{name}", &name));

        let io = self.io.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = match io.save(&diagram, false).await {
                // Re-read to pick up whatever the write path normalized.
                Ok(()) => io.read(&path).await,
                Err(e) => Err(e),
            };
            let _ = internal.send(Internal::NewDiagramStored {
                path,
                result,
                reply,
            });
        });
    }

    fn new_diagram_stored(
        &mut self,
        path: PathBuf,
        result: Result<Option<Diagram>, IoError>,
    ) -> Result<PreviewEntry, LoaderError> {
        let diagram = match result {
            Ok(Some(diagram)) => diagram,
            Ok(None) => return Err(LoaderError::NotADiagram(path)),
            Err(e) => {
                tracing::error!("Failed to create {:?}: {}", path, e);
                return Err(e.into());
            }
        };

        let parent = path.parent().map(Path::to_path_buf);
        if let Some(parent) = parent.filter(|p| !self.valid || self.directory.as_ref() != Some(p)) {
            self.set_directory(parent);
        }

        let entry = self.materialize(diagram);
        tracing::info!("Created {:?}", path);
        self.current = Some(entry.clone());
        self.emit(LoaderEvent::OpenPreviewRequested(entry.clone()));
        Ok(entry)
    }
}
