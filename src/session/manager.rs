//! The set of open editor sessions.
//!
//! A single actor task owns the session map. Session notifications are
//! forwarded into the same command channel as caller requests, so a session's
//! `closing`, a caller's `save_closing_session` and the session's `closed`
//! are handled in the order they happened.

use super::editor_session::{CloseRequest, EditorSession, SessionConfig, SessionServices};
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::diagram::{absolute_path, DiagramHandle};
use crate::preview::{PreviewEntry, PreviewLoader};
use crate::signal::HandlerId;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Session manager has stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    DiagramOpened(DiagramHandle),
    DiagramClosed(DiagramHandle),
    ActiveChanged(Option<PathBuf>),
    /// Raised before shutdown with the files that were open.
    Closing { open_files: Vec<PathBuf> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveAllReport {
    pub saved: usize,
    pub failed: usize,
}

type Reply<T> = oneshot::Sender<T>;
type PendingSave = Shared<BoxFuture<'static, ()>>;

enum Command {
    OpenForEdit(PreviewEntry, Reply<EditorSession>),
    Activate(PathBuf, Reply<bool>),
    SaveClosingSession,
    SaveAll(Reply<SaveAllReport>),
    CloseAll(Reply<()>),
    FinishCloseAll(Reply<()>),
    Sessions(Reply<Vec<EditorSession>>),
    Active(Reply<Option<EditorSession>>),
    SessionSaved(PathBuf),
    SessionClosing(PathBuf),
    SessionClosed(PathBuf),
    RemoveSession(PathBuf),
}

/// Handle to the session manager actor.
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ManagerEvent>,
}

impl SessionManager {
    /// Starts the actor. Must be called from within a tokio runtime.
    pub fn spawn(services: SessionServices, config: SessionConfig, loader: PreviewLoader) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let actor = ManagerActor {
            services,
            config,
            loader,
            sessions: IndexMap::new(),
            active: None,
            closing_candidate: None,
            pending_saves: HashMap::new(),
            events: events.clone(),
            self_tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));

        Self { tx, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ManagerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| ManagerError::Stopped)?;
        response.await.map_err(|_| ManagerError::Stopped)
    }

    /// Returns the session editing `preview`'s diagram, opening one if
    /// needed, and makes it active.
    pub async fn open_for_edit(&self, preview: PreviewEntry) -> Result<EditorSession, ManagerError> {
        self.request(|reply| Command::OpenForEdit(preview, reply)).await
    }

    /// Makes the session for `path` active. False if it is not open.
    pub async fn activate(&self, path: impl Into<PathBuf>) -> Result<bool, ManagerError> {
        let path = absolute_path(path);
        self.request(|reply| Command::Activate(path, reply)).await
    }

    /// Marks the session currently being closed as needing a save first.
    ///
    /// Meant to be called from a `closing` handler, so it does not wait.
    pub fn save_closing_session(&self) {
        if self.tx.send(Command::SaveClosingSession).is_err() {
            tracing::warn!("Session manager has stopped, cannot save closing session");
        }
    }

    /// Saves every idle, modified session concurrently and waits for all of
    /// them to settle.
    pub async fn save_all(&self) -> Result<SaveAllReport, ManagerError> {
        self.request(Command::SaveAll).await
    }

    /// Closes modified sessions and waits for the saves they request.
    pub async fn close_all(&self) -> Result<(), ManagerError> {
        self.request(Command::CloseAll).await
    }

    /// Open sessions in the order they were opened.
    pub async fn sessions(&self) -> Result<Vec<EditorSession>, ManagerError> {
        self.request(Command::Sessions).await
    }

    pub async fn active(&self) -> Result<Option<EditorSession>, ManagerError> {
        self.request(Command::Active).await
    }
}

struct OpenSession {
    session: EditorSession,
    /// The preview the session was opened from, used when the loader no
    /// longer lists the diagram.
    preview: PreviewEntry,
    handlers: [HandlerId; 3],
    needs_save: bool,
}

struct ManagerActor {
    services: SessionServices,
    config: SessionConfig,
    loader: PreviewLoader,
    sessions: IndexMap<PathBuf, OpenSession>,
    active: Option<PathBuf>,
    closing_candidate: Option<PathBuf>,
    pending_saves: HashMap<PathBuf, PendingSave>,
    events: broadcast::Sender<ManagerEvent>,
    self_tx: mpsc::WeakUnboundedSender<Command>,
}

impl ManagerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
        }
        for (_, open) in self.sessions.drain(..) {
            open.session.dispose();
        }
        tracing::debug!("Session manager shutting down");
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::OpenForEdit(preview, reply) => {
                let session = self.open_for_edit(preview);
                let _ = reply.send(session);
            }
            Command::Activate(path, reply) => {
                let open = self.sessions.contains_key(&path);
                if open {
                    self.set_active(Some(path));
                }
                let _ = reply.send(open);
            }
            Command::SaveClosingSession => self.save_closing_session(),
            Command::SaveAll(reply) => self.save_all(reply),
            Command::CloseAll(reply) => self.close_all(reply),
            Command::FinishCloseAll(reply) => {
                let saves: Vec<PendingSave> = self.pending_saves.values().cloned().collect();
                tokio::spawn(async move {
                    join_all(saves).await;
                    let _ = reply.send(());
                });
            }
            Command::Sessions(reply) => {
                let sessions = self.sessions.values().map(|o| o.session.clone()).collect();
                let _ = reply.send(sessions);
            }
            Command::Active(reply) => {
                let active = self
                    .active
                    .as_ref()
                    .and_then(|path| self.sessions.get(path))
                    .map(|o| o.session.clone());
                let _ = reply.send(active);
            }
            Command::SessionSaved(path) => self.session_saved(path),
            Command::SessionClosing(path) => {
                tracing::debug!("{:?} is closing", path);
                self.closing_candidate = Some(path);
            }
            Command::SessionClosed(path) => self.session_closed(path),
            Command::RemoveSession(path) => self.remove_session(&path),
        }
    }

    fn set_active(&mut self, path: Option<PathBuf>) {
        if self.active != path {
            self.active = path.clone();
            self.emit(ManagerEvent::ActiveChanged(path));
        }
    }

    /// Handler that forwards a session notification to the actor.
    fn forward<T: 'static>(
        &self,
        path: &Path,
        make: fn(PathBuf) -> Command,
    ) -> impl Fn(&T) + Send + Sync + 'static {
        let tx = self.self_tx.clone();
        let path = path.to_path_buf();
        move |_: &T| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(make(path.clone()));
            }
        }
    }

    fn open_for_edit(&mut self, preview: PreviewEntry) -> EditorSession {
        let path = absolute_path(preview.path());
        if let Some(open) = self.sessions.get(&path) {
            let session = open.session.clone();
            tracing::debug!("{:?} is already open", path);
            self.set_active(Some(path));
            return session;
        }

        let session = EditorSession::open(
            preview.diagram().clone(),
            preview.thumbnail(),
            &self.config,
            &self.services,
        );
        let handlers = [
            session.connect_saved(self.forward::<DiagramHandle>(&path, Command::SessionSaved)),
            session.connect_closing(self.forward::<CloseRequest>(&path, Command::SessionClosing)),
            session.connect_closed(self.forward::<DiagramHandle>(&path, Command::SessionClosed)),
        ];
        self.sessions.insert(
            path.clone(),
            OpenSession {
                session: session.clone(),
                preview,
                handlers,
                needs_save: false,
            },
        );
        self.set_active(Some(path));
        self.emit(ManagerEvent::DiagramOpened(session.diagram().clone()));
        session
    }

    fn session_saved(&mut self, path: PathBuf) {
        let Some(open) = self.sessions.get(&path) else {
            return;
        };
        let session = open.session.clone();
        let fallback = open.preview.clone();
        let loader = self.loader.clone();
        tokio::spawn(async move {
            let preview = match loader.find(&path).await {
                Ok(Some(preview)) => preview,
                Ok(None) | Err(_) => fallback,
            };
            sync_preview(&preview, &session);
        });
    }

    fn save_closing_session(&mut self) {
        let Some(path) = self.closing_candidate.take() else {
            tracing::warn!("No session is closing, nothing to save");
            return;
        };
        let Some(open) = self.sessions.get_mut(&path) else {
            return;
        };
        open.needs_save = true;

        let session = open.session.clone();
        let save: PendingSave = async move {
            if let Err(e) = session.save().await {
                tracing::error!("Save before close of {:?} failed: {}", session.path(), e);
            }
        }
        .boxed()
        .shared();
        tokio::spawn(save.clone());
        self.pending_saves.insert(path, save);
    }

    fn session_closed(&mut self, path: PathBuf) {
        if self.closing_candidate.as_ref() == Some(&path) {
            self.closing_candidate = None;
        }
        let Some(open) = self.sessions.get(&path) else {
            return;
        };
        let pending = if open.needs_save {
            self.pending_saves.get(&path).cloned()
        } else {
            None
        };

        match pending {
            Some(save) => {
                tracing::debug!("Waiting for save of {:?} before removing it", path);
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    save.await;
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx.send(Command::RemoveSession(path));
                    }
                });
            }
            None => self.remove_session(&path),
        }
    }

    fn remove_session(&mut self, path: &Path) {
        let Some(open) = self.sessions.shift_remove(path) else {
            return;
        };
        self.pending_saves.remove(path);

        for id in open.handlers {
            open.session.disconnect(id);
        }
        open.session.dispose();

        if self.active.as_deref() == Some(path) {
            let next = self.sessions.keys().last().cloned();
            self.set_active(next);
        }
        tracing::info!("Removed session for {:?}", path);
        self.emit(ManagerEvent::DiagramClosed(open.session.diagram().clone()));
    }

    fn save_all(&self, reply: Reply<SaveAllReport>) {
        let sessions: Vec<EditorSession> = self
            .sessions
            .values()
            .map(|o| o.session.clone())
            .filter(EditorSession::can_save)
            .collect();
        tracing::info!("Saving {} modified session(s)", sessions.len());

        tokio::spawn(async move {
            let results = join_all(sessions.iter().map(|s| s.save())).await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            let _ = reply.send(SaveAllReport {
                saved: results.len() - failed,
                failed,
            });
        });
    }

    fn close_all(&mut self, reply: Reply<()>) {
        let open_files: Vec<PathBuf> = self.sessions.keys().cloned().collect();
        self.emit(ManagerEvent::Closing { open_files });

        let modified: Vec<EditorSession> = self
            .sessions
            .values()
            .map(|o| o.session.clone())
            .filter(EditorSession::is_modified)
            .collect();
        for session in modified {
            session.close();
        }

        // Queued behind the notifications raised by the closes above.
        let (tx, rx) = oneshot::channel();
        let queued = self
            .self_tx
            .upgrade()
            .is_some_and(|self_tx| self_tx.send(Command::FinishCloseAll(tx)).is_ok());
        if queued {
            tokio::spawn(async move {
                let _ = rx.await;
                let _ = reply.send(());
            });
        } else {
            let _ = reply.send(());
        }
    }
}

/// Pushes a saved session's result into a preview without replacing the
/// preview's diagram.
fn sync_preview(preview: &PreviewEntry, session: &EditorSession) {
    if !DiagramHandle::ptr_eq(preview.diagram(), session.diagram()) {
        let saved = session.diagram().snapshot();
        preview.diagram().write().copy_from(&saved);
    }
    preview.set_thumbnail(session.image());
}
