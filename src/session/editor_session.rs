//! One open diagram: live preview, auto-save and the save pipeline.

use crate::compiler::{CompileError, CompileOutput, Compiler};
use crate::config::AppConfig;
use crate::constants::{DEFAULT_AUTO_SAVE_INTERVAL, REFRESH_DEBOUNCE};
use crate::diagram::{
    image_file_for, normalize_leading_whitespace, DiagramError, DiagramHandle, Image, ImageFormat,
};
use crate::editor::{CodeEditor, EditorFactory};
use crate::io::{DiagramIo, IoError};
use crate::signal::{HandlerId, Signal};
use crate::timer::{ElapsedHandler, Timer, TimerFactory};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("Diagram has {} error(s)", .0.len())]
    Diagram(Vec<DiagramError>),
    #[error("Session used after it was disposed")]
    Disposed,
}

/// How a refresh ended. Only I/O and renderer failures are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The rendered image replaced the held one.
    Applied,
    /// The renderer reported diagram errors; the held image is unchanged.
    Rejected(Vec<DiagramError>),
    /// A newer refresh or a save superseded this one.
    Cancelled,
    /// A save was in flight, so no refresh was started.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Busy,
}

/// Per-session tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub auto_save_enabled: bool,
    pub auto_save_interval: Duration,
    pub refresh_debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_save_enabled: false,
            auto_save_interval: DEFAULT_AUTO_SAVE_INTERVAL,
            refresh_debounce: REFRESH_DEBOUNCE,
        }
    }
}

impl From<&AppConfig> for SessionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            auto_save_enabled: config.auto_save_enabled,
            auto_save_interval: config.auto_save_interval(),
            refresh_debounce: config.refresh_debounce(),
        }
    }
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionServices {
    pub compiler: Arc<dyn Compiler>,
    pub io: Arc<dyn DiagramIo>,
    pub timers: Arc<dyn TimerFactory>,
    pub editors: Arc<dyn EditorFactory>,
}

/// Payload of the cancelable `closing` notification.
pub struct CloseRequest {
    diagram: DiagramHandle,
    cancelled: AtomicBool,
}

impl CloseRequest {
    pub fn diagram(&self) -> &DiagramHandle {
        &self.diagram
    }

    /// Vetoes the close. The session keeps running unchanged.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct State {
    status: SessionStatus,
    saving: bool,
    auto_save_enabled: bool,
    image_format: ImageFormat,
    image: Option<Image>,
    refreshes: HashMap<u64, CancellationToken>,
    next_refresh_id: u64,
    backup_pending: bool,
    closed: bool,
    last_errors: Vec<DiagramError>,
}

impl State {
    fn cancel_refreshes(&mut self) {
        for (_, token) in self.refreshes.drain() {
            token.cancel();
        }
    }
}

struct Inner {
    diagram: DiagramHandle,
    editor: Arc<dyn CodeEditor>,
    compiler: Arc<dyn Compiler>,
    io: Arc<dyn DiagramIo>,
    auto_save_timer: Box<dyn Timer>,
    refresh_timer: Box<dyn Timer>,
    state: Mutex<State>,
    editor_handlers: Mutex<Vec<HandlerId>>,
    saved: Signal<DiagramHandle>,
    closing: Signal<CloseRequest>,
    closed: Signal<DiagramHandle>,
    disposed: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !*self.disposed.get_mut() {
            self.editor.close();
        }
    }
}

/// Editing session for one open diagram. Cloning yields another handle to
/// the same session.
#[derive(Clone)]
pub struct EditorSession {
    inner: Arc<Inner>,
}

/// Returns a session to idle however the save future ends, including when
/// it is dropped mid-flight.
struct SaveGuard<'a>(&'a Inner);

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        {
            let mut st = self.0.lock();
            st.saving = false;
            st.status = SessionStatus::Idle;
        }
        self.0.refresh_timer.stop();
    }
}

fn spawn_on_elapsed<F, Fut>(weak: Weak<Inner>, action: F) -> ElapsedHandler
where
    F: Fn(EditorSession) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move || {
        if let Some(inner) = weak.upgrade() {
            tokio::spawn(action(EditorSession { inner }));
        }
    })
}

impl EditorSession {
    /// Opens a session on `diagram`, showing `image` until the first refresh.
    pub fn open(
        diagram: DiagramHandle,
        image: Option<Image>,
        config: &SessionConfig,
        services: &SessionServices,
    ) -> Self {
        let (editor, image_format) = {
            let d = diagram.read();
            (services.editors.create(&d), d.image_format)
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let auto_save = spawn_on_elapsed(weak.clone(), |session| async move {
                tracing::debug!("Auto-save elapsed for {:?}", session.path());
                if let Err(e) = session.save().await {
                    tracing::warn!("Auto-save of {:?} failed: {}", session.path(), e);
                }
            });
            let refresh = spawn_on_elapsed(weak.clone(), |session| async move {
                if let Err(e) = session.refresh().await {
                    tracing::warn!("Preview refresh of {:?} failed: {}", session.path(), e);
                }
            });

            Inner {
                diagram,
                editor,
                compiler: services.compiler.clone(),
                io: services.io.clone(),
                auto_save_timer: services.timers.create(config.auto_save_interval, auto_save),
                refresh_timer: services.timers.create(config.refresh_debounce, refresh),
                state: Mutex::new(State {
                    status: SessionStatus::Idle,
                    saving: false,
                    auto_save_enabled: config.auto_save_enabled,
                    image_format,
                    image,
                    refreshes: HashMap::new(),
                    next_refresh_id: 0,
                    backup_pending: true,
                    closed: false,
                    last_errors: Vec::new(),
                }),
                editor_handlers: Mutex::new(Vec::new()),
                saved: Signal::new(),
                closing: Signal::new(),
                closed: Signal::new(),
                disposed: AtomicBool::new(false),
            }
        });

        let session = Self { inner };
        session.connect_editor();
        if config.auto_save_enabled && session.inner.editor.is_modified() {
            session.inner.auto_save_timer.start();
        }
        tracing::info!("Opened editor session for {:?}", session.path());
        session
    }

    fn connect_editor(&self) {
        let weak = Arc::downgrade(&self.inner);
        let changed = self.inner.editor.connect_changed(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.refresh_timer.restart();
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        let modified = self
            .inner
            .editor
            .connect_modified_changed(Box::new(move |modified| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !modified {
                    inner.auto_save_timer.stop();
                } else if inner.lock().auto_save_enabled {
                    inner.auto_save_timer.start();
                }
            }));

        self.inner
            .editor_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([changed, modified]);
    }

    pub fn diagram(&self) -> &DiagramHandle {
        &self.inner.diagram
    }

    pub fn path(&self) -> &std::path::Path {
        self.inner.diagram.path()
    }

    pub fn editor(&self) -> &Arc<dyn CodeEditor> {
        &self.inner.editor
    }

    pub fn image(&self) -> Option<Image> {
        self.inner.lock().image.clone()
    }

    pub fn image_format(&self) -> ImageFormat {
        self.inner.lock().image_format
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    pub fn is_idle(&self) -> bool {
        self.status() == SessionStatus::Idle
    }

    pub fn is_modified(&self) -> bool {
        self.inner.editor.is_modified()
    }

    pub fn can_save(&self) -> bool {
        !self.is_disposed() && self.is_idle() && self.is_modified()
    }

    pub fn can_refresh(&self) -> bool {
        !self.is_disposed() && self.is_idle()
    }

    pub fn can_close(&self) -> bool {
        !self.is_disposed() && self.is_idle()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn auto_save_enabled(&self) -> bool {
        self.inner.lock().auto_save_enabled
    }

    pub fn auto_save_interval(&self) -> Duration {
        self.inner.auto_save_timer.interval()
    }

    pub fn is_auto_save_armed(&self) -> bool {
        self.inner.auto_save_timer.is_started()
    }

    pub fn is_refresh_pending(&self) -> bool {
        self.inner.refresh_timer.is_started()
    }

    /// Number of refreshes currently waiting on the renderer.
    pub fn refreshes_in_flight(&self) -> usize {
        self.inner.lock().refreshes.len()
    }

    /// Diagram errors from the most recent refresh or save.
    pub fn last_errors(&self) -> Vec<DiagramError> {
        self.inner.lock().last_errors.clone()
    }

    pub fn connect_saved<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&DiagramHandle) + Send + Sync + 'static,
    {
        self.inner.saved.connect(handler)
    }

    pub fn connect_closing<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CloseRequest) + Send + Sync + 'static,
    {
        self.inner.closing.connect(handler)
    }

    pub fn connect_closed<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&DiagramHandle) + Send + Sync + 'static,
    {
        self.inner.closed.connect(handler)
    }

    pub fn disconnect(&self, id: HandlerId) {
        let _ = self.inner.saved.disconnect(id)
            || self.inner.closing.disconnect(id)
            || self.inner.closed.disconnect(id);
    }

    pub fn set_auto_save(&self, enabled: bool, interval: Duration) {
        self.inner.lock().auto_save_enabled = enabled;

        let timer = &self.inner.auto_save_timer;
        let interval_changed = timer.interval() != interval;
        timer.set_interval(interval);

        if !enabled {
            timer.stop();
        } else if timer.is_started() {
            if interval_changed {
                timer.restart();
            }
        } else if self.inner.editor.is_modified() {
            timer.start();
        }
    }

    /// Persists the editor text and renders the image file.
    ///
    /// Returns immediately with `Ok(())` if a save is already running.
    pub async fn save(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        {
            let mut st = self.inner.lock();
            if st.saving {
                tracing::debug!("Save of {:?} already in flight", self.path());
                return Ok(());
            }
            st.saving = true;
            st.status = SessionStatus::Busy;
            st.cancel_refreshes();
        }
        let saved_format = {
            let _guard = SaveGuard(&self.inner);
            self.inner.auto_save_timer.stop();

            match self.run_save().await {
                Ok(format) => {
                    tracing::info!("Saved {:?}", self.path());
                    self.inner.saved.emit(&self.inner.diagram);
                    format
                }
                Err(e) => {
                    tracing::error!("Failed to save {:?}: {}", self.path(), e);
                    return Err(e);
                }
            }
        };

        // A format switch during the save was skipped by its refresh.
        if self.image_format() != saved_format {
            if let Err(e) = self.refresh().await {
                tracing::warn!("Re-render of {:?} after save failed: {}", self.path(), e);
            }
        }
        Ok(())
    }

    /// Returns the image format the save rendered.
    async fn run_save(&self) -> Result<ImageFormat, SessionError> {
        let inner = &self.inner;

        let mut text = inner.editor.text();
        if let Some(normalized) = normalize_leading_whitespace(&text) {
            inner.editor.set_text(&normalized);
            text = normalized;
        }

        let (format, make_backup) = {
            let mut st = inner.lock();
            (st.image_format, std::mem::take(&mut st.backup_pending))
        };
        let snapshot = {
            let mut d = inner.diagram.write();
            d.content.clone_from(&text);
            d.image_file = image_file_for(d.path(), &d.content, format);
            d.clone()
        };

        inner.io.save(&snapshot, make_backup).await?;
        if let Err(e) = inner.compiler.compile_to_file(snapshot.path(), format).await {
            return Err(match e {
                CompileError::Diagram(errors) => {
                    inner.lock().last_errors.clone_from(&errors);
                    inner.diagram.write().errors.clone_from(&errors);
                    SessionError::Diagram(errors)
                }
                other => other.into(),
            });
        }
        let image = inner.io.read_image(&snapshot.image_file, format).await?;

        {
            let mut st = inner.lock();
            st.image = Some(image);
            st.last_errors.clear();
        }
        {
            let mut d = inner.diagram.write();
            d.image_format = format;
            d.errors.clear();
        }
        // Edits made while the save was running stay unsaved.
        if inner.editor.text() == text {
            inner.editor.set_modified(false);
        }
        Ok(format)
    }

    /// Renders the current editor text and, unless superseded, replaces the
    /// held image with the result.
    pub async fn refresh(&self) -> Result<RefreshOutcome, SessionError> {
        self.ensure_live()?;
        let (id, token, format) = {
            let mut st = self.inner.lock();
            if st.saving {
                return Ok(RefreshOutcome::Skipped);
            }
            st.cancel_refreshes();
            st.next_refresh_id += 1;
            let id = st.next_refresh_id;
            let token = CancellationToken::new();
            st.refreshes.insert(id, token.clone());
            (id, token, st.image_format)
        };

        let text = self.inner.editor.text();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(CompileError::Cancelled),
            res = self.inner.compiler.compile_to_image(&text, format, token.clone()) => res,
        };

        // Cancellation happens under this lock, so a token checked here
        // cannot be cancelled between the check and applying the image.
        let mut st = self.inner.lock();
        st.refreshes.remove(&id);
        if token.is_cancelled() {
            tracing::debug!("Discarding superseded refresh #{} of {:?}", id, self.path());
            return Ok(RefreshOutcome::Cancelled);
        }

        match result {
            Ok(CompileOutput {
                image: Some(image),
                errors,
            }) if errors.is_empty() => {
                st.image = Some(image);
                st.last_errors.clear();
                drop(st);
                self.inner.diagram.write().errors.clear();
                Ok(RefreshOutcome::Applied)
            }
            Ok(CompileOutput { errors, .. }) if !errors.is_empty() => {
                st.last_errors.clone_from(&errors);
                drop(st);
                tracing::debug!("{:?} has {} diagram error(s)", self.path(), errors.len());
                self.inner.diagram.write().errors.clone_from(&errors);
                Ok(RefreshOutcome::Rejected(errors))
            }
            Ok(_) => Err(CompileError::Failed("renderer produced no image".to_string()).into()),
            Err(CompileError::Cancelled) => Ok(RefreshOutcome::Cancelled),
            Err(e) => {
                tracing::warn!("Preview refresh of {:?} failed: {}", self.path(), e);
                Err(e.into())
            }
        }
    }

    /// Switches the output format and re-renders in it.
    pub async fn set_image_format(&self, format: ImageFormat) -> Result<RefreshOutcome, SessionError> {
        self.ensure_live()?;
        self.inner.lock().image_format = format;
        self.refresh().await
    }

    /// Raises `closing`; unless a handler cancels, stops both timers and
    /// raises `closed`. Returns whether the session closed.
    pub fn close(&self) -> bool {
        let request = CloseRequest {
            diagram: self.inner.diagram.clone(),
            cancelled: AtomicBool::new(false),
        };
        self.inner.closing.emit(&request);
        if request.is_cancelled() {
            tracing::debug!("Close of {:?} was cancelled", self.path());
            return false;
        }

        self.inner.auto_save_timer.stop();
        self.inner.refresh_timer.stop();
        self.inner.lock().closed = true;
        self.inner.closed.emit(&self.inner.diagram);
        tracing::info!("Closed editor session for {:?}", self.path());
        true
    }

    /// Stops both timers, cancels refreshes and releases the editor. Safe
    /// to call more than once.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.auto_save_timer.stop();
        self.inner.refresh_timer.stop();
        self.inner.lock().cancel_refreshes();

        let handlers = std::mem::take(
            &mut *self
                .inner
                .editor_handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in handlers {
            self.inner.editor.disconnect(id);
        }
        self.inner.editor.close();
        tracing::debug!("Disposed editor session for {:?}", self.path());
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.is_disposed() {
            tracing::error!("Editor session for {:?} used after dispose", self.path());
            return Err(SessionError::Disposed);
        }
        Ok(())
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for EditorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditorSession")
            .field("path", &self.path())
            .field("status", &self.status())
            .finish()
    }
}
