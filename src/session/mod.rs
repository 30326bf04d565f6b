//! Editing sessions and the manager that owns them.

pub mod editor_session;
pub mod manager;

pub use editor_session::{
    CloseRequest, EditorSession, RefreshOutcome, SessionConfig, SessionError, SessionServices,
    SessionStatus,
};
pub use manager::{ManagerError, ManagerEvent, SaveAllReport, SessionManager};
