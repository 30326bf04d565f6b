//! Timings, file conventions and channel sizes for puml-studio.
//!
//! Values here are defaults; the ones a user can tune are mirrored in
//! [`crate::config::AppConfig`].

use std::time::Duration;

// ============================================================================
// Application Identity
// ============================================================================

/// Application name, also used as the config directory name.
pub const APP_NAME: &str = "puml-studio";

/// Config file name inside the application config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

// ============================================================================
// Editor Session
// ============================================================================

/// Quiet period after the last edit before the live preview is recompiled.
pub const REFRESH_DEBOUNCE: Duration = Duration::from_millis(400);

/// Default auto-save interval when auto-save is enabled.
pub const DEFAULT_AUTO_SAVE_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Diagram Files
// ============================================================================

/// Extension appended to new diagrams that are created without one.
pub const DEFAULT_EXTENSION: &str = "puml";

/// File extensions recognised as diagram sources when enumerating a directory.
pub const DIAGRAM_EXTENSIONS: &[&str] = &["puml", "plantuml", "pu", "iuml"];

/// Extension used for the backup copy taken on the first save of a session.
pub const BACKUP_EXTENSION: &str = "bak";

/// Starter content for diagrams created through the preview list.
/// `{name}` is replaced with the new file's stem.
pub const NEW_DIAGRAM_TEMPLATE: &str = "\n@startuml {name}\n\ntitle {name}\n\nAlice -> Bob : hello\n\n@enduml\n";

// ============================================================================
// Previews
// ============================================================================

/// Number of non-empty lines kept in a preview excerpt.
pub const EXCERPT_MAX_LINES: usize = 5;

/// Maximum characters kept per excerpt line.
pub const EXCERPT_MAX_LINE_CHARS: usize = 80;

// ============================================================================
// PlantUML Compilation
// ============================================================================

/// Default command used to invoke PlantUML.
pub const DEFAULT_PLANTUML_COMMAND: &str = "plantuml";

/// Timeout for a single PlantUML invocation.
/// Prevents hung processes from blocking a session forever.
pub const COMPILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum accepted diagram size in bytes (5 MB).
pub const MAX_DIAGRAM_SIZE_BYTES: usize = 5 * 1024 * 1024;

// ============================================================================
// Actor Channels
// ============================================================================

/// Buffer size for actor command channels.
pub const COMMAND_CHANNEL_BUFFER: usize = 64;

/// Capacity of the broadcast channels used for outgoing notifications.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;
