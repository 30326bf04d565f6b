//! The browsable list of diagrams in a directory.

pub mod entry;
pub mod loader;

pub use entry::{excerpt, PreviewEntry};
pub use loader::{LoadOutcome, LoadSummary, LoaderError, LoaderEvent, PreviewLoader};
