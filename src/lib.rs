pub mod compiler;
pub mod config;
pub mod constants;
pub mod diagram;
pub mod editor;
pub mod io;
pub mod preview;
pub mod session;
pub mod signal;
pub mod timer;

#[cfg(test)]
mod testing;
