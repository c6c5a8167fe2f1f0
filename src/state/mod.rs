//! State module for run lifecycle and pagination progress
//!
//! # Components
//!
//! - `RunMode`: NEW_SCAN or BACKFILL
//! - `RunStatus`: the run state machine (`Running` plus three terminal states)
//! - `LogLevel`: severity of run log entries
//! - `Cursor`: per-mode pagination position that survives process restarts

mod cursor;
mod run_state;

// Re-export main types
pub use cursor::Cursor;
pub use run_state::{LogLevel, RunMode, RunStatus};
