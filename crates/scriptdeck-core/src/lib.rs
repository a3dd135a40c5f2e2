//! Core abstractions for streaming script execution.
//!
//! This crate provides the fundamental building blocks:
//! - `RunRequest` / `CommandSpec` - What to run and where
//! - `RunEvent` - Tagged output events and terminal markers
//! - `ProcessHandle` - A spawned process group with merged pipes
//! - Script store, history store and process runner traits

pub mod config;
pub mod context;
pub mod event;
pub mod process;
pub mod script;
pub mod text;
pub mod traits;

pub use config::{ConfigError, EngineConfig, HistoryPolicy};
pub use context::{CommandSpec, RunRequest};
pub use event::{EventKind, RunEvent};
pub use process::{ExitOutcome, OutputStream, ProcessHandle, StreamKind};
pub use script::{HistoryEntry, ScriptDefinition};
pub use text::Utf8Chunker;
pub use traits::{
    HistoryStore, ProcessRunner, ScriptStore, SessionId, SessionStatus, SpawnError, StorageError,
};
