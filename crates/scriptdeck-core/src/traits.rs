//! Core traits for storage and process execution.

use std::{io, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    ProcessHandle,
    context::CommandSpec,
    script::{HistoryEntry, ScriptDefinition},
};

/// Session identifier.
pub type SessionId = Uuid;

/// Execution session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Registered, process not yet started.
    Created,
    /// Process is running and its output is being streamed.
    Running,
    /// Process exited, whatever its exit code.
    Completed,
    /// Process could not be started.
    Failed,
    /// Run was cancelled by a caller or by transport loss.
    Cancelled,
}

impl SessionStatus {
    /// Whether no further events can follow this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Script not found: {0}")]
    NotFound(String),
    #[error("Script already exists: {0}")]
    Conflict(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Persistence of script definitions.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Look up a script by (trimmed) name.
    async fn get_script(&self, name: &str) -> Result<Option<ScriptDefinition>, StorageError>;

    /// All scripts, ordered by category then name.
    async fn list_scripts(&self) -> Result<Vec<ScriptDefinition>, StorageError>;

    /// Insert or replace a script keyed by its name.
    async fn save_script(&self, script: ScriptDefinition) -> Result<(), StorageError>;

    /// Delete a script. Returns whether it existed.
    async fn delete_script(&self, name: &str) -> Result<bool, StorageError>;

    /// Rename `old_name` to `updated.name`, replacing its attributes.
    ///
    /// History recorded under the old name follows the script.
    async fn rename_script(
        &self,
        old_name: &str,
        updated: ScriptDefinition,
    ) -> Result<(), StorageError>;

    /// Distinct categories, sorted.
    async fn categories(&self) -> Result<Vec<String>, StorageError>;
}

/// Per-script run history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Record a run of `script_name`.
    async fn append_history(
        &self,
        script_name: &str,
        entry: HistoryEntry,
    ) -> Result<(), StorageError>;

    /// History for `script_name`, most recent first.
    async fn history(&self, script_name: &str) -> Result<Vec<HistoryEntry>, StorageError>;
}

/// Reasons a process could not be started.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Command not found: {0}")]
    NotFound(String),
    #[error("Working directory {path} is not usable: {reason}")]
    WorkingDirectory { path: PathBuf, reason: String },
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Script body is empty")]
    EmptyBody,
    #[error("Failed to start process: {0}")]
    Resource(#[from] io::Error),
}

/// Starts processes for execution sessions.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Spawn `command` in its own process group.
    ///
    /// Must fail before producing any output when the working directory is
    /// unusable.
    async fn start(&self, command: &CommandSpec) -> Result<ProcessHandle, SpawnError>;
}
