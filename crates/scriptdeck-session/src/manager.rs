//! Run coordinator: resolves requests, owns active sessions and the last
//! result.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use scriptdeck_core::{
    CommandSpec, EngineConfig, HistoryEntry, HistoryPolicy, HistoryStore, ProcessRunner,
    RunEvent, RunRequest, ScriptDefinition, ScriptStore, SessionId, SessionStatus, StorageError,
    script::now_millis,
};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::{ExecutionSession, SessionOutcome, StatusCell};

/// Coordinator error.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Script not found: {0}")]
    ScriptNotFound(String),
    #[error("Either a script name or a script body is required")]
    EmptyRequest,
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The running process is being stopped.
    Cancelled,
    /// The process hadn't started yet; the run goes ahead.
    NotStarted,
}

/// A started run: its id and the ordered event stream.
///
/// Dropping `events` cancels the run.
#[derive(Debug)]
pub struct RunHandle {
    pub session_id: SessionId,
    pub events: ReceiverStream<RunEvent>,
}

/// Snapshot of a registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveRun {
    pub session_id: SessionId,
    pub script_name: Option<String>,
    pub status: SessionStatus,
    /// Unix epoch milliseconds.
    pub started_at: i64,
}

/// Active session state.
struct ActiveSession {
    script_name: Option<String>,
    status: StatusCell,
    cancel: CancellationToken,
    started_at: i64,
}

struct Inner<S, R> {
    storage: S,
    runner: R,
    config: EngineConfig,
    last_result: RwLock<String>,
    active_sessions: RwLock<HashMap<SessionId, ActiveSession>>,
}

/// Starts runs, tracks them by session id and records what they produced.
///
/// Cheap to clone; clones share state.
pub struct RunCoordinator<S, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for RunCoordinator<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A request resolved to something runnable.
struct Resolved {
    command: CommandSpec,
    history_key: Option<String>,
}

impl<S, R> RunCoordinator<S, R>
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    /// Create a new coordinator.
    #[must_use]
    pub fn new(storage: S, runner: R, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                runner,
                config,
                last_result: RwLock::new(String::new()),
                active_sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start a run.
    ///
    /// The returned stream yields output and error events in production
    /// order and ends with exactly one `done` or `cancelled` event. History
    /// and the last result are updated before that terminal event is sent.
    ///
    /// # Errors
    /// Returns error if the request names no script and carries no body, or
    /// names a script that doesn't exist without supplying a body.
    pub async fn run(&self, request: RunRequest) -> Result<RunHandle, CoordinatorError> {
        let resolved = match self.resolve(&request).await {
            Ok(resolved) => resolved,
            Err(CoordinatorError::ScriptNotFound(name)) => {
                let config = &self.inner.config;
                if config.history_policy == HistoryPolicy::RequestedName {
                    let dir = request.effective_working_dir(None, &config.default_working_dir);
                    self.record_history(&name, &request.arguments, dir).await;
                }
                return Err(CoordinatorError::ScriptNotFound(name));
            }
            Err(err) => return Err(err),
        };

        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.config.event_buffer.max(1));
        let cancel = CancellationToken::new();
        let session = ExecutionSession::new(session_id, tx, cancel.clone());

        self.inner.active_sessions.write().await.insert(
            session_id,
            ActiveSession {
                script_name: resolved.history_key.clone(),
                status: session.status_cell(),
                cancel,
                started_at: now_millis(),
            },
        );

        tracing::info!(
            %session_id,
            script = resolved.history_key.as_deref().unwrap_or("<inline>"),
            working_dir = %resolved.command.working_dir.display(),
            "Starting script run"
        );

        let coordinator = self.clone();
        tokio::spawn(async move {
            let Resolved {
                command,
                history_key,
            } = resolved;
            let finished = session
                .execute(
                    &coordinator.inner.runner,
                    &command,
                    coordinator.inner.config.terminate_grace(),
                )
                .await;
            coordinator
                .finalize(session_id, history_key.as_deref(), &command, finished.outcome())
                .await;
            finished.close().await;
        });

        Ok(RunHandle {
            session_id,
            events: ReceiverStream::new(rx),
        })
    }

    async fn resolve(&self, request: &RunRequest) -> Result<Resolved, CoordinatorError> {
        let name = request.requested_name();
        let fallback = &self.inner.config.default_working_dir;

        let script: Option<ScriptDefinition> = match name {
            Some(name) => self.inner.storage.get_script(name).await?,
            None => None,
        };

        let body = match (request.inline_body(), &script, name) {
            (Some(body), _, _) => body.to_string(),
            (None, Some(script), _) => script.body.clone(),
            (None, None, Some(name)) => {
                return Err(CoordinatorError::ScriptNotFound(name.to_string()));
            }
            (None, None, None) => return Err(CoordinatorError::EmptyRequest),
        };

        let history_key = match self.inner.config.history_policy {
            HistoryPolicy::ResolvedOnly => script.as_ref().map(|s| s.name.clone()),
            HistoryPolicy::RequestedName => name.map(str::to_string),
        };

        let mut command = CommandSpec::new(
            body,
            request.effective_working_dir(script.as_ref(), fallback),
        )
        .with_arguments(request.arguments.clone());
        if let Some(name) = name {
            command = command.with_script_name(name);
        }

        Ok(Resolved {
            command,
            history_key,
        })
    }

    /// Record what a finished session produced and forget it.
    async fn finalize(
        &self,
        session_id: SessionId,
        history_key: Option<&str>,
        command: &CommandSpec,
        outcome: &SessionOutcome,
    ) {
        if let Some(name) = history_key {
            self.record_history(name, &command.arguments, command.working_dir.clone())
                .await;
        }

        let result = if outcome.status == SessionStatus::Failed {
            outcome.error.clone()
        } else {
            outcome.output.clone()
        };
        *self.inner.last_result.write().await = result;

        self.inner.active_sessions.write().await.remove(&session_id);

        tracing::info!(
            %session_id,
            script = history_key.unwrap_or("<inline>"),
            status = ?outcome.status,
            exit = ?outcome.exit,
            "Script run finished"
        );
    }

    async fn record_history(&self, name: &str, arguments: &str, working_dir: PathBuf) {
        let entry = HistoryEntry::now(arguments, working_dir);
        if let Err(err) = self.inner.storage.append_history(name, entry).await {
            tracing::warn!(script = name, %err, "Failed to record run history");
        }
    }

    /// Cancel a running session.
    ///
    /// Cancelling a session that hasn't started its process yet does nothing
    /// and reports [`CancelOutcome::NotStarted`].
    ///
    /// # Errors
    /// Returns error if no such session is registered or it already finished.
    pub async fn cancel(&self, session_id: SessionId) -> Result<CancelOutcome, CoordinatorError> {
        let sessions = self.inner.active_sessions.read().await;
        let session = sessions
            .get(&session_id)
            .ok_or(CoordinatorError::SessionNotFound(session_id))?;

        match session.status.get() {
            SessionStatus::Running => {
                tracing::info!(%session_id, "Cancel requested");
                session.cancel.cancel();
                Ok(CancelOutcome::Cancelled)
            }
            SessionStatus::Created => {
                tracing::debug!(%session_id, "Cancel requested before start, ignoring");
                Ok(CancelOutcome::NotStarted)
            }
            _ => Err(CoordinatorError::SessionNotFound(session_id)),
        }
    }

    /// Output of the most recently finished run.
    pub async fn get_last_result(&self) -> String {
        self.inner.last_result.read().await.clone()
    }

    /// History for `script_name`, most recent first.
    ///
    /// # Errors
    /// Returns error if the history store fails.
    pub async fn get_history(&self, script_name: &str) -> Result<Vec<HistoryEntry>, CoordinatorError> {
        Ok(self.inner.storage.history(script_name).await?)
    }

    /// Sessions that haven't finished yet, oldest first.
    pub async fn active_runs(&self) -> Vec<ActiveRun> {
        let mut runs: Vec<ActiveRun> = self
            .inner
            .active_sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| ActiveRun {
                session_id: *id,
                script_name: s.script_name.clone(),
                status: s.status.get(),
                started_at: s.started_at,
            })
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    /// Cancel every registered session.
    pub async fn shutdown(&self) {
        let sessions = self.inner.active_sessions.read().await;
        tracing::info!(count = sessions.len(), "Cancelling active runs");
        for session in sessions.values() {
            session.cancel.cancel();
        }
    }
}
