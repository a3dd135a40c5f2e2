//! A single script run, from spawn to terminal event.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::StreamExt;
use scriptdeck_core::{
    CommandSpec, ExitOutcome, OutputStream, ProcessHandle, ProcessRunner, RunEvent, SessionId,
    SessionStatus, StreamKind, Utf8Chunker,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Status shared between a running session and its coordinator.
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<Mutex<SessionStatus>>);

impl StatusCell {
    #[must_use]
    pub fn new(status: SessionStatus) -> Self {
        Self(Arc::new(Mutex::new(status)))
    }

    #[must_use]
    pub fn get(&self) -> SessionStatus {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, status: SessionStatus) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    /// Concatenation of every `output` payload delivered to the consumer.
    pub output: String,
    /// Concatenation of every `error` payload delivered, or the spawn
    /// failure text.
    pub error: String,
    pub exit: Option<ExitOutcome>,
}

/// Why streaming stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Disconnected,
}

/// One execution of a script.
///
/// Events go out through a bounded queue; when the consumer falls behind the
/// session waits for room, still listening for cancellation. Dropping the
/// receiving end counts as a cancel.
pub struct ExecutionSession {
    id: SessionId,
    status: StatusCell,
    events: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
    output: String,
    error: String,
}

impl ExecutionSession {
    /// Create a session in the `Created` state.
    #[must_use]
    pub fn new(id: SessionId, events: mpsc::Sender<RunEvent>, cancel: CancellationToken) -> Self {
        Self {
            id,
            status: StatusCell::new(SessionStatus::Created),
            events,
            cancel,
            output: String::new(),
            error: String::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Handle for observing the status from elsewhere.
    #[must_use]
    pub fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    /// Token that cancels this session.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the process and stream its output until it exits or the run is
    /// cancelled.
    ///
    /// The terminal event is not sent yet; call [`FinishedSession::close`]
    /// once the outcome has been recorded.
    pub async fn execute<R>(
        mut self,
        runner: &R,
        command: &CommandSpec,
        grace: Duration,
    ) -> FinishedSession
    where
        R: ProcessRunner + ?Sized,
    {
        let mut process = match runner.start(command).await {
            Ok(process) => process,
            Err(err) => {
                tracing::warn!(session_id = %self.id, %err, "Failed to start script");
                let message = err.to_string();
                // Delivery is best effort; the failure text is kept regardless.
                let _ = self.deliver(RunEvent::Error(message.clone())).await;
                self.error = message;
                return self.finish(SessionStatus::Failed, None);
            }
        };

        self.status.set(SessionStatus::Running);
        tracing::debug!(session_id = %self.id, pid = ?process.pid(), "Script running");

        let mut output = process.take_output();
        if let Some(reason) = self.stream_output(&mut output).await {
            return self.interrupt(process, output, reason, grace).await;
        }

        let exit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            () = self.events.closed() => Err(Interrupt::Disconnected),
            exit = process.wait() => Ok(exit),
        };

        match exit {
            Ok(Ok(exit)) => {
                if !exit.success() {
                    if let Err(reason) = self.deliver(RunEvent::Error(exit.to_string())).await {
                        return self.interrupt(process, output, reason, grace).await;
                    }
                }
                self.finish(SessionStatus::Completed, Some(exit))
            }
            Ok(Err(err)) => {
                let _ = self
                    .deliver(RunEvent::Error(format!("Failed to wait for process: {err}")))
                    .await;
                self.finish(SessionStatus::Completed, None)
            }
            Err(reason) => self.interrupt(process, output, reason, grace).await,
        }
    }

    /// Forward both pipes until EOF. Returns the interruption, if any.
    async fn stream_output(&mut self, output: &mut OutputStream) -> Option<Interrupt> {
        let mut stdout_text = Utf8Chunker::new();
        let mut stderr_text = Utf8Chunker::new();

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Some(Interrupt::Cancelled),
                () = self.events.closed() => return Some(Interrupt::Disconnected),
                next = output.next() => next,
            };

            let event = match next {
                Some((StreamKind::Stdout, Ok(chunk))) => RunEvent::Output(stdout_text.push(&chunk)),
                Some((StreamKind::Stderr, Ok(chunk))) => RunEvent::Error(stderr_text.push(&chunk)),
                Some((kind, Err(err))) => {
                    RunEvent::Error(format!("Failed to read {kind:?}: {err}"))
                }
                None => break,
            };
            if event.payload().is_empty() {
                continue;
            }
            if let Err(reason) = self.deliver(event).await {
                return Some(reason);
            }
        }

        for event in [
            RunEvent::Output(stdout_text.finish()),
            RunEvent::Error(stderr_text.finish()),
        ] {
            if event.payload().is_empty() {
                continue;
            }
            if let Err(reason) = self.deliver(event).await {
                return Some(reason);
            }
        }
        None
    }

    /// Queue one event, recording it as delivered once a slot is reserved.
    async fn deliver(&mut self, event: RunEvent) -> Result<(), Interrupt> {
        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Interrupt::Cancelled),
            permit = self.events.reserve() => permit.map_err(|_| Interrupt::Disconnected)?,
        };
        match &event {
            RunEvent::Output(text) => self.output.push_str(text),
            RunEvent::Error(text) => self.error.push_str(text),
            RunEvent::Done | RunEvent::Cancelled => {}
        }
        permit.send(event);
        Ok(())
    }

    async fn interrupt(
        self,
        mut process: ProcessHandle,
        output: OutputStream,
        reason: Interrupt,
        grace: Duration,
    ) -> FinishedSession {
        match reason {
            Interrupt::Cancelled => tracing::info!(session_id = %self.id, "Cancelling script"),
            Interrupt::Disconnected => {
                tracing::info!(session_id = %self.id, "Caller disconnected, cancelling script");
            }
        }
        // Late bytes are discarded with the pipes.
        drop(output);
        if let Err(err) = process.terminate(grace).await {
            tracing::warn!(session_id = %self.id, %err, "Failed to terminate script");
        }
        let exit = process.exit();
        self.finish(SessionStatus::Cancelled, exit)
    }

    fn finish(self, status: SessionStatus, exit: Option<ExitOutcome>) -> FinishedSession {
        self.status.set(status);
        FinishedSession {
            id: self.id,
            events: self.events,
            outcome: SessionOutcome {
                status,
                output: self.output,
                error: self.error,
                exit,
            },
        }
    }
}

/// A session in a terminal state whose terminal event is still pending.
pub struct FinishedSession {
    id: SessionId,
    events: mpsc::Sender<RunEvent>,
    outcome: SessionOutcome,
}

impl FinishedSession {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn outcome(&self) -> &SessionOutcome {
        &self.outcome
    }

    /// Send the terminal event and release the queue.
    pub async fn close(self) -> SessionOutcome {
        let terminal = match self.outcome.status {
            SessionStatus::Cancelled => RunEvent::Cancelled,
            _ => RunEvent::Done,
        };
        // A departed consumer has nothing left to receive.
        let _ = self.events.send(terminal).await;
        self.outcome
    }
}

#[cfg(all(test, unix))]
mod tests {
    use async_trait::async_trait;
    use scriptdeck_core::SpawnError;
    use scriptdeck_executor::ShellRunner;
    use uuid::Uuid;

    use super::*;

    const GRACE: Duration = Duration::from_millis(500);

    struct FailingRunner;

    #[async_trait]
    impl ProcessRunner for FailingRunner {
        async fn start(&self, _command: &CommandSpec) -> Result<ProcessHandle, SpawnError> {
            Err(SpawnError::NotFound("bash".into()))
        }
    }

    fn session() -> (ExecutionSession, mpsc::Receiver<RunEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        (ExecutionSession::new(Uuid::new_v4(), tx, token.clone()), rx, token)
    }

    async fn drain(mut rx: mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn concat(events: &[RunEvent], kind: scriptdeck_core::EventKind) -> String {
        events
            .iter()
            .filter(|e| e.kind() == kind)
            .map(RunEvent::payload)
            .collect()
    }

    #[tokio::test]
    async fn completes_with_output_and_done() {
        let (session, rx, _) = session();
        let status = session.status_cell();
        let spec = CommandSpec::new("echo one; echo two", "/tmp");

        let finished = session.execute(&ShellRunner::new(), &spec, GRACE).await;
        assert_eq!(status.get(), SessionStatus::Completed);
        let outcome = finished.close().await;

        let events = drain(rx).await;
        assert_eq!(events.last(), Some(&RunEvent::Done));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(concat(&events, scriptdeck_core::EventKind::Output), "one\ntwo\n");
        assert_eq!(outcome.output, "one\ntwo\n");
        assert_eq!(outcome.exit, Some(ExitOutcome::Code(0)));
    }

    #[tokio::test]
    async fn non_zero_exit_still_completes() {
        let (session, rx, _) = session();
        let spec = CommandSpec::new("echo bad >&2; exit 2", "/tmp");

        let outcome = session
            .execute(&ShellRunner::new(), &spec, GRACE)
            .await
            .close()
            .await;
        assert_eq!(outcome.status, SessionStatus::Completed);

        let events = drain(rx).await;
        assert_eq!(
            events,
            vec![
                RunEvent::Error("bad\n".into()),
                RunEvent::Error("Process exited with code 2".into()),
                RunEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn spawn_failure_is_error_then_done() {
        let (session, rx, _) = session();
        let status = session.status_cell();
        let spec = CommandSpec::new("echo hi", "/tmp");

        let outcome = session.execute(&FailingRunner, &spec, GRACE).await.close().await;
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(status.get(), SessionStatus::Failed);
        assert_eq!(outcome.error, "Command not found: bash");
        assert!(outcome.exit.is_none());

        let events = drain(rx).await;
        assert_eq!(
            events,
            vec![RunEvent::Error("Command not found: bash".into()), RunEvent::Done]
        );
    }

    #[tokio::test]
    async fn cancel_terminates_and_ends_with_cancelled() {
        let (session, mut rx, token) = session();
        let spec = CommandSpec::new("echo started; sleep 30; echo never", "/tmp");

        let task = tokio::spawn(async move {
            session
                .execute(&ShellRunner::new(), &spec, GRACE)
                .await
                .close()
                .await
        });

        assert_eq!(rx.recv().await, Some(RunEvent::Output("started\n".into())));
        token.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("cancel is bounded")
            .unwrap();
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(outcome.output, "started\n");

        let rest = drain(rx).await;
        assert_eq!(rest, vec![RunEvent::Cancelled]);
    }

    #[tokio::test]
    async fn dropping_receiver_cancels() {
        let (session, rx, _) = session();
        let status = session.status_cell();
        let spec = CommandSpec::new("sleep 30", "/tmp");

        let task = tokio::spawn(async move {
            session
                .execute(&ShellRunner::new(), &spec, GRACE)
                .await
                .close()
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(rx);

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("disconnect is bounded")
            .unwrap();
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(status.get(), SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn slow_consumer_applies_backpressure_but_loses_nothing() {
        let (tx, rx) = mpsc::channel(1);
        let session = ExecutionSession::new(Uuid::new_v4(), tx, CancellationToken::new());
        let spec = CommandSpec::new("for i in 1 2 3 4 5; do echo line$i; sleep 0.01; done", "/tmp");

        let task = tokio::spawn(async move {
            session
                .execute(&ShellRunner::new(), &spec, GRACE)
                .await
                .close()
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = drain(rx).await;
        let outcome = task.await.unwrap();

        let delivered = concat(&events, scriptdeck_core::EventKind::Output);
        assert_eq!(delivered, "line1\nline2\nline3\nline4\nline5\n");
        assert_eq!(outcome.output, delivered);
    }
}
