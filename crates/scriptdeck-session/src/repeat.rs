//! Re-running a request on a fixed interval.

use std::time::Duration;

use futures::StreamExt;
use scriptdeck_core::{HistoryStore, ProcessRunner, RunEvent, RunRequest, ScriptStore};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::manager::RunCoordinator;

/// An event from one iteration of a repeating run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatEvent {
    /// Zero-based iteration counter.
    pub iteration: u64,
    pub event: RunEvent,
}

/// Handle to a repeating run.
pub struct RepeatHandle {
    pub events: ReceiverStream<RepeatEvent>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl RepeatHandle {
    /// Stop repeating. A run in progress is cancelled.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop and wait for the driving task to exit.
    pub async fn join(self) {
        self.stop.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(%err, "Repeat task ended abnormally");
        }
    }
}

/// Run `request` now and then every `every`, until stopped.
///
/// Each run starts only after the previous one reached its terminal event;
/// ticks missed meanwhile are delayed rather than bursted. Dropping the
/// handle's event stream also stops the loop.
pub fn spawn_repeating<S, R>(
    coordinator: RunCoordinator<S, R>,
    request: RunRequest,
    every: Duration,
) -> RepeatHandle
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    let (tx, rx) = mpsc::channel(coordinator.config().event_buffer.max(1));
    let stop = CancellationToken::new();
    let token = stop.clone();

    let task = tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for iteration in 0.. {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let mut handle = match coordinator.run(request.clone()).await {
                Ok(handle) => handle,
                Err(err) => {
                    tracing::warn!(iteration, %err, "Repeated run could not start");
                    let failed = [RunEvent::Error(err.to_string()), RunEvent::Done];
                    for event in failed {
                        if tx.send(RepeatEvent { iteration, event }).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    () = token.cancelled() => {
                        // Dropping the stream cancels the run.
                        drop(handle);
                        return;
                    }
                    next = handle.events.next() => next,
                };
                let Some(event) = next else { break };
                if tx.send(RepeatEvent { iteration, event }).await.is_err() {
                    return;
                }
            }
        }
    });

    RepeatHandle {
        events: ReceiverStream::new(rx),
        stop,
        task,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use scriptdeck_core::EngineConfig;
    use scriptdeck_executor::ShellRunner;

    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn repeats_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            default_working_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let coordinator = RunCoordinator::new(MemoryStorage::new(), ShellRunner::new(), config);

        let mut repeat = spawn_repeating(
            coordinator,
            RunRequest::inline("echo tick"),
            Duration::from_millis(20),
        );

        let mut finished = Vec::new();
        while let Some(RepeatEvent { iteration, event }) = repeat.events.next().await {
            if event == RunEvent::Done {
                finished.push(iteration);
                if finished.len() == 3 {
                    break;
                }
            } else {
                assert_eq!(event, RunEvent::Output("tick\n".into()));
            }
        }
        assert_eq!(finished, vec![0, 1, 2]);
        repeat.join().await;
    }

    #[tokio::test]
    async fn resolution_failures_are_reported_per_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            default_working_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let coordinator = RunCoordinator::new(MemoryStorage::new(), ShellRunner::new(), config);

        let mut repeat = spawn_repeating(
            coordinator,
            RunRequest::named("missing"),
            Duration::from_millis(10),
        );
        let first = repeat.events.next().await.unwrap();
        assert_eq!(first.iteration, 0);
        assert_eq!(first.event, RunEvent::Error("Script not found: missing".into()));
        assert_eq!(repeat.events.next().await.unwrap().event, RunEvent::Done);
        repeat.join().await;
    }
}
