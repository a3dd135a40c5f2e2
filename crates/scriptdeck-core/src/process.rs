//! Handle to a spawned process group.

use std::{fmt, io, process::ExitStatus, time::Duration};

use bytes::Bytes;
use command_group::AsyncGroupChild;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

/// Which pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Both pipes merged in arrival order.
///
/// Order within one pipe is preserved; order across the two pipes is only
/// as good as the scheduler's view of which read completed first.
pub type OutputStream = BoxStream<'static, (StreamKind, io::Result<Bytes>)>;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
}

impl ExitOutcome {
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Self::Signal(sig);
            }
        }
        Self::Code(status.code().unwrap_or(-1))
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "Process exited with code {code}"),
            Self::Signal(sig) => write!(f, "Process terminated by signal {sig}"),
        }
    }
}

/// A running (or finished) process group.
pub struct ProcessHandle {
    child: AsyncGroupChild,
    pid: Option<u32>,
    exit: Option<ExitOutcome>,
    terminated: bool,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Wrap a freshly spawned group leader.
    #[must_use]
    pub fn new(child: AsyncGroupChild) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            exit: None,
            terminated: false,
        }
    }

    /// Process id of the group leader (also the process group id).
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take both pipes as one merged stream of raw chunks.
    ///
    /// Subsequent calls yield an empty stream.
    pub fn take_output(&mut self) -> OutputStream {
        let inner = self.child.inner();
        let stdout = inner.stdout.take().map_or_else(
            || stream::empty().boxed(),
            |pipe| {
                ReaderStream::new(pipe)
                    .map(|chunk| (StreamKind::Stdout, chunk))
                    .boxed()
            },
        );
        let stderr = inner.stderr.take().map_or_else(
            || stream::empty().boxed(),
            |pipe| {
                ReaderStream::new(pipe)
                    .map(|chunk| (StreamKind::Stderr, chunk))
                    .boxed()
            },
        );
        stream::select(stdout, stderr).boxed()
    }

    /// Wait for the group leader to exit.
    ///
    /// # Errors
    /// Returns error if waiting on the child fails.
    pub async fn wait(&mut self) -> io::Result<ExitOutcome> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = ExitOutcome::from(self.child.wait().await?);
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Exit outcome, if the process has already been reaped.
    #[must_use]
    pub const fn exit(&self) -> Option<ExitOutcome> {
        self.exit
    }

    /// Stop the whole process group.
    ///
    /// Sends SIGTERM to the group, waits up to `grace` for the leader to
    /// exit, then SIGKILLs the group. The SIGKILL is sent even when the
    /// leader exited in time, so descendants that ignore SIGTERM do not
    /// outlive the run. Safe to call repeatedly and after the process has
    /// exited.
    ///
    /// # Errors
    /// Returns error if waiting on the child fails.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        self.signal_group(GroupSignal::Terminate);
        if self.exit.is_none() {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => self.exit = Some(ExitOutcome::from(status?)),
                Err(_) => {
                    tracing::warn!(
                        pid = ?self.pid,
                        ?grace,
                        "Process group ignored SIGTERM, sending SIGKILL"
                    );
                }
            }
        } else {
            tokio::time::sleep(grace).await;
        }

        self.signal_group(GroupSignal::Kill);
        if self.exit.is_some() {
            return Ok(());
        }
        if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
            self.exit = Some(ExitOutcome::from(status?));
        } else {
            tracing::error!(pid = ?self.pid, "Process group survived SIGKILL");
        }
        Ok(())
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: GroupSignal) {
        use nix::{
            errno::Errno,
            sys::signal::{Signal, killpg},
            unistd::Pid,
        };

        let Some(pgid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        let sig = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pgid), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => tracing::debug!(pgid, ?sig, %err, "killpg failed"),
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: GroupSignal) {
        if let Err(err) = self.child.start_kill() {
            tracing::debug!(pid = ?self.pid, %err, "Failed to kill process group");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}
