//! Process runner that executes script bodies through a shell or python.

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use scriptdeck_core::{CommandSpec, ProcessHandle, ProcessRunner, SpawnError};
use tokio::process::Command;

use crate::command::ScriptCommand;

/// Runs scripts as process-group leaders with piped stdout/stderr.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    python: String,
    shell: Option<PathBuf>,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            python: "python3".to_string(),
            shell: None,
        }
    }

    /// Use a specific python executable.
    #[must_use]
    pub fn with_python<S: Into<String>>(mut self, python: S) -> Self {
        self.python = python.into();
        self
    }

    /// Use a specific shell instead of `bash`/`$SHELL`.
    #[must_use]
    pub fn with_shell<P: Into<PathBuf>>(mut self, shell: P) -> Self {
        self.shell = Some(shell.into());
        self
    }
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn start(&self, command: &CommandSpec) -> Result<ProcessHandle, SpawnError> {
        check_working_dir(&command.working_dir).await?;

        let mut builder = ScriptCommand::new(command).python(self.python.clone());
        if let Some(shell) = &self.shell {
            builder = builder.shell(shell.clone());
        }
        let (program, args) = builder.build().await?.into_resolved().await?;

        tracing::debug!(
            program = %program.display(),
            working_dir = %command.working_dir.display(),
            "Spawning script"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .group_spawn()
            .map_err(|e| classify_spawn_error(e, &program))?;
        Ok(ProcessHandle::new(child))
    }
}

/// Fail before spawning if the directory can't host the process.
async fn check_working_dir(dir: &Path) -> Result<(), SpawnError> {
    let unusable = |reason: &str| SpawnError::WorkingDirectory {
        path: dir.to_path_buf(),
        reason: reason.to_string(),
    };

    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(unusable("not a directory")),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(unusable("does not exist")),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(unusable("permission denied")),
        Err(e) => Err(unusable(&e.to_string())),
    }
}

fn classify_spawn_error(err: io::Error, program: &Path) -> SpawnError {
    match err.kind() {
        io::ErrorKind::NotFound => SpawnError::NotFound(program.display().to_string()),
        io::ErrorKind::PermissionDenied => {
            SpawnError::PermissionDenied(program.display().to_string())
        }
        _ => SpawnError::Resource(err),
    }
}
