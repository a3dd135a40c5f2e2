//! Turning a script body and argument string into an argv.

use std::path::PathBuf;

use scriptdeck_core::{CommandSpec, SpawnError};
use thiserror::Error;

use crate::shell::{resolve_executable_path, script_shell};

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Arguments cannot be parsed: {0}")]
    InvalidArguments(String),
    #[error("Script body is empty")]
    EmptyBody,
}

impl From<CommandBuildError> for SpawnError {
    fn from(err: CommandBuildError) -> Self {
        match err {
            CommandBuildError::InvalidArguments(reason) => Self::InvalidArguments(reason),
            CommandBuildError::EmptyBody => Self::EmptyBody,
        }
    }
}

/// Program used to run a script body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    Shell,
    Python,
}

const PYTHON_PREFIXES: &[&str] = &[
    "#!/usr/bin/env python",
    "#!/usr/bin/python",
    "import ",
    "from ",
];

impl Interpreter {
    /// Pick the interpreter from the script name and the start of its body.
    #[must_use]
    pub fn detect(script_name: Option<&str>, body: &str) -> Self {
        let head = body.trim_start();
        let named_py = script_name.is_some_and(|n| n.trim_end().ends_with(".py"));
        if named_py || PYTHON_PREFIXES.iter().any(|p| head.starts_with(p)) {
            Self::Python
        } else {
            Self::Shell
        }
    }
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), SpawnError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(SpawnError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for the argv of one script run.
#[derive(Debug, Clone)]
pub struct ScriptCommand {
    /// `$0` for shell scripts.
    pub name: Option<String>,
    pub body: String,
    /// Free-form argument string.
    pub arguments: String,
    /// Python executable, looked up on PATH.
    pub python: String,
    /// Shell override; defaults to [`script_shell`].
    pub shell: Option<PathBuf>,
}

impl ScriptCommand {
    /// Create a builder for a resolved command.
    #[must_use]
    pub fn new(command: &CommandSpec) -> Self {
        Self {
            name: command.script_name.clone(),
            body: command.body.clone(),
            arguments: command.arguments.clone(),
            python: "python3".to_string(),
            shell: None,
        }
    }

    /// Override the python executable.
    #[must_use]
    pub fn python<S: Into<String>>(mut self, python: S) -> Self {
        self.python = python.into();
        self
    }

    /// Override the shell.
    #[must_use]
    pub fn shell<P: Into<PathBuf>>(mut self, shell: P) -> Self {
        self.shell = Some(shell.into());
        self
    }

    #[must_use]
    pub fn interpreter(&self) -> Interpreter {
        Interpreter::detect(self.name.as_deref(), &self.body)
    }

    /// Build the argv.
    ///
    /// The body goes in via `-c`; the argument string is split with
    /// shell-word rules and appended as positional parameters.
    ///
    /// # Errors
    /// Returns error if the body is empty or the arguments are malformed.
    pub async fn build(&self) -> Result<CommandParts, CommandBuildError> {
        if self.body.trim().is_empty() {
            return Err(CommandBuildError::EmptyBody);
        }
        let extra = split_arguments(&self.arguments)?;

        let parts = match self.interpreter() {
            Interpreter::Python => {
                let mut args = vec!["-c".to_string(), self.body.clone()];
                args.extend(extra);
                CommandParts::new(self.python.clone(), args)
            }
            Interpreter::Shell => {
                let (shell, flag) = match &self.shell {
                    Some(shell) => (shell.clone(), "-c"),
                    None => script_shell().await,
                };
                let zeroth = self.name.clone().unwrap_or_else(|| "script".to_string());
                let mut args = vec![flag.to_string(), self.body.clone(), zeroth];
                args.extend(extra);
                CommandParts::new(shell.to_string_lossy().into_owned(), args)
            }
        };
        Ok(parts)
    }
}

/// Split a free-form argument string into words.
///
/// # Errors
/// Returns error on unbalanced quoting.
pub fn split_arguments(input: &str) -> Result<Vec<String>, CommandBuildError> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }

    #[cfg(windows)]
    {
        Ok(winsplit::split(input))
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidArguments(input.to_string()))
    }
}
