//! Script process runner.
//!
//! Provides:
//! - Shell and executable discovery
//! - Interpreter detection and argv building
//! - `ShellRunner`, the `ProcessRunner` used in production

pub mod command;
pub mod runner;
pub mod shell;

pub use command::{CommandBuildError, CommandParts, Interpreter, ScriptCommand};
pub use runner::ShellRunner;
pub use shell::{current_shell, get_shell_command, resolve_executable_path, script_shell};
