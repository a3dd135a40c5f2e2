//! Cross-platform shell and executable discovery.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Returns the platform shell and its "run this string" flag.
///
/// Returns `(shell_program, shell_arg)` where:
/// - Windows: `("cmd", "/C")`
/// - Unix-like: the shell from `$SHELL`, or `("/bin/sh", "-c")`
#[must_use]
pub fn get_shell_command() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".into(), "/C")
    } else {
        (current_shell().to_string_lossy().into_owned(), "-c")
    }
}

/// Shell used to run script bodies: `bash` when it can be found, otherwise
/// the platform shell.
pub async fn script_shell() -> (PathBuf, &'static str) {
    if !cfg!(windows) {
        if let Some(bash) = resolve_executable_path("bash").await {
            return (bash, "-c");
        }
    }
    let (shell, arg) = get_shell_command();
    (PathBuf::from(shell), arg)
}

/// Resolve an executable by name.
///
/// The search order is:
/// 1. Explicit paths (absolute, or containing a separator).
/// 2. The current process PATH via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// The user's shell from `$SHELL`, or `/bin/sh` when it is unset or not
/// an absolute path to a file.
#[must_use]
pub fn current_shell() -> PathBuf {
    shell_from(std::env::var_os("SHELL").as_deref())
}

fn shell_from(value: Option<&OsStr>) -> PathBuf {
    value
        .map(Path::new)
        .filter(|path| path.is_absolute() && path.is_file())
        .map_or_else(|| PathBuf::from("/bin/sh"), Path::to_path_buf)
}
