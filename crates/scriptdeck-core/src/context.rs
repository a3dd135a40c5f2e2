//! Run requests and the resolved command handed to a process runner.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::script::ScriptDefinition;

/// A caller's request to run a script.
///
/// Either `script_name` must resolve to a stored script or `body` must be
/// supplied inline. When both are present the inline body is executed and
/// the name still keys history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default, alias = "name")]
    pub script_name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Free-form argument string, split with shell-word rules at spawn time.
    #[serde(default, alias = "args")]
    pub arguments: String,
    /// Overrides the script's default working directory.
    #[serde(default, alias = "working_dir")]
    pub working_directory: Option<PathBuf>,
}

impl RunRequest {
    /// Request to run a stored script.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            script_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Request to run an inline body.
    #[must_use]
    pub fn inline(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    /// Set the argument string.
    #[must_use]
    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    /// Override the working directory.
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Set the script name alongside an inline body.
    #[must_use]
    pub fn with_script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = Some(name.into());
        self
    }

    /// Trimmed script name, if a non-empty one was given.
    #[must_use]
    pub fn requested_name(&self) -> Option<&str> {
        self.script_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }

    /// Inline body, if a non-blank one was given.
    #[must_use]
    pub fn inline_body(&self) -> Option<&str> {
        self.body.as_deref().filter(|b| !b.trim().is_empty())
    }

    /// Working directory override, ignoring empty paths.
    #[must_use]
    pub fn working_directory_override(&self) -> Option<&Path> {
        self.working_directory
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Effective working directory: override, then script default, then
    /// `fallback`.
    #[must_use]
    pub fn effective_working_dir(
        &self,
        script: Option<&ScriptDefinition>,
        fallback: &Path,
    ) -> PathBuf {
        self.working_directory_override()
            .or_else(|| {
                script
                    .and_then(|s| s.working_directory.as_deref())
                    .filter(|p| !p.as_os_str().is_empty())
            })
            .unwrap_or(fallback)
            .to_path_buf()
    }
}

/// Fully resolved command for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Name used for interpreter detection and `$0`, if any.
    pub script_name: Option<String>,
    pub body: String,
    pub arguments: String,
    pub working_dir: PathBuf,
}

impl CommandSpec {
    /// Create a command spec.
    #[must_use]
    pub fn new(body: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_name: None,
            body: body.into(),
            arguments: String::new(),
            working_dir: working_dir.into(),
        }
    }

    /// Set the argument string.
    #[must_use]
    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    /// Set the script name.
    #[must_use]
    pub fn with_script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_short_field_names() {
        let req: RunRequest = serde_json::from_str(
            r#"{"name":"list-files","args":"-la","working_dir":"/data"}"#,
        )
        .unwrap();
        assert_eq!(req.requested_name(), Some("list-files"));
        assert_eq!(req.arguments, "-la");
        assert_eq!(req.working_directory_override(), Some(Path::new("/data")));
    }

    #[test]
    fn blank_fields_are_ignored() {
        let req = RunRequest {
            script_name: Some("   ".into()),
            body: Some("\n".into()),
            arguments: String::new(),
            working_directory: Some(PathBuf::new()),
        };
        assert_eq!(req.requested_name(), None);
        assert_eq!(req.inline_body(), None);
        assert_eq!(req.working_directory_override(), None);
    }

    #[test]
    fn working_dir_precedence() {
        let fallback = Path::new("/srv");
        let script = ScriptDefinition::new("s", "ls").with_working_directory("/data");

        let plain = RunRequest::named("s");
        assert_eq!(plain.effective_working_dir(None, fallback), PathBuf::from("/srv"));
        assert_eq!(
            plain.effective_working_dir(Some(&script), fallback),
            PathBuf::from("/data")
        );

        let overridden = RunRequest::named("s").with_working_directory("/tmp");
        assert_eq!(
            overridden.effective_working_dir(Some(&script), fallback),
            PathBuf::from("/tmp")
        );
    }
}
