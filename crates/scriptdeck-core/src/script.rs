//! Script definitions and run history entries.

use std::{
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Category assigned to scripts saved without one.
pub const DEFAULT_CATEGORY: &str = "Uncategorized";

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

/// A named, persisted script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    /// Unique key.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Command text handed to the interpreter.
    pub body: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// Default working directory for runs that don't override it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
}

impl ScriptDefinition {
    /// Create a script in the default category.
    #[must_use]
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            body: body.into(),
            category: default_category(),
            working_directory: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Set the default working directory.
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Trim the name and fill an empty category, as stores expect.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        if self.category.trim().is_empty() {
            self.category = default_category();
        }
        self
    }
}

/// One recorded run of a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub arguments: String,
    pub working_directory: PathBuf,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl HistoryEntry {
    /// Entry stamped with the current time.
    #[must_use]
    pub fn now(arguments: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            arguments: arguments.into(),
            working_directory: working_directory.into(),
            timestamp: now_millis(),
        }
    }

    /// Whether `other` records the same invocation.
    #[must_use]
    pub fn same_invocation(&self, other: &Self) -> bool {
        self.arguments == other.arguments && self.working_directory == other.working_directory
    }
}

/// Current time in Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let script: ScriptDefinition =
            serde_json::from_str(r#"{"name":"list-files","body":"ls"}"#).unwrap();
        assert_eq!(script.category, DEFAULT_CATEGORY);
        assert_eq!(script.description, "");
        assert!(script.working_directory.is_none());
    }

    #[test]
    fn normalized_trims_name_and_fills_category() {
        let script = ScriptDefinition::new("  backup ", "tar c .")
            .with_category("  ")
            .normalized();
        assert_eq!(script.name, "backup");
        assert_eq!(script.category, DEFAULT_CATEGORY);
    }

    #[test]
    fn same_invocation_ignores_timestamp() {
        let a = HistoryEntry {
            arguments: "-la".into(),
            working_directory: "/data".into(),
            timestamp: 1,
        };
        let b = HistoryEntry {
            timestamp: 2,
            ..a.clone()
        };
        assert!(a.same_invocation(&b));
    }
}
