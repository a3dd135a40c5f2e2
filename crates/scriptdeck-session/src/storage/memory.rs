//! In-memory script and history storage.

use std::{
    collections::{HashMap, VecDeque},
    sync::RwLock,
};

use async_trait::async_trait;
use scriptdeck_core::{HistoryEntry, HistoryStore, ScriptDefinition, ScriptStore, StorageError};

use super::DEFAULT_HISTORY_LIMIT;

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStorage {
    scripts: RwLock<HashMap<String, ScriptDefinition>>,
    history: RwLock<HashMap<String, VecDeque<HistoryEntry>>>,
    history_limit: usize,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a storage keeping at most `limit` history entries per script.
    #[must_use]
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            scripts: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            history_limit: limit,
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Internal(e.to_string())
}

#[async_trait]
impl ScriptStore for MemoryStorage {
    async fn get_script(&self, name: &str) -> Result<Option<ScriptDefinition>, StorageError> {
        Ok(self
            .scripts
            .read()
            .map_err(poisoned)?
            .get(name.trim())
            .cloned())
    }

    async fn list_scripts(&self) -> Result<Vec<ScriptDefinition>, StorageError> {
        let mut scripts: Vec<ScriptDefinition> = self
            .scripts
            .read()
            .map_err(poisoned)?
            .values()
            .cloned()
            .collect();
        scripts.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.name.cmp(&b.name)));
        Ok(scripts)
    }

    async fn save_script(&self, script: ScriptDefinition) -> Result<(), StorageError> {
        let script = script.normalized();
        self.scripts
            .write()
            .map_err(poisoned)?
            .insert(script.name.clone(), script);
        Ok(())
    }

    async fn delete_script(&self, name: &str) -> Result<bool, StorageError> {
        let name = name.trim();
        let existed = self.scripts.write().map_err(poisoned)?.remove(name).is_some();
        if existed {
            self.history.write().map_err(poisoned)?.remove(name);
        }
        Ok(existed)
    }

    async fn rename_script(
        &self,
        old_name: &str,
        updated: ScriptDefinition,
    ) -> Result<(), StorageError> {
        let old_name = old_name.trim();
        let updated = updated.normalized();

        let mut scripts = self.scripts.write().map_err(poisoned)?;
        if !scripts.contains_key(old_name) {
            return Err(StorageError::NotFound(old_name.to_string()));
        }
        if updated.name != old_name && scripts.contains_key(&updated.name) {
            return Err(StorageError::Conflict(updated.name));
        }

        scripts.remove(old_name);
        if updated.name != old_name {
            let mut history = self.history.write().map_err(poisoned)?;
            if let Some(moved) = history.remove(old_name) {
                let merged = history.entry(updated.name.clone()).or_default();
                merge_history(merged, moved, self.history_limit);
            }
        }
        scripts.insert(updated.name.clone(), updated);
        Ok(())
    }

    async fn categories(&self) -> Result<Vec<String>, StorageError> {
        let mut categories: Vec<String> = self
            .scripts
            .read()
            .map_err(poisoned)?
            .values()
            .map(|s| s.category.clone())
            .collect();
        categories.sort();
        categories.dedup();
        Ok(categories)
    }
}

/// Fold `moved` into `target`, one entry per invocation, newest first.
fn merge_history(
    target: &mut VecDeque<HistoryEntry>,
    moved: VecDeque<HistoryEntry>,
    limit: usize,
) {
    for entry in moved {
        match target.iter().position(|existing| existing.same_invocation(&entry)) {
            Some(i) if target[i].timestamp >= entry.timestamp => {}
            Some(i) => target[i] = entry,
            None => target.push_back(entry),
        }
    }
    target
        .make_contiguous()
        .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    target.truncate(limit);
}

#[async_trait]
impl HistoryStore for MemoryStorage {
    async fn append_history(
        &self,
        script_name: &str,
        entry: HistoryEntry,
    ) -> Result<(), StorageError> {
        let mut history = self.history.write().map_err(poisoned)?;
        let entries = history.entry(script_name.trim().to_string()).or_default();

        entries.retain(|existing| !existing.same_invocation(&entry));
        entries.push_front(entry);
        entries.truncate(self.history_limit);
        Ok(())
    }

    async fn history(&self, script_name: &str) -> Result<Vec<HistoryEntry>, StorageError> {
        Ok(self
            .history
            .read()
            .map_err(poisoned)?
            .get(script_name.trim())
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(arguments: &str, dir: &str, timestamp: i64) -> HistoryEntry {
        HistoryEntry {
            arguments: arguments.to_string(),
            working_directory: dir.into(),
            timestamp,
        }
    }

    #[tokio::test]
    async fn scripts_sorted_by_category_then_name() {
        let storage = MemoryStorage::new();
        storage
            .save_script(ScriptDefinition::new("zeta", "true").with_category("Build"))
            .await
            .unwrap();
        storage
            .save_script(ScriptDefinition::new("alpha", "true"))
            .await
            .unwrap();
        storage
            .save_script(ScriptDefinition::new("beta", "true").with_category("Build"))
            .await
            .unwrap();

        let names: Vec<String> = storage
            .list_scripts()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["beta", "zeta", "alpha"]);
        assert_eq!(
            storage.categories().await.unwrap(),
            vec!["Build", "Uncategorized"]
        );
    }

    #[tokio::test]
    async fn lookup_trims_names() {
        let storage = MemoryStorage::new();
        storage
            .save_script(ScriptDefinition::new("  list  ", "ls"))
            .await
            .unwrap();
        assert!(storage.get_script("list").await.unwrap().is_some());
        assert!(storage.get_script(" list ").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn history_is_most_recent_first_and_deduplicated() {
        let storage = MemoryStorage::new();
        storage.append_history("s", entry("-a", "/tmp", 1)).await.unwrap();
        storage.append_history("s", entry("-b", "/tmp", 2)).await.unwrap();
        storage.append_history("s", entry("-a", "/tmp", 3)).await.unwrap();

        let history = storage.history("s").await.unwrap();
        assert_eq!(history, vec![entry("-a", "/tmp", 3), entry("-b", "/tmp", 2)]);
    }

    #[tokio::test]
    async fn history_is_capped_per_script() {
        let storage = MemoryStorage::with_history_limit(3);
        for i in 0..5 {
            storage
                .append_history("s", entry(&format!("-{i}"), "/tmp", i))
                .await
                .unwrap();
        }
        storage.append_history("other", entry("", "/", 0)).await.unwrap();

        let args: Vec<String> = storage
            .history("s")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.arguments)
            .collect();
        assert_eq!(args, vec!["-4", "-3", "-2"]);
        assert_eq!(storage.history("other").await.unwrap().len(), 1);
        assert!(storage.history("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_moves_history() {
        let storage = MemoryStorage::new();
        storage
            .save_script(ScriptDefinition::new("old", "true"))
            .await
            .unwrap();
        storage.append_history("old", entry("x", "/tmp", 1)).await.unwrap();

        storage
            .rename_script("old", ScriptDefinition::new("new", "false"))
            .await
            .unwrap();

        assert!(storage.get_script("old").await.unwrap().is_none());
        assert_eq!(storage.get_script("new").await.unwrap().unwrap().body, "false");
        assert!(storage.history("old").await.unwrap().is_empty());
        assert_eq!(storage.history("new").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rename_merges_into_history_already_recorded_under_new_name() {
        let storage = MemoryStorage::with_history_limit(3);
        storage.save_script(ScriptDefinition::new("a", "true")).await.unwrap();
        // Recorded for an inline run requested as "c" before the script existed.
        storage.append_history("c", entry("x", "/tmp", 1)).await.unwrap();
        storage.append_history("c", entry("y", "/tmp", 2)).await.unwrap();
        storage.append_history("a", entry("z", "/tmp", 3)).await.unwrap();
        storage.append_history("a", entry("x", "/tmp", 4)).await.unwrap();
        storage.append_history("a", entry("w", "/tmp", 5)).await.unwrap();

        storage
            .rename_script("a", ScriptDefinition::new("c", "true"))
            .await
            .unwrap();

        assert!(storage.history("a").await.unwrap().is_empty());
        assert_eq!(
            storage.history("c").await.unwrap(),
            vec![entry("w", "/tmp", 5), entry("x", "/tmp", 4), entry("z", "/tmp", 3)]
        );
    }

    #[tokio::test]
    async fn rename_onto_existing_name_conflicts() {
        let storage = MemoryStorage::new();
        storage.save_script(ScriptDefinition::new("a", "true")).await.unwrap();
        storage.save_script(ScriptDefinition::new("b", "true")).await.unwrap();

        let err = storage
            .rename_script("a", ScriptDefinition::new("b", "true"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(name) if name == "b"));

        let err = storage
            .rename_script("missing", ScriptDefinition::new("c", "true"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn delete_reports_existence() {
        let storage = MemoryStorage::new();
        tokio_test::block_on(async {
            storage.save_script(ScriptDefinition::new("a", "true")).await.unwrap();
            storage.append_history("a", entry("", "/", 1)).await.unwrap();
            assert!(storage.delete_script("a").await.unwrap());
            assert!(!storage.delete_script("a").await.unwrap());
            assert!(storage.history("a").await.unwrap().is_empty());
        });
    }
}
