//! The `todo` mode: a local list persisted under a single key-value entry.

use crate::constants::TODO_STORAGE_KEY;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// A JSON object on disk, one string value per key. Rewritten whole on every `set`.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _held = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _held = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub id: i64,
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

pub struct TodoList<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> TodoList<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<TodoItem>> {
        match self.store.get(TODO_STORAGE_KEY)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(items) => Ok(items),
                Err(e) => {
                    tracing::warn!("Discarding unreadable to-do list: {}", e);
                    Ok(Vec::new())
                }
            },
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, items: &[TodoItem]) -> Result<()> {
        self.store
            .set(TODO_STORAGE_KEY, &serde_json::to_string(items)?)
    }

    pub fn add(&self, text: &str) -> Result<TodoItem> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RelayError::InvalidRequest("to-do text cannot be empty".into()).into());
        }
        let mut items = self.list()?;
        let mut id = chrono::Utc::now().timestamp_millis();
        if let Some(max) = items.iter().map(|i| i.id).max() {
            id = id.max(max + 1);
        }
        let item = TodoItem {
            id,
            text: text.to_string(),
            completed: false,
        };
        items.push(item.clone());
        self.save(&items)?;
        Ok(item)
    }

    /// Flips `completed`. Returns the updated item, or `None` for an unknown id.
    pub fn toggle(&self, id: i64) -> Result<Option<TodoItem>> {
        let mut items = self.list()?;
        let updated = match items.iter_mut().find(|i| i.id == id) {
            Some(item) => {
                item.completed = !item.completed;
                item.clone()
            }
            None => return Ok(None),
        };
        self.save(&items)?;
        Ok(Some(updated))
    }

    pub fn remove(&self, id: i64) -> Result<bool> {
        let mut items = self.list()?;
        let before = items.len();
        items.retain(|i| i.id != id);
        if items.len() == before {
            return Ok(false);
        }
        self.save(&items)?;
        Ok(true)
    }

    pub fn clear_completed(&self) -> Result<usize> {
        let mut items = self.list()?;
        let before = items.len();
        items.retain(|i| !i.completed);
        let removed = before - items.len();
        if removed > 0 {
            self.save(&items)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_trims_and_rejects_empty_text() {
        let todos = TodoList::new(MemoryStore::default());
        assert!(todos.add("   ").is_err());
        let item = todos.add("  buy milk ").unwrap();
        assert_eq!(item.text, "buy milk");
        assert!(!item.completed);
        assert_eq!(todos.list().unwrap(), vec![item]);
    }

    #[test]
    fn ids_stay_unique_within_one_millisecond() {
        let todos = TodoList::new(MemoryStore::default());
        let a = todos.add("one").unwrap();
        let b = todos.add("two").unwrap();
        let c = todos.add("three").unwrap();
        assert!(a.id < b.id && b.id < c.id);
    }

    #[test]
    fn toggle_remove_and_clear_completed() {
        let todos = TodoList::new(MemoryStore::default());
        let a = todos.add("a").unwrap();
        let b = todos.add("b").unwrap();

        assert!(todos.toggle(a.id).unwrap().unwrap().completed);
        assert!(todos.toggle(999).unwrap().is_none());
        assert_eq!(todos.clear_completed().unwrap(), 1);
        assert_eq!(todos.list().unwrap(), vec![b.clone()]);

        assert!(todos.remove(b.id).unwrap());
        assert!(!todos.remove(b.id).unwrap());
        assert!(todos.list().unwrap().is_empty());
    }

    #[test]
    fn file_store_persists_under_the_fixed_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("todos.json");

        let first = TodoList::new(FileStore::new(&path));
        first.add("water plants").unwrap();

        let reopened = TodoList::new(FileStore::new(&path));
        let items = reopened.list().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "water plants");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.get(TODO_STORAGE_KEY).unwrap().is_string());
    }

    #[test]
    fn corrupt_list_reads_as_empty() {
        let store = MemoryStore::default();
        store.set(TODO_STORAGE_KEY, "not json").unwrap();
        let todos = TodoList::new(store);
        assert!(todos.list().unwrap().is_empty());
    }
}
