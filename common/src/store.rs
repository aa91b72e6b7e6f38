use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::lock;

/// Donde los nodos dejan su snapshot al hacer save/load.
pub trait StateStore: Send + Sync {
    fn save(&self, node: &str, set_id: &str, snapshot: &Value) -> Result<(), StoreError>;

    fn load(&self, node: &str, set_id: &str) -> Result<Option<Value>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<HashMap<(String, String), Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, node: &str, set_id: &str, snapshot: &Value) -> Result<(), StoreError> {
        lock(&self.snapshots).insert((node.to_string(), set_id.to_string()), snapshot.clone());
        Ok(())
    }

    fn load(&self, node: &str, set_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(lock(&self.snapshots)
            .get(&(node.to_string(), set_id.to_string()))
            .cloned())
    }
}

/// Un archivo JSON por nodo en `dir/<set_id>/`.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, node: &str, set_id: &str) -> PathBuf {
        let file: String = node
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(set_id).join(format!("{}.json", file))
    }
}

impl StateStore for FileStateStore {
    fn save(&self, node: &str, set_id: &str, snapshot: &Value) -> Result<(), StoreError> {
        let path = self.path(node, set_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec_pretty(snapshot)?)?;
        Ok(())
    }

    fn load(&self, node: &str, set_id: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path(node, set_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::env;

    #[test]
    fn memoria_guarda_por_nodo_y_set() {
        let store = MemoryStateStore::new();
        store.save("ts-0", "s1", &json!({"a": 1})).unwrap();
        assert_eq!(store.load("ts-0", "s1").unwrap(), Some(json!({"a": 1})));
        assert_eq!(store.load("ts-0", "s2").unwrap(), None);
        assert_eq!(store.load("ts-1", "s1").unwrap(), None);
    }

    #[test]
    fn archivo_sobrevive_al_store() {
        let dir = env::temp_dir().join("store_tests").join("archivo");
        let _ = fs::remove_dir_all(&dir);

        FileStateStore::new(&dir)
            .save("ts-0@master:8080", "s1", &json!([1, 2, 3]))
            .unwrap();
        let loaded = FileStateStore::new(&dir).load("ts-0@master:8080", "s1").unwrap();

        assert_eq!(loaded, Some(json!([1, 2, 3])));
        assert!(dir.join("s1").join("ts-0_master_8080.json").exists());
    }
}
