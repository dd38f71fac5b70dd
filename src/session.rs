//! Session-scoped persisted values
//!
//! A small key/value store holding the active character and the signed-in
//! user between runs. Stores never fail: write errors are logged and the
//! in-memory value still changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use tracing::warn;

/// Key under which the active character id is stored
pub const ACTIVE_CHARACTER_KEY: &str = "active_character_id";

/// Key under which the signed-in user id is stored between runs
pub const AUTH_USER_KEY: &str = "auth_user_id";

pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Values live only as long as the process
#[derive(Default)]
pub struct MemorySessionStore {
    values: DashMap<String, String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.remove(key);
    }
}

/// Values persisted to a JSON file after every change
pub struct FileSessionStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileSessionStore {
    /// Open the store at `path`; a missing or unreadable file starts empty
    pub fn open(path: &Path) -> Self {
        let values = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring corrupt session file {:?}: {}", path, e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        }
    }

    fn persist(&self, values: &HashMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!("Failed to create session directory {:?}: {}", parent, e);
                    return;
                }
            }
        }

        let content = match serde_json::to_string_pretty(values) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to serialize session: {}", e);
                return;
            }
        };

        if let Err(e) = std::fs::write(&self.path, content) {
            warn!("Failed to write session file {:?}: {}", self.path, e);
        }
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        self.persist(&values);
    }

    fn remove(&self, key: &str) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if values.remove(key).is_some() {
            self.persist(&values);
        }
    }
}
