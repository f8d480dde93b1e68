//! Per-client pseudo-identity: the reaction fingerprint and the chat name.
//!
//! Both live in a small key/value store that mirrors a browser's local
//! storage. Values are created on first access and never rotated; clearing
//! the storage yields a new identity.

use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const FINGERPRINT_KEY: &str = "user_fingerprint";
pub const USERNAME_KEY: &str = "chat_username";

/// Client-side persistent key/value storage.
pub trait LocalStorage {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
}

/// In-process storage. The web session seeds it with whatever the browser
/// already has persisted.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    values: HashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from optional values, skipping blanks.
    pub fn seeded(entries: &[(&str, Option<&str>)]) -> Self {
        let values = entries
            .iter()
            .filter_map(|(k, v)| {
                let v = (*v)?.trim();
                (!v.is_empty()).then(|| (k.to_string(), v.to_string()))
            })
            .collect();
        MemoryStorage { values }
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// A JSON object on disk, used by the terminal client.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl FileStorage {
    /// Load `path` if it exists. A missing file is an empty store; a corrupt
    /// one is logged and treated as empty.
    pub fn open(path: &Path) -> Self {
        let values = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "local storage unreadable, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        FileStorage {
            path: path.to_path_buf(),
            values,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

impl LocalStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.flush()
    }
}

fn get_or_create<S, F>(storage: &mut S, key: &str, generate: F) -> String
where
    S: LocalStorage + ?Sized,
    F: FnOnce() -> String,
{
    if let Some(existing) = storage.get(key).filter(|v| !v.is_empty()) {
        return existing;
    }
    let fresh = generate();
    if let Err(e) = storage.set(key, &fresh) {
        // Still usable for this session, just not remembered.
        tracing::warn!(key, error = %e, "could not persist identity value");
    }
    fresh
}

/// The reaction fingerprint, generated (UUID v4) on first access.
pub fn fingerprint<S: LocalStorage + ?Sized>(storage: &mut S) -> String {
    get_or_create(storage, FINGERPRINT_KEY, || uuid::Uuid::new_v4().to_string())
}

/// Generate a random chat display name, e.g. `User417`.
pub fn random_username() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1000);
    format!("User{}", n)
}

/// The chat display name, generated on first access.
pub fn chat_username<S: LocalStorage + ?Sized>(storage: &mut S) -> String {
    get_or_create(storage, USERNAME_KEY, random_username)
}

/// Fingerprint and username resolved together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub fingerprint: String,
    pub username: String,
}

impl Identity {
    pub fn load<S: LocalStorage + ?Sized>(storage: &mut S) -> Self {
        Identity {
            fingerprint: fingerprint(storage),
            username: chat_username(storage),
        }
    }
}
