//! Runtime state store.
//!
//! A single JSON document holding mode selection, provider credentials, and
//! the public-mode registration. Every `set` rewrites the whole document
//! through a temp file + rename so a crash never leaves a partial write on
//! disk — this store is the only shared mutable resource in the system.

use crate::error::{CarryError, ConfigError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct StateStore {
    path: PathBuf,
    doc: Mutex<Map<String, Value>>,
}

impl StateStore {
    /// Open the store at `path`, loading the existing document if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CarryError> {
        let path = path.into();
        let doc = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(ConfigError::Io)?;
            serde_json::from_str(&raw)
                .map_err(|e| ConfigError::Store(format!("corrupt state document: {e}")))?
        } else {
            Map::new()
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.doc.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(key).cloned()
    }

    /// Typed read; `None` when the key is absent or fails to deserialize.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_owned))
    }

    pub fn set(&self, key: &str, value: impl Serialize) -> Result<(), CarryError> {
        let value = serde_json::to_value(value)
            .map_err(|e| ConfigError::Store(format!("unserializable value for {key}: {e}")))?;
        let mut doc = self
            .doc
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        doc.insert(key.to_owned(), value);
        self.persist(&doc)
    }

    pub fn remove(&self, key: &str) -> Result<(), CarryError> {
        let mut doc = self
            .doc
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        doc.remove(key);
        self.persist(&doc)
    }

    /// Whole-document atomic rewrite: temp file in the same directory, then
    /// rename over the live path.
    fn persist(&self, doc: &Map<String, Value>) -> Result<(), CarryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(doc)
            .map_err(|e| ConfigError::Store(e.to_string()))?;
        fs::write(&tmp, raw).map_err(ConfigError::Io)?;
        fs::rename(&tmp, &self.path).map_err(ConfigError::Io)?;
        Ok(())
    }
}

// Well-known keys. Kept in one place so the gateway, reconciler, and broker
// client never disagree on spelling.
pub mod keys {
    pub const TUNNEL_MODE: &str = "tunnel_mode";
    pub const CF_API_TOKEN: &str = "cf_api_token";
    pub const CF_DOMAIN: &str = "cf_domain";
    pub const CF_SUBDOMAIN: &str = "cf_subdomain";
    pub const PUBLIC_REGISTRATION: &str = "public_registration";
    pub const CUSTOM_SERVICES: &str = "custom_services";
    pub const SUFFIX_OVERRIDES: &str = "suffix_overrides";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_dir, store) = temp_store();
        store.set("tunnel_mode", "custom").unwrap();
        assert_eq!(store.get_str("tunnel_mode").as_deref(), Some("custom"));
    }

    #[test]
    fn set_persists_across_reopen() {
        let (dir, store) = temp_store();
        store.set("cf_domain", "example.com").unwrap();
        store
            .set("public_registration", json!({"random_id": "cc-ab12cd34"}))
            .unwrap();
        drop(store);

        let reopened = StateStore::open(dir.path().join("state.json")).unwrap();
        assert_eq!(reopened.get_str("cf_domain").as_deref(), Some("example.com"));
        assert_eq!(
            reopened.get("public_registration").unwrap()["random_id"],
            "cc-ab12cd34"
        );
    }

    #[test]
    fn remove_deletes_key_durably() {
        let (dir, store) = temp_store();
        store.set("cf_api_token", "tok").unwrap();
        store.remove("cf_api_token").unwrap();
        drop(store);

        let reopened = StateStore::open(dir.path().join("state.json")).unwrap();
        assert!(reopened.get("cf_api_token").is_none());
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let (dir, store) = temp_store();
        store.set("k", 1).unwrap();
        assert!(!dir.path().join("state.json.tmp").exists());
        assert!(dir.path().join("state.json").exists());
    }

    #[test]
    fn missing_key_is_none_not_error() {
        let (_dir, store) = temp_store();
        assert!(store.get("nope").is_none());
        assert!(store.get_as::<Vec<String>>("nope").is_none());
    }
}
