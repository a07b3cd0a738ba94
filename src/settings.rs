//! Settings store: a hierarchical key/value persistence interface, with a
//! JSON-file-backed implementation that loads once at startup and rewrites
//! on every accepted change.

use crate::error::{PmuError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Keyed hierarchical persistence (`network/socket`, `calibration/0/slope`, ...).
/// The key strings are opaque to the store itself; callers own the namespace.
#[cfg_attr(test, mockall::automock)]
pub trait SettingsStore: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>>;
    fn set_string(&self, key: &str, value: &str) -> Result<()>;

    fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.get_string(key)?.and_then(|s| s.parse().ok()))
    }
    fn set_f64(&self, key: &str, value: f64) -> Result<()> {
        self.set_string(key, &value.to_string())
    }

    fn get_points(&self, key: &str) -> Result<Option<Vec<(f64, f64)>>> {
        match self.get_string(key)? {
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| PmuError::ConfigInvalid(e.to_string())),
            None => Ok(None),
        }
    }
    fn set_points(&self, key: &str, points: &[(f64, f64)]) -> Result<()> {
        let s = serde_json::to_string(points).map_err(|e| PmuError::ConfigInvalid(e.to_string()))?;
        self.set_string(key, &s)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(flatten)]
    values: BTreeMap<String, String>,
}

/// Single JSON document on disk, read at startup and rewritten on every
/// accepted settings change. A missing or unparseable file falls back to an
/// empty document rather than failing startup.
pub struct JsonFileStore {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let doc = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("settings file {} is not valid JSON, starting empty: {e}", path.display());
                    Document::default()
                }
            },
            Err(e) => {
                warn!("settings file {} is absent or unreadable, starting empty: {e}", path.display());
                Document::default()
            }
        };
        JsonFileStore { path, doc: Mutex::new(doc) }
    }

    fn persist(&self, doc: &Document) -> Result<()> {
        let text = serde_json::to_string_pretty(doc)
            .map_err(|e| PmuError::ConfigInvalid(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(PmuError::ConfigIo)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.doc.lock().unwrap().values.get(key).cloned())
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.values.insert(key.to_string(), value.to_string());
        self.persist(&doc)
    }
}

/// Default network socket address when no `network/socket` key is set.
pub const DEFAULT_NETWORK_SOCKET: &str = "tcp:127.0.0.1:4712";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trips_through_json_file() {
        let file = NamedTempFile::new().unwrap();
        let store = JsonFileStore::open(file.path());
        store.set_string("network/socket", "tcp:0.0.0.0:4712").unwrap();
        store.set_f64("calibration/0/slope", 1.2).unwrap();
        store
            .set_points("calibration/0/points", &[(1.0, 2.0), (3.0, 4.0)])
            .unwrap();

        let reopened = JsonFileStore::open(file.path());
        assert_eq!(
            reopened.get_string("network/socket").unwrap().as_deref(),
            Some("tcp:0.0.0.0:4712")
        );
        assert_eq!(reopened.get_f64("calibration/0/slope").unwrap(), Some(1.2));
        assert_eq!(
            reopened.get_points("calibration/0/points").unwrap(),
            Some(vec![(1.0, 2.0), (3.0, 4.0)])
        );
    }

    #[test]
    fn missing_file_yields_empty_store() {
        let store = JsonFileStore::open("/nonexistent/path/does-not-exist.json");
        assert_eq!(store.get_string("network/socket").unwrap(), None);
    }
}
