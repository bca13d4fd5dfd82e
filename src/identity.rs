//! Stable client identifier
//!
//! The id is generated once, persisted through a [`KeyValueStore`] and sent
//! to the server as the `uid` query parameter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::Rng;
use url::Url;

use crate::Result;

/// Store key holding the client id
pub const CLIENT_ID_KEY: &str = "client_uid";

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Persistent string key-value storage
pub trait KeyValueStore: Send + Sync {
    /// Read `key`
    ///
    /// # Errors
    ///
    /// Returns error if the backing storage cannot be read
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `key`
    ///
    /// # Errors
    ///
    /// Returns error if the backing storage cannot be written
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// JSON object on disk, rewritten on every `set`
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut map = self.read_map().unwrap_or_else(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "identity store unreadable, starting fresh");
            BTreeMap::new()
        });
        map.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&map)?)?;
        tracing::debug!(path = %self.path.display(), key, "identity store updated");
        Ok(())
    }
}

/// Volatile store
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Read the persisted client id, generating and storing one on first use
///
/// # Errors
///
/// Returns error if the store fails
pub fn client_id(store: &dyn KeyValueStore) -> Result<String> {
    if let Some(id) = store.get(CLIENT_ID_KEY)?.filter(|id| !id.is_empty()) {
        return Ok(id);
    }

    let id = generate_client_id();
    store.set(CLIENT_ID_KEY, &id)?;
    tracing::info!(client_id = %id, "generated client id");
    Ok(id)
}

/// `uid_<9 random base36>_<epoch ms in base36>`
#[must_use]
pub fn generate_client_id() -> String {
    let mut rng = rand::thread_rng();
    let random: String = (0..9)
        .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
        .collect();
    let millis = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
    format!("uid_{random}_{}", to_base36(millis))
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(char::from(BASE36[usize::try_from(n % 36).unwrap_or(0)]));
        n /= 36;
    }
    digits.iter().rev().collect()
}

/// `base` with its `uid` query parameter set to `client_id`
///
/// # Errors
///
/// Returns [`crate::Error::Url`] if `base` is not a valid URL
pub fn endpoint_url(base: &str, client_id: &str) -> Result<Url> {
    let mut url = Url::parse(base)?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "uid")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("uid", client_id);
    Ok(url)
}
