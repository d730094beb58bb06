//! External collaborators of the daemon and client.
//!
//! | Trait | Role |
//! |-------|------|
//! | [`KeyStore`] | Key escrow: private keys by name |
//! | [`ContentStore`] | Content-addressed blobs: put bytes, get by hash |
//! | [`ZoneStore`] | Relational zone metadata |
//! | [`RecordStore`] | Relational record metadata |
//!
//! The in-memory implementations back the tests and the `tns` binary. Each
//! can be switched into a failing mode to exercise error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Encoding of a blob handed to the [`ContentStore`]. Zone documents are
/// always JSON.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    Json,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// `Ok(None)` when no key is stored under `name`.
    async fn get_private_key(&self, name: &str) -> Result<Option<Vec<u8>>>;
    async fn put_private_key(&self, name: &str, key: &[u8]) -> Result<()>;
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` and return its content hash.
    async fn put(&self, data: &[u8], codec: Codec) -> Result<String>;
    async fn get(&self, hash: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait ZoneStore: Send + Sync {
    async fn new_zone(&self, name: &str, manager_id: &str, zone_id: &str, hash: &str) -> Result<()>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn new_record(
        &self,
        zone_name: &str,
        record_name: &str,
        record_id: &str,
        meta_data: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails.
    pub fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get_private_key(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if self.failing.load(Ordering::Acquire) {
            bail!("key store unavailable");
        }
        Ok(self.keys.read().await.get(name).cloned())
    }

    async fn put_private_key(&self, name: &str, key: &[u8]) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            bail!("key store unavailable");
        }
        self.keys.write().await.insert(name.to_string(), key.to_vec());
        Ok(())
    }
}

/// Content store keyed by the hex BLAKE3 digest of each blob.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: &[u8], _codec: Codec) -> Result<String> {
        if self.failing.load(Ordering::Acquire) {
            bail!("content store unavailable");
        }
        let hash = content_hash(data);
        self.blobs.write().await.insert(hash.clone(), data.to_vec());
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        if self.failing.load(Ordering::Acquire) {
            bail!("content store unavailable");
        }
        match self.blobs.read().await.get(hash) {
            Some(data) => Ok(data.clone()),
            None => bail!("no content for hash {}", hash),
        }
    }
}

/// One row of zone metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneRow {
    pub name: String,
    pub manager_id: String,
    pub zone_id: String,
    pub hash: String,
}

#[derive(Default)]
pub struct MemoryZoneStore {
    rows: RwLock<Vec<ZoneRow>>,
    failing: AtomicBool,
}

impl MemoryZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub async fn rows(&self) -> Vec<ZoneRow> {
        self.rows.read().await.clone()
    }
}

#[async_trait]
impl ZoneStore for MemoryZoneStore {
    async fn new_zone(&self, name: &str, manager_id: &str, zone_id: &str, hash: &str) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            bail!("zone store unavailable");
        }
        let mut rows = self.rows.write().await;
        if rows.iter().any(|row| row.name == name) {
            bail!("zone {:?} already recorded", name);
        }
        rows.push(ZoneRow {
            name: name.to_string(),
            manager_id: manager_id.to_string(),
            zone_id: zone_id.to_string(),
            hash: hash.to_string(),
        });
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordRow {
    pub zone_name: String,
    pub record_name: String,
    pub record_id: String,
    pub meta_data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Default)]
pub struct MemoryRecordStore {
    rows: RwLock<Vec<RecordRow>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<RecordRow> {
        self.rows.read().await.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn new_record(
        &self,
        zone_name: &str,
        record_name: &str,
        record_id: &str,
        meta_data: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.rows.write().await.push(RecordRow {
            zone_name: zone_name.to_string(),
            record_name: record_name.to_string(),
            record_id: record_id.to_string(),
            meta_data: meta_data.clone(),
        });
        Ok(())
    }
}
