//! Record store
//!
//! The control plane persists environments, domains and application
//! infrastructure through the [`RecordStore`] trait. Every call is a single,
//! independent write; callers never rely on multi-record transactions.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! [`FileStore`], which keeps one JSON document per record kind under
//! `<state-dir>/records/`.

use crate::error::{CloudError, Result};
use crate::model::{AppInfra, Domain, Environment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

const STORE_VERSION: u32 = 1;
const RECORDS_DIR: &str = "records";

/// Kind of record, one namespace per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Environment,
    Domain,
    AppInfra,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [
        RecordKind::Environment,
        RecordKind::Domain,
        RecordKind::AppInfra,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Environment => "environments",
            RecordKind::Domain => "domains",
            RecordKind::AppInfra => "app_infra",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed record that can be kept in a [`RecordStore`]
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const KIND: RecordKind;

    fn key(&self) -> String;
}

impl Record for Environment {
    const KIND: RecordKind = RecordKind::Environment;

    fn key(&self) -> String {
        self.name.clone()
    }
}

impl Record for Domain {
    const KIND: RecordKind = RecordKind::Domain;

    fn key(&self) -> String {
        self.name.clone()
    }
}

impl Record for AppInfra {
    const KIND: RecordKind = RecordKind::AppInfra;

    fn key(&self) -> String {
        AppInfra::key_for(&self.app, &self.env)
    }
}

/// Key/value persistence for records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn exists(&self, kind: RecordKind, key: &str) -> Result<bool>;

    async fn get(&self, kind: RecordKind, key: &str) -> Result<Option<serde_json::Value>>;

    /// Insert or replace the record stored under `key`
    async fn put(&self, kind: RecordKind, key: &str, record: serde_json::Value) -> Result<()>;

    /// Remove a record. Removing a missing key is not an error.
    async fn delete(&self, kind: RecordKind, key: &str) -> Result<()>;

    /// All records of a kind, ordered by key
    async fn list(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>>;
}

impl dyn RecordStore {
    pub async fn record_exists<R: Record>(&self, key: &str) -> Result<bool> {
        self.exists(R::KIND, key).await
    }

    pub async fn get_record<R: Record>(&self, key: &str) -> Result<Option<R>> {
        match self.get(R::KIND, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn put_record<R: Record>(&self, record: &R) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.put(R::KIND, &record.key(), value).await
    }

    pub async fn delete_record<R: Record>(&self, key: &str) -> Result<()> {
        self.delete(R::KIND, key).await
    }

    pub async fn list_records<R: Record>(&self) -> Result<Vec<R>> {
        self.list(R::KIND)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(CloudError::from))
            .collect()
    }
}

/// In-memory store, mainly for tests
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<RecordKind, BTreeMap<String, serde_json::Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn exists(&self, kind: RecordKind, key: &str) -> Result<bool> {
        let records = self.records.read().await;
        Ok(records.get(&kind).is_some_and(|r| r.contains_key(key)))
    }

    async fn get(&self, kind: RecordKind, key: &str) -> Result<Option<serde_json::Value>> {
        let records = self.records.read().await;
        Ok(records.get(&kind).and_then(|r| r.get(key)).cloned())
    }

    async fn put(&self, kind: RecordKind, key: &str, record: serde_json::Value) -> Result<()> {
        let mut records = self.records.write().await;
        records
            .entry(kind)
            .or_default()
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(r) = records.get_mut(&kind) {
            r.remove(key);
        }
        Ok(())
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>> {
        let records = self.records.read().await;
        Ok(records
            .get(&kind)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// On-disk layout of one record kind
#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    version: u32,
    updated_at: DateTime<Utc>,
    records: BTreeMap<String, serde_json::Value>,
}

impl Default for RecordFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            updated_at: Utc::now(),
            records: BTreeMap::new(),
        }
    }
}

/// JSON file store: `<root>/records/<kind>.json`
///
/// Every `put` and `delete` rewrites the kind's file through a temporary file
/// and a rename, so a crash never leaves a half-written document behind.
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join(RECORDS_DIR)
    }

    fn kind_path(&self, kind: RecordKind) -> PathBuf {
        self.records_dir().join(format!("{}.json", kind.as_str()))
    }

    async fn load(&self, kind: RecordKind) -> Result<RecordFile> {
        let path = self.kind_path(kind);
        if !fs::try_exists(&path).await? {
            return Ok(RecordFile::default());
        }

        let content = fs::read_to_string(&path).await?;
        let file: RecordFile = serde_json::from_str(&content)?;

        if file.version > STORE_VERSION {
            return Err(CloudError::StoreError(format!(
                "{} has version {}, newer than supported version {}",
                path.display(),
                file.version,
                STORE_VERSION
            )));
        }

        Ok(file)
    }

    async fn save(&self, kind: RecordKind, mut file: RecordFile) -> Result<()> {
        let dir = self.records_dir();
        fs::create_dir_all(&dir).await?;

        file.updated_at = Utc::now();
        let path = self.kind_path(kind);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&file)?).await?;
        fs::rename(&tmp, &path).await?;

        tracing::debug!(kind = %kind, records = file.records.len(), "Saved record file");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn exists(&self, kind: RecordKind, key: &str) -> Result<bool> {
        Ok(self.load(kind).await?.records.contains_key(key))
    }

    async fn get(&self, kind: RecordKind, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.load(kind).await?.records.remove(key))
    }

    async fn put(&self, kind: RecordKind, key: &str, record: serde_json::Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(kind).await?;
        file.records.insert(key.to_string(), record);
        self.save(kind, file).await
    }

    async fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(kind).await?;
        if file.records.remove(key).is_none() {
            return Ok(());
        }
        self.save(kind, file).await
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>> {
        Ok(self.load(kind).await?.records.into_values().collect())
    }
}
