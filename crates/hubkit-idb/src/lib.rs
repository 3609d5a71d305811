//! # HubKit IDB
//!
//! An IndexedDB-shaped object-store database used by the offline worker for
//! state that has to outlive the worker process.
//!
//! ## Features
//!
//! - **IDBFactory**: `open()` with upgrade callbacks, `delete_database()`
//! - **IDBDatabase**: object store management
//! - **IDBObjectStore**: key paths, auto-increment keys, CRUD
//! - **Persistence**: optional SQLite backing so databases survive restarts
//!
//! ## Architecture
//!
//! ```text
//! IDBFactory
//!     │
//!     ├── IDBDatabase
//!     │       └── IDBObjectStore
//!     │               └── Records (key → JSON value)
//!     │
//!     └── SqliteBackend (optional, write-through on mutation)
//! ```
//!
//! Read-write work runs inside an [`IDBTransaction`]. Each object store keeps
//! an undo journal while the transaction is open, so a failed transaction is
//! rolled back in place and a successful one writes only the touched records.

use std::cmp::Ordering as CmpOrdering;
use std::path::Path;
use std::sync::{Arc, Mutex};

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub mod persist;

pub use persist::SqliteBackend;

// ==================== Errors ====================

/// IndexedDB errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IDBError {
    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Constraint error: {0}")]
    ConstraintError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Invalid state: {0}")]
    InvalidStateError(String),

    #[error("Version error: {0}")]
    VersionError(String),

    #[error("Storage error: {0}")]
    StorageError(String),
}

// ==================== Keys ====================

/// Key path for object stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// No key path (out-of-line keys).
    None,
    /// Single property.
    Single(String),
}

impl KeyPath {
    /// Extract key from value.
    pub fn extract(&self, value: &JsonValue) -> Option<JsonValue> {
        match self {
            KeyPath::None => None,
            KeyPath::Single(path) => value.get(path).filter(|v| !v.is_null()).cloned(),
        }
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: JsonValue,
    pub value: JsonValue,
}

/// Undo entry: the record under `key` before a mutation.
#[derive(Debug, Clone)]
pub(crate) struct Change {
    key: String,
    previous: Option<Record>,
}

// ==================== IDBObjectStore ====================

/// An object store.
#[derive(Debug, Clone)]
pub struct IDBObjectStore {
    /// Store name.
    pub name: String,

    /// Key path.
    pub key_path: KeyPath,

    /// Auto-increment.
    pub auto_increment: bool,

    /// Records by key string.
    pub(crate) records: HashMap<String, Record>,

    /// Next auto-increment key.
    pub(crate) next_key: u64,

    /// Undo journal, recording only while a transaction is open.
    pub(crate) journal: Option<Vec<Change>>,
}

impl IDBObjectStore {
    /// Create a new object store.
    pub fn new(name: &str, key_path: KeyPath, auto_increment: bool) -> Self {
        Self {
            name: name.to_string(),
            key_path,
            auto_increment,
            records: HashMap::new(),
            next_key: 1,
            journal: None,
        }
    }

    fn record_change(&mut self, key: &str, previous: Option<Record>) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(Change {
                key: key.to_string(),
                previous,
            });
        }
    }

    /// Get a record.
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    /// Get all records in key order.
    pub fn get_all(&self, count: Option<usize>) -> Vec<&Record> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by(|a, b| compare_keys(&a.key, &b.key));
        if let Some(n) = count {
            records.truncate(n);
        }
        records
    }

    /// Get all keys in key order.
    pub fn get_all_keys(&self) -> Vec<String> {
        self.get_all(None)
            .into_iter()
            .map(|r| json_to_key_string(&r.key))
            .collect()
    }

    /// Add a record (fails if key exists).
    pub fn add(&mut self, value: JsonValue, key: Option<JsonValue>) -> Result<String, IDBError> {
        let (key, value) = self.resolve_key(value, key)?;
        let key_str = json_to_key_string(&key);

        if self.records.contains_key(&key_str) {
            return Err(IDBError::ConstraintError(format!(
                "Key already exists: {}",
                key_str
            )));
        }

        self.records.insert(key_str.clone(), Record { key, value });
        self.record_change(&key_str, None);
        Ok(key_str)
    }

    /// Put a record (overwrites if exists).
    pub fn put(&mut self, value: JsonValue, key: Option<JsonValue>) -> Result<String, IDBError> {
        let (key, value) = self.resolve_key(value, key)?;
        let key_str = json_to_key_string(&key);
        let previous = self.records.insert(key_str.clone(), Record { key, value });
        self.record_change(&key_str, previous);
        Ok(key_str)
    }

    /// Delete a record.
    pub fn delete(&mut self, key: &str) -> bool {
        match self.records.remove(key) {
            Some(previous) => {
                self.record_change(key, Some(previous));
                true
            }
            None => false,
        }
    }

    /// Clear all records.
    pub fn clear(&mut self) {
        let drained: Vec<_> = self.records.drain().collect();
        for (key, previous) in drained {
            self.record_change(&key, Some(previous));
        }
    }

    /// Count records.
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Resolve the record key, generating one and writing it into the value
    /// when the store auto-increments.
    fn resolve_key(
        &mut self,
        mut value: JsonValue,
        key: Option<JsonValue>,
    ) -> Result<(JsonValue, JsonValue), IDBError> {
        if let Some(k) = key {
            if self.key_path != KeyPath::None {
                return Err(IDBError::DataError(
                    "Explicit key given for a store with a key path".to_string(),
                ));
            }
            self.observe_key(&k);
            return Ok((k, value));
        }

        if let Some(k) = self.key_path.extract(&value) {
            self.observe_key(&k);
            return Ok((k, value));
        }

        if !self.auto_increment {
            return Err(IDBError::DataError(
                "No key provided and no auto-increment".to_string(),
            ));
        }

        let generated = JsonValue::Number(self.next_key.into());
        self.next_key += 1;

        if let KeyPath::Single(ref path) = self.key_path {
            let object = value.as_object_mut().ok_or_else(|| {
                IDBError::DataError("Generated key needs an object value".to_string())
            })?;
            object.insert(path.clone(), generated.clone());
        }

        Ok((generated, value))
    }

    /// Keep the generator ahead of explicit numeric keys.
    fn observe_key(&mut self, key: &JsonValue) {
        if !self.auto_increment {
            return;
        }
        if let Some(n) = key.as_u64() {
            if n >= self.next_key {
                self.next_key = n + 1;
            }
        }
    }
}

// ==================== IDBDatabase ====================

/// A database.
#[derive(Debug, Clone)]
pub struct IDBDatabase {
    /// Database name.
    pub name: String,

    /// Version.
    pub version: u64,

    /// Object stores.
    pub(crate) stores: HashMap<String, IDBObjectStore>,
}

impl IDBDatabase {
    /// Create a new database.
    pub fn new(name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            stores: HashMap::new(),
        }
    }

    /// Get object store names.
    pub fn object_store_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.stores.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Check for an object store.
    pub fn has_object_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    /// Create object store (only meaningful inside an upgrade).
    pub fn create_object_store(
        &mut self,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<&mut IDBObjectStore, IDBError> {
        if self.stores.contains_key(name) {
            return Err(IDBError::ConstraintError(format!(
                "Object store already exists: {}",
                name
            )));
        }

        Ok(self
            .stores
            .entry(name.to_string())
            .or_insert_with(|| IDBObjectStore::new(name, key_path, auto_increment)))
    }

    /// Delete object store.
    pub fn delete_object_store(&mut self, name: &str) -> Result<(), IDBError> {
        self.stores
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| IDBError::NotFoundError(format!("Object store not found: {}", name)))
    }

    /// Get object store.
    pub fn object_store(&self, name: &str) -> Result<&IDBObjectStore, IDBError> {
        self.stores
            .get(name)
            .ok_or_else(|| IDBError::NotFoundError(format!("Object store not found: {}", name)))
    }

    /// Get object store mutably.
    pub fn object_store_mut(&mut self, name: &str) -> Result<&mut IDBObjectStore, IDBError> {
        self.stores
            .get_mut(name)
            .ok_or_else(|| IDBError::NotFoundError(format!("Object store not found: {}", name)))
    }
}

// ==================== IDBTransaction ====================

/// Read-write access to a database's records. Object stores are created and
/// deleted only during an upgrade.
pub struct IDBTransaction<'a> {
    db: &'a mut IDBDatabase,
    next_keys: Vec<(String, u64)>,
}

impl<'a> IDBTransaction<'a> {
    fn begin(db: &'a mut IDBDatabase) -> Self {
        let next_keys = db
            .stores
            .values_mut()
            .map(|store| {
                store.journal = Some(Vec::new());
                (store.name.clone(), store.next_key)
            })
            .collect();
        Self { db, next_keys }
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.db.name
    }

    pub fn object_store(&self, name: &str) -> Result<&IDBObjectStore, IDBError> {
        self.db.object_store(name)
    }

    pub fn object_store_mut(&mut self, name: &str) -> Result<&mut IDBObjectStore, IDBError> {
        self.db.object_store_mut(name)
    }

    /// Net record changes per touched store.
    fn changes(&self) -> Vec<persist::StoreChanges<'_>> {
        let mut changes = Vec::new();
        for store in self.db.stores.values() {
            let Some(journal) = store.journal.as_ref().filter(|j| !j.is_empty()) else {
                continue;
            };

            let mut seen = HashSet::new();
            let mut upserts = Vec::new();
            let mut deletes = Vec::new();
            for change in journal {
                if !seen.insert(change.key.as_str()) {
                    continue;
                }
                match store.records.get(&change.key) {
                    Some(record) => upserts.push((change.key.as_str(), record)),
                    None => deletes.push(change.key.as_str()),
                }
            }

            changes.push(persist::StoreChanges {
                store: &store.name,
                next_key: store.next_key,
                upserts,
                deletes,
            });
        }
        changes
    }

    fn commit(self) {
        for store in self.db.stores.values_mut() {
            store.journal = None;
        }
    }

    fn rollback(self) {
        for store in self.db.stores.values_mut() {
            let Some(journal) = store.journal.take() else {
                continue;
            };
            for change in journal.into_iter().rev() {
                match change.previous {
                    Some(record) => {
                        store.records.insert(change.key, record);
                    }
                    None => {
                        store.records.remove(&change.key);
                    }
                }
            }
        }
        for (name, next_key) in self.next_keys {
            if let Some(store) = self.db.stores.get_mut(&name) {
                store.next_key = next_key;
            }
        }
    }
}

// ==================== IDBFactory ====================

/// Database info for `databases()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

/// Entry point for opening databases, in memory or SQLite-backed.
#[derive(Clone, Default)]
pub struct IDBFactory {
    /// Databases.
    databases: Arc<RwLock<HashMap<String, IDBDatabase>>>,

    /// Write-through persistence.
    backend: Option<Arc<Mutex<SqliteBackend>>>,
}

impl IDBFactory {
    /// Create an in-memory factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory persisted to a SQLite file, loading whatever it already holds.
    pub fn persistent(path: &Path) -> Result<Self, IDBError> {
        let backend = SqliteBackend::open(path)?;
        let loaded = backend.load_all()?;
        info!(path = %path.display(), databases = loaded.len(), "Opened persistent IDB");

        let databases = loaded
            .into_iter()
            .map(|db| (db.name.clone(), db))
            .collect();

        Ok(Self {
            databases: Arc::new(RwLock::new(databases)),
            backend: Some(Arc::new(Mutex::new(backend))),
        })
    }

    /// Whether this factory writes through to disk.
    pub fn is_persistent(&self) -> bool {
        self.backend.is_some()
    }

    /// Open a database, running `upgrade` when the requested version is newer
    /// than the stored one (including first creation, where the old version is 0).
    pub async fn open<F>(&self, name: &str, version: u64, upgrade: F) -> Result<(), IDBError>
    where
        F: FnOnce(&mut IDBDatabase, u64, u64) -> Result<(), IDBError>,
    {
        if version == 0 {
            return Err(IDBError::VersionError("Version must be at least 1".to_string()));
        }

        let mut databases = self.databases.write().await;
        let current_version = databases.get(name).map(|db| db.version).unwrap_or(0);

        if version < current_version {
            return Err(IDBError::VersionError(format!(
                "Requested version {} is less than current version {}",
                version, current_version
            )));
        }

        if version == current_version {
            return Ok(());
        }

        debug!(db = name, old_version = current_version, new_version = version, "Upgrade needed");

        // Upgrade runs on a copy so a failing callback leaves the stored database untouched
        let mut db = databases
            .get(name)
            .cloned()
            .unwrap_or_else(|| IDBDatabase::new(name, 0));
        upgrade(&mut db, current_version, version)?;
        db.version = version;

        self.flush(&db)?;
        databases.insert(name.to_string(), db);
        Ok(())
    }

    /// Delete a database.
    pub async fn delete_database(&self, name: &str) -> Result<(), IDBError> {
        let mut databases = self.databases.write().await;
        databases.remove(name);
        if let Some(backend) = &self.backend {
            lock(backend)?.delete(name)?;
        }
        Ok(())
    }

    /// List databases.
    pub async fn databases(&self) -> Vec<DatabaseInfo> {
        let databases = self.databases.read().await;
        let mut infos: Vec<_> = databases
            .iter()
            .map(|(name, db)| DatabaseInfo {
                name: name.clone(),
                version: db.version,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Run a read-only operation on a database.
    pub async fn read_database<F, R>(&self, name: &str, f: F) -> Result<R, IDBError>
    where
        F: FnOnce(&IDBDatabase) -> Result<R, IDBError>,
    {
        let databases = self.databases.read().await;
        let db = databases
            .get(name)
            .ok_or_else(|| IDBError::NotFoundError(format!("Database not found: {}", name)))?;
        f(db)
    }

    /// Run a read-write transaction on a database. Changes are committed (and
    /// the touched records persisted) only when `f` succeeds; otherwise they
    /// are rolled back.
    pub async fn with_database<F, R>(&self, name: &str, f: F) -> Result<R, IDBError>
    where
        F: FnOnce(&mut IDBTransaction<'_>) -> Result<R, IDBError>,
    {
        let mut databases = self.databases.write().await;
        let db = databases
            .get_mut(name)
            .ok_or_else(|| IDBError::NotFoundError(format!("Database not found: {}", name)))?;

        let mut tx = IDBTransaction::begin(db);
        let result = match f(&mut tx) {
            Ok(result) => result,
            Err(e) => {
                tx.rollback();
                return Err(e);
            }
        };

        let persisted = match &self.backend {
            Some(backend) => lock(backend).and_then(|mut b| b.apply(tx.name(), &tx.changes())),
            None => Ok(()),
        };
        match persisted {
            Ok(()) => {
                tx.commit();
                Ok(result)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    fn flush(&self, db: &IDBDatabase) -> Result<(), IDBError> {
        match &self.backend {
            Some(backend) => lock(backend)?.save(db),
            None => Ok(()),
        }
    }
}

fn lock(backend: &Mutex<SqliteBackend>) -> Result<std::sync::MutexGuard<'_, SqliteBackend>, IDBError> {
    backend
        .lock()
        .map_err(|_| IDBError::StorageError("SQLite backend lock poisoned".to_string()))
}

// ==================== Helpers ====================

/// Convert JSON value to key string.
pub fn json_to_key_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(arr) => {
            let parts: Vec<String> = arr.iter().map(json_to_key_string).collect();
            format!("[{}]", parts.join(","))
        }
        _ => value.to_string(),
    }
}

/// Order keys the way IndexedDB does: numbers, then strings, then arrays.
fn compare_keys(a: &JsonValue, b: &JsonValue) -> CmpOrdering {
    fn rank(v: &JsonValue) -> u8 {
        match v {
            JsonValue::Number(_) => 0,
            JsonValue::String(_) => 1,
            JsonValue::Array(_) => 2,
            _ => 3,
        }
    }

    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Array(x), JsonValue::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(l, r)| compare_keys(l, r))
            .find(|o| *o != CmpOrdering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}
