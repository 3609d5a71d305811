//! SQLite write-through backend for [`IDBFactory`](crate::IDBFactory).

use std::path::Path;

use chrono::Utc;
use hashbrown::HashMap;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, trace};

use crate::{IDBDatabase, IDBError, IDBObjectStore, KeyPath, Record};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

fn storage_err(e: rusqlite::Error) -> IDBError {
    IDBError::StorageError(e.to_string())
}

fn data_err(e: serde_json::Error) -> IDBError {
    IDBError::DataError(e.to_string())
}

/// Net record changes one transaction made to an object store.
#[derive(Debug)]
pub struct StoreChanges<'a> {
    pub store: &'a str,
    pub next_key: u64,
    /// Records written, by key string.
    pub upserts: Vec<(&'a str, &'a Record)>,
    /// Keys removed.
    pub deletes: Vec<&'a str>,
}

/// Persists databases into a single SQLite file. Upgrades rewrite a whole
/// database; transactions write only the records they touched.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (or create) the backing file and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, IDBError> {
        let conn = Connection::open(path).map_err(|e| {
            IDBError::StorageError(format!("Failed to open IDB file {}: {}", path.display(), e))
        })?;
        Self::init(conn)
    }

    /// Backend on a private in-memory SQLite database.
    pub fn open_in_memory() -> Result<Self, IDBError> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, IDBError> {
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(storage_err)?;

        let table_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
                [],
                |row| row.get::<_, i32>(0).map(|count| count > 0),
            )
            .unwrap_or(false);

        let version: i32 = if table_exists {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?
            .unwrap_or(0)
        } else {
            0
        };

        if version < SCHEMA_VERSION {
            create_schema_v1(&conn)?;
        }

        Ok(Self { conn })
    }

    /// Load every stored database.
    pub fn load_all(&self) -> Result<Vec<IDBDatabase>, IDBError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, version FROM idb_databases ORDER BY name")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(storage_err)?;

        let mut databases = Vec::new();
        for row in rows {
            let (name, version) = row.map_err(storage_err)?;
            let mut db = IDBDatabase::new(&name, version as u64);
            db.stores = self.load_stores(&name)?;
            databases.push(db);
        }
        Ok(databases)
    }

    fn load_stores(&self, db_name: &str) -> Result<HashMap<String, IDBObjectStore>, IDBError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, key_path, auto_increment, next_key FROM idb_stores WHERE db_name = ?1",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![db_name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(storage_err)?;

        let mut stores = HashMap::new();
        for row in rows {
            let (name, key_path, auto_increment, next_key) = row.map_err(storage_err)?;
            let key_path = key_path.map(KeyPath::Single).unwrap_or(KeyPath::None);
            let mut store = IDBObjectStore::new(&name, key_path, auto_increment);
            store.next_key = next_key.max(1) as u64;
            store.records = self.load_records(db_name, &name)?;
            stores.insert(name, store);
        }
        Ok(stores)
    }

    fn load_records(
        &self,
        db_name: &str,
        store_name: &str,
    ) -> Result<HashMap<String, Record>, IDBError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT key_string, key_json, value_json FROM idb_records
                 WHERE db_name = ?1 AND store_name = ?2",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![db_name, store_name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(storage_err)?;

        let mut records = HashMap::new();
        for row in rows {
            let (key_string, key_json, value_json) = row.map_err(storage_err)?;
            let record = Record {
                key: serde_json::from_str(&key_json).map_err(data_err)?,
                value: serde_json::from_str(&value_json).map_err(data_err)?,
            };
            records.insert(key_string, record);
        }
        Ok(records)
    }

    /// Replace the stored copy of `db` in one transaction.
    pub fn save(&mut self, db: &IDBDatabase) -> Result<(), IDBError> {
        let tx = self.conn.transaction().map_err(storage_err)?;

        tx.execute("DELETE FROM idb_databases WHERE name = ?1", params![db.name])
            .map_err(storage_err)?;
        tx.execute(
            "INSERT INTO idb_databases (name, version, updated_at) VALUES (?1, ?2, ?3)",
            params![db.name, db.version as i64, Utc::now().timestamp_millis()],
        )
        .map_err(storage_err)?;

        let mut record_count = 0usize;
        for store in db.stores.values() {
            let key_path = match &store.key_path {
                KeyPath::None => None,
                KeyPath::Single(path) => Some(path.as_str()),
            };
            tx.execute(
                "INSERT INTO idb_stores (db_name, name, key_path, auto_increment, next_key)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    db.name,
                    store.name,
                    key_path,
                    store.auto_increment,
                    store.next_key as i64
                ],
            )
            .map_err(storage_err)?;

            for (key_string, record) in &store.records {
                let key_json = serde_json::to_string(&record.key).map_err(data_err)?;
                let value_json = serde_json::to_string(&record.value).map_err(data_err)?;
                tx.execute(
                    "INSERT INTO idb_records (db_name, store_name, key_string, key_json, value_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![db.name, store.name, key_string, key_json, value_json],
                )
                .map_err(storage_err)?;
                record_count += 1;
            }
        }

        tx.commit().map_err(storage_err)?;
        trace!(db = %db.name, stores = db.stores.len(), records = record_count, "Persisted database");
        Ok(())
    }

    /// Write one transaction's record changes.
    pub fn apply(&mut self, db_name: &str, changes: &[StoreChanges<'_>]) -> Result<(), IDBError> {
        if changes.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction().map_err(storage_err)?;
        {
            let mut upsert = tx
                .prepare_cached(
                    "INSERT INTO idb_records (db_name, store_name, key_string, key_json, value_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (db_name, store_name, key_string)
                     DO UPDATE SET key_json = excluded.key_json, value_json = excluded.value_json",
                )
                .map_err(storage_err)?;
            let mut delete = tx
                .prepare_cached(
                    "DELETE FROM idb_records
                     WHERE db_name = ?1 AND store_name = ?2 AND key_string = ?3",
                )
                .map_err(storage_err)?;
            let mut bump = tx
                .prepare_cached(
                    "UPDATE idb_stores SET next_key = ?3 WHERE db_name = ?1 AND name = ?2",
                )
                .map_err(storage_err)?;

            for change in changes {
                for (key_string, record) in &change.upserts {
                    let key_json = serde_json::to_string(&record.key).map_err(data_err)?;
                    let value_json = serde_json::to_string(&record.value).map_err(data_err)?;
                    upsert
                        .execute(params![db_name, change.store, key_string, key_json, value_json])
                        .map_err(storage_err)?;
                }
                for key_string in &change.deletes {
                    delete
                        .execute(params![db_name, change.store, key_string])
                        .map_err(storage_err)?;
                }
                bump.execute(params![db_name, change.store, change.next_key as i64])
                    .map_err(storage_err)?;
            }

            tx.execute(
                "UPDATE idb_databases SET updated_at = ?2 WHERE name = ?1",
                params![db_name, Utc::now().timestamp_millis()],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;

        trace!(
            db = db_name,
            stores = changes.len(),
            upserts = changes.iter().map(|c| c.upserts.len()).sum::<usize>(),
            deletes = changes.iter().map(|c| c.deletes.len()).sum::<usize>(),
            "Persisted transaction"
        );
        Ok(())
    }

    /// Remove a database and everything under it.
    pub fn delete(&mut self, name: &str) -> Result<(), IDBError> {
        let removed = self
            .conn
            .execute("DELETE FROM idb_databases WHERE name = ?1", params![name])
            .map_err(storage_err)?;
        debug!(db = name, removed, "Deleted persisted database");
        Ok(())
    }
}

/// Create initial schema (version 1)
fn create_schema_v1(conn: &Connection) -> Result<(), IDBError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS idb_databases (
            name TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS idb_stores (
            db_name TEXT NOT NULL REFERENCES idb_databases(name) ON DELETE CASCADE,
            name TEXT NOT NULL,
            key_path TEXT,
            auto_increment INTEGER NOT NULL,
            next_key INTEGER NOT NULL,
            PRIMARY KEY (db_name, name)
        );

        CREATE TABLE IF NOT EXISTS idb_records (
            db_name TEXT NOT NULL,
            store_name TEXT NOT NULL,
            key_string TEXT NOT NULL,
            key_json TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY (db_name, store_name, key_string),
            FOREIGN KEY (db_name, store_name) REFERENCES idb_stores(db_name, name) ON DELETE CASCADE
        );
        "#,
    )
    .map_err(storage_err)?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, Utc::now().timestamp()],
    )
    .map_err(storage_err)?;

    Ok(())
}
