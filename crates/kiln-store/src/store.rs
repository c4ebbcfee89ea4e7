//! MetadataStore — redb-backed persistence for Kiln definitions.
//!
//! The store itself only knows about tables of JSON values; typed access
//! and versioning live in [`Repository`](crate::Repository). Both on-disk
//! and in-memory backends are supported, the latter for tests and the
//! daemon's ephemeral standalone mode.

use std::path::Path;
use std::sync::Arc;

use kiln_core::{Environment, Function, HttpTrigger};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::repository::{Repository, Resource};
use crate::tables::*;

/// A table of JSON values keyed by `{namespace}/{name}`.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe metadata store backed by redb.
#[derive(Clone)]
pub struct MetadataStore {
    db: Arc<Database>,
}

impl MetadataStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "metadata store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory metadata store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(FUNCTIONS).map_err(map_err!(Table))?;
        txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
        txn.open_table(HTTP_TRIGGERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Typed repositories ─────────────────────────────────────────

    pub fn repository<R: Resource>(&self) -> Repository<R> {
        Repository::new(self.clone())
    }

    pub fn functions(&self) -> Repository<Function> {
        self.repository()
    }

    pub fn environments(&self) -> Repository<Environment> {
        self.repository()
    }

    pub fn http_triggers(&self) -> Repository<HttpTrigger> {
        self.repository()
    }

    // ── Raw table access ───────────────────────────────────────────

    /// Read one value by key.
    pub(crate) fn read<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> StoreResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Read every value whose key starts with `prefix`.
    pub(crate) fn scan<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        prefix: &str,
    ) -> StoreResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    /// Read-modify-write a single key inside one write transaction.
    ///
    /// `f` receives the current value (if any) and returns the value to
    /// store; returning an error aborts the transaction untouched.
    pub(crate) fn upsert<T, F>(&self, table: JsonTable, key: &str, f: F) -> StoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> StoreResult<T>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next = {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let next = f(current)?;
            let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
            next
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    /// Delete a key. Returns true if it existed.
    pub(crate) fn remove(&self, table: JsonTable, key: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
