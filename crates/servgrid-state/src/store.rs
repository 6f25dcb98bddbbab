//! StateStore: redb-backed persistence for tasks, groups and node records.
//!
//! Values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing),
//! and implements [`TaskProvider`] and [`GroupProvider`] for the scheduler.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::task::{GroupConfiguration, GroupProvider, ServiceTask, TaskProvider};
use crate::types::NodeInfo;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON rows ──────────────────────────────────────────

    fn put_row<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_row<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
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

    fn list_rows<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete_row(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or update a task.
    pub fn put_task(&self, task: &ServiceTask) -> StateResult<()> {
        if !servgrid_core::is_valid_name(&task.name) {
            return Err(StateError::InvalidName(task.name.clone()));
        }
        self.put_row(TASKS, &task.name, task)?;
        debug!(task = %task.name, "task stored");
        Ok(())
    }

    pub fn get_task(&self, name: &str) -> StateResult<Option<ServiceTask>> {
        self.get_row(TASKS, name)
    }

    pub fn list_tasks(&self) -> StateResult<Vec<ServiceTask>> {
        self.list_rows(TASKS)
    }

    /// Delete a task by name. Returns true if it existed.
    pub fn delete_task(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete_row(TASKS, name)?;
        debug!(task = %name, existed, "task deleted");
        Ok(existed)
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn put_group(&self, group: &GroupConfiguration) -> StateResult<()> {
        if !servgrid_core::is_valid_name(&group.name) {
            return Err(StateError::InvalidName(group.name.clone()));
        }
        self.put_row(GROUPS, &group.name, group)?;
        debug!(group = %group.name, "group stored");
        Ok(())
    }

    pub fn get_group(&self, name: &str) -> StateResult<Option<GroupConfiguration>> {
        self.get_row(GROUPS, name)
    }

    pub fn list_groups(&self) -> StateResult<Vec<GroupConfiguration>> {
        self.list_rows(GROUPS)
    }

    pub fn delete_group(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete_row(GROUPS, name)?;
        debug!(group = %name, existed, "group deleted");
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update the last known record of a node.
    pub fn put_node(&self, node: &NodeInfo) -> StateResult<()> {
        self.put_row(NODES, &node.id, node)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        self.get_row(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<NodeInfo>> {
        self.list_rows(NODES)
    }

    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        self.delete_row(NODES, node_id)
    }
}

impl TaskProvider for StateStore {
    fn tasks(&self) -> StateResult<Vec<ServiceTask>> {
        self.list_tasks()
    }

    fn task(&self, name: &str) -> StateResult<Option<ServiceTask>> {
        self.get_task(name)
    }
}

impl GroupProvider for StateStore {
    fn groups(&self) -> StateResult<Vec<GroupConfiguration>> {
        self.list_groups()
    }

    fn group(&self, name: &str) -> StateResult<Option<GroupConfiguration>> {
        self.get_group(name)
    }
}
