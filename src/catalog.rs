//! Table registry: resolves table ids and names to their access methods.

use crate::storage::{DbFile, TableId};
use crate::tuple::TupleDesc;
use eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::DbError;

struct TableEntry {
    file: Arc<dyn DbFile>,
    name: String,
    primary_key: String,
}

/// Maps table ids and names to their [`DbFile`]s. Adding a table under an
/// existing name or id replaces the previous registration, so re-opened
/// files and renamed tables resolve to exactly one entry.
#[derive(Default)]
pub struct Catalog {
    tables: HashMap<TableId, TableEntry>,
    ids_by_name: HashMap<String, TableId>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, file: Arc<dyn DbFile>, name: &str, primary_key: &str) {
        let id = file.id();
        if let Some(old_id) = self.ids_by_name.remove(name) {
            self.tables.remove(&old_id);
        }
        if let Some(old) = self.tables.remove(&id) {
            self.ids_by_name.remove(&old.name);
        }
        self.ids_by_name.insert(name.to_string(), id);
        self.tables.insert(
            id,
            TableEntry { file, name: name.to_string(), primary_key: primary_key.to_string() },
        );
    }

    pub fn table_id(&self, name: &str) -> Result<TableId> {
        self.ids_by_name.get(name).copied().ok_or_else(|| DbError::NotFound.into())
    }

    pub fn db_file(&self, id: TableId) -> Result<Arc<dyn DbFile>> {
        self.tables
            .get(&id)
            .map(|entry| entry.file.clone())
            .ok_or_else(|| DbError::NotFound.into())
    }

    pub fn tuple_desc(&self, id: TableId) -> Result<TupleDesc> {
        Ok(self.db_file(id)?.tuple_desc().clone())
    }

    pub fn table_name(&self, id: TableId) -> Result<String> {
        self.tables
            .get(&id)
            .map(|entry| entry.name.clone())
            .ok_or_else(|| DbError::NotFound.into())
    }

    pub fn primary_key(&self, id: TableId) -> Result<String> {
        self.tables
            .get(&id)
            .map(|entry| entry.primary_key.clone())
            .ok_or_else(|| DbError::NotFound.into())
    }

    /// Ids of every registered table.
    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
        self.ids_by_name.clear();
    }
}
