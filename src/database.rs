//! The database handle: one catalog, one buffer pool.
//!
//! Everything that crosses component boundaries flows through a shared
//! `&Database`: files reach the buffer pool through it, the buffer pool
//! resolves files through the catalog, and operators do both. Build one
//! with defaults or through the builder:
//!
//! ```ignore
//! let db = Database::builder()
//!     .pool_capacity(50)
//!     .lock_timeout(Duration::from_secs(10))
//!     .build();
//! ```

use crate::catalog::Catalog;
use crate::config::{DEFAULT_LOCK_TIMEOUT, DEFAULT_POOL_CAPACITY};
use crate::storage::{
    BufferPool, DbFile, PageHandle, PageId, Permissions, TableId, TransactionId,
};
use crate::tuple::TupleDesc;
use eyre::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

pub struct Database {
    catalog: RwLock<Catalog>,
    buffer_pool: BufferPool,
}

impl Database {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    /// Registers a table under `name`. An existing table with the same
    /// name or backing file is replaced.
    pub fn add_table(&self, file: Arc<dyn DbFile>, name: &str, primary_key: &str) {
        self.catalog.write().add_table(file, name, primary_key);
    }

    pub fn table_id(&self, name: &str) -> Result<TableId> {
        self.catalog.read().table_id(name)
    }

    pub fn db_file(&self, id: TableId) -> Result<Arc<dyn DbFile>> {
        self.catalog.read().db_file(id)
    }

    pub fn tuple_desc(&self, id: TableId) -> Result<TupleDesc> {
        self.catalog.read().tuple_desc(id)
    }

    pub fn table_name(&self, id: TableId) -> Result<String> {
        self.catalog.read().table_name(id)
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.catalog.read().table_ids()
    }

    /// Shorthand for [`BufferPool::get_page`].
    pub fn get_page(
        &self,
        tid: TransactionId,
        pid: PageId,
        perm: Permissions,
    ) -> Result<PageHandle> {
        self.buffer_pool.get_page(self, tid, pid, perm)
    }

    /// Commits `tid`: flushes its dirty pages and releases its locks.
    pub fn commit(&self, tid: TransactionId) -> Result<()> {
        self.buffer_pool.transaction_complete(self, tid, true)
    }

    /// Aborts `tid`: discards its dirty pages and releases its locks.
    pub fn abort(&self, tid: TransactionId) -> Result<()> {
        self.buffer_pool.transaction_complete(self, tid, false)
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DatabaseBuilder {
    pool_capacity: usize,
    lock_timeout: Duration,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl DatabaseBuilder {
    /// Number of pages the buffer pool may hold resident.
    pub fn pool_capacity(mut self, pages: usize) -> Self {
        self.pool_capacity = pages;
        self
    }

    /// Budget a lock wait may consume before its transaction aborts.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn build(self) -> Database {
        Database {
            catalog: RwLock::new(Catalog::new()),
            buffer_pool: BufferPool::new(self.pool_capacity, self.lock_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_settings() {
        let db = Database::builder().pool_capacity(7).build();
        assert_eq!(db.buffer_pool().capacity(), 7);
    }

    #[test]
    fn default_database_uses_the_default_capacity() {
        let db = Database::new();
        assert_eq!(db.buffer_pool().capacity(), DEFAULT_POOL_CAPACITY);
    }

    #[test]
    fn unknown_table_lookups_fail() {
        let db = Database::new();
        assert!(db.table_id("missing").is_err());
        assert!(db.db_file(1).is_err());
    }
}
