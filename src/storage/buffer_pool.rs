//! # Buffer Pool
//!
//! A bounded page cache that doubles as the lock manager for strict
//! two-phase locking at page granularity. Every page access in the system
//! funnels through [`BufferPool::get_page`].
//!
//! ## Lock tables
//!
//! ```text
//! shared:    PageId -> {TransactionId}     readers currently admitted
//! exclusive: PageId -> TransactionId       sole writer, if any
//! by_txn:    TransactionId -> {PageId}     every lock a transaction holds
//! ```
//!
//! All three live under one `parking_lot::Mutex`, paired with a `Condvar`
//! that is notified on every release. A blocked `get_page` waits on the
//! condvar and re-checks; the guard is dropped for the duration of each
//! wait so other threads make progress.
//!
//! ## Deadlock policy
//!
//! Wait-to-abort by wall-clock timeout: no waits-for graph is built. Each
//! wait samples its elapsed time against a fixed budget (10 s by default)
//! and raises `TransactionAborted` on expiry. The caller is expected to
//! route that error to `transaction_complete(tid, false)` and may retry
//! under a fresh transaction id.
//!
//! ## Lock compatibility
//!
//! - READ_ONLY waits while a *different* transaction holds the exclusive
//!   lock. Holding the exclusive lock already implies read access, so the
//!   holder is not added to the shared set.
//! - READ_WRITE waits while any other transaction holds a shared or
//!   exclusive lock. If the only remaining shared holder is the requester
//!   itself, the lock upgrades in place.
//!
//! ## NO-STEAL eviction
//!
//! A full cache evicts an arbitrary clean resident page. Dirty pages are
//! never written out ahead of their transaction's commit; when every
//! resident page is dirty the pool fails with `NoEvictablePage`. Abort
//! relies on this: discarding a transaction's dirty pages is guaranteed to
//! restore the pre-transaction image, because disk was never touched.
//!
//! ## Strict 2PL
//!
//! Locks are released only by `transaction_complete` (commit or abort) or
//! the explicit `release_page` escape hatch. Commit flushes the
//! transaction's dirty pages through the owning file and clears their dirty
//! bits; abort drops them from the cache so the next access re-reads disk.

use crate::database::Database;
use crate::errors::DbError;
use crate::storage::{PageHandle, PageId, Permissions, TransactionId};
use eyre::Result;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LockTables {
    shared: HashMap<PageId, HashSet<TransactionId>>,
    exclusive: HashMap<PageId, TransactionId>,
    by_txn: HashMap<TransactionId, HashSet<PageId>>,
}

impl LockTables {
    fn exclusive_held_by_other(&self, pid: &PageId, tid: TransactionId) -> bool {
        self.exclusive.get(pid).is_some_and(|owner| *owner != tid)
    }

    fn shared_held_by_other(&self, pid: &PageId, tid: TransactionId) -> bool {
        self.shared
            .get(pid)
            .is_some_and(|holders| holders.iter().any(|holder| *holder != tid))
    }

    fn release(&mut self, tid: TransactionId, pid: &PageId) {
        if let Some(holders) = self.shared.get_mut(pid) {
            holders.remove(&tid);
            if holders.is_empty() {
                self.shared.remove(pid);
            }
        }
        if self.exclusive.get(pid) == Some(&tid) {
            self.exclusive.remove(pid);
        }
        if let Some(pages) = self.by_txn.get_mut(&tid) {
            pages.remove(pid);
            if pages.is_empty() {
                self.by_txn.remove(&tid);
            }
        }
    }
}

pub struct BufferPool {
    capacity: usize,
    lock_timeout: Duration,
    cache: Mutex<HashMap<PageId, PageHandle>>,
    locks: Mutex<LockTables>,
    released: Condvar,
    // Serializes the maintenance surface: flush_all_pages, flush_page,
    // and discard_page never interleave with each other.
    maintenance: Mutex<()>,
}

impl BufferPool {
    pub fn new(capacity: usize, lock_timeout: Duration) -> Self {
        assert!(capacity > 0, "buffer pool needs at least one page");
        Self {
            capacity,
            lock_timeout,
            cache: Mutex::new(HashMap::with_capacity(capacity)),
            locks: Mutex::new(LockTables::default()),
            released: Condvar::new(),
            maintenance: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquires the requested lock on `pid` for `tid` (blocking, with the
    /// deadlock timeout), then returns the resident page, reading it from
    /// the owning file on a miss and evicting a clean page if the cache is
    /// at capacity.
    pub fn get_page(
        &self,
        db: &Database,
        tid: TransactionId,
        pid: PageId,
        perm: Permissions,
    ) -> Result<PageHandle> {
        self.acquire_lock(tid, pid, perm)?;

        if let Some(handle) = self.cache.lock().get(&pid) {
            return Ok(handle.clone());
        }

        // Miss: decode outside the cache lock, then install.
        let file = db.db_file(pid.table_id())?;
        let page = file.read_page(&pid)?;

        let mut cache = self.cache.lock();
        if let Some(handle) = cache.get(&pid) {
            return Ok(handle.clone());
        }
        if cache.len() >= self.capacity {
            Self::evict(&mut cache)?;
        }
        let handle: PageHandle = Arc::new(RwLock::new(page));
        cache.insert(pid, handle.clone());
        Ok(handle)
    }

    fn acquire_lock(&self, tid: TransactionId, pid: PageId, perm: Permissions) -> Result<()> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut locks = self.locks.lock();

        match perm {
            Permissions::ReadOnly => {
                while locks.exclusive_held_by_other(&pid, tid) {
                    self.wait_or_abort(&mut locks, deadline)?;
                }
                // The exclusive holder reads through its own lock.
                if locks.exclusive.get(&pid) != Some(&tid) {
                    locks.shared.entry(pid).or_default().insert(tid);
                }
            }
            Permissions::ReadWrite => {
                while locks.exclusive_held_by_other(&pid, tid)
                    || locks.shared_held_by_other(&pid, tid)
                {
                    self.wait_or_abort(&mut locks, deadline)?;
                }
                // Sole remaining shared holder is us: upgrade in place.
                if let Some(holders) = locks.shared.get_mut(&pid) {
                    holders.remove(&tid);
                    if holders.is_empty() {
                        locks.shared.remove(&pid);
                    }
                }
                locks.exclusive.insert(pid, tid);
            }
        }

        locks.by_txn.entry(tid).or_default().insert(pid);
        Ok(())
    }

    fn wait_or_abort(
        &self,
        locks: &mut MutexGuard<'_, LockTables>,
        deadline: Instant,
    ) -> Result<()> {
        let now = Instant::now();
        if now >= deadline {
            return Err(DbError::TransactionAborted.into());
        }
        let _ = self.released.wait_for(locks, deadline - now);
        Ok(())
    }

    /// Drops one clean resident page; fails when every page is dirty.
    fn evict(cache: &mut HashMap<PageId, PageHandle>) -> Result<()> {
        let victim = cache
            .iter()
            .find(|(_, handle)| handle.read().is_dirty().is_none())
            .map(|(pid, _)| *pid);
        match victim {
            Some(pid) => {
                cache.remove(&pid);
                Ok(())
            }
            None => Err(DbError::NoEvictablePage.into()),
        }
    }

    /// Releases a single lock early. Strict 2PL frowns on this; it exists
    /// for callers that know the page was only inspected, never depended on.
    pub fn release_page(&self, tid: TransactionId, pid: PageId) {
        self.locks.lock().release(tid, &pid);
        self.released.notify_all();
    }

    /// True iff `tid` currently holds any lock on `pid`.
    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.locks
            .lock()
            .by_txn
            .get(&tid)
            .is_some_and(|pages| pages.contains(&pid))
    }

    /// Commits or aborts `tid`: commit flushes its dirty pages, abort
    /// discards them, and either way every lock is released.
    pub fn transaction_complete(
        &self,
        db: &Database,
        tid: TransactionId,
        commit: bool,
    ) -> Result<()> {
        let pages: Vec<PageId> = self
            .locks
            .lock()
            .by_txn
            .get(&tid)
            .map(|pids| pids.iter().copied().collect())
            .unwrap_or_default();

        for pid in &pages {
            let handle = self.cache.lock().get(pid).cloned();
            let Some(handle) = handle else { continue };
            if handle.read().is_dirty().is_none() {
                continue;
            }
            if commit {
                self.flush_handle(db, &handle, tid)?;
            } else {
                // NO-STEAL: disk still has the pre-transaction image, so
                // dropping the page undoes the writes.
                self.cache.lock().remove(pid);
            }
        }

        let mut locks = self.locks.lock();
        for pid in &pages {
            locks.release(tid, pid);
        }
        drop(locks);
        self.released.notify_all();
        Ok(())
    }

    fn flush_handle(&self, db: &Database, handle: &PageHandle, tid: TransactionId) -> Result<()> {
        let guard = handle.read();
        let file = db.db_file(guard.id().table_id())?;
        file.write_page(&guard)?;
        drop(guard);
        handle.write().mark_dirty(false, tid);
        Ok(())
    }

    /// Inserts through the table's file (which takes its own READ_WRITE
    /// locks) and marks every dirtied page with `tid`.
    pub fn insert_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        table_id: u32,
        tuple: &mut crate::tuple::Tuple,
    ) -> Result<()> {
        let file = db.db_file(table_id)?;
        let dirtied = file.insert_tuple(db, tid, tuple)?;
        self.mark_pages_dirty(tid, &dirtied);
        Ok(())
    }

    /// Deletes through the owning file and marks every dirtied page.
    pub fn delete_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        tuple: &crate::tuple::Tuple,
    ) -> Result<()> {
        let rid = tuple.record_id().ok_or(DbError::NotFound)?;
        let file = db.db_file(rid.page_id.table_id())?;
        let dirtied = file.delete_tuple(db, tid, tuple)?;
        self.mark_pages_dirty(tid, &dirtied);
        Ok(())
    }

    fn mark_pages_dirty(&self, tid: TransactionId, pids: &[PageId]) {
        for pid in pids {
            if let Some(handle) = self.cache.lock().get(pid).cloned() {
                handle.write().mark_dirty(true, tid);
            }
        }
    }

    /// Writes every dirty resident page to disk. Breaks NO-STEAL for pages
    /// of uncommitted transactions; callers own that risk.
    pub fn flush_all_pages(&self, db: &Database) -> Result<()> {
        let _guard = self.maintenance.lock();
        let handles: Vec<PageHandle> = self.cache.lock().values().cloned().collect();
        for handle in handles {
            if let Some(tid) = handle.read().is_dirty() {
                self.flush_handle(db, &handle, tid)?;
            }
        }
        Ok(())
    }

    /// Writes one page to disk if dirty.
    pub fn flush_page(&self, db: &Database, pid: PageId) -> Result<()> {
        let _guard = self.maintenance.lock();
        let handle = self.cache.lock().get(&pid).cloned();
        if let Some(handle) = handle {
            if let Some(tid) = handle.read().is_dirty() {
                self.flush_handle(db, &handle, tid)?;
            }
        }
        Ok(())
    }

    /// Drops a page from the cache without writing it, dirty or not. Used
    /// when a page's on-disk identity is about to change under it.
    pub fn discard_page(&self, pid: PageId) {
        let _guard = self.maintenance.lock();
        self.cache.lock().remove(&pid);
    }

    #[cfg(test)]
    pub(crate) fn cached_page_count(&self) -> usize {
        self.cache.lock().len()
    }
}
