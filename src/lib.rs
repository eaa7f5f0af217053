//! # chalkdb: Teaching-Grade Relational Storage Core
//!
//! chalkdb is the storage and execution engine of a small relational
//! database: a slotted-page heap store and a B+ tree index behind a
//! locking buffer pool, with a minimal pull-model operator layer on top.
//!
//! ## Quick Start
//!
//! ```ignore
//! use chalkdb::{Database, HeapFile, TupleDesc, DataType, TransactionId};
//!
//! let db = Database::builder().pool_capacity(50).build();
//! let desc = TupleDesc::new(
//!     vec![DataType::Int, DataType::Text],
//!     vec![Some("id".into()), Some("name".into())],
//! );
//! let table = std::sync::Arc::new(HeapFile::open("users.dat", desc)?);
//! db.add_table(table.clone(), "users", "id");
//!
//! let tid = TransactionId::new();
//! table.insert_tuple(&db, tid, &mut tuple)?;
//! db.commit(tid)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Operators: SeqScan, Insert, Delete,    │
//! │             Aggregate                   │
//! ├─────────────────────────────────────────┤
//! │  Iterators: DbFileIterator, OpIterator  │
//! ├─────────────────────────────────────────┤
//! │  BufferPool                             │
//! │    page cache + strict 2PL page locks   │
//! │    deadlock by timeout, NO-STEAL        │
//! ├─────────────────────────────────────────┤
//! │  Access methods                         │
//! │    HeapFile: unordered slotted pages    │
//! │    BTreeFile: sorted leaves, splits,    │
//! │      merges, free-page header chain     │
//! ├─────────────────────────────────────────┤
//! │  Page codecs: heap, leaf, internal,     │
//! │    header, root-ptr                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Every page access goes through the buffer pool under a transaction id:
//! the pool grants a shared or exclusive page lock (waiting up to the
//! deadlock timeout), serves the resident page or decodes it from the
//! owning file, and evicts only clean pages. Commit flushes a
//! transaction's dirty pages; abort discards them, which NO-STEAL makes
//! sufficient to undo every write.
//!
//! ## Module Overview
//!
//! - [`types`] / [`tuple`]: scalar values, schemas, rows, record ids
//! - [`storage`]: page identity, heap pages and files, the buffer pool
//! - [`btree`]: the B+ tree file and its four page codecs
//! - [`catalog`] / [`database`]: table registry and the shared handle
//! - [`exec`]: the operator layer
//! - [`config`]: page size, pool capacity, and lock-timeout defaults

#[macro_use]
mod macros;

pub mod btree;
pub mod catalog;
pub mod config;
pub mod database;
pub mod errors;
pub mod exec;
pub mod storage;
pub mod tuple;
pub mod types;

pub use btree::{BTreeFile, IndexPredicate};
pub use catalog::Catalog;
pub use database::Database;
pub use errors::DbError;
pub use exec::{Aggregate, AggregateOp, Delete, Insert, OpIterator, SeqScan};
pub use storage::{
    BufferPool, DbFile, DbFileIterator, HeapFile, PageId, Permissions, TransactionId,
};
pub use tuple::{RecordId, Tuple, TupleDesc};
pub use types::{DataType, Op, Value};
