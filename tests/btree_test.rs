//! End-to-end B+ tree scenarios: bulk reverse-order inserts, a delete
//! storm over the middle of the key space with structural invariants
//! checkpointed along the way, collapse back to an empty root leaf, and
//! free-page reuse.

use chalkdb::btree::{BTreePageId, PageCategory};
use chalkdb::types::Op;
use chalkdb::{
    BTreeFile, Database, DataType, DbFile, DbFileIterator, IndexPredicate, Permissions,
    TransactionId, Tuple, TupleDesc, Value,
};
use std::sync::Arc;
use tempfile::tempdir;

const BATCH: usize = 500;

fn row_desc() -> TupleDesc {
    TupleDesc::new(
        vec![DataType::Int, DataType::Int],
        vec![Some("key".into()), Some("payload".into())],
    )
}

fn row(key: i32) -> Tuple {
    Tuple::new(row_desc(), vec![Value::Int(key), Value::Int(key.wrapping_mul(2))]).unwrap()
}

fn open_tree(dir: &tempfile::TempDir) -> (Database, Arc<BTreeFile>, u32) {
    // The delete storm dirties most of the tree inside one transaction;
    // NO-STEAL needs headroom beyond the 50-page default.
    let db = Database::builder().pool_capacity(500).build();
    let file = Arc::new(BTreeFile::open(dir.path().join("index.dat"), 0, row_desc()).unwrap());
    let table_id = file.id();
    db.add_table(file.clone(), "index", "key");
    (db, file, table_id)
}

fn insert_keys(db: &Database, file: &BTreeFile, keys: impl Iterator<Item = i32>) {
    let mut tid = TransactionId::new();
    let mut in_batch = 0;
    for key in keys {
        let mut t = row(key);
        file.insert_tuple(db, tid, &mut t).unwrap();
        in_batch += 1;
        if in_batch == BATCH {
            db.commit(tid).unwrap();
            tid = TransactionId::new();
            in_batch = 0;
        }
    }
    db.commit(tid).unwrap();
}

/// Deletes one tuple per key, re-locating each through an equality index
/// scan because rebalancing moves record ids underneath long batches.
fn delete_keys(db: &Database, file: &BTreeFile, keys: &[i32]) {
    let mut tid = TransactionId::new();
    let mut in_batch = 0;
    for key in keys {
        let victim = {
            let mut iter = file.index_iter(db, tid, IndexPredicate::new(Op::Equals, Value::Int(*key)));
            iter.open().unwrap();
            let t = iter.next().unwrap();
            iter.close();
            t
        };
        file.delete_tuple(db, tid, &victim).unwrap();
        in_batch += 1;
        if in_batch == BATCH {
            db.commit(tid).unwrap();
            tid = TransactionId::new();
            in_batch = 0;
        }
    }
    db.commit(tid).unwrap();
}

fn scan_keys(db: &Database, file: &BTreeFile) -> Vec<i32> {
    let tid = TransactionId::new();
    let mut iter = file.iter(db, tid).unwrap();
    iter.open().unwrap();
    let mut keys = Vec::new();
    while iter.has_next().unwrap() {
        match iter.next().unwrap().value(0) {
            Value::Int(v) => keys.push(*v),
            other => panic!("unexpected {:?}", other),
        }
    }
    iter.close();
    db.commit(tid).unwrap();
    keys
}

/// Walks the whole tree checking the structural invariants: sorted keys,
/// consistent parent pointers, minimum occupancy of non-root pages, and
/// the doubly linked leaf list.
fn check_tree(db: &Database, table_id: u32) {
    let tid = TransactionId::new();
    let root_ptr_pid = BTreePageId::root_ptr(table_id);
    let handle = db.get_page(tid, root_ptr_pid.into(), Permissions::ReadOnly).unwrap();
    let root_id = handle.read().as_root_ptr().unwrap().root_id();
    drop(handle);

    let Some(root_id) = root_id else {
        db.commit(tid).unwrap();
        return;
    };

    let leaf_capacity = chalkdb::btree::LeafPage::capacity(&row_desc());
    let internal_capacity = chalkdb::btree::InternalPage::capacity(DataType::Int);

    let mut leftmost_leaf = None;
    let mut stack = vec![(root_id, true)];
    while let Some((pid, is_root)) = stack.pop() {
        match pid.category {
            PageCategory::Internal => {
                let handle = db.get_page(tid, pid.into(), Permissions::ReadOnly).unwrap();
                let guard = handle.read();
                let page = guard.as_internal().unwrap();
                let entries = page.entries();
                assert!(!entries.is_empty(), "internal page {} is empty", pid.page_no);
                if !is_root {
                    assert!(
                        page.entry_count() >= internal_capacity / 2,
                        "internal page {} below minimum occupancy: {} < {}",
                        pid.page_no,
                        page.entry_count(),
                        internal_capacity / 2
                    );
                }
                for pair in entries.windows(2) {
                    assert!(
                        pair[0].key.compare(Op::LessThan, &pair[1].key).unwrap(),
                        "internal keys out of order on page {}",
                        pid.page_no
                    );
                }
                for child in page.children() {
                    stack.push((child, false));
                }
            }
            PageCategory::Leaf => {
                let handle = db.get_page(tid, pid.into(), Permissions::ReadOnly).unwrap();
                let guard = handle.read();
                let leaf = guard.as_leaf().unwrap();
                if !is_root {
                    assert!(
                        leaf.tuple_count() >= leaf_capacity / 2,
                        "leaf {} below minimum occupancy: {} < {}",
                        pid.page_no,
                        leaf.tuple_count(),
                        leaf_capacity / 2
                    );
                }
                if leaf.left_sibling_id().is_none() {
                    leftmost_leaf = Some(pid);
                }
            }
            other => panic!("unexpected {:?} page in the tree body", other),
        }
    }

    // Leaf chain: doubly linked, keys globally nondecreasing.
    let mut current = if root_id.category == PageCategory::Leaf {
        Some(root_id)
    } else {
        assert!(leftmost_leaf.is_some(), "no leftmost leaf found");
        leftmost_leaf
    };
    let mut previous: Option<BTreePageId> = None;
    let mut last_key: Option<Value> = None;
    while let Some(pid) = current {
        let handle = db.get_page(tid, pid.into(), Permissions::ReadOnly).unwrap();
        let guard = handle.read();
        let leaf = guard.as_leaf().unwrap();
        assert_eq!(
            leaf.left_sibling_id(),
            previous,
            "leaf {} left pointer disagrees with the chain",
            pid.page_no
        );
        for tuple in leaf.iter() {
            let key = tuple.value(0).clone();
            if let Some(prev_key) = &last_key {
                assert!(
                    prev_key.compare(Op::LessThanOrEq, &key).unwrap(),
                    "leaf chain keys out of order at page {}",
                    pid.page_no
                );
            }
            last_key = Some(key);
        }
        previous = Some(pid);
        current = leaf.right_sibling_id();
    }

    db.commit(tid).unwrap();
}

/// Deterministic scramble: visits each index once via a coprime stride.
fn scrambled(keys: Vec<i32>) -> Vec<i32> {
    let n = keys.len();
    let stride = 7919 % n.max(1);
    let mut out = Vec::with_capacity(n);
    let mut idx = 0;
    for _ in 0..n {
        out.push(keys[idx]);
        idx = (idx + stride.max(1)) % n;
    }
    out.sort_unstable();
    out.dedup();
    assert_eq!(out.len(), n, "stride must visit every index once");

    let mut visited = Vec::with_capacity(n);
    let mut idx = 0;
    for _ in 0..n {
        visited.push(keys[idx]);
        idx = (idx + stride.max(1)) % n;
    }
    visited
}

#[test]
fn reverse_order_inserts_scan_sorted() {
    let dir = tempdir().unwrap();
    let (db, file, table_id) = open_tree(&dir);

    insert_keys(&db, &file, (1..=31_000).rev());

    let keys = scan_keys(&db, &file);
    assert_eq!(keys.len(), 31_000);
    assert!(keys.iter().zip(1..=31_000).all(|(a, b)| *a == b));
    check_tree(&db, table_id);

    // Point lookup finds exactly one match.
    let tid = TransactionId::new();
    let mut iter = file.index_iter(&db, tid, IndexPredicate::new(Op::Equals, Value::Int(15_000)));
    iter.open().unwrap();
    let mut found = Vec::new();
    while iter.has_next().unwrap() {
        found.push(iter.next().unwrap());
    }
    iter.close();
    db.commit(tid).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value(0), &Value::Int(15_000));
    assert_eq!(found[0].value(1), &Value::Int(30_000));
}

#[test]
fn delete_storm_keeps_the_tree_balanced() {
    let dir = tempdir().unwrap();
    let (db, file, table_id) = open_tree(&dir);

    insert_keys(&db, &file, (1..=31_000).rev());

    // Drop the middle of the key space in scrambled order, checkpointing
    // the structural invariants between slices.
    let victims = scrambled((5_000..25_000).collect());
    for slice in victims.chunks(4_000) {
        delete_keys(&db, &file, slice);
        check_tree(&db, table_id);
    }

    let keys = scan_keys(&db, &file);
    assert_eq!(keys.len(), 11_000);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert!(keys.iter().all(|k| !(5_000..25_000).contains(k)));
}

#[test]
fn range_scans_start_and_stop_correctly() {
    let dir = tempdir().unwrap();
    let (db, file, _) = open_tree(&dir);
    insert_keys(&db, &file, 1..=2_000);

    let cases: Vec<(Op, i32, Vec<i32>)> = vec![
        (Op::GreaterThan, 1_995, (1_996..=2_000).collect()),
        (Op::GreaterThanOrEq, 1_995, (1_995..=2_000).collect()),
        (Op::LessThan, 6, (1..=5).collect()),
        (Op::LessThanOrEq, 6, (1..=6).collect()),
        (Op::Equals, 1_000, vec![1_000]),
        (Op::Equals, 5_000, vec![]),
    ];
    for (op, key, expected) in cases {
        let tid = TransactionId::new();
        let mut iter = file.index_iter(&db, tid, IndexPredicate::new(op, Value::Int(key)));
        iter.open().unwrap();
        let mut found = Vec::new();
        while iter.has_next().unwrap() {
            match iter.next().unwrap().value(0) {
                Value::Int(v) => found.push(*v),
                other => panic!("unexpected {:?}", other),
            }
        }
        iter.close();
        db.commit(tid).unwrap();
        assert_eq!(found, expected, "{:?} {}", op, key);
    }
}

#[test]
fn deleting_everything_collapses_to_an_empty_root_leaf() {
    let dir = tempdir().unwrap();
    let (db, file, table_id) = open_tree(&dir);

    insert_keys(&db, &file, 1..=2_000);
    let all: Vec<i32> = (1..=2_000).collect();
    delete_keys(&db, &file, &scrambled(all));

    assert!(scan_keys(&db, &file).is_empty());

    let tid = TransactionId::new();
    let root_ptr_pid = BTreePageId::root_ptr(table_id);
    let handle = db.get_page(tid, root_ptr_pid.into(), Permissions::ReadOnly).unwrap();
    let root_id = handle.read().as_root_ptr().unwrap().root_id().unwrap();
    drop(handle);
    assert_eq!(root_id.category, PageCategory::Leaf);

    let handle = db.get_page(tid, root_id.into(), Permissions::ReadOnly).unwrap();
    assert_eq!(handle.read().as_leaf().unwrap().tuple_count(), 0);
    drop(handle);
    db.commit(tid).unwrap();
}

#[test]
fn released_pages_are_reused_by_later_inserts() {
    let dir = tempdir().unwrap();
    let (db, file, _) = open_tree(&dir);

    insert_keys(&db, &file, 1..=10_000);
    let pages_full = file.num_pages().unwrap();

    let victims: Vec<i32> = (1..=9_000).collect();
    delete_keys(&db, &file, &scrambled(victims));
    insert_keys(&db, &file, 1..=9_000);

    // Freed pages came back out of the header chain instead of growing
    // the file without bound.
    let pages_after = file.num_pages().unwrap();
    assert!(
        pages_after <= pages_full + 20,
        "file grew from {} to {} pages",
        pages_full,
        pages_after
    );
}
