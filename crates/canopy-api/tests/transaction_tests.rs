// Transaction semantics through the public API: isolation, atomicity
// across trees, rollback, ordering, and compare-and-swap under contention.

use std::sync::Arc;

use canopy::{CompareAndSwapError, Roots, TransactionId};
use tempfile::tempdir;

#[test]
fn staged_writes_are_isolated_until_commit() {
    let dir = tempdir().unwrap();
    let roots = Roots::open(dir.path().join("db")).unwrap();
    let tree = roots.tree("kv").unwrap();

    let tx = roots.transaction(&["kv"]).unwrap();
    tx.tree("kv").unwrap().set("k", "staged").unwrap();

    // The transaction sees its own write; outside readers do not.
    assert_eq!(tx.tree("kv").unwrap().get(b"k").unwrap().unwrap(), b"staged");
    assert!(tree.get(b"k").unwrap().is_none());

    tx.commit().unwrap();
    assert_eq!(tree.get(b"k").unwrap().unwrap(), b"staged");
}

#[test]
fn rollback_discards_staged_writes() {
    let dir = tempdir().unwrap();
    let roots = Roots::open(dir.path().join("db")).unwrap();
    let tree = roots.tree("kv").unwrap();
    tree.set("keep", "1").unwrap();

    let tx = roots.transaction(&["kv"]).unwrap();
    tx.tree("kv").unwrap().set("gone", "2").unwrap();
    tx.tree("kv").unwrap().remove(b"keep").unwrap();
    tx.rollback();

    assert_eq!(tree.get(b"keep").unwrap().unwrap(), b"1");
    assert!(tree.get(b"gone").unwrap().is_none());
}

#[test]
fn dropping_a_transaction_rolls_back() {
    let dir = tempdir().unwrap();
    let roots = Roots::open(dir.path().join("db")).unwrap();
    let tree = roots.tree("kv").unwrap();

    {
        let tx = roots.transaction(&["kv"]).unwrap();
        tx.tree("kv").unwrap().set("k", "v").unwrap();
        // Dropped without commit.
    }

    assert!(tree.get(b"k").unwrap().is_none());
    // The tree is writable again afterwards.
    tree.set("k", "after").unwrap();
    assert_eq!(tree.get(b"k").unwrap().unwrap(), b"after");
}

#[test]
fn multi_tree_commit_is_atomic() {
    let dir = tempdir().unwrap();
    let roots = Roots::open(dir.path().join("db")).unwrap();
    let accounts = roots.tree("accounts").unwrap();
    let audit = roots.tree("audit").unwrap();

    let tx = roots.transaction(&["accounts", "audit"]).unwrap();
    tx.tree("accounts").unwrap().set("alice", "90").unwrap();
    tx.tree("audit").unwrap().set("entry1", "alice -10").unwrap();

    // Neither tree shows anything before commit.
    assert!(accounts.get(b"alice").unwrap().is_none());
    assert!(audit.get(b"entry1").unwrap().is_none());

    tx.commit().unwrap();

    assert_eq!(accounts.get(b"alice").unwrap().unwrap(), b"90");
    assert_eq!(audit.get(b"entry1").unwrap().unwrap(), b"alice -10");

    // One log record covers both trees.
    let entries = roots.transactions().entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].trees.len(), 2);
}

#[test]
fn transaction_ids_and_log_order_are_monotonic() {
    let dir = tempdir().unwrap();
    let roots = Roots::open(dir.path().join("db")).unwrap();
    roots.tree("kv").unwrap();

    let mut previous = TransactionId(0);
    for _ in 0..5 {
        let tx = roots.transaction(&["kv"]).unwrap();
        assert!(tx.id() > previous);
        previous = tx.id();
        tx.tree("kv").unwrap().set("k", "v").unwrap();
        tx.commit().unwrap();
    }

    let ids: Vec<_> = roots
        .transactions()
        .entries()
        .unwrap()
        .into_iter()
        .map(|entry| entry.id.0)
        .collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    assert_eq!(ids.len(), 5);
}

#[test]
fn concurrent_transactions_on_disjoint_keys_both_commit() {
    let dir = tempdir().unwrap();
    let roots = Arc::new(Roots::open(dir.path().join("db")).unwrap());
    roots.tree("kv").unwrap();

    let handles: Vec<_> = (0..2)
        .map(|worker: u8| {
            let roots = Arc::clone(&roots);
            std::thread::spawn(move || {
                let tx = roots.transaction(&["kv"]).unwrap();
                tx.tree("kv")
                    .unwrap()
                    .set(format!("worker{}", worker), "done")
                    .unwrap();
                tx.commit().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let tree = roots.tree("kv").unwrap();
    assert_eq!(tree.get(b"worker0").unwrap().unwrap(), b"done");
    assert_eq!(tree.get(b"worker1").unwrap().unwrap(), b"done");

    let ids: Vec<_> = roots
        .transactions()
        .entries()
        .unwrap()
        .into_iter()
        .map(|entry| entry.id.0)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1], "log records must have increasing ids");
}

#[test]
fn compare_and_swap_admits_exactly_one_winner() {
    let dir = tempdir().unwrap();
    let roots = Arc::new(Roots::open(dir.path().join("db")).unwrap());
    let tree = roots.tree("kv").unwrap();
    tree.set("counter", "0").unwrap();

    let workers = 8u8;
    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let roots = Arc::clone(&roots);
            std::thread::spawn(move || {
                let tree = roots.tree("kv").unwrap();
                match tree.compare_and_swap(
                    b"counter",
                    Some(b"0"),
                    Some(canopy::Buffer::owned(vec![b'w', worker])),
                ) {
                    Ok(()) => (true, None),
                    Err(CompareAndSwapError::Conflict(observed)) => {
                        (false, observed.map(|value| value.into_vec()))
                    }
                    Err(CompareAndSwapError::Error(err)) => panic!("engine error: {err}"),
                }
            })
        })
        .collect();

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let winners = outcomes.iter().filter(|(won, _)| *won).count();
    assert_eq!(winners, 1, "exactly one compare-and-swap may succeed");

    let final_value = tree.get(b"counter").unwrap().unwrap().into_vec();
    assert_eq!(final_value[0], b'w');

    // Every loser observed the winner's value (the only value the key
    // ever changed to).
    for (won, observed) in outcomes {
        if !won {
            assert_eq!(observed.unwrap(), final_value);
        }
    }
}

#[test]
fn compare_and_swap_with_expected_absence() {
    let dir = tempdir().unwrap();
    let roots = Roots::open(dir.path().join("db")).unwrap();
    let tree = roots.tree("kv").unwrap();

    // Key absent, expectation absent: the swap installs the value.
    tree.compare_and_swap(b"k", None, Some(canopy::Buffer::from(b"v")))
        .unwrap();
    assert_eq!(tree.get(b"k").unwrap().unwrap(), b"v");

    // Now present, so expecting absence conflicts.
    let err = tree
        .compare_and_swap(b"k", None, Some(canopy::Buffer::from(b"w")))
        .unwrap_err();
    match err {
        CompareAndSwapError::Conflict(observed) => assert_eq!(observed.unwrap(), b"v"),
        CompareAndSwapError::Error(err) => panic!("engine error: {err}"),
    }
}

#[test]
fn transactions_on_distinct_trees_run_in_parallel() {
    let dir = tempdir().unwrap();
    let roots = Roots::open(dir.path().join("db")).unwrap();
    roots.tree("a").unwrap();
    roots.tree("b").unwrap();

    // Both transactions stage while the other is open; commits land in id
    // order.
    let tx_a = roots.transaction(&["a"]).unwrap();
    let tx_b = roots.transaction(&["b"]).unwrap();
    tx_a.tree("a").unwrap().set("k", "from-a").unwrap();
    tx_b.tree("b").unwrap().set("k", "from-b").unwrap();
    tx_a.commit().unwrap();
    tx_b.commit().unwrap();

    assert_eq!(roots.tree("a").unwrap().get(b"k").unwrap().unwrap(), b"from-a");
    assert_eq!(roots.tree("b").unwrap().get(b"k").unwrap().unwrap(), b"from-b");
}
