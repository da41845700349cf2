//! End-to-end scenarios for the multigranular lock subsystem: parallel
//! transactions, FIFO queueing, hierarchy invariants, and the declarative
//! helper, exercised through the public API only.

use std::sync::Arc;

use granite_lock::LockMode::{Exclusive, IntentExclusive, IntentShared, NoLock, Shared};
use granite_lock::{
    ensure_sufficient_lock_held, LockContext, LockManager, LockMode, ResourceName,
    TransactionContext, TxnId,
};

fn txn(id: u64) -> Arc<TransactionContext> {
    Arc::new(TransactionContext::new(TxnId::new(id)))
}

fn wait_until_blocked(txn: &TransactionContext) {
    while !txn.is_blocked() {
        std::thread::yield_now();
    }
}

/// Invariant check: no two distinct transactions hold incompatible locks on
/// any of `names`, and every context's subtree counter matches a recount of
/// the locks actually held underneath it.
fn assert_grants_consistent(manager: &LockManager, names: &[ResourceName], txns: &[TxnId]) {
    for name in names {
        let granted = manager.locks_on(name);
        for (i, a) in granted.iter().enumerate() {
            for b in &granted[i + 1..] {
                if a.txn != b.txn {
                    assert!(
                        a.mode.compatible(b.mode),
                        "incompatible grants on {name}: {a} vs {b}"
                    );
                }
            }
        }
    }
    for name in names {
        let ctx = manager.context_for(name);
        for &t in txns {
            let recount = manager
                .locks_held_by(t)
                .iter()
                .filter(|lock| lock.name.is_descendant_of(name))
                .count();
            assert_eq!(
                ctx.get_num_children(t),
                recount,
                "counter drift at {name} for {t}"
            );
        }
    }
}

#[test]
fn shared_readers_coexist_and_outlive_release() {
    let manager = LockManager::new();
    let db = manager.database_context();
    let t1 = txn(1);
    let t2 = txn(2);

    db.acquire(&t1, Shared).unwrap();
    db.acquire(&t2, Shared).unwrap();
    assert_eq!(db.get_explicit_lock_type(t1.id()), Shared);
    assert_eq!(db.get_explicit_lock_type(t2.id()), Shared);

    db.release(&t1).unwrap();
    assert_eq!(db.get_explicit_lock_type(t1.id()), NoLock);
    assert_eq!(db.get_explicit_lock_type(t2.id()), Shared);
}

#[test]
fn readers_queue_fifo_behind_a_writer() {
    let manager = LockManager::new();
    let db = manager.database_context();
    let t1 = txn(1);
    let t2 = txn(2);
    let t3 = txn(3);

    db.acquire(&t1, Exclusive).unwrap();

    let (ctx2, t2c) = (db.clone(), Arc::clone(&t2));
    let reader2 = std::thread::spawn(move || ctx2.acquire(&t2c, Shared).unwrap());
    wait_until_blocked(&t2);

    let (ctx3, t3c) = (db.clone(), Arc::clone(&t3));
    let reader3 = std::thread::spawn(move || ctx3.acquire(&t3c, Shared).unwrap());
    wait_until_blocked(&t3);

    // Neither reader got in while the writer held X.
    assert_eq!(db.get_explicit_lock_type(t2.id()), NoLock);
    assert_eq!(db.get_explicit_lock_type(t3.id()), NoLock);

    db.release(&t1).unwrap();
    reader2.join().unwrap();
    reader3.join().unwrap();
    assert_eq!(db.get_explicit_lock_type(t2.id()), Shared);
    assert_eq!(db.get_explicit_lock_type(t3.id()), Shared);
}

#[test]
fn blocked_writer_wakes_when_the_reader_finishes() {
    let manager = LockManager::new();
    let db = manager.database_context();
    let table = db.child_context("users");
    let page = table.child_context("3");
    let t1 = txn(1);
    let t2 = txn(2);

    ensure_sufficient_lock_held(&t1, &page, Shared).unwrap();

    // The writer's intent locks coexist with the reader's; it parks on the
    // page itself.
    let manager2 = manager.clone();
    let t2c = Arc::clone(&t2);
    let writer = std::thread::spawn(move || {
        let page = manager2
            .database_context()
            .child_context("users")
            .child_context("3");
        ensure_sufficient_lock_held(&t2c, &page, Exclusive).unwrap();
    });
    wait_until_blocked(&t2);
    assert_eq!(db.get_explicit_lock_type(t2.id()), IntentExclusive);
    assert_eq!(table.get_explicit_lock_type(t2.id()), IntentExclusive);
    assert_eq!(page.get_explicit_lock_type(t2.id()), NoLock);

    // Reader backs out bottom-up; the release of the page wakes the writer.
    page.release(&t1).unwrap();
    writer.join().unwrap();
    assert_eq!(page.get_explicit_lock_type(t2.id()), Exclusive);

    table.release(&t1).unwrap();
    db.release(&t1).unwrap();
}

#[test]
fn six_promotion_does_not_let_waiters_overtake() {
    let manager = LockManager::new();
    let db = manager.database_context();
    let table = db.child_context("users");
    let p1 = table.child_context("1");
    let t1 = txn(1);
    let t2 = txn(2);

    db.acquire(&t1, IntentExclusive).unwrap();
    table.acquire(&t1, IntentExclusive).unwrap();
    p1.acquire(&t1, Shared).unwrap();

    // A reader parks behind the table's IX.
    db.acquire(&t2, IntentShared).unwrap();
    let (ctx, t2c) = (table.clone(), Arc::clone(&t2));
    let reader = std::thread::spawn(move || ctx.acquire(&t2c, Shared).unwrap());
    wait_until_blocked(&t2);

    // Promotion to SIX replaces the transaction's own lock; the queued
    // reader stays parked and the page lock is absorbed.
    table.promote(&t1, LockMode::SharedIntentExclusive).unwrap();
    assert_eq!(p1.get_explicit_lock_type(t1.id()), NoLock);
    assert!(t2.is_blocked());

    table.release(&t1).unwrap();
    reader.join().unwrap();
    assert_eq!(table.get_explicit_lock_type(t2.id()), Shared);

    db.release(&t1).unwrap();
}

#[test]
fn ancestor_release_refused_until_descendants_clear() {
    let manager = LockManager::new();
    let db = manager.database_context();
    let table = db.child_context("users");
    let page = table.child_context("9");
    let t1 = txn(1);

    db.acquire(&t1, IntentExclusive).unwrap();
    table.acquire(&t1, IntentExclusive).unwrap();
    page.acquire(&t1, Exclusive).unwrap();

    assert!(db.release(&t1).is_err());
    assert!(table.release(&t1).is_err());

    page.release(&t1).unwrap();
    table.release(&t1).unwrap();
    db.release(&t1).unwrap();
    assert!(manager.locks_held_by(t1.id()).is_empty());
}

#[test]
fn acquire_release_round_trip_restores_state() {
    let manager = LockManager::new();
    let db = manager.database_context();
    let table = db.child_context("users");
    let t1 = txn(1);

    db.acquire(&t1, IntentShared).unwrap();
    table.acquire(&t1, Shared).unwrap();
    table.release(&t1).unwrap();
    db.release(&t1).unwrap();

    assert!(manager.locks_held_by(t1.id()).is_empty());
    assert!(manager.locks_on(db.name()).is_empty());
    assert!(manager.locks_on(table.name()).is_empty());
    assert_eq!(db.get_num_children(t1.id()), 0);
}

#[test]
fn parallel_writers_on_distinct_pages_share_intents() {
    let manager = LockManager::new();
    let db = manager.database_context();
    let table = db.child_context("orders");
    let writers = 4_u64;

    let handles: Vec<_> = (1..=writers)
        .map(|i| {
            let manager = manager.clone();
            std::thread::spawn(move || {
                let t = txn(i);
                let page = manager
                    .database_context()
                    .child_context("orders")
                    .child_context(i.to_string());
                ensure_sufficient_lock_held(&t, &page, Exclusive).unwrap();
                t
            })
        })
        .collect();
    let txns: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut names = vec![db.name().clone(), table.name().clone()];
    for i in 1..=writers {
        names.push(table.name().child(i.to_string()));
    }
    let ids: Vec<TxnId> = txns.iter().map(|t| t.id()).collect();
    assert_grants_consistent(&manager, &names, &ids);

    for t in &txns {
        assert_eq!(db.get_explicit_lock_type(t.id()), IntentExclusive);
        assert_eq!(table.get_explicit_lock_type(t.id()), IntentExclusive);
        assert_eq!(table.get_num_children(t.id()), 1);
    }

    // Everyone backs out bottom-up; the tree ends empty.
    for t in &txns {
        let page = table.child_context(t.id().get().to_string());
        page.release(t).unwrap();
        table.release(t).unwrap();
        db.release(t).unwrap();
    }
    assert_grants_consistent(&manager, &names, &ids);
    for name in &names {
        assert!(manager.locks_on(name).is_empty());
    }
}

#[test]
fn escalation_is_one_flat_mutation_and_idempotent() {
    let manager = LockManager::new();
    let db = manager.database_context();
    let table = db.child_context("users");
    let t1 = txn(1);

    db.acquire(&t1, IntentExclusive).unwrap();
    table.acquire(&t1, IntentExclusive).unwrap();
    table.child_context("5").acquire(&t1, Exclusive).unwrap();
    table.child_context("3").acquire(&t1, Shared).unwrap();

    table.escalate(&t1).unwrap();
    let held = manager.locks_held_by(t1.id());
    assert_eq!(held.len(), 2);
    assert_eq!(table.get_explicit_lock_type(t1.id()), Exclusive);

    table.escalate(&t1).unwrap();
    assert_eq!(manager.locks_held_by(t1.id()), held);

    let ctx_names = vec![
        db.name().clone(),
        table.name().clone(),
        table.name().child("5"),
        table.name().child("3"),
    ];
    assert_grants_consistent(&manager, &ctx_names, &[t1.id()]);
}

#[test]
fn effective_rights_follow_the_deepest_grant() {
    let manager = LockManager::new();
    let db = manager.database_context();
    let table = db.child_context("users");
    let page = table.child_context("1");
    let t1 = txn(1);
    let t2 = txn(2);

    ensure_sufficient_lock_held(&t1, &table, Exclusive).unwrap();
    assert_eq!(page.get_effective_lock_type(t1.id()), Exclusive);
    assert_eq!(db.get_effective_lock_type(t1.id()), IntentExclusive);

    // Another transaction sees no rights anywhere.
    assert_eq!(page.get_effective_lock_type(t2.id()), NoLock);
    assert_eq!(db.get_effective_lock_type(t2.id()), NoLock);
}

#[test]
fn context_handles_are_interchangeable() {
    let manager = LockManager::new();
    let a = manager.database_context().child_context("t");
    let b: LockContext = manager.context_for(&ResourceName::new("database").child("t"));
    let t1 = txn(1);

    manager.database_context().acquire(&t1, IntentShared).unwrap();
    a.acquire(&t1, Shared).unwrap();
    assert_eq!(b.get_explicit_lock_type(t1.id()), Shared);
    b.release(&t1).unwrap();
    assert_eq!(a.get_explicit_lock_type(t1.id()), NoLock);
}
