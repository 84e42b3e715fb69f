#![cfg(test)]

use super::{
    new_counter, threshold, Claim, Expect, Freeze, KeyNode, Lookup, Put, SlotState, Table,
    ValueNode, ValueState, MAX_CAPACITY,
};
use crossbeam_epoch::{Guard, Owned};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

fn table(capacity: usize, load_factor: f64) -> Table<u64, u64> {
    Table::new(capacity, load_factor, new_counter(), true)
}

fn insert<'g>(
    table: &Table<u64, u64>,
    hash: u64,
    key: u64,
    value: u64,
    guard: &'g Guard,
) -> Put<'g, u64> {
    let mut value = Some(ValueNode::new(value));
    table.put_if_match(
        hash,
        &key,
        Claim::Bounded(|| KeyNode::new(hash, key)),
        &mut value,
        Expect::Any,
        guard,
    )
}

fn remove<'g>(table: &Table<u64, u64>, hash: u64, key: u64, guard: &'g Guard) -> Put<'g, u64> {
    let mut tombstone = None;
    table.put_if_match(
        hash,
        &key,
        Claim::<fn() -> Owned<KeyNode<u64>>>::Never,
        &mut tombstone,
        Expect::Live,
        guard,
    )
}

fn get(table: &Table<u64, u64>, hash: u64, key: u64, guard: &Guard) -> Option<u64> {
    match table.find(hash, &key, guard) {
        Lookup::Found(value) => Some(*value),
        _ => None,
    }
}

#[test]
fn threshold_is_clamped() {
    assert_eq!(threshold(8, 0.75), 6);
    assert_eq!(threshold(8, 0.01), 1);
    assert_eq!(threshold(8, 1.0), 8);
    assert_eq!(threshold(1024, 0.5), 512);
    assert_eq!(threshold(MAX_CAPACITY, 0.5), MAX_CAPACITY);
}

#[test]
fn reprobe_limit() {
    assert_eq!(table(8, 0.75).reprobe_limit, 8);
    assert_eq!(table(64, 0.75).reprobe_limit, 26);
    assert_eq!(table(1024, 0.75).reprobe_limit, 266);
}

#[test]
fn insert_and_find() {
    let guard = &crossbeam_epoch::pin();
    let t = table(16, 0.75);

    assert!(matches!(insert(&t, 3, 3, 30, guard), Put::Done(None)));
    assert!(matches!(insert(&t, 4, 4, 40, guard), Put::Done(None)));
    assert_eq!(get(&t, 3, 3, guard), Some(30));
    assert_eq!(get(&t, 4, 4, guard), Some(40));
    assert!(matches!(t.find(5, &5, guard), Lookup::Missing));
    assert_eq!(t.live(), 2);
    assert_eq!(t.claimed(), 2);
}

#[test]
fn update_returns_prior() {
    let guard = &crossbeam_epoch::pin();
    let t = table(16, 0.75);

    insert(&t, 1, 1, 10, guard);
    assert!(matches!(insert(&t, 1, 1, 11, guard), Put::Done(Some(&10))));
    assert_eq!(get(&t, 1, 1, guard), Some(11));
    assert_eq!(t.live(), 1);
    assert_eq!(t.claimed(), 1);
}

#[test]
fn colliding_keys_probe_linearly() {
    let guard = &crossbeam_epoch::pin();
    let t = table(8, 1.0);

    insert(&t, 1, 1, 10, guard);
    insert(&t, 9, 9, 90, guard);
    insert(&t, 17, 17, 170, guard);
    assert_eq!(get(&t, 1, 1, guard), Some(10));
    assert_eq!(get(&t, 9, 9, guard), Some(90));
    assert_eq!(get(&t, 17, 17, guard), Some(170));

    match t.slot_state(3, guard) {
        SlotState::Claimed { key, value: ValueState::Live(&170) } => assert_eq!(key.key, 17),
        _ => panic!("expected 17 in slot 3"),
    }
}

#[test]
fn remove_leaves_tombstone() {
    let guard = &crossbeam_epoch::pin();
    let t = table(16, 0.75);

    insert(&t, 2, 2, 20, guard);
    assert!(matches!(remove(&t, 2, 2, guard), Put::Done(Some(&20))));
    assert!(matches!(t.find(2, &2, guard), Lookup::Missing));
    assert!(matches!(remove(&t, 2, 2, guard), Put::Done(None)));
    assert!(matches!(remove(&t, 7, 7, guard), Put::Done(None)));
    assert!(matches!(
        t.slot_state(2, guard),
        SlotState::Claimed { value: ValueState::Tombstone, .. }
    ));
    assert_eq!(t.live(), 0);
    assert_eq!(t.claimed(), 1);

    // The key keeps its slot.
    insert(&t, 2, 2, 21, guard);
    assert_eq!(get(&t, 2, 2, guard), Some(21));
    assert_eq!(t.claimed(), 1);
}

#[test]
fn vacant_expectation_rejects_written_slots() {
    let guard = &crossbeam_epoch::pin();
    let t = table(16, 0.75);

    insert(&t, 5, 5, 50, guard);
    remove(&t, 5, 5, guard);

    let mut copy = Some(ValueNode::new(99));
    let result = t.put_if_match(
        5,
        &5,
        Claim::Exhaustive(|| KeyNode::new(5, 5)),
        &mut copy,
        Expect::Vacant,
        guard,
    );
    assert!(matches!(result, Put::Rejected));
    assert!(copy.is_some());
    assert!(matches!(t.find(5, &5, guard), Lookup::Missing));

    let mut copy = Some(ValueNode::new(60));
    let result = t.put_if_match(
        6,
        &6,
        Claim::Exhaustive(|| KeyNode::new(6, 6)),
        &mut copy,
        Expect::Vacant,
        guard,
    );
    assert!(matches!(result, Put::Done(None)));
    assert_eq!(get(&t, 6, 6, guard), Some(60));
    // Copies are not new entries.
    assert_eq!(t.live(), 0);
}

#[test]
fn full_at_threshold() {
    let guard = &crossbeam_epoch::pin();
    let t = table(8, 0.5);
    assert_eq!(t.threshold(), 4);

    for key in 0..4 {
        assert!(matches!(insert(&t, key, key, key, guard), Put::Done(None)));
    }
    assert!(matches!(insert(&t, 4, 4, 4, guard), Put::Full));

    // Existing keys can still be updated.
    assert!(matches!(insert(&t, 1, 1, 100, guard), Put::Done(Some(&1))));
}

#[test]
fn full_at_reprobe_limit() {
    let guard = &crossbeam_epoch::pin();
    let t = table(64, 1.0);

    for i in 0..26 {
        let hash = i * 64;
        assert!(matches!(insert(&t, hash, i, i, guard), Put::Done(None)));
    }
    assert!(matches!(insert(&t, 26 * 64, 26, 26, guard), Put::Full));
    assert!(matches!(t.find(26 * 64, &26, guard), Lookup::Exhausted));
    assert!(matches!(remove(&t, 26 * 64, 26, guard), Put::Full));
}

#[test]
fn exhaustive_claims_extend_lookups() {
    let guard = &crossbeam_epoch::pin();
    let t = table(64, 1.0);

    for i in 0..26 {
        insert(&t, i * 64, i, i, guard);
    }
    let mut copy = Some(ValueNode::new(26));
    let result = t.put_if_match(
        26 * 64,
        &26,
        Claim::Exhaustive(|| KeyNode::new(26 * 64, 26)),
        &mut copy,
        Expect::Vacant,
        guard,
    );
    assert!(matches!(result, Put::Done(None)));
    assert_eq!(t.probe_limit(), 27);

    assert_eq!(get(&t, 26 * 64, 26, guard), Some(26));
    assert!(matches!(insert(&t, 26 * 64, 26, 27, guard), Put::Done(Some(&26))));
    assert!(matches!(remove(&t, 26 * 64, 26, guard), Put::Done(Some(&27))));
    // Fresh keys are still bounded by the reprobe limit.
    assert!(matches!(insert(&t, 27 * 64, 27, 27, guard), Put::Full));
}

#[test]
fn claims_refused_until_accepted() {
    let guard = &crossbeam_epoch::pin();
    let t = Table::<u64, u64>::new(8, 0.75, new_counter(), false);

    assert!(matches!(insert(&t, 1, 1, 1, guard), Put::Full));
    t.set_accepts_claims();
    assert!(matches!(insert(&t, 1, 1, 1, guard), Put::Done(None)));
}

#[test]
fn sealed_slot_moves_operations() {
    let guard = &crossbeam_epoch::pin();
    let t = table(8, 0.75);

    assert!(matches!(t.mark_forwarded(4, guard), Freeze::Sealed));
    assert!(matches!(t.mark_forwarded(4, guard), Freeze::Done));
    assert!(matches!(t.slot_state(4, guard), SlotState::Sealed));
    assert!(t.is_forwarded(4, guard));

    assert!(matches!(t.find(4, &4, guard), Lookup::Moved(4)));
    assert!(matches!(insert(&t, 4, 4, 4, guard), Put::Moved(4)));
    assert!(matches!(remove(&t, 4, 4, guard), Put::Moved(4)));
}

#[test]
fn live_slot_is_primed_then_forwarded() {
    let guard = &crossbeam_epoch::pin();
    let t = table(8, 0.75);
    insert(&t, 2, 2, 20, guard);

    let primed = match t.mark_forwarded(2, guard) {
        Freeze::Primed { key, value } => {
            assert_eq!(key.key, 2);
            assert_eq!(unsafe { value.deref() }.value, 20);
            value
        }
        _ => panic!("expected a primed value"),
    };

    // A second helper sees the same frozen value.
    assert!(matches!(t.mark_forwarded(2, guard), Freeze::Primed { .. }));
    assert!(matches!(t.find(2, &2, guard), Lookup::Moved(2)));
    assert!(matches!(insert(&t, 2, 2, 21, guard), Put::Moved(2)));
    assert!(!t.is_forwarded(2, guard));

    assert!(t.complete_forward(2, primed, guard));
    assert!(!t.complete_forward(2, primed, guard));
    assert!(t.is_forwarded(2, guard));
    assert!(matches!(t.mark_forwarded(2, guard), Freeze::Done));
}

#[test]
fn tombstone_is_forwarded_directly() {
    let guard = &crossbeam_epoch::pin();
    let t = table(8, 0.75);
    insert(&t, 3, 3, 30, guard);
    remove(&t, 3, 3, guard);

    assert!(matches!(t.mark_forwarded(3, guard), Freeze::Sealed));
    assert!(t.is_forwarded(3, guard));
}

#[test]
fn writers_move_once_next_exists() {
    let guard = &crossbeam_epoch::pin();
    let t = table(8, 0.75);
    insert(&t, 1, 1, 10, guard);

    t.next
        .store(Owned::new(table(16, 0.75)), Ordering::Release);

    assert!(matches!(insert(&t, 1, 1, 11, guard), Put::Moved(1)));
    assert!(matches!(insert(&t, 2, 2, 20, guard), Put::Moved(2)));
    assert!(matches!(remove(&t, 1, 1, guard), Put::Moved(1)));
    assert!(matches!(remove(&t, 3, 3, guard), Put::Moved(3)));
    // Readers help with the slot they stop at, whether it holds their key or not.
    assert!(matches!(t.find(1, &1, guard), Lookup::Moved(1)));
    assert!(matches!(t.find(4, &4, guard), Lookup::Moved(4)));

    unsafe {
        drop(t.next.load(Ordering::Relaxed, guard).into_owned());
    }
}

#[test]
fn drop_frees_entries() {
    #[derive(Clone)]
    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    {
        let guard = &crossbeam_epoch::pin();
        let t = Table::<u64, Counted>::new(8, 0.75, new_counter(), true);
        for key in 0..3 {
            let mut value = Some(ValueNode::new(Counted(drops.clone())));
            let result = t.put_if_match(
                key,
                &key,
                Claim::Bounded(|| KeyNode::new(key, key)),
                &mut value,
                Expect::Any,
                guard,
            );
            assert!(matches!(result, Put::Done(None)));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 3);
}
