//! Partition LRU list behavior: head insertion, promotion, unlinking, and
//! the forward/backward consistency of the intrusive links.

use blockcache::{Store, StoreBuilder};

/// Single-partition store so every entry lands on one LRU list.
fn single_partition_store() -> Store {
    StoreBuilder::new()
        .block_size(256)
        .heap_size(256 * 64)
        .partition_count(1)
        .build()
}

fn insert(store: &Store, hash: u64, key: &[u8]) -> u64 {
    let entry = store.create_entry(hash, key, b"value").unwrap();
    let mut partition = store.lock_partition_for_hash(hash);
    store.add_as_head(&mut partition, entry);
    entry
}

/// Walk the list forward from the head under the partition lock.
fn forward_order(store: &Store, hash: u64) -> Vec<u64> {
    let partition = store.lock_partition_for_hash(hash);
    let mut order = Vec::new();
    let mut entry = partition.lru_head();
    while entry != 0 {
        order.push(entry);
        entry = store.entry_lru_next(entry);
    }
    order
}

/// Walk backward from the tail; must mirror the forward order.
fn backward_order(store: &Store, hash: u64) -> Vec<u64> {
    let partition = store.lock_partition_for_hash(hash);
    let mut tail = 0u64;
    let mut entry = partition.lru_head();
    while entry != 0 {
        tail = entry;
        entry = store.entry_lru_next(entry);
    }

    let mut order = Vec::new();
    let mut entry = tail;
    while entry != 0 {
        order.push(entry);
        entry = store.entry_lru_prev(entry);
    }
    order
}

#[test]
fn insertion_order_is_most_recent_first() {
    let store = single_partition_store();

    let a = insert(&store, 1, b"a");
    let b = insert(&store, 2, b"b");
    let c = insert(&store, 3, b"c");

    assert_eq!(forward_order(&store, 0), vec![c, b, a]);

    let mut reversed = backward_order(&store, 0);
    reversed.reverse();
    assert_eq!(reversed, vec![c, b, a]);
}

#[test]
fn promote_moves_entry_to_head_and_keeps_relative_order() {
    let store = single_partition_store();

    let a = insert(&store, 1, b"a");
    let b = insert(&store, 2, b"b");
    let c = insert(&store, 3, b"c");
    assert_eq!(forward_order(&store, 0), vec![c, b, a]);

    {
        let mut partition = store.lock_partition_for_hash(0);
        store.promote_to_head(&mut partition, a);
        assert_eq!(partition.lru_head(), a);
    }
    assert_eq!(forward_order(&store, 0), vec![a, c, b]);
    assert_eq!(store.metrics().lru_promote.value(), 1);

    // promoting the current head is a no-op
    {
        let mut partition = store.lock_partition_for_hash(0);
        store.promote_to_head(&mut partition, a);
    }
    assert_eq!(forward_order(&store, 0), vec![a, c, b]);
    assert_eq!(store.metrics().lru_promote.value(), 1);

    // prev/next stay inverses after the reshuffle
    let mut reversed = backward_order(&store, 0);
    reversed.reverse();
    assert_eq!(reversed, vec![a, c, b]);
}

#[test]
fn find_does_not_reorder() {
    let store = single_partition_store();

    let a = insert(&store, store.hash_key(b"a"), b"a");
    let _b = insert(&store, store.hash_key(b"b"), b"b");
    let _c = insert(&store, store.hash_key(b"c"), b"c");

    let before = forward_order(&store, 0);
    {
        let partition = store.lock_partition_for_hash(store.hash_key(b"a"));
        assert_eq!(
            store.find_entry(&partition, store.hash_key(b"a"), b"a"),
            Some(a)
        );
    }
    assert_eq!(forward_order(&store, 0), before);
}

#[test]
fn unlink_head_middle_and_tail() {
    let store = single_partition_store();

    let a = insert(&store, 1, b"a");
    let b = insert(&store, 2, b"b");
    let c = insert(&store, 3, b"c");
    let d = insert(&store, 4, b"d");
    assert_eq!(forward_order(&store, 0), vec![d, c, b, a]);

    // middle
    {
        let mut partition = store.lock_partition_for_hash(0);
        store.unlink(&mut partition, c);
    }
    assert_eq!(forward_order(&store, 0), vec![d, b, a]);

    // head
    {
        let mut partition = store.lock_partition_for_hash(0);
        store.unlink(&mut partition, d);
    }
    assert_eq!(forward_order(&store, 0), vec![b, a]);

    // tail
    {
        let mut partition = store.lock_partition_for_hash(0);
        store.unlink(&mut partition, a);
    }
    assert_eq!(forward_order(&store, 0), vec![b]);

    // last one out leaves the partition empty
    {
        let mut partition = store.lock_partition_for_hash(0);
        store.unlink(&mut partition, b);
        assert_eq!(partition.lru_head(), 0);
    }

    for entry in [a, b, c, d] {
        store.free_entry(entry);
    }
    assert_eq!(
        store.metrics().blocks_free.value(),
        store.block_count() as i64
    );
}

#[test]
fn lru_lengths_count_every_partition() {
    let store = StoreBuilder::new()
        .block_size(256)
        .heap_size(256 * 128)
        .partition_count(8)
        .build();

    for i in 0..50u64 {
        let key = format!("key_{i}");
        let hash = store.hash_key(key.as_bytes());
        let entry = store.create_entry(hash, key.as_bytes(), b"v").unwrap();
        let mut partition = store.lock_partition_for_hash(hash);
        store.add_as_head(&mut partition, entry);
    }

    let lengths = store.lru_lengths();
    assert_eq!(lengths.len(), 8);
    assert_eq!(lengths.iter().sum::<usize>(), 50);
}

#[test]
fn hot_n_visits_in_lru_order_with_lock_held() {
    let store = single_partition_store();

    let a = insert(&store, 1, b"a");
    let b = insert(&store, 2, b"b");
    let c = insert(&store, 3, b"c");

    let mut seen = Vec::new();
    store.hot_n(0, |entry| seen.push(entry));
    assert_eq!(seen, vec![c, b, a]);
}
