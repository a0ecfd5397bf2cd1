use cuckoo::{CuckooMap, IdentityHasher};
use rand::distributions::{Distribution, Uniform};
use rand::{thread_rng, Rng};
use std::collections::BTreeSet;
use std::hash::BuildHasherDefault;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread;

/// Number of keys the stress test works over.
const NUM_KEYS: usize = 1 << 12;
/// Number of threads per stress role.
const NUM_THREADS: usize = 4;
/// How long the stress test will run (in milliseconds).
const TEST_LEN: u64 = 2000;

type Key = u64;
type Value = u64;
type Identity = BuildHasherDefault<IdentityHasher>;

/// With the identity hasher, keys which are multiples of the bucket count
/// all land on bucket zero with the same tag, so a single bucket pair
/// soaks up every insert until the displacement search gives up and the
/// table doubles.
#[test]
fn growth_fires_when_displacement_is_exhausted() {
    const KEYS: u64 = 200;
    let map = CuckooMap::<Key, Value, Identity>::with_capacity_and_hasher(1, Identity::default());
    assert_eq!(map.bucket_count(), 16);

    for j in 0..KEYS {
        assert!(map.insert(j << 4, j));
    }

    assert!(map.bucket_count() > 16);
    assert!(map.bucket_count().is_power_of_two());
    assert_eq!(map.len(), KEYS as usize);
    for j in 0..KEYS {
        assert!(map.contains_key(&(j << 4)));
        assert_eq!(map.get(&(j << 4)), Some(j));
    }
}

/// Several threads hammer the same colliding key family so that growths
/// race with inserts and with each other.
#[test]
fn concurrent_growth_keeps_all_keys() {
    const KEYS_PER_THREAD: u64 = 50;
    const THREADS: u64 = 4;

    let map = Arc::new(CuckooMap::<Key, Value, Identity>::with_capacity_and_hasher(
        1,
        Identity::default(),
    ));

    let mut threads = vec![];
    for t in 0..THREADS {
        let map = map.clone();
        threads.push(thread::spawn(move || {
            for j in (t * KEYS_PER_THREAD)..((t + 1) * KEYS_PER_THREAD) {
                assert!(map.insert(j << 4, j));
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(map.len(), (THREADS * KEYS_PER_THREAD) as usize);
    for j in 0..(THREADS * KEYS_PER_THREAD) {
        assert_eq!(map.get(&(j << 4)), Some(j));
    }
}

/// Starting from the smallest table, a large random workload has to grow
/// through many generations without losing or duplicating anything.
#[test]
fn grows_from_minimum_under_load() {
    let map = CuckooMap::<Key, Value>::with_capacity(1);
    assert_eq!(map.bucket_count(), 16);

    let mut rng = thread_rng();
    let mut unique = BTreeSet::new();
    let mut fresh_inserts = 0usize;
    for _ in 0..100_000 {
        let key: u64 = rng.gen();
        if map.insert(key, key) {
            fresh_inserts += 1;
        }
        unique.insert(key);
    }

    assert_eq!(fresh_inserts, unique.len());
    assert_eq!(map.len(), unique.len());
    for key in unique.iter().take(1000) {
        assert!(map.contains_key(key));
    }
}

struct Environment {
    table: CuckooMap<Key, Value>,
    keys: Vec<Key>,
    ind_dist: Uniform<usize>,
    in_table: Vec<AtomicBool>,
    in_use: Vec<AtomicBool>,
    finished: AtomicBool,
    num_inserts: AtomicUsize,
    num_finds: AtomicUsize,
}

impl Environment {
    pub fn new() -> Self {
        let mut keys = Vec::with_capacity(NUM_KEYS);
        let mut in_table = Vec::with_capacity(NUM_KEYS);
        let mut in_use = Vec::with_capacity(NUM_KEYS);

        for i in 1..NUM_KEYS + 1 {
            keys.push(i as u64);
            in_table.push(AtomicBool::new(false));
            in_use.push(AtomicBool::new(false));
        }

        Self {
            table: CuckooMap::with_capacity(64),
            keys,
            ind_dist: Uniform::from(0..NUM_KEYS - 1),
            in_table,
            in_use,
            finished: AtomicBool::new(false),
            num_inserts: AtomicUsize::new(0),
            num_finds: AtomicUsize::new(0),
        }
    }
}

fn stress_insert_thread(env: Arc<Environment>) {
    let mut rng = rand::thread_rng();
    while !env.finished.load(Ordering::SeqCst) {
        let idx = env.ind_dist.sample(&mut rng);
        if env.in_use[idx]
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            let key = env.keys[idx];
            let in_table = env.in_table[idx].load(Ordering::Relaxed);
            let res = env.table.insert(key, key.wrapping_add(1));

            // There is no removal, so an insert wins exactly when the key
            // has never been inserted before.
            assert_ne!(res, in_table);
            if res {
                assert_eq!(env.table.get(&key), Some(key.wrapping_add(1)));
                env.in_table[idx].store(true, Ordering::Relaxed);
                env.num_inserts.fetch_add(1, Ordering::Relaxed);
            }
            env.in_use[idx].store(false, Ordering::SeqCst);
        }
    }
}

fn stress_find_thread(env: Arc<Environment>) {
    let mut rng = rand::thread_rng();
    while !env.finished.load(Ordering::SeqCst) {
        let idx = env.ind_dist.sample(&mut rng);
        if env.in_use[idx]
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            let key = env.keys[idx];
            let in_table = env.in_table[idx].load(Ordering::Relaxed);

            // Holding the reservation flag means no other thread can be
            // inserting this key right now, so membership is exact.
            assert_eq!(env.table.contains_key(&key), in_table);
            if in_table {
                assert_eq!(env.table.get(&key), Some(key.wrapping_add(1)));
            }
            env.num_finds.fetch_add(1, Ordering::Relaxed);
            env.in_use[idx].swap(false, Ordering::SeqCst);
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn stress_test() {
    let root = Arc::new(Environment::new());
    let mut threads = Vec::new();
    for _ in 0..NUM_THREADS {
        let env = Arc::clone(&root);
        threads.push(thread::spawn(move || stress_insert_thread(env)));
        let env = Arc::clone(&root);
        threads.push(thread::spawn(move || stress_find_thread(env)));
    }
    thread::sleep(std::time::Duration::from_millis(TEST_LEN));
    root.finished.swap(true, Ordering::SeqCst);

    for t in threads {
        t.join().expect("failed to join thread");
    }

    let num_filled = root
        .in_table
        .iter()
        .filter(|b| b.load(Ordering::Relaxed))
        .count();
    assert_eq!(num_filled, root.table.len());
    assert_eq!(num_filled, root.num_inserts.load(Ordering::Relaxed));
    assert!(root.num_finds.load(Ordering::Relaxed) > 0);
    for (idx, flag) in root.in_table.iter().enumerate() {
        assert_eq!(
            root.table.contains_key(&root.keys[idx]),
            flag.load(Ordering::Relaxed)
        );
    }
}
