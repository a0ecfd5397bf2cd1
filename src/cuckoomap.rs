//==----------------------------------------------------------- ------------==//
//                                 Cuckoo
//                      Copyright (c) 2022 Rob Clucas
//      This file is distributed under the APACHE License, Version 2.0.
//                         See LICENSE for details.
//==------------------------------------------------------------------------==//

//! A concurrent hash map using bucketized cuckoo hashing. Every key has
//! exactly two candidate buckets, so a lookup probes at most two buckets
//! however full the table is, and inserts displace residents along a
//! breadth-first search path when both candidates are full.

use crate::lock::LockArray;
use crate::util::{allocate_zeroed, deallocate, round_to_pow2};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// The default hasher for a [`CuckooMap`].
pub(crate) type DefaultHash = std::collections::hash_map::DefaultHasher;

/// The number of cell slots in each bucket.
pub(crate) const BUCKET_SLOTS: usize = 4;

/// Multiplier applied to a slot tag when deriving the alternate bucket
/// index. This is the hash constant from 64-bit MurmurHash2; any odd
/// constant keeps the derivation an involution, this one also spreads the
/// 255 possible tags well.
const TAG_MULTIPLIER: u64 = 0xc6a4a7935bd1e995;

/// Returns the partial tag for a hashed key: the high byte of the hash,
/// forced nonzero so that a zero tag always means an empty slot.
#[inline]
pub(crate) const fn partial_tag(hash: u64) -> u8 {
    ((hash >> 56) as u8) | 1
}

/// Returns the primary bucket index for a hashed key.
#[inline]
pub(crate) const fn primary_index(hash: u64, mask: usize) -> usize {
    (hash as usize) & mask
}

/// Returns the other candidate bucket for an occupant of bucket `index`
/// with partial tag `tag`.
///
/// This is an involution for a fixed tag: applying it to its own result
/// gives `index` back. That is what lets a displacement recover an
/// occupant's alternate bucket from the stored tag alone, without
/// rehashing the key.
#[inline]
pub(crate) const fn alt_index(tag: u8, index: usize, mask: usize) -> usize {
    (index ^ ((tag as u64).wrapping_mul(TAG_MULTIPLIER) as usize)) & mask
}

/// A key's hash split the way the table consumes it: the full word that
/// the primary index is masked out of, and the nonzero high-byte tag that
/// is stored with the cell.
#[derive(Clone, Copy)]
struct HashedKey {
    hash: u64,
    tag: u8,
}

impl HashedKey {
    /// Hashes `key` with the `hash_builder` and derives its tag.
    fn new<Q, S>(hash_builder: &S, key: &Q) -> HashedKey
    where
        Q: Hash + ?Sized,
        S: BuildHasher,
    {
        let hash = hash_builder.hash_one(key);
        HashedKey {
            hash,
            tag: partial_tag(hash),
        }
    }

    /// The key's two candidate bucket indices under `mask`.
    fn candidates(&self, mask: usize) -> (usize, usize) {
        let primary = primary_index(self.hash, mask);
        (primary, alt_index(self.tag, primary, mask))
    }
}

/// A bucket of the table: up to [`BUCKET_SLOTS`] cells, each with an 8-bit
/// partial tag, plus an occupancy bitmask. A cell is initialized iff its
/// occupancy bit is set, and its tag is then nonzero and equal to the
/// partial tag of the key's hash.
///
/// Buckets have no locking of their own; all access goes through the
/// [`LockArray`] of the owning table generation.
pub(crate) struct Bucket<K, V> {
    /// Partial tags for the slots; zero for empty slots.
    tags: [u8; BUCKET_SLOTS],
    /// Occupancy bitmask, one bit per slot.
    occupied: u8,
    /// Cell storage, initialized in place when a slot is claimed.
    cells: [MaybeUninit<(K, V)>; BUCKET_SLOTS],
}

impl<K, V> Bucket<K, V> {
    #[inline]
    fn is_occupied(&self, slot: usize) -> bool {
        self.occupied & (1 << slot) != 0
    }

    #[inline]
    fn tag(&self, slot: usize) -> u8 {
        self.tags[slot]
    }

    #[inline]
    fn tags(&self) -> [u8; BUCKET_SLOTS] {
        self.tags
    }

    #[inline]
    fn occupied_mask(&self) -> u8 {
        self.occupied
    }

    /// Returns the first empty slot, if the bucket has one.
    fn first_empty(&self) -> Option<usize> {
        (0..BUCKET_SLOTS).find(|slot| !self.is_occupied(*slot))
    }

    /// Searches the bucket for a cell whose tag matches and whose key is
    /// equal to `key`, returning the slot. The tag compare filters out
    /// almost all non-matches before the key is ever touched.
    fn find<Q>(&self, tag: u8, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        for slot in 0..BUCKET_SLOTS {
            if !self.is_occupied(slot) || self.tags[slot] != tag {
                continue;
            }
            let cell_key = unsafe { &(*self.cells[slot].as_ptr()).0 };
            if cell_key.borrow() == key {
                return Some(slot);
            }
        }
        None
    }

    /// Returns a reference to the value in the occupied `slot`.
    fn value(&self, slot: usize) -> &V {
        debug_assert!(self.is_occupied(slot));
        unsafe { &(*self.cells[slot].as_ptr()).1 }
    }

    /// Writes a cell into the empty `slot` and marks it occupied.
    fn set(&mut self, slot: usize, tag: u8, key: K, value: V) {
        debug_assert!(!self.is_occupied(slot));
        debug_assert!(tag != 0);
        self.cells[slot].write((key, value));
        self.tags[slot] = tag;
        self.occupied |= 1 << slot;
    }

    /// Moves the cell out of the occupied `slot`, clearing its tag and
    /// occupancy bit.
    fn take(&mut self, slot: usize) -> (u8, K, V) {
        debug_assert!(self.is_occupied(slot));
        let tag = self.tags[slot];
        self.tags[slot] = 0;
        self.occupied &= !(1 << slot);
        let (key, value) = unsafe { self.cells[slot].as_ptr().read() };
        (tag, key, value)
    }
}

/// One generation of table storage: `2^base` buckets in a single zeroed
/// allocation, together with the lock array for exactly those buckets.
/// A table's `base` never changes; growth publishes a whole new table.
pub(crate) struct Table<K, V> {
    /// Pointer to the bucket storage.
    buckets: *mut Bucket<K, V>,
    /// The exponent such that the bucket count is `2^base`.
    base: usize,
    /// One padded spinlock per bucket.
    locks: LockArray,
}

impl<K, V> Table<K, V> {
    fn new(base: usize) -> Box<Table<K, V>> {
        let count = 1usize << base;
        Box::new(Table {
            buckets: allocate_zeroed::<Bucket<K, V>>(count),
            base,
            locks: LockArray::new(count),
        })
    }

    #[inline]
    fn bucket_count(&self) -> usize {
        1 << self.base
    }

    #[inline]
    fn mask(&self) -> usize {
        (1 << self.base) - 1
    }

    /// Gets a reference to the bucket at `index`.
    ///
    /// Callers must hold the bucket's lock (or every lock, during growth)
    /// and `index` must be below the bucket count.
    #[inline]
    unsafe fn bucket(&self, index: usize) -> &Bucket<K, V> {
        &*self.buckets.add(index)
    }

    /// Gets a mutable reference to the bucket at `index`, under the same
    /// conditions as [`Table::bucket`].
    #[inline]
    unsafe fn bucket_mut(&self, index: usize) -> &mut Bucket<K, V> {
        &mut *self.buckets.add(index)
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        unsafe {
            for index in 0..self.bucket_count() {
                let bucket = self.bucket_mut(index);
                for slot in 0..BUCKET_SLOTS {
                    if bucket.is_occupied(slot) {
                        std::ptr::drop_in_place(bucket.cells[slot].as_mut_ptr());
                    }
                }
            }
            deallocate(self.buckets, self.bucket_count());
        }
    }
}

/// One record of the breadth-first displacement search. Roots carry
/// `parent == usize::MAX`; every other node names the parent slot whose
/// occupant's alternate bucket is this node's bucket, along with that
/// occupant's tag at the time it was inspected.
#[derive(Clone, Copy)]
struct PathNode {
    bucket: usize,
    parent: usize,
    parent_slot: usize,
    tag: u8,
}

/// One displacement step: the occupant of `slot` in bucket `from`, which
/// carried `tag` when the path was found, moves into a free slot of `to`.
#[derive(Clone, Copy)]
struct PathMove {
    from: usize,
    slot: usize,
    tag: u8,
    to: usize,
}

/// Outcome of a displacement path search.
enum PathSearch {
    /// A path was found: shifting the `moves` from tail to head frees one
    /// slot in the `head` bucket, which is one of the two candidates.
    Found { head: usize, moves: Vec<PathMove> },
    /// The table generation changed while searching.
    Resized,
    /// The search budget was exhausted without reaching a free slot, so
    /// the table is effectively full and has to grow.
    Full,
}

/// Rebuilds the move sequence for the node `goal` of the search `arena`
/// by walking its parent links back to the root.
fn rebuild_path(arena: &[PathNode], goal: usize) -> PathSearch {
    let mut moves = Vec::new();
    let mut node = goal;
    while arena[node].parent != usize::MAX {
        let parent = arena[node].parent;
        moves.push(PathMove {
            from: arena[parent].bucket,
            slot: arena[node].parent_slot,
            tag: arena[node].tag,
            to: arena[node].bucket,
        });
        node = parent;
    }
    moves.reverse();
    PathSearch::Found {
        head: arena[node].bucket,
        moves,
    }
}

/// A concurrent hash map built on bucketized cuckoo hashing with a
/// spinlock per bucket.
///
/// Each key hashes to a primary bucket, and the high byte of its hash (the
/// *partial tag*, stored with the cell) derives a second candidate bucket.
/// A cell only ever lives in one of its two candidates, so [`CuckooMap::contains_key`]
/// and [`CuckooMap::get`] lock and scan exactly two buckets. When an insert
/// finds both candidates full it releases its locks, searches breadth-first
/// for a chain of displacements ending at a free slot, and replays that
/// chain pairwise; if no chain exists within the search budget the table
/// doubles.
///
/// By default the map uses the default hasher from the standard library,
/// which is DOS resistent, but is less efficient. Any other hasher can be
/// used instead via [`CuckooMap::with_capacity_and_hasher`], likely with
/// improved performance but less security.
///
/// # Limitations
///
/// The map does not support removal, in-place update, or iteration; it is
/// an insert-and-membership engine. Growth is one way: the table never
/// shrinks below its high-water bucket count.
///
/// # Threading
///
/// All operations take `&self` and are safe to call from any number of
/// threads. Waiting happens only on per-bucket spinlocks and, for the one
/// thread performing a growth, on the resize mutex.
pub struct CuckooMap<K, V, H = BuildHasherDefault<DefaultHash>> {
    /// The current table generation. Replaced wholesale on growth; old
    /// generations are parked in `retired` until it is safe to free them.
    table: AtomicPtr<Table<K, V>>,
    /// The current size exponent, the map's generation counter. Bumped
    /// with release ordering while every bucket lock of the outgoing
    /// table is held.
    base: AtomicUsize,
    /// Number of cells in the map, maintained under the pair lock of
    /// every successful insert.
    len: AtomicUsize,
    /// Serializes growth and guards the retired table generations.
    retired: Mutex<Vec<*mut Table<K, V>>>,
    /// The hasher for the map.
    hash_builder: H,
}

unsafe impl<K: Send, V: Send, H: Send> Send for CuckooMap<K, V, H> {}
unsafe impl<K: Send + Sync, V: Send + Sync, H: Send + Sync> Sync for CuckooMap<K, V, H> {}

impl<K, V> CuckooMap<K, V, BuildHasherDefault<DefaultHash>>
where
    K: Eq + Hash,
{
    /// Creates a map with the default bucket count and the default hasher.
    pub fn new() -> CuckooMap<K, V, BuildHasherDefault<DefaultHash>> {
        Self::with_capacity((1 << Self::DEFAULT_BASE) * BUCKET_SLOTS)
    }

    /// Creates a map with room for at least `capacity` cells.
    pub fn with_capacity(capacity: usize) -> CuckooMap<K, V, BuildHasherDefault<DefaultHash>> {
        Self::with_capacity_and_hasher(capacity, BuildHasherDefault::<DefaultHash>::default())
    }
}

impl<K, V> Default for CuckooMap<K, V, BuildHasherDefault<DefaultHash>>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, H> CuckooMap<K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    /// The default size exponent: 512 buckets.
    const DEFAULT_BASE: usize = 9;

    /// The smallest size exponent a map will be created with.
    const MIN_BASE: usize = 4;

    /// The number of buckets a displacement search may visit before the
    /// table is declared full.
    const MAX_STEP: usize = 128;

    /// Creates a map with room for at least `capacity` cells, using the
    /// `builder` to hash keys.
    pub fn with_capacity_and_hasher(capacity: usize, builder: H) -> CuckooMap<K, V, H> {
        let buckets = round_to_pow2((capacity + BUCKET_SLOTS - 1) / BUCKET_SLOTS);
        let base = (buckets.trailing_zeros() as usize).max(Self::MIN_BASE);
        CuckooMap {
            table: AtomicPtr::new(Box::into_raw(Table::new(base))),
            base: AtomicUsize::new(base),
            len: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
            hash_builder: builder,
        }
    }

    /// Returns the number of cells stored in the map.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if the map contains no cells.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the current table generation,
    /// always a power of two.
    pub fn bucket_count(&self) -> usize {
        1 << self.base.load(Ordering::Acquire)
    }

    /// Returns the number of cells the current table generation can hold.
    pub fn capacity(&self) -> usize {
        self.bucket_count() * BUCKET_SLOTS
    }

    /// Get the underlying hasher itself.
    pub fn hasher(&self) -> &H {
        &self.hash_builder
    }

    /// Returns true if the map contains the specified `key`.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = cuckoo::CuckooMap::new();
    /// map.insert(1, 47u64);
    /// assert_eq!(map.contains_key(&1), true);
    /// assert_eq!(map.contains_key(&2), false);
    /// ```
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hashed = HashedKey::new(&self.hash_builder, key);
        loop {
            let (base, table) = self.snapshot();
            let (i1, i2) = hashed.candidates(table.mask());
            let _guard = table.locks.lock_pair(i1, i2);
            if self.base.load(Ordering::Acquire) != base {
                // The locks belong to an outgoing generation; go again.
                continue;
            }
            unsafe {
                return table.bucket(i1).find(hashed.tag, key).is_some()
                    || (i2 != i1 && table.bucket(i2).find(hashed.tag, key).is_some());
            }
        }
    }

    /// Returns a copy of the value stored for `key`, if the key is in the
    /// map. The copy is made while the key's buckets are locked, so it is
    /// consistent with some point between the call and the return.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = cuckoo::CuckooMap::new();
    /// map.insert(0, 12);
    /// assert_eq!(map.get(&0), Some(12));
    /// assert_eq!(map.get(&2), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let hashed = HashedKey::new(&self.hash_builder, key);
        loop {
            let (base, table) = self.snapshot();
            let (i1, i2) = hashed.candidates(table.mask());
            let _guard = table.locks.lock_pair(i1, i2);
            if self.base.load(Ordering::Acquire) != base {
                continue;
            }
            unsafe {
                let bucket = table.bucket(i1);
                if let Some(slot) = bucket.find(hashed.tag, key) {
                    return Some(bucket.value(slot).clone());
                }
                if i2 != i1 {
                    let bucket = table.bucket(i2);
                    if let Some(slot) = bucket.find(hashed.tag, key) {
                        return Some(bucket.value(slot).clone());
                    }
                }
                return None;
            }
        }
    }

    /// Inserts a key-value pair into the map.
    ///
    /// Returns `true` if the pair was inserted, and `false` if an equal
    /// key was already present, in which case the existing cell is left
    /// untouched. When inserts race on equal keys exactly one of them
    /// returns `true`.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = cuckoo::CuckooMap::new();
    /// assert_eq!(map.insert(37, 12), true);
    /// assert_eq!(map.insert(37, 14), false);
    /// ```
    pub fn insert(&self, key: K, value: V) -> bool {
        let hashed = HashedKey::new(&self.hash_builder, &key);
        loop {
            let (base, table) = self.snapshot();
            let (i1, i2) = hashed.candidates(table.mask());

            {
                let guard = table.locks.lock_pair(i1, i2);
                if self.base.load(Ordering::Acquire) != base {
                    continue;
                }
                unsafe {
                    if table.bucket(i1).find(hashed.tag, &key).is_some()
                        || (i2 != i1 && table.bucket(i2).find(hashed.tag, &key).is_some())
                    {
                        return false;
                    }
                    let bucket = table.bucket_mut(i1);
                    if let Some(slot) = bucket.first_empty() {
                        bucket.set(slot, hashed.tag, key, value);
                        self.len.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    if i2 != i1 {
                        let bucket = table.bucket_mut(i2);
                        if let Some(slot) = bucket.first_empty() {
                            bucket.set(slot, hashed.tag, key, value);
                            self.len.fetch_add(1, Ordering::Relaxed);
                            return true;
                        }
                    }
                }
                // Both candidates are full. The displacement search takes
                // bucket locks of its own, so ours must go first.
                drop(guard);
            }

            match self.search_path(table, base, i1, i2) {
                PathSearch::Found { head, moves } => {
                    if !self.shift_path(table, base, &moves) {
                        continue;
                    }
                    let _guard = table.locks.lock_pair(i1, i2);
                    if self.base.load(Ordering::Acquire) != base {
                        continue;
                    }
                    unsafe {
                        // The pair was unlocked during the search, so a
                        // racing insert of an equal key may have won.
                        if table.bucket(i1).find(hashed.tag, &key).is_some()
                            || (i2 != i1 && table.bucket(i2).find(hashed.tag, &key).is_some())
                        {
                            return false;
                        }
                        let bucket = table.bucket_mut(head);
                        if let Some(slot) = bucket.first_empty() {
                            bucket.set(slot, hashed.tag, key, value);
                            self.len.fetch_add(1, Ordering::Relaxed);
                            return true;
                        }
                    }
                    // The slot the path freed was claimed before we could
                    // relock; start the insert over.
                }
                PathSearch::Resized => {}
                PathSearch::Full => self.grow(base),
            }
        }
    }

    /// Loads a `(base, table)` pair that agree with each other. During
    /// publication of a new generation the two stores can be observed out
    /// of step, in which case this simply re-reads.
    fn snapshot(&self) -> (usize, &Table<K, V>) {
        loop {
            let base = self.base.load(Ordering::Acquire);
            let table = unsafe { &*self.table.load(Ordering::Acquire) };
            if table.base == base {
                return (base, table);
            }
            std::hint::spin_loop();
        }
    }

    /// Searches breadth-first for a displacement path from one of the two
    /// candidate buckets to a bucket with a free slot.
    ///
    /// The search inspects tags under each bucket's own lock but holds no
    /// locks between inspections, so the path it returns is speculative;
    /// [`CuckooMap::shift_path`] re-validates every step before moving
    /// anything. The arena doubles as the visited set, and its size is
    /// the search budget.
    fn search_path(&self, table: &Table<K, V>, base: usize, i1: usize, i2: usize) -> PathSearch {
        let mask = table.mask();
        let mut arena: Vec<PathNode> = Vec::with_capacity(Self::MAX_STEP);
        arena.push(PathNode {
            bucket: i1,
            parent: usize::MAX,
            parent_slot: 0,
            tag: 0,
        });
        if i2 != i1 {
            arena.push(PathNode {
                bucket: i2,
                parent: usize::MAX,
                parent_slot: 0,
                tag: 0,
            });
        }

        let mut cursor = 0;
        while cursor < arena.len() {
            if self.base.load(Ordering::Acquire) != base {
                return PathSearch::Resized;
            }
            let bucket_index = arena[cursor].bucket;
            let (tags, occupied, has_empty) = {
                let _guard = table.locks.lock_one(bucket_index);
                let bucket = unsafe { table.bucket(bucket_index) };
                (
                    bucket.tags(),
                    bucket.occupied_mask(),
                    bucket.first_empty().is_some(),
                )
            };
            if has_empty {
                return rebuild_path(&arena, cursor);
            }
            for slot in 0..BUCKET_SLOTS {
                if arena.len() == Self::MAX_STEP {
                    break;
                }
                if occupied & (1 << slot) == 0 {
                    continue;
                }
                let tag = tags[slot];
                let alt = alt_index(tag, bucket_index, mask);
                if arena.iter().any(|node| node.bucket == alt) {
                    continue;
                }
                arena.push(PathNode {
                    bucket: alt,
                    parent: cursor,
                    parent_slot: slot,
                    tag,
                });
            }
            cursor += 1;
        }
        PathSearch::Full
    }

    /// Replays a displacement path from its tail toward its head, so that
    /// each move lands in the slot freed by the one replayed before it.
    ///
    /// Every step locks its two buckets in canonical order and re-checks
    /// the generation, the source occupant's tag, and the target's free
    /// slot; the whole cell move then happens inside that one critical
    /// section, so no other thread ever observes a half-moved cell. Any
    /// failed check abandons the replay and the caller restarts the
    /// insert from scratch.
    fn shift_path(&self, table: &Table<K, V>, base: usize, moves: &[PathMove]) -> bool {
        for step in moves.iter().rev() {
            let _guard = table.locks.lock_pair(step.from, step.to);
            if self.base.load(Ordering::Acquire) != base {
                return false;
            }
            let (from, to) = unsafe { (table.bucket_mut(step.from), table.bucket_mut(step.to)) };
            if !from.is_occupied(step.slot) || from.tag(step.slot) != step.tag {
                return false;
            }
            let empty = match to.first_empty() {
                Some(slot) => slot,
                None => return false,
            };
            let (tag, key, value) = from.take(step.slot);
            to.set(empty, tag, key, value);
        }
        true
    }

    /// Doubles the table, rehashing every cell into a fresh generation.
    ///
    /// Growth is serialized on the retired-list mutex and performed with
    /// every bucket lock of the outgoing table held, so no operation is
    /// mid-flight in that table when the new generation is published. If
    /// the generation already moved past `from_base` by the time the mutex
    /// is ours, another thread grew the table first and there is nothing
    /// to do.
    fn grow(&self, from_base: usize) {
        let mut retired = self.retired.lock();
        if self.base.load(Ordering::Acquire) != from_base {
            return;
        }
        let old_ptr = self.table.load(Ordering::Acquire);
        let table = unsafe { &*old_ptr };
        let _all = table.locks.lock_all();
        debug_assert_eq!(table.base, from_base);
        debug_assert_eq!(table.locks.len(), table.bucket_count());

        // Generations retired by the previous growth are unreachable now:
        // a reader can touch one only between loading the table pointer
        // and failing the generation recheck, and those readers are long
        // past that window.
        for stale in retired.drain(..) {
            unsafe { drop(Box::from_raw(stale)) };
        }

        let mut entries = Vec::with_capacity(self.len.load(Ordering::Relaxed));
        Self::drain_table(table, &mut entries);

        let mut new_base = from_base + 1;
        let new_table = loop {
            let new_table = Table::new(new_base);
            match Self::fill_table(&new_table, &self.hash_builder, &mut entries) {
                Ok(()) => break new_table,
                Err(()) => {
                    // The doubled table still ran out of displacement
                    // budget; reclaim what was placed and go larger.
                    Self::drain_table(&new_table, &mut entries);
                    new_base += 1;
                }
            }
        };

        log::debug!(
            "cuckoo table growing from {} to {} buckets ({} cells)",
            1usize << from_base,
            1usize << new_base,
            self.len.load(Ordering::Relaxed),
        );

        // Publish the new generation: table first, then the generation
        // counter, both with release ordering. The old table's locks are
        // released when `_all` drops, after which stuck operations fail
        // their recheck and re-derive everything from the new generation.
        self.table
            .store(Box::into_raw(new_table), Ordering::Release);
        self.base.store(new_base, Ordering::Release);
        retired.push(old_ptr);
    }

    /// Moves every cell of `table` into `entries`, leaving the table
    /// empty. The caller must have exclusive access to the table.
    fn drain_table(table: &Table<K, V>, entries: &mut Vec<(u8, K, V)>) {
        unsafe {
            for index in 0..table.bucket_count() {
                let bucket = table.bucket_mut(index);
                for slot in 0..BUCKET_SLOTS {
                    if bucket.is_occupied(slot) {
                        entries.push(bucket.take(slot));
                    }
                }
            }
        }
    }

    /// Places every entry into `table`, which the caller owns exclusively.
    /// On overflow the in-flight entry is pushed back and `Err` returned,
    /// so no cell is ever lost.
    fn fill_table(
        table: &Table<K, V>,
        hash_builder: &H,
        entries: &mut Vec<(u8, K, V)>,
    ) -> Result<(), ()> {
        while let Some((tag, key, value)) = entries.pop() {
            if let Err(entry) = Self::place(table, hash_builder, tag, key, value) {
                entries.push(entry);
                return Err(());
            }
        }
        Ok(())
    }

    /// Places one cell into an exclusively-owned table: primary bucket,
    /// else alternate, else a bounded greedy eviction walk. The walk
    /// rarely runs at all, since a grown table starts at half load.
    fn place(
        table: &Table<K, V>,
        hash_builder: &H,
        tag: u8,
        key: K,
        value: V,
    ) -> Result<(), (u8, K, V)> {
        let mask = table.mask();
        let hashed = HashedKey::new(hash_builder, &key);
        debug_assert_eq!(hashed.tag, tag);
        let (i1, i2) = hashed.candidates(mask);
        unsafe {
            let bucket = table.bucket_mut(i1);
            if let Some(slot) = bucket.first_empty() {
                bucket.set(slot, tag, key, value);
                return Ok(());
            }
            if i2 != i1 {
                let bucket = table.bucket_mut(i2);
                if let Some(slot) = bucket.first_empty() {
                    bucket.set(slot, tag, key, value);
                    return Ok(());
                }
            }

            let mut current = (tag, key, value);
            let mut index = i2;
            for step in 0..Self::MAX_STEP {
                let bucket = table.bucket_mut(index);
                if let Some(slot) = bucket.first_empty() {
                    bucket.set(slot, current.0, current.1, current.2);
                    return Ok(());
                }
                let victim_slot = step % BUCKET_SLOTS;
                let victim = bucket.take(victim_slot);
                bucket.set(victim_slot, current.0, current.1, current.2);
                index = alt_index(victim.0, index, mask);
                current = victim;
            }
            Err(current)
        }
    }
}

impl<K, V, H> Drop for CuckooMap<K, V, H> {
    fn drop(&mut self) {
        let mut retired = self.retired.lock();
        for stale in retired.drain(..) {
            unsafe { drop(Box::from_raw(stale)) };
        }
        let table = self.table.load(Ordering::Relaxed);
        if !table.is_null() {
            unsafe { drop(Box::from_raw(table)) };
        }
    }
}
