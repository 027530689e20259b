//! Lock-free resizable hash table over an RCU flavor.
//!
//! All nodes, user entries and bucket dummies alike, live in one linked
//! list ordered by the bit-reversed hash value. For a power-of-two table
//! size every bucket is anchored at a permanent dummy node, so growing the
//! table only links new dummies into the existing list and never moves a
//! user node; shrinking unlinks the departing dummies again. Add, removal
//! and lookup are lock-free and run concurrently with resizes.
//!
//! Removal is split in two: a CAS sets the removal flag in the victim's
//! next pointer, then the winner (helped by any concurrent writer walking
//! the bucket) physically unlinks it. A node's memory is released only
//! after a grace period, through the table's [`RcuFlavor`].
//!
//! Based on the split-ordered list construction of Shalev and Shavit and
//! the lock-free linked list of Michael.

use crate::error::Error;
use crate::flavor::RcuFlavor;
use crate::util::{cold_path, count_order, fls};
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::{
    cell::Cell,
    marker::PhantomData,
    mem, ptr,
    sync::{
        atomic::{fence, AtomicBool, AtomicIsize, AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, trace, warn};


/// Split counters commit a batched delta to the global count every
/// `2^COUNT_COMMIT_ORDER` local updates.
const COUNT_COMMIT_ORDER: u32 = 10;
const CHAIN_LEN_TARGET: u32 = 1;
const CHAIN_LEN_RESIZE_THRESHOLD: u32 = 3;

/// Smallest bucket count a table ever has.
pub const MIN_TABLE_SIZE: usize = 1;

const MAX_TABLE_ORDER: usize = usize::BITS as usize;

/// Minimum number of dummy nodes per worker when parallelizing a resize.
const MIN_PARTITION_PER_THREAD_ORDER: u32 = 12;
const MIN_PARTITION_PER_THREAD: usize = 1 << MIN_PARTITION_PER_THREAD_ORDER;

/// Creation flag: enable chain-length- and count-triggered resizes.
pub const AUTO_RESIZE: u32 = 1 << 0;

/// The removal flag must change atomically with the pointer. The dummy
/// flag would not need to, but riding in the same word costs nothing.
const REMOVED_FLAG: usize = 1 << 0;
const DUMMY_FLAG: usize = 1 << 1;
const FLAGS_MASK: usize = (1 << 2) - 1;

const _: () = assert!(mem::align_of::<NodeCore>() >= 4);

/// Hashes a key with a seed.
pub type HashFn = fn(&[u8], usize) -> usize;

/// Key equivalence; `true` means equal.
pub type KeyEqFn = fn(&[u8], &[u8]) -> bool;

/// Value of a node's `next` field: a tagged successor pointer.
///
/// The flag bits describe the node *owning* the field: `REMOVED_FLAG` marks
/// it logically removed, `DUMMY_FLAG` marks it a bucket dummy. A null
/// pointer part is the end of the list.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Link(usize);

impl Link {
    const END: Link = Link(0);

    #[inline]
    fn from_core(core: *mut NodeCore) -> Link {
        Link(core as usize)
    }

    #[inline]
    fn core(self) -> *mut NodeCore {
        (self.0 & !FLAGS_MASK) as *mut NodeCore
    }

    #[inline]
    fn raw(self) -> usize {
        self.0
    }

    #[inline]
    fn is_end(self) -> bool {
        self.core().is_null()
    }

    #[inline]
    fn is_removed(self) -> bool {
        self.0 & REMOVED_FLAG != 0
    }

    #[inline]
    fn is_dummy(self) -> bool {
        self.0 & DUMMY_FLAG != 0
    }

    #[inline]
    fn clear_flags(self) -> Link {
        Link(self.0 & !FLAGS_MASK)
    }

    #[inline]
    fn with_removed(self) -> Link {
        Link(self.0 | REMOVED_FLAG)
    }

    #[inline]
    fn with_dummy(self) -> Link {
        Link(self.0 | DUMMY_FLAG)
    }
}

/// Link word shared by user nodes and dummies. First field of [`Node`] so a
/// core pointer widens to the full node for user entries.
#[repr(C)]
struct NodeCore {
    next: AtomicUsize,
    reverse_hash: usize,
}

impl NodeCore {
    fn new() -> NodeCore {
        NodeCore {
            next: AtomicUsize::new(0),
            reverse_hash: 0,
        }
    }

    #[inline]
    fn next_link(&self) -> Link {
        Link(self.next.load(Ordering::Acquire))
    }

    #[inline]
    fn cas_next(&self, old: Link, new: Link) -> Result<(), Link> {
        self.next
            .compare_exchange(old.raw(), new.raw(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(Link)
    }
}

/// A user entry: an owned key, a payload and the list linkage.
///
/// Created by the caller and handed to the table by the `add` family, which
/// takes ownership. Displaced nodes come back as shared references valid
/// for the remainder of the caller's read-side critical section; the table
/// releases their memory after a later grace period.
#[repr(C)]
pub struct Node<V> {
    core: NodeCore,
    key: Box<[u8]>,
    value: V,
}

impl<V> Node<V> {
    pub fn new(key: impl Into<Box<[u8]>>, value: V) -> Box<Node<V>> {
        Box::new(Node {
            core: NodeCore::new(),
            key: key.into(),
            value,
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }
}

/// Position in the list: the matched node and the successor link observed
/// when it was reached. Replacement needs that exact link for its CAS.
pub struct Iter<'g, V> {
    node: *mut NodeCore,
    next: Link,
    _marker: PhantomData<&'g Node<V>>,
}

impl<V> Clone for Iter<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Iter<'_, V> {}

impl<'g, V> Iter<'g, V> {
    /// The node this iterator is positioned at, if any.
    pub fn node(&self) -> Option<&'g Node<V>> {
        if self.node.is_null() {
            None
        } else {
            Some(unsafe { &*(self.node as *const Node<V>) })
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum AddMode {
    Default,
    Unique,
    Replace,
}

enum AddResult {
    Added,
    /// A key-equivalent node is already present; the new one was not linked.
    Existing(*mut NodeCore),
    /// The key-equivalent node that was atomically substituted.
    Replaced(*mut NodeCore),
}

/// Counts returned by [`Table::count_nodes`].
#[derive(Clone, Copy, Debug)]
pub struct NodeCount {
    /// Split-counter estimate sampled before the walk.
    pub approx_before: isize,
    /// Live user nodes seen by the walk.
    pub count: usize,
    /// Logically removed but not yet unlinked user nodes seen by the walk.
    pub removed: usize,
    /// Split-counter estimate sampled after the walk.
    pub approx_after: isize,
}

struct ItemsCount {
    add: AtomicUsize,
    del: AtomicUsize,
}

/// Per-slot counters striped across hardware threads. Threads pick a slot
/// round-robin on first use, standing in for CPU affinity.
struct SplitCounters {
    slots: Box<[CachePadded<ItemsCount>]>,
    mask: usize,
}

thread_local! {
    static COUNTER_SLOT: Cell<usize> = Cell::new(usize::MAX);
}

static NEXT_COUNTER_SLOT: AtomicUsize = AtomicUsize::new(0);

impl SplitCounters {
    fn new() -> Option<SplitCounters> {
        let ncpus = thread::available_parallelism().ok()?.get();
        let ncpus = ncpus.next_power_of_two();
        let slots = (0..ncpus)
            .map(|_| {
                CachePadded::new(ItemsCount {
                    add: AtomicUsize::new(0),
                    del: AtomicUsize::new(0),
                })
            })
            .collect();
        Some(SplitCounters {
            slots,
            mask: ncpus - 1,
        })
    }

    #[inline]
    fn slot(&self) -> &ItemsCount {
        let index = COUNTER_SLOT.with(|slot| {
            let mut index = slot.get();
            if index == usize::MAX {
                index = NEXT_COUNTER_SLOT.fetch_add(1, Ordering::Relaxed);
                slot.set(index);
            }
            index
        });
        &self.slots[index & self.mask]
    }

    fn approx(&self) -> isize {
        self.slots
            .iter()
            .map(|slot| {
                slot.add.load(Ordering::Relaxed) as isize - slot.del.load(Ordering::Relaxed) as isize
            })
            .sum()
    }
}

/// Bucket dimensions. `size` is the authoritative dimension readers route
/// through; `resize_target` is only the goal of the resize worker.
struct Dims {
    size: AtomicUsize,
    resize_target: AtomicUsize,
    resize_initiated: AtomicBool,
    /// Entry `order` holds `2^(order-1)` dummies (one for `order` 0).
    /// Written under the resize mutex, read by everyone.
    tbl: [AtomicPtr<NodeCore>; MAX_TABLE_ORDER],
}

fn level_len(order: usize) -> usize {
    if order == 0 {
        1
    } else {
        1 << (order - 1)
    }
}

fn alloc_level(len: usize) -> *mut NodeCore {
    let mut level = Vec::with_capacity(len);
    level.resize_with(len, NodeCore::new);
    Box::into_raw(level.into_boxed_slice()) as *mut NodeCore
}

unsafe fn free_level(level: *mut NodeCore, len: usize) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(level, len)));
}

struct RawTable<V, F: RcuFlavor> {
    t: Dims,
    hash: HashFn,
    key_eq: KeyEqFn,
    seed: usize,
    flags: u32,
    /// Threads must be quiescent before taking this mutex: grace periods
    /// are awaited while it is held.
    resize_mutex: Mutex<()>,
    in_progress_resize: AtomicUsize,
    in_progress_destroy: AtomicBool,
    flavor: F,
    worker_stack: Option<usize>,
    /// Global approximate item count, fed by the split counters.
    count: AtomicIsize,
    counters: Option<SplitCounters>,
    _marker: PhantomData<Node<V>>,
}

/// Lock-free resizable hash table.
///
/// Keys are byte strings hashed and compared through the functions given at
/// creation; each entry additionally carries a `V` payload. Every operation
/// except [`resize`](Table::resize) and [`destroy`](Table::destroy) must be
/// called inside a read-side critical section of the table's flavor, on a
/// thread registered with it.
pub struct Table<V, F: RcuFlavor = crate::flavor::DefaultFlavor> {
    raw: Arc<RawTable<V, F>>,
}

impl<V, F> Table<V, F>
where
    V: Send + Sync + 'static,
    F: RcuFlavor,
{
    /// Creates a table with dummies populated for
    /// `max(init_size, MIN_TABLE_SIZE)` buckets.
    ///
    /// `init_size` must be zero or a power of two. `worker_stack` bounds the
    /// stack of the threads spawned for partitioned resizes. The calling
    /// thread must be registered with `flavor` and outside any read-side
    /// critical section.
    pub fn new(
        flavor: F,
        hash: HashFn,
        key_eq: KeyEqFn,
        seed: usize,
        init_size: usize,
        flags: u32,
        worker_stack: Option<usize>,
    ) -> Result<Table<V, F>, Error> {
        if init_size != 0 && !init_size.is_power_of_two() {
            return Err(Error::InvalidArg);
        }
        let raw = Arc::new(RawTable {
            t: Dims {
                size: AtomicUsize::new(0),
                resize_target: AtomicUsize::new(0),
                resize_initiated: AtomicBool::new(false),
                tbl: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            },
            hash,
            key_eq,
            seed,
            flags,
            resize_mutex: Mutex::new(()),
            in_progress_resize: AtomicUsize::new(0),
            in_progress_destroy: AtomicBool::new(false),
            flavor,
            worker_stack,
            count: AtomicIsize::new(0),
            counters: SplitCounters::new(),
            _marker: PhantomData,
        });
        let order = count_order(init_size.max(MIN_TABLE_SIZE)) as usize + 1;
        raw.flavor.thread_offline();
        {
            let _lock = raw.resize_mutex.lock();
            raw.t.resize_target.store(1 << (order - 1), Ordering::Relaxed);
            raw.init_table(0, order);
        }
        raw.flavor.thread_online();
        Ok(Table { raw })
    }

    /// The flavor this table reclaims through.
    pub fn flavor(&self) -> &F {
        &self.raw.flavor
    }

    /// The currently published bucket count.
    pub fn size(&self) -> usize {
        self.raw.t.size.load(Ordering::Acquire)
    }

    /// Positions an iterator at the first node matching `key`, or at null.
    pub fn lookup<'g>(&'g self, _guard: &'g F::Guard, key: &[u8]) -> Iter<'g, V> {
        let hash = (self.raw.hash)(key, self.raw.seed);
        let reverse_hash = hash.reverse_bits();
        let size = self.raw.t.size.load(Ordering::Acquire);
        let bucket = self.raw.lookup_bucket(size, hash);
        let mut node = unsafe { (*bucket).next_link() }.clear_flags().core();
        let (node, next) = unsafe {
            loop {
                if node.is_null() {
                    break (ptr::null_mut(), Link::END);
                }
                if (*node).reverse_hash > reverse_hash {
                    break (ptr::null_mut(), Link::END);
                }
                let next = (*node).next_link();
                if !next.is_removed()
                    && !next.is_dummy()
                    && (*node).reverse_hash == reverse_hash
                    && (self.raw.key_eq)(&(*(node as *const Node<V>)).key, key)
                {
                    break (node, next);
                }
                node = next.clear_flags().core();
            }
        };
        debug_assert!(node.is_null() || !unsafe { (*node).next_link() }.is_dummy());
        Iter {
            node,
            next,
            _marker: PhantomData,
        }
    }

    /// Advances `iter` to the next node with a key equal to the current
    /// node's, or to null.
    pub fn next_duplicate<'g>(&'g self, _guard: &'g F::Guard, iter: &mut Iter<'g, V>) {
        if iter.node.is_null() {
            return;
        }
        let (reverse_hash, key) = unsafe {
            let current = &*(iter.node as *const Node<V>);
            (current.core.reverse_hash, &*(current.key.as_ref() as *const [u8]))
        };
        let mut node = iter.next.clear_flags().core();
        let (node, next) = unsafe {
            loop {
                if node.is_null() {
                    break (ptr::null_mut(), Link::END);
                }
                if (*node).reverse_hash > reverse_hash {
                    break (ptr::null_mut(), Link::END);
                }
                let next = (*node).next_link();
                if !next.is_removed()
                    && !next.is_dummy()
                    && (self.raw.key_eq)(&(*(node as *const Node<V>)).key, key)
                {
                    break (node, next);
                }
                node = next.clear_flags().core();
            }
        };
        iter.node = node;
        iter.next = next;
    }

    /// Advances `iter` to the next user node in split order, or to null.
    pub fn next<'g>(&'g self, _guard: &'g F::Guard, iter: &mut Iter<'g, V>) {
        let mut node = iter.next.clear_flags().core();
        let (node, next) = unsafe {
            loop {
                if node.is_null() {
                    break (ptr::null_mut(), Link::END);
                }
                let next = (*node).next_link();
                if !next.is_removed() && !next.is_dummy() {
                    break (node, next);
                }
                node = next.clear_flags().core();
            }
        };
        iter.node = node;
        iter.next = next;
    }

    /// Positions an iterator at the first user node of the table.
    pub fn first<'g>(&'g self, guard: &'g F::Guard, iter: &mut Iter<'g, V>) {
        // The order-0 dummy heads the whole list.
        let head = self.raw.t.tbl[0].load(Ordering::Acquire);
        iter.node = ptr::null_mut();
        iter.next = unsafe { (*head).next_link() };
        self.next(guard, iter);
    }

    /// An iterator positioned at nothing, for use with [`first`](Table::first).
    pub fn iter<'g>(&'g self, _guard: &'g F::Guard) -> Iter<'g, V> {
        Iter {
            node: ptr::null_mut(),
            next: Link::END,
            _marker: PhantomData,
        }
    }

    /// Adds `node`; duplicate keys are allowed and left in place.
    pub fn add(&self, _guard: &F::Guard, mut node: Box<Node<V>>) {
        let hash = (self.raw.hash)(&node.key, self.raw.seed);
        node.core.reverse_hash = hash.reverse_bits();
        let size = self.raw.t.size.load(Ordering::Acquire);
        let core = Box::into_raw(node) as *mut NodeCore;
        let result = unsafe { self.raw.add_node(size, core, AddMode::Default, false) };
        debug_assert!(matches!(result, AddResult::Added));
        self.raw.count_add(size);
    }

    /// Adds `node` unless a key-equivalent node is present.
    ///
    /// On success returns a reference to the now-linked node. Otherwise the
    /// unlinked node comes back to the caller together with a reference to
    /// the existing one.
    #[allow(clippy::type_complexity)]
    pub fn add_unique<'g>(
        &'g self,
        _guard: &'g F::Guard,
        mut node: Box<Node<V>>,
    ) -> Result<&'g Node<V>, (Box<Node<V>>, &'g Node<V>)> {
        let hash = (self.raw.hash)(&node.key, self.raw.seed);
        node.core.reverse_hash = hash.reverse_bits();
        let size = self.raw.t.size.load(Ordering::Acquire);
        let core = Box::into_raw(node) as *mut NodeCore;
        match unsafe { self.raw.add_node(size, core, AddMode::Unique, false) } {
            AddResult::Added => {
                self.raw.count_add(size);
                Ok(unsafe { &*(core as *const Node<V>) })
            }
            AddResult::Existing(existing) => {
                let node = unsafe { Box::from_raw(core as *mut Node<V>) };
                Err((node, unsafe { &*(existing as *const Node<V>) }))
            }
            AddResult::Replaced(_) => unreachable!(),
        }
    }

    /// Adds `node`, atomically replacing a key-equivalent node if present.
    ///
    /// Returns the displaced node, if any. Its memory is released after a
    /// later grace period; the reference stays valid for this critical
    /// section, and concurrent readers keep seeing its fields unchanged.
    pub fn add_replace<'g>(
        &'g self,
        _guard: &'g F::Guard,
        mut node: Box<Node<V>>,
    ) -> Option<&'g Node<V>> {
        let hash = (self.raw.hash)(&node.key, self.raw.seed);
        node.core.reverse_hash = hash.reverse_bits();
        let size = self.raw.t.size.load(Ordering::Acquire);
        let core = Box::into_raw(node) as *mut NodeCore;
        match unsafe { self.raw.add_node(size, core, AddMode::Replace, false) } {
            AddResult::Added => {
                self.raw.count_add(size);
                None
            }
            AddResult::Replaced(old) => {
                self.raw.defer_node_free(old);
                Some(unsafe { &*(old as *const Node<V>) })
            }
            AddResult::Existing(_) => unreachable!(),
        }
    }

    /// Atomically substitutes `new` for the node `old_iter` is positioned
    /// at.
    ///
    /// The keys must be equivalent. Fails, handing `new` back, when the old
    /// node was concurrently removed. On success the displaced node is
    /// returned under the same deferred-release rules as
    /// [`add_replace`](Table::add_replace).
    pub fn replace<'g>(
        &'g self,
        _guard: &'g F::Guard,
        old_iter: &Iter<'g, V>,
        mut new: Box<Node<V>>,
    ) -> Result<&'g Node<V>, Box<Node<V>>> {
        if old_iter.node.is_null() {
            return Err(new);
        }
        let hash = (self.raw.hash)(&new.key, self.raw.seed);
        new.core.reverse_hash = hash.reverse_bits();
        debug_assert_eq!(
            new.core.reverse_hash,
            unsafe { (*old_iter.node).reverse_hash },
            "replacement key must hash to the same bucket position"
        );
        let size = self.raw.t.size.load(Ordering::Acquire);
        let core = Box::into_raw(new) as *mut NodeCore;
        match unsafe {
            self.raw
                .replace_node(size, old_iter.node, old_iter.next, core)
        } {
            Ok(()) => {
                self.raw.defer_node_free(old_iter.node);
                Ok(unsafe { &*(old_iter.node as *const Node<V>) })
            }
            Err(_) => Err(unsafe { Box::from_raw(core as *mut Node<V>) }),
        }
    }

    /// Removes the node `iter` is positioned at.
    ///
    /// Fails with [`Error::NotFound`] when it was concurrently removed. On
    /// success the node is returned under the deferred-release rules of
    /// [`add_replace`](Table::add_replace).
    pub fn del<'g>(&'g self, _guard: &'g F::Guard, iter: &Iter<'g, V>) -> Result<&'g Node<V>, Error> {
        if iter.node.is_null() {
            return Err(Error::NotFound);
        }
        let size = self.raw.t.size.load(Ordering::Acquire);
        unsafe { self.raw.del_node(size, iter.node, false) }?;
        self.raw.count_del(size);
        self.raw.defer_node_free(iter.node);
        Ok(unsafe { &*(iter.node as *const Node<V>) })
    }

    /// Grows or shrinks the table to `new_size` buckets, blocking until the
    /// resize completes.
    ///
    /// `new_size` is rounded up to a power of two and clamped to
    /// [`MIN_TABLE_SIZE`]. The caller must be outside any read-side
    /// critical section.
    pub fn resize(&self, new_size: usize) {
        let new_size = new_size.max(MIN_TABLE_SIZE).next_power_of_two();
        self.raw.t.resize_target.store(new_size, Ordering::Relaxed);
        self.raw.t.resize_initiated.store(true, Ordering::Relaxed);
        self.raw.flavor.thread_offline();
        {
            let _lock = self.raw.resize_mutex.lock();
            self.raw.do_resize();
        }
        self.raw.flavor.thread_online();
    }

    /// Walks the whole list and reports exact and approximate node counts.
    pub fn count_nodes(&self, _guard: &F::Guard) -> NodeCount {
        let approx_before = self.raw.approx_count();
        let mut count = 0;
        let mut removed = 0;
        let mut dummies = 0usize;
        unsafe {
            let mut node = self.raw.t.tbl[0].load(Ordering::Acquire);
            loop {
                let next = (*node).next_link();
                if next.is_dummy() {
                    dummies += 1;
                } else if next.is_removed() {
                    removed += 1;
                } else {
                    count += 1;
                }
                node = next.clear_flags().core();
                if node.is_null() {
                    break;
                }
            }
        }
        trace!(dummies, "count walk");
        NodeCount {
            approx_before,
            count,
            removed,
            approx_after: self.raw.approx_count(),
        }
    }

    /// Releases the table.
    ///
    /// Waits for in-flight lazy resizes, then verifies no user node
    /// remains; on [`Error::NonEmpty`] nothing is freed and the table is
    /// handed back. Must not run concurrently with any other operation on
    /// the table.
    pub fn destroy(self) -> Result<(), (Table<V, F>, Error)> {
        self.raw.in_progress_destroy.store(true, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.raw.in_progress_resize.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
        match unsafe { self.raw.delete_dummy() } {
            Ok(()) => Ok(()),
            Err(err) => {
                self.raw.in_progress_destroy.store(false, Ordering::SeqCst);
                Err((self, err))
            }
        }
    }
}

impl<V, F> RawTable<V, F>
where
    V: Send + Sync + 'static,
    F: RcuFlavor,
{
    /// Dummy anchoring the bucket of `hash` for a table of `size` buckets.
    #[inline]
    fn lookup_bucket(&self, size: usize, hash: usize) -> *mut NodeCore {
        debug_assert!(size > 0);
        let index = hash & (size - 1);
        let order = fls(index) as usize;
        let slot = index & if order == 0 { 0 } else { (1 << (order - 1)) - 1 };
        let level = self.t.tbl[order].load(Ordering::Acquire);
        debug_assert!(!level.is_null());
        unsafe { level.add(slot) }
    }

    fn approx_count(&self) -> isize {
        self.counters.as_ref().map_or(0, SplitCounters::approx)
    }

    /// Unlinks logically removed nodes from the bucket headed by `dummy`,
    /// up to the list position of `node`.
    unsafe fn gc_bucket(&self, dummy: *mut NodeCore, node: *mut NodeCore) {
        loop {
            let mut iter_prev = dummy;
            let mut iter = (*iter_prev).next_link();
            debug_assert!((*iter_prev).reverse_hash <= (*node).reverse_hash);
            debug_assert!(dummy != node);
            let next;
            loop {
                if iter.is_end() {
                    return;
                }
                if (*iter.core()).reverse_hash > (*node).reverse_hash {
                    return;
                }
                let n = (*iter.core()).next_link();
                if n.is_removed() {
                    next = n;
                    break;
                }
                iter_prev = iter.core();
                iter = n;
            }
            debug_assert!(!iter.is_removed());
            let mut new_next = next.clear_flags();
            if iter.is_dummy() {
                // keep the predecessor's own dummy mark
                new_next = new_next.with_dummy();
            }
            let _ = (*iter_prev).cas_next(iter, new_next);
        }
    }

    /// Links `node` into the split-ordered list for a table of `size`
    /// buckets. `node.reverse_hash` must already be set.
    unsafe fn add_node(
        self: &Arc<Self>,
        size: usize,
        node: *mut NodeCore,
        mode: AddMode,
        dummy: bool,
    ) -> AddResult {
        if size == 0 {
            // Initial first add: the list head sentinel.
            debug_assert!(dummy);
            (*node)
                .next
                .store(Link::END.with_dummy().raw(), Ordering::Relaxed);
            return AddResult::Added;
        }
        let reverse_hash = (*node).reverse_hash;
        let bucket = self.lookup_bucket(size, reverse_hash.reverse_bits());
        'retry: loop {
            let mut chain_len: u32 = 0;
            let mut iter_prev = bucket;
            let mut iter = (*iter_prev).next_link();
            debug_assert!((*iter_prev).reverse_hash <= reverse_hash);
            loop {
                if iter.is_end() {
                    break;
                }
                let iter_node = iter.core();
                if (*iter_node).reverse_hash > reverse_hash {
                    break;
                }
                // A dummy leads the run of nodes sharing its reverse hash.
                if dummy && (*iter_node).reverse_hash == reverse_hash {
                    break;
                }
                let next = (*iter_node).next_link();
                if next.is_removed() {
                    // Help unlink, then rescan from the same predecessor.
                    let mut new_next = next.clear_flags();
                    if iter.is_dummy() {
                        new_next = new_next.with_dummy();
                    }
                    let _ = (*iter_prev).cas_next(iter, new_next);
                    iter = (*iter_prev).next_link();
                    if iter.is_removed() {
                        // The predecessor died as well; back to the dummy.
                        continue 'retry;
                    }
                    continue;
                }
                if mode != AddMode::Default
                    && !next.is_dummy()
                    && (*iter_node).reverse_hash == reverse_hash
                {
                    let found = &*(iter_node as *const Node<V>);
                    let new = &*(node as *const Node<V>);
                    if (self.key_eq)(&found.key, &new.key) {
                        match mode {
                            AddMode::Unique => return AddResult::Existing(iter_node),
                            AddMode::Replace => {
                                if self.replace_node(size, iter_node, next, node).is_ok() {
                                    return AddResult::Replaced(iter_node);
                                }
                                continue 'retry;
                            }
                            AddMode::Default => unreachable!(),
                        }
                    }
                }
                // Account for each distinct reverse hash once.
                if (*iter_prev).reverse_hash != (*iter_node).reverse_hash && !next.is_dummy() {
                    chain_len += 1;
                    self.check_resize(size, chain_len);
                }
                iter_prev = iter_node;
                iter = next;
            }
            debug_assert!(node != iter.core());
            debug_assert!(!iter.is_removed());
            debug_assert!(iter_prev != node);
            let succ = iter.clear_flags();
            let own = if dummy { succ.with_dummy() } else { succ };
            (*node).next.store(own.raw(), Ordering::Relaxed);
            let mut new_link = Link::from_core(node);
            if iter.is_dummy() {
                new_link = new_link.with_dummy();
            }
            if (*iter_prev).cas_next(iter, new_link).is_ok() {
                return AddResult::Added;
            }
            // Lost the race; retry from the bucket dummy.
        }
    }

    /// Substitutes `new_node` for `old_node` with a single CAS on
    /// `old_node.next`: the same word flags the old node removed and
    /// publishes the new one, so a traversal either skips the old node and
    /// finds the new, or still reads the old; never neither.
    unsafe fn replace_node(
        &self,
        size: usize,
        old_node: *mut NodeCore,
        mut old_next: Link,
        new_node: *mut NodeCore,
    ) -> Result<(), Error> {
        debug_assert!(old_node != new_node);
        loop {
            if old_next.is_removed() {
                // Removed under us between lookup and replace.
                return Err(Error::NotFound);
            }
            debug_assert!(!old_next.is_dummy());
            debug_assert!(new_node != old_next.core());
            (*new_node)
                .next
                .store(old_next.clear_flags().raw(), Ordering::Relaxed);
            match (*old_node).cas_next(old_next, Link::from_core(new_node).with_removed()) {
                Ok(()) => break,
                Err(current) => old_next = current,
            }
        }
        // Unlink the old node before anyone relies on it being gone.
        let bucket = self.lookup_bucket(size, (*old_node).reverse_hash.reverse_bits());
        self.gc_bucket(bucket, new_node);
        debug_assert!((*old_node).next_link().is_removed());
        Ok(())
    }

    /// Logically removes `node`, then garbage-collects its bucket.
    unsafe fn del_node(
        &self,
        size: usize,
        node: *mut NodeCore,
        dummy_removal: bool,
    ) -> Result<(), Error> {
        let mut old = (*node).next_link();
        loop {
            let next = old;
            if next.is_removed() {
                return Err(Error::NotFound);
            }
            debug_assert_eq!(next.is_dummy(), dummy_removal);
            match (*node).cas_next(next, next.with_removed()) {
                Ok(()) => break,
                Err(current) => old = current,
            }
        }
        // We won the removal CAS and own the unlinking.
        let bucket = self.lookup_bucket(size, (*node).reverse_hash.reverse_bits());
        self.gc_bucket(bucket, node);
        debug_assert!((*node).next_link().is_removed());
        Ok(())
    }

    fn count_add(self: &Arc<Self>, size: usize) {
        let Some(counters) = &self.counters else {
            return;
        };
        let local = counters.slot().add.fetch_add(1, Ordering::Relaxed) + 1;
        if local & ((1 << COUNT_COMMIT_ORDER) - 1) != 0 {
            return;
        }
        cold_path(|| {
            let delta = 1isize << COUNT_COMMIT_ORDER;
            let count = self.count.fetch_add(delta, Ordering::Relaxed) + delta;
            trace!(count, "committed add delta");
            // Only react when the global count crosses a power of two.
            if count & (count - 1) != 0 {
                return;
            }
            if (count >> CHAIN_LEN_RESIZE_THRESHOLD) < size as isize {
                return;
            }
            self.resize_lazy_count(size, (count >> (CHAIN_LEN_TARGET - 1)) as usize);
        });
    }

    fn count_del(self: &Arc<Self>, size: usize) {
        let Some(counters) = &self.counters else {
            return;
        };
        let local = counters.slot().del.fetch_add(1, Ordering::Relaxed) + 1;
        if local & ((1 << COUNT_COMMIT_ORDER) - 1) != 0 {
            return;
        }
        cold_path(|| {
            let delta = 1isize << COUNT_COMMIT_ORDER;
            let count = self.count.fetch_sub(delta, Ordering::Relaxed) - delta;
            trace!(count, "committed del delta");
            if count & (count - 1) != 0 {
                return;
            }
            if (count >> CHAIN_LEN_RESIZE_THRESHOLD) >= size as isize {
                return;
            }
            // Do not shrink while the count is within counter slack.
            if count < (1isize << COUNT_COMMIT_ORDER) * counters.slots.len() as isize {
                return;
            }
            self.resize_lazy_count(size, (count >> (CHAIN_LEN_TARGET - 1)) as usize);
        });
    }

    /// Chain-length feedback from the add scan. Bucket-local length drives
    /// expansion for small tables and builds lacking counter support.
    fn check_resize(self: &Arc<Self>, size: usize, chain_len: u32) {
        if self.flags & AUTO_RESIZE == 0 {
            return;
        }
        if self.count.load(Ordering::Relaxed) >= 1 << COUNT_COMMIT_ORDER {
            return;
        }
        if chain_len > 100 {
            warn!(chain_len, "large chain detected");
        }
        if chain_len >= CHAIN_LEN_RESIZE_THRESHOLD {
            cold_path(|| {
                let growth = count_order((chain_len - (CHAIN_LEN_TARGET - 1)) as usize);
                self.resize_lazy(size, growth);
            });
        }
    }

    fn resize_lazy(self: &Arc<Self>, size: usize, growth: u32) {
        let target = size << growth;
        let target = self.t.resize_target.fetch_max(target, Ordering::Relaxed).max(target);
        // Store the target before reading resize_initiated.
        fence(Ordering::SeqCst);
        if !self.t.resize_initiated.load(Ordering::Relaxed) && size < target {
            self.queue_resize_work();
        }
    }

    fn resize_lazy_count(self: &Arc<Self>, _size: usize, count: usize) {
        if self.flags & AUTO_RESIZE == 0 {
            return;
        }
        let count = count.max(MIN_TABLE_SIZE);
        self.t.resize_target.store(count, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        if !self.t.resize_initiated.load(Ordering::Relaxed) {
            self.queue_resize_work();
        }
    }

    fn queue_resize_work(self: &Arc<Self>) {
        self.in_progress_resize.fetch_add(1, Ordering::SeqCst);
        if self.in_progress_destroy.load(Ordering::SeqCst) {
            self.in_progress_resize.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        let raw = self.clone();
        self.flavor.defer(Box::new(move || raw.resize_work()));
        self.t.resize_initiated.store(true, Ordering::Relaxed);
    }

    fn defer_node_free(&self, core: *mut NodeCore) {
        let addr = core as usize;
        self.flavor.defer(Box::new(move || unsafe {
            drop(Box::from_raw(addr as *mut Node<V>));
        }));
    }

    /// Lazy-resize callback; runs in the flavor's deferred-work context.
    fn resize_work(self: Arc<Self>) {
        self.flavor.thread_offline();
        {
            let _lock = self.resize_mutex.lock();
            self.do_resize();
        }
        self.flavor.thread_online();
        // Finish the resize before dropping the in-progress count.
        fence(Ordering::SeqCst);
        self.in_progress_resize.fetch_sub(1, Ordering::SeqCst);
    }

    /// Resize loop; redone while the target moves under us. Called with the
    /// resize mutex held, from a quiescent thread.
    fn do_resize(self: &Arc<Self>) {
        loop {
            if self.in_progress_destroy.load(Ordering::SeqCst) {
                break;
            }
            self.t.resize_initiated.store(true, Ordering::Relaxed);
            let old_size = self.t.size.load(Ordering::Relaxed);
            let new_size = self.t.resize_target.load(Ordering::Relaxed);
            if old_size < new_size {
                self.grow(old_size, new_size);
            } else if old_size > new_size {
                self.shrink(old_size, new_size);
            }
            self.t.resize_initiated.store(false, Ordering::Relaxed);
            // Publish resize_initiated before re-reading the target.
            fence(Ordering::SeqCst);
            if self.t.size.load(Ordering::Relaxed) == self.t.resize_target.load(Ordering::Relaxed) {
                break;
            }
        }
    }

    fn grow(self: &Arc<Self>, old_size: usize, new_size: usize) {
        debug_assert!(new_size > old_size);
        let old_order = count_order(old_size) as usize + 1;
        let new_order = count_order(new_size) as usize + 1;
        debug!(old_size, new_size, old_order, new_order, "grow");
        self.init_table(old_order, new_order - old_order);
    }

    fn shrink(self: &Arc<Self>, old_size: usize, new_size: usize) {
        let new_size = new_size.max(MIN_TABLE_SIZE);
        debug_assert!(new_size < old_size);
        let old_order = count_order(old_size) as usize + 1;
        let new_order = count_order(new_size) as usize + 1;
        debug!(old_size, new_size, old_order, new_order, "shrink");
        self.fini_table(new_order, old_order - new_order);
    }

    /// Allocates and links one level of dummies per order, publishing the
    /// grown size as each level completes.
    fn init_table(self: &Arc<Self>, first_order: usize, len_order: usize) {
        debug!(first_order, len_order, "init table");
        for order in first_order..first_order + len_order {
            let len = level_len(order);
            let order_size = if order == 0 { 1 } else { 1 << order };
            // Stop expanding if the target shrank under us.
            if self.t.resize_target.load(Ordering::Relaxed) < order_size {
                break;
            }
            let level = alloc_level(len);
            self.t.tbl[order].store(level, Ordering::Release);
            self.populate(order, len);
            // All dummies of this level are linked; publish the size.
            self.t.size.store(order_size, Ordering::Release);
            debug!(size = order_size, "grow published");
            if self.in_progress_destroy.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Unlinks and frees one level of dummies per order, from the top down.
    /// The shrunk size is published first so no new bucket walk can route
    /// through a departing dummy, then a grace period drains walks already
    /// in flight.
    fn fini_table(self: &Arc<Self>, first_order: usize, len_order: usize) {
        debug!(first_order, len_order, "fini table");
        debug_assert!(first_order > 0);
        let mut free_by_rcu: Option<(usize, *mut NodeCore)> = None;
        for order in (first_order..first_order + len_order).rev() {
            let len = level_len(order);
            // Stop shrinking if the target grew under us.
            if self.t.resize_target.load(Ordering::Relaxed) > (1 << (order - 1)) {
                break;
            }
            self.t.size.store(1 << (order - 1), Ordering::Release);
            debug!(size = 1usize << (order - 1), "shrink published");
            self.flavor.synchronize();
            if let Some((freed_order, level)) = free_by_rcu.take() {
                unsafe { free_level(level, level_len(freed_order)) };
            }
            self.remove_table(order, len);
            free_by_rcu = Some((order, self.t.tbl[order].load(Ordering::Relaxed)));
            if self.in_progress_destroy.load(Ordering::SeqCst) {
                break;
            }
        }
        if let Some((freed_order, level)) = free_by_rcu {
            self.flavor.synchronize();
            unsafe { free_level(level, level_len(freed_order)) };
        }
    }

    fn populate(self: &Arc<Self>, order: usize, len: usize) {
        if self.counters.is_none() || len < 2 * MIN_PARTITION_PER_THREAD {
            self.flavor.thread_online();
            Self::populate_partition(self, order, 0, len);
            self.flavor.thread_offline();
            return;
        }
        self.partition_work(order, len, Self::populate_partition);
    }

    fn remove_table(self: &Arc<Self>, order: usize, len: usize) {
        if self.counters.is_none() || len < 2 * MIN_PARTITION_PER_THREAD {
            self.flavor.thread_online();
            Self::remove_partition(self, order, 0, len);
            self.flavor.thread_offline();
            return;
        }
        self.partition_work(order, len, Self::remove_partition);
    }

    /// Sets reverse hashes for a range of a level's dummies and links them
    /// into the list. Runs inside a read-side critical section so the nodes
    /// traversed cannot be reclaimed mid-walk.
    fn populate_partition(self: &Arc<Self>, order: usize, start: usize, len: usize) {
        let prev_size = if order == 0 { 0 } else { 1usize << (order - 1) };
        let level = self.t.tbl[order].load(Ordering::Acquire);
        let guard = self.flavor.read_lock();
        for j in start..start + len {
            let dummy = unsafe { level.add(j) };
            trace!(order, j, "populate dummy");
            unsafe {
                (*dummy).reverse_hash = (prev_size + j).reverse_bits();
                let result = self.add_node(prev_size, dummy, AddMode::Default, true);
                debug_assert!(matches!(result, AddResult::Added));
            }
        }
        drop(guard);
    }

    /// Logically removes and unlinks a range of a level's dummies.
    fn remove_partition(self: &Arc<Self>, order: usize, start: usize, len: usize) {
        debug_assert!(order > 0);
        let prev_size = 1usize << (order - 1);
        let level = self.t.tbl[order].load(Ordering::Acquire);
        let guard = self.flavor.read_lock();
        for j in start..start + len {
            let dummy = unsafe { level.add(j) };
            trace!(order, j, "remove dummy");
            debug_assert_eq!(
                unsafe { (*dummy).reverse_hash },
                (prev_size + j).reverse_bits()
            );
            let result = unsafe { self.del_node(prev_size, dummy, true) };
            debug_assert!(result.is_ok());
        }
        drop(guard);
    }

    /// Splits `len` dummies of `order` across one worker per hardware
    /// thread, with a floor of one partition per worker.
    fn partition_work(
        self: &Arc<Self>,
        order: usize,
        len: usize,
        work: fn(&Arc<RawTable<V, F>>, usize, usize, usize),
    ) {
        let ncpus = self.counters.as_ref().map_or(1, |c| c.slots.len());
        let nr_threads = ncpus.min(len >> MIN_PARTITION_PER_THREAD_ORDER).max(1);
        let partition_len = len >> count_order(nr_threads);
        debug!(order, len, nr_threads, "partitioned resize work");
        thread::scope(|scope| {
            for index in 0..nr_threads {
                let start = index * partition_len;
                let mut builder = thread::Builder::new().name("quiesce-resize".into());
                if let Some(stack) = self.worker_stack {
                    builder = builder.stack_size(stack);
                }
                builder
                    .spawn_scoped(scope, move || {
                        self.flavor.register_thread();
                        work(self, order, start, partition_len);
                        self.flavor.unregister_thread();
                    })
                    .expect("failed to spawn a resize worker");
            }
        });
    }

    /// Checks the table holds nothing but dummies, then frees every level.
    unsafe fn delete_dummy(&self) -> Result<(), Error> {
        let head = self.t.tbl[0].load(Ordering::Relaxed);
        let mut link = (*head).next_link();
        loop {
            if !link.is_dummy() {
                return Err(Error::NonEmpty);
            }
            debug_assert!(!link.is_removed());
            if link.is_end() {
                break;
            }
            link = (*link.core()).next_link();
        }
        let size = self.t.size.load(Ordering::Relaxed);
        for order in 0..=count_order(size) as usize {
            let len = level_len(order);
            let level = self.t.tbl[order].load(Ordering::Relaxed);
            for index in 0..len {
                debug_assert!(Link((*level.add(index)).next.load(Ordering::Relaxed)).is_dummy());
            }
            free_level(level, len);
            self.t.tbl[order].store(ptr::null_mut(), Ordering::Relaxed);
        }
        Ok(())
    }
}

impl<V, F: RcuFlavor> Drop for RawTable<V, F> {
    fn drop(&mut self) {
        // destroy() already released the levels when it succeeded.
        let head = self.t.tbl[0].load(Ordering::Relaxed);
        if head.is_null() {
            return;
        }
        unsafe {
            // Release remaining user nodes, then the dummy levels.
            let mut node = head;
            loop {
                let next = (*node).next_link();
                let successor = next.clear_flags().core();
                if !next.is_dummy() {
                    drop(Box::from_raw(node as *mut Node<V>));
                }
                if successor.is_null() {
                    break;
                }
                node = successor;
            }
            let size = *self.t.size.get_mut();
            for order in 0..=count_order(size) as usize {
                let level = *self.t.tbl[order].get_mut();
                free_level(level, level_len(order));
            }
        }
    }
}
