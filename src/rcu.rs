//! Quiescent-state grace-period engine.
//!
//! Reader threads register once with an engine, then delimit read-side
//! critical sections with [`Rcu::read_lock`]. The read fast path is a single
//! store to a counter owned by the reader thread; there is no atomic
//! read-modify-write and no load of another thread's state. Writers call
//! [`Rcu::synchronize`] to wait until every critical section that existed
//! when the call started has ended, or [`Rcu::defer`] to have a callback run
//! from the engine's worker thread after a future grace period.
//!
//! An engine is created with [`Rcu::new`] and shut down by dropping the last
//! `Arc` handle to it; the drop drains all pending deferred callbacks. Every
//! thread must be unregistered before the engine goes away.

use crate::util::cold_path;
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::{
    cell::RefCell,
    marker::PhantomData,
    mem,
    sync::{
        atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};


/// Parity bit toggled by each grace-period phase.
const GP_PHASE: usize = 1 << (usize::BITS / 2);

/// Mask for the nesting count kept in the low half of a reader counter.
const GP_NEST_MASK: usize = GP_PHASE - 1;

/// Base count pre-set in the global counter, so the outermost `read_lock`
/// is a plain copy of the global word.
const GP_COUNT: usize = 1;

/// Polling iterations before the writer re-issues a full fence while
/// waiting out a slow reader.
const KICK_READER_LOOPS: u32 = 1000;

/// A reader thread's critical-section counter.
///
/// Zero means quiescent. Otherwise the low half counts the nesting depth and
/// the high bit records the global parity observed on outermost entry.
struct ReaderCtr {
    active: AtomicUsize,
}

/// Grace-period state shared between engine handles and the worker thread.
struct GpState {
    /// Global grace-period counter: the parity bit plus `GP_COUNT`.
    /// Written only with the registry lock held; read by every reader.
    gp_ctr: AtomicUsize,
    /// Registered reader threads. The lock doubles as the writer mutex
    /// serializing parity flips.
    registry: Mutex<Vec<(ThreadId, Arc<ReaderCtr>)>>,
    grace_periods: AtomicU64,
}

struct ThreadReader {
    gp: Arc<GpState>,
    ctr: Arc<ReaderCtr>,
}

thread_local! {
    static READER: RefCell<Option<ThreadReader>> = RefCell::new(None);
}

impl GpState {
    fn register_current(self: &Arc<Self>) {
        READER.with(|slot| {
            let mut slot = slot.borrow_mut();
            assert!(
                slot.is_none(),
                "thread is already registered with an engine"
            );
            let ctr = Arc::new(ReaderCtr {
                active: AtomicUsize::new(0),
            });
            self.registry
                .lock()
                .push((thread::current().id(), ctr.clone()));
            *slot = Some(ThreadReader {
                gp: self.clone(),
                ctr,
            });
        });
    }

    fn unregister_current(self: &Arc<Self>) {
        READER.with(|slot| {
            let mut slot = slot.borrow_mut();
            {
                // Validate before vacating the slot: a panic here must leave
                // the reader state in place for any outstanding guard.
                let reader = slot.as_ref().expect("thread is not registered");
                assert!(
                    Arc::ptr_eq(&reader.gp, self),
                    "thread is registered with a different engine"
                );
                assert_eq!(
                    reader.ctr.active.load(Ordering::Relaxed) & GP_NEST_MASK,
                    0,
                    "unregistering inside a read-side critical section"
                );
            }
            *slot = None;
            let mut registry = self.registry.lock();
            let id = thread::current().id();
            let pos = registry
                .iter()
                .position(|(tid, _)| *tid == id)
                .expect("thread missing from the reader registry");
            registry.swap_remove(pos);
        });
    }

    #[inline]
    fn read_lock_current(self: &Arc<Self>) -> ReadGuard {
        READER.with(|slot| {
            let slot = slot.borrow();
            let reader = slot.as_ref().expect("thread is not registered");
            debug_assert!(Arc::ptr_eq(&reader.gp, self));
            let ctr = &reader.ctr;
            let active = ctr.active.load(Ordering::Relaxed);
            if active & GP_NEST_MASK == 0 {
                // Outermost entry publishes the observed parity.
                ctr.active
                    .store(self.gp_ctr.load(Ordering::Relaxed), Ordering::SeqCst);
                fence(Ordering::SeqCst);
            } else {
                ctr.active.store(active + GP_COUNT, Ordering::Relaxed);
            }
            ReadGuard {
                ctr: Arc::as_ptr(ctr),
                _not_send: PhantomData,
            }
        })
    }

    fn assert_quiescent(self: &Arc<Self>) {
        READER.with(|slot| {
            if let Some(reader) = slot.borrow().as_ref() {
                if Arc::ptr_eq(&reader.gp, self) {
                    debug_assert_eq!(
                        reader.ctr.active.load(Ordering::Relaxed) & GP_NEST_MASK,
                        0,
                        "current thread holds a read-side critical section"
                    );
                }
            }
        });
    }

    fn synchronize(self: &Arc<Self>) {
        // Waiting on a grace period from inside one never completes.
        self.assert_quiescent();
        let registry = self.registry.lock();
        fence(Ordering::SeqCst);
        self.flip_and_wait(&registry);
        self.flip_and_wait(&registry);
        fence(Ordering::SeqCst);
        self.grace_periods.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(readers = registry.len(), "grace period completed");
    }

    /// Toggle the parity bit, then wait until no reader is still inside a
    /// critical section begun under the previous parity. Two flips per grace
    /// period; a single one would let a reader that sampled the pre-flip
    /// parity alias one that sampled the post-flip value.
    fn flip_and_wait(&self, registry: &[(ThreadId, Arc<ReaderCtr>)]) {
        let new_ctr = self.gp_ctr.load(Ordering::Relaxed) ^ GP_PHASE;
        self.gp_ctr.store(new_ctr, Ordering::SeqCst);
        for (_, reader) in registry {
            let backoff = Backoff::new();
            let mut loops = 0;
            loop {
                let active = reader.active.load(Ordering::SeqCst);
                if active & GP_NEST_MASK == 0 || (active ^ new_ctr) & GP_PHASE == 0 {
                    break;
                }
                loops += 1;
                if loops == KICK_READER_LOOPS {
                    // Force the reader's counter update to become visible.
                    fence(Ordering::SeqCst);
                    loops = 0;
                } else {
                    backoff.spin();
                }
            }
        }
    }
}

type Callback = Box<dyn FnOnce() + Send>;

struct DeferQueue {
    pending: Mutex<Vec<Callback>>,
    nonempty: Condvar,
    shutdown: AtomicBool,
}

/// Grace-period engine handle.
///
/// Cheap to share through an `Arc`. See the module documentation for the
/// lifecycle rules.
pub struct Rcu {
    gp: Arc<GpState>,
    queue: Arc<DeferQueue>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Rcu {
    /// Creates an engine and spawns its deferred-callback worker thread.
    pub fn new() -> Self {
        let gp = Arc::new(GpState {
            gp_ctr: AtomicUsize::new(GP_COUNT),
            registry: Mutex::new(Vec::new()),
            grace_periods: AtomicU64::new(0),
        });
        let queue = Arc::new(DeferQueue {
            pending: Mutex::new(Vec::new()),
            nonempty: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker = {
            let gp = gp.clone();
            let queue = queue.clone();
            thread::Builder::new()
                .name("quiesce-defer".into())
                .spawn(move || worker_loop(gp, queue))
                .expect("failed to spawn the deferred-callback worker")
        };
        Rcu {
            gp,
            queue,
            worker: Some(worker),
        }
    }

    /// Adds the current thread to the engine's reader set.
    ///
    /// Must be called before the thread's first [`read_lock`](Self::read_lock).
    /// Panics if the thread is already registered with any engine.
    pub fn register_thread(&self) {
        cold_path(|| self.gp.register_current());
    }

    /// Removes the current thread from the reader set.
    ///
    /// Panics when called from an unregistered thread or with an active
    /// read-side critical section.
    pub fn unregister_thread(&self) {
        cold_path(|| self.gp.unregister_current());
    }

    /// Enters a read-side critical section; dropping the guard leaves it.
    ///
    /// Sections nest freely. Never blocks and never allocates.
    #[inline]
    pub fn read_lock(&self) -> ReadGuard {
        self.gp.read_lock_current()
    }

    /// Blocks until every read-side critical section that began before this
    /// call has ended.
    ///
    /// New critical sections may start at any time; they are not waited on.
    /// The caller must not hold a read-side critical section itself.
    pub fn synchronize(&self) {
        self.gp.synchronize();
    }

    /// Runs `callback` on the engine's worker thread after a future grace
    /// period has elapsed.
    pub fn defer(&self, callback: impl FnOnce() + Send + 'static) {
        let mut pending = self.queue.pending.lock();
        pending.push(Box::new(callback));
        drop(pending);
        self.queue.nonempty.notify_one();
    }

    /// Number of grace periods completed so far.
    pub fn grace_periods(&self) -> u64 {
        self.gp.grace_periods.load(Ordering::Relaxed)
    }

    pub(crate) fn assert_quiescent(&self) {
        self.gp.assert_quiescent();
    }
}

impl Default for Rcu {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Rcu {
    fn drop(&mut self) {
        self.queue.shutdown.store(true, Ordering::Release);
        self.queue.nonempty.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        debug_assert!(
            self.gp.registry.lock().is_empty(),
            "engine dropped with registered readers"
        );
    }
}

fn worker_loop(gp: Arc<GpState>, queue: Arc<DeferQueue>) {
    // The worker registers like any reader so it can link dummy nodes on
    // behalf of tables resizing from deferred work.
    gp.register_current();
    loop {
        let batch = {
            let mut pending = queue.pending.lock();
            while pending.is_empty() && !queue.shutdown.load(Ordering::Acquire) {
                queue.nonempty.wait(&mut pending);
            }
            mem::take(&mut *pending)
        };
        if !batch.is_empty() {
            gp.synchronize();
            tracing::trace!(callbacks = batch.len(), "running deferred batch");
            for callback in batch {
                callback();
            }
            // Callbacks may defer more work; drain before honoring shutdown.
            continue;
        }
        if queue.shutdown.load(Ordering::Acquire) {
            break;
        }
    }
    gp.unregister_current();
}

/// RAII token for a read-side critical section.
///
/// Tied to the registering thread; guards cannot be sent elsewhere.
pub struct ReadGuard {
    ctr: *const ReaderCtr,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for ReadGuard {
    #[inline]
    fn drop(&mut self) {
        let ctr = unsafe { &*self.ctr };
        fence(Ordering::SeqCst);
        let active = ctr.active.load(Ordering::Relaxed);
        debug_assert_ne!(active & GP_NEST_MASK, 0);
        ctr.active.store(active - GP_COUNT, Ordering::SeqCst);
    }
}
