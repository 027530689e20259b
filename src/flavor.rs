//! Reclamation plug-in interface consumed by the hash table.
//!
//! The table never names the engine directly; everything it needs from a
//! reclamation scheme goes through [`RcuFlavor`]. [`DefaultFlavor`] routes
//! the operations to this crate's [`Rcu`] engine.

use crate::rcu::{Rcu, ReadGuard};
use std::sync::Arc;

/// Operations a reclamation scheme must provide to host the hash table.
///
/// `read_unlock` is the drop of the associated [`Guard`](Self::Guard) type.
/// Implementations must uphold the usual grace-period contract: memory
/// handed to [`defer`](Self::defer) is only touched by the callback once
/// every read-side critical section live at the time of the call has ended,
/// and [`synchronize`](Self::synchronize) returns only after the same.
pub trait RcuFlavor: Clone + Send + Sync + 'static {
    /// RAII token for a read-side critical section.
    type Guard;

    /// Registers the calling thread as a reader.
    fn register_thread(&self);

    /// Unregisters the calling thread. Panics on unbalanced use.
    fn unregister_thread(&self);

    /// Enters a read-side critical section.
    fn read_lock(&self) -> Self::Guard;

    /// Declares the calling thread quiescent for an extended period.
    ///
    /// Called before blocking operations that wait on grace periods, so a
    /// grace period can never wait on the waiter itself.
    fn thread_offline(&self);

    /// Ends an offline period started by [`thread_offline`](Self::thread_offline).
    fn thread_online(&self);

    /// Blocks until all pre-existing read-side critical sections end.
    fn synchronize(&self);

    /// Invokes `callback` after a future grace period, in a worker context.
    fn defer(&self, callback: Box<dyn FnOnce() + Send>);
}

/// [`RcuFlavor`] backed by the crate's grace-period engine.
#[derive(Clone)]
pub struct DefaultFlavor {
    rcu: Arc<Rcu>,
}

impl DefaultFlavor {
    pub fn new(rcu: Arc<Rcu>) -> Self {
        Self { rcu }
    }

    /// The engine behind this flavor.
    pub fn engine(&self) -> &Arc<Rcu> {
        &self.rcu
    }
}

impl RcuFlavor for DefaultFlavor {
    type Guard = ReadGuard;

    fn register_thread(&self) {
        self.rcu.register_thread()
    }

    fn unregister_thread(&self) {
        self.rcu.unregister_thread()
    }

    #[inline]
    fn read_lock(&self) -> ReadGuard {
        self.rcu.read_lock()
    }

    fn thread_offline(&self) {
        // This flavor has no explicit offline state; being outside any
        // read-side critical section is the quiescent condition.
        self.rcu.assert_quiescent();
    }

    fn thread_online(&self) {}

    fn synchronize(&self) {
        self.rcu.synchronize()
    }

    fn defer(&self, callback: Box<dyn FnOnce() + Send>) {
        self.rcu.defer(callback)
    }
}
