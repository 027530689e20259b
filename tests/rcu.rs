use quiesce::rcu::Rcu;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread;

const UPDATES: usize = if cfg!(miri) { 50 } else { 2000 };
const READERS: usize = 4;

// Readers dereference the shared pointer inside their critical sections
// while the writer keeps swapping it and deferring the frees. Any reclaim
// before the last reader left its section shows up as a bogus value (and as
// use-after-free under a checker).
#[test]
fn readers_never_observe_reclaimed_values() {
    let rcu = Arc::new(Rcu::new());
    let current = Arc::new(AtomicPtr::new(Box::into_raw(Box::new(0usize))));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let rcu = rcu.clone();
            let current = current.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                rcu.register_thread();
                let mut observed = 0;
                while !stop.load(Ordering::Acquire) {
                    let guard = rcu.read_lock();
                    let value = unsafe { *current.load(Ordering::Acquire) };
                    assert!(value <= UPDATES, "observed a reclaimed value");
                    assert!(value >= observed, "updates went backwards");
                    observed = value;
                    drop(guard);
                }
                rcu.unregister_thread();
            })
        })
        .collect();

    for update in 1..=UPDATES {
        let next = Box::into_raw(Box::new(update));
        let old = current.swap(next, Ordering::AcqRel) as usize;
        rcu.defer(move || unsafe { drop(Box::from_raw(old as *mut usize)) });
    }

    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }
    let last = current.load(Ordering::Acquire);
    drop(rcu);
    unsafe { drop(Box::from_raw(last)) };
}

// Same shape but with synchronize() and immediate frees on the writer.
#[test]
fn synchronize_allows_immediate_free() {
    const SWAPS: usize = if cfg!(miri) { 20 } else { 500 };

    let rcu = Arc::new(Rcu::new());
    let current = Arc::new(AtomicPtr::new(Box::into_raw(Box::new(0usize))));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let rcu = rcu.clone();
            let current = current.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                rcu.register_thread();
                while !stop.load(Ordering::Acquire) {
                    let guard = rcu.read_lock();
                    let value = unsafe { *current.load(Ordering::Acquire) };
                    assert!(value <= SWAPS);
                    drop(guard);
                }
                rcu.unregister_thread();
            })
        })
        .collect();

    for swap in 1..=SWAPS {
        let next = Box::into_raw(Box::new(swap));
        let old = current.swap(next, Ordering::AcqRel);
        // Every section that could have seen `old` has ended after this.
        rcu.synchronize();
        unsafe { drop(Box::from_raw(old)) };
    }

    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }
    unsafe { drop(Box::from_raw(current.load(Ordering::Acquire))) };
}
