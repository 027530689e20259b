use quiesce::error::Error;
use quiesce::flavor::{DefaultFlavor, RcuFlavor};
use quiesce::rcu::Rcu;
use quiesce::table::{Node, Table, AUTO_RESIZE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;

fn fnv_hash(key: &[u8], seed: usize) -> usize {
    let mut hash = 0xcbf2_9ce4_8422_2325u64 ^ seed as u64;
    for &byte in key {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash as usize
}

fn key_eq(a: &[u8], b: &[u8]) -> bool {
    a == b
}

fn new_shared_table(
    rcu: &Arc<Rcu>,
    init_size: usize,
    flags: u32,
) -> Arc<Table<u64>> {
    let flavor = DefaultFlavor::new(rcu.clone());
    Arc::new(Table::new(flavor, fnv_hash, key_eq, 0x9e37_79b9, init_size, flags, None).unwrap())
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

// Sixteen threads race to claim one key; exactly one insertion wins and
// every loser is handed the winner's node.
#[test]
fn add_unique_single_winner() {
    const THREADS: usize = if cfg!(miri) { 4 } else { 16 };

    let rcu = Arc::new(Rcu::new());
    rcu.register_thread();
    let table = new_shared_table(&rcu, 16, 0);

    let wins = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let rcu = rcu.clone();
            let table = table.clone();
            let wins = wins.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                rcu.register_thread();
                barrier.wait();
                let guard = table.flavor().read_lock();
                let agreed = match table.add_unique(&guard, Node::new(*b"contended", tid as u64)) {
                    Ok(node) => {
                        wins.fetch_add(1, Ordering::Relaxed);
                        *node.value()
                    }
                    Err((_mine, existing)) => *existing.value(),
                };
                drop(guard);
                rcu.unregister_thread();
                agreed
            })
        })
        .collect();

    let agreed: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(wins.load(Ordering::Relaxed), 1);
    assert!(
        agreed.windows(2).all(|pair| pair[0] == pair[1]),
        "every thread must see the same winner"
    );

    let guard = table.flavor().read_lock();
    assert_eq!(table.count_nodes(&guard).count, 1);
    drop(guard);
    rcu.unregister_thread();
}

// Concurrent adders and removers; at the end every successful add is
// accounted for by a successful removal or a node still in the table.
#[test]
fn concurrent_add_del_conserves_counts() {
    const KEYS: u64 = if cfg!(miri) { 16 } else { 512 };
    const OPS: usize = if cfg!(miri) { 100 } else { 20_000 };
    const ADDERS: usize = 4;
    const REMOVERS: usize = 4;

    let rcu = Arc::new(Rcu::new());
    rcu.register_thread();
    let table = new_shared_table(&rcu, 64, AUTO_RESIZE);

    let adds = Arc::new(AtomicUsize::new(0));
    let dels = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for seed in 0..ADDERS {
        let rcu = rcu.clone();
        let table = table.clone();
        let adds = adds.clone();
        handles.push(thread::spawn(move || {
            rcu.register_thread();
            let mut rng = Lcg(seed as u64 + 1);
            for _ in 0..OPS {
                let key = rng.next() % KEYS;
                let guard = table.flavor().read_lock();
                table.add(&guard, Node::new(key.to_be_bytes(), key));
                drop(guard);
                adds.fetch_add(1, Ordering::Relaxed);
            }
            rcu.unregister_thread();
        }));
    }
    for seed in 0..REMOVERS {
        let rcu = rcu.clone();
        let table = table.clone();
        let dels = dels.clone();
        handles.push(thread::spawn(move || {
            rcu.register_thread();
            let mut rng = Lcg(!(seed as u64));
            for _ in 0..OPS {
                let key = rng.next() % KEYS;
                let guard = table.flavor().read_lock();
                let iter = table.lookup(&guard, &key.to_be_bytes());
                if iter.node().is_some() && table.del(&guard, &iter).is_ok() {
                    dels.fetch_add(1, Ordering::Relaxed);
                }
                drop(guard);
            }
            rcu.unregister_thread();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let guard = table.flavor().read_lock();
    let counts = table.count_nodes(&guard);
    assert_eq!(counts.removed, 0, "all removals must be unlinked by now");
    assert_eq!(
        adds.load(Ordering::Relaxed),
        dels.load(Ordering::Relaxed) + counts.count
    );
    drop(guard);
    rcu.unregister_thread();
}

// One writer grows the table step by step while readers hammer a key that
// is present throughout; no lookup may ever fail.
#[test]
fn lookups_survive_concurrent_growth() {
    const LOOKUPS: usize = if cfg!(miri) { 200 } else { 10_000 };
    const READERS: usize = if cfg!(miri) { 2 } else { 8 };
    const TOP_SIZE: usize = if cfg!(miri) { 64 } else { 1024 };

    let rcu = Arc::new(Rcu::new());
    rcu.register_thread();
    let table = new_shared_table(&rcu, 1, 0);

    {
        let guard = table.flavor().read_lock();
        table.add(&guard, Node::new(*b"pinned", 42));
        for key in 0u64..128 {
            table.add(&guard, Node::new(key.to_be_bytes(), key));
        }
    }

    let mut handles = Vec::new();
    for _ in 0..READERS {
        let rcu = rcu.clone();
        let table = table.clone();
        handles.push(thread::spawn(move || {
            rcu.register_thread();
            for _ in 0..LOOKUPS {
                let guard = table.flavor().read_lock();
                let iter = table.lookup(&guard, b"pinned");
                assert_eq!(iter.node().expect("key vanished").value(), &42);
                drop(guard);
            }
            rcu.unregister_thread();
        }));
    }

    let writer = {
        let rcu = rcu.clone();
        let table = table.clone();
        thread::spawn(move || {
            rcu.register_thread();
            let mut size = 2;
            while size <= TOP_SIZE {
                table.resize(size);
                size *= 2;
            }
            rcu.unregister_thread();
        })
    };

    for handle in handles {
        handle.join().unwrap();
    }
    writer.join().unwrap();

    assert_eq!(table.size(), TOP_SIZE);
    let guard = table.flavor().read_lock();
    for key in 0u64..128 {
        assert!(table.lookup(&guard, &key.to_be_bytes()).node().is_some());
    }
    drop(guard);
    rcu.unregister_thread();
}

// A reader positioned on a node keeps seeing its fields after the node is
// displaced by add_replace, until its own section ends.
#[test]
fn reader_keeps_displaced_node_view() {
    let rcu = Arc::new(Rcu::new());
    rcu.register_thread();
    let table = new_shared_table(&rcu, 4, 0);

    {
        let guard = table.flavor().read_lock();
        table.add(&guard, Node::new(*b"k", 1));
    }

    let (have_tx, have_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let reader = {
        let rcu = rcu.clone();
        let table = table.clone();
        thread::spawn(move || {
            rcu.register_thread();
            let guard = table.flavor().read_lock();
            let iter = table.lookup(&guard, b"k");
            assert_eq!(iter.node().unwrap().value(), &1);
            have_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            // Displaced, but frozen until this section ends.
            assert_eq!(iter.node().unwrap().value(), &1);
            assert_eq!(iter.node().unwrap().key(), b"k");
            drop(guard);
            rcu.unregister_thread();
        })
    };

    have_rx.recv().unwrap();
    {
        let guard = table.flavor().read_lock();
        let old = table.add_replace(&guard, Node::new(*b"k", 2)).unwrap();
        assert_eq!(old.value(), &1);
        assert_eq!(table.lookup(&guard, b"k").node().unwrap().value(), &2);
    }
    release_tx.send(()).unwrap();
    reader.join().unwrap();

    let guard = table.flavor().read_lock();
    assert_eq!(table.lookup(&guard, b"k").node().unwrap().value(), &2);
    drop(guard);
    rcu.unregister_thread();
}

// Shrinking an over-provisioned table must not lose keys, and a drained
// table destroys cleanly.
#[test]
fn shrink_then_destroy() {
    const N: u64 = if cfg!(miri) { 64 } else { 10_000 };

    let rcu = Arc::new(Rcu::new());
    rcu.register_thread();
    let table = new_shared_table(&rcu, 1024, 0);

    {
        let guard = table.flavor().read_lock();
        for key in 0..N {
            table.add(&guard, Node::new(key.to_be_bytes(), key));
        }
    }

    table.resize(2);
    assert_eq!(table.size(), 2);

    {
        let guard = table.flavor().read_lock();
        for key in 0..N {
            assert!(
                table.lookup(&guard, &key.to_be_bytes()).node().is_some(),
                "key {key} lost in shrink"
            );
        }
    }

    {
        let guard = table.flavor().read_lock();
        for key in 0..N {
            let iter = table.lookup(&guard, &key.to_be_bytes());
            table.del(&guard, &iter).unwrap();
        }
    }

    let table = match Arc::try_unwrap(table) {
        Ok(table) => table,
        Err(_) => panic!("table still shared"),
    };
    match table.destroy() {
        Ok(()) => {}
        Err((_, err)) => panic!("destroy failed: {err}"),
    }
    rcu.unregister_thread();
}

// destroy() on a populated table must refuse and hand the table back.
#[test]
fn destroy_reports_non_empty() {
    let rcu = Arc::new(Rcu::new());
    rcu.register_thread();
    let flavor = DefaultFlavor::new(rcu.clone());
    let table: Table<u64> =
        Table::new(flavor, fnv_hash, key_eq, 0, 8, 0, None).unwrap();

    {
        let guard = table.flavor().read_lock();
        table.add(&guard, Node::new(*b"left", 1));
    }
    match table.destroy() {
        Err((table, Error::NonEmpty)) => {
            let guard = table.flavor().read_lock();
            let iter = table.lookup(&guard, b"left");
            table.del(&guard, &iter).unwrap();
            drop(guard);
            assert!(table.destroy().is_ok());
        }
        _ => panic!("expected NonEmpty"),
    }
    rcu.unregister_thread();
}
