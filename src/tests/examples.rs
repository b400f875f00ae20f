// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

#[cfg(test)]
mod examples {
    use crate::tests::init_tracing;
    use crate::{
        ClientOptions, Config, Error, LocalMemoryTracker, LockClient, LockManager, LockMode,
        ManualClock, MemoryTracker, NoopTracer, ResourceType, TracingLockTracer,
    };
    use static_assertions::assert_impl_all;
    use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    assert_impl_all!(LockClient: Send, Sync);

    #[test]
    fn try_lock() {
        let lock_manager = LockManager::new();
        let Ok(client_a) = lock_manager.client() else {
            unreachable!()
        };
        let Ok(client_b) = lock_manager.client() else {
            unreachable!()
        };

        assert_eq!(client_a.try_exclusive_lock(ResourceType::Node, 5), Ok(true));
        assert_eq!(client_b.try_exclusive_lock(ResourceType::Node, 5), Ok(false));
        assert_eq!(client_b.try_shared_lock(ResourceType::Node, 5), Ok(false));

        // Other resource types are not affected.
        assert_eq!(
            client_b.try_exclusive_lock(ResourceType::Relationship, 5),
            Ok(true)
        );

        assert!(client_a.release_exclusive(ResourceType::Node, &[5]).is_ok());
        assert_eq!(client_b.try_exclusive_lock(ResourceType::Node, 5), Ok(true));
        assert_eq!(client_b.active_lock_count(), 2);
    }

    #[test]
    fn shared_readers() {
        let lock_manager = LockManager::new();
        let readers: Vec<LockClient> = (0..3).filter_map(|_| lock_manager.client().ok()).collect();
        assert_eq!(readers.len(), 3);
        let Ok(writer) = lock_manager.client() else {
            unreachable!()
        };
        for reader in &readers {
            assert!(reader
                .acquire_shared(&NoopTracer, ResourceType::Node, &[7])
                .is_ok());
        }
        assert_eq!(lock_manager.holder_count(ResourceType::Node, 7), 3);
        assert_eq!(writer.try_exclusive_lock(ResourceType::Node, 7), Ok(false));

        for reader in &readers {
            assert!(reader.release_shared(ResourceType::Node, &[7]).is_ok());
        }
        assert_eq!(lock_manager.holder_count(ResourceType::Node, 7), 0);
        assert_eq!(writer.try_exclusive_lock(ResourceType::Node, 7), Ok(true));
    }

    #[test]
    fn active_locks() {
        let lock_manager = LockManager::new();
        let Ok(client) = lock_manager.client_with(ClientOptions::default().transaction_id(3)) else {
            unreachable!()
        };
        assert!(client
            .acquire_exclusive(&NoopTracer, ResourceType::Label, &[1])
            .is_ok());
        assert!(client
            .acquire_shared(&NoopTracer, ResourceType::RelationshipType, &[2])
            .is_ok());

        let mut active_locks: Vec<_> = client.active_locks().collect();
        active_locks.sort_by_key(|lock| lock.resource_type);
        assert_eq!(active_locks.len(), 2);
        assert_eq!(active_locks[0].resource_type, ResourceType::Label);
        assert_eq!(active_locks[0].mode, LockMode::Exclusive);
        assert_eq!(active_locks[0].transaction_id, 3);
        assert_eq!(active_locks[1].resource_type, ResourceType::RelationshipType);
        assert_eq!(active_locks[1].mode, LockMode::Shared);
        assert_eq!(active_locks[1].resource_id, 2);
        assert!(lock_manager.describe().contains("LABEL(1)"));
    }

    #[test]
    fn mutual_exclusion() {
        init_tracing();
        let lock_manager = LockManager::new();
        let num_threads = 8;
        let num_iterations = 256;
        let occupied = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(num_threads));
        let mut thread_handles = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let barrier_cloned = barrier.clone();
            let lock_manager_cloned = lock_manager.clone();
            let occupied_cloned = occupied.clone();
            let counter_cloned = counter.clone();
            thread_handles.push(thread::spawn(move || {
                let Ok(client) = lock_manager_cloned.client() else {
                    unreachable!()
                };
                barrier_cloned.wait();
                for _ in 0..num_iterations {
                    assert!(client
                        .acquire_exclusive(&TracingLockTracer, ResourceType::Node, &[0])
                        .is_ok());
                    assert!(!occupied_cloned.swap(true, Acquire));
                    counter_cloned.fetch_add(1, Relaxed);
                    occupied_cloned.store(false, Release);
                    assert!(client.release_exclusive(ResourceType::Node, &[0]).is_ok());
                }
            }));
        }
        for handle in thread_handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Relaxed), num_threads * num_iterations);
        assert_eq!(lock_manager.lock_count(ResourceType::Node), 0);
    }

    #[test]
    fn readers_and_writers() {
        let lock_manager = LockManager::new();
        let num_threads = 6;
        let num_iterations = 128;
        let readers = Arc::new(AtomicUsize::new(0));
        let writing = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(num_threads));
        let mut thread_handles = Vec::with_capacity(num_threads);
        for thread_id in 0..num_threads {
            let barrier_cloned = barrier.clone();
            let lock_manager_cloned = lock_manager.clone();
            let readers_cloned = readers.clone();
            let writing_cloned = writing.clone();
            thread_handles.push(thread::spawn(move || {
                let Ok(client) = lock_manager_cloned.client() else {
                    unreachable!()
                };
                barrier_cloned.wait();
                for _ in 0..num_iterations {
                    if thread_id % 3 == 0 {
                        assert!(client
                            .acquire_exclusive(&NoopTracer, ResourceType::Node, &[1])
                            .is_ok());
                        assert!(!writing_cloned.swap(true, Acquire));
                        assert_eq!(readers_cloned.load(Acquire), 0);
                        writing_cloned.store(false, Release);
                        assert!(client.release_exclusive(ResourceType::Node, &[1]).is_ok());
                    } else {
                        assert!(client
                            .acquire_shared(&NoopTracer, ResourceType::Node, &[1])
                            .is_ok());
                        readers_cloned.fetch_add(1, Acquire);
                        assert!(!writing_cloned.load(Acquire));
                        readers_cloned.fetch_sub(1, Release);
                        assert!(client.release_shared(ResourceType::Node, &[1]).is_ok());
                    }
                }
            }));
        }
        for handle in thread_handles {
            handle.join().unwrap();
        }
        assert_eq!(lock_manager.lock_count(ResourceType::Node), 0);
    }

    #[test]
    fn upgrade_waits_for_readers() {
        let lock_manager = LockManager::new();
        let Ok(upgrader) = lock_manager.client() else {
            unreachable!()
        };
        let upgrader = Arc::new(upgrader);
        let Ok(reader) = lock_manager.client() else {
            unreachable!()
        };
        assert!(upgrader
            .acquire_shared(&NoopTracer, ResourceType::Node, &[2])
            .is_ok());
        assert!(reader
            .acquire_shared(&NoopTracer, ResourceType::Node, &[2])
            .is_ok());

        let upgraded = Arc::new(AtomicBool::new(false));
        let upgraded_cloned = upgraded.clone();
        let upgrader_cloned = upgrader.clone();
        let thread_handle = thread::spawn(move || {
            assert!(upgrader_cloned
                .acquire_exclusive(&NoopTracer, ResourceType::Node, &[2])
                .is_ok());
            upgraded_cloned.store(true, Release);
            assert!(upgrader_cloned.holds_lock(ResourceType::Node, 2, LockMode::Exclusive));
            upgrader_cloned.close();
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!upgraded.load(Acquire));

        // Both still share the lock while the upgrade is pending.
        assert!(!upgrader.holds_lock(ResourceType::Node, 2, LockMode::Exclusive));
        assert!(upgrader.holds_lock(ResourceType::Node, 2, LockMode::Shared));
        assert!(upgrader
            .active_locks()
            .all(|active_lock| active_lock.mode == LockMode::Shared));
        assert!(reader.holds_lock(ResourceType::Node, 2, LockMode::Shared));

        assert!(reader.release_shared(ResourceType::Node, &[2]).is_ok());
        thread_handle.join().unwrap();
        assert!(upgraded.load(Acquire));
        assert_eq!(lock_manager.lock_count(ResourceType::Node), 0);
    }

    #[test]
    fn timeout() {
        let Ok(lock_manager) = LockManager::with_config(
            Config::default().with_lock_acquisition_timeout(Duration::from_millis(10)),
        ) else {
            unreachable!()
        };
        let Ok(holder) = lock_manager.client() else {
            unreachable!()
        };
        let Ok(waiter) = lock_manager.client() else {
            unreachable!()
        };
        assert!(holder
            .acquire_exclusive(&NoopTracer, ResourceType::Schema, &[1])
            .is_ok());
        let result = waiter.acquire_shared(&NoopTracer, ResourceType::Schema, &[1]);
        assert!(matches!(result, Err(Error::Timeout { resource_id: 1, .. })));
        assert!(result.err().map_or(false, |e| e.is_transient()));

        // The client remains usable.
        assert!(holder.release_exclusive(ResourceType::Schema, &[1]).is_ok());
        assert!(waiter
            .acquire_shared(&NoopTracer, ResourceType::Schema, &[1])
            .is_ok());
    }

    #[test]
    fn manual_clock() {
        let clock = Arc::new(ManualClock::default());
        let Ok(lock_manager) = LockManager::builder()
            .config(Config::default().with_lock_acquisition_timeout(Duration::from_secs(60)))
            .clock(clock.clone())
            .build()
        else {
            unreachable!()
        };
        let Ok(holder) = lock_manager.client() else {
            unreachable!()
        };
        let Ok(waiter) = lock_manager.client() else {
            unreachable!()
        };
        assert!(holder
            .acquire_exclusive(&NoopTracer, ResourceType::Node, &[4])
            .is_ok());

        let thread_handle =
            thread::spawn(move || waiter.acquire_exclusive(&NoopTracer, ResourceType::Node, &[4]));
        thread::sleep(Duration::from_millis(5));
        clock.advance(Duration::from_secs(61));
        assert!(matches!(
            thread_handle.join().unwrap(),
            Err(Error::Timeout { .. })
        ));
    }

    #[test]
    fn stop_interrupts_wait() {
        let lock_manager = LockManager::new();
        let Ok(holder) = lock_manager.client() else {
            unreachable!()
        };
        let Ok(waiter) = lock_manager.client() else {
            unreachable!()
        };
        let waiter = Arc::new(waiter);
        assert!(holder
            .acquire_exclusive(&NoopTracer, ResourceType::Node, &[3])
            .is_ok());

        let waiter_cloned = waiter.clone();
        let thread_handle = thread::spawn(move || {
            waiter_cloned.acquire_exclusive(&NoopTracer, ResourceType::Node, &[3])
        });
        thread::sleep(Duration::from_millis(5));
        waiter.stop();
        assert!(matches!(
            thread_handle.join().unwrap(),
            Err(Error::ClientStopped(_))
        ));
        assert!(holder.holds_lock(ResourceType::Node, 3, LockMode::Exclusive));
    }

    #[test]
    fn concurrent_close() {
        let Ok(lock_manager) = LockManager::with_config(Config::default().with_max_clients(4))
        else {
            unreachable!()
        };
        for _ in 0..16 {
            let Ok(client) = lock_manager.client() else {
                unreachable!()
            };
            let client = Arc::new(client);
            assert!(client
                .acquire_exclusive(&NoopTracer, ResourceType::Node, &[1, 2, 3])
                .is_ok());
            let num_threads = 4;
            let barrier = Arc::new(Barrier::new(num_threads));
            let mut thread_handles = Vec::with_capacity(num_threads);
            for thread_id in 0..num_threads {
                let barrier_cloned = barrier.clone();
                let client_cloned = client.clone();
                thread_handles.push(thread::spawn(move || {
                    barrier_cloned.wait();
                    if thread_id % 2 == 0 {
                        client_cloned.stop();
                    } else {
                        client_cloned.close();
                    }
                }));
            }
            for handle in thread_handles {
                handle.join().unwrap();
            }
            assert_eq!(lock_manager.lock_count(ResourceType::Node), 0);
        }

        // Every identifier went back to the pool.
        let clients: Vec<LockClient> = (0..4).filter_map(|_| lock_manager.client().ok()).collect();
        assert_eq!(clients.len(), 4);
    }

    /// Joins the shared lock on NODE 8 held by another client for an upgrade that never completes.
    fn failed_upgrade(stop: bool) {
        let Ok(lock_manager) = LockManager::with_config(
            Config::default()
                .with_upgrade_grace_period(0)
                .with_lock_acquisition_timeout(Duration::from_millis(30)),
        ) else {
            unreachable!()
        };
        let Ok(holder) = lock_manager.client() else {
            unreachable!()
        };
        assert!(holder
            .acquire_shared(&NoopTracer, ResourceType::Node, &[8])
            .is_ok());

        let memory_tracker = Arc::new(LocalMemoryTracker::default());
        let mut options = ClientOptions::default().memory_tracker(memory_tracker.clone());
        if stop {
            options = options.lock_acquisition_timeout(Duration::from_secs(60));
        }
        let Ok(upgrader) = lock_manager.client_with(options) else {
            unreachable!()
        };
        let upgrader = Arc::new(upgrader);
        let upgrader_cloned = upgrader.clone();
        let thread_handle = thread::spawn(move || {
            upgrader_cloned.acquire_exclusive(&NoopTracer, ResourceType::Node, &[8])
        });
        if stop {
            thread::sleep(Duration::from_millis(20));
            assert_eq!(lock_manager.holder_count(ResourceType::Node, 8), 2);
            upgrader.stop();
            assert!(matches!(
                thread_handle.join().unwrap(),
                Err(Error::ClientStopped(_))
            ));
        } else {
            assert!(matches!(
                thread_handle.join().unwrap(),
                Err(Error::Timeout { resource_id: 8, .. })
            ));
        }

        // The shared lock taken for the upgrade and the update slot are gone.
        assert_eq!(lock_manager.holder_count(ResourceType::Node, 8), 1);
        assert_eq!(upgrader.active_lock_count(), 0);
        assert!(!upgrader.holds_lock(ResourceType::Node, 8, LockMode::Shared));
        let Ok(reader) = lock_manager.client() else {
            unreachable!()
        };
        assert_eq!(reader.try_shared_lock(ResourceType::Node, 8), Ok(true));
        assert_eq!(lock_manager.holder_count(ResourceType::Node, 8), 2);

        upgrader.close();
        assert_eq!(memory_tracker.estimated_heap_memory(), 0);
    }

    #[test]
    fn upgrade_timeout() {
        failed_upgrade(false);
    }

    #[test]
    fn upgrade_stopped() {
        failed_upgrade(true);
    }

    #[test]
    fn closed_client_identity() {
        let Ok(lock_manager) = LockManager::with_config(Config::default().with_max_clients(1))
        else {
            unreachable!()
        };
        let Ok(closed) = lock_manager.client() else {
            unreachable!()
        };
        assert!(closed
            .acquire_exclusive(&NoopTracer, ResourceType::Node, &[41])
            .is_ok());
        closed.close();

        // The identifier is handed over to the new client.
        let Ok(client) = lock_manager.client() else {
            unreachable!()
        };
        assert_eq!(client.id(), closed.id());
        assert!(client
            .acquire_exclusive(&NoopTracer, ResourceType::Node, &[42])
            .is_ok());
        assert!(client.holds_lock(ResourceType::Node, 42, LockMode::Exclusive));
        assert_eq!(client.active_lock_count(), 1);

        assert!(!closed.holds_lock(ResourceType::Node, 42, LockMode::Shared));
        assert_eq!(closed.active_lock_count(), 0);
        assert_eq!(closed.active_locks().count(), 0);
    }
}
