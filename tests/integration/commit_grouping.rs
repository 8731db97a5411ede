//! Async write queueing and commit grouping through the coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use driftwire::coordinator::{DbCoordinator, WriteOutcome};
use driftwire::core::ClientVersion;

use super::fixtures::unique_db_path;

#[test]
fn five_grouped_writes_one_sync_fifo_completions() {
    let coordinator = DbCoordinator::get_coordinator(&unique_db_path("grouping")).unwrap();
    let serializer = coordinator.writes();
    let order = Arc::new(Mutex::new(Vec::new()));

    for index in 0..5u64 {
        let order = Arc::clone(&order);
        serializer
            .async_write(
                Box::new(move |txn| {
                    txn.put(format!("grouped/{index}"), vec![index as u8]);
                    WriteOutcome::Commit {
                        allow_grouping: true,
                    }
                }),
                Box::new(move |result| {
                    result.unwrap();
                    order.lock().unwrap().push(index);
                }),
                false,
            )
            .unwrap();
    }

    let syncs_before = serializer.sync_count();
    let ran = serializer.drain();
    assert_eq!(ran, 5);

    // All five writers ran consecutively against one mutex acquisition
    // cycle, with a single disk sync covering the group.
    assert_eq!(serializer.sync_count() - syncs_before, 1);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(
        coordinator.db().current_version().unwrap(),
        ClientVersion::new(5)
    );

    let snapshot = coordinator.begin_read(None).unwrap();
    for index in 0..5u64 {
        assert_eq!(
            snapshot.get(&format!("grouped/{index}")),
            Some(vec![index as u8].as_slice())
        );
    }
}

#[test]
fn completion_handlers_observe_their_own_commit_version() {
    let coordinator = DbCoordinator::get_coordinator(&unique_db_path("versions")).unwrap();
    let serializer = coordinator.writes();
    let versions = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..3 {
        let versions = Arc::clone(&versions);
        serializer
            .async_write(
                Box::new(|txn| {
                    txn.put("k", b"v".to_vec());
                    WriteOutcome::Commit {
                        allow_grouping: true,
                    }
                }),
                Box::new(move |result| {
                    versions.lock().unwrap().push(result.unwrap());
                }),
                false,
            )
            .unwrap();
    }
    serializer.drain();
    assert_eq!(
        *versions.lock().unwrap(),
        vec![
            ClientVersion::new(1),
            ClientVersion::new(2),
            ClientVersion::new(3)
        ]
    );
}

#[test]
fn notify_only_write_observes_the_lock_without_mutating() {
    let coordinator = DbCoordinator::get_coordinator(&unique_db_path("notifyonly")).unwrap();
    let serializer = coordinator.writes();
    let observed = Arc::new(AtomicUsize::new(0));
    let o = Arc::clone(&observed);
    serializer
        .async_write(
            Box::new(move |txn| {
                // The writer sees the lock but leaves no trace.
                txn.put("never", b"persisted".to_vec());
                o.fetch_add(1, Ordering::Relaxed);
                WriteOutcome::Commit {
                    allow_grouping: false,
                }
            }),
            Box::new(|result| {
                result.unwrap();
            }),
            true,
        )
        .unwrap();
    serializer.drain();
    assert_eq!(observed.load(Ordering::Relaxed), 1);
    assert_eq!(
        coordinator.db().current_version().unwrap(),
        ClientVersion::ZERO
    );
    assert!(coordinator.begin_read(None).unwrap().get("never").is_none());
}
