//! Background change notification.
//!
//! A worker thread owns a dedicated reader on the database. Every commit
//! wakes it; it advances from its last seen version, computes a change set
//! per registered notifier, and parks the result as a package pinned at
//! the target version. Application threads call `process_available` with
//! their read version to have matching packages delivered on their side.
//!
//! A skip marker set at commit time suppresses the notification a thread
//! would otherwise receive for its own write.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::debug;

use crate::core::ClientVersion;
use crate::storage::db::{MemoryDb, Snapshot};

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("notifier worker stopped")]
    WorkerStopped,
}

/// Identifies one registered notifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotifierId(pub u64);

/// The changes between two versions, as seen by one notifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeSet {
    pub from: ClientVersion,
    pub to: ClientVersion,
    pub changed_keys: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed_keys.is_empty()
    }
}

type Callback = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

struct NotifierEntry {
    /// Key prefix this notifier watches; empty watches everything.
    key_prefix: String,
    callback: Callback,
    /// Version this notifier has been advanced to.
    current_version: ClientVersion,
    /// Suppress changes up to and including this version (own writes).
    skip_to: Option<ClientVersion>,
}

/// A change set packaged for delivery at a specific version.
struct Package {
    notifier: NotifierId,
    changes: ChangeSet,
}

struct WorkerShared {
    db: MemoryDb,
    state: Mutex<WorkerState>,
    stopped: AtomicBool,
}

struct WorkerState {
    notifiers: BTreeMap<NotifierId, NotifierEntry>,
    /// Packages computed by the worker, waiting for delivery.
    packages: Vec<Package>,
    /// Version the packages are pinned at.
    handover_version: ClientVersion,
}

/// Handle owning the worker thread.
pub struct NotifierWorker {
    shared: Arc<WorkerShared>,
    wake_tx: Sender<()>,
    next_id: AtomicU64,
    handle: Option<JoinHandle<()>>,
}

impl NotifierWorker {
    pub fn start(db: MemoryDb) -> Self {
        let (wake_tx, wake_rx) = unbounded::<()>();
        let shared = Arc::new(WorkerShared {
            db,
            state: Mutex::new(WorkerState {
                notifiers: BTreeMap::new(),
                packages: Vec::new(),
                handover_version: ClientVersion::ZERO,
            }),
            stopped: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("driftwire-notifier".into())
            .spawn(move || run_worker(worker_shared, wake_rx))
            .expect("spawn notifier worker");
        Self {
            shared,
            wake_tx,
            next_id: AtomicU64::new(1),
            handle: Some(handle),
        }
    }

    /// Registers a notifier watching keys under `key_prefix`, starting at
    /// `source_version`. The first pass advances it from there to the
    /// shared current version so it sees exactly the changes since.
    pub fn register(
        &self,
        key_prefix: impl Into<String>,
        source_version: ClientVersion,
        callback: impl Fn(&ChangeSet) + Send + Sync + 'static,
    ) -> NotifierId {
        let id = NotifierId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.shared.state.lock().expect("notifier state poisoned");
        state.notifiers.insert(
            id,
            NotifierEntry {
                key_prefix: key_prefix.into(),
                callback: Arc::new(callback),
                current_version: source_version,
                skip_to: None,
            },
        );
        drop(state);
        let _ = self.wake_tx.send(());
        id
    }

    pub fn unregister(&self, id: NotifierId) {
        let mut state = self.shared.state.lock().expect("notifier state poisoned");
        state.notifiers.remove(&id);
    }

    /// Marks the next pass to skip changes up to `version` for `id`
    /// (typically the version produced by this thread's own commit).
    pub fn set_skip_version(&self, id: NotifierId, version: ClientVersion) {
        let mut state = self.shared.state.lock().expect("notifier state poisoned");
        if let Some(entry) = state.notifiers.get_mut(&id) {
            entry.skip_to = Some(version);
        }
    }

    /// Wakes the worker after a commit (also hooked to external commits).
    pub fn notify_commit(&self) {
        let _ = self.wake_tx.send(());
    }

    /// A sender other subsystems (the external-commit helper) can use to
    /// wake the worker.
    pub fn wake_sender(&self) -> Sender<()> {
        self.wake_tx.clone()
    }

    /// Delivers pending packages on the calling thread. Delivery requires
    /// the reader to sit exactly at the handover version: a reader behind
    /// waits for its next advance, and a reader already newer than the
    /// handover sees a silent no-op.
    pub fn process_available(&self, read_version: ClientVersion) -> Result<(), NotifierError> {
        if self.shared.stopped.load(Ordering::Relaxed) {
            return Err(NotifierError::WorkerStopped);
        }
        let deliveries: Vec<(Callback, ChangeSet)> = {
            let mut state = self.shared.state.lock().expect("notifier state poisoned");
            if state.handover_version != read_version {
                return Ok(());
            }
            let packages = std::mem::take(&mut state.packages);
            packages
                .into_iter()
                .filter_map(|package| {
                    state
                        .notifiers
                        .get(&package.notifier)
                        .map(|entry| (Arc::clone(&entry.callback), package.changes))
                })
                .collect()
        };
        // Callbacks run outside the lock so they may re-enter the worker
        // API (including unregister).
        for (callback, changes) in deliveries {
            callback(&changes);
        }
        Ok(())
    }

    /// Blocks until the worker has advanced past `version` (test helper).
    pub fn wait_until_advanced(&self, version: ClientVersion) {
        loop {
            {
                let state = self.shared.state.lock().expect("notifier state poisoned");
                if state.handover_version >= version {
                    return;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stopped.store(true, Ordering::Relaxed);
        let _ = self.wake_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NotifierWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<WorkerShared>, wake_rx: Receiver<()>) {
    let mut last_snapshot: Option<Snapshot> = None;
    while wake_rx.recv().is_ok() {
        if shared.stopped.load(Ordering::Relaxed) {
            break;
        }
        // Drain coalesced wake-ups.
        while wake_rx.try_recv().is_ok() {}

        let Ok(current) = shared.db.begin_read(None) else {
            continue;
        };
        let previous = match &last_snapshot {
            Some(snapshot) if snapshot.version == current.version => {
                continue;
            }
            Some(snapshot) => snapshot.clone(),
            None => match shared.db.begin_read(Some(ClientVersion::ZERO)) {
                Ok(genesis) => genesis,
                // Old snapshots trimmed: treat current as the baseline.
                Err(_) => current.clone(),
            },
        };

        let mut state = shared.state.lock().expect("notifier state poisoned");
        let mut packages = Vec::new();
        for (id, entry) in state.notifiers.iter_mut() {
            // Advance each notifier from where it stands to the current
            // version; a freshly registered one catches up in one pass.
            let from = entry.current_version;
            if from >= current.version {
                continue;
            }
            // A skip marker suppresses the prefix of the span that is the
            // thread's own write: the diff starts after it.
            let base_version = match entry.skip_to.take() {
                Some(skip_to) => from.max(skip_to),
                None => from,
            };
            let changed = if base_version >= current.version {
                Vec::new()
            } else {
                let base = if base_version == previous.version {
                    previous.clone()
                } else {
                    match shared.db.begin_read(Some(base_version)) {
                        Ok(snapshot) => snapshot,
                        Err(_) => previous.clone(),
                    }
                };
                diff_keys(&base, &current, &entry.key_prefix)
            };
            entry.current_version = current.version;
            if !changed.is_empty() {
                packages.push(Package {
                    notifier: *id,
                    changes: ChangeSet {
                        from,
                        to: current.version,
                        changed_keys: changed,
                    },
                });
            }
        }
        state.packages.extend(packages);
        state.handover_version = current.version;
        drop(state);
        debug!(target: "coordinator", version = %current.version, "notifier pass complete");
        last_snapshot = Some(current);
    }
}

fn diff_keys(base: &Snapshot, current: &Snapshot, prefix: &str) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in current.iter() {
        if !key.starts_with(prefix) {
            continue;
        }
        if base.get(key) != Some(value.as_slice()) {
            changed.push(key.clone());
        }
    }
    for (key, _) in base.iter() {
        if key.starts_with(prefix) && current.get(key).is_none() {
            changed.push(key.clone());
        }
    }
    changed.sort();
    changed
}
