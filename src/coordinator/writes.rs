//! Write serialization and asynchronous commit grouping.
//!
//! Writes on one database are strictly serialized. Callers either commit
//! synchronously or enqueue an asynchronous write; queued writers run in
//! FIFO order when the owner drains the queue. Grouped commits skip the
//! per-commit disk sync: the sync happens when a non-grouped commit
//! arrives, when the group cap is reached, or when a synchronous commit
//! flushes everything, and completion handlers fire (in FIFO order) only
//! once their commit is covered by a sync.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use crate::core::{ClientVersion, Limits};
use crate::storage::db::{DbError, MemoryDb, WriteTransaction};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database closed before the writer ran")]
    DatabaseClosed,
    #[error("writer rolled back: {0}")]
    RolledBack(String),
    #[error("write queue full ({0} pending)")]
    QueueFull(usize),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// What a writer closure decides for its transaction.
pub enum WriteOutcome {
    Commit { allow_grouping: bool },
    Rollback { reason: String },
}

type Writer = Box<dyn FnOnce(&mut WriteTransaction) -> WriteOutcome + Send>;
type Completion = Box<dyn FnOnce(Result<ClientVersion, WriteError>) + Send>;

struct QueuedWrite {
    writer: Writer,
    completion: Completion,
    /// Notify-only writers observe the write lock without mutating.
    notify_only: bool,
}

#[derive(Default)]
struct SerializerState {
    queue: VecDeque<QueuedWrite>,
    /// Completions whose commits are not yet covered by a disk sync.
    grouped_completions: Vec<(ClientVersion, Completion)>,
    draining: bool,
}

/// The per-database write serializer.
pub struct WriteSerializer {
    db: MemoryDb,
    state: Mutex<SerializerState>,
    limits: Limits,
    sync_count: AtomicU64,
}

impl WriteSerializer {
    pub fn new(db: MemoryDb, limits: Limits) -> Self {
        Self {
            db,
            state: Mutex::new(SerializerState::default()),
            limits,
            sync_count: AtomicU64::new(0),
        }
    }

    pub fn db(&self) -> &MemoryDb {
        &self.db
    }

    /// How many disk syncs have happened (observable for tests).
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::Relaxed)
    }

    /// Enqueues an asynchronous write. The writer runs when the owner
    /// drains the queue; the completion fires once the commit is covered
    /// by a disk sync (immediately for rollbacks and failures).
    pub fn async_write(
        &self,
        writer: Writer,
        completion: Completion,
        notify_only: bool,
    ) -> Result<(), WriteError> {
        let mut state = self.state.lock().expect("write serializer poisoned");
        if state.queue.len() >= self.limits.max_queued_async_writes {
            return Err(WriteError::QueueFull(state.queue.len()));
        }
        state.queue.push_back(QueuedWrite {
            writer,
            completion,
            notify_only,
        });
        Ok(())
    }

    /// Runs every queued writer in FIFO order. Returns how many ran.
    ///
    /// A completion handler must not enqueue another write from within a
    /// drain pass of its own thread; the queue is re-checked after each
    /// writer so writes enqueued by other threads still run.
    pub fn drain(&self) -> usize {
        {
            let mut state = self.state.lock().expect("write serializer poisoned");
            if state.draining {
                return 0;
            }
            state.draining = true;
        }
        let mut ran = 0;
        loop {
            let next = {
                let mut state = self.state.lock().expect("write serializer poisoned");
                state.queue.pop_front()
            };
            let Some(queued) = next else {
                break;
            };
            ran += 1;
            self.run_one(queued);
        }
        // Any grouped commits left over are flushed with one final sync.
        self.flush_grouped();
        let mut state = self.state.lock().expect("write serializer poisoned");
        state.draining = false;
        ran
    }

    fn run_one(&self, queued: QueuedWrite) {
        if self.db.is_closed() {
            // The database went away while this writer sat in the queue;
            // the writer is cancelled, not run.
            (queued.completion)(Err(WriteError::DatabaseClosed));
            return;
        }
        let mut txn = match self.db.begin_write() {
            Ok(txn) => txn,
            Err(err) => {
                (queued.completion)(Err(err.into()));
                return;
            }
        };
        if queued.notify_only {
            // The writer only wanted the lock; observe and release.
            let outcome = (queued.writer)(&mut txn);
            txn.rollback();
            match outcome {
                WriteOutcome::Commit { .. } | WriteOutcome::Rollback { .. } => {
                    (queued.completion)(Ok(self.db.current_version().unwrap_or_default()));
                }
            }
            return;
        }
        match (queued.writer)(&mut txn) {
            WriteOutcome::Rollback { reason } => {
                txn.rollback();
                (queued.completion)(Err(WriteError::RolledBack(reason)));
            }
            WriteOutcome::Commit { allow_grouping } => match txn.commit() {
                Err(err) => (queued.completion)(Err(err.into())),
                Ok(version) => {
                    if allow_grouping {
                        let should_flush = {
                            let mut state =
                                self.state.lock().expect("write serializer poisoned");
                            state.grouped_completions.push((version, queued.completion));
                            state.grouped_completions.len() >= self.limits.max_grouped_commits
                        };
                        if should_flush {
                            self.flush_grouped();
                        }
                    } else {
                        // A non-grouped commit forces the sync, covering
                        // all grouped predecessors first.
                        self.flush_grouped();
                        self.disk_sync();
                        (queued.completion)(Ok(version));
                    }
                }
            },
        }
    }

    /// Synchronous write: flushes grouped predecessors to disk, runs the
    /// writer, syncs, and returns the new version.
    pub fn commit_sync(
        &self,
        writer: impl FnOnce(&mut WriteTransaction),
    ) -> Result<ClientVersion, WriteError> {
        self.flush_grouped();
        let mut txn = self.db.begin_write()?;
        writer(&mut txn);
        let version = txn.commit()?;
        self.disk_sync();
        Ok(version)
    }

    /// Syncs buffered grouped commits and fires their completions FIFO.
    fn flush_grouped(&self) {
        let completions = {
            let mut state = self.state.lock().expect("write serializer poisoned");
            std::mem::take(&mut state.grouped_completions)
        };
        if completions.is_empty() {
            return;
        }
        self.disk_sync();
        debug!(
            target: "coordinator",
            grouped = completions.len(),
            "flushed grouped commits"
        );
        for (version, completion) in completions {
            completion(Ok(version));
        }
    }

    fn disk_sync(&self) {
        // The in-memory engine has no disk; the counter stands in for the
        // fsync the durability layer would issue.
        self.sync_count.fetch_add(1, Ordering::Relaxed);
    }
}
