//! The embedded-database seam.
//!
//! The on-disk storage format is not this crate's business: the engine only
//! needs versioned snapshots, serialized write transactions, and commit
//! notifications. [`MemoryDb`] is the reference engine backing tests and the
//! client-reset fresh-copy pipeline; real deployments wrap their storage in
//! the same surface. Opening the same path twice yields the same shared
//! state, which is what makes the coordinator registry's exactly-one-handle
//! guarantee observable.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use thiserror::Error;

use crate::core::ClientVersion;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database is closed")]
    DatabaseClosed,
    #[error("no snapshot retained for version {0}")]
    NoSuchVersion(ClientVersion),
    #[error("a write transaction is already active")]
    WriteInProgress,
    #[error("write transaction is stale: base {base}, current {current}")]
    StaleWrite {
        base: ClientVersion,
        current: ClientVersion,
    },
}

/// An immutable view of the database contents pinned at one version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub version: ClientVersion,
    entries: BTreeMap<String, Vec<u8>>,
}

impl Snapshot {
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.entries.iter()
    }
}

type CommitHook = Box<dyn Fn(ClientVersion) + Send + Sync>;

struct DbInner {
    closed: bool,
    current: ClientVersion,
    /// Retained snapshots; the coordinator prunes through `trim_below`.
    snapshots: BTreeMap<ClientVersion, BTreeMap<String, Vec<u8>>>,
    write_active: bool,
}

struct DbShared {
    path: PathBuf,
    inner: Mutex<DbInner>,
    hooks: Mutex<Vec<CommitHook>>,
}

/// A shared handle to one in-memory database.
#[derive(Clone)]
pub struct MemoryDb {
    shared: Arc<DbShared>,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<DbShared>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<DbShared>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl MemoryDb {
    /// Opens (or re-opens) the database at `path`. All handles for the same
    /// path share state until the last one is dropped.
    pub fn open(path: &Path) -> MemoryDb {
        let mut map = registry().lock().expect("db registry poisoned");
        if let Some(shared) = map.get(path).and_then(Weak::upgrade) {
            let mut inner = shared.inner.lock().expect("db lock poisoned");
            inner.closed = false;
            drop(inner);
            return MemoryDb { shared };
        }
        let shared = Arc::new(DbShared {
            path: path.to_path_buf(),
            inner: Mutex::new(DbInner {
                closed: false,
                current: ClientVersion::ZERO,
                snapshots: BTreeMap::from([(ClientVersion::ZERO, BTreeMap::new())]),
                write_active: false,
            }),
            hooks: Mutex::new(Vec::new()),
        });
        map.insert(path.to_path_buf(), Arc::downgrade(&shared));
        MemoryDb { shared }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn current_version(&self) -> Result<ClientVersion, DbError> {
        let inner = self.shared.inner.lock().expect("db lock poisoned");
        if inner.closed {
            return Err(DbError::DatabaseClosed);
        }
        Ok(inner.current)
    }

    /// A read transaction pinned at `version`, or at the newest version.
    pub fn begin_read(&self, version: Option<ClientVersion>) -> Result<Snapshot, DbError> {
        let inner = self.shared.inner.lock().expect("db lock poisoned");
        if inner.closed {
            return Err(DbError::DatabaseClosed);
        }
        let version = version.unwrap_or(inner.current);
        let entries = inner
            .snapshots
            .get(&version)
            .cloned()
            .ok_or(DbError::NoSuchVersion(version))?;
        Ok(Snapshot { version, entries })
    }

    /// Begins the one write transaction this database permits at a time.
    /// Serialization across threads is the coordinator's job; this guard is
    /// the database-side agent token enforcing it.
    pub fn begin_write(&self) -> Result<WriteTransaction, DbError> {
        let mut inner = self.shared.inner.lock().expect("db lock poisoned");
        if inner.closed {
            return Err(DbError::DatabaseClosed);
        }
        if inner.write_active {
            return Err(DbError::WriteInProgress);
        }
        inner.write_active = true;
        let base = inner.current;
        let working = inner
            .snapshots
            .get(&base)
            .cloned()
            .expect("current snapshot always retained");
        Ok(WriteTransaction {
            shared: Arc::clone(&self.shared),
            base,
            working,
            finished: false,
        })
    }

    /// Registers a hook invoked (outside the db lock) after every commit.
    pub fn add_commit_hook(&self, hook: impl Fn(ClientVersion) + Send + Sync + 'static) {
        self.shared
            .hooks
            .lock()
            .expect("hook lock poisoned")
            .push(Box::new(hook));
    }

    /// Drops retained snapshots older than `floor`, keeping `floor` itself.
    pub fn trim_below(&self, floor: ClientVersion) -> Result<(), DbError> {
        let mut inner = self.shared.inner.lock().expect("db lock poisoned");
        if inner.closed {
            return Err(DbError::DatabaseClosed);
        }
        let retained = inner.snapshots.split_off(&floor);
        inner.snapshots = retained;
        Ok(())
    }

    /// Replaces the entire contents with the given snapshot, producing a new
    /// version. The client-reset swap path.
    pub fn replace_contents(&self, snapshot: &Snapshot) -> Result<ClientVersion, DbError> {
        let mut txn = self.begin_write()?;
        txn.working = snapshot.entries.clone();
        txn.commit()
    }

    pub fn close(&self) {
        let mut inner = self.shared.inner.lock().expect("db lock poisoned");
        inner.closed = true;
        inner.write_active = false;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().expect("db lock poisoned").closed
    }
}

/// The single active write transaction on a [`MemoryDb`].
pub struct WriteTransaction {
    shared: Arc<DbShared>,
    base: ClientVersion,
    working: BTreeMap<String, Vec<u8>>,
    finished: bool,
}

impl WriteTransaction {
    pub fn base_version(&self) -> ClientVersion {
        self.base
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.working.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> Vec<String> {
        self.working.keys().cloned().collect()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.working.insert(key.into(), value.into());
    }

    pub fn delete(&mut self, key: &str) {
        self.working.remove(key);
    }

    /// Commits, producing the next version, and runs commit hooks.
    pub fn commit(mut self) -> Result<ClientVersion, DbError> {
        let new_version;
        {
            let mut inner = self.shared.inner.lock().expect("db lock poisoned");
            if inner.closed {
                self.finished = true;
                return Err(DbError::DatabaseClosed);
            }
            if inner.current != self.base {
                self.finished = true;
                inner.write_active = false;
                return Err(DbError::StaleWrite {
                    base: self.base,
                    current: inner.current,
                });
            }
            new_version = inner.current.next();
            let working = std::mem::take(&mut self.working);
            inner.snapshots.insert(new_version, working);
            inner.current = new_version;
            inner.write_active = false;
        }
        self.finished = true;
        let hooks = self.shared.hooks.lock().expect("hook lock poisoned");
        for hook in hooks.iter() {
            hook(new_version);
        }
        Ok(new_version)
    }

    pub fn rollback(mut self) {
        let mut inner = self.shared.inner.lock().expect("db lock poisoned");
        inner.write_active = false;
        self.finished = true;
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let mut inner = self.shared.inner.lock().expect("db lock poisoned");
            inner.write_active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_path(tag: &str) -> PathBuf {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        PathBuf::from(format!("/mem/{tag}-{n}"))
    }

    #[test]
    fn commits_advance_versions_and_snapshots_are_frozen() {
        let db = MemoryDb::open(&unique_path("basic"));
        let mut txn = db.begin_write().unwrap();
        txn.put("a", b"1".to_vec());
        let v1 = txn.commit().unwrap();
        assert_eq!(v1, ClientVersion::new(1));

        let frozen = db.begin_read(Some(v1)).unwrap();

        let mut txn = db.begin_write().unwrap();
        txn.put("a", b"2".to_vec());
        let v2 = txn.commit().unwrap();
        assert_eq!(v2, ClientVersion::new(2));

        assert_eq!(frozen.get("a"), Some(b"1".as_slice()));
        let live = db.begin_read(None).unwrap();
        assert_eq!(live.get("a"), Some(b"2".as_slice()));
    }

    #[test]
    fn same_path_shares_state() {
        let path = unique_path("shared");
        let db1 = MemoryDb::open(&path);
        let db2 = MemoryDb::open(&path);
        let mut txn = db1.begin_write().unwrap();
        txn.put("k", b"v".to_vec());
        txn.commit().unwrap();
        assert_eq!(
            db2.begin_read(None).unwrap().get("k"),
            Some(b"v".as_slice())
        );
    }

    #[test]
    fn only_one_writer_at_a_time() {
        let db = MemoryDb::open(&unique_path("writer"));
        let txn = db.begin_write().unwrap();
        assert!(matches!(db.begin_write(), Err(DbError::WriteInProgress)));
        txn.rollback();
        assert!(db.begin_write().is_ok());
    }

    #[test]
    fn commit_hooks_fire_with_new_version() {
        let db = MemoryDb::open(&unique_path("hooks"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        db.add_commit_hook(move |v| seen_clone.lock().unwrap().push(v));
        let txn = db.begin_write().unwrap();
        txn.commit().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![ClientVersion::new(1)]);
    }

    #[test]
    fn trim_below_drops_old_snapshots() {
        let db = MemoryDb::open(&unique_path("trim"));
        for _ in 0..3 {
            db.begin_write().unwrap().commit().unwrap();
        }
        db.trim_below(ClientVersion::new(2)).unwrap();
        assert!(matches!(
            db.begin_read(Some(ClientVersion::new(1))),
            Err(DbError::NoSuchVersion(_))
        ));
        assert!(db.begin_read(Some(ClientVersion::new(2))).is_ok());
    }

    #[test]
    fn closed_db_rejects_operations() {
        let db = MemoryDb::open(&unique_path("closed"));
        db.close();
        assert!(matches!(db.begin_read(None), Err(DbError::DatabaseClosed)));
        assert!(matches!(db.begin_write(), Err(DbError::DatabaseClosed)));
    }
}
