//! Cross-process commit notification.
//!
//! A writer in another process cannot call `notify_commit` on our worker,
//! so each coordinator listens on a Unix domain socket next to the
//! database. Any byte written to it wakes the notifier worker; the writer
//! side connects, writes one byte, and disconnects.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::Sender;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ExternalCommitError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Listens for out-of-process commit signals and forwards them as wake-ups.
pub struct ExternalCommitHelper {
    socket_path: PathBuf,
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ExternalCommitHelper {
    /// The socket path for a database file.
    pub fn socket_path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "db".to_string());
        name.push_str(".commits");
        db_path.with_file_name(name)
    }

    pub fn start(socket_path: PathBuf, wake: Sender<()>) -> Result<Self, ExternalCommitError> {
        // A stale socket from a dead process blocks the bind.
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path).map_err(|source| {
            ExternalCommitError::Io {
                path: socket_path.clone(),
                source,
            }
        })?;
        listener
            .set_nonblocking(false)
            .map_err(|source| ExternalCommitError::Io {
                path: socket_path.clone(),
                source,
            })?;
        let stopped = Arc::new(AtomicBool::new(false));
        let thread_stopped = Arc::clone(&stopped);
        let thread_path = socket_path.clone();
        let handle = std::thread::Builder::new()
            .name("driftwire-extcommit".into())
            .spawn(move || run_listener(listener, wake, thread_stopped, thread_path))
            .expect("spawn external commit listener");
        Ok(Self {
            socket_path,
            stopped,
            handle: Some(handle),
        })
    }

    /// Writer-side: signal the process listening on `socket_path`.
    pub fn signal(socket_path: &Path) -> Result<(), ExternalCommitError> {
        let mut stream =
            UnixStream::connect(socket_path).map_err(|source| ExternalCommitError::Io {
                path: socket_path.to_path_buf(),
                source,
            })?;
        stream
            .write_all(&[1])
            .map_err(|source| ExternalCommitError::Io {
                path: socket_path.to_path_buf(),
                source,
            })?;
        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ExternalCommitHelper {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
        // Unblock the accept loop with one last connection.
        let _ = UnixStream::connect(&self.socket_path);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn run_listener(
    listener: UnixListener,
    wake: Sender<()>,
    stopped: Arc<AtomicBool>,
    path: PathBuf,
) {
    for stream in listener.incoming() {
        if stopped.load(Ordering::Relaxed) {
            break;
        }
        match stream {
            Ok(mut stream) => {
                let mut buf = [0u8; 16];
                let _ = stream.read(&mut buf);
                debug!(target: "coordinator", path = %path.display(), "external commit signal");
                if wake.send(()).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(target: "coordinator", error = %err, "external commit accept failed");
                break;
            }
        }
    }
}
