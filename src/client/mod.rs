//! The sync client: connections, sessions, lifecycle, reset.

pub mod backoff;
pub mod bootstrap;
pub mod connection;
pub mod event_loop;
pub mod reset;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod wrapper;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{ClientConfig, SyncConfig};
use crate::coordinator::{DbCoordinator, SyncAttachment};
use crate::core::{Limits, MonotonicMillis, QueryVersion, ServerEndpoint, SessionIdent};
use crate::paths;

pub use backoff::{compute_reconnect_delay, ReconnectDelay, ReconnectInfo, ReconnectMode};
pub use bootstrap::{BootstrapBatch, BootstrapStoreError, PendingBootstrapStore};
pub use connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState, TimerKind};
pub use event_loop::{EventLoop, LoopState};
pub use reset::{
    perform_client_reset, ClientResetError, FreshCopy, ResetObservers, ResetOutcome,
};
pub use session::{
    PendingQuery, Session, SessionConfig, SessionEffect, SessionState, SessionStore,
    SubscriptionProtocolState,
};
pub use subscription::{Subscription, SubscriptionSet, SubscriptionSetState, SubscriptionStore};
pub use transport::{
    ConnectRequest, ConnectionId, MockTransport, TransportError, TransportEvent, WebSocket,
    WebSocketFactory,
};
pub use wrapper::{LifecycleEffect, LifecycleState, SessionLifecycle, WaitResult};

use crate::protocol::SyncFlavor;

/// An effect that escaped the event loop, tagged with its origin.
pub type RoutedEffect = (ConnectionId, SessionIdent, SessionEffect);

/// Top-level assembly: one event loop, one connection per endpoint (when
/// multiplexing), sessions bound to coordinators.
///
/// Session effects the loop cannot satisfy on its own (completion waits,
/// subscription transitions, client reset, error delivery) are routed to
/// the `effects` channel; the embedding layer consumes them.
pub struct SyncClient {
    config: ClientConfig,
    event_loop: EventLoop<SyncAttachment>,
    endpoints: Mutex<HashMap<(ServerEndpoint, SyncFlavor), ConnectionId>>,
    next_session_ident: AtomicU64,
    effects_rx: Receiver<RoutedEffect>,
    states_rx: Receiver<(ConnectionId, ConnectionState)>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, factory: Box<dyn WebSocketFactory>) -> Self {
        let event_loop = EventLoop::spawn(factory);
        let (effects_tx, effects_rx) = unbounded::<RoutedEffect>();
        let (states_tx, states_rx) = unbounded();
        install_sinks(&event_loop, effects_tx, states_tx);
        Self {
            config,
            event_loop,
            endpoints: Mutex::new(HashMap::new()),
            next_session_ident: AtomicU64::new(1),
            effects_rx,
            states_rx,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Routed session effects, in arrival order.
    pub fn effects(&self) -> &Receiver<RoutedEffect> {
        &self.effects_rx
    }

    /// Connection state transitions, in arrival order.
    pub fn connection_states(&self) -> &Receiver<(ConnectionId, ConnectionState)> {
        &self.states_rx
    }

    /// The connection for `endpoint`, created and activated on first use.
    /// With multiplexing enabled, sessions for the same endpoint share it.
    pub fn connection_for(&self, endpoint: &ServerEndpoint, flavor: SyncFlavor) -> ConnectionId {
        let mut endpoints = self.endpoints.lock().expect("endpoint map poisoned");
        if self.config.multiplex_sessions {
            if let Some(existing) = endpoints.get(&(endpoint.clone(), flavor)) {
                return *existing;
            }
        }
        let config = ConnectionConfig {
            endpoint: endpoint.clone(),
            http_request_path: "/sync".into(),
            flavor,
            reconnect_mode: self.config.reconnect_mode,
            connect_timeout: self.config.connect_timeout,
            connection_linger_time: self.config.connection_linger_time,
            ping_keepalive_period: self.config.ping_keepalive_period,
            pong_keepalive_timeout: self.config.pong_keepalive_timeout,
            fast_reconnect_limit: self.config.fast_reconnect_limit,
            limits: self.config.limits.clone(),
        };
        let (tx, rx) = unbounded();
        self.event_loop.post(move |state| {
            let id = state.allocate_connection_id();
            let connection = Connection::new(config, StdRng::from_entropy());
            state.install_connection(id, connection);
            state.drive(id, |connection, now| connection.activate(now));
            let _ = tx.send(id);
        });
        let id = rx.recv().expect("event loop alive");
        endpoints.insert((endpoint.clone(), flavor), id);
        id
    }

    /// Binds a session for `coordinator` on `connection`. Returns the
    /// session ident used in routed effects.
    pub fn bind_session(
        &self,
        connection: ConnectionId,
        coordinator: &Arc<DbCoordinator>,
        server_path: String,
        signed_user_token: String,
        sync_config: &SyncConfig,
        active_query: Option<(QueryVersion, String)>,
    ) -> SessionIdent {
        let ident = SessionIdent::new(self.next_session_ident.fetch_add(1, Ordering::Relaxed));
        let attachment = coordinator.sync_attachment();
        let bootstrap = open_bootstrap_store(coordinator, &self.config.limits);
        let session_config = SessionConfig {
            session_ident: ident,
            server_path,
            signed_user_token,
            active_query,
            flx_bootstrap_batch_size_bytes: sync_config.flx_bootstrap_batch_size_bytes,
            limits: self.config.limits.clone(),
        };

        // Local commits reach the session before commit_write returns.
        let loop_tx = self.event_loop_sender();
        coordinator.add_commit_listener(move |version| {
            let _ = loop_tx.send(Box::new(move |state: &mut LoopState<SyncAttachment>| {
                state.drive_session(connection, ident, |session, _store| {
                    session.on_new_client_version(version)
                });
            }));
        });

        let (done_tx, done_rx) = unbounded();
        self.event_loop.post(move |state| {
            let session = Session::new(session_config, &attachment, bootstrap);
            if let Some(conn) = state.connection_mut(connection) {
                let now = MonotonicMillis::now();
                let actions = conn.add_session(session, attachment, now);
                state_execute(state, connection, actions);
            }
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv();
        ident
    }

    /// Posts an orderly deactivation (UNBIND round trip when connected).
    pub fn close_session(&self, connection: ConnectionId, ident: SessionIdent) {
        self.event_loop.post(move |state| {
            state.drive(connection, |conn, now| {
                conn.initiate_session_deactivation(ident, now)
            });
        });
    }

    /// Safe from any thread: posted to the loop.
    pub fn cancel_reconnect_delay(&self, connection: ConnectionId) {
        self.event_loop.post(move |state| {
            state.drive(connection, |conn, now| conn.cancel_reconnect_delay(now));
        });
    }

    /// Asks the session to watch for upload completion; the result arrives
    /// as a routed `UploadCompleted` effect.
    pub fn request_upload_completion(&self, connection: ConnectionId, ident: SessionIdent) {
        self.event_loop.post(move |state| {
            state.drive_session(connection, ident, |session, store| {
                session.request_upload_completion(store)
            });
        });
    }

    /// Asks the session for a MARK round trip; the result arrives as a
    /// routed `DownloadCompleted` effect.
    pub fn request_download_completion(&self, connection: ConnectionId, ident: SessionIdent) {
        self.event_loop.post(move |state| {
            state.drive_session(connection, ident, |session, _store| {
                session.request_download_completion()
            });
        });
    }

    /// Announces a committed subscription set version to the session.
    pub fn announce_query_version(
        &self,
        connection: ConnectionId,
        ident: SessionIdent,
        pending: PendingQuery,
    ) {
        self.event_loop.post(move |state| {
            state.drive_session(connection, ident, |session, _store| {
                session.on_new_query_version(pending)
            });
        });
    }

    pub fn stop(self) {
        self.event_loop.stop();
    }

    fn event_loop_sender(&self) -> Sender<event_loop::LoopTask<SyncAttachment>> {
        // EventLoop::post boxes per call; commit listeners keep their own
        // sender to avoid borrowing `self`.
        self.event_loop.task_sender()
    }
}

fn open_bootstrap_store(
    coordinator: &Arc<DbCoordinator>,
    limits: &Limits,
) -> PendingBootstrapStore {
    let path = paths::pending_bootstrap_path(coordinator.db_path());
    if path.parent().map(std::path::Path::is_dir).unwrap_or(false) {
        PendingBootstrapStore::open(&path, limits.clone())
            .unwrap_or_else(|_| PendingBootstrapStore::in_memory().expect("in-memory store"))
    } else {
        PendingBootstrapStore::in_memory().expect("in-memory store")
    }
}

fn install_sinks(
    event_loop: &EventLoop<SyncAttachment>,
    effects_tx: Sender<RoutedEffect>,
    states_tx: Sender<(ConnectionId, ConnectionState)>,
) {
    event_loop.post(move |state| {
        state.set_effect_sink(Box::new(move |_state, connection, ident, effect| {
            let _ = effects_tx.send((connection, ident, effect));
        }));
        state.set_state_listener(Box::new(move |connection, connection_state, _error| {
            let _ = states_tx.send((connection, connection_state));
        }));
    });
}

fn state_execute(
    state: &mut LoopState<SyncAttachment>,
    connection: ConnectionId,
    actions: Vec<ConnectionAction>,
) {
    // `add_session` runs outside `drive`; reuse the loop's executor by
    // replaying the actions through a no-op entry point.
    let mut pending = Some(actions);
    state.drive(connection, |_conn, _now| pending.take().unwrap_or_default());
}
