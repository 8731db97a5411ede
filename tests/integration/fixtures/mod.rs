//! Shared helpers: scripted server frames and coordinator-backed setups.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;

use driftwire::client::{
    Connection, ConnectionAction, ConnectionConfig, PendingBootstrapStore, ReconnectMode, Session,
    SessionConfig,
};
use driftwire::coordinator::{encode_payload, DbCoordinator, KvOp, SyncAttachment};
use driftwire::core::{
    ClientVersion, Limits, MonotonicMillis, QueryVersion, RemoteChangeset, SaltedServerVersion,
    ServerVersion, SessionIdent, SyncProgress,
};
use driftwire::protocol::{
    self, ClientMessage, Download, IdentFromServer, ServerMessage, SyncFlavor,
};
use driftwire::{ProtocolEnvelope, ServerEndpoint};

pub fn unique_db_path(tag: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    PathBuf::from(format!("/mem/it-{tag}-{n}"))
}

pub fn limits() -> Limits {
    Limits::default()
}

pub fn now() -> MonotonicMillis {
    MonotonicMillis::now()
}

pub fn connection_config(flavor: SyncFlavor) -> ConnectionConfig {
    ConnectionConfig {
        endpoint: ServerEndpoint::new(ProtocolEnvelope::Ws, "localhost", 7800),
        http_request_path: "/sync".into(),
        flavor,
        reconnect_mode: ReconnectMode::Testing,
        connect_timeout: Duration::from_secs(2),
        connection_linger_time: Duration::from_millis(20),
        ping_keepalive_period: Duration::from_secs(60),
        pong_keepalive_timeout: Duration::from_secs(120),
        fast_reconnect_limit: Duration::from_secs(60),
        limits: limits(),
    }
}

pub fn session_config(ident: u64, flavor: SyncFlavor) -> SessionConfig {
    SessionConfig {
        session_ident: SessionIdent::new(ident),
        server_path: "/default".into(),
        signed_user_token: "test-token".into(),
        active_query: match flavor {
            SyncFlavor::PartitionBased => None,
            SyncFlavor::Flexible => Some((QueryVersion::new(1), "TRUEPREDICATE".into())),
        },
        flx_bootstrap_batch_size_bytes: 1024 * 1024,
        limits: limits(),
    }
}

/// A connection wired to a real coordinator through its sync attachment.
pub struct Harness {
    pub coordinator: Arc<DbCoordinator>,
    pub connection: Connection<SyncAttachment>,
    pub session_ident: SessionIdent,
}

impl Harness {
    pub fn new(tag: &str, flavor: SyncFlavor) -> Harness {
        let coordinator = DbCoordinator::get_coordinator(&unique_db_path(tag)).unwrap();
        Self::with_coordinator(coordinator, flavor)
    }

    pub fn with_coordinator(coordinator: Arc<DbCoordinator>, flavor: SyncFlavor) -> Harness {
        let mut connection =
            Connection::new(connection_config(flavor), StdRng::seed_from_u64(1234));
        connection.activate(now());
        connection.handle_reconnect_timer(now());

        let session_ident = SessionIdent::new(1);
        let session = Session::new(
            session_config(1, flavor),
            &coordinator.sync_attachment(),
            PendingBootstrapStore::in_memory().unwrap(),
        );
        connection.add_session(session, coordinator.sync_attachment(), now());

        Harness {
            coordinator,
            connection,
            session_ident,
        }
    }

    /// Completes connect and the server sub-protocol selection.
    pub fn establish(&mut self, flavor: SyncFlavor) -> Vec<ConnectionAction> {
        self.connection.handle_reconnect_timer(now());
        let token = match flavor {
            SyncFlavor::PartitionBased => {
                format!("io.driftwire.sync/{}", protocol::PROTOCOL_VERSION_MAX)
            }
            SyncFlavor::Flexible => {
                format!("io.driftwire.flx-sync/{}", protocol::PROTOCOL_VERSION_MAX)
            }
        };
        self.connection.handle_connected(Some(&token), now())
    }

    /// Feeds one server message into the connection.
    pub fn receive(&mut self, message: &ServerMessage) -> Vec<ConnectionAction> {
        let bytes = protocol::encode_server_message(message, &limits()).unwrap();
        self.connection.handle_binary_message(&bytes, now())
    }

    /// Pops the next outbound frame, acknowledging the write.
    pub fn next_outbound(
        &mut self,
        actions: &[ConnectionAction],
    ) -> Option<(ClientMessage, Vec<ConnectionAction>)> {
        let frame = actions.iter().find_map(|action| match action {
            ConnectionAction::SendFrame(frame) => Some(frame.clone()),
            _ => None,
        })?;
        let message = protocol::decode_client_message(&frame, &limits()).unwrap();
        let follow_up = self.connection.handle_write_completed(now());
        Some((message, follow_up))
    }

    /// Runs BIND → IDENT(server) → IDENT so the session is in its steady
    /// state. Returns the actions from the final write completion.
    pub fn run_handshake(&mut self, flavor: SyncFlavor) -> Vec<ConnectionAction> {
        let actions = self.establish(flavor);
        let (bind, mut actions) = self.next_outbound(&actions).expect("BIND");
        assert!(matches!(bind, ClientMessage::Bind(_)));

        if !self
            .coordinator
            .history()
            .client_file_ident()
            .unwrap()
            .is_assigned()
        {
            actions = self.receive(&ServerMessage::Ident(IdentFromServer {
                session_ident: self.session_ident,
                client_file_ident: 1234,
                client_file_ident_salt: 42,
            }));
        }
        let (ident, actions) = self.next_outbound(&actions).expect("IDENT");
        assert!(matches!(ident, ClientMessage::Ident(_)));
        actions
    }
}

/// A DOWNLOAD message headed for `session_ident`.
pub fn download_message(
    session_ident: SessionIdent,
    progress: SyncProgress,
    query_version: i64,
    last_in_batch: bool,
    changesets: Vec<RemoteChangeset>,
) -> ServerMessage {
    ServerMessage::Download(Download {
        session_ident,
        progress,
        downloadable_bytes: 0,
        query_version: QueryVersion::new(query_version),
        last_in_batch,
        changesets,
    })
}

pub fn progress(dl_server: u64, dl_client: u64, up_client: u64, latest: u64) -> SyncProgress {
    let mut progress = SyncProgress::default();
    progress.download.server_version = ServerVersion::new(dl_server);
    progress.download.last_integrated_client_version = ClientVersion::new(dl_client);
    progress.upload.client_version = ClientVersion::new(up_client);
    progress.upload.last_integrated_server_version = ServerVersion::new(dl_server);
    progress.latest_server_version = SaltedServerVersion::new(ServerVersion::new(latest), 1);
    progress
}

/// A remote changeset carrying one key-value put in the reference payload
/// format.
pub fn remote_kv_changeset(
    server_version: u64,
    origin: u64,
    key: &str,
    value: &[u8],
) -> RemoteChangeset {
    RemoteChangeset {
        remote_version: ServerVersion::new(server_version),
        last_integrated_local_version: ClientVersion::ZERO,
        origin_file_ident: origin,
        origin_timestamp: 0,
        payload: Bytes::from(encode_payload(&[KvOp {
            key: key.into(),
            value: Some(value.to_vec()),
        }])),
    }
}
