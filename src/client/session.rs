//! Per-file protocol session state machine.
//!
//! A session lives inside a connection and is only ever touched on the
//! event loop. It is sans-IO: inbound messages and lifecycle calls produce
//! [`SessionEffect`]s that the connection and event loop execute. The send
//! side is pull-based: when the connection has a free write slot it asks
//! the enlisted session for its next message, and the session answers by
//! priority (BIND, IDENT, UNBIND, QUERY, MARK, UPLOAD) or passes.

use tracing::{debug, warn};

use crate::client::bootstrap::{BootstrapBatch, PendingBootstrapStore};
use crate::core::{
    check_changeset_headers, check_received_progress, ChangesetHeaderRule, ClientErrorCode,
    ClientFileIdent, ClientVersion, Limits, QueryVersion, RemoteChangeset, RequestIdent,
    ServerRequestedAction, SessionErrorInfo, SessionIdent, SyncProgress, UploadChangeset,
};
use crate::protocol::{
    Bind, ClientMessage, Download, DownloadBatchState, Ident, IdentFromServer, IdentQuery, Mark,
    MarkResponse, ProtocolError, Query, QueryError, Unbind, Upload,
};

/// Transport-level session lifecycle. Orthogonal to the suspended flag and
/// to the application-level lifecycle in `wrapper`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created but not yet granted a first send slot.
    Unactivated,
    Active,
    /// UNBIND is queued or in flight; waiting for UNBOUND (or ERROR).
    Deactivating,
    /// Terminal; the connection discards the session on the event loop.
    Deactivated,
}

/// What a session asks its surroundings to do.
#[derive(Debug, PartialEq)]
pub enum SessionEffect {
    /// Enlist this session in the connection's send queue.
    RequestSendSlot,
    /// The file ident was assigned; persist already happened.
    IdentAssigned(ClientFileIdent),
    /// A DOWNLOAD batch was integrated producing this local version.
    ChangesetsIntegrated {
        new_version: ClientVersion,
        progress: SyncProgress,
        downloadable_bytes: u64,
    },
    /// Upload cursor advanced; listeners may recompute progress estimates.
    UploadProgressed { client_version: ClientVersion },
    /// All local changes as of the request moment are acknowledged.
    UploadCompleted,
    /// The server confirmed delivery of everything it had (MARK reply).
    DownloadCompleted,
    /// A subscription set version changed protocol state.
    SubscriptionStateChanged {
        query_version: QueryVersion,
        state: SubscriptionProtocolState,
    },
    /// Deliver a deferred compensating-write error to the application.
    DeliverError(SessionErrorInfo),
    /// Suspend with a session-level error; resumption timer per `try_again`.
    SuspendWithError(SessionErrorInfo),
    /// The server demands a client reset; orchestration takes over.
    ClientResetRequired(SessionErrorInfo),
    /// The session reached `Deactivated` and may be discarded.
    Finalized,
}

/// Protocol-visible subscription states a session drives directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionProtocolState {
    Bootstrapping,
    AwaitingMark,
    Complete,
    Error,
}

/// The integration seam: everything the session needs from the local
/// database and history. Implemented by the coordinator attachment and by
/// in-memory mocks in tests.
pub trait SessionStore {
    fn client_file_ident(&self) -> ClientFileIdent;
    fn set_client_file_ident(&mut self, ident: ClientFileIdent) -> Result<(), String>;
    fn sync_progress(&self) -> SyncProgress;
    fn last_version_available(&self) -> ClientVersion;
    fn uploadable_changesets(
        &self,
        after: ClientVersion,
        up_to: ClientVersion,
        max_count: usize,
    ) -> Vec<UploadChangeset>;
    /// Applies one DOWNLOAD batch in a single write transaction and returns
    /// the produced client version.
    fn integrate_remote_changesets(
        &mut self,
        changesets: &[RemoteChangeset],
        progress: &SyncProgress,
    ) -> Result<ClientVersion, String>;
}

/// A pending subscription change the session must order against uploads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingQuery {
    pub query_version: QueryVersion,
    pub query_body: String,
    /// Uploads must not pass this local version before the QUERY is sent.
    pub snapshot_version: ClientVersion,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub session_ident: SessionIdent,
    pub server_path: String,
    pub signed_user_token: String,
    /// Flexible sync when set: the query set active at session start.
    pub active_query: Option<(QueryVersion, String)>,
    /// Chunk size when draining a pending bootstrap into the database.
    pub flx_bootstrap_batch_size_bytes: usize,
    pub limits: Limits,
}

pub struct Session {
    config: SessionConfig,
    state: SessionState,
    suspended: bool,

    bind_sent: bool,
    ident_message_sent: bool,
    unbind_sent: bool,
    unbind_scheduled: bool,
    error_received: bool,
    unbound_received: bool,
    enlisted: bool,

    client_file_ident: ClientFileIdent,
    progress: SyncProgress,
    upload_client_version: ClientVersion,
    last_version_selected_for_upload: ClientVersion,

    last_download_mark_sent: RequestIdent,
    last_download_mark_received: RequestIdent,
    mark_request_pending: bool,
    upload_completion_requested: bool,
    download_completion_requested: bool,

    active_query_version: QueryVersion,
    last_sent_query_version: QueryVersion,
    pending_query: Option<PendingQuery>,

    bootstrap: PendingBootstrapStore,
    deferred_errors: Vec<SessionErrorInfo>,
}

impl Session {
    pub fn new(config: SessionConfig, store: &impl SessionStore, bootstrap: PendingBootstrapStore) -> Self {
        let active_query_version = config
            .active_query
            .as_ref()
            .map(|(version, _)| *version)
            .unwrap_or(QueryVersion::ZERO);
        let progress = store.sync_progress();
        Session {
            client_file_ident: store.client_file_ident(),
            upload_client_version: progress.upload.client_version,
            last_version_selected_for_upload: progress.upload.client_version,
            progress,
            config,
            state: SessionState::Unactivated,
            suspended: false,
            bind_sent: false,
            ident_message_sent: false,
            unbind_sent: false,
            unbind_scheduled: false,
            error_received: false,
            unbound_received: false,
            enlisted: false,
            last_download_mark_sent: RequestIdent::ZERO,
            last_download_mark_received: RequestIdent::ZERO,
            mark_request_pending: false,
            upload_completion_requested: false,
            download_completion_requested: false,
            active_query_version,
            last_sent_query_version: active_query_version,
            pending_query: None,
            bootstrap,
            deferred_errors: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn session_ident(&self) -> SessionIdent {
        self.config.session_ident
    }

    pub fn client_file_ident(&self) -> ClientFileIdent {
        self.client_file_ident
    }

    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }

    pub fn is_flexible_sync(&self) -> bool {
        self.config.active_query.is_some()
    }

    /// Called when the connection grants the session its first slot (or on
    /// reconnection). Produces the enlist request that starts BIND.
    pub fn activate(&mut self) -> Vec<SessionEffect> {
        debug_assert_eq!(self.state, SessionState::Unactivated);
        self.state = SessionState::Active;
        vec![self.enlist()]
    }

    /// Re-arms the send machinery after a reconnect: protocol state resets
    /// to before-BIND while cursors and idents survive.
    pub fn connection_established(&mut self, fast_reconnect: bool) -> Vec<SessionEffect> {
        if self.state != SessionState::Active {
            return Vec::new();
        }
        self.bind_sent = false;
        self.ident_message_sent = false;
        self.unbind_sent = false;
        self.error_received = false;
        self.unbound_received = false;
        self.enlisted = false;
        if !fast_reconnect && self.download_completion_requested {
            // The MARK round trip must be repeated on a slow reconnect.
            self.mark_request_pending = true;
        }
        vec![self.enlist()]
    }

    /// Orderly shutdown: queue UNBIND once the send slot allows.
    pub fn initiate_deactivation(&mut self) -> Vec<SessionEffect> {
        if matches!(
            self.state,
            SessionState::Deactivating | SessionState::Deactivated
        ) {
            return Vec::new();
        }
        self.state = SessionState::Deactivating;
        self.unbind_scheduled = true;
        vec![self.enlist()]
    }

    /// Immediate teardown without the UNBIND round trip (connection lost or
    /// force-closed). Terminal.
    pub fn force_deactivate(&mut self) -> Vec<SessionEffect> {
        self.state = SessionState::Deactivated;
        vec![SessionEffect::Finalized]
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) -> Vec<SessionEffect> {
        if !self.suspended {
            return Vec::new();
        }
        self.suspended = false;
        if self.state == SessionState::Active {
            vec![self.enlist()]
        } else {
            Vec::new()
        }
    }

    /// A local commit advanced the history to `version`.
    pub fn on_new_client_version(&mut self, version: ClientVersion) -> Vec<SessionEffect> {
        let _ = version;
        if self.state == SessionState::Active && self.ident_message_sent && !self.suspended {
            vec![self.enlist()]
        } else {
            Vec::new()
        }
    }

    /// The application registered an upload-completion wait.
    pub fn request_upload_completion(&mut self, store: &impl SessionStore) -> Vec<SessionEffect> {
        self.upload_completion_requested = true;
        self.check_upload_completion(store)
    }

    /// The application registered a download-completion wait: a MARK round
    /// trip confirms the server delivered everything it had.
    pub fn request_download_completion(&mut self) -> Vec<SessionEffect> {
        self.download_completion_requested = true;
        self.mark_request_pending = true;
        if self.state == SessionState::Active && !self.suspended {
            vec![self.enlist()]
        } else {
            Vec::new()
        }
    }

    /// A newer subscription set version is ready to announce.
    pub fn on_new_query_version(&mut self, pending: PendingQuery) -> Vec<SessionEffect> {
        debug_assert!(self.is_flexible_sync());
        self.pending_query = Some(pending);
        if self.state == SessionState::Active && self.ident_message_sent && !self.suspended {
            vec![self.enlist()]
        } else {
            Vec::new()
        }
    }

    fn enlist(&mut self) -> SessionEffect {
        self.enlisted = true;
        SessionEffect::RequestSendSlot
    }

    pub fn is_enlisted(&self) -> bool {
        self.enlisted
    }

    /// The connection's free write slot reached this session. `None` passes
    /// the slot on.
    pub fn next_message(&mut self, store: &mut impl SessionStore) -> Option<ClientMessage> {
        self.enlisted = false;
        if self.suspended || self.state == SessionState::Deactivated {
            return None;
        }

        if !self.bind_sent {
            return Some(self.make_bind());
        }
        if self.unbind_scheduled && !self.unbind_sent {
            self.unbind_sent = true;
            return Some(ClientMessage::Unbind(Unbind {
                session_ident: self.config.session_ident,
            }));
        }
        if self.state != SessionState::Active {
            return None;
        }
        if !self.ident_message_sent {
            if !self.client_file_ident.is_assigned() {
                // Waiting for the server's IDENT.
                return None;
            }
            return Some(self.make_ident());
        }
        if let Some(query) = self.take_sendable_query() {
            return Some(query);
        }
        if self.mark_request_pending {
            self.mark_request_pending = false;
            self.last_download_mark_sent = self.last_download_mark_sent.next();
            return Some(ClientMessage::Mark(Mark {
                session_ident: self.config.session_ident,
                request_ident: self.last_download_mark_sent,
            }));
        }
        self.make_upload(store)
    }

    /// Called after the frame for this session finished writing.
    pub fn message_sent(&mut self, store: &mut impl SessionStore) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.unbind_sent && self.error_received {
            // UNBIND raced a session-level ERROR; deactivation completes
            // without waiting for UNBOUND.
            self.state = SessionState::Deactivated;
            effects.push(SessionEffect::Finalized);
            return effects;
        }
        // More to send? Re-enlist while anything is pending.
        if self.state == SessionState::Active && !self.suspended && self.has_pending_output(store) {
            effects.push(self.enlist());
        }
        effects
    }

    fn has_pending_output(&self, store: &impl SessionStore) -> bool {
        if !self.ident_message_sent {
            return self.client_file_ident.is_assigned();
        }
        if self.mark_request_pending || self.pending_query.is_some() {
            return true;
        }
        self.upload_client_version < store.last_version_available()
    }

    fn make_bind(&mut self) -> ClientMessage {
        self.bind_sent = true;
        debug!(
            target: "session",
            session_ident = %self.config.session_ident,
            path = %self.config.server_path,
            need_ident = !self.client_file_ident.is_assigned(),
            "sending BIND"
        );
        ClientMessage::Bind(Bind {
            session_ident: self.config.session_ident,
            path: self.config.server_path.clone(),
            need_client_file_ident: !self.client_file_ident.is_assigned(),
            is_subserver: false,
            signed_user_token: self.config.signed_user_token.clone(),
        })
    }

    fn make_ident(&mut self) -> ClientMessage {
        self.ident_message_sent = true;
        let query = self.config.active_query.as_ref().map(|(version, body)| IdentQuery {
            query_version: *version,
            query_body: body.clone(),
        });
        debug!(
            target: "session",
            session_ident = %self.config.session_ident,
            client_file_ident = %self.client_file_ident,
            download_server_version = %self.progress.download.server_version,
            upload_client_version = %self.progress.upload.client_version,
            "sending IDENT"
        );
        ClientMessage::Ident(Ident {
            session_ident: self.config.session_ident,
            client_file_ident: self.client_file_ident.ident,
            client_file_ident_salt: self.client_file_ident.salt,
            scan_server_version: self.progress.download.server_version,
            scan_client_version: self.progress.download.last_integrated_client_version,
            latest_server_version: self.progress.latest_server_version,
            query,
        })
    }

    fn take_sendable_query(&mut self) -> Option<ClientMessage> {
        let pending = self.pending_query.as_ref()?;
        // The QUERY may only go out once uploads have caught up to the
        // subscription snapshot, so the server sees the same ordering.
        if self.upload_client_version < pending.snapshot_version {
            return None;
        }
        let pending = self.pending_query.take().expect("pending query present");
        self.last_sent_query_version = pending.query_version;
        debug!(
            target: "session",
            session_ident = %self.config.session_ident,
            query_version = %pending.query_version,
            "sending QUERY"
        );
        Some(ClientMessage::Query(Query {
            session_ident: self.config.session_ident,
            query_version: pending.query_version,
            query_body: pending.query_body,
        }))
    }

    fn make_upload(&mut self, store: &mut impl SessionStore) -> Option<ClientMessage> {
        let last_available = store.last_version_available();
        let mut target = last_available;
        if let Some(pending) = &self.pending_query {
            // Cap uploads at the pending subscription snapshot so QUERY is
            // never overtaken.
            target = target.min(pending.snapshot_version);
        }
        if self.upload_client_version >= target {
            return None;
        }
        let changesets = store.uploadable_changesets(
            self.upload_client_version,
            target,
            self.config.limits.max_changesets_per_upload,
        );
        let scan_end = changesets
            .last()
            .map(|c| c.client_version)
            .unwrap_or(target);
        if let Some(last) = changesets.last() {
            self.last_version_selected_for_upload = last.client_version;
        }
        self.upload_client_version = scan_end;
        debug!(
            target: "session",
            session_ident = %self.config.session_ident,
            progress_client_version = %scan_end,
            num_changesets = changesets.len(),
            "sending UPLOAD"
        );
        Some(ClientMessage::Upload(Upload {
            session_ident: self.config.session_ident,
            progress_client_version: scan_end,
            progress_server_version: self.progress.download.server_version,
            locked_server_version: self.progress.download.server_version,
            changesets,
        }))
    }

    /// Server-assigned file identity. Persists through the store before the
    /// session proceeds to its own IDENT message.
    pub fn receive_ident(
        &mut self,
        message: IdentFromServer,
        store: &mut impl SessionStore,
    ) -> Result<Vec<SessionEffect>, ClientErrorCode> {
        if self.state != SessionState::Active {
            return Ok(Vec::new());
        }
        if !self.bind_sent || self.ident_message_sent || self.error_received {
            return Err(ClientErrorCode::BadMessageOrder);
        }
        if message.client_file_ident == 0 || message.client_file_ident_salt == 0 {
            return Err(ClientErrorCode::BadClientFileIdent);
        }
        let ident = ClientFileIdent::new(message.client_file_ident, message.client_file_ident_salt);
        store
            .set_client_file_ident(ident)
            .map_err(|_| ClientErrorCode::BadClientFileIdent)?;
        self.client_file_ident = ident;
        Ok(vec![SessionEffect::IdentAssigned(ident), self.enlist()])
    }

    /// One DOWNLOAD message: validate, route to the bootstrap store or
    /// integrate immediately.
    pub fn receive_download(
        &mut self,
        message: Download,
        store: &mut impl SessionStore,
    ) -> Result<Vec<SessionEffect>, ClientErrorCode> {
        if self.state != SessionState::Active {
            return Ok(Vec::new());
        }
        if !self.ident_message_sent || self.error_received || self.unbound_received {
            return Err(ClientErrorCode::BadMessageOrder);
        }

        let batch_state = self.classify_batch(&message);

        if let Err(rule) = check_received_progress(
            &self.progress,
            &message.progress,
            store.last_version_available(),
        ) {
            warn!(
                target: "session",
                session_ident = %self.config.session_ident,
                rule = rule.code(),
                "bad sync progress received"
            );
            return Err(ClientErrorCode::BadProgress);
        }

        let weak_server_order = self.is_flexible_sync()
            && !matches!(batch_state, DownloadBatchState::SteadyState);
        if let Err(rule) = check_changeset_headers(
            &message.changesets,
            self.client_file_ident,
            self.progress.download.server_version,
            self.progress.download.last_integrated_client_version,
            message.progress.download.last_integrated_client_version,
            weak_server_order,
        ) {
            return Err(match rule {
                ChangesetHeaderRule::BadServerVersion => ClientErrorCode::BadServerVersion,
                ChangesetHeaderRule::BadClientVersion => ClientErrorCode::BadClientVersion,
                ChangesetHeaderRule::BadOriginFileIdent => ClientErrorCode::BadOriginFileIdent,
            });
        }

        match batch_state {
            DownloadBatchState::MoreToCome => {
                self.bootstrap
                    .store_message(&message)
                    .map_err(|_| ClientErrorCode::BadChangesetSize)?;
                let mut effects = Vec::new();
                if self.bootstrap.message_count() == 1 {
                    effects.push(SessionEffect::SubscriptionStateChanged {
                        query_version: message.query_version,
                        state: SubscriptionProtocolState::Bootstrapping,
                    });
                }
                Ok(effects)
            }
            DownloadBatchState::LastInBatch => {
                self.bootstrap
                    .store_message(&message)
                    .map_err(|_| ClientErrorCode::BadChangesetSize)?;
                let mut effects = if self.bootstrap.message_count() == 1 {
                    vec![SessionEffect::SubscriptionStateChanged {
                        query_version: message.query_version,
                        state: SubscriptionProtocolState::Bootstrapping,
                    }]
                } else {
                    Vec::new()
                };
                effects.extend(self.drain_bootstrap(message.query_version, store)?);
                Ok(effects)
            }
            DownloadBatchState::SteadyState => self.integrate_batch(
                message.progress,
                message.downloadable_bytes,
                &message.changesets,
                store,
            ),
        }
    }

    fn classify_batch(&self, message: &Download) -> DownloadBatchState {
        if !self.is_flexible_sync() {
            return DownloadBatchState::SteadyState;
        }
        if message.query_version > self.active_query_version {
            message.batch_state()
        } else {
            DownloadBatchState::SteadyState
        }
    }

    fn drain_bootstrap(
        &mut self,
        query_version: QueryVersion,
        store: &mut impl SessionStore,
    ) -> Result<Vec<SessionEffect>, ClientErrorCode> {
        let mut effects = Vec::new();
        loop {
            let Some(BootstrapBatch {
                changesets,
                progress,
                downloadable_bytes,
                remaining,
            }) = self
                .bootstrap
                .next_chunk(self.config.flx_bootstrap_batch_size_bytes)
                .map_err(|_| ClientErrorCode::BadChangesetSize)?
            else {
                break;
            };
            let mut chunk_effects =
                self.integrate_batch(progress, downloadable_bytes, &changesets, store)?;
            effects.append(&mut chunk_effects);
            if remaining == 0 {
                break;
            }
        }
        self.bootstrap
            .clear()
            .map_err(|_| ClientErrorCode::BadChangesetSize)?;
        self.active_query_version = query_version;
        effects.push(SessionEffect::SubscriptionStateChanged {
            query_version,
            state: SubscriptionProtocolState::AwaitingMark,
        });
        // The matching MARK round trip completes the subscription.
        self.mark_request_pending = true;
        effects.push(self.enlist());
        Ok(effects)
    }

    fn integrate_batch(
        &mut self,
        progress: SyncProgress,
        downloadable_bytes: u64,
        changesets: &[RemoteChangeset],
        store: &mut impl SessionStore,
    ) -> Result<Vec<SessionEffect>, ClientErrorCode> {
        let new_version = store
            .integrate_remote_changesets(changesets, &progress)
            .map_err(|message| {
                warn!(
                    target: "session",
                    session_ident = %self.config.session_ident,
                    error = %message,
                    "changeset integration failed"
                );
                ClientErrorCode::BadChangeset
            })?;
        self.progress = progress;
        let mut effects = vec![SessionEffect::ChangesetsIntegrated {
            new_version,
            progress,
            downloadable_bytes,
        }];
        effects.extend(self.deliver_due_compensating_writes());
        effects.extend(self.check_upload_completion(store));
        Ok(effects)
    }

    fn deliver_due_compensating_writes(&mut self) -> Vec<SessionEffect> {
        let server_version = self.progress.download.server_version.get();
        let mut effects = Vec::new();
        let mut index = 0;
        while index < self.deferred_errors.len() {
            let due = self.deferred_errors[index]
                .compensating_write_server_version
                .map(|v| v <= server_version)
                .unwrap_or(true);
            if due {
                let info = self.deferred_errors.remove(index);
                effects.push(SessionEffect::DeliverError(info));
            } else {
                index += 1;
            }
        }
        effects
    }

    pub fn receive_mark(
        &mut self,
        message: MarkResponse,
    ) -> Result<Vec<SessionEffect>, ClientErrorCode> {
        if self.state != SessionState::Active {
            return Ok(Vec::new());
        }
        if !self.ident_message_sent || self.error_received || self.unbound_received {
            return Err(ClientErrorCode::BadMessageOrder);
        }
        let good_request_ident = message.request_ident <= self.last_download_mark_sent
            && message.request_ident > self.last_download_mark_received;
        if !good_request_ident {
            return Err(ClientErrorCode::BadRequestIdent);
        }
        self.last_download_mark_received = message.request_ident;
        let mut effects = Vec::new();
        if self.last_download_mark_received == self.last_download_mark_sent {
            if self.download_completion_requested {
                self.download_completion_requested = false;
                effects.push(SessionEffect::DownloadCompleted);
            }
            if self.is_flexible_sync() {
                effects.push(SessionEffect::SubscriptionStateChanged {
                    query_version: self.active_query_version,
                    state: SubscriptionProtocolState::Complete,
                });
            }
        }
        Ok(effects)
    }

    pub fn receive_unbound(&mut self) -> Result<Vec<SessionEffect>, ClientErrorCode> {
        if !self.unbind_sent || self.error_received || self.unbound_received {
            return Err(ClientErrorCode::BadMessageOrder);
        }
        self.unbound_received = true;
        self.state = SessionState::Deactivated;
        Ok(vec![SessionEffect::Finalized])
    }

    /// A session-level ERROR addressed to this session.
    pub fn receive_error(
        &mut self,
        message: ProtocolError,
    ) -> Result<Vec<SessionEffect>, ClientErrorCode> {
        if self.error_received {
            return Err(ClientErrorCode::BadMessageOrder);
        }
        let mut info = SessionErrorInfo::new(
            message.raw_error_code,
            message.message.clone(),
            message.try_again,
        )
        .with_session_ident(self.config.session_ident)
        .with_action(message.action);
        info.unrecognized_by_client =
            !crate::core::server_error::is_known(message.raw_error_code);
        info.compensating_write_server_version = message.compensating_write_server_version;
        if let Some(interval) = message.resumption_delay_interval_ms {
            info.resumption_delay_info = Some(crate::core::ResumptionDelayInfo {
                resumption_delay_interval: std::time::Duration::from_millis(interval),
                resumption_delay_backoff_multiplier: message
                    .resumption_delay_backoff_multiplier
                    .unwrap_or(2),
                max_resumption_delay_interval: std::time::Duration::from_millis(
                    message.max_resumption_delay_interval_ms.unwrap_or(interval),
                ),
            });
        }

        if info.is_compensating_write() {
            // Deferred: queued until the DOWNLOAD carrying that server
            // version arrives, then delivered in order alongside the batch.
            let due_version = info
                .compensating_write_server_version
                .expect("compensating write carries a server version");
            if due_version <= self.progress.download.server_version.get() {
                return Ok(vec![SessionEffect::DeliverError(info)]);
            }
            self.deferred_errors.push(info);
            return Ok(Vec::new());
        }

        self.error_received = true;

        if info.action.requires_client_reset() {
            return Ok(vec![SessionEffect::ClientResetRequired(info)]);
        }

        if self.state == SessionState::Deactivating {
            // The ERROR ends the session in place of UNBOUND.
            self.state = SessionState::Deactivated;
            return Ok(vec![SessionEffect::Finalized]);
        }

        self.suspended = true;
        Ok(vec![SessionEffect::SuspendWithError(info)])
    }

    pub fn receive_query_error(
        &mut self,
        message: QueryError,
    ) -> Result<Vec<SessionEffect>, ClientErrorCode> {
        if !self.is_flexible_sync() {
            return Err(ClientErrorCode::BadMessageOrder);
        }
        Ok(vec![SessionEffect::SubscriptionStateChanged {
            query_version: message.query_version,
            state: SubscriptionProtocolState::Error,
        }])
    }

    fn check_upload_completion(&mut self, store: &impl SessionStore) -> Vec<SessionEffect> {
        if !self.upload_completion_requested {
            return Vec::new();
        }
        let scan_complete = self.upload_client_version >= store.last_version_available();
        let all_uploads_accepted =
            self.progress.upload.client_version >= self.last_version_selected_for_upload;
        if scan_complete && all_uploads_accepted {
            self.upload_completion_requested = false;
            vec![SessionEffect::UploadCompleted]
        } else {
            Vec::new()
        }
    }

    /// Upload progress observable (version the server acknowledged).
    pub fn acknowledged_upload_version(&self) -> ClientVersion {
        self.progress.upload.client_version
    }
}
