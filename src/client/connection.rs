//! One connection to a server endpoint, multiplexing sessions.
//!
//! Sans-IO like the sessions it owns: transport events and timer firings
//! come in, [`ConnectionAction`]s come out, and the event loop executes
//! them. All state lives on the event loop thread.
//!
//! The send side is a fair FIFO: sessions enlist, the free write slot asks
//! the front session for a message, and a session that declines passes the
//! slot on. A pending PING always wins the slot.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::client::backoff::{compute_reconnect_delay, ReconnectDelay, ReconnectInfo, ReconnectMode};
use crate::client::session::{Session, SessionEffect, SessionState, SessionStore};
use crate::client::transport::ConnectRequest;
use crate::core::{
    classify_close_code, ClientErrorCode, CloseCode, Limits, MonotonicMillis, ResumptionDelayInfo,
    ServerEndpoint, SessionErrorInfo, SessionIdent, TerminationReason,
};
use crate::protocol::{
    self, ClientMessage, Ping, ServerMessage, SyncFlavor,
};

/// Externally observable connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Timers a connection arms; the event loop keys them per connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Delay before the next connect attempt.
    Reconnect,
    /// Watchdog bounding the connect operation.
    ConnectWatchdog,
    /// Delay before the next PING.
    Ping,
    /// Wait for the PONG answering the last PING.
    Pong,
    /// Linger before voluntarily dropping a session-less connection.
    Linger,
}

/// What the connection asks the event loop to do.
#[derive(Debug)]
pub enum ConnectionAction {
    /// Start a WebSocket connection attempt.
    Connect(ConnectRequest),
    /// Write one binary frame; a `WriteCompleted` event follows.
    SendFrame(Vec<u8>),
    /// Tear the socket down (no close handshake owed).
    CloseSocket,
    ArmTimer(TimerKind, Duration),
    CancelTimer(TimerKind),
    /// Report a state transition to listeners.
    StateChanged(ConnectionState, Option<SessionErrorInfo>),
    /// Bubble session effects up to the event loop.
    SessionEffects(SessionIdent, Vec<SessionEffect>),
    /// A session reached its terminal state and was discarded.
    SessionDiscarded(SessionIdent),
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub endpoint: ServerEndpoint,
    pub http_request_path: String,
    pub flavor: SyncFlavor,
    pub reconnect_mode: ReconnectMode,
    pub connect_timeout: Duration,
    pub connection_linger_time: Duration,
    pub ping_keepalive_period: Duration,
    pub pong_keepalive_timeout: Duration,
    pub fast_reconnect_limit: Duration,
    pub limits: Limits,
}

struct SessionSlot<S> {
    session: Session,
    store: S,
}

pub struct Connection<S> {
    config: ConnectionConfig,
    state: ConnectionState,
    activated: bool,

    sessions: BTreeMap<SessionIdent, SessionSlot<S>>,
    enlisted_to_send: VecDeque<SessionIdent>,

    reconnect_info: ReconnectInfo,
    reconnect_delay_in_progress: bool,
    disconnect_delay_in_progress: bool,
    disconnect_time: Option<MonotonicMillis>,

    sending: bool,
    sending_session: Option<SessionIdent>,

    ping_delay_in_progress: bool,
    waiting_for_pong: bool,
    send_ping: bool,
    minimize_next_ping_delay: bool,
    ping_sent_this_connection: bool,
    last_ping_sent_at: MonotonicMillis,
    pong_wait_started_at: MonotonicMillis,
    previous_ping_rtt: u64,
    ping_after_scheduled_reset: bool,

    rng: StdRng,
}

impl<S: SessionStore> Connection<S> {
    pub fn new(config: ConnectionConfig, rng: StdRng) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            activated: false,
            sessions: BTreeMap::new(),
            enlisted_to_send: VecDeque::new(),
            reconnect_info: ReconnectInfo::new(),
            reconnect_delay_in_progress: false,
            disconnect_delay_in_progress: false,
            disconnect_time: None,
            sending: false,
            sending_session: None,
            ping_delay_in_progress: false,
            waiting_for_pong: false,
            send_ping: false,
            minimize_next_ping_delay: false,
            ping_sent_this_connection: false,
            last_ping_sent_at: MonotonicMillis::default(),
            pong_wait_started_at: MonotonicMillis::default(),
            previous_ping_rtt: 0,
            ping_after_scheduled_reset: false,
            rng,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.config.endpoint
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn previous_ping_rtt(&self) -> u64 {
        self.previous_ping_rtt
    }

    pub fn session(&self, ident: SessionIdent) -> Option<&Session> {
        self.sessions.get(&ident).map(|slot| &slot.session)
    }

    pub fn session_store(&self, ident: SessionIdent) -> Option<&S> {
        self.sessions.get(&ident).map(|slot| &slot.store)
    }

    /// External call arming the first reconnect wait.
    pub fn activate(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        debug_assert!(!self.activated);
        self.activated = true;
        // Nothing terminated yet: the first wait expires immediately.
        self.reconnect_info.reset();
        self.initiate_reconnect_wait(now)
    }

    /// Registers a new session. Cancels a linger in progress.
    pub fn add_session(
        &mut self,
        session: Session,
        store: S,
        now: MonotonicMillis,
    ) -> Vec<ConnectionAction> {
        let ident = session.session_ident();
        self.sessions.insert(ident, SessionSlot { session, store });
        let mut actions = Vec::new();
        if self.disconnect_delay_in_progress {
            self.disconnect_delay_in_progress = false;
            actions.push(ConnectionAction::CancelTimer(TimerKind::Linger));
        }
        match self.state {
            ConnectionState::Connected => {
                let slot = self.sessions.get_mut(&ident).expect("just inserted");
                let effects = slot.session.activate();
                actions.extend(self.apply_session_effects(ident, effects));
                actions.extend(self.pump_send(now));
            }
            ConnectionState::Disconnected
                if self.activated && !self.reconnect_delay_in_progress =>
            {
                actions.extend(self.initiate_reconnect_wait(now));
            }
            _ => {}
        }
        actions
    }

    /// Begins orderly deactivation of one session.
    pub fn initiate_session_deactivation(
        &mut self,
        ident: SessionIdent,
        now: MonotonicMillis,
    ) -> Vec<ConnectionAction> {
        let Some(slot) = self.sessions.get_mut(&ident) else {
            return Vec::new();
        };
        if self.state != ConnectionState::Connected {
            // No transport to say goodbye over.
            let effects = slot.session.force_deactivate();
            let mut actions = self.apply_session_effects(ident, effects);
            actions.extend(self.check_linger(now));
            return actions;
        }
        let effects = slot.session.initiate_deactivation();
        let mut actions = self.apply_session_effects(ident, effects);
        actions.extend(self.pump_send(now));
        actions
    }

    /// From any thread (posted to the loop): do not wait out the current
    /// reconnect delay. On an established connection this only schedules a
    /// verification PING.
    pub fn cancel_reconnect_delay(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        if self.reconnect_delay_in_progress {
            self.reconnect_delay_in_progress = false;
            self.reconnect_info.reset();
            let mut actions = vec![ConnectionAction::CancelTimer(TimerKind::Reconnect)];
            if self.sessions.is_empty() {
                return actions;
            }
            actions.extend(self.initiate_reconnect_wait(now));
            return actions;
        }
        if self.state == ConnectionState::Disconnected {
            self.reconnect_info.reset();
            return Vec::new();
        }
        // A disconnect may already have happened that we have not observed;
        // only a PONG to a PING sent from now on proves the link is alive.
        self.reconnect_info.scheduled_reset = true;
        self.schedule_urgent_ping(now)
    }

    fn initiate_reconnect_wait(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        debug_assert!(self.activated);
        debug_assert!(!self.reconnect_delay_in_progress);
        let delay = compute_reconnect_delay(
            &mut self.reconnect_info,
            self.config.reconnect_mode,
            &mut self.rng,
            now,
        );
        self.reconnect_delay_in_progress = true;
        match delay {
            ReconnectDelay::Indefinite => {
                debug!(target: "connection", endpoint = %self.config.endpoint, "reconnect delayed indefinitely");
                Vec::new()
            }
            ReconnectDelay::After(delay) => {
                if !delay.is_zero() {
                    debug!(
                        target: "connection",
                        endpoint = %self.config.endpoint,
                        delay_ms = delay.as_millis() as u64,
                        "allowing reconnection after delay"
                    );
                }
                vec![ConnectionAction::ArmTimer(TimerKind::Reconnect, delay)]
            }
        }
    }

    pub fn handle_reconnect_timer(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        self.reconnect_delay_in_progress = false;
        if self.sessions.is_empty() {
            return Vec::new();
        }
        self.initiate_connect(now)
    }

    fn initiate_connect(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        debug_assert!(self.activated);
        self.state = ConnectionState::Connecting;
        self.reconnect_info.record_connect_attempt(now);
        // Assume a voluntary close until the outcome says otherwise.
        self.reconnect_info
            .record_termination(TerminationReason::ClosedVoluntarily, now);
        info!(target: "connection", endpoint = %self.config.endpoint, "connecting");
        vec![
            ConnectionAction::StateChanged(ConnectionState::Connecting, None),
            ConnectionAction::Connect(ConnectRequest {
                endpoint: self.config.endpoint.clone(),
                path: self.config.http_request_path.clone(),
                protocols: protocol::advertised_protocols(self.config.flavor),
            }),
            ConnectionAction::ArmTimer(TimerKind::ConnectWatchdog, self.config.connect_timeout),
        ]
    }

    pub fn handle_connect_watchdog(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        info!(target: "connection", endpoint = %self.config.endpoint, "connect timeout");
        let error = SessionErrorInfo::new(0, "connect timeout", true);
        self.involuntary_disconnect(TerminationReason::SyncConnectTimeout, Some(error), now)
    }

    pub fn handle_connected(
        &mut self,
        selected_protocol: Option<&str>,
        now: MonotonicMillis,
    ) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        let negotiated =
            match protocol::parse_selected_protocol(selected_protocol, self.config.flavor) {
                Ok(version) => version,
                Err(err) => {
                    warn!(target: "connection", endpoint = %self.config.endpoint, error = %err, "protocol negotiation failed");
                    let error = SessionErrorInfo::new(0, err.to_string(), false);
                    return self.involuntary_disconnect(
                        TerminationReason::BadHeadersInHttpResponse,
                        Some(error),
                        now,
                    );
                }
            };
        info!(
            target: "connection",
            endpoint = %self.config.endpoint,
            protocol_version = negotiated,
            "connected"
        );
        self.state = ConnectionState::Connected;
        self.ping_sent_this_connection = false;
        self.pong_wait_started_at = now;

        let mut actions = vec![
            ConnectionAction::CancelTimer(TimerKind::ConnectWatchdog),
            ConnectionAction::StateChanged(ConnectionState::Connected, None),
        ];
        actions.extend(self.initiate_ping_delay(now));

        let fast_reconnect = self
            .disconnect_time
            .map(|at| {
                now.saturating_sub(at) <= self.config.fast_reconnect_limit.as_millis() as u64
            })
            .unwrap_or(false);

        let idents: Vec<SessionIdent> = self.sessions.keys().copied().collect();
        for ident in idents {
            let slot = self.sessions.get_mut(&ident).expect("session present");
            let effects = if slot.session.state() == SessionState::Unactivated {
                slot.session.activate()
            } else {
                slot.session.connection_established(fast_reconnect)
            };
            actions.extend(self.apply_session_effects(ident, effects));
        }
        actions.extend(self.pump_send(now));
        actions
    }

    fn initiate_ping_delay(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        debug_assert!(!self.ping_delay_in_progress);
        debug_assert!(!self.waiting_for_pong);
        debug_assert!(!self.send_ping);

        let mut delay = Duration::ZERO;
        if !self.minimize_next_ping_delay {
            let period = self.config.ping_keepalive_period;
            // Deduct up to 10% at random, or up to 100% for the first ping
            // of a connection, then the time already spent waiting for the
            // previous PONG.
            let max_deduction = if self.ping_sent_this_connection {
                period.as_millis() as u64 / 10
            } else {
                period.as_millis() as u64
            };
            let deduction = if max_deduction > 0 {
                self.rng.gen_range(0..=max_deduction)
            } else {
                0
            };
            let spent = now.saturating_sub(self.pong_wait_started_at);
            delay = period
                .saturating_sub(Duration::from_millis(deduction))
                .saturating_sub(Duration::from_millis(spent));
        } else {
            self.minimize_next_ping_delay = false;
        }
        self.ping_delay_in_progress = true;
        debug!(target: "connection", delay_ms = delay.as_millis() as u64, "next ping scheduled");
        vec![ConnectionAction::ArmTimer(TimerKind::Ping, delay)]
    }

    pub fn handle_ping_timer(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        if !self.ping_delay_in_progress {
            return Vec::new();
        }
        self.ping_delay_in_progress = false;
        self.send_ping = true;

        // Arm the PONG wait.
        self.waiting_for_pong = true;
        self.pong_wait_started_at = now;
        let mut actions = vec![ConnectionAction::ArmTimer(
            TimerKind::Pong,
            self.config.pong_keepalive_timeout,
        )];
        if self.state == ConnectionState::Connected && !self.sending {
            actions.extend(self.pump_send(now));
        }
        actions
    }

    pub fn handle_pong_timer(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        if !self.waiting_for_pong {
            return Vec::new();
        }
        debug!(target: "connection", "timeout waiting for PONG");
        let error = SessionErrorInfo::new(0, ClientErrorCode::PongTimeout.as_str(), true);
        self.involuntary_disconnect(TerminationReason::PongTimeout, Some(error), now)
    }

    fn schedule_urgent_ping(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        if self.ping_delay_in_progress {
            self.ping_delay_in_progress = false;
            self.minimize_next_ping_delay = true;
            let mut actions = vec![ConnectionAction::CancelTimer(TimerKind::Ping)];
            actions.extend(self.initiate_ping_delay(now));
            return actions;
        }
        if !self.send_ping {
            self.minimize_next_ping_delay = true;
        }
        Vec::new()
    }

    /// The transport finished writing the previous frame.
    pub fn handle_write_completed(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        self.sending = false;
        let mut actions = Vec::new();
        if let Some(ident) = self.sending_session.take() {
            if let Some(slot) = self.sessions.get_mut(&ident) {
                let effects = slot.session.message_sent(&mut slot.store);
                let finalized = effects.iter().any(|e| matches!(e, SessionEffect::Finalized));
                actions.extend(self.apply_session_effects(ident, effects));
                if finalized {
                    self.discard_session(ident);
                    actions.push(ConnectionAction::SessionDiscarded(ident));
                    actions.extend(self.check_linger(now));
                }
            }
        }
        if self.state == ConnectionState::Connected {
            actions.extend(self.pump_send(now));
        }
        actions
    }

    /// Pushes frames while the write slot is free. PING outranks sessions.
    fn pump_send(&mut self, _now: MonotonicMillis) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.sending || self.state != ConnectionState::Connected {
            return actions;
        }
        if self.send_ping {
            actions.extend(self.send_ping_frame());
            return actions;
        }
        while let Some(ident) = self.enlisted_to_send.pop_front() {
            let Some(slot) = self.sessions.get_mut(&ident) else {
                continue;
            };
            let message = slot.session.next_message(&mut slot.store);
            if let Some(message) = message {
                match protocol::encode_client_message(&message, &self.config.limits) {
                    Ok(frame) => {
                        self.sending = true;
                        self.sending_session = Some(ident);
                        actions.push(ConnectionAction::SendFrame(frame));
                        break;
                    }
                    Err(err) => {
                        warn!(target: "connection", error = %err, "failed to encode outbound message");
                    }
                }
            }
            // Session chose not to send: the slot passes to the next.
        }
        actions
    }

    fn send_ping_frame(&mut self) -> Vec<ConnectionAction> {
        debug_assert!(self.waiting_for_pong);
        self.send_ping = false;
        if self.reconnect_info.scheduled_reset {
            self.ping_after_scheduled_reset = true;
        }
        self.last_ping_sent_at = MonotonicMillis::now();
        let message = ClientMessage::Ping(Ping {
            timestamp: self.last_ping_sent_at.0,
            rtt: self.previous_ping_rtt,
        });
        debug!(
            target: "connection",
            timestamp = self.last_ping_sent_at.0,
            rtt = self.previous_ping_rtt,
            "sending PING"
        );
        match protocol::encode_client_message(&message, &self.config.limits) {
            Ok(frame) => {
                self.sending = true;
                self.sending_session = None;
                self.ping_sent_this_connection = true;
                vec![ConnectionAction::SendFrame(frame)]
            }
            Err(err) => {
                warn!(target: "connection", error = %err, "failed to encode PING");
                Vec::new()
            }
        }
    }

    /// One inbound binary frame.
    pub fn handle_binary_message(
        &mut self,
        payload: &[u8],
        now: MonotonicMillis,
    ) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        let message = match protocol::decode_server_message(payload, &self.config.limits) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: "connection", error = %err, "malformed inbound message");
                return self.close_due_to_protocol_error(ClientErrorCode::BadSyntax, now);
            }
        };
        match message {
            ServerMessage::Pong(pong) => self.receive_pong(pong.timestamp, now),
            ServerMessage::Error(error) if error.session_ident == SessionIdent::CONNECTION => {
                self.receive_connection_error(error, now)
            }
            other => {
                let Some(ident) = other.session_ident() else {
                    return self.close_due_to_protocol_error(ClientErrorCode::BadSessionIdent, now);
                };
                let Some(slot) = self.sessions.get_mut(&ident) else {
                    warn!(target: "connection", session_ident = %ident, "message for unknown session");
                    return self
                        .close_due_to_protocol_error(ClientErrorCode::BadSessionIdent, now);
                };
                let was_download = matches!(other, ServerMessage::Download(_));
                let result = match other {
                    ServerMessage::Ident(message) => {
                        slot.session.receive_ident(message, &mut slot.store)
                    }
                    ServerMessage::Download(message) => {
                        slot.session.receive_download(message, &mut slot.store)
                    }
                    ServerMessage::Mark(message) => slot.session.receive_mark(message),
                    ServerMessage::Unbound(_) => slot.session.receive_unbound(),
                    ServerMessage::Error(message) => slot.session.receive_error(message),
                    ServerMessage::QueryError(message) => {
                        slot.session.receive_query_error(message)
                    }
                    ServerMessage::TestCommand(_) => Ok(Vec::new()),
                    ServerMessage::Pong(_) => unreachable!("handled above"),
                };
                match result {
                    Ok(effects) => {
                        if was_download {
                            // Progress from the server proves the link is
                            // useful again; the try-again schedule resets.
                            self.reconnect_info.clear_resumption_state();
                        }
                        let finalized =
                            effects.iter().any(|e| matches!(e, SessionEffect::Finalized));
                        let mut actions = self.apply_session_effects(ident, effects);
                        if finalized {
                            self.discard_session(ident);
                            actions.push(ConnectionAction::SessionDiscarded(ident));
                            actions.extend(self.check_linger(now));
                        }
                        actions.extend(self.pump_send(now));
                        actions
                    }
                    Err(code) => self.close_due_to_protocol_error(code, now),
                }
            }
        }
    }

    fn receive_pong(&mut self, timestamp: u64, now: MonotonicMillis) -> Vec<ConnectionAction> {
        let legal = self.waiting_for_pong && !self.send_ping;
        if !legal {
            return self.close_due_to_protocol_error(ClientErrorCode::BadMessageOrder, now);
        }
        if timestamp != self.last_ping_sent_at.0 {
            warn!(target: "connection", expected = self.last_ping_sent_at.0, got = timestamp, "bad timestamp in PONG");
            return self.close_due_to_protocol_error(ClientErrorCode::BadTimestamp, now);
        }
        self.previous_ping_rtt = now.saturating_sub(self.last_ping_sent_at);
        debug!(target: "connection", rtt_ms = self.previous_ping_rtt, "received PONG");

        if self.ping_after_scheduled_reset {
            // The link answered a PING sent after cancel_reconnect_delay():
            // the connection is good and the delay stays untouched.
            self.ping_after_scheduled_reset = false;
            self.reconnect_info.scheduled_reset = false;
        }

        self.waiting_for_pong = false;
        let mut actions = vec![ConnectionAction::CancelTimer(TimerKind::Pong)];
        actions.extend(self.initiate_ping_delay(now));
        actions
    }

    fn receive_connection_error(
        &mut self,
        error: protocol::ProtocolError,
        now: MonotonicMillis,
    ) -> Vec<ConnectionAction> {
        if crate::core::server_error::is_session_level(error.raw_error_code) {
            return self.close_due_to_protocol_error(ClientErrorCode::BadSessionIdent, now);
        }
        let mut info = SessionErrorInfo::new(error.raw_error_code, error.message, error.try_again)
            .with_action(error.action);
        info.unrecognized_by_client = !crate::core::server_error::is_known(error.raw_error_code);
        let reason = if !error.try_again {
            TerminationReason::ServerSaidDoNotReconnect
        } else if let Some(interval) = error.resumption_delay_interval_ms {
            let delay_info = ResumptionDelayInfo {
                resumption_delay_interval: Duration::from_millis(interval),
                resumption_delay_backoff_multiplier: error
                    .resumption_delay_backoff_multiplier
                    .unwrap_or(2),
                max_resumption_delay_interval: Duration::from_millis(
                    error.max_resumption_delay_interval_ms.unwrap_or(interval),
                ),
            };
            info.resumption_delay_info = Some(delay_info);
            self.reconnect_info.update_resumption_info(delay_info);
            TerminationReason::ServerSaidTryAgainLater
        } else {
            TerminationReason::ServerSaidTryAgainLater
        };
        info!(
            target: "connection",
            error_code = info.raw_error_code,
            try_again = info.try_again,
            "connection-level ERROR"
        );
        self.involuntary_disconnect(reason, Some(info), now)
    }

    /// The socket closed underneath us (or the connect attempt failed).
    pub fn handle_closed(
        &mut self,
        code: CloseCode,
        message: &str,
        now: MonotonicMillis,
    ) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        let classification = classify_close_code(code);
        let mut error = SessionErrorInfo::new(0, message, !classification.is_fatal);
        error.action = classification.action;
        self.involuntary_disconnect(classification.reason, Some(error), now)
    }

    fn close_due_to_protocol_error(
        &mut self,
        code: ClientErrorCode,
        now: MonotonicMillis,
    ) -> Vec<ConnectionAction> {
        warn!(target: "connection", code = %code, "sync protocol violation");
        let error = SessionErrorInfo::from_client_error(code);
        self.involuntary_disconnect(TerminationReason::SyncProtocolViolation, Some(error), now)
    }

    fn involuntary_disconnect(
        &mut self,
        reason: TerminationReason,
        error: Option<SessionErrorInfo>,
        now: MonotonicMillis,
    ) -> Vec<ConnectionAction> {
        self.reconnect_info.record_termination(reason, now);
        self.disconnect(error, now)
    }

    fn disconnect(
        &mut self,
        error: Option<SessionErrorInfo>,
        now: MonotonicMillis,
    ) -> Vec<ConnectionAction> {
        self.state = ConnectionState::Disconnected;
        self.disconnect_time = Some(now);
        self.sending = false;
        self.sending_session = None;
        self.send_ping = false;
        self.ping_delay_in_progress = false;
        self.waiting_for_pong = false;
        self.minimize_next_ping_delay = false;
        self.ping_after_scheduled_reset = false;
        self.enlisted_to_send.clear();

        let mut actions = vec![
            ConnectionAction::CancelTimer(TimerKind::ConnectWatchdog),
            ConnectionAction::CancelTimer(TimerKind::Ping),
            ConnectionAction::CancelTimer(TimerKind::Pong),
            ConnectionAction::CloseSocket,
            ConnectionAction::StateChanged(ConnectionState::Disconnected, error),
        ];
        if !self.sessions.is_empty() {
            actions.extend(self.initiate_reconnect_wait(now));
        }
        actions
    }

    /// Arms the linger timer when the last session is gone.
    fn check_linger(&mut self, _now: MonotonicMillis) -> Vec<ConnectionAction> {
        if !self.sessions.is_empty()
            || self.state == ConnectionState::Disconnected
            || self.disconnect_delay_in_progress
        {
            return Vec::new();
        }
        self.disconnect_delay_in_progress = true;
        vec![ConnectionAction::ArmTimer(
            TimerKind::Linger,
            self.config.connection_linger_time,
        )]
    }

    pub fn handle_linger_timer(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        if !self.disconnect_delay_in_progress {
            return Vec::new();
        }
        self.disconnect_delay_in_progress = false;
        if !self.sessions.is_empty() {
            return Vec::new();
        }
        debug!(target: "connection", endpoint = %self.config.endpoint, "voluntary disconnect after linger");
        self.involuntary_disconnect(TerminationReason::ClosedVoluntarily, None, now)
    }

    fn apply_session_effects(
        &mut self,
        ident: SessionIdent,
        effects: Vec<SessionEffect>,
    ) -> Vec<ConnectionAction> {
        let mut passthrough = Vec::new();
        for effect in effects {
            match effect {
                SessionEffect::RequestSendSlot => {
                    if !self.enlisted_to_send.contains(&ident) {
                        self.enlisted_to_send.push_back(ident);
                    }
                }
                other => passthrough.push(other),
            }
        }
        if passthrough.is_empty() {
            Vec::new()
        } else {
            vec![ConnectionAction::SessionEffects(ident, passthrough)]
        }
    }

    fn discard_session(&mut self, ident: SessionIdent) {
        self.sessions.remove(&ident);
        self.enlisted_to_send.retain(|other| *other != ident);
    }

    /// Drives queued frames after session effects were applied externally.
    pub fn continue_send(&mut self, now: MonotonicMillis) -> Vec<ConnectionAction> {
        self.pump_send(now)
    }

    /// Posts an enlist request for a session (used by the event loop when
    /// the application asks for uploads/marks outside of message handling).
    pub fn with_session<R>(
        &mut self,
        ident: SessionIdent,
        f: impl FnOnce(&mut Session, &mut S) -> R,
    ) -> Option<(R, Vec<ConnectionAction>)> {
        let slot = self.sessions.get_mut(&ident)?;
        let result = f(&mut slot.session, &mut slot.store);
        Some((result, Vec::new()))
    }

    /// Applies externally produced session effects (from `with_session`
    /// calls) and pumps the send queue.
    pub fn absorb_effects(
        &mut self,
        ident: SessionIdent,
        effects: Vec<SessionEffect>,
        now: MonotonicMillis,
    ) -> Vec<ConnectionAction> {
        let mut actions = self.apply_session_effects(ident, effects);
        actions.extend(self.pump_send(now));
        actions
    }
}
