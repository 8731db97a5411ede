//! The network event loop.
//!
//! One dedicated thread owns every connection and session; nothing else
//! touches them. External callers interact by posting closures that run on
//! the loop and observe live state on arrival (a closure whose target has
//! been finalized sees `None` and no-ops). Timers, transport events, and
//! posted tasks are multiplexed with `crossbeam::select!`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::client::connection::{Connection, ConnectionAction, ConnectionState, TimerKind};
use crate::client::session::{Session, SessionEffect, SessionStore};
use crate::client::transport::{
    ConnectionId, TransportEvent, WebSocket, WebSocketFactory,
};
use crate::core::{CloseCode, MonotonicMillis, SessionErrorInfo, SessionIdent};

/// A closure posted to the loop from another thread.
pub type LoopTask<S> = Box<dyn FnOnce(&mut LoopState<S>) + Send>;

/// Receives session effects the loop cannot act on itself (completion
/// waits, subscription transitions, client reset, error delivery).
pub type EffectSink<S> =
    Box<dyn FnMut(&mut LoopState<S>, ConnectionId, SessionIdent, SessionEffect) + Send>;

/// Receives connection state transitions.
pub type StateListener = Box<dyn FnMut(ConnectionId, ConnectionState, Option<SessionErrorInfo>) + Send>;

pub struct LoopState<S: SessionStore> {
    connections: BTreeMap<ConnectionId, Connection<S>>,
    sockets: HashMap<ConnectionId, Box<dyn WebSocket>>,
    factory: Box<dyn WebSocketFactory>,
    timers: BTreeMap<(ConnectionId, TimerKind), MonotonicMillis>,
    event_tx: Sender<TransportEvent>,
    effect_sink: Option<EffectSink<S>>,
    state_listener: Option<StateListener>,
    next_connection_id: u64,
    stopping: bool,
}

impl<S: SessionStore> LoopState<S> {
    pub fn allocate_connection_id(&mut self) -> ConnectionId {
        self.next_connection_id += 1;
        ConnectionId(self.next_connection_id)
    }

    pub fn install_connection(
        &mut self,
        id: ConnectionId,
        connection: Connection<S>,
    ) {
        self.connections.insert(id, connection);
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn set_effect_sink(&mut self, sink: EffectSink<S>) {
        self.effect_sink = Some(sink);
    }

    pub fn set_state_listener(&mut self, listener: StateListener) {
        self.state_listener = Some(listener);
    }

    pub fn stop(&mut self) {
        self.stopping = true;
        for (_, socket) in self.sockets.iter_mut() {
            socket.close();
        }
        self.sockets.clear();
        self.timers.clear();
    }

    /// Runs a connection entry point and executes the produced actions.
    pub fn drive(
        &mut self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection<S>, MonotonicMillis) -> Vec<ConnectionAction>,
    ) {
        let now = MonotonicMillis::now();
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        let actions = f(connection, now);
        self.execute(id, actions);
    }

    /// Runs a session-level call and routes the resulting effects through
    /// the connection (enlist handling) and the effect sink.
    pub fn drive_session(
        &mut self,
        id: ConnectionId,
        ident: SessionIdent,
        f: impl FnOnce(&mut Session, &mut S) -> Vec<SessionEffect>,
    ) {
        let now = MonotonicMillis::now();
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        let Some((effects, _)) = connection.with_session(ident, f) else {
            return;
        };
        let actions = connection.absorb_effects(ident, effects, now);
        self.execute(id, actions);
    }

    fn execute(&mut self, id: ConnectionId, actions: Vec<ConnectionAction>) {
        let now = MonotonicMillis::now();
        for action in actions {
            match action {
                ConnectionAction::Connect(request) => {
                    let socket = self.factory.connect(id, request, self.event_tx.clone());
                    self.sockets.insert(id, socket);
                }
                ConnectionAction::SendFrame(frame) => {
                    let Some(socket) = self.sockets.get_mut(&id) else {
                        continue;
                    };
                    if let Err(err) = socket.send_binary(frame) {
                        warn!(target: "client", error = %err, "socket write failed");
                        let _ = self.event_tx.send(TransportEvent::Closed {
                            connection_id: id,
                            code: CloseCode::ReadWriteError,
                            message: err.to_string(),
                        });
                    }
                }
                ConnectionAction::CloseSocket => {
                    if let Some(mut socket) = self.sockets.remove(&id) {
                        socket.close();
                    }
                }
                ConnectionAction::ArmTimer(kind, delay) => {
                    let deadline = now.saturating_add_ms(delay.as_millis() as u64);
                    self.timers.insert((id, kind), deadline);
                }
                ConnectionAction::CancelTimer(kind) => {
                    self.timers.remove(&(id, kind));
                }
                ConnectionAction::StateChanged(state, error) => {
                    if let Some(listener) = self.state_listener.as_mut() {
                        listener(id, state, error);
                    }
                }
                ConnectionAction::SessionEffects(ident, effects) => {
                    if let Some(mut sink) = self.effect_sink.take() {
                        for effect in effects {
                            sink(self, id, ident, effect);
                        }
                        if self.effect_sink.is_none() {
                            self.effect_sink = Some(sink);
                        }
                    }
                }
                ConnectionAction::SessionDiscarded(ident) => {
                    debug!(target: "client", session_ident = %ident, "session discarded");
                }
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = MonotonicMillis::now();
        let due: Vec<(ConnectionId, TimerKind)> = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            self.timers.remove(&key);
            let (id, kind) = key;
            self.drive(id, |connection, now| match kind {
                TimerKind::Reconnect => connection.handle_reconnect_timer(now),
                TimerKind::ConnectWatchdog => connection.handle_connect_watchdog(now),
                TimerKind::Ping => connection.handle_ping_timer(now),
                TimerKind::Pong => connection.handle_pong_timer(now),
                TimerKind::Linger => connection.handle_linger_timer(now),
            });
        }
    }

    fn next_deadline(&self) -> Option<MonotonicMillis> {
        self.timers.values().min().copied()
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                connection_id,
                selected_protocol,
            } => self.drive(connection_id, |connection, now| {
                connection.handle_connected(selected_protocol.as_deref(), now)
            }),
            TransportEvent::BinaryMessage {
                connection_id,
                payload,
            } => self.drive(connection_id, |connection, now| {
                connection.handle_binary_message(&payload, now)
            }),
            TransportEvent::WriteCompleted { connection_id } => {
                self.drive(connection_id, |connection, now| {
                    connection.handle_write_completed(now)
                })
            }
            TransportEvent::Closed {
                connection_id,
                code,
                message,
            } => self.drive(connection_id, |connection, now| {
                connection.handle_closed(code, &message, now)
            }),
        }
    }
}

/// Handle to a running event loop.
pub struct EventLoop<S: SessionStore> {
    task_tx: Sender<LoopTask<S>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl<S: SessionStore + Send + 'static> EventLoop<S> {
    pub fn spawn(factory: Box<dyn WebSocketFactory>) -> Self {
        let (task_tx, task_rx) = unbounded::<LoopTask<S>>();
        let (event_tx, event_rx) = unbounded::<TransportEvent>();
        let handle = std::thread::Builder::new()
            .name("driftwire-event-loop".into())
            .spawn(move || run_loop(factory, task_rx, event_tx, event_rx))
            .expect("spawn event loop");
        Self {
            task_tx,
            handle: Some(handle),
        }
    }

    /// Posts a closure to run on the loop thread.
    pub fn post(&self, task: impl FnOnce(&mut LoopState<S>) + Send + 'static) {
        let _ = self.task_tx.send(Box::new(task));
    }

    /// A raw task sender for subsystems that outlive a borrow of the loop
    /// handle (commit listeners, timers owned elsewhere).
    pub fn task_sender(&self) -> Sender<LoopTask<S>> {
        self.task_tx.clone()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.task_tx.send(Box::new(|state: &mut LoopState<S>| {
            state.stop();
        }));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<S: SessionStore> Drop for EventLoop<S> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.task_tx.send(Box::new(|state: &mut LoopState<S>| {
                state.stopping = true;
            }));
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn run_loop<S: SessionStore>(
    factory: Box<dyn WebSocketFactory>,
    task_rx: Receiver<LoopTask<S>>,
    event_tx: Sender<TransportEvent>,
    event_rx: Receiver<TransportEvent>,
) {
    let mut state = LoopState {
        connections: BTreeMap::new(),
        sockets: HashMap::new(),
        factory,
        timers: BTreeMap::new(),
        event_tx,
        effect_sink: None,
        state_listener: None,
        next_connection_id: 0,
        stopping: false,
    };

    while !state.stopping {
        let now = MonotonicMillis::now();
        let timeout = state
            .next_deadline()
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(now)))
            .unwrap_or(Duration::from_millis(250));

        crossbeam::select! {
            recv(task_rx) -> task => {
                match task {
                    Ok(task) => task(&mut state),
                    Err(_) => break,
                }
            }
            recv(event_rx) -> event => {
                if let Ok(event) = event {
                    state.handle_transport_event(event);
                }
            }
            default(timeout) => {}
        }

        state.fire_due_timers();
    }
    state.stop();
}
