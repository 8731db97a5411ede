//! The WebSocket seam.
//!
//! The real TLS/WebSocket stack lives outside this crate. The engine sees
//! a factory that starts connection attempts and a handle that writes
//! binary frames; everything inbound arrives as [`TransportEvent`]s on the
//! event loop's channel. [`MockTransport`] is the scripted implementation
//! used by tests: it records outbound frames and lets the test play the
//! server side.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::core::{CloseCode, ServerEndpoint};

/// Identifies one connection slot within the event loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket is closed")]
    Closed,
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Everything needed to start one WebSocket connection attempt.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub endpoint: ServerEndpoint,
    pub path: String,
    /// Sub-protocol tokens, newest protocol version first.
    pub protocols: Vec<String>,
}

/// Inbound transport activity, delivered to the event loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// The WebSocket handshake completed; the server selected a
    /// sub-protocol (or none, which the connection treats as fatal).
    Connected {
        connection_id: ConnectionId,
        selected_protocol: Option<String>,
    },
    /// One binary frame arrived.
    BinaryMessage {
        connection_id: ConnectionId,
        payload: Vec<u8>,
    },
    /// The previous `send_binary` completed and the next write may start.
    WriteCompleted { connection_id: ConnectionId },
    /// The socket closed or the connect attempt failed.
    Closed {
        connection_id: ConnectionId,
        code: CloseCode,
        message: String,
    },
}

/// A live WebSocket (or a connection attempt in progress).
pub trait WebSocket: Send {
    /// Queues one binary frame. Exactly one `WriteCompleted` event follows
    /// each successful call; writes are strictly ordered.
    fn send_binary(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Tears the socket down. No further events are delivered.
    fn close(&mut self);
}

/// Starts connection attempts. One factory serves the whole event loop.
pub trait WebSocketFactory: Send {
    fn connect(
        &mut self,
        connection_id: ConnectionId,
        request: ConnectRequest,
        events: Sender<TransportEvent>,
    ) -> Box<dyn WebSocket>;
}

/// State shared between a [`MockTransport`] and the handles it creates.
#[derive(Default)]
struct MockShared {
    /// Frames the client wrote, per connection attempt.
    sent_frames: VecDeque<Vec<u8>>,
    /// Connect requests observed, newest last.
    connects: Vec<ConnectRequest>,
    /// If set, `send_binary` fails with this error message.
    fail_writes: Option<String>,
    closed: bool,
    /// The live attempt's event channel, for the test to play the server.
    active: Option<(ConnectionId, Sender<TransportEvent>)>,
}

/// A scripted transport for tests: the test plays the server.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Mutex<MockShared>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(MockShared::default())),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.shared.lock().unwrap().connects.len()
    }

    pub fn last_connect(&self) -> Option<ConnectRequest> {
        self.shared.lock().unwrap().connects.last().cloned()
    }

    /// Next frame the client wrote, oldest first.
    pub fn take_frame(&self) -> Option<Vec<u8>> {
        self.shared.lock().unwrap().sent_frames.pop_front()
    }

    pub fn sent_frame_count(&self) -> usize {
        self.shared.lock().unwrap().sent_frames.len()
    }

    pub fn fail_writes(&self, message: &str) {
        self.shared.lock().unwrap().fail_writes = Some(message.to_string());
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().unwrap().closed
    }

    /// Server side: accept the pending attempt with the given sub-protocol.
    pub fn server_accept(&self, selected_protocol: Option<&str>) {
        let shared = self.shared.lock().unwrap();
        if let Some((connection_id, events)) = &shared.active {
            let _ = events.send(TransportEvent::Connected {
                connection_id: *connection_id,
                selected_protocol: selected_protocol.map(str::to_string),
            });
        }
    }

    /// Server side: deliver one binary frame to the client.
    pub fn server_send(&self, payload: Vec<u8>) {
        let shared = self.shared.lock().unwrap();
        if let Some((connection_id, events)) = &shared.active {
            let _ = events.send(TransportEvent::BinaryMessage {
                connection_id: *connection_id,
                payload,
            });
        }
    }

    /// Server side: close the socket with a close code.
    pub fn server_close(&self, code: CloseCode, message: &str) {
        let mut shared = self.shared.lock().unwrap();
        shared.closed = true;
        if let Some((connection_id, events)) = &shared.active {
            let _ = events.send(TransportEvent::Closed {
                connection_id: *connection_id,
                code,
                message: message.to_string(),
            });
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct MockSocket {
    connection_id: ConnectionId,
    shared: Arc<Mutex<MockShared>>,
    events: Sender<TransportEvent>,
}

impl WebSocket for MockSocket {
    fn send_binary(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut shared = self.shared.lock().unwrap();
        if shared.closed {
            return Err(TransportError::Closed);
        }
        if let Some(message) = &shared.fail_writes {
            return Err(TransportError::WriteFailed(message.clone()));
        }
        shared.sent_frames.push_back(frame);
        let _ = self.events.send(TransportEvent::WriteCompleted {
            connection_id: self.connection_id,
        });
        Ok(())
    }

    fn close(&mut self) {
        self.shared.lock().unwrap().closed = true;
    }
}

impl WebSocketFactory for MockTransport {
    fn connect(
        &mut self,
        connection_id: ConnectionId,
        request: ConnectRequest,
        events: Sender<TransportEvent>,
    ) -> Box<dyn WebSocket> {
        let mut shared = self.shared.lock().unwrap();
        shared.connects.push(request);
        shared.closed = false;
        shared.active = Some((connection_id, events.clone()));
        Box::new(MockSocket {
            connection_id,
            shared: Arc::clone(&self.shared),
            events,
        })
    }
}
