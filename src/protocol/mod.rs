//! Wire protocol: message schemas, CBOR codec, version negotiation.

pub mod codec;
pub mod messages;
pub mod negotiate;

pub use codec::{
    decode_client_message, decode_server_message, encode_client_message, encode_server_message,
    DecodeError, EncodeError,
};
pub use messages::{
    Bind, ClientMessage, Download, DownloadBatchState, Ident, IdentFromServer, IdentQuery, Mark,
    MarkResponse, Ping, Pong, ProtocolError, Query, QueryError, ServerMessage, TestCommand,
    Unbind, Unbound, Upload, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
};
pub use negotiate::{advertised_protocols, parse_selected_protocol, NegotiateError, SyncFlavor};
