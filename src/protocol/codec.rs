//! CBOR encoding of protocol messages.
//!
//! Each WebSocket binary frame carries one envelope: a definite-length map
//! `{"type": <tag>, "body": <message map>}`. Decoding is bounded by
//! [`Limits`] and rejects indefinite-length items and trailing bytes; any
//! decode failure is a sync protocol violation at the connection layer.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{
    ClientVersion, DownloadCursor, Limits, QueryVersion, RemoteChangeset, RequestIdent,
    SaltedServerVersion, ServerRequestedAction, ServerVersion, SessionIdent, SyncProgress,
    UploadChangeset, UploadCursor,
};

use super::messages::{
    Bind, ClientMessage, Download, Ident, IdentFromServer, IdentQuery, Mark, MarkResponse, Ping,
    Pong, ProtocolError, Query, QueryError, ServerMessage, TestCommand, Unbind, Unbound, Upload,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    Bind,
    Ident,
    Upload,
    Query,
    Mark,
    Unbind,
    Ping,
    Download,
    Unbound,
    Pong,
    Error,
    QueryError,
    TestCommand,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Bind => "BIND",
            MessageType::Ident => "IDENT",
            MessageType::Upload => "UPLOAD",
            MessageType::Query => "QUERY",
            MessageType::Mark => "MARK",
            MessageType::Unbind => "UNBIND",
            MessageType::Ping => "PING",
            MessageType::Download => "DOWNLOAD",
            MessageType::Unbound => "UNBOUND",
            MessageType::Pong => "PONG",
            MessageType::Error => "ERROR",
            MessageType::QueryError => "QUERY_ERROR",
            MessageType::TestCommand => "TEST_COMMAND",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "BIND" => Some(MessageType::Bind),
            "IDENT" => Some(MessageType::Ident),
            "UPLOAD" => Some(MessageType::Upload),
            "QUERY" => Some(MessageType::Query),
            "MARK" => Some(MessageType::Mark),
            "UNBIND" => Some(MessageType::Unbind),
            "PING" => Some(MessageType::Ping),
            "DOWNLOAD" => Some(MessageType::Download),
            "UNBOUND" => Some(MessageType::Unbound),
            "PONG" => Some(MessageType::Pong),
            "ERROR" => Some(MessageType::Error),
            "QUERY_ERROR" => Some(MessageType::QueryError),
            "TEST_COMMAND" => Some(MessageType::TestCommand),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
    #[error("upload batch exceeds {max} changesets: {got}")]
    UploadBatchTooLarge { max: usize, got: usize },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

pub fn encode_client_message(message: &ClientMessage, limits: &Limits) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.str("type")?;
    enc.str(client_message_type(message).as_str())?;
    enc.str("body")?;
    match message {
        ClientMessage::Bind(msg) => encode_bind(&mut enc, msg)?,
        ClientMessage::Ident(msg) => encode_ident(&mut enc, msg)?,
        ClientMessage::Upload(msg) => encode_upload(&mut enc, msg, limits)?,
        ClientMessage::Query(msg) => encode_query(&mut enc, msg)?,
        ClientMessage::Mark(msg) => encode_mark(&mut enc, msg.session_ident, msg.request_ident)?,
        ClientMessage::Unbind(msg) => encode_session_only(&mut enc, msg.session_ident)?,
        ClientMessage::Ping(msg) => encode_ping(&mut enc, msg)?,
        ClientMessage::Error(msg) => encode_error(&mut enc, msg)?,
        ClientMessage::TestCommand(msg) => encode_test_command(&mut enc, msg)?,
    }
    Ok(buf)
}

pub fn encode_server_message(message: &ServerMessage, limits: &Limits) -> Result<Vec<u8>, EncodeError> {
    let _ = limits;
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.str("type")?;
    enc.str(server_message_type(message).as_str())?;
    enc.str("body")?;
    match message {
        ServerMessage::Ident(msg) => encode_ident_from_server(&mut enc, msg)?,
        ServerMessage::Download(msg) => encode_download(&mut enc, msg)?,
        ServerMessage::Mark(msg) => encode_mark(&mut enc, msg.session_ident, msg.request_ident)?,
        ServerMessage::Unbound(msg) => encode_session_only(&mut enc, msg.session_ident)?,
        ServerMessage::Pong(msg) => encode_pong(&mut enc, msg)?,
        ServerMessage::Error(msg) => encode_error(&mut enc, msg)?,
        ServerMessage::QueryError(msg) => encode_query_error(&mut enc, msg)?,
        ServerMessage::TestCommand(msg) => encode_test_command(&mut enc, msg)?,
    }
    Ok(buf)
}

pub fn decode_server_message(bytes: &[u8], limits: &Limits) -> Result<ServerMessage, DecodeError> {
    let (message_type, body) = decode_envelope(bytes, limits)?;
    let mut dec = Decoder::new(body);
    let message = match message_type {
        MessageType::Ident => ServerMessage::Ident(decode_ident_from_server(&mut dec, limits)?),
        MessageType::Download => ServerMessage::Download(decode_download(&mut dec, limits)?),
        MessageType::Mark => {
            let (session_ident, request_ident) = decode_mark(&mut dec, limits)?;
            ServerMessage::Mark(MarkResponse {
                session_ident,
                request_ident,
            })
        }
        MessageType::Unbound => ServerMessage::Unbound(Unbound {
            session_ident: decode_session_only(&mut dec, limits)?,
        }),
        MessageType::Pong => ServerMessage::Pong(decode_pong(&mut dec, limits)?),
        MessageType::Error => ServerMessage::Error(decode_error(&mut dec, limits)?),
        MessageType::QueryError => ServerMessage::QueryError(decode_query_error(&mut dec, limits)?),
        MessageType::TestCommand => {
            ServerMessage::TestCommand(decode_test_command(&mut dec, limits)?)
        }
        other => return Err(DecodeError::UnknownMessageType(other.as_str().to_string())),
    };
    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(message)
}

pub fn decode_client_message(bytes: &[u8], limits: &Limits) -> Result<ClientMessage, DecodeError> {
    let (message_type, body) = decode_envelope(bytes, limits)?;
    let mut dec = Decoder::new(body);
    let message = match message_type {
        MessageType::Bind => ClientMessage::Bind(decode_bind(&mut dec, limits)?),
        MessageType::Ident => ClientMessage::Ident(decode_ident(&mut dec, limits)?),
        MessageType::Upload => ClientMessage::Upload(decode_upload(&mut dec, limits)?),
        MessageType::Query => ClientMessage::Query(decode_query(&mut dec, limits)?),
        MessageType::Mark => {
            let (session_ident, request_ident) = decode_mark(&mut dec, limits)?;
            ClientMessage::Mark(Mark {
                session_ident,
                request_ident,
            })
        }
        MessageType::Unbind => ClientMessage::Unbind(Unbind {
            session_ident: decode_session_only(&mut dec, limits)?,
        }),
        MessageType::Ping => ClientMessage::Ping(decode_ping(&mut dec, limits)?),
        MessageType::Error => ClientMessage::Error(decode_error(&mut dec, limits)?),
        MessageType::TestCommand => {
            ClientMessage::TestCommand(decode_test_command(&mut dec, limits)?)
        }
        other => return Err(DecodeError::UnknownMessageType(other.as_str().to_string())),
    };
    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(message)
}

fn client_message_type(message: &ClientMessage) -> MessageType {
    match message {
        ClientMessage::Bind(_) => MessageType::Bind,
        ClientMessage::Ident(_) => MessageType::Ident,
        ClientMessage::Upload(_) => MessageType::Upload,
        ClientMessage::Query(_) => MessageType::Query,
        ClientMessage::Mark(_) => MessageType::Mark,
        ClientMessage::Unbind(_) => MessageType::Unbind,
        ClientMessage::Ping(_) => MessageType::Ping,
        ClientMessage::Error(_) => MessageType::Error,
        ClientMessage::TestCommand(_) => MessageType::TestCommand,
    }
}

fn server_message_type(message: &ServerMessage) -> MessageType {
    match message {
        ServerMessage::Ident(_) => MessageType::Ident,
        ServerMessage::Download(_) => MessageType::Download,
        ServerMessage::Mark(_) => MessageType::Mark,
        ServerMessage::Unbound(_) => MessageType::Unbound,
        ServerMessage::Pong(_) => MessageType::Pong,
        ServerMessage::Error(_) => MessageType::Error,
        ServerMessage::QueryError(_) => MessageType::QueryError,
        ServerMessage::TestCommand(_) => MessageType::TestCommand,
    }
}

fn decode_envelope<'a>(
    bytes: &'a [u8],
    limits: &Limits,
) -> Result<(MessageType, &'a [u8]), DecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits, 0)?;

    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "type" => {
                let raw = decode_text(&mut dec, limits)?;
                message_type = Some(
                    MessageType::parse(raw)
                        .ok_or_else(|| DecodeError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                let end = dec.position();
                body_span = Some((start, end));
            }
            _ => {
                if is_indefinite(&dec)? {
                    return Err(DecodeError::IndefiniteLength);
                }
                dec.skip()?;
            }
        }
    }

    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }

    let message_type = message_type.ok_or(DecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(DecodeError::MissingField("body"))?;
    Ok((message_type, &bytes[start..end]))
}

fn encode_bind(enc: &mut Encoder<&mut Vec<u8>>, msg: &Bind) -> Result<(), EncodeError> {
    enc.map(5)?;
    enc.str("session_ident")?;
    enc.u64(msg.session_ident.get())?;
    enc.str("path")?;
    enc.str(&msg.path)?;
    enc.str("need_client_file_ident")?;
    enc.bool(msg.need_client_file_ident)?;
    enc.str("is_subserver")?;
    enc.bool(msg.is_subserver)?;
    enc.str("signed_user_token")?;
    enc.str(&msg.signed_user_token)?;
    Ok(())
}

fn decode_bind(dec: &mut Decoder, limits: &Limits) -> Result<Bind, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    let mut path = None;
    let mut need_client_file_ident = None;
    let mut is_subserver = None;
    let mut signed_user_token = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            "path" => path = Some(decode_text(dec, limits)?.to_string()),
            "need_client_file_ident" => need_client_file_ident = Some(dec.bool()?),
            "is_subserver" => is_subserver = Some(dec.bool()?),
            "signed_user_token" => signed_user_token = Some(decode_text(dec, limits)?.to_string()),
            _ => dec.skip()?,
        }
    }
    Ok(Bind {
        session_ident: session_ident.ok_or(DecodeError::MissingField("session_ident"))?,
        path: path.ok_or(DecodeError::MissingField("path"))?,
        need_client_file_ident: need_client_file_ident
            .ok_or(DecodeError::MissingField("need_client_file_ident"))?,
        is_subserver: is_subserver.unwrap_or(false),
        signed_user_token: signed_user_token
            .ok_or(DecodeError::MissingField("signed_user_token"))?,
    })
}

fn encode_ident_from_server(
    enc: &mut Encoder<&mut Vec<u8>>,
    msg: &IdentFromServer,
) -> Result<(), EncodeError> {
    enc.map(3)?;
    enc.str("session_ident")?;
    enc.u64(msg.session_ident.get())?;
    enc.str("client_file_ident")?;
    enc.u64(msg.client_file_ident)?;
    enc.str("client_file_ident_salt")?;
    enc.i64(msg.client_file_ident_salt)?;
    Ok(())
}

fn decode_ident_from_server(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<IdentFromServer, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    let mut client_file_ident = None;
    let mut salt = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            "client_file_ident" => client_file_ident = Some(dec.u64()?),
            "client_file_ident_salt" => salt = Some(dec.i64()?),
            _ => dec.skip()?,
        }
    }
    Ok(IdentFromServer {
        session_ident: session_ident.ok_or(DecodeError::MissingField("session_ident"))?,
        client_file_ident: client_file_ident
            .ok_or(DecodeError::MissingField("client_file_ident"))?,
        client_file_ident_salt: salt.ok_or(DecodeError::MissingField("client_file_ident_salt"))?,
    })
}

fn encode_ident(enc: &mut Encoder<&mut Vec<u8>>, msg: &Ident) -> Result<(), EncodeError> {
    let len = if msg.query.is_some() { 8 } else { 7 };
    enc.map(len)?;
    enc.str("session_ident")?;
    enc.u64(msg.session_ident.get())?;
    enc.str("client_file_ident")?;
    enc.u64(msg.client_file_ident)?;
    enc.str("client_file_ident_salt")?;
    enc.i64(msg.client_file_ident_salt)?;
    enc.str("scan_server_version")?;
    enc.u64(msg.scan_server_version.get())?;
    enc.str("scan_client_version")?;
    enc.u64(msg.scan_client_version.get())?;
    enc.str("latest_server_version")?;
    enc.u64(msg.latest_server_version.version.get())?;
    enc.str("latest_server_version_salt")?;
    enc.i64(msg.latest_server_version.salt)?;
    if let Some(query) = &msg.query {
        enc.str("query")?;
        enc.map(2)?;
        enc.str("query_version")?;
        enc.i64(query.query_version.get())?;
        enc.str("query_body")?;
        enc.str(&query.query_body)?;
    }
    Ok(())
}

fn decode_ident(dec: &mut Decoder, limits: &Limits) -> Result<Ident, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    let mut client_file_ident = None;
    let mut salt = None;
    let mut scan_server_version = None;
    let mut scan_client_version = None;
    let mut latest_server_version = None;
    let mut latest_salt = None;
    let mut query = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            "client_file_ident" => client_file_ident = Some(dec.u64()?),
            "client_file_ident_salt" => salt = Some(dec.i64()?),
            "scan_server_version" => {
                scan_server_version = Some(ServerVersion::new(dec.u64()?))
            }
            "scan_client_version" => {
                scan_client_version = Some(ClientVersion::new(dec.u64()?))
            }
            "latest_server_version" => {
                latest_server_version = Some(ServerVersion::new(dec.u64()?))
            }
            "latest_server_version_salt" => latest_salt = Some(dec.i64()?),
            "query" => {
                let inner_len = decode_map_len(dec, limits, 2)?;
                let mut query_version = None;
                let mut query_body = None;
                for _ in 0..inner_len {
                    let inner_key = decode_text(dec, limits)?;
                    match inner_key {
                        "query_version" => query_version = Some(QueryVersion::new(dec.i64()?)),
                        "query_body" => {
                            query_body = Some(decode_text(dec, limits)?.to_string())
                        }
                        _ => dec.skip()?,
                    }
                }
                query = Some(IdentQuery {
                    query_version: query_version
                        .ok_or(DecodeError::MissingField("query_version"))?,
                    query_body: query_body.ok_or(DecodeError::MissingField("query_body"))?,
                });
            }
            _ => dec.skip()?,
        }
    }
    Ok(Ident {
        session_ident: session_ident.ok_or(DecodeError::MissingField("session_ident"))?,
        client_file_ident: client_file_ident
            .ok_or(DecodeError::MissingField("client_file_ident"))?,
        client_file_ident_salt: salt.ok_or(DecodeError::MissingField("client_file_ident_salt"))?,
        scan_server_version: scan_server_version
            .ok_or(DecodeError::MissingField("scan_server_version"))?,
        scan_client_version: scan_client_version
            .ok_or(DecodeError::MissingField("scan_client_version"))?,
        latest_server_version: SaltedServerVersion::new(
            latest_server_version.ok_or(DecodeError::MissingField("latest_server_version"))?,
            latest_salt.ok_or(DecodeError::MissingField("latest_server_version_salt"))?,
        ),
        query,
    })
}

fn encode_upload(
    enc: &mut Encoder<&mut Vec<u8>>,
    msg: &Upload,
    limits: &Limits,
) -> Result<(), EncodeError> {
    if msg.changesets.len() > limits.max_changesets_per_upload {
        return Err(EncodeError::UploadBatchTooLarge {
            max: limits.max_changesets_per_upload,
            got: msg.changesets.len(),
        });
    }
    enc.map(5)?;
    enc.str("session_ident")?;
    enc.u64(msg.session_ident.get())?;
    enc.str("progress_client_version")?;
    enc.u64(msg.progress_client_version.get())?;
    enc.str("progress_server_version")?;
    enc.u64(msg.progress_server_version.get())?;
    enc.str("locked_server_version")?;
    enc.u64(msg.locked_server_version.get())?;
    enc.str("changesets")?;
    enc.array(msg.changesets.len() as u64)?;
    for changeset in &msg.changesets {
        enc.map(5)?;
        enc.str("client_version")?;
        enc.u64(changeset.client_version.get())?;
        enc.str("last_integrated_server_version")?;
        enc.u64(changeset.last_integrated_server_version.get())?;
        enc.str("origin_timestamp")?;
        enc.u64(changeset.origin_timestamp)?;
        enc.str("origin_file_ident")?;
        enc.u64(changeset.origin_file_ident)?;
        enc.str("payload")?;
        enc.bytes(&changeset.payload)?;
    }
    Ok(())
}

fn decode_upload(dec: &mut Decoder, limits: &Limits) -> Result<Upload, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    let mut progress_client_version = None;
    let mut progress_server_version = None;
    let mut locked_server_version = None;
    let mut changesets = Vec::new();
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            "progress_client_version" => {
                progress_client_version = Some(ClientVersion::new(dec.u64()?))
            }
            "progress_server_version" => {
                progress_server_version = Some(ServerVersion::new(dec.u64()?))
            }
            "locked_server_version" => {
                locked_server_version = Some(ServerVersion::new(dec.u64()?))
            }
            "changesets" => {
                let count = decode_array_len(dec, limits, 2)?;
                if count > limits.max_changesets_per_upload {
                    return Err(DecodeError::DecodeLimit("max_changesets_per_upload"));
                }
                for _ in 0..count {
                    changesets.push(decode_upload_changeset(dec, limits)?);
                }
            }
            _ => dec.skip()?,
        }
    }
    Ok(Upload {
        session_ident: session_ident.ok_or(DecodeError::MissingField("session_ident"))?,
        progress_client_version: progress_client_version
            .ok_or(DecodeError::MissingField("progress_client_version"))?,
        progress_server_version: progress_server_version
            .ok_or(DecodeError::MissingField("progress_server_version"))?,
        locked_server_version: locked_server_version
            .ok_or(DecodeError::MissingField("locked_server_version"))?,
        changesets,
    })
}

fn decode_upload_changeset(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<UploadChangeset, DecodeError> {
    let map_len = decode_map_len(dec, limits, 3)?;
    let mut client_version = None;
    let mut last_integrated_server_version = None;
    let mut origin_timestamp = None;
    let mut origin_file_ident = None;
    let mut payload = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "client_version" => client_version = Some(ClientVersion::new(dec.u64()?)),
            "last_integrated_server_version" => {
                last_integrated_server_version = Some(ServerVersion::new(dec.u64()?))
            }
            "origin_timestamp" => origin_timestamp = Some(dec.u64()?),
            "origin_file_ident" => origin_file_ident = Some(dec.u64()?),
            "payload" => payload = Some(Bytes::copy_from_slice(decode_bytes(dec, limits)?)),
            _ => dec.skip()?,
        }
    }
    Ok(UploadChangeset {
        client_version: client_version.ok_or(DecodeError::MissingField("client_version"))?,
        last_integrated_server_version: last_integrated_server_version
            .ok_or(DecodeError::MissingField("last_integrated_server_version"))?,
        origin_timestamp: origin_timestamp.ok_or(DecodeError::MissingField("origin_timestamp"))?,
        origin_file_ident: origin_file_ident
            .ok_or(DecodeError::MissingField("origin_file_ident"))?,
        payload: payload.ok_or(DecodeError::MissingField("payload"))?,
    })
}

fn encode_query(enc: &mut Encoder<&mut Vec<u8>>, msg: &Query) -> Result<(), EncodeError> {
    enc.map(3)?;
    enc.str("session_ident")?;
    enc.u64(msg.session_ident.get())?;
    enc.str("query_version")?;
    enc.i64(msg.query_version.get())?;
    enc.str("query_body")?;
    enc.str(&msg.query_body)?;
    Ok(())
}

fn decode_query(dec: &mut Decoder, limits: &Limits) -> Result<Query, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    let mut query_version = None;
    let mut query_body = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            "query_version" => query_version = Some(QueryVersion::new(dec.i64()?)),
            "query_body" => query_body = Some(decode_text(dec, limits)?.to_string()),
            _ => dec.skip()?,
        }
    }
    Ok(Query {
        session_ident: session_ident.ok_or(DecodeError::MissingField("session_ident"))?,
        query_version: query_version.ok_or(DecodeError::MissingField("query_version"))?,
        query_body: query_body.ok_or(DecodeError::MissingField("query_body"))?,
    })
}

fn encode_mark(
    enc: &mut Encoder<&mut Vec<u8>>,
    session_ident: SessionIdent,
    request_ident: RequestIdent,
) -> Result<(), EncodeError> {
    enc.map(2)?;
    enc.str("session_ident")?;
    enc.u64(session_ident.get())?;
    enc.str("request_ident")?;
    enc.u64(request_ident.get())?;
    Ok(())
}

fn decode_mark(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<(SessionIdent, RequestIdent), DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    let mut request_ident = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            "request_ident" => request_ident = Some(RequestIdent::new(dec.u64()?)),
            _ => dec.skip()?,
        }
    }
    Ok((
        session_ident.ok_or(DecodeError::MissingField("session_ident"))?,
        request_ident.ok_or(DecodeError::MissingField("request_ident"))?,
    ))
}

fn encode_session_only(
    enc: &mut Encoder<&mut Vec<u8>>,
    session_ident: SessionIdent,
) -> Result<(), EncodeError> {
    enc.map(1)?;
    enc.str("session_ident")?;
    enc.u64(session_ident.get())?;
    Ok(())
}

fn decode_session_only(dec: &mut Decoder, limits: &Limits) -> Result<SessionIdent, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            _ => dec.skip()?,
        }
    }
    session_ident.ok_or(DecodeError::MissingField("session_ident"))
}

fn encode_ping(enc: &mut Encoder<&mut Vec<u8>>, msg: &Ping) -> Result<(), EncodeError> {
    enc.map(2)?;
    enc.str("timestamp")?;
    enc.u64(msg.timestamp)?;
    enc.str("rtt")?;
    enc.u64(msg.rtt)?;
    Ok(())
}

fn decode_ping(dec: &mut Decoder, limits: &Limits) -> Result<Ping, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut timestamp = None;
    let mut rtt = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "timestamp" => timestamp = Some(dec.u64()?),
            "rtt" => rtt = Some(dec.u64()?),
            _ => dec.skip()?,
        }
    }
    Ok(Ping {
        timestamp: timestamp.ok_or(DecodeError::MissingField("timestamp"))?,
        rtt: rtt.ok_or(DecodeError::MissingField("rtt"))?,
    })
}

fn encode_pong(enc: &mut Encoder<&mut Vec<u8>>, msg: &Pong) -> Result<(), EncodeError> {
    enc.map(1)?;
    enc.str("timestamp")?;
    enc.u64(msg.timestamp)?;
    Ok(())
}

fn decode_pong(dec: &mut Decoder, limits: &Limits) -> Result<Pong, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut timestamp = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "timestamp" => timestamp = Some(dec.u64()?),
            _ => dec.skip()?,
        }
    }
    Ok(Pong {
        timestamp: timestamp.ok_or(DecodeError::MissingField("timestamp"))?,
    })
}

fn encode_download(enc: &mut Encoder<&mut Vec<u8>>, msg: &Download) -> Result<(), EncodeError> {
    enc.map(11)?;
    enc.str("session_ident")?;
    enc.u64(msg.session_ident.get())?;
    enc.str("download_server_version")?;
    enc.u64(msg.progress.download.server_version.get())?;
    enc.str("download_client_version")?;
    enc.u64(msg.progress.download.last_integrated_client_version.get())?;
    enc.str("upload_client_version")?;
    enc.u64(msg.progress.upload.client_version.get())?;
    enc.str("upload_server_version")?;
    enc.u64(msg.progress.upload.last_integrated_server_version.get())?;
    enc.str("latest_server_version")?;
    enc.u64(msg.progress.latest_server_version.version.get())?;
    enc.str("latest_server_version_salt")?;
    enc.i64(msg.progress.latest_server_version.salt)?;
    enc.str("downloadable_bytes")?;
    enc.u64(msg.downloadable_bytes)?;
    enc.str("query_version")?;
    enc.i64(msg.query_version.get())?;
    enc.str("last_in_batch")?;
    enc.bool(msg.last_in_batch)?;
    enc.str("changesets")?;
    enc.array(msg.changesets.len() as u64)?;
    for changeset in &msg.changesets {
        enc.map(5)?;
        enc.str("server_version")?;
        enc.u64(changeset.remote_version.get())?;
        enc.str("last_integrated_client_version")?;
        enc.u64(changeset.last_integrated_local_version.get())?;
        enc.str("origin_file_ident")?;
        enc.u64(changeset.origin_file_ident)?;
        enc.str("origin_timestamp")?;
        enc.u64(changeset.origin_timestamp)?;
        enc.str("payload")?;
        enc.bytes(&changeset.payload)?;
    }
    Ok(())
}

fn decode_download(dec: &mut Decoder, limits: &Limits) -> Result<Download, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    let mut download_server_version = None;
    let mut download_client_version = None;
    let mut upload_client_version = None;
    let mut upload_server_version = None;
    let mut latest_server_version = None;
    let mut latest_salt = None;
    let mut downloadable_bytes = None;
    let mut query_version = None;
    let mut last_in_batch = None;
    let mut changesets = Vec::new();
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            "download_server_version" => {
                download_server_version = Some(ServerVersion::new(dec.u64()?))
            }
            "download_client_version" => {
                download_client_version = Some(ClientVersion::new(dec.u64()?))
            }
            "upload_client_version" => {
                upload_client_version = Some(ClientVersion::new(dec.u64()?))
            }
            "upload_server_version" => {
                upload_server_version = Some(ServerVersion::new(dec.u64()?))
            }
            "latest_server_version" => {
                latest_server_version = Some(ServerVersion::new(dec.u64()?))
            }
            "latest_server_version_salt" => latest_salt = Some(dec.i64()?),
            "downloadable_bytes" => downloadable_bytes = Some(dec.u64()?),
            "query_version" => query_version = Some(QueryVersion::new(dec.i64()?)),
            "last_in_batch" => last_in_batch = Some(dec.bool()?),
            "changesets" => {
                let count = decode_array_len(dec, limits, 2)?;
                if count > limits.max_changesets_per_download {
                    return Err(DecodeError::DecodeLimit("max_changesets_per_download"));
                }
                for _ in 0..count {
                    changesets.push(decode_remote_changeset(dec, limits)?);
                }
            }
            _ => dec.skip()?,
        }
    }
    Ok(Download {
        session_ident: session_ident.ok_or(DecodeError::MissingField("session_ident"))?,
        progress: SyncProgress {
            download: DownloadCursor {
                server_version: download_server_version
                    .ok_or(DecodeError::MissingField("download_server_version"))?,
                last_integrated_client_version: download_client_version
                    .ok_or(DecodeError::MissingField("download_client_version"))?,
            },
            upload: UploadCursor {
                client_version: upload_client_version
                    .ok_or(DecodeError::MissingField("upload_client_version"))?,
                last_integrated_server_version: upload_server_version
                    .ok_or(DecodeError::MissingField("upload_server_version"))?,
            },
            latest_server_version: SaltedServerVersion::new(
                latest_server_version
                    .ok_or(DecodeError::MissingField("latest_server_version"))?,
                latest_salt.ok_or(DecodeError::MissingField("latest_server_version_salt"))?,
            ),
        },
        downloadable_bytes: downloadable_bytes
            .ok_or(DecodeError::MissingField("downloadable_bytes"))?,
        query_version: query_version.unwrap_or(QueryVersion::ZERO),
        last_in_batch: last_in_batch.unwrap_or(true),
        changesets,
    })
}

fn decode_remote_changeset(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<RemoteChangeset, DecodeError> {
    let map_len = decode_map_len(dec, limits, 3)?;
    let mut server_version = None;
    let mut last_integrated_client_version = None;
    let mut origin_file_ident = None;
    let mut origin_timestamp = None;
    let mut payload = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "server_version" => server_version = Some(ServerVersion::new(dec.u64()?)),
            "last_integrated_client_version" => {
                last_integrated_client_version = Some(ClientVersion::new(dec.u64()?))
            }
            "origin_file_ident" => origin_file_ident = Some(dec.u64()?),
            "origin_timestamp" => origin_timestamp = Some(dec.u64()?),
            "payload" => payload = Some(Bytes::copy_from_slice(decode_bytes(dec, limits)?)),
            _ => dec.skip()?,
        }
    }
    Ok(RemoteChangeset {
        remote_version: server_version.ok_or(DecodeError::MissingField("server_version"))?,
        last_integrated_local_version: last_integrated_client_version
            .ok_or(DecodeError::MissingField("last_integrated_client_version"))?,
        origin_file_ident: origin_file_ident
            .ok_or(DecodeError::MissingField("origin_file_ident"))?,
        origin_timestamp: origin_timestamp.ok_or(DecodeError::MissingField("origin_timestamp"))?,
        payload: payload.ok_or(DecodeError::MissingField("payload"))?,
    })
}

fn encode_error(enc: &mut Encoder<&mut Vec<u8>>, msg: &ProtocolError) -> Result<(), EncodeError> {
    let mut len = 5;
    if msg.resumption_delay_interval_ms.is_some() {
        len += 3;
    }
    if msg.compensating_write_server_version.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("session_ident")?;
    enc.u64(msg.session_ident.get())?;
    enc.str("error_code")?;
    enc.i32(msg.raw_error_code)?;
    enc.str("message")?;
    enc.str(&msg.message)?;
    enc.str("try_again")?;
    enc.bool(msg.try_again)?;
    enc.str("action")?;
    enc.str(action_as_str(msg.action))?;
    if let Some(interval) = msg.resumption_delay_interval_ms {
        enc.str("resumption_delay_interval")?;
        enc.u64(interval)?;
        enc.str("resumption_delay_backoff_multiplier")?;
        enc.u32(msg.resumption_delay_backoff_multiplier.unwrap_or(2))?;
        enc.str("max_resumption_delay_interval")?;
        enc.u64(msg.max_resumption_delay_interval_ms.unwrap_or(interval))?;
    }
    if let Some(version) = msg.compensating_write_server_version {
        enc.str("compensating_write_server_version")?;
        enc.u64(version)?;
    }
    Ok(())
}

fn decode_error(dec: &mut Decoder, limits: &Limits) -> Result<ProtocolError, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    let mut error_code = None;
    let mut message = None;
    let mut try_again = None;
    let mut action = None;
    let mut resumption_delay_interval_ms = None;
    let mut resumption_delay_backoff_multiplier = None;
    let mut max_resumption_delay_interval_ms = None;
    let mut compensating_write_server_version = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            "error_code" => error_code = Some(dec.i32()?),
            "message" => message = Some(decode_text(dec, limits)?.to_string()),
            "try_again" => try_again = Some(dec.bool()?),
            "action" => {
                let raw = decode_text(dec, limits)?;
                action = Some(parse_action(raw).ok_or_else(|| DecodeError::InvalidField {
                    field: "action",
                    reason: format!("unknown action {raw}"),
                })?);
            }
            "resumption_delay_interval" => resumption_delay_interval_ms = Some(dec.u64()?),
            "resumption_delay_backoff_multiplier" => {
                resumption_delay_backoff_multiplier = Some(dec.u32()?)
            }
            "max_resumption_delay_interval" => {
                max_resumption_delay_interval_ms = Some(dec.u64()?)
            }
            "compensating_write_server_version" => {
                compensating_write_server_version = Some(dec.u64()?)
            }
            _ => dec.skip()?,
        }
    }
    Ok(ProtocolError {
        session_ident: session_ident.ok_or(DecodeError::MissingField("session_ident"))?,
        raw_error_code: error_code.ok_or(DecodeError::MissingField("error_code"))?,
        message: message.ok_or(DecodeError::MissingField("message"))?,
        try_again: try_again.ok_or(DecodeError::MissingField("try_again"))?,
        action: action.unwrap_or_default(),
        resumption_delay_interval_ms,
        resumption_delay_backoff_multiplier,
        max_resumption_delay_interval_ms,
        compensating_write_server_version,
    })
}

fn encode_query_error(
    enc: &mut Encoder<&mut Vec<u8>>,
    msg: &QueryError,
) -> Result<(), EncodeError> {
    enc.map(4)?;
    enc.str("session_ident")?;
    enc.u64(msg.session_ident.get())?;
    enc.str("error_code")?;
    enc.i32(msg.raw_error_code)?;
    enc.str("message")?;
    enc.str(&msg.message)?;
    enc.str("query_version")?;
    enc.i64(msg.query_version.get())?;
    Ok(())
}

fn decode_query_error(dec: &mut Decoder, limits: &Limits) -> Result<QueryError, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    let mut error_code = None;
    let mut message = None;
    let mut query_version = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            "error_code" => error_code = Some(dec.i32()?),
            "message" => message = Some(decode_text(dec, limits)?.to_string()),
            "query_version" => query_version = Some(QueryVersion::new(dec.i64()?)),
            _ => dec.skip()?,
        }
    }
    Ok(QueryError {
        session_ident: session_ident.ok_or(DecodeError::MissingField("session_ident"))?,
        raw_error_code: error_code.ok_or(DecodeError::MissingField("error_code"))?,
        message: message.ok_or(DecodeError::MissingField("message"))?,
        query_version: query_version.ok_or(DecodeError::MissingField("query_version"))?,
    })
}

fn encode_test_command(
    enc: &mut Encoder<&mut Vec<u8>>,
    msg: &TestCommand,
) -> Result<(), EncodeError> {
    enc.map(3)?;
    enc.str("session_ident")?;
    enc.u64(msg.session_ident.get())?;
    enc.str("request_ident")?;
    enc.u64(msg.request_ident.get())?;
    enc.str("body")?;
    enc.str(&msg.body)?;
    Ok(())
}

fn decode_test_command(dec: &mut Decoder, limits: &Limits) -> Result<TestCommand, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session_ident = None;
    let mut request_ident = None;
    let mut body = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "session_ident" => session_ident = Some(SessionIdent::new(dec.u64()?)),
            "request_ident" => request_ident = Some(RequestIdent::new(dec.u64()?)),
            "body" => body = Some(decode_text(dec, limits)?.to_string()),
            _ => dec.skip()?,
        }
    }
    Ok(TestCommand {
        session_ident: session_ident.ok_or(DecodeError::MissingField("session_ident"))?,
        request_ident: request_ident.ok_or(DecodeError::MissingField("request_ident"))?,
        body: body.ok_or(DecodeError::MissingField("body"))?,
    })
}

fn action_as_str(action: ServerRequestedAction) -> &'static str {
    match action {
        ServerRequestedAction::NoAction => "no_action",
        ServerRequestedAction::ProtocolViolation => "protocol_violation",
        ServerRequestedAction::ApplicationBug => "application_bug",
        ServerRequestedAction::Warning => "warning",
        ServerRequestedAction::Transient => "transient",
        ServerRequestedAction::DeleteRealm => "delete_realm",
        ServerRequestedAction::ClientReset => "client_reset",
        ServerRequestedAction::ClientResetNoRecovery => "client_reset_no_recovery",
    }
}

fn parse_action(raw: &str) -> Option<ServerRequestedAction> {
    match raw {
        "no_action" => Some(ServerRequestedAction::NoAction),
        "protocol_violation" => Some(ServerRequestedAction::ProtocolViolation),
        "application_bug" => Some(ServerRequestedAction::ApplicationBug),
        "warning" => Some(ServerRequestedAction::Warning),
        "transient" => Some(ServerRequestedAction::Transient),
        "delete_realm" => Some(ServerRequestedAction::DeleteRealm),
        "client_reset" => Some(ServerRequestedAction::ClientReset),
        "client_reset_no_recovery" => Some(ServerRequestedAction::ClientResetNoRecovery),
        _ => None,
    }
}

fn decode_map_len(dec: &mut Decoder, limits: &Limits, depth: usize) -> Result<usize, DecodeError> {
    ensure_depth(limits, depth)?;
    let len = dec.map()?;
    let Some(len) = len else {
        return Err(DecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_map_entries as u64 {
        return Err(DecodeError::DecodeLimit("max_cbor_map_entries"));
    }
    usize::try_from(len).map_err(|_| DecodeError::DecodeLimit("max_cbor_map_entries"))
}

fn decode_array_len(dec: &mut Decoder, limits: &Limits, depth: usize) -> Result<usize, DecodeError> {
    ensure_depth(limits, depth)?;
    let len = dec.array()?;
    let Some(len) = len else {
        return Err(DecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_array_entries as u64 {
        return Err(DecodeError::DecodeLimit("max_cbor_array_entries"));
    }
    usize::try_from(len).map_err(|_| DecodeError::DecodeLimit("max_cbor_array_entries"))
}

fn decode_text<'a>(dec: &mut Decoder<'a>, limits: &Limits) -> Result<&'a str, DecodeError> {
    let ty = dec.datatype()?;
    if matches!(ty, Type::StringIndef) {
        return Err(DecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_cbor_string_bytes {
        return Err(DecodeError::DecodeLimit("max_cbor_string_bytes"));
    }
    Ok(s)
}

fn decode_bytes<'a>(dec: &mut Decoder<'a>, limits: &Limits) -> Result<&'a [u8], DecodeError> {
    let ty = dec.datatype()?;
    if matches!(ty, Type::BytesIndef) {
        return Err(DecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_cbor_string_bytes {
        return Err(DecodeError::DecodeLimit("max_cbor_string_bytes"));
    }
    Ok(bytes)
}

fn ensure_depth(limits: &Limits, depth: usize) -> Result<(), DecodeError> {
    if depth > limits.max_cbor_depth {
        return Err(DecodeError::DecodeLimit("max_cbor_depth"));
    }
    Ok(())
}

fn is_indefinite(dec: &Decoder) -> Result<bool, DecodeError> {
    let ty = dec.datatype()?;
    Ok(matches!(
        ty,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Limits;

    fn limits() -> Limits {
        Limits::default()
    }

    #[test]
    fn bind_round_trip() {
        let message = ClientMessage::Bind(Bind {
            session_ident: SessionIdent::new(3),
            path: "/default".into(),
            need_client_file_ident: true,
            is_subserver: false,
            signed_user_token: "token".into(),
        });
        let bytes = encode_client_message(&message, &limits()).unwrap();
        let decoded = decode_client_message(&bytes, &limits()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn upload_round_trip_with_changesets() {
        let message = ClientMessage::Upload(Upload {
            session_ident: SessionIdent::new(1),
            progress_client_version: ClientVersion::new(4),
            progress_server_version: ServerVersion::new(7),
            locked_server_version: ServerVersion::new(7),
            changesets: vec![UploadChangeset {
                client_version: ClientVersion::new(4),
                last_integrated_server_version: ServerVersion::new(6),
                origin_timestamp: 1234,
                origin_file_ident: 0,
                payload: Bytes::from_static(b"\x01\x02\x03"),
            }],
        });
        let bytes = encode_client_message(&message, &limits()).unwrap();
        let decoded = decode_client_message(&bytes, &limits()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn download_round_trip() {
        let message = ServerMessage::Download(Download {
            session_ident: SessionIdent::new(9),
            progress: SyncProgress {
                download: DownloadCursor {
                    server_version: ServerVersion::new(12),
                    last_integrated_client_version: ClientVersion::new(3),
                },
                upload: UploadCursor {
                    client_version: ClientVersion::new(3),
                    last_integrated_server_version: ServerVersion::new(11),
                },
                latest_server_version: SaltedServerVersion::new(ServerVersion::new(12), 99),
            },
            downloadable_bytes: 1024,
            query_version: QueryVersion::new(2),
            last_in_batch: false,
            changesets: vec![RemoteChangeset {
                remote_version: ServerVersion::new(12),
                last_integrated_local_version: ClientVersion::new(2),
                origin_file_ident: 5,
                origin_timestamp: 777,
                payload: Bytes::from_static(b"abc"),
            }],
        });
        let bytes = encode_server_message(&message, &limits()).unwrap();
        let decoded = decode_server_message(&bytes, &limits()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn error_round_trip_with_resumption_delay() {
        let message = ServerMessage::Error(ProtocolError {
            session_ident: SessionIdent::new(2),
            raw_error_code: 221,
            message: "try again later".into(),
            try_again: true,
            action: ServerRequestedAction::Transient,
            resumption_delay_interval_ms: Some(120_000),
            resumption_delay_backoff_multiplier: Some(2),
            max_resumption_delay_interval_ms: Some(600_000),
            compensating_write_server_version: None,
        });
        let bytes = encode_server_message(&message, &limits()).unwrap();
        let decoded = decode_server_message(&bytes, &limits()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("type").unwrap();
        enc.str("NOPE").unwrap();
        enc.str("body").unwrap();
        enc.map(0).unwrap();
        let err = decode_server_message(&buf, &limits()).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownMessageType(_)));
    }

    #[test]
    fn download_addressed_to_client_decoder_is_rejected() {
        let message = ServerMessage::Pong(Pong { timestamp: 1 });
        let bytes = encode_server_message(&message, &limits()).unwrap();
        let err = decode_client_message(&bytes, &limits()).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownMessageType(_)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let message = ServerMessage::Pong(Pong { timestamp: 1 });
        let mut bytes = encode_server_message(&message, &limits()).unwrap();
        bytes.push(0x00);
        let err = decode_server_message(&bytes, &limits()).unwrap_err();
        assert!(matches!(err, DecodeError::TrailingBytes));
    }

    #[test]
    fn oversized_upload_batch_is_rejected_on_encode() {
        let mut limits = limits();
        limits.max_changesets_per_upload = 1;
        let message = ClientMessage::Upload(Upload {
            session_ident: SessionIdent::new(1),
            progress_client_version: ClientVersion::new(2),
            progress_server_version: ServerVersion::new(1),
            locked_server_version: ServerVersion::new(1),
            changesets: vec![
                UploadChangeset {
                    client_version: ClientVersion::new(1),
                    last_integrated_server_version: ServerVersion::new(1),
                    origin_timestamp: 0,
                    origin_file_ident: 0,
                    payload: Bytes::new(),
                },
                UploadChangeset {
                    client_version: ClientVersion::new(2),
                    last_integrated_server_version: ServerVersion::new(1),
                    origin_timestamp: 0,
                    origin_file_ident: 0,
                    payload: Bytes::new(),
                },
            ],
        });
        let err = encode_client_message(&message, &limits).unwrap_err();
        assert!(matches!(err, EncodeError::UploadBatchTooLarge { .. }));
    }
}
