//! Full assembly: SyncClient, event loop, mock transport, live threads.

use std::time::{Duration, Instant};

use driftwire::client::{MockTransport, SessionEffect};
use driftwire::coordinator::{DbCoordinator, KvOp};
use driftwire::core::ClientVersion;
use driftwire::protocol::{self, ClientMessage, IdentFromServer, ServerMessage, SyncFlavor};
use driftwire::{
    ClientConfig, ConnectionState, ProtocolEnvelope, ReconnectMode, ServerEndpoint, SyncClient,
    SyncConfig,
};

use super::fixtures::{download_message, limits, progress, unique_db_path};

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn client_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.reconnect_mode = ReconnectMode::Testing;
    config.connection_linger_time = Duration::from_millis(10);
    config
}

/// Waits for the next outbound frame and decodes it.
fn next_frame(transport: &MockTransport) -> ClientMessage {
    let mut frame = None;
    wait_for(|| {
        frame = transport.take_frame();
        frame.is_some()
    });
    protocol::decode_client_message(&frame.unwrap(), &limits()).unwrap()
}

#[test]
fn end_to_end_upload_over_the_event_loop() {
    let transport = MockTransport::new();
    let client = SyncClient::new(client_config(), Box::new(transport.clone()));
    let coordinator = DbCoordinator::get_coordinator(&unique_db_path("assembly")).unwrap();

    let endpoint = ServerEndpoint::new(ProtocolEnvelope::Ws, "localhost", 7800);
    let connection = client.connection_for(&endpoint, SyncFlavor::PartitionBased);
    let session = client.bind_session(
        connection,
        &coordinator,
        "/default".into(),
        "token".into(),
        &SyncConfig::default(),
        None,
    );

    // The loop dials out once the session exists.
    wait_for(|| transport.connect_count() == 1);
    transport.server_accept(Some(&format!(
        "io.driftwire.sync/{}",
        protocol::PROTOCOL_VERSION_MAX
    )));

    // Connected state is reported, then BIND goes out.
    wait_for(|| {
        client
            .connection_states()
            .try_iter()
            .any(|(_, state)| state == ConnectionState::Connected)
    });
    let message = next_frame(&transport);
    let ClientMessage::Bind(bind) = message else {
        panic!("expected BIND, got {message:?}");
    };
    assert!(bind.need_client_file_ident);

    // The server assigns the identity; the client answers with IDENT.
    transport.server_send(
        protocol::encode_server_message(
            &ServerMessage::Ident(IdentFromServer {
                session_ident: session,
                client_file_ident: 1234,
                client_file_ident_salt: 42,
            }),
            &limits(),
        )
        .unwrap(),
    );
    let message = next_frame(&transport);
    assert!(matches!(message, ClientMessage::Ident(_)));

    // A local commit flows into an UPLOAD through the commit listener.
    let version = coordinator
        .commit_write(
            &[KvOp {
                key: "fruit/1".into(),
                value: Some(b"pear".to_vec()),
            }],
            |txn| txn.put("fruit/1", b"pear".to_vec()),
        )
        .unwrap();
    assert_eq!(version, ClientVersion::new(1));

    let message = next_frame(&transport);
    let ClientMessage::Upload(upload) = message else {
        panic!("expected UPLOAD, got {message:?}");
    };
    assert_eq!(upload.progress_client_version, ClientVersion::new(1));
    assert_eq!(upload.changesets.len(), 1);

    // The server acks; the registered completion watch resolves through
    // the routed effects channel.
    client.request_upload_completion(connection, session);
    transport.server_send(
        protocol::encode_server_message(
            &download_message(session, progress(1, 0, 1, 1), 0, true, vec![]),
            &limits(),
        )
        .unwrap(),
    );
    wait_for(|| {
        client
            .effects()
            .try_iter()
            .any(|(_, _, effect)| matches!(effect, SessionEffect::UploadCompleted))
    });

    client.stop();
}

#[test]
fn orderly_close_sends_unbind() {
    let transport = MockTransport::new();
    let client = SyncClient::new(client_config(), Box::new(transport.clone()));
    let coordinator = DbCoordinator::get_coordinator(&unique_db_path("assembly-close")).unwrap();

    let endpoint = ServerEndpoint::new(ProtocolEnvelope::Ws, "localhost", 7801);
    let connection = client.connection_for(&endpoint, SyncFlavor::PartitionBased);
    let session = client.bind_session(
        connection,
        &coordinator,
        "/default".into(),
        "token".into(),
        &SyncConfig::default(),
        None,
    );

    wait_for(|| transport.connect_count() == 1);
    transport.server_accept(Some(&format!(
        "io.driftwire.sync/{}",
        protocol::PROTOCOL_VERSION_MAX
    )));
    let message = next_frame(&transport);
    assert!(matches!(message, ClientMessage::Bind(_)));

    client.close_session(connection, session);
    let message = next_frame(&transport);
    assert!(matches!(message, ClientMessage::Unbind(_)));

    client.stop();
}
