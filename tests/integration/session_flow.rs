//! Partition-based round trip: BIND/IDENT, upload, download, completion.

use driftwire::client::{ConnectionAction, SessionEffect};
use driftwire::coordinator::KvOp;
use driftwire::core::{ClientVersion, SessionErrorInfo, SessionIdent};
use driftwire::protocol::{ClientMessage, ProtocolError, ServerMessage, SyncFlavor};
use driftwire::{ClientFileIdent, ServerRequestedAction};

use super::fixtures::{
    download_message, now, progress, remote_kv_changeset, Harness,
};

fn session_effects(actions: &[ConnectionAction]) -> Vec<&SessionEffect> {
    actions
        .iter()
        .flat_map(|action| match action {
            ConnectionAction::SessionEffects(_, effects) => effects.iter().collect::<Vec<_>>(),
            _ => Vec::new(),
        })
        .collect()
}

#[test]
fn pbs_round_trip_uploads_and_completes() {
    let mut harness = Harness::new("pbs-roundtrip", SyncFlavor::PartitionBased);
    harness.run_handshake(SyncFlavor::PartitionBased);

    // The server assigned the identity during the handshake.
    assert_eq!(
        harness.coordinator.history().client_file_ident().unwrap(),
        ClientFileIdent::new(1234, 42)
    );

    // A local commit produces client version 1.
    let ops = vec![KvOp {
        key: "item/1".into(),
        value: Some(b"pear".to_vec()),
    }];
    let version = harness
        .coordinator
        .commit_write(&ops, |txn| txn.put("item/1", b"pear".to_vec()))
        .unwrap();
    assert_eq!(version, ClientVersion::new(1));

    // The session learns of the commit and sends UPLOAD.
    let ident = harness.session_ident;
    let (effects, _) = harness
        .connection
        .with_session(ident, |session, _store| {
            session.on_new_client_version(version)
        })
        .unwrap();
    let actions = harness.connection.absorb_effects(ident, effects, now());
    let (message, _) = harness.next_outbound(&actions).expect("UPLOAD");
    let ClientMessage::Upload(upload) = message else {
        panic!("expected UPLOAD, got {message:?}");
    };
    assert_eq!(upload.progress_client_version, ClientVersion::new(1));
    assert_eq!(upload.changesets.len(), 1);
    assert_eq!(upload.changesets[0].client_version, ClientVersion::new(1));

    // Register the upload-completion watch, then let the server ack.
    let (effects, _) = harness
        .connection
        .with_session(ident, |session, store| {
            session.request_upload_completion(store)
        })
        .unwrap();
    assert!(effects.is_empty());
    harness.connection.absorb_effects(ident, effects, now());

    let actions = harness.receive(&download_message(
        ident,
        progress(1, 0, 1, 1),
        0,
        true,
        vec![],
    ));
    let effects = session_effects(&actions);
    assert!(effects
        .iter()
        .any(|e| matches!(e, SessionEffect::UploadCompleted)));
    assert!(effects
        .iter()
        .any(|e| matches!(e, SessionEffect::ChangesetsIntegrated { .. })));
}

#[test]
fn download_applies_to_database_and_notifies_observers() {
    let mut harness = Harness::new("pbs-download", SyncFlavor::PartitionBased);
    harness.run_handshake(SyncFlavor::PartitionBased);

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_clone = std::sync::Arc::clone(&seen);
    harness.coordinator.notifier().register(
        "item/",
        ClientVersion::ZERO,
        move |changes| {
            seen_clone.lock().unwrap().push(changes.clone());
        },
    );

    let ident = harness.session_ident;
    let actions = harness.receive(&download_message(
        ident,
        progress(1, 0, 0, 1),
        0,
        true,
        vec![remote_kv_changeset(1, 7, "item/apple", b"red")],
    ));
    assert!(session_effects(&actions)
        .iter()
        .any(|e| matches!(e, SessionEffect::ChangesetsIntegrated { .. })));

    // The write landed in the database.
    let snapshot = harness.coordinator.begin_read(None).unwrap();
    assert_eq!(snapshot.get("item/apple"), Some(b"red".as_slice()));

    // And the notifier delivers exactly one change set for it.
    let version = harness.coordinator.db().current_version().unwrap();
    harness.coordinator.notifier().wait_until_advanced(version);
    harness.coordinator.notifier().process_available(version).unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].changed_keys, vec!["item/apple".to_string()]);
}

#[test]
fn compensating_write_waits_for_its_download() {
    let mut harness = Harness::new("pbs-compensating", SyncFlavor::PartitionBased);
    harness.run_handshake(SyncFlavor::PartitionBased);
    let ident = harness.session_ident;

    let actions = harness.receive(&ServerMessage::Error(ProtocolError {
        session_ident: ident,
        raw_error_code: driftwire::core::server_error::COMPENSATING_WRITE,
        message: "write rejected".into(),
        try_again: true,
        action: ServerRequestedAction::Warning,
        resumption_delay_interval_ms: None,
        resumption_delay_backoff_multiplier: None,
        max_resumption_delay_interval_ms: None,
        compensating_write_server_version: Some(2),
    }));
    assert!(session_effects(&actions).is_empty());

    // DOWNLOAD at server version 1: still deferred.
    let actions = harness.receive(&download_message(
        ident,
        progress(1, 0, 0, 5),
        0,
        true,
        vec![],
    ));
    assert!(!session_effects(&actions)
        .iter()
        .any(|e| matches!(e, SessionEffect::DeliverError(_))));

    // DOWNLOAD reaching server version 2 delivers it in-line.
    let actions = harness.receive(&download_message(
        ident,
        progress(2, 0, 0, 5),
        0,
        true,
        vec![],
    ));
    let effects = session_effects(&actions);
    let delivered = effects.iter().find_map(|e| match e {
        SessionEffect::DeliverError(info) => Some(info),
        _ => None,
    });
    let delivered: &SessionErrorInfo = delivered.expect("compensating write delivered");
    assert_eq!(delivered.compensating_write_server_version, Some(2));
}

#[test]
fn session_level_error_suspends_only_that_session() {
    let mut harness = Harness::new("pbs-suspend", SyncFlavor::PartitionBased);
    harness.run_handshake(SyncFlavor::PartitionBased);
    let ident = harness.session_ident;

    let actions = harness.receive(&ServerMessage::Error(ProtocolError {
        session_ident: ident,
        raw_error_code: driftwire::core::server_error::TRANSIENT_ERROR,
        message: "hold on".into(),
        try_again: true,
        action: ServerRequestedAction::Transient,
        resumption_delay_interval_ms: None,
        resumption_delay_backoff_multiplier: None,
        max_resumption_delay_interval_ms: None,
        compensating_write_server_version: None,
    }));
    assert!(session_effects(&actions)
        .iter()
        .any(|e| matches!(e, SessionEffect::SuspendWithError(_))));
    // The connection itself stays up.
    assert_eq!(
        harness.connection.state(),
        driftwire::ConnectionState::Connected
    );
    assert!(harness
        .connection
        .session(SessionIdent::new(1))
        .unwrap()
        .is_suspended());
}
