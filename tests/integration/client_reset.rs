//! Client reset end to end: fresh download, swap, recovery, reactivation.

use std::sync::{Arc, Mutex};

use driftwire::client::{ConnectionAction, SessionEffect};
use driftwire::coordinator::{DbCoordinator, KvOp};
use driftwire::core::{ClientVersion, SessionIdent};
use driftwire::protocol::{ClientMessage, ProtocolError, ServerMessage, SyncFlavor};
use driftwire::{
    ClientResyncMode, FreshCopy, ResetObservers, ResetOutcome, ServerRequestedAction,
};

use super::fixtures::{
    download_message, progress, remote_kv_changeset, unique_db_path, Harness,
};

/// Plays the fresh-session phase: a second coordinator at a sibling path
/// downloads the authoritative state, exactly as the orchestration's fresh
/// session would.
fn download_fresh_copy(entries: &[(&str, &[u8])]) -> FreshCopy {
    let mut harness = Harness::new("fresh-session", SyncFlavor::PartitionBased);
    harness.run_handshake(SyncFlavor::PartitionBased);
    let ident = harness.session_ident;

    let changesets = entries
        .iter()
        .enumerate()
        .map(|(index, (key, value))| {
            remote_kv_changeset(index as u64 + 1, 7, key, value)
        })
        .collect::<Vec<_>>();
    let top = entries.len() as u64;
    harness.receive(&download_message(
        ident,
        progress(top, 0, 0, top),
        0,
        true,
        changesets,
    ));

    FreshCopy {
        snapshot: harness.coordinator.begin_read(None).unwrap(),
        client_file_ident: harness.coordinator.history().client_file_ident().unwrap(),
        progress: harness.coordinator.history().progress().unwrap(),
    }
}

#[test]
fn reset_with_recovery_merges_local_writes_into_fresh_state() {
    let mut harness = Harness::new("reset-recovery", SyncFlavor::PartitionBased);
    harness.run_handshake(SyncFlavor::PartitionBased);
    let ident = harness.session_ident;

    // A local write the server never saw.
    harness
        .coordinator
        .commit_write(
            &[KvOp {
                key: "local/draft".into(),
                value: Some(b"unsynced".to_vec()),
            }],
            |txn| txn.put("local/draft", b"unsynced".to_vec()),
        )
        .unwrap();

    // The server demands a reset.
    let actions = harness.receive(&ServerMessage::Error(ProtocolError {
        session_ident: ident,
        raw_error_code: driftwire::core::server_error::BAD_CLIENT_FILE,
        message: "client file too old".into(),
        try_again: false,
        action: ServerRequestedAction::ClientReset,
        resumption_delay_interval_ms: None,
        resumption_delay_backoff_multiplier: None,
        max_resumption_delay_interval_ms: None,
        compensating_write_server_version: None,
    }));
    let reset_demanded = actions.iter().any(|action| matches!(
        action,
        ConnectionAction::SessionEffects(_, effects)
            if effects.iter().any(|e| matches!(e, SessionEffect::ClientResetRequired(_)))
    ));
    assert!(reset_demanded);

    // Fresh session downloads the authoritative state in parallel.
    let fresh = download_fresh_copy(&[("server/item", b"authoritative")]);
    let fresh_ident = fresh.client_file_ident;

    // Observers: "before" sees the pre-reset state, "after" the merged one.
    let before_state = Arc::new(Mutex::new(None));
    let after_state = Arc::new(Mutex::new(None));
    let b = Arc::clone(&before_state);
    let a = Arc::clone(&after_state);
    let observers = ResetObservers {
        before: Some(Box::new(move |snapshot| {
            *b.lock().unwrap() = Some(snapshot.get("local/draft").map(<[u8]>::to_vec));
        })),
        after: Some(Box::new(move |snapshot| {
            *a.lock().unwrap() = Some((
                snapshot.get("server/item").map(<[u8]>::to_vec),
                snapshot.get("local/draft").map(<[u8]>::to_vec),
            ));
        })),
    };

    let error = driftwire::SessionErrorInfo::new(
        driftwire::core::server_error::BAD_CLIENT_FILE,
        "client file too old",
        false,
    )
    .with_action(ServerRequestedAction::ClientReset);

    let outcome = driftwire::client::perform_client_reset(
        &harness.coordinator,
        fresh,
        ClientResyncMode::Recover,
        &error,
        observers,
    )
    .unwrap();
    let ResetOutcome::Completed {
        recovered_changesets,
        ..
    } = outcome;
    assert_eq!(recovered_changesets, 1);

    assert_eq!(
        *before_state.lock().unwrap(),
        Some(Some(b"unsynced".to_vec()))
    );
    assert_eq!(
        *after_state.lock().unwrap(),
        Some((
            Some(b"authoritative".to_vec()),
            Some(b"unsynced".to_vec())
        ))
    );

    // The fresh identity replaced the old one.
    assert_eq!(
        harness.coordinator.history().client_file_ident().unwrap(),
        fresh_ident
    );
    // The recovered write is uploadable against the new history.
    let uploadable = harness
        .coordinator
        .history()
        .uploadable_changesets(ClientVersion::ZERO, ClientVersion::new(u64::MAX >> 1), 10)
        .unwrap();
    assert_eq!(uploadable.len(), 1);

    // The session rebinds with the fresh identity on its next handshake.
    let rebind_coordinator =
        DbCoordinator::get_coordinator(&unique_db_path("reset-rebind")).unwrap();
    rebind_coordinator
        .history()
        .set_client_file_ident(fresh_ident, false)
        .unwrap();
    let mut reset_session =
        Harness::with_coordinator(rebind_coordinator, SyncFlavor::PartitionBased);
    let actions = reset_session.establish(SyncFlavor::PartitionBased);
    let (bind, actions) = reset_session.next_outbound(&actions).expect("BIND");
    let ClientMessage::Bind(bind) = bind else {
        panic!("expected BIND");
    };
    assert!(!bind.need_client_file_ident);
    let (ident_message, _) = reset_session.next_outbound(&actions).expect("IDENT");
    let ClientMessage::Ident(ident_message) = ident_message else {
        panic!("expected IDENT");
    };
    assert_eq!(ident_message.client_file_ident, fresh_ident.ident);
}

#[test]
fn discard_local_reset_drops_unsynced_writes() {
    let harness = Harness::new("reset-discard", SyncFlavor::PartitionBased);
    harness
        .coordinator
        .commit_write(
            &[KvOp {
                key: "local/gone".into(),
                value: Some(b"x".to_vec()),
            }],
            |txn| txn.put("local/gone", b"x".to_vec()),
        )
        .unwrap();

    let fresh = download_fresh_copy(&[("server/kept", b"y")]);
    let error = driftwire::SessionErrorInfo::new(
        driftwire::core::server_error::DIVERGING_HISTORIES,
        "diverged",
        false,
    )
    .with_action(ServerRequestedAction::ClientResetNoRecovery);

    driftwire::client::perform_client_reset(
        &harness.coordinator,
        fresh,
        ClientResyncMode::RecoverOrDiscard,
        &error,
        ResetObservers::none(),
    )
    .unwrap();

    let snapshot = harness.coordinator.begin_read(None).unwrap();
    assert!(snapshot.get("local/gone").is_none());
    assert_eq!(snapshot.get("server/kept"), Some(b"y".as_slice()));
    // Nothing left to upload: local history was discarded.
    let uploadable = harness
        .coordinator
        .history()
        .uploadable_changesets(ClientVersion::ZERO, ClientVersion::new(u64::MAX >> 1), 10)
        .unwrap();
    assert!(uploadable.is_empty());
}

#[test]
fn fresh_copy_lands_at_a_sibling_path() {
    let db_path = unique_db_path("fresh-path");
    let fresh_path = driftwire::paths::fresh_copy_path(&db_path);
    assert_eq!(
        fresh_path.file_name().unwrap().to_string_lossy(),
        format!(
            "{}.fresh",
            db_path.file_name().unwrap().to_string_lossy()
        )
    );
    assert_eq!(fresh_path.parent(), db_path.parent());
}

#[test]
fn unexpected_client_file_ident_from_server_is_rejected() {
    let mut harness = Harness::new("reset-bad-ident", SyncFlavor::PartitionBased);
    harness.run_handshake(SyncFlavor::PartitionBased);
    // A second IDENT after the handshake is a protocol violation.
    let _ = harness.receive(&ServerMessage::Ident(driftwire::protocol::IdentFromServer {
        session_ident: SessionIdent::new(1),
        client_file_ident: 999,
        client_file_ident_salt: 1,
    }));
    assert_eq!(
        harness.connection.state(),
        driftwire::ConnectionState::Disconnected
    );
}
