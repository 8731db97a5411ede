//! Flexible-sync bootstraps: buffering, chunked drain, crash recovery.

use driftwire::client::{
    ConnectionAction, SessionEffect, Subscription, SubscriptionProtocolState, SubscriptionStore,
};
use driftwire::core::{ClientVersion, Limits, QueryVersion, SessionIdent};
use driftwire::protocol::{ClientMessage, MarkResponse, ServerMessage, SyncFlavor};
use driftwire::{PendingBootstrapStore, SubscriptionSetState};

use super::fixtures::{download_message, progress, remote_kv_changeset, Harness};

/// Mirrors the protocol-driven transitions into the subscription store,
/// the way the embedding layer routes session effects.
fn route_transitions(store: &SubscriptionStore, actions: &[ConnectionAction]) {
    for (query_version, state) in subscription_transitions(actions) {
        let mapped = match state {
            SubscriptionProtocolState::Bootstrapping => SubscriptionSetState::Bootstrapping,
            SubscriptionProtocolState::AwaitingMark => SubscriptionSetState::AwaitingMark,
            SubscriptionProtocolState::Complete => SubscriptionSetState::Complete,
            SubscriptionProtocolState::Error => {
                SubscriptionSetState::Error("query rejected".into())
            }
        };
        store.set_state(query_version, mapped);
    }
}

fn subscription_transitions(
    actions: &[ConnectionAction],
) -> Vec<(QueryVersion, SubscriptionProtocolState)> {
    actions
        .iter()
        .flat_map(|action| match action {
            ConnectionAction::SessionEffects(_, effects) => effects
                .iter()
                .filter_map(|effect| match effect {
                    SessionEffect::SubscriptionStateChanged {
                        query_version,
                        state,
                    } => Some((*query_version, *state)),
                    _ => None,
                })
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        })
        .collect()
}

#[test]
fn bootstrap_transitions_through_awaiting_mark_to_complete() {
    let mut harness = Harness::new("flx-bootstrap", SyncFlavor::Flexible);
    harness.run_handshake(SyncFlavor::Flexible);
    let ident = harness.session_ident;

    // The application committed subscription set versions up to 7; the
    // server is replying to version 7.
    let store = SubscriptionStore::new();
    for round in 0..7 {
        store.commit_update(
            vec![Subscription {
                name: None,
                object_class: "Item".into(),
                query: format!("round = {round}"),
            }],
            ClientVersion::ZERO,
        );
    }
    let terminal = store.wait_for_terminal(QueryVersion::new(7));
    assert_eq!(
        store.get(QueryVersion::new(7)).unwrap().state,
        SubscriptionSetState::Pending
    );

    // Three messages at query version 7: two MoreToCome, one LastInBatch.
    let actions = harness.receive(&download_message(
        ident,
        progress(1, 0, 0, 9),
        7,
        false,
        vec![remote_kv_changeset(1, 5, "flx/a", b"1")],
    ));
    assert_eq!(
        subscription_transitions(&actions),
        vec![(QueryVersion::new(7), SubscriptionProtocolState::Bootstrapping)]
    );
    route_transitions(&store, &actions);
    assert_eq!(
        store.get(QueryVersion::new(7)).unwrap().state,
        SubscriptionSetState::Bootstrapping
    );
    // Nothing applied yet.
    assert!(harness
        .coordinator
        .begin_read(None)
        .unwrap()
        .get("flx/a")
        .is_none());

    let actions = harness.receive(&download_message(
        ident,
        progress(2, 0, 0, 9),
        7,
        false,
        vec![remote_kv_changeset(2, 5, "flx/b", b"2")],
    ));
    assert!(subscription_transitions(&actions).is_empty());

    let actions = harness.receive(&download_message(
        ident,
        progress(3, 0, 0, 9),
        7,
        true,
        vec![remote_kv_changeset(3, 5, "flx/c", b"3")],
    ));
    let transitions = subscription_transitions(&actions);
    assert!(transitions
        .contains(&(QueryVersion::new(7), SubscriptionProtocolState::AwaitingMark)));
    route_transitions(&store, &actions);
    assert_eq!(
        store.get(QueryVersion::new(7)).unwrap().state,
        SubscriptionSetState::AwaitingMark
    );
    // No terminal state yet: the waiter is still pending.
    assert!(terminal.try_recv().is_err());

    // The whole batch is now applied atomically.
    let snapshot = harness.coordinator.begin_read(None).unwrap();
    assert_eq!(snapshot.get("flx/a"), Some(b"1".as_slice()));
    assert_eq!(snapshot.get("flx/b"), Some(b"2".as_slice()));
    assert_eq!(snapshot.get("flx/c"), Some(b"3".as_slice()));

    // The session asks for a MARK; its reply completes the subscription.
    let (message, _) = harness.next_outbound(&actions).expect("MARK");
    let ClientMessage::Mark(mark) = message else {
        panic!("expected MARK, got {message:?}");
    };
    let actions = harness.receive(&ServerMessage::Mark(MarkResponse {
        session_ident: ident,
        request_ident: mark.request_ident,
    }));
    assert!(subscription_transitions(&actions)
        .contains(&(QueryVersion::new(7), SubscriptionProtocolState::Complete)));
    route_transitions(&store, &actions);

    // Version 7 is now the active set, the waiter resolved, and every
    // older pending version is superseded.
    assert_eq!(terminal.try_recv().unwrap(), SubscriptionSetState::Complete);
    assert_eq!(store.active().version, QueryVersion::new(7));
    for version in 1..7 {
        assert_eq!(
            store.get(QueryVersion::new(version)).unwrap().state,
            SubscriptionSetState::Superseded
        );
    }
}

#[test]
fn partial_bootstrap_is_discarded_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pending.sqlite");

    // First process: two MoreToCome messages, then a crash (drop).
    {
        let mut store = PendingBootstrapStore::open(&path, Limits::default()).unwrap();
        let download = |server_version: u64, last: bool| {
            let ServerMessage::Download(download) = download_message(
                SessionIdent::new(1),
                progress(server_version, 0, 0, 9),
                7,
                last,
                vec![remote_kv_changeset(server_version, 5, "k", b"v")],
            ) else {
                unreachable!()
            };
            download
        };
        store.store_message(&download(1, false)).unwrap();
        store.store_message(&download(2, false)).unwrap();
        assert_eq!(store.message_count(), 2);
    }

    // Restart: the partial batch is gone and nothing can be applied.
    let mut store = PendingBootstrapStore::open(&path, Limits::default()).unwrap();
    assert_eq!(store.message_count(), 0);
    assert!(store.next_chunk(usize::MAX).unwrap().is_none());
}

#[test]
fn steady_state_downloads_at_active_query_version_apply_directly() {
    let mut harness = Harness::new("flx-steady", SyncFlavor::Flexible);
    harness.run_handshake(SyncFlavor::Flexible);
    let ident = harness.session_ident;

    // query_version 1 is the active version from the harness config: no
    // bootstrap buffering.
    let actions = harness.receive(&download_message(
        ident,
        progress(1, 0, 0, 9),
        1,
        true,
        vec![remote_kv_changeset(1, 5, "flx/live", b"now")],
    ));
    assert!(actions.iter().any(|action| matches!(
        action,
        ConnectionAction::SessionEffects(_, effects)
            if effects.iter().any(|e| matches!(e, SessionEffect::ChangesetsIntegrated { .. }))
    )));
    assert_eq!(
        harness
            .coordinator
            .begin_read(None)
            .unwrap()
            .get("flx/live"),
        Some(b"now".as_slice())
    );
}
