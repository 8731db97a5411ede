//! Property tests for the quantified protocol invariants.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use driftwire::client::{compute_reconnect_delay, ReconnectInfo, ReconnectMode};
use driftwire::core::{
    check_changeset_headers, check_received_progress, ClientFileIdent, ClientVersion,
    MonotonicMillis, RemoteChangeset, SaltedServerVersion, ServerVersion, SyncProgress,
    TerminationReason,
};

fn progress_strategy() -> impl Strategy<Value = (u64, u64, u64, u64)> {
    // (download_server, download_client, upload_client, latest)
    (0u64..100, 0u64..100, 0u64..100, 0u64..100)
}

fn build_progress(dl_server: u64, dl_client: u64, up_client: u64, latest: u64) -> SyncProgress {
    let mut progress = SyncProgress::default();
    progress.download.server_version = ServerVersion::new(dl_server);
    progress.download.last_integrated_client_version = ClientVersion::new(dl_client);
    progress.upload.client_version = ClientVersion::new(up_client);
    progress.upload.last_integrated_server_version = ServerVersion::new(dl_server);
    progress.latest_server_version = SaltedServerVersion::new(ServerVersion::new(latest), 1);
    progress
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

    /// Invariant 1: accepted progress sequences keep every cursor weakly
    /// increasing; any regression is rejected.
    #[test]
    fn accepted_progress_is_weakly_increasing(
        sequence in proptest::collection::vec(progress_strategy(), 1..12),
        last_available in 0u64..200,
    ) {
        let last_available = ClientVersion::new(last_available);
        let mut current = SyncProgress::default();
        for (dl_server, dl_client, up_client, latest) in sequence {
            let incoming = build_progress(dl_server, dl_client, up_client, latest);
            if check_received_progress(&current, &incoming, last_available).is_ok() {
                prop_assert!(
                    incoming.latest_server_version.version
                        >= current.latest_server_version.version
                );
                prop_assert!(incoming.upload.client_version >= current.upload.client_version);
                prop_assert!(
                    incoming.download.server_version >= current.download.server_version
                );
                prop_assert!(
                    incoming.download.last_integrated_client_version
                        >= current.download.last_integrated_client_version
                );
                prop_assert!(incoming.upload.client_version <= last_available);
                prop_assert!(
                    incoming.download.server_version <= incoming.latest_server_version.version
                );
                current = incoming;
            }
        }
    }

    /// Invariant 2: a changeset batch passing validation never contains the
    /// session's own file ident, nor a non-positive one.
    #[test]
    fn accepted_changesets_never_originate_from_self(
        origins in proptest::collection::vec(0u64..20, 1..10),
        self_ident in 1u64..20,
    ) {
        let changesets: Vec<RemoteChangeset> = origins
            .iter()
            .enumerate()
            .map(|(index, origin)| RemoteChangeset {
                remote_version: ServerVersion::new(index as u64 + 1),
                last_integrated_local_version: ClientVersion::ZERO,
                origin_file_ident: *origin,
                origin_timestamp: 0,
                payload: bytes::Bytes::new(),
            })
            .collect();
        let result = check_changeset_headers(
            &changesets,
            ClientFileIdent::new(self_ident, 1),
            ServerVersion::ZERO,
            ClientVersion::ZERO,
            ClientVersion::ZERO,
            false,
        );
        let all_foreign = origins.iter().all(|origin| *origin > 0 && *origin != self_ident);
        prop_assert_eq!(result.is_ok(), all_foreign);
    }

    /// Invariant 3: for every cause, the computed delay lies within
    /// [min_delay * 0.75, max_delay] until the ceiling saturates.
    #[test]
    fn reconnect_delay_lies_in_the_jitter_envelope(
        seed in 0u64..1000,
        failures in 1usize..15,
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut info = ReconnectInfo::new();
        let mut now = MonotonicMillis(1_000_000);
        let mut expected_base_ms = 0u64;
        for _ in 0..failures {
            info.record_connect_attempt(now);
            info.record_termination(TerminationReason::ConnectOperationFailed, now);
            let delay = compute_reconnect_delay(
                &mut info,
                ReconnectMode::Normal,
                &mut rng,
                now,
            );
            let delay = delay.as_duration().expect("finite delay");
            expected_base_ms = (expected_base_ms * 2).clamp(1_000, 300_000);
            prop_assert!(
                delay.as_millis() as u64 >= expected_base_ms * 3 / 4,
                "delay {delay:?} below envelope for base {expected_base_ms}"
            );
            prop_assert!(delay.as_millis() as u64 <= expected_base_ms);
            now = now.saturating_add_ms(delay.as_millis() as u64);
        }
    }
}

#[test]
fn ping_timestamp_mismatch_is_always_fatal() {
    // Invariant 5: the PONG must echo the PING timestamp exactly.
    for offset in [1u64, 7, 1000] {
        let mut harness = super::fixtures::Harness::new(
            "pong-mismatch",
            driftwire::protocol::SyncFlavor::PartitionBased,
        );
        harness.run_handshake(driftwire::protocol::SyncFlavor::PartitionBased);
        let actions = harness.connection.handle_ping_timer(super::fixtures::now());
        let (message, _) = harness.next_outbound(&actions).expect("PING");
        let driftwire::protocol::ClientMessage::Ping(ping) = message else {
            panic!("expected PING");
        };
        let _ = harness.receive(&driftwire::protocol::ServerMessage::Pong(
            driftwire::protocol::Pong {
                timestamp: ping.timestamp.wrapping_add(offset),
            },
        ));
        assert_eq!(
            harness.connection.state(),
            driftwire::ConnectionState::Disconnected
        );
    }
}

#[test]
fn upload_covers_each_local_commit_exactly_once() {
    // Invariant 6: every committed version is covered by exactly one
    // UPLOAD's progress range.
    use driftwire::coordinator::KvOp;
    let mut harness = super::fixtures::Harness::new(
        "upload-once",
        driftwire::protocol::SyncFlavor::PartitionBased,
    );
    harness.run_handshake(driftwire::protocol::SyncFlavor::PartitionBased);
    let ident = harness.session_ident;

    let mut covered: Vec<(u64, u64)> = Vec::new(); // (from_exclusive, to_inclusive)
    let mut previous_top = 0u64;
    for round in 0..4u64 {
        let version = harness
            .coordinator
            .commit_write(
                &[KvOp {
                    key: format!("k/{round}"),
                    value: Some(vec![round as u8]),
                }],
                |txn| txn.put(format!("k/{round}"), vec![round as u8]),
            )
            .unwrap();
        let (effects, _) = harness
            .connection
            .with_session(ident, |session, _| session.on_new_client_version(version))
            .unwrap();
        let actions = harness
            .connection
            .absorb_effects(ident, effects, super::fixtures::now());
        let (message, _) = harness.next_outbound(&actions).expect("UPLOAD");
        let driftwire::protocol::ClientMessage::Upload(upload) = message else {
            panic!("expected UPLOAD");
        };
        covered.push((previous_top, upload.progress_client_version.get()));
        previous_top = upload.progress_client_version.get();
    }

    // Ranges are contiguous and disjoint: (0,1], (1,2], (2,3], (3,4].
    for (index, (from, to)) in covered.iter().enumerate() {
        assert_eq!(*from, index as u64);
        assert_eq!(*to, index as u64 + 1);
    }
}
