//! Reconnect behavior: pong timeout backoff and server-directed delays.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use driftwire::client::{
    Connection, ConnectionAction, PendingBootstrapStore, ReconnectMode, Session, TimerKind,
};
use driftwire::coordinator::DbCoordinator;
use driftwire::core::{MonotonicMillis, SessionIdent};
use driftwire::protocol::{self, ProtocolError, ServerMessage, SyncFlavor};
use driftwire::{ConnectionState, ServerRequestedAction};

use super::fixtures::{
    connection_config, download_message, limits, progress, session_config, unique_db_path,
};

fn now() -> MonotonicMillis {
    MonotonicMillis::now()
}

fn normal_mode_harness(tag: &str) -> Connection<driftwire::SyncAttachment> {
    let coordinator = DbCoordinator::get_coordinator(&unique_db_path(tag)).unwrap();
    let mut config = connection_config(SyncFlavor::PartitionBased);
    config.reconnect_mode = ReconnectMode::Normal;
    let mut connection = Connection::new(config, StdRng::seed_from_u64(99));
    connection.activate(now());
    connection.handle_reconnect_timer(now());
    let session = Session::new(
        session_config(1, SyncFlavor::PartitionBased),
        &coordinator.sync_attachment(),
        PendingBootstrapStore::in_memory().unwrap(),
    );
    connection.add_session(session, coordinator.sync_attachment(), now());
    connection.handle_reconnect_timer(now());
    connection
}

fn reconnect_delay(actions: &[ConnectionAction]) -> Option<Duration> {
    actions.iter().find_map(|action| match action {
        ConnectionAction::ArmTimer(TimerKind::Reconnect, delay) => Some(*delay),
        _ => None,
    })
}

fn establish(connection: &mut Connection<driftwire::SyncAttachment>) {
    let token = format!("io.driftwire.sync/{}", protocol::PROTOCOL_VERSION_MAX);
    connection.handle_connected(Some(&token), now());
}

#[test]
fn pong_timeout_arms_a_jittered_minimum_delay() {
    let mut connection = normal_mode_harness("pong-backoff");
    establish(&mut connection);
    assert_eq!(connection.state(), ConnectionState::Connected);

    // The PING goes out, the PONG never arrives.
    connection.handle_write_completed(now());
    connection.handle_ping_timer(now());
    connection.handle_write_completed(now());
    let actions = connection.handle_pong_timer(now());

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    let delay = reconnect_delay(&actions).expect("reconnect armed");
    // Minimum delay 1s with a deduction of at most 25%.
    assert!(delay >= Duration::from_millis(750), "delay {delay:?}");
    assert!(delay <= Duration::from_millis(1000), "delay {delay:?}");

    // The next attempt brings the connection back up.
    let actions = connection.handle_reconnect_timer(now());
    assert!(actions
        .iter()
        .any(|a| matches!(a, ConnectionAction::Connect(_))));
    assert_eq!(connection.state(), ConnectionState::Connecting);
    establish(&mut connection);
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[test]
fn server_try_again_schedule_doubles_and_resets_on_progress() {
    let mut connection = normal_mode_harness("try-again");
    establish(&mut connection);

    let try_again_error = || {
        ServerMessage::Error(ProtocolError {
            session_ident: SessionIdent::CONNECTION,
            raw_error_code: driftwire::core::server_error::CONNECTION_CLOSED,
            message: "try again later".into(),
            try_again: true,
            action: ServerRequestedAction::Transient,
            resumption_delay_interval_ms: Some(120_000),
            resumption_delay_backoff_multiplier: Some(2),
            max_resumption_delay_interval_ms: Some(600_000),
            compensating_write_server_version: None,
        })
    };

    let deliver = |connection: &mut Connection<driftwire::SyncAttachment>,
                   message: &ServerMessage| {
        let bytes = protocol::encode_server_message(message, &limits()).unwrap();
        connection.handle_binary_message(&bytes, now())
    };

    // First ERROR: scheduled 120s (minus up to 25%) from reception.
    let actions = deliver(&mut connection, &try_again_error());
    let delay = reconnect_delay(&actions).expect("first delay");
    assert!(delay >= Duration::from_secs(90), "delay {delay:?}");
    assert!(delay <= Duration::from_secs(120), "delay {delay:?}");

    // Second identical failure doubles the schedule.
    connection.handle_reconnect_timer(now());
    establish(&mut connection);
    let actions = deliver(&mut connection, &try_again_error());
    let delay = reconnect_delay(&actions).expect("second delay");
    assert!(delay >= Duration::from_secs(180), "delay {delay:?}");
    assert!(delay <= Duration::from_secs(240), "delay {delay:?}");

    // Third doubles again.
    connection.handle_reconnect_timer(now());
    establish(&mut connection);
    let actions = deliver(&mut connection, &try_again_error());
    let delay = reconnect_delay(&actions).expect("third delay");
    assert!(delay >= Duration::from_secs(360), "delay {delay:?}");
    assert!(delay <= Duration::from_secs(480), "delay {delay:?}");

    // A DOWNLOAD (real progress) resets the schedule to its start.
    connection.handle_reconnect_timer(now());
    establish(&mut connection);
    // Finish the session handshake so a DOWNLOAD is legal.
    let actions = connection.handle_write_completed(now());
    let _ = actions;
    let ident_from_server = ServerMessage::Ident(protocol::IdentFromServer {
        session_ident: SessionIdent::new(1),
        client_file_ident: 55,
        client_file_ident_salt: 7,
    });
    deliver(&mut connection, &ident_from_server);
    connection.handle_write_completed(now());
    deliver(
        &mut connection,
        &download_message(SessionIdent::new(1), progress(1, 0, 0, 1), 0, true, vec![]),
    );

    let actions = deliver(&mut connection, &try_again_error());
    let delay = reconnect_delay(&actions).expect("reset delay");
    assert!(delay >= Duration::from_secs(90), "delay {delay:?}");
    assert!(delay <= Duration::from_secs(120), "delay {delay:?}");
}

#[test]
fn connect_failures_double_toward_the_cap() {
    let mut connection = normal_mode_harness("connect-double");
    // Repeated connect failures: the delay grows monotonically (modulo
    // jitter) and never exceeds five minutes.
    let mut last_upper = Duration::ZERO;
    for _ in 0..12 {
        let actions = connection.handle_closed(
            driftwire::CloseCode::ResolveOrConnectFailed,
            "connection refused",
            now(),
        );
        let delay = reconnect_delay(&actions).expect("reconnect armed");
        assert!(delay <= Duration::from_secs(300));
        last_upper = last_upper.max(delay);
        connection.handle_reconnect_timer(now());
    }
    // After enough failures the envelope saturates near the cap.
    assert!(last_upper > Duration::from_secs(150), "envelope {last_upper:?}");
}

#[test]
fn fatal_http_response_takes_the_cool_off() {
    let mut connection = normal_mode_harness("fatal-cooloff");
    let actions = connection.handle_closed(driftwire::CloseCode::Forbidden, "403", now());
    let delay = reconnect_delay(&actions).expect("reconnect armed");
    assert!(delay >= Duration::from_secs(2700), "delay {delay:?}");
    assert!(delay <= Duration::from_secs(3600), "delay {delay:?}");
}
