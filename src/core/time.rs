//! Clock primitives for timers and heartbeat timestamps.

use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds on the process-local monotonic clock.
///
/// PING timestamps and reconnect deadlines live on this clock; it never
/// goes backwards and is meaningless outside this process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonotonicMillis(pub u64);

impl MonotonicMillis {
    pub fn now() -> Self {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        Self(epoch.elapsed().as_millis() as u64)
    }

    pub fn saturating_sub(self, other: MonotonicMillis) -> u64 {
        self.0.saturating_sub(other.0)
    }

    pub fn saturating_add_ms(self, delta_ms: u64) -> MonotonicMillis {
        MonotonicMillis(self.0.saturating_add(delta_ms))
    }
}

/// Milliseconds since the Unix epoch, for origin timestamps and persisted
/// markers. Not used for ordering decisions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WallClockMillis(pub u64);

impl WallClockMillis {
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}
