//! Reconnect delay computation, one controller per server endpoint.
//!
//! The delay depends on why the previous connection ended. Voluntary
//! terminations restart from the minimum; failed connection attempts double
//! the previous delay up to a cap; fatal causes take a one-hour cool-off;
//! `try_again` errors follow the server-provided schedule counted from the
//! moment the ERROR arrived. Every computed delay gets a randomized
//! deduction of up to a quarter, and the time already elapsed since the
//! delay started counting is subtracted.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

use crate::core::{MonotonicMillis, ResumptionDelayState, TerminationReason};

pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);
pub const FATAL_COOL_OFF: Duration = Duration::from_secs(3600);

/// Reconnect scheduling mode. Testing collapses voluntary-cause delays to
/// zero and stretches everything else to infinity so tests control timing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReconnectMode {
    #[default]
    Normal,
    Testing,
}

/// What the controller decided for the next connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDelay {
    After(Duration),
    Indefinite,
}

impl ReconnectDelay {
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            ReconnectDelay::After(delay) => Some(delay),
            ReconnectDelay::Indefinite => None,
        }
    }
}

/// Per-endpoint reconnect bookkeeping.
#[derive(Debug)]
pub struct ReconnectInfo {
    /// Why the last connection ended; `None` while a delay is in progress.
    reason: Option<TerminationReason>,
    /// When the current delay started counting (connect initiation, or
    /// ERROR reception for try-again causes).
    time_point: MonotonicMillis,
    /// The undeducted delay used last time, for doubling.
    delay: Duration,
    /// Server-dictated schedule for try-again causes.
    resumption: ResumptionDelayState,
    /// Set by `cancel_reconnect_delay` on an established connection;
    /// consumed at the next delay computation, cleared by a verifying PONG.
    pub scheduled_reset: bool,
}

impl ReconnectInfo {
    pub fn new() -> Self {
        Self {
            reason: None,
            time_point: MonotonicMillis::now(),
            delay: Duration::ZERO,
            resumption: ResumptionDelayState::new(Default::default()),
            scheduled_reset: false,
        }
    }

    pub fn reset(&mut self) {
        self.reason = None;
        self.time_point = MonotonicMillis::now();
        self.delay = Duration::ZERO;
        self.resumption.reset();
        self.scheduled_reset = false;
    }

    /// Records the cause of a termination. For `ServerSaidTryAgainLater`
    /// the caller passes the moment the ERROR arrived so the delay counts
    /// from reception, not from the next connect attempt.
    pub fn record_termination(&mut self, reason: TerminationReason, at: MonotonicMillis) {
        self.reason = Some(reason);
        self.time_point = at;
    }

    /// Marks the start of a connect attempt; the next delay counts from
    /// here unless a try-again cause moved it earlier.
    pub fn record_connect_attempt(&mut self, at: MonotonicMillis) {
        self.time_point = at;
    }

    pub fn update_resumption_info(&mut self, info: crate::core::ResumptionDelayInfo) {
        if self.resumption.info() != &info {
            self.resumption = ResumptionDelayState::new(info);
        }
    }

    pub fn clear_resumption_state(&mut self) {
        self.resumption.reset();
    }

    pub fn reason(&self) -> Option<TerminationReason> {
        self.reason
    }
}

impl Default for ReconnectInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the delay before the next connect attempt and updates the
/// bookkeeping. Called exactly once per reconnect-wait initiation.
pub fn compute_reconnect_delay(
    info: &mut ReconnectInfo,
    mode: ReconnectMode,
    rng: &mut StdRng,
    now: MonotonicMillis,
) -> ReconnectDelay {
    if info.scheduled_reset {
        info.reset();
    }

    let Some(reason) = info.reason.take() else {
        // A delay is already in progress; honor its remaining portion.
        let remaining = info.time_point.saturating_sub(now);
        return ReconnectDelay::After(Duration::from_millis(remaining));
    };

    if mode == ReconnectMode::Testing {
        return if reason.was_voluntary() {
            info.delay = Duration::ZERO;
            ReconnectDelay::After(Duration::ZERO)
        } else {
            ReconnectDelay::Indefinite
        };
    }

    let mut record_delay_as_zero = false;
    let delay = match reason {
        TerminationReason::ClosedVoluntarily
        | TerminationReason::ReadOrWriteError
        | TerminationReason::PongTimeout => MIN_RECONNECT_DELAY,
        TerminationReason::ConnectOperationFailed
        | TerminationReason::HttpResponseSaysNonfatalError
        | TerminationReason::SyncConnectTimeout => {
            let doubled = info.delay.checked_mul(2).unwrap_or(MAX_RECONNECT_DELAY);
            doubled.clamp(MIN_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
        }
        TerminationReason::ServerSaidTryAgainLater => {
            record_delay_as_zero = true;
            info.resumption.next_delay()
        }
        TerminationReason::SslCertificateRejected
        | TerminationReason::SslProtocolViolation
        | TerminationReason::WebSocketProtocolViolation
        | TerminationReason::HttpResponseSaysFatalError
        | TerminationReason::BadHeadersInHttpResponse
        | TerminationReason::SyncProtocolViolation
        | TerminationReason::ServerSaidDoNotReconnect
        | TerminationReason::MissingProtocolFeature => {
            record_delay_as_zero = true;
            FATAL_COOL_OFF
        }
    };

    // Randomized deduction of up to 25% so clients that dropped together
    // do not come back together.
    let deduction_ceiling = delay.as_millis() as u64 / 4;
    let deduction = if deduction_ceiling > 0 {
        rng.gen_range(0..=deduction_ceiling)
    } else {
        0
    };
    let randomized = delay - Duration::from_millis(deduction);

    // Deduct time already spent since the delay started counting.
    let elapsed = Duration::from_millis(now.saturating_sub(info.time_point));
    let remaining = randomized.saturating_sub(elapsed);

    info.delay = if record_delay_as_zero {
        Duration::ZERO
    } else {
        delay
    };
    info.time_point = now.saturating_add_ms(remaining.as_millis() as u64);

    ReconnectDelay::After(remaining)
}
