//! Application-level session lifecycle.
//!
//! Above the transport-level session sits the lifecycle the application
//! observes: `Inactive`, `WaitingForAccessToken`, `Active`, `Dying` (close
//! with `AfterChangesUploaded` pending), and sticky `Paused`. Completion
//! waits registered by the application survive transitions through
//! `Inactive` by being re-registered when the session next activates.

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::config::StopPolicy;
use crate::core::SessionErrorInfo;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Inactive,
    WaitingForAccessToken,
    Active,
    /// Closing once pending changes are uploaded; revivable.
    Dying,
    /// Sticky: only `resume()` leaves.
    Paused,
}

/// What the lifecycle asks the event loop to do with the transport session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEffect {
    /// Create/bind the transport session.
    StartSession,
    /// Orderly UNBIND.
    StopSession,
    /// Drop the transport session without the UNBIND round trip.
    AbortSession,
    /// Ask the transport session to watch for upload completion.
    RequestUploadCompletion,
    /// Ask the transport session for a MARK round trip.
    RequestDownloadCompletion,
}

/// The result delivered to a completion waiter.
pub type WaitResult = Result<(), SessionErrorInfo>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaitKind {
    Upload,
    Download,
}

struct Waiter {
    kind: WaitKind,
    sender: Sender<WaitResult>,
}

pub struct SessionLifecycle {
    state: LifecycleState,
    /// Bumped on every transition into Dying; a revive invalidates the
    /// pending wait-then-stop.
    death_count: u64,
    cancel_waits_on_nonfatal_error: bool,
    waiters: Vec<Waiter>,
}

impl SessionLifecycle {
    pub fn new(cancel_waits_on_nonfatal_error: bool) -> Self {
        Self {
            state: LifecycleState::Inactive,
            death_count: 0,
            cancel_waits_on_nonfatal_error,
            waiters: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn death_count(&self) -> u64 {
        self.death_count
    }

    /// Brings the session up if the current state calls for it.
    /// `token_valid` decides between `Active` and `WaitingForAccessToken`.
    pub fn revive_if_needed(&mut self, token_valid: bool) -> Vec<LifecycleEffect> {
        match self.state {
            LifecycleState::Active
            | LifecycleState::WaitingForAccessToken
            | LifecycleState::Paused => Vec::new(),
            LifecycleState::Inactive | LifecycleState::Dying => self.do_revive(token_valid),
        }
    }

    fn do_revive(&mut self, token_valid: bool) -> Vec<LifecycleEffect> {
        let reviving_from_dying = self.state == LifecycleState::Dying;
        if token_valid {
            self.state = LifecycleState::Active;
            let mut effects = Vec::new();
            if !reviving_from_dying {
                effects.push(LifecycleEffect::StartSession);
            }
            // Waits registered while inactive are now re-armed.
            effects.extend(self.rearm_effects());
            effects
        } else {
            self.state = LifecycleState::WaitingForAccessToken;
            Vec::new()
        }
    }

    /// A fresh access token arrived while waiting for one.
    pub fn access_token_arrived(&mut self) -> Vec<LifecycleEffect> {
        if self.state != LifecycleState::WaitingForAccessToken {
            return Vec::new();
        }
        self.state = LifecycleState::Active;
        let mut effects = vec![LifecycleEffect::StartSession];
        effects.extend(self.rearm_effects());
        effects
    }

    pub fn close(&mut self, policy: StopPolicy) -> Vec<LifecycleEffect> {
        match self.state {
            LifecycleState::Inactive | LifecycleState::Paused => Vec::new(),
            LifecycleState::Dying => Vec::new(),
            LifecycleState::WaitingForAccessToken => {
                self.state = LifecycleState::Inactive;
                Vec::new()
            }
            LifecycleState::Active => match policy {
                StopPolicy::LiveIndefinitely => Vec::new(),
                StopPolicy::Immediate => {
                    self.state = LifecycleState::Inactive;
                    vec![LifecycleEffect::StopSession]
                }
                StopPolicy::AfterChangesUploaded => {
                    self.state = LifecycleState::Dying;
                    self.death_count += 1;
                    vec![LifecycleEffect::RequestUploadCompletion]
                }
            },
        }
    }

    /// Sticky pause; only `resume` leaves this state.
    pub fn pause(&mut self) -> Vec<LifecycleEffect> {
        let was_up = matches!(
            self.state,
            LifecycleState::Active | LifecycleState::Dying | LifecycleState::WaitingForAccessToken
        );
        self.state = LifecycleState::Paused;
        if was_up {
            vec![LifecycleEffect::StopSession]
        } else {
            Vec::new()
        }
    }

    pub fn resume(&mut self, token_valid: bool) -> Vec<LifecycleEffect> {
        if self.state != LifecycleState::Paused {
            return self.revive_if_needed(token_valid);
        }
        self.state = LifecycleState::Inactive;
        self.do_revive(token_valid)
    }

    /// Upload completion reported by the transport session.
    pub fn on_upload_completed(&mut self, death_count_at_request: u64) -> Vec<LifecycleEffect> {
        self.resolve_waiters(WaitKind::Upload, Ok(()));
        if self.state == LifecycleState::Dying && self.death_count == death_count_at_request {
            self.state = LifecycleState::Inactive;
            return vec![LifecycleEffect::StopSession];
        }
        Vec::new()
    }

    pub fn on_download_completed(&mut self) {
        self.resolve_waiters(WaitKind::Download, Ok(()));
    }

    /// Fatal error: the session goes inactive and every pending wait
    /// resolves with the error.
    pub fn on_fatal_error(&mut self, error: &SessionErrorInfo) -> Vec<LifecycleEffect> {
        let was_up = matches!(
            self.state,
            LifecycleState::Active | LifecycleState::Dying | LifecycleState::WaitingForAccessToken
        );
        if self.state != LifecycleState::Paused {
            self.state = LifecycleState::Inactive;
        }
        self.cancel_all_waiters(error);
        if was_up {
            vec![LifecycleEffect::AbortSession]
        } else {
            Vec::new()
        }
    }

    /// Non-fatal error: waits are only cancelled when configured, and only
    /// the ones already registered when the error arrived.
    pub fn on_nonfatal_error(&mut self, error: &SessionErrorInfo) {
        if self.state == LifecycleState::Dying && !error.try_again {
            // A dying session gives up on its upload wait.
            self.state = LifecycleState::Inactive;
        }
        if self.cancel_waits_on_nonfatal_error {
            self.cancel_all_waiters(error);
        }
    }

    /// Registers an upload-completion wait. The returned receiver resolves
    /// when the wait completes or is cancelled.
    pub fn wait_for_upload_completion(&mut self) -> (Receiver<WaitResult>, Vec<LifecycleEffect>) {
        self.register_waiter(WaitKind::Upload)
    }

    pub fn wait_for_download_completion(
        &mut self,
    ) -> (Receiver<WaitResult>, Vec<LifecycleEffect>) {
        self.register_waiter(WaitKind::Download)
    }

    fn register_waiter(&mut self, kind: WaitKind) -> (Receiver<WaitResult>, Vec<LifecycleEffect>) {
        let (tx, rx) = unbounded();
        self.waiters.push(Waiter { kind, sender: tx });
        let effects = if self.state == LifecycleState::Active {
            vec![match kind {
                WaitKind::Upload => LifecycleEffect::RequestUploadCompletion,
                WaitKind::Download => LifecycleEffect::RequestDownloadCompletion,
            }]
        } else {
            // Re-armed when the session next reaches Active.
            Vec::new()
        };
        (rx, effects)
    }

    /// The completion requests to replay when re-entering Active.
    fn rearm_effects(&self) -> Vec<LifecycleEffect> {
        let mut effects = Vec::new();
        if self.waiters.iter().any(|w| w.kind == WaitKind::Upload) {
            effects.push(LifecycleEffect::RequestUploadCompletion);
        }
        if self.waiters.iter().any(|w| w.kind == WaitKind::Download) {
            effects.push(LifecycleEffect::RequestDownloadCompletion);
        }
        effects
    }

    fn resolve_waiters(&mut self, kind: WaitKind, result: WaitResult) {
        let mut index = 0;
        while index < self.waiters.len() {
            if self.waiters[index].kind == kind {
                let waiter = self.waiters.remove(index);
                let _ = waiter.sender.send(result.clone());
            } else {
                index += 1;
            }
        }
    }

    fn cancel_all_waiters(&mut self, error: &SessionErrorInfo) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.sender.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fatal_error() -> SessionErrorInfo {
        SessionErrorInfo::new(203, "bad auth", false)
    }

    fn nonfatal_error() -> SessionErrorInfo {
        SessionErrorInfo::new(221, "transient", true)
    }

    #[test]
    fn revive_with_valid_token_activates() {
        let mut lifecycle = SessionLifecycle::new(false);
        let effects = lifecycle.revive_if_needed(true);
        assert_eq!(lifecycle.state(), LifecycleState::Active);
        assert_eq!(effects, vec![LifecycleEffect::StartSession]);
    }

    #[test]
    fn revive_with_expired_token_waits() {
        let mut lifecycle = SessionLifecycle::new(false);
        let effects = lifecycle.revive_if_needed(false);
        assert_eq!(lifecycle.state(), LifecycleState::WaitingForAccessToken);
        assert!(effects.is_empty());

        let effects = lifecycle.access_token_arrived();
        assert_eq!(lifecycle.state(), LifecycleState::Active);
        assert_eq!(effects, vec![LifecycleEffect::StartSession]);
    }

    #[test]
    fn close_immediate_deactivates() {
        let mut lifecycle = SessionLifecycle::new(false);
        lifecycle.revive_if_needed(true);
        let effects = lifecycle.close(StopPolicy::Immediate);
        assert_eq!(lifecycle.state(), LifecycleState::Inactive);
        assert_eq!(effects, vec![LifecycleEffect::StopSession]);
    }

    #[test]
    fn close_after_changes_uploaded_dies_then_deactivates() {
        let mut lifecycle = SessionLifecycle::new(false);
        lifecycle.revive_if_needed(true);
        let effects = lifecycle.close(StopPolicy::AfterChangesUploaded);
        assert_eq!(lifecycle.state(), LifecycleState::Dying);
        assert_eq!(effects, vec![LifecycleEffect::RequestUploadCompletion]);

        let effects = lifecycle.on_upload_completed(lifecycle.death_count());
        assert_eq!(lifecycle.state(), LifecycleState::Inactive);
        assert_eq!(effects, vec![LifecycleEffect::StopSession]);
    }

    #[test]
    fn revive_from_dying_cancels_the_pending_stop() {
        let mut lifecycle = SessionLifecycle::new(false);
        lifecycle.revive_if_needed(true);
        lifecycle.close(StopPolicy::AfterChangesUploaded);
        let death_count = lifecycle.death_count();

        let effects = lifecycle.revive_if_needed(true);
        assert_eq!(lifecycle.state(), LifecycleState::Active);
        // The transport session is still up: no StartSession.
        assert!(!effects.contains(&LifecycleEffect::StartSession));

        // The stale completion no longer stops the session.
        let effects = lifecycle.on_upload_completed(death_count);
        assert!(effects.is_empty());
        assert_eq!(lifecycle.state(), LifecycleState::Active);
    }

    #[test]
    fn pause_is_sticky() {
        let mut lifecycle = SessionLifecycle::new(false);
        lifecycle.revive_if_needed(true);
        let effects = lifecycle.pause();
        assert_eq!(lifecycle.state(), LifecycleState::Paused);
        assert_eq!(effects, vec![LifecycleEffect::StopSession]);

        // revive does not leave Paused
        assert!(lifecycle.revive_if_needed(true).is_empty());
        assert_eq!(lifecycle.state(), LifecycleState::Paused);

        // only resume does
        let effects = lifecycle.resume(true);
        assert_eq!(lifecycle.state(), LifecycleState::Active);
        assert!(effects.contains(&LifecycleEffect::StartSession));
    }

    #[test]
    fn waits_survive_inactive_transitions() {
        let mut lifecycle = SessionLifecycle::new(false);
        let (rx, effects) = lifecycle.wait_for_upload_completion();
        // Not active yet: nothing to request.
        assert!(effects.is_empty());

        let effects = lifecycle.revive_if_needed(true);
        assert!(effects.contains(&LifecycleEffect::RequestUploadCompletion));

        lifecycle.on_upload_completed(0);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn fatal_error_cancels_waits_with_the_error() {
        let mut lifecycle = SessionLifecycle::new(false);
        lifecycle.revive_if_needed(true);
        let (rx, _) = lifecycle.wait_for_download_completion();

        let effects = lifecycle.on_fatal_error(&fatal_error());
        assert_eq!(lifecycle.state(), LifecycleState::Inactive);
        assert_eq!(effects, vec![LifecycleEffect::AbortSession]);
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn nonfatal_error_cancels_waits_only_when_configured() {
        let mut lifecycle = SessionLifecycle::new(false);
        lifecycle.revive_if_needed(true);
        let (rx, _) = lifecycle.wait_for_upload_completion();
        lifecycle.on_nonfatal_error(&nonfatal_error());
        assert!(rx.try_recv().is_err()); // still pending

        let mut lifecycle = SessionLifecycle::new(true);
        lifecycle.revive_if_needed(true);
        let (rx, _) = lifecycle.wait_for_upload_completion();
        lifecycle.on_nonfatal_error(&nonfatal_error());
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn waits_registered_after_a_nonfatal_error_are_kept() {
        // The cancel applies to waits pending at error arrival, not to
        // ones registered afterwards.
        let mut lifecycle = SessionLifecycle::new(true);
        lifecycle.revive_if_needed(true);
        lifecycle.on_nonfatal_error(&nonfatal_error());
        let (rx, _) = lifecycle.wait_for_upload_completion();
        assert!(rx.try_recv().is_err()); // pending, not cancelled
        lifecycle.on_upload_completed(0);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }
}
