//! Versioned subscription sets for flexible sync.
//!
//! A subscription set is an immutable snapshot of the queries a client
//! wants synchronized. Sets are versioned; only one version is active at a
//! time. Newer versions move Pending → Bootstrapping → AwaitingMark →
//! Complete as the server replies, and every version older than a
//! completed one becomes Superseded.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::core::{ClientVersion, QueryVersion};

/// Lifecycle of one subscription set version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionSetState {
    /// Being assembled by the application; not yet visible to the session.
    Uncommitted,
    /// Committed locally, not yet acknowledged by the server.
    Pending,
    /// The server started streaming the bootstrap for this version.
    Bootstrapping,
    /// Bootstrap stored and applied; waiting for the MARK round trip.
    AwaitingMark,
    /// The server confirmed delivery; this version is fully synchronized.
    Complete,
    /// The server rejected the query.
    Error(String),
    /// A newer version reached `Complete` first.
    Superseded,
}

impl SubscriptionSetState {
    /// Terminal states resolve waiters.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionSetState::Complete
                | SubscriptionSetState::Error(_)
                | SubscriptionSetState::Superseded
        )
    }
}

/// One named query inside a set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub name: Option<String>,
    pub object_class: String,
    pub query: String,
}

#[derive(Clone, Debug)]
pub struct SubscriptionSet {
    pub version: QueryVersion,
    pub subscriptions: Vec<Subscription>,
    pub state: SubscriptionSetState,
    /// Local version at which this set was committed; uploads up to here
    /// must precede the QUERY message.
    pub snapshot_version: ClientVersion,
}

impl SubscriptionSet {
    /// The wire form of the query set sent in IDENT/QUERY messages.
    pub fn query_body(&self) -> String {
        serde_json::to_string(&self.subscriptions).expect("subscriptions serialize")
    }
}

struct StoreInner {
    sets: BTreeMap<QueryVersion, SubscriptionSet>,
    active_version: QueryVersion,
    waiters: BTreeMap<QueryVersion, Vec<Sender<SubscriptionSetState>>>,
}

/// The per-file registry of subscription set versions.
#[derive(Clone)]
pub struct SubscriptionStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl SubscriptionStore {
    /// Starts with the empty set at version 0, already complete.
    pub fn new() -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(
            QueryVersion::ZERO,
            SubscriptionSet {
                version: QueryVersion::ZERO,
                subscriptions: Vec::new(),
                state: SubscriptionSetState::Complete,
                snapshot_version: ClientVersion::ZERO,
            },
        );
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                sets,
                active_version: QueryVersion::ZERO,
                waiters: BTreeMap::new(),
            })),
        }
    }

    pub fn active(&self) -> SubscriptionSet {
        let inner = self.inner.lock().expect("subscription store poisoned");
        inner
            .sets
            .get(&inner.active_version)
            .cloned()
            .expect("active set always present")
    }

    pub fn latest(&self) -> SubscriptionSet {
        let inner = self.inner.lock().expect("subscription store poisoned");
        inner
            .sets
            .values()
            .next_back()
            .cloned()
            .expect("at least the empty set present")
    }

    pub fn get(&self, version: QueryVersion) -> Option<SubscriptionSet> {
        let inner = self.inner.lock().expect("subscription store poisoned");
        inner.sets.get(&version).cloned()
    }

    /// Commits a new set version in `Pending` state and returns it.
    pub fn commit_update(
        &self,
        subscriptions: Vec<Subscription>,
        snapshot_version: ClientVersion,
    ) -> SubscriptionSet {
        let mut inner = self.inner.lock().expect("subscription store poisoned");
        let version = inner
            .sets
            .keys()
            .next_back()
            .copied()
            .unwrap_or(QueryVersion::ZERO)
            .next();
        let set = SubscriptionSet {
            version,
            subscriptions,
            state: SubscriptionSetState::Pending,
            snapshot_version,
        };
        inner.sets.insert(version, set.clone());
        set
    }

    /// The next committed version newer than the active one, if any.
    pub fn next_pending(&self) -> Option<SubscriptionSet> {
        let inner = self.inner.lock().expect("subscription store poisoned");
        inner
            .sets
            .range(inner.active_version.next()..)
            .map(|(_, set)| set)
            .find(|set| set.state == SubscriptionSetState::Pending)
            .cloned()
    }

    /// Applies a protocol-driven state transition.
    pub fn set_state(&self, version: QueryVersion, state: SubscriptionSetState) {
        let mut inner = self.inner.lock().expect("subscription store poisoned");
        let became_complete = state == SubscriptionSetState::Complete;
        if let Some(set) = inner.sets.get_mut(&version) {
            set.state = state.clone();
        }
        if became_complete {
            inner.active_version = inner.active_version.max(version);
            // Everything older that never completed is now superseded.
            let superseded: Vec<QueryVersion> = inner
                .sets
                .range(..version)
                .filter(|(_, set)| !set.state.is_terminal())
                .map(|(v, _)| *v)
                .collect();
            for old in superseded {
                if let Some(set) = inner.sets.get_mut(&old) {
                    set.state = SubscriptionSetState::Superseded;
                }
                Self::notify(&mut inner, old, SubscriptionSetState::Superseded);
            }
        }
        Self::notify(&mut inner, version, state);
    }

    fn notify(inner: &mut StoreInner, version: QueryVersion, state: SubscriptionSetState) {
        if !state.is_terminal() {
            return;
        }
        if let Some(waiters) = inner.waiters.remove(&version) {
            for waiter in waiters {
                let _ = waiter.send(state.clone());
            }
        }
    }

    /// A receiver resolved when `version` reaches a terminal state.
    pub fn wait_for_terminal(&self, version: QueryVersion) -> Receiver<SubscriptionSetState> {
        let (tx, rx) = unbounded();
        let mut inner = self.inner.lock().expect("subscription store poisoned");
        let current = inner.sets.get(&version).map(|set| set.state.clone());
        match current {
            Some(state) if state.is_terminal() => {
                let _ = tx.send(state);
            }
            _ => {
                inner.waiters.entry(version).or_default().push(tx);
            }
        }
        rx
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
