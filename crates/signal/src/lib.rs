use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tracing::debug;

/// How long an unanswered offer stays visible to `poll_incoming`.
pub const RING_WINDOW: Duration = Duration::from_secs(30);
/// How long an entry is retained before the sweep reclaims it.
pub const RETENTION_WINDOW: Duration = Duration::from_secs(60);
/// Cadence of the background sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum SignalError {
    NotFound,
}

impl Display for SignalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "no pending handshake for pair"),
        }
    }
}

impl Error for SignalError {}

/// Ordered identity pair addressing one call handshake. Kept as two
/// explicit fields so identities containing separator characters cannot
/// collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub caller: String,
    pub callee: String,
}

impl PairKey {
    pub fn new(caller: impl Into<String>, callee: impl Into<String>) -> Self {
        PairKey {
            caller: caller.into(),
            callee: callee.into(),
        }
    }
}

/// Which side of the handshake contributed a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateOrigin {
    Caller,
    Callee,
}

impl CandidateOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateOrigin::Caller => "caller",
            CandidateOrigin::Callee => "callee",
        }
    }
}

/// One live call handshake. Candidates are kept in two origin-tagged
/// sequences, each preserving submission order.
#[derive(Debug, Clone)]
pub struct CallSignal {
    pub offer: Value,
    pub answer: Option<Value>,
    pub caller_candidates: Vec<Value>,
    pub callee_candidates: Vec<Value>,
    pub created_at: Instant,
}

impl CallSignal {
    fn new(offer: Value) -> Self {
        CallSignal {
            offer,
            answer: None,
            caller_candidates: Vec::new(),
            callee_candidates: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn candidates(&self, origin: CandidateOrigin) -> &[Value] {
        match origin {
            CandidateOrigin::Caller => &self.caller_candidates,
            CandidateOrigin::Callee => &self.callee_candidates,
        }
    }

    fn candidates_mut(&mut self, origin: CandidateOrigin) -> &mut Vec<Value> {
        match origin {
            CandidateOrigin::Caller => &mut self.caller_candidates,
            CandidateOrigin::Callee => &mut self.callee_candidates,
        }
    }

    fn is_ringing(&self, now: Instant) -> bool {
        self.answer.is_none() && now.duration_since(self.created_at) < RING_WINDOW
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > RETENTION_WINDOW
    }
}

/// Transient per-pair store for call handshakes. At most one entry is live
/// per ordered (caller, callee) pair; everything is memory-resident and
/// reclaimed by teardown or the sweep.
pub struct SignalStore {
    entries: RwLock<HashMap<PairKey, CallSignal>>,
}

impl SignalStore {
    pub fn new() -> Self {
        SignalStore {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Creates or replaces the handshake for the pair. A replaced entry
    /// drops its answer and candidates: this is a fresh attempt.
    pub async fn put_offer(&self, caller: &str, callee: &str, offer: Value) {
        let key = PairKey::new(caller, callee);
        let mut entries = self.entries.write().await;
        entries.insert(key, CallSignal::new(offer));
    }

    /// Records the callee's answer. Fails when no handshake exists for the
    /// exact pair; a repeated answer overwrites the previous one.
    pub async fn put_answer(
        &self,
        caller: &str,
        callee: &str,
        answer: Value,
    ) -> Result<(), SignalError> {
        let key = PairKey::new(caller, callee);
        let mut entries = self.entries.write().await;
        let signal = entries.get_mut(&key).ok_or(SignalError::NotFound)?;
        signal.answer = Some(answer);
        Ok(())
    }

    /// Appends a connectivity candidate to the contributing side's sequence.
    pub async fn append_candidate(
        &self,
        caller: &str,
        callee: &str,
        origin: CandidateOrigin,
        candidate: Value,
    ) -> Result<(), SignalError> {
        let key = PairKey::new(caller, callee);
        let mut entries = self.entries.write().await;
        let signal = entries.get_mut(&key).ok_or(SignalError::NotFound)?;
        signal.candidates_mut(origin).push(candidate);
        Ok(())
    }

    /// Removes the handshake for the pair. Idempotent.
    pub async fn teardown(&self, caller: &str, callee: &str) -> bool {
        let key = PairKey::new(caller, callee);
        let mut entries = self.entries.write().await;
        entries.remove(&key).is_some()
    }

    /// Lists the pairs with an unanswered offer younger than the ring
    /// window addressed to `callee`. This is the callee's only discovery
    /// channel.
    pub async fn poll_incoming(&self, callee: &str) -> Vec<PairKey> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut ringing: Vec<PairKey> = entries
            .iter()
            .filter(|(key, signal)| key.callee == callee && signal.is_ringing(now))
            .map(|(key, _)| key.clone())
            .collect();
        ringing.sort_by(|a, b| a.caller.cmp(&b.caller));
        ringing
    }

    /// Clones the live handshake for the pair so either side can poll for
    /// the answer and the remote candidate sequence.
    pub async fn snapshot(&self, caller: &str, callee: &str) -> Option<CallSignal> {
        let key = PairKey::new(caller, callee);
        let entries = self.entries.read().await;
        entries.get(&key).cloned()
    }

    pub async fn contains(&self, caller: &str, callee: &str) -> bool {
        let key = PairKey::new(caller, callee);
        let entries = self.entries.read().await;
        entries.contains_key(&key)
    }

    /// Removes every entry past the retention window, answered or not.
    /// Returns the number of reclaimed entries.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, signal| !signal.is_expired(now));
        before - entries.len()
    }

    /// Starts the periodic sweep for this store instance. The returned
    /// handle owns the task; dropping it without `shutdown` leaves the
    /// task running for the life of the process.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let store = Arc::clone(self);
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep().await;
                        if removed > 0 {
                            debug!(removed, "expired call handshakes swept");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        SweeperHandle { stop: tx, task }
    }
}

impl Default for SignalStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned lifecycle of a store's sweep task.
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the sweep task and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}
