use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::warn;

#[derive(Debug)]
pub enum PresenceError {
    Backend,
}

impl Display for PresenceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend => write!(f, "shared cache failure"),
        }
    }
}

impl Error for PresenceError {}

/// Directed short-TTL signal key: `from` signals an activity in `scope`
/// toward `to`. A genuine compound value; the delimited rendering exists
/// only at the shared-cache boundary and escapes its separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresenceKey {
    pub scope: String,
    pub from: String,
    pub to: String,
}

impl PresenceKey {
    pub fn new(scope: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        PresenceKey {
            scope: scope.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    fn storage_key(&self) -> String {
        format!(
            "signal:{}:{}:{}",
            escape_component(&self.scope),
            escape_component(&self.from),
            escape_component(&self.to)
        )
    }
}

fn escape_component(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3a")
}

/// Lifecycle of the shared-cache connection. There is no transition out of
/// `Degraded` within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Uninitialized,
    Connected,
    Degraded,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Uninitialized => "uninitialized",
            BackendStatus::Connected => "connected",
            BackendStatus::Degraded => "degraded",
        }
    }
}

enum Backend {
    Uninitialized,
    Connected(redis::aio::MultiplexedConnection),
    Degraded,
}

/// Short-TTL boolean signal store. Prefers a shared Redis backend so every
/// service instance observes the same signals; degrades permanently to a
/// process-local map on the first connectivity failure. Callers never
/// observe which backend served a call.
pub struct PresenceCache {
    redis_url: Option<String>,
    backend: Mutex<Backend>,
    local: Arc<Mutex<HashMap<PresenceKey, Instant>>>,
    connect_attempts: AtomicU64,
}

impl PresenceCache {
    /// A cache without a configured URL never touches the network and
    /// serves everything from the local map.
    pub fn new(redis_url: Option<String>) -> Self {
        let backend = match redis_url {
            Some(_) => Backend::Uninitialized,
            None => Backend::Degraded,
        };
        PresenceCache {
            redis_url,
            backend: Mutex::new(backend),
            local: Arc::new(Mutex::new(HashMap::new())),
            connect_attempts: AtomicU64::new(0),
        }
    }

    /// Marks the key's signal true for `ttl`, refreshing the window on
    /// every call. Backend failures are absorbed.
    pub async fn set_signal(&self, key: &PresenceKey, ttl: Duration) {
        if self.backend_set(key, ttl).await {
            return;
        }
        self.local_set(key, ttl).await;
    }

    /// True while the key holds an unexpired signal. "Never set" and
    /// "expired" are indistinguishable by design.
    pub async fn get_signal(&self, key: &PresenceKey) -> bool {
        match self.backend_get(key).await {
            Some(found) => found,
            None => self.local_get(key).await,
        }
    }

    pub async fn backend_status(&self) -> BackendStatus {
        let slot = self.backend.lock().await;
        match &*slot {
            Backend::Uninitialized => BackendStatus::Uninitialized,
            Backend::Connected(_) => BackendStatus::Connected,
            Backend::Degraded => BackendStatus::Degraded,
        }
    }

    /// Connection attempts made so far; never exceeds one.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Returns a live connection, performing the lazy once-per-process
    /// connection attempt on first use. `None` means the local path must
    /// serve the call.
    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        let mut slot = self.backend.lock().await;
        match &*slot {
            Backend::Connected(connection) => Some(connection.clone()),
            Backend::Degraded => None,
            Backend::Uninitialized => {
                let url = self.redis_url.as_deref()?;
                self.connect_attempts.fetch_add(1, Ordering::SeqCst);
                match connect(url).await {
                    Ok(connection) => {
                        *slot = Backend::Connected(connection.clone());
                        Some(connection)
                    }
                    Err(error) => {
                        warn!(error = %error, "shared cache unreachable, serving signals locally");
                        *slot = Backend::Degraded;
                        None
                    }
                }
            }
        }
    }

    async fn degrade(&self) {
        let mut slot = self.backend.lock().await;
        if !matches!(*slot, Backend::Degraded) {
            warn!("shared cache failed at runtime, serving signals locally");
            *slot = Backend::Degraded;
        }
    }

    async fn backend_set(&self, key: &PresenceKey, ttl: Duration) -> bool {
        let Some(mut connection) = self.connection().await else {
            return false;
        };
        let result = redis::cmd("SETEX")
            .arg(key.storage_key())
            .arg(ttl.as_secs().max(1))
            .arg(1)
            .query_async::<()>(&mut connection)
            .await;
        match result {
            Ok(()) => true,
            Err(_) => {
                self.degrade().await;
                false
            }
        }
    }

    async fn backend_get(&self, key: &PresenceKey) -> Option<bool> {
        let mut connection = self.connection().await?;
        let result = redis::cmd("EXISTS")
            .arg(key.storage_key())
            .query_async::<bool>(&mut connection)
            .await;
        match result {
            Ok(found) => Some(found),
            Err(_) => {
                self.degrade().await;
                None
            }
        }
    }

    async fn local_set(&self, key: &PresenceKey, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        {
            let mut map = self.local.lock().await;
            map.insert(key.clone(), expires_at);
        }
        // Deferred cleanup at TTL elapse. A refresh moves the stored
        // expiry forward, so the stale task re-checks before removing.
        let map = Arc::clone(&self.local);
        let key = key.clone();
        tokio::spawn(async move {
            sleep_until(expires_at).await;
            let mut map = map.lock().await;
            if map
                .get(&key)
                .is_some_and(|expiry| *expiry <= Instant::now())
            {
                map.remove(&key);
            }
        });
    }

    async fn local_get(&self, key: &PresenceKey) -> bool {
        let map = self.local.lock().await;
        map.get(key).is_some_and(|expiry| *expiry > Instant::now())
    }
}

async fn connect(url: &str) -> Result<redis::aio::MultiplexedConnection, PresenceError> {
    let client = redis::Client::open(url).map_err(|_| PresenceError::Backend)?;
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| PresenceError::Backend)
}
