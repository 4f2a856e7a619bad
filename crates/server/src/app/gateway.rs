use crate::directory::UserDirectory;
use crate::metrics::Metrics;
use callwire_presence::{PresenceCache, PresenceKey};
use callwire_signal::SignalStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

const TYPING_SCOPE: &str = "typing";

/// Presence key for "`signaler` is typing toward `target`".
pub(super) fn typing_key(signaler: &str, target: &str) -> PresenceKey {
    PresenceKey::new(TYPING_SCOPE, signaler, target)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallEntry {
    pub from_user_id: String,
    pub from_user_name: String,
    pub from_user_image: Option<String>,
    pub from_user_email: Option<String>,
}

/// Translates store state into identity-scoped, profile-enriched results.
/// Every operation takes the authenticated identity; there is no way to
/// address another identity's inbox.
pub struct PollGateway {
    signals: Arc<SignalStore>,
    presence: Arc<PresenceCache>,
    directory: Arc<dyn UserDirectory + Send + Sync>,
    metrics: Arc<Metrics>,
}

impl PollGateway {
    pub fn new(
        signals: Arc<SignalStore>,
        presence: Arc<PresenceCache>,
        directory: Arc<dyn UserDirectory + Send + Sync>,
        metrics: Arc<Metrics>,
    ) -> Self {
        PollGateway {
            signals,
            presence,
            directory,
            metrics,
        }
    }

    /// Ringing handshakes addressed to `for_user`, enriched with the
    /// caller's public profile. A failed lookup drops that entry only;
    /// the rest of the list is still served.
    pub async fn list_incoming_calls(&self, for_user: &str) -> Vec<IncomingCallEntry> {
        let ringing = self.signals.poll_incoming(for_user).await;
        let mut entries = Vec::with_capacity(ringing.len());
        for pair in ringing {
            match self.directory.lookup(&pair.caller).await {
                Ok(profile) => entries.push(IncomingCallEntry {
                    from_user_id: profile.user_id,
                    from_user_name: profile.display_name,
                    from_user_image: profile.avatar_url,
                    from_user_email: profile.email,
                }),
                Err(error) => {
                    warn!(
                        caller = %pair.caller,
                        error = %error,
                        "caller profile lookup failed, dropping ringing entry"
                    );
                    self.metrics.mark_profile_lookup_dropped();
                }
            }
        }
        entries
    }

    /// True while `other_user` holds an unexpired typing signal toward
    /// `for_user` (the reverse direction of how the signaler wrote it).
    pub async fn is_peer_typing(&self, for_user: &str, other_user: &str) -> bool {
        self.presence
            .get_signal(&typing_key(other_user, for_user))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryProfile, StaticDirectory};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::sleep;

    fn profile(user_id: &str, name: &str) -> DirectoryProfile {
        DirectoryProfile {
            user_id: user_id.to_string(),
            display_name: name.to_string(),
            avatar_url: Some(format!("/uploads/{user_id}.png")),
            email: Some(format!("{user_id}@example.org")),
        }
    }

    fn gateway_with(
        directory: StaticDirectory,
    ) -> (Arc<SignalStore>, Arc<PresenceCache>, PollGateway) {
        let signals = Arc::new(SignalStore::new());
        let presence = Arc::new(PresenceCache::new(None));
        let gateway = PollGateway::new(
            Arc::clone(&signals),
            Arc::clone(&presence),
            Arc::new(directory),
            Arc::new(Metrics::new()),
        );
        (signals, presence, gateway)
    }

    #[tokio::test]
    async fn incoming_calls_are_enriched_and_scoped() {
        let (signals, _presence, gateway) =
            gateway_with(StaticDirectory::new().with_profile(profile("u1", "Alice")));
        signals.put_offer("u1", "u2", json!({"sdp": "offer"})).await;

        let calls = gateway.list_incoming_calls("u2").await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].from_user_id, "u1");
        assert_eq!(calls[0].from_user_name, "Alice");
        assert_eq!(calls[0].from_user_image.as_deref(), Some("/uploads/u1.png"));
        assert_eq!(calls[0].from_user_email.as_deref(), Some("u1@example.org"));

        assert!(gateway.list_incoming_calls("u3").await.is_empty());
    }

    #[tokio::test]
    async fn lookup_failure_drops_only_that_entry() {
        let (signals, _presence, gateway) =
            gateway_with(StaticDirectory::new().with_profile(profile("u1", "Alice")));
        signals.put_offer("u1", "u2", json!({"sdp": "a"})).await;
        signals.put_offer("ghost", "u2", json!({"sdp": "b"})).await;

        let calls = gateway.list_incoming_calls("u2").await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].from_user_id, "u1");
    }

    #[tokio::test(start_paused = true)]
    async fn ringing_window_scenario() {
        let (signals, _presence, gateway) =
            gateway_with(StaticDirectory::new().with_profile(profile("u1", "Alice")));
        signals.put_offer("u1", "u2", json!({"sdp": "offer"})).await;

        sleep(Duration::from_secs(10)).await;
        assert_eq!(gateway.list_incoming_calls("u2").await.len(), 1);

        sleep(Duration::from_secs(25)).await;
        assert!(gateway.list_incoming_calls("u2").await.is_empty());

        sleep(Duration::from_secs(30)).await;
        signals.sweep().await;
        assert!(!signals.contains("u1", "u2").await);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_scenario() {
        let (_signals, presence, gateway) = gateway_with(StaticDirectory::new());
        presence
            .set_signal(&typing_key("u1", "u2"), Duration::from_secs(3))
            .await;

        assert!(gateway.is_peer_typing("u2", "u1").await);
        // Direction matters: u1 sees nothing from u2.
        assert!(!gateway.is_peer_typing("u1", "u2").await);

        sleep(Duration::from_secs(4)).await;
        assert!(!gateway.is_peer_typing("u2", "u1").await);
    }
}
