use super::rtc::validated_user_id;
use super::{ApiError, AppState, gateway};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub to_user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TypingResponse {
    is_typing: bool,
}

pub(super) async fn handle_typing_set(
    state: &AppState,
    user_id: &str,
    request: TypingRequest,
) -> Result<Value, ApiError> {
    let target = validated_user_id(&request.to_user_id)?;
    let ttl = Duration::from_secs(state.config.typing_ttl_seconds);
    state
        .presence
        .set_signal(&gateway::typing_key(user_id, target), ttl)
        .await;
    state.metrics.mark_typing_signal();
    Ok(serde_json::json!({ "ok": true }))
}

pub(super) async fn handle_typing_get(
    state: &AppState,
    user_id: &str,
    peer: &str,
) -> Result<Value, ApiError> {
    let peer = validated_user_id(peer)?;
    let is_typing = state.gateway.is_peer_typing(user_id, peer).await;
    state.metrics.mark_typing_poll();
    serde_json::to_value(TypingResponse { is_typing }).map_err(|_| ApiError::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::test_state;
    use serde_json::json;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn typing_surface_roundtrip() {
        let state = test_state().await;
        handle_typing_set(
            &state,
            "u1",
            TypingRequest {
                to_user_id: "u2".to_string(),
            },
        )
        .await
        .unwrap();

        let payload = handle_typing_get(&state, "u2", "u1").await.unwrap();
        assert_eq!(payload["isTyping"], json!(true));

        // The reverse direction carries no signal.
        let payload = handle_typing_get(&state, "u1", "u2").await.unwrap();
        assert_eq!(payload["isTyping"], json!(false));

        sleep(Duration::from_secs(4)).await;
        let payload = handle_typing_get(&state, "u2", "u1").await.unwrap();
        assert_eq!(payload["isTyping"], json!(false));
    }

    #[tokio::test]
    async fn blank_target_is_rejected() {
        let state = test_state().await;
        let result = handle_typing_set(
            &state,
            "u1",
            TypingRequest {
                to_user_id: String::new(),
            },
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
