use super::{ApiError, AppState};
use callwire_signal::{CallSignal, CandidateOrigin, PairKey, SignalError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    pub to_user_id: String,
    pub offer: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub peer_user_id: String,
    pub answer: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRequest {
    pub peer_user_id: String,
    pub origin: CandidateOrigin,
    pub candidate: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownRequest {
    pub peer_user_id: String,
    pub origin: CandidateOrigin,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IncomingCallsResponse {
    incoming_calls: Vec<super::gateway::IncomingCallEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    answer: Option<Value>,
    caller_candidates: Vec<Value>,
    callee_candidates: Vec<Value>,
}

impl From<CallSignal> for SessionResponse {
    fn from(signal: CallSignal) -> Self {
        SessionResponse {
            answer: signal.answer,
            caller_candidates: signal.caller_candidates,
            callee_candidates: signal.callee_candidates,
        }
    }
}

pub(super) fn validated_user_id(raw: &str) -> Result<&str, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest("user id must not be empty".to_string()));
    }
    Ok(trimmed)
}

/// Resolves the ordered pair from the requester's side of the handshake.
pub(super) fn signal_pair(requester: &str, peer: &str, origin: CandidateOrigin) -> PairKey {
    match origin {
        CandidateOrigin::Caller => PairKey::new(requester, peer),
        CandidateOrigin::Callee => PairKey::new(peer, requester),
    }
}

fn map_signal_error(error: SignalError) -> ApiError {
    match error {
        SignalError::NotFound => ApiError::NotFound,
    }
}

pub(super) async fn handle_offer(
    state: &AppState,
    user_id: &str,
    request: OfferRequest,
) -> Result<Value, ApiError> {
    let callee = validated_user_id(&request.to_user_id)?;
    if callee == user_id {
        return Err(ApiError::BadRequest("cannot call yourself".to_string()));
    }
    state.signals.put_offer(user_id, callee, request.offer).await;
    state.metrics.mark_offer();
    Ok(json!({ "ok": true }))
}

pub(super) async fn handle_answer(
    state: &AppState,
    user_id: &str,
    request: AnswerRequest,
) -> Result<Value, ApiError> {
    let caller = validated_user_id(&request.peer_user_id)?;
    state
        .signals
        .put_answer(caller, user_id, request.answer)
        .await
        .map_err(map_signal_error)?;
    state.metrics.mark_answer();
    Ok(json!({ "ok": true }))
}

pub(super) async fn handle_candidate(
    state: &AppState,
    user_id: &str,
    request: CandidateRequest,
) -> Result<Value, ApiError> {
    let peer = validated_user_id(&request.peer_user_id)?;
    let pair = signal_pair(user_id, peer, request.origin);
    state
        .signals
        .append_candidate(&pair.caller, &pair.callee, request.origin, request.candidate)
        .await
        .map_err(map_signal_error)?;
    state.metrics.mark_candidate();
    Ok(json!({ "ok": true }))
}

pub(super) async fn handle_teardown(
    state: &AppState,
    user_id: &str,
    request: TeardownRequest,
) -> Result<Value, ApiError> {
    let peer = validated_user_id(&request.peer_user_id)?;
    let pair = signal_pair(user_id, peer, request.origin);
    let removed = state.signals.teardown(&pair.caller, &pair.callee).await;
    state.metrics.mark_teardown();
    Ok(json!({ "ok": true, "removed": removed }))
}

pub(super) async fn handle_incoming(state: &AppState, user_id: &str) -> Result<Value, ApiError> {
    let incoming_calls = state.gateway.list_incoming_calls(user_id).await;
    state.metrics.mark_incoming_poll();
    serde_json::to_value(IncomingCallsResponse { incoming_calls }).map_err(|_| ApiError::Internal)
}

pub(super) async fn handle_session_snapshot(
    state: &AppState,
    user_id: &str,
    origin: CandidateOrigin,
    peer: &str,
) -> Result<Value, ApiError> {
    let peer = validated_user_id(peer)?;
    let pair = signal_pair(user_id, peer, origin);
    let signal = state
        .signals
        .snapshot(&pair.caller, &pair.callee)
        .await
        .ok_or(ApiError::NotFound)?;
    state.metrics.mark_session_poll();
    serde_json::to_value(SessionResponse::from(signal)).map_err(|_| ApiError::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::test_state;

    #[tokio::test]
    async fn offer_then_incoming_roundtrip() {
        let state = test_state().await;
        handle_offer(
            &state,
            "u1",
            OfferRequest {
                to_user_id: "u2".to_string(),
                offer: json!({"sdp": "offer"}),
            },
        )
        .await
        .unwrap();

        let payload = handle_incoming(&state, "u2").await.unwrap();
        let calls = payload["incomingCalls"].as_array().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["fromUserId"], json!("u1"));
        assert_eq!(calls[0]["fromUserName"], json!("Alice"));
    }

    #[tokio::test]
    async fn offer_to_self_is_rejected() {
        let state = test_state().await;
        let result = handle_offer(
            &state,
            "u1",
            OfferRequest {
                to_user_id: "u1".to_string(),
                offer: json!({}),
            },
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn blank_peer_is_rejected() {
        let state = test_state().await;
        let result = handle_answer(
            &state,
            "u2",
            AnswerRequest {
                peer_user_id: "   ".to_string(),
                answer: json!({}),
            },
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn answer_without_handshake_is_not_found() {
        let state = test_state().await;
        let result = handle_answer(
            &state,
            "u2",
            AnswerRequest {
                peer_user_id: "u1".to_string(),
                answer: json!({"sdp": "answer"}),
            },
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound)));
        assert!(!state.signals.contains("u1", "u2").await);
    }

    #[tokio::test]
    async fn candidate_pair_resolution_follows_origin() {
        let state = test_state().await;
        handle_offer(
            &state,
            "u1",
            OfferRequest {
                to_user_id: "u2".to_string(),
                offer: json!({"sdp": "offer"}),
            },
        )
        .await
        .unwrap();

        // The caller tags its own candidates "caller"; the callee tags
        // its own "callee". Both land on the (u1, u2) entry.
        handle_candidate(
            &state,
            "u1",
            CandidateRequest {
                peer_user_id: "u2".to_string(),
                origin: CandidateOrigin::Caller,
                candidate: json!("caller-path"),
            },
        )
        .await
        .unwrap();
        handle_candidate(
            &state,
            "u2",
            CandidateRequest {
                peer_user_id: "u1".to_string(),
                origin: CandidateOrigin::Callee,
                candidate: json!("callee-path"),
            },
        )
        .await
        .unwrap();

        let signal = state.signals.snapshot("u1", "u2").await.unwrap();
        assert_eq!(signal.caller_candidates, vec![json!("caller-path")]);
        assert_eq!(signal.callee_candidates, vec![json!("callee-path")]);
    }

    #[tokio::test]
    async fn session_snapshot_serves_both_sides() {
        let state = test_state().await;
        handle_offer(
            &state,
            "u1",
            OfferRequest {
                to_user_id: "u2".to_string(),
                offer: json!({"sdp": "offer"}),
            },
        )
        .await
        .unwrap();
        handle_answer(
            &state,
            "u2",
            AnswerRequest {
                peer_user_id: "u1".to_string(),
                answer: json!({"sdp": "answer"}),
            },
        )
        .await
        .unwrap();

        let caller_view =
            handle_session_snapshot(&state, "u1", CandidateOrigin::Caller, "u2")
                .await
                .unwrap();
        assert_eq!(caller_view["answer"], json!({"sdp": "answer"}));

        let callee_view =
            handle_session_snapshot(&state, "u2", CandidateOrigin::Callee, "u1")
                .await
                .unwrap();
        assert_eq!(callee_view["answer"], json!({"sdp": "answer"}));
    }

    #[tokio::test]
    async fn teardown_ends_the_handshake() {
        let state = test_state().await;
        handle_offer(
            &state,
            "u1",
            OfferRequest {
                to_user_id: "u2".to_string(),
                offer: json!({"sdp": "offer"}),
            },
        )
        .await
        .unwrap();
        let payload = handle_teardown(
            &state,
            "u2",
            TeardownRequest {
                peer_user_id: "u1".to_string(),
                origin: CandidateOrigin::Callee,
            },
        )
        .await
        .unwrap();
        assert_eq!(payload["removed"], json!(true));
        let result =
            handle_session_snapshot(&state, "u1", CandidateOrigin::Caller, "u2").await;
        assert!(matches!(result, Err(ApiError::NotFound)));
    }
}
