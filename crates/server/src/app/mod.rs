pub mod gateway;
mod rtc;
mod typing;

use self::gateway::PollGateway;
use crate::config::ServerConfig;
use crate::directory::{DirectoryError, HttpDirectory, IdentityResolver, UserDirectory};
use crate::metrics::Metrics;
use crate::util::decode_path_segment;
use callwire_presence::PresenceCache;
use callwire_signal::{CandidateOrigin, SignalStore, SweeperHandle};
use chrono::Utc;
use pingora::apps::{HttpServerApp, HttpServerOptions};
use pingora::http::ResponseHeader;
use pingora::protocols::Stream;
use pingora::protocols::http::ServerSession;
use pingora::protocols::http::v2::server::H2Options;
use pingora::server::ShutdownWatch;
use serde_json::{Value, json};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

const LANDING_PAGE: &str = "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\" />\n<title>Callwire</title>\n<style>body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',sans-serif;background:#10141f;color:#f3f4f6;margin:0;display:flex;align-items:center;justify-content:center;height:100vh;}main{max-width:460px;text-align:center;padding:2rem;background:rgba(23,30,48,0.9);border-radius:18px;}h1{font-size:2rem;margin-bottom:0.5rem;}p{margin:0.75rem 0;color:#c7d2fe;}a{color:#60a5fa;text-decoration:none;}a:hover{text-decoration:underline;}</style>\n</head>\n<body>\n<main>\n<h1>Callwire</h1>\n<p>Ephemeral call-signaling and presence relay.</p>\n<p><a href=\"/healthz\">Health</a> · <a href=\"/readyz\">Readiness</a></p>\n</main>\n</body>\n</html>\n";

#[derive(Debug)]
pub enum ServerError {
    Io,
    Invalid,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "io failure"),
            Self::Invalid => write!(f, "invalid request"),
        }
    }
}

impl Error for ServerError {}

#[derive(Debug)]
enum ApiError {
    Unauthorized(Option<String>),
    BadRequest(String),
    NotFound,
    Internal,
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::BadRequest(_) => 400,
            Self::NotFound => 404,
            Self::Internal => 500,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "Unauthorized",
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound => "NotFound",
            Self::Internal => "InternalError",
        }
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub signals: Arc<SignalStore>,
    pub presence: Arc<PresenceCache>,
    pub gateway: PollGateway,
    pub identity: Arc<dyn IdentityResolver + Send + Sync>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
    _sweeper: SweeperHandle,
}

pub struct CallwireApp {
    pub state: Arc<AppState>,
    http_server_options: HttpServerOptions,
}

impl CallwireApp {
    pub fn new(state: Arc<AppState>) -> Self {
        CallwireApp {
            state,
            http_server_options: HttpServerOptions::default(),
        }
    }

    pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
        let signals = Arc::new(SignalStore::new());
        let sweeper = signals.spawn_sweeper();
        let presence = Arc::new(PresenceCache::new(config.redis_url.clone()));
        let metrics = Arc::new(Metrics::new());
        let directory = Arc::new(HttpDirectory::new(
            config.directory_endpoint.clone(),
            config.directory_token.clone(),
        ));
        let gateway = PollGateway::new(
            Arc::clone(&signals),
            Arc::clone(&presence),
            Arc::clone(&directory) as Arc<dyn UserDirectory + Send + Sync>,
            Arc::clone(&metrics),
        );
        Ok(Arc::new(AppState {
            signals,
            presence,
            gateway,
            identity: directory,
            metrics,
            started_at: Instant::now(),
            _sweeper: sweeper,
            config,
        }))
    }

    async fn handle_session(
        self: &Arc<Self>,
        mut session: ServerSession,
        _shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        match session.read_request().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                error!("failed to read request: {}", err);
                return None;
            }
        }
        let path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.to_string();
        match path.as_str() {
            "/" | "/index.html" => {
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response
                    .append_header("content-type", "text/html; charset=utf-8")
                    .ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(Vec::from(LANDING_PAGE.as_bytes()).into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            "/healthz" => {
                let payload = json!({
                    "status": "healthy",
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptime_seconds": self.state.started_at.elapsed().as_secs(),
                    "presence_backend": self.state.presence.backend_status().await.as_str(),
                    "timestamp": Utc::now().to_rfc3339(),
                });
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response
                    .append_header("content-type", "application/json")
                    .ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(payload.to_string().into_bytes().into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            "/readyz" => {
                // The signal store is process-local and the presence cache
                // degrades by design, so readiness never depends on Redis.
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response.append_header("content-type", "text/plain").ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(Vec::from("ready".as_bytes()).into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            "/metrics" => {
                if !self.authorize_admin(&session) {
                    let mut response = ResponseHeader::build_no_case(401, None).ok()?;
                    response
                        .append_header("content-type", "application/problem+json")
                        .ok()?;
                    let body = json!({
                        "type": "about:blank",
                        "title": "Unauthorized",
                        "status": 401,
                    })
                    .to_string();
                    session
                        .write_response_header(Box::new(response))
                        .await
                        .ok()?;
                    session
                        .write_response_body(body.into_bytes().into(), true)
                        .await
                        .ok()?;
                    session.finish().await.ok()?;
                    return None;
                }
                let payload = self.state.metrics.encode_prometheus();
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response
                    .append_header("content-type", "text/plain; version=0.0.4")
                    .ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(payload.into_bytes().into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            _ => {}
        }

        if path == "/api/rtc/offer" && method == "POST" {
            if let Err(err) = self.handle_offer_route(&mut session).await {
                let _ = self.respond_api_error(&mut session, err).await;
            }
            return None;
        }
        if path == "/api/rtc/answer" && method == "POST" {
            if let Err(err) = self.handle_answer_route(&mut session).await {
                let _ = self.respond_api_error(&mut session, err).await;
            }
            return None;
        }
        if path == "/api/rtc/candidate" && method == "POST" {
            if let Err(err) = self.handle_candidate_route(&mut session).await {
                let _ = self.respond_api_error(&mut session, err).await;
            }
            return None;
        }
        if path == "/api/rtc/teardown" && method == "POST" {
            if let Err(err) = self.handle_teardown_route(&mut session).await {
                let _ = self.respond_api_error(&mut session, err).await;
            }
            return None;
        }
        if path == "/api/rtc/incoming" && method == "GET" {
            if let Err(err) = self.handle_incoming_route(&mut session).await {
                let _ = self.respond_api_error(&mut session, err).await;
            }
            return None;
        }
        if let Some(rest) = path.strip_prefix("/api/rtc/session/")
            && method == "GET"
        {
            let rest = rest.to_string();
            if let Err(err) = self.handle_session_route(&mut session, &rest).await {
                let _ = self.respond_api_error(&mut session, err).await;
            }
            return None;
        }
        if path == "/api/typing" && method == "POST" {
            if let Err(err) = self.handle_typing_write_route(&mut session).await {
                let _ = self.respond_api_error(&mut session, err).await;
            }
            return None;
        }
        if let Some(peer) = path.strip_prefix("/api/typing/")
            && method == "GET"
        {
            let peer = peer.to_string();
            if let Err(err) = self.handle_typing_read_route(&mut session, &peer).await {
                let _ = self.respond_api_error(&mut session, err).await;
            }
            return None;
        }

        let _ = self
            .respond_problem(&mut session, 404, "NotFound", Some("unknown route"))
            .await;
        None
    }

    async fn handle_offer_route(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user_id = self.authenticate(session).await?;
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<rtc::OfferRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        let payload = rtc::handle_offer(&self.state, &user_id, request).await?;
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_answer_route(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user_id = self.authenticate(session).await?;
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<rtc::AnswerRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        let payload = rtc::handle_answer(&self.state, &user_id, request).await?;
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_candidate_route(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user_id = self.authenticate(session).await?;
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<rtc::CandidateRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        let payload = rtc::handle_candidate(&self.state, &user_id, request).await?;
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_teardown_route(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user_id = self.authenticate(session).await?;
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<rtc::TeardownRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        let payload = rtc::handle_teardown(&self.state, &user_id, request).await?;
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_incoming_route(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user_id = self.authenticate(session).await?;
        let payload = rtc::handle_incoming(&self.state, &user_id).await?;
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_session_route(
        &self,
        session: &mut ServerSession,
        rest: &str,
    ) -> Result<(), ApiError> {
        let user_id = self.authenticate(session).await?;
        let (origin, peer) = rest.split_once('/').ok_or_else(|| {
            ApiError::BadRequest("expected /api/rtc/session/{origin}/{peer}".to_string())
        })?;
        let origin = match origin {
            "caller" => CandidateOrigin::Caller,
            "callee" => CandidateOrigin::Callee,
            _ => {
                return Err(ApiError::BadRequest(
                    "origin must be caller or callee".to_string(),
                ));
            }
        };
        let peer =
            decode_path_segment(peer).map_err(|reason| ApiError::BadRequest(reason.to_string()))?;
        let payload = rtc::handle_session_snapshot(&self.state, &user_id, origin, &peer).await?;
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_typing_write_route(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user_id = self.authenticate(session).await?;
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<typing::TypingRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        let payload = typing::handle_typing_set(&self.state, &user_id, request).await?;
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_typing_read_route(
        &self,
        session: &mut ServerSession,
        peer: &str,
    ) -> Result<(), ApiError> {
        let user_id = self.authenticate(session).await?;
        let peer =
            decode_path_segment(peer).map_err(|reason| ApiError::BadRequest(reason.to_string()))?;
        let payload = typing::handle_typing_get(&self.state, &user_id, &peer).await?;
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    /// Resolves the caller identity from the bearer token. Every API route
    /// is scoped to the identity resolved here.
    async fn authenticate(&self, session: &ServerSession) -> Result<String, ApiError> {
        let header = session
            .req_header()
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                debug!("authentication failed: missing authorization header");
                ApiError::Unauthorized(Some("missing Authorization header".to_string()))
            })?;
        let token = header
            .trim()
            .strip_prefix("Bearer ")
            .unwrap_or(header.trim());
        if token.is_empty() {
            debug!("authentication failed: empty token");
            return Err(ApiError::Unauthorized(Some(
                "empty token provided".to_string(),
            )));
        }
        self.state
            .identity
            .resolve(token)
            .await
            .map_err(|err| match err {
                DirectoryError::Missing => {
                    debug!("authentication failed: token not recognized");
                    ApiError::Unauthorized(Some("session not found or expired".to_string()))
                }
                _ => {
                    error!("authentication failed: identity resolver unavailable");
                    ApiError::Internal
                }
            })
    }

    fn authorize_admin(&self, session: &ServerSession) -> bool {
        let Some(expected) = self.state.config.admin_token.as_deref() else {
            return false;
        };
        let provided = session
            .req_header()
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().strip_prefix("Bearer ").unwrap_or(value.trim()));
        provided == Some(expected)
    }

    async fn read_body(session: &mut ServerSession) -> Result<Vec<u8>, ApiError> {
        const MAX_BODY_SIZE: usize = 1024 * 1024; // 1 MB, SDP payloads are small
        let mut body = Vec::new();
        loop {
            match session.read_request_body().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > MAX_BODY_SIZE {
                        return Err(ApiError::BadRequest(
                            "request body too large".to_string(),
                        ));
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(err) => {
                    error!("error reading request body: {}", err);
                    return Err(ApiError::Internal);
                }
            }
        }
        Ok(body)
    }

    async fn respond_json(
        &self,
        session: &mut ServerSession,
        status: u16,
        payload: Value,
        content_type: &str,
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", content_type)
            .map_err(|_| ServerError::Invalid)?;
        response
            .append_header("cache-control", "no-store")
            .map_err(|_| ServerError::Invalid)?;
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(payload.to_string().into_bytes().into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        Ok(())
    }

    async fn respond_api_error(
        &self,
        session: &mut ServerSession,
        error: ApiError,
    ) -> Result<(), ServerError> {
        let status = error.status();
        let title = error.title();
        let detail = match &error {
            ApiError::Unauthorized(reason) => {
                Some(reason.as_deref().unwrap_or("authorization required"))
            }
            ApiError::BadRequest(reason) => Some(reason.as_str()),
            ApiError::NotFound => Some("no pending handshake for pair"),
            ApiError::Internal => Some("internal server error"),
        };
        self.respond_problem(session, status, title, detail).await
    }

    async fn respond_problem(
        &self,
        session: &mut ServerSession,
        status: u16,
        title: &str,
        detail: Option<&str>,
    ) -> Result<(), ServerError> {
        let mut body = json!({
            "type": "about:blank",
            "title": title,
            "status": status,
        });
        if let Some(message) = detail
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("detail".to_string(), json!(message));
        }
        self.respond_json(session, status, body, "application/problem+json")
            .await
    }
}

impl HttpServerApp for CallwireApp {
    fn process_new_http<'life0, 'life1, 'async_trait>(
        self: &'life0 Arc<Self>,
        session: ServerSession,
        shutdown: &'life1 ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = Option<Stream>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move { self.handle_session(session, shutdown).await })
    }

    fn h2_options(&self) -> Option<H2Options> {
        None
    }

    fn server_options(&self) -> Option<&HttpServerOptions> {
        Some(&self.http_server_options)
    }
}
