//! HTTP entrypoints for the intake pipeline.

use std::{
    collections::HashSet,
    future::Future,
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

use axum::{
    body::Body,
    extract::{connect_info::ConnectInfo, MatchedPath, Path, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use governor::{clock::Clock, clock::DefaultClock, DefaultKeyedRateLimiter, Quota};
use serde::Serialize;
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{
    add_extension::AddExtensionLayer,
    classify::ServerErrorsFailureClass,
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::{CorsConfig, ProxyMode, RateLimitConfig, RouteLimitConfig, ServerConfig};
use crate::intake::{
    ConfirmRequest, ConfirmResponse, ExtractRequest, ExtractResponse, IntakeError,
    IntakeErrorKind, IntakeProvider,
};

const HEALTHZ_PATH: &str = "/v1/healthz";
const EXTRACT_PATH: &str = "/v1/sessions/{id}/extract";
const CONFIRM_PATH: &str = "/v1/sessions/{id}/confirm";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_INVALID_PARAMETER: &str = "invalid_parameter";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_CONFLICT: &str = "conflict";
const ERROR_UNPROCESSABLE: &str = "extraction_unprocessable";
const ERROR_METHOD_NOT_ALLOWED: &str = "method_not_allowed";
const ERROR_RATE_LIMITED: &str = "rate_limited";
const ERROR_INTERNAL: &str = "internal_server_error";
const REQUEST_ID_HEADER: &str = "x-request-id";
const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

pub type DynIntakeProvider = Arc<dyn IntakeProvider>;
type ApiStateHandle = Arc<ApiState>;

#[derive(Clone)]
struct ApiState {
    intake: DynIntakeProvider,
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CORS configuration: {reason}")]
    CorsConfig { reason: String },
}

#[derive(Clone)]
struct RateLimitState {
    extract: Arc<DefaultKeyedRateLimiter<String>>,
    confirm: Arc<DefaultKeyedRateLimiter<String>>,
    proxy_mode: ProxyMode,
    trusted: Arc<HashSet<IpAddr>>,
}

impl RateLimitState {
    fn new(cfg: &RateLimitConfig) -> Arc<Self> {
        debug_assert!(cfg.window_ms.get() > 0);
        let window_ms = cfg.window_ms.get();
        Arc::new(Self {
            extract: Arc::new(build_keyed_limiter(&cfg.extract, window_ms)),
            confirm: Arc::new(build_keyed_limiter(&cfg.confirm, window_ms)),
            proxy_mode: cfg.proxy_mode,
            trusted: Arc::new(cfg.trusted_proxies.iter().copied().collect()),
        })
    }
}

fn build_keyed_limiter(
    route: &RouteLimitConfig,
    window_ms: u64,
) -> DefaultKeyedRateLimiter<String> {
    // Replenish one cell every window_ms / max_requests, bursting up to
    // `burst` immediate requests.
    let n = route.max_requests.get();
    debug_assert!(n > 0);
    let replenish = Duration::from_millis((window_ms / u64::from(n)).max(1));
    let quota = Quota::with_period(replenish)
        .expect("replenish period must be non-zero")
        .allow_burst(NonZeroU32::new(route.burst.get()).expect("burst>0"));
    DefaultKeyedRateLimiter::<String>::keyed(quota)
}

async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    req: Request<Body>,
    next: Next,
) -> axum::response::Response {
    let path = matched_path_or_uri(&req);
    if path == HEALTHZ_PATH {
        return next.run(req).await;
    }

    let (bucket, limiter) = if path == EXTRACT_PATH {
        ("extract", &state.extract)
    } else if path == CONFIRM_PATH {
        ("confirm", &state.confirm)
    } else {
        return next.run(req).await;
    };
    let key = format!("{bucket}:{}", actor_key(&req, &state));

    match limiter.check_key(&key) {
        Ok(()) => next.run(req).await,
        Err(negative) => {
            let now = DefaultClock::default().now();
            let wait = negative.wait_time_from(now);
            let mut response = ApiError::rate_limited(wait.as_millis() as u64)
                .with_request_id(header_request_id(req.headers()).as_deref())
                .into_response();
            let secs = std::cmp::max(1u64, (wait.as_millis() as u64).div_ceil(1000));
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Rate-limit key for a request: the `x-actor-id` header when present,
/// otherwise the client IP resolved per the configured proxy mode.
fn actor_key(req: &Request<Body>, state: &RateLimitState) -> String {
    if let Some(actor) = header_actor(req.headers()) {
        return actor;
    }
    extract_client_ip(req, state.proxy_mode, state.trusted.as_ref())
        .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]))
        .to_string()
}

fn header_actor(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

fn extract_client_ip(
    req: &Request<Body>,
    mode: ProxyMode,
    trusted: &HashSet<IpAddr>,
) -> Option<IpAddr> {
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())?;

    match mode {
        ProxyMode::Off => Some(peer_ip),
        ProxyMode::XForwardedFor => {
            if trusted.contains(&peer_ip) {
                parse_xff(req.headers()).or(Some(peer_ip))
            } else {
                Some(peer_ip)
            }
        }
        ProxyMode::Forwarded => {
            if trusted.contains(&peer_ip) {
                parse_forwarded(req.headers()).or(Some(peer_ip))
            } else {
                Some(peer_ip)
            }
        }
    }
}

fn parse_xff(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .and_then(|ip| ip.parse::<IpAddr>().ok())
}

fn parse_forwarded(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("forwarded")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| {
            s.split(';').flat_map(|part| part.split(',')).find_map(|kv| {
                let kv = kv.trim();
                if let Some(rest) = kv.strip_prefix("for=") {
                    return rest.trim_matches('"').parse::<IpAddr>().ok();
                }
                None
            })
        })
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                error,
                message: message.into(),
                field: None,
                retry_after_ms: None,
                request_id: None,
            },
        }
    }

    fn with_field(mut self, field: &str) -> Self {
        debug_assert!(!field.is_empty());
        self.body.field = Some(field.to_string());
        self
    }

    fn with_request_id(mut self, request_id: Option<&str>) -> Self {
        if let Some(id) = request_id {
            self.body.request_id = Some(id.to_string());
        }
        self
    }

    fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.body.retry_after_ms = Some(retry_after_ms);
        self
    }

    fn invalid_param(field: &str, message: impl Into<String>) -> Self {
        debug_assert!(!field.is_empty());
        ApiError::new(StatusCode::BAD_REQUEST, ERROR_INVALID_PARAMETER, message).with_field(field)
    }

    fn not_found(field: &str, message: impl Into<String>) -> Self {
        debug_assert!(!field.is_empty());
        ApiError::new(StatusCode::NOT_FOUND, ERROR_NOT_FOUND, message).with_field(field)
    }

    fn conflict(field: &str, message: impl Into<String>) -> Self {
        debug_assert!(!field.is_empty());
        ApiError::new(StatusCode::CONFLICT, ERROR_CONFLICT, message).with_field(field)
    }

    fn unprocessable(message: impl Into<String>) -> Self {
        ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            ERROR_UNPROCESSABLE,
            message,
        )
    }

    fn internal() -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ERROR_INTERNAL,
            "internal server error",
        )
    }

    fn resource_not_found(path: &str) -> Self {
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::NOT_FOUND,
            ERROR_NOT_FOUND,
            format!("resource `{path}` not found"),
        )
    }

    fn method_not_allowed(method: &str, path: &str) -> Self {
        ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            ERROR_METHOD_NOT_ALLOWED,
            format!("method `{method}` not allowed for `{path}`"),
        )
    }

    fn rate_limited(retry_after_ms: u64) -> Self {
        ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            ERROR_RATE_LIMITED,
            "rate limit exceeded; retry after backoff",
        )
        .with_retry_after(retry_after_ms)
    }
}

impl From<IntakeError> for ApiError {
    fn from(error: IntakeError) -> Self {
        match error.kind {
            IntakeErrorKind::InvalidParameter => {
                let field = error.field.unwrap_or_else(|| "parameter".to_string());
                ApiError::invalid_param(&field, error.message)
            }
            IntakeErrorKind::NotFound { resource } => ApiError::not_found(&resource, error.message),
            IntakeErrorKind::Conflict { resource } => ApiError::conflict(&resource, error.message),
            IntakeErrorKind::Unprocessable => ApiError::unprocessable(error.message),
            IntakeErrorKind::RateLimited { retry_after_ms } => {
                let mut api = ApiError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    ERROR_RATE_LIMITED,
                    error.message,
                );
                if let Some(delay) = retry_after_ms {
                    api = api.with_retry_after(delay);
                }
                api
            }
            IntakeErrorKind::Internal => {
                tracing::error!(message = %error.message, "intake request failed");
                ApiError::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn build_api_router() -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));

    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(EXTRACT_PATH, post(extract_session).get(method_not_allowed))
        .route(CONFIRM_PATH, post(confirm_session).get(method_not_allowed))
}

pub async fn serve(config: ServerConfig, intake: DynIntakeProvider) -> Result<(), ServerError> {
    debug_assert!(config.listen_addr.len() <= 128);
    debug_assert!(!config.listen_addr.contains('\n'));

    let api_state: ApiStateHandle = Arc::new(ApiState { intake });
    let listen_addr = parse_listen_addr(&config.listen_addr)?;

    let listener = bind_listener(listen_addr).await?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "simsar server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_app_router(&config, api_state)?;
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let mut server_future = Box::pin(async move {
        axum::serve(listener, make_service)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

fn build_app_router(config: &ServerConfig, state: ApiStateHandle) -> Result<Router, ServerError> {
    debug_assert!(HEALTHZ_PATH.starts_with('/'));

    let mut router = Router::new()
        .merge(build_api_router())
        .fallback(not_found_handler);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let path = matched_path_or_uri(request);
            let request_id =
                header_request_id(request.headers()).unwrap_or_else(|| "-".to_string());
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %path,
                request_id = %request_id
            )
        })
        .on_response(
            |response: &axum::response::Response, latency: Duration, span: &tracing::Span| {
                let status = response.status().as_u16();
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::info!(parent: span, status, latency_ms, "request completed");
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::error!(parent: span, latency_ms, error = %error, "request failed");
            },
        );

    if config.rate_limit.enabled {
        let limiter_state = RateLimitState::new(&config.rate_limit);
        router = router.layer(middleware::from_fn_with_state(
            limiter_state,
            rate_limit_middleware,
        ));
    }

    if config.cors.enabled {
        router = router.layer(build_cors_layer(&config.cors)?);
    }

    router = router.layer(trace_layer);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);
    router = router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(
            request_id_header,
            MakeRequestUuid::default(),
        ));

    Ok(router.layer(AddExtensionLayer::new(state)))
}

fn build_cors_layer(config: &CorsConfig) -> Result<CorsLayer, ServerError> {
    let origins: Vec<HeaderValue> = config
        .allow_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|err| ServerError::CorsConfig {
                reason: format!("origin `{origin}` is not a valid header value: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let methods: Vec<Method> = config
        .allow_methods
        .iter()
        .map(|method| {
            Method::from_bytes(method.as_bytes()).map_err(|_| ServerError::CorsConfig {
                reason: format!("method `{method}` failed to parse"),
            })
        })
        .collect::<Result<_, _>>()?;

    let allow_headers: Vec<HeaderName> = config
        .allow_headers
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| ServerError::CorsConfig {
                reason: format!("header `{name}` is invalid: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let expose_headers: Vec<HeaderName> = config
        .expose_headers
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| ServerError::CorsConfig {
                reason: format!("expose-header `{name}` is invalid: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let mut cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list(methods))
        .allow_credentials(config.allow_credentials)
        .max_age(Duration::from_secs(config.max_age_secs));

    if !allow_headers.is_empty() {
        cors = cors.allow_headers(AllowHeaders::list(allow_headers));
    }
    if !expose_headers.is_empty() {
        cors = cors.expose_headers(ExposeHeaders::list(expose_headers));
    }

    Ok(cors)
}

async fn extract_session(
    Extension(state): Extension<ApiStateHandle>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ExtractRequest>>,
) -> Result<Json<ExtractResponse>, ApiError> {
    let session_id = trim_non_empty("id", session_id)?;
    let request = body.map(|Json(req)| req).unwrap_or_default();
    let actor = header_actor(&headers).unwrap_or_else(|| "anonymous".to_string());
    let report = state
        .intake
        .extract(&session_id, request, &actor)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(report))
}

async fn confirm_session(
    Extension(state): Extension<ApiStateHandle>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let session_id = trim_non_empty("id", session_id)?;
    let actor = header_actor(&headers).unwrap_or_else(|| "anonymous".to_string());
    let outcome = state
        .intake
        .confirm(&session_id, request, &actor)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(outcome))
}

async fn healthz() -> impl IntoResponse {
    debug_assert_eq!(HEALTHZ_STATUS, "ok");

    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn method_not_allowed(request: Request<Body>) -> axum::response::Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::method_not_allowed(&method, &path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

async fn not_found_handler(request: Request<Body>) -> axum::response::Response {
    debug_assert!(request.uri().path().starts_with('/'));
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::resource_not_found(&path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

fn matched_path_or_uri<B>(request: &Request<B>) -> String {
    if let Some(path) = request.extensions().get::<MatchedPath>() {
        return path.as_str().to_string();
    }
    request.uri().path().to_string()
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

fn trim_non_empty(field: &str, value: String) -> Result<String, ApiError> {
    debug_assert!(!field.is_empty());
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::invalid_param(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

async fn wait_for_shutdown() -> ShutdownEvent {
    debug_assert!(DRAIN_TIMEOUT >= Duration::from_secs(1));

    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::MediaSummary;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct MockIntakeProvider;

    #[async_trait::async_trait]
    impl IntakeProvider for MockIntakeProvider {
        async fn extract(
            &self,
            session_id: &str,
            _request: ExtractRequest,
            _actor: &str,
        ) -> Result<ExtractResponse, IntakeError> {
            match session_id {
                "missing" => Err(IntakeError::not_found("session", "session not found")),
                "garbled" => Err(IntakeError::unprocessable(
                    "model output was not valid JSON after repair",
                )),
                _ => Ok(ExtractResponse {
                    session_id: session_id.to_string(),
                    detected_type: "sale".to_string(),
                    confidence: 88,
                    language: "mixed".to_string(),
                    status: "draft".to_string(),
                    completeness: 0.5,
                    fields: Default::default(),
                    missing_critical: Vec::new(),
                    field_confidence: Default::default(),
                    child_sessions: Vec::new(),
                }),
            }
        }

        async fn confirm(
            &self,
            session_id: &str,
            _request: ConfirmRequest,
            _actor: &str,
        ) -> Result<ConfirmResponse, IntakeError> {
            match session_id {
                "done" => Err(IntakeError::conflict(
                    "session",
                    "session is already confirmed",
                )),
                _ => Ok(ConfirmResponse {
                    record_type: "sale".to_string(),
                    record_id: "r1".to_string(),
                    code: "SALE-2025-00001".to_string(),
                    status: "active".to_string(),
                    changed_fields: Vec::new(),
                    media: MediaSummary::default(),
                    steps: vec!["record_written".to_string()],
                }),
            }
        }
    }

    fn test_router() -> Router {
        let state: ApiStateHandle = Arc::new(ApiState {
            intake: Arc::new(MockIntakeProvider),
        });
        build_app_router(&ServerConfig::default(), state).expect("router builds")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body readable")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("body is JSON")
    }

    #[tokio::test]
    async fn healthz_returns_ok_json() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(HEALTHZ_PATH)
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("healthz responds");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn extract_maps_not_found_to_404() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/sessions/missing/extract")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .expect("request builds"),
            )
            .await
            .expect("handler responds");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn extract_maps_parse_failure_to_422() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/sessions/garbled/extract")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .expect("request builds"),
            )
            .await
            .expect("handler responds");

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "extraction_unprocessable");
    }

    #[tokio::test]
    async fn confirm_maps_already_confirmed_to_409() {
        let request = json!({ "mode": "create_new" });
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/sessions/done/confirm")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .expect("request builds"),
            )
            .await
            .expect("handler responds");

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"], "conflict");
    }

    #[tokio::test]
    async fn confirm_happy_path_returns_code() {
        let request = json!({ "mode": "create_new", "fields": { "price": "5500000" } });
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/sessions/s1/confirm")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .expect("request builds"),
            )
            .await
            .expect("handler responds");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["code"], "SALE-2025-00001");
    }

    #[tokio::test]
    async fn unknown_route_returns_404_body() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/nope")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("fallback responds");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "not_found");
    }
}
