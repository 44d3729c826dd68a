//! Axum HTTP gateway: vendor webhooks, OAuth connect flows and the
//! dashboard data endpoint.
//!
//! Every route sits behind a 64KB body limit and a 30s request timeout.
//! Webhook and connect routes are additionally rate limited per client IP.

pub mod connect;
pub mod limits;
pub mod webhooks;

use crate::channels::{AlterdeskChannel, Channel, FacebookChannel, Platform};
use crate::config::Config;
use crate::conversation::{ConversationHandler, ConversationSettings, DEFAULT_ESCALATION_AGENT};
use crate::integrations::{Credentials, NokiaClient, SalesforceClient, VitadockClient, WunderlistClient};
use crate::nlu::{ApiAiClient, Nlu};
use crate::store::Store;
use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{any, get, post},
    Router,
};
use limits::{
    caller_ip, capacity_or, constant_time_eq, hash_secret, is_public_bind, ReplayGuard,
    RouteLimits, REPLAY_GUARD_CAPACITY_DEFAULT, TRACKED_IPS_DEFAULT,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s).
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Delay between a successful verify-token handshake and the page subscription.
pub const SUBSCRIBE_DELAY_SECS: u64 = 5;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub conversation: Arc<ConversationHandler>,
    /// Externally reachable base URL, without trailing slash.
    pub public_url: Arc<str>,
    pub facebook: Option<Arc<FacebookChannel>>,
    /// Messenger app secret for `X-Hub-Signature-256` verification.
    pub facebook_app_secret: Option<Arc<str>>,
    pub alterdesk: Option<Arc<AlterdeskChannel>>,
    pub nokia: Option<Arc<NokiaClient>>,
    pub vitadock: Option<Arc<VitadockClient>>,
    pub wunderlist: Option<Arc<WunderlistClient>>,
    /// SHA-256 hash of `X-Scheduler-Secret` (hex-encoded), never plaintext.
    pub scheduler_secret_hash: Option<Arc<str>>,
    /// SHA-256 hash of the dashboard bearer token; `None` leaves client data open.
    pub dashboard_token_hash: Option<Arc<str>>,
    /// Questionnaires idle for longer than this are nudged on a scheduler tick.
    pub stale_after: Duration,
    pub subscribe_delay: Duration,
    pub trust_forwarded_headers: bool,
    pub route_limits: Arc<RouteLimits>,
    pub replay_guard: Arc<ReplayGuard>,
}

fn both(key: Option<&String>, secret: Option<&String>) -> Option<Credentials> {
    let key = key.map(|k| k.trim()).filter(|k| !k.is_empty())?;
    let secret = secret.map(|s| s.trim()).filter(|s| !s.is_empty())?;
    Some(Credentials::new(key, secret))
}

impl AppState {
    /// Wire every configured vendor. Unconfigured vendors stay `None` and
    /// their routes answer 404.
    pub fn from_config(config: &Config, store: Arc<Store>) -> Self {
        let nlu: Arc<dyn Nlu> = Arc::new(ApiAiClient::new(
            config.apiai.access_token.clone().unwrap_or_default(),
            config.apiai.lang.clone(),
        ));

        let facebook = (config.facebook.page_access_token.is_some()
            || config.facebook.verify_token.is_some())
        .then(|| {
            Arc::new(FacebookChannel::new(
                config.facebook.page_access_token.clone().unwrap_or_default(),
                config.facebook.verify_token.clone().unwrap_or_default(),
            ))
        });
        let alterdesk = config
            .alterdesk
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Arc::new(AlterdeskChannel::new(t.to_string())));
        let salesforce = match (&config.salesforce.instance_url, &config.salesforce.access_token) {
            (Some(url), Some(token)) => Some(Arc::new(SalesforceClient::new(url, token.clone()))),
            _ => None,
        };

        let settings = ConversationSettings {
            public_url: config.public_url(),
            escalation_agent: Some(
                config
                    .facebook
                    .escalation_agent
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ESCALATION_AGENT.to_string()),
            ),
            ..ConversationSettings::default()
        };
        let mut conversation = ConversationHandler::new(Arc::clone(&store), nlu, settings);
        if let Some(fb) = &facebook {
            conversation = conversation.with_channel(Platform::Facebook, Arc::clone(fb) as Arc<dyn Channel>);
        }
        if let Some(ad) = &alterdesk {
            conversation = conversation.with_channel(Platform::Alterdesk, Arc::clone(ad) as Arc<dyn Channel>);
        }
        if let Some(sf) = salesforce {
            conversation = conversation.with_channel(Platform::Salesforce, sf as Arc<dyn Channel>);
        }

        let gateway = &config.gateway;
        Self {
            store,
            conversation: Arc::new(conversation),
            public_url: Arc::from(config.public_url()),
            facebook,
            facebook_app_secret: config
                .facebook
                .app_secret
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Arc::from),
            alterdesk,
            nokia: both(config.nokia.key.as_ref(), config.nokia.secret.as_ref())
                .map(|c| Arc::new(NokiaClient::new(c))),
            vitadock: both(config.vitadock.key.as_ref(), config.vitadock.secret.as_ref())
                .map(|c| Arc::new(VitadockClient::new(c))),
            wunderlist: match (&config.wunderlist.client_id, &config.wunderlist.client_secret) {
                (Some(id), Some(secret)) => {
                    Some(Arc::new(WunderlistClient::new(id.clone(), secret.clone())))
                }
                _ => None,
            },
            scheduler_secret_hash: gateway
                .scheduler_secret
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Arc::from(hash_secret(s))),
            dashboard_token_hash: gateway
                .dashboard_token
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Arc::from(hash_secret(s))),
            stale_after: Duration::from_secs(gateway.stale_questionnaire_hours.saturating_mul(3600)),
            subscribe_delay: Duration::from_secs(SUBSCRIBE_DELAY_SECS),
            trust_forwarded_headers: gateway.trust_forwarded_headers,
            route_limits: Arc::new(RouteLimits::new(
                gateway.webhook_rate_limit_per_minute,
                capacity_or(gateway.rate_limit_max_keys, TRACKED_IPS_DEFAULT),
            )),
            replay_guard: Arc::new(ReplayGuard::new(
                Duration::from_secs(gateway.replay_ttl_secs.max(1)),
                capacity_or(gateway.replay_max_ids, REPLAY_GUARD_CAPACITY_DEFAULT),
            )),
        }
    }
}

/// Build the router. Callers serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn build_router(state: AppState) -> Router {
    let webhook_router = Router::new()
        .route(
            "/webhook",
            get(webhooks::handle_messenger_verify).post(webhooks::handle_messenger_event),
        )
        .route("/webhook/alterdesk/{groupid}", post(webhooks::handle_alterdesk))
        .route("/webhook/scheduler", post(webhooks::handle_scheduler))
        .route("/webhook/nokia/{userid}/{appli}", any(webhooks::handle_nokia))
        .route("/webhook/wunderlist/{client}", any(webhooks::handle_wunderlist))
        .route("/webhook/salesforce", post(webhooks::handle_salesforce))
        .route("/webhook/vitadock", any(webhooks::handle_vitadock))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_webhooks));

    let connect_router = Router::new()
        .route("/connect/nokia/callback", get(connect::handle_nokia_callback))
        .route("/connect/nokia/{client_id}", get(connect::handle_nokia_start))
        .route("/connect/wunderlist/callback", get(connect::handle_wunderlist_callback))
        .route("/connect/wunderlist/{client_id}", get(connect::handle_wunderlist_start))
        .route("/connect/vitadock", get(connect::handle_vitadock_callback))
        .route("/connect/vitadock/{client_id}", get(connect::handle_vitadock_start))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_connects));

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/client/{client_id}/data", get(handle_client_data))
        .merge(webhook_router)
        .merge(connect_router)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    if is_public_bind(host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "Refusing to bind to {host}: the gateway would be exposed without a proxy.\n\
             Use --host 127.0.0.1 behind a reverse proxy, or set\n\
             [gateway] allow_public_bind = true in config.toml."
        );
    }
    config.warn_missing();

    let db_path = config.database_path();
    let store = Arc::new(
        Store::open(&db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );
    let state = AppState::from_config(&config, store);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid listen address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_port = listener.local_addr()?.port();

    tracing::info!("Paula listening on http://{host}:{actual_port}");
    tracing::info!("Public URL: {}", state.public_url);
    for (name, enabled) in [
        ("Messenger", state.facebook.is_some()),
        ("Alterdesk", state.alterdesk.is_some()),
        ("Nokia Health", state.nokia.is_some()),
        ("Vitadock", state.vitadock.is_some()),
        ("Wunderlist", state.wunderlist.is_some()),
        ("Scheduler", state.scheduler_secret_hash.is_some()),
        ("Dashboard token", state.dashboard_token_hash.is_some()),
    ] {
        tracing::info!("{name}: {}", if enabled { "enabled" } else { "not configured" });
    }

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
    })
    .await?;

    Ok(())
}

pub(crate) fn ok_response() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

pub(crate) fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({"status": "error", "error": error.into()})),
    )
        .into_response()
}

async fn limit_webhooks(
    State(state): State<AppState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let ip = caller_ip(Some(peer_addr), &headers, state.trust_forwarded_headers);
    if !state.route_limits.allow_webhook(&ip) {
        tracing::warn!("Webhook rate limit exceeded for {ip}");
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }
    next.run(request).await
}

async fn limit_connects(
    State(state): State<AppState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let ip = caller_ip(Some(peer_addr), &headers, state.trust_forwarded_headers);
    if !state.route_limits.allow_connect(&ip) {
        tracing::warn!("Connect rate limit exceeded for {ip}");
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }
    next.run(request).await
}

/// GET /
async fn handle_root() -> &'static str {
    "This is Paula"
}

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.store.event_count(0) {
        Ok(_) => "ok",
        Err(e) => {
            tracing::error!("Health check database query failed: {e:#}");
            "error"
        }
    };
    let mut healthy = database == "ok";
    let mut channels = serde_json::Map::new();
    for (name, reachable) in state.conversation.channel_health().await {
        healthy &= reachable;
        channels.insert(name.to_string(), serde_json::Value::Bool(reachable));
    }
    Json(serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "database": database,
        "sessions": state.conversation.sessions().len(),
        "channels": channels,
    }))
}

/// GET /client/{client_id}/data: Series for the client dashboard charts.
///
/// With a dashboard token configured the request must carry it as a bearer
/// token. Every access is logged.
async fn handle_client_data(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let peer = caller_ip(Some(peer_addr), &headers, state.trust_forwarded_headers);
    if let Some(expected) = state.dashboard_token_hash.as_deref() {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let authorized =
            provided.is_some_and(|token| constant_time_eq(&hash_secret(token), expected));
        if !authorized {
            tracing::warn!(client_id, "Dashboard data request from {peer} rejected: bad or missing token");
            return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    }
    tracing::info!(client_id, "Dashboard data requested by {peer}");

    match state.store.client_exists(client_id) {
        Ok(true) => {}
        Ok(false) => return error_response(StatusCode::NOT_FOUND, "Unknown client"),
        Err(e) => {
            tracing::error!("Client lookup failed: {e:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    }
    match state.store.client_dashboard(client_id) {
        Ok(dashboard) => (StatusCode::OK, Json(dashboard)).into_response(),
        Err(e) => {
            tracing::error!(client_id, "Dashboard query failed: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::nlu::NluResult;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use http_body_util::BodyExt as _;
    use parking_lot::Mutex;
    use tower::ServiceExt as _;

    /// NLU stub answering every request with the same result.
    pub struct FixedNlu {
        pub result: serde_json::Value,
        pub requests: Mutex<Vec<String>>,
    }

    impl FixedNlu {
        pub fn speech(text: &str) -> Self {
            Self {
                result: serde_json::json!({
                    "resolvedQuery": "",
                    "action": "",
                    "fulfillment": {"speech": text},
                }),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Nlu for FixedNlu {
        async fn text_request(&self, _session_id: &str, text: &str) -> Result<NluResult> {
            self.requests.lock().push(text.to_string());
            Ok(serde_json::from_value(self.result.clone())?)
        }

        async fn event_request(
            &self,
            _session_id: &str,
            event: &str,
            _data: serde_json::Value,
        ) -> Result<NluResult> {
            self.requests.lock().push(format!("event:{event}"));
            Ok(serde_json::from_value(self.result.clone())?)
        }
    }

    /// State with an in-memory store and no vendors configured.
    pub fn bare_state(nlu: Arc<dyn Nlu>) -> AppState {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let conversation = ConversationHandler::new(
            Arc::clone(&store),
            nlu,
            ConversationSettings {
                public_url: "https://paula.test".into(),
                ..ConversationSettings::default()
            },
        );
        AppState {
            store,
            conversation: Arc::new(conversation),
            public_url: Arc::from("https://paula.test"),
            facebook: None,
            facebook_app_secret: None,
            alterdesk: None,
            nokia: None,
            vitadock: None,
            wunderlist: None,
            scheduler_secret_hash: None,
            dashboard_token_hash: None,
            stale_after: Duration::from_secs(86_400),
            subscribe_delay: Duration::from_millis(10),
            trust_forwarded_headers: false,
            route_limits: Arc::new(RouteLimits::new(100, 100)),
            replay_guard: Arc::new(ReplayGuard::new(Duration::from_secs(300), 100)),
        }
    }

    pub fn app(state: AppState) -> Router {
        build_router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))))
    }

    pub async fn send(app: Router, request: axum::http::Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    pub fn get_req(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(uri).body(Body::empty()).unwrap()
    }

    pub fn post_json(uri: &str, body: &serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}
