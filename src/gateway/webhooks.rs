//! Inbound vendor webhooks.
//!
//! Vendor and database failures are logged and acknowledged; only malformed
//! or unauthenticated requests get an error status back.

use super::limits::{constant_time_eq, hash_secret};
use super::{error_response, ok_response, AppState};
use crate::channels::facebook::verify_signature;
use crate::channels::{ChannelMessage, Platform};
use crate::integrations::nokia::{APPLI_BLOOD_PRESSURE, APPLI_WEIGHT};
use crate::integrations::oauth1::{parse_authorization_header, parse_form_body};
use crate::integrations::salesforce::SalesforceEvent;
use crate::integrations::wunderlist::parse_webhook;
use crate::integrations::{SyncMarks, PROVIDER_NOKIA, PROVIDER_VITADOCK};
use crate::store::TokenKind;
use crate::util::truncate_with_ellipsis;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;

/// Accepted clock difference on signed Vitadock pushes.
const PUSH_MAX_SKEW_SECS: i64 = 5 * 60;

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// GET /webhook: Messenger verify-token handshake.
///
/// On success the page subscription is requested a few seconds later, once
/// Facebook has accepted the callback URL.
pub async fn handle_messenger_verify(
    State(state): State<AppState>,
    Query(params): Query<VerifyQuery>,
) -> Response {
    let Some(fb) = state.facebook.clone() else {
        return (StatusCode::NOT_FOUND, "Messenger not configured").into_response();
    };

    let token_matches = params
        .verify_token
        .as_deref()
        .is_some_and(|t| !fb.verify_token().is_empty() && constant_time_eq(t, fb.verify_token()));
    if !token_matches {
        tracing::warn!(
            mode = params.mode.as_deref().unwrap_or(""),
            "Messenger verification failed: token mismatch"
        );
        return (StatusCode::FORBIDDEN, "Error, wrong validation token").into_response();
    }

    tracing::info!("Messenger webhook verified");
    let delay = state.subscribe_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = fb.subscribe_app().await {
            tracing::warn!("Messenger page subscription failed: {e:#}");
        }
    });
    (StatusCode::OK, params.challenge.unwrap_or_default()).into_response()
}

/// POST /webhook: Messenger deliveries.
pub async fn handle_messenger_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(fb) = state.facebook.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "Messenger not configured");
    };

    if let Some(app_secret) = state.facebook_app_secret.as_deref() {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(app_secret, &body, signature) {
            tracing::warn!(
                "Messenger signature verification failed (signature: {})",
                if signature.is_empty() { "missing" } else { "invalid" }
            );
            return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
        }
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid JSON payload");
    };

    for message in fb.parse_webhook_payload(&payload) {
        handle_chat_message(&state, Platform::Facebook, &message).await;
    }
    ok_response()
}

/// POST /webhook/alterdesk/{groupid}
pub async fn handle_alterdesk(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    body: Bytes,
) -> Response {
    let Some(ad) = state.alterdesk.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "Alterdesk not configured");
    };
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid JSON payload");
    };

    match ad.parse_webhook_payload(&group_id, &payload) {
        Some(message) => handle_chat_message(&state, Platform::Alterdesk, &message).await,
        None => tracing::debug!("Alterdesk delivery for {group_id} without a message body"),
    }
    ok_response()
}

async fn handle_chat_message(state: &AppState, platform: Platform, message: &ChannelMessage) {
    if !message.id.is_empty()
        && !state
            .replay_guard
            .first_seen(&format!("{}:{}", platform.code(), message.id))
    {
        tracing::info!("Skipping redelivered {platform} message {}", message.id);
        return;
    }
    tracing::debug!(
        "{platform} message from {}: {}",
        message.sender,
        truncate_with_ellipsis(&message.content, 50)
    );
    if let Err(e) = state.conversation.handle_message(platform, message).await {
        tracing::error!("{platform} message from {} failed: {e:#}", message.sender);
    }
}

/// POST /webhook/scheduler: Periodic tick that reminds clients of
/// questionnaires they left half way.
pub async fn handle_scheduler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(expected) = state.scheduler_secret_hash.as_deref() else {
        return error_response(StatusCode::NOT_FOUND, "Scheduler not configured");
    };
    let provided = headers
        .get("X-Scheduler-Secret")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let authorized = provided.is_some_and(|secret| {
        constant_time_eq(&hash_secret(secret), expected)
    });
    if !authorized {
        tracing::warn!("Scheduler webhook rejected: bad or missing X-Scheduler-Secret");
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    match state
        .conversation
        .nudge_stale_questionnaires(state.stale_after)
        .await
    {
        Ok(reminders) => {
            tracing::info!("Scheduler tick: {reminders} questionnaire reminder(s) sent");
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "ok", "reminders": reminders})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Scheduler tick failed: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Scheduler tick failed")
        }
    }
}

/// ANY /webhook/nokia/{userid}/{appli}: New measurements are available.
///
/// Nokia checks the callback URL with GET/HEAD when subscribing; those
/// are acknowledged without fetching.
pub async fn handle_nokia(
    State(state): State<AppState>,
    method: Method,
    Path((user_id, appli)): Path<(String, String)>,
) -> Response {
    let Some(nokia) = state.nokia.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "Nokia Health not configured");
    };
    if method == Method::GET || method == Method::HEAD {
        return ok_response();
    }

    let token = match state.store.token_by_extra(PROVIDER_NOKIA, &user_id) {
        Ok(Some(token)) => token,
        Ok(None) => {
            tracing::warn!("Nokia notification for unknown user {user_id}");
            return error_response(StatusCode::NOT_FOUND, "Unknown user");
        }
        Err(e) => {
            tracing::error!("Nokia token lookup failed: {e:#}");
            return ok_response();
        }
    };
    tracing::info!(client_id = token.client_id, "Nokia notification (appli {appli})");

    let marks = sync_marks(&state, token.client_id, PROVIDER_NOKIA);
    // One getmeas call returns every type, so a notification for one series
    // starts at that series' mark and anything else at the older of the two.
    let since = match appli.parse::<u8>() {
        Ok(APPLI_WEIGHT) => marks.weight,
        Ok(APPLI_BLOOD_PRESSURE) => marks.blood_pressure,
        _ => marks.oldest(),
    };
    match nokia
        .fetch_measurements(&token.credentials, &user_id, since)
        .await
    {
        Ok(readings) => store_readings(&state, token.client_id, &readings, PROVIDER_NOKIA),
        Err(e) => tracing::error!(client_id = token.client_id, "Nokia fetch failed: {e}"),
    }
    ok_response()
}

/// ANY /webhook/wunderlist/{client}: Task changes on a mirrored list.
pub async fn handle_wunderlist(
    State(state): State<AppState>,
    Path(client): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(client_id) = client.trim().parse::<i64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid client id");
    };
    if body.iter().all(u8::is_ascii_whitespace) {
        return ok_response();
    }
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid JSON payload");
    };

    match state.store.client_exists(client_id) {
        Ok(true) => {}
        Ok(false) => return error_response(StatusCode::NOT_FOUND, "Unknown client"),
        Err(e) => {
            tracing::error!("Client lookup failed: {e:#}");
            return ok_response();
        }
    }

    let Some(event) = parse_webhook(&payload) else {
        tracing::debug!(client_id, "Ignoring non-task Wunderlist event");
        return ok_response();
    };
    tracing::info!(client_id, "Wunderlist {:?} of task {}", event.operation, event.task.id);
    match state.store.apply_task_event(client_id, &event) {
        Ok(true) => {}
        Ok(false) => tracing::warn!(
            client_id,
            "Wunderlist {:?} of task {} changed nothing for this client",
            event.operation,
            event.task.id
        ),
        Err(e) => tracing::error!(client_id, "Wunderlist task update failed: {e:#}"),
    }
    ok_response()
}

/// POST /webhook/salesforce: Contact linking and coordinator replies.
pub async fn handle_salesforce(State(state): State<AppState>, body: Bytes) -> Response {
    let event = match serde_json::from_slice::<SalesforceEvent>(&body) {
        Ok(event) => event,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid payload: {e}")),
    };
    match state.conversation.handle_salesforce_event(&event).await {
        Ok(()) => ok_response(),
        Err(e) => {
            tracing::warn!("Salesforce event for contact {} failed: {e:#}", event.contact_id);
            error_response(StatusCode::UNPROCESSABLE_ENTITY, format!("{e:#}"))
        }
    }
}

/// ANY /webhook/vitadock: Vitadock signals new data for one of our access
/// tokens with an OAuth-signed request.
///
/// The signature is recomputed with the stored access secret; the consumer
/// key and token alone are not secrets.
pub async fn handle_vitadock(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(vitadock) = state.vitadock.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "Vitadock not configured");
    };
    let Some(oauth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_authorization_header)
    else {
        return error_response(StatusCode::BAD_REQUEST, "Missing OAuth authorization header");
    };

    let consumer_ok = oauth
        .get("oauth_consumer_key")
        .is_some_and(|key| constant_time_eq(key, vitadock.application_token()));
    if !consumer_ok {
        tracing::warn!("Vitadock notification with foreign consumer key");
        return error_response(StatusCode::UNAUTHORIZED, "Unknown application");
    }
    let method_ok = oauth
        .get("oauth_signature_method")
        .is_some_and(|m| m == vitadock.signer().method().as_str());
    let fresh = oauth
        .get("oauth_timestamp")
        .and_then(|ts| ts.parse::<i64>().ok())
        .is_some_and(|ts| (chrono::Utc::now().timestamp() - ts).abs() <= PUSH_MAX_SKEW_SECS);
    if !method_ok || !fresh {
        tracing::warn!("Vitadock notification with bad signature method or timestamp");
        return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
    }
    let Some(signature) = oauth.get("oauth_signature") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing oauth_signature");
    };
    let Some(access_key) = oauth.get("oauth_token").filter(|t| !t.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing oauth_token");
    };

    let token = match state
        .store
        .token_by_key(PROVIDER_VITADOCK, TokenKind::Access, access_key)
    {
        Ok(Some(token)) => token,
        Ok(None) => return error_response(StatusCode::UNAUTHORIZED, "Unknown token"),
        Err(e) => {
            tracing::error!("Vitadock token lookup failed: {e:#}");
            return ok_response();
        }
    };

    let url = format!(
        "{}{}",
        state.public_url,
        uri.path_and_query().map_or("/webhook/vitadock", |pq| pq.as_str())
    );
    let form_params: Vec<(String, String)> = if is_form(&headers) {
        parse_form_body(&String::from_utf8_lossy(&body))
            .into_iter()
            .collect()
    } else {
        Vec::new()
    };
    let expected = match vitadock.signer().signature_for(
        method.as_str(),
        &url,
        &form_params,
        &oauth,
        Some(&token.credentials.secret),
    ) {
        Ok(expected) => expected,
        Err(e) => {
            tracing::warn!("Vitadock signature check failed: {e}");
            return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
        }
    };
    if !constant_time_eq(&expected, signature) {
        tracing::warn!(client_id = token.client_id, "Vitadock notification with forged signature");
        return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
    }
    let nonce = oauth.get("oauth_nonce").map_or("", String::as_str);
    if !state
        .replay_guard
        .first_seen(&format!("vitadock:{}:{nonce}", token.client_id))
    {
        tracing::warn!(client_id = token.client_id, "Replayed Vitadock notification");
        return error_response(StatusCode::UNAUTHORIZED, "Replayed request");
    }

    let marks = sync_marks(&state, token.client_id, PROVIDER_VITADOCK);
    match vitadock.fetch_all(&token.credentials, marks).await {
        Ok(readings) => store_readings(&state, token.client_id, &readings, PROVIDER_VITADOCK),
        Err(e) => tracing::error!(client_id = token.client_id, "Vitadock fetch failed: {e}"),
    }
    ok_response()
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

fn sync_marks(state: &AppState, client_id: i64, source: &str) -> SyncMarks {
    state.store.sync_marks(client_id, source).unwrap_or_else(|e| {
        tracing::warn!(client_id, "Reading {source} sync marks failed: {e:#}");
        SyncMarks::default()
    })
}

pub(super) fn store_readings(
    state: &AppState,
    client_id: i64,
    readings: &crate::integrations::Readings,
    source: &str,
) {
    match state.store.store_readings(client_id, readings, source) {
        Ok(n) => tracing::info!(client_id, "Stored {n} {source} measurement(s)"),
        Err(e) => tracing::error!(client_id, "Storing {source} measurements failed: {e:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::channels::FacebookChannel;
    use crate::conversation::{ConversationHandler, ConversationSettings};
    use crate::integrations::oauth1::{SignatureMethod, Signer};
    use crate::integrations::{Credentials, NokiaClient, VitadockClient};
    use crate::nlu::Nlu;
    use axum::body::Body;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn messenger_state(nlu: Arc<FixedNlu>) -> (AppState, MockServer) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"recipient_id": "psid-1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/me/subscribed_apps"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"first_name": "Susan", "last_name": "Jansen"})),
            )
            .mount(&server)
            .await;

        let fb = Arc::new(
            FacebookChannel::new("page-token".into(), "verify-me".into()).with_api_base(&server.uri()),
        );
        let mut state = bare_state(nlu.clone() as Arc<dyn Nlu>);
        state.conversation = Arc::new(
            ConversationHandler::new(
                Arc::clone(&state.store),
                nlu as Arc<dyn Nlu>,
                ConversationSettings::default(),
            )
            .with_channel(Platform::Facebook, fb.clone()),
        );
        state.facebook = Some(fb);
        (state, server)
    }

    /// Authorization header of a Vitadock data push, signed with `consumer`.
    fn vitadock_push_header(consumer: &Credentials, token: &Credentials) -> String {
        Signer::new(consumer.clone(), SignatureMethod::HmacSha256)
            .sign("POST", "https://paula.test/webhook/vitadock", &[], Some(token), &[])
            .unwrap()
            .authorization_header()
    }

    fn messenger_delivery(mid: &str, text: &str) -> serde_json::Value {
        serde_json::json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "time": 1_500_000_000_000_i64,
                "messaging": [{
                    "sender": {"id": "psid-1"},
                    "recipient": {"id": "page-1"},
                    "timestamp": 1_500_000_000_000_i64,
                    "message": {"mid": mid, "text": text}
                }]
            }]
        })
    }

    #[tokio::test]
    async fn verify_echoes_challenge_and_subscribes_page() {
        let (state, server) = messenger_state(Arc::new(FixedNlu::speech(""))).await;
        let (status, body) = send(
            app(state),
            get_req("/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=12345"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "12345");

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().any(|r| r.url.path() == "/me/subscribed_apps"));
    }

    #[tokio::test]
    async fn verify_rejects_wrong_token() {
        let (state, _server) = messenger_state(Arc::new(FixedNlu::speech(""))).await;
        let (status, body) = send(
            app(state),
            get_req("/webhook?hub.verify_token=nope&hub.challenge=12345"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Error, wrong validation token");
    }

    #[tokio::test]
    async fn messenger_message_is_answered_once() {
        let nlu = Arc::new(FixedNlu::speech("Hoi Susan!"));
        let (state, server) = messenger_state(nlu.clone()).await;
        let delivery = messenger_delivery("mid.1", "Hallo");

        let (status, body) = send(app(state.clone()), post_json("/webhook", &delivery)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"ok\""));
        let (status, _) = send(app(state.clone()), post_json("/webhook", &delivery)).await;
        assert_eq!(status, StatusCode::OK);

        assert_eq!(nlu.requests.lock().as_slice(), ["Hallo".to_string()]);
        let client = state
            .store
            .find_client(Platform::Facebook, "psid-1")
            .unwrap()
            .unwrap();
        assert_eq!(client.name.as_deref(), Some("Susan Jansen"));

        let sent: Vec<serde_json::Value> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/me/messages")
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["recipient"]["id"], "psid-1");
        assert_eq!(sent[0]["message"]["text"], "Hoi Susan!");
    }

    #[tokio::test]
    async fn messenger_signature_is_enforced_when_secret_set() {
        let nlu = Arc::new(FixedNlu::speech("Hoi"));
        let (mut state, _server) = messenger_state(nlu.clone()).await;
        state.facebook_app_secret = Some(Arc::from("app-secret"));
        let body = messenger_delivery("mid.2", "Hallo").to_string();

        let unsigned = axum::http::Request::post("/webhook")
            .body(Body::from(body.clone()))
            .unwrap();
        let (status, _) = send(app(state.clone()), unsigned).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(nlu.requests.lock().is_empty());

        let signature = {
            use hmac::{Hmac, Mac};
            let mut mac = Hmac::<sha2::Sha256>::new_from_slice(b"app-secret").unwrap();
            mac.update(body.as_bytes());
            format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
        };
        let signed = axum::http::Request::post("/webhook")
            .header("X-Hub-Signature-256", signature)
            .body(Body::from(body))
            .unwrap();
        let (status, _) = send(app(state), signed).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(nlu.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn messenger_rejects_invalid_json() {
        let (state, _server) = messenger_state(Arc::new(FixedNlu::speech(""))).await;
        let request = axum::http::Request::post("/webhook")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(app(state), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn unconfigured_vendors_answer_not_found() {
        let state = bare_state(Arc::new(FixedNlu::speech("")));
        let (status, _) = send(
            app(state.clone()),
            post_json("/webhook/alterdesk/g1", &serde_json::json!({"body": "Hoi"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(app(state.clone()), get_req("/webhook?hub.verify_token=x")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(
            app(state),
            axum::http::Request::post("/webhook/scheduler").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scheduler_requires_matching_secret() {
        let nlu = Arc::new(FixedNlu::speech(""));
        let mut state = bare_state(nlu.clone());
        state.scheduler_secret_hash = Some(Arc::from(hash_secret("tick")));

        let wrong = axum::http::Request::post("/webhook/scheduler")
            .header("X-Scheduler-Secret", "tock")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(state.clone()), wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let right = axum::http::Request::post("/webhook/scheduler")
            .header("X-Scheduler-Secret", "tick")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(state), right).await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["reminders"], 0);
    }

    #[tokio::test]
    async fn wunderlist_create_delivered_twice_keeps_one_item() {
        let state = bare_state(Arc::new(FixedNlu::speech("")));
        let (client, _) = state
            .store
            .find_or_create_client(Platform::Facebook, "psid-1", None)
            .unwrap();
        let delivery = serde_json::json!({
            "operation": "create",
            "subject": {"id": 77, "type": "task", "parents": [{"id": 5, "type": "list"}]},
            "after": {"id": 77, "list_id": 5, "title": "Bloeddruk meten", "completed": false}
        });
        let uri = format!("/webhook/wunderlist/{}", client.id);

        for _ in 0..2 {
            let (status, _) = send(app(state.clone()), post_json(&uri, &delivery)).await;
            assert_eq!(status, StatusCode::OK);
        }
        let items = state.store.wunderlist_items(client.id).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Bloeddruk meten");

        let (status, _) = send(app(state.clone()), post_json("/webhook/wunderlist/abc", &delivery)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(app(state), post_json("/webhook/wunderlist/999", &delivery)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wunderlist_delivery_on_other_client_path_does_not_touch_items() {
        let state = bare_state(Arc::new(FixedNlu::speech("")));
        let (owner, _) = state
            .store
            .find_or_create_client(Platform::Facebook, "psid-1", None)
            .unwrap();
        let (other, _) = state
            .store
            .find_or_create_client(Platform::Facebook, "psid-2", None)
            .unwrap();
        let create = |title: &str| {
            serde_json::json!({
                "operation": "create",
                "subject": {"id": 77, "type": "task", "parents": [{"id": 5, "type": "list"}]},
                "after": {"id": 77, "list_id": 5, "title": title, "completed": false}
            })
        };
        let delete = serde_json::json!({
            "operation": "delete",
            "subject": {"id": 77, "type": "task", "parents": [{"id": 5, "type": "list"}]}
        });

        let own_uri = format!("/webhook/wunderlist/{}", owner.id);
        let other_uri = format!("/webhook/wunderlist/{}", other.id);
        send(app(state.clone()), post_json(&own_uri, &create("Wandelen"))).await;
        let (status, _) = send(app(state.clone()), post_json(&other_uri, &create("Weg"))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(app(state.clone()), post_json(&other_uri, &delete)).await;
        assert_eq!(status, StatusCode::OK);

        let items = state.store.wunderlist_items(owner.id).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Wandelen");
        assert!(state.store.wunderlist_items(other.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn salesforce_event_links_contact() {
        let state = bare_state(Arc::new(FixedNlu::speech("")));
        let (client, _) = state
            .store
            .find_or_create_client(Platform::Facebook, "psid-1", None)
            .unwrap();

        let (status, _) = send(
            app(state.clone()),
            post_json(
                "/webhook/salesforce",
                &serde_json::json!({"contactId": "003ABC", "clientId": client.id}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let linked = state
            .store
            .find_client(Platform::Salesforce, "003ABC")
            .unwrap()
            .unwrap();
        assert_eq!(linked.id, client.id);

        let (status, _) = send(
            app(state.clone()),
            post_json("/webhook/salesforce", &serde_json::json!({"clientId": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(
            app(state),
            post_json("/webhook/salesforce", &serde_json::json!({"contactId": "003XYZ"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn nokia_notification_fetches_and_stores_measurements() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/measure"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": 0,
                "body": {"measuregrps": [{
                    "date": 1_500_000_000,
                    "category": 1,
                    "measures": [
                        {"value": 120, "type": 10, "unit": 0},
                        {"value": 80, "type": 9, "unit": 0}
                    ]
                }]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut state = bare_state(Arc::new(FixedNlu::speech("")));
        state.nokia = Some(Arc::new(NokiaClient::with_base_urls(
            Credentials::new("nk", "ns"),
            &format!("{}/account", server.uri()),
            &server.uri(),
        )));
        let (client, _) = state
            .store
            .find_or_create_client(Platform::Facebook, "psid-1", None)
            .unwrap();
        state
            .store
            .upsert_token(
                client.id,
                PROVIDER_NOKIA,
                TokenKind::Access,
                &Credentials::new("at", "as"),
                Some("9001"),
            )
            .unwrap();

        let (status, _) = send(app(state.clone()), get_req("/webhook/nokia/9001/4")).await;
        assert_eq!(status, StatusCode::OK);

        let notify = axum::http::Request::post("/webhook/nokia/9001/4")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(state.clone()), notify).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.store.blood_pressure_count(client.id).unwrap(), 1);

        let unknown = axum::http::Request::post("/webhook/nokia/1234/4")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(state), unknown).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn nokia_weight_notification_fetches_from_the_weight_mark() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/measure"))
            .and(query_param("startdate", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": 0,
                "body": {"measuregrps": [{
                    "date": 2_000,
                    "category": 1,
                    "measures": [{"value": 8150, "type": 1, "unit": -2}]
                }]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut state = bare_state(Arc::new(FixedNlu::speech("")));
        state.nokia = Some(Arc::new(NokiaClient::with_base_urls(
            Credentials::new("nk", "ns"),
            &format!("{}/account", server.uri()),
            &server.uri(),
        )));
        let (client, _) = state
            .store
            .find_or_create_client(Platform::Facebook, "psid-1", None)
            .unwrap();
        state
            .store
            .upsert_token(
                client.id,
                PROVIDER_NOKIA,
                TokenKind::Access,
                &Credentials::new("at", "as"),
                Some("9001"),
            )
            .unwrap();
        let at = |ts: i64| chrono::DateTime::from_timestamp(ts, 0).unwrap();
        let readings = crate::integrations::Readings {
            blood_pressure: vec![crate::integrations::BloodPressureReading {
                measured_at: at(5_000),
                systolic: 120.0,
                diastolic: 80.0,
                pulse: None,
            }],
            weight: vec![crate::integrations::WeightReading {
                measured_at: at(1_000),
                kg: 82.0,
            }],
        };
        state.store.store_readings(client.id, &readings, PROVIDER_NOKIA).unwrap();

        let notify = axum::http::Request::post("/webhook/nokia/9001/1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(state.clone()), notify).await;
        assert_eq!(status, StatusCode::OK);
        let marks = state.store.sync_marks(client.id, PROVIDER_NOKIA).unwrap();
        assert_eq!(marks.weight.map(|d| d.timestamp()), Some(2_000));
    }

    #[tokio::test]
    async fn vitadock_push_requires_a_valid_signature() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/tensodata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "measurementDate": 1_500_000_000_000_i64,
                "systolic": 130.0,
                "diastolic": 85.0,
                "pulse": 70.0
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/targetscale"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let mut state = bare_state(Arc::new(FixedNlu::speech("")));
        state.vitadock = Some(Arc::new(VitadockClient::with_base_url(
            Credentials::new("app-token", "app-secret"),
            &server.uri(),
        )));
        let (client, _) = state
            .store
            .find_or_create_client(Platform::Alterdesk, "g1", None)
            .unwrap();
        let access = Credentials::new("vd-access", "vd-secret");
        state
            .store
            .upsert_token(client.id, PROVIDER_VITADOCK, TokenKind::Access, &access, None)
            .unwrap();

        let (status, _) = send(
            app(state.clone()),
            axum::http::Request::post("/webhook/vitadock").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let app_credentials = Credentials::new("app-token", "app-secret");
        let push = |authorization: String| {
            axum::http::Request::post("/webhook/vitadock")
                .header("authorization", authorization)
                .body(Body::empty())
                .unwrap()
        };

        let foreign = vitadock_push_header(&Credentials::new("other-app", "app-secret"), &access);
        let (status, _) = send(app(state.clone()), push(foreign)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // The consumer key and access token are public; without the secrets
        // the signature does not match.
        let forged = vitadock_push_header(
            &app_credentials,
            &Credentials::new("vd-access", "guessed-secret"),
        );
        let (status, _) = send(app(state.clone()), push(forged)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(state.store.blood_pressure_count(client.id).unwrap(), 0);

        let unknown = vitadock_push_header(&app_credentials, &Credentials::new("nope", "x"));
        let (status, _) = send(app(state.clone()), push(unknown)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let genuine = vitadock_push_header(&app_credentials, &access);
        let (status, _) = send(app(state.clone()), push(genuine.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.store.blood_pressure_count(client.id).unwrap(), 1);

        let (status, body) = send(app(state.clone()), push(genuine)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Replayed"));
    }
}
