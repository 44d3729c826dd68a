//! Connect flows: a client follows a link from the chat, authorizes Paula at
//! the vendor and lands back on one of the callbacks below.

use super::webhooks::store_readings;
use super::{error_response, AppState};
use crate::integrations::nokia::{APPLI_BLOOD_PRESSURE, APPLI_WEIGHT};
use crate::integrations::{
    Credentials, SyncMarks, PROVIDER_NOKIA, PROVIDER_VITADOCK, PROVIDER_WUNDERLIST,
};
use crate::store::TokenKind;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct OAuth1Callback {
    pub oauth_token: Option<String>,
    pub oauth_verifier: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OAuth2Callback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

fn connected_page(service: &str) -> Response {
    Html(format!(
        "<!doctype html><html><body><p>Je {service} account is gekoppeld aan Paula. \
         Je kunt dit venster sluiten.</p></body></html>"
    ))
    .into_response()
}

fn known_client(state: &AppState, client_id: i64) -> Result<(), Response> {
    match state.store.client_exists(client_id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(error_response(StatusCode::NOT_FOUND, "Unknown client")),
        Err(e) => {
            tracing::error!("Client lookup failed: {e:#}");
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error"))
        }
    }
}

/// Look up the request token a callback refers to.
fn pending_request(
    state: &AppState,
    provider: &str,
    params: &OAuth1Callback,
) -> Result<(i64, Credentials, String), Response> {
    let (Some(token), Some(verifier)) = (
        params.oauth_token.as_deref().filter(|t| !t.is_empty()),
        params.oauth_verifier.as_deref().filter(|v| !v.is_empty()),
    ) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Missing oauth_token or oauth_verifier",
        ));
    };
    match state.store.token_by_key(provider, TokenKind::Request, token) {
        Ok(Some(stored)) => Ok((stored.client_id, stored.credentials, verifier.to_string())),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "Unknown or expired request token")),
        Err(e) => {
            tracing::error!("{provider} request token lookup failed: {e:#}");
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error"))
        }
    }
}

async fn notify_connected(state: &AppState, client_id: i64, service: &str) {
    let text = format!("Gelukt! Je {service} account is nu gekoppeld.");
    if let Err(e) = state.conversation.notify_client(client_id, &text).await {
        tracing::warn!(client_id, "Connect confirmation failed: {e:#}");
    }
}

/// GET /connect/nokia/{client_id}
pub async fn handle_nokia_start(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
) -> Response {
    let Some(nokia) = state.nokia.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "Nokia Health not configured");
    };
    if let Err(response) = known_client(&state, client_id) {
        return response;
    }

    let callback = format!("{}/connect/nokia/callback", state.public_url);
    match nokia.get_request_url(&callback).await {
        Ok((url, request_token)) => {
            if let Err(e) = state.store.upsert_token(
                client_id,
                PROVIDER_NOKIA,
                TokenKind::Request,
                &request_token,
                None,
            ) {
                tracing::error!(client_id, "Storing Nokia request token failed: {e:#}");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
            }
            Redirect::to(&url).into_response()
        }
        Err(e) => {
            tracing::error!(client_id, "Nokia request token failed: {e}");
            error_response(StatusCode::BAD_GATEWAY, "Nokia Health is not reachable")
        }
    }
}

/// GET /connect/nokia/callback
pub async fn handle_nokia_callback(
    State(state): State<AppState>,
    Query(params): Query<OAuth1Callback>,
) -> Response {
    let Some(nokia) = state.nokia.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "Nokia Health not configured");
    };
    let (client_id, request_token, verifier) =
        match pending_request(&state, PROVIDER_NOKIA, &params) {
            Ok(pending) => pending,
            Err(response) => return response,
        };

    let access = match nokia.exchange_token(&request_token, &verifier).await {
        Ok(access) => access,
        Err(e) => {
            tracing::error!(client_id, "Nokia access token exchange failed: {e}");
            return error_response(StatusCode::BAD_GATEWAY, "Nokia Health refused the connection");
        }
    };
    if let Err(e) = state.store.upsert_token(
        client_id,
        PROVIDER_NOKIA,
        TokenKind::Access,
        &access.token,
        Some(&access.user_id),
    ) {
        tracing::error!(client_id, "Storing Nokia access token failed: {e:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
    }
    if let Err(e) = state
        .store
        .delete_token(client_id, PROVIDER_NOKIA, TokenKind::Request)
    {
        tracing::warn!(client_id, "Dropping Nokia request token failed: {e:#}");
    }
    tracing::info!(client_id, "Nokia Health connected (user {})", access.user_id);

    for appli in [APPLI_WEIGHT, APPLI_BLOOD_PRESSURE] {
        let callback = format!("{}/webhook/nokia/{}/{appli}", state.public_url, access.user_id);
        if let Err(e) = nokia
            .subscribe(&access.token, &access.user_id, &callback, appli)
            .await
        {
            tracing::warn!(client_id, "Nokia subscription for appli {appli} failed: {e}");
        }
    }
    match nokia
        .fetch_measurements(&access.token, &access.user_id, None)
        .await
    {
        Ok(readings) => store_readings(&state, client_id, &readings, PROVIDER_NOKIA),
        Err(e) => tracing::warn!(client_id, "Initial Nokia fetch failed: {e}"),
    }

    notify_connected(&state, client_id, "Nokia Health").await;
    connected_page("Nokia Health")
}

/// GET /connect/vitadock/{client_id}
pub async fn handle_vitadock_start(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
) -> Response {
    let Some(vitadock) = state.vitadock.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "Vitadock not configured");
    };
    if let Err(response) = known_client(&state, client_id) {
        return response;
    }

    let callback = format!("{}/connect/vitadock", state.public_url);
    match vitadock.get_request_url(&callback).await {
        Ok((url, request_token)) => {
            if let Err(e) = state.store.upsert_token(
                client_id,
                PROVIDER_VITADOCK,
                TokenKind::Request,
                &request_token,
                None,
            ) {
                tracing::error!(client_id, "Storing Vitadock request token failed: {e:#}");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
            }
            Redirect::to(&url).into_response()
        }
        Err(e) => {
            tracing::error!(client_id, "Vitadock request token failed: {e}");
            error_response(StatusCode::BAD_GATEWAY, "Vitadock is not reachable")
        }
    }
}

/// GET /connect/vitadock: Callback after the user granted access.
pub async fn handle_vitadock_callback(
    State(state): State<AppState>,
    Query(params): Query<OAuth1Callback>,
) -> Response {
    let Some(vitadock) = state.vitadock.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "Vitadock not configured");
    };
    let (client_id, request_token, verifier) =
        match pending_request(&state, PROVIDER_VITADOCK, &params) {
            Ok(pending) => pending,
            Err(response) => return response,
        };

    let access = match vitadock.exchange_token(&request_token, &verifier).await {
        Ok(access) => access,
        Err(e) => {
            tracing::error!(client_id, "Vitadock access token exchange failed: {e}");
            return error_response(StatusCode::BAD_GATEWAY, "Vitadock refused the connection");
        }
    };
    if let Err(e) = state.store.upsert_token(
        client_id,
        PROVIDER_VITADOCK,
        TokenKind::Access,
        &access,
        None,
    ) {
        tracing::error!(client_id, "Storing Vitadock access token failed: {e:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
    }
    if let Err(e) = state
        .store
        .delete_token(client_id, PROVIDER_VITADOCK, TokenKind::Request)
    {
        tracing::warn!(client_id, "Dropping Vitadock request token failed: {e:#}");
    }
    tracing::info!(client_id, "Vitadock connected");

    match vitadock.fetch_all(&access, SyncMarks::default()).await {
        Ok(readings) => store_readings(&state, client_id, &readings, PROVIDER_VITADOCK),
        Err(e) => tracing::warn!(client_id, "Initial Vitadock fetch failed: {e}"),
    }

    notify_connected(&state, client_id, "Vitadock").await;
    connected_page("Vitadock")
}

/// GET /connect/wunderlist/{client_id}
///
/// The OAuth2 `state` is a random single-use value stored like a request
/// token; the callback resolves the client from it.
pub async fn handle_wunderlist_start(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
) -> Response {
    let Some(wunderlist) = state.wunderlist.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "Wunderlist not configured");
    };
    if let Err(response) = known_client(&state, client_id) {
        return response;
    }
    let nonce = Uuid::new_v4().simple().to_string();
    if let Err(e) = state.store.upsert_token(
        client_id,
        PROVIDER_WUNDERLIST,
        TokenKind::Request,
        &Credentials::new(nonce.clone(), ""),
        None,
    ) {
        tracing::error!(client_id, "Storing Wunderlist state failed: {e:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
    }
    let callback = format!("{}/connect/wunderlist/callback", state.public_url);
    Redirect::to(&wunderlist.authorize_url(&callback, &nonce)).into_response()
}

/// Resolve and consume the `state` of a Wunderlist callback.
fn take_wunderlist_state(state: &AppState, nonce: &str) -> Result<i64, Response> {
    let client_id = match state
        .store
        .token_by_key(PROVIDER_WUNDERLIST, TokenKind::Request, nonce)
    {
        Ok(Some(stored)) => stored.client_id,
        Ok(None) => return Err(error_response(StatusCode::BAD_REQUEST, "Invalid state")),
        Err(e) => {
            tracing::error!("Wunderlist state lookup failed: {e:#}");
            return Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error"));
        }
    };
    if let Err(e) = state
        .store
        .delete_token(client_id, PROVIDER_WUNDERLIST, TokenKind::Request)
    {
        tracing::error!(client_id, "Consuming Wunderlist state failed: {e:#}");
        return Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error"));
    }
    Ok(client_id)
}

/// GET /connect/wunderlist/callback
///
/// Mirrors every list of the account and registers a webhook per list so
/// later task changes arrive on `/webhook/wunderlist/{client}`.
pub async fn handle_wunderlist_callback(
    State(state): State<AppState>,
    Query(params): Query<OAuth2Callback>,
) -> Response {
    let Some(wunderlist) = state.wunderlist.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "Wunderlist not configured");
    };
    if let Some(error) = params.error.as_deref() {
        tracing::warn!("Wunderlist authorization denied: {error}");
        return error_response(StatusCode::BAD_REQUEST, format!("Authorization denied: {error}"));
    }
    let Some(nonce) = params.state.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid state");
    };
    let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing code");
    };
    let client_id = match take_wunderlist_state(&state, nonce) {
        Ok(client_id) => client_id,
        Err(response) => return response,
    };

    let access_token = match wunderlist.exchange_code(code).await {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(client_id, "Wunderlist code exchange failed: {e:#}");
            return error_response(StatusCode::BAD_GATEWAY, "Wunderlist refused the connection");
        }
    };
    if let Err(e) = state.store.upsert_token(
        client_id,
        PROVIDER_WUNDERLIST,
        TokenKind::Access,
        &Credentials::new(access_token.clone(), ""),
        None,
    ) {
        tracing::error!(client_id, "Storing Wunderlist token failed: {e:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
    }
    tracing::info!(client_id, "Wunderlist connected");

    let lists = match wunderlist.fetch_lists(&access_token).await {
        Ok(lists) => lists,
        Err(e) => {
            tracing::warn!(client_id, "Fetching Wunderlist lists failed: {e:#}");
            Vec::new()
        }
    };
    let webhook_url = format!("{}/webhook/wunderlist/{client_id}", state.public_url);
    for list in &lists {
        match state.store.upsert_wunderlist_list(client_id, list) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(client_id, "Wunderlist list {} belongs to another client", list.id);
                continue;
            }
            Err(e) => {
                tracing::error!(client_id, "Storing Wunderlist list {} failed: {e:#}", list.id);
                continue;
            }
        }
        match wunderlist.fetch_tasks(&access_token, list.id).await {
            Ok(tasks) => {
                for task in &tasks {
                    if let Err(e) = state.store.upsert_wunderlist_item(client_id, task) {
                        tracing::warn!(client_id, "Storing task {} failed: {e:#}", task.id);
                    }
                }
            }
            Err(e) => tracing::warn!(client_id, "Fetching tasks of list {} failed: {e:#}", list.id),
        }
        match wunderlist
            .create_webhook(&access_token, list.id, &webhook_url)
            .await
        {
            Ok(()) => {
                if let Err(e) = state.store.mark_wunderlist_webhook(client_id, list.id) {
                    tracing::warn!(client_id, "Marking webhook of list {} failed: {e:#}", list.id);
                }
            }
            Err(e) => tracing::warn!(client_id, "Wunderlist webhook for list {} failed: {e:#}", list.id),
        }
    }

    notify_connected(&state, client_id, "Wunderlist").await;
    connected_page("Wunderlist")
}
