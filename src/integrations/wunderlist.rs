//! Wunderlist: OAuth2 code flow, list mirroring and task webhooks.

use anyhow::{Context, Result};
use serde::Deserialize;

const AUTH_BASE_URL: &str = "https://www.wunderlist.com/oauth";
const API_BASE_URL: &str = "https://a.wunderlist.com/api/v1";

#[derive(Clone)]
pub struct WunderlistClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    auth_base: String,
    api_base: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WunderlistList {
    pub id: i64,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WunderlistTask {
    pub id: i64,
    pub list_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub operation: TaskOperation,
    pub task: WunderlistTask,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

impl WunderlistClient {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self::with_base_urls(client_id, client_secret, AUTH_BASE_URL, API_BASE_URL)
    }

    pub fn with_base_urls(
        client_id: String,
        client_secret: String,
        auth_base: &str,
        api_base: &str,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id,
            client_secret,
            auth_base: auth_base.trim_end_matches('/').to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// `state` carries our client id through the redirect.
    pub fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}/authorize?client_id={}&redirect_uri={}&state={}",
            self.auth_base,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state)
        )
    }

    pub async fn exchange_code(&self, code: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/access_token", self.auth_base))
            .json(&serde_json::json!({
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "code": code,
            }))
            .send()
            .await
            .context("Wunderlist token exchange request failed")?;
        let response = ensure_success(response, "Wunderlist token exchange").await?;
        let token: TokenResponse = response
            .json()
            .await
            .context("Wunderlist token response decode failed")?;
        match (token.access_token, token.error) {
            (Some(access_token), _) if !access_token.is_empty() => Ok(access_token),
            (_, Some(error)) => anyhow::bail!("Wunderlist token exchange rejected: {error}"),
            _ => anyhow::bail!("Wunderlist token response lacks access_token"),
        }
    }

    pub async fn fetch_lists(&self, access_token: &str) -> Result<Vec<WunderlistList>> {
        let response = self
            .authed(self.http.get(format!("{}/lists", self.api_base)), access_token)
            .send()
            .await
            .context("Wunderlist lists request failed")?;
        let response = ensure_success(response, "Wunderlist lists").await?;
        response
            .json()
            .await
            .context("Wunderlist lists decode failed")
    }

    pub async fn fetch_tasks(&self, access_token: &str, list_id: i64) -> Result<Vec<WunderlistTask>> {
        let response = self
            .authed(self.http.get(format!("{}/tasks", self.api_base)), access_token)
            .query(&[("list_id", list_id.to_string())])
            .send()
            .await
            .context("Wunderlist tasks request failed")?;
        let response = ensure_success(response, "Wunderlist tasks").await?;
        response
            .json()
            .await
            .context("Wunderlist tasks decode failed")
    }

    /// Register `url` to receive change notifications for one list.
    pub async fn create_webhook(&self, access_token: &str, list_id: i64, url: &str) -> Result<()> {
        let response = self
            .authed(self.http.post(format!("{}/webhooks", self.api_base)), access_token)
            .json(&serde_json::json!({
                "list_id": list_id,
                "url": url,
                "processor_type": "generic",
                "configuration": "",
            }))
            .send()
            .await
            .context("Wunderlist webhook request failed")?;
        ensure_success(response, "Wunderlist webhook").await?;
        Ok(())
    }

    fn authed(&self, request: reqwest::RequestBuilder, access_token: &str) -> reqwest::RequestBuilder {
        request
            .header("X-Access-Token", access_token)
            .header("X-Client-ID", &self.client_id)
    }
}

async fn ensure_success(response: reqwest::Response, op: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("{op} failed ({status}): {}", body.trim());
}

/// Parse a Wunderlist webhook delivery. Non-task subjects yield `None`.
pub fn parse_webhook(payload: &serde_json::Value) -> Option<TaskEvent> {
    let operation = match payload.get("operation")?.as_str()? {
        "create" => TaskOperation::Create,
        "update" => TaskOperation::Update,
        "delete" => TaskOperation::Delete,
        _ => return None,
    };
    let subject = payload.get("subject")?;
    if subject.get("type").and_then(serde_json::Value::as_str) != Some("task") {
        return None;
    }

    let snapshot = match operation {
        TaskOperation::Delete => payload.get("before"),
        _ => payload.get("after"),
    }
    .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()));

    let task = match snapshot {
        Some(snapshot) => serde_json::from_value(snapshot.clone()).ok()?,
        None => {
            // Deletes may arrive with only the subject; rebuild from its parents.
            let id = subject.get("id")?.as_i64()?;
            let list_id = subject
                .get("parents")?
                .as_array()?
                .iter()
                .find(|p| p.get("type").and_then(serde_json::Value::as_str) == Some("list"))?
                .get("id")?
                .as_i64()?;
            WunderlistTask {
                id,
                list_id,
                title: String::new(),
                completed: false,
                due_date: None,
            }
        }
    };
    Some(TaskEvent { operation, task })
}
