//! API.ai natural-language understanding client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

const API_BASE: &str = "https://api.api.ai/v1";
/// Protocol version pinned by the agent.
const PROTOCOL_VERSION: &str = "20150910";

/// Classification of one utterance or event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NluResult {
    #[serde(default)]
    pub resolved_query: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: NluMetadata,
    #[serde(default)]
    pub fulfillment: Fulfillment,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NluMetadata {
    #[serde(default)]
    pub intent_id: String,
    #[serde(default)]
    pub intent_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Fulfillment {
    #[serde(default)]
    pub speech: String,
    /// Platform-specific payloads, e.g. `data.facebook`.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

impl NluResult {
    /// A parameter as text, whether the agent sent it as string or number.
    pub fn param_str(&self, name: &str) -> Option<String> {
        match self.parameters.get(name)? {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn param_i64(&self, name: &str) -> Option<i64> {
        match self.parameters.get(name)? {
            serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn facebook_data(&self) -> Option<&serde_json::Value> {
        self.fulfillment.data.as_ref()?.get("facebook")
    }
}

#[async_trait]
pub trait Nlu: Send + Sync {
    async fn text_request(&self, session_id: &str, text: &str) -> Result<NluResult>;

    /// Trigger a named event intent (used by the scheduler nudges).
    async fn event_request(
        &self,
        session_id: &str,
        event: &str,
        data: serde_json::Value,
    ) -> Result<NluResult>;
}

#[derive(Clone)]
pub struct ApiAiClient {
    http: reqwest::Client,
    api_base: String,
    access_token: String,
    lang: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    result: Option<NluResult>,
    status: Option<QueryStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatus {
    code: u16,
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    error_details: Option<String>,
}

impl ApiAiClient {
    pub fn new(access_token: String, lang: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
            access_token,
            lang,
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    async fn query(&self, mut body: serde_json::Value, session_id: &str) -> Result<NluResult> {
        body["lang"] = serde_json::Value::String(self.lang.clone());
        body["sessionId"] = serde_json::Value::String(session_id.to_string());

        let response = self
            .http
            .post(format!("{}/query", self.api_base))
            .query(&[("v", PROTOCOL_VERSION)])
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .context("API.ai query request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("API.ai query failed ({status}): {}", text.trim());
        }
        let parsed: QueryResponse = response
            .json()
            .await
            .context("API.ai query decode failed")?;

        if let Some(s) = parsed.status.filter(|s| s.code >= 300) {
            anyhow::bail!(
                "API.ai query rejected ({} {}): {}",
                s.code,
                s.error_type,
                s.error_details.unwrap_or_default()
            );
        }
        parsed
            .result
            .context("API.ai response contained no result")
    }
}

#[async_trait]
impl Nlu for ApiAiClient {
    async fn text_request(&self, session_id: &str, text: &str) -> Result<NluResult> {
        self.query(serde_json::json!({ "query": text }), session_id)
            .await
    }

    async fn event_request(
        &self,
        session_id: &str,
        event: &str,
        data: serde_json::Value,
    ) -> Result<NluResult> {
        self.query(
            serde_json::json!({ "event": { "name": event, "data": data } }),
            session_id,
        )
        .await
    }
}
