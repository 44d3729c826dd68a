use crate::channels::traits::{Channel, ChannelMessage, Profile, SendMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

const API_BASE: &str = "https://api.alterdesk.com/v1";

/// Alterdesk group chat. Each coached client talks to Paula in their own
/// group chat, so the group id doubles as the reply target.
#[derive(Clone)]
pub struct AlterdeskChannel {
    client: reqwest::Client,
    api_base: String,
    api_token: String,
}

impl AlterdeskChannel {
    pub fn new(api_token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
            api_token,
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Parse one inbound group chat message posted to
    /// `/webhook/alterdesk/{groupid}`. Messages without a body are dropped.
    pub fn parse_webhook_payload(
        &self,
        group_id: &str,
        payload: &serde_json::Value,
    ) -> Option<ChannelMessage> {
        let event: InboundMessage = serde_json::from_value(payload.clone()).ok()?;
        let content = event.body.filter(|b| !b.trim().is_empty())?;
        let sender = event.user_id.as_ref().and_then(id_to_string)?;
        Some(ChannelMessage {
            id: event
                .message_id
                .as_ref()
                .and_then(id_to_string)
                .unwrap_or_else(|| format!("alterdesk-{group_id}-{}", uuid::Uuid::new_v4())),
            sender,
            reply_target: group_id.to_string(),
            content,
            channel: "alterdesk".to_string(),
            timestamp: event.created_at.unwrap_or_default(),
        })
    }
}

/// Map a numbered answer back onto the payload of the option it names.
/// Anything else passes through untouched.
pub fn resolve_numbered_answer(text: &str, options: &[crate::channels::QuickReply]) -> String {
    text.trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|idx| options.get(idx))
        .map_or_else(|| text.to_string(), |reply| reply.payload.clone())
}

#[async_trait]
impl Channel for AlterdeskChannel {
    fn name(&self) -> &str {
        "alterdesk"
    }

    async fn send(&self, message: &SendMessage) -> Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/groupchats/{}/messages",
                self.api_base, message.recipient
            ))
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "body": message.numbered_text() }))
            .send()
            .await
            .context("Alterdesk send request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Alterdesk send failed ({status}): {}", body.trim());
        }
        Ok(())
    }

    async fn get_profile(&self, handle: &str) -> Result<Profile> {
        let response = self
            .client
            .get(format!("{}/users/{handle}", self.api_base))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Alterdesk profile request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Alterdesk profile failed ({status}): {}", body.trim());
        }
        response
            .json::<Profile>()
            .await
            .context("Alterdesk profile decode failed")
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/me", self.api_base))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    message_id: Option<serde_json::Value>,
    user_id: Option<serde_json::Value>,
    body: Option<String>,
    created_at: Option<u64>,
}
