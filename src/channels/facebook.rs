use crate::channels::traits::{Channel, ChannelMessage, Profile, SendMessage, SenderAction};
use crate::util::{split_message, MESSENGER_TEXT_LIMIT};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v2.6";
/// Sender actions go out a moment after the text so the indicator is visible.
const DEFAULT_ACTION_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct FacebookChannel {
    client: reqwest::Client,
    api_base: String,
    page_access_token: String,
    verify_token: String,
    action_delay: Duration,
}

impl FacebookChannel {
    pub fn new(page_access_token: String, verify_token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: GRAPH_API_BASE.to_string(),
            page_access_token,
            verify_token,
            action_delay: DEFAULT_ACTION_DELAY,
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = delay;
        self
    }

    pub fn verify_token(&self) -> &str {
        &self.verify_token
    }

    async fn post_messages(&self, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/me/messages", self.api_base))
            .query(&[("access_token", self.page_access_token.as_str())])
            .json(payload)
            .send()
            .await
            .context("Facebook send request failed")?;
        ensure_graph_success(response, "Facebook send").await?;
        Ok(())
    }

    /// Subscribe the app to page events (`POST me/subscribed_apps`).
    pub async fn subscribe_app(&self) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/me/subscribed_apps", self.api_base))
            .query(&[("access_token", self.page_access_token.as_str())])
            .send()
            .await
            .context("Facebook subscription request failed")?;
        let body = ensure_graph_success(response, "Facebook subscription").await?;
        tracing::info!("Facebook subscription result: {body}");
        Ok(())
    }

    /// Extract user messages from a Messenger webhook delivery.
    ///
    /// Echoes of our own messages are skipped. Quick-reply and postback
    /// payloads are used as the message text.
    pub fn parse_webhook_payload(&self, payload: &serde_json::Value) -> Vec<ChannelMessage> {
        let Ok(delivery) = serde_json::from_value::<WebhookDelivery>(payload.clone()) else {
            return Vec::new();
        };

        delivery
            .entry
            .into_iter()
            .flat_map(|entry| entry.messaging)
            .filter_map(|event| {
                let sender = id_to_string(&event.sender.id)?;
                let (id, text) = match (&event.message, &event.postback) {
                    (Some(message), _) if !message.is_echo => {
                        let text = message
                            .quick_reply
                            .as_ref()
                            .map(|q| q.payload.clone())
                            .or_else(|| message.text.clone())?;
                        (message.mid.clone().unwrap_or_default(), text)
                    }
                    (_, Some(postback)) => (
                        format!("postback-{}-{}", sender, event.timestamp.unwrap_or_default()),
                        postback.payload.clone()?,
                    ),
                    _ => return None,
                };
                if text.trim().is_empty() {
                    return None;
                }
                Some(ChannelMessage {
                    id,
                    reply_target: sender.clone(),
                    sender,
                    content: text,
                    channel: "facebook".to_string(),
                    timestamp: event.timestamp.unwrap_or_default() / 1000,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Channel for FacebookChannel {
    fn name(&self) -> &str {
        "facebook"
    }

    /// Long texts go out as several messages; quick replies ride on the last.
    async fn send(&self, message: &SendMessage) -> Result<()> {
        let chunks = split_message(&message.content, MESSENGER_TEXT_LIMIT);
        let last = chunks.len().saturating_sub(1);
        for (idx, chunk) in chunks.into_iter().enumerate() {
            let mut body = serde_json::json!({ "text": chunk });
            if idx == last && !message.quick_replies.is_empty() {
                body["quick_replies"] = message
                    .quick_replies
                    .iter()
                    .map(|q| {
                        serde_json::json!({
                            "content_type": "text",
                            "title": q.title,
                            "payload": q.payload,
                        })
                    })
                    .collect();
            }
            self.post_messages(&serde_json::json!({
                "recipient": { "id": message.recipient },
                "message": body,
            }))
            .await?;
        }
        Ok(())
    }

    async fn send_action(&self, recipient: &str, action: SenderAction) -> Result<()> {
        if !self.action_delay.is_zero() {
            tokio::time::sleep(self.action_delay).await;
        }
        self.post_messages(&serde_json::json!({
            "recipient": { "id": recipient },
            "sender_action": action.as_str(),
        }))
        .await
    }

    async fn send_raw(&self, recipient: &str, message: &serde_json::Value) -> Result<()> {
        self.post_messages(&serde_json::json!({
            "recipient": { "id": recipient },
            "message": message,
        }))
        .await
    }

    async fn get_profile(&self, handle: &str) -> Result<Profile> {
        let response = self
            .client
            .get(format!("{}/{handle}", self.api_base))
            .query(&[
                ("access_token", self.page_access_token.as_str()),
                ("fields", "first_name,last_name"),
            ])
            .send()
            .await
            .context("Facebook profile request failed")?;
        let body = ensure_graph_success(response, "Facebook profile").await?;
        serde_json::from_str(&body).context("Facebook profile decode failed")
    }

    /// The page token still resolves to the page.
    async fn health_check(&self) -> bool {
        let response = self
            .client
            .get(format!("{}/me", self.api_base))
            .query(&[("access_token", self.page_access_token.as_str()), ("fields", "id")])
            .send()
            .await;
        match response {
            Ok(response) => ensure_graph_success(response, "Facebook health check").await.is_ok(),
            Err(_) => false,
        }
    }
}

/// Graph API failures can arrive as non-2xx or as a 200 with an `error` object.
async fn ensure_graph_success(response: reqwest::Response, op: &str) -> Result<String> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("{op} failed ({status}): {}", body.trim());
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
        if let Some(error) = value.get("error") {
            anyhow::bail!("{op} failed: {error}");
        }
    }
    Ok(body)
}

/// Verify a Messenger webhook signature (`X-Hub-Signature-256`).
pub fn verify_signature(app_secret: &str, body: &[u8], signature_header: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Page-scoped ids exceed 2^53; accept them as JSON numbers or strings.
fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct WebhookDelivery {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Deserialize)]
struct MessagingEvent {
    sender: Party,
    timestamp: Option<u64>,
    message: Option<InboundMessage>,
    postback: Option<Postback>,
}

#[derive(Debug, Deserialize)]
struct Party {
    id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    mid: Option<String>,
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
    quick_reply: Option<QuickReplyPayload>,
}

#[derive(Debug, Deserialize)]
struct QuickReplyPayload {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct Postback {
    payload: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::traits::QuickReply;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn channel(server: &MockServer) -> FacebookChannel {
        FacebookChannel::new("page-token".into(), "verify".into())
            .with_api_base(&server.uri())
            .with_action_delay(Duration::ZERO)
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn signature_verification_accepts_valid_and_rejects_tampered() {
        let secret = hex::encode(rand::random::<[u8; 32]>());
        let body = br#"{"object":"page"}"#;
        let header = sign(&secret, body);

        assert!(verify_signature(&secret, body, &header));
        assert!(!verify_signature(&secret, br#"{"object":"user"}"#, &header));
        assert!(!verify_signature(&secret, body, "sha1=abc"));
        assert!(!verify_signature(&secret, body, "sha256=zz"));
    }

    #[test]
    fn webhook_payload_yields_text_quick_reply_and_postback() {
        let ch = FacebookChannel::new("t".into(), "v".into());
        let payload = serde_json::json!({
            "object": "page",
            "entry": [{
                "messaging": [
                    {"sender": {"id": 1_234_567_890_123_456_789_u64}, "timestamp": 1_500_000_000_000_u64,
                     "message": {"mid": "m1", "text": "Hoi Paula"}},
                    {"sender": {"id": "42"}, "message": {"mid": "m2", "text": "😁",
                     "quick_reply": {"payload": "4"}}},
                    {"sender": {"id": "42"}, "timestamp": 7, "postback": {"payload": "START"}},
                    {"sender": {"id": "page"}, "message": {"mid": "m3", "text": "echo", "is_echo": true}},
                    {"sender": {"id": "42"}, "delivery": {"mids": ["m1"]}}
                ]
            }]
        });

        let messages = ch.parse_webhook_payload(&payload);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].sender, "1234567890123456789");
        assert_eq!(messages[0].content, "Hoi Paula");
        assert_eq!(messages[0].timestamp, 1_500_000_000);
        assert_eq!(messages[1].content, "4");
        assert_eq!(messages[2].content, "START");
        assert_eq!(messages[2].id, "postback-42-7");
    }

    #[test]
    fn payload_without_entries_is_empty() {
        let ch = FacebookChannel::new("t".into(), "v".into());
        assert!(ch
            .parse_webhook_payload(&serde_json::json!({"object": "page"}))
            .is_empty());
    }

    #[tokio::test]
    async fn long_text_is_sent_in_chunks_with_quick_replies_on_last() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages"))
            .and(query_param("access_token", "page-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"message_id": "x"})))
            .expect(2)
            .mount(&server)
            .await;

        let text = "woord ".repeat(150);
        let message = SendMessage::new(text, "42")
            .with_quick_replies(vec![QuickReply::new("😁", "4"), QuickReply::new("N.v.t", "0")]);
        channel(&server).send(&message).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let first: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert!(first["message"].get("quick_replies").is_none());
        assert_eq!(second["message"]["quick_replies"][0]["payload"], "4");
        assert_eq!(second["message"]["quick_replies"][1]["content_type"], "text");
        assert_eq!(second["recipient"]["id"], "42");
    }

    #[tokio::test]
    async fn sender_action_is_posted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages"))
            .and(body_partial_json(serde_json::json!({"sender_action": "typing_on"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        channel(&server)
            .send_action("42", SenderAction::TypingOn)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn graph_error_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"message": "Invalid OAuth access token.", "code": 190}
            })))
            .mount(&server)
            .await;

        let err = channel(&server)
            .send(&SendMessage::new("hoi", "42"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid OAuth access token"));
    }

    #[tokio::test]
    async fn profile_is_fetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "first_name": "Susan", "last_name": "Jansen", "id": "42"
            })))
            .mount(&server)
            .await;

        let profile = channel(&server).get_profile("42").await.unwrap();
        assert_eq!(profile.full_name(), "Susan Jansen");
    }

    #[tokio::test]
    async fn health_check_follows_the_page_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(query_param("access_token", "page-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "1"})))
            .mount(&server)
            .await;
        assert!(channel(&server).health_check().await);

        let revoked = FacebookChannel::new("revoked".into(), "verify".into())
            .with_api_base(&server.uri());
        assert!(!revoked.health_check().await);
    }
}
