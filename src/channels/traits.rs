use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One tappable answer offered under a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuickReply {
    pub title: String,
    pub payload: String,
}

impl QuickReply {
    pub fn new(title: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            payload: payload.into(),
        }
    }
}

/// Outbound text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    pub content: String,
    pub recipient: String,
    pub quick_replies: Vec<QuickReply>,
}

impl SendMessage {
    pub fn new(content: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            recipient: recipient.into(),
            quick_replies: Vec::new(),
        }
    }

    pub fn with_quick_replies(mut self, quick_replies: Vec<QuickReply>) -> Self {
        self.quick_replies = quick_replies;
        self
    }

    /// Content with the quick replies appended as a numbered list, for
    /// platforms without a quick reply widget.
    pub fn numbered_text(&self) -> String {
        if self.quick_replies.is_empty() {
            return self.content.clone();
        }
        let options = self
            .quick_replies
            .iter()
            .enumerate()
            .map(|(idx, reply)| format!("{}. {}", idx + 1, reply.title))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{}\n\n{options}", self.content)
    }
}

/// Inbound message normalised from a platform webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub id: String,
    pub sender: String,
    pub reply_target: String,
    pub content: String,
    pub channel: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl Profile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderAction {
    TypingOn,
    TypingOff,
    MarkSeen,
}

impl SenderAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TypingOn => "typing_on",
            Self::TypingOff => "typing_off",
            Self::MarkSeen => "mark_seen",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "typing_on" => Some(Self::TypingOn),
            "typing_off" => Some(Self::TypingOff),
            "mark_seen" => Some(Self::MarkSeen),
            _ => None,
        }
    }
}

/// An outbound messaging platform.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &SendMessage) -> anyhow::Result<()>;

    /// Typing indicators and read receipts. Platforms without them ignore it.
    async fn send_action(&self, _recipient: &str, _action: SenderAction) -> anyhow::Result<()> {
        Ok(())
    }

    /// Platform-native structured message (templates, attachments).
    async fn send_raw(&self, _recipient: &str, _message: &serde_json::Value) -> anyhow::Result<()> {
        anyhow::bail!("{} does not support structured messages", self.name())
    }

    async fn get_profile(&self, handle: &str) -> anyhow::Result<Profile>;

    async fn health_check(&self) -> bool {
        true
    }
}
