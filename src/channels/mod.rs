//! Messaging platforms Paula talks through.
//!
//! Facebook Messenger and Alterdesk are full chat channels. Salesforce is a
//! notification-only platform whose client rows share the same `Platform`
//! discriminator.

pub mod alterdesk;
pub mod facebook;
pub mod traits;

pub use alterdesk::AlterdeskChannel;
pub use facebook::FacebookChannel;
pub use traits::{Channel, ChannelMessage, Profile, QuickReply, SendMessage, SenderAction};

use serde::{Deserialize, Serialize};

/// The `type` discriminator of a client row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "FB")]
    Facebook,
    #[serde(rename = "AD")]
    Alterdesk,
    #[serde(rename = "SF")]
    Salesforce,
}

impl Platform {
    pub fn code(self) -> &'static str {
        match self {
            Self::Facebook => "FB",
            Self::Alterdesk => "AD",
            Self::Salesforce => "SF",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "FB" => Some(Self::Facebook),
            "AD" => Some(Self::Alterdesk),
            "SF" => Some(Self::Salesforce),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
