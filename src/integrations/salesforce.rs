//! Salesforce CRM: contact lookup and Chatter posts for care coordinators.

use crate::channels::{Channel, Profile, SendMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

const API_VERSION: &str = "v40.0";

#[derive(Clone)]
pub struct SalesforceClient {
    http: reqwest::Client,
    instance_url: String,
    access_token: String,
}

/// Inbound `POST /webhook/salesforce` body.
///
/// `client_id` links the contact to an existing client; `message` is a
/// coordinator reply to relay to that client.
#[derive(Debug, Clone, Deserialize)]
pub struct SalesforceEvent {
    #[serde(alias = "contactId")]
    pub contact_id: String,
    #[serde(default, alias = "clientId")]
    pub client_id: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContactRecord {
    first_name: Option<String>,
    last_name: Option<String>,
}

impl SalesforceClient {
    pub fn new(instance_url: &str, access_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            instance_url: instance_url.trim().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn sobjects_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/{API_VERSION}/sobjects/{path}",
            self.instance_url
        )
    }

    pub async fn get_profile(&self, contact_id: &str) -> Result<Profile> {
        let response = self
            .http
            .get(self.sobjects_url(&format!("Contact/{contact_id}")))
            .bearer_auth(&self.access_token)
            .query(&[("fields", "FirstName,LastName")])
            .send()
            .await
            .context("Salesforce contact request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Salesforce contact lookup failed ({status}): {}", body.trim());
        }
        let contact: ContactRecord = response
            .json()
            .await
            .context("Salesforce contact decode failed")?;
        Ok(Profile {
            first_name: contact.first_name.unwrap_or_default(),
            last_name: contact.last_name.unwrap_or_default(),
        })
    }

    /// Post `text` on the contact's Chatter feed.
    pub async fn send_message(&self, contact_id: &str, text: &str) -> Result<()> {
        let response = self
            .http
            .post(self.sobjects_url("FeedItem"))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "ParentId": contact_id,
                "Body": text,
            }))
            .send()
            .await
            .context("Salesforce feed item request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Salesforce feed item failed ({status}): {}", body.trim());
        }
        Ok(())
    }
}

/// Salesforce clients are reached through their contact's Chatter feed.
/// There are no quick replies there, so options are listed in the text.
#[async_trait]
impl Channel for SalesforceClient {
    fn name(&self) -> &str {
        "salesforce"
    }

    async fn send(&self, message: &SendMessage) -> Result<()> {
        self.send_message(&message.recipient, &message.numbered_text())
            .await
    }

    async fn get_profile(&self, handle: &str) -> Result<Profile> {
        SalesforceClient::get_profile(self, handle).await
    }
}
