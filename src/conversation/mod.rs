//! Turns NLU results into side effects and replies.

pub mod action;
pub mod quick_replies;

pub use action::{Action, ActionError};

use crate::channels::alterdesk::resolve_numbered_answer;
use crate::channels::{Channel, ChannelMessage, Platform, QuickReply, SendMessage, SenderAction};
use crate::integrations::salesforce::SalesforceEvent;
use crate::nlu::{Nlu, NluResult};
use crate::session::{OfferedReplies, RecipeSelections, SessionStore};
use crate::store::{Client, QuestionnaireKind, Store};
use crate::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Intent ids of the agent's fallback intents; questions landing there go to a human.
pub const DEFAULT_INTENTS: &[&str] = &[
    "57b82498-053c-4776-8be9-228c420e6c13",
    "b429ecdc-21f4-4a07-8165-3620023185ba",
];
pub const DEFAULT_ESCALATION_AGENT: &str = "1581441435202307";
pub const REMINDER_EVENT: &str = "questionnaire_reminder";
pub const PAM_QUESTIONS: i64 = 13;
const RECIPE_OFFER_LIMIT: usize = 3;
/// Messenger quick reply titles are cut off at 20 characters.
const QUICK_REPLY_TITLE_CHARS: usize = 17;
const CHANNEL_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConversationSettings {
    /// Externally reachable base URL, used in connect links.
    pub public_url: String,
    pub default_intents: Vec<String>,
    /// Messenger id of the human agent escalations are referred to.
    pub escalation_agent: Option<String>,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            public_url: "http://localhost:5000".into(),
            default_intents: DEFAULT_INTENTS.iter().map(|s| (*s).to_string()).collect(),
            escalation_agent: Some(DEFAULT_ESCALATION_AGENT.into()),
        }
    }
}

/// What one inbound message led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled {
    pub client_id: i64,
    pub session_id: String,
    pub new_session: bool,
    pub action: Action,
    pub escalated: bool,
}

#[derive(Debug, Default)]
struct Outcome {
    text: String,
    quick_replies: Vec<QuickReply>,
}

impl Outcome {
    fn speech(result: &NluResult) -> Self {
        Self {
            text: result.fulfillment.speech.clone(),
            quick_replies: Vec::new(),
        }
    }

    fn with_replies(mut self, replies: Vec<QuickReply>) -> Self {
        self.quick_replies = replies;
        self
    }
}

#[derive(Clone)]
pub struct ConversationHandler {
    store: Arc<Store>,
    nlu: Arc<dyn Nlu>,
    sessions: Arc<SessionStore>,
    recipes: Arc<RecipeSelections>,
    offered: Arc<OfferedReplies>,
    channels: HashMap<Platform, Arc<dyn Channel>>,
    settings: Arc<ConversationSettings>,
}

impl ConversationHandler {
    pub fn new(store: Arc<Store>, nlu: Arc<dyn Nlu>, settings: ConversationSettings) -> Self {
        Self {
            store,
            nlu,
            sessions: Arc::new(SessionStore::default()),
            recipes: Arc::new(RecipeSelections::default()),
            offered: Arc::new(OfferedReplies::default()),
            channels: HashMap::new(),
            settings: Arc::new(settings),
        }
    }

    pub fn with_channel(mut self, platform: Platform, channel: Arc<dyn Channel>) -> Self {
        self.channels.insert(platform, channel);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Reachability of each configured chat channel, keyed by channel name.
    pub async fn channel_health(&self) -> Vec<(&str, bool)> {
        let mut report = Vec::with_capacity(self.channels.len());
        for channel in self.channels.values() {
            let healthy = tokio::time::timeout(CHANNEL_HEALTH_TIMEOUT, channel.health_check())
                .await
                .unwrap_or(false);
            if !healthy {
                tracing::warn!("{} channel failed its health check", channel.name());
            }
            report.push((channel.name(), healthy));
        }
        report.sort_by_key(|(name, _)| *name);
        report
    }

    fn channel(&self, platform: Platform) -> Result<&Arc<dyn Channel>> {
        self.channels
            .get(&platform)
            .with_context(|| format!("no channel configured for {platform}"))
    }

    /// Handle one inbound chat message end to end.
    ///
    /// `message.reply_target` is the client handle; `message.sender` is used
    /// for the profile lookup of a new client.
    pub async fn handle_message(&self, platform: Platform, message: &ChannelMessage) -> Result<Handled> {
        let handle = message.reply_target.as_str();
        let client = self.resolve_client(platform, handle, &message.sender).await?;
        let (session_id, new_session) = self.sessions.get_or_create(client.id);
        if new_session {
            tracing::info!(client_id = client.id, "New NLU session {session_id}");
        }

        let text = if platform == Platform::Facebook {
            message.content.clone()
        } else {
            resolve_numbered_answer(&message.content, &self.offered.last(client.id))
        };
        if let Err(e) = self
            .store
            .log_event(client.id, "in", &text, None, Some(&session_id))
        {
            tracing::warn!("Failed to log inbound message: {e:#}");
        }
        tracing::info!(
            client_id = client.id,
            "{platform} message: {}",
            truncate_with_ellipsis(&text, 80)
        );

        let result = self
            .nlu
            .text_request(&session_id, &text)
            .await
            .context("NLU text request failed")?;

        let action = match Action::from_result(&result) {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(client_id = client.id, "Ignoring NLU action: {e}");
                Action::None
            }
        };

        let escalated = matches!(action, Action::Escalate)
            || self
                .settings
                .default_intents
                .iter()
                .any(|id| *id == result.metadata.intent_id);

        let outcome = match self.perform(&client, &action, &result).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(client_id = client.id, "Action {} failed: {e:#}", action.name());
                Outcome::speech(&result)
            }
        };

        if escalated {
            if let Err(e) = self.escalate(&client, &result.resolved_query).await {
                tracing::error!(client_id = client.id, "Escalation failed: {e:#}");
            }
        }

        self.deliver(&client, Some(&result), outcome).await;
        if let Err(e) = self.store.log_event(
            client.id,
            "out",
            &result.fulfillment.speech,
            Some(action.name()).filter(|n| !n.is_empty()),
            Some(&session_id),
        ) {
            tracing::warn!("Failed to log outbound message: {e:#}");
        }

        Ok(Handled {
            client_id: client.id,
            session_id,
            new_session,
            action,
            escalated,
        })
    }

    async fn resolve_client(&self, platform: Platform, handle: &str, profile_id: &str) -> Result<Client> {
        let (mut client, created) = self.store.find_or_create_client(platform, handle, None)?;
        if created {
            tracing::info!(client_id = client.id, "New {platform} client");
            if let Ok(channel) = self.channel(platform) {
                match channel.get_profile(profile_id).await {
                    Ok(profile) if !profile.full_name().is_empty() => {
                        let name = profile.full_name();
                        self.store.set_client_name(client.id, &name)?;
                        client.name = Some(name);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Profile lookup for new client failed: {e:#}"),
                }
            }
        }
        Ok(client)
    }

    async fn perform(&self, client: &Client, action: &Action, result: &NluResult) -> Result<Outcome> {
        let outcome = match action {
            Action::None | Action::Escalate => Outcome::speech(result),
            Action::Unknown(name) => {
                tracing::warn!(client_id = client.id, "Unknown NLU action {name}");
                Outcome::speech(result)
            }
            Action::WhoAreYou => {
                let speech = &result.fulfillment.speech;
                let text = match client.name.as_deref() {
                    Some(name) => format!("Jij bent {name}. {speech}").trim().to_string(),
                    None => speech.clone(),
                };
                Outcome {
                    text,
                    quick_replies: Vec::new(),
                }
            }
            Action::PamSum { score } => {
                let instance = match self.store.open_questionnaire(client.id, QuestionnaireKind::Pam)? {
                    Some(instance) => instance,
                    None => self.store.start_questionnaire(client.id, QuestionnaireKind::Pam)?,
                };
                let answer = self
                    .store
                    .record_answer(instance.id, &score.to_string(), Some(*score))?;
                tracing::info!(client_id = client.id, "PAM answer {} = {score}", answer.number);
                if answer.number >= PAM_QUESTIONS {
                    self.store.stop_questionnaires(client.id)?;
                    Outcome::speech(result)
                } else {
                    Outcome::speech(result).with_replies(quick_replies::pam_scale())
                }
            }
            Action::QuestionnaireStart { kind } => {
                let instance = self.store.start_questionnaire(client.id, *kind)?;
                tracing::info!(client_id = client.id, "Started {} run {}", kind.as_str(), instance.id);
                let replies = match kind {
                    QuestionnaireKind::Pam => quick_replies::pam_scale(),
                    QuestionnaireKind::Sf12 => quick_replies::sf12(1),
                };
                Outcome::speech(result).with_replies(replies)
            }
            Action::Sf12Answer { answer } => {
                let instance = match self.store.open_questionnaire(client.id, QuestionnaireKind::Sf12)? {
                    Some(instance) => instance,
                    None => self.store.start_questionnaire(client.id, QuestionnaireKind::Sf12)?,
                };
                let number = self.store.answer_count(instance.id)? + 1;
                let score = quick_replies::sf12_score(number, answer);
                self.store.record_answer(instance.id, answer, score)?;
                if number >= quick_replies::SF12_QUESTIONS {
                    self.store.stop_questionnaires(client.id)?;
                    Outcome::speech(result)
                } else {
                    Outcome::speech(result).with_replies(quick_replies::sf12(number + 1))
                }
            }
            Action::QuestionnaireStop => {
                let stopped = self.store.stop_questionnaires(client.id)?;
                tracing::info!(client_id = client.id, "Stopped {stopped} questionnaire(s)");
                Outcome::speech(result)
            }
            Action::ConnectNokia => self.connect_link(client, result, "nokia", "Nokia Health"),
            Action::ConnectVitadock => self.connect_link(client, result, "vitadock", "Vitadock"),
            Action::ConnectWunderlist => {
                self.connect_link(client, result, "wunderlist", "Wunderlist")
            }
            Action::RecipeSearch { term } => {
                let found = self.store.search_recipes(term, RECIPE_OFFER_LIMIT)?;
                if found.is_empty() {
                    self.recipes.clear(client.id);
                    Outcome {
                        text: format!("Ik heb helaas geen recept gevonden met {term}."),
                        quick_replies: Vec::new(),
                    }
                } else {
                    self.recipes
                        .offer(client.id, found.iter().map(|r| r.id).collect());
                    let mut text = result.fulfillment.speech.trim().to_string();
                    let mut replies = Vec::with_capacity(found.len());
                    for (idx, recipe) in found.iter().enumerate() {
                        let n = idx + 1;
                        text.push_str(&format!("\n{n}. {}", recipe.title));
                        replies.push(QuickReply::new(
                            truncate_with_ellipsis(&recipe.title, QUICK_REPLY_TITLE_CHARS),
                            n.to_string(),
                        ));
                    }
                    Outcome {
                        text: text.trim_start().to_string(),
                        quick_replies: replies,
                    }
                }
            }
            Action::RecipeSelect { choice } => {
                let recipe = match self.recipes.choose(client.id, *choice) {
                    Some(id) => self.store.recipe(id)?,
                    None => None,
                };
                let text = match recipe {
                    Some(recipe) => format!("{}: {}", recipe.title, recipe.url),
                    None => "Dat recept kan ik niet meer terugvinden. Zoek je opnieuw?".to_string(),
                };
                Outcome {
                    text,
                    quick_replies: Vec::new(),
                }
            }
        };
        Ok(outcome)
    }

    fn connect_link(&self, client: &Client, result: &NluResult, provider: &str, label: &str) -> Outcome {
        let url = format!(
            "{}/connect/{provider}/{}",
            self.settings.public_url.trim_end_matches('/'),
            client.id
        );
        let speech = result.fulfillment.speech.trim();
        let text = if speech.is_empty() {
            format!("Via deze link koppel je je {label} account:\n{url}")
        } else {
            format!("{speech}\n{url}")
        };
        Outcome {
            text,
            quick_replies: Vec::new(),
        }
    }

    /// Record the question and refer it to the human agent.
    async fn escalate(&self, client: &Client, question: &str) -> Result<()> {
        let name = client.name.clone().unwrap_or_else(|| format!("client {}", client.id));
        let agent = self.settings.escalation_agent.clone().unwrap_or_default();
        let id = self.store.create_escalation(client.id, question, &agent)?;
        tracing::info!(client_id = client.id, "Escalation {id} created");

        let text = format!(
            "Hallo, ik heb een vraag gekregen van {name} die ik niet kan beantwoorden:\n \"{question}\""
        );
        if !agent.is_empty() {
            if let Ok(facebook) = self.channel(Platform::Facebook) {
                facebook
                    .send(&SendMessage::new(text.clone(), agent))
                    .await
                    .context("Failed to notify escalation agent")?;
            }
        }

        // Care coordinators in Salesforce see it on the contact's feed.
        let identities = self.store.client_identities(client.id)?;
        if let Some(sf) = identities.iter().find(|c| c.platform == Platform::Salesforce) {
            if let Ok(salesforce) = self.channel(Platform::Salesforce) {
                salesforce
                    .send(&SendMessage::new(text, sf.handle.clone()))
                    .await
                    .context("Failed to post escalation to Salesforce")?;
            }
        }
        Ok(())
    }

    /// Send the reply. Vendor failures are logged, never returned.
    async fn deliver(&self, client: &Client, result: Option<&NluResult>, outcome: Outcome) {
        let Ok(channel) = self.channel(client.platform) else {
            tracing::warn!("No {} channel to reply to client {}", client.platform, client.id);
            return;
        };
        let target = client.handle.as_str();

        if client.platform == Platform::Facebook {
            if let Some(formatted) = result.and_then(NluResult::facebook_data) {
                self.deliver_formatted(channel.as_ref(), target, formatted).await;
                return;
            }
        }

        if outcome.text.trim().is_empty() {
            return;
        }
        self.offered.offer(client.id, outcome.quick_replies.clone());
        let message = SendMessage::new(outcome.text, target).with_quick_replies(outcome.quick_replies);
        if let Err(e) = channel.send(&message).await {
            tracing::error!(client_id = client.id, "Reply failed: {e:#}");
        }
    }

    /// `fulfillment.data.facebook`: one raw message, or a list of raw
    /// messages and sender actions sent in order.
    async fn deliver_formatted(&self, channel: &dyn Channel, target: &str, formatted: &serde_json::Value) {
        let items = match formatted {
            serde_json::Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        };
        for item in items {
            let outcome = match item.get("sender_action").and_then(serde_json::Value::as_str) {
                Some(action) => match SenderAction::parse(action) {
                    Some(action) => channel.send_action(target, action).await,
                    None => {
                        tracing::warn!("Unknown sender action {action}");
                        continue;
                    }
                },
                None => channel.send_raw(target, item).await,
            };
            if let Err(e) = outcome {
                tracing::error!("Formatted reply failed: {e:#}");
            }
        }
    }

    /// The identity a person is best reached on: Messenger, then Alterdesk,
    /// then the Salesforce feed.
    fn reachable_identity(&self, client_id: i64) -> Result<Option<Client>> {
        let identities = self.store.client_identities(client_id)?;
        Ok([Platform::Facebook, Platform::Alterdesk, Platform::Salesforce]
            .into_iter()
            .filter(|p| self.channels.contains_key(p))
            .find_map(|p| identities.iter().find(|c| c.platform == p).cloned()))
    }

    /// Send a plain notification to a person on their preferred platform.
    pub async fn notify_client(&self, client_id: i64, text: &str) -> Result<()> {
        let client = self
            .reachable_identity(client_id)?
            .with_context(|| format!("client {client_id} has no reachable identity"))?;
        self.channel(client.platform)?
            .send(&SendMessage::new(text, client.handle.clone()))
            .await?;
        if let Err(e) = self.store.log_event(client_id, "out", text, None, None) {
            tracing::warn!("Failed to log notification: {e:#}");
        }
        Ok(())
    }

    /// Link a Salesforce contact and relay a coordinator message.
    pub async fn handle_salesforce_event(&self, event: &SalesforceEvent) -> Result<()> {
        let client_id = match event.client_id {
            Some(id) => {
                anyhow::ensure!(self.store.client_exists(id)?, "unknown client {id}");
                self.store
                    .link_client(id, Platform::Salesforce, &event.contact_id)?;
                tracing::info!(client_id = id, "Linked Salesforce contact {}", event.contact_id);
                id
            }
            None => self
                .store
                .find_client(Platform::Salesforce, &event.contact_id)?
                .with_context(|| format!("contact {} is not linked", event.contact_id))?
                .id,
        };

        let Some(message) = event.message.as_deref().filter(|m| !m.trim().is_empty()) else {
            return Ok(());
        };
        let client = [Platform::Facebook, Platform::Alterdesk]
            .into_iter()
            .find_map(|p| {
                self.store
                    .client_identities(client_id)
                    .ok()?
                    .into_iter()
                    .find(|c| c.platform == p && self.channels.contains_key(&p))
            })
            .with_context(|| format!("client {client_id} has no chat identity"))?;
        self.channel(client.platform)?
            .send(&SendMessage::new(message, client.handle.clone()))
            .await?;
        if let Some(open) = self.store.open_escalation(client_id)? {
            self.store.answer_escalation(open.id, message)?;
        }
        self.store.log_event(client_id, "out", message, Some("coordinator"), None)?;
        Ok(())
    }

    /// Remind clients of questionnaires idle for longer than `max_age`.
    /// Returns how many reminders went out.
    pub async fn nudge_stale_questionnaires(&self, max_age: Duration) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp()
            - i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let stale = self.store.stale_questionnaires(cutoff)?;
        let mut sent = 0;
        for instance in stale {
            match self.nudge(instance.client_id, instance.id, instance.kind).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(
                    client_id = instance.client_id,
                    "Questionnaire reminder failed: {e:#}"
                ),
            }
        }
        Ok(sent)
    }

    async fn nudge(&self, client_id: i64, instance_id: i64, kind: QuestionnaireKind) -> Result<()> {
        let client = self
            .reachable_identity(client_id)?
            .with_context(|| format!("client {client_id} has no reachable identity"))?;
        let (session_id, _) = self.sessions.get_or_create(client_id);
        let result = self
            .nlu
            .event_request(
                &session_id,
                REMINDER_EVENT,
                serde_json::json!({ "questionnaire": kind.as_str() }),
            )
            .await?;
        let replies = match kind {
            QuestionnaireKind::Pam => quick_replies::pam_scale(),
            QuestionnaireKind::Sf12 => {
                quick_replies::sf12(self.store.answer_count(instance_id)? + 1)
            }
        };
        let mut outcome = Outcome::speech(&result).with_replies(replies);
        if outcome.text.trim().is_empty() {
            outcome.text = "Je was nog bezig met een vragenlijst. Zullen we verder gaan?".into();
        }
        self.deliver(&client, Some(&result), outcome).await;
        self.store.mark_nudged(instance_id)?;
        Ok(())
    }
}
