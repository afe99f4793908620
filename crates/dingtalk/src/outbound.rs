use std::sync::Arc;

use {
    anyhow::Result as AnyResult,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::{info, warn},
};

use moltis_channels::ChannelOutbound;

use crate::{
    card::{CardController, CardTransport},
    error::{Error, Result},
    message::{MessageKind, MessagePayload, build_payload, looks_like_markdown},
    state::AccountStateMap,
};

/// Recipient of a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Target {
    /// A single user, by staff ID.
    User(String),
    /// A group conversation, by open conversation ID.
    Group(String),
}

impl Target {
    pub fn user(id: &str) -> Result<Self> {
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::invalid_input("user id is empty"));
        }
        Ok(Self::User(id.to_string()))
    }

    pub fn group(id: &str) -> Result<Self> {
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::invalid_input("group id is empty"));
        }
        Ok(Self::Group(id.to_string()))
    }

    /// Parse a recipient address: `user:<id>`, `group:<id>`, or a bare ID.
    /// Bare IDs starting with `cid` are open conversation IDs.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if let Some(id) = address.strip_prefix("user:") {
            Self::user(id)
        } else if let Some(id) = address.strip_prefix("group:") {
            Self::group(id)
        } else if address.starts_with("cid") {
            Self::group(address)
        } else {
            Self::user(address)
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Group(id) => id,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

/// Per-call delivery options. `None` means "account default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendOptions {
    pub use_ai_card: Option<bool>,
    /// Whether a failed card delivery may fall back to a plain message.
    pub fallback_to_normal: Option<bool>,
    pub msg_kind: Option<MessageKind>,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub ok: bool,
    pub used_ai_card: bool,
    /// `processQueryKey` of a plain send or `outTrackId` of a card.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    fn card(out_track_id: Option<String>) -> Self {
        Self {
            ok: true,
            used_ai_card: true,
            transaction_key: out_track_id,
            error: None,
        }
    }

    fn plain(process_query_key: String) -> Self {
        Self {
            ok: true,
            used_ai_card: false,
            transaction_key: Some(process_query_key),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            used_ai_card: false,
            transaction_key: None,
            error: Some(error.into()),
        }
    }
}

/// Loosely-typed recipient of a proactive send. Exactly one field should be
/// set; the first present in declaration order wins.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProactiveTarget {
    pub user_id: Option<String>,
    pub user_ids: Option<Vec<String>>,
    pub group_id: Option<String>,
}

impl From<Target> for ProactiveTarget {
    fn from(target: Target) -> Self {
        match target {
            Target::User(id) => Self {
                user_id: Some(id),
                ..Default::default()
            },
            Target::Group(id) => Self {
                group_id: Some(id),
                ..Default::default()
            },
        }
    }
}

/// Remote operations for plain robot messages. Both return the
/// `processQueryKey` of the send.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send_batch(&self, user_ids: &[String], payload: &MessagePayload) -> Result<String>;

    async fn send_group(&self, group_id: &str, payload: &MessagePayload) -> Result<String>;
}

/// Card-first delivery with plain-message fallback for one account.
pub struct DeliveryEngine {
    pub(crate) account_id: String,
    pub(crate) cards: Arc<dyn CardTransport>,
    pub(crate) messages: Arc<dyn MessageTransport>,
    /// Account-level AI card switch (enabled and template configured).
    pub(crate) ai_card_enabled: bool,
    pub(crate) markdown_signals: String,
}

impl DeliveryEngine {
    pub fn new(
        account_id: impl Into<String>,
        cards: Arc<dyn CardTransport>,
        messages: Arc<dyn MessageTransport>,
        ai_card_enabled: bool,
        markdown_signals: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            cards,
            messages,
            ai_card_enabled,
            markdown_signals: markdown_signals.into(),
        }
    }

    pub fn card_transport(&self) -> Arc<dyn CardTransport> {
        Arc::clone(&self.cards)
    }

    /// Send to one or more users. A single recipient gets an AI card when
    /// enabled; several recipients always get a batch plain message.
    pub async fn send_to_user(
        &self,
        user_ids: &[String],
        content: &str,
        options: &SendOptions,
    ) -> SendResult {
        let user_ids: Vec<String> = user_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
        if user_ids.is_empty() {
            return SendResult::failed("must specify at least one user id");
        }
        if content.trim().is_empty() {
            return SendResult::failed("content is empty");
        }
        let kind = options.msg_kind.unwrap_or_default();
        let payload = match build_payload(kind, content) {
            Ok(payload) => payload,
            Err(e) => return SendResult::failed(e.to_string()),
        };

        if let [user_id] = user_ids.as_slice()
            && self.wants_card(kind, options)
        {
            let target = Target::User(user_id.clone());
            match self.deliver_card(&target, content).await {
                Ok(result) => return result,
                Err(e) if options.fallback_to_normal == Some(false) => {
                    warn!(account_id = %self.account_id, chat_id = %target, error = %e, "AI card delivery failed, fallback disabled");
                    return SendResult::failed(format!("AI card delivery failed: {e}"));
                },
                Err(e) => {
                    warn!(account_id = %self.account_id, chat_id = %target, error = %e, "AI card delivery failed, falling back to plain message");
                },
            }
        }

        match self.messages.send_batch(&user_ids, &payload).await {
            Ok(key) => {
                info!(
                    account_id = %self.account_id,
                    recipients = user_ids.len(),
                    msg_key = payload.msg_key,
                    process_query_key = %key,
                    "dingtalk plain message sent to users"
                );
                SendResult::plain(key)
            },
            Err(e) => {
                warn!(account_id = %self.account_id, error = %e, "dingtalk batch send failed");
                SendResult::failed(e.to_string())
            },
        }
    }

    /// Send to a group conversation, AI card first unless disabled.
    pub async fn send_to_group(
        &self,
        group_id: &str,
        content: &str,
        options: &SendOptions,
    ) -> SendResult {
        let target = match Target::group(group_id) {
            Ok(target) => target,
            Err(e) => return SendResult::failed(e.to_string()),
        };
        if content.trim().is_empty() {
            return SendResult::failed("content is empty");
        }
        let kind = options.msg_kind.unwrap_or_default();
        let payload = match build_payload(kind, content) {
            Ok(payload) => payload,
            Err(e) => return SendResult::failed(e.to_string()),
        };

        if self.wants_card(kind, options) {
            match self.deliver_card(&target, content).await {
                Ok(result) => return result,
                Err(e) if options.fallback_to_normal == Some(false) => {
                    warn!(account_id = %self.account_id, chat_id = %target, error = %e, "AI card delivery failed, fallback disabled");
                    return SendResult::failed(format!("AI card delivery failed: {e}"));
                },
                Err(e) => {
                    warn!(account_id = %self.account_id, chat_id = %target, error = %e, "AI card delivery failed, falling back to plain message");
                },
            }
        }

        self.send_payload(&target, &payload, content.len()).await
    }

    /// Agent-initiated send to a loosely specified recipient.
    pub async fn send_proactive(
        &self,
        selector: &ProactiveTarget,
        content: &str,
        options: &SendOptions,
    ) -> SendResult {
        let user_id = selector
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let user_ids = selector
            .user_ids
            .as_ref()
            .filter(|ids| ids.iter().any(|id| !id.trim().is_empty()));
        let group_id = selector
            .group_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        if user_id.is_none() && user_ids.is_none() && group_id.is_none() {
            return SendResult::failed("must specify userId, userIds, or groupId");
        }

        let mut options = options.clone();
        if options.msg_kind.is_none() && looks_like_markdown(content, &self.markdown_signals) {
            options.msg_kind = Some(MessageKind::Markdown);
        }

        if let Some(user_id) = user_id {
            self.send_to_user(&[user_id.to_string()], content, &options)
                .await
        } else if let Some(user_ids) = user_ids {
            self.send_to_user(user_ids, content, &options).await
        } else if let Some(group_id) = group_id {
            self.send_to_group(group_id, content, &options).await
        } else {
            SendResult::failed("must specify userId, userIds, or groupId")
        }
    }

    /// Plain text to exactly one target. This is the reply fallback path.
    pub async fn send_text(&self, target: &Target, text: &str) -> SendResult {
        self.send_plain(target, text, MessageKind::Text).await
    }

    async fn send_plain(&self, target: &Target, content: &str, kind: MessageKind) -> SendResult {
        match build_payload(kind, content) {
            Ok(payload) => self.send_payload(target, &payload, content.len()).await,
            Err(e) => SendResult::failed(e.to_string()),
        }
    }

    async fn send_payload(
        &self,
        target: &Target,
        payload: &MessagePayload,
        text_len: usize,
    ) -> SendResult {
        let sent = match target {
            Target::User(id) => {
                self.messages
                    .send_batch(std::slice::from_ref(id), payload)
                    .await
            },
            Target::Group(id) => self.messages.send_group(id, payload).await,
        };
        match sent {
            Ok(key) => {
                info!(
                    account_id = %self.account_id,
                    chat_id = %target,
                    msg_key = payload.msg_key,
                    text_len,
                    process_query_key = %key,
                    "dingtalk plain message sent"
                );
                SendResult::plain(key)
            },
            Err(e) => {
                warn!(account_id = %self.account_id, chat_id = %target, error = %e, "dingtalk plain send failed");
                SendResult::failed(e.to_string())
            },
        }
    }

    /// Cards render text and markdown only; structured kinds go plain.
    fn wants_card(&self, kind: MessageKind, options: &SendOptions) -> bool {
        self.ai_card_enabled
            && options.use_ai_card != Some(false)
            && matches!(kind, MessageKind::Text | MessageKind::Markdown)
    }

    /// Create a card and immediately finish it with `content`.
    async fn deliver_card(&self, target: &Target, content: &str) -> Result<SendResult> {
        let mut card = CardController::new(Arc::clone(&self.cards));
        card.start_creation(target);
        card.await_creation().await;
        if !card.has_card() {
            return Err(Error::message(
                card.creation_error()
                    .unwrap_or("AI card could not be created")
                    .to_string(),
            ));
        }
        let out_track_id = card.out_track_id().map(String::from);
        card.finish(content).await?;
        info!(
            account_id = %self.account_id,
            chat_id = %target,
            out_track_id = ?out_track_id,
            text_len = content.len(),
            "dingtalk AI card delivered"
        );
        Ok(SendResult::card(out_track_id))
    }
}

/// Host-facing outbound adapter; resolves the account and delegates to its
/// [`DeliveryEngine`].
pub struct DingTalkOutbound {
    pub(crate) accounts: AccountStateMap,
}

impl DingTalkOutbound {
    fn engine(&self, account_id: &str) -> Result<Arc<DeliveryEngine>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .map(|state| Arc::clone(&state.engine))
            .ok_or_else(|| Error::message(format!("unknown DingTalk account: {account_id}")))
    }
}

#[async_trait]
impl ChannelOutbound for DingTalkOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> AnyResult<()> {
        let engine = self.engine(account_id)?;
        let selector = ProactiveTarget::from(Target::parse(to)?);
        let result = engine
            .send_proactive(&selector, text, &SendOptions::default())
            .await;
        if !result.ok {
            anyhow::bail!(
                "DingTalk send to {to} failed: {}",
                result.error.unwrap_or_default()
            );
        }
        Ok(())
    }
}
