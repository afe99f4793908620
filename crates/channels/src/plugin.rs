use {anyhow::Result, async_trait::async_trait};

/// Activity record published by a channel plugin.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// A message passed dedup and is about to be routed.
    InboundMessage {
        channel_type: String,
        account_id: String,
        peer_id: String,
        sender_name: Option<String>,
        chat_type: String,
    },
    /// The inbound connection of an account became active.
    AccountStarted {
        channel_type: String,
        account_id: String,
    },
    /// The inbound connection of an account was torn down.
    AccountStopped {
        channel_type: String,
        account_id: String,
        reason: String,
    },
}

/// Receives activity records; implemented by the host.
#[async_trait]
pub trait ChannelEventSink: Send + Sync {
    async fn emit(&self, event: ChannelEvent);
}

/// A messaging platform integration with per-account lifecycle.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Stable channel identifier, e.g. `"dingtalk"`.
    fn id(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str;

    /// Start (or restart) the account described by `config`.
    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()>;

    /// Tear the account down. Stopping an unknown account is a no-op.
    async fn stop_account(&mut self, account_id: &str) -> Result<()>;

    fn outbound(&self) -> Option<&dyn ChannelOutbound>;

    fn status(&self) -> Option<&dyn ChannelStatus>;
}

/// Host-initiated sends.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    /// Deliver `text` to `to`, a channel-specific recipient address.
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()>;
}

/// Health probe of a channel account.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot>;
}

#[derive(Debug, Clone, Default)]
pub struct ChannelHealthSnapshot {
    pub account_id: String,
    /// Whether the account has usable credentials.
    pub configured: bool,
    pub connected: bool,
    pub details: Option<String>,
    /// Most recent delivery or connection error, if any.
    pub last_error: Option<String>,
}
