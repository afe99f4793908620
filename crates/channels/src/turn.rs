//! Normalized inbound turns and the reply stream that answers them.

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::mpsc,
};

/// Kind of conversation a turn arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Dm,
    Group,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::Group => "group",
        }
    }
}

/// Reference to media carried by an inbound message. The bytes are not
/// downloaded; `reference` is whatever handle the platform uses to fetch them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnAttachment {
    pub media_type: String,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// The peer a route is resolved for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePeer {
    pub chat_type: ChatType,
    /// Sender ID for DMs, conversation ID for groups.
    pub id: String,
}

/// Resolved route: which agent handles the turn and under which session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRoute {
    pub agent_id: String,
    pub session_key: String,
}

/// One inbound message, normalized for the agent pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundTurn {
    pub channel_type: String,
    pub account_id: String,
    /// Body with a channel envelope header prepended.
    pub body: String,
    /// Body exactly as extracted from the platform message.
    pub raw_body: String,
    pub message_id: String,
    pub chat_type: ChatType,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_subject: Option<String>,
    pub session_key: String,
    pub agent_id: String,
    /// True when this turn started a fresh session after a timeout.
    pub session_rotated: bool,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<TurnAttachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_provider: Option<String>,
}

/// Whether a reply fragment is a partial or the complete answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Intermediate,
    Final,
}

/// Events the agent pipeline emits while answering one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// The agent began producing output.
    Start,
    Fragment { text: String, kind: ReplyKind },
    /// The agent failed while producing the reply.
    Error(String),
    /// The agent is done for now; release typing indicators.
    Idle,
}

/// Sender end of a reply stream.
pub type ReplySender = mpsc::Sender<ReplyEvent>;

/// Receiver end of a reply stream.
pub type ReplyReceiver = mpsc::Receiver<ReplyEvent>;

/// Create a bounded reply stream.
pub fn reply_channel(capacity: usize) -> (ReplySender, ReplyReceiver) {
    mpsc::channel(capacity.max(1))
}

/// The agent/routing engine that turns a normalized turn into replies.
#[async_trait]
pub trait AgentRouter: Send + Sync {
    /// Resolve which agent handles a peer on a channel account.
    async fn resolve_route(
        &self,
        channel_type: &str,
        account_id: &str,
        peer: &RoutePeer,
    ) -> Result<ResolvedRoute>;

    /// Run the agent for `turn`, pushing reply events into `replies`.
    async fn run_turn(&self, turn: InboundTurn, replies: ReplySender) -> Result<()>;
}
