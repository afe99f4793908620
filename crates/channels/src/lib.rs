//! Channel plugin system.
//!
//! Each channel implements the `ChannelPlugin` trait with sub-traits for
//! outbound messaging and status. Inbound messages are normalized into an
//! [`InboundTurn`] and handed to an [`AgentRouter`], whose replies come back
//! as a stream of [`ReplyEvent`]s.

pub mod plugin;
pub mod turn;

pub use {
    plugin::{
        ChannelEvent, ChannelEventSink, ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin,
        ChannelStatus,
    },
    turn::{
        AgentRouter, ChatType, InboundTurn, ReplyEvent, ReplyKind, ReplyReceiver, ReplySender,
        ResolvedRoute, RoutePeer, TurnAttachment, reply_channel,
    },
};
