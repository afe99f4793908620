//! DingTalk channel plugin for moltis.
//!
//! Consumes robot messages from the DingTalk Stream connection, deduplicates
//! them, keeps per-sender sessions, and answers through an AI card that is
//! finalized with the agent's reply. When the card cannot be created or
//! updated, replies fall back to plain robot messages.

pub mod api;
pub mod auth;
pub mod card;
pub mod chunk;
pub mod config;
pub mod dedup;
pub mod error;
pub mod event;
pub mod handler;
pub mod message;
pub mod outbound;
pub mod plugin;
pub mod reply;
pub mod session;
pub mod state;
pub mod store;

pub use {
    config::DingTalkAccountConfig,
    error::{Error, Result},
    handler::{TurnHandler, TurnOutcome},
    outbound::{DeliveryEngine, ProactiveTarget, SendOptions, SendResult, Target},
    plugin::DingTalkPlugin,
};
