use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use {moltis_channels::ChannelEventSink, tokio_util::sync::CancellationToken};

use crate::{config::DingTalkAccountConfig, handler::TurnHandler, outbound::DeliveryEngine};

/// Shared account state map.
pub type AccountStateMap = Arc<RwLock<HashMap<String, AccountState>>>;

/// Per-account runtime state.
pub struct AccountState {
    pub account_id: String,
    pub config: DingTalkAccountConfig,
    pub engine: Arc<DeliveryEngine>,
    pub handler: Arc<TurnHandler>,
    /// Cancels the Stream loop of this account.
    pub cancel: CancellationToken,
    pub event_sink: Option<Arc<dyn ChannelEventSink>>,
    pub connection: Arc<ConnectionState>,
}

/// Connection health shared with the Stream loop.
#[derive(Debug, Default)]
pub struct ConnectionState {
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn record_error(&self, error: impl Into<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.into());
    }
}
