use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    tokio::{sync::mpsc, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use moltis_channels::{
    AgentRouter, ChannelEvent, ChannelEventSink, ChannelHealthSnapshot, ChannelOutbound,
    ChannelPlugin, ChannelStatus,
};

use crate::{
    api::DingTalkApi,
    auth::TokenCache,
    config::DingTalkAccountConfig,
    dedup::DedupCache,
    event::robot_message_from_frame,
    handler::{CHANNEL_TYPE, TurnHandler, TurnOutcome},
    outbound::{DeliveryEngine, DingTalkOutbound},
    session::SessionManager,
    state::{AccountState, AccountStateMap, ConnectionState},
};

/// DingTalk channel plugin.
pub struct DingTalkPlugin {
    accounts: AccountStateMap,
    outbound: DingTalkOutbound,
    router: Arc<dyn AgentRouter>,
    event_sink: Option<Arc<dyn ChannelEventSink>>,
    dedup: Arc<DedupCache>,
    sessions: Arc<SessionManager>,
    http: reqwest::Client,
}

impl DingTalkPlugin {
    pub fn new(router: Arc<dyn AgentRouter>) -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let outbound = DingTalkOutbound {
            accounts: Arc::clone(&accounts),
        };
        Self {
            accounts,
            outbound,
            router,
            event_sink: None,
            dedup: Arc::new(DedupCache::new()),
            sessions: Arc::new(SessionManager::new()),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn ChannelEventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Share dedup and session state with other plugin instances.
    pub fn with_state(mut self, dedup: Arc<DedupCache>, sessions: Arc<SessionManager>) -> Self {
        self.dedup = dedup;
        self.sessions = sessions;
        self
    }

    pub fn shared_outbound(&self) -> Arc<dyn ChannelOutbound> {
        Arc::new(DingTalkOutbound {
            accounts: Arc::clone(&self.accounts),
        })
    }

    pub fn account_ids(&self) -> Vec<String> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.keys().cloned().collect()
    }

    pub fn has_account(&self, account_id: &str) -> bool {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.contains_key(account_id)
    }

    pub fn account_config(&self, account_id: &str) -> Option<serde_json::Value> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .and_then(|s| serde_json::to_value(&s.config).ok())
    }

    /// Delivery engine of a started account, for proactive sends.
    pub fn engine(&self, account_id: &str) -> Option<Arc<DeliveryEngine>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.get(account_id).map(|s| Arc::clone(&s.engine))
    }

    fn handler(&self, account_id: &str) -> Result<(Arc<TurnHandler>, Arc<ConnectionState>)> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        let state = accounts
            .get(account_id)
            .ok_or_else(|| anyhow::anyhow!("unknown DingTalk account: {account_id}"))?;
        Ok((Arc::clone(&state.handler), Arc::clone(&state.connection)))
    }

    /// Handle one Stream frame for `account_id`.
    pub async fn ingest_event(
        &self,
        account_id: &str,
        frame: serde_json::Value,
    ) -> Result<TurnOutcome> {
        let (handler, connection) = self.handler(account_id)?;
        handle_frame(&handler, &connection, account_id, frame).await
    }

    /// Run the Stream loop of a started account over `frames` until the
    /// account is stopped or the feed closes.
    pub fn spawn_stream(
        &self,
        account_id: &str,
        mut frames: mpsc::Receiver<serde_json::Value>,
    ) -> Result<JoinHandle<()>> {
        let (handler, connection, cancel) = {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            let state = accounts
                .get(account_id)
                .ok_or_else(|| anyhow::anyhow!("unknown DingTalk account: {account_id}"))?;
            (
                Arc::clone(&state.handler),
                Arc::clone(&state.connection),
                state.cancel.clone(),
            )
        };

        let aid = account_id.to_string();
        Ok(tokio::spawn(async move {
            info!(account_id = aid, "dingtalk stream loop started");
            connection.set_connected(true);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(account_id = aid, "dingtalk stream loop cancelled");
                        break;
                    },
                    frame = frames.recv() => {
                        let Some(frame) = frame else {
                            warn!(account_id = aid, "dingtalk stream closed");
                            connection.record_error("stream closed");
                            break;
                        };
                        if let Err(e) = handle_frame(&handler, &connection, &aid, frame).await {
                            warn!(account_id = aid, error = %e, "failed to handle dingtalk frame");
                        }
                    },
                }
            }
            connection.set_connected(false);
        }))
    }

    async fn emit(&self, sink: Option<Arc<dyn ChannelEventSink>>, event: ChannelEvent) {
        if let Some(sink) = sink {
            sink.emit(event).await;
        }
    }
}

async fn handle_frame(
    handler: &TurnHandler,
    connection: &ConnectionState,
    account_id: &str,
    frame: serde_json::Value,
) -> Result<TurnOutcome> {
    let msg = match robot_message_from_frame(frame) {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            debug!(account_id, "ignoring non-message dingtalk frame");
            return Ok(TurnOutcome::Ignored);
        },
        Err(e) => {
            connection.record_error(e.to_string());
            return Err(e.into());
        },
    };
    let outcome = handler.handle(msg).await;
    if let TurnOutcome::Dropped { reason } = &outcome {
        connection.record_error(reason.clone());
    }
    Ok(outcome)
}

#[async_trait]
impl ChannelPlugin for DingTalkPlugin {
    fn id(&self) -> &str {
        CHANNEL_TYPE
    }

    fn name(&self) -> &str {
        "DingTalk"
    }

    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()> {
        let cfg: DingTalkAccountConfig = serde_json::from_value(config)?;
        if !cfg.is_configured() {
            return Err(anyhow::anyhow!(
                "DingTalk client_id and client_secret are required"
            ));
        }

        if self.has_account(account_id) {
            self.stop_account(account_id).await?;
        }

        let credentials = Arc::new(TokenCache::new(self.http.clone(), &cfg)?);
        let api = Arc::new(DingTalkApi::new(self.http.clone(), &cfg, credentials)?);
        let engine = Arc::new(DeliveryEngine::new(
            account_id,
            api.clone(),
            api,
            cfg.ai_card_enabled(),
            cfg.markdown_signals.clone(),
        ));
        let handler = TurnHandler::new(
            account_id,
            cfg.clone(),
            Arc::clone(&self.dedup),
            Arc::clone(&self.sessions),
            Arc::clone(&engine),
            Arc::clone(&self.router),
        )
        .with_event_sink(self.event_sink.clone());

        info!(
            account_id,
            ai_card = cfg.ai_card_enabled(),
            "starting dingtalk account"
        );
        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), AccountState {
                account_id: account_id.to_string(),
                config: cfg,
                engine,
                handler: Arc::new(handler),
                cancel: CancellationToken::new(),
                event_sink: self.event_sink.clone(),
                connection: Arc::new(ConnectionState::default()),
            });
        }

        self.emit(self.event_sink.clone(), ChannelEvent::AccountStarted {
            channel_type: CHANNEL_TYPE.into(),
            account_id: account_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> Result<()> {
        let removed = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.remove(account_id)
        };
        let Some(state) = removed else {
            warn!(account_id, "DingTalk account not found");
            return Ok(());
        };

        info!(account_id, "stopping dingtalk account");
        state.cancel.cancel();
        self.emit(state.event_sink, ChannelEvent::AccountStopped {
            channel_type: CHANNEL_TYPE.into(),
            account_id: account_id.to_string(),
            reason: "stopped".into(),
        })
        .await;
        Ok(())
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(&self.outbound)
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelStatus for DingTalkPlugin {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        let Some(state) = accounts.get(account_id) else {
            return Ok(ChannelHealthSnapshot {
                account_id: account_id.to_string(),
                details: Some("account not started".into()),
                ..Default::default()
            });
        };

        let connected = state.connection.is_connected();
        let details = if connected {
            "stream connected"
        } else {
            "waiting for stream connection"
        };
        Ok(ChannelHealthSnapshot {
            account_id: state.account_id.clone(),
            configured: state.config.is_configured(),
            connected,
            details: Some(details.into()),
            last_error: state.connection.last_error(),
        })
    }
}
