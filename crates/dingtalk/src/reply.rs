//! Per-turn routing of agent reply fragments to the live card or to plain
//! messages.

use std::sync::Arc;

use tracing::{debug, info, warn};

use moltis_channels::{ReplyEvent, ReplyKind, ReplyReceiver};

use crate::{
    card::CardController,
    chunk::chunk_text,
    config::{ChunkMode, DEFAULT_TEXT_CHUNK_LIMIT},
    outbound::{DeliveryEngine, Target},
};

/// Text of the card when a turn ends in an error.
fn error_text(err: &str) -> String {
    format!("⚠️ {err}")
}

/// Bound to exactly one inbound turn.
pub struct ReplyDispatcher {
    target: Target,
    engine: Arc<DeliveryEngine>,
    chunk_limit: usize,
    chunk_mode: ChunkMode,
    card: CardController,
    use_card: bool,
    last_intermediate: Option<String>,
}

impl ReplyDispatcher {
    pub fn new(
        target: Target,
        engine: Arc<DeliveryEngine>,
        chunk_limit: usize,
        chunk_mode: ChunkMode,
    ) -> Self {
        let card = CardController::new(engine.card_transport());
        let use_card = engine.ai_card_enabled;
        let chunk_limit = if chunk_limit == 0 {
            warn!(chat_id = %target, fallback_limit = DEFAULT_TEXT_CHUNK_LIMIT, "text chunk limit is zero, using default");
            DEFAULT_TEXT_CHUNK_LIMIT
        } else {
            chunk_limit
        };
        Self {
            target,
            engine,
            chunk_limit,
            chunk_mode,
            card,
            use_card,
            last_intermediate: None,
        }
    }

    /// Kick off card creation without waiting for it.
    pub fn on_start(&mut self) {
        if self.use_card {
            self.card.start_creation(&self.target);
        }
    }

    pub async fn on_fragment(&mut self, text: &str, kind: ReplyKind) {
        if text.trim().is_empty() {
            return;
        }
        self.card.await_creation().await;

        if self.card.has_card() {
            match kind {
                ReplyKind::Intermediate => {
                    debug!(chat_id = %self.target, text_len = text.len(), "intermediate fragment held for card");
                    self.last_intermediate = Some(text.to_string());
                },
                ReplyKind::Final => {
                    if let Err(e) = self.card.finish(text).await {
                        warn!(chat_id = %self.target, error = %e, "AI card finish failed, delivering as plain message");
                        self.send_plain(text).await;
                    }
                },
            }
            return;
        }

        self.send_plain(text).await;
    }

    /// Close the card with the error so it does not stay composing.
    pub async fn on_error(&mut self, err: &str) {
        warn!(chat_id = %self.target, error = err, "agent reply failed");
        if let Err(e) = self.card.fail(&error_text(err)).await {
            warn!(chat_id = %self.target, error = %e, "could not mark AI card as failed");
        }
    }

    /// The agent went idle. Nothing is held between turns, so this only logs.
    pub fn on_idle(&mut self) {
        debug!(chat_id = %self.target, "agent idle");
    }

    /// Drive the dispatcher from a reply stream until it closes.
    pub async fn run(mut self, mut replies: ReplyReceiver) {
        while let Some(event) = replies.recv().await {
            match event {
                ReplyEvent::Start => self.on_start(),
                ReplyEvent::Fragment { text, kind } => self.on_fragment(&text, kind).await,
                ReplyEvent::Error(err) => self.on_error(&err).await,
                ReplyEvent::Idle => self.on_idle(),
            }
        }
        self.close().await;
    }

    /// End of stream: never leave a live card composing.
    async fn close(&mut self) {
        self.card.await_creation().await;
        if !self.card.has_card() {
            return;
        }
        let text = self.last_intermediate.take().unwrap_or_default();
        if let Err(e) = self.card.finish(&text).await {
            warn!(chat_id = %self.target, error = %e, "AI card close failed");
            if !text.trim().is_empty() {
                self.send_plain(&text).await;
            }
        }
    }

    async fn send_plain(&self, text: &str) {
        let chunks = chunk_text(text, self.chunk_limit, self.chunk_mode);
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            let result = self.engine.send_text(&self.target, chunk).await;
            if !result.ok {
                warn!(
                    chat_id = %self.target,
                    chunk = index + 1,
                    total,
                    error = result.error.as_deref().unwrap_or_default(),
                    "plain reply chunk failed"
                );
            }
        }
        if total > 1 {
            info!(chat_id = %self.target, chunks = total, "reply delivered as plain chunks");
        }
    }
}
