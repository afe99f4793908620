//! Lifecycle of one AI card ("live card") per conversation turn.
//!
//! ```text
//! Absent ──start_creation──▶ CreationInFlight ──ok──▶ Created ──push──▶ Streaming
//!                                   │                     │                │
//!                                   └──err──▶ Failed      └──── finish ────┴──▶ Finished
//! ```
//!
//! Creation runs as a spawned task. Every decision point awaits it first, so
//! a fast first fragment never takes the fallback path while a card is about
//! to become available.

use std::sync::Arc;

use {
    async_trait::async_trait,
    secrecy::Secret,
    tokio::task::JoinHandle,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    outbound::Target,
};

/// Status shown by the card's flow indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStatus {
    Processing,
    /// The author is composing; required before streamed content is accepted.
    Composing,
    Done,
    Failed,
}

impl CardStatus {
    /// DingTalk `flowStatus` value.
    pub fn flow_status(self) -> &'static str {
        match self {
            Self::Processing => "1",
            Self::Composing => "2",
            Self::Done => "3",
            Self::Failed => "5",
        }
    }
}

/// One delivered card instance.
#[derive(Clone)]
pub struct CardInstance {
    /// Caller-chosen card ID (`outTrackId`).
    pub out_track_id: String,
    /// Bearer credential the card was created with.
    pub credential: Secret<String>,
    pub streaming_started: bool,
}

impl std::fmt::Debug for CardInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardInstance")
            .field("out_track_id", &self.out_track_id)
            .field("credential", &"[REDACTED]")
            .field("streaming_started", &self.streaming_started)
            .finish()
    }
}

/// Remote operations on AI cards.
#[async_trait]
pub trait CardTransport: Send + Sync {
    async fn create_card(&self, target: &Target) -> Result<CardInstance>;

    /// Replace the card's content slot with `text`.
    async fn push_content(&self, card: &CardInstance, text: &str, is_final: bool) -> Result<()>;

    async fn set_status(&self, card: &CardInstance, status: CardStatus) -> Result<()>;
}

/// Phase of a [`CardController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPhase {
    Absent,
    CreationInFlight,
    Created,
    Streaming,
    Finished,
    Failed,
}

/// Owns the single card of one turn.
pub struct CardController {
    transport: Arc<dyn CardTransport>,
    phase: CardPhase,
    card: Option<CardInstance>,
    pending: Option<JoinHandle<Result<CardInstance>>>,
    creation_error: Option<String>,
}

impl CardController {
    pub fn new(transport: Arc<dyn CardTransport>) -> Self {
        Self {
            transport,
            phase: CardPhase::Absent,
            card: None,
            pending: None,
            creation_error: None,
        }
    }

    pub fn phase(&self) -> CardPhase {
        self.phase
    }

    /// Whether a live card can take content right now. Does not wait for an
    /// in-flight creation; call [`Self::await_creation`] first.
    pub fn has_card(&self) -> bool {
        self.card.is_some()
    }

    /// ID of the live card, if any.
    pub fn out_track_id(&self) -> Option<&str> {
        self.card.as_ref().map(|card| card.out_track_id.as_str())
    }

    /// Why creation failed, once it has.
    pub fn creation_error(&self) -> Option<&str> {
        self.creation_error.as_deref()
    }

    /// Request a card for `target` in the background. Only the first call
    /// of a turn does anything.
    pub fn start_creation(&mut self, target: &Target) {
        if self.phase != CardPhase::Absent {
            debug!(phase = ?self.phase, "card creation already attempted");
            return;
        }
        let transport = Arc::clone(&self.transport);
        let target = target.clone();
        self.pending = Some(tokio::spawn(async move {
            transport.create_card(&target).await
        }));
        self.phase = CardPhase::CreationInFlight;
    }

    /// Wait for an in-flight creation and settle the phase.
    pub async fn await_creation(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        match pending.await {
            Ok(Ok(card)) => {
                info!(out_track_id = %card.out_track_id, "AI card created");
                self.card = Some(card);
                self.phase = CardPhase::Created;
            },
            Ok(Err(e)) => {
                warn!(error = %e, "AI card creation failed, using plain messages");
                self.creation_error = Some(e.to_string());
                self.phase = CardPhase::Failed;
            },
            Err(e) => {
                warn!(error = %e, "AI card creation task aborted, using plain messages");
                self.creation_error = Some(e.to_string());
                self.phase = CardPhase::Failed;
            },
        }
    }

    /// Replace the card content. The first push announces the composing
    /// status before the content goes out.
    pub async fn push_content(&mut self, text: &str, is_final: bool) -> Result<()> {
        let Some(card) = self.card.as_mut() else {
            return Err(Error::message(format!(
                "no live AI card to update (phase {:?})",
                self.phase
            )));
        };
        if !card.streaming_started {
            self.transport
                .set_status(card, CardStatus::Composing)
                .await?;
            card.streaming_started = true;
            self.phase = CardPhase::Streaming;
        }
        self.transport.push_content(card, text, is_final).await
    }

    /// Push `final_text` as the last content and close the card. No-op
    /// without a card.
    pub async fn finish(&mut self, final_text: &str) -> Result<()> {
        self.close(final_text, CardStatus::Done).await
    }

    /// Close the card with an error message so it does not stay composing.
    pub async fn fail(&mut self, error_text: &str) -> Result<()> {
        self.close(error_text, CardStatus::Failed).await
    }

    async fn close(&mut self, text: &str, status: CardStatus) -> Result<()> {
        self.await_creation().await;
        if self.card.is_none() {
            return Ok(());
        }

        // Once the final push lands the content is shown, so a failed status
        // update only leaves the flow indicator stale.
        let result = self.push_content(text, true).await;
        if result.is_ok()
            && let Some(card) = self.card.as_ref()
            && let Err(e) = self.transport.set_status(card, status).await
        {
            warn!(out_track_id = %card.out_track_id, ?status, error = %e, "AI card content delivered but status update failed");
        }

        if let Some(card) = self.card.take() {
            debug!(out_track_id = %card.out_track_id, ?status, ok = result.is_ok(), "AI card closed");
        }
        self.phase = CardPhase::Finished;
        result
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        std::{sync::Mutex, time::Duration},
    };

    /// Records every card call as a short string.
    #[derive(Default)]
    pub(crate) struct MockCardTransport {
        pub calls: Mutex<Vec<String>>,
        pub fail_create: bool,
        pub fail_push: bool,
        pub create_delay: Option<Duration>,
        /// Status update that is rejected after being recorded.
        pub fail_status: Option<CardStatus>,
    }

    impl MockCardTransport {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl CardTransport for MockCardTransport {
        async fn create_card(&self, target: &Target) -> Result<CardInstance> {
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            self.record(format!("create:{target}"));
            if self.fail_create {
                return Err(Error::message("create rejected"));
            }
            Ok(CardInstance {
                out_track_id: "card-1".into(),
                credential: Secret::new("tok".into()),
                streaming_started: false,
            })
        }

        async fn push_content(
            &self,
            _card: &CardInstance,
            text: &str,
            is_final: bool,
        ) -> Result<()> {
            self.record(format!("push:{text}:{is_final}"));
            if self.fail_push {
                return Err(Error::message("push rejected"));
            }
            Ok(())
        }

        async fn set_status(&self, _card: &CardInstance, status: CardStatus) -> Result<()> {
            self.record(format!("status:{status:?}"));
            if self.fail_status == Some(status) {
                return Err(Error::message("status rejected"));
            }
            Ok(())
        }
    }

    fn user() -> Target {
        Target::User("u1".into())
    }

    #[tokio::test]
    async fn create_then_finish() {
        let transport = Arc::new(MockCardTransport::default());
        let mut card = CardController::new(transport.clone());
        assert_eq!(card.phase(), CardPhase::Absent);

        card.start_creation(&user());
        assert_eq!(card.phase(), CardPhase::CreationInFlight);
        card.finish("hi there").await.unwrap();

        assert_eq!(card.phase(), CardPhase::Finished);
        assert!(!card.has_card());
        assert_eq!(transport.calls(), vec![
            "create:user:u1",
            "status:Composing",
            "push:hi there:true",
            "status:Done",
        ]);
    }

    #[tokio::test]
    async fn creation_is_attempted_once() {
        let transport = Arc::new(MockCardTransport::default());
        let mut card = CardController::new(transport.clone());
        card.start_creation(&user());
        card.start_creation(&user());
        card.await_creation().await;
        card.start_creation(&user());
        card.await_creation().await;
        assert_eq!(card.phase(), CardPhase::Created);
        assert_eq!(transport.calls(), vec!["create:user:u1"]);
    }

    #[tokio::test]
    async fn failed_creation_leaves_no_card() {
        let transport = Arc::new(MockCardTransport {
            fail_create: true,
            ..Default::default()
        });
        let mut card = CardController::new(transport.clone());
        card.start_creation(&user());
        card.await_creation().await;
        assert_eq!(card.phase(), CardPhase::Failed);
        assert!(!card.has_card());
        assert_eq!(card.creation_error(), Some("create rejected"));

        // finish without a card is a no-op
        card.finish("ignored").await.unwrap();
        assert_eq!(transport.calls(), vec!["create:user:u1"]);
    }

    #[tokio::test]
    async fn finish_without_creation_is_noop() {
        let transport = Arc::new(MockCardTransport::default());
        let mut card = CardController::new(transport.clone());
        card.finish("nothing").await.unwrap();
        assert_eq!(card.phase(), CardPhase::Absent);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn composing_status_is_sent_once() {
        let transport = Arc::new(MockCardTransport::default());
        let mut card = CardController::new(transport.clone());
        card.start_creation(&user());
        card.await_creation().await;

        card.push_content("a", false).await.unwrap();
        assert_eq!(card.phase(), CardPhase::Streaming);
        card.push_content("ab", true).await.unwrap();
        assert_eq!(card.phase(), CardPhase::Streaming, "final content does not close");
        card.finish("abc").await.unwrap();

        assert_eq!(transport.calls(), vec![
            "create:user:u1",
            "status:Composing",
            "push:a:false",
            "push:ab:true",
            "push:abc:true",
            "status:Done",
        ]);
    }

    #[tokio::test]
    async fn push_without_card_is_an_error() {
        let transport = Arc::new(MockCardTransport::default());
        let mut card = CardController::new(transport);
        assert!(card.push_content("x", false).await.is_err());
    }

    #[tokio::test]
    async fn finish_waits_for_slow_creation() {
        let transport = Arc::new(MockCardTransport {
            create_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let mut card = CardController::new(transport.clone());
        card.start_creation(&user());
        card.finish("late").await.unwrap();
        assert_eq!(transport.calls().last().map(String::as_str), Some("status:Done"));
    }

    #[tokio::test]
    async fn fail_marks_card_failed() {
        let transport = Arc::new(MockCardTransport::default());
        let mut card = CardController::new(transport.clone());
        card.start_creation(&user());
        card.fail("boom").await.unwrap();
        assert_eq!(card.phase(), CardPhase::Finished);
        assert_eq!(transport.calls().last().map(String::as_str), Some("status:Failed"));
    }

    #[tokio::test]
    async fn failed_push_still_clears_card() {
        let transport = Arc::new(MockCardTransport {
            fail_push: true,
            ..Default::default()
        });
        let mut card = CardController::new(transport);
        card.start_creation(&user());
        assert!(card.finish("x").await.is_err());
        assert!(!card.has_card());
        assert_eq!(card.phase(), CardPhase::Finished);
    }

    #[tokio::test]
    async fn rejected_done_status_after_final_push_is_not_an_error() {
        let transport = Arc::new(MockCardTransport {
            fail_status: Some(CardStatus::Done),
            ..Default::default()
        });
        let mut card = CardController::new(transport.clone());
        card.start_creation(&user());
        card.finish("answer").await.unwrap();

        assert_eq!(card.phase(), CardPhase::Finished);
        assert!(!card.has_card());
        assert_eq!(transport.calls(), vec![
            "create:user:u1",
            "status:Composing",
            "push:answer:true",
            "status:Done",
        ]);
    }

    #[tokio::test]
    async fn rejected_composing_status_is_an_error() {
        let transport = Arc::new(MockCardTransport {
            fail_status: Some(CardStatus::Composing),
            ..Default::default()
        });
        let mut card = CardController::new(transport.clone());
        card.start_creation(&user());
        assert!(card.finish("answer").await.is_err());
        assert!(!transport.calls().iter().any(|c| c.starts_with("push:")));
    }

    #[test]
    fn flow_status_values() {
        assert_eq!(CardStatus::Composing.flow_status(), "2");
        assert_eq!(CardStatus::Done.flow_status(), "3");
        assert_eq!(CardStatus::Failed.flow_status(), "5");
    }
}
