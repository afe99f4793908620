//! Inbound turn handling: dedup, session resolution, routing and reply
//! dispatch for one robot message.

use std::sync::Arc;

use {
    tokio::task::JoinHandle,
    tracing::{debug, error, info, warn},
};

use moltis_channels::{
    AgentRouter, ChannelEvent, ChannelEventSink, ChatType, InboundTurn, ReplyEvent, RoutePeer,
    reply_channel,
};

use crate::{
    config::DingTalkAccountConfig,
    dedup::DedupCache,
    event::RobotMessage,
    outbound::{DeliveryEngine, Target},
    reply::ReplyDispatcher,
    session::SessionManager,
    store::unix_now_ms,
};

pub const CHANNEL_TYPE: &str = "dingtalk";

/// Buffered reply events per turn before the agent is back-pressured.
const REPLY_BUFFER: usize = 32;

/// What happened to one inbound message.
#[derive(Debug)]
pub enum TurnOutcome {
    /// Already seen; dropped before routing.
    Duplicate,
    /// Nothing the agent can use (unsupported type or empty text).
    Ignored,
    /// A reset command rotated the sender's session.
    SessionReset { session_key: String },
    /// The message cannot be answered (no sender or reply target) or
    /// routing failed.
    Dropped { reason: String },
    /// The turn is running; the task finishes once the reply is delivered.
    Dispatched {
        session_key: String,
        task: JoinHandle<()>,
    },
}

/// Turns robot messages of one account into agent turns.
pub struct TurnHandler {
    account_id: String,
    config: DingTalkAccountConfig,
    dedup: Arc<DedupCache>,
    sessions: Arc<SessionManager>,
    engine: Arc<DeliveryEngine>,
    router: Arc<dyn AgentRouter>,
    event_sink: Option<Arc<dyn ChannelEventSink>>,
}

impl TurnHandler {
    pub fn new(
        account_id: impl Into<String>,
        config: DingTalkAccountConfig,
        dedup: Arc<DedupCache>,
        sessions: Arc<SessionManager>,
        engine: Arc<DeliveryEngine>,
        router: Arc<dyn AgentRouter>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            config,
            dedup,
            sessions,
            engine,
            router,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Option<Arc<dyn ChannelEventSink>>) -> Self {
        self.event_sink = sink;
        self
    }

    pub async fn handle(&self, msg: RobotMessage) -> TurnOutcome {
        let account_id = self.account_id.as_str();

        if !msg.msg_id.is_empty() {
            let dedup_key = format!("{account_id}:{}", msg.msg_id);
            if !self.dedup.check_and_mark(&dedup_key) {
                debug!(account_id, message_id = %msg.msg_id, "duplicate dingtalk message dropped");
                return TurnOutcome::Duplicate;
            }
        }

        let Some(content) = msg.extract_content() else {
            debug!(account_id, message_id = %msg.msg_id, msg_type = %msg.msg_type, "dingtalk message has no usable content");
            return TurnOutcome::Ignored;
        };

        let sender = msg.sender().to_string();
        if sender.is_empty() {
            warn!(account_id, message_id = %msg.msg_id, "dingtalk message without sender id");
            return TurnOutcome::Dropped {
                reason: "missing sender id".into(),
            };
        }
        let chat_type = msg.chat_type();

        let (peer_id, target) = match chat_type {
            ChatType::Dm => (sender.clone(), Target::User(sender.clone())),
            ChatType::Group => (
                msg.conversation_id.clone(),
                Target::Group(msg.conversation_id.clone()),
            ),
        };
        if target.id().is_empty() {
            warn!(account_id, message_id = %msg.msg_id, "dingtalk message without reply target");
            return TurnOutcome::Dropped {
                reason: "missing reply target".into(),
            };
        }

        if let Some(sink) = self.event_sink.as_ref() {
            sink.emit(ChannelEvent::InboundMessage {
                channel_type: CHANNEL_TYPE.into(),
                account_id: account_id.to_string(),
                peer_id: sender.clone(),
                sender_name: msg.sender_nick.clone(),
                chat_type: chat_type.as_str().into(),
            })
            .await;
        }

        let owner_key = format!("{account_id}:{sender}");
        let timeout_ms = self.config.session_timeout_ms;

        if self.config.is_reset_command(&content.text) {
            let session = self.sessions.resolve_session(&owner_key, true, timeout_ms);
            info!(
                account_id,
                sender_id = %sender,
                session_key = %session.session_key,
                "session reset by command"
            );
            return TurnOutcome::SessionReset {
                session_key: session.session_key,
            };
        }

        let session = self.sessions.resolve_session(&owner_key, false, timeout_ms);

        let peer = RoutePeer {
            chat_type,
            id: peer_id,
        };
        let route = match self
            .router
            .resolve_route(CHANNEL_TYPE, account_id, &peer)
            .await
        {
            Ok(route) => route,
            Err(e) => {
                error!(account_id, message_id = %msg.msg_id, error = %e, "dingtalk turn dropped: route resolution failed");
                return TurnOutcome::Dropped {
                    reason: e.to_string(),
                };
            },
        };

        let sender_name = msg.sender_nick.clone().filter(|n| !n.is_empty());
        let group_subject = match chat_type {
            ChatType::Group => msg.conversation_title.clone().filter(|t| !t.is_empty()),
            ChatType::Dm => None,
        };
        let turn = InboundTurn {
            channel_type: CHANNEL_TYPE.into(),
            account_id: account_id.to_string(),
            body: envelope(
                chat_type,
                group_subject.as_deref(),
                sender_name.as_deref().unwrap_or(&sender),
                &content.text,
            ),
            raw_body: content.text,
            message_id: msg.msg_id.clone(),
            chat_type,
            conversation_id: msg.conversation_id.clone(),
            sender_id: sender.clone(),
            sender_name,
            group_subject,
            session_key: session.session_key.clone(),
            agent_id: route.agent_id,
            session_rotated: session.is_new,
            timestamp_ms: msg.create_at.unwrap_or_else(unix_now_ms),
            attachments: content.attachments,
            model: self.config.model.clone(),
            model_provider: self.config.model_provider.clone(),
        };

        info!(
            account_id,
            message_id = %msg.msg_id,
            chat_id = %target,
            session_key = %session.session_key,
            session_rotated = session.is_new,
            "dispatching dingtalk turn"
        );

        let dispatcher = ReplyDispatcher::new(
            target,
            Arc::clone(&self.engine),
            self.config.text_chunk_limit,
            self.config.chunk_mode,
        );
        let router = Arc::clone(&self.router);
        let task = tokio::spawn(run_turn(router, dispatcher, turn));

        TurnOutcome::Dispatched {
            session_key: session.session_key,
            task,
        }
    }
}

/// Run the agent and the reply dispatcher side by side until both finish.
async fn run_turn(router: Arc<dyn AgentRouter>, dispatcher: ReplyDispatcher, turn: InboundTurn) {
    let (replies, receiver) = reply_channel(REPLY_BUFFER);
    let dispatch = tokio::spawn(dispatcher.run(receiver));

    // Card creation starts while the agent is still thinking.
    let _ = replies.send(ReplyEvent::Start).await;

    let message_id = turn.message_id.clone();
    if let Err(e) = router.run_turn(turn, replies.clone()).await {
        error!(message_id, error = %e, "agent turn failed");
        let _ = replies.send(ReplyEvent::Error(e.to_string())).await;
    }
    drop(replies);

    if let Err(e) = dispatch.await {
        error!(message_id, error = %e, "reply dispatcher task failed");
    }
}

/// Body with the channel envelope header, e.g. `[DingTalk Group Ops] Alice: hi`.
fn envelope(chat_type: ChatType, group_subject: Option<&str>, sender: &str, text: &str) -> String {
    match (chat_type, group_subject) {
        (ChatType::Group, Some(subject)) => format!("[DingTalk Group {subject}] {sender}: {text}"),
        (ChatType::Group, None) => format!("[DingTalk Group] {sender}: {text}"),
        (ChatType::Dm, _) => format!("[DingTalk DM] {sender}: {text}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            card::tests::MockCardTransport,
            outbound::tests::{MockMessageTransport, engine},
        },
        async_trait::async_trait,
        moltis_channels::{ReplyKind, ReplySender, ResolvedRoute},
        std::sync::Mutex,
    };

    /// Answers every turn with a fixed final reply and records what it saw.
    #[derive(Default)]
    struct MockRouter {
        reply: String,
        fail_route: bool,
        fail_run: bool,
        routed: Mutex<Vec<RoutePeer>>,
        turns: Mutex<Vec<InboundTurn>>,
    }

    #[async_trait]
    impl AgentRouter for MockRouter {
        async fn resolve_route(
            &self,
            _channel_type: &str,
            _account_id: &str,
            peer: &RoutePeer,
        ) -> anyhow::Result<ResolvedRoute> {
            if self.fail_route {
                anyhow::bail!("no agent bound");
            }
            self.routed.lock().unwrap().push(peer.clone());
            Ok(ResolvedRoute {
                agent_id: "main".into(),
                session_key: format!("agent:main:{}", peer.id),
            })
        }

        async fn run_turn(&self, turn: InboundTurn, replies: ReplySender) -> anyhow::Result<()> {
            self.turns.lock().unwrap().push(turn);
            if self.fail_run {
                anyhow::bail!("model unavailable");
            }
            replies
                .send(ReplyEvent::Fragment {
                    text: self.reply.clone(),
                    kind: ReplyKind::Final,
                })
                .await?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockSink {
        events: Mutex<Vec<ChannelEvent>>,
    }

    #[async_trait]
    impl ChannelEventSink for MockSink {
        async fn emit(&self, event: ChannelEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        handler: TurnHandler,
        router: Arc<MockRouter>,
        cards: Arc<MockCardTransport>,
        messages: Arc<MockMessageTransport>,
        sessions: Arc<SessionManager>,
    }

    fn harness(router: MockRouter, cards: MockCardTransport, ai_card: bool, limit: usize) -> Harness {
        let router = Arc::new(router);
        let cards = Arc::new(cards);
        let messages = Arc::new(MockMessageTransport::default());
        let sessions = Arc::new(SessionManager::new());
        let config = DingTalkAccountConfig {
            text_chunk_limit: limit,
            ..Default::default()
        };
        let handler = TurnHandler::new(
            "acct",
            config,
            Arc::new(DedupCache::new()),
            Arc::clone(&sessions),
            Arc::new(engine(Arc::clone(&cards), Arc::clone(&messages), ai_card)),
            router.clone(),
        );
        Harness {
            handler,
            router,
            cards,
            messages,
            sessions,
        }
    }

    fn dm(msg_id: &str, text: &str) -> RobotMessage {
        serde_json::from_value(serde_json::json!({
            "msgId": msg_id,
            "msgtype": "text",
            "text": { "content": text },
            "conversationType": "1",
            "conversationId": "cid-dm",
            "senderId": "$:opaque",
            "senderStaffId": "u1",
            "senderNick": "Alice",
            "createAt": 1_700_000_000_000u64,
        }))
        .unwrap()
    }

    async fn finish(outcome: TurnOutcome) -> String {
        match outcome {
            TurnOutcome::Dispatched { session_key, task } => {
                task.await.unwrap();
                session_key
            },
            other => panic!("expected dispatched turn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_is_answered_through_card() {
        let h = harness(
            MockRouter {
                reply: "hi Alice".into(),
                ..Default::default()
            },
            MockCardTransport::default(),
            true,
            4000,
        );

        let session_key = finish(h.handler.handle(dm("m1", "hello")).await).await;
        assert_eq!(session_key, "dingtalk:acct:u1");

        assert_eq!(h.cards.calls(), vec![
            "create:user:u1",
            "status:Composing",
            "push:hi Alice:true",
            "status:Done",
        ]);
        assert!(h.messages.sends().is_empty());

        let turns = h.router.turns.lock().unwrap();
        let turn = &turns[0];
        assert_eq!(turn.body, "[DingTalk DM] Alice: hello");
        assert_eq!(turn.raw_body, "hello");
        assert_eq!(turn.agent_id, "main");
        assert_eq!(turn.sender_id, "u1");
        assert_eq!(turn.timestamp_ms, 1_700_000_000_000);
        assert!(!turn.session_rotated);
    }

    #[tokio::test]
    async fn hello_falls_back_to_chunked_plain_messages() {
        let h = harness(
            MockRouter {
                reply: "hello world again".into(),
                ..Default::default()
            },
            MockCardTransport {
                fail_create: true,
                ..Default::default()
            },
            true,
            5,
        );

        finish(h.handler.handle(dm("m1", "hello")).await).await;

        assert_eq!(h.messages.texts(), vec!["hello", "world", "again"]);
        assert!(h.messages.sends().iter().all(|(to, ..)| to == "users:u1"));
    }

    #[tokio::test]
    async fn reset_command_rotates_without_routing() {
        let h = harness(MockRouter::default(), MockCardTransport::default(), true, 4000);

        let first = finish(h.handler.handle(dm("m1", "hello")).await).await;
        let session_key = match h.handler.handle(dm("m2", "/new")).await {
            TurnOutcome::SessionReset { session_key } => session_key,
            other => panic!("expected session reset, got {other:?}"),
        };

        assert_ne!(session_key, first);
        assert_eq!(h.router.routed.lock().unwrap().len(), 1);
        assert_eq!(h.router.turns.lock().unwrap().len(), 1);
        assert_eq!(
            h.sessions.get("acct:u1").map(|s| s.session_key),
            Some(session_key.clone())
        );

        // The next turn continues in the rotated session.
        let next = finish(h.handler.handle(dm("m3", "again")).await).await;
        assert_eq!(next, session_key);
    }

    #[tokio::test]
    async fn duplicate_message_is_dropped_before_routing() {
        let h = harness(MockRouter::default(), MockCardTransport::default(), false, 4000);

        finish(h.handler.handle(dm("m1", "hello")).await).await;
        let outcome = h.handler.handle(dm("m1", "hello")).await;

        assert!(matches!(outcome, TurnOutcome::Duplicate));
        assert_eq!(h.router.routed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn group_turn_replies_to_conversation() {
        let h = harness(
            MockRouter {
                reply: "ok".into(),
                ..Default::default()
            },
            MockCardTransport::default(),
            false,
            4000,
        );
        let msg: RobotMessage = serde_json::from_value(serde_json::json!({
            "msgId": "g1",
            "msgtype": "text",
            "text": { "content": "@Bot status?" },
            "conversationType": "2",
            "conversationId": "cidGroup",
            "conversationTitle": "Ops",
            "senderStaffId": "u2",
            "senderNick": "Bob",
        }))
        .unwrap();

        finish(h.handler.handle(msg).await).await;

        assert_eq!(h.router.routed.lock().unwrap()[0].id, "cidGroup");
        assert_eq!(
            h.router.turns.lock().unwrap()[0].body,
            "[DingTalk Group Ops] Bob: status?"
        );
        assert_eq!(h.messages.sends()[0].0, "group:cidGroup");
    }

    #[tokio::test]
    async fn agent_failure_fails_the_card() {
        let h = harness(
            MockRouter {
                fail_run: true,
                ..Default::default()
            },
            MockCardTransport::default(),
            true,
            4000,
        );

        finish(h.handler.handle(dm("m1", "hello")).await).await;

        let calls = h.cards.calls();
        assert!(calls.contains(&"push:⚠️ model unavailable:true".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("status:Failed"));
    }

    #[tokio::test]
    async fn route_failure_drops_turn() {
        let h = harness(
            MockRouter {
                fail_route: true,
                ..Default::default()
            },
            MockCardTransport::default(),
            true,
            4000,
        );

        let outcome = h.handler.handle(dm("m1", "hello")).await;
        assert!(matches!(outcome, TurnOutcome::Dropped { .. }));
        assert!(h.cards.calls().is_empty());
    }

    #[tokio::test]
    async fn message_without_sender_is_dropped_without_session() {
        let sink = Arc::new(MockSink::default());
        let mut h = harness(MockRouter::default(), MockCardTransport::default(), true, 4000);
        h.handler = h.handler.with_event_sink(Some(sink.clone() as Arc<dyn ChannelEventSink>));

        for msg_id in ["s1", "s2"] {
            let msg: RobotMessage = serde_json::from_value(serde_json::json!({
                "msgId": msg_id,
                "msgtype": "text",
                "text": { "content": "hello" },
                "conversationType": "2",
                "conversationId": "cidGroup",
            }))
            .unwrap();
            match h.handler.handle(msg).await {
                TurnOutcome::Dropped { reason } => assert_eq!(reason, "missing sender id"),
                other => panic!("expected dropped turn, got {other:?}"),
            }
        }

        assert!(h.sessions.get("acct:").is_none());
        assert!(h.router.routed.lock().unwrap().is_empty());
        assert!(sink.events.lock().unwrap().is_empty());
        assert!(h.cards.calls().is_empty());
    }

    #[tokio::test]
    async fn group_without_conversation_leaves_session_untouched() {
        let h = harness(MockRouter::default(), MockCardTransport::default(), true, 4000);
        let msg: RobotMessage = serde_json::from_value(serde_json::json!({
            "msgId": "g2",
            "msgtype": "text",
            "text": { "content": "hello" },
            "conversationType": "2",
            "senderStaffId": "u2",
        }))
        .unwrap();

        match h.handler.handle(msg).await {
            TurnOutcome::Dropped { reason } => assert_eq!(reason, "missing reply target"),
            other => panic!("expected dropped turn, got {other:?}"),
        }
        assert!(h.sessions.get("acct:u2").is_none());
    }

    #[tokio::test]
    async fn turn_carries_account_model() {
        let mut h = harness(MockRouter::default(), MockCardTransport::default(), false, 4000);
        h.handler.config.model = Some("qwen-max".into());
        h.handler.config.model_provider = Some("dashscope".into());

        finish(h.handler.handle(dm("m1", "hello")).await).await;

        let turns = h.router.turns.lock().unwrap();
        assert_eq!(turns[0].model.as_deref(), Some("qwen-max"));
        assert_eq!(turns[0].model_provider.as_deref(), Some("dashscope"));
    }

    #[tokio::test]
    async fn unsupported_message_is_ignored() {
        let h = harness(MockRouter::default(), MockCardTransport::default(), true, 4000);
        let msg: RobotMessage = serde_json::from_value(serde_json::json!({
            "msgId": "x1",
            "msgtype": "interactiveCard",
            "conversationType": "1",
            "senderStaffId": "u1",
        }))
        .unwrap();

        assert!(matches!(h.handler.handle(msg).await, TurnOutcome::Ignored));
        assert!(h.router.routed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inbound_message_event_is_emitted() {
        let sink = Arc::new(MockSink::default());
        let mut h = harness(MockRouter::default(), MockCardTransport::default(), false, 4000);
        h.handler = h.handler.with_event_sink(Some(sink.clone() as Arc<dyn ChannelEventSink>));

        finish(h.handler.handle(dm("m1", "hello")).await).await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events[0], ChannelEvent::InboundMessage {
            channel_type: "dingtalk".into(),
            account_id: "acct".into(),
            peer_id: "u1".into(),
            sender_name: Some("Alice".into()),
            chat_type: "dm".into(),
        });
    }

    #[test]
    fn envelope_headers() {
        assert_eq!(envelope(ChatType::Dm, None, "A", "hi"), "[DingTalk DM] A: hi");
        assert_eq!(
            envelope(ChatType::Group, Some("Ops"), "A", "hi"),
            "[DingTalk Group Ops] A: hi"
        );
        assert_eq!(envelope(ChatType::Group, None, "A", "hi"), "[DingTalk Group] A: hi");
    }
}
