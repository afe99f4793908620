use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Default inactivity window after which a sender's session rotates (30 min).
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// Default maximum size of one plain-text message chunk.
pub const DEFAULT_TEXT_CHUNK_LIMIT: usize = 4000;

/// Characters that mark content as markdown for proactive sends.
pub const DEFAULT_MARKDOWN_SIGNALS: &str = "*_#`[]>-|~";

/// How long replies are split when they go out as plain messages.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// Fill each chunk up to the limit, preferring line or word breaks.
    #[default]
    Length,
    /// Split on paragraph boundaries first, then by length.
    Newline,
}

/// Configuration for a single DingTalk robot account.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DingTalkAccountConfig {
    /// Application key (`appKey`) of the DingTalk app.
    pub client_id: String,

    /// Application secret (`appSecret`).
    #[serde(serialize_with = "serialize_secret")]
    pub client_secret: Secret<String>,

    /// Robot code used for robot message sends. Falls back to `client_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_code: Option<String>,

    /// AI card template used for live replies. Cards are disabled without it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_template_id: Option<String>,

    /// Template variable that receives streamed card content.
    pub card_content_key: String,

    /// Prefer AI cards over plain messages.
    pub use_ai_card: bool,

    /// Inactivity window before a sender's session rotates.
    pub session_timeout_ms: u64,

    /// Messages that explicitly start a new session.
    pub reset_commands: Vec<String>,

    /// Maximum characters per plain-text chunk.
    pub text_chunk_limit: usize,

    pub chunk_mode: ChunkMode,

    /// Characters treated as markdown signals by proactive sends.
    pub markdown_signals: String,

    /// DingTalk OpenAPI base URL.
    pub api_base: String,

    /// Default model ID for this channel account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Provider name associated with `model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_provider: Option<String>,
}

impl DingTalkAccountConfig {
    /// Robot code for message sends.
    pub fn robot_code(&self) -> &str {
        self.robot_code
            .as_deref()
            .filter(|code| !code.is_empty())
            .unwrap_or(&self.client_id)
    }

    /// Whether both app credentials are present.
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.expose_secret().is_empty()
    }

    /// Whether AI cards can be used at all for this account.
    pub fn ai_card_enabled(&self) -> bool {
        self.use_ai_card
            && self
                .card_template_id
                .as_deref()
                .is_some_and(|id| !id.is_empty())
    }

    /// Whether `text` is one of the configured reset commands.
    pub fn is_reset_command(&self, text: &str) -> bool {
        let text = text.trim();
        !text.is_empty()
            && self
                .reset_commands
                .iter()
                .any(|cmd| cmd.trim().eq_ignore_ascii_case(text))
    }
}

impl std::fmt::Debug for DingTalkAccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DingTalkAccountConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("robot_code", &self.robot_code)
            .field("card_template_id", &self.card_template_id)
            .field("use_ai_card", &self.use_ai_card)
            .field("session_timeout_ms", &self.session_timeout_ms)
            .field("chunk_mode", &self.chunk_mode)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Default for DingTalkAccountConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: Secret::new(String::new()),
            robot_code: None,
            card_template_id: None,
            card_content_key: "content".into(),
            use_ai_card: true,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            reset_commands: ["/new", "/reset", "/clear", "新会话", "重新开始", "清空对话"]
                .into_iter()
                .map(String::from)
                .collect(),
            text_chunk_limit: DEFAULT_TEXT_CHUNK_LIMIT,
            chunk_mode: ChunkMode::default(),
            markdown_signals: DEFAULT_MARKDOWN_SIGNALS.into(),
            api_base: "https://api.dingtalk.com".into(),
            model: None,
            model_provider: None,
        }
    }
}
