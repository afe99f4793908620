//! Robot message payloads for the plain (non-card) delivery path.
//!
//! Every logical message kind maps to a fixed DingTalk `msgKey` and a JSON
//! `msgParam` string.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest markdown title shown in notification previews.
const MARKDOWN_TITLE_MAX_CHARS: usize = 20;

const DEFAULT_MARKDOWN_TITLE: &str = "Reply";

/// Logical kind of a plain message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Markdown,
    /// Content is a JSON object with `title`, `text`, `messageUrl` and an
    /// optional `picUrl`.
    Link,
    /// Content is a JSON object with `title`, `text`, `singleTitle` and
    /// `singleURL`.
    ActionCard,
    /// Content is an image URL or a JSON object with `photoURL`.
    Image,
}

/// Wire payload of one robot message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub msg_key: &'static str,
    /// JSON-encoded parameters; DingTalk expects a string, not an object.
    pub msg_param: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkContent {
    title: String,
    text: String,
    message_url: String,
    #[serde(default)]
    pic_url: String,
}

#[derive(Deserialize)]
struct ActionCardContent {
    title: String,
    text: String,
    #[serde(rename = "singleTitle")]
    single_title: String,
    #[serde(rename = "singleURL")]
    single_url: String,
}

#[derive(Deserialize)]
struct ImageContent {
    #[serde(rename = "photoURL")]
    photo_url: String,
}

/// Build the wire payload for `content` sent as `kind`.
pub fn build_payload(kind: MessageKind, content: &str) -> Result<MessagePayload> {
    let (msg_key, param) = match kind {
        MessageKind::Text => ("sampleText", serde_json::json!({ "content": content })),
        MessageKind::Markdown => (
            "sampleMarkdown",
            serde_json::json!({ "title": markdown_title(content), "text": content }),
        ),
        MessageKind::Link => {
            let link: LinkContent = parse_structured(kind, content)?;
            require_non_empty(kind, &[
                ("title", &link.title),
                ("messageUrl", &link.message_url),
            ])?;
            ("sampleLink", serde_json::json!({
                "title": link.title,
                "text": link.text,
                "messageUrl": link.message_url,
                "picUrl": link.pic_url,
            }))
        },
        MessageKind::ActionCard => {
            let card: ActionCardContent = parse_structured(kind, content)?;
            require_non_empty(kind, &[
                ("title", &card.title),
                ("singleTitle", &card.single_title),
                ("singleURL", &card.single_url),
            ])?;
            ("sampleActionCard", serde_json::json!({
                "title": card.title,
                "text": card.text,
                "singleTitle": card.single_title,
                "singleURL": card.single_url,
            }))
        },
        MessageKind::Image => {
            let trimmed = content.trim();
            let photo_url = if trimmed.starts_with('{') {
                parse_structured::<ImageContent>(kind, trimmed)?.photo_url
            } else {
                trimmed.to_string()
            };
            if !(photo_url.starts_with("http://") || photo_url.starts_with("https://")) {
                return Err(Error::invalid_input(
                    "image content must be an http(s) URL or {\"photoURL\": ...}",
                ));
            }
            ("sampleImageMsg", serde_json::json!({ "photoURL": photo_url }))
        },
    };

    Ok(MessagePayload {
        msg_key,
        msg_param: param.to_string(),
    })
}

/// Heuristic: does `content` look like markdown? True when it contains a
/// line break or any of the `signals` characters.
pub fn looks_like_markdown(content: &str, signals: &str) -> bool {
    content.contains('\n') || content.chars().any(|c| signals.contains(c))
}

/// Notification title for a markdown message: the first non-empty line with
/// heading, quote and emphasis markers removed.
pub fn markdown_title(content: &str) -> String {
    let line = content
        .lines()
        .map(|l| l.trim_start_matches(['#', '>', '-', '*', ' ', '\t']).trim())
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let title: String = line
        .chars()
        .filter(|c| !matches!(c, '*' | '`' | '_' | '~'))
        .take(MARKDOWN_TITLE_MAX_CHARS)
        .collect();
    let title = title.trim();
    if title.is_empty() {
        DEFAULT_MARKDOWN_TITLE.to_string()
    } else {
        title.to_string()
    }
}

fn parse_structured<T: for<'de> Deserialize<'de>>(kind: MessageKind, content: &str) -> Result<T> {
    serde_json::from_str(content)
        .map_err(|e| Error::invalid_input(format!("malformed {kind:?} content: {e}")))
}

fn require_non_empty(kind: MessageKind, fields: &[(&str, &str)]) -> Result<()> {
    match fields.iter().find(|(_, value)| value.trim().is_empty()) {
        Some((name, _)) => Err(Error::invalid_input(format!(
            "{kind:?} content is missing `{name}`"
        ))),
        None => Ok(()),
    }
}
