//! Robot messages delivered over the DingTalk Stream connection.

use {
    moltis_channels::{ChatType, TurnAttachment},
    serde::Deserialize,
};

use crate::error::Result;

/// Stream topic of robot messages.
pub const ROBOT_MESSAGE_TOPIC: &str = "/v1.0/im/bot/messages/get";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RobotMessage {
    pub msg_id: String,
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    pub text: Option<TextContent>,
    pub content: Option<RichContent>,
    /// `"1"` for one-to-one chats, `"2"` for groups.
    pub conversation_type: String,
    pub conversation_id: String,
    pub conversation_title: Option<String>,
    pub sender_id: String,
    pub sender_staff_id: Option<String>,
    pub sender_nick: Option<String>,
    pub chatbot_user_id: Option<String>,
    pub is_in_at_list: Option<bool>,
    pub robot_code: Option<String>,
    /// Milliseconds since the epoch.
    pub create_at: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TextContent {
    pub content: String,
}

/// `content` object of non-text messages.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RichContent {
    /// Speech recognition result of an audio message.
    pub recognition: Option<String>,
    pub download_code: Option<String>,
    pub file_name: Option<String>,
    pub rich_text: Vec<RichTextSegment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RichTextSegment {
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub segment_type: Option<String>,
    pub download_code: Option<String>,
}

/// Text and media references extracted from one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedContent {
    pub text: String,
    pub attachments: Vec<TurnAttachment>,
}

fn attachment(
    media_type: &str,
    code: Option<&String>,
    file_name: Option<&String>,
) -> Option<TurnAttachment> {
    code.filter(|c| !c.is_empty()).map(|code| TurnAttachment {
        media_type: media_type.into(),
        reference: code.clone(),
        file_name: file_name.cloned(),
    })
}

impl RobotMessage {
    pub fn chat_type(&self) -> ChatType {
        if self.conversation_type == "2" {
            ChatType::Group
        } else {
            ChatType::Dm
        }
    }

    /// Staff ID when present, otherwise the opaque sender ID. Replies and
    /// sessions are keyed on this.
    pub fn sender(&self) -> &str {
        self.sender_staff_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.sender_id)
    }

    /// Text of the message plus media references. `None` for message types
    /// that carry nothing the agent can use.
    pub fn extract_content(&self) -> Option<ExtractedContent> {
        let content = self.content.as_ref();
        let extracted = match self.msg_type.as_str() {
            "text" => ExtractedContent {
                text: self
                    .text
                    .as_ref()
                    .map(|t| t.content.trim().to_string())
                    .unwrap_or_default(),
                attachments: Vec::new(),
            },
            "richText" => {
                let mut text = String::new();
                let mut attachments = Vec::new();
                for segment in content.map(|c| c.rich_text.as_slice()).unwrap_or_default() {
                    if let Some(t) = segment.text.as_deref() {
                        text.push_str(t);
                    } else if segment.segment_type.as_deref() == Some("picture") {
                        text.push_str("<media:image>");
                        attachments.extend(attachment(
                            "image",
                            segment.download_code.as_ref(),
                            None,
                        ));
                    }
                }
                ExtractedContent {
                    text: text.trim().to_string(),
                    attachments,
                }
            },
            "picture" => ExtractedContent {
                text: "<media:image>".into(),
                attachments: content
                    .and_then(|c| attachment("image", c.download_code.as_ref(), None))
                    .into_iter()
                    .collect(),
            },
            "audio" => ExtractedContent {
                text: content
                    .and_then(|c| c.recognition.as_deref())
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .unwrap_or("<media:voice>")
                    .to_string(),
                attachments: content
                    .and_then(|c| attachment("voice", c.download_code.as_ref(), None))
                    .into_iter()
                    .collect(),
            },
            "video" => ExtractedContent {
                text: "<media:video>".into(),
                attachments: content
                    .and_then(|c| attachment("video", c.download_code.as_ref(), None))
                    .into_iter()
                    .collect(),
            },
            "file" => {
                let name = content.and_then(|c| c.file_name.as_ref());
                ExtractedContent {
                    text: match name {
                        Some(name) => format!("<media:file> {name}"),
                        None => "<media:file>".into(),
                    },
                    attachments: content
                        .and_then(|c| attachment("file", c.download_code.as_ref(), name))
                        .into_iter()
                        .collect(),
                }
            },
            _ => return None,
        };

        let text = match self.chat_type() {
            ChatType::Group => strip_leading_mention(&extracted.text),
            ChatType::Dm => extracted.text,
        };
        if text.is_empty() && extracted.attachments.is_empty() {
            return None;
        }
        Some(ExtractedContent {
            text,
            attachments: extracted.attachments,
        })
    }
}

/// Unwrap a Stream frame into a robot message.
///
/// Accepts either a full callback frame (`headers.topic` plus a JSON-encoded
/// `data` string) or a bare robot message. Frames for other topics yield
/// `None`.
pub fn robot_message_from_frame(frame: serde_json::Value) -> Result<Option<RobotMessage>> {
    if let Some(topic) = frame
        .get("headers")
        .and_then(|h| h.get("topic"))
        .and_then(|t| t.as_str())
        && topic != ROBOT_MESSAGE_TOPIC
    {
        return Ok(None);
    }
    let wrapped: Option<RobotMessage> = match frame.get("data") {
        Some(serde_json::Value::String(data)) => Some(serde_json::from_str(data)?),
        Some(data @ serde_json::Value::Object(_)) => Some(serde_json::from_value(data.clone())?),
        _ => None,
    };
    match wrapped {
        Some(msg) => Ok(Some(msg)),
        None => Ok(Some(serde_json::from_value(frame)?)),
    }
}

/// Drop a leading `@name` token, as group messages start with the bot mention.
pub fn strip_leading_mention(text: &str) -> String {
    let text = text.trim_start();
    let Some(rest) = text.strip_prefix('@') else {
        return text.trim_end().to_string();
    };
    match rest.find(char::is_whitespace) {
        Some(end) => rest[end..].trim().to_string(),
        None => String::new(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn parse(value: serde_json::Value) -> RobotMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn text_dm_message() {
        let msg = parse(serde_json::json!({
            "msgId": "m1",
            "msgtype": "text",
            "text": { "content": "  hello  " },
            "conversationType": "1",
            "conversationId": "cid1",
            "senderId": "$:opaque",
            "senderStaffId": "staff1",
            "senderNick": "Alice",
            "createAt": 1700000000000u64,
        }));
        assert_eq!(msg.chat_type(), ChatType::Dm);
        assert_eq!(msg.sender(), "staff1");
        let content = msg.extract_content().unwrap();
        assert_eq!(content.text, "hello");
        assert!(content.attachments.is_empty());
    }

    #[test]
    fn group_message_strips_mention() {
        let msg = parse(serde_json::json!({
            "msgId": "m2",
            "msgtype": "text",
            "text": { "content": "@Bot what's up" },
            "conversationType": "2",
            "senderId": "s1",
        }));
        assert_eq!(msg.chat_type(), ChatType::Group);
        assert_eq!(msg.sender(), "s1");
        assert_eq!(msg.extract_content().unwrap().text, "what's up");
    }

    #[test]
    fn rich_text_concatenates_segments() {
        let msg = parse(serde_json::json!({
            "msgtype": "richText",
            "conversationType": "1",
            "content": { "richText": [
                { "text": "look " },
                { "type": "picture", "downloadCode": "dl1" },
                { "text": " here" },
            ]},
        }));
        let content = msg.extract_content().unwrap();
        assert_eq!(content.text, "look <media:image> here");
        assert_eq!(content.attachments[0].reference, "dl1");
        assert_eq!(content.attachments[0].media_type, "image");
    }

    #[rstest]
    #[case("picture", serde_json::json!({ "downloadCode": "d" }), "<media:image>")]
    #[case("audio", serde_json::json!({ "recognition": "hi there", "downloadCode": "d" }), "hi there")]
    #[case("audio", serde_json::json!({ "downloadCode": "d" }), "<media:voice>")]
    #[case("video", serde_json::json!({ "downloadCode": "d" }), "<media:video>")]
    #[case("file", serde_json::json!({ "downloadCode": "d", "fileName": "a.pdf" }), "<media:file> a.pdf")]
    fn media_messages(#[case] msg_type: &str, #[case] content: serde_json::Value, #[case] expected: &str) {
        let msg = parse(serde_json::json!({
            "msgtype": msg_type,
            "conversationType": "1",
            "content": content,
        }));
        let extracted = msg.extract_content().unwrap();
        assert_eq!(extracted.text, expected);
        assert_eq!(extracted.attachments.len(), 1);
    }

    #[test]
    fn unsupported_or_empty_messages_are_skipped() {
        let unknown = parse(serde_json::json!({ "msgtype": "interactiveCard" }));
        assert!(unknown.extract_content().is_none());
        let empty = parse(serde_json::json!({ "msgtype": "text", "text": { "content": "  " } }));
        assert!(empty.extract_content().is_none());
    }

    #[test]
    fn callback_frame_is_unwrapped() {
        let data = serde_json::json!({ "msgId": "m9", "msgtype": "text", "text": { "content": "hi" } });
        let frame = serde_json::json!({
            "type": "CALLBACK",
            "headers": { "topic": ROBOT_MESSAGE_TOPIC, "messageId": "f1" },
            "data": data.to_string(),
        });
        let msg = robot_message_from_frame(frame).unwrap().unwrap();
        assert_eq!(msg.msg_id, "m9");

        let bare = robot_message_from_frame(data).unwrap().unwrap();
        assert_eq!(bare.msg_id, "m9");
    }

    #[test]
    fn other_topics_are_skipped() {
        let frame = serde_json::json!({
            "headers": { "topic": "/v1.0/card/instances/callback" },
            "data": "{}",
        });
        assert!(robot_message_from_frame(frame).unwrap().is_none());
    }

    #[test]
    fn malformed_data_is_an_error() {
        let frame = serde_json::json!({ "headers": { "topic": ROBOT_MESSAGE_TOPIC }, "data": "{not json" });
        assert!(robot_message_from_frame(frame).is_err());
    }

    #[rstest]
    #[case("@Bot hi", "hi")]
    #[case("@Bot", "")]
    #[case("hi @Bot", "hi @Bot")]
    #[case("  plain ", "plain")]
    fn mention_stripping(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_leading_mention(input), expected);
    }
}
