//! DingTalk OpenAPI client for AI cards and robot messages.

use std::sync::Arc;

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tracing::debug,
};

use crate::{
    auth::CredentialProvider,
    card::{CardInstance, CardStatus, CardTransport},
    config::DingTalkAccountConfig,
    error::{Error, Result},
    message::MessagePayload,
    outbound::{MessageTransport, Target},
};

const ACCESS_TOKEN_HEADER: &str = "x-acs-dingtalk-access-token";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    process_query_key: Option<String>,
}

/// HTTP client bound to one account.
pub struct DingTalkApi {
    http: reqwest::Client,
    base: url::Url,
    robot_code: String,
    card_template_id: Option<String>,
    card_content_key: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl DingTalkApi {
    pub fn new(
        http: reqwest::Client,
        config: &DingTalkAccountConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        Ok(Self {
            http,
            base: url::Url::parse(&config.api_base)?,
            robot_code: config.robot_code().to_string(),
            card_template_id: config.card_template_id.clone(),
            card_content_key: config.card_content_key.clone(),
            credentials,
        })
    }

    async fn call(
        &self,
        operation: &'static str,
        method: reqwest::Method,
        path: &str,
        token: &Secret<String>,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = self.base.join(path)?;
        let resp = self
            .http
            .request(method, url)
            .header(ACCESS_TOKEN_HEADER, token.expose_secret())
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                operation,
                status,
                body,
            });
        }
        Ok(resp)
    }

    async fn send_robot_message(
        &self,
        operation: &'static str,
        path: &str,
        mut body: serde_json::Value,
        payload: &MessagePayload,
    ) -> Result<String> {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("robotCode".into(), self.robot_code.clone().into());
            obj.insert("msgKey".into(), payload.msg_key.into());
            obj.insert("msgParam".into(), payload.msg_param.clone().into());
        }
        let token = self.credentials.get_credential().await?;
        let resp = self
            .call(operation, reqwest::Method::POST, path, &token, &body)
            .await?;
        let sent: SendResponse = resp.json().await?;
        Ok(sent.process_query_key.unwrap_or_default())
    }
}

/// Request body for `createAndDeliver` with empty initial content.
fn create_card_body(
    template_id: &str,
    content_key: &str,
    robot_code: &str,
    out_track_id: &str,
    target: &Target,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "cardTemplateId": template_id,
        "outTrackId": out_track_id,
        "callbackType": "STREAM",
        "userIdType": 1,
        "cardData": {
            "cardParamMap": {
                content_key: "",
                "flowStatus": CardStatus::Processing.flow_status(),
            },
        },
    });
    let extra = match target {
        Target::User(user_id) => serde_json::json!({
            "openSpaceId": format!("dtv1.card//IM_ROBOT.{user_id}"),
            "imRobotOpenSpaceModel": { "supportForward": true },
            "imRobotOpenDeliverModel": { "spaceType": "IM_ROBOT" },
        }),
        Target::Group(group_id) => serde_json::json!({
            "openSpaceId": format!("dtv1.card//IM_GROUP.{group_id}"),
            "imGroupOpenSpaceModel": { "supportForward": true },
            "imGroupOpenDeliverModel": { "robotCode": robot_code },
        }),
    };
    if let (Some(obj), serde_json::Value::Object(extra)) = (body.as_object_mut(), extra) {
        obj.extend(extra);
    }
    body
}

#[async_trait]
impl CardTransport for DingTalkApi {
    async fn create_card(&self, target: &Target) -> Result<CardInstance> {
        let Some(template_id) = self.card_template_id.as_deref().filter(|id| !id.is_empty())
        else {
            return Err(Error::message("no AI card template configured"));
        };
        let out_track_id = uuid::Uuid::new_v4().to_string();
        let body = create_card_body(
            template_id,
            &self.card_content_key,
            &self.robot_code,
            &out_track_id,
            target,
        );
        let token = self.credentials.get_credential().await?;
        self.call(
            "card create",
            reqwest::Method::POST,
            "/v1.0/card/instances/createAndDeliver",
            &token,
            &body,
        )
        .await?;
        debug!(chat_id = %target, out_track_id, "AI card delivered");
        Ok(CardInstance {
            out_track_id,
            credential: token,
            streaming_started: false,
        })
    }

    async fn push_content(&self, card: &CardInstance, text: &str, is_final: bool) -> Result<()> {
        let body = serde_json::json!({
            "outTrackId": card.out_track_id,
            "guid": uuid::Uuid::new_v4().to_string(),
            "key": self.card_content_key,
            "content": text,
            "isFull": true,
            "isFinalize": is_final,
            "isError": false,
        });
        self.call(
            "card streaming update",
            reqwest::Method::PUT,
            "/v1.0/card/streaming",
            &card.credential,
            &body,
        )
        .await?;
        Ok(())
    }

    async fn set_status(&self, card: &CardInstance, status: CardStatus) -> Result<()> {
        let body = serde_json::json!({
            "outTrackId": card.out_track_id,
            "cardData": {
                "cardParamMap": { "flowStatus": status.flow_status() },
            },
        });
        self.call(
            "card status update",
            reqwest::Method::PUT,
            "/v1.0/card/instances",
            &card.credential,
            &body,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageTransport for DingTalkApi {
    async fn send_batch(&self, user_ids: &[String], payload: &MessagePayload) -> Result<String> {
        self.send_robot_message(
            "batch send",
            "/v1.0/robot/oToMessages/batchSend",
            serde_json::json!({ "userIds": user_ids }),
            payload,
        )
        .await
    }

    async fn send_group(&self, group_id: &str, payload: &MessagePayload) -> Result<String> {
        self.send_robot_message(
            "group send",
            "/v1.0/robot/groupMessages/send",
            serde_json::json!({ "openConversationId": group_id }),
            payload,
        )
        .await
    }
}
