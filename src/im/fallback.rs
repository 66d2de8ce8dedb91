//! HTTP 兜底客户端
//!
//! 无状态请求/响应操作，镜像传输通道的事件词汇表。自身不做任何重试，
//! 每个管线步骤由调度器至多调用一次，失败归因保持清晰。
//! 发送操作以 clientRef 作为幂等键。

use crate::im::auth::CredentialProvider;
use crate::im::conversation::LocalConversation;
use crate::im::error::{Result, SyncError};
use crate::im::types::{
    handle_http_response, ContactInfo, MessageArrivedPayload, SendMessagePayload,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// 兜底发送的确认数据
#[derive(Debug, Clone, Deserialize)]
pub struct SendAckData {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// HTTP 兜底客户端
pub struct FallbackClient {
    client: reqwest::Client,
    api_base_url: String,
    user_id: String,
    credentials: Arc<dyn CredentialProvider>,
    /// 单次请求超时（毫秒）
    request_timeout_ms: u64,
}

impl FallbackClient {
    pub fn new(
        api_base_url: String,
        user_id: String,
        credentials: Arc<dyn CredentialProvider>,
        request_timeout_ms: u64,
    ) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .build()
            .map_err(|e| SyncError::FallbackFailed(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self {
            client,
            api_base_url,
            user_id,
            credentials,
            request_timeout_ms,
        })
    }

    /// 统一 POST：每次请求带新 operationID，token 即时向凭证提供者索取
    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let operation_id = Uuid::new_v4().to_string();
        let url = format!("{}{}", self.api_base_url, path);
        let token = self.credentials.token().await?;
        debug!("[Fallback] 📡 POST {} (操作ID: {})", url, operation_id);
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_millis(self.request_timeout_ms))
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .header("token", token)
            .json(&body)
            .send()
            .await?;
        Ok(resp)
    }

    /// 发送消息（幂等键 clientRef；服务端对同一 clientRef 只落一条）
    pub async fn send_message(&self, payload: &SendMessagePayload) -> Result<SendAckData> {
        info!(
            "[Fallback] 📡 兜底发送消息: clientRef={}",
            payload.client_ref
        );
        let resp = self
            .post("/msg/send", serde_json::to_value(payload)?)
            .await?;
        let api_resp = handle_http_response::<SendAckData>(resp, "兜底发送").await?;
        api_resp
            .data
            .ok_or_else(|| SyncError::Protocol("响应中缺少 data 字段".to_string()))
    }

    /// 拉取会话列表
    pub async fn fetch_conversations(&self) -> Result<Vec<LocalConversation>> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(default)]
            conversations: Vec<LocalConversation>,
        }
        let resp = self
            .post(
                "/conversation/list",
                serde_json::json!({ "userID": self.user_id }),
            )
            .await?;
        let api_resp = handle_http_response::<Data>(resp, "会话列表").await?;
        let data = api_resp.data.map(|d| d.conversations).unwrap_or_default();
        info!("[Fallback] ✅ 会话列表响应，会话数: {}", data.len());
        Ok(data)
    }

    /// 拉取历史消息分页
    pub async fn fetch_history_page(
        &self,
        counterpart_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<MessageArrivedPayload>> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(default)]
            messages: Vec<MessageArrivedPayload>,
        }
        let resp = self
            .post(
                "/msg/history",
                serde_json::json!({
                    "userID": self.user_id,
                    "counterpartID": counterpart_id,
                    "page": page,
                    "pageSize": page_size,
                }),
            )
            .await?;
        let api_resp = handle_http_response::<Data>(resp, "历史消息").await?;
        Ok(api_resp.data.map(|d| d.messages).unwrap_or_default())
    }

    /// 拉取未投递积压（重连后的对账扫描用）
    pub async fn fetch_undelivered_backlog(&self) -> Result<Vec<MessageArrivedPayload>> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(default)]
            messages: Vec<MessageArrivedPayload>,
        }
        let resp = self
            .post(
                "/msg/undelivered",
                serde_json::json!({ "userID": self.user_id }),
            )
            .await?;
        let api_resp = handle_http_response::<Data>(resp, "未投递积压").await?;
        let msgs = api_resp.data.map(|d| d.messages).unwrap_or_default();
        info!("[Fallback] ✅ 未投递积压响应，消息数: {}", msgs.len());
        Ok(msgs)
    }

    /// 投递回执（入站消息已到达本设备）
    pub async fn mark_delivered(&self, counterpart_id: &str) -> Result<()> {
        let resp = self
            .post(
                "/msg/mark_delivered",
                serde_json::json!({
                    "senderID": self.user_id,
                    "receiverID": counterpart_id,
                }),
            )
            .await?;
        handle_http_response::<serde_json::Value>(resp, "投递回执").await?;
        Ok(())
    }

    /// 标记会话已读（远端通知，best-effort）
    pub async fn mark_chat_read(&self, counterpart_id: &str) -> Result<()> {
        let resp = self
            .post(
                "/msg/mark_read",
                serde_json::json!({
                    "senderID": self.user_id,
                    "receiverID": counterpart_id,
                }),
            )
            .await?;
        handle_http_response::<serde_json::Value>(resp, "已读标记").await?;
        Ok(())
    }

    /// 查询用户在线状态
    pub async fn query_online_status(&self, user_id: &str) -> Result<bool> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(default)]
            online: bool,
        }
        let resp = self
            .post(
                "/user/online_status",
                serde_json::json!({ "userID": user_id }),
            )
            .await?;
        let api_resp = handle_http_response::<Data>(resp, "在线状态").await?;
        Ok(api_resp.data.map(|d| d.online).unwrap_or(false))
    }

    /// 拉取可聊联系人
    pub async fn fetch_contacts(&self) -> Result<Vec<ContactInfo>> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(default)]
            contacts: Vec<ContactInfo>,
        }
        let resp = self
            .post(
                "/user/contacts",
                serde_json::json!({ "userID": self.user_id }),
            )
            .await?;
        let api_resp = handle_http_response::<Data>(resp, "联系人列表").await?;
        Ok(api_resp.data.map(|d| d.contacts).unwrap_or_default())
    }
}
