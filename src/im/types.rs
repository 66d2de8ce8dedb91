//! 协议类型定义
//!
//! WebSocket 信封、双向事件词汇表的载荷结构，以及 HTTP 响应的统一包装。
//! 事件名是协议契约，调度器只消费翻译后的领域事件，从不直接解析帧。

use crate::im::error::{Result, SyncError};
use crate::im::message::MessageKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// WebSocket 事件名（双向，名字即契约）
pub mod event_name {
    // 出站
    pub const SEND_MESSAGE: &str = "sendMessage";
    pub const MARK_DELIVERED: &str = "markDelivered";
    pub const MARK_READ: &str = "markRead";
    // 入站
    pub const MESSAGE_ARRIVED: &str = "messageArrived";
    pub const SEND_ACKNOWLEDGED: &str = "sendAcknowledged";
    pub const DELIVERED: &str = "delivered";
    pub const READ: &str = "read";
    pub const SEND_FAILED: &str = "sendFailed";
    pub const PRESENCE_CHANGED: &str = "presenceChanged";
}

/// WebSocket 信封（双向统一格式）
///
/// `data` 为事件载荷 JSON 的 base64 编码，整帧可再经 gzip 压缩。
#[derive(Debug, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub event: String,
    #[serde(rename = "operationID")]
    pub operation_id: String,
    #[serde(
        default,
        serialize_with = "crate::im::serialization::serialize_base64",
        deserialize_with = "crate::im::serialization::deserialize_base64"
    )]
    pub data: Vec<u8>,
}

impl WireEnvelope {
    /// 打包一个事件载荷
    pub fn pack<T: Serialize>(event: &str, payload: &T) -> Result<Self> {
        Ok(Self {
            event: event.to_string(),
            operation_id: format!("{}", chrono::Utc::now().timestamp_millis()),
            data: serde_json::to_vec(payload)?,
        })
    }

    /// 解出事件载荷
    pub fn unpack<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(|e| {
            SyncError::Protocol(format!("事件 {} 载荷解析失败: {}", self.event, e))
        })
    }
}

/// WebSocket 连接鉴权响应（连接建立后的首个文本帧）
#[derive(Debug, Deserialize)]
pub struct ConnectAck {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    #[serde(rename = "errDlt", default)]
    pub err_dlt: String,
}

// ========== 事件载荷 ==========

/// 出站 sendMessage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessagePayload {
    #[serde(rename = "senderID")]
    pub sender_id: String,
    #[serde(rename = "receiverID")]
    pub receiver_id: String,
    pub body: String,
    pub kind: MessageKind,
    #[serde(rename = "clientRef")]
    pub client_ref: String,
}

/// 出站 markDelivered / markRead（sender 为本端）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptPayload {
    #[serde(rename = "senderID")]
    pub sender_id: String,
    #[serde(rename = "receiverID")]
    pub receiver_id: String,
}

/// 入站 messageArrived
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageArrivedPayload {
    pub id: String,
    #[serde(rename = "senderID")]
    pub sender_id: String,
    #[serde(rename = "receiverID")]
    pub receiver_id: String,
    pub body: String,
    pub kind: MessageKind,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// 入站 sendAcknowledged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAcknowledgedPayload {
    #[serde(rename = "clientRef")]
    pub client_ref: String,
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// 入站 delivered / read（对端已收到 / 已读本端消息）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReceiptPayload {
    #[serde(rename = "receiverID")]
    pub receiver_id: String,
}

/// 入站 sendFailed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendFailedPayload {
    #[serde(rename = "clientRef")]
    pub client_ref: String,
    pub reason: String,
}

/// 入站 presenceChanged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceChangedPayload {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub online: bool,
}

// ========== HTTP 相关 ==========

/// 联系人信息（HTTP 拉取，对引擎是不透明的展示元数据）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub face_url: String,
}

/// 统一的 API 响应包装结构体（errCode、errMsg、data）
/// data 字段可能为 null 或缺失，因此使用 Option<T>
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    pub data: Option<T>,
}

/// 通用 HTTP 响应处理：HTTP 状态 → 业务错误码 → 反序列化，所有兜底操作共用
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<ApiResponse<T>> {
    let status = response.status();
    let body_bytes = response
        .bytes()
        .await
        .map_err(|e| SyncError::FallbackFailed(format!("读取响应 body 失败: {}", e)))?;
    let body_str = String::from_utf8_lossy(&body_bytes);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(SyncError::FallbackFailed(format!(
            "HTTP 错误 {}: {}",
            status, body_str
        )));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    let api_resp: ApiResponse<T> = serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}, 原始响应: {}",
            operation_name, e, body_str
        );
        SyncError::Protocol(format!("反序列化响应失败: {}", e))
    })?;

    if api_resp.err_code != 0 {
        error!(
            "[HTTP] {}服务器错误，错误码: {}, 错误信息: {}",
            operation_name, api_resp.err_code, api_resp.err_msg
        );
        return Err(SyncError::Server {
            code: api_resp.err_code,
            message: api_resp.err_msg,
        });
    }

    Ok(api_resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::MessageKind;

    #[test]
    fn envelope_roundtrips_payload() {
        let payload = SendMessagePayload {
            sender_id: "u1".into(),
            receiver_id: "u2".into(),
            body: "hola".into(),
            kind: MessageKind::Text,
            client_ref: "s1-u1-42".into(),
        };
        let env = WireEnvelope::pack(event_name::SEND_MESSAGE, &payload).unwrap();
        let json = serde_json::to_vec(&env).unwrap();
        let back: WireEnvelope = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.event, "sendMessage");
        let decoded: SendMessagePayload = back.unpack().unwrap();
        assert_eq!(decoded.client_ref, "s1-u1-42");
        assert_eq!(decoded.body, "hola");
    }

    #[test]
    fn envelope_data_is_base64_text() {
        let env = WireEnvelope::pack(event_name::MARK_READ, &ReceiptPayload {
            sender_id: "a".into(),
            receiver_id: "b".into(),
        })
        .unwrap();
        let json = serde_json::to_string(&env).unwrap();
        // data 字段必须是 base64 字符串而非字节数组
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(v.get("data").unwrap().is_string());
    }
}
