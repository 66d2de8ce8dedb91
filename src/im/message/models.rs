//! 消息本地模型定义

use serde::{Deserialize, Serialize};

/// 消息内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Custom,
}

impl MessageKind {
    /// 数据库存储值
    pub fn as_i32(self) -> i32 {
        match self {
            MessageKind::Text => 101,
            MessageKind::Image => 102,
            MessageKind::File => 103,
            MessageKind::Custom => 110,
        }
    }

    pub fn from_i32(v: i32) -> MessageKind {
        match v {
            102 => MessageKind::Image,
            103 => MessageKind::File,
            110 => MessageKind::Custom,
            _ => MessageKind::Text,
        }
    }
}

/// 消息投递状态机
///
/// SENDING → SENT → DELIVERED → READ（终态）；SENDING → FAILED（终态）。
/// 状态只前进不回退；已读回执可以越级推进到 READ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            MessageStatus::Sending => 1,
            MessageStatus::Sent => 2,
            MessageStatus::Delivered => 3,
            MessageStatus::Read => 4,
            MessageStatus::Failed => 5,
        }
    }

    pub fn from_i32(v: i32) -> MessageStatus {
        match v {
            2 => MessageStatus::Sent,
            3 => MessageStatus::Delivered,
            4 => MessageStatus::Read,
            5 => MessageStatus::Failed,
            _ => MessageStatus::Sending,
        }
    }

    /// 是否终态
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    /// 是否允许推进到 `next`
    ///
    /// FAILED 仅能从 SENDING 进入；其余转移要求严格递增。
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        if next == MessageStatus::Failed {
            return self == MessageStatus::Sending;
        }
        if self == MessageStatus::Failed {
            return false;
        }
        next.as_i32() > self.as_i32()
    }
}

/// 本地消息行
///
/// 以 clientRef（`client_msg_id`）为主键；服务端分配的 `server_msg_id`
/// 在确认到达前为空串。每条逻辑消息最多一行存活（未墓碑）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalChatMessage {
    pub chat_id: String,
    #[serde(rename = "clientMsgID")]
    pub client_msg_id: String,
    #[serde(rename = "serverMsgID", default)]
    pub server_msg_id: String,
    #[serde(rename = "sendID")]
    pub send_id: String,
    #[serde(rename = "recvID")]
    pub recv_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    /// 本设备是否为该消息的作者
    #[serde(default)]
    pub is_self: bool,
    /// 墓碑标记：读取时排除，但为去重幂等保留行
    #[serde(default)]
    pub is_deleted: bool,
    pub create_time: i64,
    pub update_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_advances_monotonically() {
        use MessageStatus::*;
        assert!(Sending.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Delivered));
        assert!(Delivered.can_advance_to(Read));
        // 已读回执允许越级
        assert!(Sending.can_advance_to(Read));
        assert!(Sent.can_advance_to(Read));
    }

    #[test]
    fn status_never_regresses() {
        use MessageStatus::*;
        assert!(!Read.can_advance_to(Delivered));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Sent.can_advance_to(Sending));
        assert!(!Read.can_advance_to(Read));
    }

    #[test]
    fn failed_only_from_sending() {
        use MessageStatus::*;
        assert!(Sending.can_advance_to(Failed));
        assert!(!Sent.can_advance_to(Failed));
        assert!(!Delivered.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Sent));
        assert!(!Failed.can_advance_to(Read));
    }

    #[test]
    fn kind_roundtrips_storage_value() {
        for k in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::File,
            MessageKind::Custom,
        ] {
            assert_eq!(MessageKind::from_i32(k.as_i32()), k);
        }
    }
}
