//! 会话本地模型定义

use serde::{Deserialize, Serialize};

/// 本地会话摘要行
///
/// `unread_count` 与最新消息快照是缓存：永远可以从消息表重新算出，
/// 聚合器每次都按存储重算而不是按事件载荷累加。
/// 可以直接从服务器返回的 JSON 反序列化，缺失的字段使用默认值。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConversation {
    /// 会话 ID（参与者对排序拼接，双端一致）
    #[serde(rename = "chatID")]
    pub chat_id: String,
    /// 对端用户 ID
    #[serde(rename = "userID", default)]
    pub user_id: String,
    /// 显示名称（对引擎不透明，来自联系人元数据）
    #[serde(default)]
    pub show_name: String,
    /// 头像 URL（同上）
    #[serde(default)]
    pub face_url: String,
    /// 最新可见消息的文本快照
    #[serde(default)]
    pub latest_msg: String,
    /// 最新可见消息的 clientRef
    #[serde(rename = "latestMsgRef", default)]
    pub latest_msg_ref: String,
    /// 最新可见消息时间
    #[serde(default)]
    pub latest_msg_time: i64,
    /// 未读消息数
    #[serde(default)]
    pub unread_count: i64,
    #[serde(default)]
    pub update_time: i64,
}
