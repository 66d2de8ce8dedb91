//! 会话聚合器
//!
//! 监听消息事件维护会话摘要（最新消息、未读数）。摘要字段永远从
//! 消息存储重算，不从触发事件的载荷累加，并发更新下保持一致。

use crate::im::conversation::models::LocalConversation;
use crate::im::error::Result;
use crate::im::event::{ChatEvent, EventBus};
use crate::im::message::{LocalChatMessage, MessageKind};
use crate::im::store::LocalStore;
use std::sync::Arc;
use tracing::{debug, info};

/// 会话聚合器
pub struct ConversationAggregator {
    store: Arc<LocalStore>,
    events: EventBus,
}

impl ConversationAggregator {
    pub fn new(store: Arc<LocalStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// 根据消息内容生成最新消息摘要
    fn latest_msg_summary(msg: &LocalChatMessage) -> String {
        match msg.kind {
            MessageKind::Text => msg.content.clone(),
            MessageKind::Image => "[图片]".to_string(),
            MessageKind::File => "[文件]".to_string(),
            MessageKind::Custom => "[自定义消息]".to_string(),
        }
    }

    /// 重算并落库一个会话的摘要，有变化时发布事件
    ///
    /// `counterpart` 仅在会话行尚不存在时用于初始化对端字段。
    pub async fn refresh_chat(&self, chat_id: &str, counterpart: &str) -> Result<()> {
        let latest = self.store.messages().latest_visible(chat_id).await?;
        let unread = self.store.messages().unread_count(chat_id).await?;
        let existing = self
            .store
            .conversations()
            .get_conversation_by_id(chat_id)
            .await?;

        let mut conv = existing.clone().unwrap_or_else(|| LocalConversation {
            chat_id: chat_id.to_string(),
            user_id: counterpart.to_string(),
            show_name: String::new(),
            face_url: String::new(),
            latest_msg: String::new(),
            latest_msg_ref: String::new(),
            latest_msg_time: 0,
            unread_count: 0,
            update_time: 0,
        });

        conv.unread_count = unread;
        if let Some(latest) = &latest {
            conv.latest_msg = Self::latest_msg_summary(latest);
            conv.latest_msg_ref = latest.client_msg_id.clone();
            conv.latest_msg_time = latest.create_time;
        }

        let unchanged = existing
            .as_ref()
            .map(|e| {
                e.unread_count == conv.unread_count
                    && e.latest_msg == conv.latest_msg
                    && e.latest_msg_ref == conv.latest_msg_ref
                    && e.latest_msg_time == conv.latest_msg_time
            })
            .unwrap_or(false);
        if unchanged {
            return Ok(());
        }

        conv.update_time = chrono::Utc::now().timestamp_millis();
        self.store.conversations().upsert_conversation(&conv).await?;
        debug!(
            "[ConvAgg] 会话摘要更新: chatID={}, 未读={}, 最新消息时间={}",
            chat_id, conv.unread_count, conv.latest_msg_time
        );

        self.events.publish(ChatEvent::ConversationUpdated(conv));
        let total = self.store.conversations().get_total_unread_count().await?;
        self.events.publish(ChatEvent::TotalUnreadChanged(total));
        Ok(())
    }

    /// 合并服务器拉取的会话列表
    ///
    /// 本地行 update_time 更新时保留本地的未读数与最新消息元数据（本端
    /// 刚写入的状态还没回流到服务器），否则采纳服务器行（其他设备更新过）。
    pub async fn reconcile_server_list(&self, server_rows: Vec<LocalConversation>) -> Result<()> {
        info!(
            "[ConvAgg] 🔄 合并服务器会话列表，共 {} 条",
            server_rows.len()
        );
        let mut adopted = 0usize;
        for server in server_rows {
            let local = self
                .store
                .conversations()
                .get_conversation_by_id(&server.chat_id)
                .await?;
            match local {
                Some(local) if local.update_time > server.update_time => {
                    debug!(
                        "[ConvAgg] 本地更新更晚，保留本地行: chatID={}",
                        server.chat_id
                    );
                }
                _ => {
                    self.store.conversations().upsert_conversation(&server).await?;
                    self.events.publish(ChatEvent::ConversationUpdated(server));
                    adopted += 1;
                }
            }
        }
        if adopted > 0 {
            let total = self.store.conversations().get_total_unread_count().await?;
            self.events.publish(ChatEvent::TotalUnreadChanged(total));
        }
        info!("[ConvAgg] ✅ 服务器会话合并完成，采纳 {} 条", adopted);
        Ok(())
    }
}
