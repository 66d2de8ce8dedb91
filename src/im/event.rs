//! 类型化事件总线
//!
//! 引擎对协作方暴露的唯一事件面：消息到达、状态变更、会话摘要变更、
//! 连接状态变化。订阅句柄随 drop 自动退订，不存在手工增删回调的环节。

use crate::im::conversation::LocalConversation;
use crate::im::message::{LocalChatMessage, MessageStatus};
use tokio::sync::broadcast;
use tracing::warn;

/// 引擎生命周期事件
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// 有消息进入本地存储（入站消息，或本端发送的乐观写入）
    MessageArrived(LocalChatMessage),
    /// 消息状态推进（clientRef → 真实 id 的收敛也经由此事件传达）
    MessageStatusChanged {
        chat_id: String,
        client_msg_id: String,
        server_msg_id: String,
        status: MessageStatus,
    },
    /// 会话摘要变更（最新消息 / 未读数）
    ConversationUpdated(LocalConversation),
    /// 总未读数变更
    TotalUnreadChanged(i64),
    /// 连接状态变化
    ConnectionStatusChanged { connected: bool, detail: String },
    /// 传输通道重连次数耗尽，后续操作固定走 HTTP 兜底
    TransportExhausted,
    /// 对端在线状态变化
    PresenceChanged { user_id: String, online: bool },
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// 发布事件（无订阅者时静默丢弃）
    pub fn publish(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }

    /// 订阅事件，返回的句柄 drop 即退订
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    #[cfg(test)]
    pub(crate) fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// 事件订阅句柄
pub struct EventSubscription {
    rx: broadcast::Receiver<ChatEvent>,
}

impl EventSubscription {
    /// 接收下一条事件；总线关闭后返回 None，消费落后时跳过并告警
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[EventBus] ⚠️ 订阅者消费落后，跳过 {} 条事件", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_events_to_subscriber() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        bus.publish(ChatEvent::TotalUnreadChanged(3));
        match sub.recv().await {
            Some(ChatEvent::TotalUnreadChanged(n)) => assert_eq!(n, 3),
            other => panic!("意外事件: {:?}", other.is_some()),
        }
    }

    #[tokio::test]
    async fn dropping_handle_unsubscribes() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe();
        assert_eq!(bus.receiver_count(), 1);
        drop(sub);
        assert_eq!(bus.receiver_count(), 0);
        // 无订阅者时发布不报错
        bus.publish(ChatEvent::TransportExhausted);
    }
}
