//! 聊天同步引擎入口
//!
//! 显式构造的引擎实例：独占持有本地存储、传输通道、HTTP 兜底客户端与
//! 事件总线，按引用传给协作方，不存在任何隐式全局状态。协作方通过
//! 引擎发起命令（发送、已读、拉取分页），通过事件总线接收生命周期事件。

use crate::im::auth::CredentialProvider;
use crate::im::conversation::LocalConversation;
use crate::im::coordinator::SyncCoordinator;
use crate::im::error::Result;
use crate::im::event::{EventBus, EventSubscription};
use crate::im::fallback::FallbackClient;
use crate::im::message::{LocalChatMessage, MessageKind};
use crate::im::store::LocalStore;
use crate::im::transport::{ReconnectPolicy, TransportChannel, TransportConfig};
use crate::im::types::ContactInfo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 引擎配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 用户 ID
    pub user_id: String,
    /// 平台 ID
    pub platform_id: i32,
    /// WebSocket 服务器 URL
    pub ws_url: String,
    /// HTTP API 基础地址（兜底客户端）
    pub api_base_url: String,
    /// 本地 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://chat.db?mode=rwc`
    pub db_url: String,
    /// 压缩方式，例如 "gzip" 或空字符串表示不压缩
    pub compression: String,
    /// 消息发送的确认等待超时（毫秒）
    pub send_ack_timeout_ms: u64,
    /// HTTP 兜底单次请求超时（毫秒，在线状态等短操作也受它约束）
    pub fallback_timeout_ms: u64,
    /// 重连退避策略
    pub reconnect: ReconnectPolicy,
    /// 历史分页默认条数
    pub page_size: u32,
    /// 事件总线缓冲容量
    pub event_buffer: usize,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(user_id: String) -> Self {
        Self {
            user_id,
            platform_id: 5,
            ws_url: "ws://localhost:10001".to_string(),
            api_base_url: "http://localhost:10002".to_string(),
            db_url: "sqlite://chat.db?mode=rwc".to_string(),
            compression: "gzip".to_string(),
            send_ack_timeout_ms: 8_000,
            fallback_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
            page_size: 20,
            event_buffer: 256,
        }
    }
}

/// 聊天同步引擎
pub struct ChatSyncEngine {
    config: ClientConfig,
    store: Arc<LocalStore>,
    transport: TransportChannel,
    fallback: Arc<FallbackClient>,
    coordinator: SyncCoordinator,
    events: EventBus,
    credentials: Arc<dyn CredentialProvider>,
}

impl ChatSyncEngine {
    /// 构造引擎：打开数据库、装配通道与调度器（不建立连接）
    pub async fn new(
        config: ClientConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let store = Arc::new(LocalStore::open(&config.db_url).await?);
        let events = EventBus::new(config.event_buffer);

        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let transport = TransportChannel::new(
            TransportConfig {
                ws_url: config.ws_url.clone(),
                user_id: config.user_id.clone(),
                platform_id: config.platform_id,
                compression: config.compression.clone(),
                reconnect: config.reconnect.clone(),
            },
            ev_tx,
        );
        let fallback = Arc::new(FallbackClient::new(
            config.api_base_url.clone(),
            config.user_id.clone(),
            credentials.clone(),
            config.fallback_timeout_ms,
        )?);
        let coordinator = SyncCoordinator::new(
            config.user_id.clone(),
            store.clone(),
            transport.clone(),
            fallback.clone(),
            events.clone(),
            config.send_ack_timeout_ms,
        );
        coordinator.spawn_event_loop(ev_rx);

        info!("[Engine] 🚀 引擎装配完成 (user={})", config.user_id);
        Ok(Self {
            config,
            store,
            transport,
            fallback,
            coordinator,
            events,
            credentials,
        })
    }

    /// 建立传输通道连接，并拉起会话列表对账
    ///
    /// 连接失败不致命：引擎照常可用，发送走 HTTP 兜底。
    pub async fn connect(&self) -> Result<()> {
        let result = self.transport.connect(self.credentials.clone()).await;
        if let Err(e) = &result {
            warn!("[Engine] ⚠️ 通道连接失败，操作将走 HTTP 兜底: {}", e);
        }

        // 会话列表对账（与通道连接是否成功无关）
        let fallback = self.fallback.clone();
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            match fallback.fetch_conversations().await {
                Ok(rows) => {
                    if let Err(e) = coordinator.aggregator().reconcile_server_list(rows).await {
                        warn!("[Engine] 会话列表对账失败: {}", e);
                    }
                }
                Err(e) => warn!("[Engine] 会话列表拉取失败: {}", e),
            }
        });
        result
    }

    /// 发送文本消息
    pub async fn send_text_message(
        &self,
        recv_id: &str,
        text: String,
    ) -> Result<LocalChatMessage> {
        self.coordinator
            .send_message(recv_id, MessageKind::Text, text)
            .await
    }

    /// 发送任意类型消息
    pub async fn send_message(
        &self,
        recv_id: &str,
        kind: MessageKind,
        body: String,
    ) -> Result<LocalChatMessage> {
        self.coordinator.send_message(recv_id, kind, body).await
    }

    /// 标记会话已读，返回被翻转的消息条数
    pub async fn mark_chat_read(&self, counterpart_id: &str) -> Result<u64> {
        self.coordinator.mark_chat_read(counterpart_id).await
    }

    /// 读取本地历史分页（最新在前）
    pub async fn get_history(
        &self,
        counterpart_id: &str,
        page: u32,
    ) -> Result<Vec<LocalChatMessage>> {
        let chat_id =
            crate::im::serialization::derive_chat_id(&self.config.user_id, counterpart_id);
        self.store
            .messages()
            .get_messages(&chat_id, page, self.config.page_size)
            .await
    }

    /// 从服务器拉取一页历史并回灌接收管线（去重保证幂等），返回拉取条数
    pub async fn sync_history_page(&self, counterpart_id: &str, page: u32) -> Result<usize> {
        let msgs = self
            .fallback
            .fetch_history_page(counterpart_id, page, self.config.page_size)
            .await?;
        let total = msgs.len();
        for payload in msgs {
            self.coordinator.deliver_inbound(payload).await;
        }
        Ok(total)
    }

    /// 本地会话列表（最新消息时间倒序）
    pub async fn list_conversations(&self) -> Result<Vec<LocalConversation>> {
        self.store.conversations().list_conversations().await
    }

    /// 总未读消息数
    pub async fn total_unread_count(&self) -> Result<i64> {
        self.store.conversations().get_total_unread_count().await
    }

    /// 拉取可聊联系人
    pub async fn contacts(&self) -> Result<Vec<ContactInfo>> {
        self.fallback.fetch_contacts().await
    }

    /// 查询用户在线状态
    pub async fn online_status(&self, user_id: &str) -> Result<bool> {
        self.fallback.query_online_status(user_id).await
    }

    /// 按保留策略清理本地旧消息
    pub async fn prune_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp_millis() - age.as_millis() as i64;
        self.store.messages().prune_older_than(cutoff).await
    }

    /// 订阅引擎事件
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// 停机：进入排空状态（在途发送自然完成或超时），断开通道
    pub async fn shutdown(&self) {
        info!("[Engine] 🛑 引擎停机");
        self.coordinator.begin_drain();
        self.transport.disconnect().await;
    }
}

impl std::fmt::Debug for ChatSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSyncEngine")
            .field("user_id", &self.config.user_id)
            .field("connected", &self.transport.is_connected())
            .finish()
    }
}
