//! 同步调度器
//!
//! 引擎的状态机核心：发送管线（乐观写入 → 通道派发 → 确认等待 →
//! HTTP 兜底 → 收敛）、接收管线（去重 → 持久化 → 发布 → 投递回执）与
//! 已读管线。每个 chatId 一个串行工作队列，同会话的所有变更按受理顺序
//! 执行，不同会话完全并行。本地存储与传输通道由调度器独占持有。

use crate::im::conversation::ConversationAggregator;
use crate::im::error::{Result, SyncError};
use crate::im::event::{ChatEvent, EventBus};
use crate::im::fallback::FallbackClient;
use crate::im::message::{
    LocalChatMessage, MessageKind, MessageStatus, ReconcileOutcome, UpsertOutcome,
};
use crate::im::serialization::{derive_chat_id, generate_client_ref, new_session_namespace, ref_in_session};
use crate::im::store::LocalStore;
use crate::im::transport::{TransportChannel, TransportEvent};
use crate::im::types::{
    event_name, MessageArrivedPayload, ReceiptPayload, SendMessagePayload,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// 会话队列命令
enum ChatCommand {
    Send {
        msg: LocalChatMessage,
        done: oneshot::Sender<Result<LocalChatMessage>>,
    },
    Incoming {
        payload: MessageArrivedPayload,
        done: Option<oneshot::Sender<()>>,
    },
    MarkRead {
        counterpart_id: String,
        done: oneshot::Sender<Result<u64>>,
    },
    /// 对端回执：本端发出的消息批量推进到 `to`
    PeerAdvance {
        counterpart_id: String,
        to: MessageStatus,
    },
}

/// 发送确认结果（按 clientRef 关联）
enum AckOutcome {
    Acked { id: String, created_at: i64 },
    Rejected { reason: String },
}

struct CoordinatorInner {
    user_id: String,
    /// clientRef 的会话级命名空间，停机后迟到的确认按它识别并丢弃
    session_ns: String,
    send_ack_timeout_ms: u64,
    store: Arc<LocalStore>,
    transport: TransportChannel,
    fallback: Arc<FallbackClient>,
    events: EventBus,
    aggregator: ConversationAggregator,
    chat_queues: Mutex<HashMap<String, mpsc::UnboundedSender<ChatCommand>>>,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<AckOutcome>>>,
    draining: AtomicBool,
    /// 存储降级时的补写队列，存储恢复后随下一条队列命令补写
    redo_queue: Mutex<Vec<LocalChatMessage>>,
}

/// 同步调度器句柄（廉价克隆）
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    pub fn new(
        user_id: String,
        store: Arc<LocalStore>,
        transport: TransportChannel,
        fallback: Arc<FallbackClient>,
        events: EventBus,
        send_ack_timeout_ms: u64,
    ) -> Self {
        let session_ns = new_session_namespace();
        info!(
            "[Coord] 🚀 调度器就绪 (user={}, session={})",
            user_id, session_ns
        );
        let aggregator = ConversationAggregator::new(store.clone(), events.clone());
        Self {
            inner: Arc::new(CoordinatorInner {
                user_id,
                session_ns,
                send_ack_timeout_ms,
                store,
                transport,
                fallback,
                events,
                aggregator,
                chat_queues: Mutex::new(HashMap::new()),
                pending_acks: Mutex::new(HashMap::new()),
                draining: AtomicBool::new(false),
                redo_queue: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn aggregator(&self) -> &ConversationAggregator {
        &self.inner.aggregator
    }

    /// 消费传输通道翻译出的领域事件
    pub fn spawn_event_loop(&self, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                this.handle_transport_event(ev).await;
            }
        });
    }

    pub(crate) async fn handle_transport_event(&self, ev: TransportEvent) {
        match ev {
            TransportEvent::Connected => {
                self.inner.events.publish(ChatEvent::ConnectionStatusChanged {
                    connected: true,
                    detail: "连接成功".to_string(),
                });
                // 重连后的对账扫描：拉取未投递积压走接收管线（去重保证安全）
                let this = self.clone();
                tokio::spawn(async move {
                    this.sweep_backlog().await;
                });
            }
            TransportEvent::Disconnected { detail } => {
                self.inner.events.publish(ChatEvent::ConnectionStatusChanged {
                    connected: false,
                    detail,
                });
            }
            TransportEvent::Exhausted => {
                warn!("[Coord] ⚠️ 传输通道终止，后续操作固定走 HTTP 兜底");
                self.inner.events.publish(ChatEvent::TransportExhausted);
            }
            TransportEvent::MessageArrived(payload) => {
                self.route_incoming(payload, None);
            }
            TransportEvent::SendAcknowledged(p) => {
                self.resolve_ack(
                    &p.client_ref,
                    AckOutcome::Acked {
                        id: p.id,
                        created_at: p.created_at,
                    },
                );
            }
            TransportEvent::SendFailed(p) => {
                self.resolve_ack(&p.client_ref, AckOutcome::Rejected { reason: p.reason });
            }
            TransportEvent::PeerDelivered(p) => {
                self.route_peer_advance(p.receiver_id, MessageStatus::Delivered);
            }
            TransportEvent::PeerRead(p) => {
                self.route_peer_advance(p.receiver_id, MessageStatus::Read);
            }
            TransportEvent::PresenceChanged(p) => {
                self.inner.events.publish(ChatEvent::PresenceChanged {
                    user_id: p.user_id,
                    online: p.online,
                });
            }
        }
    }

    /// 把确认派回等待者；非本会话命名空间的确认直接丢弃
    fn resolve_ack(&self, client_ref: &str, outcome: AckOutcome) {
        if !ref_in_session(client_ref, &self.inner.session_ns) {
            debug!("[Coord] 忽略过期会话的确认: clientRef={}", client_ref);
            return;
        }
        let waiter = self.inner.pending_acks.lock().unwrap().remove(client_ref);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                debug!("[Coord] 确认无等待者（已超时转兜底）: clientRef={}", client_ref);
            }
        }
    }

    /// 发送一条消息，阻塞到管线给出终态（SENT 或 FAILED）
    pub async fn send_message(
        &self,
        recv_id: &str,
        kind: MessageKind,
        body: String,
    ) -> Result<LocalChatMessage> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(SyncError::Draining);
        }
        let now = chrono::Utc::now().timestamp_millis();
        let chat_id = derive_chat_id(&self.inner.user_id, recv_id);
        let msg = LocalChatMessage {
            chat_id: chat_id.clone(),
            client_msg_id: generate_client_ref(&self.inner.session_ns, &self.inner.user_id),
            server_msg_id: String::new(),
            send_id: self.inner.user_id.clone(),
            recv_id: recv_id.to_string(),
            content: body,
            kind,
            status: MessageStatus::Sending,
            is_self: true,
            is_deleted: false,
            create_time: now,
            update_time: now,
        };
        let (done_tx, done_rx) = oneshot::channel();
        self.route(&chat_id, ChatCommand::Send { msg, done: done_tx });
        done_rx
            .await
            .map_err(|_| SyncError::Protocol("发送管线意外中止".to_string()))?
    }

    /// 标记一个会话为已读（本地原子批量 + best-effort 远端通知）
    pub async fn mark_chat_read(&self, counterpart_id: &str) -> Result<u64> {
        let chat_id = derive_chat_id(&self.inner.user_id, counterpart_id);
        let (done_tx, done_rx) = oneshot::channel();
        self.route(
            &chat_id,
            ChatCommand::MarkRead {
                counterpart_id: counterpart_id.to_string(),
                done: done_tx,
            },
        );
        done_rx
            .await
            .map_err(|_| SyncError::Protocol("已读管线意外中止".to_string()))?
    }

    /// 把一条入站消息送入接收管线并等待其落盘（对账扫描 / 历史回灌用）
    pub async fn deliver_inbound(&self, payload: MessageArrivedPayload) {
        let (tx, rx) = oneshot::channel();
        self.route_incoming(payload, Some(tx));
        let _ = rx.await;
    }

    /// 拉取未投递积压并逐条走接收管线
    pub async fn sweep_backlog(&self) {
        info!("[Coord] 🔄 开始未投递积压对账扫描");
        match self.inner.fallback.fetch_undelivered_backlog().await {
            Ok(msgs) => {
                let total = msgs.len();
                for payload in msgs {
                    self.deliver_inbound(payload).await;
                }
                info!("[Coord] ✅ 对账扫描完成，处理 {} 条", total);
            }
            Err(e) => {
                warn!("[Coord] 对账扫描失败（下次连接再试）: {}", e);
            }
        }
    }

    /// 进入停机排空：不再接受新发送，已派发的等待自然完成或超时
    pub fn begin_drain(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        info!("[Coord] 🛑 进入停机排空状态");
    }

    fn route_incoming(&self, payload: MessageArrivedPayload, done: Option<oneshot::Sender<()>>) {
        let chat_id = derive_chat_id(&payload.sender_id, &payload.receiver_id);
        self.route(&chat_id, ChatCommand::Incoming { payload, done });
    }

    fn route_peer_advance(&self, counterpart_id: String, to: MessageStatus) {
        let chat_id = derive_chat_id(&self.inner.user_id, &counterpart_id);
        self.route(
            &chat_id,
            ChatCommand::PeerAdvance {
                counterpart_id,
                to,
            },
        );
    }

    /// 投入会话队列，必要时启动该会话的串行工作任务
    fn route(&self, chat_id: &str, cmd: ChatCommand) {
        let mut queues = self.inner.chat_queues.lock().unwrap();
        let cmd = match queues.get(chat_id) {
            Some(tx) => match tx.send(cmd) {
                Ok(()) => return,
                Err(mpsc::error::SendError(cmd)) => cmd,
            },
            None => cmd,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(cmd);
        queues.insert(chat_id.to_string(), tx);
        let this = self.clone();
        let chat = chat_id.to_string();
        tokio::spawn(async move {
            this.chat_worker(chat, rx).await;
        });
    }

    /// 单会话工作循环：同会话命令严格按受理顺序执行
    async fn chat_worker(&self, chat_id: String, mut rx: mpsc::UnboundedReceiver<ChatCommand>) {
        debug!("[Coord] 会话队列启动: chatID={}", chat_id);
        while let Some(cmd) = rx.recv().await {
            self.flush_redo().await;
            match cmd {
                ChatCommand::Send { msg, done } => {
                    let result = self.handle_send(msg).await;
                    let _ = done.send(result);
                }
                ChatCommand::Incoming { payload, done } => {
                    self.handle_incoming(payload).await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                ChatCommand::MarkRead {
                    counterpart_id,
                    done,
                } => {
                    let result = self.handle_mark_read(&chat_id, &counterpart_id).await;
                    let _ = done.send(result);
                }
                ChatCommand::PeerAdvance {
                    counterpart_id,
                    to,
                } => {
                    self.handle_peer_advance(&chat_id, &counterpart_id, to).await;
                }
            }
        }
    }

    /// 发送管线
    async fn handle_send(&self, msg: LocalChatMessage) -> Result<LocalChatMessage> {
        let inner = &self.inner;

        // 1. 乐观写入（存储不可用时降级：服务端照常发送，行进补写队列）
        if let Err(e) = inner.store.messages().upsert_message(&msg).await {
            warn!(
                "[Coord] ⚠️ 乐观写入失败，发送降级为非持久模式: clientRef={}, {}",
                msg.client_msg_id, e
            );
            inner.redo_queue.lock().unwrap().push(msg.clone());
        }

        // 2. 立即发布乐观消息
        inner.events.publish(ChatEvent::MessageArrived(msg.clone()));
        if let Err(e) = inner.aggregator.refresh_chat(&msg.chat_id, &msg.recv_id).await {
            warn!("[Coord] 会话摘要更新失败: {}", e);
        }

        let payload = SendMessagePayload {
            sender_id: msg.send_id.clone(),
            receiver_id: msg.recv_id.clone(),
            body: msg.content.clone(),
            kind: msg.kind,
            client_ref: msg.client_msg_id.clone(),
        };

        // 3/4. 通道派发并等待确认（有界超时）
        let mut ack: Option<AckOutcome> = None;
        if inner.transport.is_connected() {
            let (ack_tx, ack_rx) = oneshot::channel();
            inner
                .pending_acks
                .lock()
                .unwrap()
                .insert(msg.client_msg_id.clone(), ack_tx);
            let dispatched = inner.transport.send(event_name::SEND_MESSAGE, &payload).await;
            if dispatched {
                match tokio::time::timeout(
                    Duration::from_millis(inner.send_ack_timeout_ms),
                    ack_rx,
                )
                .await
                {
                    Ok(Ok(outcome)) => ack = Some(outcome),
                    Ok(Err(_)) => {
                        debug!("[Coord] 确认等待通道中断: clientRef={}", msg.client_msg_id);
                    }
                    Err(_) => {
                        debug!(
                            "[Coord] ⏱️ 等待确认超时（{} ms），转 HTTP 兜底: clientRef={}",
                            inner.send_ack_timeout_ms, msg.client_msg_id
                        );
                    }
                }
            }
            if ack.is_none() {
                inner.pending_acks.lock().unwrap().remove(&msg.client_msg_id);
            }
        } else {
            debug!(
                "[Coord] 通道未连接，直接走 HTTP 兜底: clientRef={}",
                msg.client_msg_id
            );
        }

        match ack {
            Some(AckOutcome::Acked { id, created_at }) => {
                return self.finish_send_ok(msg, id, created_at).await;
            }
            Some(AckOutcome::Rejected { reason }) => {
                // 服务端明确拒绝，不再兜底
                return Err(self.finish_send_failed(msg, reason).await);
            }
            None => {}
        }

        // 5. HTTP 兜底（恰好一次，不再自动重试）
        match inner.fallback.send_message(&payload).await {
            Ok(ack) => self.finish_send_ok(msg, ack.id, ack.created_at).await,
            Err(e) => Err(self.finish_send_failed(msg, e.to_string()).await),
        }
    }

    /// 确认到达后的收敛与事件发布
    async fn finish_send_ok(
        &self,
        mut msg: LocalChatMessage,
        server_msg_id: String,
        created_at: i64,
    ) -> Result<LocalChatMessage> {
        let inner = &self.inner;
        let ack_time = if created_at > 0 {
            created_at
        } else {
            chrono::Utc::now().timestamp_millis()
        };
        match inner
            .store
            .messages()
            .reconcile_id(&msg.client_msg_id, &server_msg_id, ack_time)
            .await
        {
            Ok(ReconcileOutcome::Reconciled) => {}
            Ok(ReconcileOutcome::DuplicateDiscarded {
                surviving_client_ref,
            }) => {
                // 接收路径先入库：临时行已墓碑，事件指向存活行
                msg.client_msg_id = surviving_client_ref;
            }
            Ok(ReconcileOutcome::NotFound) => {
                // 降级模式：行只在补写队列里，更新队列里的副本
                let mut queue = inner.redo_queue.lock().unwrap();
                if let Some(entry) = queue
                    .iter_mut()
                    .find(|m| m.client_msg_id == msg.client_msg_id)
                {
                    entry.server_msg_id = server_msg_id.clone();
                    entry.status = MessageStatus::Sent;
                    entry.update_time = ack_time;
                }
            }
            Err(e) => {
                warn!(
                    "[Coord] ⚠️ 收敛失败，服务端已确认、本地暂未持久化: clientRef={}, {}",
                    msg.client_msg_id, e
                );
                let mut copy = msg.clone();
                copy.server_msg_id = server_msg_id.clone();
                copy.status = MessageStatus::Sent;
                copy.update_time = ack_time;
                inner.redo_queue.lock().unwrap().push(copy);
            }
        }

        msg.server_msg_id = server_msg_id;
        if msg.status == MessageStatus::Sending {
            msg.status = MessageStatus::Sent;
        }
        msg.update_time = ack_time;
        inner.events.publish(ChatEvent::MessageStatusChanged {
            chat_id: msg.chat_id.clone(),
            client_msg_id: msg.client_msg_id.clone(),
            server_msg_id: msg.server_msg_id.clone(),
            status: MessageStatus::Sent,
        });
        if let Err(e) = inner.aggregator.refresh_chat(&msg.chat_id, &msg.recv_id).await {
            warn!("[Coord] 会话摘要更新失败: {}", e);
        }
        info!(
            "[Coord] ✅ 发送完成: clientRef={}, serverMsgID={}",
            msg.client_msg_id, msg.server_msg_id
        );
        Ok(msg)
    }

    /// 发送终态失败：置 FAILED、发布失败事件，只能由显式重发再次尝试
    async fn finish_send_failed(&self, msg: LocalChatMessage, reason: String) -> SyncError {
        let inner = &self.inner;
        warn!(
            "[Coord] ❌ 发送失败，消息置为 FAILED: clientRef={}, 原因: {}",
            msg.client_msg_id, reason
        );
        if let Err(e) = inner
            .store
            .messages()
            .set_status(&msg.client_msg_id, MessageStatus::Failed)
            .await
        {
            warn!("[Coord] FAILED 状态写入失败: {}", e);
        }
        inner.events.publish(ChatEvent::MessageStatusChanged {
            chat_id: msg.chat_id.clone(),
            client_msg_id: msg.client_msg_id.clone(),
            server_msg_id: String::new(),
            status: MessageStatus::Failed,
        });
        if let Err(e) = inner.aggregator.refresh_chat(&msg.chat_id, &msg.recv_id).await {
            warn!("[Coord] 会话摘要更新失败: {}", e);
        }
        SyncError::FallbackFailed(reason)
    }

    /// 接收管线
    async fn handle_incoming(&self, payload: MessageArrivedPayload) {
        let inner = &self.inner;
        let chat_id = derive_chat_id(&payload.sender_id, &payload.receiver_id);
        let is_self = payload.sender_id == inner.user_id;
        let counterpart = if is_self {
            payload.receiver_id.clone()
        } else {
            payload.sender_id.clone()
        };

        // 去重：服务端 id 是唯一裁决；墓碑行同样抑制（不复活已删除消息）
        match inner.store.messages().find_by_server_id(&payload.id).await {
            Ok(Some(row)) => {
                if row.is_deleted {
                    debug!("[Coord] 入站消息命中墓碑行，忽略: serverMsgID={}", payload.id);
                } else {
                    debug!("[Coord] 重复入站消息，忽略: serverMsgID={}", payload.id);
                }
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("[Coord] 去重查询失败（继续以幂等写入兜底）: {}", e);
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        let msg = LocalChatMessage {
            chat_id: chat_id.clone(),
            client_msg_id: format!("remote-{}", payload.id),
            server_msg_id: payload.id.clone(),
            send_id: payload.sender_id.clone(),
            recv_id: payload.receiver_id.clone(),
            content: payload.body.clone(),
            kind: payload.kind,
            // 对端消息到达本设备即 DELIVERED；本端消息回流（多端）记为 SENT
            status: if is_self {
                MessageStatus::Sent
            } else {
                MessageStatus::Delivered
            },
            is_self,
            is_deleted: false,
            create_time: if payload.created_at > 0 {
                payload.created_at
            } else {
                now
            },
            update_time: now,
        };

        match inner.store.messages().upsert_message(&msg).await {
            Ok(UpsertOutcome::Duplicate) => {
                debug!("[Coord] 重复入站消息（写入层抑制）: serverMsgID={}", payload.id);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "[Coord] ⚠️ 入站消息落盘失败，进入降级补写: serverMsgID={}, {}",
                    payload.id, e
                );
                inner.redo_queue.lock().unwrap().push(msg.clone());
            }
        }

        inner.events.publish(ChatEvent::MessageArrived(msg.clone()));
        if let Err(e) = inner.aggregator.refresh_chat(&chat_id, &counterpart).await {
            warn!("[Coord] 会话摘要更新失败: {}", e);
        }

        // 投递回执 best-effort：通道优先，兜底次之，失败不回滚持久化
        if !is_self {
            let receipt = ReceiptPayload {
                sender_id: inner.user_id.clone(),
                receiver_id: counterpart.clone(),
            };
            if !inner.transport.send(event_name::MARK_DELIVERED, &receipt).await {
                if let Err(e) = inner.fallback.mark_delivered(&counterpart).await {
                    debug!("[Coord] 投递回执发送失败（不重试）: {}", e);
                }
            }
        }
    }

    /// 已读管线
    async fn handle_mark_read(&self, chat_id: &str, counterpart_id: &str) -> Result<u64> {
        let inner = &self.inner;
        let flipped = inner.store.messages().mark_chat_read(chat_id).await?;
        for (client_msg_id, server_msg_id) in &flipped {
            inner.events.publish(ChatEvent::MessageStatusChanged {
                chat_id: chat_id.to_string(),
                client_msg_id: client_msg_id.clone(),
                server_msg_id: server_msg_id.clone(),
                status: MessageStatus::Read,
            });
        }
        if !flipped.is_empty() {
            if let Err(e) = inner.aggregator.refresh_chat(chat_id, counterpart_id).await {
                warn!("[Coord] 会话摘要更新失败: {}", e);
            }
        }

        // 远端通知 best-effort：失败后本地已读保持，不重试
        let receipt = ReceiptPayload {
            sender_id: inner.user_id.clone(),
            receiver_id: counterpart_id.to_string(),
        };
        if !inner.transport.send(event_name::MARK_READ, &receipt).await {
            if let Err(e) = inner.fallback.mark_chat_read(counterpart_id).await {
                debug!("[Coord] 已读通知发送失败（本地已读保持，不重试）: {}", e);
            }
        }
        Ok(flipped.len() as u64)
    }

    /// 对端回执：本端发出的消息批量推进
    async fn handle_peer_advance(&self, chat_id: &str, counterpart_id: &str, to: MessageStatus) {
        let inner = &self.inner;
        match inner.store.messages().advance_local_origin(chat_id, to).await {
            Ok(refs) => {
                for (client_msg_id, server_msg_id) in &refs {
                    inner.events.publish(ChatEvent::MessageStatusChanged {
                        chat_id: chat_id.to_string(),
                        client_msg_id: client_msg_id.clone(),
                        server_msg_id: server_msg_id.clone(),
                        status: to,
                    });
                }
                if !refs.is_empty() {
                    if let Err(e) = inner.aggregator.refresh_chat(chat_id, counterpart_id).await {
                        warn!("[Coord] 会话摘要更新失败: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("[Coord] 对端回执处理失败: {}", e);
            }
        }
    }

    /// 存储恢复后的机会性补写
    async fn flush_redo(&self) {
        let pending: Vec<LocalChatMessage> = {
            let mut queue = self.inner.redo_queue.lock().unwrap();
            if queue.is_empty() {
                return;
            }
            queue.drain(..).collect()
        };
        let total = pending.len();
        let mut recovered = 0usize;
        for msg in pending {
            match self.inner.store.messages().upsert_message(&msg).await {
                Ok(_) => recovered += 1,
                Err(_) => self.inner.redo_queue.lock().unwrap().push(msg),
            }
        }
        if recovered > 0 {
            info!("[Coord] ✅ 存储恢复，补写 {}/{} 条降级消息", recovered, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::auth::StaticToken;
    use crate::im::transport::{ReconnectPolicy, TransportConfig};

    async fn test_coordinator() -> (tempfile::TempDir, Arc<LocalStore>, SyncCoordinator, EventBus) {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("engine.db").display());
        let store = Arc::new(LocalStore::open(&url).await.unwrap());
        let events = EventBus::new(256);
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let transport = TransportChannel::new(
            TransportConfig {
                ws_url: "ws://127.0.0.1:9".into(),
                user_id: "u1".into(),
                platform_id: 5,
                compression: "gzip".into(),
                reconnect: ReconnectPolicy::default(),
            },
            ev_tx,
        );
        // 端口 9 无服务，HTTP 兜底立即拒绝连接
        let fallback = Arc::new(
            FallbackClient::new(
                "http://127.0.0.1:9".into(),
                "u1".into(),
                Arc::new(StaticToken("token".into())),
                1_000,
            )
            .unwrap(),
        );
        let coord = SyncCoordinator::new(
            "u1".into(),
            store.clone(),
            transport,
            fallback,
            events.clone(),
            200,
        );
        (dir, store, coord, events)
    }

    fn arrived(id: &str, sender: &str, receiver: &str, body: &str) -> MessageArrivedPayload {
        MessageArrivedPayload {
            id: id.into(),
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            body: body.into(),
            kind: MessageKind::Text,
            created_at: 1_000,
        }
    }

    #[tokio::test]
    async fn offline_send_with_dead_fallback_resolves_to_failed() {
        let (_dir, store, coord, events) = test_coordinator().await;
        let mut sub = events.subscribe();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            coord.send_message("u2", MessageKind::Text, "hola".into()),
        )
        .await
        .expect("发送管线不允许悬挂");
        assert!(matches!(result, Err(SyncError::FallbackFailed(_))));

        // 乐观事件在前，失败事件在后
        match sub.recv().await {
            Some(ChatEvent::MessageArrived(m)) => assert_eq!(m.status, MessageStatus::Sending),
            other => panic!("期望乐观消息事件: {:?}", other.is_some()),
        }
        let mut saw_failed = false;
        for _ in 0..8 {
            match sub.recv().await {
                Some(ChatEvent::MessageStatusChanged { status, .. })
                    if status == MessageStatus::Failed =>
                {
                    saw_failed = true;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_failed, "未观察到 FAILED 状态事件");

        let rows = store.messages().get_messages("si_u1_u2", 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_inbound_keeps_single_row_without_regression() {
        let (_dir, store, coord, _events) = test_coordinator().await;
        let payload = arrived("42", "u2", "u1", "hola");
        coord.deliver_inbound(payload.clone()).await;
        // 已读推进后，迟到的副本不得把状态拉回去
        store.messages().set_status("42", MessageStatus::Read).await.unwrap();
        coord.deliver_inbound(payload.clone()).await;
        coord.deliver_inbound(payload).await;

        let rows = store.messages().get_messages("si_u1_u2", 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].server_msg_id, "42");
        assert_eq!(rows[0].status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn mark_read_offline_flips_locally_without_error() {
        let (_dir, store, coord, _events) = test_coordinator().await;
        coord.deliver_inbound(arrived("1", "u2", "u1", "a")).await;
        coord.deliver_inbound(arrived("2", "u2", "u1", "b")).await;

        // 远端通知必然失败（无服务），本地已读不受影响也不报错
        let flipped = tokio::time::timeout(
            Duration::from_secs(10),
            coord.mark_chat_read("u2"),
        )
        .await
        .expect("已读管线不允许悬挂")
        .unwrap();
        assert_eq!(flipped, 2);
        assert_eq!(store.messages().unread_count("si_u1_u2").await.unwrap(), 0);
        for row in store.messages().get_messages("si_u1_u2", 0, 10).await.unwrap() {
            assert_eq!(row.status, MessageStatus::Read);
        }
    }

    #[tokio::test]
    async fn unread_cache_stays_consistent_with_store() {
        let (_dir, store, coord, _events) = test_coordinator().await;
        for i in 1..=3 {
            coord
                .deliver_inbound(arrived(&format!("{}", i), "u2", "u1", "x"))
                .await;
        }
        tokio::time::timeout(Duration::from_secs(10), coord.mark_chat_read("u2"))
            .await
            .unwrap()
            .unwrap();
        coord.deliver_inbound(arrived("9", "u2", "u1", "late")).await;

        let by_query = store.messages().unread_count("si_u1_u2").await.unwrap();
        let cached = store
            .conversations()
            .get_conversation_by_id("si_u1_u2")
            .await
            .unwrap()
            .unwrap()
            .unread_count;
        assert_eq!(by_query, 1);
        assert_eq!(cached, by_query);
    }

    #[tokio::test]
    async fn peer_read_receipt_advances_local_origin_rows() {
        let (_dir, store, coord, _events) = test_coordinator().await;
        // 直接种一条本端已发送的行（确认路径需要真实服务器）
        let sent = LocalChatMessage {
            chat_id: "si_u1_u2".into(),
            client_msg_id: "ns-u1-1".into(),
            server_msg_id: "srv-1".into(),
            send_id: "u1".into(),
            recv_id: "u2".into(),
            content: "mine".into(),
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
            is_self: true,
            is_deleted: false,
            create_time: 1_000,
            update_time: 1_000,
        };
        store.messages().upsert_message(&sent).await.unwrap();

        coord
            .handle_transport_event(TransportEvent::PeerRead(
                crate::im::types::PeerReceiptPayload {
                    receiver_id: "u2".into(),
                },
            ))
            .await;
        // 同队列的已读命令作为屏障，保证回执已被处理
        tokio::time::timeout(Duration::from_secs(10), coord.mark_chat_read("u2"))
            .await
            .unwrap()
            .unwrap();

        let row = store.messages().find_by_any_ref("ns-u1-1").await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn stale_session_ack_is_discarded() {
        let (_dir, store, coord, _events) = test_coordinator().await;
        // 其他会话命名空间的确认：不匹配任何等待者，也不触碰存储
        coord
            .handle_transport_event(TransportEvent::SendAcknowledged(
                crate::im::types::SendAcknowledgedPayload {
                    client_ref: "deadbeef-u1-1".into(),
                    id: "srv-404".into(),
                    created_at: 1_000,
                },
            ))
            .await;
        assert!(store
            .messages()
            .find_by_server_id("srv-404")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn draining_rejects_new_sends() {
        let (_dir, _store, coord, _events) = test_coordinator().await;
        coord.begin_drain();
        let result = coord.send_message("u2", MessageKind::Text, "late".into()).await;
        assert!(matches!(result, Err(SyncError::Draining)));
    }
}
