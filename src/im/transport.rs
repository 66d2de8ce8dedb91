//! 传输通道（WebSocket）
//!
//! 持久双工连接：连接鉴权、心跳、读循环、断线自动重连（有界指数退避
//! 加抖动）。每个入站帧都先翻译成领域事件再交给调度器，调度器不接触
//! 传输层原生帧。重连次数耗尽后通道进入终止断开状态并发出
//! `Exhausted`，直到外部再次调用 `connect`。

use crate::im::auth::CredentialProvider;
use crate::im::error::{Result, SyncError};
use crate::im::serialization::{compress_gzip, decompress_gzip, is_gzip};
use crate::im::types::{
    event_name, ConnectAck, MessageArrivedPayload, PeerReceiptPayload, PresenceChangedPayload,
    SendAcknowledgedPayload, SendFailedPayload, WireEnvelope,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 通道连接状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// 重连退避策略（种子延迟、上限、抖动比例、最大尝试次数）
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub seed_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 抖动幅度占基础延迟的比例，0 表示无抖动
    pub jitter_ratio: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            seed_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.2,
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次（从 0 计）重连前的等待时长
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let base = self
            .seed_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        let jitter_cap = (base as f64 * self.jitter_ratio) as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        Duration::from_millis(base + jitter)
    }
}

/// 翻译后的领域事件（调度器消费的唯一入口）
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected { detail: String },
    /// 重连次数耗尽，通道终止
    Exhausted,
    MessageArrived(MessageArrivedPayload),
    SendAcknowledged(SendAcknowledgedPayload),
    SendFailed(SendFailedPayload),
    PeerDelivered(PeerReceiptPayload),
    PeerRead(PeerReceiptPayload),
    PresenceChanged(PresenceChangedPayload),
}

/// 传输通道配置
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ws_url: String,
    pub user_id: String,
    pub platform_id: i32,
    /// "gzip" 或空字符串表示不压缩
    pub compression: String,
    pub reconnect: ReconnectPolicy,
}

struct TransportInner {
    config: TransportConfig,
    state: watch::Sender<ChannelState>,
    writer: Mutex<Option<WsWriter>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    credentials: Mutex<Option<Arc<dyn CredentialProvider>>>,
    /// 停机标记：置位后读循环退出时不再重连
    closing: AtomicBool,
    /// 连接代数，换代后旧心跳任务自行退出
    epoch: AtomicU64,
}

/// 传输通道句柄（廉价克隆）
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<TransportInner>,
}

impl TransportChannel {
    pub fn new(config: TransportConfig, events_tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(TransportInner {
                config,
                state,
                writer: Mutex::new(None),
                events_tx,
                credentials: Mutex::new(None),
                closing: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// 构建 WebSocket 连接 URL
    fn build_url(&self, token: &str, operation_id: &str) -> String {
        let cfg = &self.inner.config;
        let compression_param = if cfg.compression.is_empty() {
            String::new()
        } else {
            format!("&compression={}", cfg.compression)
        };
        format!(
            "{}/?token={}&sendID={}&platformID={}&operationID={}{}",
            cfg.ws_url, token, cfg.user_id, cfg.platform_id, operation_id, compression_param
        )
    }

    /// 连接到服务器并启动读循环
    ///
    /// 凭证提供者被保存下来，后续每次重连都重新索取 token。
    pub async fn connect(&self, credentials: Arc<dyn CredentialProvider>) -> Result<()> {
        *self.inner.credentials.lock().await = Some(credentials);
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.state.send_replace(ChannelState::Connecting);
        match self.dial().await {
            Ok(reader) => {
                self.spawn_read_loop(reader);
                Ok(())
            }
            Err(e) => {
                self.inner.state.send_replace(ChannelState::Disconnected);
                Err(e)
            }
        }
    }

    /// 建立一次物理连接（拨号 + 鉴权 + 装载写入端与心跳）
    async fn dial(&self) -> Result<WsReader> {
        let provider = self
            .inner
            .credentials
            .lock()
            .await
            .clone()
            .ok_or(SyncError::TransportUnavailable)?;
        let token = provider.token().await?;
        let operation_id = format!("{}", chrono::Utc::now().timestamp_millis());
        let url = self.build_url(&token, &operation_id);

        info!(
            "[Transport] 🔗 连接服务器 (user={}, platform={})",
            self.inner.config.user_id, self.inner.config.platform_id
        );
        let (ws_stream, response) = connect_async(&url).await.map_err(|e| {
            warn!("[Transport] 连接失败: {}", e);
            SyncError::TransportUnavailable
        })?;
        debug!("[Transport] WebSocket 握手状态: {}", response.status());

        let (write, mut read) = ws_stream.split();

        // 等待连接鉴权响应
        match read.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let ack: ConnectAck = serde_json::from_str(&text).map_err(|e| {
                    SyncError::Protocol(format!("鉴权响应解析失败: {}, 原始响应: {}", e, text))
                })?;
                if ack.err_code != 0 {
                    let detail = if ack.err_dlt.is_empty() {
                        ack.err_msg.clone()
                    } else {
                        format!("{} (详情: {})", ack.err_msg, ack.err_dlt)
                    };
                    error!(
                        "[Transport] ❌ 连接鉴权失败，错误码: {}, 错误信息: {}",
                        ack.err_code, detail
                    );
                    return Err(SyncError::Server {
                        code: ack.err_code,
                        message: detail,
                    });
                }
                info!("[Transport] ✅ 服务器连接鉴权成功");
            }
            _ => {
                error!("[Transport] ❌ 未收到连接鉴权响应");
                return Err(SyncError::Protocol("未收到连接鉴权响应".to_string()));
            }
        }

        *self.inner.writer.lock().await = Some(write);
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.send_replace(ChannelState::Connected);
        let _ = self.inner.events_tx.send(TransportEvent::Connected);
        self.spawn_heartbeat(epoch);
        Ok(read)
    }

    fn spawn_read_loop(&self, reader: WsReader) {
        let chan = self.clone();
        tokio::spawn(async move {
            chan.read_loop(reader).await;
        });
    }

    /// 心跳（25 秒一次，连接换代或写入失败即退出）
    fn spawn_heartbeat(&self, epoch: u64) {
        let chan = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(25));
            loop {
                ticker.tick().await;
                if chan.inner.epoch.load(Ordering::SeqCst) != epoch {
                    break;
                }
                let mut guard = chan.inner.writer.lock().await;
                match guard.as_mut() {
                    Some(w) => {
                        if w.send(WsMessage::Ping(vec![])).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });
    }

    /// 读循环：逐帧翻译并投递，退出后进入重连或终止
    async fn read_loop(&self, mut read: WsReader) {
        let mut detail = "连接关闭".to_string();
        while let Some(frame) = read.next().await {
            match frame {
                Ok(WsMessage::Binary(data)) => self.handle_frame(&data),
                Ok(WsMessage::Text(text)) => self.handle_frame(text.as_bytes()),
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(frame)) => {
                    warn!("[Transport] 👋 连接关闭: {:?}", frame);
                    break;
                }
                Err(e) => {
                    error!("[Transport] WebSocket 错误: {}", e);
                    detail = e.to_string();
                    break;
                }
                _ => {}
            }
        }

        *self.inner.writer.lock().await = None;
        if self.inner.closing.load(Ordering::SeqCst) {
            self.inner.state.send_replace(ChannelState::Disconnected);
            return;
        }
        self.inner.state.send_replace(ChannelState::Reconnecting);
        let _ = self
            .inner
            .events_tx
            .send(TransportEvent::Disconnected { detail });
        self.reconnect_loop().await;
    }

    /// 有界重连循环，耗尽后终止并发出 Exhausted
    async fn reconnect_loop(&self) {
        let policy = self.inner.config.reconnect.clone();
        for attempt in 0..policy.max_attempts {
            if self.inner.closing.load(Ordering::SeqCst) {
                self.inner.state.send_replace(ChannelState::Disconnected);
                return;
            }
            let delay = policy.delay_for_attempt(attempt);
            info!(
                "[Transport] 🔄 重连 {}/{}，{} ms 后尝试",
                attempt + 1,
                policy.max_attempts,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            match self.dial().await {
                Ok(reader) => {
                    info!("[Transport] ✅ 重连成功");
                    self.spawn_read_loop(reader);
                    return;
                }
                Err(e) => {
                    warn!("[Transport] 重连失败: {}", e);
                }
            }
        }
        error!("[Transport] ❌ 重连次数耗尽，通道进入终止断开状态");
        self.inner.state.send_replace(ChannelState::Disconnected);
        let _ = self.inner.events_tx.send(TransportEvent::Exhausted);
    }

    /// 解码一帧并投递翻译后的事件
    fn handle_frame(&self, data: &[u8]) {
        let envelope = match Self::decode_frame(data) {
            Ok(env) => env,
            Err(e) => {
                error!("[Transport] 帧解析失败: {}", e);
                return;
            }
        };
        match Self::translate(&envelope) {
            Some(event) => {
                let _ = self.inner.events_tx.send(event);
            }
            None => {
                debug!("[Transport] 未知事件: {}", envelope.event);
            }
        }
    }

    /// 解码帧（gzip 嗅探 + JSON 信封）
    pub(crate) fn decode_frame(data: &[u8]) -> Result<WireEnvelope> {
        let plain;
        let bytes: &[u8] = if is_gzip(data) {
            plain = decompress_gzip(data)?;
            &plain
        } else {
            data
        };
        Ok(serde_json::from_slice::<WireEnvelope>(bytes)?)
    }

    /// 信封 → 领域事件翻译（固定词汇表）
    pub(crate) fn translate(envelope: &WireEnvelope) -> Option<TransportEvent> {
        let event = match envelope.event.as_str() {
            event_name::MESSAGE_ARRIVED => {
                TransportEvent::MessageArrived(envelope.unpack().ok()?)
            }
            event_name::SEND_ACKNOWLEDGED => {
                TransportEvent::SendAcknowledged(envelope.unpack().ok()?)
            }
            event_name::SEND_FAILED => TransportEvent::SendFailed(envelope.unpack().ok()?),
            event_name::DELIVERED => TransportEvent::PeerDelivered(envelope.unpack().ok()?),
            event_name::READ => TransportEvent::PeerRead(envelope.unpack().ok()?),
            event_name::PRESENCE_CHANGED => {
                TransportEvent::PresenceChanged(envelope.unpack().ok()?)
            }
            _ => return None,
        };
        Some(event)
    }

    /// 派发一个事件，返回是否真正写入连接（不等确认）
    pub async fn send<T: Serialize>(&self, event: &str, payload: &T) -> bool {
        if !self.is_connected() {
            return false;
        }
        let envelope = match WireEnvelope::pack(event, payload) {
            Ok(env) => env,
            Err(e) => {
                error!("[Transport] 事件打包失败: {}", e);
                return false;
            }
        };
        let json = match serde_json::to_vec(&envelope) {
            Ok(v) => v,
            Err(e) => {
                error!("[Transport] 信封序列化失败: {}", e);
                return false;
            }
        };
        let frame = if self.inner.config.compression == "gzip" {
            match compress_gzip(&json) {
                Ok(v) => v,
                Err(e) => {
                    error!("[Transport] 压缩失败: {}", e);
                    return false;
                }
            }
        } else {
            json
        };

        let mut guard = self.inner.writer.lock().await;
        match guard.as_mut() {
            Some(w) => match w.send(WsMessage::Binary(frame)).await {
                Ok(_) => true,
                Err(e) => {
                    error!("[Transport] 派发失败: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ChannelState::Connected
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// 主动断开，读循环退出后不再重连
    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let mut guard = self.inner.writer.lock().await;
        if let Some(w) = guard.as_mut() {
            let _ = w.send(WsMessage::Close(None)).await;
        }
        *guard = None;
        self.inner.state.send_replace(ChannelState::Disconnected);
        info!("[Transport] 👋 通道已断开");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::MessageKind;
    use crate::im::types::SendMessagePayload;

    fn no_jitter(seed: u64, max: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            seed_delay_ms: seed,
            max_delay_ms: max,
            jitter_ratio: 0.0,
            max_attempts: 8,
        }
    }

    #[test]
    fn backoff_starts_at_seed_delay() {
        let policy = no_jitter(250, 8_000);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
    }

    #[test]
    fn backoff_scales_exponentially() {
        let policy = no_jitter(100, 10_000);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = no_jitter(1_000, 4_000);
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(4_000));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = ReconnectPolicy {
            seed_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.5,
            max_attempts: 8,
        };
        for _ in 0..50 {
            let d = policy.delay_for_attempt(0).as_millis() as u64;
            assert!((1_000..=1_500).contains(&d), "抖动越界: {}", d);
        }
    }

    #[test]
    fn channel_starts_disconnected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let chan = TransportChannel::new(
            TransportConfig {
                ws_url: "ws://localhost:10001".into(),
                user_id: "u1".into(),
                platform_id: 5,
                compression: "gzip".into(),
                reconnect: ReconnectPolicy::default(),
            },
            tx,
        );
        assert_eq!(chan.state(), ChannelState::Disconnected);
        assert!(!chan.is_connected());
    }

    #[test]
    fn gzip_frame_translates_to_domain_event() {
        let payload = SendMessagePayload {
            sender_id: "u1".into(),
            receiver_id: "u2".into(),
            body: "hola".into(),
            kind: MessageKind::Text,
            client_ref: "ns-u1-1".into(),
        };
        // 入站 messageArrived 帧
        let arrived = crate::im::types::MessageArrivedPayload {
            id: "42".into(),
            sender_id: payload.sender_id.clone(),
            receiver_id: payload.receiver_id.clone(),
            body: payload.body.clone(),
            kind: payload.kind,
            created_at: 1_000,
        };
        let env = WireEnvelope::pack(event_name::MESSAGE_ARRIVED, &arrived).unwrap();
        let frame = compress_gzip(&serde_json::to_vec(&env).unwrap()).unwrap();

        let decoded = TransportChannel::decode_frame(&frame).unwrap();
        match TransportChannel::translate(&decoded) {
            Some(TransportEvent::MessageArrived(p)) => {
                assert_eq!(p.id, "42");
                assert_eq!(p.body, "hola");
            }
            other => panic!("翻译结果不符: {:?}", other),
        }
    }

    #[test]
    fn unknown_event_name_is_ignored() {
        let env = WireEnvelope {
            event: "somethingElse".into(),
            operation_id: "1".into(),
            data: Vec::new(),
        };
        assert!(TransportChannel::translate(&env).is_none());
    }
}
