//! 聊天同步引擎 CLI（测试版）
//!
//! 非交互式 CLI，用于测试和展示同步引擎：启动后连接服务器，
//! 打印事件总线上的所有事件；可选在启动时发送一条测试消息。

use anyhow::Result;
use chat_sdk_core_rust::im::client::{ChatSyncEngine, ClientConfig};
use chat_sdk_core_rust::im::event::ChatEvent;
use chat_sdk_core_rust::StaticToken;
use clap::Parser;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// 聊天同步引擎 CLI
#[derive(Parser, Debug)]
#[command(name = "chat-cli")]
#[command(about = "聊天同步引擎 CLI - 用于测试和展示同步功能", long_about = None)]
struct Args {
    /// 用户 ID
    #[arg(short, long)]
    user: String,

    /// 认证 token
    #[arg(short, long)]
    token: String,

    /// WebSocket 服务器 URL
    #[arg(long, default_value = "ws://localhost:10001")]
    ws_url: String,

    /// HTTP API 基础地址
    #[arg(long, default_value = "http://localhost:10002")]
    api_url: String,

    /// 本地数据库 URL
    #[arg(long, default_value = "sqlite://chat.db?mode=rwc")]
    db_url: String,

    /// 启动后发送一条测试消息，格式 "接收者ID:文本"
    #[arg(long)]
    send: Option<String>,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别
    #[arg(long, default_value = "info,chat_sdk_core_rust=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

/// 打印事件总线上的事件
fn describe_event(ev: &ChatEvent) {
    match ev {
        ChatEvent::MessageArrived(m) => {
            info!(
                "[CLI] 📨 消息入库: chatID={}, 状态={:?}, 内容={}",
                m.chat_id, m.status, m.content
            );
        }
        ChatEvent::MessageStatusChanged {
            chat_id,
            client_msg_id,
            server_msg_id,
            status,
        } => {
            info!(
                "[CLI] 🔄 状态推进: chatID={}, clientRef={}, serverMsgID={}, 状态={:?}",
                chat_id, client_msg_id, server_msg_id, status
            );
        }
        ChatEvent::ConversationUpdated(c) => {
            info!(
                "[CLI] 💬 会话更新: chatID={}, 未读={}, 最新: {}",
                c.chat_id, c.unread_count, c.latest_msg
            );
        }
        ChatEvent::TotalUnreadChanged(n) => {
            info!("[CLI] 📬 总未读数: {}", n);
        }
        ChatEvent::ConnectionStatusChanged { connected, detail } => {
            if *connected {
                info!("[CLI] 🔗 已连接: {}", detail);
            } else {
                warn!("[CLI] 🔗 断开连接: {}", detail);
            }
        }
        ChatEvent::TransportExhausted => {
            warn!("[CLI] ⚠️ 通道重连耗尽，转 HTTP 兜底");
        }
        ChatEvent::PresenceChanged { user_id, online } => {
            info!("[CLI] 👤 在线状态: userID={}, online={}", user_id, online);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level);

    info!("[CLI] 🚀 聊天同步引擎 CLI（测试模式）");
    info!("[CLI] 👤 用户ID: {}", args.user);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let mut config = ClientConfig::new(args.user.clone());
    config.ws_url = args.ws_url.clone();
    config.api_base_url = args.api_url.clone();
    config.db_url = args.db_url.clone();

    let engine = ChatSyncEngine::new(config, Arc::new(StaticToken(args.token.clone())))
        .await
        .map_err(|e| anyhow::anyhow!("引擎构造失败: {}", e))?;

    info!("[CLI] 🔗 正在连接服务器...");
    match engine.connect().await {
        Ok(_) => info!("[CLI] ✅ 连接成功！"),
        Err(e) => warn!("[CLI] ⚠️ 连接失败（继续以兜底模式运行）: {}", e),
    }

    // 显示初始信息
    if let Ok(conversations) = engine.list_conversations().await {
        info!("[CLI] 📋 会话列表（共 {} 个）:", conversations.len());
        for conv in conversations.iter().take(5) {
            info!(
                "[CLI]   - {} | 未读: {} | 最新: {}",
                conv.chat_id,
                conv.unread_count,
                if conv.latest_msg.chars().count() > 30 {
                    conv.latest_msg.chars().take(30).collect::<String>()
                } else {
                    conv.latest_msg.clone()
                }
            );
        }
    }
    if let Ok(unread) = engine.total_unread_count().await {
        info!("[CLI] 📬 总未读数: {}", unread);
    }

    // 事件打印任务
    let mut sub = engine.subscribe();
    tokio::spawn(async move {
        while let Some(ev) = sub.recv().await {
            describe_event(&ev);
        }
    });

    // 可选：发送一条测试消息
    if let Some(target) = &args.send {
        match target.split_once(':') {
            Some((recv_id, text)) => {
                info!("[CLI] 📤 发送测试消息: {} -> {}", recv_id, text);
                match engine.send_text_message(recv_id, text.to_string()).await {
                    Ok(msg) => info!(
                        "[CLI] ✅ 发送完成: 状态={:?}, serverMsgID={}",
                        msg.status, msg.server_msg_id
                    ),
                    Err(e) => error!("[CLI] ❌ 发送失败: {}", e),
                }
            }
            None => error!("[CLI] --send 参数格式应为 \"接收者ID:文本\""),
        }
    }

    info!("[CLI] 📥 开始监听事件...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
        engine.shutdown().await;
        info!("[CLI] 👋 程序退出");
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await?;
        engine.shutdown().await;
        info!("[CLI] 👋 程序退出");
    }

    Ok(())
}
