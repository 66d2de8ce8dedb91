//! 消息模块
//!
//! 消息行模型、状态机与数据访问层

pub mod dao;
pub mod models;

// 重新导出主要类型
pub use dao::{MessageDao, ReconcileOutcome, UpsertOutcome};
pub use models::{LocalChatMessage, MessageKind, MessageStatus};
