//! 会话模块
//!
//! 会话摘要行的模型、数据访问与聚合维护

pub mod aggregator;
pub mod dao;
pub mod models;

// 重新导出主要类型
pub use aggregator::ConversationAggregator;
pub use dao::ConversationDao;
pub use models::LocalConversation;
