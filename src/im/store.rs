//! 本地存储
//!
//! 消息与会话共用一个 SQLite 连接池：并发读、串行写，多行写入都在
//! DAO 内部以单条语句或事务完成，写锁随事务离开作用域释放。

use crate::im::conversation::dao::ConversationDao;
use crate::im::error::Result;
use crate::im::message::dao::MessageDao;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

/// 本地存储句柄（调度器独占持有，协作方不直接触碰）
pub struct LocalStore {
    messages: MessageDao,
    conversations: ConversationDao,
}

impl LocalStore {
    /// 打开数据库并初始化表结构
    ///
    /// `db_url` 形如 `sqlite://chat.db?mode=rwc`
    pub async fn open(db_url: &str) -> Result<Self> {
        info!("[Store] 🔗 打开本地数据库: {}", db_url);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;
        MessageDao::init_db_with_pool(&pool).await?;
        ConversationDao::init_db_with_pool(&pool).await?;
        Ok(Self {
            messages: MessageDao::new(pool.clone()),
            conversations: ConversationDao::new(pool),
        })
    }

    pub fn messages(&self) -> &MessageDao {
        &self.messages
    }

    pub fn conversations(&self) -> &ConversationDao {
        &self.conversations
    }
}
