//! 会话数据访问层（DAO）
//!
//! 负责所有会话相关的数据库操作，将数据访问逻辑与业务逻辑分离。

use crate::im::conversation::models::LocalConversation;
use crate::im::error::Result;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

/// 会话 DAO（基于 sqlx / SQLite）
#[derive(Clone)]
pub struct ConversationDao {
    pool: Pool<Sqlite>,
}

impl ConversationDao {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// 初始化会话表结构
    pub async fn init_db_with_pool(pool: &Pool<Sqlite>) -> Result<()> {
        info!("[ConvDAO/DB] 初始化会话数据库表结构");
        let sql = r#"
            CREATE TABLE IF NOT EXISTS local_conversations (
                chat_id          TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL DEFAULT '',
                show_name        TEXT NOT NULL DEFAULT '',
                face_url         TEXT NOT NULL DEFAULT '',
                latest_msg       TEXT NOT NULL DEFAULT '',
                latest_msg_ref   TEXT NOT NULL DEFAULT '',
                latest_msg_time  INTEGER NOT NULL DEFAULT 0,
                unread_count     INTEGER NOT NULL DEFAULT 0,
                update_time      INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_local_conversations_latest_time
                ON local_conversations(latest_msg_time);
        "#;
        sqlx::query(sql).execute(pool).await?;
        Ok(())
    }

    /// 插入或更新会话
    pub async fn upsert_conversation(&self, conv: &LocalConversation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO local_conversations (
                chat_id, user_id, show_name, face_url,
                latest_msg, latest_msg_ref, latest_msg_time, unread_count, update_time
            ) VALUES (?,?,?,?,?,?,?,?,?)
            ON CONFLICT(chat_id) DO UPDATE SET
                user_id = excluded.user_id,
                show_name = excluded.show_name,
                face_url = excluded.face_url,
                latest_msg = excluded.latest_msg,
                latest_msg_ref = excluded.latest_msg_ref,
                latest_msg_time = excluded.latest_msg_time,
                unread_count = excluded.unread_count,
                update_time = excluded.update_time
            "#,
        )
        .bind(&conv.chat_id)
        .bind(&conv.user_id)
        .bind(&conv.show_name)
        .bind(&conv.face_url)
        .bind(&conv.latest_msg)
        .bind(&conv.latest_msg_ref)
        .bind(conv.latest_msg_time)
        .bind(conv.unread_count)
        .bind(conv.update_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 按会话 ID 查询
    pub async fn get_conversation_by_id(
        &self,
        chat_id: &str,
    ) -> Result<Option<LocalConversation>> {
        let row = sqlx::query("SELECT * FROM local_conversations WHERE chat_id = ? LIMIT 1")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Self::row_to_conv))
    }

    /// 会话列表（最新消息时间倒序）
    pub async fn list_conversations(&self) -> Result<Vec<LocalConversation>> {
        let rows =
            sqlx::query("SELECT * FROM local_conversations ORDER BY latest_msg_time DESC")
                .fetch_all(&self.pool)
                .await?;
        let conversations: Vec<LocalConversation> =
            rows.into_iter().map(Self::row_to_conv).collect();
        debug!(
            "[ConvDAO] 获取本地会话列表，共 {} 个会话",
            conversations.len()
        );
        Ok(conversations)
    }

    /// 总未读消息数
    pub async fn get_total_unread_count(&self) -> Result<i64> {
        let row =
            sqlx::query("SELECT IFNULL(SUM(unread_count), 0) AS total FROM local_conversations")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get::<i64, _>("total")?)
    }

    /// 删除会话行
    pub async fn delete_conversation(&self, chat_id: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM local_conversations WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    fn row_to_conv(row: sqlx::sqlite::SqliteRow) -> LocalConversation {
        LocalConversation {
            chat_id: row.try_get::<String, _>("chat_id").unwrap_or_default(),
            user_id: row.try_get::<String, _>("user_id").unwrap_or_default(),
            show_name: row.try_get::<String, _>("show_name").unwrap_or_default(),
            face_url: row.try_get::<String, _>("face_url").unwrap_or_default(),
            latest_msg: row.try_get::<String, _>("latest_msg").unwrap_or_default(),
            latest_msg_ref: row
                .try_get::<String, _>("latest_msg_ref")
                .unwrap_or_default(),
            latest_msg_time: row.try_get::<i64, _>("latest_msg_time").unwrap_or_default(),
            unread_count: row.try_get::<i64, _>("unread_count").unwrap_or_default(),
            update_time: row.try_get::<i64, _>("update_time").unwrap_or_default(),
        }
    }
}
