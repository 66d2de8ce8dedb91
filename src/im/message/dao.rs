//! 消息数据访问层（DAO）
//!
//! 负责所有消息相关的数据库操作，将数据访问逻辑与业务逻辑分离。
//! 幂等键：server_msg_id 非空时按 server_msg_id，否则按 client_msg_id；
//! 这是全引擎唯一的去重依据。状态写入永不回退。

use crate::im::error::{Result, SyncError};
use crate::im::message::models::{LocalChatMessage, MessageKind, MessageStatus};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

/// upsert 结果：重复抑制是正常出路，不是错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// 同一逻辑消息已存在且无可推进的变化（含墓碑行）
    Duplicate,
}

/// clientRef → 真实 id 收敛结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 临时行已盖上真实 id
    Reconciled,
    /// 接收路径先行入库，临时行已墓碑，存活行为 `surviving_client_ref`
    DuplicateDiscarded { surviving_client_ref: String },
    /// 找不到临时行（已被清理或从未落盘）
    NotFound,
}

/// 消息 DAO（基于 sqlx / SQLite）
#[derive(Clone)]
pub struct MessageDao {
    pool: Pool<Sqlite>,
}

impl MessageDao {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// 初始化消息表结构
    pub async fn init_db_with_pool(pool: &Pool<Sqlite>) -> Result<()> {
        info!("[MsgDAO/DB] 初始化消息数据库表结构");
        let sql = r#"
            CREATE TABLE IF NOT EXISTS local_messages (
                client_msg_id  TEXT PRIMARY KEY,
                server_msg_id  TEXT NOT NULL DEFAULT '',
                chat_id        TEXT NOT NULL,
                send_id        TEXT NOT NULL,
                recv_id        TEXT NOT NULL,
                content        TEXT NOT NULL DEFAULT '',
                kind           INTEGER NOT NULL,
                status         INTEGER NOT NULL,
                is_self        INTEGER NOT NULL DEFAULT 0,
                is_deleted     INTEGER NOT NULL DEFAULT 0,
                create_time    INTEGER NOT NULL,
                update_time    INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_local_messages_server_id
                ON local_messages(server_msg_id) WHERE server_msg_id <> '';
            CREATE INDEX IF NOT EXISTS idx_local_messages_chat_time
                ON local_messages(chat_id, create_time);
            CREATE INDEX IF NOT EXISTS idx_local_messages_chat_status
                ON local_messages(chat_id, status, is_self);
        "#;
        sqlx::query(sql).execute(pool).await?;
        Ok(())
    }

    /// 幂等写入一条消息
    ///
    /// 同一逻辑消息重复到达（例如两条传输路径各送一次）不会产生第二行，
    /// 也不会把已推进的状态写回去。
    pub async fn upsert_message(&self, msg: &LocalChatMessage) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = if !msg.server_msg_id.is_empty() {
            Self::select_by_server_id(&mut tx, &msg.server_msg_id).await?
        } else {
            None
        };
        let existing = match existing {
            Some(row) => Some(row),
            None => Self::select_by_client_id(&mut tx, &msg.client_msg_id).await?,
        };

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO local_messages (
                        client_msg_id, server_msg_id, chat_id, send_id, recv_id,
                        content, kind, status, is_self, is_deleted, create_time, update_time
                    ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?)
                    "#,
                )
                .bind(&msg.client_msg_id)
                .bind(&msg.server_msg_id)
                .bind(&msg.chat_id)
                .bind(&msg.send_id)
                .bind(&msg.recv_id)
                .bind(&msg.content)
                .bind(msg.kind.as_i32())
                .bind(msg.status.as_i32())
                .bind(if msg.is_self { 1 } else { 0 })
                .bind(if msg.is_deleted { 1 } else { 0 })
                .bind(msg.create_time)
                .bind(msg.update_time)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted
            }
            Some(row) if row.is_deleted => {
                // 墓碑行保留以维持幂等，不复活
                debug!(
                    "[MsgDAO] 命中墓碑行，抑制重复写入: clientMsgID={}",
                    row.client_msg_id
                );
                UpsertOutcome::Duplicate
            }
            Some(row) => {
                let advance = row.status.can_advance_to(msg.status);
                let fill_server_id = row.server_msg_id.is_empty() && !msg.server_msg_id.is_empty();
                if !advance && !fill_server_id {
                    UpsertOutcome::Duplicate
                } else {
                    let new_status = if advance { msg.status } else { row.status };
                    let new_server_id = if fill_server_id {
                        msg.server_msg_id.as_str()
                    } else {
                        row.server_msg_id.as_str()
                    };
                    sqlx::query(
                        "UPDATE local_messages SET server_msg_id = ?, status = ?, update_time = ? \
                         WHERE client_msg_id = ?",
                    )
                    .bind(new_server_id)
                    .bind(new_status.as_i32())
                    .bind(msg.update_time)
                    .bind(&row.client_msg_id)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Updated
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// 按服务端 id 查询（含墓碑行，调用方自行判定）
    pub async fn find_by_server_id(&self, server_msg_id: &str) -> Result<Option<LocalChatMessage>> {
        if server_msg_id.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query("SELECT * FROM local_messages WHERE server_msg_id = ? LIMIT 1")
            .bind(server_msg_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Self::row_to_msg))
    }

    /// 按 clientRef 或服务端 id 查询
    pub async fn find_by_any_ref(&self, msg_ref: &str) -> Result<Option<LocalChatMessage>> {
        let row = sqlx::query(
            "SELECT * FROM local_messages WHERE client_msg_id = ? OR server_msg_id = ? LIMIT 1",
        )
        .bind(msg_ref)
        .bind(msg_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Self::row_to_msg))
    }

    /// clientRef → 真实 id 收敛
    ///
    /// 若真实 id 的行已存在（消息先从接收路径到达），墓碑临时行而不是
    /// 留下两行；否则为临时行盖上 id 并把状态推进到 SENT。
    pub async fn reconcile_id(
        &self,
        client_msg_id: &str,
        server_msg_id: &str,
        ack_time: i64,
    ) -> Result<ReconcileOutcome> {
        let mut tx = self.pool.begin().await?;

        let winner = sqlx::query(
            "SELECT * FROM local_messages \
             WHERE server_msg_id = ? AND client_msg_id <> ? AND is_deleted = 0 LIMIT 1",
        )
        .bind(server_msg_id)
        .bind(client_msg_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(Self::row_to_msg);

        let outcome = if let Some(winner) = winner {
            sqlx::query(
                "UPDATE local_messages SET is_deleted = 1, update_time = ? WHERE client_msg_id = ?",
            )
            .bind(ack_time)
            .bind(client_msg_id)
            .execute(&mut *tx)
            .await?;
            // 存活行至少推进到 SENT（1=SENDING 才需要推）
            sqlx::query(
                "UPDATE local_messages SET status = ?, update_time = ? \
                 WHERE client_msg_id = ? AND status = 1",
            )
            .bind(MessageStatus::Sent.as_i32())
            .bind(ack_time)
            .bind(&winner.client_msg_id)
            .execute(&mut *tx)
            .await?;
            debug!(
                "[MsgDAO] 收敛时发现接收路径已入库，丢弃临时行: clientMsgID={}, serverMsgID={}",
                client_msg_id, server_msg_id
            );
            ReconcileOutcome::DuplicateDiscarded {
                surviving_client_ref: winner.client_msg_id,
            }
        } else {
            let res = sqlx::query(
                "UPDATE local_messages \
                 SET server_msg_id = ?, \
                     status = CASE WHEN status = 1 THEN 2 ELSE status END, \
                     update_time = ? \
                 WHERE client_msg_id = ? AND is_deleted = 0",
            )
            .bind(server_msg_id)
            .bind(ack_time)
            .bind(client_msg_id)
            .execute(&mut *tx)
            .await?;
            if res.rows_affected() == 0 {
                ReconcileOutcome::NotFound
            } else {
                ReconcileOutcome::Reconciled
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// 单条状态推进（按 clientRef 或服务端 id 寻址），回退写入被静默忽略
    pub async fn set_status(&self, msg_ref: &str, status: MessageStatus) -> Result<u64> {
        let now = chrono::Utc::now().timestamp_millis();
        let res = if status == MessageStatus::Failed {
            // FAILED 仅能从 SENDING 进入
            sqlx::query(
                "UPDATE local_messages SET status = 5, update_time = ? \
                 WHERE (client_msg_id = ? OR server_msg_id = ?) AND status = 1 AND is_deleted = 0",
            )
            .bind(now)
            .bind(msg_ref)
            .bind(msg_ref)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE local_messages SET status = ?, update_time = ? \
                 WHERE (client_msg_id = ? OR server_msg_id = ?) \
                   AND status < ? AND status <> 5 AND is_deleted = 0",
            )
            .bind(status.as_i32())
            .bind(now)
            .bind(msg_ref)
            .bind(msg_ref)
            .bind(status.as_i32())
            .execute(&self.pool)
            .await?
        };
        Ok(res.rows_affected())
    }

    /// 将一个会话中本端发出的消息批量推进（对端回执 delivered / read）
    ///
    /// 返回被推进行的 (client_msg_id, server_msg_id)，供事件发布使用。
    pub async fn advance_local_origin(
        &self,
        chat_id: &str,
        to: MessageStatus,
    ) -> Result<Vec<(String, String)>> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT client_msg_id, server_msg_id FROM local_messages \
             WHERE chat_id = ? AND is_self = 1 AND is_deleted = 0 \
               AND status < ? AND status <> 5",
        )
        .bind(chat_id)
        .bind(to.as_i32())
        .fetch_all(&mut *tx)
        .await?;
        let refs: Vec<(String, String)> = rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>("client_msg_id"),
                    r.get::<String, _>("server_msg_id"),
                )
            })
            .collect();
        sqlx::query(
            "UPDATE local_messages SET status = ?, update_time = ? \
             WHERE chat_id = ? AND is_self = 1 AND is_deleted = 0 \
               AND status < ? AND status <> 5",
        )
        .bind(to.as_i32())
        .bind(now)
        .bind(chat_id)
        .bind(to.as_i32())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(refs)
    }

    /// 将一个会话中对端发来的 DELIVERED 消息批量置 READ（单个原子写）
    pub async fn mark_chat_read(&self, chat_id: &str) -> Result<Vec<(String, String)>> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT client_msg_id, server_msg_id FROM local_messages \
             WHERE chat_id = ? AND is_self = 0 AND is_deleted = 0 AND status = 3",
        )
        .bind(chat_id)
        .fetch_all(&mut *tx)
        .await?;
        let refs: Vec<(String, String)> = rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>("client_msg_id"),
                    r.get::<String, _>("server_msg_id"),
                )
            })
            .collect();
        sqlx::query(
            "UPDATE local_messages SET status = 4, update_time = ? \
             WHERE chat_id = ? AND is_self = 0 AND is_deleted = 0 AND status = 3",
        )
        .bind(now)
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(refs)
    }

    /// 分页读取会话消息（最新在前，排除墓碑行）
    pub async fn get_messages(
        &self,
        chat_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<LocalChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM local_messages \
             WHERE chat_id = ? AND is_deleted = 0 \
             ORDER BY create_time DESC, client_msg_id DESC LIMIT ? OFFSET ?",
        )
        .bind(chat_id)
        .bind(page_size as i64)
        .bind(page as i64 * page_size as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Self::row_to_msg).collect())
    }

    /// 会话最新一条可见消息（排除墓碑与 FAILED，供会话摘要使用）
    pub async fn latest_visible(&self, chat_id: &str) -> Result<Option<LocalChatMessage>> {
        let row = sqlx::query(
            "SELECT * FROM local_messages \
             WHERE chat_id = ? AND is_deleted = 0 AND status <> 5 \
             ORDER BY create_time DESC, client_msg_id DESC LIMIT 1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Self::row_to_msg))
    }

    /// 会话未读数 = 对端发来、DELIVERED、未墓碑的行数
    pub async fn unread_count(&self, chat_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM local_messages \
             WHERE chat_id = ? AND is_self = 0 AND is_deleted = 0 AND status = 3",
        )
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("cnt").map_err(SyncError::from)?)
    }

    /// 软删除
    pub async fn tombstone(&self, client_msg_id: &str) -> Result<u64> {
        let now = chrono::Utc::now().timestamp_millis();
        let res = sqlx::query(
            "UPDATE local_messages SET is_deleted = 1, update_time = ? WHERE client_msg_id = ?",
        )
        .bind(now)
        .bind(client_msg_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// 按保留策略物理删除旧行（唯一允许物理删除的入口）
    pub async fn prune_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM local_messages WHERE create_time < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() > 0 {
            info!("[MsgDAO] 🗑️ 保留策略清理 {} 条旧消息", res.rows_affected());
        }
        Ok(res.rows_affected())
    }

    async fn select_by_server_id(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        server_msg_id: &str,
    ) -> Result<Option<LocalChatMessage>> {
        let row = sqlx::query("SELECT * FROM local_messages WHERE server_msg_id = ? LIMIT 1")
            .bind(server_msg_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(Self::row_to_msg))
    }

    async fn select_by_client_id(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        client_msg_id: &str,
    ) -> Result<Option<LocalChatMessage>> {
        let row = sqlx::query("SELECT * FROM local_messages WHERE client_msg_id = ? LIMIT 1")
            .bind(client_msg_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(Self::row_to_msg))
    }

    fn row_to_msg(row: sqlx::sqlite::SqliteRow) -> LocalChatMessage {
        LocalChatMessage {
            chat_id: row.try_get::<String, _>("chat_id").unwrap_or_default(),
            client_msg_id: row
                .try_get::<String, _>("client_msg_id")
                .unwrap_or_default(),
            server_msg_id: row
                .try_get::<String, _>("server_msg_id")
                .unwrap_or_default(),
            send_id: row.try_get::<String, _>("send_id").unwrap_or_default(),
            recv_id: row.try_get::<String, _>("recv_id").unwrap_or_default(),
            content: row.try_get::<String, _>("content").unwrap_or_default(),
            kind: MessageKind::from_i32(row.try_get::<i32, _>("kind").unwrap_or_default()),
            status: MessageStatus::from_i32(row.try_get::<i32, _>("status").unwrap_or(1)),
            is_self: row.try_get::<i32, _>("is_self").unwrap_or_default() != 0,
            is_deleted: row.try_get::<i32, _>("is_deleted").unwrap_or_default() != 0,
            create_time: row.try_get::<i64, _>("create_time").unwrap_or_default(),
            update_time: row.try_get::<i64, _>("update_time").unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_dao() -> (tempfile::TempDir, MessageDao) {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("chat.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("打开测试数据库失败");
        MessageDao::init_db_with_pool(&pool).await.unwrap();
        (dir, MessageDao::new(pool))
    }

    fn incoming(server_id: &str, chat_id: &str, body: &str, status: MessageStatus) -> LocalChatMessage {
        LocalChatMessage {
            chat_id: chat_id.into(),
            client_msg_id: format!("remote-{}", server_id),
            server_msg_id: server_id.into(),
            send_id: "u2".into(),
            recv_id: "u1".into(),
            content: body.into(),
            kind: MessageKind::Text,
            status,
            is_self: false,
            is_deleted: false,
            create_time: 1_000,
            update_time: 1_000,
        }
    }

    fn outgoing(client_ref: &str, chat_id: &str, body: &str) -> LocalChatMessage {
        LocalChatMessage {
            chat_id: chat_id.into(),
            client_msg_id: client_ref.into(),
            server_msg_id: String::new(),
            send_id: "u1".into(),
            recv_id: "u2".into(),
            content: body.into(),
            kind: MessageKind::Text,
            status: MessageStatus::Sending,
            is_self: true,
            is_deleted: false,
            create_time: 1_000,
            update_time: 1_000,
        }
    }

    #[tokio::test]
    async fn upsert_same_server_id_is_idempotent() {
        let (_dir, dao) = test_dao().await;
        let msg = incoming("42", "si_u1_u2", "hola", MessageStatus::Delivered);
        assert_eq!(dao.upsert_message(&msg).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(dao.upsert_message(&msg).await.unwrap(), UpsertOutcome::Duplicate);
        let rows = dao.get_messages("si_u1_u2", 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].server_msg_id, "42");
    }

    #[tokio::test]
    async fn upsert_never_regresses_status() {
        let (_dir, dao) = test_dao().await;
        let mut msg = incoming("42", "si_u1_u2", "hola", MessageStatus::Delivered);
        dao.upsert_message(&msg).await.unwrap();
        dao.set_status("42", MessageStatus::Read).await.unwrap();
        // 迟到的 DELIVERED 副本不得覆盖 READ
        msg.status = MessageStatus::Delivered;
        assert_eq!(dao.upsert_message(&msg).await.unwrap(), UpsertOutcome::Duplicate);
        let row = dao.find_by_server_id("42").await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn reconcile_assigns_id_and_advances_to_sent() {
        let (_dir, dao) = test_dao().await;
        dao.upsert_message(&outgoing("ns-u1-1", "si_u1_u2", "hola"))
            .await
            .unwrap();
        let out = dao.reconcile_id("ns-u1-1", "srv-9", 2_000).await.unwrap();
        assert_eq!(out, ReconcileOutcome::Reconciled);
        let row = dao.find_by_server_id("srv-9").await.unwrap().unwrap();
        assert_eq!(row.client_msg_id, "ns-u1-1");
        assert_eq!(row.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn reconcile_discards_provisional_when_receive_path_won() {
        let (_dir, dao) = test_dao().await;
        dao.upsert_message(&outgoing("ns-u1-1", "si_u1_u2", "hola"))
            .await
            .unwrap();
        // 同一逻辑消息先经接收路径入库（多端同步回流）
        dao.upsert_message(&incoming("42", "si_u1_u2", "hola", MessageStatus::Delivered))
            .await
            .unwrap();
        let out = dao.reconcile_id("ns-u1-1", "42", 2_000).await.unwrap();
        match out {
            ReconcileOutcome::DuplicateDiscarded { surviving_client_ref } => {
                assert_eq!(surviving_client_ref, "remote-42");
            }
            other => panic!("意外结果: {:?}", other),
        }
        // 只剩一行存活，临时行已墓碑
        let rows = dao.get_messages("si_u1_u2", 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].server_msg_id, "42");
        let provisional = dao.find_by_any_ref("ns-u1-1").await.unwrap().unwrap();
        assert!(provisional.is_deleted);
    }

    #[tokio::test]
    async fn reconcile_unknown_ref_reports_not_found() {
        let (_dir, dao) = test_dao().await;
        let out = dao.reconcile_id("ns-u1-404", "srv-1", 2_000).await.unwrap();
        assert_eq!(out, ReconcileOutcome::NotFound);
    }

    #[tokio::test]
    async fn mark_chat_read_flips_only_delivered_peer_rows() {
        let (_dir, dao) = test_dao().await;
        dao.upsert_message(&incoming("1", "si_u1_u2", "a", MessageStatus::Delivered))
            .await
            .unwrap();
        dao.upsert_message(&incoming("2", "si_u1_u2", "b", MessageStatus::Delivered))
            .await
            .unwrap();
        dao.upsert_message(&incoming("3", "si_u1_u2", "c", MessageStatus::Read))
            .await
            .unwrap();
        dao.upsert_message(&outgoing("ns-u1-9", "si_u1_u2", "mine"))
            .await
            .unwrap();
        let flipped = dao.mark_chat_read("si_u1_u2").await.unwrap();
        assert_eq!(flipped.len(), 2);
        assert_eq!(dao.unread_count("si_u1_u2").await.unwrap(), 0);
        // 本端消息不受已读标记影响
        let mine = dao.find_by_any_ref("ns-u1-9").await.unwrap().unwrap();
        assert_eq!(mine.status, MessageStatus::Sending);
    }

    #[tokio::test]
    async fn unread_count_matches_delivered_peer_rows() {
        let (_dir, dao) = test_dao().await;
        dao.upsert_message(&incoming("1", "si_u1_u2", "a", MessageStatus::Delivered))
            .await
            .unwrap();
        dao.upsert_message(&incoming("2", "si_u1_u2", "b", MessageStatus::Delivered))
            .await
            .unwrap();
        dao.upsert_message(&incoming("3", "si_u1_u2", "c", MessageStatus::Read))
            .await
            .unwrap();
        dao.tombstone("remote-2").await.unwrap();
        assert_eq!(dao.unread_count("si_u1_u2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn advance_local_origin_skips_failed_rows() {
        let (_dir, dao) = test_dao().await;
        dao.upsert_message(&outgoing("ns-u1-1", "si_u1_u2", "a"))
            .await
            .unwrap();
        dao.upsert_message(&outgoing("ns-u1-2", "si_u1_u2", "b"))
            .await
            .unwrap();
        dao.set_status("ns-u1-2", MessageStatus::Failed).await.unwrap();
        let advanced = dao
            .advance_local_origin("si_u1_u2", MessageStatus::Read)
            .await
            .unwrap();
        assert_eq!(advanced.len(), 1);
        assert_eq!(advanced[0].0, "ns-u1-1");
        let failed = dao.find_by_any_ref("ns-u1-2").await.unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn pagination_is_newest_first_and_skips_tombstones() {
        let (_dir, dao) = test_dao().await;
        for i in 0..5 {
            let mut msg = incoming(&format!("{}", i), "si_u1_u2", "x", MessageStatus::Delivered);
            msg.create_time = 1_000 + i;
            msg.update_time = msg.create_time;
            dao.upsert_message(&msg).await.unwrap();
        }
        dao.tombstone("remote-4").await.unwrap();
        let page = dao.get_messages("si_u1_u2", 0, 3).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].server_msg_id, "3");
        let page2 = dao.get_messages("si_u1_u2", 1, 3).await.unwrap();
        assert_eq!(page2.len(), 1);
    }

    #[tokio::test]
    async fn latest_visible_skips_failed_and_tombstoned() {
        let (_dir, dao) = test_dao().await;
        let mut newest = outgoing("ns-u1-1", "si_u1_u2", "newest");
        newest.create_time = 3_000;
        dao.upsert_message(&newest).await.unwrap();
        dao.set_status("ns-u1-1", MessageStatus::Failed).await.unwrap();
        let mut older = incoming("1", "si_u1_u2", "older", MessageStatus::Delivered);
        older.create_time = 2_000;
        dao.upsert_message(&older).await.unwrap();
        let latest = dao.latest_visible("si_u1_u2").await.unwrap().unwrap();
        assert_eq!(latest.server_msg_id, "1");
    }

    #[tokio::test]
    async fn prune_physically_deletes_old_rows() {
        let (_dir, dao) = test_dao().await;
        let mut old = incoming("1", "si_u1_u2", "old", MessageStatus::Read);
        old.create_time = 100;
        dao.upsert_message(&old).await.unwrap();
        let mut fresh = incoming("2", "si_u1_u2", "fresh", MessageStatus::Delivered);
        fresh.create_time = 9_000;
        dao.upsert_message(&fresh).await.unwrap();
        assert_eq!(dao.prune_older_than(5_000).await.unwrap(), 1);
        assert!(dao.find_by_server_id("1").await.unwrap().is_none());
        assert!(dao.find_by_server_id("2").await.unwrap().is_some());
    }
}
