//! 状态台账 SQLite 实现
//!
//! - crawl_status: 每个任务一行，(spider_name, status_type, identifier) 唯一
//!
//! 所有操作经由同一个连接串行执行；操作失败时重新打开连接并重试一次，
//! 仍失败则把错误返回给调用方

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, warn};

use super::error::TierError;
use super::ledger::StatusLedger;
use super::types::{RetryUpdate, StatusKey, StatusRecord, TaskStatus};

/// SQLite 状态台账
#[derive(Clone)]
pub struct SqliteLedger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    db_path: PathBuf,
    busy_timeout: Duration,
    /// 单连接；`None` 表示尚未连接或上次操作后已断开
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("db_path", &self.inner.db_path)
            .field("busy_timeout", &self.inner.busy_timeout)
            .finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// 创建台账并尝试建立连接
    ///
    /// 连接失败不会返回错误：台账以断开状态创建，后续操作时再重连
    pub fn new(db_path: &Path, busy_timeout: Duration) -> Self {
        let inner = LedgerInner {
            db_path: db_path.to_path_buf(),
            busy_timeout,
            conn: Mutex::new(None),
        };

        match inner.open_connection() {
            Ok(conn) => {
                if let Ok(mut guard) = inner.conn.lock() {
                    *guard = Some(conn);
                }
                info!("状态台账已连接: {:?}", db_path);
            }
            Err(e) => warn!("状态台账暂不可用，将在首次操作时重连: {:?}, 错误: {}", db_path, e),
        }

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    /// 在阻塞线程池中执行台账操作
    pub(crate) async fn run<T, F>(&self, op: F) -> Result<T, TierError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.execute(op))
            .await
            .map_err(|e| TierError::Unavailable(format!("台账任务异常退出: {}", e)))?
    }

    /// 读取完整记录，不存在时返回 `None`
    pub async fn get_record(&self, key: &StatusKey) -> Result<Option<StatusRecord>, TierError> {
        let key = key.clone();
        self.run(move |conn| {
            conn.query_row(
                r#"
                SELECT status, retry_count, last_update FROM crawl_status
                WHERE spider_name = ?1 AND status_type = ?2 AND identifier = ?3
                "#,
                params![key.spider_name, key.status_type, key.identifier],
                |row| {
                    let status: String = row.get(0)?;
                    let retry_count: i64 = row.get(1)?;
                    let last_update: i64 = row.get(2)?;
                    Ok(StatusRecord {
                        key: key.clone(),
                        status: TaskStatus::from_db(&status),
                        retry_count: clamp_retry(retry_count),
                        last_update: Utc
                            .timestamp_opt(last_update, 0)
                            .single()
                            .unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()
        })
        .await
    }

    /// 清空台账（维护操作），返回删除的行数
    pub async fn truncate(&self) -> Result<usize, TierError> {
        let deleted = self
            .run(|conn| conn.execute("DELETE FROM crawl_status", []))
            .await?;
        info!("已清空状态台账: {} 条记录", deleted);
        Ok(deleted)
    }
}

impl LedgerInner {
    fn open_connection(&self) -> Result<Connection, TierError> {
        // 确保父目录存在
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        init_tables(&conn)?;
        Ok(conn)
    }

    /// 在单连接上执行操作，失败时重连并重试一次
    fn execute<T, F>(&self, op: F) -> Result<T, TierError>
    where
        F: Fn(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| TierError::Unavailable(format!("获取数据库锁失败: {}", e)))?;

        if let Some(conn) = guard.as_mut() {
            match op(conn) {
                Ok(value) => return Ok(value),
                // 锁竞争在 busy_timeout 内未解除，重连无济于事，立即返回
                Err(e) if is_lock_contention(&e) => {
                    warn!("台账被其他连接锁定: {:?}, 错误: {}", self.db_path, e);
                    return Err(TierError::from(e));
                }
                Err(e) => warn!("台账操作失败，尝试重连: {}", e),
            }
        }

        *guard = None;
        let mut conn = self.open_connection()?;
        let result = op(&mut conn);
        *guard = Some(conn);

        if result.is_ok() {
            debug!("台账重连成功: {:?}", self.db_path);
        }
        result.map_err(TierError::from)
    }
}

fn init_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_status (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            spider_name TEXT NOT NULL,
            status_type TEXT NOT NULL,
            identifier TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_update INTEGER NOT NULL,
            UNIQUE (spider_name, status_type, identifier)
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_crawl_status_status ON crawl_status(status, last_update)",
        [],
    )?;

    Ok(())
}

fn is_lock_contention(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn clamp_retry(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[async_trait]
impl StatusLedger for SqliteLedger {
    async fn get_status(&self, key: &StatusKey) -> Result<(TaskStatus, u32), TierError> {
        let key = key.clone();
        let row = self
            .run(move |conn| {
                conn.query_row(
                    r#"
                    SELECT status, retry_count FROM crawl_status
                    WHERE spider_name = ?1 AND status_type = ?2 AND identifier = ?3
                    "#,
                    params![key.spider_name, key.status_type, key.identifier],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
            })
            .await?;

        Ok(row
            .map(|(status, retry_count)| (TaskStatus::from_db(&status), clamp_retry(retry_count)))
            .unwrap_or((TaskStatus::Pending, 0)))
    }

    async fn upsert(
        &self,
        key: &StatusKey,
        status: TaskStatus,
        retry: RetryUpdate,
    ) -> Result<(), TierError> {
        let owned_key = key.clone();
        let now = Utc::now().timestamp();

        // 失败计数在一条语句内完成读取与自增，不存在并发读改写窗口
        self.run(move |conn| {
            let key = &owned_key;
            match (status, retry) {
                (TaskStatus::Failed, _) => conn.execute(
                    r#"
                    INSERT INTO crawl_status
                        (spider_name, status_type, identifier, status, retry_count, last_update)
                    VALUES (?1, ?2, ?3, 'failed', 1, ?4)
                    ON CONFLICT(spider_name, status_type, identifier) DO UPDATE SET
                        status = excluded.status,
                        retry_count = crawl_status.retry_count + 1,
                        last_update = excluded.last_update
                    "#,
                    params![key.spider_name, key.status_type, key.identifier, now],
                ),
                (_, RetryUpdate::Preserve) => conn.execute(
                    r#"
                    INSERT INTO crawl_status
                        (spider_name, status_type, identifier, status, retry_count, last_update)
                    VALUES (?1, ?2, ?3, ?4, 0, ?5)
                    ON CONFLICT(spider_name, status_type, identifier) DO UPDATE SET
                        status = excluded.status,
                        last_update = excluded.last_update
                    "#,
                    params![
                        key.spider_name,
                        key.status_type,
                        key.identifier,
                        status.as_str(),
                        now
                    ],
                ),
                (_, RetryUpdate::Set(count)) => conn.execute(
                    r#"
                    INSERT INTO crawl_status
                        (spider_name, status_type, identifier, status, retry_count, last_update)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(spider_name, status_type, identifier) DO UPDATE SET
                        status = excluded.status,
                        retry_count = MAX(crawl_status.retry_count, excluded.retry_count),
                        last_update = excluded.last_update
                    "#,
                    params![
                        key.spider_name,
                        key.status_type,
                        key.identifier,
                        status.as_str(),
                        count as i64,
                        now
                    ],
                ),
            }
        })
        .await?;

        debug!("状态保存成功: {} -> {}", key, status);
        Ok(())
    }

    async fn query_all_completed(&self) -> Result<Vec<StatusKey>, TierError> {
        let keys = self
            .run(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT spider_name, status_type, identifier FROM crawl_status
                    WHERE status = 'completed'
                    "#,
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(StatusKey::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;

                let mut keys = Vec::new();
                for row in rows {
                    match row {
                        Ok(key) => keys.push(key),
                        Err(e) => warn!("读取已完成记录失败: {}", e),
                    }
                }
                Ok(keys)
            })
            .await?;

        info!("从台账加载了 {} 个已完成键", keys.len());
        Ok(keys)
    }

    async fn close(&self) {
        let inner = Arc::clone(&self.inner);
        let closed = tokio::task::spawn_blocking(move || match inner.conn.lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(_) => false,
        })
        .await
        .unwrap_or(false);

        if closed {
            info!("状态台账连接已关闭");
        }
    }
}
