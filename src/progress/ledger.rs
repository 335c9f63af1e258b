//! 状态台账接口
//!
//! 台账是任务状态与重试次数的唯一权威来源，也是唯一能回答"是否超过重试上限"的层

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::error::TierError;
use super::types::{RetryUpdate, StatusKey, StatusRecord, TaskStatus};

#[async_trait]
pub trait StatusLedger: Send + Sync {
    /// 查询状态与重试次数，记录不存在时返回 `(Pending, 0)`
    async fn get_status(&self, key: &StatusKey) -> Result<(TaskStatus, u32), TierError>;

    /// 写入状态
    ///
    /// `Failed` 时在已有重试次数上加一（忽略 `retry`）；其余状态按 `retry` 处理
    async fn upsert(
        &self,
        key: &StatusKey,
        status: TaskStatus,
        retry: RetryUpdate,
    ) -> Result<(), TierError>;

    /// 全表扫描所有已完成的键，仅在启动预热时使用
    async fn query_all_completed(&self) -> Result<Vec<StatusKey>, TierError>;

    /// 释放连接
    async fn close(&self) {}
}

/// 计算一次写入之后的重试次数
///
/// 所有台账实现共享这一规则：失败加一，其余状态不降低已有计数
pub(crate) fn next_retry_count(existing: Option<u32>, status: TaskStatus, retry: RetryUpdate) -> u32 {
    let existing_count = existing.unwrap_or(0);
    match (status, retry) {
        (TaskStatus::Failed, _) => existing_count.saturating_add(1),
        (_, RetryUpdate::Preserve) => existing_count,
        (_, RetryUpdate::Set(count)) => match existing {
            Some(current) => current.max(count),
            None => count,
        },
    }
}

/// 进程内台账
///
/// 语义与 SQLite 台账一致；可切换为"不可达"以模拟数据库故障
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<StatusKey, StatusRecord>>,
    unreachable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn record(&self, key: &StatusKey) -> Option<StatusRecord> {
        self.records.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空所有记录（模拟外部重置台账）
    pub fn truncate(&self) {
        self.records.lock().clear();
    }

    fn check_reachable(&self) -> Result<(), TierError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TierError::Unavailable("台账不可达".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusLedger for MemoryLedger {
    async fn get_status(&self, key: &StatusKey) -> Result<(TaskStatus, u32), TierError> {
        self.check_reachable()?;
        Ok(self
            .records
            .lock()
            .get(key)
            .map(|record| (record.status, record.retry_count))
            .unwrap_or((TaskStatus::Pending, 0)))
    }

    async fn upsert(
        &self,
        key: &StatusKey,
        status: TaskStatus,
        retry: RetryUpdate,
    ) -> Result<(), TierError> {
        self.check_reachable()?;

        let mut records = self.records.lock();
        let existing = records.get(key).map(|record| record.retry_count);
        let retry_count = next_retry_count(existing, status, retry);

        records.insert(
            key.clone(),
            StatusRecord {
                key: key.clone(),
                status,
                retry_count,
                last_update: Utc::now(),
            },
        );
        Ok(())
    }

    async fn query_all_completed(&self) -> Result<Vec<StatusKey>, TierError> {
        self.check_reachable()?;
        Ok(self
            .records
            .lock()
            .values()
            .filter(|record| record.status == TaskStatus::Completed)
            .map(|record| record.key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_retry_count() {
        use RetryUpdate::*;
        use TaskStatus::*;

        assert_eq!(next_retry_count(None, Failed, Set(9)), 1);
        assert_eq!(next_retry_count(Some(2), Failed, Preserve), 3);
        assert_eq!(next_retry_count(Some(2), Completed, Preserve), 2);
        assert_eq!(next_retry_count(None, Processing, Preserve), 0);
        assert_eq!(next_retry_count(None, Processing, Set(4)), 4);
        // 不会降低已有计数
        assert_eq!(next_retry_count(Some(3), Completed, Set(0)), 3);
        assert_eq!(next_retry_count(Some(u32::MAX), Failed, Preserve), u32::MAX);
    }

    #[tokio::test]
    async fn test_memory_ledger_failed_increments() {
        let ledger = MemoryLedger::new();
        let key = StatusKey::new("novel_list", "list_page", "7");

        assert_eq!(ledger.get_status(&key).await.unwrap(), (TaskStatus::Pending, 0));

        ledger.upsert(&key, TaskStatus::Processing, RetryUpdate::Preserve).await.unwrap();
        for expected in 1..=3 {
            ledger.upsert(&key, TaskStatus::Failed, RetryUpdate::Set(0)).await.unwrap();
            assert_eq!(
                ledger.get_status(&key).await.unwrap(),
                (TaskStatus::Failed, expected)
            );
        }

        ledger.upsert(&key, TaskStatus::Completed, RetryUpdate::Preserve).await.unwrap();
        assert_eq!(ledger.get_status(&key).await.unwrap(), (TaskStatus::Completed, 3));
        assert_eq!(ledger.query_all_completed().await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_memory_ledger_unreachable() {
        let ledger = MemoryLedger::new();
        let key = StatusKey::new("novel_list", "list_page", "1");
        ledger.set_unreachable(true);

        assert!(ledger.get_status(&key).await.is_err());
        assert!(ledger
            .upsert(&key, TaskStatus::Completed, RetryUpdate::Preserve)
            .await
            .is_err());
        assert!(ledger.query_all_completed().await.is_err());
        assert!(ledger.is_empty());
    }
}
