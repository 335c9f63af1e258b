//! 维护操作：清理进度数据（破坏性）
//!
//! 未确认时只返回将要执行的操作，不做任何修改

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::AppConfig;

use super::ledger_db::SqliteLedger;
use super::local_state::LocalStateStore;
use super::remote_cache::RedisStatusCache;

/// 要清理的存储层
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetPlan {
    /// 清空台账表
    pub ledger: bool,
    /// 按前缀删除远程缓存键
    pub remote: bool,
    /// 删除本地状态文件
    pub local: bool,
}

impl ResetPlan {
    pub fn all() -> Self {
        Self {
            ledger: true,
            remote: true,
            local: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.ledger || self.remote || self.local)
    }

    /// 列出计划中的操作
    pub fn describe(&self, config: &AppConfig) -> Vec<String> {
        let mut actions = Vec::new();
        if self.ledger {
            actions.push(format!("清空状态台账: {}", config.ledger.db_path.display()));
        }
        if self.remote {
            actions.push(format!(
                "按前缀删除 Redis 键 crawl_status:*, url_cache:* ({})",
                config.redis.url
            ));
        }
        if self.local {
            actions.push(format!(
                "删除本地状态文件: {}",
                config.tracker.state_file.display()
            ));
        }
        actions
    }
}

/// 清理结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetSummary {
    /// 是否实际执行（未确认时为 false）
    pub executed: bool,
    pub actions: Vec<String>,
    /// 删除的台账记录数
    pub ledger_rows: Option<usize>,
    /// 删除的远程缓存键数
    pub remote_keys: Option<usize>,
    /// 本地状态文件是否存在并被删除
    pub local_removed: Option<bool>,
}

/// 按计划清理进度数据
///
/// `confirmed` 为 false 时为演练模式
pub async fn reset(config: &AppConfig, plan: ResetPlan, confirmed: bool) -> Result<ResetSummary> {
    let mut summary = ResetSummary {
        actions: plan.describe(config),
        ..Default::default()
    };

    if !confirmed {
        for action in &summary.actions {
            info!("[演练] {}", action);
        }
        return Ok(summary);
    }

    if plan.ledger {
        let ledger = SqliteLedger::new(&config.ledger.db_path, config.ledger.busy_timeout());
        let deleted = ledger
            .truncate()
            .await
            .context("Failed to truncate crawl_status")?;
        summary.ledger_rows = Some(deleted);
    }

    if plan.remote {
        if !config.redis.enabled {
            warn!("远程缓存已在配置中禁用，仍按配置地址执行清理");
        }
        let cache = RedisStatusCache::connect(
            &config.redis.url,
            config.redis.ttl(),
            config.redis.connect_timeout(),
        )
        .await
        .context("Failed to connect to Redis")?;
        let removed = cache
            .clear_prefix()
            .await
            .context("Failed to delete Redis keys")?;
        info!("已删除 Redis 键: {} 个", removed);
        summary.remote_keys = Some(removed);
    }

    if plan.local {
        let local = LocalStateStore::new(&config.tracker.state_file);
        let removed = local
            .clear()
            .context("Failed to remove local state file")?;
        info!("本地状态文件已清理: {:?}", config.tracker.state_file);
        summary.local_removed = Some(removed);
    }

    summary.executed = true;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ledger::StatusLedger;
    use crate::progress::types::{RetryUpdate, StatusKey, TaskStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.ledger.db_path = temp_dir.path().join("status.db");
        config.tracker.state_file = temp_dir.path().join("state/progress.json");
        config.redis.url = "redis://127.0.0.1:1/0".to_string();
        config.redis.connect_timeout_ms = 300;
        config
    }

    async fn seed(config: &AppConfig) {
        let ledger = SqliteLedger::new(&config.ledger.db_path, Duration::from_secs(1));
        let key = StatusKey::new("novel_list", "list_page", "1");
        ledger
            .upsert(&key, TaskStatus::Completed, RetryUpdate::Preserve)
            .await
            .unwrap();

        let local = LocalStateStore::new(&config.tracker.state_file);
        local.add(&key);
        local.save().unwrap();
    }

    #[test]
    fn test_plan_describe() {
        let config = AppConfig::default();
        assert!(ResetPlan::default().is_empty());
        assert!(ResetPlan::default().describe(&config).is_empty());
        assert_eq!(ResetPlan::all().describe(&config).len(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        seed(&config).await;

        let summary = reset(&config, ResetPlan::all(), false).await.unwrap();
        assert!(!summary.executed);
        assert_eq!(summary.actions.len(), 3);
        assert!(config.tracker.state_file.exists());

        let ledger = SqliteLedger::new(&config.ledger.db_path, Duration::from_secs(1));
        assert_eq!(ledger.query_all_completed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_reset_clears_ledger_and_local() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        seed(&config).await;

        let plan = ResetPlan {
            ledger: true,
            remote: false,
            local: true,
        };
        let summary = reset(&config, plan, true).await.unwrap();
        assert!(summary.executed);
        assert_eq!(summary.ledger_rows, Some(1));
        assert_eq!(summary.local_removed, Some(true));
        assert_eq!(summary.remote_keys, None);
        assert!(!config.tracker.state_file.exists());

        let ledger = SqliteLedger::new(&config.ledger.db_path, Duration::from_secs(1));
        assert!(ledger.query_all_completed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_reset_fails_without_redis() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let plan = ResetPlan {
            remote: true,
            ..Default::default()
        };
        assert!(reset(&config, plan, true).await.is_err());
    }
}
