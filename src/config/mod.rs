// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 进度跟踪配置
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// 状态台账配置
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Redis 远程缓存配置
    #[serde(default)]
    pub redis: RedisConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 进度跟踪配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// 失败任务达到此重试次数后在本次运行中永久跳过（默认 3）
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// 本地状态文件路径
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// 台账 / 远程缓存单次调用的超时（毫秒），超时按未命中处理
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// 新完成键批量刷写到本地状态文件的间隔（秒），0 表示只在关闭时刷写
    #[serde(default = "default_local_flush_interval_secs")]
    pub local_flush_interval_secs: u64,
}

// TrackerConfig 默认值函数
fn default_max_retry_count() -> u32 {
    3
}

fn default_state_file() -> PathBuf {
    PathBuf::from("storage/state/progress.json")
}

fn default_backend_timeout_ms() -> u64 {
    3000
}

fn default_local_flush_interval_secs() -> u64 {
    60
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            state_file: default_state_file(),
            backend_timeout_ms: default_backend_timeout_ms(),
            local_flush_interval_secs: default_local_flush_interval_secs(),
        }
    }
}

impl TrackerConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// 本地刷写间隔，`None` 表示禁用后台刷写
    pub fn local_flush_interval(&self) -> Option<Duration> {
        (self.local_flush_interval_secs > 0)
            .then(|| Duration::from_secs(self.local_flush_interval_secs))
    }
}

/// 状态台账配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// SQLite 数据库文件路径
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// 数据库被锁时的最长等待（毫秒）
    ///
    /// 必须小于 `tracker.backend_timeout_ms`，否则按其一半处理
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("storage/crawl_status.db")
}

fn default_busy_timeout_ms() -> u64 {
    1500
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl LedgerConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Redis 远程缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// 是否启用远程缓存
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// 连接地址，支持 `redis://[user][:password@]host:port/db`
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// 已完成键的有效期（秒，默认 24 小时）
    #[serde(default = "default_redis_ttl_secs")]
    pub ttl_secs: u64,

    /// 连接超时（毫秒）
    #[serde(default = "default_redis_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_redis_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_redis_connect_timeout_ms() -> u64 {
    3000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            ttl_secs: default_redis_ttl_secs(),
            connect_timeout_ms: default_redis_connect_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// 加载配置文件，文件不存在时使用默认配置，最后应用环境变量覆盖
    pub async fn load_or_default(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::load_from_file(path).await?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());

        if config.ledger.busy_timeout() >= config.tracker.backend_timeout() {
            warn!(
                "ledger.busy_timeout_ms={} 不小于 tracker.backend_timeout_ms={}，实际使用 {:?}",
                config.ledger.busy_timeout_ms,
                config.tracker.backend_timeout_ms,
                config.ledger_busy_timeout()
            );
        }
        Ok(config)
    }

    /// 跟踪器使用的台账锁等待时间
    ///
    /// 严格小于跟踪器的单次调用超时，保证台账在跟踪器放弃等待之前给出明确结果
    pub fn ledger_busy_timeout(&self) -> Duration {
        let backend = self.tracker.backend_timeout();
        let busy = self.ledger.busy_timeout();
        if busy < backend {
            busy
        } else {
            backend / 2
        }
    }

    /// 应用环境变量覆盖
    ///
    /// 支持 `REDIS_URL`、`CRAWL_STATUS_DB`、`CRAWL_STATE_FILE`、`CRAWL_MAX_RETRY_COUNT`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(url) = get("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(path) = get("CRAWL_STATUS_DB") {
            self.ledger.db_path = PathBuf::from(path);
        }
        if let Some(path) = get("CRAWL_STATE_FILE") {
            self.tracker.state_file = PathBuf::from(path);
        }
        if let Some(raw) = get("CRAWL_MAX_RETRY_COUNT") {
            match raw.trim().parse::<u32>() {
                Ok(count) => self.tracker.max_retry_count = count,
                Err(e) => warn!("忽略无效的 CRAWL_MAX_RETRY_COUNT={}: {}", raw, e),
            }
        }
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.tracker.max_retry_count, 3);
        assert_eq!(config.redis.ttl_secs, 86400);
        assert_eq!(
            config.tracker.state_file,
            PathBuf::from("storage/state/progress.json")
        );
        assert_eq!(
            config.tracker.local_flush_interval(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [tracker]
            max_retry_count = 5
            local_flush_interval_secs = 0

            [redis]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.tracker.max_retry_count, 5);
        assert_eq!(config.tracker.local_flush_interval(), None);
        assert_eq!(config.tracker.backend_timeout(), Duration::from_millis(3000));
        assert!(!config.redis.enabled);
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379/0");
        assert_eq!(config.ledger.db_path, PathBuf::from("storage/crawl_status.db"));
        assert!(config.log.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("REDIS_URL", "redis://cache:6380/2"),
            ("CRAWL_STATUS_DB", "/data/status.db"),
            ("CRAWL_STATE_FILE", ""),
            ("CRAWL_MAX_RETRY_COUNT", "five"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.redis.url, "redis://cache:6380/2");
        assert_eq!(config.ledger.db_path, PathBuf::from("/data/status.db"));
        // 空值与无法解析的值被忽略
        assert_eq!(
            config.tracker.state_file,
            PathBuf::from("storage/state/progress.json")
        );
        assert_eq!(config.tracker.max_retry_count, 3);
    }

    #[test]
    fn test_ledger_busy_timeout_below_backend_timeout() {
        let mut config = AppConfig::default();
        assert!(config.ledger_busy_timeout() < config.tracker.backend_timeout());
        assert_eq!(config.ledger_busy_timeout(), Duration::from_millis(1500));

        config.ledger.busy_timeout_ms = 5000;
        config.tracker.backend_timeout_ms = 3000;
        assert_eq!(config.ledger_busy_timeout(), Duration::from_millis(1500));

        config.ledger.busy_timeout_ms = 3000;
        assert_eq!(config.ledger_busy_timeout(), Duration::from_millis(1500));

        config.ledger.busy_timeout_ms = 800;
        assert_eq!(config.ledger_busy_timeout(), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config/app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.tracker.max_retry_count = 7;
        config.redis.enabled = false;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.tracker.max_retry_count, 7);
        assert!(!loaded.redis.enabled);
    }
}
