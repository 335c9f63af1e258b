//! 远程状态缓存
//!
//! 多个进程 / 多次运行之间共享"已完成"状态，带过期时间。
//! 缓存缺失或任何连接错误都只表示"未知"，由跟踪器继续查询下一层

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::error::TierError;
use super::types::{StatusKey, TaskStatus, CACHE_KEY_PREFIX};

/// 远程缓存中记录已完成键的默认有效期（24 小时）
pub const DEFAULT_COMPLETED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// 旧版本按 URL 缓存时使用的键前缀，维护清理时一并删除
const LEGACY_URL_CACHE_PREFIX: &str = "url_cache";

#[async_trait]
pub trait RemoteStatusCache: Send + Sync {
    /// 读取键对应的状态字符串，不存在时返回 `None`
    async fn get(&self, key: &StatusKey) -> Result<Option<String>, TierError>;

    /// 以配置的有效期写入 `"completed"`
    async fn set_completed(&self, key: &StatusKey) -> Result<(), TierError>;

    /// 释放连接
    async fn close(&self) {}
}

// ============================================================================
// Redis 实现
// ============================================================================

/// 基于 Redis 的远程状态缓存
///
/// 多路复用连接本身支持并发使用，每次调用克隆一份句柄即可
pub struct RedisStatusCache {
    connection: RwLock<Option<MultiplexedConnection>>,
    ttl: Duration,
}

impl RedisStatusCache {
    /// 连接 Redis 并执行一次 PING
    ///
    /// 超过 `connect_timeout` 视为不可用
    pub async fn connect(
        url: &str,
        ttl: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, TierError> {
        let client = redis::Client::open(url)?;

        let mut connection =
            tokio::time::timeout(connect_timeout, client.get_multiplexed_async_connection())
                .await
                .map_err(|_| TierError::Timeout(connect_timeout))??;

        let _: String = tokio::time::timeout(
            connect_timeout,
            redis::cmd("PING").query_async(&mut connection),
        )
        .await
        .map_err(|_| TierError::Timeout(connect_timeout))??;

        info!("Redis 连接成功，已完成键有效期: {}s", ttl.as_secs());

        Ok(Self {
            connection: RwLock::new(Some(connection)),
            ttl,
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection, TierError> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| TierError::Unavailable("Redis 连接已关闭".to_string()))
    }

    /// 删除所有状态缓存键（维护操作）
    ///
    /// 同时清理旧版本遗留的 `url_cache:*` 键，返回删除的键数
    pub async fn clear_prefix(&self) -> Result<usize, TierError> {
        let mut connection = self.connection()?;
        let mut removed = 0;

        for prefix in [CACHE_KEY_PREFIX, LEGACY_URL_CACHE_PREFIX] {
            let pattern = format!("{}:*", prefix);
            let keys: Vec<String> = connection.keys(&pattern).await?;
            if keys.is_empty() {
                continue;
            }
            let deleted: usize = connection.del(&keys).await?;
            debug!("已删除 Redis 键: pattern={}, 数量={}", pattern, deleted);
            removed += deleted;
        }

        Ok(removed)
    }

    /// 只读检查缓存内容：键总数、各爬虫键数、值分布，以及指定键的当前值
    pub async fn inspect(&self, spot_check: &[StatusKey]) -> Result<RemoteCacheReport, TierError> {
        let mut connection = self.connection()?;

        let keys: Vec<String> = connection.keys(format!("{}:*", CACHE_KEY_PREFIX)).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(INSPECT_BATCH_SIZE) {
            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(chunk)
                .query_async(&mut connection)
                .await?;
            entries.extend(chunk.iter().cloned().zip(values));
        }

        let legacy: Vec<String> = connection
            .keys(format!("{}:*", LEGACY_URL_CACHE_PREFIX))
            .await?;

        let mut samples = Vec::with_capacity(spot_check.len());
        for key in spot_check {
            let value: Option<String> = connection.get(key.cache_key()).await?;
            samples.push((key.clone(), value));
        }

        let report = RemoteCacheReport::from_entries(entries, legacy.len(), samples);
        debug!("Redis 缓存检查完成: {} 个状态键", report.total_keys);
        Ok(report)
    }
}

/// 检查时每批 MGET 的键数
const INSPECT_BATCH_SIZE: usize = 500;

/// 远程缓存检查结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCacheReport {
    /// `crawl_status:*` 键总数
    pub total_keys: usize,
    /// 按爬虫名称统计的键数，无法解析的键计入 `""`
    pub per_spider: BTreeMap<String, usize>,
    /// 按值统计的键数，检查期间过期的键计入 `""`
    pub values: BTreeMap<String, usize>,
    /// 旧版本遗留的 `url_cache:*` 键数
    pub legacy_keys: usize,
    /// 指定键的当前值
    pub samples: Vec<(StatusKey, Option<String>)>,
}

impl RemoteCacheReport {
    pub fn from_entries(
        entries: Vec<(String, Option<String>)>,
        legacy_keys: usize,
        samples: Vec<(StatusKey, Option<String>)>,
    ) -> Self {
        let mut report = Self {
            total_keys: entries.len(),
            legacy_keys,
            samples,
            ..Default::default()
        };

        for (cache_key, value) in entries {
            let spider = StatusKey::from_cache_key(&cache_key)
                .map(|key| key.spider_name)
                .unwrap_or_default();
            *report.per_spider.entry(spider).or_default() += 1;
            *report.values.entry(value.unwrap_or_default()).or_default() += 1;
        }

        report
    }
}

impl fmt::Display for RemoteCacheReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Redis 缓存检查")?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "找到 {} 个 {} 缓存键", self.total_keys, CACHE_KEY_PREFIX)?;
        if self.legacy_keys > 0 {
            writeln!(f, "旧版 {} 键: {} 个", LEGACY_URL_CACHE_PREFIX, self.legacy_keys)?;
        }

        writeln!(f, "\n状态分布:")?;
        for (value, count) in &self.values {
            let label = if value.is_empty() { "(已过期)" } else { value.as_str() };
            writeln!(f, "  {}: {} 个", label, count)?;
        }

        writeln!(f, "\n不同 Spider 的缓存分布:")?;
        for (spider, count) in &self.per_spider {
            let label = if spider.is_empty() { "(无法解析)" } else { spider.as_str() };
            writeln!(f, "  {}: {} 个缓存键", label, count)?;
        }

        if !self.samples.is_empty() {
            writeln!(f, "\n关键缓存键检查:")?;
            for (key, value) in &self.samples {
                writeln!(f, "  {}: {}", key.cache_key(), value.as_deref().unwrap_or("(无)"))?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl RemoteStatusCache for RedisStatusCache {
    async fn get(&self, key: &StatusKey) -> Result<Option<String>, TierError> {
        let mut connection = self.connection()?;
        let value: Option<String> = connection.get(key.cache_key()).await?;
        Ok(value)
    }

    async fn set_completed(&self, key: &StatusKey) -> Result<(), TierError> {
        let mut connection = self.connection()?;
        let _: () = connection
            .set_ex(
                key.cache_key(),
                TaskStatus::Completed.as_str(),
                self.ttl.as_secs(),
            )
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if self.connection.write().take().is_some() {
            info!("Redis 连接已释放");
        }
    }
}

// ============================================================================
// 内存实现
// ============================================================================

/// 进程内的远程缓存实现
///
/// 遵守有效期；可切换为"不可达"以模拟网络故障
pub struct MemoryStatusCache {
    entries: DashMap<String, (String, Instant)>,
    ttl: Duration,
    unreachable: AtomicBool,
}

impl MemoryStatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// 直接写入任意状态字符串
    pub fn insert_raw(&self, key: &StatusKey, value: &str) {
        self.entries.insert(
            key.cache_key(),
            (value.to_string(), Instant::now() + self.ttl),
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_reachable(&self) -> Result<(), TierError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TierError::Unavailable("远程缓存不可达".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStatusCache {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETED_TTL)
    }
}

#[async_trait]
impl RemoteStatusCache for MemoryStatusCache {
    async fn get(&self, key: &StatusKey) -> Result<Option<String>, TierError> {
        self.check_reachable()?;

        let cache_key = key.cache_key();
        let expired = match self.entries.get(&cache_key) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(&cache_key);
        }
        Ok(None)
    }

    async fn set_completed(&self, key: &StatusKey) -> Result<(), TierError> {
        self.check_reachable()?;
        self.insert_raw(key, TaskStatus::Completed.as_str());
        Ok(())
    }
}
