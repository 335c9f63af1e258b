//! 进度跟踪器
//!
//! 把内存集合、本地状态文件、远程缓存、状态台账四层组合成两个操作：
//! - `should_skip`: 候选任务是否可以跳过
//! - `record_outcome`: 上报任务结果并传播到所有可达的层
//!
//! ## 跳过判定（按顺序，首个命中生效）
//!
//! 1. 本次运行中因重试次数超限而永久跳过的键
//! 2. 内存已完成集合
//! 3. 本地状态文件（命中后提升到内存）
//! 4. 远程缓存报告 `completed`（命中后提升到内存）
//! 5. 台账：已完成则跳过；失败且重试次数达到上限则跳过并记入永久跳过集合
//!
//! 无法推导状态键的任务永远不跳过。
//!
//! ## 结果传播
//!
//! - 完成：先写台账，成功后写远程缓存与内存集合；新完成键批量刷写到本地状态文件
//! - 失败 / 处理中：只写台账，失败状态永远不进入快速跳过路径

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, TrackerConfig};

use super::error::{TierError, TrackerError};
use super::ledger::StatusLedger;
use super::ledger_db::SqliteLedger;
use super::local_state::LocalStateStore;
use super::remote_cache::{RedisStatusCache, RemoteStatusCache};
use super::task::{derive_task, CrawlTask};
use super::types::{Outcome, RetryUpdate, StatusKey, TaskStatus};

/// 跟踪器运行时统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    /// 内存中的已完成键数
    pub memory_completed: usize,
    /// 本次运行中因重试超限被永久跳过的键数
    pub retry_limited: usize,
    /// 尚未刷写到本地状态文件的新完成键数
    pub pending_flush: usize,
    /// 远程缓存是否可用
    pub remote_enabled: bool,
}

/// 进度跟踪器
///
/// 由所有工作任务共享（通常包在 `Arc` 中），所有方法都只需要 `&self`
pub struct ProgressTracker {
    config: TrackerConfig,

    /// 本地状态文件
    local: Arc<LocalStateStore>,

    /// 远程缓存，`None` 表示降级为仅本地模式
    remote: Option<Arc<dyn RemoteStatusCache>>,

    /// 状态台账
    ledger: Arc<dyn StatusLedger>,

    /// 内存已完成集合
    memory: DashSet<StatusKey>,

    /// 本次运行中因重试超限而永久跳过的键
    retry_limited: DashSet<StatusKey>,

    /// 等待刷写到本地状态文件的新完成键
    pending_flush: Arc<Mutex<Vec<StatusKey>>>,

    /// 后台刷写任务句柄
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,

    /// shutdown 信号发送端
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("max_retry_count", &self.config.max_retry_count)
            .field("local", &self.local)
            .field("remote_enabled", &self.remote.is_some())
            .field("memory_completed", &self.memory.len())
            .field("retry_limited", &self.retry_limited.len())
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// 由已构造的各层组装跟踪器
    pub fn new(
        config: TrackerConfig,
        local: LocalStateStore,
        remote: Option<Arc<dyn RemoteStatusCache>>,
        ledger: Arc<dyn StatusLedger>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            local: Arc::new(local),
            remote,
            ledger,
            memory: DashSet::new(),
            retry_limited: DashSet::new(),
            pending_flush: Arc::new(Mutex::new(Vec::new())),
            flush_task: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// 按配置连接 SQLite 台账与 Redis 缓存，完成预热并启动后台刷写
    ///
    /// Redis 不可用时以仅本地模式运行；台账不可用时在后续操作中自动重连
    pub async fn open(app_config: &AppConfig) -> Arc<Self> {
        let tracker = Arc::new(Self::connect(app_config).await);

        tracker.initialize().await;
        tracker.start();
        tracker
    }

    /// 只读诊断用：连接各层并加载本地状态文件
    ///
    /// 不做台账预热、不启动后台刷写，结束时用 [`close`](Self::close) 释放连接，
    /// 整个过程不写入任何存储层
    pub async fn open_read_only(app_config: &AppConfig) -> Self {
        let tracker = Self::connect(app_config).await;
        tracker.local.load();
        tracker
    }

    async fn connect(app_config: &AppConfig) -> Self {
        let ledger: Arc<dyn StatusLedger> = Arc::new(SqliteLedger::new(
            &app_config.ledger.db_path,
            app_config.ledger_busy_timeout(),
        ));

        let remote: Option<Arc<dyn RemoteStatusCache>> = if app_config.redis.enabled {
            match RedisStatusCache::connect(
                &app_config.redis.url,
                app_config.redis.ttl(),
                app_config.redis.connect_timeout(),
            )
            .await
            {
                Ok(cache) => Some(Arc::new(cache) as Arc<dyn RemoteStatusCache>),
                Err(e) => {
                    warn!("Redis 连接失败，将禁用远程缓存: {}", e);
                    None
                }
            }
        } else {
            info!("远程缓存已在配置中禁用");
            None
        };

        let local = LocalStateStore::new(&app_config.tracker.state_file);
        Self::new(app_config.tracker.clone(), local, remote, ledger)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn local_store(&self) -> &LocalStateStore {
        &self.local
    }

    // ========================================================================
    // 启动和关闭
    // ========================================================================

    /// 加载本地状态文件并从台账预热已完成集合
    ///
    /// 预热失败只记录日志，跟踪器继续使用已加载的本地状态
    pub async fn initialize(&self) {
        self.local.load();
        for key in self.local.snapshot() {
            self.memory.insert(key);
        }

        match self.bounded(self.ledger.query_all_completed()).await {
            Ok(keys) => {
                self.local.extend(&keys);
                let count = keys.len();
                for key in keys {
                    self.memory.insert(key);
                }

                if let Err(e) = self.local.save() {
                    error!("预热后保存本地状态文件失败: {}", e);
                }
                info!(
                    "进度预热完成: 台账 {} 个已完成键, 内存共 {} 个",
                    count,
                    self.memory.len()
                );
            }
            Err(e) => {
                warn!(
                    "从台账预热失败，继续使用本地状态 ({} 个已完成键): {}",
                    self.memory.len(),
                    e
                );
            }
        }
    }

    /// 启动后台刷写任务
    ///
    /// 定期把新完成的键刷写到本地状态文件；刷写间隔为 0 时不启动
    pub fn start(&self) {
        let Some(interval) = self.config.local_flush_interval() else {
            debug!("本地状态后台刷写已禁用，仅在关闭时刷写");
            return;
        };

        let mut flush_task = self.flush_task.lock();
        if flush_task.is_some() {
            warn!("后台刷写任务已在运行");
            return;
        }

        let local = Arc::clone(&self.local);
        let pending = Arc::clone(&self.pending_flush);
        let shutdown_rx = self.shutdown_tx.subscribe();

        *flush_task = Some(tokio::spawn(async move {
            local_flush_loop(local, pending, interval, shutdown_rx).await;
        }));

        info!("后台刷写任务已启动，刷写间隔: {}s", interval.as_secs());
    }

    /// 关闭跟踪器
    ///
    /// 停止后台刷写，把内存已完成集合并入本地状态文件并保存，然后释放台账与远程缓存连接。
    /// 本地保存失败时仍会释放连接，并把错误返回给调用方
    pub async fn shutdown(&self) -> Result<(), TrackerError> {
        info!("正在关闭进度跟踪器...");

        let _ = self.shutdown_tx.send(());

        let handle = self.flush_task.lock().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(_) => info!("后台刷写任务已正常退出"),
                Err(e) => error!("后台刷写任务异常退出: {}", e),
            }
        }

        let mut keys = std::mem::take(&mut *self.pending_flush.lock());
        keys.extend(self.memory.iter().map(|entry| entry.key().clone()));
        self.local.extend(&keys);
        let saved = self.local.save();

        self.close().await;

        match saved {
            Ok(()) => {
                info!("进度跟踪器已关闭，本地状态 {} 个已完成键", self.local.len());
                Ok(())
            }
            Err(e) => {
                error!("关闭时保存本地状态文件失败: {}", e);
                Err(TrackerError::LocalPersist(e))
            }
        }
    }

    /// 释放台账与远程缓存连接，不保存本地状态
    pub async fn close(&self) {
        self.ledger.close().await;
        if let Some(remote) = &self.remote {
            remote.close().await;
        }
    }

    // ========================================================================
    // 跳过判定
    // ========================================================================

    /// 判断 (爬虫, URL) 对应的任务是否可以跳过
    ///
    /// 无法推导状态键的 URL 一律执行
    pub async fn should_skip(&self, spider_name: &str, url: &str) -> bool {
        match derive_task(spider_name, url) {
            Some(task) => self.should_skip_task(&task).await,
            None => {
                debug!("无法推导状态键，始终执行: spider={}, url={}", spider_name, url);
                false
            }
        }
    }

    pub async fn should_skip_task(&self, task: &CrawlTask) -> bool {
        self.should_skip_key(&task.status_key()).await
    }

    pub async fn should_skip_key(&self, key: &StatusKey) -> bool {
        if self.retry_limited.contains(key) {
            debug!("重试超限，跳过: {}", key);
            return true;
        }

        if self.memory.contains(key) {
            debug!("内存命中，跳过: {}", key);
            return true;
        }

        if self.local.is_completed(key) {
            debug!("本地状态文件命中，跳过: {}", key);
            self.memory.insert(key.clone());
            return true;
        }

        if let Some(remote) = &self.remote {
            match self.bounded(remote.get(key)).await {
                Ok(Some(value)) if value == TaskStatus::Completed.as_str() => {
                    debug!("远程缓存命中，跳过: {}", key);
                    self.memory.insert(key.clone());
                    return true;
                }
                Ok(_) => {}
                Err(e) => debug!("远程缓存查询失败，视为未命中: {}, 错误: {}", key, e),
            }
        }

        match self.bounded(self.ledger.get_status(key)).await {
            Ok((TaskStatus::Completed, _)) => {
                debug!("台账已完成，跳过: {}", key);
                self.promote_completed(key);
                true
            }
            Ok((TaskStatus::Failed, retry_count)) if retry_count >= self.config.max_retry_count => {
                warn!(
                    "{} 重试次数超过限制 ({}/{})，跳过",
                    key, retry_count, self.config.max_retry_count
                );
                self.retry_limited.insert(key.clone());
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("台账查询失败，继续执行: {}, 错误: {}", key, e);
                false
            }
        }
    }

    // ========================================================================
    // 结果传播
    // ========================================================================

    /// 上报任务结果
    ///
    /// 台账写入失败时不会更新任何缓存层：
    /// - 台账明确返回错误时为 [`TrackerError::LedgerWrite`]，写入未生效
    /// - 等待超时时为 [`TrackerError::OutcomeUnknown`]，写入可能已在后台生效
    pub async fn record_outcome(&self, key: &StatusKey, outcome: Outcome) -> Result<(), TrackerError> {
        let status = TaskStatus::from(outcome);

        self.bounded(self.ledger.upsert(key, status, RetryUpdate::Preserve))
            .await
            .map_err(|source| match source {
                TierError::Timeout(waited) => {
                    error!("写入台账超时，结果未知: {} -> {} ({:?})", key, status, waited);
                    TrackerError::OutcomeUnknown {
                        key: key.clone(),
                        waited,
                    }
                }
                source => {
                    error!("写入台账失败: {} -> {}, 错误: {}", key, status, source);
                    TrackerError::LedgerWrite {
                        key: key.clone(),
                        source,
                    }
                }
            })?;

        if outcome != Outcome::Completed {
            return Ok(());
        }

        if let Some(remote) = &self.remote {
            if let Err(e) = self.bounded(remote.set_completed(key)).await {
                warn!("写入远程缓存失败（忽略）: {}, 错误: {}", key, e);
            }
        }

        self.promote_completed(key);
        Ok(())
    }

    /// 诊断用：直接查询台账中的状态
    pub async fn status(&self, key: &StatusKey) -> Option<(TaskStatus, u32)> {
        self.bounded(self.ledger.get_status(key)).await.ok()
    }

    /// 立即把新完成的键刷写到本地状态文件，返回刷写的键数
    pub fn flush_local(&self) -> io::Result<usize> {
        flush_pending(&self.local, &self.pending_flush)
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            memory_completed: self.memory.len(),
            retry_limited: self.retry_limited.len(),
            pending_flush: self.pending_flush.lock().len(),
            remote_enabled: self.remote.is_some(),
        }
    }

    fn promote_completed(&self, key: &StatusKey) {
        if self.memory.insert(key.clone()) {
            self.pending_flush.lock().push(key.clone());
        }
    }

    /// 为台账 / 远程缓存调用加上超时，超时视为该层未命中
    async fn bounded<T, F>(&self, fut: F) -> Result<T, TierError>
    where
        F: Future<Output = Result<T, TierError>>,
    {
        let timeout: Duration = self.config.backend_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TierError::Timeout(timeout)),
        }
    }
}

// ============================================================================
// 后台刷写循环
// ============================================================================

/// 本地状态刷写循环
///
/// 定期把新完成的键并入本地状态文件；收到关闭信号后退出，最终刷写由 `shutdown` 完成
async fn local_flush_loop(
    local: Arc<LocalStateStore>,
    pending: Arc<Mutex<Vec<StatusKey>>>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // 第一次 tick 立即返回
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match flush_pending(&local, &pending) {
                    Ok(0) => {}
                    Ok(count) => debug!("本地状态刷写完成: {} 个新完成键", count),
                    Err(e) => error!("本地状态刷写失败: {}", e),
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    info!("本地状态刷写循环已退出");
}

/// 刷写待写入的键，失败时放回队列
fn flush_pending(local: &LocalStateStore, pending: &Mutex<Vec<StatusKey>>) -> io::Result<usize> {
    let keys = std::mem::take(&mut *pending.lock());
    if keys.is_empty() {
        return Ok(0);
    }

    local.extend(&keys);
    match local.save() {
        Ok(()) => Ok(keys.len()),
        Err(e) => {
            pending.lock().extend(keys);
            Err(e)
        }
    }
}

// ============================================================================
// 单元测试
// ============================================================================
