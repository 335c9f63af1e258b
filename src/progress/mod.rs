//! 爬取进度跟踪模块
//!
//! 为爬虫任务提供断点续爬能力：判断某个页面任务是否已完成或已无需重试，
//! 并把任务结果写入多层存储。
//!
//! ## 存储分层
//!
//! 1. **内存集合**: 本次运行内的已完成键，查询最快
//! 2. **本地状态文件**: JSON 快照，外部服务全部不可用时仍可续爬
//! 3. **远程缓存 (Redis)**: 跨进程共享已完成状态，带过期时间
//! 4. **状态台账 (SQLite)**: 状态与重试次数的权威来源
//!
//! 任何远程层不可用时都只降级，不中断爬取。
//!
//! ## 文件结构
//!
//! ```text
//! storage/
//! ├── crawl_status.db         # 状态台账
//! └── state/
//!     └── progress.json       # 本地状态文件 {"completed": [...]}
//! ```
//!
//! ## 使用示例
//!
//! ```ignore
//! use crawl_progress::config::AppConfig;
//! use crawl_progress::progress::{derive_key, Outcome, ProgressTracker};
//!
//! let config = AppConfig::load_or_default("config/app.toml").await?;
//! let tracker = ProgressTracker::open(&config).await;
//!
//! let url = "https://www.linovel.net/book/100818.html";
//! if !tracker.should_skip("novel_detail", url).await {
//!     // 抓取页面...
//!     if let Some(key) = derive_key("novel_detail", url) {
//!         tracker.record_outcome(&key, Outcome::Completed).await?;
//!     }
//! }
//!
//! tracker.shutdown().await?;
//! ```

pub mod error;
pub mod ledger;
pub mod ledger_db;
pub mod local_state;
pub mod maintenance;
pub mod remote_cache;
pub mod report;
pub mod task;
pub mod tracker;
pub mod types;

pub use error::{TierError, TrackerError};
pub use ledger::{MemoryLedger, StatusLedger};
pub use ledger_db::SqliteLedger;
pub use local_state::LocalStateStore;
pub use maintenance::{reset, ResetPlan, ResetSummary};
pub use remote_cache::{MemoryStatusCache, RedisStatusCache, RemoteCacheReport, RemoteStatusCache};
pub use report::{CrawlReport, FailureSummary, PageProgress, StatusCount};
pub use task::{derive_key, derive_task, CrawlTask, SpiderKind};
pub use tracker::{ProgressTracker, TrackerStats};
pub use types::{Outcome, RetryUpdate, StatusKey, StatusRecord, TaskStatus};
