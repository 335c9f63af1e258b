// Crawl Progress Library
// 爬虫断点续爬进度跟踪核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 进度跟踪模块（分层状态存储）
pub mod progress;

// 导出常用类型
pub use config::AppConfig;
pub use progress::{
    derive_key, CrawlTask, Outcome, ProgressTracker, SpiderKind, StatusKey, TaskStatus,
    TrackerError,
};
