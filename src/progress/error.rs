//! 分层存储的错误类型

use std::time::Duration;

use thiserror::Error;

use super::types::StatusKey;

/// 单个存储层（远程缓存 / 台账 / 本地文件）的错误
///
/// 调用方把任何 `TierError` 都视为"该层未命中"，继续查询下一层
#[derive(Debug, Error)]
pub enum TierError {
    #[error("存储层不可用: {0}")]
    Unavailable(String),

    #[error("存储层操作超时 ({0:?})")]
    Timeout(Duration),

    #[error("SQLite 错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// 进度跟踪器对调用方暴露的错误
#[derive(Debug, Error)]
pub enum TrackerError {
    /// 台账明确拒绝了写入（未生效），调用方可稍后重做整个任务
    #[error("写入台账失败 key={key}: {source}")]
    LedgerWrite {
        key: StatusKey,
        #[source]
        source: TierError,
    },

    /// 台账写入在超时前没有返回，写入可能已经生效
    ///
    /// 调用方不应直接重做失败上报，应先通过台账确认当前状态
    #[error("写入台账超时，结果未知 key={key} ({waited:?})")]
    OutcomeUnknown { key: StatusKey, waited: Duration },

    /// 本地状态文件持久化失败
    #[error("本地状态文件持久化失败: {0}")]
    LocalPersist(#[from] std::io::Error),
}
