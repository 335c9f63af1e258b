//! 爬取进度核心类型定义
//!
//! 定义状态键、任务状态以及台账记录等数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 远程缓存与本地状态文件使用的键前缀
pub const CACHE_KEY_PREFIX: &str = "crawl_status";

/// 任务状态键
///
/// 由 (spider_name, status_type, identifier) 三元组唯一标识一个爬取任务，
/// 三个字段全部相同时两个键才相等
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusKey {
    /// 爬虫名称，如 `novel_list`
    pub spider_name: String,
    /// 状态类型，如 `list_page`
    pub status_type: String,
    /// 任务标识，如页码或书籍 ID
    pub identifier: String,
}

impl StatusKey {
    pub fn new(
        spider_name: impl Into<String>,
        status_type: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            spider_name: spider_name.into(),
            status_type: status_type.into(),
            identifier: identifier.into(),
        }
    }

    /// 缓存键：`crawl_status:<spider_name>:<status_type>:<identifier>`
    ///
    /// 远程缓存和本地状态文件都以此字符串存储已完成集合
    pub fn cache_key(&self) -> String {
        format!("{}:{}", CACHE_KEY_PREFIX, self)
    }

    /// 从缓存键解析状态键
    ///
    /// 标识符本身允许包含 `:`，只切分前两个分隔符
    pub fn from_cache_key(cache_key: &str) -> Option<Self> {
        let rest = cache_key.strip_prefix(CACHE_KEY_PREFIX)?.strip_prefix(':')?;
        let mut parts = rest.splitn(3, ':');
        let spider_name = parts.next().filter(|s| !s.is_empty())?;
        let status_type = parts.next().filter(|s| !s.is_empty())?;
        let identifier = parts.next().filter(|s| !s.is_empty())?;
        Some(Self::new(spider_name, status_type, identifier))
    }
}

impl std::fmt::Display for StatusKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.spider_name, self.status_type, self.identifier
        )
    }
}

/// 任务状态
///
/// `Pending` 是默认值，在第一次状态迁移之前不会被显式写入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待中
    #[default]
    Pending,
    /// 处理中
    Processing,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// 从台账中的字符串解析状态
    ///
    /// 未知字符串一律按 `Pending` 处理
    pub fn from_db(value: &str) -> Self {
        match value {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务执行结果
///
/// 调度器只能上报这三种确定的结果，任务中途被取消时不上报任何结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Processing,
    Completed,
    Failed,
}

impl From<Outcome> for TaskStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Processing => TaskStatus::Processing,
            Outcome::Completed => TaskStatus::Completed,
            Outcome::Failed => TaskStatus::Failed,
        }
    }
}

/// 非失败状态写入时的重试次数处理方式
///
/// 失败状态始终由台账自增，与此处的取值无关
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryUpdate {
    /// 保留已有的重试次数（新记录为 0）
    #[default]
    Preserve,
    /// 写入指定值，但不会低于已有的重试次数
    Set(u32),
}

/// 台账中的一条状态记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub key: StatusKey,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub last_update: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        let key = StatusKey::new("novel_detail", "detail_page", "100818");
        assert_eq!(key.to_string(), "novel_detail:detail_page:100818");
        assert_eq!(key.cache_key(), "crawl_status:novel_detail:detail_page:100818");
    }

    #[test]
    fn test_from_cache_key() {
        let key = StatusKey::from_cache_key("crawl_status:novel_comment:comment_page:100007_1")
            .unwrap();
        assert_eq!(key, StatusKey::new("novel_comment", "comment_page", "100007_1"));

        // 标识符中的冒号保留
        let key = StatusKey::from_cache_key("crawl_status:a:b:c:d").unwrap();
        assert_eq!(key.identifier, "c:d");

        assert!(StatusKey::from_cache_key("url_cache:https://x").is_none());
        assert!(StatusKey::from_cache_key("crawl_status:novel_list:list_page").is_none());
        assert!(StatusKey::from_cache_key("crawl_status:novel_list::3").is_none());
    }

    #[test]
    fn test_task_status_from_db() {
        assert_eq!(TaskStatus::from_db("completed"), TaskStatus::Completed);
        assert_eq!(TaskStatus::from_db("failed"), TaskStatus::Failed);
        assert_eq!(TaskStatus::from_db("processing"), TaskStatus::Processing);
        assert_eq!(TaskStatus::from_db("pending"), TaskStatus::Pending);
        assert_eq!(TaskStatus::from_db("paused"), TaskStatus::Pending);
        assert_eq!(TaskStatus::from_db(""), TaskStatus::Pending);
    }

    #[test]
    fn test_outcome_into_status() {
        assert_eq!(TaskStatus::from(Outcome::Failed), TaskStatus::Failed);
        assert_eq!(TaskStatus::from(Outcome::Completed).as_str(), "completed");
    }
}
