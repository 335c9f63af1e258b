//! 台账统计报告
//!
//! 只读查询，不影响跟踪器的任何状态

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rusqlite::{params, Connection};

use super::error::TierError;
use super::ledger_db::SqliteLedger;
use super::types::{StatusKey, StatusRecord, TaskStatus};

/// 某个爬虫在某个状态下的记录数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount {
    pub spider_name: String,
    pub status: TaskStatus,
    pub count: u64,
}

/// 按 (爬虫, 状态类型) 汇总的失败统计
#[derive(Debug, Clone, PartialEq)]
pub struct FailureSummary {
    pub spider_name: String,
    pub status_type: String,
    pub failed_count: u64,
    pub avg_retries: f64,
    pub max_retries: u32,
}

/// 按 (爬虫, 状态类型) 汇总的完成进度
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageProgress {
    pub spider_name: String,
    pub status_type: String,
    pub completed: u64,
    pub total: u64,
}

impl PageProgress {
    /// 完成百分比，`total` 为 0 时返回 0
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }
}

/// 台账统计报告
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub generated_at: DateTime<Utc>,
    pub total_records: u64,
    pub status_counts: Vec<StatusCount>,
    pub failures: Vec<FailureSummary>,
    pub updated_last_hour: u64,
    pub updated_last_day: u64,
    pub progress: Vec<PageProgress>,
    pub recent_failed: Vec<StatusRecord>,
}

impl SqliteLedger {
    /// 生成统计报告
    ///
    /// `recent_failed_limit` 控制最近失败记录的条数
    pub async fn report(&self, recent_failed_limit: usize) -> Result<CrawlReport, TierError> {
        self.run(move |conn| build_report(conn, Utc::now(), recent_failed_limit))
            .await
    }

    /// 按最后更新时间倒序列出失败记录
    pub async fn recent_failed(&self, limit: usize) -> Result<Vec<StatusRecord>, TierError> {
        self.run(move |conn| query_recent_failed(conn, limit)).await
    }
}

fn build_report(
    conn: &mut Connection,
    now: DateTime<Utc>,
    recent_failed_limit: usize,
) -> rusqlite::Result<CrawlReport> {
    let total_records: i64 =
        conn.query_row("SELECT COUNT(*) FROM crawl_status", [], |row| row.get(0))?;

    // 状态分布
    let mut stmt = conn.prepare(
        r#"
        SELECT spider_name, status, COUNT(*) FROM crawl_status
        GROUP BY spider_name, status
        ORDER BY spider_name, status
        "#,
    )?;
    let status_counts = stmt
        .query_map([], |row| {
            let status: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            Ok(StatusCount {
                spider_name: row.get(0)?,
                status: TaskStatus::from_db(&status),
                count: count.max(0) as u64,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    // 失败与重试
    let mut stmt = conn.prepare(
        r#"
        SELECT spider_name, status_type, COUNT(*), AVG(retry_count), MAX(retry_count)
        FROM crawl_status
        WHERE status = 'failed'
        GROUP BY spider_name, status_type
        ORDER BY COUNT(*) DESC, spider_name, status_type
        "#,
    )?;
    let failures = stmt
        .query_map([], |row| {
            let failed_count: i64 = row.get(2)?;
            let avg_retries: f64 = row.get(3)?;
            let max_retries: i64 = row.get(4)?;
            Ok(FailureSummary {
                spider_name: row.get(0)?,
                status_type: row.get(1)?,
                failed_count: failed_count.max(0) as u64,
                avg_retries,
                max_retries: max_retries.clamp(0, u32::MAX as i64) as u32,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    // 最近活动
    let updated_since = |since: DateTime<Utc>| -> rusqlite::Result<u64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM crawl_status WHERE last_update >= ?1",
            params![since.timestamp()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    };
    let updated_last_hour = updated_since(now - ChronoDuration::hours(1))?;
    let updated_last_day = updated_since(now - ChronoDuration::days(1))?;

    // 完成进度
    let mut stmt = conn.prepare(
        r#"
        SELECT spider_name, status_type,
               SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
               COUNT(*)
        FROM crawl_status
        GROUP BY spider_name, status_type
        ORDER BY spider_name, status_type
        "#,
    )?;
    let progress = stmt
        .query_map([], |row| {
            let completed: i64 = row.get(2)?;
            let total: i64 = row.get(3)?;
            Ok(PageProgress {
                spider_name: row.get(0)?,
                status_type: row.get(1)?,
                completed: completed.max(0) as u64,
                total: total.max(0) as u64,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let recent_failed = query_recent_failed(conn, recent_failed_limit)?;

    Ok(CrawlReport {
        generated_at: now,
        total_records: total_records.max(0) as u64,
        status_counts,
        failures,
        updated_last_hour,
        updated_last_day,
        progress,
        recent_failed,
    })
}

fn query_recent_failed(conn: &mut Connection, limit: usize) -> rusqlite::Result<Vec<StatusRecord>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT spider_name, status_type, identifier, status, retry_count, last_update
        FROM crawl_status
        WHERE status = 'failed'
        ORDER BY last_update DESC, id DESC
        LIMIT ?1
        "#,
    )?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let records = stmt
        .query_map(params![limit], |row| {
            let status: String = row.get(3)?;
            let retry_count: i64 = row.get(4)?;
            let last_update: i64 = row.get(5)?;
            Ok(StatusRecord {
                key: StatusKey::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ),
                status: TaskStatus::from_db(&status),
                retry_count: retry_count.clamp(0, u32::MAX as i64) as u32,
                last_update: Utc
                    .timestamp_opt(last_update, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records)
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "待处理",
        TaskStatus::Processing => "处理中",
        TaskStatus::Completed => "已完成",
        TaskStatus::Failed => "已失败",
    }
}

impl fmt::Display for CrawlReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "爬虫统计报告 ({})", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "状态记录总数: {}", self.total_records)?;

        writeln!(f, "\n爬取状态统计:")?;
        let mut current_spider: Option<&str> = None;
        for entry in &self.status_counts {
            if current_spider != Some(entry.spider_name.as_str()) {
                writeln!(f, "  {}:", entry.spider_name)?;
                current_spider = Some(entry.spider_name.as_str());
            }
            writeln!(f, "    {}: {}", status_label(entry.status), entry.count)?;
        }
        if self.status_counts.is_empty() {
            writeln!(f, "  暂无记录")?;
        }

        writeln!(f, "\n失败和重试统计:")?;
        if self.failures.is_empty() {
            writeln!(f, "  暂无失败记录")?;
        }
        for failure in &self.failures {
            writeln!(f, "  {} - {}:", failure.spider_name, failure.status_type)?;
            writeln!(f, "    失败次数: {}", failure.failed_count)?;
            writeln!(f, "    平均重试: {:.1} 次", failure.avg_retries)?;
            writeln!(f, "    最大重试: {} 次", failure.max_retries)?;
        }

        writeln!(f, "\n最近活动统计:")?;
        writeln!(f, "  最近1小时更新: {} 条", self.updated_last_hour)?;
        writeln!(f, "  最近24小时更新: {} 条", self.updated_last_day)?;

        writeln!(f, "\n爬取进度:")?;
        for entry in &self.progress {
            writeln!(
                f,
                "  {} / {}: {:.1}% ({}/{})",
                entry.spider_name,
                entry.status_type,
                entry.percent(),
                entry.completed,
                entry.total
            )?;
        }

        writeln!(f, "\n失败项目详情 (最近{}条):", self.recent_failed.len())?;
        writeln!(f, "{}", "-".repeat(60))?;
        if self.recent_failed.is_empty() {
            writeln!(f, "  无失败项目")?;
        }
        for record in &self.recent_failed {
            writeln!(
                f,
                "  {} | {} | {} | 重试{}次 | {}",
                record.key.spider_name,
                record.key.status_type,
                record.key.identifier,
                record.retry_count,
                record.last_update.format("%Y-%m-%d %H:%M:%S")
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ledger::StatusLedger;
    use crate::progress::types::RetryUpdate;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_ledger(temp_dir: &TempDir) -> SqliteLedger {
        SqliteLedger::new(&temp_dir.path().join("status.db"), Duration::from_secs(1))
    }

    #[test]
    fn test_page_progress_percent() {
        let progress = PageProgress {
            spider_name: "novel_list".to_string(),
            status_type: "list_page".to_string(),
            completed: 1,
            total: 4,
        };
        assert!((progress.percent() - 25.0).abs() < f64::EPSILON);

        let empty = PageProgress { total: 0, completed: 0, ..progress };
        assert_eq!(empty.percent(), 0.0);
    }

    #[tokio::test]
    async fn test_empty_report() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = create_ledger(&temp_dir);

        let report = ledger.report(10).await.unwrap();
        assert_eq!(report.total_records, 0);
        assert!(report.status_counts.is_empty());
        assert!(report.recent_failed.is_empty());

        let text = report.to_string();
        assert!(text.contains("暂无失败记录"));
        assert!(text.contains("无失败项目"));
    }

    #[tokio::test]
    async fn test_report_aggregates() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = create_ledger(&temp_dir);

        let page_1 = StatusKey::new("novel_list", "list_page", "1");
        let page_2 = StatusKey::new("novel_list", "list_page", "2");
        let book = StatusKey::new("novel_detail", "detail_page", "100818");

        ledger.upsert(&page_1, TaskStatus::Completed, RetryUpdate::Preserve).await.unwrap();
        for _ in 0..3 {
            ledger.upsert(&page_2, TaskStatus::Failed, RetryUpdate::Preserve).await.unwrap();
        }
        ledger.upsert(&book, TaskStatus::Failed, RetryUpdate::Preserve).await.unwrap();

        let report = ledger.report(1).await.unwrap();
        assert_eq!(report.total_records, 3);
        assert_eq!(report.updated_last_hour, 3);
        assert_eq!(report.updated_last_day, 3);

        assert!(report.status_counts.contains(&StatusCount {
            spider_name: "novel_list".to_string(),
            status: TaskStatus::Failed,
            count: 1,
        }));

        let list_failures = report
            .failures
            .iter()
            .find(|f| f.spider_name == "novel_list")
            .unwrap();
        assert_eq!(list_failures.failed_count, 1);
        assert_eq!(list_failures.max_retries, 3);

        let list_progress = report
            .progress
            .iter()
            .find(|p| p.status_type == "list_page")
            .unwrap();
        assert_eq!((list_progress.completed, list_progress.total), (1, 2));

        assert_eq!(report.recent_failed.len(), 1);
        assert!(report.to_string().contains("novel_list / list_page: 50.0% (1/2)"));
    }

    #[tokio::test]
    async fn test_recent_failed_limit() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = create_ledger(&temp_dir);

        for id in 0..5 {
            let key = StatusKey::new("novel_detail", "detail_page", id.to_string());
            ledger.upsert(&key, TaskStatus::Failed, RetryUpdate::Preserve).await.unwrap();
        }
        let done = StatusKey::new("novel_detail", "detail_page", "99");
        ledger.upsert(&done, TaskStatus::Completed, RetryUpdate::Preserve).await.unwrap();

        let failed = ledger.recent_failed(3).await.unwrap();
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|r| r.status == TaskStatus::Failed));
        assert!(failed.iter().all(|r| r.retry_count == 1));
    }
}
