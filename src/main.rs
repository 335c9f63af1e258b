use anyhow::{bail, Context, Result};
use crawl_progress::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging,
    progress::{
        derive_key, reset, ProgressTracker, RedisStatusCache, RemoteStatusCache, ResetPlan,
        SqliteLedger, StatusKey,
    },
};
use tracing::info;

/// 默认显示的最近失败记录条数
const DEFAULT_FAILED_LIMIT: usize = 10;

/// `remote` 默认抽查的缓存键 (spider, page_type, identifier)
const REMOTE_SPOT_CHECK: [(&str, &str, &str); 3] = [
    ("novel_list", "list_page", "1"),
    ("novel_detail", "detail_page", "100818"),
    ("novel_comment", "comment_page", "100007_1"),
];

const USAGE: &str = "\
用法: crawl-progress [命令]

命令:
  stats                                    台账统计报告（默认）
  failed [N]                               最近 N 条失败记录（默认 10）
  check <spider> <url>                     推导状态键并给出跳过判定（只读）
  remote                                   检查 Redis 缓存的键分布（只读）
  reset [--ledger] [--remote] [--local] [--yes]
                                           清理进度数据，未加 --yes 时只演练";

/// 子命令
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Stats,
    Failed(usize),
    Check { spider: String, url: String },
    Remote,
    Reset { plan: ResetPlan, confirmed: bool },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some((name, rest)) = args.split_first() else {
        return Ok(Command::Stats);
    };

    match name.as_str() {
        "stats" => Ok(Command::Stats),
        "failed" => {
            let limit = match rest.first() {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("Invalid record count: {}", raw))?,
                None => DEFAULT_FAILED_LIMIT,
            };
            Ok(Command::Failed(limit))
        }
        "check" => match rest {
            [spider, url] => Ok(Command::Check {
                spider: spider.clone(),
                url: url.clone(),
            }),
            _ => bail!("check 需要两个参数: <spider> <url>"),
        },
        "remote" => Ok(Command::Remote),
        "reset" => {
            let mut plan = ResetPlan::default();
            let mut confirmed = false;
            for flag in rest {
                match flag.as_str() {
                    "--ledger" => plan.ledger = true,
                    "--remote" => plan.remote = true,
                    "--local" => plan.local = true,
                    "--all" => plan = ResetPlan::all(),
                    "--yes" => confirmed = true,
                    other => bail!("未知参数: {}", other),
                }
            }
            if plan.is_empty() {
                bail!("reset 至少需要 --ledger / --remote / --local 之一");
            }
            Ok(Command::Reset { plan, confirmed })
        }
        "help" | "-h" | "--help" => Ok(Command::Help),
        other => bail!("未知命令: {}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = AppConfig::load_or_default(DEFAULT_CONFIG_PATH)
        .await
        .context("Failed to load config")?;

    // 日志守卫需要保持存活到程序结束
    let _log_guard = logging::init_logging(&config.log);

    info!("crawl-progress v{}", env!("CARGO_PKG_VERSION"));

    match command {
        Command::Stats => {
            let ledger = SqliteLedger::new(&config.ledger.db_path, config.ledger.busy_timeout());
            let report = ledger
                .report(DEFAULT_FAILED_LIMIT)
                .await
                .context("Failed to build report")?;
            println!("{}", report);
        }
        Command::Failed(limit) => {
            let ledger = SqliteLedger::new(&config.ledger.db_path, config.ledger.busy_timeout());
            let records = ledger
                .recent_failed(limit)
                .await
                .context("Failed to query failed records")?;
            if records.is_empty() {
                println!("无失败项目");
            }
            for record in records {
                println!(
                    "{} | 重试{}次 | {}",
                    record.key,
                    record.retry_count,
                    record.last_update.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Check { spider, url } => {
            let Some(key) = derive_key(&spider, &url) else {
                println!("无法推导状态键，任务总会执行: {} {}", spider, url);
                return Ok(());
            };

            let tracker = ProgressTracker::open_read_only(&config).await;
            let skip = tracker.should_skip_key(&key).await;
            let status = tracker.status(&key).await;

            println!("状态键: {}", key.cache_key());
            match status {
                Some((status, retry_count)) => {
                    println!("台账状态: {} (重试 {} 次)", status, retry_count)
                }
                None => println!("台账状态: 不可用"),
            }
            println!("判定: {}", if skip { "跳过" } else { "执行" });

            tracker.close().await;
        }
        Command::Remote => {
            let cache = RedisStatusCache::connect(
                &config.redis.url,
                config.redis.ttl(),
                config.redis.connect_timeout(),
            )
            .await
            .context("Failed to connect to Redis")?;
            let spot_check: Vec<StatusKey> = REMOTE_SPOT_CHECK
                .iter()
                .map(|(spider, page_type, identifier)| StatusKey::new(*spider, *page_type, *identifier))
                .collect();
            let report = cache
                .inspect(&spot_check)
                .await
                .context("Failed to inspect Redis cache")?;
            println!("{}", report);
            cache.close().await;
        }
        Command::Reset { plan, confirmed } => {
            let summary = reset(&config, plan, confirmed).await?;

            println!("将执行以下操作:");
            for action in &summary.actions {
                println!("- {}", action);
            }
            if !summary.executed {
                println!("\n未提供 --yes，已模拟展示。若要执行，请追加 --yes");
                return Ok(());
            }
            if let Some(rows) = summary.ledger_rows {
                println!("[OK] 已清空状态台账: {} 条记录", rows);
            }
            if let Some(keys) = summary.remote_keys {
                println!("[OK] 已删除 Redis 键: {} 个", keys);
            }
            if let Some(removed) = summary.local_removed {
                println!(
                    "[OK] 本地状态文件{}",
                    if removed { "已删除" } else { "不存在，无需清理" }
                );
            }
        }
        Command::Help => {}
    }

    Ok(())
}
