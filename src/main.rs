use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

mod admin;
mod config;
mod db;
mod error;
mod fetcher;
mod model;
mod naming;
mod nfo;
mod scheduler;
mod store;
mod subscriptions;
mod sync;
#[cfg(test)]
mod test_support;

use config::{Config, ConfigSource};
use model::{Millis, Subscription, TaskStatus, TimeRange};
use store::subscriptions::SubscriptionUpdate;
use store::tasks::TaskFilter;
use sync::downloader::{DownloadExecutor, DownloadOutcome};
use sync::progress::ProgressCache;
use sync::queue::DownloadQueue;

#[derive(Parser)]
#[command(
    name = "ddsyncd",
    version,
    about = "Follow creator accounts and keep their posts downloaded"
)]
struct Cli {
    /// Path to config file [default: ~/.config/ddsyncd/config.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and download queue in the foreground (for systemd)
    #[command(alias = "start")]
    Daemon,
    /// Sync one subscription now and wait for its downloads
    Sync {
        /// Subscription id or account id
        subscription: String,
        /// Return after the sync without waiting for downloads
        #[arg(long)]
        no_wait: bool,
    },
    /// Sync every enabled subscription once
    SyncAll {
        #[arg(long)]
        no_wait: bool,
    },
    /// Follow an account
    Subscribe {
        account_id: String,
        /// all, six-months or one-month
        #[arg(long, default_value = "one-month")]
        range: TimeRange,
        /// Only download posts with at least this many likes
        #[arg(long)]
        min_engagement: Option<i64>,
        /// Track posts without downloading them
        #[arg(long)]
        no_auto_download: bool,
    },
    /// Stop following an account
    Unsubscribe {
        subscription: String,
        /// Also delete the account's tasks
        #[arg(long)]
        delete_tasks: bool,
        /// Also delete downloaded files (implies --delete-tasks)
        #[arg(long)]
        delete_files: bool,
    },
    /// Change subscription settings
    Update {
        subscription: String,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        #[arg(long)]
        range: Option<TimeRange>,
        #[arg(long, conflicts_with = "no_min_engagement")]
        min_engagement: Option<i64>,
        /// Remove the engagement threshold
        #[arg(long)]
        no_min_engagement: bool,
        #[arg(long)]
        auto_download: Option<bool>,
        #[arg(long)]
        name: Option<String>,
    },
    /// List subscriptions
    List,
    /// Delete every task of a subscription
    Clear {
        subscription: String,
        #[arg(long)]
        delete_files: bool,
    },
    /// List download tasks
    Tasks {
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Substring of the author name
        #[arg(long)]
        author: Option<String>,
        /// Subscription id or account id
        #[arg(long)]
        subscription: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long)]
        json: bool,
    },
    /// Download one task in the foreground
    StartTask { task_id: String },
    /// Return a downloading task to pending
    StopTask { task_id: String },
    /// Delete a task and its files
    DeleteTask { task_id: String },
    /// Start every task in the given status
    Retry {
        #[arg(long, default_value = "failed")]
        status: TaskStatus,
    },
    /// Show sync history of a subscription
    History {
        subscription: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show recent scheduler runs
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a status summary
    Status,
    /// Write subscription settings to a JSON file
    Export { path: PathBuf },
    /// Read subscription settings from a JSON file
    Import {
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = subscriptions::ImportMode::Skip)]
        mode: subscriptions::ImportMode,
    },
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "ddsyncd=info",
        1 => "ddsyncd=debug",
        2 => "ddsyncd=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Check inotify watch limits on Linux and warn if they look too low.
fn check_inotify_limits() {
    let path = "/proc/sys/fs/inotify/max_user_watches";
    if let Ok(content) = std::fs::read_to_string(path)
        && let Ok(limit) = content.trim().parse::<u64>()
    {
        if limit < 65536 {
            tracing::warn!(
                max_user_watches = limit,
                "inotify watch limit is low, deletions in large download trees may go unnoticed. \
                 Increase with: echo 524288 | sudo tee {path}"
            );
        } else {
            tracing::debug!(max_user_watches = limit, "inotify watch limit OK");
        }
    }
}

/// Return tasks left `downloading` by a previous crash to `pending`.
async fn reset_stale_downloads(pool: &SqlitePool) -> Result<()> {
    let affected = store::tasks::reset_stale(pool).await?;
    if affected > 0 {
        tracing::warn!(
            count = affected,
            "returned stale downloading tasks to pending (from prior crash)"
        );
    }
    Ok(())
}

/// Whether this process runs as the long-lived daemon or a one-shot command.
/// Only the daemon treats `downloading` rows it finds at startup as crash
/// leftovers; a one-shot command may share the database with a live daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Daemon,
    OneShot,
}

/// Database, executor, queue and sync engine wired together.
struct Stack {
    pool: SqlitePool,
    executor: Arc<DownloadExecutor>,
    queue: Arc<DownloadQueue>,
    engine: Arc<sync::SyncEngine>,
    cancel: CancellationToken,
}

impl Stack {
    async fn build(source: &ConfigSource, cfg: &Config, role: Role) -> Result<Self> {
        let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
        if role == Role::Daemon {
            reset_stale_downloads(&pool).await?;
        }
        let executor = Arc::new(DownloadExecutor::new(
            pool.clone(),
            source.clone(),
            Arc::new(ProgressCache::default()),
        )?);
        let cancel = CancellationToken::new();
        let queue = DownloadQueue::spawn(
            executor.clone(),
            cfg.general.max_concurrent_downloads,
            cfg.general.dispatch_delay(),
            cancel.child_token(),
        );
        let fetcher = Arc::new(fetcher::ApiClient::new(&cfg.api)?);
        let engine = Arc::new(sync::SyncEngine::new(
            pool.clone(),
            fetcher,
            source.clone(),
            queue.clone(),
        ));
        Ok(Self {
            pool,
            executor,
            queue,
            engine,
            cancel,
        })
    }

    /// Wait for queued downloads unless interrupted, then wind down.
    async fn drain(self, wait: bool) {
        if wait && self.queue.outstanding() > 0 {
            println!("waiting for {} download(s)...", self.queue.outstanding());
            tokio::select! {
                _ = self.queue.wait_idle() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted, returning queued downloads to pending");
                }
            }
        }
        self.cancel.cancel();
        self.queue.shutdown().await;
        self.pool.close().await;
    }
}

async fn resolve_subscription(pool: &SqlitePool, key: &str) -> Result<Subscription> {
    if let Some(s) = store::subscriptions::get(pool, key).await? {
        return Ok(s);
    }
    store::subscriptions::get_by_account(pool, key)
        .await?
        .ok_or_else(|| error::Error::subscription_not_found(key).into())
}

fn fmt_time(millis: Option<Millis>) -> String {
    millis
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "never".into())
}

fn print_sync_result(name: &str, result: &sync::SyncResult) {
    println!(
        "{name}: fetched {}, filtered out {}, {} new, {} queued",
        result.fetched_count,
        result.filtered_count,
        result.new_task_count,
        result.queued.len()
    );
    if result.requeued_missing > 0 {
        println!("  {} missing file(s) queued again", result.requeued_missing);
    }
    if result.dangling > 0 {
        println!(
            "  {} completed task(s) lost their files and are no longer listed",
            result.dangling
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let source = ConfigSource::File(cli.config.clone());
    let cfg = source.load().context("Failed to load configuration")?;

    match cli.command {
        Command::Daemon => run_daemon(&source, cfg).await?,
        Command::Sync {
            subscription,
            no_wait,
        } => {
            let stack = Stack::build(&source, &cfg, Role::OneShot).await?;
            let sub = resolve_subscription(&stack.pool, &subscription).await?;
            let outcome = stack.engine.sync(&sub.id).await;
            if let Ok(result) = &outcome {
                print_sync_result(&sub.display_name, result);
            }
            stack.drain(!no_wait && outcome.is_ok()).await;
            outcome?;
        }
        Command::SyncAll { no_wait } => {
            let stack = Stack::build(&source, &cfg, Role::OneShot).await?;
            let runs = stack.engine.sync_all().await?;
            for run in &runs {
                match &run.result {
                    Ok(result) => print_sync_result(&run.subscription.display_name, result),
                    Err(e) => println!("{}: FAILED: {e}", run.subscription.display_name),
                }
            }
            if runs.is_empty() {
                println!("no enabled subscriptions");
            }
            stack.drain(!no_wait).await;
        }
        Command::Subscribe {
            account_id,
            range,
            min_engagement,
            no_auto_download,
        } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let client = fetcher::ApiClient::new(&cfg.api)?;
            let sub = subscriptions::subscribe(
                &pool,
                &client,
                &cfg,
                &subscriptions::NewSubscription {
                    account_id,
                    time_range: range,
                    min_engagement,
                    auto_download: !no_auto_download,
                },
            )
            .await?;
            println!("subscribed to {} ({})", sub.display_name, sub.id);
            pool.close().await;
        }
        Command::Unsubscribe {
            subscription,
            delete_tasks,
            delete_files,
        } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let sub = resolve_subscription(&pool, &subscription).await?;
            let report =
                subscriptions::unsubscribe(&pool, &cfg, &sub.id, delete_tasks, delete_files)
                    .await?;
            println!(
                "unsubscribed from {} ({} task(s), {} file(s) deleted)",
                sub.display_name, report.tasks_deleted, report.files_removed
            );
            pool.close().await;
        }
        Command::Update {
            subscription,
            enable,
            disable,
            range,
            min_engagement,
            no_min_engagement,
            auto_download,
            name,
        } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let sub = resolve_subscription(&pool, &subscription).await?;
            let update = SubscriptionUpdate {
                enabled: if enable {
                    Some(true)
                } else if disable {
                    Some(false)
                } else {
                    None
                },
                time_range: range,
                min_engagement: if no_min_engagement {
                    Some(None)
                } else {
                    min_engagement.map(Some)
                },
                auto_download,
                display_name: name,
            };
            let updated = subscriptions::update(&pool, &sub.id, &update).await?;
            println!(
                "{}: enabled={} range={} min_engagement={} auto_download={}",
                updated.display_name,
                updated.enabled,
                updated.time_range,
                updated
                    .min_engagement
                    .map_or_else(|| "-".to_string(), |m| m.to_string()),
                updated.auto_download
            );
            pool.close().await;
        }
        Command::List => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let overview = subscriptions::overview(&pool).await?;
            if overview.is_empty() {
                println!("no subscriptions");
            }
            for entry in overview {
                let s = &entry.subscription;
                println!(
                    "{} {} [{}] {}",
                    s.id,
                    s.display_name,
                    s.account_id,
                    if s.enabled { "enabled" } else { "disabled" }
                );
                println!(
                    "  range={} min_engagement={} auto_download={}",
                    s.time_range,
                    s.min_engagement
                        .map_or_else(|| "-".to_string(), |m| m.to_string()),
                    s.auto_download
                );
                println!(
                    "  last sync: {}  remote: {}  tracked: {}  downloaded: {}",
                    fmt_time(s.last_sync_time),
                    s.total_media_count,
                    entry.task_count,
                    s.downloaded_count
                );
            }
            pool.close().await;
        }
        Command::Clear {
            subscription,
            delete_files,
        } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let sub = resolve_subscription(&pool, &subscription).await?;
            let report =
                sync::cleanup::clear_subscription(&pool, &cfg, &sub.id, delete_files).await?;
            println!(
                "cleared {}: {} task(s), {} file(s), {} dir(s) removed",
                sub.display_name, report.tasks_deleted, report.files_removed, report.dirs_removed
            );
            pool.close().await;
        }
        Command::Tasks {
            status,
            author,
            subscription,
            limit,
            json,
        } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let account_id = match subscription {
                Some(key) => Some(resolve_subscription(&pool, &key).await?.account_id),
                None => None,
            };
            let filter = TaskFilter {
                status,
                account_id,
                author,
                limit: Some(limit),
            };
            // A separate process has no live transfers; the cache stays empty.
            let views = admin::list_tasks(&pool, &ProgressCache::default(), &filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                for view in &views {
                    let t = &view.task;
                    println!(
                        "{} {:<11} {:>3}% {} [{}] {}",
                        t.id,
                        t.status.as_str(),
                        t.progress,
                        t.author_name,
                        t.kind,
                        t.description
                    );
                    if let Some(error) = &t.error {
                        println!("  error: {error}");
                    }
                    if let Some(path) = &t.file_path {
                        println!("  {path} ({} bytes)", t.file_size);
                    }
                }
            }
            pool.close().await;
        }
        Command::StartTask { task_id } => {
            let stack = Stack::build(&source, &cfg, Role::OneShot).await?;
            let outcome = stack.executor.start(&task_id).await;
            match &outcome {
                Ok(DownloadOutcome::Completed {
                    file_path, files, ..
                }) => println!("downloaded {files} file(s) to {}", file_path.display()),
                Ok(DownloadOutcome::Stopped) => println!("download stopped"),
                Ok(DownloadOutcome::AlreadyActive) => println!("task is already downloading"),
                Err(_) => {}
            }
            stack.drain(false).await;
            outcome?;
        }
        Command::StopTask { task_id } => {
            let stack = Stack::build(&source, &cfg, Role::OneShot).await?;
            let stopped = stack.executor.stop(&task_id).await;
            stack.drain(false).await;
            if stopped? {
                println!("task {task_id} returned to pending");
            } else {
                println!("task {task_id} was not downloading");
            }
        }
        Command::DeleteTask { task_id } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let report = sync::cleanup::delete_task(&pool, &cfg, &task_id).await?;
            println!("deleted task {task_id} ({} file(s))", report.files_removed);
            pool.close().await;
        }
        Command::Retry { status } => {
            if status == TaskStatus::Downloading {
                anyhow::bail!("tasks that are already downloading cannot be started again");
            }
            let stack = Stack::build(&source, &cfg, Role::OneShot).await?;
            let queued = admin::retry_all(&stack.pool, stack.queue.as_ref(), status).await?;
            println!("queued {queued} {status} task(s)");
            stack.drain(true).await;
        }
        Command::History {
            subscription,
            limit,
        } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let sub = resolve_subscription(&pool, &subscription).await?;
            for entry in store::history::list(&pool, &sub.id, limit).await? {
                println!(
                    "{} {:<7} new={} downloaded={}{}",
                    fmt_time(Some(entry.sync_time)),
                    entry.status.as_str(),
                    entry.new_task_count,
                    entry.downloaded_count,
                    entry
                        .error
                        .map(|e| format!(" error: {e}"))
                        .unwrap_or_default()
                );
            }
            pool.close().await;
        }
        Command::Logs { limit } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            for log in store::schedule_logs::recent(&pool, limit).await? {
                println!(
                    "{} {:<7} {} ({} ms)",
                    fmt_time(Some(log.start_time)),
                    log.status.as_str(),
                    log.message,
                    log.end_time - log.start_time
                );
            }
            pool.close().await;
        }
        Command::Status => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            print_status(&pool, &cfg).await?;
            pool.close().await;
        }
        Command::Export { path } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let count = subscriptions::export_subscriptions(&pool, &path).await?;
            println!("exported {count} subscription(s) to {}", path.display());
            pool.close().await;
        }
        Command::Import { path, mode } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let report = subscriptions::import_subscriptions(&pool, &path, mode).await?;
            println!(
                "imported: {} added, {} updated, {} skipped",
                report.added, report.updated, report.skipped
            );
            pool.close().await;
        }
    }

    Ok(())
}

async fn run_daemon(source: &ConfigSource, cfg: Config) -> Result<()> {
    let stack = Stack::build(source, &cfg, Role::Daemon).await?;

    let scheduler = scheduler::Scheduler::new(stack.engine.clone(), stack.pool.clone());

    let _watcher_handle = if cfg.general.watch_deletions {
        check_inotify_limits();
        let (removals, handle) = sync::watcher::start_deletion_watcher(
            &cfg.download.download_dir,
            cfg.general.watch_debounce_ms,
        )?;
        tokio::spawn(sync::watcher::run(
            stack.pool.clone(),
            removals,
            std::time::Duration::from_secs(cfg.general.deletion_check_interval_secs),
            stack.cancel.child_token(),
        ));
        Some(handle)
    } else {
        None
    };

    tracing::info!("ddsyncd daemon ready, running initial sync");
    if let Err(e) = scheduler.run_now().await {
        tracing::error!(error = %e, "initial sync failed");
    }
    scheduler.start(cfg.general.sync_interval());

    // SIGTERM handling (for systemd graceful stop); SIGHUP re-reads the interval
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    let mut housekeeping = tokio::time::interval(std::time::Duration::from_secs(30));
    housekeeping.tick().await; // consume the initial instant tick

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }

            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }

            _ = sighup.recv() => {
                match source.load() {
                    Ok(fresh) => {
                        let interval = fresh.general.sync_interval();
                        tracing::info!(
                            previous_secs = scheduler.interval().map(|d| d.as_secs()),
                            interval_secs = interval.as_secs(),
                            "received SIGHUP, restarting scheduler"
                        );
                        scheduler.restart(interval).await;
                    }
                    Err(e) => tracing::error!(error = %e, "config reload failed, keeping current schedule"),
                }
            }

            _ = housekeeping.tick() => {
                let live = stack.executor.progress().purge_expired();
                tracing::trace!(
                    live,
                    queued = stack.queue.outstanding(),
                    scheduler_running = scheduler.is_running(),
                    "housekeeping"
                );
            }
        }
    }

    scheduler.stop().await;
    tracing::info!("stopping download queue");
    stack.drain(false).await;
    tracing::info!("ddsyncd stopped");
    Ok(())
}

/// Print a status summary.
async fn print_status(pool: &SqlitePool, cfg: &Config) -> Result<()> {
    let summary = admin::status_summary(pool).await?;

    println!("ddsyncd status");
    println!("==============");
    println!(
        "Subscriptions: {} ({} enabled)",
        summary.subscriptions, summary.enabled_subscriptions
    );
    println!("Last sync:     {}", fmt_time(summary.last_sync_time));
    println!("Last schedule: {}", fmt_time(summary.last_schedule_run));
    println!("Download dir:  {}", cfg.download.download_dir.display());
    println!();
    if summary.tasks_by_status.is_empty() {
        println!("No tasks yet.");
    }
    for (status, count) in &summary.tasks_by_status {
        println!("  {:<11} {count}", status.as_str());
    }
    Ok(())
}
