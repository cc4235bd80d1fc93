use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use sqlx::SqlitePool;
use tokio::io::AsyncWriteExt;

use super::progress::{ProgressCache, ProgressSnapshot};
use crate::config::{Config, ConfigSource};
use crate::error::{Error, Result};
use crate::model::{DownloadTask, MediaKind, TaskStatus, now_millis};
use crate::naming::{self, TargetLayout, VIDEO_EXTENSION};
use crate::nfo;
use crate::store::{subscriptions, tasks};

const COVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed {
        file_path: PathBuf,
        file_size: u64,
        files: usize,
    },
    /// The task left `downloading` while the transfer ran.
    Stopped,
    /// `start` found the task already downloading; nothing was done.
    AlreadyActive,
}

/// What a finished transfer produced on disk.
struct Transferred {
    file_path: PathBuf,
    file_size: u64,
    files: usize,
    image_prefix: Option<PathBuf>,
}

/// Performs transfers for single tasks and keeps their progress current.
pub struct DownloadExecutor {
    pool: SqlitePool,
    http: reqwest::Client,
    config: ConfigSource,
    progress: Arc<ProgressCache>,
}

impl DownloadExecutor {
    pub fn new(pool: SqlitePool, config: ConfigSource, progress: Arc<ProgressCache>) -> Result<Self> {
        let timeout = config.load()?.api.timeout_secs;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            pool,
            http,
            config,
            progress,
        })
    }

    pub fn progress(&self) -> &Arc<ProgressCache> {
        &self.progress
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Download trigger: claim the task, then run it. A task that is already
    /// downloading is left alone.
    pub async fn start(&self, task_id: &str) -> Result<DownloadOutcome> {
        tasks::require(&self.pool, task_id).await?;
        if !tasks::claim(&self.pool, task_id).await? {
            tracing::debug!(task_id, "task already downloading");
            return Ok(DownloadOutcome::AlreadyActive);
        }
        self.execute_claimed(task_id).await
    }

    /// `downloading → pending`. Returns `false` if the task was not downloading.
    /// A transfer still in flight notices at its next progress write.
    pub async fn stop(&self, task_id: &str) -> Result<bool> {
        tasks::require(&self.pool, task_id).await?;
        let stopped = tasks::stop(&self.pool, task_id).await?;
        self.progress.remove(task_id);
        if stopped {
            tracing::info!(task_id, "download stopped");
        }
        Ok(stopped)
    }

    /// Run the transfer for a task the caller already moved to `downloading`.
    pub async fn execute_claimed(&self, task_id: &str) -> Result<DownloadOutcome> {
        let task = tasks::require(&self.pool, task_id).await?;
        if task.status != TaskStatus::Downloading {
            tracing::debug!(task_id, status = %task.status, "task no longer claimed, skipping");
            return Ok(DownloadOutcome::Stopped);
        }

        match self.run(&task).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => {
                self.progress.remove(task_id);
                tracing::info!(task_id, "transfer abandoned after stop");
                Ok(DownloadOutcome::Stopped)
            }
            Err(e) => {
                self.progress.remove(task_id);
                let message = e.to_string();
                if tasks::fail(&self.pool, task_id, &message).await? {
                    tracing::error!(task_id, media_id = %task.media_id, error = %message, "download failed");
                }
                Err(e)
            }
        }
    }

    /// Settings are read fresh for every execution.
    async fn run(&self, task: &DownloadTask) -> Result<Option<DownloadOutcome>> {
        let cfg = self.config.load()?;
        match self.transfer(task, &cfg).await? {
            Some(done) => self.finish(task, done, &cfg).await.map(Some),
            None => Ok(None),
        }
    }

    async fn finish(
        &self,
        task: &DownloadTask,
        done: Transferred,
        cfg: &Config,
    ) -> Result<DownloadOutcome> {
        self.progress.remove(&task.id);
        let file_path = done.file_path.to_string_lossy().into_owned();
        let prefix = done
            .image_prefix
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        let recorded = tasks::complete(
            &self.pool,
            &task.id,
            &file_path,
            done.file_size as i64,
            prefix.as_deref(),
        )
        .await?;
        if !recorded {
            tracing::info!(task_id = %task.id, "task stopped before completion was recorded");
            return Ok(DownloadOutcome::Stopped);
        }

        subscriptions::refresh_downloaded_count(&self.pool, &task.account_id).await?;
        tracing::info!(
            task_id = %task.id,
            media_id = %task.media_id,
            path = %done.file_path.display(),
            bytes = done.file_size,
            files = done.files,
            "download complete"
        );

        if task.kind == MediaKind::Video {
            self.write_sidecars(task, &done.file_path, cfg).await;
        }

        Ok(DownloadOutcome::Completed {
            file_path: done.file_path,
            file_size: done.file_size,
            files: done.files,
        })
    }

    /// `Ok(None)` when the task was stopped mid-transfer.
    async fn transfer(&self, task: &DownloadTask, cfg: &Config) -> Result<Option<Transferred>> {
        let layout = naming::resolve_layout(&cfg.download.download_dir, &cfg.download, task);
        tokio::fs::create_dir_all(&layout.dir)
            .await
            .map_err(|e| io_error(&layout.dir, e))?;

        let mut reporter = ProgressReporter {
            pool: &self.pool,
            cache: &self.progress,
            task_id: &task.id,
            interval: Duration::from_millis(cfg.download.progress_interval_ms),
            started: Instant::now(),
            last_persist: None,
            last_percent: -1,
        };

        match task.kind {
            MediaKind::Video => self.transfer_video(task, &layout, &mut reporter).await,
            MediaKind::ImageSet => self.transfer_images(task, &layout, &mut reporter).await,
        }
    }

    async fn transfer_video(
        &self,
        task: &DownloadTask,
        layout: &TargetLayout,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<Option<Transferred>> {
        let url = if task.primary_download_url.is_empty() {
            task.all_download_urls.first().cloned().unwrap_or_default()
        } else {
            task.primary_download_url.clone()
        };
        if url.is_empty() {
            return Err(Error::Transfer("task has no download URL".into()));
        }

        let dest = layout.file(VIDEO_EXTENSION);
        tracing::debug!(task_id = %task.id, path = %dest.display(), "downloading video");
        let Some(size) = self.stream_to_file(&url, &dest, Some(reporter)).await? else {
            return Ok(None);
        };

        Ok(Some(Transferred {
            file_path: dest,
            file_size: size,
            files: 1,
            image_prefix: None,
        }))
    }

    async fn transfer_images(
        &self,
        task: &DownloadTask,
        layout: &TargetLayout,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<Option<Transferred>> {
        let urls = &task.all_download_urls;
        if urls.is_empty() {
            return Err(Error::Transfer("image set has no download URLs".into()));
        }

        let total = urls.len();
        let mut first = None;
        let mut size = 0u64;
        for (i, url) in urls.iter().enumerate() {
            let dest = layout.indexed_file(i + 1, &naming::image_extension(url));
            tracing::debug!(task_id = %task.id, index = i + 1, total, "downloading image");
            let Some(bytes) = self.stream_to_file(url, &dest, None).await? else {
                return Ok(None);
            };
            size += bytes;
            first.get_or_insert(dest);

            let percent = ((i + 1) * 100 / total) as i64;
            if !reporter.persist(percent, size, None).await? {
                return Ok(None);
            }
        }

        Ok(first.map(|file_path| Transferred {
            file_path,
            file_size: size,
            files: total,
            image_prefix: Some(layout.prefix()),
        }))
    }

    /// Stream `url` into `{dest}.part`, then rename into place. Partial files
    /// stay behind on failure. `Ok(None)` when the reporter saw a stop.
    async fn stream_to_file(
        &self,
        url: &str,
        dest: &Path,
        mut reporter: Option<&mut ProgressReporter<'_>>,
    ) -> Result<Option<u64>> {
        let resp = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?;
        let total = resp.content_length();

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| io_error(&part, e))?;

        let mut stream = resp.bytes_stream();
        let mut downloaded = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(|e| io_error(&part, e))?;
            downloaded += chunk.len() as u64;

            if let Some(r) = reporter.as_deref_mut()
                && !r.report(downloaded, total).await?
            {
                return Ok(None);
            }
        }
        file.flush().await.map_err(|e| io_error(&part, e))?;
        drop(file);

        tokio::fs::rename(&part, dest)
            .await
            .map_err(|e| io_error(dest, e))?;
        Ok(Some(downloaded))
    }

    /// NFO document and cover copies next to the video. Failures are logged only.
    async fn write_sidecars(&self, task: &DownloadTask, video: &Path, cfg: &Config) {
        if let Some(doc) = nfo::render(task, cfg.download.nfo_format) {
            let path = nfo::sidecar_path(video);
            match tokio::fs::write(&path, doc).await {
                Ok(()) => tracing::debug!(path = %path.display(), "wrote nfo"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to write nfo"),
            }
        }

        if !cfg.download.cover_images || task.cover_url.is_empty() {
            return;
        }
        let cover = match self.fetch_cover(&task.cover_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "failed to fetch cover");
                return;
            }
        };
        for path in nfo::artwork_paths(video) {
            if let Err(e) = tokio::fs::write(&path, &cover).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to write cover");
            }
        }
    }

    async fn fetch_cover(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .timeout(COVER_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn io_error(path: &Path, e: std::io::Error) -> Error {
    Error::Transfer(format!("{}: {e}", path.display()))
}

/// Mirrors progress into the cache on every chunk and into the store at
/// coarse intervals.
struct ProgressReporter<'a> {
    pool: &'a SqlitePool,
    cache: &'a ProgressCache,
    task_id: &'a str,
    interval: Duration,
    started: Instant,
    last_persist: Option<Instant>,
    last_percent: i64,
}

impl ProgressReporter<'_> {
    /// Returns `false` once the task is no longer `downloading`.
    async fn report(&mut self, downloaded: u64, total: Option<u64>) -> Result<bool> {
        let percent = match total {
            Some(t) if t > 0 => ((downloaded.min(t) * 100) / t) as i64,
            _ => 0,
        };
        self.cache_snapshot(percent, downloaded, total);

        let due = match self.last_persist {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        };
        // Interval writes happen even at an unchanged percentage (no
        // Content-Length), since each write is also the stop check.
        let finished = percent == 100 && self.last_percent != 100;
        if due || finished {
            return self.write(percent).await;
        }
        Ok(true)
    }

    /// Unconditional persisted update, used between image-set members.
    async fn persist(&mut self, percent: i64, downloaded: u64, total: Option<u64>) -> Result<bool> {
        self.cache_snapshot(percent, downloaded, total);
        self.write(percent).await
    }

    async fn write(&mut self, percent: i64) -> Result<bool> {
        self.last_persist = Some(Instant::now());
        self.last_percent = percent;
        let active = tasks::update_progress(self.pool, self.task_id, percent).await?;
        if !active {
            self.cache.remove(self.task_id);
        }
        Ok(active)
    }

    fn cache_snapshot(&self, percent: i64, downloaded: u64, total: Option<u64>) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.0 {
            (downloaded as f64 / elapsed) as u64
        } else {
            0
        };
        self.cache.put(
            self.task_id,
            ProgressSnapshot {
                progress: percent,
                downloaded_bytes: downloaded,
                total_bytes: total,
                speed_bps,
                updated_at: now_millis(),
            },
        );
    }
}
