//! Background execution of a single download job.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    fetcher::{DownloadRequest, MediaFetcher, ProgressEvent},
    jobs::{JobId, JobRegistry},
    naming,
    quality::Quality,
};

const PROGRESS_CHANNEL_CAPACITY: usize = 64;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a job task needs, shared by all jobs.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<JobRegistry>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub download_dir: PathBuf,
    pub download_timeout: Duration,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
}

impl WorkerContext {
    pub fn job_dir(&self, id: JobId) -> PathBuf {
        self.download_dir.join(id.to_string())
    }
}

/// Spawns the background task for a freshly created job. The task is tracked
/// so shutdown can wait for it.
pub fn spawn_download(ctx: WorkerContext, id: JobId, url: String, quality: Quality) {
    let tracker = ctx.tracker.clone();
    tracker.spawn(async move {
        run_download(ctx, id, url, quality).await;
    });
}

pub async fn run_download(ctx: WorkerContext, id: JobId, url: String, quality: Quality) {
    ctx.registry.mark_downloading(id);
    let job_dir = ctx.job_dir(id);

    let download = fetch(&ctx, id, &url, quality, &job_dir);
    let outcome = tokio::select! {
        result = tokio::time::timeout(ctx.download_timeout, download) => {
            match result {
                Ok(inner) => inner,
                Err(_) => Err(anyhow::anyhow!(
                    "download timed out after {}s",
                    ctx.download_timeout.as_secs()
                )),
            }
        }
        _ = ctx.shutdown.cancelled() => Err(anyhow::anyhow!("server shutting down")),
    };

    match outcome {
        Ok(file) => {
            info!(job_id = %id, file = %file.display(), "download completed");
            ctx.registry.complete(id, file);
        }
        Err(err) => {
            warn!(job_id = %id, %url, error = %format!("{err:#}"), "download failed");
            ctx.registry.fail(id, format!("{err:#}"));
            remove_job_dir(&job_dir).await;
        }
    }
}

async fn fetch(
    ctx: &WorkerContext,
    id: JobId,
    url: &str,
    quality: Quality,
    job_dir: &Path,
) -> Result<PathBuf> {
    let probe = ctx.fetcher.probe(url).await.context("reading media metadata")?;
    let file_stem = naming::file_stem(&probe.title);
    debug!(job_id = %id, title = %probe.title, stem = %file_stem, "probed media");

    tokio::fs::create_dir_all(job_dir)
        .await
        .with_context(|| format!("creating {}", job_dir.display()))?;

    let request = DownloadRequest {
        url: url.to_string(),
        quality,
        output_dir: job_dir.to_path_buf(),
        file_stem,
    };

    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(PROGRESS_CHANNEL_CAPACITY);
    let registry = ctx.registry.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(percent) = event.percent() {
                registry.record_progress(id, percent);
            }
        }
    });

    let result = ctx.fetcher.download(&request, tx).await;
    // The sender is gone once download returns; drain what is left so the
    // final percent lands before completion.
    forwarder.await.context("forwarding progress")?;
    let file = result.context("downloading media")?;

    if !file.starts_with(job_dir) {
        bail!("downloader wrote {} outside the job directory", file.display());
    }
    Ok(file)
}

pub async fn remove_job_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "removed job directory"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "failed to remove job directory")
        }
    }
}

/// Periodically drops settled jobs older than `retention` from the registry
/// and deletes whatever they left on disk. Stops on shutdown.
pub fn spawn_sweeper(ctx: WorkerContext, retention: Duration) {
    let tracker = ctx.tracker.clone();
    tracker.spawn(async move {
        let period = SWEEP_INTERVAL.min(retention.max(Duration::from_secs(1)));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.shutdown.cancelled() => break,
            }
            sweep_settled(&ctx, retention).await;
        }
    });
}

pub async fn sweep_settled(ctx: &WorkerContext, retention: Duration) -> usize {
    let pruned = ctx.registry.prune_settled(retention);
    for id in &pruned {
        remove_job_dir(&ctx.job_dir(*id)).await;
    }
    if !pruned.is_empty() {
        debug!(count = pruned.len(), "pruned settled jobs");
    }
    pruned.len()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        fetcher::MediaProbe,
        jobs::{FAILED_PERCENT, JobStatus},
    };
    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    /// In-process fetcher that writes a small file and reports fixed progress.
    /// With `gate` set, it parks after the first progress event until the
    /// gate is notified.
    pub(crate) struct FakeFetcher {
        pub title: String,
        pub fail_probe: bool,
        pub hang: bool,
        pub gate: Option<Arc<Notify>>,
    }

    impl FakeFetcher {
        pub(crate) fn ok(title: &str) -> Self {
            Self {
                title: title.into(),
                fail_probe: false,
                hang: false,
                gate: None,
            }
        }
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn probe(&self, _url: &str) -> Result<MediaProbe> {
            if self.fail_probe {
                bail!("ERROR: Unsupported URL");
            }
            Ok(MediaProbe {
                title: self.title.clone(),
            })
        }

        async fn download(
            &self,
            request: &DownloadRequest,
            progress: mpsc::Sender<ProgressEvent>,
        ) -> Result<PathBuf> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let ext = if request.quality.is_audio_only() { "mp3" } else { "mp4" };
            let path = request
                .output_dir
                .join(format!("{}.{}", request.file_stem, ext));
            for downloaded in [25, 50, 100] {
                let _ = progress
                    .send(ProgressEvent {
                        downloaded_bytes: downloaded,
                        total_bytes: Some(100),
                        ..ProgressEvent::default()
                    })
                    .await;
                if downloaded == 25 {
                    if let Some(gate) = &self.gate {
                        gate.notified().await;
                    }
                }
            }
            tokio::fs::write(&path, b"media bytes").await?;
            Ok(path)
        }
    }

    pub(crate) fn context(fetcher: FakeFetcher, download_dir: PathBuf) -> WorkerContext {
        WorkerContext {
            registry: Arc::new(JobRegistry::new()),
            fetcher: Arc::new(fetcher),
            download_dir,
            download_timeout: Duration::from_secs(30),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn successful_job_records_file() {
        let dir = tempdir().unwrap();
        let ctx = context(FakeFetcher::ok("My: Clip"), dir.path().to_path_buf());
        let id = ctx.registry.create();

        run_download(ctx.clone(), id, "https://example.com/v".into(), Quality::Audio).await;

        let snapshot = ctx.registry.snapshot(id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Finished);
        assert_eq!(snapshot.reported_percent(), 100);
        let file = snapshot.file.unwrap();
        assert_eq!(file, ctx.job_dir(id).join("My Clip.mp3"));
        assert!(file.exists());
    }

    #[tokio::test]
    async fn probe_failure_marks_job_failed_and_cleans_up() {
        let dir = tempdir().unwrap();
        let fetcher = FakeFetcher {
            fail_probe: true,
            ..FakeFetcher::ok("x")
        };
        let ctx = context(fetcher, dir.path().to_path_buf());
        let id = ctx.registry.create();

        run_download(ctx.clone(), id, "https://example.com/v".into(), Quality::Best).await;

        let snapshot = ctx.registry.snapshot(id).unwrap();
        assert_eq!(snapshot.reported_percent(), FAILED_PERCENT);
        assert!(snapshot.error.unwrap().contains("Unsupported URL"));
        assert!(!ctx.job_dir(id).exists());
    }

    #[tokio::test]
    async fn shutdown_cancels_running_jobs() {
        let dir = tempdir().unwrap();
        let fetcher = FakeFetcher {
            hang: true,
            ..FakeFetcher::ok("x")
        };
        let ctx = context(fetcher, dir.path().to_path_buf());
        let id = ctx.registry.create();

        spawn_download(ctx.clone(), id, "https://example.com/v".into(), Quality::Best);
        ctx.shutdown.cancel();
        ctx.tracker.close();
        ctx.tracker.wait().await;

        let snapshot = ctx.registry.snapshot(id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.error.unwrap().contains("shutting down"));
    }

    #[tokio::test]
    async fn timeout_fails_job() {
        let dir = tempdir().unwrap();
        let fetcher = FakeFetcher {
            hang: true,
            ..FakeFetcher::ok("x")
        };
        let mut ctx = context(fetcher, dir.path().to_path_buf());
        ctx.download_timeout = Duration::from_millis(50);
        let id = ctx.registry.create();

        run_download(ctx.clone(), id, "https://example.com/v".into(), Quality::Best).await;

        let snapshot = ctx.registry.snapshot(id).unwrap();
        assert!(snapshot.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn sweep_prunes_settled_jobs_and_their_files() {
        let dir = tempdir().unwrap();
        let ctx = context(FakeFetcher::ok("Clip"), dir.path().to_path_buf());
        let done = ctx.registry.create();
        run_download(ctx.clone(), done, "https://example.com/v".into(), Quality::Best).await;
        let running = ctx.registry.create();
        assert!(ctx.job_dir(done).exists());

        assert_eq!(sweep_settled(&ctx, Duration::from_secs(3600)).await, 0);
        assert_eq!(sweep_settled(&ctx, Duration::ZERO).await, 1);

        assert!(ctx.registry.snapshot(done).is_none());
        assert!(!ctx.job_dir(done).exists());
        assert!(ctx.registry.snapshot(running).is_some());
    }
}
