//! [`MediaFetcher`] backed by the `yt-dlp` command-line tool.
//!
//! Each job runs two child processes: a metadata probe (`--dump-single-json`)
//! that yields the title used for the output filename, and the actual
//! download. The download prints machine-readable progress lines through
//! `--progress-template` and the final file path through `--print`, which we
//! read back line by line while the process runs.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::SystemTime,
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};
use tracing::debug;

use crate::{
    fetcher::{DownloadRequest, MediaFetcher, MediaProbe, ProgressEvent},
    naming,
};

const PROGRESS_MARKER: &str = "vidfetch-progress";
const PROGRESS_TEMPLATE: &str = concat!(
    "download:vidfetch-progress",
    "|%(progress.status)s",
    "|%(progress.downloaded_bytes)s",
    "|%(progress.total_bytes)s",
    "|%(progress.total_bytes_estimate)s",
);
const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl", "tmp"];

/// Subset of the `--dump-single-json` payload we care about.
#[derive(Debug, Deserialize)]
struct ProbeJson {
    title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    user_agent: String,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>, user_agent: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            user_agent: user_agent.into(),
        }
    }

    /// Runs `yt-dlp --version` and returns the reported version so startup
    /// fails loudly when the tool is missing.
    pub async fn ensure_available(&self) -> Result<String> {
        let output = self
            .command()
            .arg("--version")
            .output()
            .await
            .with_context(|| {
                format!("{} is not installed or not in PATH", self.program.display())
            })?;
        if !output.status.success() {
            bail!(
                "{} is installed but returned {}",
                self.program.display(),
                output.status
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    fn probe_args(&self, url: &str) -> Vec<String> {
        vec![
            "--dump-single-json".into(),
            "--skip-download".into(),
            "--no-playlist".into(),
            "--no-warnings".into(),
            "--user-agent".into(),
            self.user_agent.clone(),
            "--".into(),
            url.into(),
        ]
    }

    fn download_args(&self, request: &DownloadRequest) -> Vec<String> {
        let template = request.output_dir.join(format!(
            "{}.%(ext)s",
            naming::escape_output_template(&request.file_stem)
        ));
        let mut args: Vec<String> = vec![
            "--format".into(),
            request.quality.format_selector().into(),
            "--no-playlist".into(),
            "--no-warnings".into(),
            "--newline".into(),
            "--progress".into(),
            "--progress-template".into(),
            PROGRESS_TEMPLATE.into(),
            "--print".into(),
            "after_move:filepath".into(),
            "--user-agent".into(),
            self.user_agent.clone(),
            "--output".into(),
            template.to_string_lossy().into_owned(),
        ];
        if request.quality.is_audio_only() {
            args.extend([
                "--extract-audio".into(),
                "--audio-format".into(),
                "mp3".into(),
            ]);
        }
        args.push("--".into());
        args.push(request.url.clone());
        args
    }
}

#[async_trait]
impl MediaFetcher for YtDlp {
    async fn probe(&self, url: &str) -> Result<MediaProbe> {
        let output = self
            .command()
            .args(self.probe_args(url))
            .output()
            .await
            .context("spawning yt-dlp metadata probe")?;
        if !output.status.success() {
            bail!(
                "yt-dlp metadata probe failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let info: ProbeJson =
            serde_json::from_slice(&output.stdout).context("yt-dlp returned invalid JSON")?;
        Ok(MediaProbe {
            title: info.title.unwrap_or_else(|| "video".to_string()),
        })
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<PathBuf> {
        let mut child = self
            .command()
            .args(self.download_args(request))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning yt-dlp download")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("yt-dlp stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("yt-dlp stderr not captured"))?;

        // With --print yt-dlp runs quietly and progress ends up on stderr, so
        // both pipes are scanned for progress lines.
        let stdout_reader = tokio::spawn(scan_output(stdout, progress.clone()));
        let stderr_reader = tokio::spawn(scan_output(stderr, progress));

        let status = child.wait().await.context("waiting for yt-dlp")?;
        let printed = stdout_reader.await.context("reading yt-dlp stdout")?;
        let diagnostics = stderr_reader.await.context("reading yt-dlp stderr")?;

        if !status.success() {
            let detail = diagnostics.join("\n");
            bail!("yt-dlp exited with {}: {}", status, detail.trim());
        }

        if let Some(path) = printed.last().map(PathBuf::from) {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(path);
            }
            debug!(path = %path.display(), "printed path missing, scanning output directory");
        }
        find_output_file(&request.output_dir).await
    }
}

/// Reads `reader` to EOF, forwarding progress lines and returning every other
/// non-empty line. Lines are decoded lossily; yt-dlp under a non-UTF-8 locale
/// emits raw bytes, and the pipe must stay drained until the child exits.
async fn scan_output<R>(reader: R, progress: mpsc::Sender<ProgressEvent>) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut other = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "yt-dlp output stream closed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        if let Some(event) = parse_progress_line(&line) {
            // The receiver only disappears when the job is being torn down.
            let _ = progress.send(event).await;
            continue;
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            other.push(trimmed.to_string());
        }
    }
    other
}

/// Parses a line produced by [`PROGRESS_TEMPLATE`]. yt-dlp renders missing
/// fields as `NA` and estimates as floats.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let rest = line.trim().strip_prefix(PROGRESS_MARKER)?.strip_prefix('|')?;
    let mut fields = rest.split('|');
    let status = fields.next()?;
    let downloaded = parse_bytes(fields.next()?);
    let total = parse_bytes(fields.next()?);
    let estimate = parse_bytes(fields.next()?);
    Some(ProgressEvent {
        downloaded_bytes: downloaded.unwrap_or(0),
        total_bytes: total,
        total_bytes_estimate: estimate,
        finished: status == "finished",
    })
}

fn parse_bytes(field: &str) -> Option<u64> {
    let value: f64 = field.trim().parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value as u64)
}

/// Fallback when yt-dlp did not print the final path: the newest complete
/// file in the job directory.
async fn find_output_file(dir: &Path) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut newest: Option<(PathBuf, SystemTime)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let metadata = entry.metadata().await?;
        if !metadata.is_file() || is_partial(&path) {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().is_none_or(|(_, seen)| modified > *seen) {
            newest = Some((path, modified));
        }
    }
    newest
        .map(|(path, _)| path)
        .ok_or_else(|| anyhow!("yt-dlp finished without producing a file in {}", dir.display()))
}

fn is_partial(path: &Path) -> bool {
    let is_partial_ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PARTIAL_EXTENSIONS.contains(&ext));
    let is_fragment = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains(".part-Frag"));
    is_partial_ext || is_fragment
}
