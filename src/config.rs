use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vidfetch-env";
pub const DEFAULT_DOWNLOAD_DIR: &str = "/var/lib/vidfetch/downloads";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_YTDLP_PATH: &str = "yt-dlp";
pub const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) ",
    "AppleWebKit/537.36 (KHTML, like Gecko) ",
    "Chrome/115.0.0.0 Safari/537.36",
);
pub const DEFAULT_CLEANUP_DELAY_SECS: u64 = 5;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_JOB_RETENTION_SECS: u64 = 20 * 60;

/// Values read from the env file. Everything is optional; unset keys fall
/// back to the defaults above when resolved into a [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub download_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_path: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub cleanup_delay_secs: Option<u64>,
    pub download_timeout_secs: Option<u64>,
    pub job_retention_secs: Option<u64>,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub download_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_path: PathBuf,
    pub user_agent: String,
    pub cleanup_delay: Duration,
    pub download_timeout: Duration,
    /// How long finished, failed and expired jobs stay queryable.
    pub job_retention: Duration,
    pub allowed_origins: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::resolve(EnvConfig::default())
    }
}

impl RuntimeConfig {
    pub fn resolve(cfg: EnvConfig) -> Self {
        Self {
            download_dir: cfg
                .download_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
            host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cfg.port.unwrap_or(DEFAULT_PORT),
            ytdlp_path: cfg
                .ytdlp_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_PATH)),
            user_agent: cfg
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            cleanup_delay: Duration::from_secs(
                cfg.cleanup_delay_secs.unwrap_or(DEFAULT_CLEANUP_DELAY_SECS),
            ),
            download_timeout: Duration::from_secs(
                cfg.download_timeout_secs
                    .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            ),
            job_retention: Duration::from_secs(
                cfg.job_retention_secs.unwrap_or(DEFAULT_JOB_RETENTION_SECS),
            ),
            allowed_origins: cfg.allowed_origins,
        }
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            apply_setting(&mut cfg, key.trim(), value)
                .with_context(|| format!("Parsing {} from {}", key.trim(), path.display()))?;
        }
    }
    Ok(Some(cfg))
}

/// Applies a single `KEY=value` pair. Empty values leave the field unset so a
/// commented-out default can be written as `KEY=""`.
fn apply_setting(cfg: &mut EnvConfig, key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    match key {
        "DOWNLOAD_DIR" => cfg.download_dir = Some(PathBuf::from(value)),
        "VIDFETCH_HOST" => cfg.host = Some(value.to_string()),
        "VIDFETCH_PORT" => cfg.port = Some(value.parse()?),
        "YTDLP_PATH" => cfg.ytdlp_path = Some(PathBuf::from(value)),
        "USER_AGENT" => cfg.user_agent = Some(value.to_string()),
        "CLEANUP_DELAY_SECS" => cfg.cleanup_delay_secs = Some(value.parse()?),
        "DOWNLOAD_TIMEOUT_SECS" => cfg.download_timeout_secs = Some(value.parse()?),
        "JOB_RETENTION_SECS" => cfg.job_retention_secs = Some(value.parse()?),
        "ALLOWED_ORIGINS" => {
            cfg.allowed_origins = value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        _ => {}
    }
    Ok(())
}

/// Overlays process environment variables on top of the file values. Only the
/// listener and storage keys are honoured here; everything else lives in the
/// env file.
pub fn apply_process_env<F>(cfg: &mut EnvConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    for key in ["DOWNLOAD_DIR", "VIDFETCH_HOST", "VIDFETCH_PORT"] {
        if let Some(value) = lookup(key) {
            apply_setting(cfg, key, value.trim())
                .with_context(|| format!("Parsing {key} from the environment"))?;
        }
    }
    Ok(())
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let mut cfg = read_env_config(path.as_ref())?.unwrap_or_default();
    apply_process_env(&mut cfg, |key| std::env::var(key).ok())?;
    Ok(RuntimeConfig::resolve(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn read_env_config_extracts_values() {
        let cfg = make_config(concat!(
            "# comment\n",
            "DOWNLOAD_DIR=\"/srv/dl\"\n",
            "VIDFETCH_PORT=\"4242\"\n",
            "CLEANUP_DELAY_SECS=30\n",
            "ALLOWED_ORIGINS=\"http://a.test, http://b.test,\"\n",
        ));
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.download_dir, Some(PathBuf::from("/srv/dl")));
        assert_eq!(parsed.port, Some(4242));
        assert_eq!(parsed.cleanup_delay_secs, Some(30));
        assert_eq!(parsed.allowed_origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn read_env_config_rejects_bad_port() {
        let cfg = make_config("VIDFETCH_PORT=\"http\"\n");
        let err = read_env_config(cfg.path()).unwrap_err();
        assert!(format!("{err:#}").contains("VIDFETCH_PORT"));
    }

    #[test]
    fn missing_file_resolves_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_env_config(&dir.path().join("absent")).unwrap().is_none());

        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.port, DEFAULT_PORT);
        assert_eq!(runtime.host, DEFAULT_HOST);
        assert_eq!(runtime.ytdlp_path, PathBuf::from(DEFAULT_YTDLP_PATH));
        assert_eq!(runtime.cleanup_delay, Duration::from_secs(5));
        assert_eq!(runtime.job_retention, Duration::from_secs(20 * 60));
        assert!(runtime.allowed_origins.is_empty());
    }

    #[test]
    fn process_env_overrides_file() {
        let file = make_config("VIDFETCH_HOST=\"127.0.0.1\"\nVIDFETCH_PORT=\"8000\"\n");
        let mut cfg = read_env_config(file.path()).unwrap().unwrap();
        let env: HashMap<&str, &str> = HashMap::from([("VIDFETCH_PORT", "9000")]);
        apply_process_env(&mut cfg, |key| env.get(key).map(|v| v.to_string())).unwrap();

        let runtime = RuntimeConfig::resolve(cfg);
        assert_eq!(runtime.host, "127.0.0.1");
        assert_eq!(runtime.port, 9000);
    }

    #[test]
    fn download_dir_from_process_env_wins_over_file() {
        let file = make_config("DOWNLOAD_DIR=\"/srv/file\"\nJOB_RETENTION_SECS=90\n");
        let mut cfg = read_env_config(file.path()).unwrap().unwrap();
        let env: HashMap<&str, &str> = HashMap::from([("DOWNLOAD_DIR", " /srv/env ")]);
        apply_process_env(&mut cfg, |key| env.get(key).map(|v| v.to_string())).unwrap();

        let runtime = RuntimeConfig::resolve(cfg);
        assert_eq!(runtime.download_dir, PathBuf::from("/srv/env"));
        assert_eq!(runtime.job_retention, Duration::from_secs(90));
    }

    #[test]
    fn process_env_rejects_bad_port() {
        let mut cfg = EnvConfig::default();
        let err = apply_process_env(&mut cfg, |key| {
            (key == "VIDFETCH_PORT").then(|| "eighty".to_string())
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("VIDFETCH_PORT"));
    }
}
