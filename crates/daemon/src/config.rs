// Daemon configuration.
//
// Settings come from an optional TOML file (`~/.trisync/config.toml`, or the
// path in `TRISYNC_CONFIG`) overlaid by `TRISYNC_*` environment variables.
// Environment variables win.

use std::env::VarError;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEV_JWT_SECRET: &str = "trisync_local_development_jwt_secret_must_be_32_chars";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8787;
const DEFAULT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Root directory for daemon state: `~/.trisync/`.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".trisync"))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid { key: &'static str, value: String, reason: &'static str },
    #[error("could not determine a data directory; set TRISYNC_DATA_DIR")]
    NoDataDir,
}

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub projects_root: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub watcher_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub default_interval_ms: Option<u64>,
    pub transfer_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub cors_origins: Option<String>,
    pub log_filter: Option<String>,
}

impl FileConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load `path` if it exists, otherwise an empty config.
    fn load_optional(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen_addr: SocketAddr,
    pub data_dir: PathBuf,
    /// Parent of every project workspace directory.
    pub projects_root: PathBuf,
    /// HTTP cloud store. `None` uses the SQLite store in `data_dir`.
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    /// External watcher channel. `None` uses the in-process watcher.
    pub watcher_url: Option<String>,
    pub jwt_secret: String,
    pub default_interval: Duration,
    pub transfer_timeout: Duration,
    pub handshake_timeout: Duration,
    pub cors_origins: Option<String>,
    pub log_filter: String,
}

impl DaemonConfig {
    /// | Variable | Default |
    /// |---|---|
    /// | `TRISYNC_CONFIG` | `~/.trisync/config.toml` |
    /// | `TRISYNC_HOST` / `TRISYNC_PORT` | `127.0.0.1` / `8787` |
    /// | `TRISYNC_DATA_DIR` | `~/.trisync` |
    /// | `TRISYNC_PROJECTS_ROOT` | `<data_dir>/projects` |
    /// | `TRISYNC_REMOTE_URL` | *(none)* |
    /// | `TRISYNC_REMOTE_TOKEN` | *(none)* |
    /// | `TRISYNC_WATCHER_URL` | *(none)* |
    /// | `TRISYNC_JWT_SECRET` | dev-only placeholder |
    /// | `TRISYNC_DEFAULT_INTERVAL_MS` | `30000` |
    /// | `TRISYNC_TRANSFER_TIMEOUT_MS` | `10000` |
    /// | `TRISYNC_HANDSHAKE_TIMEOUT_MS` | `5000` |
    /// | `TRISYNC_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `TRISYNC_LOG_FILTER` | `info` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let config_path = match env("TRISYNC_CONFIG") {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => default_data_dir().map(|d| d.join("config.toml")),
        };
        let file = match config_path {
            Some(path) => FileConfig::load_optional(&path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(file, env)
    }

    /// Overlay `env` on `file`.
    pub fn from_sources<F>(file: FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let string = |key: &str, fallback: Option<String>| env(key).ok().or(fallback);

        let host = string("TRISYNC_HOST", file.host).unwrap_or_else(|| DEFAULT_HOST.into());
        let port = match env("TRISYNC_PORT") {
            Ok(raw) => parse_number("TRISYNC_PORT", &raw)?,
            Err(_) => file.port.unwrap_or(DEFAULT_PORT),
        };
        let listen_addr: SocketAddr = format!("{host}:{port}").parse().map_err(|_| {
            ConfigError::Invalid { key: "TRISYNC_HOST", value: host.clone(), reason: "not an IP address" }
        })?;

        let data_dir = match env("TRISYNC_DATA_DIR").ok().map(PathBuf::from).or(file.data_dir) {
            Some(dir) => dir,
            None => default_data_dir().ok_or(ConfigError::NoDataDir)?,
        };
        let projects_root = env("TRISYNC_PROJECTS_ROOT")
            .ok()
            .map(PathBuf::from)
            .or(file.projects_root)
            .unwrap_or_else(|| data_dir.join("projects"));

        let jwt_secret =
            string("TRISYNC_JWT_SECRET", file.jwt_secret).unwrap_or_else(|| DEV_JWT_SECRET.into());
        if jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                key: "TRISYNC_JWT_SECRET",
                value: "<redacted>".into(),
                reason: "must be at least 32 characters",
            });
        }

        Ok(Self {
            listen_addr,
            data_dir,
            projects_root,
            remote_url: string("TRISYNC_REMOTE_URL", file.remote_url),
            remote_token: string("TRISYNC_REMOTE_TOKEN", file.remote_token),
            watcher_url: string("TRISYNC_WATCHER_URL", file.watcher_url),
            jwt_secret,
            default_interval: millis(
                &env,
                "TRISYNC_DEFAULT_INTERVAL_MS",
                file.default_interval_ms,
                DEFAULT_INTERVAL_MS,
            )?,
            transfer_timeout: millis(
                &env,
                "TRISYNC_TRANSFER_TIMEOUT_MS",
                file.transfer_timeout_ms,
                DEFAULT_TRANSFER_TIMEOUT_MS,
            )?,
            handshake_timeout: millis(
                &env,
                "TRISYNC_HANDSHAKE_TIMEOUT_MS",
                file.handshake_timeout_ms,
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
            )?,
            cors_origins: string("TRISYNC_CORS_ORIGINS", file.cors_origins),
            log_filter: string("TRISYNC_LOG_FILTER", file.log_filter)
                .unwrap_or_else(|| "info".into()),
        })
    }

    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn meta_db_path(&self) -> PathBuf {
        self.data_dir.join("sync.db")
    }

    pub fn remote_db_path(&self) -> PathBuf {
        self.data_dir.join("remote.db")
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: "not a valid number",
    })
}

fn millis<F>(env: &F, key: &'static str, file: Option<u64>, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    let ms = match env(key) {
        Ok(raw) => parse_number(key, &raw)?,
        Err(_) => file.unwrap_or(default),
    };
    if ms == 0 {
        return Err(ConfigError::Invalid { key, value: "0".into(), reason: "must be positive" });
    }
    Ok(Duration::from_millis(ms))
}
