//! CLI arguments, TOML configuration file and server defaults.

use clap::Parser;
use serde::Deserialize;
use shadow_rs::formatcp;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::build;
use crate::ratelimit::LimitPolicy;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7086;
pub const DEFAULT_PACING_INTERVAL_MS: u64 = 100;
pub const DEFAULT_UI_PATH: &str = "/ui";
pub const AUTH_REALM: &str = r#"Basic realm="Restricted""#;

/// CLI arguments; host, port and fs dir override the config file.
#[derive(Parser, Debug)]
#[command(name = "axo-static", version = VERSION_INFO, about = "AxoStatic file server")]
pub struct Args {
    #[arg(
        short = 'c',
        long,
        env = "AXO_CONFIG",
        default_value = DEFAULT_CONFIG_FILE,
        help = "Path to the TOML configuration file"
    )]
    pub config: String,
    #[arg(short = 'b', long, env = "AXO_BIND", help = "Bind address")]
    pub host: Option<String>,
    #[arg(short = 'p', long, env = "AXO_PORT", help = "Listen port")]
    pub port: Option<u16>,
    #[arg(short = 'd', long, env = "AXO_FS_DIR", help = "Directory to serve")]
    pub fs_dir: Option<String>,
    #[arg(short = 'v', long, help = "Enable debug logging")]
    pub verbose: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("fs_dir is empty")]
    MissingRoot,
    #[error("fs_dir {path} is not usable: {source}")]
    RootNotFound {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("password hash is empty for user: {0}")]
    MissingPasswordHash(String),
    #[error("password hash method is empty for user: {0}")]
    MissingHashMethod(String),
    #[error("user dir does not exist: {0}")]
    UserDirNotFound(PathBuf),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Conf {
    pub log: LogConf,
    pub server: ServerConf,
    pub auth: AuthConf,
    pub ui: UiConf,
    pub cors: CorsConf,
    pub ssl: SslConf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConf {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConf {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConf {
    pub host: String,
    pub port: u16,
    /// URL path prefix for every served file.
    pub path: String,
    pub fs_dir: String,
    /// Bytes per second for users without their own limit, 0 = unlimited.
    pub default_speed_limit: u64,
    /// Bucket capacity in bytes, 0 = one second worth of the user's rate.
    pub bucket_capacity: u64,
    pub pacing_interval_ms: u64,
    pub limit_policy: LimitPolicy,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            path: String::new(),
            fs_dir: default_fs_dir(),
            default_speed_limit: 0,
            bucket_capacity: 0,
            pacing_interval_ms: DEFAULT_PACING_INTERVAL_MS,
            limit_policy: LimitPolicy::default(),
        }
    }
}

impl ServerConf {
    pub fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing_interval_ms)
    }

    pub fn bucket_capacity(&self) -> Option<u64> {
        (self.bucket_capacity > 0).then_some(self.bucket_capacity)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConf {
    pub user: Vec<UserRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum HashMethod {
    Bcrypt,
    Sha256,
    Other(String),
}

impl From<String> for HashMethod {
    fn from(value: String) -> Self {
        match value.as_str() {
            "bcrypt" => HashMethod::Bcrypt,
            "sha256" => HashMethod::Sha256,
            _ => HashMethod::Other(value),
        }
    }
}

impl Default for HashMethod {
    fn default() -> Self {
        HashMethod::Other(String::new())
    }
}

impl HashMethod {
    pub fn is_empty(&self) -> bool {
        matches!(self, HashMethod::Other(value) if value.is_empty())
    }
}

/// One configured account.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    #[serde(alias = "password_crypt")]
    pub hash_method: HashMethod,
    /// Directory under fs_dir this user is confined to.
    #[serde(alias = "sub_fs_dir")]
    pub sub_dir: String,
    /// URL sub-prefix below `server.path`.
    #[serde(alias = "sub_path")]
    pub path_prefix: String,
    pub speed_limit: u64,
    pub show_directory: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UiConf {
    pub enabled: bool,
    pub path: String,
    pub source: String,
}

impl Default for UiConf {
    fn default() -> Self {
        Self {
            enabled: false,
            path: DEFAULT_UI_PATH.into(),
            source: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CorsConf {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SslConf {
    pub enabled: bool,
    pub cert: Option<String>,
    pub key: Option<String>,
}

fn default_fs_dir() -> String {
    std::env::current_dir()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_else(|_| ".".into())
}

impl Conf {
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the config file, falling back to defaults when it does not exist.
    ///
    /// A file with the same name next to the executable takes precedence.
    /// Returns the path that was actually read, if any.
    pub fn load(requested: &str) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = resolve_config_path(requested);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Self::default(), None));
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        let conf = Self::from_toml(&content, &path)?;
        Ok((conf, Some(path)))
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = &args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(fs_dir) = &args.fs_dir {
            self.server.fs_dir = fs_dir.clone();
        }
        if args.verbose {
            self.log.level = "debug".into();
        }
    }
}

fn resolve_config_path(requested: &str) -> PathBuf {
    let requested_path = PathBuf::from(requested);
    if requested_path.is_relative()
        && let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let preferred = exe_dir.join(&requested_path);
        if preferred.is_file() {
            return preferred;
        }
    }
    requested_path
}

/// Validates the served root and returns its absolute form.
pub fn resolve_fs_root(fs_dir: &str) -> Result<PathBuf, ConfigError> {
    if fs_dir.trim().is_empty() {
        return Err(ConfigError::MissingRoot);
    }
    let path = PathBuf::from(fs_dir);
    let root = std::fs::canonicalize(&path)
        .map_err(|source| ConfigError::RootNotFound { path, source })?;
    if !root.is_dir() {
        return Err(ConfigError::RootNotFound {
            path: root,
            source: std::io::Error::from(std::io::ErrorKind::NotADirectory),
        });
    }
    if !is_under_home_or_temp(&root) {
        warn!(
            root = %root.display(),
            "serving a directory outside the home directory may expose sensitive files"
        );
    }
    Ok(root)
}

fn is_under_home_or_temp(path: &Path) -> bool {
    let temp = std::fs::canonicalize(std::env::temp_dir()).unwrap_or_else(|_| std::env::temp_dir());
    dirs::home_dir().is_some_and(|home| path.starts_with(home)) || path.starts_with(temp)
}
