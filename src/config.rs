//! Configuration: global tunables plus the per-server settings string.

use std::{
   fs,
   path::{Path, PathBuf},
   sync::OnceLock,
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Application configuration loaded from config file and environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub keepalive_secs: u64,
   pub pool_size:      usize,
   pub compiler:       String,

   pub monitor_interval_ms:    u64,
   pub start_timeout_secs:     u64,
   pub connect_timeout_ms:     u64,
   pub connect_attempts:       usize,
   pub connect_retry_delay_ms: u64,

   pub max_request_args: usize,
   pub max_line_bytes:   usize,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         keepalive_secs:         120,
         pool_size:              0,
         compiler:               "javac".to_string(),
         monitor_interval_ms:    5000,
         start_timeout_secs:     60,
         connect_timeout_ms:     2000,
         connect_attempts:       3,
         connect_retry_delay_ms: 500,
         max_request_args:       65_536,
         max_line_bytes:         1_048_576,
      }
   }
}

impl Config {
   pub fn load() -> Self {
      let config_path = ensure_global_config();

      Figment::from(Serialized::defaults(Self::default()))
         .merge(Toml::file(config_path))
         .merge(Env::prefixed("WARMC_").lowercase(true))
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   fn create_default_config(path: &Path) {
      if let Some(parent) = path.parent() {
         let _ = fs::create_dir_all(parent);
      }
      let default_config = Self::default();
      if let Ok(toml) = toml::to_string_pretty(&default_config) {
         let _ = fs::write(path, toml);
      }
   }

   /// Pool size to use when the settings string does not name one.
   pub fn default_pool_size(&self) -> usize {
      if self.pool_size == 0 {
         num_cpus::get().max(1)
      } else {
         self.pool_size
      }
   }

   pub fn limits(&self) -> RequestLimits {
      RequestLimits {
         max_args:       self.max_request_args.max(1),
         max_line_bytes: self.max_line_bytes.max(1),
      }
   }
}

/// Returns the global configuration instance
pub fn get() -> &'static Config {
   CONFIG.get_or_init(Config::load)
}

/// Bounds applied when reading a request off a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
   pub max_args:       usize,
   pub max_line_bytes: usize,
}

impl Default for RequestLimits {
   fn default() -> Self {
      Config::default().limits()
   }
}

/// Settings for one server instance.
///
/// Parsed from `portfile=<path>,poolsize=<n>,keepalive=<secs>[,compiler=<prog>]`;
/// omitted keys fall back to [`Config`].
#[derive(Debug, Clone)]
pub struct ServerSettings {
   pub portfile:         PathBuf,
   pub pool_size:        usize,
   pub keepalive:        Duration,
   pub compiler:         String,
   pub monitor_interval: Duration,
   pub limits:           RequestLimits,
}

impl ServerSettings {
   pub fn new(portfile: impl Into<PathBuf>, cfg: &Config) -> Self {
      Self {
         portfile:         portfile.into(),
         pool_size:        cfg.default_pool_size(),
         keepalive:        Duration::from_secs(cfg.keepalive_secs),
         compiler:         cfg.compiler.clone(),
         monitor_interval: Duration::from_millis(cfg.monitor_interval_ms.max(1)),
         limits:           cfg.limits(),
      }
   }

   pub fn parse(settings: &str, cfg: &Config) -> Result<Self> {
      let mut portfile = None;
      let mut pool_size = None;
      let mut keepalive = None;
      let mut compiler = None;

      for segment in settings.split(',').map(str::trim).filter(|s| !s.is_empty()) {
         let (key, value) = segment
            .split_once('=')
            .ok_or_else(|| ConfigError::Malformed(segment.to_string()))?;
         let (key, value) = (key.trim(), value.trim());
         if value.is_empty() {
            return Err(invalid(key, value));
         }
         match key {
            "portfile" => portfile = Some(PathBuf::from(value)),
            "poolsize" => {
               let n = value.parse::<usize>().map_err(|_| invalid(key, value))?;
               if n == 0 {
                  return Err(invalid(key, value));
               }
               pool_size = Some(n);
            },
            "keepalive" => {
               let secs = value.parse::<u64>().map_err(|_| invalid(key, value))?;
               keepalive = Some(Duration::from_secs(secs));
            },
            "compiler" => compiler = Some(value.to_string()),
            other => return Err(ConfigError::UnknownSetting(other.to_string()).into()),
         }
      }

      let portfile = portfile.ok_or(ConfigError::MissingPortfile)?;
      let mut out = Self::new(portfile, cfg);
      if let Some(n) = pool_size {
         out.pool_size = n;
      }
      if let Some(k) = keepalive {
         out.keepalive = k;
      }
      if let Some(c) = compiler {
         out.compiler = c;
      }
      Ok(out)
   }

   /// Renders the settings string a spawned server is started with.
   pub fn to_settings_string(&self) -> String {
      format!(
         "portfile={},poolsize={},keepalive={},compiler={}",
         self.portfile.display(),
         self.pool_size,
         self.keepalive.as_secs(),
         self.compiler
      )
   }
}

fn invalid(key: &str, value: &str) -> crate::Error {
   ConfigError::InvalidSetting { key: key.to_string(), value: value.to_string() }.into()
}

/// Client-side connection tunables.
#[derive(Debug, Clone)]
pub struct ClientSettings {
   pub start_timeout:       Duration,
   pub connect_timeout:     Duration,
   pub connect_attempts:    usize,
   pub connect_retry_delay: Duration,
}

impl ClientSettings {
   pub fn from_config(cfg: &Config) -> Self {
      Self {
         start_timeout:       Duration::from_secs(cfg.start_timeout_secs),
         connect_timeout:     Duration::from_millis(cfg.connect_timeout_ms),
         connect_attempts:    cfg.connect_attempts.max(1),
         connect_retry_delay: Duration::from_millis(cfg.connect_retry_delay_ms),
      }
   }
}

impl Default for ClientSettings {
   fn default() -> Self {
      Self::from_config(&Config::default())
   }
}

/// Returns the base directory for warmc configuration
pub fn base_dir() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| resolve_base_dir(".warmc"))
}

pub fn config_file_path() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| base_dir().join("config.toml"))
}

fn ensure_global_config() -> PathBuf {
   let config_path = config_file_path();
   if !config_path.exists() {
      Config::create_default_config(config_path);
   }
   config_path.clone()
}

fn resolve_base_dir(dir_name: &str) -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(dir_name))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(dir_name))
      })
      .unwrap_or_else(|| {
         std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(dir_name)
      })
}
