use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bevy::prelude::*;
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_PORT_SCAN: u16 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_STOP_GRACE_MS: u64 = 500;
pub const DEFAULT_LOG_CAPACITY: usize = 100;
pub const DEFAULT_COMPILATION_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: IpAddr,
    /// Preferred port; the next `port_scan - 1` ports are tried when it is taken.
    pub port: u16,
    pub port_scan: u16,
    pub request_timeout: Duration,
    pub health_interval: Duration,
    /// How long a blocking stop waits for the accept thread to exit.
    pub stop_grace: Duration,
    pub log_capacity: usize,
    pub compilation_capacity: usize,
    pub auto_start: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            port_scan: DEFAULT_PORT_SCAN,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            health_interval: Duration::from_millis(DEFAULT_HEALTH_INTERVAL_MS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            log_capacity: DEFAULT_LOG_CAPACITY,
            compilation_capacity: DEFAULT_COMPILATION_CAPACITY,
            auto_start: true,
        }
    }
}

/// On-disk overrides. Every field is optional so partial files work.
#[derive(Deserialize, Default)]
struct FileConfig {
    host: Option<IpAddr>,
    port: Option<u16>,
    port_scan: Option<u16>,
    request_timeout_ms: Option<u64>,
    health_interval_ms: Option<u64>,
    stop_grace_ms: Option<u64>,
    log_capacity: Option<usize>,
    auto_start: Option<bool>,
}

impl BridgeConfig {
    /// `CONDUIT_CONFIG`, or `conduit.json` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var_os("CONDUIT_CONFIG")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("conduit.json"))
    }

    /// Config file at `default_path()`, then `CONDUIT_*` env vars on top.
    pub fn load() -> Self {
        Self::load_from(Self::default_path())
    }

    /// Reads `path` (missing is fine, broken is a warning), then applies
    /// `CONDUIT_*` env vars on top. Logs, so call it once logging is up.
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let file = match read_file(path) {
            Ok(Some(cfg)) => {
                info!("[Conduit] Loaded config from {}", path.display());
                cfg
            }
            Ok(None) => {
                debug!("[Conduit] No config at {}, using defaults", path.display());
                FileConfig::default()
            }
            Err(e) => {
                warn!("[Conduit] Failed to parse {}: {e}", path.display());
                FileConfig::default()
            }
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let env = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let host = env("CONDUIT_HOST")
            .and_then(|v| v.parse::<IpAddr>().ok())
            .or(file.host)
            .unwrap_or(defaults.host);
        let port = env("CONDUIT_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .or(file.port)
            .filter(|p| *p != 0)
            .unwrap_or(defaults.port);
        let port_scan = env("CONDUIT_PORT_SCAN")
            .and_then(|v| v.parse::<u16>().ok())
            .or(file.port_scan)
            .unwrap_or(defaults.port_scan)
            .max(1);
        let millis = |key: &str, file_value: Option<u64>, default: u64, floor: u64| {
            let ms = env(key)
                .and_then(|v| v.parse::<u64>().ok())
                .or(file_value)
                .unwrap_or(default)
                .max(floor);
            Duration::from_millis(ms)
        };
        let auto_start = env("CONDUIT_AUTO_START")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .or(file.auto_start)
            .unwrap_or(defaults.auto_start);

        Self {
            host,
            port,
            port_scan,
            request_timeout: millis(
                "CONDUIT_REQUEST_TIMEOUT_MS",
                file.request_timeout_ms,
                DEFAULT_REQUEST_TIMEOUT_MS,
                10,
            ),
            health_interval: millis(
                "CONDUIT_HEALTH_INTERVAL_MS",
                file.health_interval_ms,
                DEFAULT_HEALTH_INTERVAL_MS,
                100,
            ),
            stop_grace: millis(
                "CONDUIT_STOP_GRACE_MS",
                file.stop_grace_ms,
                DEFAULT_STOP_GRACE_MS,
                0,
            ),
            log_capacity: env("CONDUIT_LOG_CAPACITY")
                .and_then(|v| v.parse::<usize>().ok())
                .or(file.log_capacity)
                .unwrap_or(defaults.log_capacity)
                .max(1),
            compilation_capacity: defaults.compilation_capacity,
            auto_start,
        }
    }

    /// Last port tried by the fallback scan.
    pub fn last_port(&self) -> u16 {
        self.port.saturating_add(self.port_scan.saturating_sub(1))
    }

    /// Value an upstream process should use for its `CONDUIT_URL` setting.
    pub fn base_url(&self, port: u16) -> String {
        format!("http://{}:{port}/bridge", self.host)
    }
}

fn read_file(path: &Path) -> Result<Option<FileConfig>, String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| e.to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}
