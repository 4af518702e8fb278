// --- Configuration ---------------------------------------------------------
//
// The service reads one JSON file at boot. Keys are camelCase so existing
// deployments can keep their config tree:
//
//   {
//     "defaultStationId": "jazz",
//     "streamBaseUrl": "https://radio.example.net/listen/",
//     "autoStart": true,
//     "networkSettings": { "streamTimeout": 15, "maxRetries": 5, "retryInterval": 10000 },
//     "dashboardSettings": { "port": 3000, "username": "admin", "password": "..." }
//   }
//
// Everything has a default. A handful of values can be overridden from the
// environment (RADIOCONTROL_BIND, RADIOCONTROL_USERNAME, RADIOCONTROL_PASSWORD).

use std::{net::SocketAddr, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, warn};

pub const CONFIG_PATH_ENV: &str = "RADIOCONTROL_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/default.json";

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub default_station_id: String,
    pub stream_base_url: String,
    pub auto_start: bool,
    pub network_settings: NetworkSettings,
    pub dashboard_settings: DashboardSettings,
    pub player: PlayerSettings,
    pub mixer: MixerSettings,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkSettings {
    /// Seconds the player may take before the launch counts as timed out.
    pub stream_timeout: u64,
    pub max_retries: u32,
    /// Milliseconds between auto-start attempts.
    pub retry_interval: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DashboardSettings {
    pub port: u16,
    pub username: String,
    pub password: String,
    pub public_dir: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    /// Executable name. Also the name the process table is searched for.
    pub program: String,
    /// Arguments placed before the stream URL.
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MixerSettings {
    pub program: String,
    pub control: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_station_id: "default".into(),
            stream_base_url: "http://localhost:8000".into(),
            auto_start: true,
            network_settings: NetworkSettings::default(),
            dashboard_settings: DashboardSettings::default(),
            player: PlayerSettings::default(),
            mixer: MixerSettings::default(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            stream_timeout: 15,
            max_retries: 5,
            retry_interval: 10_000,
        }
    }
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            port: 3000,
            username: "admin".into(),
            password: String::new(),
            public_dir: "public".into(),
        }
    }
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            program: "mpv".into(),
            args: vec!["--no-video".into(), "--msg-level=all=error".into()],
        }
    }
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            program: "amixer".into(),
            control: "Master".into(),
        }
    }
}

impl NetworkSettings {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval)
    }
}

impl Config {
    /// Load the config file named by `RADIOCONTROL_CONFIG` (or the default
    /// path), then apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::from_file(Path::new(&path))?;

        if let Ok(user) = std::env::var("RADIOCONTROL_USERNAME") {
            cfg.dashboard_settings.username = user;
        }
        if let Ok(pass) = std::env::var("RADIOCONTROL_PASSWORD") {
            cfg.dashboard_settings.password = pass;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// A missing file yields the defaults; a malformed one is an error.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let cfg = Self::from_json(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))?;
                info!("loaded config from {}", path.display());
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read config file {}", path.display())),
        }
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dashboard_settings.username.trim().is_empty() {
            anyhow::bail!("dashboard username is empty");
        }
        if self.dashboard_settings.password.is_empty() {
            anyhow::bail!("dashboard password is empty (set dashboardSettings.password or RADIOCONTROL_PASSWORD)");
        }
        if self.player.program.trim().is_empty() {
            anyhow::bail!("player program is empty");
        }
        Ok(())
    }

    /// Listen address. RADIOCONTROL_BIND wins over the configured port.
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = std::env::var("RADIOCONTROL_BIND")
            .unwrap_or_else(|_| format!("0.0.0.0:{}", self.dashboard_settings.port));
        addr.parse()
            .with_context(|| format!("invalid bind address {addr}"))
    }
}
