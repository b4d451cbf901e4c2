use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "TVREMOTE_";
const APP_DIR: &str = "webos-remote-bridge";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub discovery: DiscoveryConfig,
    pub wake: WakeConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub content: ContentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    // Session name the discovered TV is stored under in each user's config.
    pub name: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "TV".to_string(),
            port: 3000,
            connect_timeout_ms: 5000,
            settle_delay_ms: 2000,
        }
    }
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub timeout_ms: u64,
    pub search_target: String,
    pub multicast_addr: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            search_target: "urn:lge-com:service:webos-second-screen:1".to_string(),
            multicast_addr: "239.255.255.250:1900".to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WakeConfig {
    pub broadcast_addr: String,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            broadcast_addr: "255.255.255.255:9".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub idle_ttl_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 60,
            sweep_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub path: Option<String>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => PathBuf::from(p),
            None => app_dir().join("users"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContentConfig {
    pub youtube_api_key: Option<String>,
    pub youtube_search_url: String,
    pub netflix_catalog_url: String,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            youtube_api_key: None,
            youtube_search_url: "https://www.googleapis.com/youtube/v3/search".to_string(),
            netflix_catalog_url: "https://api.jsonbin.io/b/61bb2d4e0ddbee6f8b1eec02/latest"
                .to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}SERVER_HOST", ENV_PREFIX)) {
            self.server.host = val;
        }
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var(format!("{}DEVICE_NAME", ENV_PREFIX)) {
            self.device.name = val;
        }
        if let Ok(val) = env::var(format!("{}DEVICE_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.device.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}CONNECT_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.device.connect_timeout_ms = ms;
            }
        }

        if let Ok(val) = env::var(format!("{}DISCOVERY_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.discovery.timeout_ms = ms;
            }
        }

        if let Ok(val) = env::var(format!("{}WAKE_BROADCAST_ADDR", ENV_PREFIX)) {
            self.wake.broadcast_addr = val;
        }

        if let Ok(val) = env::var(format!("{}CACHE_IDLE_TTL_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.cache.idle_ttl_secs = secs;
            }
        }

        if let Ok(val) = env::var(format!("{}STORE_PATH", ENV_PREFIX)) {
            self.store.path = Some(val);
        }

        // Content lookups
        if let Ok(val) = env::var(format!("{}YOUTUBE_API_KEY", ENV_PREFIX)) {
            self.content.youtube_api_key = Some(val);
        }
        if let Ok(val) = env::var(format!("{}NETFLIX_CATALOG_URL", ENV_PREFIX)) {
            self.content.netflix_catalog_url = val;
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.device.port == 0 {
            return Err("device.port must be non-zero".into());
        }
        if self.device.name.trim().is_empty() {
            return Err("device.name must be set".into());
        }
        if self.device.connect_timeout_ms == 0 {
            return Err("device.connect_timeout_ms must be non-zero".into());
        }
        if self.discovery.timeout_ms == 0 {
            return Err("discovery.timeout_ms must be non-zero".into());
        }
        if self.discovery.search_target.trim().is_empty() {
            return Err("discovery.search_target must be set".into());
        }
        if self.discovery.multicast_addr.parse::<SocketAddr>().is_err() {
            return Err("discovery.multicast_addr must be a socket address".into());
        }
        if self.wake.broadcast_addr.parse::<SocketAddr>().is_err() {
            return Err("wake.broadcast_addr must be a socket address".into());
        }
        if self.cache.idle_ttl_secs == 0 {
            return Err("cache.idle_ttl_secs must be non-zero".into());
        }
        if self.cache.sweep_interval_ms == 0 {
            return Err("cache.sweep_interval_ms must be non-zero".into());
        }
        Ok(())
    }

    pub fn server_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        Ok(format!("{}:{}", self.server.host, self.server.port).parse()?)
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn app_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    app_dir().join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
