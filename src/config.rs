//! Agent configuration
//!
//! One TOML file, every field optional. Missing fields take the values of
//! the deployed garage node.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mqtt::{Endpoint, RetryPolicy};

const CONFIG_DIR: &str = ".config/garage-monitor";
const CONFIG_FILE: &str = "config.toml";
/// PIR sampling rates the sampling thread can honour
const SAMPLE_RATE_HZ: RangeInclusive<f64> = 0.1..=1000.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Echo every publish to the console
    pub verbose: bool,
    pub broker: BrokerConfig,
    pub reachability: ReachabilityConfig,
    pub heartbeat: HeartbeatConfig,
    pub sensors: SensorsConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keepalive_secs: u64,
    pub client_id: String,
    pub topic_root: String,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub request_capacity: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ReachabilityConfig {
    pub retry_interval_ms: u64,
    /// 0 probes forever
    pub max_attempts: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SensorsConfig {
    pub temperature: TemperatureConfig,
    pub door: DoorConfig,
    pub motion_a: MotionConfig,
    /// A partial table falls back to channel A's values, so give `pin` explicitly
    pub motion_b: MotionConfig,
    pub light: LightConfig,
    pub cpu: CpuConfig,
    pub link: LinkConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TemperatureConfig {
    pub enabled: bool,
    pub device_dir: PathBuf,
    pub read_attempts: u32,
    pub retry_delay_ms: u64,
    pub poll_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DoorConfig {
    pub enabled: bool,
    pub pin: u8,
    pub bounce_ms: u64,
    pub poll_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MotionConfig {
    pub enabled: bool,
    pub pin: u8,
    pub queue_len: usize,
    pub sample_rate_hz: f64,
    pub threshold: f64,
    pub poll_secs: u64,
    pub settle_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LightConfig {
    pub enabled: bool,
    pub pin: u8,
    pub queue_len: usize,
    pub charge_time_limit_ms: u64,
    pub threshold: f64,
    pub poll_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CpuConfig {
    pub enabled: bool,
    pub sensor_file: PathBuf,
    pub threshold_c: f64,
    pub poll_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub enabled: bool,
    pub interface: String,
    pub poll_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.110".to_string(),
            port: 1883,
            keepalive_secs: 90,
            client_id: "raspberrypi-z01".to_string(),
            topic_root: "rpiz01/garage/".to_string(),
            connect_timeout_secs: 10,
            reconnect_delay_secs: 5,
            request_capacity: 64,
        }
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 2000,
            max_attempts: 300,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_secs: 62 }
    }
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            temperature: TemperatureConfig::default(),
            door: DoorConfig::default(),
            motion_a: MotionConfig::default(),
            motion_b: MotionConfig::channel_b(),
            light: LightConfig::default(),
            cpu: CpuConfig::default(),
            link: LinkConfig::default(),
        }
    }
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_dir: PathBuf::from("/sys/bus/w1/devices"),
            read_attempts: 5,
            retry_delay_ms: 200,
            poll_secs: 60,
        }
    }
}

impl Default for DoorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pin: 27,
            bounce_ms: 250,
            poll_secs: 60,
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pin: 24,
            queue_len: 1,
            sample_rate_hz: 10.0,
            threshold: 0.5,
            poll_secs: 90,
            settle_secs: 60,
        }
    }
}

impl MotionConfig {
    fn channel_b() -> Self {
        Self {
            pin: 11,
            ..Self::default()
        }
    }
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pin: 23,
            queue_len: 5,
            charge_time_limit_ms: 10,
            threshold: 0.1,
            poll_secs: 66,
        }
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensor_file: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            threshold_c: 80.0,
            poll_secs: 30,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: "wlan0".to_string(),
            poll_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Loads `path`, or the per-user default location when `path` is `None`
    ///
    /// A missing file at the default location is created with defaults on a
    /// best-effort basis; a missing explicit path is an error.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::read(path).await?,
            None => {
                let path = default_path();
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    Self::read(&path).await?
                } else {
                    let config = Self::default();
                    config.write_default(&path).await;
                    config
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    async fn read(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    async fn write_default(&self, path: &Path) {
        let content = match toml::to_string_pretty(self) {
            Ok(content) => content,
            Err(e) => {
                warn!("Could not render default configuration: {}", e);
                return;
            }
        };
        if let Some(dir) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!("Could not create {}: {}", dir.display(), e);
                return;
            }
        }
        match tokio::fs::write(path, content).await {
            Ok(()) => info!("Wrote default configuration to {}", path.display()),
            Err(e) => warn!("Could not write {}: {}", path.display(), e),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        non_empty("broker.host", &broker.host)?;
        non_empty("broker.client_id", &broker.client_id)?;
        non_empty("broker.topic_root", &broker.topic_root)?;
        if broker.keepalive_secs < 5 {
            return Err(invalid("broker.keepalive_secs", "must be at least 5 seconds"));
        }
        if broker.request_capacity == 0 {
            return Err(invalid("broker.request_capacity", "must be at least 1"));
        }
        at_least_one_second("heartbeat.interval_secs", self.heartbeat.interval_secs)?;

        let sensors = &self.sensors;
        at_least_one_second("sensors.temperature.poll_secs", sensors.temperature.poll_secs)?;
        if sensors.temperature.read_attempts == 0 {
            return Err(invalid("sensors.temperature.read_attempts", "must be at least 1"));
        }
        at_least_one_second("sensors.door.poll_secs", sensors.door.poll_secs)?;
        for (prefix, motion) in [("motion_a", &sensors.motion_a), ("motion_b", &sensors.motion_b)] {
            let field = |name: &str| format!("sensors.{}.{}", prefix, name);
            at_least_one_second(&field("poll_secs"), motion.poll_secs)?;
            queue_len(&field("queue_len"), motion.queue_len)?;
            unit_interval(&field("threshold"), motion.threshold)?;
            if !SAMPLE_RATE_HZ.contains(&motion.sample_rate_hz) {
                return Err(invalid(
                    &field("sample_rate_hz"),
                    &format!(
                        "{} is outside [{}, {}] Hz",
                        motion.sample_rate_hz,
                        SAMPLE_RATE_HZ.start(),
                        SAMPLE_RATE_HZ.end()
                    ),
                ));
            }
        }
        at_least_one_second("sensors.light.poll_secs", sensors.light.poll_secs)?;
        queue_len("sensors.light.queue_len", sensors.light.queue_len)?;
        unit_interval("sensors.light.threshold", sensors.light.threshold)?;
        at_least_one_second("sensors.cpu.poll_secs", sensors.cpu.poll_secs)?;
        at_least_one_second("sensors.link.poll_secs", sensors.link.poll_secs)?;
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.broker.host.clone(),
            port: self.broker.port,
            keepalive: Duration::from_secs(self.broker.keepalive_secs),
            connect_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.reachability.retry_interval_ms),
            max_attempts: match self.reachability.max_attempts {
                0 => None,
                n => Some(n),
            },
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }
}

fn default_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(())
}

fn at_least_one_second(field: &str, secs: u64) -> Result<(), ConfigError> {
    if secs == 0 {
        return Err(invalid(field, "must be at least 1 second"));
    }
    Ok(())
}

fn queue_len(field: &str, len: usize) -> Result<(), ConfigError> {
    if len == 0 {
        return Err(invalid(field, "must hold at least one sample"));
    }
    Ok(())
}

fn unit_interval(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, &format!("{} is outside [0, 1]", value)));
    }
    Ok(())
}
