use crate::streaming::source::MaskEncoding;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_SERVER: &str = "fa-archiver.diamond.ac.uk";
pub const DEFAULT_PORT: u16 = 8888;

/// Where the archiver lives and how long to wait for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Deadline for establishing the TCP connection
    pub connect_timeout_ms: u64,
    /// Deadline for each individual receive
    pub read_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5000,
            read_timeout_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("FA_SERVER").unwrap_or(defaults.host),
            port: match lookup("FA_PORT") {
                Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidPort)?,
                None => defaults.port,
            },
            connect_timeout_ms: parse_or(
                &lookup,
                "FA_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout_ms,
            )?,
            read_timeout_ms: parse_or(&lookup, "FA_READ_TIMEOUT_MS", defaults.read_timeout_ms)?,
        })
    }

    /// host:port
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Geometry of a single channel monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub channel_id: u8,
    pub decimated: bool,
    /// Samples kept in the rolling buffer
    pub buffer_capacity: usize,
    /// Samples read from the server per cycle
    pub update_size: usize,
    /// Samples handed to `on_data` per cycle
    pub notify_size: usize,
    #[serde(default)]
    pub encoding: MaskEncoding,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            channel_id: 1,
            decimated: false,
            buffer_capacity: 65536,
            update_size: 512,
            notify_size: 2048,
            encoding: MaskEncoding::RangeList,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_sizes(self.buffer_capacity, self.notify_size, self.update_size)
    }
}

/// Checks a monitor geometry: both sizes positive and within the capacity.
pub fn validate_sizes(
    capacity: usize,
    notify_size: usize,
    update_size: usize,
) -> Result<(), ConfigError> {
    if notify_size == 0 || update_size == 0 {
        return Err(ConfigError::InvalidValue(
            "notify and update sizes must be positive".to_string(),
        ));
    }
    if notify_size > capacity || update_size > capacity {
        return Err(ConfigError::InvalidValue(format!(
            "notify size {} and update size {} must not exceed buffer capacity {}",
            notify_size, update_size, capacity
        )));
    }
    Ok(())
}

/// Settings for the spectrum processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSettings {
    /// FA ids analysed together
    pub ids: Vec<u32>,
    /// Samples per update; each FFT covers two half blocks
    pub half_block_size: usize,
    /// Upper edges of the reported frequency bins, in Hz
    pub frequencies: Vec<f64>,
    /// Updates averaged into one mean spectrum
    pub target_count: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for SpectrumSettings {
    fn default() -> Self {
        Self {
            ids: vec![1],
            half_block_size: 4096,
            frequencies: (1..=300).map(f64::from).collect(),
            target_count: 15,
            reconnect_delay_ms: 1000,
        }
    }
}

impl SpectrumSettings {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let ids = match lookup("FA_IDS") {
            Some(list) => list
                .split(',')
                .map(|id| {
                    id.trim().parse::<u32>().map_err(|_| {
                        ConfigError::InvalidValue(format!("FA_IDS entry {:?} is not an id", id))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.ids,
        };

        let frequencies = match lookup("FA_FREQ_MAX") {
            Some(value) => {
                let max: u32 = value.trim().parse().map_err(|_| {
                    ConfigError::InvalidValue(format!("FA_FREQ_MAX {:?} is not an integer", value))
                })?;
                (1..=max).map(f64::from).collect()
            }
            None => defaults.frequencies,
        };

        let settings = Self {
            ids,
            half_block_size: parse_or(&lookup, "FA_HALF_BLOCK", defaults.half_block_size)?,
            frequencies,
            target_count: parse_or(&lookup, "FA_TARGET_COUNT", defaults.target_count)?,
            reconnect_delay_ms: parse_or(
                &lookup,
                "FA_RECONNECT_DELAY_MS",
                defaults.reconnect_delay_ms,
            )?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ids.is_empty() {
            return Err(ConfigError::InvalidValue("FA_IDS is empty".to_string()));
        }
        if self.half_block_size < 2 {
            return Err(ConfigError::InvalidValue(
                "half block size must be at least 2".to_string(),
            ));
        }
        if self.frequencies.is_empty() {
            return Err(ConfigError::InvalidValue(
                "at least one frequency is required".to_string(),
            ));
        }
        if self.target_count == 0 {
            return Err(ConfigError::InvalidValue(
                "target count must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} = {:?}", key, value))),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
