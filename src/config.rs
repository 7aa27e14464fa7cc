//! Driver configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/di245.toml` (or an explicit path)
//! 2. Environment variables prefixed with `DI245_`, nested keys separated by `__`
//!    (e.g. `DI245_SERIAL__PORT=/dev/ttyUSB1`, `DI245_ACQUISITION__PACKET_POINTS=20`)
//!
//! Every section is optional; missing values fall back to the defaults of the DI-245
//! acquisition software (four channels on ±5 V, 10 Hz, packets of 10 scans, buffer of
//! 4 320 000 scans).
//!
//! # Example
//! ```no_run
//! use di245_daq::config::DaqConfig;
//!
//! let config = DaqConfig::load()?;
//! config.validate()?;
//! println!("Port: {:?}", config.serial.port);
//! # Ok::<(), di245_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::acquisition::{validate_scan_list, AcquisitionSettings, ChannelConfig};
use crate::error::{AppResult, DaqError};
use crate::logging::{parse_log_level, OutputFormat};
use crate::protocol::command::{GainCode, RateConfig, MAX_PHYSICAL_CHANNEL};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/di245.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "DI245_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial line settings
    pub serial: SerialConfig,
    /// Acquisition loop and buffer sizing
    pub acquisition: AcquisitionConfig,
    /// Burst rate
    pub rate: RateSection,
    /// Scan list; scan position is the index in this list
    pub channels: Vec<ChannelEntry>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

/// Serial line configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port path, e.g. "/dev/ttyUSB0" or "COM3"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Timeout for stream reads during synchronization and block decoding
    pub read_timeout_ms: u64,
    /// Timeout for command echoes and descriptor queries
    pub query_timeout_ms: u64,
}

/// Acquisition loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Scans decoded per block
    pub packet_points: usize,
    /// Ring buffer capacity in scans
    pub buffer_capacity: usize,
    /// Sleep between buffer polls
    pub poll_interval_ms: u64,
    /// Time `stop` waits for the loop to exit
    pub stop_grace_ms: u64,
    /// Bytes discarded while synchronizing before giving up
    pub sync_max_discard: usize,
}

/// Rate selection: either both divisors or a target burst rate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateSection {
    /// SF divisor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_divisor: Option<u8>,
    /// AF divisor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub averaging_divisor: Option<u8>,
    /// Target burst rate in Hz; the closest achievable divisors are used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst_hz: Option<f64>,
}

/// One scan list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// Physical input (0-15)
    pub physical: u8,
    /// Range in volts ("0.01" .. "50") or thermocouple type ("K", "N-type", ...)
    pub code: GainCode,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            serial: SerialConfig::default(),
            acquisition: AcquisitionConfig::default(),
            rate: RateSection::default(),
            channels: default_channels(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "DI-245 acquisition".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            read_timeout_ms: 1000,
            query_timeout_ms: 500,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            packet_points: 10,
            buffer_capacity: 4_320_000,
            poll_interval_ms: 10,
            stop_grace_ms: 1000,
            sync_max_discard: crate::protocol::stream::DEFAULT_MAX_DISCARD,
        }
    }
}

fn default_channels() -> Vec<ChannelEntry> {
    (0..4)
        .map(|physical| ChannelEntry {
            physical,
            code: GainCode::Volts5,
        })
        .collect()
}

impl DaqConfig {
    /// Load from `config/di245.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level)?;
        self.application.log_format.parse::<OutputFormat>()?;

        if self.acquisition.packet_points == 0 {
            return Err(DaqError::Configuration(
                "acquisition.packet_points must be at least 1".to_string(),
            ));
        }
        if self.acquisition.buffer_capacity == 0 {
            return Err(DaqError::Configuration(
                "acquisition.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.acquisition.poll_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "acquisition.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.serial.read_timeout_ms == 0 || self.serial.query_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "serial timeouts must be positive".to_string(),
            ));
        }

        for (position, channel) in self.channels.iter().enumerate() {
            if channel.physical > MAX_PHYSICAL_CHANNEL {
                return Err(DaqError::Configuration(format!(
                    "channels[{position}].physical = {} is out of range (0-{MAX_PHYSICAL_CHANNEL})",
                    channel.physical
                )));
            }
        }
        validate_scan_list(&self.channel_configs()?)?;

        self.rate_config()?;
        Ok(())
    }

    /// Scan list in scan order.
    pub fn channel_configs(&self) -> AppResult<Vec<ChannelConfig>> {
        self.channels
            .iter()
            .enumerate()
            .map(|(position, entry)| {
                let position = u8::try_from(position).map_err(|_| {
                    DaqError::Configuration(format!("too many channels ({})", self.channels.len()))
                })?;
                Ok(ChannelConfig::new(position, entry.physical, entry.code))
            })
            .collect()
    }

    /// Resolve the rate section into divisors.
    pub fn rate_config(&self) -> AppResult<RateConfig> {
        let rate = &self.rate;
        match (rate.sampling_divisor, rate.averaging_divisor, rate.burst_hz) {
            (None, None, None) => Ok(RateConfig::default()),
            (Some(sf), Some(af), None) => Ok(RateConfig::from_divisors(sf, af)),
            (None, None, Some(hz)) => RateConfig::nearest(hz),
            (_, _, Some(_)) => Err(DaqError::Configuration(
                "rate: give either burst_hz or the divisors, not both".to_string(),
            )),
            _ => Err(DaqError::Configuration(
                "rate: sampling_divisor and averaging_divisor must be given together".to_string(),
            )),
        }
    }

    /// Controller settings derived from this configuration.
    pub fn settings(&self) -> AcquisitionSettings {
        let acquisition = &self.acquisition;
        AcquisitionSettings {
            packet_points: acquisition.packet_points,
            buffer_capacity: acquisition.buffer_capacity,
            poll_interval: Duration::from_millis(acquisition.poll_interval_ms),
            stop_grace: Duration::from_millis(acquisition.stop_grace_ms),
            query_timeout: Duration::from_millis(self.serial.query_timeout_ms),
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
            sync_max_discard: acquisition.sync_max_discard,
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DaqConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channels.len(), 4);
        assert_eq!(config.rate_config().unwrap(), RateConfig::from_divisors(79, 7));

        let settings = config.settings();
        assert_eq!(settings.packet_points, 10);
        assert_eq!(settings.buffer_capacity, 4_320_000);
        assert_eq!(settings.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_config_validation() {
        let mut config = DaqConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = DaqConfig::default();
        config.acquisition.packet_points = 0;
        assert!(config.validate().is_err());

        let mut config = DaqConfig::default();
        config.channels.clear();
        assert!(matches!(
            config.validate(),
            Err(DaqError::InvalidScanList(_))
        ));

        let mut config = DaqConfig::default();
        config.channels[1].physical = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rate_section() {
        let mut config = DaqConfig::default();
        config.rate.burst_hz = Some(10.0);
        assert!((config.rate_config().unwrap().burst_hz() - 10.0).abs() < 1e-9);

        config.rate.sampling_divisor = Some(1);
        assert!(config.rate_config().is_err());

        config.rate.burst_hz = None;
        assert!(config.rate_config().is_err());

        config.rate.averaging_divisor = Some(2);
        assert_eq!(
            config.rate_config().unwrap(),
            RateConfig::from_divisors(1, 2)
        );
    }

    #[test]
    fn test_channel_configs_follow_list_order() {
        let mut config = DaqConfig::default();
        config.channels = vec![
            ChannelEntry {
                physical: 2,
                code: GainCode::ThermocoupleK,
            },
            ChannelEntry {
                physical: 0,
                code: GainCode::Millivolts10,
            },
        ];
        let channels = config.channel_configs().unwrap();
        assert_eq!(channels[0], ChannelConfig::new(0, 2, GainCode::ThermocoupleK));
        assert_eq!(channels[1], ChannelConfig::new(1, 0, GainCode::Millivolts10));
    }

    #[test]
    fn test_to_toml_round_trips_through_figment() {
        let config = DaqConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("packet_points = 10"));

        let parsed: DaqConfig = Figment::new()
            .merge(Toml::string(&rendered))
            .extract()
            .unwrap();
        assert_eq!(parsed.channels, config.channels);
    }
}
