//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid configuration.
//! Durations are stored as integer milliseconds or seconds and exposed as
//! [`Duration`] through accessor methods.

use crate::transport::Bitrate;
use core::fmt::{Display, Formatter};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Error type for loading a configuration file.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// The file could not be read.
    Io(std::io::Error),
    /// The file does not contain a valid configuration.
    Json(serde_json::Error),
    /// A value lies outside its permitted range.
    Invalid(&'static str),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read configuration: {err}"),
            Self::Json(err) => write!(f, "invalid configuration: {err}"),
            Self::Invalid(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl core::error::Error for Error {}

/// Complete engine configuration.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    /// Serial link and adapter settings.
    pub transport: TransportConfig,
    /// Element discovery policy.
    pub discovery: DiscoveryConfig,
    /// Command queue pacing.
    pub queue: QueueConfig,
    /// Location of the element cache file.
    pub cache_path: Option<PathBuf>,
}

impl Config {
    /// Loads a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let data = std::fs::read(path).map_err(Error::Io)?;

        Self::from_json(&data)
    }

    /// Parses a configuration from JSON.
    pub fn from_json(data: &[u8]) -> Result<Self, Error> {
        let config: Self = serde_json::from_slice(data).map_err(Error::Json)?;

        config.validate()?;

        Ok(config)
    }

    /// Checks values that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), Error> {
        let threshold = self.discovery.completeness_threshold;

        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Invalid("completeness threshold must lie in (0, 1]"));
        }

        if self.discovery.chunk_size == 0 {
            return Err(Error::Invalid("chunk size must not be zero"));
        }

        if self.discovery.max_element_bytes == 0 {
            return Err(Error::Invalid("element table limit must not be zero"));
        }

        if self.discovery.attempts == 0 || self.discovery.count_retries == 0 {
            return Err(Error::Invalid("retry counts must not be zero"));
        }

        Ok(())
    }
}

/// Serial link and adapter settings.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default)]
pub struct TransportConfig {
    /// Serial baud rate.
    pub baud_rate: u32,
    /// CAN bus bitrate configured during the handshake.
    pub bitrate: Bitrate,
    /// Time the adapter needs after the port is opened.
    pub settle_delay_ms: u64,
    /// Time allowed for each handshake step.
    pub step_timeout_ms: u64,
    /// Quiet period that ends an input flush.
    pub flush_window_ms: u64,
}

impl TransportConfig {
    /// Returns the settle delay.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Returns the per-step handshake timeout.
    #[must_use]
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Returns the flush window.
    #[must_use]
    pub fn flush_window(&self) -> Duration {
        Duration::from_millis(self.flush_window_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            bitrate: Bitrate::Kbit125,
            settle_delay_ms: 2000,
            step_timeout_ms: 500,
            flush_window_ms: 20,
        }
    }
}

/// Element discovery policy.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Minimum ratio of received to reported bytes.
    pub completeness_threshold: f64,
    /// Bytes requested per data chunk.
    pub chunk_size: u32,
    /// Largest element table accepted from the device, in bytes.
    pub max_element_bytes: u32,
    /// Attempts at querying the element count.
    pub count_retries: u32,
    /// Time allowed for each element count attempt.
    pub count_timeout_ms: u64,
    /// Whole discovery attempts before falling back to the cache.
    pub attempts: u32,
    /// Pause between whole discovery attempts.
    pub retry_backoff_ms: u64,
    /// Time allowed for each data chunk.
    pub chunk_timeout_ms: u64,
    /// Wall-clock limit for a single discovery attempt.
    pub deadline_secs: u64,
    /// Age after which a cached snapshot is refreshed.
    pub cache_max_age_secs: u64,
    /// Query the device even if a fresh cached snapshot exists.
    pub force_refresh: bool,
}

impl DiscoveryConfig {
    /// Returns the element count timeout.
    #[must_use]
    pub fn count_timeout(&self) -> Duration {
        Duration::from_millis(self.count_timeout_ms)
    }

    /// Returns the retry backoff.
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Returns the per-chunk timeout.
    #[must_use]
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    /// Returns the overall discovery deadline.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Returns the maximum cache age.
    #[must_use]
    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            completeness_threshold: 0.95,
            chunk_size: 4096,
            max_element_bytes: 1 << 20,
            count_retries: 3,
            count_timeout_ms: 2000,
            attempts: 3,
            retry_backoff_ms: 2000,
            chunk_timeout_ms: 5000,
            deadline_secs: 120,
            cache_max_age_secs: 7 * 24 * 60 * 60,
            force_refresh: false,
        }
    }
}

/// Command queue pacing.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default)]
pub struct QueueConfig {
    /// Minimum spacing between two dispatched commands.
    pub min_delay_ms: u64,
    /// Age after which an undispatched command expires.
    pub expiry_secs: u64,
    /// Time allowed for each write.
    pub write_timeout_ms: u64,
}

impl QueueConfig {
    /// Returns the minimum inter-command delay.
    #[must_use]
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    /// Returns the command expiry window.
    #[must_use]
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    /// Returns the write timeout.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            expiry_secs: 30,
            write_timeout_ms: 2000,
        }
    }
}
