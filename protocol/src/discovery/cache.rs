//! Persistent element cache.
//!
//! A [`CacheSnapshot`] records the outcome of a discovery attempt. Snapshots are
//! stored as versioned JSON. Version 1 files, which lack byte counts and use a
//! Unix timestamp, are migrated on load.

use super::{DiscoveredElement, DiscoveryReport, parser::HEADER_LEN};
use chrono::{DateTime, TimeDelta, Utc};
use core::fmt::{Display, Formatter};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// Error type for cache operations.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// The cache file could not be read or written.
    Io(std::io::Error),
    /// The cache file is not valid JSON or does not match the schema.
    Json(serde_json::Error),
    /// The cache file carries no schema version.
    MissingVersion,
    /// The cache file uses an unknown schema version.
    UnsupportedVersion(u64),
    /// A legacy timestamp is out of range.
    InvalidTimestamp(f64),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "input/output error: {err}"),
            Self::Json(err) => write!(f, "invalid cache file: {err}"),
            Self::MissingVersion => write!(f, "cache file has no schema version"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported cache schema version: {version}")
            }
            Self::InvalidTimestamp(timestamp) => write!(f, "invalid timestamp: {timestamp}"),
        }
    }
}

impl core::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

/// Snapshot of a discovery attempt.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct CacheSnapshot {
    /// Schema version, always [`SCHEMA_VERSION`] after loading.
    pub version: u32,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Byte count reported by the device.
    pub reported_bytes: u32,
    /// Byte count actually received.
    pub actual_bytes: usize,
    /// Whether the attempt passed the completeness check.
    pub complete: bool,
    /// Discovered elements.
    pub elements: Vec<DiscoveredElement>,
}

#[derive(Deserialize)]
struct LegacySnapshot {
    timestamp: f64,
    elements: Vec<DiscoveredElement>,
}

#[derive(Deserialize)]
struct Versioned {
    version: Option<u64>,
}

impl CacheSnapshot {
    /// Captures a complete discovery report.
    #[must_use]
    pub fn from_report(report: &DiscoveryReport) -> Self {
        Self {
            version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            reported_bytes: report.reported_bytes,
            actual_bytes: report.actual_bytes,
            complete: true,
            elements: report.elements.clone(),
        }
    }

    /// Parses a snapshot, migrating older schema versions.
    pub fn from_json(data: &[u8]) -> Result<Self, Error> {
        let Versioned { version } = serde_json::from_slice(data)?;

        match version.ok_or(Error::MissingVersion)? {
            1 => {
                let legacy: LegacySnapshot = serde_json::from_slice(data)?;

                debug!("Migrating version 1 element cache");
                Self::migrate(legacy)
            }
            2 => Ok(serde_json::from_slice(data)?),
            version => Err(Error::UnsupportedVersion(version)),
        }
    }

    /// Version 1 snapshots were only written after successful discoveries,
    /// so they are taken as complete with byte counts derived from the records.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn migrate(legacy: LegacySnapshot) -> Result<Self, Error> {
        let secs = legacy.timestamp.trunc();
        let nanos = (legacy.timestamp.fract() * 1e9) as u32;
        let timestamp = (secs.is_finite() && secs.abs() < 1e15)
            .then(|| DateTime::from_timestamp(secs as i64, nanos))
            .flatten()
            .ok_or(Error::InvalidTimestamp(legacy.timestamp))?;
        let bytes: usize = legacy
            .elements
            .iter()
            .map(|element| HEADER_LEN + element.name.len())
            .sum();

        Ok(Self {
            version: SCHEMA_VERSION,
            timestamp,
            reported_bytes: u32::try_from(bytes).unwrap_or(u32::MAX),
            actual_bytes: bytes,
            complete: true,
            elements: legacy.elements,
        })
    }

    /// Serializes the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Returns the age of the snapshot. Timestamps in the future count as zero.
    #[must_use]
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.timestamp)
            .max(TimeDelta::zero())
            .to_std()
            .unwrap_or_default()
    }

    /// Returns whether the snapshot may be used instead of a live discovery.
    #[must_use]
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.complete && self.age() <= max_age
    }
}

/// Storage backend for cache snapshots.
pub trait CacheStore {
    /// Loads the stored snapshot, if any.
    fn load(&self) -> Result<Option<CacheSnapshot>, Error>;

    /// Replaces the stored snapshot.
    fn save(&self, snapshot: &CacheSnapshot) -> Result<(), Error>;
}

/// Cache store backed by a JSON file.
///
/// Writes go to a temporary file which is then renamed over the target,
/// so readers never observe a partially written snapshot.
#[derive(Clone, Debug)]
pub struct FileCacheStore {
    path: PathBuf,
}

impl FileCacheStore {
    /// Constructs a store for the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path of the cache file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStore for FileCacheStore {
    fn load(&self) -> Result<Option<CacheSnapshot>, Error> {
        match std::fs::read(&self.path) {
            Ok(data) => CacheSnapshot::from_json(&data).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, snapshot: &CacheSnapshot) -> Result<(), Error> {
        let mut tmp = self.path.clone().into_os_string();

        tmp.push(".tmp");

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&tmp, snapshot.to_json()?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Element cache written to {}", self.path.display());

        Ok(())
    }
}

/// Cache store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    snapshot: Mutex<Option<CacheSnapshot>>,
}

impl MemoryCacheStore {
    /// Constructs an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a store holding the given snapshot.
    #[must_use]
    pub fn with_snapshot(snapshot: CacheSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    /// Returns the stored snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Option<CacheSnapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CacheStore for MemoryCacheStore {
    fn load(&self) -> Result<Option<CacheSnapshot>, Error> {
        Ok(self.snapshot())
    }

    fn save(&self, snapshot: &CacheSnapshot) -> Result<(), Error> {
        *self
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());

        Ok(())
    }
}
