//! Communicate with heat pump controllers via a USB-to-CAN serial adapter.
//!
//! # Overview
//!
//! The `hpcan` crate implements the protocol engine needed to read sensor values
//! from, and write control parameters to, heat pump controllers that expose their
//! state over a proprietary CAN bus. The bus is reached through a USB-to-CAN
//! adapter speaking the ASCII SLCAN line protocol.
//!
//! It offers an asynchronous, port-agnostic API built from the following parts:
//!
//! - [`message`]: the validated [`CanMessage`] value type and its ASCII frame codec.
//! - [`transport`]: the [`CanTransport`], which owns the serial link, performs the
//!   adapter handshake and enforces a single in-flight transaction.
//! - [`discovery`]: the device's element discovery protocol, which reports the live
//!   parameter index table, including the cache and fallback policy.
//! - [`registry`]: the [`ParameterRegistry`], a compiled default table overridden
//!   by discovery results.
//! - [`codec`]: conversions between raw payloads and values for the device's
//!   numeric formats.
//! - [`client`]: the [`HeatPumpClient`] executing read and write transactions.
//! - [`queue`]: the rate-limited [`CommandQueue`], the only path that issues writes.
//! - [`engine`]: startup orchestration tying all of the above together.
//!
//! # Getting started
//!
//! If you enable the `native-serial` feature, you can open an adapter and start the
//! engine like this:
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> hpcan::Result<(), hpcan::serial::PortError> {
//! use hpcan::{Config, Engine, discovery::cache::FileCacheStore};
//! use std::time::Duration;
//!
//! let config = Config::default();
//! let port = hpcan::serial::open("/dev/ttyACM0", config.transport.baud_rate)?;
//! let store = FileCacheStore::new("elements.json");
//! let engine = Engine::start(port, &config, &store).await?;
//!
//! let reading = engine
//!     .client()
//!     .read_parameter("GT3_TEMP", Duration::from_secs(2))
//!     .await?;
//!
//! println!("{}: {}", reading.name, reading.value);
//! # Ok(())
//! # }
//! ```
//!
//! # Protocol details
//!
//! Every parameter is addressed by a small integer index (`idx`) assigned by the
//! controller firmware. A read is a remote frame on `0x04003FE0 | idx << 14`,
//! answered on `0x0C003FE0 | idx << 14`. Because firmware builds assign different
//! indices to the same named parameter, the engine retrieves the live index table
//! from the device before trusting any index.
//!
//! The adapter is half-duplex and carries no sequence numbers, while the bus
//! interleaves unsolicited broadcast traffic with responses. Callers therefore
//! always filter received frames by identifier.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod message;
pub mod queue;
pub mod registry;
pub mod transport;

#[cfg(feature = "native-serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "native-serial")))]
pub mod serial;

#[cfg(test)]
mod test_utils;

pub use client::{HeatPumpClient, ParameterReading};
pub use config::Config;
pub use embedded_io_async;
pub use engine::Engine;
pub use message::CanMessage;
pub use queue::CommandQueue;
pub use registry::{Parameter, ParameterKey, ParameterRegistry};
pub use transport::CanTransport;

use core::fmt::{Display, Formatter};
use message::FrameError;
use std::time::Duration;
use transport::{HandshakeStep, TransportState};

/// A specialized [`Result`] type for engine operations.
///
/// Uses [`Error<E>`] as the error variant, which can include port-specific errors.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Error classification.
///
/// Every [`Error`] variant belongs to exactly one kind, which determines
/// how a caller should react to it.
#[derive(strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Fatal to the current session, requires a full reconnect.
    Connection,
    /// Transient, safe to retry the specific operation.
    Timeout,
    /// Caller error, never retried.
    Validation,
    /// Malformed or persistently mismatched response.
    Communication,
    /// Element discovery could not produce a trustworthy index table.
    Discovery,
}

/// Error type for engine operations.
///
/// The generic parameter `E` allows the error type to carry a port-specific error.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error<E> {
    /// The serial port does not exist.
    PortNotFound(String),
    /// Access to the serial port was denied.
    PermissionDenied(String),
    /// The transport is already connected.
    AlreadyConnected,
    /// The transport is not connected.
    NotConnected,
    /// The port reported end-of-file in the middle of an operation.
    Disconnected,
    /// The adapter handshake failed at the given step.
    InitializationFailed {
        /// Handshake step that failed.
        step: HandshakeStep,
        /// Underlying failure.
        cause: Box<Error<E>>,
    },
    /// Another operation is in flight on the transport.
    Busy(TransportState),
    /// No matching data arrived within the allotted time.
    Timeout {
        /// Name of the timed out operation.
        operation: &'static str,
        /// Time spent before giving up.
        elapsed: Duration,
    },
    /// The adapter rejected a command.
    Nack,
    /// The adapter replied with something other than the expected acknowledgement.
    UnexpectedReply(String),
    /// A CAN frame could not be constructed or parsed.
    Frame(FrameError),
    /// A response frame carried an unusable payload.
    MalformedResponse {
        /// Identifier of the offending frame.
        id: u32,
        /// Description of the defect.
        reason: &'static str,
    },
    /// Frames arrived, but none carried the expected identifier.
    UnexpectedResponse {
        /// Expected identifier.
        expected: u32,
        /// Identifier of the last discarded frame.
        actual: u32,
        /// Number of discarded frames.
        discarded: usize,
    },
    /// The referenced parameter is unknown.
    UnknownParameter(ParameterKey),
    /// The referenced parameter cannot be written.
    ReadOnly(String),
    /// The referenced parameter's index belongs to another parameter.
    IndexConflict {
        /// Name of the referenced parameter.
        name: String,
        /// Index shared by both parameters.
        idx: u16,
        /// Name of the parameter owning the index.
        owner: String,
    },
    /// A value could not be encoded or decoded.
    Codec(codec::Error),
    /// A command input is not acceptable for its entity.
    InvalidInput(String),
    /// The referenced composite operation is not registered.
    UnknownOperation(String),
    /// Element discovery received too little data.
    DiscoveryIncomplete {
        /// Byte count reported by the device.
        reported: u32,
        /// Byte count actually received.
        actual: usize,
        /// Required ratio of actual to reported bytes.
        threshold: f64,
    },
    /// Element discovery failed and no usable cached snapshot exists.
    DiscoveryRequired(String),
    /// The element cache could not be read or written.
    Cache(discovery::cache::Error),
    /// A port-specific input/output error.
    Io(E),
}

impl<E> Error<E> {
    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PortNotFound(_)
            | Self::PermissionDenied(_)
            | Self::AlreadyConnected
            | Self::NotConnected
            | Self::Disconnected
            | Self::InitializationFailed { .. }
            | Self::Io(_) => ErrorKind::Connection,
            Self::Busy(_) | Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UnknownParameter(_)
            | Self::ReadOnly(_)
            | Self::InvalidInput(_)
            | Self::UnknownOperation(_) => ErrorKind::Validation,
            Self::Codec(err) if err.is_validation() => ErrorKind::Validation,
            Self::Codec(_)
            | Self::Nack
            | Self::UnexpectedReply(_)
            | Self::Frame(_)
            | Self::MalformedResponse { .. }
            | Self::UnexpectedResponse { .. } => ErrorKind::Communication,
            Self::IndexConflict { .. }
            | Self::DiscoveryIncomplete { .. }
            | Self::DiscoveryRequired(_)
            | Self::Cache(_) => ErrorKind::Discovery,
        }
    }

    /// Returns whether retrying the failed operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Communication)
    }
}

impl<E: core::error::Error> Display for Error<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PortNotFound(port) => write!(f, "serial port not found: {port}"),
            Self::PermissionDenied(port) => write!(f, "permission denied for serial port: {port}"),
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Disconnected => write!(f, "adapter disconnected"),
            Self::InitializationFailed { step, cause } => {
                write!(f, "adapter initialization failed at {step}: {cause}")
            }
            Self::Busy(state) => write!(f, "transport busy ({state})"),
            Self::Timeout { operation, elapsed } => {
                write!(f, "{operation} timed out after {} ms", elapsed.as_millis())
            }
            Self::Nack => write!(f, "adapter rejected command"),
            Self::UnexpectedReply(reply) => write!(f, "unexpected adapter reply: {reply:?}"),
            Self::Frame(err) => write!(f, "frame error: {err}"),
            Self::MalformedResponse { id, reason } => {
                write!(f, "malformed response on {id:08x}: {reason}")
            }
            Self::UnexpectedResponse {
                expected,
                actual,
                discarded,
            } => write!(
                f,
                "expected response on {expected:08x}, discarded {discarded} frame(s), last on {actual:08x}"
            ),
            Self::UnknownParameter(key) => write!(f, "unknown parameter: {key}"),
            Self::ReadOnly(name) => write!(f, "parameter is read-only: {name}"),
            Self::IndexConflict { name, idx, owner } => {
                write!(f, "index {idx} of {name} belongs to {owner}")
            }
            Self::Codec(err) => write!(f, "value error: {err}"),
            Self::InvalidInput(reason) => write!(f, "invalid input: {reason}"),
            Self::UnknownOperation(name) => write!(f, "unknown operation: {name}"),
            Self::DiscoveryIncomplete {
                reported,
                actual,
                threshold,
            } => write!(
                f,
                "element discovery incomplete: received {actual} of {reported} bytes (threshold {:.0} %)",
                threshold * 100.0
            ),
            Self::DiscoveryRequired(reason) => write!(
                f,
                "element discovery failed and no complete cached snapshot exists ({reason}); \
                 check the adapter connection and retry, the static index table is not trusted"
            ),
            Self::Cache(err) => write!(f, "element cache error: {err}"),
            Self::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for Error<E> {}

impl<E> From<FrameError> for Error<E> {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

impl<E> From<codec::Error> for Error<E> {
    fn from(err: codec::Error) -> Self {
        Self::Codec(err)
    }
}

impl<E> From<discovery::cache::Error> for Error<E> {
    fn from(err: discovery::cache::Error) -> Self {
        Self::Cache(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    #[test]
    fn error_kinds() {
        let timeout: Error<Infallible> = Error::Timeout {
            operation: "read",
            elapsed: Duration::from_millis(5),
        };

        assert_eq!(timeout.kind(), ErrorKind::Timeout, "kind should be timeout");
        assert!(timeout.is_transient(), "timeout should be transient");

        let unknown: Error<Infallible> = Error::UnknownParameter(ParameterKey::Index(7));

        assert_eq!(
            unknown.kind(),
            ErrorKind::Validation,
            "kind should be validation"
        );
        assert!(!unknown.is_transient(), "validation should not be transient");

        let range: Error<Infallible> = codec::encode_temp(4000.0).unwrap_err().into();

        assert_eq!(
            range.kind(),
            ErrorKind::Validation,
            "out-of-range value should be a validation error"
        );

        let length: Error<Infallible> = codec::decode_temp(&[0x01]).unwrap_err().into();

        assert_eq!(
            length.kind(),
            ErrorKind::Communication,
            "wrong payload length should be a communication error"
        );

        let required: Error<Infallible> = Error::DiscoveryRequired("timeout".into());

        assert_eq!(
            required.kind(),
            ErrorKind::Discovery,
            "kind should be discovery"
        );

        let conflict: Error<Infallible> = Error::IndexConflict {
            name: "XDHW_ACTIVE".into(),
            idx: 2480,
            owner: "XDHW_TIME".into(),
        };

        assert_eq!(
            conflict.kind(),
            ErrorKind::Discovery,
            "index conflict should be a discovery error"
        );
        assert!(!conflict.is_transient(), "index conflict should not be transient");
        assert_eq!(
            Error::<Infallible>::Disconnected.kind(),
            ErrorKind::Connection,
            "kind should be connection"
        );
    }

    #[test]
    fn error_display() {
        let err: Error<Infallible> = Error::UnexpectedResponse {
            expected: 0x0C26_BFE0,
            actual: 0x0123_4567,
            discarded: 3,
        };

        assert_eq!(
            err.to_string(),
            "expected response on 0c26bfe0, discarded 3 frame(s), last on 01234567",
            "message should be correct"
        );
    }
}
