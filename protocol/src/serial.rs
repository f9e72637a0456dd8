//! Native asynchronous serial port support for [`CanTransport`](crate::CanTransport).
//!
//! Uses the [`serial2-tokio`](https://crates.io/crates/serial2-tokio) crate.

use crate::Error;
use embedded_io_adapters::tokio_1::FromTokio;
use embedded_io_async::ErrorType;
use serial2_tokio::{SerialPort, Settings};
use std::io::ErrorKind;

/// Serial port type implementing [`Read`](embedded_io_async::Read)
/// and [`Write`](embedded_io_async::Write).
pub type Port = FromTokio<SerialPort>;

/// Port-specific error type to be used as `E` for the generic [`Error<E>`] type.
pub type PortError = <Port as ErrorType>::Error;

/// Opens the serial port of a USB-to-CAN adapter at the given path.
///
/// Returns a [`Port`] that can be passed to
/// [`CanTransport::connect`](crate::CanTransport::connect).
pub fn open(path: &str, baud_rate: u32) -> Result<Port, Error<std::io::Error>> {
    let port = SerialPort::open(path, |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(baud_rate)?;

        Ok(settings)
    })
    .map_err(|err| match err.kind() {
        ErrorKind::NotFound => Error::PortNotFound(path.into()),
        ErrorKind::PermissionDenied => Error::PermissionDenied(path.into()),
        _ => Error::Io(err),
    })?;

    port.discard_buffers().map_err(Error::Io)?;

    Ok(FromTokio::new(port))
}
