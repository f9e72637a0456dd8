//! SLCAN transport over a serial port.
//!
//! [`CanTransport`] owns the port of a USB-to-CAN adapter speaking the ASCII
//! SLCAN line protocol. It performs the adapter handshake on [`connect`] and
//! afterwards exchanges CR-terminated frame lines.
//!
//! The link is half-duplex and carries no sequence numbers, so at most one
//! operation may be in flight at a time. A concurrent call fails immediately
//! with [`Error::Busy`] instead of interleaving bytes on the wire.
//!
//! [`connect`]: CanTransport::connect

use crate::{CanMessage, Error, Result, config::TransportConfig, message::FrameError};
use bitflags_derive::{FlagsDebug, FlagsDisplay};
use core::sync::atomic::{AtomicU8, Ordering};
use embedded_io_async::{Read, Write};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Mutex as StdMutex, PoisonError},
    time::Duration,
};
use strum::FromRepr;
use tokio::{
    sync::{Mutex, MutexGuard},
    time::{Instant, sleep, timeout, timeout_at},
};

const CR: u8 = b'\r';
const BEL: u8 = 0x07;

/// Flush windows after which a flush gives up on a busy bus.
const FLUSH_WINDOWS: u32 = 8;

/// CAN bus bitrate configured on the adapter.
#[derive(Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Debug)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Bitrate {
    /// 10 kbit/s.
    Kbit10,
    /// 20 kbit/s.
    Kbit20,
    /// 50 kbit/s.
    Kbit50,
    /// 100 kbit/s.
    Kbit100,
    /// 125 kbit/s, used by the heat pump bus.
    Kbit125,
    /// 250 kbit/s.
    Kbit250,
    /// 500 kbit/s.
    Kbit500,
    /// 800 kbit/s.
    Kbit800,
    /// 1 Mbit/s.
    Mbit1,
}

impl Bitrate {
    /// Returns the numeric bitrate value.
    #[must_use]
    pub const fn as_bits_per_second(self) -> u32 {
        match self {
            Self::Kbit10 => 10_000,
            Self::Kbit20 => 20_000,
            Self::Kbit50 => 50_000,
            Self::Kbit100 => 100_000,
            Self::Kbit125 => 125_000,
            Self::Kbit250 => 250_000,
            Self::Kbit500 => 500_000,
            Self::Kbit800 => 800_000,
            Self::Mbit1 => 1_000_000,
        }
    }
}

/// State of the transport.
#[derive(strum::Display, FromRepr, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum TransportState {
    /// No port is attached.
    Disconnected,
    /// Connected and ready for the next operation.
    Idle,
    /// A line is being written to the adapter.
    Sending,
    /// Waiting for the adapter or the bus to respond.
    AwaitingResponse,
}

/// Step of the adapter handshake.
#[derive(strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "title_case")]
pub enum HandshakeStep {
    /// Close the CAN channel (`C`).
    CloseChannel,
    /// Read the hardware version (`V`).
    HardwareVersion,
    /// Read the firmware version (`v`).
    FirmwareVersion,
    /// Configure the bus bitrate (`Sn`).
    SetBitrate,
    /// Open the CAN channel (`O`).
    OpenChannel,
}

impl HandshakeStep {
    fn command(self, bitrate: Bitrate) -> String {
        match self {
            Self::CloseChannel => "C\r".into(),
            Self::HardwareVersion => "V\r".into(),
            Self::FirmwareVersion => "v\r".into(),
            Self::SetBitrate => format!("S{}\r", bitrate as u8),
            Self::OpenChannel => "O\r".into(),
        }
    }
}

/// Handshake sequence.
///
/// The channel is closed twice and the hardware version read twice because
/// adapters may still be busy with a previous session on the first attempt.
const HANDSHAKE: [HandshakeStep; 7] = [
    HandshakeStep::CloseChannel,
    HandshakeStep::CloseChannel,
    HandshakeStep::HardwareVersion,
    HandshakeStep::HardwareVersion,
    HandshakeStep::FirmwareVersion,
    HandshakeStep::SetBitrate,
    HandshakeStep::OpenChannel,
];

bitflags::bitflags! {
    /// Adapter status reported by the `F` command.
    ///
    /// Bits not listed here are retained when decoding.
    #[derive(FlagsDisplay, FlagsDebug, PartialEq, Eq, Copy, Clone)]
    pub struct StatusFlags: u8 {
        /// Receive queue full.
        const RxQueueFull = 0x01;
        /// Transmit queue full.
        const TxQueueFull = 0x02;
        /// Bus error warning limit reached.
        const ErrorWarning = 0x04;
        /// Data overrun.
        const DataOverrun = 0x08;
        /// Controller is error passive.
        const ErrorPassive = 0x20;
        /// Arbitration lost.
        const ArbitrationLost = 0x40;
        /// Bus error.
        const BusError = 0x80;
    }
}

/// Version strings reported by the adapter during the handshake.
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct AdapterVersions {
    /// Hardware version (reply to `V`, without the prefix).
    pub hardware: String,
    /// Firmware version (reply to `v`, without the prefix).
    pub firmware: String,
}

/// Point in time by which an operation must complete.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Deadline {
    operation: &'static str,
    started: Instant,
    until: Instant,
}

impl Deadline {
    pub(crate) fn after(operation: &'static str, timeout: Duration) -> Self {
        let started = Instant::now();

        Self {
            operation,
            started,
            until: started + timeout,
        }
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.until.saturating_duration_since(Instant::now())
    }

    pub(crate) fn is_expired(&self) -> bool {
        Instant::now() >= self.until
    }

    pub(crate) fn expired<E>(&self) -> Error<E> {
        Error::Timeout {
            operation: self.operation,
            elapsed: self.started.elapsed(),
        }
    }
}

/// A single line received from the adapter.
#[derive(Debug)]
enum Reply {
    /// Empty line or `z`/`Z` acknowledgement.
    Ack,
    /// BEL, the adapter rejected the last command.
    Nack,
    /// A CAN frame.
    Frame(CanMessage),
    /// A line that looks like a frame but cannot be parsed.
    Malformed(String, FrameError),
    /// Any other line, e.g. a version or status reply.
    Other(String),
}

impl Reply {
    fn parse(line: &[u8]) -> Self {
        let Some((&term, body)) = line.split_last() else {
            return Self::Ack;
        };

        if term == BEL {
            trace!("Read from port: NACK");

            return Self::Nack;
        }

        let text = String::from_utf8_lossy(body);

        trace!("Read from port: {text:?}");

        match text.as_ref() {
            "" | "z" | "Z" => Self::Ack,
            frame if frame.starts_with(['t', 'T', 'r', 'R']) => {
                match CanMessage::from_ascii(frame) {
                    Ok(msg) => Self::Frame(msg.with_timestamp(Instant::now())),
                    Err(err) => Self::Malformed(frame.into(), err),
                }
            }
            other => Self::Other(other.into()),
        }
    }
}

/// An attached port with its receive buffer.
#[derive(Debug)]
struct Link<P> {
    port: P,
    pending: Vec<u8>,
}

impl<P: Read + Write> Link<P> {
    fn new(port: P) -> Self {
        Self {
            port,
            pending: Vec::new(),
        }
    }

    async fn write(&mut self, line: &str) -> Result<(), P::Error> {
        trace!("Write to port: {line:?}");
        self.port
            .write_all(line.as_bytes())
            .await
            .map_err(Error::Io)?;
        self.port.flush().await.map_err(Error::Io)
    }

    /// Reads the next CR- or BEL-terminated line.
    ///
    /// Cancellation safe, a partially received line is kept for the next call.
    async fn read(&mut self) -> Result<Reply, P::Error> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == CR || b == BEL) {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();

                return Ok(Reply::parse(&line));
            }

            let mut buf = [0x00; 64];
            let len = self.port.read(&mut buf).await.map_err(Error::Io)?;

            if len == 0 {
                return Err(Error::Disconnected);
            }

            self.pending.extend_from_slice(&buf[..len]);
        }
    }

    /// Discards buffered input until the port stays quiet for `window`.
    async fn discard_input(&mut self, window: Duration) -> Result<usize, P::Error> {
        let mut discarded = self.pending.len();
        let limit = Instant::now() + window * FLUSH_WINDOWS;
        let mut buf = [0x00; 64];

        self.pending.clear();

        while Instant::now() < limit {
            match timeout(window, self.port.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => return Err(Error::Disconnected),
                Ok(Ok(len)) => {
                    trace!(
                        "Discarding stale input: {:?}",
                        String::from_utf8_lossy(&buf[..len])
                    );
                    discarded += len;
                }
                Ok(Err(err)) => return Err(Error::Io(err)),
            }
        }

        Ok(discarded)
    }
}

/// Exclusive access to the link for the duration of one operation.
///
/// Returns the transport to [`TransportState::Idle`] when dropped, or to
/// [`TransportState::Disconnected`] if the link was lost meanwhile.
struct Transaction<'a, P> {
    state: &'a AtomicU8,
    link: MutexGuard<'a, Option<Link<P>>>,
}

impl<P: Read + Write> Transaction<'_, P> {
    fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn link(&mut self) -> Result<&mut Link<P>, P::Error> {
        self.link.as_mut().ok_or(Error::NotConnected)
    }

    /// Drops the port if the result indicates a lost connection.
    fn check<T>(&mut self, res: Result<T, P::Error>) -> Result<T, P::Error> {
        if matches!(res, Err(Error::Disconnected | Error::Io(_))) {
            warn!("Adapter link lost, closing port");
            *self.link = None;
        }

        res
    }

    async fn write(&mut self, line: &str) -> Result<(), P::Error> {
        let res = self.link()?.write(line).await;

        self.check(res)
    }

    async fn read(&mut self, deadline: &Deadline) -> Result<Reply, P::Error> {
        let Ok(res) = timeout_at(deadline.until, self.link()?.read()).await else {
            return Err(deadline.expired());
        };

        self.check(res)
    }

    async fn flush(&mut self, window: Duration) -> Result<usize, P::Error> {
        let res = self.link()?.discard_input(window).await;
        let discarded = self.check(res)?;

        if discarded > 0 {
            debug!("Flushed {discarded} stale byte(s)");
        }

        Ok(discarded)
    }

    async fn await_frame(
        &mut self,
        deadline: &Deadline,
        nack_is_error: bool,
    ) -> Result<CanMessage, P::Error> {
        loop {
            match self.read(deadline).await? {
                Reply::Frame(msg) => return Ok(msg),
                Reply::Nack if nack_is_error => return Err(Error::Nack),
                reply => ignore(&reply),
            }
        }
    }

    async fn await_ack(&mut self, deadline: &Deadline) -> Result<(), P::Error> {
        loop {
            match self.read(deadline).await? {
                Reply::Ack => return Ok(()),
                Reply::Nack => return Err(Error::Nack),
                Reply::Other(line) => return Err(Error::UnexpectedReply(line)),
                reply => ignore(&reply),
            }
        }
    }
}

impl<P> Drop for Transaction<'_, P> {
    fn drop(&mut self) {
        let state = if self.link.is_some() {
            TransportState::Idle
        } else {
            TransportState::Disconnected
        };

        self.state.store(state as u8, Ordering::SeqCst);
    }
}

fn ignore(reply: &Reply) {
    match reply {
        Reply::Ack => {}
        Reply::Nack => warn!("Ignoring stray adapter NACK"),
        Reply::Frame(msg) => debug!("Discarding frame {msg}"),
        Reply::Malformed(line, err) => warn!("Discarding malformed frame {line:?}: {err}"),
        Reply::Other(line) => debug!("Ignoring adapter reply {line:?}"),
    }
}

/// Asynchronous SLCAN transport.
///
/// Requires a port that implements [`Read`] and [`Write`]. All methods take
/// `&self`, so a transport can be shared through an [`Arc`](std::sync::Arc)
/// between the client, discovery and the command queue. The single in-flight
/// guard still applies to every shared handle.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> hpcan::Result<(), hpcan::serial::PortError> {
/// use hpcan::{CanMessage, CanTransport, config::TransportConfig};
/// use std::time::Duration;
///
/// let config = TransportConfig::default();
/// let port = hpcan::serial::open("/dev/ttyACM0", config.baud_rate)?;
/// let transport = CanTransport::new(config);
///
/// transport.connect(port).await?;
///
/// let request = CanMessage::remote(hpcan::message::request_id(2480), 0, true)?;
/// let response = transport
///     .send_frame(&request, Duration::from_secs(1))
///     .await?;
///
/// println!("Response: {response}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CanTransport<P> {
    config: TransportConfig,
    state: AtomicU8,
    link: Mutex<Option<Link<P>>>,
    versions: StdMutex<Option<AdapterVersions>>,
}

impl<P> CanTransport<P> {
    /// Constructs a disconnected transport.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(TransportState::Disconnected as u8),
            link: Mutex::new(None),
            versions: StdMutex::new(None),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> TransportState {
        TransportState::from_repr(self.state.load(Ordering::SeqCst))
            .unwrap_or(TransportState::Disconnected)
    }

    /// Returns whether a port is attached.
    pub fn is_connected(&self) -> bool {
        self.state() != TransportState::Disconnected
    }

    /// Returns the adapter versions recorded during the last successful handshake.
    pub fn versions(&self) -> Option<AdapterVersions> {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl<P: Read + Write> CanTransport<P> {
    /// Attaches a port and performs the adapter handshake.
    ///
    /// Waits for the adapter to settle, then closes the channel, reads the
    /// hardware and firmware versions, configures the bitrate and opens the
    /// channel. If any step is rejected or times out, the port is dropped and
    /// [`Error::InitializationFailed`] names the failed step.
    pub async fn connect(&self, port: P) -> Result<(), P::Error> {
        let guard = self
            .link
            .try_lock()
            .map_err(|_| Error::Busy(self.state()))?;

        if guard.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let mut tx = Transaction {
            state: &self.state,
            link: guard,
        };

        *tx.link = Some(Link::new(port));
        tx.set_state(TransportState::Sending);

        debug!(
            "Waiting {} ms for adapter to settle",
            self.config.settle_delay().as_millis()
        );
        sleep(self.config.settle_delay()).await;

        match self.handshake(&mut tx).await {
            Ok(versions) => {
                info!(
                    "Adapter connected (hardware {}, firmware {}, {} bit/s)",
                    versions.hardware,
                    versions.firmware,
                    self.config.bitrate.as_bits_per_second()
                );
                *self.versions.lock().unwrap_or_else(PoisonError::into_inner) = Some(versions);

                Ok(())
            }
            Err(err) => {
                warn!("Adapter handshake failed: {err:?}");
                *tx.link = None;

                Err(err)
            }
        }
    }

    async fn handshake(&self, tx: &mut Transaction<'_, P>) -> Result<AdapterVersions, P::Error> {
        let mut versions = AdapterVersions::default();

        tx.flush(self.config.flush_window())
            .await
            .map_err(|err| Error::InitializationFailed {
                step: HANDSHAKE[0],
                cause: Box::new(err),
            })?;

        for step in HANDSHAKE {
            self.handshake_step(tx, step, &mut versions)
                .await
                .map_err(|err| Error::InitializationFailed {
                    step,
                    cause: Box::new(err),
                })?;
        }

        Ok(versions)
    }

    async fn handshake_step(
        &self,
        tx: &mut Transaction<'_, P>,
        step: HandshakeStep,
        versions: &mut AdapterVersions,
    ) -> Result<(), P::Error> {
        let deadline = Deadline::after("handshake step", self.config.step_timeout());

        debug!("Handshake step: {step}");
        tx.write(&step.command(self.config.bitrate)).await?;

        loop {
            match (step, tx.read(&deadline).await?) {
                (
                    HandshakeStep::CloseChannel
                    | HandshakeStep::SetBitrate
                    | HandshakeStep::OpenChannel,
                    Reply::Ack,
                ) => {
                    return Ok(());
                }
                (HandshakeStep::HardwareVersion, Reply::Other(line)) if line.starts_with('V') => {
                    versions.hardware = line.get(1..).unwrap_or_default().into();

                    return Ok(());
                }
                (HandshakeStep::FirmwareVersion, Reply::Other(line)) if line.starts_with('v') => {
                    versions.firmware = line.get(1..).unwrap_or_default().into();

                    return Ok(());
                }
                (_, Reply::Nack) => return Err(Error::Nack),
                (_, Reply::Other(line)) => return Err(Error::UnexpectedReply(line)),
                (_, Reply::Ack) => return Err(Error::UnexpectedReply(String::new())),
                (_, reply) => ignore(&reply),
            }
        }
    }

    /// Sends a close command and detaches the port.
    ///
    /// Never fails and may be called repeatedly. Waits for an in-flight
    /// operation to finish first.
    pub async fn disconnect(&self) {
        let mut guard = self.link.lock().await;

        if let Some(mut link) = guard.take() {
            match timeout(self.config.step_timeout(), link.write("C\r")).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!("Failed to close channel: {err:?}"),
                Err(_) => debug!("Timed out closing channel"),
            }

            info!("Adapter disconnected");
        }

        self.state
            .store(TransportState::Disconnected as u8, Ordering::SeqCst);
        *self.versions.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Takes the link and enters `state` before any byte is exchanged.
    fn begin(&self, state: TransportState) -> Result<Transaction<'_, P>, P::Error> {
        let guard = self
            .link
            .try_lock()
            .map_err(|_| Error::Busy(self.state()))?;

        if guard.is_none() {
            return Err(Error::NotConnected);
        }

        let tx = Transaction {
            state: &self.state,
            link: guard,
        };

        tx.set_state(state);

        Ok(tx)
    }

    /// Flushes stale input, writes a frame and returns the first frame received.
    ///
    /// The adapter's acknowledgement is skipped. The returned frame is not
    /// filtered, callers match identifiers themselves.
    pub async fn send_frame(
        &self,
        msg: &CanMessage,
        timeout: Duration,
    ) -> Result<CanMessage, P::Error> {
        let deadline = Deadline::after("send frame", timeout);
        let mut tx = self.begin(TransportState::Sending)?;

        tx.flush(self.config.flush_window()).await?;
        tx.write(&msg.to_ascii()).await?;
        tx.set_state(TransportState::AwaitingResponse);
        tx.await_frame(&deadline, true).await
    }

    /// Sends a frame and waits for a frame carrying `response_id`.
    ///
    /// Unrelated frames, such as broadcast traffic, are discarded. The whole
    /// exchange holds the link, so no other operation can interleave. If frames
    /// arrived but none matched, the timeout is reported as
    /// [`Error::UnexpectedResponse`].
    pub async fn request(
        &self,
        msg: &CanMessage,
        response_id: u32,
        timeout: Duration,
    ) -> Result<CanMessage, P::Error> {
        let deadline = Deadline::after("request", timeout);
        let mut tx = self.begin(TransportState::Sending)?;
        let mut discarded = 0;
        let mut last = None;

        tx.flush(self.config.flush_window()).await?;
        tx.write(&msg.to_ascii()).await?;
        tx.set_state(TransportState::AwaitingResponse);

        loop {
            match tx.await_frame(&deadline, true).await {
                Ok(frame) if frame.id() == response_id => return Ok(frame),
                Ok(frame) => {
                    trace!("Discarding frame {frame} while awaiting {response_id:08x}");
                    discarded += 1;
                    last = Some(frame.id());
                }
                Err(err @ Error::Timeout { .. }) => {
                    return Err(match last {
                        Some(actual) => Error::UnexpectedResponse {
                            expected: response_id,
                            actual,
                            discarded,
                        },
                        None => err,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the next frame received, without writing anything.
    pub async fn receive_frame(&self, timeout: Duration) -> Result<CanMessage, P::Error> {
        let deadline = Deadline::after("receive frame", timeout);
        let mut tx = self.begin(TransportState::AwaitingResponse)?;

        tx.await_frame(&deadline, false).await
    }

    /// Writes a frame and waits only for the adapter's acknowledgement.
    ///
    /// Frames received while waiting are discarded.
    pub async fn transmit(&self, msg: &CanMessage, timeout: Duration) -> Result<(), P::Error> {
        let deadline = Deadline::after("transmit", timeout);
        let mut tx = self.begin(TransportState::Sending)?;

        tx.write(&msg.to_ascii()).await?;
        tx.set_state(TransportState::AwaitingResponse);
        tx.await_ack(&deadline).await
    }

    /// Discards all buffered input and returns the number of discarded bytes.
    pub async fn flush_input_buffer(&self) -> Result<usize, P::Error> {
        let mut tx = self.begin(TransportState::Sending)?;

        tx.flush(self.config.flush_window()).await
    }

    /// Queries the adapter's status flags.
    pub async fn read_status(&self, timeout: Duration) -> Result<StatusFlags, P::Error> {
        let deadline = Deadline::after("read status", timeout);
        let mut tx = self.begin(TransportState::Sending)?;

        tx.flush(self.config.flush_window()).await?;
        tx.write("F\r").await?;
        tx.set_state(TransportState::AwaitingResponse);

        loop {
            match tx.read(&deadline).await? {
                Reply::Other(line) if line.starts_with('F') => {
                    let bits = line
                        .get(1..)
                        .filter(|hex| hex.len() == 2)
                        .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                        .ok_or_else(|| Error::UnexpectedReply(line.clone()))?;

                    return Ok(StatusFlags::from_bits_retain(bits));
                }
                Reply::Nack => return Err(Error::Nack),
                Reply::Other(line) => return Err(Error::UnexpectedReply(line)),
                reply => ignore(&reply),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockAdapter, init_logger};
    use core::convert::Infallible;

    fn response() -> CanMessage {
        CanMessage::new(0x0e6c_3fe0, &[0x05], true).unwrap()
    }

    async fn connected() -> (CanTransport<MockAdapter>, MockAdapter) {
        let adapter = MockAdapter::connected();
        let transport = CanTransport::new(TransportConfig::default());

        transport.connect(adapter.clone()).await.unwrap();

        (transport, adapter)
    }

    #[tokio::test(start_paused = true)]
    async fn handshake() -> Result<(), Infallible> {
        init_logger();

        let (transport, adapter) = connected().await;

        assert_eq!(
            adapter.written(),
            ["C\r", "C\r", "V\r", "V\r", "v\r", "S4\r", "O\r"],
            "handshake commands should be correct"
        );
        assert_eq!(transport.state(), TransportState::Idle, "state should be idle");
        assert_eq!(
            transport.versions(),
            Some(AdapterVersions {
                hardware: "1013".into(),
                firmware: "0107".into(),
            }),
            "versions should be recorded"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_close_nack() {
        init_logger();

        let adapter = MockAdapter::new();
        let transport = CanTransport::new(TransportConfig::default());

        for reply in ["\x07", "\r", "V1013\r", "V1013\r", "v0107\r", "\r", "\r"] {
            adapter.reply(reply);
        }

        let res = transport.connect(adapter.clone()).await;

        assert!(
            matches!(
                res,
                Err(Error::InitializationFailed {
                    step: HandshakeStep::CloseChannel,
                    ref cause,
                }) if matches!(**cause, Error::Nack)
            ),
            "close step should fail with NACK: {res:?}"
        );
        assert!(!transport.is_connected(), "port should be dropped");
        assert_eq!(adapter.written(), ["C\r"], "handshake should stop at the close step");
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_nack() {
        init_logger();

        let adapter = MockAdapter::new();
        let transport = CanTransport::new(TransportConfig::default());

        for reply in ["\r", "\r", "V1013\r", "V1013\r", "v0107\r", "\x07"] {
            adapter.reply(reply);
        }

        let res = transport.connect(adapter.clone()).await;

        assert!(
            matches!(
                res,
                Err(Error::InitializationFailed {
                    step: HandshakeStep::SetBitrate,
                    ref cause,
                }) if matches!(**cause, Error::Nack)
            ),
            "bitrate step should fail with NACK: {res:?}"
        );
        assert_eq!(
            transport.state(),
            TransportState::Disconnected,
            "port should be dropped"
        );
        assert!(
            matches!(
                transport.receive_frame(Duration::from_secs(1)).await,
                Err(Error::NotConnected)
            ),
            "operations should require a connection"
        );
        assert_eq!(adapter.written().len(), 6, "handshake should stop at the failed step");
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout() {
        init_logger();

        let adapter = MockAdapter::new();
        let transport = CanTransport::new(TransportConfig::default());

        adapter.reply("\r").reply("\r");

        let res = transport.connect(adapter).await;

        assert!(
            matches!(
                res,
                Err(Error::InitializationFailed {
                    step: HandshakeStep::HardwareVersion,
                    ref cause,
                }) if matches!(**cause, Error::Timeout { .. })
            ),
            "version step should time out: {res:?}"
        );
        assert!(!transport.is_connected(), "transport should be disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn already_connected() {
        init_logger();

        let (transport, _) = connected().await;

        assert!(
            matches!(
                transport.connect(MockAdapter::connected()).await,
                Err(Error::AlreadyConnected)
            ),
            "second connect should fail"
        );
        assert!(transport.is_connected(), "first connection should survive");
    }

    #[tokio::test(start_paused = true)]
    async fn send_frame() -> Result<(), Infallible> {
        init_logger();

        let (transport, adapter) = connected().await;
        let request = CanMessage::remote(0x066c_3fe0, 0, true)?;

        adapter.reply("Z\rT0123456781AA\rT0E6C3FE0105\r");

        let first = transport
            .send_frame(&request, Duration::from_secs(1))
            .await?;
        let second = transport.receive_frame(Duration::from_secs(1)).await?;

        assert_eq!(
            adapter.written().last().map(String::as_str),
            Some("R066C3FE00\r"),
            "request line should be correct"
        );
        assert_eq!(
            first,
            CanMessage::new(0x0123_4567, &[0xaa], true)?,
            "first frame should be returned unfiltered"
        );
        assert_eq!(second, response(), "second frame should follow");
        assert!(first.timestamp().is_some(), "received frames should be timestamped");
        assert_eq!(transport.state(), TransportState::Idle, "state should be idle");

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn request_filters_broadcasts() -> Result<(), Infallible> {
        init_logger();

        let (transport, adapter) = connected().await;
        let request = CanMessage::remote(0x066c_3fe0, 0, true)?;

        adapter.reply("Z\rT0123456781AA\rt1230\rT0E6C3FE0105\r");

        let frame = transport
            .request(&request, 0x0e6c_3fe0, Duration::from_secs(1))
            .await?;

        assert_eq!(frame, response(), "matching frame should be returned");

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn request_mismatch() {
        init_logger();

        let (transport, adapter) = connected().await;
        let request = CanMessage::remote(0x066c_3fe0, 0, true).unwrap();

        adapter.reply("T0123456781AA\rT0123456781BB\r");

        let res = transport
            .request(&request, 0x0e6c_3fe0, Duration::from_millis(500))
            .await;

        assert!(
            matches!(
                res,
                Err(Error::UnexpectedResponse {
                    expected: 0x0e6c_3fe0,
                    actual: 0x0123_4567,
                    discarded: 2,
                })
            ),
            "mismatched frames should be reported: {res:?}"
        );

        adapter.reply("");

        assert!(
            matches!(
                transport
                    .request(&request, 0x0e6c_3fe0, Duration::from_millis(500))
                    .await,
                Err(Error::Timeout {
                    operation: "request",
                    ..
                })
            ),
            "silence should be a timeout"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_frame_flushes_stale_input() -> Result<(), Infallible> {
        init_logger();

        let (transport, adapter) = connected().await;

        adapter.unsolicited("T0000000010\rT0E6C");
        adapter.reply("T0E6C3FE0105\r");

        let frame = transport
            .send_frame(&CanMessage::remote(0x066c_3fe0, 0, true)?, Duration::from_secs(1))
            .await?;

        assert_eq!(frame, response(), "stale frames should be discarded");

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn send_frame_timeout() {
        init_logger();

        let (transport, adapter) = connected().await;

        adapter.reply("Z\r");

        let res = transport
            .send_frame(
                &CanMessage::remote(0x066c_3fe0, 0, true).unwrap(),
                Duration::from_millis(300),
            )
            .await;

        assert!(
            matches!(
                res,
                Err(Error::Timeout {
                    operation: "send frame",
                    elapsed,
                }) if elapsed == Duration::from_millis(300)
            ),
            "send should time out: {res:?}"
        );
        assert_eq!(
            transport.state(),
            TransportState::Idle,
            "timeout should leave the transport usable"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_lines_are_skipped() -> Result<(), Infallible> {
        init_logger();

        let (transport, adapter) = connected().await;

        adapter.unsolicited("T0E6C3FE09\rV1013\rT0E6C3FE0105\r");

        let frame = transport.receive_frame(Duration::from_secs(1)).await?;

        assert_eq!(frame, response(), "garbage should be skipped");

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn busy() -> Result<(), Infallible> {
        init_logger();

        let (transport, adapter) = connected().await;
        let request = CanMessage::remote(0x066c_3fe0, 0, true)?;

        adapter.reply("T0E6C3FE0105\r");

        let (first, second) = tokio::join!(
            transport.send_frame(&request, Duration::from_secs(1)),
            transport.receive_frame(Duration::from_secs(1)),
        );

        assert_eq!(first?, response(), "first operation should succeed");
        assert!(
            matches!(second, Err(Error::Busy(TransportState::Sending))),
            "concurrent operation should fail immediately: {second:?}"
        );
        assert_eq!(
            adapter.written().len(),
            8,
            "only one request should reach the wire"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn transmit() -> Result<(), Infallible> {
        init_logger();

        let (transport, adapter) = connected().await;
        let msg = CanMessage::new(0x01fd_3fe0, &[0, 0, 0x10, 0, 0, 0, 0, 0], true)?;

        adapter.reply("T0123456781AA\rZ\r");
        transport.transmit(&msg, Duration::from_secs(1)).await?;

        assert_eq!(
            adapter.written().last().map(String::as_str),
            Some("T01FD3FE080000100000000000\r"),
            "frame line should be correct"
        );

        adapter.reply("\x07");

        assert!(
            matches!(
                transport.transmit(&msg, Duration::from_secs(1)).await,
                Err(Error::Nack)
            ),
            "NACK should be reported"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn read_status() -> Result<(), Infallible> {
        init_logger();

        let (transport, adapter) = connected().await;

        adapter.reply("F88\r");

        let flags = transport.read_status(Duration::from_secs(1)).await?;

        assert_eq!(
            flags,
            StatusFlags::DataOverrun | StatusFlags::BusError,
            "flags should be decoded"
        );
        assert_eq!(
            adapter.written().last().map(String::as_str),
            Some("F\r"),
            "status command should be correct"
        );

        adapter.reply("F10\r");

        assert_eq!(
            transport.read_status(Duration::from_secs(1)).await?.bits(),
            0x10,
            "unknown bits should be retained"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn eof_disconnects() {
        init_logger();

        let (transport, adapter) = connected().await;

        adapter.eof();

        assert!(
            matches!(
                transport.receive_frame(Duration::from_secs(1)).await,
                Err(Error::Disconnected)
            ),
            "end-of-file should be reported"
        );
        assert_eq!(
            transport.state(),
            TransportState::Disconnected,
            "port should be dropped"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect() {
        init_logger();

        let (transport, adapter) = connected().await;

        transport.disconnect().await;
        transport.disconnect().await;

        assert_eq!(
            adapter.written().last().map(String::as_str),
            Some("C\r"),
            "channel should be closed"
        );
        assert_eq!(adapter.written().len(), 8, "close should be sent once");
        assert_eq!(transport.versions(), None, "versions should be cleared");
        assert!(!transport.is_connected(), "transport should be disconnected");
    }

    #[test]
    fn bitrate() {
        assert_eq!(
            HandshakeStep::SetBitrate.command(Bitrate::Kbit125),
            "S4\r",
            "125 kbit/s should map to S4"
        );
        assert_eq!(
            HandshakeStep::SetBitrate.command(Bitrate::Mbit1),
            "S8\r",
            "1 Mbit/s should map to S8"
        );
        assert_eq!(
            Bitrate::Kbit125.as_bits_per_second(),
            125_000,
            "bitrate value should be correct"
        );
    }
}
