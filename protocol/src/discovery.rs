//! Element discovery.
//!
//! Firmware builds assign different indices to the same named parameter, so
//! the live index table is retrieved from the device before any index is
//! trusted. Discovery runs in three phases:
//!
//! 1. Query the size of the element table in bytes.
//! 2. Read the table in chunks. Each chunk is requested with its size and
//!    offset, then released by a remote frame on the buffer read identifier
//!    and streamed back in 8-byte frames.
//! 3. Parse the concatenated bytes into [`DiscoveredElement`]s.
//!
//! An attempt that receives less than the configured share of the reported
//! bytes fails as incomplete. [`ElementDiscovery::resolve`] combines live
//! discovery with the [`cache`] and decides when a stored snapshot may stand
//! in for the device.

pub mod cache;
pub mod parser;

use crate::{
    CanMessage, CanTransport, Error, ErrorKind, Result, config::DiscoveryConfig,
    transport::Deadline,
};
use cache::{CacheSnapshot, CacheStore};
use embedded_io_async::{Read, Write};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// Identifier of the element count request.
pub const COUNT_REQUEST_ID: u32 = 0x01fd_7fe0;

/// Identifier of the element count response.
pub const COUNT_RESPONSE_ID: u32 = 0x09fd_7fe0;

/// Identifier of the element data request.
pub const DATA_REQUEST_ID: u32 = 0x01fd_3fe0;

/// Identifier of the buffer read trigger.
pub const BUFFER_READ_ID: u32 = 0x01fd_bfe0;

/// Identifier of the element data stream.
pub const DATA_RESPONSE_ID: u32 = 0x09fd_bfe0;

/// Parameter definition as reported by the device.
///
/// Discovery does not report formats or read-only flags. Those are inherited
/// from the compiled table when the registry is updated.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Debug)]
pub struct DiscoveredElement {
    /// Firmware-assigned index.
    pub idx: u16,
    /// External ID as 14 uppercase hex digits.
    #[serde(rename = "extid")]
    pub ext_id: String,
    /// Parameter name.
    #[serde(rename = "text")]
    pub name: String,
    /// Smallest raw value.
    #[serde(rename = "min_value")]
    pub min: i32,
    /// Largest raw value.
    #[serde(rename = "max_value")]
    pub max: i32,
}

/// Outcome of a successful discovery attempt.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct DiscoveryReport {
    /// Parsed elements in table order.
    pub elements: Vec<DiscoveredElement>,
    /// Byte count reported by the device.
    pub reported_bytes: u32,
    /// Byte count actually received.
    pub actual_bytes: usize,
    /// Bytes skipped by the parser.
    pub skipped_bytes: usize,
}

/// Origin of a resolved element list.
#[derive(strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "snake_case")]
pub enum ElementSource {
    /// Retrieved from the device.
    Live,
    /// Taken from a fresh cached snapshot without querying the device.
    Cache,
    /// Taken from a cached snapshot after live discovery failed.
    Fallback,
}

/// Element list together with its origin.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct ResolvedElements {
    /// Discovered elements.
    pub elements: Vec<DiscoveredElement>,
    /// Where the elements came from.
    pub source: ElementSource,
}

/// Checks the received byte count against the reported one.
///
/// A reported count of zero never passes. Receiving more than reported is
/// accepted with a warning.
pub fn check_completeness<E>(reported: u32, actual: usize, threshold: f64) -> Result<(), E> {
    let incomplete = Error::DiscoveryIncomplete {
        reported,
        actual,
        threshold,
    };

    if reported == 0 {
        return Err(incomplete);
    }

    #[allow(clippy::cast_precision_loss)]
    let ratio = actual as f64 / f64::from(reported);

    if ratio < threshold {
        return Err(incomplete);
    }

    if actual > reported as usize {
        warn!("Received {actual} bytes, more than the reported {reported}");
    }

    Ok(())
}

/// Element discovery over a connected transport.
#[derive(Debug)]
pub struct ElementDiscovery<'a, P> {
    transport: &'a CanTransport<P>,
    config: &'a DiscoveryConfig,
}

impl<'a, P: Read + Write> ElementDiscovery<'a, P> {
    /// Constructs a discovery session.
    pub fn new(transport: &'a CanTransport<P>, config: &'a DiscoveryConfig) -> Self {
        Self { transport, config }
    }

    /// Queries the size of the element table in bytes.
    ///
    /// Unrelated broadcast frames are discarded. Timeouts and malformed
    /// responses are retried up to the configured count. Sizes above the
    /// configured limit count as malformed.
    pub async fn query_element_count(&self) -> Result<u32, P::Error> {
        let request = CanMessage::remote(COUNT_REQUEST_ID, 0, true)?;
        let mut attempt = 1;

        loop {
            let res = self
                .transport
                .request(&request, COUNT_RESPONSE_ID, self.config.count_timeout())
                .await
                .and_then(|frame| {
                    let bytes: [u8; 4] =
                        frame
                            .data()
                            .try_into()
                            .map_err(|_| Error::MalformedResponse {
                                id: COUNT_RESPONSE_ID,
                                reason: "element count is not 4 bytes",
                            })?;

                    let count = u32::from_be_bytes(bytes);

                    if count > self.config.max_element_bytes {
                        return Err(Error::MalformedResponse {
                            id: COUNT_RESPONSE_ID,
                            reason: "element count exceeds limit",
                        });
                    }

                    Ok(count)
                });

            match res {
                Ok(count) => {
                    debug!("Device reports {count} bytes of element data");

                    return Ok(count);
                }
                Err(err) if err.is_transient() && attempt < self.config.count_retries => {
                    warn!(
                        "Element count attempt {attempt}/{} failed: {err:?}",
                        self.config.count_retries
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reads up to `reported` bytes of element data.
    ///
    /// Stops early when a chunk ends short or the overall deadline passes, and
    /// returns whatever was collected.
    pub async fn read_element_data(&self, reported: u32) -> Result<Vec<u8>, P::Error> {
        let overall = Deadline::after("element discovery", self.config.deadline());
        let total = reported as usize;
        let mut data = Vec::with_capacity(total.min(self.config.chunk_size as usize));

        while data.len() < total {
            if overall.is_expired() {
                warn!(
                    "Discovery deadline reached after {} of {reported} bytes",
                    data.len()
                );
                break;
            }

            let offset = u32::try_from(data.len()).unwrap_or(u32::MAX);
            let wanted = (self.config.chunk_size as usize).min(total - data.len());
            let chunk = self.read_chunk(offset, wanted, &overall).await?;
            let short = chunk.len() < wanted;

            trace!("Chunk at offset {offset}: {} of {wanted} bytes", chunk.len());
            data.extend_from_slice(&chunk);

            if short {
                debug!("Short chunk at offset {offset}, end of data");
                break;
            }
        }

        Ok(data)
    }

    async fn read_chunk(
        &self,
        offset: u32,
        wanted: usize,
        overall: &Deadline,
    ) -> Result<Vec<u8>, P::Error> {
        let deadline = Deadline::after(
            "element data chunk",
            self.config.chunk_timeout().min(overall.remaining()),
        );
        let size = u32::try_from(wanted).unwrap_or(u32::MAX);
        let mut payload = [0x00; 8];

        payload[..4].copy_from_slice(&size.to_be_bytes());
        payload[4..].copy_from_slice(&offset.to_be_bytes());

        let request = CanMessage::new(DATA_REQUEST_ID, &payload, true)?;
        let trigger = CanMessage::remote(BUFFER_READ_ID, 0, true)?;
        let mut chunk = Vec::with_capacity(wanted);

        self.transport
            .transmit(&request, deadline.remaining())
            .await?;

        let mut next = self
            .transport
            .send_frame(&trigger, deadline.remaining())
            .await;

        loop {
            let frame = match next {
                Ok(frame) => frame,
                Err(Error::Timeout { .. }) => {
                    debug!("Chunk timed out after {} bytes", chunk.len());
                    break;
                }
                Err(err) => return Err(err),
            };

            if frame.id() == DATA_RESPONSE_ID {
                chunk.extend_from_slice(frame.data());

                if frame.len() < 8 || chunk.len() >= wanted {
                    break;
                }
            } else {
                trace!("Discarding frame {frame} during data transfer");
            }

            next = self.transport.receive_frame(deadline.remaining()).await;
        }

        Ok(chunk)
    }

    /// Runs a single discovery attempt.
    pub async fn discover(&self) -> Result<DiscoveryReport, P::Error> {
        info!("Starting element discovery");

        let reported = self.query_element_count().await?;
        let data = self.read_element_data(reported).await?;

        check_completeness(reported, data.len(), self.config.completeness_threshold)?;

        let parsed = parser::parse(&data);

        info!(
            "Discovered {} element(s) from {} of {reported} bytes",
            parsed.elements.len(),
            data.len()
        );

        Ok(DiscoveryReport {
            elements: parsed.elements,
            reported_bytes: reported,
            actual_bytes: data.len(),
            skipped_bytes: parsed.skipped,
        })
    }

    /// Runs discovery attempts until one succeeds or the attempts run out.
    ///
    /// Connection failures are returned immediately.
    pub async fn discover_with_retries(&self) -> Result<DiscoveryReport, P::Error> {
        let mut attempt = 1;

        loop {
            match self.discover().await {
                Ok(report) => return Ok(report),
                Err(err) if err.kind() != ErrorKind::Connection && attempt < self.config.attempts => {
                    warn!(
                        "Discovery attempt {attempt}/{} failed: {err:?}",
                        self.config.attempts
                    );
                    sleep(self.config.retry_backoff()).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resolves the element list, using the cache where permitted.
    ///
    /// - A complete snapshot younger than the configured maximum age is used
    ///   without querying the device, unless a refresh is forced.
    /// - Otherwise the device is queried and a successful result is stored.
    /// - If live discovery fails, any complete snapshot is used instead.
    /// - Without one, [`Error::DiscoveryRequired`] is returned. The compiled
    ///   table is never used as a silent substitute.
    pub async fn resolve<S>(&self, store: &S) -> Result<ResolvedElements, P::Error>
    where
        S: CacheStore + ?Sized,
    {
        let cached = store.load().unwrap_or_else(|err| {
            warn!("Ignoring unreadable element cache: {err}");
            None
        });

        if let Some(snapshot) = &cached {
            if self.config.force_refresh {
                debug!("Refresh forced, ignoring cached elements");
            } else if snapshot.is_fresh(self.config.cache_max_age()) {
                info!(
                    "Using {} cached element(s) captured {} s ago",
                    snapshot.elements.len(),
                    snapshot.age().as_secs()
                );

                return Ok(ResolvedElements {
                    elements: snapshot.elements.clone(),
                    source: ElementSource::Cache,
                });
            }
        }

        match self.discover_with_retries().await {
            Ok(report) => {
                if let Err(err) = store.save(&CacheSnapshot::from_report(&report)) {
                    warn!("Failed to store element cache: {err}");
                }

                Ok(ResolvedElements {
                    elements: report.elements,
                    source: ElementSource::Live,
                })
            }
            Err(err) if err.kind() == ErrorKind::Connection => Err(err),
            Err(err) => match cached.filter(|snapshot| snapshot.complete) {
                Some(snapshot) => {
                    warn!(
                        "Element discovery failed ({err:?}), falling back to cached elements captured {} s ago",
                        snapshot.age().as_secs()
                    );

                    Ok(ResolvedElements {
                        elements: snapshot.elements,
                        source: ElementSource::Fallback,
                    })
                }
                None => Err(Error::DiscoveryRequired(format!("{err:?}"))),
            },
        }
    }
}
