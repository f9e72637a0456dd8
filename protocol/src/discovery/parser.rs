//! Parser for the binary element table.
//!
//! Each record consists of an 18-byte header followed by the name:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 2    | index, big-endian                       |
//! | 2      | 7    | external ID                             |
//! | 9      | 4    | maximum, big-endian signed              |
//! | 13     | 4    | minimum, big-endian signed              |
//! | 17     | 1    | name length, including a terminator     |
//! | 18     | n−1  | ASCII name, the terminator is not sent  |

use super::DiscoveredElement;
use crate::message::MAX_PARAMETER_INDEX;
use core::fmt::Write;
use log::{debug, warn};

/// Size of a record header.
pub const HEADER_LEN: usize = 18;

/// Result of parsing an element table.
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct ParsedElements {
    /// Elements in table order.
    pub elements: Vec<DiscoveredElement>,
    /// Bytes skipped while resynchronizing.
    pub skipped: usize,
}

#[derive(PartialEq, Eq, Debug)]
enum RecordError {
    Truncated,
    Malformed(&'static str),
}

/// Parses a concatenated element table.
///
/// A malformed or truncated record does not abort parsing. The parser
/// advances a single byte and tries again.
#[must_use]
pub fn parse(data: &[u8]) -> ParsedElements {
    let mut parsed = ParsedElements::default();
    let mut pos = 0;
    let mut resync_start = None;

    while data.len() - pos >= HEADER_LEN {
        match parse_record(&data[pos..]) {
            Ok((element, len)) => {
                if let Some(start) = resync_start.take() {
                    warn!(
                        "Skipped {} byte(s) at offset {start} before element {}",
                        pos - start,
                        element.name
                    );
                }

                parsed.elements.push(element);
                pos += len;
            }
            Err(err) => {
                if resync_start.is_none() {
                    debug!("Invalid record at offset {pos}: {err:?}");
                    resync_start = Some(pos);
                }

                parsed.skipped += 1;
                pos += 1;
            }
        }
    }

    if pos < data.len() {
        warn!("Dropping {} trailing byte(s)", data.len() - pos);
        parsed.skipped += data.len() - pos;
    }

    parsed
}

fn parse_record(data: &[u8]) -> Result<(DiscoveredElement, usize), RecordError> {
    let header = data.get(..HEADER_LEN).ok_or(RecordError::Truncated)?;
    let idx = u16::from_be_bytes([header[0], header[1]]);
    let max = i32::from_be_bytes([header[9], header[10], header[11], header[12]]);
    let min = i32::from_be_bytes([header[13], header[14], header[15], header[16]]);
    let name_len = usize::from(header[17]);

    if idx > MAX_PARAMETER_INDEX {
        return Err(RecordError::Malformed("index out of range"));
    }

    if min > max {
        return Err(RecordError::Malformed("bounds out of order"));
    }

    if name_len < 2 {
        return Err(RecordError::Malformed("empty name"));
    }

    let len = HEADER_LEN + name_len - 1;
    let name = data
        .get(HEADER_LEN..len)
        .ok_or(RecordError::Truncated)?;

    if !name.iter().all(u8::is_ascii_graphic) {
        return Err(RecordError::Malformed("name is not printable ASCII"));
    }

    let mut ext_id = String::with_capacity(14);

    for byte in &header[2..9] {
        // Writing to a `String` cannot fail
        let _ = write!(ext_id, "{byte:02X}");
    }

    let element = DiscoveredElement {
        idx,
        ext_id,
        name: name.iter().map(|&b| char::from(b)).collect(),
        min,
        max,
    };

    Ok((element, len))
}

/// Serializes an element in table format.
///
/// Used to build synthetic tables for tests and simulators.
#[must_use]
pub fn encode_record(element: &DiscoveredElement) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + element.name.len());

    buf.extend_from_slice(&element.idx.to_be_bytes());

    for i in 0..7 {
        let byte = element
            .ext_id
            .get(i * 2..i * 2 + 2)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .unwrap_or_default();

        buf.push(byte);
    }

    buf.extend_from_slice(&element.max.to_be_bytes());
    buf.extend_from_slice(&element.min.to_be_bytes());
    buf.push(u8::try_from(element.name.len() + 1).unwrap_or(u8::MAX));
    buf.extend_from_slice(element.name.as_bytes());
    buf
}
