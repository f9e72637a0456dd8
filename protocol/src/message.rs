//! CAN frame model and SLCAN ASCII codec.
//!
//! A [`CanMessage`] is validated on construction and converts losslessly to and
//! from the adapter's line encoding:
//!
//! - standard data frame: `t<3-hex-id><1-hex-len><hex bytes>\r`
//! - extended data frame: `T<8-hex-id><1-hex-len><hex bytes>\r`
//! - remote frames use `r`/`R` and carry a length digit but no payload bytes
//!
//! Extended identifiers are carried as full 32-bit values, as the controller
//! uses identifiers above the classic 29-bit limit.

use core::fmt::{Display, Formatter, Write as _};
use tokio::time::Instant;

/// Largest identifier of a standard frame.
pub const MAX_STANDARD_ID: u32 = 0x7ff;

/// Largest payload of a classic CAN frame.
pub const MAX_DATA_LEN: usize = 8;

/// Base identifier of parameter read (and write) requests.
pub const REQUEST_BASE_ID: u32 = 0x0400_3fe0;

/// Base identifier of parameter read responses.
pub const RESPONSE_BASE_ID: u32 = 0x0c00_3fe0;

/// Largest parameter index addressable by the identifier layout.
pub const MAX_PARAMETER_INDEX: u16 = 0x0fff;

const INDEX_SHIFT: u32 = 14;
const PREFIX_SHIFT: u32 = 26;
const ELEMENT_TYPE_MASK: u32 = 0x3fff;

/// Returns the request identifier for a parameter index.
#[must_use]
pub const fn request_id(idx: u16) -> u32 {
    REQUEST_BASE_ID | ((idx as u32) << INDEX_SHIFT)
}

/// Returns the response identifier for a parameter index.
#[must_use]
pub const fn response_id(idx: u16) -> u32 {
    RESPONSE_BASE_ID | ((idx as u32) << INDEX_SHIFT)
}

/// Error type for frame construction and parsing.
#[non_exhaustive]
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum FrameError {
    /// Standard frame identifier exceeds 11 bits.
    InvalidStandardId(u32),
    /// Payload exceeds 8 bytes.
    DataTooLong(usize),
    /// The line is empty.
    EmptyLine,
    /// The line does not start with a frame type character.
    UnknownFrameType(char),
    /// The line is structurally invalid.
    Malformed(&'static str),
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidStandardId(id) => write!(f, "invalid standard identifier: {id:#x}"),
            Self::DataTooLong(len) => write!(f, "payload too long: {len} bytes"),
            Self::EmptyLine => write!(f, "empty line"),
            Self::UnknownFrameType(c) => write!(f, "unknown frame type: {c:?}"),
            Self::Malformed(reason) => write!(f, "malformed frame: {reason}"),
        }
    }
}

impl core::error::Error for FrameError {}

/// A single CAN frame.
///
/// Equality ignores the receive timestamp.
#[derive(Clone, Copy, Debug)]
pub struct CanMessage {
    id: u32,
    data: [u8; MAX_DATA_LEN],
    len: u8,
    extended: bool,
    remote: bool,
    timestamp: Option<Instant>,
}

impl CanMessage {
    /// Constructs a data frame.
    pub fn new(id: u32, data: &[u8], extended: bool) -> Result<Self, FrameError> {
        Self::validate(id, data.len(), extended)?;

        let mut buf = [0x00; MAX_DATA_LEN];

        buf[..data.len()].copy_from_slice(data);

        Ok(Self {
            id,
            data: buf,
            len: data.len() as u8,
            extended,
            remote: false,
            timestamp: None,
        })
    }

    /// Constructs a remote frame declaring a requested payload length.
    pub fn remote(id: u32, len: u8, extended: bool) -> Result<Self, FrameError> {
        Self::validate(id, len.into(), extended)?;

        Ok(Self {
            id,
            data: [0x00; MAX_DATA_LEN],
            len,
            extended,
            remote: true,
            timestamp: None,
        })
    }

    fn validate(id: u32, len: usize, extended: bool) -> Result<(), FrameError> {
        if !extended && id > MAX_STANDARD_ID {
            return Err(FrameError::InvalidStandardId(id));
        }

        if len > MAX_DATA_LEN {
            return Err(FrameError::DataTooLong(len));
        }

        Ok(())
    }

    /// Returns a copy of this frame with the given receive timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Returns the arbitration identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the payload. Always empty for remote frames.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.len.into()]
        }
    }

    /// Returns the effective length: the payload length of a data frame
    /// or the requested length of a remote frame.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.into()
    }

    /// Returns whether the effective length is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether this is an extended frame.
    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Returns whether this is a remote frame.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Returns the time the frame was received, if it was received.
    #[must_use]
    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    /// Decomposes the identifier into its protocol fields.
    #[must_use]
    pub fn id_parts(&self) -> IdParts {
        IdParts::from_id(self.id)
    }

    /// Encodes the frame as a CR-terminated SLCAN line.
    #[must_use]
    pub fn to_ascii(&self) -> String {
        let kind = match (self.extended, self.remote) {
            (false, false) => 't',
            (true, false) => 'T',
            (false, true) => 'r',
            (true, true) => 'R',
        };
        let mut line = String::with_capacity(27);

        line.push(kind);

        // Writing to a `String` cannot fail
        if self.extended {
            let _ = write!(line, "{:08X}", self.id);
        } else {
            let _ = write!(line, "{:03X}", self.id);
        }

        let _ = write!(line, "{:X}", self.len);

        for byte in self.data() {
            let _ = write!(line, "{byte:02X}");
        }

        line.push('\r');
        line
    }

    /// Parses a SLCAN frame line.
    ///
    /// The trailing CR is optional. A 4-digit adapter timestamp
    /// following the payload is accepted and ignored.
    pub fn from_ascii(line: &str) -> Result<Self, FrameError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let kind = line.chars().next().ok_or(FrameError::EmptyLine)?;
        let (extended, remote) = match kind {
            't' => (false, false),
            'T' => (true, false),
            'r' => (false, true),
            'R' => (true, true),
            c => return Err(FrameError::UnknownFrameType(c)),
        };
        let id_digits = if extended { 8 } else { 3 };
        let body = &line[1..];

        if !body.is_ascii() || body.len() < id_digits + 1 {
            return Err(FrameError::Malformed("line too short"));
        }

        let id = u32::from_str_radix(&body[..id_digits], 16)
            .map_err(|_| FrameError::Malformed("invalid identifier digits"))?;
        let len = u8::from_str_radix(&body[id_digits..=id_digits], 16)
            .map_err(|_| FrameError::Malformed("invalid length digit"))?;
        let rest = &body[id_digits + 1..];

        if remote {
            return match rest.len() {
                0 | 4 => Self::remote(id, len, extended),
                _ => Err(FrameError::Malformed("remote frame carries payload")),
            };
        }

        let hex_len = usize::from(len) * 2;

        if len as usize > MAX_DATA_LEN {
            return Err(FrameError::DataTooLong(len.into()));
        }

        if rest.len() != hex_len && rest.len() != hex_len + 4 {
            return Err(FrameError::Malformed("payload does not match length"));
        }

        let mut data = [0x00; MAX_DATA_LEN];

        for (i, byte) in data.iter_mut().take(len.into()).enumerate() {
            *byte = u8::from_str_radix(&rest[i * 2..i * 2 + 2], 16)
                .map_err(|_| FrameError::Malformed("invalid payload digits"))?;
        }

        Self::new(id, &data[..len.into()], extended)
    }
}

impl PartialEq for CanMessage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.extended == other.extended
            && self.remote == other.remote
            && self.len == other.len
            && self.data() == other.data()
    }
}

impl Eq for CanMessage {}

impl Display for CanMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        if self.extended {
            write!(f, "{:08x}", self.id)?;
        } else {
            write!(f, "{:03x}", self.id)?;
        }

        if self.remote {
            write!(f, " [{}] remote", self.len)
        } else {
            write!(f, " [{}] {:02x?}", self.len, self.data())
        }
    }
}

/// Protocol fields of a frame identifier.
///
/// Used to interpret broadcast traffic, which shares the identifier layout
/// of direct parameter responses.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct IdParts {
    /// Bits above the parameter index (bit 26 and up).
    pub prefix: u8,
    /// 12-bit parameter index (bits 14 to 25).
    pub idx: u16,
    /// 14-bit element type (bits 0 to 13).
    pub element_type: u16,
}

impl IdParts {
    /// Splits an identifier into its fields.
    #[must_use]
    pub const fn from_id(id: u32) -> Self {
        Self {
            prefix: (id >> PREFIX_SHIFT) as u8,
            idx: ((id >> INDEX_SHIFT) & MAX_PARAMETER_INDEX as u32) as u16,
            element_type: (id & ELEMENT_TYPE_MASK) as u16,
        }
    }

    /// Reassembles the identifier.
    #[must_use]
    pub const fn to_id(self) -> u32 {
        ((self.prefix as u32) << PREFIX_SHIFT)
            | (((self.idx & MAX_PARAMETER_INDEX) as u32) << INDEX_SHIFT)
            | (self.element_type as u32 & ELEMENT_TYPE_MASK)
    }

    /// Returns whether the identifier is a direct parameter response.
    #[must_use]
    pub const fn is_response(self) -> bool {
        self.to_id() == response_id(self.idx)
    }
}
