//! Value conversions for the controller's numeric formats.
//!
//! All functions are pure. Payloads are big-endian.
//!
//! | format      | width                         | factor | range             |
//! |-------------|-------------------------------|--------|-------------------|
//! | `temp`      | 2 bytes signed                | 0.1    | −3276.8 … 3276.7  |
//! | `temp_byte` | 1 byte unsigned               | 0.5    | 0.0 … 127.5       |
//! | `temp_uint` | 1 byte unsigned               | 1      | 0 … 255           |
//! | `dpN`/`rpN` | inferred from declared bounds | 10^N   | declared bounds   |
//! | `int`       | inferred from declared bounds | 1      | declared bounds   |

use core::{
    fmt::{Display, Formatter},
    str::FromStr,
};

/// A specialized [`Result`] type for codec operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for codec operations.
#[non_exhaustive]
#[derive(PartialEq, Clone, Debug)]
pub enum Error {
    /// The value lies outside the permitted range.
    OutOfRange {
        /// Rejected value.
        value: f64,
        /// Smallest permitted value.
        min: f64,
        /// Largest permitted value.
        max: f64,
    },
    /// The value is NaN or infinite.
    NotFinite,
    /// An integer format received a fractional value.
    NotAnInteger(f64),
    /// The payload length does not match the format's width.
    InvalidLength {
        /// Width required by the format.
        expected: usize,
        /// Width received.
        actual: usize,
    },
    /// The payload is empty or wider than 8 bytes.
    InvalidWidth(usize),
    /// The format tag is not recognized.
    UnknownFormat(String),
}

impl Error {
    /// Returns whether the error was caused by a caller-supplied value
    /// rather than by a device payload.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::OutOfRange { .. } | Self::NotFinite | Self::NotAnInteger(_)
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfRange { value, min, max } => {
                write!(f, "value {value} outside range {min}..={max}")
            }
            Self::NotFinite => write!(f, "value is not finite"),
            Self::NotAnInteger(value) => write!(f, "value {value} is not an integer"),
            Self::InvalidLength { expected, actual } => {
                write!(f, "expected {expected} byte(s), got {actual}")
            }
            Self::InvalidWidth(len) => write!(f, "unsupported payload width: {len} byte(s)"),
            Self::UnknownFormat(tag) => write!(f, "unknown format: {tag:?}"),
        }
    }
}

impl core::error::Error for Error {}

/// Numeric format of a parameter.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
pub enum ValueFormat {
    /// Plain integer, width inferred from the declared bounds.
    #[default]
    Int,
    /// Signed 16-bit value in tenths of a degree.
    Temp,
    /// Unsigned 8-bit value in half degrees.
    TempByte,
    /// Unsigned 8-bit value in whole degrees.
    TempUint,
    /// Integer scaled by `10^places`, width inferred from the declared bounds.
    Scaled {
        /// Tag prefix the format was declared with.
        prefix: ScalePrefix,
        /// Number of decimal places.
        places: u8,
    },
}

/// Tag prefix of a scaled decimal format.
///
/// Both prefixes share the same encoding and are kept to reproduce the tag.
#[derive(strum::Display, strum::EnumString, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "lowercase")]
pub enum ScalePrefix {
    /// `dpN` tag.
    Dp,
    /// `rpN` tag.
    Rp,
}

impl ValueFormat {
    /// Returns the fixed payload width, or `None` if the width depends on the bounds.
    #[must_use]
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Temp => Some(2),
            Self::TempByte | Self::TempUint => Some(1),
            Self::Int | Self::Scaled { .. } => None,
        }
    }

    fn divisor(self) -> f64 {
        match self {
            Self::Int | Self::TempUint => 1.0,
            Self::Temp => 10.0,
            Self::TempByte => 2.0,
            Self::Scaled { places, .. } => 10f64.powi(places.into()),
        }
    }
}

impl Display for ValueFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Temp => write!(f, "temp"),
            Self::TempByte => write!(f, "temp_byte"),
            Self::TempUint => write!(f, "temp_uint"),
            Self::Scaled { prefix, places } => write!(f, "{prefix}{places}"),
        }
    }
}

impl FromStr for ValueFormat {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        match tag {
            "" | "int" => Ok(Self::Int),
            "temp" => Ok(Self::Temp),
            "temp_byte" => Ok(Self::TempByte),
            "temp_uint" => Ok(Self::TempUint),
            _ => {
                let unknown = || Error::UnknownFormat(tag.into());
                let (prefix, places) = tag.split_at_checked(2).ok_or_else(unknown)?;
                let prefix = prefix.parse().map_err(|_| unknown())?;
                let places = places.parse::<u8>().map_err(|_| unknown())?;

                if places > 9 {
                    return Err(unknown());
                }

                Ok(Self::Scaled { prefix, places })
            }
        }
    }
}

/// A decoded parameter value.
#[derive(PartialEq, Copy, Clone, Debug)]
pub enum Value {
    /// Integer value of an `int` parameter.
    Integer(i64),
    /// Decimal value of a temperature or scaled parameter.
    Decimal(f64),
}

impl Value {
    /// Returns the value as a float.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Integer(val) => val as f64,
            Self::Decimal(val) => val,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Integer(val) => write!(f, "{val}"),
            Self::Decimal(val) => write!(f, "{val}"),
        }
    }
}

impl From<i64> for Value {
    fn from(val: i64) -> Self {
        Self::Integer(val)
    }
}

impl From<f64> for Value {
    fn from(val: f64) -> Self {
        Self::Decimal(val)
    }
}

/// Encodes a value according to a parameter's format and declared bounds.
///
/// Every format is range-checked against `min..=max` in raw units. Temperature
/// formats are additionally limited to what their payload can hold.
pub fn encode(format: ValueFormat, value: f64, min: i32, max: i32) -> Result<Vec<u8>> {
    match format {
        ValueFormat::Temp | ValueFormat::TempByte | ValueFormat::TempUint => {
            to_fixed_raw(value, format.divisor(), min.into(), max.into())?;

            match format {
                ValueFormat::Temp => Ok(encode_temp(value)?.to_vec()),
                ValueFormat::TempByte => Ok(encode_temp_byte(value)?.to_vec()),
                _ => Ok(encode_temp_uint(value)?.to_vec()),
            }
        }
        ValueFormat::Int => {
            check_finite(value)?;

            if value.fract() != 0.0 {
                return Err(Error::NotAnInteger(value));
            }

            encode_int(to_raw(value, 1.0), min, max)
        }
        ValueFormat::Scaled { .. } => {
            check_finite(value)?;
            encode_int(to_raw(value, format.divisor()), min, max).map_err(|err| match err {
                Error::OutOfRange { .. } => Error::OutOfRange {
                    value,
                    min: f64::from(min) / format.divisor(),
                    max: f64::from(max) / format.divisor(),
                },
                err => err,
            })
        }
    }
}

/// Decodes a payload according to a parameter's format and declared bounds.
///
/// Fixed-width formats reject payloads of any other length. Integer and scaled
/// formats infer the width from the payload and are signed if `min` is negative.
pub fn decode(format: ValueFormat, data: &[u8], min: i32) -> Result<Value> {
    match format {
        ValueFormat::Temp => Ok(decode_temp(data)?.into()),
        ValueFormat::TempByte => Ok(decode_temp_byte(data)?.into()),
        ValueFormat::TempUint => Ok(Value::Integer(decode_temp_uint(data)?.into())),
        ValueFormat::Int => Ok(decode_int(data, min < 0)?.into()),
        ValueFormat::Scaled { .. } => {
            #[allow(clippy::cast_precision_loss)]
            let raw = decode_int(data, min < 0)? as f64;

            Ok((raw / format.divisor()).into())
        }
    }
}

/// Encodes a temperature in tenths of a degree.
pub fn encode_temp(value: f64) -> Result<[u8; 2]> {
    let raw = to_fixed_raw(value, 10.0, i16::MIN.into(), i16::MAX.into())?;

    #[allow(clippy::cast_possible_truncation)]
    Ok((raw as i16).to_be_bytes())
}

/// Decodes a temperature in tenths of a degree.
pub fn decode_temp(data: &[u8]) -> Result<f64> {
    let bytes: [u8; 2] = fixed(data)?;

    Ok(f64::from(i16::from_be_bytes(bytes)) / 10.0)
}

/// Encodes a temperature in half degrees.
pub fn encode_temp_byte(value: f64) -> Result<[u8; 1]> {
    let raw = to_fixed_raw(value, 2.0, 0, u8::MAX.into())?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok([raw as u8])
}

/// Decodes a temperature in half degrees.
pub fn decode_temp_byte(data: &[u8]) -> Result<f64> {
    let [raw]: [u8; 1] = fixed(data)?;

    Ok(f64::from(raw) / 2.0)
}

/// Encodes a temperature in whole degrees.
pub fn encode_temp_uint(value: f64) -> Result<[u8; 1]> {
    let raw = to_fixed_raw(value, 1.0, 0, u8::MAX.into())?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok([raw as u8])
}

/// Decodes a temperature in whole degrees.
pub fn decode_temp_uint(data: &[u8]) -> Result<u8> {
    let [raw]: [u8; 1] = fixed(data)?;

    Ok(raw)
}

/// Encodes a raw integer, checking it against `min..=max`.
///
/// The payload width is the smallest of 1, 2 or 4 bytes that holds the bounds.
pub fn encode_int(raw: i64, min: i32, max: i32) -> Result<Vec<u8>> {
    if raw < min.into() || raw > max.into() {
        #[allow(clippy::cast_precision_loss)]
        return Err(Error::OutOfRange {
            value: raw as f64,
            min: min.into(),
            max: max.into(),
        });
    }

    let width = int_width(min, max);

    Ok(raw.to_be_bytes()[8 - width..].to_vec())
}

/// Decodes a big-endian integer of 1 to 8 bytes.
///
/// Signed values are sign-extended from the payload width.
pub fn decode_int(data: &[u8], signed: bool) -> Result<i64> {
    if data.is_empty() || data.len() > 8 {
        return Err(Error::InvalidWidth(data.len()));
    }

    let raw = data
        .iter()
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte));
    #[allow(clippy::cast_possible_truncation)]
    let shift = 64 - 8 * data.len() as u32;

    #[allow(clippy::cast_possible_wrap)]
    if signed {
        Ok(((raw << shift) as i64) >> shift)
    } else {
        Ok(raw as i64)
    }
}

/// Returns the payload width needed to represent `min..=max`.
#[must_use]
pub fn int_width(min: i32, max: i32) -> usize {
    if min < 0 {
        if min >= i8::MIN.into() && max <= i8::MAX.into() {
            1
        } else if min >= i16::MIN.into() && max <= i16::MAX.into() {
            2
        } else {
            4
        }
    } else if max <= u8::MAX.into() {
        1
    } else if max <= u16::MAX.into() {
        2
    } else {
        4
    }
}

fn check_finite(value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::NotFinite)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_raw(value: f64, divisor: f64) -> i64 {
    // Saturating conversion, out-of-range results fail the bounds check
    (value * divisor).round() as i64
}

fn to_fixed_raw(value: f64, divisor: f64, min: i64, max: i64) -> Result<i64> {
    check_finite(value)?;

    let raw = to_raw(value, divisor);

    if raw < min || raw > max {
        #[allow(clippy::cast_precision_loss)]
        return Err(Error::OutOfRange {
            value,
            min: min as f64 / divisor,
            max: max as f64 / divisor,
        });
    }

    Ok(raw)
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N]> {
    data.try_into().map_err(|_| Error::InvalidLength {
        expected: N,
        actual: data.len(),
    })
}
