//! Represent CA DBR representations, for data interchange.
//!
//! CA defines thirty-five [DBR] kinds as special structures used to transfer data back
//! and forth. These can be broken down into seven basic array types, which define the
//! data, and five categories of attached metadata. This module models this, and
//! provides tools for handling generic data, converting between data types, and
//! serialization/deserialization for communication over CA.
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`] - all numeric data types in CA are signed, most can represent arrays
//! (in this crate, not necessarily in the epics-base implementation of CA). The
//! options, and the native type used to represent, are:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`] by encoding), a special case - it represents an
//!   index into an array of up to sixteen 26-byte state strings, carried by
//!   [`DbrGraphics::Enum`] when the Graphics or Control category is requested.
//! - [`DbrValue::String`] - natively in CA this is a `[u8; 40]`, but for interchange
//!   here is represented by [`Vec<String>`], and is converted back and forth to
//!   fixed-length as required for communication.
//!
//! The protocol also defines `SHORT` as an alias for `INT` - this is ignored here to
//! avoid excessive confusion.
//!
//! In CA, these seven data types can be sent with five kinds of metadata attached.
//! These are enumerated by [`DbrCategory`] and represented by [`Dbr`]. The five
//! categories are:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Carries information about alarm status and severity in addition
//!   to the data.
//! - [`Dbr::Time`] - All of the information from [`Dbr::Status`], but with associated
//!   timestamp information.
//! - [`Dbr::Graphics`] - Adds display metadata: engineering units, display, alarm
//!   and warning limits, precision for the float types, and the state strings for
//!   enums.
//! - [`Dbr::Control`] - Everything in [`Dbr::Graphics`] plus the control limits.
//!   Reading this category is how a client learns the state strings of a remote
//!   enum record.
//!
//! In addition, there are four not-generically typed DBR Kinds:
//! - `Dbr::PutAckT` - Alert related, unimplemented
//! - `Dbr::PutAckS` - Alert related, unimplemented
//! - `Dbr::STSack_String` - Status related, unimplemented
//! - [`Dbr::ClassName`] - Returns the EPICS record type for the PV.
//!
//! Both [`DbrCategory`] and [`DbrBasicType`] are combined in the [`DbrType`] struct,
//! which provides interfaces to convert to/from the integer representation of types
//! used by the CA protocol.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
//!
use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::{Bounded, NumCast, cast::AsPrimitive, traits::ToBytes};
use std::{
    cmp,
    convert::TryFrom,
    fmt::Debug,
    io::{self, Cursor},
    num::NonZeroUsize,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::messages::ErrorCondition;

// Constants from EPICS
const MAX_UNITS_SIZE: usize = 8;
const MAX_ENUM_STRING_SIZE: usize = 26;
pub const MAX_ENUM_STATES: usize = 16;

/// Seconds between the Unix epoch and the EPICS epoch (1990-01-01)
const EPICS_EPOCH_DELTA: u64 = 631_152_000;

/// Encode a String to a fixed-maximum-length byte array
///
/// Problem: We want to convert a string to a byte sequence but never a length >
/// 40 (the fixed length of EPICS CA Strings). But we can't convert and truncate
/// because although we don't _expect_ to ever handle non-ASCII it technically
/// isn't guaranteed. So, convert one-character-at-a-time until the length would
/// go over.
fn string_to_fixed_length_bytes(value: &str, max_length: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(max_length);
    for c in value.chars() {
        if buffer.len() + c.len_utf8() < max_length {
            let mut char_buffer = [0u8; 4];
            buffer.extend_from_slice(c.encode_utf8(&mut char_buffer).as_bytes());
        } else {
            break;
        }
    }
    buffer
}

/// Read a NUL-terminated string out of a fixed-size field
fn fixed_length_string(length: usize) -> impl for<'a> FnMut(&'a [u8]) -> IResult<&'a [u8], String> {
    move |input| {
        let (input, raw) = take(length)(input)?;
        let strlen = raw.iter().position(|&c| c == 0x00).unwrap_or(length);
        Ok((input, String::from_utf8_lossy(&raw[..strlen]).into_owned()))
    }
}

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}
/// Error returned when trying to resize a DBR but it's a data type that can't
#[derive(Debug)]
pub struct DbrValueIsEnumError;

/// Types of errors that can be returned from [`DbrValue::parse_into`]
#[derive(Debug)]
pub enum DbrParseError {
    SelfIsNotString,
    CannotParse(String),
}

impl DbrValue {
    pub fn get_default_record_type(&self) -> String {
        match self {
            DbrValue::Enum(_) => "mbbo".to_string(),
            DbrValue::String(_) => "waveform".to_string(),
            DbrValue::Char(_) => "longout".to_string(),
            DbrValue::Int(_) => "longout".to_string(),
            DbrValue::Long(_) => "longout".to_string(),
            DbrValue::Float(_) => "aao".to_string(),
            DbrValue::Double(_) => "aao".to_string(),
        }
    }
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the DbrValue is not String or if the value cannot be parsed. Asking
    /// for a convertion from String->String just copies without doing any extra parsing.
    /// Parsing to Enum expects the numeric state index; translating a state string
    /// to its index needs the state list and is handled by the caller.
    pub fn parse_into(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrParseError> {
        let DbrValue::String(val) = self else {
            return Err(DbrParseError::SelfIsNotString);
        };
        Ok(match basic_type {
            DbrBasicType::Enum => match val.as_slice() {
                [s] => DbrValue::Enum(
                    s.parse()
                        .map_err(|_| DbrParseError::CannotParse(s.clone()))?,
                ),
                _ => return Err(DbrParseError::CannotParse(format!("{val:?}"))),
            },
            DbrBasicType::String => self.clone(),
            DbrBasicType::Char => DbrValue::Char(
                val.iter()
                    .map(|s| s.parse().map_err(|_| DbrParseError::CannotParse(s.clone())))
                    .collect::<Result<Vec<_>, DbrParseError>>()?,
            ),
            DbrBasicType::Int => DbrValue::Int(
                val.iter()
                    .map(|s| s.parse().map_err(|_| DbrParseError::CannotParse(s.clone())))
                    .collect::<Result<Vec<_>, DbrParseError>>()?,
            ),
            DbrBasicType::Long => DbrValue::Long(
                val.iter()
                    .map(|s| s.parse().map_err(|_| DbrParseError::CannotParse(s.clone())))
                    .collect::<Result<Vec<_>, DbrParseError>>()?,
            ),
            DbrBasicType::Float => DbrValue::Float(
                val.iter()
                    .map(|s| s.parse().map_err(|_| DbrParseError::CannotParse(s.clone())))
                    .collect::<Result<Vec<_>, DbrParseError>>()?,
            ),
            DbrBasicType::Double => DbrValue::Double(
                val.iter()
                    .map(|s| s.parse().map_err(|_| DbrParseError::CannotParse(s.clone())))
                    .collect::<Result<Vec<_>, DbrParseError>>()?,
            ),
        })
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array
        fn _encode_string<T>(from: &Vec<String>) -> Result<Vec<T>, ErrorCondition>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from.as_slice() {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(ErrorCondition::NoConvert)?,
            })
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Char(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Int(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Long(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Float(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Double(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => DbrValue::String(vec![
                    String::from_utf8(val.iter().map(|c| *c as u8).collect())
                        .map_err(|_| ErrorCondition::NoConvert)?,
                ]),
                _ => return Err(ErrorCondition::UnavailInServ),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                // Numeric state indices are accepted, if they fit
                DbrValue::Int(val) => match val.as_slice() {
                    [v] => DbrValue::Enum(NumCast::from(*v).ok_or(ErrorCondition::NoConvert)?),
                    _ => return Err(ErrorCondition::NoConvert),
                },
                DbrValue::Long(val) => match val.as_slice() {
                    [v] => DbrValue::Enum(NumCast::from(*v).ok_or(ErrorCondition::NoConvert)?),
                    _ => return Err(ErrorCondition::NoConvert),
                },
                DbrValue::Char(val) => match val.as_slice() {
                    [v] => DbrValue::Enum(NumCast::from(*v).ok_or(ErrorCondition::NoConvert)?),
                    _ => return Err(ErrorCondition::NoConvert),
                },
                _ => return Err(ErrorCondition::NoConvert),
            },
        })
    }

    /// Encode the value contents of a DBR into a byte vector
    ///
    /// If max_elems is `None`, then all elements available will be returned.
    ///
    /// Returns the number of elements along with the bytes
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let elements = if let Some(max_elem) = max_elems {
            cmp::min(max_elem.into(), self.get_count())
        } else {
            self.get_count()
        };

        (
            elements,
            match self {
                DbrValue::Enum(val) => val.to_be_bytes().to_vec(),
                DbrValue::String(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| {
                        let mut buf = string_to_fixed_length_bytes(v, 39);
                        buf.resize(40, 0u8);
                        buf
                    })
                    .collect(),
                DbrValue::Char(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Int(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Long(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Float(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Double(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
            },
        )
    }

    pub fn decode_value(
        data_type: DbrBasicType,
        item_count: usize,
        data: &[u8],
    ) -> Result<DbrValue, nom::Err<nom::error::Error<&[u8]>>> {
        match data_type {
            DbrBasicType::Enum => Ok(DbrValue::Enum(be_u16.parse(data)?.1)),
            DbrBasicType::String => Ok(DbrValue::String(
                data.chunks(40)
                    .take(item_count)
                    .map(|d| {
                        let strlen = d.iter().position(|&c| c == 0x00).unwrap_or(d.len());
                        String::from_utf8_lossy(&d[0..strlen]).into_owned()
                    })
                    .collect(),
            )),
            DbrBasicType::Char => Ok(DbrValue::Char(count(be_i8, item_count).parse(data)?.1)),
            DbrBasicType::Int => Ok(DbrValue::Int(count(be_i16, item_count).parse(data)?.1)),
            DbrBasicType::Long => Ok(DbrValue::Long(count(be_i32, item_count).parse(data)?.1)),
            DbrBasicType::Float => Ok(DbrValue::Float(count(be_f32, item_count).parse(data)?.1)),
            DbrBasicType::Double => Ok(DbrValue::Double(count(be_f64, item_count).parse(data)?.1)),
        }
    }

    pub fn resize(&mut self, to_size: usize) -> Result<(), DbrValueIsEnumError> {
        match self {
            DbrValue::Enum(_) => Err(DbrValueIsEnumError)?,
            DbrValue::String(items) => items.resize(to_size, String::new()),
            DbrValue::Char(items) => items.resize(to_size, 0),
            DbrValue::Int(items) => items.resize(to_size, 0),
            DbrValue::Long(items) => items.resize(to_size, 0),
            DbrValue::Float(items) => items.resize(to_size, 0.0),
            DbrValue::Double(items) => items.resize(to_size, 0.0),
        };
        Ok(())
    }
}

/// Implement a From<datatype> for a specific dbrvalue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<&$typ> for DbrValue {
            fn from(value: &$typ) -> Self {
                DbrValue::$variant(vec![value.clone()])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Ok(match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => v,
                    _ => unreachable!(),
                })
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

macro_rules! impl_dbrvalue_copy_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
        impl TryFrom<&DbrValue> for $typ {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                let items: Vec<$typ> = value.try_into()?;
                items.first().copied().ok_or(ErrorCondition::BadCount)
            }
        }
    };
}
impl_dbrvalue_copy_conversions_between!(Char, i8);
impl_dbrvalue_copy_conversions_between!(Int, i16);
impl_dbrvalue_copy_conversions_between!(Long, i32);
impl_dbrvalue_copy_conversions_between!(Float, f32);
impl_dbrvalue_copy_conversions_between!(Double, f64);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_string()])
    }
}
impl TryFrom<&DbrValue> for String {
    type Error = ErrorCondition;
    fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
        let items: Vec<String> = value.try_into()?;
        items.into_iter().next().ok_or(ErrorCondition::BadCount)
    }
}

/// Which kinds of change cause a subscription update to be sent.
///
/// Transported in the low bits of the EVENT_ADD payload mask field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MonitorMask {
    /// Value changes exceeding the value deadband
    pub value: bool,
    /// Value changes exceeding the archival deadband
    pub log: bool,
    /// Alarm state changes
    pub alarm: bool,
    /// Metadata (e.g. limit) changes
    pub property: bool,
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask {
            value: true,
            log: false,
            alarm: true,
            property: false,
        }
    }
}

impl MonitorMask {
    pub fn from_bits(bits: u16) -> Self {
        MonitorMask {
            value: bits & 0x01 != 0,
            log: bits & 0x02 != 0,
            alarm: bits & 0x04 != 0,
            property: bits & 0x08 != 0,
        }
    }
    pub fn to_bits(&self) -> u16 {
        (self.value as u16)
            | (self.log as u16) << 1
            | (self.alarm as u16) << 2
            | (self.property as u16) << 3
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Limits<T: num_traits::Bounded + ToBytes> {
    pub display_limits: (T, T),
    pub alarm_limits: (T, T),
    pub warning_limits: (T, T),
}
impl<T: Bounded + ToBytes + Copy> Limits<T> {
    /// Wire order is upper/lower display, upper alarm, upper/lower
    /// warning, lower alarm
    fn to_be_bytes(&self) -> Vec<u8> {
        let (d_l, d_u) = &self.display_limits;
        let (a_l, a_u) = &self.alarm_limits;
        let (w_l, w_u) = &self.warning_limits;

        let values = [d_u, d_l, a_u, w_u, w_l, a_l];
        values
            .iter()
            .flat_map(|v| v.to_be_bytes().as_ref().to_vec())
            .collect()
    }

    fn parse<'a, P>(item: P, input: &'a [u8]) -> IResult<&'a [u8], Self>
    where
        P: Parser<&'a [u8], Output = T, Error = nom::error::Error<&'a [u8]>>,
    {
        let (input, vals) = count(item, 6).parse(input)?;
        Ok((
            input,
            Limits {
                display_limits: (vals[1], vals[0]),
                alarm_limits: (vals[5], vals[2]),
                warning_limits: (vals[4], vals[3]),
            },
        ))
    }
}
impl<T: Bounded + ToBytes> Default for Limits<T> {
    fn default() -> Self {
        Self {
            display_limits: (T::min_value(), T::max_value()),
            alarm_limits: (T::min_value(), T::max_value()),
            warning_limits: (T::min_value(), T::max_value()),
        }
    }
}

fn units_to_bytes(units: &str) -> Vec<u8> {
    let mut bytes = string_to_fixed_length_bytes(units, MAX_UNITS_SIZE - 1);
    bytes.resize(MAX_UNITS_SIZE, 0u8);
    bytes
}

fn enum_labels_to_bytes(labels: &[String]) -> Vec<u8> {
    let mut out = (labels.len().min(MAX_ENUM_STATES) as i16).to_be_bytes().to_vec();
    let mut block = vec![0u8; MAX_ENUM_STATES * MAX_ENUM_STRING_SIZE];
    for (i, label) in labels.iter().take(MAX_ENUM_STATES).enumerate() {
        let bytes = string_to_fixed_length_bytes(label, MAX_ENUM_STRING_SIZE - 1);
        block[i * MAX_ENUM_STRING_SIZE..][..bytes.len()].copy_from_slice(&bytes);
    }
    out.extend(block);
    out
}

fn parse_enum_labels(input: &[u8]) -> IResult<&[u8], Vec<String>> {
    let (input, no_str) = be_i16(input)?;
    // The state string block is always the full sixteen slots
    let (input, block) = take(MAX_ENUM_STATES * MAX_ENUM_STRING_SIZE)(input)?;
    let labels = block
        .chunks(MAX_ENUM_STRING_SIZE)
        .take(no_str.clamp(0, MAX_ENUM_STATES as i16) as usize)
        .map(|chunk| {
            let strlen = chunk.iter().position(|&c| c == 0x00).unwrap_or(chunk.len());
            String::from_utf8_lossy(&chunk[..strlen]).into_owned()
        })
        .collect();
    Ok((input, labels))
}

/// The display metadata attached to the Graphics and Control categories.
///
/// The float types carry a display precision ahead of the units (with two
/// alignment bytes between, per the C struct layouts), the enum type
/// carries its state strings, and strings have no metadata at all beyond
/// the alarm status.
#[derive(Clone, Debug, PartialEq)]
pub enum DbrGraphics {
    Enum { labels: Vec<String> },
    String,
    Char { units: String, limits: Limits<i8> },
    Int { units: String, limits: Limits<i16> },
    Long { units: String, limits: Limits<i32> },
    Float { units: String, limits: Limits<f32>, precision: i16 },
    Double { units: String, limits: Limits<f64>, precision: i16 },
}

impl DbrGraphics {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum { labels: Vec::new() },
            DbrBasicType::Int => DbrGraphics::Int {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Char => DbrGraphics::Char {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Long => DbrGraphics::Long {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Float => DbrGraphics::Float {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
            DbrBasicType::Double => DbrGraphics::Double {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
        }
    }

    /// The enum state strings, if this is enum metadata
    pub fn enum_labels(&self) -> Option<&[String]> {
        match self {
            DbrGraphics::Enum { labels } => Some(labels),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            DbrGraphics::Enum { labels } => enum_labels_to_bytes(labels),
            // GR_STRING is just STS_STRING, no extra metadata
            DbrGraphics::String => Vec::new(),
            DbrGraphics::Char { units, limits } => {
                let mut out = units_to_bytes(units);
                out.append(&mut limits.to_be_bytes());
                out
            }
            DbrGraphics::Int { units, limits } => {
                let mut out = units_to_bytes(units);
                out.append(&mut limits.to_be_bytes());
                out
            }
            DbrGraphics::Long { units, limits } => {
                let mut out = units_to_bytes(units);
                out.append(&mut limits.to_be_bytes());
                out
            }
            DbrGraphics::Float {
                units,
                limits,
                precision,
            } => {
                let mut out = precision.to_be_bytes().to_vec();
                out.extend([0u8; 2]);
                out.append(&mut units_to_bytes(units));
                out.append(&mut limits.to_be_bytes());
                out
            }
            DbrGraphics::Double {
                units,
                limits,
                precision,
            } => {
                let mut out = precision.to_be_bytes().to_vec();
                out.extend([0u8; 2]);
                out.append(&mut units_to_bytes(units));
                out.append(&mut limits.to_be_bytes());
                out
            }
        }
    }

    fn parse(kind: DbrBasicType, input: &[u8]) -> IResult<&[u8], Self> {
        Ok(match kind {
            DbrBasicType::String => (input, DbrGraphics::String),
            DbrBasicType::Enum => {
                let (input, labels) = parse_enum_labels(input)?;
                (input, DbrGraphics::Enum { labels })
            }
            DbrBasicType::Char => {
                let (input, units) = fixed_length_string(MAX_UNITS_SIZE)(input)?;
                let (input, limits) = Limits::parse(be_i8, input)?;
                (input, DbrGraphics::Char { units, limits })
            }
            DbrBasicType::Int => {
                let (input, units) = fixed_length_string(MAX_UNITS_SIZE)(input)?;
                let (input, limits) = Limits::parse(be_i16, input)?;
                (input, DbrGraphics::Int { units, limits })
            }
            DbrBasicType::Long => {
                let (input, units) = fixed_length_string(MAX_UNITS_SIZE)(input)?;
                let (input, limits) = Limits::parse(be_i32, input)?;
                (input, DbrGraphics::Long { units, limits })
            }
            DbrBasicType::Float => {
                let (input, precision) = be_i16(input)?;
                let (input, _) = take(2usize)(input)?;
                let (input, units) = fixed_length_string(MAX_UNITS_SIZE)(input)?;
                let (input, limits) = Limits::parse(be_f32, input)?;
                (
                    input,
                    DbrGraphics::Float {
                        units,
                        limits,
                        precision,
                    },
                )
            }
            DbrBasicType::Double => {
                let (input, precision) = be_i16(input)?;
                let (input, _) = take(2usize)(input)?;
                let (input, units) = fixed_length_string(MAX_UNITS_SIZE)(input)?;
                let (input, limits) = Limits::parse(be_f64, input)?;
                (
                    input,
                    DbrGraphics::Double {
                        units,
                        limits,
                        precision,
                    },
                )
            }
        })
    }
}

/// Control limits for the Control category, stored as (lower, upper).
///
/// Enum and String control reads carry nothing beyond the Graphics
/// metadata, so those variants are empty.
#[derive(Clone, Debug, PartialEq)]
pub enum DbrControl {
    Enum,
    String,
    Char(i8, i8),
    Int(i16, i16),
    Long(i32, i32),
    Float(f32, f32),
    Double(f64, f64),
}

impl DbrControl {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrControl::String,
            DbrBasicType::Enum => DbrControl::Enum,
            DbrBasicType::Int => DbrControl::Int(i16::MIN, i16::MAX),
            DbrBasicType::Float => DbrControl::Float(f32::MIN, f32::MAX),
            DbrBasicType::Char => DbrControl::Char(i8::MIN, i8::MAX),
            DbrBasicType::Long => DbrControl::Long(i32::MIN, i32::MAX),
            DbrBasicType::Double => DbrControl::Double(f64::MIN, f64::MAX),
        }
    }

    /// Wire order is upper then lower
    fn to_be_bytes(&self) -> Vec<u8> {
        match self {
            DbrControl::Enum => Vec::new(),
            DbrControl::String => Vec::new(),
            DbrControl::Char(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Int(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Long(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Float(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Double(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
        }
    }

    fn parse(kind: DbrBasicType, input: &[u8]) -> IResult<&[u8], Self> {
        Ok(match kind {
            DbrBasicType::String => (input, DbrControl::String),
            DbrBasicType::Enum => (input, DbrControl::Enum),
            DbrBasicType::Char => {
                let (input, vals) = count(be_i8, 2).parse(input)?;
                (input, DbrControl::Char(vals[1], vals[0]))
            }
            DbrBasicType::Int => {
                let (input, vals) = count(be_i16, 2).parse(input)?;
                (input, DbrControl::Int(vals[1], vals[0]))
            }
            DbrBasicType::Long => {
                let (input, vals) = count(be_i32, 2).parse(input)?;
                (input, DbrControl::Long(vals[1], vals[0]))
            }
            DbrBasicType::Float => {
                let (input, vals) = count(be_f32, 2).parse(input)?;
                (input, DbrControl::Float(vals[1], vals[0]))
            }
            DbrBasicType::Double => {
                let (input, vals) = count(be_f64, 2).parse(input)?;
                (input, DbrControl::Double(vals[1], vals[0]))
            }
        })
    }
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}
impl TryFrom<u16> for DbrBasicType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::String as u16 => Ok(Self::String),
            x if x == Self::Int as u16 => Ok(Self::Int),
            x if x == Self::Float as u16 => Ok(Self::Float),
            x if x == Self::Enum as u16 => Ok(Self::Enum),
            x if x == Self::Char as u16 => Ok(Self::Char),
            x if x == Self::Long as u16 => Ok(Self::Long),
            x if x == Self::Double as u16 => Ok(Self::Double),
            _ => Err(()),
        }
    }
}

impl DbrBasicType {
    /// Pair with a category to form the full wire type
    pub fn with_category(self, category: DbrCategory) -> DbrType {
        DbrType {
            basic_type: self,
            category,
        }
    }
}

/// Marks a type as being convertible to a DBRValue representation
pub trait IntoDbrBasicType {
    fn get_dbr_basic_type() -> DbrBasicType;
}

macro_rules! impl_into_dbr_basic_type {
    ($t:ty, $variant:ident) => {
        impl IntoDbrBasicType for $t {
            fn get_dbr_basic_type() -> DbrBasicType {
                DbrBasicType::$variant
            }
        }
    };
}

impl_into_dbr_basic_type!(i8, Char);
impl_into_dbr_basic_type!(u8, Int);
impl_into_dbr_basic_type!(i16, Int);
impl_into_dbr_basic_type!(u16, Long);
impl_into_dbr_basic_type!(i32, Long);
impl_into_dbr_basic_type!(f32, Float);
impl_into_dbr_basic_type!(f64, Double);
impl_into_dbr_basic_type!(String, String);

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
    /// The special single-valued DBR_CLASS_NAME
    ClassName = 8,
}
impl TryFrom<u16> for DbrCategory {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Basic as u16 => Ok(Self::Basic),
            x if x == Self::Status as u16 => Ok(Self::Status),
            x if x == Self::Time as u16 => Ok(Self::Time),
            x if x == Self::Graphics as u16 => Ok(Self::Graphics),
            x if x == Self::Control as u16 => Ok(Self::Control),
            38 => Ok(Self::ClassName),
            _ => Err(()),
        }
    }
}

/// Represent and translate from ID every possible combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

pub const DBR_BASIC_STRING: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::Basic,
};

pub const DBR_CLASS_NAME: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::ClassName,
};

impl TryFrom<u16> for DbrType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            38 => Ok(DBR_CLASS_NAME),
            value if value < 38 => Ok(Self {
                basic_type: (value % 7).try_into()?,
                category: (value / 7).try_into()?,
            }),
            _ => Err(()),
        }
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        match value {
            DBR_CLASS_NAME => 38,
            value => value.category as u16 * 7 + value.basic_type as u16,
        }
    }
}

impl DbrType {
    /// Give the lookup for the padding for each DBR type
    ///
    /// When encoding a return packet, there is a datatype-specific
    /// padding to be inserted between the metadata about the value and
    /// the actual value itself. This is given as a lookup table rather
    /// than a calculation, matching the RISC_pad fields of the C struct
    /// definitions.
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn get_metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Char) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Int) => 2,
            (DbrCategory::Time, DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Char) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            (DbrCategory::Graphics, DbrBasicType::Char) => 1,
            (DbrCategory::Control, DbrBasicType::Char) => 1,
            _ => 0,
        }
    }
    fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
}

impl FromStr for DbrType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let mut s: &str = &upper;
        if s.starts_with("DBR_") {
            s = &s[4..];
        };
        let category = if s.contains("_") {
            let cats = &s[..s.find("_").unwrap()];
            s = &s[s.find("_").unwrap() + 1..];
            match cats {
                "BASIC" => DbrCategory::Basic,
                "STS" => DbrCategory::Status,
                "TIME" => DbrCategory::Time,
                "GR" => DbrCategory::Graphics,
                "CTRL" => DbrCategory::Control,
                "CLASS" => DbrCategory::ClassName,
                _ => return Err(()),
            }
        } else {
            DbrCategory::Basic
        };
        let kind = match s {
            "STRING" => DbrBasicType::String,
            "INT" => DbrBasicType::Int,
            "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            "NAME" if category == DbrCategory::ClassName => DbrBasicType::String,
            _ => return Err(()),
        };
        if matches!(category, DbrCategory::ClassName) && !matches!(kind, DbrBasicType::String) {
            // Class name is _only_ CLASS_NAME
            return Err(());
        }
        Ok(DbrType {
            basic_type: kind,
            category,
        })
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status {
        status: Status,
        value: DbrValue,
    },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    Graphics {
        status: Status,
        graphics: DbrGraphics,
        value: DbrValue,
    },
    Control {
        status: Status,
        graphics: DbrGraphics,
        control: DbrControl,
        value: DbrValue,
    },
    ClassName(DbrValue),
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
            Dbr::ClassName(value) => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
            Dbr::ClassName(value) => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
            Dbr::ClassName(_) => None,
        }
    }
    /// The source timestamp, if this DBR carries one
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    /// The display metadata, if this DBR carries any
    pub fn graphics(&self) -> Option<&DbrGraphics> {
        match self {
            Dbr::Graphics { graphics, .. } => Some(graphics),
            Dbr::Control { graphics, .. } => Some(graphics),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        match self {
            Dbr::Basic(value) => DbrType::new(value.get_type(), DbrCategory::Basic),
            Dbr::Status { value, .. } => DbrType::new(value.get_type(), DbrCategory::Status),
            Dbr::Time { value, .. } => DbrType::new(value.get_type(), DbrCategory::Time),
            Dbr::Graphics { value, .. } => DbrType::new(value.get_type(), DbrCategory::Graphics),
            Dbr::Control { value, .. } => DbrType::new(value.get_type(), DbrCategory::Control),
            Dbr::ClassName(_) => DBR_CLASS_NAME,
        }
    }

    pub fn from_bytes(
        data_type: DbrType,
        data_count: usize,
        data: &[u8],
    ) -> Result<Dbr, nom::Err<nom::error::Error<&[u8]>>> {
        let has_status = !matches!(
            data_type.category,
            DbrCategory::Basic | DbrCategory::ClassName
        );
        let (data, status) = if has_status {
            let (d, (status, severity)) = (be_i16, be_i16).parse(data)?;
            (d, Some(Status { status, severity }))
        } else {
            (data, None)
        };

        let (data, timestamp) = if data_type.category == DbrCategory::Time {
            let (input, (time_s, time_ns)) = (be_i32, be_u32).parse(data)?;
            (
                input,
                Some(
                    UNIX_EPOCH
                        .checked_add(Duration::new(time_s as u64 + EPICS_EPOCH_DELTA, time_ns))
                        .unwrap(),
                ),
            )
        } else {
            (data, None)
        };

        let (data, graphics) = if matches!(
            data_type.category,
            DbrCategory::Graphics | DbrCategory::Control
        ) {
            let (d, graphics) = DbrGraphics::parse(data_type.basic_type, data)?;
            (d, Some(graphics))
        } else {
            (data, None)
        };

        let (data, control) = if data_type.category == DbrCategory::Control {
            let (d, control) = DbrControl::parse(data_type.basic_type, data)?;
            (d, Some(control))
        } else {
            (data, None)
        };

        // Offset the read buffer to account for metadata padding
        let data = &data[data_type.get_metadata_padding()..];
        let value = DbrValue::decode_value(data_type.basic_type, data_count, data)?;

        Ok(match data_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status {
                status: status.unwrap(),
                value,
            },
            DbrCategory::Time => Dbr::Time {
                status: status.unwrap(),
                timestamp: timestamp.unwrap(),
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status: status.unwrap(),
                graphics: graphics.unwrap(),
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status: status.unwrap(),
                graphics: graphics.unwrap(),
                control: control.unwrap(),
                value,
            },
            DbrCategory::ClassName => Dbr::ClassName(value),
        })
    }

    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let mut buffer = Cursor::new(Vec::new());
        let real_count = self.write_be(&mut buffer, max_elems).unwrap();
        (real_count, buffer.into_inner())
    }

    /// Write a requested number of elements to a stream
    ///
    /// Return the actual number of elements written
    pub fn write_be<W: io::Write>(
        &self,
        writer: &mut W,
        max_elems: Option<NonZeroUsize>,
    ) -> io::Result<usize> {
        let (real_elems, data) = self.value().to_bytes(max_elems);
        // All except Basic and ClassName write status/severity
        if let Some(status) = self.status() {
            writer.write_all(&status.status.to_be_bytes())?;
            writer.write_all(&status.severity.to_be_bytes())?;
        }
        match self {
            Dbr::Time { timestamp, .. } => {
                let unix_time = timestamp.duration_since(UNIX_EPOCH).unwrap();
                let time_s = unix_time.as_secs().saturating_sub(EPICS_EPOCH_DELTA) as u32;
                let time_ns = unix_time.subsec_nanos();
                writer.write_all(&time_s.to_be_bytes())?;
                writer.write_all(&time_ns.to_be_bytes())?;
            }
            Dbr::Graphics { graphics, .. } => {
                writer.write_all(&graphics.to_bytes())?;
            }
            Dbr::Control {
                graphics, control, ..
            } => {
                writer.write_all(&graphics.to_bytes())?;
                writer.write_all(&control.to_be_bytes())?;
            }
            _ => (),
        }

        writer.write_all(&vec![0u8; self.data_type().get_metadata_padding()])?;
        writer.write_all(&data)?;
        Ok(real_elems)
    }

    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, ErrorCondition> {
        let value = self.value().convert_to(dbr_type.basic_type)?;
        let to_graphics = |graphics: &DbrGraphics| {
            if value.get_type() == self.value().get_type() {
                graphics.clone()
            } else {
                DbrGraphics::default_for(value.get_type())
            }
        };
        // First handle category changes - we can do this for some but not all
        Ok(match self {
            Dbr::Basic(_) => match dbr_type.category {
                DbrCategory::Basic => Dbr::Basic(value),
                DbrCategory::Status => Dbr::Status {
                    status: Status::default(),
                    value,
                },
                DbrCategory::Time => Dbr::Time {
                    status: Status::default(),
                    timestamp: SystemTime::now(),
                    value,
                },
                DbrCategory::Graphics => Dbr::Graphics {
                    status: Status::default(),
                    graphics: DbrGraphics::default_for(value.get_type()),
                    value,
                },
                DbrCategory::Control => Dbr::Control {
                    status: Status::default(),
                    graphics: DbrGraphics::default_for(value.get_type()),
                    control: DbrControl::default_for(value.get_type()),
                    value,
                },
                _ => return Err(ErrorCondition::NoConvert),
            },
            Dbr::Status { status, .. } => match dbr_type.category {
                DbrCategory::Basic => Dbr::Basic(value),
                DbrCategory::Status => Dbr::Status {
                    status: *status,
                    value,
                },
                DbrCategory::Time => Dbr::Time {
                    status: *status,
                    timestamp: SystemTime::now(),
                    value,
                },
                DbrCategory::Graphics => Dbr::Graphics {
                    status: *status,
                    graphics: DbrGraphics::default_for(value.get_type()),
                    value,
                },
                DbrCategory::Control => Dbr::Control {
                    status: *status,
                    graphics: DbrGraphics::default_for(value.get_type()),
                    control: DbrControl::default_for(value.get_type()),
                    value,
                },
                _ => return Err(ErrorCondition::NoConvert),
            },
            Dbr::Time {
                status,
                timestamp: ts,
                value: _,
            } => match dbr_type.category {
                DbrCategory::Basic => Dbr::Basic(value),
                DbrCategory::Status => Dbr::Status {
                    status: *status,
                    value,
                },
                DbrCategory::Time => Dbr::Time {
                    status: *status,
                    timestamp: *ts,
                    value,
                },
                DbrCategory::Graphics => Dbr::Graphics {
                    status: *status,
                    graphics: DbrGraphics::default_for(value.get_type()),
                    value,
                },
                DbrCategory::Control => Dbr::Control {
                    status: *status,
                    graphics: DbrGraphics::default_for(value.get_type()),
                    control: DbrControl::default_for(value.get_type()),
                    value,
                },
                _ => return Err(ErrorCondition::NoConvert),
            },
            Dbr::Graphics { status, graphics, .. } => match dbr_type.category {
                DbrCategory::Basic => Dbr::Basic(value),
                DbrCategory::Status => Dbr::Status {
                    status: *status,
                    value,
                },
                DbrCategory::Time => Dbr::Time {
                    status: *status,
                    timestamp: SystemTime::now(),
                    value,
                },
                DbrCategory::Graphics => {
                    let graphics = to_graphics(graphics);
                    Dbr::Graphics {
                        status: *status,
                        graphics,
                        value,
                    }
                }
                DbrCategory::Control => {
                    let graphics = to_graphics(graphics);
                    Dbr::Control {
                        status: *status,
                        graphics,
                        control: DbrControl::default_for(value.get_type()),
                        value,
                    }
                }
                _ => return Err(ErrorCondition::NoConvert),
            },
            Dbr::Control {
                status,
                graphics,
                control,
                ..
            } => match dbr_type.category {
                DbrCategory::Basic => Dbr::Basic(value),
                DbrCategory::Status => Dbr::Status {
                    status: *status,
                    value,
                },
                DbrCategory::Time => Dbr::Time {
                    status: *status,
                    timestamp: SystemTime::now(),
                    value,
                },
                DbrCategory::Graphics => {
                    let graphics = to_graphics(graphics);
                    Dbr::Graphics {
                        status: *status,
                        graphics,
                        value,
                    }
                }
                DbrCategory::Control => {
                    let graphics = to_graphics(graphics);
                    let control = if value.get_type() == self.value().get_type() {
                        control.clone()
                    } else {
                        DbrControl::default_for(value.get_type())
                    };
                    Dbr::Control {
                        status: *status,
                        graphics,
                        control,
                        value,
                    }
                }
                _ => return Err(ErrorCondition::NoConvert),
            },
            // ClassName cannot be converted as it isn't a normal form of data
            Dbr::ClassName(_) => match dbr_type.category {
                DbrCategory::ClassName => Dbr::ClassName(value),
                _ => return Err(ErrorCondition::NoConvert),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::vec;

    use super::*;

    #[test]
    fn single_or_vec() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert!(v.convert_to(DbrBasicType::Char).is_err());
        assert_eq!(v.to_bytes(None).1, vec![0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap().to_bytes(None).1,
            vec![0x01, 0xF4]
        );

        let data = vec![500.23f32, 12.7f32];
        let v: DbrValue = data.clone().into();
        assert_eq!(v.get_count(), 2);
        assert_eq!(
            v.to_bytes(None).1,
            data.iter()
                .flat_map(|v| v.to_be_bytes())
                .collect::<Vec<u8>>()
        );
        assert_eq!(
            v.to_bytes(NonZeroUsize::new(1)).1,
            data.iter()
                .take(1)
                .flat_map(|v| v.to_be_bytes())
                .collect::<Vec<u8>>()
        );
        // Try converting this to an int with truncation
        let v = v.convert_to(DbrBasicType::Int).unwrap();
        assert_eq!(v.to_bytes(None).1, vec![0x01, 0xf4, 0x00, 0x0c]);

        assert_eq!(
            DbrValue::Float(vec![455.9f32])
                .convert_to(DbrBasicType::Long)
                .unwrap()
                .to_bytes(NonZeroUsize::new(5))
                .1,
            vec![0x00, 0x00, 0x01, 0xc7]
        );
    }

    #[test]
    fn encode_dbr() {
        let example_packet = [
            0x0, 0x0, 0x0, 0x0, 0x42, 0x32, 0x19, 0x99, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x2a,
        ];
        let dbr = Dbr::Time {
            status: Status::default(),
            timestamp: SystemTime::UNIX_EPOCH
                .checked_add(Duration::from_secs(1741731609))
                .unwrap(),
            value: vec![42i32].into(),
        };

        let (_size, out_data) = dbr
            .convert_to(DbrType {
                basic_type: DbrBasicType::Long,
                category: DbrCategory::Time,
            })
            .unwrap()
            .to_bytes(None);
        assert_eq!(out_data.len(), example_packet.len());
        assert_eq!(out_data, example_packet);

        // And back again, preserving the timestamp
        let reparsed = Dbr::from_bytes(
            DbrType {
                basic_type: DbrBasicType::Long,
                category: DbrCategory::Time,
            },
            1,
            &example_packet,
        )
        .unwrap();
        assert_eq!(*reparsed.value(), DbrValue::Long(vec![42]));
        assert_eq!(reparsed.timestamp(), dbr.timestamp());
    }

    #[test]
    fn test_string_to_char() {
        let test_string = "a test string".to_string();
        let s = DbrValue::String(vec![test_string.clone()]);
        let as_char = s.convert_to(DbrBasicType::Char).unwrap();
        let re_s = as_char.convert_to(DbrBasicType::String).unwrap();

        assert_eq!(s, re_s);
    }

    #[test]
    fn test_dbr_string_conversions() {
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Status),
            "DBR_STS_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Time),
            "TIME_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Graphics),
            "DBR_GR_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Control),
            "DBR_CTRL_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::String, DbrCategory::Graphics),
            "GR_STRING".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "SHORT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Enum, DbrCategory::Basic),
            "ENUM".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::String, DbrCategory::ClassName),
            "DBR_CLASS_NAME".parse().unwrap()
        );
        assert!("DBR_CLASS_INT".parse::<DbrType>().is_err());
    }

    #[test]
    fn ctrl_enum_roundtrip() {
        let dbr = Dbr::Control {
            status: Status::default(),
            graphics: DbrGraphics::Enum {
                labels: vec!["OFF".to_string(), "ON".to_string(), "FAULT".to_string()],
            },
            control: DbrControl::Enum,
            value: DbrValue::Enum(1),
        };
        let (elems, bytes) = dbr.to_bytes(None);
        assert_eq!(elems, 1);
        // status + severity + no_str + 16 slots of 26 bytes + value
        assert_eq!(bytes.len(), 2 + 2 + 2 + 16 * 26 + 2);

        let reparsed = Dbr::from_bytes(
            DbrType {
                basic_type: DbrBasicType::Enum,
                category: DbrCategory::Control,
            },
            1,
            &bytes,
        )
        .unwrap();
        assert_eq!(*reparsed.value(), DbrValue::Enum(1));
        assert_eq!(
            reparsed.graphics().and_then(|g| g.enum_labels()),
            Some(&["OFF".to_string(), "ON".to_string(), "FAULT".to_string()][..])
        );
    }

    #[test]
    fn ctrl_double_layout() {
        let dbr = Dbr::Control {
            status: Status::default(),
            graphics: DbrGraphics::Double {
                units: "mm".to_string(),
                limits: Limits {
                    display_limits: (0.0, 10.0),
                    alarm_limits: (0.0, 10.0),
                    warning_limits: (0.0, 10.0),
                },
                precision: 3,
            },
            control: DbrControl::Double(0.0, 10.0),
            value: DbrValue::Double(vec![3.25]),
        };
        let (_, bytes) = dbr.to_bytes(None);
        // status(2) severity(2) precision(2) pad(2) units(8) six display
        // limits (48) two control limits (16) then the value
        assert_eq!(bytes.len(), 2 + 2 + 2 + 2 + 8 + 48 + 16 + 8);
        assert_eq!(&bytes[4..6], &3i16.to_be_bytes());
        assert_eq!(&bytes[8..10], b"mm");
        assert_eq!(&bytes[80..88], &3.25f64.to_be_bytes());

        let reparsed = Dbr::from_bytes(
            DbrType {
                basic_type: DbrBasicType::Double,
                category: DbrCategory::Control,
            },
            1,
            &bytes,
        )
        .unwrap();
        assert_eq!(*reparsed.value(), DbrValue::Double(vec![3.25]));
        let Dbr::Control {
            graphics, control, ..
        } = reparsed
        else {
            panic!("Expected a control DBR");
        };
        assert_eq!(
            graphics,
            DbrGraphics::Double {
                units: "mm".to_string(),
                limits: Limits {
                    display_limits: (0.0, 10.0),
                    alarm_limits: (0.0, 10.0),
                    warning_limits: (0.0, 10.0),
                },
                precision: 3,
            }
        );
        assert_eq!(control, DbrControl::Double(0.0, 10.0));
    }

    #[test]
    fn monitor_mask_bits() {
        assert_eq!(MonitorMask::default().to_bits(), 0b0101);
        assert_eq!(MonitorMask::from_bits(0b0101), MonitorMask::default());
        let all = MonitorMask {
            value: true,
            log: true,
            alarm: true,
            property: true,
        };
        assert_eq!(MonitorMask::from_bits(all.to_bits()), all);
    }
}
