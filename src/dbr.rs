//! Represent CA DBR representations, for data interchange.
//!
//! CA defines thirty-nine [DBR] kinds as special structures used to transfer data
//! back and forth. These break down into seven basic array types, which define the
//! data, and five categories of attached metadata. This module models that
//! decomposition, decodes the structures servers send back for reads and
//! subscriptions, and encodes the values sent for writes.
//!
//! The basic types are enumerated in [`DbrBasicType`] and values are held in
//! [`DbrValue`]. Every kind is an array on the wire; a scalar is an array of one.
//!
//! The metadata categories are enumerated by [`DbrCategory`] and the combined
//! structure is represented by [`Dbr`]:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - Everything in [`Dbr::Status`], plus a timestamp.
//! - [`Dbr::Graphics`] - Status plus [`DisplayInfo`]: units, precision and limits
//!   for numeric types, or the state strings for enums.
//! - [`Dbr::Control`] - Graphics information plus control limits.
//! - [`Dbr::ClassName`] - The EPICS record type for the PV.
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
use num::NumCast;
use std::{
    fmt,
    io::{self, Write},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

use crate::messages::ErrorCondition;

// Constants from EPICS
const MAX_STRING_SIZE: usize = 40;
const MAX_UNITS_SIZE: usize = 8;
const MAX_ENUM_STRING_SIZE: usize = 26;
const MAX_ENUM_STATES: usize = 16;
/// Seconds from the UNIX epoch to the EPICS epoch, 1990-01-01
const EPICS_EPOCH_OFFSET: u64 = 631152000;

#[derive(Error, Debug)]
pub enum DbrDecodeError {
    #[error("Payload too short for {count} element(s) of {data_type}")]
    Truncated { data_type: DbrType, count: usize },
}

/// Encode a String to a fixed-maximum-length byte array
///
/// Convert one character at a time so that multi-byte characters are never
/// split, stopping before the length would reach `max_length`.
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

fn write_fixed_string<W: Write>(writer: &mut W, value: &str, size: usize) -> io::Result<()> {
    let mut buffer = string_to_fixed_length_bytes(value, size);
    buffer.resize(size, 0u8);
    writer.write_all(&buffer)
}

/// Read a NUL-terminated string out of a fixed-size field
fn fixed_string(data: &[u8]) -> String {
    let strlen = data.iter().position(|&c| c == 0x00).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..strlen]).into_owned()
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl DbrBasicType {
    /// Size of a single element on the wire
    pub fn element_size(&self) -> usize {
        match self {
            DbrBasicType::String => MAX_STRING_SIZE,
            DbrBasicType::Int | DbrBasicType::Enum => 2,
            DbrBasicType::Float | DbrBasicType::Long => 4,
            DbrBasicType::Char => 1,
            DbrBasicType::Double => 8,
        }
    }
}

impl TryFrom<u16> for DbrBasicType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::String),
            1 => Ok(Self::Int),
            2 => Ok(Self::Float),
            3 => Ok(Self::Enum),
            4 => Ok(Self::Char),
            5 => Ok(Self::Long),
            6 => Ok(Self::Double),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DbrBasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DbrBasicType::String => "STRING",
            DbrBasicType::Int => "SHORT",
            DbrBasicType::Float => "FLOAT",
            DbrBasicType::Enum => "ENUM",
            DbrBasicType::Char => "CHAR",
            DbrBasicType::Long => "LONG",
            DbrBasicType::Double => "DOUBLE",
        })
    }
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
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
            0 => Ok(Self::Basic),
            1 => Ok(Self::Status),
            2 => Ok(Self::Time),
            3 => Ok(Self::Graphics),
            4 => Ok(Self::Control),
            _ => Err(()),
        }
    }
}

/// Represent and translate from ID every possible combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

pub const DBR_BASIC_STRING: DbrType = DbrType::new(DbrBasicType::String, DbrCategory::Basic);
pub const DBR_CLASS_NAME: DbrType = DbrType::new(DbrBasicType::String, DbrCategory::ClassName);

impl TryFrom<u16> for DbrType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            38 => Ok(DBR_CLASS_NAME),
            value if value < 35 => Ok(Self {
                basic_type: (value % 7).try_into()?,
                category: (value / 7).try_into()?,
            }),
            _ => Err(()),
        }
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        match value.category {
            DbrCategory::ClassName => 38,
            category => category as u16 * 7 + value.basic_type as u16,
        }
    }
}

impl DbrType {
    pub const fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }

    /// Padding inserted between the metadata and the value itself.
    ///
    /// The C structures align the value field, so some combinations carry
    /// trailing pad bytes. Padding that sits in the middle of the graphics
    /// structures (after `precision`) is handled where those are parsed.
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
}

impl fmt::Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.category {
            DbrCategory::Basic => "",
            DbrCategory::Status => "STS_",
            DbrCategory::Time => "TIME_",
            DbrCategory::Graphics => "GR_",
            DbrCategory::Control => "CTRL_",
            DbrCategory::ClassName => return f.write_str("DBR_CLASS_NAME"),
        };
        write!(f, "DBR_{prefix}{}", self.basic_type)
    }
}

impl FromStr for DbrType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let name = upper.strip_prefix("DBR_").unwrap_or(&upper);
        if name == "CLASS_NAME" {
            return Ok(DBR_CLASS_NAME);
        }
        let (category, kind) = match name.split_once('_') {
            Some((category, kind)) => (
                match category {
                    "BASIC" => DbrCategory::Basic,
                    "STS" => DbrCategory::Status,
                    "TIME" => DbrCategory::Time,
                    "GR" => DbrCategory::Graphics,
                    "CTRL" => DbrCategory::Control,
                    _ => return Err(()),
                },
                kind,
            ),
            None => (DbrCategory::Basic, name),
        };
        let basic_type = match kind {
            "STRING" => DbrBasicType::String,
            "INT" | "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            _ => return Err(()),
        };
        Ok(DbrType::new(basic_type, category))
    }
}

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    String(Vec<String>),
    Int(Vec<i16>),
    Float(Vec<f32>),
    Enum(Vec<u16>),
    Char(Vec<i8>),
    Long(Vec<i32>),
    Double(Vec<f64>),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::String(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Enum(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }

    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Parse `item_count` elements of a basic type
    pub fn parse(
        basic_type: DbrBasicType,
        item_count: usize,
        input: &[u8],
    ) -> IResult<&[u8], DbrValue> {
        Ok(match basic_type {
            DbrBasicType::String => {
                let (input, raw) = take(item_count.saturating_mul(MAX_STRING_SIZE)).parse(input)?;
                (
                    input,
                    DbrValue::String(raw.chunks(MAX_STRING_SIZE).map(fixed_string).collect()),
                )
            }
            DbrBasicType::Int => {
                let (input, v) = count(be_i16, item_count).parse(input)?;
                (input, DbrValue::Int(v))
            }
            DbrBasicType::Float => {
                let (input, v) = count(be_f32, item_count).parse(input)?;
                (input, DbrValue::Float(v))
            }
            DbrBasicType::Enum => {
                let (input, v) = count(be_u16, item_count).parse(input)?;
                (input, DbrValue::Enum(v))
            }
            DbrBasicType::Char => {
                let (input, v) = count(be_i8, item_count).parse(input)?;
                (input, DbrValue::Char(v))
            }
            DbrBasicType::Long => {
                let (input, v) = count(be_i32, item_count).parse(input)?;
                (input, DbrValue::Long(v))
            }
            DbrBasicType::Double => {
                let (input, v) = count(be_f64, item_count).parse(input)?;
                (input, DbrValue::Double(v))
            }
        })
    }

    /// Encode the value contents into their wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            DbrValue::String(val) => val
                .iter()
                .flat_map(|v| {
                    let mut buf = string_to_fixed_length_bytes(v, MAX_STRING_SIZE);
                    buf.resize(MAX_STRING_SIZE, 0u8);
                    buf
                })
                .collect(),
            DbrValue::Int(val) => val.iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrValue::Float(val) => val.iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrValue::Enum(val) => val.iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrValue::Char(val) => val.iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrValue::Long(val) => val.iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrValue::Double(val) => val.iter().flat_map(|v| v.to_be_bytes()).collect(),
        }
    }

    /// Convert every element to a numeric type, parsing strings
    fn to_numeric<T: NumCast>(&self) -> Result<Vec<T>, ErrorCondition> {
        fn cast<F: NumCast + Copy, T: NumCast>(from: &[F]) -> Result<Vec<T>, ErrorCondition> {
            from.iter()
                .map(|n| T::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        match self {
            DbrValue::String(val) => val
                .iter()
                .map(|s| {
                    s.trim()
                        .parse::<f64>()
                        .ok()
                        .and_then(T::from)
                        .ok_or(ErrorCondition::NoConvert)
                })
                .collect(),
            DbrValue::Int(val) => cast(val),
            DbrValue::Float(val) => cast(val),
            DbrValue::Enum(val) => cast(val),
            DbrValue::Char(val) => cast(val),
            DbrValue::Long(val) => cast(val),
            DbrValue::Double(val) => cast(val),
        }
    }

    fn to_strings(&self) -> Vec<String> {
        fn each<T: ToString>(from: &[T]) -> Vec<String> {
            from.iter().map(|v| v.to_string()).collect()
        }
        match self {
            DbrValue::String(val) => val.clone(),
            DbrValue::Int(val) => each(val),
            DbrValue::Float(val) => each(val),
            DbrValue::Enum(val) => each(val),
            DbrValue::Char(val) => each(val),
            DbrValue::Long(val) => each(val),
            DbrValue::Double(val) => each(val),
        }
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        if basic_type == self.get_type() {
            return Ok(self.clone());
        }
        Ok(match basic_type {
            DbrBasicType::String => DbrValue::String(self.to_strings()),
            DbrBasicType::Int => DbrValue::Int(self.to_numeric()?),
            DbrBasicType::Float => DbrValue::Float(self.to_numeric()?),
            DbrBasicType::Enum => DbrValue::Enum(self.to_numeric()?),
            DbrBasicType::Char => DbrValue::Char(self.to_numeric()?),
            DbrBasicType::Long => DbrValue::Long(self.to_numeric()?),
            DbrBasicType::Double => DbrValue::Double(self.to_numeric()?),
        })
    }

    /// Interpret a character array as a NUL-terminated string
    pub fn as_char_string(&self) -> Option<String> {
        let DbrValue::Char(val) = self else {
            return None;
        };
        let bytes: Vec<u8> = val.iter().map(|c| *c as u8).collect();
        Some(fixed_string(&bytes))
    }
}

impl fmt::Display for DbrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_strings().join(" "))
    }
}

/// Implement conversions between a specific dbrvalue kind and native types
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => Err(ErrorCondition::NoConvert),
                }
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Enum, u16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_owned()])
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// An upper/lower pair of limits
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Limits {
    pub upper: f64,
    pub lower: f64,
}

/// Display metadata carried by the GR and CTRL categories
#[derive(Clone, Debug, PartialEq)]
pub enum DisplayInfo {
    /// Strings carry no metadata beyond status
    String,
    Enum {
        strings: Vec<String>,
    },
    Numeric {
        units: String,
        /// Only sent for floating point types
        precision: Option<i16>,
        display: Limits,
        alarm: Limits,
        warning: Limits,
        /// Only sent for the CTRL category
        control: Option<Limits>,
    },
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    Graphics {
        status: Status,
        info: DisplayInfo,
        value: DbrValue,
    },
    Control {
        status: Status,
        info: DisplayInfo,
        value: DbrValue,
    },
    ClassName(DbrValue),
}

fn parse_status(input: &[u8]) -> IResult<&[u8], Status> {
    let (input, (status, severity)) = (be_i16, be_i16).parse(input)?;
    Ok((input, Status { status, severity }))
}

fn parse_timestamp(input: &[u8]) -> IResult<&[u8], SystemTime> {
    let (input, (secs, nanos)) = (be_u32, be_u32).parse(input)?;
    Ok((
        input,
        UNIX_EPOCH + Duration::new(secs as u64 + EPICS_EPOCH_OFFSET, nanos),
    ))
}

/// Limits are sent in the native type of the value
fn parse_limit(basic_type: DbrBasicType, input: &[u8]) -> IResult<&[u8], f64> {
    match basic_type {
        DbrBasicType::Char => be_i8(input).map(|(i, v)| (i, v as f64)),
        DbrBasicType::Int => be_i16(input).map(|(i, v)| (i, v as f64)),
        DbrBasicType::Long => be_i32(input).map(|(i, v)| (i, v as f64)),
        DbrBasicType::Float => be_f32(input).map(|(i, v)| (i, v as f64)),
        DbrBasicType::Double => be_f64(input),
        DbrBasicType::String | DbrBasicType::Enum => Ok((input, 0.0)),
    }
}

fn write_limit<W: Write>(writer: &mut W, basic_type: DbrBasicType, value: f64) -> io::Result<()> {
    match basic_type {
        DbrBasicType::Char => writer.write_all(&(value as i8).to_be_bytes()),
        DbrBasicType::Int => writer.write_all(&(value as i16).to_be_bytes()),
        DbrBasicType::Long => writer.write_all(&(value as i32).to_be_bytes()),
        DbrBasicType::Float => writer.write_all(&(value as f32).to_be_bytes()),
        DbrBasicType::Double => writer.write_all(&value.to_be_bytes()),
        DbrBasicType::String | DbrBasicType::Enum => Ok(()),
    }
}

/// Skip alignment padding, then read the value
fn padded_value(data_type: DbrType, data_count: usize, input: &[u8]) -> IResult<&[u8], DbrValue> {
    let (input, _) = take(data_type.get_metadata_padding()).parse(input)?;
    DbrValue::parse(data_type.basic_type, data_count, input)
}

fn has_precision(basic_type: DbrBasicType) -> bool {
    matches!(basic_type, DbrBasicType::Float | DbrBasicType::Double)
}

fn parse_display_info(data_type: DbrType, input: &[u8]) -> IResult<&[u8], DisplayInfo> {
    match data_type.basic_type {
        DbrBasicType::String => Ok((input, DisplayInfo::String)),
        DbrBasicType::Enum => {
            let (input, no_str) = be_i16(input)?;
            let (input, raw) = take(MAX_ENUM_STATES * MAX_ENUM_STRING_SIZE).parse(input)?;
            let strings = raw
                .chunks(MAX_ENUM_STRING_SIZE)
                .take(no_str.clamp(0, MAX_ENUM_STATES as i16) as usize)
                .map(fixed_string)
                .collect();
            Ok((input, DisplayInfo::Enum { strings }))
        }
        basic_type => {
            let (input, precision) = if has_precision(basic_type) {
                let (input, (precision, _pad)) = (be_i16, be_i16).parse(input)?;
                (input, Some(precision))
            } else {
                (input, None)
            };
            let (input, units) = take(MAX_UNITS_SIZE).parse(input)?;
            let (input, limits) = count(|i| parse_limit(basic_type, i), 6).parse(input)?;
            let (input, control) = if data_type.category == DbrCategory::Control {
                let (input, control) = count(|i| parse_limit(basic_type, i), 2).parse(input)?;
                (
                    input,
                    Some(Limits {
                        upper: control[0],
                        lower: control[1],
                    }),
                )
            } else {
                (input, None)
            };
            Ok((
                input,
                DisplayInfo::Numeric {
                    units: fixed_string(units),
                    precision,
                    display: Limits {
                        upper: limits[0],
                        lower: limits[1],
                    },
                    alarm: Limits {
                        upper: limits[2],
                        lower: limits[5],
                    },
                    warning: Limits {
                        upper: limits[3],
                        lower: limits[4],
                    },
                    control,
                },
            ))
        }
    }
}

fn write_display_info<W: Write>(
    writer: &mut W,
    basic_type: DbrBasicType,
    info: &DisplayInfo,
    with_control: bool,
) -> io::Result<()> {
    match info {
        DisplayInfo::String => Ok(()),
        DisplayInfo::Enum { strings } => {
            let no_str = strings.len().min(MAX_ENUM_STATES);
            writer.write_all(&(no_str as i16).to_be_bytes())?;
            for i in 0..MAX_ENUM_STATES {
                let state = strings.get(i).map(String::as_str).unwrap_or("");
                write_fixed_string(writer, state, MAX_ENUM_STRING_SIZE)?;
            }
            Ok(())
        }
        DisplayInfo::Numeric {
            units,
            precision,
            display,
            alarm,
            warning,
            control,
        } => {
            if has_precision(basic_type) {
                writer.write_all(&precision.unwrap_or(0).to_be_bytes())?;
                writer.write_all(&0i16.to_be_bytes())?;
            }
            write_fixed_string(writer, units, MAX_UNITS_SIZE)?;
            for limit in [
                display.upper,
                display.lower,
                alarm.upper,
                warning.upper,
                warning.lower,
                alarm.lower,
            ] {
                write_limit(writer, basic_type, limit)?;
            }
            if with_control {
                let control = control.unwrap_or_default();
                write_limit(writer, basic_type, control.upper)?;
                write_limit(writer, basic_type, control.lower)?;
            }
            Ok(())
        }
    }
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
            Dbr::Basic(_) | Dbr::ClassName(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn display_info(&self) -> Option<&DisplayInfo> {
        match self {
            Dbr::Graphics { info, .. } | Dbr::Control { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
            Dbr::ClassName(_) => return DBR_CLASS_NAME,
        };
        DbrType::new(self.value().get_type(), category)
    }

    pub fn from_bytes(
        data_type: DbrType,
        data_count: usize,
        data: &[u8],
    ) -> Result<Dbr, DbrDecodeError> {
        Self::parse(data_type, data_count, data)
            .map(|(_, dbr)| dbr)
            .map_err(|_| DbrDecodeError::Truncated {
                data_type,
                count: data_count,
            })
    }

    fn parse(data_type: DbrType, data_count: usize, input: &[u8]) -> IResult<&[u8], Dbr> {
        let value = |input| padded_value(data_type, data_count, input);
        Ok(match data_type.category {
            DbrCategory::Basic => {
                let (input, value) = value(input)?;
                (input, Dbr::Basic(value))
            }
            DbrCategory::ClassName => {
                let (input, value) = DbrValue::parse(DbrBasicType::String, 1, input)?;
                (input, Dbr::ClassName(value))
            }
            DbrCategory::Status => {
                let (input, status) = parse_status(input)?;
                let (input, value) = value(input)?;
                (input, Dbr::Status { status, value })
            }
            DbrCategory::Time => {
                let (input, status) = parse_status(input)?;
                let (input, timestamp) = parse_timestamp(input)?;
                let (input, value) = value(input)?;
                (
                    input,
                    Dbr::Time {
                        status,
                        timestamp,
                        value,
                    },
                )
            }
            DbrCategory::Graphics => {
                let (input, status) = parse_status(input)?;
                let (input, info) = parse_display_info(data_type, input)?;
                let (input, value) = value(input)?;
                (
                    input,
                    Dbr::Graphics {
                        status,
                        info,
                        value,
                    },
                )
            }
            DbrCategory::Control => {
                let (input, status) = parse_status(input)?;
                let (input, info) = parse_display_info(data_type, input)?;
                let (input, value) = value(input)?;
                (
                    input,
                    Dbr::Control {
                        status,
                        info,
                        value,
                    },
                )
            }
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.write_be(&mut buffer);
        buffer
    }

    pub fn write_be<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        if let Some(status) = self.status() {
            writer.write_all(&status.status.to_be_bytes())?;
            writer.write_all(&status.severity.to_be_bytes())?;
        }
        match self {
            Dbr::Time { timestamp, .. } => {
                let since_epoch = timestamp
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .saturating_sub(Duration::from_secs(EPICS_EPOCH_OFFSET));
                writer.write_all(&(since_epoch.as_secs() as u32).to_be_bytes())?;
                writer.write_all(&since_epoch.subsec_nanos().to_be_bytes())?;
            }
            Dbr::Graphics { info, value, .. } => {
                write_display_info(writer, value.get_type(), info, false)?;
            }
            Dbr::Control { info, value, .. } => {
                write_display_info(writer, value.get_type(), info, true)?;
            }
            _ => (),
        }
        writer.write_all(&vec![0u8; self.data_type().get_metadata_padding()])?;
        writer.write_all(&self.value().to_bytes())
    }
}
