use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Invalid {data_type} value: {input}")]
    InvalidValue { data_type: DataType, input: String },
    #[error("Unknown data type tag: {0}")]
    UnknownDataType(u8),
    #[error("Invalid series path: {0}")]
    InvalidSeriesPath(String),
    #[error("Truncated value encoding")]
    Truncated,
    #[error("Decimal scale {0} exceeds the supported maximum of 18")]
    DecimalScale(u8),
    #[error("Value of {len} bytes does not fit a fixed width of {width} bytes")]
    ValueTooWide { len: usize, width: usize },
}

/// The value kind of a series. Fixed for the lifetime of the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float,
    Double,
    Text,
    Decimal,
}

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::Boolean,
        DataType::Int32,
        DataType::Int64,
        DataType::Float,
        DataType::Double,
        DataType::Text,
        DataType::Decimal,
    ];

    /// Tag byte used by the binary encodings
    pub fn tag(self) -> u8 {
        match self {
            DataType::Boolean => 0,
            DataType::Int32 => 1,
            DataType::Int64 => 2,
            DataType::Float => 3,
            DataType::Double => 4,
            DataType::Text => 5,
            DataType::Decimal => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, DataError> {
        DataType::ALL
            .iter()
            .copied()
            .find(|t| t.tag() == tag)
            .ok_or(DataError::UnknownDataType(tag))
    }

    /// In-memory element size used for buffer size estimates.
    /// Text is accounted as a reference; its payload is added separately.
    pub fn element_size(self) -> usize {
        match self {
            DataType::Boolean => 1,
            DataType::Int32 | DataType::Float => 4,
            DataType::Int64 | DataType::Double => 8,
            DataType::Text => std::mem::size_of::<String>(),
            DataType::Decimal => 9,
        }
    }

    /// Payload width of a fixed-width record. Text values are length-prefixed
    /// and padded to `text_width` bytes.
    pub fn fixed_width(self, text_width: usize) -> usize {
        match self {
            DataType::Text => 4 + text_width,
            other => other.element_size(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::Text => "TEXT",
            DataType::Decimal => "DECIMAL",
        };
        f.write_str(name)
    }
}

/// Largest scale whose divisor fits in an `i64`
pub const MAX_DECIMAL_SCALE: u8 = 18;

/// Fixed-point decimal: `unscaled * 10^-scale`.
///
/// Equality, ordering and hashing go by numeric value, so `1.5` and `1.50`
/// are the same decimal.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    unscaled: i64,
    scale: u8,
}

impl Decimal {
    pub fn new(unscaled: i64, scale: u8) -> Result<Self, DataError> {
        if scale > MAX_DECIMAL_SCALE {
            return Err(DataError::DecimalScale(scale));
        }
        Ok(Self { unscaled, scale })
    }

    pub fn unscaled(&self) -> i64 {
        self.unscaled
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// Parses plain decimal notation such as `-12.345`
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (negative, digits) = match input.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, input.strip_prefix('+').unwrap_or(input)),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
            return None;
        }
        if frac_part.len() > MAX_DECIMAL_SCALE as usize {
            return None;
        }
        let scale = frac_part.len() as u8;
        let combined = format!("{}{}", int_part, frac_part);
        let magnitude: i64 = if combined.is_empty() { 0 } else { combined.parse().ok()? };
        let unscaled = if negative { -magnitude } else { magnitude };
        Some(Self { unscaled, scale })
    }

    pub fn to_f64(self) -> f64 {
        self.unscaled as f64 / 10f64.powi(self.scale as i32)
    }

    /// Scale is at most 18, so the product stays well inside `i128`
    fn rescaled(self, scale: u8) -> i128 {
        let shift = scale.saturating_sub(self.scale) as u32;
        self.unscaled as i128 * 10i128.pow(shift)
    }

    /// Same value with trailing fractional zeros dropped
    fn normalized(self) -> Self {
        let mut out = self;
        while out.scale > 0 && out.unscaled % 10 == 0 {
            out.unscaled /= 10;
            out.scale -= 1;
        }
        out
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl Hash for Decimal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let normalized = self.normalized();
        normalized.unscaled.hash(state);
        normalized.scale.hash(state);
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        self.rescaled(scale).cmp(&other.rescaled(scale))
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.unscaled);
        }
        let divisor = 10u64.pow(self.scale as u32);
        let magnitude = self.unscaled.unsigned_abs();
        let sign = if self.unscaled < 0 { "-" } else { "" };
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            magnitude / divisor,
            magnitude % divisor,
            width = self.scale as usize
        )
    }
}

/// A single typed value of a series
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Decimal(Decimal),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::Text(_) => DataType::Text,
            Value::Decimal(_) => DataType::Decimal,
        }
    }

    /// Converts the textual form received from the ingestion path
    pub fn parse(data_type: DataType, input: &str) -> Result<Self, DataError> {
        let invalid = || DataError::InvalidValue {
            data_type,
            input: input.to_string(),
        };
        let trimmed = input.trim();
        let value = match data_type {
            DataType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                _ => return Err(invalid()),
            },
            DataType::Int32 => Value::Int32(trimmed.parse().map_err(|_| invalid())?),
            DataType::Int64 => Value::Int64(trimmed.parse().map_err(|_| invalid())?),
            DataType::Float => Value::Float(trimmed.parse().map_err(|_| invalid())?),
            DataType::Double => Value::Double(trimmed.parse().map_err(|_| invalid())?),
            DataType::Text => Value::Text(input.to_string()),
            DataType::Decimal => Value::Decimal(Decimal::parse(trimmed).ok_or_else(invalid)?),
        };
        Ok(value)
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Decimal(d) => Some(d.to_f64()),
            Value::Boolean(_) | Value::Text(_) => None,
        }
    }

    /// Orders two values for predicate evaluation. Numeric kinds compare with
    /// each other; booleans and text only compare with their own kind.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }

    /// Estimated bytes this value contributes to a memtable row
    pub fn mem_size(&self) -> usize {
        match self {
            Value::Text(s) => s.len(),
            other => other.data_type().element_size(),
        }
    }

    /// Appends the tagged, variable-width encoding of this value
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.data_type().tag());
        self.encode_payload(buf);
    }

    /// Decodes a value written by [`Value::encode`], returning it with the
    /// number of bytes consumed
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DataError> {
        let tag = *buf.first().ok_or(DataError::Truncated)?;
        let data_type = DataType::from_tag(tag)?;
        let (value, used) = Self::decode_payload(data_type, &buf[1..])?;
        Ok((value, 1 + used))
    }

    /// Appends a tagged record of exactly `1 + data_type.fixed_width(text_width)` bytes
    pub fn encode_fixed(&self, text_width: usize, buf: &mut Vec<u8>) -> Result<(), DataError> {
        buf.push(self.data_type().tag());
        match self {
            Value::Text(s) => {
                if s.len() > text_width {
                    return Err(DataError::ValueTooWide {
                        len: s.len(),
                        width: text_width,
                    });
                }
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
                buf.resize(buf.len() + text_width - s.len(), 0);
            }
            other => other.encode_payload(buf),
        }
        Ok(())
    }

    /// Decodes a record written by [`Value::encode_fixed`]
    pub fn decode_fixed(buf: &[u8]) -> Result<Self, DataError> {
        let tag = *buf.first().ok_or(DataError::Truncated)?;
        let data_type = DataType::from_tag(tag)?;
        Self::decode_payload(data_type, &buf[1..]).map(|(value, _)| value)
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Boolean(v) => buf.push(*v as u8),
            Value::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Float(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Text(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Decimal(d) => {
                buf.extend_from_slice(&d.unscaled.to_le_bytes());
                buf.push(d.scale);
            }
        }
    }

    fn decode_payload(data_type: DataType, body: &[u8]) -> Result<(Self, usize), DataError> {
        let fixed = |width: usize| body.get(..width).ok_or(DataError::Truncated);
        let decoded = match data_type {
            DataType::Boolean => (Value::Boolean(fixed(1)?[0] != 0), 1),
            DataType::Int32 => (Value::Int32(i32::from_le_bytes(array(body)?)), 4),
            DataType::Int64 => (Value::Int64(i64::from_le_bytes(array(body)?)), 8),
            DataType::Float => (Value::Float(f32::from_le_bytes(array(body)?)), 4),
            DataType::Double => (Value::Double(f64::from_le_bytes(array(body)?)), 8),
            DataType::Decimal => {
                let bytes = fixed(9)?;
                let decimal = Decimal::new(i64::from_le_bytes(array(bytes)?), bytes[8])?;
                (Value::Decimal(decimal), 9)
            }
            DataType::Text => {
                let len = u32::from_le_bytes(array(body)?) as usize;
                let bytes = body.get(4..4 + len).ok_or(DataError::Truncated)?;
                let text = String::from_utf8(bytes.to_vec()).map_err(|_| DataError::InvalidValue {
                    data_type,
                    input: String::from_utf8_lossy(bytes).into_owned(),
                })?;
                (Value::Text(text), 4 + len)
            }
        };
        Ok(decoded)
    }
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], DataError> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or(DataError::Truncated)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
            Value::Decimal(v) => write!(f, "{}", v),
        }
    }
}

/// A single point of a series
#[derive(Debug, Clone, PartialEq)]
pub struct TimeValuePair {
    timestamp: i64,
    value: Value,
}

impl TimeValuePair {
    pub fn new(timestamp: i64, value: Value) -> Self {
        Self { timestamp, value }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl fmt::Display for TimeValuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.value)
    }
}

/// Identifies a series: one measurement of one device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesPath {
    device: String,
    measurement: String,
}

impl SeriesPath {
    pub fn new(device: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
        }
    }

    /// Parses `device.measurement`, splitting on the last separator
    pub fn parse(full_path: &str) -> Result<Self, DataError> {
        match full_path.rsplit_once('.') {
            Some((device, measurement)) if !device.is_empty() && !measurement.is_empty() => {
                Ok(Self::new(device, measurement))
            }
            _ => Err(DataError::InvalidSeriesPath(full_path.to_string())),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }
}

impl fmt::Display for SeriesPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device, self.measurement)
    }
}
