//! Typed values and their wire encoding.

use bytes::{BufMut, BytesMut};

use crate::buffer::{self, ByteBuffer, DECIMAL_NULL, DECIMAL_SCALE};
use crate::error::{WireError, WireResult};

/// Largest element count an array parameter can describe on the wire.
const MAX_ARRAY_LEN: usize = i16::MAX as usize;

/// Wire type codes for values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    Null,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Double,
    Text,
    Timestamp,
    Decimal,
    Varbinary,
    Array,
}

impl WireType {
    /// The protocol code for this type.
    pub fn code(self) -> i8 {
        match self {
            WireType::Null => 1,
            WireType::TinyInt => 3,
            WireType::SmallInt => 4,
            WireType::Integer => 5,
            WireType::BigInt => 6,
            WireType::Double => 8,
            WireType::Text => 9,
            WireType::Timestamp => 11,
            WireType::Decimal => 22,
            WireType::Varbinary => 25,
            WireType::Array => -99,
        }
    }

    /// Resolves a protocol code.
    pub fn from_code(code: i8) -> WireResult<Self> {
        match code {
            1 => Ok(WireType::Null),
            3 => Ok(WireType::TinyInt),
            4 => Ok(WireType::SmallInt),
            5 => Ok(WireType::Integer),
            6 => Ok(WireType::BigInt),
            8 => Ok(WireType::Double),
            9 => Ok(WireType::Text),
            11 => Ok(WireType::Timestamp),
            22 => Ok(WireType::Decimal),
            25 => Ok(WireType::Varbinary),
            -99 => Ok(WireType::Array),
            other => Err(WireError::UnknownTypeCode(other)),
        }
    }
}

/// A fixed-point decimal with implied scale 12, stored as its scaled
/// integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal(i128);

impl Decimal {
    /// The implied scale.
    pub const SCALE: u32 = DECIMAL_SCALE;

    /// The wire null sentinel.
    pub const NULL: Decimal = Decimal(DECIMAL_NULL);

    /// From the scaled integer representation (`value * 10^12`).
    pub fn from_scaled(scaled: i128) -> Self {
        Decimal(scaled)
    }

    /// From a whole number.
    pub fn from_integer(whole: i64) -> Self {
        Decimal(i128::from(whole) * 10i128.pow(Self::SCALE))
    }

    /// The scaled integer representation.
    pub fn scaled(self) -> i128 {
        self.0
    }

    /// True for the wire null sentinel.
    pub fn is_null(self) -> bool {
        self.0 == DECIMAL_NULL
    }
}

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    pub fn micros(self) -> i64 {
        self.0
    }
}

/// A procedure parameter or result column value.
///
/// Scalars and homogeneous one-dimensional arrays of each scalar type.
/// Dispatch is by variant tag; there is no type hierarchy behind this.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Double(f64),
    Decimal(Decimal),
    Timestamp(Timestamp),
    Text(String),
    Varbinary(Vec<u8>),
    TinyIntArray(Vec<i8>),
    SmallIntArray(Vec<i16>),
    IntegerArray(Vec<i32>),
    BigIntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    DecimalArray(Vec<Decimal>),
    TimestampArray(Vec<Timestamp>),
    TextArray(Vec<String>),
    VarbinaryArray(Vec<Vec<u8>>),
}

impl Value {
    /// The wire type this value encodes as. Arrays report [`WireType::Array`];
    /// use [`Value::element_type`] for their element type.
    pub fn wire_type(&self) -> WireType {
        match self {
            Value::Null => WireType::Null,
            Value::TinyInt(_) => WireType::TinyInt,
            Value::SmallInt(_) => WireType::SmallInt,
            Value::Integer(_) => WireType::Integer,
            Value::BigInt(_) => WireType::BigInt,
            Value::Double(_) => WireType::Double,
            Value::Decimal(_) => WireType::Decimal,
            Value::Timestamp(_) => WireType::Timestamp,
            Value::Text(_) => WireType::Text,
            Value::Varbinary(_) => WireType::Varbinary,
            _ => WireType::Array,
        }
    }

    /// The element type of an array value, `None` for scalars.
    pub fn element_type(&self) -> Option<WireType> {
        match self {
            Value::TinyIntArray(_) => Some(WireType::TinyInt),
            Value::SmallIntArray(_) => Some(WireType::SmallInt),
            Value::IntegerArray(_) => Some(WireType::Integer),
            Value::BigIntArray(_) => Some(WireType::BigInt),
            Value::DoubleArray(_) => Some(WireType::Double),
            Value::DecimalArray(_) => Some(WireType::Decimal),
            Value::TimestampArray(_) => Some(WireType::Timestamp),
            Value::TextArray(_) => Some(WireType::Text),
            Value::VarbinaryArray(_) => Some(WireType::Varbinary),
            _ => None,
        }
    }

    /// Encodes this value as a tagged parameter: an `i8` type code followed
    /// by the payload. Arrays carry the `ARRAY` code, the element type code,
    /// an `i16` element count, then the elements.
    pub fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        match self {
            Value::Null => buf.put_i8(WireType::Null.code()),
            Value::TinyInt(v) => {
                buf.put_i8(WireType::TinyInt.code());
                buf.put_i8(*v);
            }
            Value::SmallInt(v) => {
                buf.put_i8(WireType::SmallInt.code());
                buf.put_i16(*v);
            }
            Value::Integer(v) => {
                buf.put_i8(WireType::Integer.code());
                buf.put_i32(*v);
            }
            Value::BigInt(v) => {
                buf.put_i8(WireType::BigInt.code());
                buf.put_i64(*v);
            }
            Value::Double(v) => {
                buf.put_i8(WireType::Double.code());
                buf.put_f64(*v);
            }
            Value::Decimal(v) => {
                buf.put_i8(WireType::Decimal.code());
                buffer::put_decimal(buf, v.scaled());
            }
            Value::Timestamp(v) => {
                buf.put_i8(WireType::Timestamp.code());
                buffer::put_timestamp(buf, v.micros());
            }
            Value::Text(v) => {
                buf.put_i8(WireType::Text.code());
                buffer::put_string(buf, Some(v));
            }
            Value::Varbinary(v) => {
                buf.put_i8(WireType::Varbinary.code());
                buffer::put_varbinary(buf, Some(v));
            }
            Value::TinyIntArray(vs) => {
                Self::array_header(buf, WireType::TinyInt, vs.len())?;
                for v in vs {
                    buf.put_i8(*v);
                }
            }
            Value::SmallIntArray(vs) => {
                Self::array_header(buf, WireType::SmallInt, vs.len())?;
                for v in vs {
                    buf.put_i16(*v);
                }
            }
            Value::IntegerArray(vs) => {
                Self::array_header(buf, WireType::Integer, vs.len())?;
                for v in vs {
                    buf.put_i32(*v);
                }
            }
            Value::BigIntArray(vs) => {
                Self::array_header(buf, WireType::BigInt, vs.len())?;
                for v in vs {
                    buf.put_i64(*v);
                }
            }
            Value::DoubleArray(vs) => {
                Self::array_header(buf, WireType::Double, vs.len())?;
                for v in vs {
                    buf.put_f64(*v);
                }
            }
            Value::DecimalArray(vs) => {
                Self::array_header(buf, WireType::Decimal, vs.len())?;
                for v in vs {
                    buffer::put_decimal(buf, v.scaled());
                }
            }
            Value::TimestampArray(vs) => {
                Self::array_header(buf, WireType::Timestamp, vs.len())?;
                for v in vs {
                    buffer::put_timestamp(buf, v.micros());
                }
            }
            Value::TextArray(vs) => {
                Self::array_header(buf, WireType::Text, vs.len())?;
                for v in vs {
                    buffer::put_string(buf, Some(v));
                }
            }
            Value::VarbinaryArray(vs) => {
                Self::array_header(buf, WireType::Varbinary, vs.len())?;
                for v in vs {
                    buffer::put_varbinary(buf, Some(v));
                }
            }
        }
        Ok(())
    }

    fn array_header(buf: &mut BytesMut, element: WireType, len: usize) -> WireResult<()> {
        if len > MAX_ARRAY_LEN {
            return Err(WireError::ArrayTooLong(len));
        }
        buf.put_i8(WireType::Array.code());
        buf.put_i8(element.code());
        buf.put_i16(len as i16);
        Ok(())
    }

    /// Decodes a tagged value: reads the `i8` type code, then the payload.
    /// The mirror image of [`Value::encode`].
    pub fn decode_tagged(buf: &mut ByteBuffer) -> WireResult<Value> {
        let ty = WireType::from_code(buf.get_i8()?)?;
        if ty != WireType::Array {
            return Self::decode_scalar(buf, ty);
        }

        let element = WireType::from_code(buf.get_i8()?)?;
        let len = buf.get_i16()?;
        if len < 0 {
            return Err(WireError::InvalidLength(i32::from(len)));
        }
        let len = len as usize;

        macro_rules! read_array {
            ($variant:ident, $read:expr) => {{
                let mut vs = Vec::with_capacity(len);
                for _ in 0..len {
                    vs.push($read?);
                }
                Ok(Value::$variant(vs))
            }};
        }

        match element {
            WireType::TinyInt => read_array!(TinyIntArray, buf.get_i8()),
            WireType::SmallInt => read_array!(SmallIntArray, buf.get_i16()),
            WireType::Integer => read_array!(IntegerArray, buf.get_i32()),
            WireType::BigInt => read_array!(BigIntArray, buf.get_i64()),
            WireType::Double => read_array!(DoubleArray, buf.get_f64()),
            WireType::Decimal => {
                read_array!(DecimalArray, buf.get_decimal().map(Decimal::from_scaled))
            }
            WireType::Timestamp => {
                read_array!(TimestampArray, buf.get_timestamp().map(Timestamp::from_micros))
            }
            WireType::Text => read_array!(
                TextArray,
                buf.get_string()?
                    .ok_or_else(|| WireError::Malformed("null string inside array".into()))
            ),
            WireType::Varbinary => read_array!(
                VarbinaryArray,
                buf.get_varbinary()?
                    .map(|b| b.to_vec())
                    .ok_or_else(|| WireError::Malformed("null varbinary inside array".into()))
            ),
            WireType::Null | WireType::Array => {
                Err(WireError::Malformed(format!("invalid array element type {element:?}")))
            }
        }
    }

    /// Decodes an untagged scalar of a known type, as laid out in result
    /// table rows. Per-type null sentinels (minimum integer values, the
    /// decimal sign-bit pattern, the −1 string length) decode as
    /// [`Value::Null`].
    pub fn decode_scalar(buf: &mut ByteBuffer, ty: WireType) -> WireResult<Value> {
        let value = match ty {
            WireType::Null => Value::Null,
            WireType::TinyInt => match buf.get_i8()? {
                i8::MIN => Value::Null,
                v => Value::TinyInt(v),
            },
            WireType::SmallInt => match buf.get_i16()? {
                i16::MIN => Value::Null,
                v => Value::SmallInt(v),
            },
            WireType::Integer => match buf.get_i32()? {
                i32::MIN => Value::Null,
                v => Value::Integer(v),
            },
            WireType::BigInt => match buf.get_i64()? {
                i64::MIN => Value::Null,
                v => Value::BigInt(v),
            },
            WireType::Double => {
                let v = buf.get_f64()?;
                if v == f64::MIN {
                    Value::Null
                } else {
                    Value::Double(v)
                }
            }
            WireType::Decimal => {
                let v = buf.get_decimal()?;
                if v == DECIMAL_NULL {
                    Value::Null
                } else {
                    Value::Decimal(Decimal::from_scaled(v))
                }
            }
            WireType::Timestamp => match buf.get_timestamp()? {
                i64::MIN => Value::Null,
                v => Value::Timestamp(Timestamp::from_micros(v)),
            },
            WireType::Text => match buf.get_string()? {
                None => Value::Null,
                Some(s) => Value::Text(s),
            },
            WireType::Varbinary => match buf.get_varbinary()? {
                None => Value::Null,
                Some(b) => Value::Varbinary(b.to_vec()),
            },
            WireType::Array => {
                return Err(WireError::Malformed("array in a result column".into()));
            }
        };
        Ok(value)
    }
}
