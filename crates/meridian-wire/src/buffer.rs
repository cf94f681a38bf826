//! Big-endian byte buffer codec.
//!
//! [`ByteBuffer`] is a positional read view over a reference-counted byte
//! region. Reads advance a `position` cursor and fail with
//! [`WireError::Overrun`] rather than panic when they would cross `limit`.
//! [`ByteBuffer::slice`] produces a view that shares the underlying storage,
//! which is how result tables borrow from the response buffer without
//! copying.
//!
//! The write side is a set of free functions over [`BytesMut`]; outbound
//! buffers grow as needed, so only reads carry overrun checks.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};

/// Width of a wire decimal in bytes.
pub const DECIMAL_WIDTH: usize = 16;

/// Implied fixed-point scale of a wire decimal.
pub const DECIMAL_SCALE: u32 = 12;

/// Null sentinel for decimals: `0x80` followed by fifteen zero bytes.
pub const DECIMAL_NULL: i128 = i128::MIN;

/// A bounded big-endian read cursor over shared byte storage.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: Bytes,
    position: usize,
    limit: usize,
}

impl ByteBuffer {
    /// Creates a buffer spanning the whole region, positioned at the start.
    pub fn new(data: Bytes) -> Self {
        let limit = data.len();
        Self {
            data,
            position: 0,
            limit,
        }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the read position. Fails if `position` would pass `limit`.
    pub fn set_position(&mut self, position: usize) -> WireResult<()> {
        if position > self.limit {
            return Err(WireError::Overrun {
                needed: position - self.position,
                available: self.remaining(),
            });
        }
        self.position = position;
        Ok(())
    }

    /// Current limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Moves the limit. Fails if `limit` would pass the end of the storage.
    pub fn set_limit(&mut self, limit: usize) -> WireResult<()> {
        if limit > self.data.len() {
            return Err(WireError::Overrun {
                needed: limit,
                available: self.data.len(),
            });
        }
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
        Ok(())
    }

    /// Bytes left between `position` and `limit`.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// True when every byte up to `limit` has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.position == self.limit
    }

    /// A new buffer sharing storage from `position` to `limit`, with its own
    /// cursors.
    pub fn slice(&self) -> ByteBuffer {
        ByteBuffer::new(self.data.slice(self.position..self.limit))
    }

    fn take(&mut self, n: usize) -> WireResult<&[u8]> {
        if self.remaining() < n {
            return Err(WireError::Overrun {
                needed: n,
                available: self.remaining(),
            });
        }
        let start = self.position;
        self.position += n;
        Ok(&self.data[start..self.position])
    }

    fn take_array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_i8(&mut self) -> WireResult<i8> {
        Ok(self.take_array::<1>()?[0] as i8)
    }

    pub fn get_u8(&mut self) -> WireResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_i16(&mut self) -> WireResult<i16> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> WireResult<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> WireResult<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn get_f64(&mut self) -> WireResult<f64> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    /// Reads a length-prefixed UTF-8 string. A length of −1 signals null.
    pub fn get_string(&mut self) -> WireResult<Option<String>> {
        let len = self.get_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(WireError::InvalidLength(len));
        }
        let bytes = self.take(len as usize)?;
        Ok(Some(std::str::from_utf8(bytes)?.to_owned()))
    }

    /// Reads a length-prefixed binary field as a shared slice of the
    /// underlying storage. A length of −1 signals null.
    pub fn get_varbinary(&mut self) -> WireResult<Option<Bytes>> {
        let len = self.get_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(WireError::InvalidLength(len));
        }
        let len = len as usize;
        if self.remaining() < len {
            return Err(WireError::Overrun {
                needed: len,
                available: self.remaining(),
            });
        }
        let start = self.position;
        self.position += len;
        Ok(Some(self.data.slice(start..self.position)))
    }

    /// Reads a 16-byte two's-complement big-endian decimal (implied scale
    /// 12) as its scaled integer representation.
    pub fn get_decimal(&mut self) -> WireResult<i128> {
        Ok(i128::from_be_bytes(self.take_array()?))
    }

    /// Reads a timestamp as microseconds since the Unix epoch.
    pub fn get_timestamp(&mut self) -> WireResult<i64> {
        self.get_i64()
    }
}

/// Writes a length-prefixed UTF-8 string; `None` encodes the null length −1.
pub fn put_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        None => buf.put_i32(-1),
        Some(s) => {
            debug_assert!(s.len() <= i32::MAX as usize);
            buf.put_i32(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
    }
}

/// Writes a length-prefixed binary field; `None` encodes the null length −1.
pub fn put_varbinary(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        None => buf.put_i32(-1),
        Some(b) => {
            debug_assert!(b.len() <= i32::MAX as usize);
            buf.put_i32(b.len() as i32);
            buf.put_slice(b);
        }
    }
}

/// Writes a decimal from its scaled integer representation.
pub fn put_decimal(buf: &mut BytesMut, scaled: i128) {
    buf.put_slice(&scaled.to_be_bytes());
}

/// Writes a timestamp as microseconds since the Unix epoch.
pub fn put_timestamp(buf: &mut BytesMut, micros: i64) {
    buf.put_i64(micros);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_of(bytes: &[u8]) -> ByteBuffer {
        ByteBuffer::new(Bytes::copy_from_slice(bytes))
    }

    #[test]
    fn primitive_reads_are_big_endian() {
        let mut buf = buffer_of(&[
            0x01, // i8
            0x00, 0x02, // i16
            0x00, 0x00, 0x00, 0x03, // i32
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, // i64
        ]);
        assert_eq!(buf.get_i8().unwrap(), 1);
        assert_eq!(buf.get_i16().unwrap(), 2);
        assert_eq!(buf.get_i32().unwrap(), 3);
        assert_eq!(buf.get_i64().unwrap(), 4);
        assert!(buf.is_exhausted());
    }

    #[test]
    fn f64_round_trip() {
        let mut out = BytesMut::new();
        out.put_f64(1.5);
        let mut buf = ByteBuffer::new(out.freeze());
        assert_eq!(buf.get_f64().unwrap(), 1.5);
    }

    #[test]
    fn read_past_limit_is_overrun() {
        let mut buf = buffer_of(&[0x00, 0x01]);
        assert!(matches!(
            buf.get_i32(),
            Err(WireError::Overrun {
                needed: 4,
                available: 2
            })
        ));
        // The failed read must not move the cursor.
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn string_round_trip_and_null() {
        let mut out = BytesMut::new();
        put_string(&mut out, Some("hello"));
        put_string(&mut out, None);
        put_string(&mut out, Some(""));

        let mut buf = ByteBuffer::new(out.freeze());
        assert_eq!(buf.get_string().unwrap().as_deref(), Some("hello"));
        assert_eq!(buf.get_string().unwrap(), None);
        assert_eq!(buf.get_string().unwrap().as_deref(), Some(""));
    }

    #[test]
    fn varbinary_shares_storage() {
        let mut out = BytesMut::new();
        put_varbinary(&mut out, Some(&[0xAA, 0xBB, 0xCC]));
        let frozen = out.freeze();

        let mut buf = ByteBuffer::new(frozen.clone());
        let body = buf.get_varbinary().unwrap().unwrap();
        assert_eq!(&body[..], &[0xAA, 0xBB, 0xCC]);
        // Same allocation, offset past the length prefix.
        assert_eq!(body.as_ptr(), frozen[4..].as_ptr());
    }

    #[test]
    fn decimal_round_trip_and_null_sentinel() {
        let mut out = BytesMut::new();
        put_decimal(&mut out, 7_500_000_000_000); // 7.5 at scale 12
        put_decimal(&mut out, DECIMAL_NULL);
        let bytes = out.freeze();

        // Null sentinel is 0x80 then zeros.
        assert_eq!(bytes[DECIMAL_WIDTH], 0x80);
        assert!(bytes[DECIMAL_WIDTH + 1..].iter().all(|&b| b == 0));

        let mut buf = ByteBuffer::new(bytes);
        assert_eq!(buf.get_decimal().unwrap(), 7_500_000_000_000);
        assert_eq!(buf.get_decimal().unwrap(), DECIMAL_NULL);
    }

    #[test]
    fn slice_shares_region_with_independent_cursors() {
        let mut buf = buffer_of(&[1, 2, 3, 4, 5, 6]);
        buf.set_position(2).unwrap();
        buf.set_limit(5).unwrap();

        let mut view = buf.slice();
        assert_eq!(view.remaining(), 3);
        assert_eq!(view.get_i8().unwrap(), 3);

        // The parent cursor is untouched by reads on the slice.
        assert_eq!(buf.position(), 2);
        assert_eq!(buf.get_i8().unwrap(), 3);
    }

    #[test]
    fn limit_bounds_reads() {
        let mut buf = buffer_of(&[1, 2, 3, 4]);
        buf.set_limit(2).unwrap();
        assert_eq!(buf.get_i16().unwrap(), 0x0102);
        assert!(matches!(buf.get_i8(), Err(WireError::Overrun { .. })));
        buf.set_limit(4).unwrap();
        assert_eq!(buf.get_i16().unwrap(), 0x0304);
    }
}
