//! Little-endian payload fields.
//!
//! Strings and byte blobs are length-prefixed: a `u16` (or `u32` for large
//! blobs such as photos) byte count followed by the bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{DecodeError, Error};

/// Builder for request payloads.
///
/// A string or blob too long for its length prefix is not written; the
/// payload is rejected by [PayloadWriter::finish] instead.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
    oversized: Option<usize>,
}

impl PayloadWriter {
    /// Start an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a byte.
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Append a bool as `0`/`1`.
    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.u8(u8::from(value))
    }

    /// Append a little-endian `u16`.
    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16_le(value);
        self
    }

    /// Append a little-endian `u32`.
    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    /// Append a little-endian `i32`.
    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    /// Append a little-endian `f32`.
    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.buf.put_f32_le(value);
        self
    }

    /// Append a millimetre value as integer micrometres.
    pub fn micros(&mut self, millimetres: f64) -> &mut Self {
        self.i32((millimetres * 1000.0).round() as i32)
    }

    /// Append a `u16`-length-prefixed UTF-8 string.
    pub fn string(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    /// Append a `u16`-length-prefixed byte blob.
    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        let Ok(len) = u16::try_from(value.len()) else {
            self.oversized.get_or_insert(value.len());
            return self;
        };
        self.buf.put_u16_le(len);
        self.buf.put_slice(value);
        self
    }

    /// Finish and return the payload, or [Error::PayloadTooLarge] if a
    /// field did not fit its length prefix.
    pub fn finish(&mut self) -> Result<Bytes, Error> {
        if let Some(len) = self.oversized.take() {
            self.buf.clear();
            return Err(Error::PayloadTooLarge {
                len,
                max: u16::MAX as usize,
            });
        }
        Ok(std::mem::take(&mut self.buf).freeze())
    }
}

/// Cursor over a response or push payload.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    /// Read from the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                remaining: self.data.len(),
            });
        }
        let (head, tail) = self.data.split_at(needed);
        self.data = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a byte.
    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Read a `0`/non-zero byte as a bool.
    pub fn bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.u8()? != 0)
    }

    /// Read a little-endian `u16`.
    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Read a little-endian `u32`.
    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Read a little-endian `i32`.
    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    /// Read a little-endian `f32`.
    pub fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    /// Read integer micrometres as millimetres.
    pub fn micros(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from(self.i32()?) / 1000.0)
    }

    /// Read a `u16`-length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidString)
    }

    /// Read a `u16`-length-prefixed byte blob.
    pub fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    /// Read a `u32`-length-prefixed byte blob.
    pub fn long_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_fields_in_order() {
        let payload = PayloadWriter::new()
            .u8(7)
            .u16(0x1234)
            .micros(-12.5)
            .string("benchy.gcode")
            .bool(true)
            .finish()
            .unwrap();

        let mut reader = PayloadReader::new(&payload);
        assert_eq!(reader.u8(), Ok(7));
        assert_eq!(reader.u16(), Ok(0x1234));
        assert_eq!(reader.micros(), Ok(-12.5));
        assert_eq!(reader.string().as_deref(), Ok("benchy.gcode"));
        assert_eq!(reader.bool(), Ok(true));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_oversized_string_is_rejected() {
        let line = "G1".repeat(40_000);
        let mut writer = PayloadWriter::new();
        let result = writer.u8(1).string(&line).u8(2).finish();
        assert!(matches!(
            result,
            Err(Error::PayloadTooLarge { len: 80_000, max: 65_535 })
        ));

        // The writer is reusable after a rejected payload.
        let payload = writer.string("M105").finish().unwrap();
        assert_eq!(&payload[..], b"\x04\x00M105");

        let max = vec![0u8; u16::MAX as usize];
        assert_eq!(PayloadWriter::new().bytes(&max).finish().unwrap().len(), 2 + max.len());
    }

    #[test]
    fn test_truncated() {
        let mut reader = PayloadReader::new(&[0x01]);
        assert_eq!(
            reader.u32(),
            Err(DecodeError::Truncated {
                needed: 4,
                remaining: 1
            })
        );
    }

    #[test]
    fn test_invalid_string() {
        let mut reader = PayloadReader::new(&[0x02, 0x00, 0xff, 0xfe]);
        assert_eq!(reader.string(), Err(DecodeError::InvalidString));
    }
}
