//! Byte-level helpers shared by the TLV codec and the message families.

use std::collections::BTreeMap;

use crate::error::{ProtoError, Result};

/// Cursor over a received buffer. Every read is length checked.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Everything not read yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    pub fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtoError::Length {
                what: what.to_string(),
                expected: len,
                actual: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self, what: &str) -> Result<u64> {
        let b = self.take(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }
}

/// Builder for a tagged field set: `{tag: u8, len: u16 BE, value}` entries.
/// A value too long for its length prefix fails the whole set at `finish`.
#[derive(Debug, Default)]
pub struct FieldSetWriter {
    buf: Vec<u8>,
    overflow: Option<ProtoError>,
}

impl FieldSetWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(mut self, tag: u8, value: &[u8]) -> Self {
        let Ok(len) = u16::try_from(value.len()) else {
            self.overflow.get_or_insert(ProtoError::TooLong {
                what: "field value",
                limit: usize::from(u16::MAX),
                actual: value.len(),
            });
            return self;
        };
        self.buf.push(tag);
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn u8(self, tag: u8, value: u8) -> Self {
        self.bytes(tag, &[value])
    }

    pub fn u32(self, tag: u8, value: u32) -> Self {
        self.bytes(tag, &value.to_be_bytes())
    }

    pub fn u64(self, tag: u8, value: u64) -> Self {
        self.bytes(tag, &value.to_be_bytes())
    }

    pub fn bool(self, tag: u8, value: bool) -> Self {
        self.u8(tag, value as u8)
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        match self.overflow {
            Some(e) => Err(e),
            None => Ok(self.buf),
        }
    }
}

/// A decoded field set. Tags outside `known` are rejected at parse time.
#[derive(Debug)]
pub struct FieldSet<'a> {
    fields: BTreeMap<u8, &'a [u8]>,
}

impl<'a> FieldSet<'a> {
    pub fn parse(payload: &'a [u8], known: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let mut fields = BTreeMap::new();
        while !reader.is_empty() {
            let tag = reader.u8("field tag")?;
            if !known.contains(&tag) {
                return Err(ProtoError::UnknownTag(tag));
            }
            let len = reader.u16("field length")? as usize;
            let value = reader.take(len, "field value")?;
            fields.insert(tag, value);
        }
        Ok(Self { fields })
    }

    fn fixed<const N: usize>(&self, tag: u8) -> Result<[u8; N]> {
        let value = self.fields.get(&tag).ok_or(ProtoError::MissingField(tag))?;
        if value.len() != N {
            return Err(ProtoError::Length {
                what: format!("field {tag}"),
                expected: N,
                actual: value.len(),
            });
        }
        let mut raw = [0u8; N];
        raw.copy_from_slice(value);
        Ok(raw)
    }

    pub fn u8(&self, tag: u8) -> Result<u8> {
        Ok(self.fixed::<1>(tag)?[0])
    }

    pub fn u32(&self, tag: u8) -> Result<u32> {
        Ok(u32::from_be_bytes(self.fixed(tag)?))
    }

    pub fn u64(&self, tag: u8) -> Result<u64> {
        Ok(u64::from_be_bytes(self.fixed(tag)?))
    }

    pub fn bool(&self, tag: u8) -> Result<bool> {
        match self.u8(tag)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(ProtoError::InvalidValue {
                what: "boolean field",
                value: u64::from(v),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_field_set() {
        let payload = FieldSetWriter::new()
            .u64(1, 0xdead_beef)
            .u32(2, 7)
            .bool(3, true)
            .finish()
            .unwrap();

        let fields = FieldSet::parse(&payload, &[1, 2, 3]).unwrap();
        assert_eq!(fields.u64(1).unwrap(), 0xdead_beef);
        assert_eq!(fields.u32(2).unwrap(), 7);
        assert!(fields.bool(3).unwrap());
    }

    #[test]
    fn test_field_set_errors() {
        let payload = FieldSetWriter::new().u32(9, 1).finish().unwrap();
        let err = FieldSet::parse(&payload, &[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownField);

        let payload = FieldSetWriter::new().u32(1, 1).finish().unwrap();
        let fields = FieldSet::parse(&payload, &[1, 2]).unwrap();
        assert_eq!(fields.u64(1).unwrap_err().kind(), ErrorKind::MalformedField);
        assert_eq!(fields.u32(2).unwrap_err().kind(), ErrorKind::MalformedField);

        // Length prefix pointing past the end of the buffer.
        let err = FieldSet::parse(&[1, 0, 9, 0], &[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedField);
    }

    #[test]
    fn test_oversized_value_rejected() {
        let value = vec![0u8; usize::from(u16::MAX) + 1];
        let err = FieldSetWriter::new()
            .u32(1, 1)
            .bytes(2, &value)
            .finish()
            .unwrap_err();
        assert!(matches!(err, ProtoError::TooLong { actual, .. } if actual == value.len()));
        assert_eq!(err.kind(), ErrorKind::MalformedField);

        let max = vec![0u8; usize::from(u16::MAX)];
        let payload = FieldSetWriter::new().bytes(2, &max).finish().unwrap();
        assert_eq!(payload.len(), 3 + max.len());
    }
}
