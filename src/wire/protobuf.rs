//! A minimal protobuf wire-format reader, sized for exactly the one
//! message this crate needs to decode (`Dnstap`/`Message`, field numbers
//! fixed by the public `dnstap.proto` schema) rather than a general
//! decoder. Manual-cursor byte walking, the same style as the DNS header
//! decoder, just over protobuf's tag/varint wire format instead.
use crate::error::{DNSError, DNSResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    fn from_tag(tag: u64) -> DNSResult<Self> {
        match tag & 0b111 {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(DNSError::new(&format!("unsupported protobuf wire type {other}"))),
        }
    }
}

pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

pub enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
    Fixed64(u64),
    Fixed32(u32),
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        FieldReader { buf, pos: 0 }
    }

    fn read_varint(&mut self) -> DNSResult<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            if self.pos >= self.buf.len() {
                return Err(DNSError::new("protobuf varint ran past end of buffer"));
            }
            let byte = self.buf[self.pos];
            self.pos += 1;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(DNSError::new("protobuf varint too long"));
            }
        }
    }

    /// Returns `None` once the buffer is exhausted.
    pub fn next_field(&mut self) -> DNSResult<Option<(u64, FieldValue<'a>)>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }

        let tag = self.read_varint()?;
        let field_number = tag >> 3;
        let wire_type = WireType::from_tag(tag)?;

        let value = match wire_type {
            WireType::Varint => FieldValue::Varint(self.read_varint()?),
            WireType::Fixed64 => {
                let bytes = self.take(8)?;
                FieldValue::Fixed64(u64::from_le_bytes(bytes.try_into().unwrap()))
            }
            WireType::Fixed32 => {
                let bytes = self.take(4)?;
                FieldValue::Fixed32(u32::from_le_bytes(bytes.try_into().unwrap()))
            }
            WireType::LengthDelimited => {
                let len = self.read_varint()? as usize;
                FieldValue::Bytes(self.take(len)?)
            }
        };

        Ok(Some((field_number, value)))
    }

    fn take(&mut self, len: usize) -> DNSResult<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(DNSError::new("protobuf field length exceeds buffer"));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

impl<'a> FieldValue<'a> {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Varint(v) => Some(*v),
            FieldValue::Fixed64(v) => Some(*v),
            FieldValue::Fixed32(v) => Some(*v as u64),
            FieldValue::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_varint_and_length_delimited_fields() {
        // field 1, varint 300; field 2, bytes "hi"
        let buf = vec![0x08, 0xac, 0x02, 0x12, 0x02, b'h', b'i'];
        let mut reader = FieldReader::new(&buf);

        let (num, value) = reader.next_field().unwrap().unwrap();
        assert_eq!(num, 1);
        assert_eq!(value.as_u64(), Some(300));

        let (num, value) = reader.next_field().unwrap().unwrap();
        assert_eq!(num, 2);
        assert_eq!(value.as_bytes(), Some(b"hi".as_slice()));

        assert!(reader.next_field().unwrap().is_none());
    }
}
