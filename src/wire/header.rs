//! Network-order (de)serialisation via `ToFromNetworkOrder`. Every
//! structure here is fully owned (no lifetime tied to the source buffer)
//! because decoded records cross task boundaries over channels.
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::convert::TryFrom;
use std::io::{Cursor, Result as IoResult};

use dns_derive::DnsStruct;

use crate::error::{DNSError, DNSResult};
use super::enums::{OpCode, PacketType, ResponseCode};

/// The lifetime only bounds the cursor the bytes are read from, never
/// anything stored on `Self`.
pub trait ToFromNetworkOrder<'a>: std::fmt::Debug {
    fn to_network_bytes(&self, buffer: &mut Vec<u8>) -> IoResult<usize>;
    fn from_network_bytes(&mut self, buffer: &mut Cursor<&'a [u8]>) -> DNSResult<()>;
}

impl<'a> ToFromNetworkOrder<'a> for u16 {
    fn to_network_bytes(&self, buffer: &mut Vec<u8>) -> IoResult<usize> {
        buffer.write_u16::<BigEndian>(*self)?;
        Ok(2)
    }

    fn from_network_bytes(&mut self, buffer: &mut Cursor<&'a [u8]>) -> DNSResult<()> {
        *self = buffer.read_u16::<BigEndian>()?;
        Ok(())
    }
}

/// DNS message header: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
#[derive(Debug, Default, Clone, DnsStruct)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: DnsFlags,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

/// The flags word, unpacked into named fields so the bit layout stays
/// attached to the code that relies on it.
#[derive(Debug, Clone)]
pub struct DnsFlags {
    pub packet_type: PacketType,
    pub op_code: OpCode,
    pub authoritative_answer: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub z: u16,
    pub response_code: ResponseCode,
}

impl Default for DnsFlags {
    fn default() -> Self {
        DnsFlags {
            packet_type: PacketType::Query,
            op_code: OpCode::Query,
            authoritative_answer: false,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            z: 0,
            response_code: ResponseCode::NoError,
        }
    }
}

impl<'a> ToFromNetworkOrder<'a> for DnsFlags {
    /// ```
    /// use dns_minimiser::wire::header::{DnsFlags, ToFromNetworkOrder};
    /// use dns_minimiser::wire::enums::{PacketType, OpCode, ResponseCode};
    ///
    /// let flags = DnsFlags {
    ///     packet_type: PacketType::Response,
    ///     op_code: OpCode::Query,
    ///     authoritative_answer: true,
    ///     truncated: false,
    ///     recursion_desired: true,
    ///     recursion_available: true,
    ///     z: 0,
    ///     response_code: ResponseCode::NoError,
    /// };
    /// let mut buffer = Vec::new();
    /// assert!(flags.to_network_bytes(&mut buffer).is_ok());
    /// assert_eq!(buffer, &[0b1000_0100, 0b1000_0000]);
    /// ```
    fn to_network_bytes(&self, buffer: &mut Vec<u8>) -> IoResult<usize> {
        //                               1  1  1  1  1  1
        // 0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        let mut flags = (self.packet_type as u16) << 15;
        flags |= (self.op_code as u16) << 11;
        flags |= (self.authoritative_answer as u16) << 10;
        flags |= (self.truncated as u16) << 9;
        flags |= (self.recursion_desired as u16) << 8;
        flags |= (self.recursion_available as u16) << 7;
        flags |= (self.z & 0b111) << 4;
        flags |= self.response_code as u16 & 0b1111;

        buffer.write_u16::<BigEndian>(flags)?;
        Ok(2)
    }

    fn from_network_bytes(&mut self, buffer: &mut Cursor<&'a [u8]>) -> DNSResult<()> {
        let flags = buffer.read_u16::<BigEndian>()?;

        let packet_type = (flags >> 15) & 1;
        self.packet_type = PacketType::try_from(packet_type).map_err(|e| DNSError::new(&e))?;
        self.op_code = OpCode::try_from((flags >> 11) & 0b1111).map_err(|e| DNSError::new(&e))?;
        self.authoritative_answer = (flags >> 10) & 1 == 1;
        self.truncated = (flags >> 9) & 1 == 1;
        self.recursion_desired = (flags >> 8) & 1 == 1;
        self.recursion_available = (flags >> 7) & 1 == 1;
        self.z = (flags >> 4) & 0b111;
        self.response_code = ResponseCode::try_from(flags & 0b1111).map_err(|e| DNSError::new(&e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = DnsHeader {
            id: 0x1234,
            flags: DnsFlags {
                packet_type: PacketType::Response,
                op_code: OpCode::Query,
                authoritative_answer: false,
                truncated: false,
                recursion_desired: true,
                recursion_available: true,
                z: 0,
                response_code: ResponseCode::NXDomain,
            },
            qd_count: 1,
            an_count: 0,
            ns_count: 0,
            ar_count: 1,
        };

        let mut buffer = Vec::new();
        header.to_network_bytes(&mut buffer).unwrap();

        let mut cursor = Cursor::new(buffer.as_slice());
        let mut decoded = DnsHeader::default();
        decoded.from_network_bytes(&mut cursor).unwrap();

        assert_eq!(decoded.id, 0x1234);
        assert_eq!(decoded.flags.response_code, ResponseCode::NXDomain);
        assert_eq!(decoded.qd_count, 1);
        assert_eq!(decoded.ar_count, 1);
    }
}
