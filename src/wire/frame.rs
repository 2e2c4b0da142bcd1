//! Decodes one Frame Streams payload (a `Dnstap.Message`, per the public
//! `dnstap.proto` schema) into the transaction record below. Length-prefix
//! framing itself is handled by the frame source (`crate::frame_source`)
//! before bytes reach here.
use serde::Serialize;

use crate::error::{DNSError, DNSResult};
use crate::wire::protobuf::FieldReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Query,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transport {
    Udp,
    Tcp,
}

/// The transaction record, decoded straight off the
/// wire. Client/server address bytes are raw (not yet pseudonymised) —
/// callers must not let this type escape the minimiser worker's
/// classification path.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub kind: RecordKind,
    pub family: SocketFamily,
    pub transport: Transport,
    pub query_address: Vec<u8>,
    pub query_port: u16,
    pub response_address: Vec<u8>,
    pub response_port: u16,
    pub query_time_us: Option<i64>,
    pub response_time_us: Option<i64>,
    pub identity: Option<String>,
    pub query_message: Option<Vec<u8>>,
    pub response_message: Option<Vec<u8>>,
}

/// Decode a `Dnstap` envelope (field 2 = identity, field 15 = the nested
/// `Message`) and then the `Message` itself.
pub fn decode_frame(bytes: &[u8]) -> DNSResult<TransactionRecord> {
    let mut identity = None;
    let mut message_bytes: Option<&[u8]> = None;

    let mut reader = FieldReader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            2 => identity = value.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()),
            15 => message_bytes = value.as_bytes(),
            _ => {}
        }
    }

    let message_bytes = message_bytes.ok_or_else(|| DNSError::new("dnstap frame has no message field"))?;
    decode_message_field(message_bytes, identity)
}

fn decode_message_field(bytes: &[u8], identity: Option<String>) -> DNSResult<TransactionRecord> {
    let mut msg_type: Option<u64> = None;
    let mut socket_family: Option<u64> = None;
    let mut socket_protocol: Option<u64> = None;
    let mut query_address: Option<Vec<u8>> = None;
    let mut response_address: Option<Vec<u8>> = None;
    let mut query_port: Option<u64> = None;
    let mut response_port: Option<u64> = None;
    let mut query_time_sec: Option<u64> = None;
    let mut query_time_nsec: Option<u64> = None;
    let mut response_time_sec: Option<u64> = None;
    let mut response_time_nsec: Option<u64> = None;
    let mut query_message: Option<Vec<u8>> = None;
    let mut response_message: Option<Vec<u8>> = None;

    let mut reader = FieldReader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            1 => msg_type = value.as_u64(),
            2 => socket_family = value.as_u64(),
            3 => socket_protocol = value.as_u64(),
            4 => query_address = value.as_bytes().map(|b| b.to_vec()),
            5 => response_address = value.as_bytes().map(|b| b.to_vec()),
            6 => query_port = value.as_u64(),
            7 => response_port = value.as_u64(),
            8 => query_time_sec = value.as_u64(),
            9 => query_time_nsec = value.as_u64(),
            10 => query_message = value.as_bytes().map(|b| b.to_vec()),
            12 => response_time_sec = value.as_u64(),
            13 => response_time_nsec = value.as_u64(),
            14 => response_message = value.as_bytes().map(|b| b.to_vec()),
            _ => {}
        }
    }

    let msg_type = msg_type.ok_or_else(|| DNSError::new("dnstap message has no type field"))?;
    // Per dnstap.proto, *_QUERY variants are odd, *_RESPONSE variants even.
    let kind = if msg_type % 2 == 1 {
        RecordKind::Query
    } else {
        RecordKind::Response
    };

    let family = match socket_family {
        Some(1) => SocketFamily::V4,
        Some(2) => SocketFamily::V6,
        _ => return Err(DNSError::new("dnstap message missing/unknown socket_family")),
    };

    let transport = match socket_protocol {
        Some(1) => Transport::Udp,
        Some(2) => Transport::Tcp,
        _ => Transport::Udp,
    };

    let query_time_us = match (query_time_sec, query_time_nsec) {
        (Some(s), nsec) => Some(s as i64 * 1_000_000 + nsec.unwrap_or(0) as i64 / 1_000),
        _ => None,
    };
    let response_time_us = match (response_time_sec, response_time_nsec) {
        (Some(s), nsec) => Some(s as i64 * 1_000_000 + nsec.unwrap_or(0) as i64 / 1_000),
        _ => None,
    };

    Ok(TransactionRecord {
        kind,
        family,
        transport,
        query_address: query_address.unwrap_or_default(),
        query_port: query_port.unwrap_or(0) as u16,
        response_address: response_address.unwrap_or_default(),
        response_port: response_port.unwrap_or(0) as u16,
        query_time_us,
        response_time_us,
        identity,
        query_message,
        response_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_field(num: u64, value: u64) -> Vec<u8> {
        let mut out = encode_varint((num << 3) | 0);
        out.extend(encode_varint(value));
        out
    }

    fn bytes_field(num: u64, data: &[u8]) -> Vec<u8> {
        let mut out = encode_varint((num << 3) | 2);
        out.extend(encode_varint(data.len() as u64));
        out.extend_from_slice(data);
        out
    }

    fn encode_varint(mut v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
        out
    }

    #[test]
    fn decodes_client_response_message() {
        let mut message = Vec::new();
        message.extend(varint_field(1, 6)); // CLIENT_RESPONSE = even -> response
        message.extend(varint_field(2, 1)); // INET
        message.extend(varint_field(3, 1)); // UDP
        message.extend(bytes_field(5, &[127, 0, 0, 1])); // response_address
        message.extend(varint_field(7, 53)); // response_port
        message.extend(varint_field(12, 1_700_000_000)); // response_time_sec
        message.extend(bytes_field(14, b"fake-dns-bytes"));

        let mut frame = Vec::new();
        frame.extend(bytes_field(2, b"resolver-1")); // identity
        frame.extend(bytes_field(15, &message));

        let record = decode_frame(&frame).unwrap();
        assert_eq!(record.kind, RecordKind::Response);
        assert_eq!(record.family, SocketFamily::V4);
        assert_eq!(record.transport, Transport::Udp);
        assert_eq!(record.response_address, vec![127, 0, 0, 1]);
        assert_eq!(record.response_port, 53);
        assert_eq!(record.identity.as_deref(), Some("resolver-1"));
        assert!(record.response_time_us.is_some());
    }
}
