//! Owned domain-name decoding and the bounded ten-label scheme, plus
//! question-section decoding. The label walk follows compression
//! pointers the same way RFC 1035 section 4.1.4 describes, but produces
//! owned, lowercased `String`s instead of slices tied to the source
//! buffer.
use std::convert::TryFrom;

use crate::error::{DNSError, DNSResult, InternalError};
use super::enums::{QClass, QType};
use super::header::{DnsHeader, ToFromNetworkOrder};

/// Number of label slots a truncated domain key is packed into.
pub const LABEL_SLOTS: usize = 10;

/// A decoded question-section name and type/class, plus the response
/// header fields the classifier and collector need. Only the question
/// section is decoded; answer/authority/additional records are never
/// parsed.
#[derive(Debug, Clone)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub qname: String,
    pub qtype: QType,
    pub qclass: QClass,
}

/// Decode just enough of a DNS message to classify it: the 12-byte header
/// and the first question's QNAME/QTYPE/QCLASS. Any further questions,
/// and the answer/authority/additional sections, are ignored.
pub fn decode_message(bytes: &[u8]) -> DNSResult<DnsMessage> {
    let mut cursor = std::io::Cursor::new(bytes);
    let mut header = DnsHeader::default();
    header.from_network_bytes(&mut cursor)?;

    if header.qd_count == 0 {
        return Err(DNSError::DNSInternalError(InternalError::InvalidQuestionCount));
    }

    let qname = decode_name(bytes, cursor.position() as usize)?;
    let after_name = skip_name(bytes, cursor.position() as usize)?;

    if bytes.len() < after_name + 4 {
        return Err(DNSError::new("truncated question section"));
    }
    let qtype_raw = u16::from_be_bytes([bytes[after_name], bytes[after_name + 1]]);
    let qclass_raw = u16::from_be_bytes([bytes[after_name + 2], bytes[after_name + 3]]);

    let qtype = QType::try_from(qtype_raw).unwrap_or(QType::Other);
    let qclass = QClass::try_from(qclass_raw).map_err(|e| DNSError::new(&e))?;

    if qname.is_empty() || qname == "." {
        return Err(DNSError::DNSInternalError(InternalError::EmptyDomainName));
    }

    Ok(DnsMessage {
        header,
        qname,
        qtype,
        qclass,
    })
}

const MAX_POINTER_HOPS: usize = 128;

/// Walk a (possibly pointer-compressed) name starting at `pos`, returning
/// the lowercased, dot-terminated name. Ported from
/// `rfc1035::DomainName::from_position`'s pointer-following loop.
fn decode_name(buffer: &[u8], pos: usize) -> DNSResult<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut index = pos;
    let mut hops = 0usize;

    loop {
        if index >= buffer.len() {
            return Err(DNSError::new("name decode ran past end of buffer"));
        }

        let lead = buffer[index];
        if lead == 0 {
            break;
        }

        if is_pointer(lead) {
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(DNSError::new("too many compression pointer hops"));
            }
            if index + 1 >= buffer.len() {
                return Err(DNSError::new("truncated compression pointer"));
            }
            let pointer = u16::from_be_bytes([buffer[index], buffer[index + 1]]);
            index = ((pointer << 2) >> 2) as usize;
            continue;
        }

        let size = lead as usize;
        if index + 1 + size > buffer.len() {
            return Err(DNSError::new("label length exceeds buffer"));
        }
        let label = std::str::from_utf8(&buffer[index + 1..index + 1 + size])?;
        labels.push(label.to_ascii_lowercase());
        index += 1 + size;
    }

    if labels.is_empty() {
        return Ok(".".to_string());
    }

    let mut name = labels.join(".");
    name.push('.');
    Ok(name)
}

/// Advance past a name starting at `pos` without following pointers into
/// compressed data, returning the offset of the byte after it (2 bytes for
/// a pointer, `len+1` per label, 1 for the terminating root label).
fn skip_name(buffer: &[u8], pos: usize) -> DNSResult<usize> {
    let mut index = pos;
    loop {
        if index >= buffer.len() {
            return Err(DNSError::new("name decode ran past end of buffer"));
        }
        let lead = buffer[index];
        if lead == 0 {
            return Ok(index + 1);
        }
        if is_pointer(lead) {
            return Ok(index + 2);
        }
        let size = lead as usize;
        index += 1 + size;
    }
}

fn is_pointer(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1100_0000
}

/// Check the name is non-empty and every label is within the 63-byte RFC
/// limit and the overall name within 255 bytes; used by the minimiser to
/// reject malformed questions before classification.
pub fn is_valid_domain_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    if name == "." {
        return true;
    }
    name.trim_end_matches('.')
        .split('.')
        .all(|label| !label.is_empty() && label.len() <= 63)
}

/// Split a dot-terminated lowercased name into a bounded ten-slot scheme:
/// labels are ordered root-first (slot 0 closest to the root); when there
/// are more than ten labels the nine deepest (most specific, trailing)
/// labels each keep their own slot and every label that does not fit is
/// concatenated, dot-joined, into slot 0.
pub fn label_slots(name: &str) -> [Option<String>; LABEL_SLOTS] {
    const NONE: Option<String> = None;
    let mut slots: [Option<String>; LABEL_SLOTS] = [NONE; LABEL_SLOTS];

    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() {
        return slots;
    }

    // root-first: ["com", "example", "www"] for "www.example.com."
    let mut labels: Vec<&str> = trimmed.split('.').collect();
    labels.reverse();

    if labels.len() <= LABEL_SLOTS {
        for (i, label) in labels.iter().enumerate() {
            slots[i] = Some((*label).to_string());
        }
        return slots;
    }

    let keep_individually = LABEL_SLOTS - 1;
    let surplus_count = labels.len() - keep_individually;
    let surplus = labels[..surplus_count].join(".");
    slots[0] = Some(surplus);
    for (i, label) in labels[surplus_count..].iter().enumerate() {
        slots[i + 1] = Some((*label).to_string());
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_question() {
        // header (12 bytes, qdcount=1) + "www.example.com." + qtype A + qclass IN
        let mut bytes = vec![
            0x00, 0x01, // id
            0x01, 0x00, // flags: response, RD
            0x00, 0x01, // qdcount
            0x00, 0x00, // ancount
            0x00, 0x00, // nscount
            0x00, 0x00, // arcount
        ];
        for label in ["www", "example", "com"] {
            bytes.push(label.len() as u8);
            bytes.extend_from_slice(label.as_bytes());
        }
        bytes.push(0); // root
        bytes.extend_from_slice(&1u16.to_be_bytes()); // A
        bytes.extend_from_slice(&1u16.to_be_bytes()); // IN

        let msg = decode_message(&bytes).unwrap();
        assert_eq!(msg.qname, "www.example.com.");
        assert_eq!(msg.qtype, QType::A);
        assert_eq!(msg.qclass, QClass::IN);
    }

    #[test]
    fn label_slots_within_bound() {
        let slots = label_slots("www.example.com.");
        assert_eq!(slots[0].as_deref(), Some("com"));
        assert_eq!(slots[1].as_deref(), Some("example"));
        assert_eq!(slots[2].as_deref(), Some("www"));
        assert!(slots[3].is_none());
    }

    #[test]
    fn label_slots_beyond_bound_merges_surplus_into_slot_zero() {
        // 12 labels: a0..a11, root-first reversal puts a11 first.
        let name: String = (0..12).map(|i| format!("a{i}.")).collect::<String>();
        let slots = label_slots(&name);
        // 9 deepest labels (a8..a0) individually in slots 1..=9, surplus
        // (a11,a10,a9) merged into slot 0.
        assert_eq!(slots[0].as_deref(), Some("a11.a10.a9"));
        assert_eq!(slots[1].as_deref(), Some("a8"));
        assert_eq!(slots[9].as_deref(), Some("a0"));
    }

    #[test]
    fn rejects_oversized_labels() {
        assert!(!is_valid_domain_name(&format!("{}.com.", "a".repeat(64))));
        assert!(is_valid_domain_name("www.example.com."));
    }
}
