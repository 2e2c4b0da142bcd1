//! Shared record shapes that cross task boundaries: the collector
//! produces these, the writers serialise them, the publisher emits one of
//! them as JSON/JWS.
use std::time::SystemTime;

use serde::Serialize;

use crate::tracker::{STATUS_WELL_KNOWN_EXACT, STATUS_WELL_KNOWN_WILDCARD};
use crate::wire::enums::{QClass, QType, ResponseCode};
use crate::wire::frame::Transport;
use crate::wire::message::LABEL_SLOTS;

/// One well-known-domain's running counters for the current minute window.
pub struct HistogramEntry {
    pub index: u64,
    pub status: u8,
    pub query_count: u64,
    pub nx_count: u64,
    pub rcode_counts: [u64; 24],
    pub qtype_counts: std::collections::HashMap<QType, u64>,
    pub qclass_counts: std::collections::HashMap<QClass, u64>,
    pub client_sketch: crate::sketch::FamilySketch,
}

impl HistogramEntry {
    pub fn new(index: u64) -> Self {
        HistogramEntry {
            index,
            status: 0,
            query_count: 0,
            nx_count: 0,
            rcode_counts: [0; 24],
            qtype_counts: std::collections::HashMap::new(),
            qclass_counts: std::collections::HashMap::new(),
            client_sketch: crate::sketch::FamilySketch::new(),
        }
    }

    /// Status bits are set-once: a name first seen via suffix match stays
    /// tagged `wildcard` even if later hits are exact, and vice versa —
    /// both bits can end up set for the same window.
    pub fn mark_match(&mut self, suffix_match: bool) {
        if suffix_match {
            self.status |= STATUS_WELL_KNOWN_WILDCARD;
        } else {
            self.status |= STATUS_WELL_KNOWN_EXACT;
        }
    }

    pub fn record(&mut self, response_code: ResponseCode, qtype: QType, qclass: QClass) {
        self.query_count += 1;
        if response_code == ResponseCode::NXDomain {
            self.nx_count += 1;
        }
        let rcode = response_code as usize;
        if rcode < self.rcode_counts.len() {
            self.rcode_counts[rcode] += 1;
        }
        *self.qtype_counts.entry(qtype).or_insert(0) += 1;
        *self.qclass_counts.entry(qclass).or_insert(0) += 1;
    }
}

/// One minute-boundary snapshot handed to the histogram writer.
pub struct HistogramSnapshot {
    pub start: SystemTime,
    pub stop: SystemTime,
    pub entries: Vec<HistogramEntry>,
    pub dictionary: std::sync::Arc<crate::tracker::Dictionary>,
    /// Set when `dictionary` is the dictionary that was replaced by this
    /// tick's rotation rather than the one currently live — callers must
    /// not hold onto it past their last index lookup.
    pub dictionary_rotated: bool,
}

/// One session record, written only when session files are enabled.
/// Addresses are the pseudonymised wire bytes; `identity` is the
/// responder's dnstap identity, not the client.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub query_address: Vec<u8>,
    pub response_address: Vec<u8>,
    pub query_port: u16,
    pub response_port: u16,
    pub qname: String,
    pub qtype: QType,
    pub qclass: QClass,
    pub response_code: ResponseCode,
    pub label_slots: [Option<String>; LABEL_SLOTS],
    pub identity: Option<String>,
    pub transport: Transport,
    pub query_time_us: Option<i64>,
    pub response_time_us: Option<i64>,
}

/// The JSON body signed and published for a first-seen name.
#[derive(Debug, Clone, Serialize)]
pub struct NewNameEvent {
    pub version: u8,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub timestamp: i64,
    pub qname: String,
    pub qtype: QType,
    pub qclass: QClass,
    pub flags: u8,
    pub rdlength: u16,
    pub initiator: &'static str,
}
