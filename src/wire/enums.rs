//! DNS enumerations shared by header decoding and classification.
//!
//! Unit-variant enums with explicit discriminants, deriving `DnsEnum` for
//! `Default`, `TryFrom<u8>`/`TryFrom<u16>` and `FromStr`.
use dns_derive::DnsEnum;
use serde::Serialize;

/// https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, DnsEnum)]
#[repr(u8)]
pub enum PacketType {
    Query = 0,
    Response = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, DnsEnum)]
#[repr(u8)]
pub enum OpCode {
    Query = 0,
    IQuery = 1,
    Status = 2,
    Unassigned = 3,
    Notify = 4,
    Update = 5,
    DSO = 6,
}

/// https://www.iana.org/assignments/dns-parameters/dns-parameters.xhtml#dns-parameters-6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, DnsEnum)]
#[repr(u16)]
pub enum ResponseCode {
    NoError = 0,
    FormErr = 1,
    ServFail = 2,
    NXDomain = 3,
    NotImp = 4,
    Refused = 5,
    YXDomain = 6,
    YXRRSet = 7,
    NXRRSet = 8,
    NotAuth = 9,
    NotZone = 10,
    DSOTYPENI = 11,
    BADVERS = 16,
    BADKEY = 17,
    BADTIME = 18,
    BADMODE = 19,
    BADNAME = 20,
    BADALG = 21,
    BADTRUNC = 22,
    BADCOOKIE = 23,
}

/// RR type codes, trimmed to the ones the classifier and the counters
/// care about plus enough of the common ones that an unknown
/// value still round-trips through `other_type_count` rather than failing
/// to decode. https://www.iana.org/assignments/dns-parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, DnsEnum)]
#[repr(u16)]
pub enum QType {
    A = 1,
    NS = 2,
    CNAME = 5,
    SOA = 6,
    PTR = 12,
    HINFO = 13,
    MX = 15,
    TXT = 16,
    AAAA = 28,
    SRV = 33,
    NAPTR = 35,
    DS = 43,
    RRSIG = 46,
    NSEC = 47,
    DNSKEY = 48,
    NSEC3 = 50,
    TLSA = 52,
    SVCB = 64,
    HTTPS = 65,
    SPF = 99,
    OPT = 41,
    CAA = 257,
    ANY = 255,
    Other = 0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, DnsEnum)]
#[repr(u16)]
pub enum QClass {
    IN = 1,
    CS = 2,
    CH = 3,
    HS = 4,
    ANY = 255,
}
