//! DNS wire decoding: frame (dnstap) envelope, message header/question,
//! and the classification enums.
pub mod enums;
pub mod frame;
pub mod header;
pub mod message;
mod protobuf;
