//! Treeline Common - Shared types for the treeline packet classifier
//!
//! This crate provides the pieces every consumer of the classifier needs:
//! - The 5-tuple rule model (inclusive ranges + prefix lengths)
//! - Packet headers as read from trace files
//! - Text-file loaders for ACL rulesets and packet traces
//! - Error handling

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod packet;
pub mod rule;

pub use error::{LoaderError, LoaderResult};
pub use packet::Packet;
pub use rule::{
    FieldRange, Rule, DST_IP, DST_PORT, FIELD_BITS, FIELD_COUNT, PROTOCOL, SRC_IP, SRC_PORT,
};
