//! Packet headers as seen by the classifier

use serde::{Deserialize, Serialize};

use crate::rule::FIELD_COUNT;

/// A 5-tuple packet header.
///
/// IPs occupy the full 32 bits, ports 16, protocol 8. Trace files may also
/// carry the id of the rule the packet is expected to hit; the classifier
/// ignores it, the harness uses it for miss accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Header values: srcIP, dstIP, srcPort, dstPort, protocol.
    pub header: [u32; FIELD_COUNT],
    /// Expected matching rule id, when the trace provides one.
    pub expected_id: Option<u32>,
}

impl Packet {
    /// Packet with the given header values and no expectation attached.
    pub const fn new(header: [u32; FIELD_COUNT]) -> Self {
        Self {
            header,
            expected_id: None,
        }
    }

    /// Value of field `i`.
    #[inline(always)]
    pub const fn field(&self, i: usize) -> u32 {
        self.header[i]
    }
}
