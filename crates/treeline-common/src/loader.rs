//! Text-file loaders for ACL rulesets and packet traces
//!
//! Rule files use the classic firewall benchmark format, one rule per line:
//!
//! ```text
//! @S1.S2.S3.S4/Sm  D1.D2.D3.D4/Dm  sp1 : sp2  dp1 : dp2  PROTO/PMASK  HT/HTMASK
//! ```
//!
//! Trace files carry seven whitespace-separated decimals per line: the five
//! header values, a protocol mask (ignored) and the expected rule id.
//!
//! Priorities are assigned from file order, first rule highest (`N-1..0`).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{LoaderError, LoaderResult};
use crate::packet::Packet;
use crate::rule::{FieldRange, Rule, DST_IP, DST_PORT, FIELD_COUNT, PROTOCOL, SRC_IP, SRC_PORT};

/// Load a ruleset from a file path.
pub fn load_rules_file<P: AsRef<Path>>(path: P) -> LoaderResult<Vec<Rule>> {
    load_rules(BufReader::new(File::open(path)?))
}

/// Load a packet trace from a file path.
pub fn load_trace_file<P: AsRef<Path>>(path: P) -> LoaderResult<Vec<Packet>> {
    load_trace(BufReader::new(File::open(path)?))
}

/// Parse a ruleset from any buffered reader.
///
/// Blank lines are skipped; anything else that does not parse is an error
/// carrying its line number.
pub fn load_rules<R: BufRead>(reader: R) -> LoaderResult<Vec<Rule>> {
    let mut rules = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        rules.push(parse_rule_line(trimmed, idx + 1)?);
    }
    // File order decides priority: first rule wins ties everywhere else.
    let n = rules.len();
    for (i, rule) in rules.iter_mut().enumerate() {
        rule.id = i as u32;
        rule.priority = (n - 1 - i) as i32;
    }
    Ok(rules)
}

/// Parse a packet trace from any buffered reader.
pub fn load_trace<R: BufRead>(reader: R) -> LoaderResult<Vec<Packet>> {
    let mut packets = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let fields: Vec<u32> = trimmed
            .split_whitespace()
            .map(|t| t.parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|_| LoaderError::MalformedTrace { line: idx + 1 })?;
        if fields.len() != 7 {
            return Err(LoaderError::MalformedTrace { line: idx + 1 });
        }
        let mut header = [0u32; FIELD_COUNT];
        header.copy_from_slice(&fields[..FIELD_COUNT]);
        packets.push(Packet {
            header,
            // fields[5] is a protocol mask column; only the trailing id matters
            expected_id: Some(fields[6]),
        });
    }
    Ok(packets)
}

fn parse_rule_line(line: &str, lineno: usize) -> LoaderResult<Rule> {
    let malformed = |reason: &str| LoaderError::MalformedRule {
        line: lineno,
        reason: reason.to_string(),
    };

    let mut toks = line.split_whitespace();

    let src = toks.next().ok_or_else(|| malformed("missing source prefix"))?;
    let src = src.strip_prefix('@').unwrap_or(src);
    let (src_range, src_plen) = parse_ip_prefix(src, lineno)?;

    let dst = toks
        .next()
        .ok_or_else(|| malformed("missing destination prefix"))?;
    let (dst_range, dst_plen) = parse_ip_prefix(dst, lineno)?;

    let (sp_lo, sp_hi) =
        take_port_range(&mut toks).ok_or_else(|| malformed("bad source port range"))?;
    let (dp_lo, dp_hi) =
        take_port_range(&mut toks).ok_or_else(|| malformed("bad destination port range"))?;

    let proto_tok = toks.next().ok_or_else(|| malformed("missing protocol"))?;
    let (proto, proto_mask) =
        parse_hex_pair(proto_tok).ok_or_else(|| malformed("bad protocol field"))?;
    let (proto_range, proto_plen) = match proto_mask {
        0xFF => (
            FieldRange {
                low: proto,
                high: proto,
            },
            8,
        ),
        0x00 => (FieldRange { low: 0, high: 0xFF }, 0),
        mask => return Err(LoaderError::InvalidProtocolMask { line: lineno, mask }),
    };

    // Trailing header-type pair: present in the format, semantically unused.
    if let Some(ht) = toks.next() {
        parse_hex_pair(ht).ok_or_else(|| malformed("bad header-type field"))?;
    }

    let mut ranges = [FieldRange { low: 0, high: 0 }; FIELD_COUNT];
    let mut prefix_len = [0u32; FIELD_COUNT];
    ranges[SRC_IP] = src_range;
    prefix_len[SRC_IP] = src_plen;
    ranges[DST_IP] = dst_range;
    prefix_len[DST_IP] = dst_plen;
    ranges[SRC_PORT] = FieldRange {
        low: sp_lo,
        high: sp_hi,
    };
    prefix_len[SRC_PORT] = port_prefix_len(sp_lo, sp_hi);
    ranges[DST_PORT] = FieldRange {
        low: dp_lo,
        high: dp_hi,
    };
    prefix_len[DST_PORT] = port_prefix_len(dp_lo, dp_hi);
    ranges[PROTOCOL] = proto_range;
    prefix_len[PROTOCOL] = proto_plen;

    Ok(Rule {
        id: 0,
        priority: 0,
        ranges,
        prefix_len,
    })
}

/// `a.b.c.d/m` -> (range, prefix length).
fn parse_ip_prefix(text: &str, lineno: usize) -> LoaderResult<(FieldRange, u32)> {
    let malformed = || LoaderError::MalformedRule {
        line: lineno,
        reason: format!("bad IP prefix `{text}`"),
    };
    let (addr, mask) = text.split_once('/').ok_or_else(malformed)?;
    let octets: Vec<u32> = addr
        .split('.')
        .map(|o| o.parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|_| malformed())?;
    if octets.len() != 4 || octets.iter().any(|&o| o > 255) {
        return Err(malformed());
    }
    let plen: u32 = mask.parse().map_err(|_| malformed())?;
    if plen > 32 {
        return Err(LoaderError::PrefixOutOfRange {
            line: lineno,
            len: plen,
        });
    }
    let value = (octets[0] << 24) | (octets[1] << 16) | (octets[2] << 8) | octets[3];
    let range = if plen == 0 {
        FieldRange {
            low: 0,
            high: u32::MAX,
        }
    } else {
        let low = value & (u32::MAX << (32 - plen));
        FieldRange {
            low,
            high: low + (((1u64 << (32 - plen)) - 1) as u32),
        }
    };
    Ok((range, plen))
}

/// Consume `a : b` (whitespace optional around the colon) from the token
/// stream.
fn take_port_range<'a, I: Iterator<Item = &'a str>>(toks: &mut I) -> Option<(u32, u32)> {
    let mut buf = String::new();
    for _ in 0..3 {
        buf.push_str(toks.next()?);
        if let Some((a, b)) = buf.split_once(':') {
            if !a.is_empty() && !b.is_empty() {
                let lo: u16 = a.trim().parse().ok()?;
                let hi: u16 = b.trim().parse().ok()?;
                return Some((lo as u32, hi as u32));
            }
        }
    }
    None
}

/// `X/Y` where both halves are hex, with or without `0x`.
fn parse_hex_pair(tok: &str) -> Option<(u32, u32)> {
    let (a, b) = tok.split_once('/')?;
    Some((parse_hex(a)?, parse_hex(b)?))
}

fn parse_hex(s: &str) -> Option<u32> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16).ok()
}

/// Leading bits shared by both port endpoints, from the XOR of the pair.
fn port_prefix_len(lo: u32, hi: u32) -> u32 {
    ((lo ^ hi) as u16).leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &str = "\
@10.0.0.0/8\t192.168.1.0/24\t0 : 65535\t80 : 80\t06/FF\t0x0000/0x0000
@0.0.0.0/0\t0.0.0.0/0\t1024 : 2047\t0 : 65535\t00/00\t0x0000/0x0000
";

    #[test]
    fn test_load_rules() {
        let rules = load_rules(Cursor::new(SAMPLE)).unwrap();
        assert_eq!(rules.len(), 2);

        // Priorities run N-1..0 in file order.
        assert_eq!(rules[0].priority, 1);
        assert_eq!(rules[1].priority, 0);
        assert_eq!(rules[0].id, 0);

        assert_eq!(rules[0].ranges[SRC_IP].low, 0x0A00_0000);
        assert_eq!(rules[0].ranges[SRC_IP].high, 0x0AFF_FFFF);
        assert_eq!(rules[0].prefix_len[SRC_IP], 8);
        assert_eq!(rules[0].ranges[DST_IP].low, 0xC0A8_0100);
        assert_eq!(rules[0].prefix_len[DST_IP], 24);

        // Exact destination port: fully concrete.
        assert_eq!(rules[0].prefix_len[DST_PORT], 16);
        assert_eq!(rules[0].ranges[DST_PORT].low, 80);
        // Full source port range: wildcard.
        assert_eq!(rules[0].prefix_len[SRC_PORT], 0);

        // Exact protocol.
        assert_eq!(rules[0].ranges[PROTOCOL].low, 6);
        assert_eq!(rules[0].prefix_len[PROTOCOL], 8);

        // 1024:2047 shares its top 6 bits.
        assert_eq!(rules[1].prefix_len[SRC_PORT], 6);
        assert_eq!(rules[1].prefix_len[PROTOCOL], 0);
        assert_eq!(rules[1].ranges[PROTOCOL].high, 0xFF);
    }

    #[test]
    fn test_bad_protocol_mask() {
        let line = "@1.2.3.4/32\t0.0.0.0/0\t0 : 65535\t0 : 65535\t06/0F\t0x0000/0x0000";
        let err = load_rules(Cursor::new(line)).unwrap_err();
        assert!(matches!(
            err,
            LoaderError::InvalidProtocolMask { mask: 0x0F, .. }
        ));
    }

    #[test]
    fn test_prefix_out_of_range() {
        let line = "@1.2.3.4/40\t0.0.0.0/0\t0 : 65535\t0 : 65535\t06/FF\t0x0000/0x0000";
        let err = load_rules(Cursor::new(line)).unwrap_err();
        assert!(matches!(err, LoaderError::PrefixOutOfRange { len: 40, .. }));
    }

    #[test]
    fn test_load_trace() {
        let trace = "167772161 3232235777 1025 80 6 0 12\n";
        let pkts = load_trace(Cursor::new(trace)).unwrap();
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].field(0), 167772161);
        assert_eq!(pkts[0].field(4), 6);
        assert_eq!(pkts[0].expected_id, Some(12));

        assert!(load_trace(Cursor::new("1 2 3\n")).is_err());
    }
}
