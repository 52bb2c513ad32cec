//! Parsing for the `allowed_hosts` / `denied_hosts` (and `_6`) directive
//! values: comma-separated lists of single addresses, `base/mask` CIDRs
//! (numeric prefix length or dotted mask), or `start-end` ranges.

use crate::error::ValidationError;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::str::FromStr;

/// One parsed entry from an ACL directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclEntry {
    /// `*` — matches any address.
    Any,
    /// A single address.
    Single(IpAddr),
    /// `base/mask`, either `/24` or `/255.255.255.0` style.
    Cidr(IpNetwork),
    /// `start-end`, inclusive on both ends.
    Range(IpAddr, IpAddr),
}

impl AclEntry {
    /// True if `peer` is covered by this entry.
    pub fn matches(&self, peer: IpAddr) -> bool {
        match self {
            AclEntry::Any => true,
            AclEntry::Single(addr) => *addr == peer,
            AclEntry::Cidr(net) => net.contains(peer),
            AclEntry::Range(start, end) => in_range(peer, *start, *end),
        }
    }
}

fn in_range(peer: IpAddr, start: IpAddr, end: IpAddr) -> bool {
    match (peer, start, end) {
        (IpAddr::V4(p), IpAddr::V4(s), IpAddr::V4(e)) => {
            let p = u32::from(p);
            u32::from(s) <= p && p <= u32::from(e)
        }
        (IpAddr::V6(p), IpAddr::V6(s), IpAddr::V6(e)) => {
            let p = u128::from(p);
            u128::from(s) <= p && p <= u128::from(e)
        }
        _ => false,
    }
}

/// Parses the whole comma-separated directive value for one of the four ACL
/// keys (`allowed_hosts`, `denied_hosts`, `allowed_hosts_6`, `denied_hosts_6`).
/// An empty string yields an empty list ("none").
pub fn parse_acl_list(key: &'static str, value: &str) -> Result<Vec<AclEntry>, ValidationError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| parse_entry(key, entry))
        .collect()
}

fn parse_entry(key: &'static str, entry: &str) -> Result<AclEntry, ValidationError> {
    if entry == "*" {
        return Ok(AclEntry::Any);
    }

    if let Some((start, end)) = entry.split_once('-') {
        // Could also be a CIDR written as `base/mask` containing no dash, so
        // only treat this as a range if both sides parse as bare addresses.
        if let (Ok(start), Ok(end)) = (IpAddr::from_str(start.trim()), IpAddr::from_str(end.trim()))
        {
            return Ok(AclEntry::Range(start, end));
        }
    }

    if let Some((base, mask)) = entry.split_once('/') {
        let base = IpAddr::from_str(base.trim())
            .map_err(|_| ValidationError::InvalidAcl(key, entry.to_string()))?;
        let prefix = parse_mask(mask.trim(), base)
            .ok_or_else(|| ValidationError::InvalidAcl(key, entry.to_string()))?;
        let net = IpNetwork::new(base, prefix)
            .map_err(|_| ValidationError::InvalidAcl(key, entry.to_string()))?;
        return Ok(AclEntry::Cidr(net));
    }

    IpAddr::from_str(entry)
        .map(AclEntry::Single)
        .map_err(|_| ValidationError::InvalidAcl(key, entry.to_string()))
}

/// Accepts either a numeric prefix length (`24`) or a dotted mask
/// (`255.255.255.0`) and returns the prefix length.
fn parse_mask(mask: &str, base: IpAddr) -> Option<u8> {
    if let Ok(prefix) = mask.parse::<u8>() {
        return Some(prefix);
    }
    let IpAddr::V4(mask_addr) = IpAddr::from_str(mask).ok()? else {
        return None;
    };
    if !matches!(base, IpAddr::V4(_)) {
        return None;
    }
    let bits = u32::from(mask_addr);
    // A valid dotted mask is a contiguous run of 1s from the top.
    let ones = bits.leading_ones();
    let reconstructed = if ones == 0 { 0 } else { u32::MAX << (32 - ones) };
    if bits == reconstructed {
        Some(ones as u8)
    } else {
        None
    }
}

/// Normalises an IPv4-mapped IPv6 peer address (`::ffff:a.b.c.d`) to plain
/// IPv4 so ACL comparisons against `allowed_hosts`/`denied_hosts` (the v4
/// lists) work regardless of how the socket reports the peer.
pub fn normalize_peer(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_star_as_any() {
        let list = parse_acl_list("allowed_hosts", "*").unwrap();
        assert_eq!(list, vec![AclEntry::Any]);
    }

    #[test]
    fn parses_empty_as_none() {
        let list = parse_acl_list("denied_hosts", "").unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn parses_single_address() {
        let list = parse_acl_list("allowed_hosts", "10.0.0.5").unwrap();
        assert_eq!(list, vec![AclEntry::Single("10.0.0.5".parse().unwrap())]);
    }

    #[test]
    fn parses_numeric_cidr() {
        let list = parse_acl_list("allowed_hosts", "10.0.0.0/24").unwrap();
        match &list[0] {
            AclEntry::Cidr(net) => {
                assert_eq!(net.prefix(), 24);
                assert!(net.contains("10.0.0.200".parse().unwrap()));
                assert!(!net.contains("10.0.1.1".parse().unwrap()));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn parses_dotted_mask_cidr() {
        let list = parse_acl_list("allowed_hosts", "192.168.1.0/255.255.255.0").unwrap();
        match &list[0] {
            AclEntry::Cidr(net) => assert_eq!(net.prefix(), 24),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn rejects_non_contiguous_dotted_mask() {
        let err = parse_acl_list("allowed_hosts", "10.0.0.0/255.0.255.0").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidAcl(..)));
    }

    #[test]
    fn parses_range() {
        let list = parse_acl_list("allowed_hosts", "10.0.0.1-10.0.0.50").unwrap();
        match &list[0] {
            AclEntry::Range(s, e) => {
                assert_eq!(*s, "10.0.0.1".parse::<IpAddr>().unwrap());
                assert_eq!(*e, "10.0.0.50".parse::<IpAddr>().unwrap());
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn range_matches_inclusive_bounds() {
        let list = parse_acl_list("allowed_hosts", "10.0.0.1-10.0.0.50").unwrap();
        assert!(list[0].matches("10.0.0.1".parse().unwrap()));
        assert!(list[0].matches("10.0.0.50".parse().unwrap()));
        assert!(!list[0].matches("10.0.0.51".parse().unwrap()));
    }

    #[test]
    fn normalizes_ipv4_mapped_ipv6() {
        let mapped: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        assert_eq!(normalize_peer(mapped), "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn leaves_plain_v6_alone() {
        let addr: IpAddr = "::1".parse().unwrap();
        assert_eq!(normalize_peer(addr), addr);
    }

    #[test]
    fn list_parses_multiple_comma_separated_entries() {
        let list = parse_acl_list("allowed_hosts", "10.0.0.1, 10.0.1.0/24 ,192.168.0.1-192.168.0.10").unwrap();
        assert_eq!(list.len(), 3);
    }
}
