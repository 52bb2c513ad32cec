//! AUTHORISE (§4.6): localhost is always allowed; otherwise the peer must
//! match `allowed_hosts`/`allowed_hosts_6` and not match
//! `denied_hosts`/`denied_hosts_6`.

use pkg_cacher_config::AclEntry;
use std::net::IpAddr;

/// Re-exported so callers don't need a direct `pkg_cacher_config::acl`
/// dependency just for this one function.
pub use pkg_cacher_config::acl::normalize_peer;

/// `true` if `peer` (already IPv4-mapped-normalised) is localhost: IPv4
/// `127.0.0.1` or IPv6 `::1` (§4.6: "Localhost ... is always allowed").
pub fn is_localhost(peer: IpAddr) -> bool {
    match peer {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Runs the allow/deny decision for one peer against the IPv4 or IPv6 ACL
/// pair, depending on the address family. Localhost always passes first.
pub fn is_authorised(
    peer: IpAddr,
    allowed_hosts: &[AclEntry],
    denied_hosts: &[AclEntry],
    allowed_hosts_6: &[AclEntry],
    denied_hosts_6: &[AclEntry],
) -> bool {
    let peer = normalize_peer(peer);
    if is_localhost(peer) {
        return true;
    }

    let (allowed, denied) = match peer {
        IpAddr::V4(_) => (allowed_hosts, denied_hosts),
        IpAddr::V6(_) => (allowed_hosts_6, denied_hosts_6),
    };

    let allowed_match = allowed.iter().any(|entry| entry.matches(peer));
    let denied_match = denied.iter().any(|entry| entry.matches(peer));
    allowed_match && !denied_match
}

#[cfg(test)]
mod test {
    use super::*;
    use pkg_cacher_config::acl::parse_acl_list;

    #[test]
    fn localhost_v4_is_always_allowed() {
        assert!(is_authorised("127.0.0.1".parse().unwrap(), &[], &[], &[], &[]));
    }

    #[test]
    fn localhost_v6_is_always_allowed() {
        assert!(is_authorised("::1".parse().unwrap(), &[], &[], &[], &[]));
    }

    #[test]
    fn ipv4_mapped_ipv6_localhost_is_normalised_then_allowed() {
        let mapped: IpAddr = "::ffff:127.0.0.1".parse().unwrap();
        assert!(is_authorised(mapped, &[], &[], &[], &[]));
    }

    #[test]
    fn non_localhost_peer_needs_an_allow_match() {
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(!is_authorised(peer, &[], &[], &[], &[]));

        let allowed = parse_acl_list("allowed_hosts", "10.0.0.0/24").unwrap();
        assert!(is_authorised(peer, &allowed, &[], &[], &[]));
    }

    #[test]
    fn deny_list_overrides_an_allow_match() {
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        let allowed = parse_acl_list("allowed_hosts", "10.0.0.0/24").unwrap();
        let denied = parse_acl_list("denied_hosts", "10.0.0.5").unwrap();
        assert!(!is_authorised(peer, &allowed, &denied, &[], &[]));
    }

    #[test]
    fn wildcard_allow_permits_any_peer() {
        let peer: IpAddr = "203.0.113.7".parse().unwrap();
        let allowed = parse_acl_list("allowed_hosts", "*").unwrap();
        assert!(is_authorised(peer, &allowed, &[], &[], &[]));
    }
}
