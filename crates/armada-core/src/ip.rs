//! IPv4 <-> u32 codec used by the IP ledger.
//!
//! Addresses are stored as the big-endian integer of their four octets.

use std::net::Ipv4Addr;

/// Encode an address as a big-endian u32.
pub fn ip_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from_be_bytes(ip.octets())
}

/// Decode a big-endian u32 back into an address.
pub fn u32_to_ip(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value.to_be_bytes())
}

/// Parse a dotted quad and encode it. Returns `None` for malformed input.
pub fn parse_ip_u32(s: &str) -> Option<u32> {
    s.trim().parse::<Ipv4Addr>().ok().map(ip_to_u32)
}

/// Whether `ip` lies inside `network/prefix`.
pub fn in_prefix(network: u32, prefix: u8, ip: u32) -> bool {
    let mask = prefix_mask(prefix);
    network & mask == ip & mask
}

/// Network mask for a prefix length (0..=32).
pub fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_vectors() {
        let vectors = [
            ("192.168.41.23", 3_232_246_039u32),
            ("127.0.0.1", 2_130_706_433),
            ("10.0.2.78", 167_772_750),
        ];
        for (dotted, encoded) in vectors {
            assert_eq!(parse_ip_u32(dotted), Some(encoded));
            assert_eq!(u32_to_ip(encoded).to_string(), dotted);
        }
    }

    #[test]
    fn malformed_is_none() {
        assert_eq!(parse_ip_u32("10.0.0"), None);
        assert_eq!(parse_ip_u32("10.0.0.256"), None);
    }

    #[test]
    fn prefix_membership() {
        let net = parse_ip_u32("10.1.0.0").unwrap();
        assert!(in_prefix(net, 16, parse_ip_u32("10.1.200.3").unwrap()));
        assert!(!in_prefix(net, 16, parse_ip_u32("10.2.0.1").unwrap()));
        assert!(in_prefix(net, 0, parse_ip_u32("192.168.0.1").unwrap()));
        assert_eq!(prefix_mask(24), 0xFFFF_FF00);
    }

    proptest! {
        #[test]
        fn dotted_quad_round_trip(a in any::<u8>(), b in any::<u8>(), c in any::<u8>(), d in any::<u8>()) {
            let dotted = format!("{a}.{b}.{c}.{d}");
            let encoded = parse_ip_u32(&dotted).unwrap();
            prop_assert_eq!(u32_to_ip(encoded).to_string(), dotted);
        }
    }
}
