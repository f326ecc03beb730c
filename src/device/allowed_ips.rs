//! Cryptokey routing table: CIDR blocks to peers
//!
//! Routes inner plaintext packets to the peer allowed to carry them,
//! in both directions: destination lookup on the outbound path, source
//! validation on the inbound path. Longest prefix wins.

use std::net::IpAddr;
use std::sync::Weak;

use ipnet::IpNet;

use crate::device::peer::Peer;

/// Ordered prefix table. Linear longest-prefix match is plenty for the
/// peer counts a single device carries.
#[derive(Default)]
pub struct AllowedIps {
    entries: Vec<(IpNet, Weak<Peer>)>,
}

impl AllowedIps {
    /// Route `net` to `peer`, replacing any identical prefix
    pub fn insert(&mut self, net: IpNet, peer: Weak<Peer>) {
        self.entries.retain(|(existing, _)| *existing != net);
        self.entries.push((net, peer));
        self.entries
            .sort_by(|(a, _), (b, _)| b.prefix_len().cmp(&a.prefix_len()));
    }

    /// Longest-prefix match for an address
    pub fn lookup(&self, ip: IpAddr) -> Option<std::sync::Arc<Peer>> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .and_then(|(_, peer)| peer.upgrade())
    }

    /// Drop every route owned by `peer`
    pub fn remove_peer(&mut self, peer: &std::sync::Arc<Peer>) {
        self.entries.retain(|(_, candidate)| {
            candidate
                .upgrade()
                .map_or(false, |p| !std::sync::Arc::ptr_eq(&p, peer))
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Destination address of an IPv4/IPv6 packet, by version nibble
pub fn destination_address(packet: &[u8]) -> Option<IpAddr> {
    inner_address(packet, 16, 24)
}

/// Source address of an IPv4/IPv6 packet
pub fn source_address(packet: &[u8]) -> Option<IpAddr> {
    inner_address(packet, 12, 8)
}

fn inner_address(packet: &[u8], v4_offset: usize, v6_offset: usize) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[v4_offset..v4_offset + 4].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[v6_offset..v6_offset + 16].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_header_addresses() {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[12..16].copy_from_slice(&[10, 0, 0, 1]);
        packet[16..20].copy_from_slice(&[10, 0, 0, 2]);

        assert_eq!(source_address(&packet), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(
            destination_address(&packet),
            Some("10.0.0.2".parse().unwrap())
        );
    }

    #[test]
    fn test_v6_header_addresses() {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        packet[8] = 0xfd;
        packet[23] = 0x01;
        packet[24] = 0xfd;
        packet[39] = 0x02;

        let src = source_address(&packet).unwrap();
        let dst = destination_address(&packet).unwrap();
        assert!(src.is_ipv6());
        assert_ne!(src, dst);
    }

    #[test]
    fn test_malformed_packets_unroutable() {
        assert_eq!(destination_address(&[]), None);
        assert_eq!(destination_address(&[0x45; 4]), None);
        assert_eq!(destination_address(&[0x90; 40]), None);
    }
}
