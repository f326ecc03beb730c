//! UAPI configuration parser and serializer
//!
//! A line-oriented `key=value` format. Lines before the first
//! `public_key` configure the device; each `public_key` line opens a
//! peer stanza. Statistics keys are accepted and ignored on input so a
//! get-operation dump can be fed back in; unknown keys are errors that
//! name the offending line.

use std::fmt::Write as _;

use ipnet::IpNet;

use crate::error::ConfigError;

/// Length of a hex-encoded 32-byte key
const KEY_HEX_LEN: usize = 64;

/// Parsed device configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Device identity (already clamped by the producer)
    pub private_key: Option<[u8; 32]>,
    /// UDP listen port; 0 lets the OS choose
    pub listen_port: u16,
    pub peers: Vec<PeerConfig>,
}

/// One peer stanza
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    /// Comma-separated candidate endpoints, already validated
    pub endpoints: String,
    /// Seconds between forced keepalives; 0 disables
    pub persistent_keepalive: u16,
    pub allowed_ips: Vec<IpNet>,
}

impl Config {
    /// Parse a UAPI stream
    pub fn from_uapi(input: &str) -> Result<Self, ConfigError> {
        let mut private_key = None;
        let mut listen_port = 0u16;
        let mut peers: Vec<PeerConfig> = Vec::new();

        for (idx, line) in input.lines().enumerate() {
            let line_num = idx + 1;
            if line.is_empty() {
                continue;
            }

            let mut parts = line.splitn(3, '=');
            let (key, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(k), Some(v), None) => (k, v),
                _ => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: format!("expected one key=value pair, got '{line}'"),
                    })
                }
            };

            if key == "public_key" {
                peers.push(PeerConfig {
                    public_key: parse_key_hex(value)?,
                    ..PeerConfig::default()
                });
                continue;
            }

            // Lines before the first public_key configure the device;
            // afterwards they belong to the open peer stanza.
            match peers.last_mut() {
                Some(peer) => handle_peer_line(peer, key, value)?,
                None => match key {
                    "private_key" => private_key = Some(parse_key_hex(value)?),
                    "listen_port" => {
                        listen_port = value.parse().map_err(|_| ConfigError::InvalidPort {
                            value: value.to_string(),
                        })?;
                    }
                    "fwmark" => {} // accepted, ignored
                    _ => {
                        return Err(ConfigError::UnexpectedKey {
                            key: key.to_string(),
                        })
                    }
                },
            }
        }

        Ok(Config {
            private_key,
            listen_port,
            peers,
        })
    }

    /// Serialize back to the UAPI format; ignored input keys are not
    /// reproduced, so parse(serialize(parse(x))) is stable.
    pub fn to_uapi(&self) -> String {
        let mut out = String::new();
        if let Some(key) = &self.private_key {
            let _ = writeln!(out, "private_key={}", hex::encode(key));
        }
        if self.listen_port != 0 {
            let _ = writeln!(out, "listen_port={}", self.listen_port);
        }
        for peer in &self.peers {
            let _ = writeln!(out, "public_key={}", hex::encode(peer.public_key));
            if !peer.endpoints.is_empty() {
                let _ = writeln!(out, "endpoint={}", peer.endpoints);
            }
            if peer.persistent_keepalive != 0 {
                let _ = writeln!(
                    out,
                    "persistent_keepalive_interval={}",
                    peer.persistent_keepalive
                );
            }
            for net in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={net}");
            }
        }
        out
    }
}

fn handle_peer_line(peer: &mut PeerConfig, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "endpoint" => {
            for candidate in value.split(',') {
                parse_endpoint(candidate)?;
            }
            peer.endpoints = value.to_string();
        }
        "persistent_keepalive_interval" => {
            peer.persistent_keepalive = value.parse().map_err(|_| ConfigError::InvalidValue {
                why: "invalid keepalive interval".to_string(),
                offender: value.to_string(),
            })?;
        }
        "allowed_ip" => {
            let net: IpNet = value.parse().map_err(|_| ConfigError::InvalidCidr {
                value: value.to_string(),
            })?;
            peer.allowed_ips.push(net);
        }
        "protocol_version" => {
            if value != "1" {
                return Err(ConfigError::InvalidValue {
                    why: "invalid protocol version".to_string(),
                    offender: value.to_string(),
                });
            }
        }
        // Statistics and fields managed elsewhere: accepted, ignored
        "preshared_key" | "last_handshake_time_sec" | "last_handshake_time_nsec" | "tx_bytes"
        | "rx_bytes" => {}
        _ => {
            return Err(ConfigError::UnexpectedKey {
                key: key.to_string(),
            })
        }
    }
    Ok(())
}

fn parse_key_hex(value: &str) -> Result<[u8; 32], ConfigError> {
    if value.len() != KEY_HEX_LEN {
        return Err(ConfigError::InvalidKey {
            value: value.to_string(),
        });
    }
    let bytes = hex::decode(value).map_err(|_| ConfigError::InvalidKey {
        value: value.to_string(),
    })?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Split an endpoint string into host and port
///
/// Accepts `a.b.c.d:port`, `[v6addr]:port`, and `name:port`. A
/// bracketed host must contain a valid IPv6 literal; bare hosts must
/// not contain colons. Port 0 is rejected.
pub fn parse_endpoint(s: &str) -> Result<(String, u16), ConfigError> {
    let i = s.rfind(':').ok_or_else(|| ConfigError::InvalidValue {
        why: "missing port from endpoint".to_string(),
        offender: s.to_string(),
    })?;
    let (host, port_str) = (&s[..i], &s[i + 1..]);
    if host.is_empty() {
        return Err(ConfigError::InvalidValue {
            why: "invalid endpoint host".to_string(),
            offender: host.to_string(),
        });
    }

    let port: u16 = port_str.parse().map_err(|_| ConfigError::InvalidPort {
        value: port_str.to_string(),
    })?;
    if port == 0 {
        return Err(ConfigError::InvalidPort {
            value: port_str.to_string(),
        });
    }

    let bytes = host.as_bytes();
    let has_colon = host.contains(':');
    if bytes[0] == b'[' || bytes[bytes.len() - 1] == b']' || has_colon {
        // Only a well-formed [v6]:port survives this branch
        let bracketed = host.len() > 3 && bytes[0] == b'[' && bytes[bytes.len() - 1] == b']';
        if !bracketed {
            return Err(ConfigError::InvalidValue {
                why: "brackets must contain an IPv6 address".to_string(),
                offender: host.to_string(),
            });
        }
        let inner = &host[1..host.len() - 1];
        if inner.parse::<std::net::Ipv6Addr>().is_err() {
            return Err(ConfigError::InvalidValue {
                why: "brackets must contain an IPv6 address".to_string(),
                offender: host.to_string(),
            });
        }
        return Ok((inner.to_string(), port));
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_vectors() {
        assert!(parse_endpoint("[192.168.42.0:]:51880").is_err());

        let (host, port) = parse_endpoint("192.168.42.0:51880").unwrap();
        assert_eq!(host, "192.168.42.0");
        assert_eq!(port, 51880);

        let (host, port) = parse_endpoint("test.wireguard.com:18981").unwrap();
        assert_eq!(host, "test.wireguard.com");
        assert_eq!(port, 18981);

        let (host, port) = parse_endpoint("[2607:5300:60:6b0::c05f:543]:2468").unwrap();
        assert_eq!(host, "2607:5300:60:6b0::c05f:543");
        assert_eq!(port, 2468);

        assert!(parse_endpoint("[::::::invalid:18981").is_err());
    }

    #[test]
    fn test_parse_endpoint_port_bounds() {
        assert!(parse_endpoint("10.0.0.1:0").is_err());
        assert!(parse_endpoint("10.0.0.1:65536").is_err());
        assert!(parse_endpoint("10.0.0.1:65535").is_ok());
        assert!(parse_endpoint("noport").is_err());
    }

    const SAMPLE: &str = "\
private_key=4242424242424242424242424242424242424242424242424242424242424242\n\
listen_port=51820\n\
public_key=6969696969696969696969696969696969696969696969696969696969696969\n\
endpoint=192.168.42.0:51880\n\
persistent_keepalive_interval=25\n\
allowed_ip=10.0.0.0/24\n\
allowed_ip=fd00::/64\n\
protocol_version=1\n";

    #[test]
    fn test_parse_full_config() {
        let cfg = Config::from_uapi(SAMPLE).unwrap();
        assert_eq!(cfg.private_key, Some([0x42u8; 32]));
        assert_eq!(cfg.listen_port, 51820);
        assert_eq!(cfg.peers.len(), 1);

        let peer = &cfg.peers[0];
        assert_eq!(peer.public_key, [0x69u8; 32]);
        assert_eq!(peer.endpoints, "192.168.42.0:51880");
        assert_eq!(peer.persistent_keepalive, 25);
        assert_eq!(peer.allowed_ips.len(), 2);
    }

    #[test]
    fn test_roundtrip_equivalence() {
        let cfg = Config::from_uapi(SAMPLE).unwrap();
        let again = Config::from_uapi(&cfg.to_uapi()).unwrap();
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_ignored_keys_accepted() {
        let input = "\
public_key=6969696969696969696969696969696969696969696969696969696969696969\n\
preshared_key=0000000000000000000000000000000000000000000000000000000000000000\n\
last_handshake_time_sec=1\n\
last_handshake_time_nsec=2\n\
tx_bytes=3\n\
rx_bytes=4\n";
        let cfg = Config::from_uapi(input).unwrap();
        assert_eq!(cfg.peers.len(), 1);
    }

    #[test]
    fn test_fwmark_ignored_on_device() {
        let cfg = Config::from_uapi("fwmark=1234\n").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_unknown_key_is_error() {
        let err = Config::from_uapi("frobnicate=1\n").unwrap_err();
        assert!(err.to_string().contains("frobnicate"));

        let input = "\
public_key=6969696969696969696969696969696969696969696969696969696969696969\n\
frobnicate=1\n";
        assert!(Config::from_uapi(input).is_err());
    }

    #[test]
    fn test_bad_keys_rejected() {
        assert!(Config::from_uapi("private_key=zzzz\n").is_err());
        assert!(Config::from_uapi("private_key=4242\n").is_err());
        assert!(Config::from_uapi("listen_port=70000\n").is_err());
        assert!(Config::from_uapi("public_key=42\n").is_err());
    }

    #[test]
    fn test_multiple_endpoints_validated() {
        let input = "\
public_key=6969696969696969696969696969696969696969696969696969696969696969\n\
endpoint=10.0.0.1:51820,[2607:5300:60:6b0::c05f:543]:2468\n";
        let cfg = Config::from_uapi(input).unwrap();
        assert!(cfg.peers[0].endpoints.contains(','));

        let bad = "\
public_key=6969696969696969696969696969696969696969696969696969696969696969\n\
endpoint=10.0.0.1:51820,[broken:2468\n";
        assert!(Config::from_uapi(bad).is_err());
    }

    #[test]
    fn test_protocol_version_must_be_one() {
        let input = "\
public_key=6969696969696969696969696969696969696969696969696969696969696969\n\
protocol_version=2\n";
        assert!(Config::from_uapi(input).is_err());
    }
}
