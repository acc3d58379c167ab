//! Wire codec for physical socket endpoints.
//!
//! RENDEZVOUS, PUSH_DIRECT_PATHS, and the world roster all carry IPv4/IPv6
//! endpoints. The framing is a type byte followed by the raw address bytes
//! and a big-endian port; a nil endpoint is the single byte `0`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::WireError;

const ENDPOINT_TYPE_NIL: u8 = 0;
const ENDPOINT_TYPE_IPV4: u8 = 4;
const ENDPOINT_TYPE_IPV6: u8 = 6;

/// Append an endpoint to `out`.
pub fn write_endpoint(out: &mut Vec<u8>, endpoint: Option<SocketAddr>) {
    match endpoint {
        None => out.push(ENDPOINT_TYPE_NIL),
        Some(SocketAddr::V4(sa)) => {
            out.push(ENDPOINT_TYPE_IPV4);
            out.extend_from_slice(&sa.ip().octets());
            out.extend_from_slice(&sa.port().to_be_bytes());
        }
        Some(SocketAddr::V6(sa)) => {
            out.push(ENDPOINT_TYPE_IPV6);
            out.extend_from_slice(&sa.ip().octets());
            out.extend_from_slice(&sa.port().to_be_bytes());
        }
    }
}

/// Read an endpoint, returning it and the number of bytes consumed.
pub fn read_endpoint(bytes: &[u8]) -> Result<(Option<SocketAddr>, usize), WireError> {
    let kind = *bytes.first().ok_or(WireError::TooShort { min: 1, actual: 0 })?;
    match kind {
        ENDPOINT_TYPE_NIL => Ok((None, 1)),
        ENDPOINT_TYPE_IPV4 => {
            if bytes.len() < 7 {
                return Err(WireError::TooShort {
                    min: 7,
                    actual: bytes.len(),
                });
            }
            let octets: [u8; 4] = bytes[1..5].try_into().expect("4 bytes");
            let port = u16::from_be_bytes(bytes[5..7].try_into().expect("2 bytes"));
            Ok((
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)),
                7,
            ))
        }
        ENDPOINT_TYPE_IPV6 => {
            if bytes.len() < 19 {
                return Err(WireError::TooShort {
                    min: 19,
                    actual: bytes.len(),
                });
            }
            let octets: [u8; 16] = bytes[1..17].try_into().expect("16 bytes");
            let port = u16::from_be_bytes(bytes[17..19].try_into().expect("2 bytes"));
            Ok((
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                19,
            ))
        }
        other => Err(WireError::InvalidEndpointType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_roundtrip() {
        let addr: SocketAddr = "203.0.113.9:9993".parse().unwrap();
        let mut buf = Vec::new();
        write_endpoint(&mut buf, Some(addr));
        assert_eq!(buf.len(), 7);

        let (parsed, consumed) = read_endpoint(&buf).unwrap();
        assert_eq!(parsed, Some(addr));
        assert_eq!(consumed, 7);
    }

    #[test]
    fn ipv6_roundtrip() {
        let addr: SocketAddr = "[2001:db8::1]:19993".parse().unwrap();
        let mut buf = Vec::new();
        write_endpoint(&mut buf, Some(addr));
        assert_eq!(buf.len(), 19);

        let (parsed, consumed) = read_endpoint(&buf).unwrap();
        assert_eq!(parsed, Some(addr));
        assert_eq!(consumed, 19);
    }

    #[test]
    fn nil_roundtrip() {
        let mut buf = Vec::new();
        write_endpoint(&mut buf, None);
        assert_eq!(buf, [0]);
        assert_eq!(read_endpoint(&buf).unwrap(), (None, 1));
    }

    #[test]
    fn sequence_of_endpoints() {
        let a: SocketAddr = "198.51.100.1:9993".parse().unwrap();
        let b: SocketAddr = "[2001:db8::2]:9993".parse().unwrap();
        let mut buf = Vec::new();
        write_endpoint(&mut buf, Some(a));
        write_endpoint(&mut buf, None);
        write_endpoint(&mut buf, Some(b));

        let (e1, n1) = read_endpoint(&buf).unwrap();
        let (e2, n2) = read_endpoint(&buf[n1..]).unwrap();
        let (e3, n3) = read_endpoint(&buf[n1 + n2..]).unwrap();
        assert_eq!((e1, e2, e3), (Some(a), None, Some(b)));
        assert_eq!(n1 + n2 + n3, buf.len());
    }

    #[test]
    fn truncated_rejected() {
        let addr: SocketAddr = "203.0.113.9:9993".parse().unwrap();
        let mut buf = Vec::new();
        write_endpoint(&mut buf, Some(addr));
        for len in 1..buf.len() {
            assert!(read_endpoint(&buf[..len]).is_err(), "len {len} should fail");
        }
        assert!(read_endpoint(&[]).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        assert_eq!(
            read_endpoint(&[9, 0, 0]),
            Err(WireError::InvalidEndpointType(9))
        );
    }
}
