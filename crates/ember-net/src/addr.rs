// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Universal socket addresses.
//!
//! String form is `"ip:port"` or `"[ipv6]:port"`. The declared type of
//! an address can differ from its actual type: a v4-mapped-v6 address
//! is declared v6 but actually v4.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use ember_value::{RtError, RtResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    V4,
    V6,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    inner: SocketAddr,
}

impl Address {
    /// Parse `"ip:port"` / `"[ipv6]:port"`.
    pub fn parse(text: &str) -> RtResult<Self> {
        let inner: SocketAddr = text
            .parse()
            .map_err(|e| RtError::invalid_arguments(format!("address {text:?}: {e}")))?;
        Ok(Self { inner })
    }

    pub fn from_std(inner: SocketAddr) -> Self {
        Self { inner }
    }

    pub fn to_std(&self) -> SocketAddr {
        self.inner
    }

    /// Declared address family.
    pub fn kind(&self) -> AddrKind {
        match self.inner {
            SocketAddr::V4(_) => AddrKind::V4,
            SocketAddr::V6(_) => AddrKind::V6,
        }
    }

    /// Actual family: v4-mapped-v6 counts as v4.
    pub fn actual_kind(&self) -> AddrKind {
        match self.inner {
            SocketAddr::V4(_) => AddrKind::V4,
            SocketAddr::V6(a6) => match a6.ip().to_ipv4_mapped() {
                Some(_) => AddrKind::V4,
                None => AddrKind::V6,
            },
        }
    }

    pub fn port(&self) -> u16 {
        self.inner.port()
    }

    /// The bare address, unmapping v4-mapped-v6.
    pub fn ip_string(&self) -> String {
        match self.inner {
            SocketAddr::V4(a4) => a4.ip().to_string(),
            SocketAddr::V6(a6) => match a6.ip().to_ipv4_mapped() {
                Some(v4) => v4.to_string(),
                None => a6.ip().to_string(),
            },
        }
    }

    /// `ip:port`, with v6 brackets where needed.
    pub fn full_address(&self) -> String {
        match self.actual_kind() {
            AddrKind::V4 => format!("{}:{}", self.ip_string(), self.port()),
            _ => format!("[{}]:{}", self.ip_string(), self.port()),
        }
    }

    /// The v6 (or v4-mapped-v6) form used for dual-stack sockets.
    pub fn to_v6(&self) -> Address {
        match self.inner {
            SocketAddr::V6(_) => *self,
            SocketAddr::V4(a4) => Address::from_std(SocketAddr::new(
                IpAddr::V6(a4.ip().to_ipv6_mapped()),
                a4.port(),
            )),
        }
    }

    pub fn is_unspecified(&self) -> bool {
        match self.inner.ip() {
            IpAddr::V4(ip) => ip.is_unspecified(),
            IpAddr::V6(ip) => ip == Ipv6Addr::UNSPECIFIED,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_address())
    }
}

impl std::str::FromStr for Address {
    type Err = RtError;

    fn from_str(s: &str) -> RtResult<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_and_v6() {
        let v4 = Address::parse("127.0.0.1:8080").unwrap();
        assert_eq!(v4.kind(), AddrKind::V4);
        assert_eq!(v4.actual_kind(), AddrKind::V4);
        assert_eq!(v4.port(), 8080);
        assert_eq!(v4.full_address(), "127.0.0.1:8080");

        let v6 = Address::parse("[::1]:9090").unwrap();
        assert_eq!(v6.kind(), AddrKind::V6);
        assert_eq!(v6.actual_kind(), AddrKind::V6);
        assert_eq!(v6.full_address(), "[::1]:9090");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Address::parse("not an address").is_err());
        assert!(Address::parse("127.0.0.1").is_err()); // missing port
    }

    #[test]
    fn v4_mapped_is_declared_v6_actual_v4() {
        let mapped = Address::parse("[::ffff:10.0.0.1]:443").unwrap();
        assert_eq!(mapped.kind(), AddrKind::V6);
        assert_eq!(mapped.actual_kind(), AddrKind::V4);
        assert_eq!(mapped.ip_string(), "10.0.0.1");
        assert_eq!(mapped.full_address(), "10.0.0.1:443");
    }

    #[test]
    fn v4_to_v6_mapping_round_trips() {
        let v4 = Address::parse("192.168.1.2:80").unwrap();
        let v6 = v4.to_v6();
        assert_eq!(v6.kind(), AddrKind::V6);
        assert_eq!(v6.actual_kind(), AddrKind::V4);
        assert_eq!(v6.ip_string(), "192.168.1.2");
        assert_eq!(v6.port(), 80);
    }
}
