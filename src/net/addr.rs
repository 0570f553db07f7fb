//! IP network values and the ephemeral-range partitioner.
//!
//! Networks are stored normalised to their network address; all arithmetic
//! is done on the integer form of the address.

use crate::error::{Error, Result};
use ring::rand::SecureRandom;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IPv6 network (`addr/len`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Net {
    network: Ipv6Addr,
    prefix_len: u8,
}

fn mask6(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_len))
    }
}

impl Ipv6Net {
    /// Build a network, clearing host bits of `addr`.
    pub fn new(addr: Ipv6Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 128 {
            return Err(Error::address(
                format!("{}/{}", addr, prefix_len),
                "prefix length exceeds 128",
            ));
        }
        let bits = u128::from(addr) & mask6(prefix_len);
        Ok(Self {
            network: Ipv6Addr::from(bits),
            prefix_len,
        })
    }

    /// Network address.
    pub fn network(&self) -> Ipv6Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The `n`th address of the network, if it exists.
    pub fn nth(&self, n: u128) -> Option<Ipv6Addr> {
        let host_bits = 128 - u32::from(self.prefix_len);
        if host_bits < 128 && n >> host_bits != 0 {
            return None;
        }
        Some(Ipv6Addr::from(u128::from(self.network) + n))
    }

    /// Whether `addr` lies inside this network.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        u128::from(addr) & mask6(self.prefix_len) == u128::from(self.network)
    }

    /// Split into the lower and upper halves of length `prefix_len + 1`.
    ///
    /// The lower half keeps the network address; the upper half starts
    /// `2^(128 - (prefix_len + 1))` addresses later.
    pub fn split(&self) -> Result<(Ipv6Net, Ipv6Net)> {
        if self.prefix_len >= 128 {
            return Err(Error::InvalidPrefix(self.to_string()));
        }
        let half_len = self.prefix_len + 1;
        let offset = 1u128 << (128 - u32::from(half_len));
        let base = u128::from(self.network);
        let lower = Ipv6Net {
            network: self.network,
            prefix_len: half_len,
        };
        let upper = Ipv6Net {
            network: Ipv6Addr::from(base + offset),
            prefix_len: half_len,
        };
        Ok((lower, upper))
    }
}

impl FromStr for Ipv6Net {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => {
                let len = len
                    .parse::<u8>()
                    .map_err(|e| Error::address(s, format!("bad prefix length: {}", e)))?;
                (addr, len)
            }
            None => (s, 128),
        };
        let addr = addr
            .parse::<Ipv6Addr>()
            .map_err(|e| Error::address(s, e.to_string()))?;
        Self::new(addr, len)
    }
}

impl std::fmt::Display for Ipv6Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Split a VM's prefix into `(guest_range, host_range)`.
pub fn partition(net: &Ipv6Net) -> Result<(Ipv6Net, Ipv6Net)> {
    net.split()
}

/// An IPv4 network (`addr/len`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    network: Ipv4Addr,
    prefix_len: u8,
}

fn mask4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

impl Ipv4Net {
    /// Build a network, clearing host bits of `addr`.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(Error::address(
                format!("{}/{}", addr, prefix_len),
                "prefix length exceeds 32",
            ));
        }
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask4(prefix_len)),
            prefix_len,
        })
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The `n`th address of the network, if it exists.
    pub fn nth(&self, n: u32) -> Option<Ipv4Addr> {
        let host_bits = 32 - u32::from(self.prefix_len);
        if host_bits < 32 && n >> host_bits != 0 {
            return None;
        }
        u32::from(self.network).checked_add(n).map(Ipv4Addr::from)
    }
}

impl FromStr for Ipv4Net {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => {
                let len = len
                    .parse::<u8>()
                    .map_err(|e| Error::address(s, format!("bad prefix length: {}", e)))?;
                (addr, len)
            }
            None => (s, 32),
        };
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|e| Error::address(s, e.to_string()))?;
        Self::new(addr, len)
    }
}

impl std::fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Parse `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = mac.trim().split(':').collect();
    if parts.len() != 6 {
        return Err(Error::address(mac, "expected six colon-separated octets"));
    }
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16)
            .map_err(|e| Error::address(mac, format!("bad octet '{}': {}", part, e)))?;
    }
    Ok(out)
}

/// Render a MAC address in lowercase colon form.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// EUI-64 link-local address of an interface with `mac`.
pub fn link_local(mac: &[u8; 6]) -> Ipv6Addr {
    Ipv6Addr::from([
        0xfe,
        0x80,
        0,
        0,
        0,
        0,
        0,
        0,
        mac[0] ^ 0x02,
        mac[1],
        mac[2],
        0xff,
        0xfe,
        mac[3],
        mac[4],
        mac[5],
    ])
}

/// A random locally administered unicast MAC address.
pub fn random_mac() -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    ring::rand::SystemRandom::new()
        .fill(&mut mac)
        .map_err(|_| Error::random("veth MAC address"))?;
    mac[0] = (mac[0] & 0xfe) | 0x02;
    Ok(mac)
}
