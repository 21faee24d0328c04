//! IPv4 prefix and interval arithmetic.
//!
//! Every other component leans on this module: the topology resolver
//! matches relay addresses against [`InetCidr`] prefixes, and pools and
//! bubbles are [`AddressRange`] intervals compared as unsigned 32-bit
//! integers.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An IPv4 CIDR prefix.
///
/// The stored address is always pre-masked to the prefix length, so two
/// `InetCidr` values covering the same block compare equal regardless of
/// the host bits they were built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InetCidr {
    address: Ipv4Addr,
    prefix: u8,
}

impl InetCidr {
    /// Creates a CIDR, masking `address` down to `prefix` bits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `prefix` is outside `1..=32`.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix == 0 || prefix > 32 {
            return Err(Error::InvalidAddress(format!(
                "prefix length {} outside 1..=32",
                prefix
            )));
        }
        let mask = prefix_to_mask(prefix);
        Ok(Self {
            address: Ipv4Addr::from(u32::from(address) & mask),
            prefix,
        })
    }

    /// Creates a CIDR from an address and a dotted netmask.
    ///
    /// The mask must be one of the 32 contiguous masks
    /// (`128.0.0.0` .. `255.255.255.255`).
    pub fn from_addr_mask(address: Ipv4Addr, mask: Ipv4Addr) -> Result<Self> {
        let mask_bits = u32::from(mask);
        for prefix in 1..=32u8 {
            if prefix_to_mask(prefix) == mask_bits {
                return Self::new(address, prefix);
            }
        }
        Err(Error::InvalidAddress(format!(
            "{} is not a contiguous netmask",
            mask
        )))
    }

    /// The masked network address.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// The prefix length in bits.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The dotted netmask form of the prefix.
    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_to_mask(self.prefix))
    }

    /// True if `addr` falls inside this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & prefix_to_mask(self.prefix) == u32::from(self.address)
    }
}

impl fmt::Display for InetCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl std::str::FromStr for InetCidr {
    type Err = Error;

    /// Parses `address/prefix` notation, e.g. `192.168.1.0/24`.
    fn from_str(s: &str) -> Result<Self> {
        let (address, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidAddress(format!("missing prefix in {:?}", s)))?;
        let address: Ipv4Addr = address
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("bad address in {:?}", s)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("bad prefix in {:?}", s)))?;
        Self::new(address, prefix)
    }
}

/// The contiguous netmask for a prefix length in `1..=32`.
fn prefix_to_mask(prefix: u8) -> u32 {
    debug_assert!((1..=32).contains(&prefix));
    u32::MAX << (32 - u32::from(prefix))
}

/// Every CIDR containing `addr`, most-specific first.
///
/// Returns exactly 32 entries: index `i` has prefix length `32 - i`, so
/// entry 0 is the /32 for `addr` itself and entry 31 is the /1.
pub fn cidrs_containing(addr: Ipv4Addr) -> Vec<InetCidr> {
    (1..=32u8)
        .rev()
        .map(|prefix| {
            InetCidr::new(addr, prefix).expect("prefix in 1..=32 is always valid")
        })
        .collect()
}

/// An inclusive IPv4 address interval.
///
/// Endpoints are ordered as unsigned 32-bit integers and the range is
/// immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl AddressRange {
    /// Creates a range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `start > end` under unsigned
    /// comparison.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if u32::from(start) > u32::from(end) {
            return Err(Error::InvalidAddress(format!(
                "range start {} is above end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    /// Inclusive unsigned membership test.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        a >= u32::from(self.start) && a <= u32::from(self.end)
    }

    /// Number of addresses in the range (never zero).
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
