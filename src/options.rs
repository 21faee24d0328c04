//! DHCP option codes and value interpretation per RFC 2132.
//!
//! The codec stores option values as raw bytes keyed by code, so unknown
//! options survive a decode/encode round trip byte-exactly. This module
//! supplies the well-known code constants, the [`MessageType`] enum for
//! option 53, and small helpers that interpret a raw value as an address,
//! an unsigned integer, or text when a component actually needs one.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions

use std::net::Ipv4Addr;

/// Option 1: subnet mask.
pub const OPT_SUBNET_MASK: u8 = 1;
/// Option 3: router/gateway addresses.
pub const OPT_ROUTER: u8 = 3;
/// Option 6: DNS server addresses.
pub const OPT_DNS_SERVER: u8 = 6;
/// Option 12: client hostname.
pub const OPT_HOSTNAME: u8 = 12;
/// Option 15: domain name.
pub const OPT_DOMAIN_NAME: u8 = 15;
/// Option 50: requested IP address.
pub const OPT_REQUESTED_IP: u8 = 50;
/// Option 51: lease time in seconds.
pub const OPT_LEASE_TIME: u8 = 51;
/// Option 53: DHCP message type.
pub const OPT_MESSAGE_TYPE: u8 = 53;
/// Option 54: server identifier.
pub const OPT_SERVER_ID: u8 = 54;
/// Option 55: parameter request list.
pub const OPT_PARAMETER_LIST: u8 = 55;
/// Option 60: vendor class identifier.
pub const OPT_VENDOR_CLASS: u8 = 60;
/// Option 61: client identifier.
pub const OPT_CLIENT_ID: u8 = 61;

/// TLV code 0: padding, no length or value.
pub const CODE_PAD: u8 = 0;
/// TLV code 255: end of options.
pub const CODE_END: u8 = 255;

/// DHCP message types (option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate servers.
    Discover = 1,
    /// Server response to DISCOVER with an address offer.
    Offer = 2,
    /// Client request for offered parameters.
    Request = 3,
    /// Client indicates the address is already in use.
    Decline = 4,
    /// Server acknowledgement with configuration.
    Ack = 5,
    /// Server negative acknowledgement.
    Nak = 6,
    /// Client releases its address.
    Release = 7,
    /// Client requests config without address allocation.
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Interprets a raw option value as an IPv4 address.
///
/// Returns `None` unless the value is exactly 4 bytes.
pub fn value_as_ipv4(value: &[u8]) -> Option<Ipv4Addr> {
    match value {
        [a, b, c, d] => Some(Ipv4Addr::new(*a, *b, *c, *d)),
        _ => None,
    }
}

/// Interprets a raw option value as a big-endian unsigned integer.
///
/// Accepts 1, 2, 4, or 8 byte values; anything else is `None`.
pub fn value_as_uint(value: &[u8]) -> Option<u64> {
    match value.len() {
        1 => Some(u64::from(value[0])),
        2 => Some(u64::from(u16::from_be_bytes([value[0], value[1]]))),
        4 => Some(u64::from(u32::from_be_bytes([
            value[0], value[1], value[2], value[3],
        ]))),
        8 => Some(u64::from_be_bytes([
            value[0], value[1], value[2], value[3], value[4], value[5], value[6], value[7],
        ])),
        _ => None,
    }
}

/// Interprets a raw option value as text, lossily.
pub fn value_as_text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}
