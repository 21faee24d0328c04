//! DHCP/BOOTP packet parsing and encoding per RFC 2131.
//!
//! A DHCP packet is a fixed 236-byte positional header, optionally
//! followed by a 4-byte magic cookie and variable-length TLV options.
//! Decoding is permissive about option truncation (attacker-controlled
//! input must never panic and rarely needs to be rejected outright);
//! encoding is strict, refusing to produce a malformed packet.
//!
//! # Packet Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                          ciaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          yiaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          siaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          giaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          chaddr (16)                          |
//! +---------------------------------------------------------------+
//! |                          sname (64)                           |
//! +---------------------------------------------------------------+
//! |                          file (128)                           |
//! +---------------------------------------------------------------+
//! |              [magic cookie (4) = 99.130.83.99]                |
//! +---------------------------------------------------------------+
//! |                   [options (variable), END]                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! # References
//!
//! - RFC 2131: Dynamic Host Configuration Protocol

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{Error, Result};
use crate::options::{
    self, CODE_END, CODE_PAD, MessageType, OPT_LEASE_TIME, OPT_MESSAGE_TYPE, OPT_REQUESTED_IP,
    OPT_SERVER_ID,
};

/// DHCP magic cookie that identifies DHCP packets (vs plain BOOTP).
pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const OP_HTYPE_HLEN_HOPS_SIZE: usize = 4;
const XID_SIZE: usize = 4;
const SECS_SIZE: usize = 2;
const FLAGS_SIZE: usize = 2;
const ADDR_FIELDS_SIZE: usize = 4 * 4;
const CHADDR_SIZE: usize = 16;
const SNAME_SIZE: usize = 64;
const FILE_SIZE: usize = 128;

const SNAME_OFFSET: usize =
    OP_HTYPE_HLEN_HOPS_SIZE + XID_SIZE + SECS_SIZE + FLAGS_SIZE + ADDR_FIELDS_SIZE + CHADDR_SIZE;
const FILE_OFFSET: usize = SNAME_OFFSET + SNAME_SIZE;

/// Size of the fixed positional header, before the magic cookie.
pub const FIXED_HEADER_SIZE: usize = FILE_OFFSET + FILE_SIZE;

/// Largest datagram the decoder will look at.
///
/// A single Ethernet frame bounds anything a real client sends; a
/// 4700-byte buffer is rejected outright while a ~550-byte BOOTREQUEST
/// passes.
pub const MAX_PACKET_SIZE: usize = 1500;

/// Initial capacity for the encode buffer.
///
/// 576 bytes is the minimum MTU all hosts must accept per RFC 791.
const ENCODE_CAPACITY: usize = 576;

/// BOOTP/DHCP operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// BOOTP/DHCP operation code for server replies.
pub const BOOTREPLY: u8 = 2;

/// Hardware type for Ethernet (most common).
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet (6 bytes).
pub const HLEN_ETHERNET: u8 = 6;

/// Broadcast flag, bit 15 of `flags`.
const FLAG_BROADCAST: u16 = 0x8000;

/// A decoded DHCP/BOOTP message.
///
/// Represents both client requests and server replies. Use
/// [`decode`](Self::decode) for incoming datagrams and
/// [`reply_to`](Self::reply_to) to start a response.
///
/// Options live in an ordered `code -> raw value` map; codes 0 (PAD) and
/// 255 (END) are wire markers and never appear as entries, and every
/// stored value is at most 255 bytes or [`encode`](Self::encode) refuses
/// it. The `destination` and `comment` fields are routing metadata for
/// the caller and are never part of the wire encoding.
#[derive(Debug, Clone)]
pub struct DhcpMessage {
    /// Operation code: [`BOOTREQUEST`] (1) or [`BOOTREPLY`] (2).
    pub op: u8,

    /// Hardware address type. [`HTYPE_ETHERNET`] (1) for Ethernet.
    pub htype: u8,

    /// Hardware address length as carried on the wire.
    ///
    /// Values above 16 are preserved for round-trip fidelity;
    /// [`chaddr_bytes`](Self::chaddr_bytes) clamps to the 16-byte
    /// `chaddr` field when reading the address.
    pub hlen: u8,

    /// Hop count, incremented by relay agents.
    pub hops: u8,

    /// Transaction ID chosen by the client, echoed in replies.
    pub xid: u32,

    /// Seconds elapsed since the client began address acquisition.
    pub secs: u16,

    /// Flags. Bit 15 (0x8000) = broadcast flag.
    pub flags: u16,

    /// Client IP address (set by clients in RENEWING/REBINDING states).
    pub ciaddr: Ipv4Addr,

    /// "Your" IP address - the address being assigned to the client.
    pub yiaddr: Ipv4Addr,

    /// Server IP address (next server in BOOTP).
    pub siaddr: Ipv4Addr,

    /// Gateway IP address - set by relay agents.
    pub giaddr: Ipv4Addr,

    /// Client hardware address; only the first `hlen` bytes are valid.
    pub chaddr: [u8; 16],

    /// Server host name, fixed-width and null-padded.
    pub sname: [u8; 64],

    /// Boot file name, fixed-width and null-padded.
    pub file: [u8; 128],

    /// Options: code -> raw value, codes 1..=254 only.
    pub options: BTreeMap<u8, Vec<u8>>,

    /// Trailing bytes after the END marker, preserved verbatim.
    pub padding: Vec<u8>,

    /// True when the magic cookie was present (DHCP rather than BOOTP).
    pub is_dhcp: bool,

    /// True when the option area ran out mid-TLV or before END.
    pub is_truncated: bool,

    /// Where the reply should be sent; never encoded.
    pub destination: Option<SocketAddrV4>,

    /// Free-text annotation for logging; never encoded.
    pub comment: Option<String>,
}

impl Default for DhcpMessage {
    fn default() -> Self {
        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0u8; 16],
            sname: [0u8; 64],
            file: [0u8; 128],
            options: BTreeMap::new(),
            padding: Vec::new(),
            is_dhcp: true,
            is_truncated: false,
            destination: None,
            comment: None,
        }
    }
}

/// Wire-field equality; routing metadata is deliberately excluded so the
/// decode/encode round-trip contract holds.
impl PartialEq for DhcpMessage {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op
            && self.htype == other.htype
            && self.hlen == other.hlen
            && self.hops == other.hops
            && self.xid == other.xid
            && self.secs == other.secs
            && self.flags == other.flags
            && self.ciaddr == other.ciaddr
            && self.yiaddr == other.yiaddr
            && self.siaddr == other.siaddr
            && self.giaddr == other.giaddr
            && self.chaddr == other.chaddr
            && self.sname[..] == other.sname[..]
            && self.file[..] == other.file[..]
            && self.options == other.options
            && self.padding == other.padding
            && self.is_dhcp == other.is_dhcp
            && self.is_truncated == other.is_truncated
    }
}

impl Eq for DhcpMessage {}

impl DhcpMessage {
    /// Decodes a DHCP message from `length` bytes of `data` at `offset`.
    ///
    /// # Errors
    ///
    /// - [`Error::BufferBounds`] if `offset`/`length` do not fit inside
    ///   `data` (the bytes are never inspected);
    /// - [`Error::BadPacket`] if `length` is below the fixed header size
    ///   (236) or above [`MAX_PACKET_SIZE`].
    ///
    /// Malformed trailing options are tolerated: the message comes back
    /// with `is_truncated` set and whatever options parsed cleanly.
    pub fn decode(data: &[u8], offset: usize, length: usize) -> Result<Self> {
        let end = offset.checked_add(length).ok_or(Error::BufferBounds {
            offset,
            length,
            available: data.len(),
        })?;
        if end > data.len() {
            return Err(Error::BufferBounds {
                offset,
                length,
                available: data.len(),
            });
        }

        if length < FIXED_HEADER_SIZE {
            return Err(Error::BadPacket(format!(
                "packet too short: {} bytes (minimum {})",
                length, FIXED_HEADER_SIZE
            )));
        }
        if length > MAX_PACKET_SIZE {
            return Err(Error::BadPacket(format!(
                "packet too large: {} bytes (maximum {})",
                length, MAX_PACKET_SIZE
            )));
        }

        let data = &data[offset..end];

        let mut message = Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            yiaddr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            siaddr: Ipv4Addr::new(data[20], data[21], data[22], data[23]),
            giaddr: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
            is_dhcp: false,
            ..Self::default()
        };
        message.chaddr.copy_from_slice(&data[28..44]);
        message
            .sname
            .copy_from_slice(&data[SNAME_OFFSET..SNAME_OFFSET + SNAME_SIZE]);
        message
            .file
            .copy_from_slice(&data[FILE_OFFSET..FILE_OFFSET + FILE_SIZE]);

        let tail = &data[FIXED_HEADER_SIZE..];
        if tail.len() >= 4 && tail[..4] == DHCP_MAGIC_COOKIE {
            message.is_dhcp = true;
            message.parse_options(&tail[4..]);
        } else {
            // Plain BOOTP vendor area, kept verbatim.
            message.padding = tail.to_vec();
        }

        Ok(message)
    }

    /// Parses the TLV option area.
    ///
    /// A repeated code concatenates onto the earlier value in encounter
    /// order, whether or not the TLVs are adjacent. This is the RFC
    /// 3396 long-option reassembly rule applied uniformly: values
    /// longer than 255 bytes come back whole, and an interleaved repeat
    /// appends rather than overwriting.
    fn parse_options(&mut self, data: &[u8]) {
        let mut index = 0;

        loop {
            if index >= data.len() {
                // Ran out before an END marker.
                self.is_truncated = true;
                return;
            }

            let code = data[index];
            if code == CODE_PAD {
                index += 1;
                continue;
            }
            if code == CODE_END {
                self.padding = data[index + 1..].to_vec();
                return;
            }

            if index + 1 >= data.len() {
                self.is_truncated = true;
                return;
            }
            let length = data[index + 1] as usize;
            if index + 2 + length > data.len() {
                self.is_truncated = true;
                return;
            }

            let value = &data[index + 2..index + 2 + length];
            self.options
                .entry(code)
                .or_default()
                .extend_from_slice(value);
            index += 2 + length;
        }
    }

    /// Encodes the message to its wire representation.
    ///
    /// Fixed header first; the magic cookie, options in ascending code
    /// order, and the END marker follow when the message is DHCP or
    /// carries options; preserved padding comes last.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOption`] if any option uses code 0 or
    /// 255, or a value above 255 bytes. Callers must pre-split long
    /// values.
    pub fn encode(&self) -> Result<Vec<u8>> {
        for (&code, value) in &self.options {
            if code == CODE_PAD || code == CODE_END {
                return Err(Error::InvalidOption {
                    code,
                    reason: "reserved wire marker".to_string(),
                });
            }
            if value.len() > 255 {
                return Err(Error::InvalidOption {
                    code,
                    reason: format!("value is {} bytes (maximum 255)", value.len()),
                });
            }
        }

        let mut packet = Vec::with_capacity(ENCODE_CAPACITY);

        packet.push(self.op);
        packet.push(self.htype);
        packet.push(self.hlen);
        packet.push(self.hops);

        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());

        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());

        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);

        if self.is_dhcp || !self.options.is_empty() {
            packet.extend_from_slice(&DHCP_MAGIC_COOKIE);
            for (&code, value) in &self.options {
                packet.push(code);
                packet.push(value.len() as u8);
                packet.extend_from_slice(value);
            }
            packet.push(CODE_END);
        }

        packet.extend_from_slice(&self.padding);

        Ok(packet)
    }

    /// Inserts an option, validating the wire invariants up front.
    ///
    /// Inserting a code that is already present replaces its value.
    pub fn insert_option(&mut self, code: u8, value: Vec<u8>) -> Result<()> {
        if code == CODE_PAD || code == CODE_END {
            return Err(Error::InvalidOption {
                code,
                reason: "reserved wire marker".to_string(),
            });
        }
        if value.len() > 255 {
            return Err(Error::InvalidOption {
                code,
                reason: format!("value is {} bytes (maximum 255)", value.len()),
            });
        }
        self.options.insert(code, value);
        Ok(())
    }

    /// Raw value of an option, if present.
    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options.get(&code).map(Vec::as_slice)
    }

    /// The DHCP message type (option 53), if present and recognized.
    ///
    /// `None` for BOOTP packets, which carry no options at all.
    pub fn message_type(&self) -> Option<MessageType> {
        let value = self.option(OPT_MESSAGE_TYPE)?;
        MessageType::try_from(*value.first()?).ok()
    }

    /// The requested IP address (option 50), if present.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        options::value_as_ipv4(self.option(OPT_REQUESTED_IP)?)
    }

    /// The server identifier (option 54), if present.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        options::value_as_ipv4(self.option(OPT_SERVER_ID)?)
    }

    /// The requested lease time in seconds (option 51), if present.
    pub fn requested_lease_time(&self) -> Option<u32> {
        let value = self.option(OPT_LEASE_TIME)?;
        options::value_as_uint(value).and_then(|v| u32::try_from(v).ok())
    }

    /// The client hardware address bytes (respecting `hlen`, clamped
    /// to the 16-byte field).
    pub fn chaddr_bytes(&self) -> &[u8] {
        &self.chaddr[..usize::from(self.hlen).min(self.chaddr.len())]
    }

    /// Formats the client hardware address as a colon-separated string.
    pub fn format_mac(&self) -> String {
        use std::fmt::Write;
        let bytes = self.chaddr_bytes();
        let mut result = String::with_capacity(bytes.len() * 3);
        for (index, byte) in bytes.iter().enumerate() {
            if index > 0 {
                result.push(':');
            }
            let _ = write!(result, "{:02x}", byte);
        }
        result
    }

    /// True if the broadcast flag (bit 15) is set.
    pub fn is_broadcast(&self) -> bool {
        (self.flags & FLAG_BROADCAST) != 0
    }

    /// Starts a reply to `request`.
    ///
    /// Copies the fields a server must echo: `xid`, `flags` (broadcast
    /// bit), `giaddr`, `chaddr`, and the hardware type/length. The
    /// message type option is set from `message_type`; `yiaddr` and
    /// `siaddr` are for the caller to fill in.
    pub fn reply_to(request: &DhcpMessage, message_type: MessageType) -> Self {
        let mut reply = Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            xid: request.xid,
            flags: request.flags,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            ..Self::default()
        };
        reply.options.insert(OPT_MESSAGE_TYPE, vec![message_type as u8]);
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_test_packet(message_type: MessageType, extra: &[(u8, &[u8])]) -> Vec<u8> {
        let mut packet = vec![0u8; 350];

        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[4..8].copy_from_slice(&0x12345678u32.to_be_bytes());
        packet[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
        packet[28..34].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);

        let mut index = 240;
        packet[index] = OPT_MESSAGE_TYPE;
        packet[index + 1] = 1;
        packet[index + 2] = message_type as u8;
        index += 3;

        for (code, value) in extra {
            packet[index] = *code;
            packet[index + 1] = value.len() as u8;
            packet[index + 2..index + 2 + value.len()].copy_from_slice(value);
            index += 2 + value.len();
        }

        packet[index] = CODE_END;
        packet.truncate(index + 1);
        packet
    }

    fn decode_all(data: &[u8]) -> crate::error::Result<DhcpMessage> {
        DhcpMessage::decode(data, 0, data.len())
    }

    #[test]
    fn test_decode_and_roundtrip() {
        let data = build_test_packet(MessageType::Discover, &[]);
        let message = decode_all(&data).unwrap();

        assert_eq!(message.op, BOOTREQUEST);
        assert_eq!(message.xid, 0x12345678);
        assert!(message.is_dhcp);
        assert!(!message.is_truncated);
        assert!(message.is_broadcast());
        assert_eq!(message.message_type(), Some(MessageType::Discover));
        assert_eq!(message.format_mac(), "aa:bb:cc:dd:ee:ff");

        let encoded = message.encode().unwrap();
        let reparsed = decode_all(&encoded).unwrap();
        assert_eq!(reparsed, message);
    }

    #[test]
    fn test_decode_with_options() {
        let data = build_test_packet(
            MessageType::Request,
            &[(OPT_REQUESTED_IP, &[192, 168, 1, 100]), (12, b"test-host")],
        );
        let message = decode_all(&data).unwrap();

        assert_eq!(message.requested_ip(), Some(Ipv4Addr::new(192, 168, 1, 100)));
        assert_eq!(message.option(12), Some(&b"test-host"[..]));
    }

    #[test]
    fn test_size_boundaries() {
        // Too short.
        assert!(matches!(
            decode_all(&[0u8; 47]),
            Err(Error::BadPacket(_))
        ));
        assert!(matches!(
            decode_all(&[0u8; 235]),
            Err(Error::BadPacket(_))
        ));

        // Far beyond any real MTU.
        assert!(matches!(
            decode_all(&[0u8; 4700]),
            Err(Error::BadPacket(_))
        ));

        // A realistic request decodes.
        let mut data = build_test_packet(MessageType::Discover, &[]);
        data.resize(550, 0);
        let message = decode_all(&data).unwrap();
        assert_eq!(message.op, BOOTREQUEST);
    }

    #[test]
    fn test_bounds_errors_are_not_bad_packet() {
        assert!(matches!(
            DhcpMessage::decode(&[], 0, 10),
            Err(Error::BufferBounds { .. })
        ));
        assert!(matches!(
            DhcpMessage::decode(&[0u8; 300], 100, 250),
            Err(Error::BufferBounds { .. })
        ));
        assert!(matches!(
            DhcpMessage::decode(&[0u8; 300], usize::MAX, 10),
            Err(Error::BufferBounds { .. })
        ));
    }

    #[test]
    fn test_decode_at_offset() {
        let inner = build_test_packet(MessageType::Discover, &[]);
        let mut framed = vec![0xEEu8; 20];
        framed.extend_from_slice(&inner);

        let message = DhcpMessage::decode(&framed, 20, inner.len()).unwrap();
        assert_eq!(message.xid, 0x12345678);
    }

    #[test]
    fn test_bootp_without_cookie() {
        let mut data = vec![0u8; FIXED_HEADER_SIZE];
        data[0] = BOOTREQUEST;
        data[1] = HTYPE_ETHERNET;
        data[2] = HLEN_ETHERNET;

        let message = decode_all(&data).unwrap();
        assert!(!message.is_dhcp);
        assert!(message.options.is_empty());
        assert!(message.message_type().is_none());
    }

    #[test]
    fn test_bootp_vendor_area_preserved() {
        let mut data = vec![0u8; FIXED_HEADER_SIZE + 8];
        data[0] = BOOTREQUEST;
        data[FIXED_HEADER_SIZE..].copy_from_slice(&[9, 9, 9, 9, 8, 8, 8, 8]);

        let message = decode_all(&data).unwrap();
        assert!(!message.is_dhcp);
        assert_eq!(message.padding, vec![9, 9, 9, 9, 8, 8, 8, 8]);

        let encoded = message.encode().unwrap();
        assert_eq!(decode_all(&encoded).unwrap(), message);
    }

    #[test]
    fn test_truncated_options_tolerated() {
        // Length byte missing entirely.
        let mut data = build_test_packet(MessageType::Discover, &[]);
        data.pop(); // drop END
        data.push(OPT_LEASE_TIME);
        let message = decode_all(&data).unwrap();
        assert!(message.is_truncated);
        assert_eq!(message.message_type(), Some(MessageType::Discover));

        // Value shorter than its declared length.
        let mut data = build_test_packet(MessageType::Discover, &[]);
        data.pop();
        data.extend_from_slice(&[OPT_LEASE_TIME, 4, 0, 0]);
        let message = decode_all(&data).unwrap();
        assert!(message.is_truncated);
        assert!(message.option(OPT_LEASE_TIME).is_none());
    }

    #[test]
    fn test_exhausted_without_end_sets_truncated() {
        let mut data = vec![0u8; FIXED_HEADER_SIZE + 4];
        data[0] = BOOTREQUEST;
        data[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);

        let message = decode_all(&data).unwrap();
        assert!(message.is_dhcp);
        assert!(message.is_truncated);
        assert!(message.options.is_empty());
    }

    #[test]
    fn test_pad_bytes_skipped() {
        let mut data = vec![0u8; FIXED_HEADER_SIZE + 16];
        data[0] = BOOTREQUEST;
        data[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
        // Eight PADs, then message type, then END.
        data[248] = OPT_MESSAGE_TYPE;
        data[249] = 1;
        data[250] = MessageType::Discover as u8;
        data[251] = CODE_END;
        data.truncate(252);

        let message = decode_all(&data).unwrap();
        assert_eq!(message.message_type(), Some(MessageType::Discover));
        assert!(!message.is_truncated);
    }

    #[test]
    fn test_repeated_code_concatenated() {
        let mut data = vec![0u8; FIXED_HEADER_SIZE];
        data[0] = BOOTREQUEST;
        data.extend_from_slice(&DHCP_MAGIC_COOKIE);
        data.extend_from_slice(&[77, 3, 1, 2, 3]);
        data.extend_from_slice(&[77, 2, 4, 5]);
        data.push(CODE_END);

        let message = decode_all(&data).unwrap();
        assert_eq!(message.option(77), Some(&[1u8, 2, 3, 4, 5][..]));
    }

    #[test]
    fn test_nonadjacent_repeated_code_concatenated() {
        let mut data = vec![0u8; FIXED_HEADER_SIZE];
        data[0] = BOOTREQUEST;
        data.extend_from_slice(&DHCP_MAGIC_COOKIE);
        data.extend_from_slice(&[77, 2, 1, 2]);
        data.extend_from_slice(&[12, 4, b'h', b'o', b's', b't']);
        data.extend_from_slice(&[77, 2, 3, 4]);
        data.push(CODE_END);

        let message = decode_all(&data).unwrap();
        assert_eq!(message.option(77), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(message.option(12), Some(&b"host"[..]));
    }

    #[test]
    fn test_padding_after_end_preserved() {
        let mut data = build_test_packet(MessageType::Discover, &[]);
        data.extend_from_slice(&[0, 0, 0, 7]);

        let message = decode_all(&data).unwrap();
        assert_eq!(message.padding, vec![0, 0, 0, 7]);

        let encoded = message.encode().unwrap();
        assert_eq!(decode_all(&encoded).unwrap(), message);
    }

    #[test]
    fn test_unknown_option_preserved() {
        let data = build_test_packet(MessageType::Discover, &[(200, &[0xDE, 0xAD, 0xBE, 0xEF])]);
        let message = decode_all(&data).unwrap();
        assert_eq!(message.option(200), Some(&[0xDE, 0xAD, 0xBE, 0xEF][..]));

        let encoded = message.encode().unwrap();
        assert_eq!(decode_all(&encoded).unwrap(), message);
    }

    #[test]
    fn test_encode_rejects_reserved_codes() {
        let mut message = DhcpMessage::default();
        message.options.insert(0, vec![1]);
        assert!(matches!(
            message.encode(),
            Err(Error::InvalidOption { code: 0, .. })
        ));

        let mut message = DhcpMessage::default();
        message.options.insert(255, vec![1]);
        assert!(matches!(
            message.encode(),
            Err(Error::InvalidOption { code: 255, .. })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_value() {
        let mut message = DhcpMessage::default();
        message.options.insert(43, vec![0u8; 256]);
        assert!(matches!(
            message.encode(),
            Err(Error::InvalidOption { code: 43, .. })
        ));
    }

    #[test]
    fn test_insert_option_validates() {
        let mut message = DhcpMessage::default();
        assert!(message.insert_option(0, vec![1]).is_err());
        assert!(message.insert_option(255, vec![1]).is_err());
        assert!(message.insert_option(12, vec![0u8; 256]).is_err());
        assert!(message.insert_option(12, b"host".to_vec()).is_ok());
        assert_eq!(message.option(12), Some(&b"host"[..]));
    }

    #[test]
    fn test_option_encode_order_is_ascending() {
        let mut message = DhcpMessage::default();
        message.insert_option(54, vec![10, 0, 0, 1]).unwrap();
        message.insert_option(1, vec![255, 255, 255, 0]).unwrap();
        message.insert_option(51, vec![0, 0, 14, 16]).unwrap();

        let encoded = message.encode().unwrap();
        let opts = &encoded[FIXED_HEADER_SIZE + 4..];
        assert_eq!(opts[0], 1);
        let after_mask = &opts[2 + 4..];
        assert_eq!(after_mask[0], 51);
        let after_lease = &after_mask[2 + 4..];
        assert_eq!(after_lease[0], 54);
    }

    #[test]
    fn test_reply_copies_request_fields() {
        let mut data = build_test_packet(MessageType::Discover, &[]);
        let giaddr = Ipv4Addr::new(192, 168, 2, 1);
        data[24..28].copy_from_slice(&giaddr.octets());
        let request = decode_all(&data).unwrap();

        let reply = DhcpMessage::reply_to(&request, MessageType::Offer);
        assert_eq!(reply.op, BOOTREPLY);
        assert_eq!(reply.xid, request.xid);
        assert_eq!(reply.flags, request.flags);
        assert_eq!(reply.giaddr, giaddr);
        assert_eq!(reply.chaddr, request.chaddr);
        assert_eq!(reply.htype, request.htype);
        assert_eq!(reply.hlen, request.hlen);
        assert_eq!(reply.message_type(), Some(MessageType::Offer));
    }

    #[test]
    fn test_chaddr_bytes_respects_hlen() {
        let mut data = build_test_packet(MessageType::Discover, &[]);
        data[1] = 6;
        data[2] = 4;

        let message = decode_all(&data).unwrap();
        assert_eq!(message.chaddr_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn test_oversized_hlen_roundtrips_and_accessor_clamps() {
        let mut data = build_test_packet(MessageType::Discover, &[]);
        data[2] = 20;

        let message = decode_all(&data).unwrap();
        assert_eq!(message.hlen, 20);
        assert_eq!(message.chaddr_bytes().len(), 16);

        let encoded = message.encode().unwrap();
        let reparsed = decode_all(&encoded).unwrap();
        assert_eq!(reparsed.hlen, 20);
        assert_eq!(reparsed, message);
    }

    #[test]
    fn test_field_offsets() {
        let mut data = vec![0u8; FIXED_HEADER_SIZE + 5];
        data[0] = BOOTREQUEST;
        data[1] = HTYPE_ETHERNET;
        data[2] = HLEN_ETHERNET;
        data[3] = 5;
        data[4..8].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        data[8..10].copy_from_slice(&1234u16.to_be_bytes());
        data[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
        data[12..16].copy_from_slice(&[10, 0, 0, 1]);
        data[16..20].copy_from_slice(&[10, 0, 0, 2]);
        data[20..24].copy_from_slice(&[10, 0, 0, 3]);
        data[24..28].copy_from_slice(&[10, 0, 0, 4]);
        data[28..34].copy_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        data[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
        data[240] = CODE_END;
        data.truncate(241);

        let message = decode_all(&data).unwrap();
        assert_eq!(message.hops, 5);
        assert_eq!(message.xid, 0xDEADBEEF);
        assert_eq!(message.secs, 1234);
        assert_eq!(message.flags, 0x8000);
        assert_eq!(message.ciaddr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(message.yiaddr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(message.siaddr, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(message.giaddr, Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(&message.chaddr[..6], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    }

    #[test]
    fn test_encode_produces_correct_offsets() {
        let mut message = DhcpMessage {
            op: BOOTREPLY,
            hops: 3,
            xid: 0x12345678,
            secs: 999,
            flags: 0x8000,
            ciaddr: Ipv4Addr::new(192, 168, 1, 10),
            yiaddr: Ipv4Addr::new(192, 168, 1, 20),
            siaddr: Ipv4Addr::new(192, 168, 1, 1),
            giaddr: Ipv4Addr::new(192, 168, 2, 1),
            ..DhcpMessage::default()
        };
        message.chaddr[..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        message
            .insert_option(OPT_MESSAGE_TYPE, vec![MessageType::Offer as u8])
            .unwrap();

        let encoded = message.encode().unwrap();

        assert_eq!(encoded[0], BOOTREPLY);
        assert_eq!(encoded[3], 3);
        assert_eq!(&encoded[4..8], &0x12345678u32.to_be_bytes());
        assert_eq!(&encoded[8..10], &999u16.to_be_bytes());
        assert_eq!(&encoded[10..12], &0x8000u16.to_be_bytes());
        assert_eq!(&encoded[12..16], &[192, 168, 1, 10]);
        assert_eq!(&encoded[16..20], &[192, 168, 1, 20]);
        assert_eq!(&encoded[20..24], &[192, 168, 1, 1]);
        assert_eq!(&encoded[24..28], &[192, 168, 2, 1]);
        assert_eq!(&encoded[28..34], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(&encoded[236..240], &DHCP_MAGIC_COOKIE);
        assert_eq!(encoded[encoded.len() - 1], CODE_END);
    }

    #[test]
    fn test_metadata_excluded_from_equality() {
        let data = build_test_packet(MessageType::Discover, &[]);
        let mut a = decode_all(&data).unwrap();
        let b = decode_all(&data).unwrap();

        a.destination = Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 68));
        a.comment = Some("relayed".to_string());
        assert_eq!(a, b);
    }
}
