//! Error types for the DHCP server core.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. The taxonomy separates
//! per-datagram failures (bad packet, invalid option) from configuration
//! failures (conflicts, bad filters) and allocator failures (exhaustion,
//! transaction trouble): a per-datagram error is always contained to that
//! datagram's handling.

use std::net::Ipv4Addr;

/// Errors that can occur in the DHCP core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config objects).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP datagram.
    ///
    /// Covers datagrams shorter than the fixed header, larger than any
    /// realistic MTU, or with an inconsistent fixed header. Fatal to the
    /// single datagram; no reply is sent.
    #[error("Bad DHCP packet: {0}")]
    BadPacket(String),

    /// Decode was asked to read outside the supplied buffer.
    ///
    /// Distinct from [`BadPacket`](Self::BadPacket): the caller's
    /// offset/length did not fit the buffer it handed us, so the bytes
    /// were never inspected.
    #[error("Decode bounds out of range: offset {offset} + length {length} > buffer {available}")]
    BufferBounds {
        offset: usize,
        length: usize,
        available: usize,
    },

    /// Encode-time rejection of an option.
    ///
    /// Codes 0 (PAD) and 255 (END) are reserved and may never be stored
    /// as options, and a single option value cannot exceed 255 bytes.
    /// The orchestrator drops the response rather than send a malformed
    /// packet.
    #[error("Invalid DHCP option {code}: {reason}")]
    InvalidOption { code: u8, reason: String },

    /// Invalid CIDR, mask, or address range.
    #[error("Invalid address argument: {0}")]
    InvalidAddress(String),

    /// Topology load conflict.
    ///
    /// A relay giaddr was claimed by two different subnets. Fatal at
    /// load time; the previous topology snapshot stays active.
    #[error("Subnet conflict: giaddr {0} is already claimed by another subnet")]
    ConfigConflict(Ipv4Addr),

    /// Invalid configuration object.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A filter could not be constructed (empty Nand list, bad regex).
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// The pool has no free bubble left.
    #[error("Pool {0} is exhausted")]
    PoolExhausted(String),

    /// A claimed address cannot be confirmed for this client.
    ///
    /// The REQUEST path answers this with a NAK.
    #[error("Address {0} is not usable by this client")]
    AddressNotUsable(Ipv4Addr),

    /// An allocation transaction lost a conflict and may be retried.
    #[error("Allocation conflict: {0}")]
    AllocationConflict(String),

    /// The backing lease store is unreachable; retryable.
    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(String),
}

impl Error {
    /// True for allocator failures the orchestrator may retry once.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AllocationConflict(_) | Self::StoreUnavailable(_)
        )
    }
}

/// A specialized Result type for DHCP core operations.
pub type Result<T> = std::result::Result<T, Error>;
