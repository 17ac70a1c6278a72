//! Error handling for the IEC 60870-5-104 engine
//!
//! All fallible operations in this crate return [`Result`] with [`Iec104Error`].
//! The variants fall into four groups that callers treat differently:
//!
//! - **Codec errors** (`ShortFrame`, `BadStart`, `BadLength`, `UnknownTypeId`,
//!   `BadCount`, `Truncated`, `BadTimestamp`) — raised while encoding or
//!   decoding frames. When raised on *received* traffic the connection treats
//!   the peer as misbehaving and tears the link down.
//! - **Link errors** (`ConnectTimeout`, `TransportIo`, `HandshakeTimeout`,
//!   `SequenceViolation`, `WindowExceeded`, `PeerStopped`) — surfaced through
//!   the connection event stream when the link dies.
//! - **Command errors** (`NotConnected`, `Duplicate`, `Rejected`, `TimedOut`,
//!   `NotSupported`) — returned to the command submitter without disturbing
//!   the link.
//! - **Configuration errors** (`InvalidAddress`, `OutOfRange`, `ConfigError`).

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Iec104Error>;

/// Unified error type for the IEC 60870-5-104 engine
#[derive(Debug, Clone, Error)]
pub enum Iec104Error {
    /// Frame shorter than the fixed APCI header
    #[error("frame too short: {0} bytes")]
    ShortFrame(usize),

    /// First octet was not the 0x68 start byte
    #[error("bad start byte: expected 0x68, got 0x{0:02X}")]
    BadStart(u8),

    /// APDU length octet outside 4..=253, or frame/body size mismatch
    #[error("bad APDU length: {0}")]
    BadLength(String),

    /// Type identifier not implemented by this engine
    #[error("unknown type identifier: {0}")]
    UnknownTypeId(u8),

    /// VSQ object count of zero, or count inconsistent with the frame size
    #[error("bad object count: {0}")]
    BadCount(String),

    /// ASDU ended before the declared objects were complete
    #[error("truncated ASDU: {0}")]
    Truncated(String),

    /// CP56Time2a / CP16Time2a field out of range or flagged invalid
    #[error("bad timestamp: {0}")]
    BadTimestamp(String),

    /// TCP connect did not complete within t0
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// Socket-level read/write failure
    #[error("transport I/O error: {0}")]
    TransportIo(String),

    /// Peer did not confirm within t1 (STARTDT/STOPDT/TESTFR or I-frame ack)
    #[error("handshake timeout: {0}")]
    HandshakeTimeout(String),

    /// Received send sequence number did not match the expected value
    #[error("sequence violation: {0}")]
    SequenceViolation(String),

    /// Peer acknowledgement outside the open send window
    #[error("send window exceeded: {0}")]
    WindowExceeded(String),

    /// Peer initiated STOPDT while the link was active
    #[error("peer stopped data transfer")]
    PeerStopped,

    /// Operation requires an active link
    #[error("not connected")]
    NotConnected,

    /// A command for the same (COA, IOA, TypeID) is already in flight
    #[error("duplicate command in flight for {0}")]
    Duplicate(String),

    /// Outstation answered with a negative confirmation (P/N = 1)
    #[error("command rejected by outstation: {0}")]
    Rejected(String),

    /// No confirmation arrived within the configured bound
    #[error("operation timed out: {0}")]
    TimedOut(String),

    /// Requested operation has no IEC 104 representation
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Address string or field failed validation
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Numeric field outside its permitted range
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// Invalid or inconsistent configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Internal channel to the I/O task closed unexpectedly
    #[error("internal channel closed: {0}")]
    ChannelClosed(String),
}

impl Iec104Error {
    /// Whether this error class tears the link down when raised on received
    /// traffic. Codec and sequencing errors mean the peer is misbehaving;
    /// the connection drops to `Broken` and lets the reader reconnect.
    pub fn is_link_fatal(&self) -> bool {
        matches!(
            self,
            Iec104Error::ShortFrame(_)
                | Iec104Error::BadStart(_)
                | Iec104Error::BadLength(_)
                | Iec104Error::UnknownTypeId(_)
                | Iec104Error::BadCount(_)
                | Iec104Error::Truncated(_)
                | Iec104Error::SequenceViolation(_)
                | Iec104Error::WindowExceeded(_)
                | Iec104Error::TransportIo(_)
                | Iec104Error::HandshakeTimeout(_)
        )
    }

    /// Whether a reconnect attempt is a reasonable response to this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Iec104Error::ConnectTimeout(_)
                | Iec104Error::TransportIo(_)
                | Iec104Error::HandshakeTimeout(_)
                | Iec104Error::SequenceViolation(_)
                | Iec104Error::WindowExceeded(_)
                | Iec104Error::PeerStopped
                | Iec104Error::NotConnected
        )
    }
}

impl From<std::io::Error> for Iec104Error {
    fn from(err: std::io::Error) -> Self {
        Iec104Error::TransportIo(err.to_string())
    }
}
