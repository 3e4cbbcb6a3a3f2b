//! Edge wire protocol constants.
//!
//! Content types and header ids are assigned by the edge protocol and must
//! not change.

/// Frame magic (channel v2)
pub const MAGIC: [u8; 4] = [0x03, 0x06, 0x09, 0x0C];

/// Fixed frame header: magic, content type, sequence, headers length, body length
pub const FRAME_HEADER_SIZE: usize = 20;

/// Maximum number of headers accepted in one frame
pub const MAX_HEADERS: usize = 256;

/// Maximum encoded size of the headers section
pub const MAX_HEADERS_LEN: usize = 64 * 1024;

/// Maximum body size
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Header ids
pub mod header {
    /// Sequence number of the request this frame answers
    pub const REPLY_FOR: i32 = 1;
    /// Boolean outcome of a RESULT frame
    pub const RESULT_SUCCESS: i32 = 2;
    /// Listener address offered in HELLO
    pub const HELLO_LISTENER: i32 = 3;
    /// Virtual connection id
    pub const CONN_ID: i32 = 1000;
    /// Per-connection data sequence
    pub const SEQ: i32 = 1001;
    /// API or network session token
    pub const SESSION_TOKEN: i32 = 1002;
    /// Key agreement public key or secret stream header
    pub const PUBLIC_KEY: i32 = 1003;
    /// Terminator cost
    pub const COST: i32 = 1004;
    /// Terminator precedence
    pub const PRECEDENCE: i32 = 1005;
}

/// Message content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Channel hello
    Hello,
    /// Keepalive
    Ping,
    /// Generic reply
    Result,
    /// Latency check
    Latency,
    /// Open a virtual connection
    Connect,
    /// Virtual connection accepted
    StateConnected,
    /// Virtual connection closed or refused
    StateClosed,
    /// Virtual connection payload
    Data,
    /// Hosted-side dial request
    Dial,
    /// Hosted-side dial accepted
    DialSuccess,
    /// Hosted-side dial refused
    DialFailed,
    /// Register a terminator
    Bind,
    /// Remove a terminator
    Unbind,
    /// Any value this SDK does not interpret
    Other(i32),
}

impl From<i32> for ContentType {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Hello,
            1 => Self::Ping,
            2 => Self::Result,
            3 => Self::Latency,
            60783 => Self::Connect,
            60784 => Self::StateConnected,
            60785 => Self::StateClosed,
            60786 => Self::Data,
            60787 => Self::Dial,
            60788 => Self::DialSuccess,
            60789 => Self::DialFailed,
            60790 => Self::Bind,
            60791 => Self::Unbind,
            other => Self::Other(other),
        }
    }
}

impl From<ContentType> for i32 {
    fn from(value: ContentType) -> Self {
        match value {
            ContentType::Hello => 0,
            ContentType::Ping => 1,
            ContentType::Result => 2,
            ContentType::Latency => 3,
            ContentType::Connect => 60783,
            ContentType::StateConnected => 60784,
            ContentType::StateClosed => 60785,
            ContentType::Data => 60786,
            ContentType::Dial => 60787,
            ContentType::DialSuccess => 60788,
            ContentType::DialFailed => 60789,
            ContentType::Bind => 60790,
            ContentType::Unbind => 60791,
            ContentType::Other(v) => v,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(v) => write!(f, "Other({v})"),
            known => write!(f, "{known:?}"),
        }
    }
}
