//! Error taxonomy for the wire protocol and the request cycle.
//!
//! Framing errors and I/O errors always tear the connection down. Protocol
//! errors carry an explicit keep-alive discriminant chosen at the raising
//! site: the worker loop inspects it instead of an error class hierarchy.

use thiserror::Error;

/// Corrupt byte stream. Always connection-fatal.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FramingError {
    #[error("bad packet magic 0x{0:02x}{1:02x}")]
    BadMagic(u8, u8),
    #[error("stream ended inside a packet")]
    Truncated,
    #[error("socket closed")]
    Closed,
}

/// Well-framed packet with content the connector cannot accept.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("unknown prefix code 0x{0:02x}")]
    UnknownPrefix(u8),
    #[error("unknown method index {0}")]
    UnknownMethod(u8),
    #[error("unknown header code 0xa0{0:02x}")]
    UnknownHeaderCode(u8),
    #[error("unknown attribute code 0x{0:02x}")]
    UnknownAttribute(u8),
    #[error("declared length {declared} runs past payload end ({available} bytes left)")]
    LengthOverrun { declared: usize, available: usize },
    #[error("declared payload length {0} exceeds the frame limit")]
    Oversized(usize),
    #[error("body chunk larger than the frame budget: {0} bytes")]
    ChunkOverBudget(usize),
    #[error("string is not valid {encoding}")]
    BadEncoding { encoding: &'static str },
    #[error("malformed cookie segment {0:?}")]
    MalformedCookie(String),
    #[error("packet arrived with the connector's own magic")]
    WrongDirection,
    #[error("response requested while connection is idle")]
    ResponseWhileIdle,
}

impl ProtocolError {
    /// Wrap with keep-alive semantics: log, answer best-effort, keep the socket.
    pub fn keep_alive(self) -> CycleError {
        CycleError::Protocol {
            source: self,
            keep_alive: true,
        }
    }

    /// Wrap as connection-fatal.
    pub fn fatal(self) -> CycleError {
        CycleError::Protocol {
            source: self,
            keep_alive: false,
        }
    }
}

/// Everything that can end one request cycle early.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("framing: {0}")]
    Framing(#[from] FramingError),
    #[error("protocol: {source}")]
    Protocol {
        #[source]
        source: ProtocolError,
        keep_alive: bool,
    },
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl CycleError {
    /// True when the worker loop may keep the socket and await the next
    /// forward request. Framing and I/O failures never qualify.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            CycleError::Protocol {
                keep_alive: true,
                ..
            }
        )
    }
}
