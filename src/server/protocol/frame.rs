//! AJP Binary Protocol: packet types and constants
//!
//! Packet layout (both directions):
//! [Magic: 2 bytes] [PayloadLen: 2 bytes (BE)] [Payload: PayloadLen bytes]
//!
//! Proxy -> connector payload starts with a prefix code when a new request
//! cycle is expected (forward request, cping, shutdown). Body chunk packets
//! carry no prefix: [ChunkLen: 2 bytes (BE)] [ChunkLen bytes], interpreted
//! positionally while a body transfer is in progress.
//!
//! Connector -> proxy payload always starts with a prefix code
//! (send headers, send body chunk, get body chunk, end response, cpong).

use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use once_cell::sync::Lazy;
use std::collections::HashMap;

// ========================================
// MAGIC BYTES
// ========================================
pub const MAGIC_FROM_PROXY: [u8; 2] = [0x12, 0x34];
pub const MAGIC_TO_PROXY: [u8; 2] = [0x41, 0x42]; // "AB"

// ========================================
// SIZE LIMITS
// ========================================
pub const MAX_PACKET_SIZE: usize = 8192;
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - PacketHeader::SIZE; // 8188

/// Largest body slice that fits in one chunk packet, leaving room for the
/// prefix byte and the 2-byte chunk length.
pub const BODY_CHUNK_BUDGET: usize = MAX_PAYLOAD_SIZE - 3;

// ========================================
// PREFIX CODES (proxy -> connector)
// ========================================
pub const PREFIX_FORWARD_REQUEST: u8 = 0x02;
pub const PREFIX_SHUTDOWN: u8 = 0x07;
pub const PREFIX_CPING: u8 = 0x0A;

// ========================================
// PREFIX CODES (connector -> proxy)
// ========================================
pub const PREFIX_SEND_BODY_CHUNK: u8 = 0x03;
pub const PREFIX_SEND_HEADERS: u8 = 0x04;
pub const PREFIX_END_RESPONSE: u8 = 0x05;
pub const PREFIX_GET_BODY_CHUNK: u8 = 0x06;
pub const PREFIX_CPONG: u8 = 0x09;

// ========================================
// FORWARD REQUEST ENCODING MARKERS
// ========================================

/// Method byte value meaning "literal method string follows".
pub const METHOD_LITERAL: u8 = 0xFF;

/// High byte marking a coded (well-known) header name.
pub const HEADER_CODE_MARKER: u8 = 0xA0;

/// Terminates the attribute list.
pub const ATTRIBUTE_LIST_END: u8 = 0xFF;

// ========================================
// METHOD TABLE (1-based index on the wire)
// ========================================
pub const REQUEST_METHODS: [&str; 27] = [
    "OPTIONS",
    "GET",
    "HEAD",
    "POST",
    "PUT",
    "DELETE",
    "TRACE",
    "PROPFIND",
    "PROPPATCH",
    "MKCOL",
    "COPY",
    "MOVE",
    "LOCK",
    "UNLOCK",
    "ACL",
    "REPORT",
    "VERSION-CONTROL",
    "CHECKIN",
    "CHECKOUT",
    "UNCHECKOUT",
    "SEARCH",
    "MKWORKSPACE",
    "UPDATE",
    "LABEL",
    "MERGE",
    "BASELINE-CONTROL",
    "MKACTIVITY",
];

/// Resolve a 1-based wire index to a method name.
pub fn method_name(index: u8) -> Option<&'static str> {
    if index == 0 {
        return None;
    }
    REQUEST_METHODS.get(index as usize - 1).copied()
}

// ========================================
// REQUEST HEADER CODES (0xA001 - 0xA00E)
// ========================================
pub const REQUEST_HEADERS: [&str; 14] = [
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "authorization",
    "connection",
    "content-type",
    "content-length",
    "cookie",
    "cookie2",
    "host",
    "pragma",
    "referer",
    "user-agent",
];

/// Resolve the low byte of a coded request header (0x01..=0x0E).
pub fn request_header_name(code: u8) -> Option<&'static str> {
    if code == 0 {
        return None;
    }
    REQUEST_HEADERS.get(code as usize - 1).copied()
}

// ========================================
// RESPONSE HEADER CODES (0xA001 - 0xA00B)
// ========================================
pub const RESPONSE_HEADERS: [&str; 11] = [
    "Content-Type",
    "Content-Language",
    "Content-Length",
    "Date",
    "Last-Modified",
    "Location",
    "Set-Cookie",
    "Set-Cookie2",
    "Servlet-Engine",
    "Status",
    "WWW-Authenticate",
];

static RESPONSE_HEADER_CODES: Lazy<HashMap<String, u8>> = Lazy::new(|| {
    RESPONSE_HEADERS
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_ascii_lowercase(), (i + 1) as u8))
        .collect()
});

/// Low byte of the coded form of a well-known response header, if any.
pub fn response_header_code(name: &str) -> Option<u8> {
    RESPONSE_HEADER_CODES
        .get(&name.to_ascii_lowercase())
        .copied()
}

// ========================================
// ATTRIBUTE CODES
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttributeCode {
    Context = 0x01,
    ServletPath = 0x02,
    RemoteUser = 0x03,
    AuthType = 0x04,
    QueryString = 0x05,
    JvmRoute = 0x06,
    SslCert = 0x07,
    SslCipher = 0x08,
    SslSession = 0x09,
    /// Value is a 2-byte integer, not a string.
    SslKeySize = 0x0B,
    Secret = 0x0C,
    StoredMethod = 0x0D,
}

impl AttributeCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(AttributeCode::Context),
            0x02 => Some(AttributeCode::ServletPath),
            0x03 => Some(AttributeCode::RemoteUser),
            0x04 => Some(AttributeCode::AuthType),
            0x05 => Some(AttributeCode::QueryString),
            0x06 => Some(AttributeCode::JvmRoute),
            0x07 => Some(AttributeCode::SslCert),
            0x08 => Some(AttributeCode::SslCipher),
            0x09 => Some(AttributeCode::SslSession),
            0x0B => Some(AttributeCode::SslKeySize),
            0x0C => Some(AttributeCode::Secret),
            0x0D => Some(AttributeCode::StoredMethod),
            _ => None,
        }
    }
}

// ========================================
// PACKET HEADER
// ========================================

/// Which side of the wire a packet came from, decided by its magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    FromProxy,
    ToProxy,
}

/// Fixed-size header: [Magic: 2] [PayloadLen: 2 (BE)]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PacketHeader {
    pub magic: [u8; 2],
    pub payload_len: [u8; 2],
}

impl PacketHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn payload_len(&self) -> u16 {
        u16::from_be_bytes(self.payload_len)
    }

    pub fn direction(&self) -> Option<PacketDirection> {
        match self.magic {
            MAGIC_FROM_PROXY => Some(PacketDirection::FromProxy),
            MAGIC_TO_PROXY => Some(PacketDirection::ToProxy),
            _ => None,
        }
    }
}

// ========================================
// PACKET TYPES
// ========================================

/// Inbound packet: decoded by AjpCodec from the socket.
#[derive(Debug)]
pub struct InboundPacket {
    pub direction: PacketDirection,
    pub payload: Bytes,
}

/// Outbound message: encoded by AjpCodec to the socket, connector -> proxy.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    SendHeaders {
        status: u16,
        reason: String,
        headers: Vec<(String, String)>,
    },
    SendBodyChunk(Bytes),
    GetBodyChunk {
        len: u16,
    },
    EndResponse {
        reuse: bool,
    },
    CPong,
}
