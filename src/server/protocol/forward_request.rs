//! Forward request parsing: the packet that opens one request cycle.
//!
//! Payload layout (after the prefix byte):
//! [method byte] [protocol] [request URI] [remote addr] [remote host]
//! [server name] [server port: u16] [secure: u8] [header count: u16]
//! [headers...] [attributes... terminated by 0xFF]

use bytes::Bytes;

use super::errors::ProtocolError;
use super::frame::{
    method_name, request_header_name, AttributeCode, ATTRIBUTE_LIST_END, HEADER_CODE_MARKER,
    METHOD_LITERAL,
};
use crate::server::payload_cursor::{PayloadCursor, WireEncoding};

// ========================================
// TYPES
// ========================================

/// Protocol-level request attributes carried alongside the headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestAttributes {
    pub context: Option<String>,
    pub servlet_path: Option<String>,
    pub remote_user: Option<String>,
    pub auth_type: Option<String>,
    pub query_string: Option<String>,
    pub jvm_route: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_cipher: Option<String>,
    pub ssl_session: Option<String>,
    pub ssl_key_size: Option<u16>,
    pub secret: Option<String>,
    pub stored_method: Option<String>,
}

/// One cookie from a `cookie` header, RFC 2109 flavor.
#[derive(Debug, Clone, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub version: u8,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRequest {
    pub method: String,
    pub protocol: String,
    pub request_uri: String,
    pub remote_addr: String,
    pub remote_host: String,
    pub server_name: String,
    pub server_port: u16,
    pub is_secure: bool,
    pub headers: Vec<(String, String)>,
    pub attributes: RequestAttributes,
    pub cookies: Vec<Cookie>,
}

// ========================================
// PARSING
// ========================================

impl ForwardRequest {
    /// Parse the payload that follows the forward-request prefix byte.
    pub fn parse(payload: Bytes, encoding: WireEncoding) -> Result<Self, ProtocolError> {
        let mut cur = PayloadCursor::new(payload, encoding);

        let method_byte = cur.read_u8()?;
        let method = if method_byte == METHOD_LITERAL {
            cur.read_string()?
        } else {
            method_name(method_byte)
                .ok_or(ProtocolError::UnknownMethod(method_byte))?
                .to_string()
        };

        let protocol = cur.read_string()?;
        let request_uri = cur.read_string()?;
        let remote_addr = cur.read_string()?;
        let remote_host = cur.read_string()?;
        let server_name = cur.read_string()?;
        let server_port = cur.read_u16()?;
        let is_secure = cur.read_u8()? != 0;

        let num_headers = cur.read_u16()?;
        let mut headers = Vec::with_capacity(num_headers as usize);
        for _ in 0..num_headers {
            let name = read_header_name(&mut cur)?;
            let value = cur.read_string()?;
            headers.push((name, value));
        }

        let attributes = read_attributes(&mut cur)?;

        let mut cookies = Vec::new();
        for (name, value) in &headers {
            if name.eq_ignore_ascii_case("cookie") {
                cookies.extend(parse_cookie_header(value)?);
            }
        }

        Ok(Self {
            method,
            protocol,
            request_uri,
            remote_addr,
            remote_host,
            server_name,
            server_port,
            is_secure,
            headers,
            attributes,
            cookies,
        })
    }

    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared content length, if present and numeric.
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Whether the headers announce a body with no declared length.
    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Header name: either `0xA0 <code>` or `<u16 len><literal bytes>`. The two
/// leading bytes are read as one u16 and disambiguated by the high byte.
fn read_header_name(cur: &mut PayloadCursor) -> Result<String, ProtocolError> {
    let word = cur.read_u16()?;
    let hi = (word >> 8) as u8;
    let lo = (word & 0xFF) as u8;
    if hi == HEADER_CODE_MARKER {
        return request_header_name(lo)
            .map(str::to_string)
            .ok_or(ProtocolError::UnknownHeaderCode(lo));
    }
    // Literal names go through the same unescape + charset path as values.
    let raw = cur.read_bytes(word as usize)?;
    cur.encoding().decode(&raw)
}

fn read_attributes(cur: &mut PayloadCursor) -> Result<RequestAttributes, ProtocolError> {
    let mut attrs = RequestAttributes::default();
    loop {
        let code = cur.read_u8()?;
        if code == ATTRIBUTE_LIST_END {
            return Ok(attrs);
        }
        match AttributeCode::from_u8(code).ok_or(ProtocolError::UnknownAttribute(code))? {
            AttributeCode::Context => attrs.context = Some(cur.read_string()?),
            AttributeCode::ServletPath => attrs.servlet_path = Some(cur.read_string()?),
            AttributeCode::RemoteUser => attrs.remote_user = Some(cur.read_string()?),
            AttributeCode::AuthType => attrs.auth_type = Some(cur.read_string()?),
            AttributeCode::QueryString => attrs.query_string = Some(cur.read_string()?),
            AttributeCode::JvmRoute => attrs.jvm_route = Some(cur.read_string()?),
            AttributeCode::SslCert => attrs.ssl_cert = Some(cur.read_string()?),
            AttributeCode::SslCipher => attrs.ssl_cipher = Some(cur.read_string()?),
            AttributeCode::SslSession => attrs.ssl_session = Some(cur.read_string()?),
            AttributeCode::SslKeySize => attrs.ssl_key_size = Some(cur.read_u16()?),
            AttributeCode::Secret => attrs.secret = Some(cur.read_string()?),
            AttributeCode::StoredMethod => attrs.stored_method = Some(cur.read_string()?),
        }
    }
}

// ========================================
// COOKIES
// ========================================

/// Parse one `cookie` header value into individual cookies.
///
/// `$Version` opens the header and sets the version for every cookie that
/// follows; `$Path` / `$Domain` attach to the cookie preceding them.
pub fn parse_cookie_header(value: &str) -> Result<Vec<Cookie>, ProtocolError> {
    let mut cookies: Vec<Cookie> = Vec::new();
    let mut version: u8 = 0;

    for segment in value.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (name, val) = segment
            .split_once('=')
            .ok_or_else(|| ProtocolError::MalformedCookie(segment.to_string()))?;
        let name = name.trim();
        let val = val.trim().trim_matches('"');

        if let Some(special) = name.strip_prefix('$') {
            if special.eq_ignore_ascii_case("version") {
                version = val.parse().unwrap_or(0);
            } else if special.eq_ignore_ascii_case("path") {
                if let Some(last) = cookies.last_mut() {
                    last.path = Some(val.to_string());
                }
            } else if special.eq_ignore_ascii_case("domain") {
                if let Some(last) = cookies.last_mut() {
                    last.domain = Some(val.to_string());
                }
            }
            // Unknown $-attributes are skipped, same as unrecognized versions.
            continue;
        }

        cookies.push(Cookie {
            name: name.to_string(),
            value: val.to_string(),
            path: None,
            domain: None,
            version,
        });
    }

    Ok(cookies)
}
