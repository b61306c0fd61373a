//! Application layer interface.
//!
//! The connector terminates the wire protocol and hands each parsed request
//! to an [`Application`]. The call is synchronous from the worker's point of
//! view; whatever it returns is serialized back to the proxy.

use bytes::Bytes;

use crate::server::protocol::{Cookie, ForwardRequest, RequestAttributes};

// ========================================
// REQUEST / RESPONSE
// ========================================

/// One fully-assembled inbound request: parsed forward-request fields plus
/// the collected body and, for form posts, the decoded parameters.
#[derive(Debug, Clone)]
pub struct AjpRequest {
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
    pub body: Bytes,
    pub parameters: Vec<(String, String)>,
}

impl AjpRequest {
    pub(crate) fn from_forward(fw: ForwardRequest) -> Self {
        Self {
            method: fw.method,
            protocol: fw.protocol,
            request_uri: fw.request_uri,
            remote_addr: fw.remote_addr,
            remote_host: fw.remote_host,
            server_name: fw.server_name,
            server_port: fw.server_port,
            is_secure: fw.is_secure,
            headers: fw.headers,
            attributes: fw.attributes,
            cookies: fw.cookies,
            body: Bytes::new(),
            parameters: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AjpResponse {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl AjpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Reason phrase, defaulted from the status code when unset.
    pub fn reason_phrase(&self) -> &str {
        self.reason.as_deref().unwrap_or(match self.status {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "",
        })
    }
}

// ========================================
// APPLICATION TRAIT
// ========================================

/// The in-process collaborator that produces responses.
pub trait Application: Send + Sync {
    fn handle(&self, request: &AjpRequest) -> AjpResponse;
}

/// Minimal built-in application: 200 with an empty body on `/ping`,
/// 404 elsewhere. Used by the binary and by the integration tests.
pub struct PingApplication;

impl Application for PingApplication {
    fn handle(&self, request: &AjpRequest) -> AjpResponse {
        if request.request_uri == "/ping" {
            AjpResponse::new(200)
        } else {
            AjpResponse::new(404)
        }
    }
}
