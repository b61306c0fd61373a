//! Shared fixtures: a proxy-side wire client and connector bootstrap.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ajpd::application::{AjpRequest, AjpResponse, Application};
use ajpd::config::{Config, PoolConfig, ProtocolConfig, ServerConfig, WatchdogConfig};
use ajpd::server::payload_cursor::WireEncoding;
use ajpd::server::protocol::{
    ATTRIBUTE_LIST_END, MAGIC_FROM_PROXY, MAGIC_TO_PROXY, PREFIX_CPING, PREFIX_CPONG,
    PREFIX_END_RESPONSE, PREFIX_FORWARD_REQUEST, PREFIX_GET_BODY_CHUNK, PREFIX_SEND_BODY_CHUNK,
    PREFIX_SEND_HEADERS, PREFIX_SHUTDOWN, RESPONSE_HEADERS,
};
use ajpd::{Connector, InMemorySessionStore};

pub const ROUTE_TAG: &str = "node1";

// ========================================
// CONNECTOR BOOTSTRAP
// ========================================

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            acceptors: 1,
            log_level: "error".to_string(),
            route_tag: ROUTE_TAG.to_string(),
        },
        pools: PoolConfig {
            workers: 4,
            connections: 4,
            handlers: 4,
        },
        watchdog: WatchdogConfig {
            interval_ms: 60_000,
            max_running_ms: 60_000,
            recovery_enabled: false,
        },
        protocol: ProtocolConfig {
            encoding: WireEncoding::Utf8,
            session_ttl_secs: 1800,
        },
    }
}

pub fn test_sessions() -> Arc<InMemorySessionStore> {
    Arc::new(InMemorySessionStore::new(Duration::from_secs(1800)))
}

/// Boot a connector on an ephemeral port. Keep the returned value alive for
/// the duration of the test.
pub async fn start_connector(
    app: Arc<dyn Application>,
    sessions: Arc<InMemorySessionStore>,
) -> (Connector, SocketAddr) {
    let mut connector = Connector::new(test_config(), app, sessions);
    connector.start().await.expect("connector should bind");
    let addr = connector.local_addr().expect("running connector has an address");
    (connector, addr)
}

/// Application that records the last request it saw and answers with a
/// preconfigured response.
pub struct CaptureApplication {
    pub response: AjpResponse,
    pub last: Mutex<Option<AjpRequest>>,
}

impl CaptureApplication {
    pub fn new(response: AjpResponse) -> Arc<Self> {
        Arc::new(Self {
            response,
            last: Mutex::new(None),
        })
    }

    pub fn last_request(&self) -> Option<AjpRequest> {
        self.last.lock().clone()
    }
}

impl Application for CaptureApplication {
    fn handle(&self, request: &AjpRequest) -> AjpResponse {
        *self.last.lock() = Some(request.clone());
        self.response.clone()
    }
}

// ========================================
// PROXY-SIDE CLIENT
// ========================================

/// Minimal proxy side of the wire protocol, enough to drive scenarios.
pub struct ProxyClient {
    stream: TcpStream,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFrame {
    SendHeaders {
        status: u16,
        reason: String,
        headers: Vec<(String, String)>,
    },
    SendBodyChunk(Vec<u8>),
    GetBodyChunk {
        len: u16,
    },
    EndResponse {
        reuse: bool,
    },
    CPong,
}

impl ProxyClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to connector");
        Self { stream }
    }

    /// Frame a payload with the proxy-side magic and send it.
    pub async fn send_frame(&mut self, payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_slice(&MAGIC_FROM_PROXY);
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);
        self.stream.write_all(&buf).await.expect("write frame");
    }

    /// Send raw bytes with no framing (for corrupt-stream scenarios).
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw bytes");
    }

    pub async fn send_body_chunk(&mut self, data: &[u8]) {
        let mut payload = BytesMut::with_capacity(2 + data.len());
        payload.put_u16(data.len() as u16);
        payload.put_slice(data);
        self.send_frame(&payload).await;
    }

    pub async fn send_cping(&mut self) {
        self.send_frame(&[PREFIX_CPING]).await;
    }

    pub async fn send_shutdown(&mut self) {
        self.send_frame(&[PREFIX_SHUTDOWN]).await;
    }

    /// Next connector->proxy frame, or None on a closed connection.
    pub async fn read_frame(&mut self) -> Option<ResponseFrame> {
        let mut header = [0u8; 4];
        if self.stream.read_exact(&mut header).await.is_err() {
            return None;
        }
        assert_eq!(&header[..2], &MAGIC_TO_PROXY, "response frame magic");
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len];
        if self.stream.read_exact(&mut payload).await.is_err() {
            return None;
        }
        Some(parse_response(&payload))
    }

    /// Read frames until EndResponse (inclusive) and return them all.
    pub async fn read_response(&mut self) -> Vec<ResponseFrame> {
        let mut frames = Vec::new();
        loop {
            match self.read_frame().await {
                Some(frame) => {
                    let done = matches!(frame, ResponseFrame::EndResponse { .. });
                    frames.push(frame);
                    if done {
                        return frames;
                    }
                }
                None => return frames,
            }
        }
    }
}

fn parse_response(payload: &[u8]) -> ResponseFrame {
    match payload[0] {
        PREFIX_SEND_HEADERS => {
            let mut pos = 1;
            let status = read_u16(payload, &mut pos);
            let reason = read_string(payload, &mut pos);
            let count = read_u16(payload, &mut pos);
            let mut headers = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let word = read_u16(payload, &mut pos);
                let name = if word >> 8 == 0xA0 {
                    RESPONSE_HEADERS[(word & 0xFF) as usize - 1].to_string()
                } else {
                    let raw = &payload[pos..pos + word as usize];
                    pos += word as usize;
                    String::from_utf8(raw.to_vec()).expect("header name utf-8")
                };
                let value = read_string(payload, &mut pos);
                headers.push((name, value));
            }
            ResponseFrame::SendHeaders {
                status,
                reason,
                headers,
            }
        }
        PREFIX_SEND_BODY_CHUNK => {
            let mut pos = 1;
            let len = read_u16(payload, &mut pos) as usize;
            ResponseFrame::SendBodyChunk(payload[pos..pos + len].to_vec())
        }
        PREFIX_GET_BODY_CHUNK => {
            let mut pos = 1;
            ResponseFrame::GetBodyChunk {
                len: read_u16(payload, &mut pos),
            }
        }
        PREFIX_END_RESPONSE => ResponseFrame::EndResponse {
            reuse: payload[1] != 0,
        },
        PREFIX_CPONG => ResponseFrame::CPong,
        other => panic!("unexpected response prefix 0x{other:02x}"),
    }
}

fn read_u16(payload: &[u8], pos: &mut usize) -> u16 {
    let v = u16::from_be_bytes([payload[*pos], payload[*pos + 1]]);
    *pos += 2;
    v
}

fn read_string(payload: &[u8], pos: &mut usize) -> String {
    let len = read_u16(payload, pos) as usize;
    let s = String::from_utf8(payload[*pos..*pos + len].to_vec()).expect("wire string utf-8");
    *pos += len;
    s
}

// ========================================
// FORWARD REQUEST BUILDER
// ========================================

pub enum HeaderEntry {
    Coded(u8, String),
    Literal(String, String),
}

/// Builds forward-request payloads, prefix byte included.
pub struct ProxyRequest {
    method_byte: u8,
    literal_method: Option<String>,
    uri: String,
    headers: Vec<HeaderEntry>,
    attributes: Vec<(u8, String)>,
}

impl ProxyRequest {
    pub fn new(method_byte: u8, uri: &str) -> Self {
        Self {
            method_byte,
            literal_method: None,
            uri: uri.to_string(),
            headers: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn get(uri: &str) -> Self {
        Self::new(2, uri)
    }

    pub fn post(uri: &str) -> Self {
        Self::new(4, uri)
    }

    pub fn literal_method(method: &str, uri: &str) -> Self {
        let mut req = Self::new(0xFF, uri);
        req.literal_method = Some(method.to_string());
        req
    }

    pub fn coded_header(mut self, code: u8, value: &str) -> Self {
        self.headers.push(HeaderEntry::Coded(code, value.to_string()));
        self
    }

    pub fn literal_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push(HeaderEntry::Literal(name.to_string(), value.to_string()));
        self
    }

    pub fn content_length(self, len: usize) -> Self {
        self.coded_header(0x08, &len.to_string())
    }

    pub fn cookie(self, value: &str) -> Self {
        self.coded_header(0x09, value)
    }

    pub fn attribute(mut self, code: u8, value: &str) -> Self {
        self.attributes.push((code, value.to_string()));
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.push(PREFIX_FORWARD_REQUEST);
        buf.push(self.method_byte);
        if let Some(method) = &self.literal_method {
            push_string(&mut buf, method);
        }
        push_string(&mut buf, "HTTP/1.1");
        push_string(&mut buf, &self.uri);
        push_string(&mut buf, "127.0.0.1");
        push_string(&mut buf, "localhost");
        push_string(&mut buf, "www.example.com");
        buf.extend_from_slice(&80u16.to_be_bytes());
        buf.push(0);

        buf.extend_from_slice(&(self.headers.len() as u16).to_be_bytes());
        for entry in &self.headers {
            match entry {
                HeaderEntry::Coded(code, value) => {
                    buf.push(0xA0);
                    buf.push(*code);
                    push_string(&mut buf, value);
                }
                HeaderEntry::Literal(name, value) => {
                    push_string(&mut buf, name);
                    push_string(&mut buf, value);
                }
            }
        }

        for (code, value) in &self.attributes {
            buf.push(*code);
            push_string(&mut buf, value);
        }
        buf.push(ATTRIBUTE_LIST_END);
        buf
    }
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

// ========================================
// ASSERTION HELPERS
// ========================================

/// Guard against a hung connector: no single protocol step takes 5 seconds.
pub async fn timed<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("protocol step timed out")
}

pub fn affinity_cookies(headers: &[(String, String)]) -> Vec<&str> {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("set-cookie"))
        .filter(|(_, v)| v.starts_with("JSESSIONID="))
        .map(|(_, v)| v.as_str())
        .collect()
}

pub fn body_of(frames: &[ResponseFrame]) -> Vec<u8> {
    frames
        .iter()
        .filter_map(|f| match f {
            ResponseFrame::SendBodyChunk(data) => Some(data.as_slice()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .concat()
}
