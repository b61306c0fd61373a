//! Request handler: the per-cycle state machine.
//!
//! One handler instance drives one request cycle on an assigned connection:
//! parse the forward request, pull body chunks over the synchronous
//! get-chunk round trip, invoke the application, then write the response
//! frames. Handlers are pooled and reset between cycles.

use bytes::{Bytes, BytesMut};

use crate::application::{AjpRequest, Application};
use crate::server::connection::Connection;
use crate::server::payload_cursor::{PayloadCursor, WireEncoding};
use crate::server::protocol::{
    Cookie, CycleError, ForwardRequest, OutboundMessage, ProtocolError, BODY_CHUNK_BUDGET,
    PREFIX_CPING, PREFIX_FORWARD_REQUEST, PREFIX_SHUTDOWN,
};
use crate::session::{AffinityToken, SessionStore, AFFINITY_COOKIE_NAME};

// ========================================
// CYCLE RESULTS
// ========================================

/// What the read phase of a cycle produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A forward request was parsed and a response is pending.
    Request,
    /// A liveness probe, already answered.
    Ping,
    /// The proxy asked this connection to stop.
    Shutdown,
}

/// What the worker loop should do after the response went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleControl {
    KeepAlive,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    AwaitingForwardRequest,
    HeaderParsed,
    AwaitingBodyChunks,
    BodyChunkReceived,
    ApplicationInvoked,
    ResponseWritten,
    Done,
}

// ========================================
// HANDLER
// ========================================

struct PendingResponse {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    body: Bytes,
    reuse: bool,
}

pub struct RequestHandler {
    state: HandlerState,
    route_tag: String,
    encoding: WireEncoding,
    pending: Option<PendingResponse>,
}

impl RequestHandler {
    pub fn new(route_tag: String, encoding: WireEncoding) -> Self {
        Self {
            state: HandlerState::AwaitingForwardRequest,
            route_tag,
            encoding,
            pending: None,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Back to the initial state; called before the pool takes it back.
    pub fn reset(&mut self) {
        self.state = HandlerState::AwaitingForwardRequest;
        self.pending = None;
    }

    // ========================================
    // READ PHASE
    // ========================================

    pub async fn process(
        &mut self,
        conn: &mut Connection,
        app: &dyn Application,
        sessions: &dyn SessionStore,
    ) -> Result<CycleOutcome, CycleError> {
        self.state = HandlerState::AwaitingForwardRequest;
        self.pending = None;

        let payload = conn.read_packet().await?;
        let prefix = match payload.first() {
            Some(prefix) => *prefix,
            None => return Err(ProtocolError::UnknownPrefix(0).fatal()),
        };

        match prefix {
            PREFIX_CPING => {
                conn.send(OutboundMessage::CPong).await?;
                conn.flush().await?;
                return Ok(CycleOutcome::Ping);
            }
            PREFIX_SHUTDOWN => {
                tracing::info!(peer = ?conn.peer(), "proxy requested shutdown of this connection");
                return Ok(CycleOutcome::Shutdown);
            }
            PREFIX_FORWARD_REQUEST => {}
            other => return Err(ProtocolError::UnknownPrefix(other).fatal()),
        }

        let forward = ForwardRequest::parse(payload.slice(1..), self.encoding)
            .map_err(classify_parse_error)?;
        self.state = HandlerState::HeaderParsed;

        // Affinity policy runs before the header phase completes.
        let (token, reused) = resolve_affinity(&forward.cookies, &self.route_tag, sessions);
        if !reused {
            tracing::debug!(token = %token, "minted affinity token");
        }

        let declared = forward.content_length();
        let chunked = declared.is_none() && forward.is_chunked();
        let form_encoded = forward
            .content_type()
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);

        let mut request = AjpRequest::from_forward(forward);

        let body = match declared {
            Some(n) if n > 0 => self.read_declared_body(conn, n).await?,
            _ if chunked => self.read_chunked_body(conn).await?,
            _ => Bytes::new(),
        };

        // Form parameters are only decoded once the body is complete.
        if form_encoded && !body.is_empty() {
            request.parameters = parse_form_urlencoded(&body);
        }
        request.body = body;

        self.state = HandlerState::ApplicationInvoked;
        let response = app.handle(&request);

        let mut headers = response.headers.clone();
        headers.push((
            "Set-Cookie".to_string(),
            format!("{}={}; Path=/", AFFINITY_COOKIE_NAME, token),
        ));
        if !response.body.is_empty()
            && !headers
                .iter()
                .any(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        {
            headers.push(("Content-Length".to_string(), response.body.len().to_string()));
        }

        self.pending = Some(PendingResponse {
            status: response.status,
            reason: response.reason_phrase().to_string(),
            headers,
            body: response.body,
            reuse: true,
        });
        Ok(CycleOutcome::Request)
    }

    /// Solicit chunks until the declared length has arrived. A premature
    /// zero-length chunk coerces the transfer complete: the application sees
    /// the short body. Overshoot is likewise coerced.
    async fn read_declared_body(
        &mut self,
        conn: &mut Connection,
        declared: usize,
    ) -> Result<Bytes, CycleError> {
        let mut body = BytesMut::with_capacity(declared.min(BODY_CHUNK_BUDGET * 4));
        self.state = HandlerState::AwaitingBodyChunks;

        while body.len() < declared {
            let want = (declared - body.len()).min(BODY_CHUNK_BUDGET) as u16;
            conn.send(OutboundMessage::GetBodyChunk { len: want }).await?;
            conn.flush().await?;

            let chunk = self.read_body_chunk(conn).await?;
            self.state = HandlerState::BodyChunkReceived;
            if chunk.is_empty() {
                tracing::warn!(
                    received = body.len(),
                    declared,
                    "body transfer ended before the declared length; continuing with what arrived"
                );
                break;
            }
            body.extend_from_slice(&chunk);
            self.state = HandlerState::AwaitingBodyChunks;
        }

        if body.len() > declared {
            tracing::warn!(
                received = body.len(),
                declared,
                "more body bytes than declared; transfer treated as complete"
            );
        }
        Ok(body.freeze())
    }

    /// No declared length: pull full-budget chunks until the proxy answers
    /// with a zero-length chunk.
    async fn read_chunked_body(&mut self, conn: &mut Connection) -> Result<Bytes, CycleError> {
        let mut body = BytesMut::new();
        self.state = HandlerState::AwaitingBodyChunks;
        loop {
            conn.send(OutboundMessage::GetBodyChunk {
                len: BODY_CHUNK_BUDGET as u16,
            })
            .await?;
            conn.flush().await?;

            let chunk = self.read_body_chunk(conn).await?;
            self.state = HandlerState::BodyChunkReceived;
            if chunk.is_empty() {
                return Ok(body.freeze());
            }
            body.extend_from_slice(&chunk);
            self.state = HandlerState::AwaitingBodyChunks;
        }
    }

    async fn read_body_chunk(&mut self, conn: &mut Connection) -> Result<Bytes, CycleError> {
        let payload = conn.read_packet().await?;
        // A bare empty packet is the same no-more-data signal as a zero
        // chunk length.
        if payload.is_empty() {
            return Ok(Bytes::new());
        }
        let mut cur = PayloadCursor::new(payload, self.encoding);
        let len = cur.read_u16().map_err(ProtocolError::fatal)? as usize;
        cur.read_bytes(len).map_err(ProtocolError::fatal)
    }

    // ========================================
    // WRITE PHASE
    // ========================================

    pub async fn write_response(
        &mut self,
        conn: &mut Connection,
    ) -> Result<CycleControl, CycleError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| ProtocolError::ResponseWhileIdle.fatal())?;

        conn.send(OutboundMessage::SendHeaders {
            status: pending.status,
            reason: pending.reason,
            headers: pending.headers,
        })
        .await?;
        self.state = HandlerState::ResponseWritten;

        let mut offset = 0;
        while offset < pending.body.len() {
            let end = (offset + BODY_CHUNK_BUDGET).min(pending.body.len());
            conn.send(OutboundMessage::SendBodyChunk(pending.body.slice(offset..end)))
                .await?;
            offset = end;
        }

        conn.send(OutboundMessage::EndResponse {
            reuse: pending.reuse,
        })
        .await?;
        conn.flush().await?;
        self.state = HandlerState::Done;

        Ok(if pending.reuse {
            CycleControl::KeepAlive
        } else {
            CycleControl::Close
        })
    }
}

// ========================================
// POLICY HELPERS
// ========================================

/// String-level decode failures abort only the request; structural damage
/// tears the connection down.
fn classify_parse_error(err: ProtocolError) -> CycleError {
    match err {
        ProtocolError::BadEncoding { .. } | ProtocolError::MalformedCookie(_) => err.keep_alive(),
        other => other.fatal(),
    }
}

/// Decide the affinity token for this cycle. Returns the effective token and
/// whether it was reused unchanged.
fn resolve_affinity(
    cookies: &[Cookie],
    route_tag: &str,
    sessions: &dyn SessionStore,
) -> (AffinityToken, bool) {
    let incoming = cookies
        .iter()
        .find(|c| c.name == AFFINITY_COOKIE_NAME)
        .map(|c| AffinityToken::parse(&c.value));

    match incoming {
        Some(token) if token.routes_to(route_tag) && sessions.is_live(&token.id) => (token, true),
        Some(token) => {
            tracing::debug!(
                token = %token,
                route_tag,
                "affinity token rejected (foreign route or dead session)"
            );
            (AffinityToken::mint(route_tag), false)
        }
        None => (AffinityToken::mint(route_tag), false),
    }
}

/// Decode `application/x-www-form-urlencoded` bytes into parameters.
fn parse_form_urlencoded(body: &[u8]) -> Vec<(String, String)> {
    body.split(|&b| b == b'&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = match pair.iter().position(|&b| b == b'=') {
                Some(i) => (&pair[..i], &pair[i + 1..]),
                None => (pair, &pair[pair.len()..]),
            };
            (percent_decode(name), percent_decode(value))
        })
        .collect()
}

fn percent_decode(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'+' => out.push(b' '),
            b'%' => {
                if let (Some(hi), Some(lo)) = (
                    raw.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    raw.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                ) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                    continue;
                }
                out.push(b'%');
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
