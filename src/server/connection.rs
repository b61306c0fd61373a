//! Per-socket state: framed streams, Idle/Assigned flag, packet sequence.
//!
//! A Connection is a pooled shell. Between assignments it holds no socket;
//! `attach` arms it with the framed halves of a freshly accepted stream, and
//! `reset_connection` returns it to Idle with the sequence counter zeroed.
//! Exactly one worker drives a Connection at a time.

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::application::Application;
use crate::server::handler::{CycleControl, CycleOutcome, RequestHandler};
use crate::server::pool::Pool;
use crate::server::protocol::{
    AjpCodec, CycleError, FramingError, OutboundMessage, PacketDirection, ProtocolError,
};
use crate::session::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Assigned,
}

struct ConnectionIo {
    reader: FramedRead<OwnedReadHalf, AjpCodec>,
    writer: FramedWrite<OwnedWriteHalf, AjpCodec>,
    peer: Option<SocketAddr>,
}

pub struct Connection {
    io: Option<ConnectionIo>,
    state: ConnectionState,
    sequence: u64,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// Detached shell, ready for pooling.
    pub fn new() -> Self {
        Self {
            io: None,
            state: ConnectionState::Idle,
            sequence: 0,
        }
    }

    /// Arm the shell with an accepted socket.
    pub fn attach(&mut self, socket: TcpStream) {
        let peer = socket.peer_addr().ok();
        let (read_half, write_half) = socket.into_split();
        self.io = Some(ConnectionIo {
            reader: FramedRead::new(read_half, AjpCodec::new()),
            writer: FramedWrite::new(write_half, AjpCodec::new()),
            peer,
        });
        self.state = ConnectionState::Idle;
        self.sequence = 0;
    }

    /// Drop the socket. The shell can be released back to its pool.
    pub fn detach(&mut self) {
        self.io = None;
        self.state = ConnectionState::Idle;
        self.sequence = 0;
    }

    pub fn is_attached(&self) -> bool {
        self.io.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.io.as_ref().and_then(|io| io.peer)
    }

    // ========================================
    // PACKET I/O
    // ========================================

    /// Next packet payload from the proxy. Counts toward the sequence.
    pub async fn read_packet(&mut self) -> Result<Bytes, CycleError> {
        let io = self.io.as_mut().ok_or(FramingError::Closed)?;
        let packet = match io.reader.next().await {
            Some(packet) => packet?,
            None => return Err(FramingError::Closed.into()),
        };
        if packet.direction != PacketDirection::FromProxy {
            return Err(ProtocolError::WrongDirection.fatal());
        }
        self.sequence += 1;
        Ok(packet.payload)
    }

    /// Queue one outbound frame. Flushed explicitly so a response's frames
    /// go out together.
    pub async fn send(&mut self, message: OutboundMessage) -> Result<(), CycleError> {
        let io = self.io.as_mut().ok_or(FramingError::Closed)?;
        io.writer.feed(message).await
    }

    pub async fn flush(&mut self) -> Result<(), CycleError> {
        let io = self.io.as_mut().ok_or(FramingError::Closed)?;
        io.writer.flush().await
    }

    // ========================================
    // REQUEST CYCLE
    // ========================================

    /// Run the read half of one cycle. On the first packet of an assignment
    /// the connection transitions Idle -> Assigned and a request handler is
    /// taken from the pool into `slot`.
    pub async fn process_request(
        &mut self,
        slot: &mut Option<RequestHandler>,
        handlers: &Pool<RequestHandler>,
        app: &dyn Application,
        sessions: &dyn SessionStore,
    ) -> Result<CycleOutcome, CycleError> {
        if self.io.is_none() {
            return Err(FramingError::Closed.into());
        }
        if self.state == ConnectionState::Idle {
            self.state = ConnectionState::Assigned;
        }
        let handler = slot.get_or_insert_with(|| handlers.acquire());
        handler.process(self, app, sessions).await
    }

    /// Write the response assembled by `process_request`. Misuse while Idle.
    pub async fn create_response(
        &mut self,
        slot: &mut Option<RequestHandler>,
    ) -> Result<CycleControl, CycleError> {
        if self.state == ConnectionState::Idle {
            return Err(ProtocolError::ResponseWhileIdle.fatal());
        }
        let handler = slot
            .as_mut()
            .ok_or_else(|| ProtocolError::ResponseWhileIdle.fatal())?;
        handler.write_response(self).await
    }

    /// Flush, optionally reset + return the handler, then go back to Idle.
    /// Never fails: a flush error at this point is logged and swallowed.
    pub async fn reset_connection(
        &mut self,
        handler: Option<RequestHandler>,
        handlers: &Pool<RequestHandler>,
    ) {
        if self.io.is_some() {
            if let Err(err) = self.flush().await {
                tracing::debug!(error = %err, "flush during connection reset failed");
            }
        }
        if let Some(mut h) = handler {
            h.reset();
            handlers.release(h);
        }
        self.sequence = 0;
        self.state = ConnectionState::Idle;
    }
}
