use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::errors::{CycleError, FramingError, ProtocolError};
use super::frame::{
    response_header_code, InboundPacket, OutboundMessage, PacketHeader, BODY_CHUNK_BUDGET,
    HEADER_CODE_MARKER, MAGIC_TO_PROXY, MAX_PAYLOAD_SIZE, PREFIX_CPONG, PREFIX_END_RESPONSE,
    PREFIX_GET_BODY_CHUNK, PREFIX_SEND_BODY_CHUNK, PREFIX_SEND_HEADERS,
};

#[derive(Debug, Default)]
pub struct AjpCodec;

impl AjpCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for AjpCodec {
    type Item = InboundPacket;
    type Error = CycleError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PacketHeader::SIZE {
            return Ok(None);
        }

        let header: &PacketHeader = bytemuck::try_from_bytes(&src[..PacketHeader::SIZE])
            .map_err(|_| FramingError::Truncated)?;

        let direction = header
            .direction()
            .ok_or(FramingError::BadMagic(src[0], src[1]))?;

        let payload_len = header.payload_len() as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::Oversized(payload_len).fatal());
        }

        let total_len = PacketHeader::SIZE + payload_len;
        if src.len() < total_len {
            return Ok(None);
        }

        let frame_bytes = src.split_to(total_len).freeze();
        let payload = frame_bytes.slice(PacketHeader::SIZE..);

        Ok(Some(InboundPacket { direction, payload }))
    }
}

impl Encoder<OutboundMessage> for AjpCodec {
    type Error = CycleError;

    fn encode(&mut self, item: OutboundMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = encode_payload(item)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::Oversized(payload.len()).fatal());
        }
        dst.reserve(PacketHeader::SIZE + payload.len());
        dst.put_slice(&MAGIC_TO_PROXY);
        dst.put_u16(payload.len() as u16);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

fn encode_payload(item: OutboundMessage) -> Result<Bytes, CycleError> {
    let mut buf = BytesMut::new();
    match item {
        OutboundMessage::SendHeaders {
            status,
            reason,
            headers,
        } => {
            buf.put_u8(PREFIX_SEND_HEADERS);
            buf.put_u16(status);
            put_string(&mut buf, &reason);
            buf.put_u16(headers.len() as u16);
            for (name, value) in &headers {
                match response_header_code(name) {
                    Some(code) => {
                        buf.put_u8(HEADER_CODE_MARKER);
                        buf.put_u8(code);
                    }
                    None => put_string(&mut buf, name),
                }
                put_string(&mut buf, value);
            }
        }
        OutboundMessage::SendBodyChunk(chunk) => {
            // The handler splits bodies; anything larger here is a bug.
            if chunk.len() > BODY_CHUNK_BUDGET {
                return Err(ProtocolError::ChunkOverBudget(chunk.len()).fatal());
            }
            buf.put_u8(PREFIX_SEND_BODY_CHUNK);
            buf.put_u16(chunk.len() as u16);
            buf.extend_from_slice(&chunk);
        }
        OutboundMessage::GetBodyChunk { len } => {
            buf.put_u8(PREFIX_GET_BODY_CHUNK);
            buf.put_u16(len);
        }
        OutboundMessage::EndResponse { reuse } => {
            buf.put_u8(PREFIX_END_RESPONSE);
            buf.put_u8(u8::from(reuse));
        }
        OutboundMessage::CPong => {
            buf.put_u8(PREFIX_CPONG);
        }
    }
    Ok(buf.freeze())
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}
