//! Frame codec for the CASTV2 wire format: a 4-byte big-endian length prefix
//! followed by that many bytes of a serialized protobuf envelope.

use prost::Message;

use crate::cast::cast_channel;
use crate::errors::Error;
use crate::utils;

/// The device rejects frames above 64 KiB; mirror the limit on both paths so
/// a corrupt length prefix is caught before a huge allocation.
pub const MAX_FRAME_LENGTH: usize = 64 << 10;

const FRAME_HEADER_LENGTH: usize = 4;

/// Type of the payload that a [`CastMessage`] can have.
#[derive(Debug, Clone, PartialEq)]
pub enum CastMessagePayload {
    /// Payload represented by a UTF-8 string (usually a JSON document).
    String(String),
    /// Payload represented by binary data (device auth only).
    Binary(Vec<u8>),
}

/// A single message exchanged between sender and receiver, with the protobuf
/// envelope unpacked into owned fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CastMessage {
    /// Labeled sub-protocol this message belongs to.
    pub namespace: String,
    /// Unique identifier of the sender endpoint.
    pub source: String,
    /// Unique identifier of the receiver endpoint.
    pub destination: String,
    /// Payload data attached to the message.
    pub payload: CastMessagePayload,
}

/// Serializes a message into one contiguous `length + body` buffer. Writing
/// the result with a single `write_all` keeps the prefix and body atomic with
/// respect to other frames.
pub fn encode(message: &CastMessage) -> Result<Vec<u8>, Error> {
    let mut raw = cast_channel::CastMessage {
        protocol_version: cast_channel::cast_message::ProtocolVersion::Castv210 as i32,
        source_id: message.source.clone(),
        destination_id: message.destination.clone(),
        namespace: message.namespace.clone(),
        payload_type: 0,
        payload_utf8: None,
        payload_binary: None,
    };

    match &message.payload {
        CastMessagePayload::String(payload) => {
            raw.payload_type = cast_channel::cast_message::PayloadType::String as i32;
            raw.payload_utf8 = Some(payload.clone());
        }
        CastMessagePayload::Binary(payload) => {
            raw.payload_type = cast_channel::cast_message::PayloadType::Binary as i32;
            raw.payload_binary = Some(payload.clone());
        }
    }

    let body = raw.encode_to_vec();
    if body.len() > MAX_FRAME_LENGTH {
        return Err(Error::MalformedFrame(format!(
            "outgoing frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_LENGTH
        )));
    }

    let mut frame = utils::write_u32_to_buffer(body.len() as u32)?;
    frame.extend_from_slice(&body);

    Ok(frame)
}

/// Phase of the incremental decode; tracked explicitly so short reads never
/// drop bytes or lose frame alignment.
#[derive(Debug)]
enum DecodeState {
    /// Waiting for the 4-byte length prefix.
    Header,
    /// Waiting for a body of the given length.
    Payload(usize),
}

/// Incremental frame decoder. Bytes are appended as they arrive off the
/// stream; complete frames are popped with [`FrameDecoder::try_next`].
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    buffer: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder {
            state: DecodeState::Header,
            buffer: Vec::with_capacity(FRAME_HEADER_LENGTH),
        }
    }
}

impl FrameDecoder {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete frame out of the internal buffer, or `None` if
    /// more bytes are needed. Fails with `MalformedFrame` on an oversized
    /// length prefix or an unparseable protobuf body.
    pub fn try_next(&mut self) -> Result<Option<CastMessage>, Error> {
        let length = match self.state {
            DecodeState::Header => {
                if self.buffer.len() < FRAME_HEADER_LENGTH {
                    return Ok(None);
                }
                let length = utils::read_u32_from_buffer(&self.buffer[..FRAME_HEADER_LENGTH])?
                    as usize;
                if length > MAX_FRAME_LENGTH {
                    return Err(Error::MalformedFrame(format!(
                        "incoming frame of {length} bytes exceeds the {MAX_FRAME_LENGTH} byte limit"
                    )));
                }
                self.buffer.drain(..FRAME_HEADER_LENGTH);
                self.state = DecodeState::Payload(length);
                length
            }
            DecodeState::Payload(length) => length,
        };

        if self.buffer.len() < length {
            return Ok(None);
        }

        let body: Vec<u8> = self.buffer.drain(..length).collect();
        self.state = DecodeState::Header;

        let raw = cast_channel::CastMessage::decode(body.as_slice())
            .map_err(|err| Error::MalformedFrame(err.to_string()))?;

        Ok(Some(unpack(raw)?))
    }

    /// Whether a frame is partially buffered. End-of-stream in this state
    /// means the peer died mid-frame.
    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, DecodeState::Payload(_))
    }
}

fn unpack(raw: cast_channel::CastMessage) -> Result<CastMessage, Error> {
    let payload_type = cast_channel::cast_message::PayloadType::try_from(raw.payload_type)
        .map_err(|_| {
            Error::MalformedFrame(format!("unknown payload type {}", raw.payload_type))
        })?;

    let payload = match payload_type {
        cast_channel::cast_message::PayloadType::String => {
            CastMessagePayload::String(raw.payload_utf8.unwrap_or_default())
        }
        cast_channel::cast_message::PayloadType::Binary => {
            CastMessagePayload::Binary(raw.payload_binary.unwrap_or_default())
        }
    };

    Ok(CastMessage {
        namespace: raw.namespace,
        source: raw.source_id,
        destination: raw.destination_id,
        payload,
    })
}
