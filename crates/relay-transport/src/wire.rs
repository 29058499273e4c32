//! Mapping between session messages and WebSocket messages.

use axum::extract::ws::Message;
use bytes::{Bytes, BytesMut};
use live_relay_core::{Outbound, TransportError};
use live_relay_protocol::{codec, error_codes, Frame};
use serde::{Deserialize, Serialize};

/// How payloads and content look on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Raw payloads in, full content out as text. Acks and rejections are
    /// not sent.
    #[default]
    Text,
    /// Length-prefixed MessagePack frames in binary messages.
    Framed,
}

impl WireFormat {
    /// Get the format name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::Text => "text",
            WireFormat::Framed => "framed",
        }
    }
}

/// Convert an outbound message to its protocol frame.
#[must_use]
pub fn frame_for(message: &Outbound) -> Frame {
    match message {
        Outbound::Snapshot(update) => {
            Frame::snapshot(update.topic.as_str(), update.version, &*update.content)
        }
        Outbound::Update(update) => Frame::content(
            update.topic.as_str(),
            update.version,
            &*update.content,
            update.origin.map(|id| id.as_u64()),
        ),
        Outbound::Ack { version } => Frame::ack(*version),
        Outbound::Rejected { reason } => Frame::error(error_codes::MERGE_REJECTED, reason.as_str()),
    }
}

/// Convert an outbound message to a WebSocket message.
///
/// Returns `None` for messages the format does not carry.
///
/// # Errors
///
/// Returns [`TransportError::Protocol`] if the frame cannot be encoded.
pub fn encode_outbound(
    format: WireFormat,
    message: &Outbound,
) -> Result<Option<Message>, TransportError> {
    match format {
        WireFormat::Text => Ok(match message {
            Outbound::Snapshot(update) | Outbound::Update(update) => {
                Some(Message::Text(update.content.to_string()))
            }
            Outbound::Ack { .. } | Outbound::Rejected { .. } => None,
        }),
        WireFormat::Framed => {
            let data = codec::encode(&frame_for(message))
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            Ok(Some(Message::Binary(data.to_vec())))
        }
    }
}

/// What one inbound WebSocket message amounted to.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Inbound {
    /// A complete update payload.
    Payload(Bytes),
    /// Nothing to hand over yet.
    Pending,
    /// The peer sent a close frame.
    Closed,
}

/// Turns inbound WebSocket messages into update payloads.
#[derive(Debug)]
pub(crate) struct InboundDecoder {
    format: WireFormat,
    max_message_size: usize,
    buffer: BytesMut,
}

impl InboundDecoder {
    pub(crate) fn new(format: WireFormat, max_message_size: usize) -> Self {
        Self {
            format,
            max_message_size,
            buffer: BytesMut::new(),
        }
    }

    /// Take the next payload already sitting in the frame buffer.
    pub(crate) fn pending(&mut self) -> Result<Option<Bytes>, TransportError> {
        if self.format == WireFormat::Text || self.buffer.is_empty() {
            return Ok(None);
        }

        match codec::decode_from(&mut self.buffer) {
            Ok(Some(Frame::Update { payload })) => Ok(Some(Bytes::from(payload))),
            Ok(Some(other)) => Err(TransportError::Protocol(format!(
                "unexpected {} frame from client",
                other.kind()
            ))),
            Ok(None) => Ok(None),
            Err(e) => Err(TransportError::Protocol(e.to_string())),
        }
    }

    pub(crate) fn accept(&mut self, message: Message) -> Result<Inbound, TransportError> {
        let data = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
            Message::Ping(_) | Message::Pong(_) => return Ok(Inbound::Pending),
            Message::Close(_) => return Ok(Inbound::Closed),
        };

        if data.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }

        match self.format {
            WireFormat::Text => Ok(Inbound::Payload(Bytes::from(data))),
            WireFormat::Framed => {
                self.buffer.extend_from_slice(&data);
                Ok(self.pending()?.map_or(Inbound::Pending, Inbound::Payload))
            }
        }
    }
}
