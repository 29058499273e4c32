//! WebSocket source and sink.
//!
//! Both halves are generic over the underlying stream and sink so they work
//! on anything shaped like a WebSocket, not only axum's.

use crate::wire::{encode_outbound, Inbound, InboundDecoder, WireFormat};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use live_relay_core::{Outbound, PayloadSink, PayloadSource, TransportError};
use std::fmt::Display;
use tracing::{debug, trace};

/// Source half of an axum WebSocket.
pub type SocketSource = WebSocketSource<SplitStream<WebSocket>>;

/// Sink half of an axum WebSocket.
pub type SocketSink = WebSocketSink<SplitSink<WebSocket, Message>>;

/// Split an upgraded socket into session transport halves.
#[must_use]
pub fn split(
    socket: WebSocket,
    format: WireFormat,
    max_message_size: usize,
) -> (SocketSource, SocketSink) {
    let (sink, stream) = socket.split();
    (
        WebSocketSource::new(stream, format, max_message_size),
        WebSocketSink::new(sink, format),
    )
}

/// Reads update payloads from a WebSocket.
pub struct WebSocketSource<S> {
    stream: S,
    decoder: InboundDecoder,
}

impl<S> WebSocketSource<S> {
    /// Wrap a message stream.
    #[must_use]
    pub fn new(stream: S, format: WireFormat, max_message_size: usize) -> Self {
        Self {
            stream,
            decoder: InboundDecoder::new(format, max_message_size),
        }
    }
}

#[async_trait]
impl<S, E> PayloadSource for WebSocketSource<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            // Earlier binary messages may have carried several frames.
            if let Some(payload) = self.decoder.pending()? {
                return Ok(Some(payload));
            }

            let Some(message) = self.stream.next().await else {
                debug!("WebSocket stream ended");
                return Ok(None);
            };
            let message = message.map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

            match self.decoder.accept(message)? {
                Inbound::Payload(payload) => return Ok(Some(payload)),
                Inbound::Pending => continue,
                Inbound::Closed => {
                    debug!("Received close frame");
                    return Ok(None);
                }
            }
        }
    }
}

/// Writes session messages to a WebSocket.
pub struct WebSocketSink<K> {
    sink: K,
    format: WireFormat,
}

impl<K> WebSocketSink<K> {
    /// Wrap a message sink.
    #[must_use]
    pub fn new(sink: K, format: WireFormat) -> Self {
        Self { sink, format }
    }

    /// Get the wire format.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }
}

#[async_trait]
impl<K> PayloadSink for WebSocketSink<K>
where
    K: Sink<Message> + Unpin + Send,
    K::Error: Display + Send,
{
    async fn send(&mut self, message: &Outbound) -> Result<(), TransportError> {
        let Some(encoded) = encode_outbound(self.format, message)? else {
            trace!(kind = message.kind(), format = self.format.as_str(), "Not carried by wire format");
            return Ok(());
        };

        self.sink
            .send(encoded)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use futures_util::stream;
    use live_relay_core::{ConnectionId, Update};
    use live_relay_protocol::{codec, Frame};
    use std::io;
    use std::sync::Arc;

    fn source(
        messages: Vec<Result<Message, io::Error>>,
        format: WireFormat,
    ) -> WebSocketSource<stream::Iter<std::vec::IntoIter<Result<Message, io::Error>>>> {
        WebSocketSource::new(stream::iter(messages), format, 1024)
    }

    fn update(version: u64, content: &str) -> Outbound {
        Outbound::Update(Arc::new(Update {
            topic: "code".into(),
            version,
            content: content.into(),
            origin: Some(ConnectionId::from_raw(3)),
        }))
    }

    #[tokio::test]
    async fn test_text_source_reads_until_close() {
        let mut source = source(
            vec![
                Ok(Message::Ping(vec![])),
                Ok(Message::Text("+first".into())),
                Ok(Message::Text("+second".into())),
                Ok(Message::Close(None)),
                Ok(Message::Text("+after close".into())),
            ],
            WireFormat::Text,
        );

        assert_eq!(source.recv().await.unwrap(), Some(Bytes::from_static(b"+first")));
        assert_eq!(source.recv().await.unwrap(), Some(Bytes::from_static(b"+second")));
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_source_end_of_stream_is_clean_close() {
        let mut source = source(vec![], WireFormat::Text);
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_source_stream_error_is_read_failure() {
        let mut source = source(
            vec![Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))],
            WireFormat::Text,
        );

        let err = source.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::ReceiveFailed(ref msg) if msg.contains("reset")));
    }

    #[tokio::test]
    async fn test_framed_source_yields_every_frame_in_a_message() {
        let mut batch = BytesMut::new();
        codec::encode_into(&Frame::update(b"+a".to_vec()), &mut batch).unwrap();
        codec::encode_into(&Frame::update(b"+b".to_vec()), &mut batch).unwrap();

        let mut source = source(
            vec![Ok(Message::Binary(batch.to_vec()))],
            WireFormat::Framed,
        );

        assert_eq!(source.recv().await.unwrap(), Some(Bytes::from_static(b"+a")));
        assert_eq!(source.recv().await.unwrap(), Some(Bytes::from_static(b"+b")));
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_text_sink_writes_content_and_skips_acks() {
        let mut sink = WebSocketSink::new(Vec::<Message>::new(), WireFormat::Text);

        sink.send(&update(1, "a\n")).await.unwrap();
        sink.send(&Outbound::Ack { version: 1 }).await.unwrap();
        sink.send(&update(2, "a\nb\n")).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(
            sink.sink,
            vec![Message::Text("a\n".into()), Message::Text("a\nb\n".into())]
        );
    }

    #[tokio::test]
    async fn test_framed_sink_writes_frames() {
        let mut sink = WebSocketSink::new(Vec::<Message>::new(), WireFormat::Framed);
        assert_eq!(sink.format(), WireFormat::Framed);

        sink.send(&update(4, "x")).await.unwrap();
        sink.send(&Outbound::Ack { version: 5 }).await.unwrap();

        let frames: Vec<Frame> = sink
            .sink
            .iter()
            .map(|message| match message {
                Message::Binary(data) => codec::decode(data).unwrap(),
                other => panic!("expected binary message, got {:?}", other),
            })
            .collect();
        assert_eq!(
            frames,
            vec![Frame::content("code", 4, "x", Some(3)), Frame::ack(5)]
        );
    }
}
