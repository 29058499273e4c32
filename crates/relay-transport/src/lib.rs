//! # live-relay-transport
//!
//! WebSocket adapters for the live-relay session.
//!
//! A socket accepted by axum is split into a [`WebSocketSource`] and a
//! [`WebSocketSink`], which implement the session's transport traits for
//! one of two wire formats:
//!
//! - **Text** - Each WebSocket message is a raw update payload, and clients
//!   receive the full content as a text message. This is what a browser
//!   editor speaks.
//! - **Framed** - Length-prefixed MessagePack frames from
//!   `live-relay-protocol`, carrying versions, acks and rejections.
//!
//! ```rust,ignore
//! use live_relay_transport::{split, WireFormat};
//!
//! let (source, sink) = split(socket, WireFormat::Text, 1024 * 1024);
//! ConnectionSession::new("markdown", engine, source, sink, shutdown).run().await?;
//! ```

pub mod websocket;
pub mod wire;

pub use websocket::{split, SocketSink, SocketSource, WebSocketSink, WebSocketSource};
pub use wire::WireFormat;
