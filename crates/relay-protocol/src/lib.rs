//! # live-relay-protocol
//!
//! Binary frame protocol for live-relay clients that want more than raw
//! content on the wire: versions, acknowledgments and rejections.
//!
//! ## Frame Types
//!
//! - `Update` - Client payload for its topic
//! - `Snapshot` - Current content, sent once on join
//! - `Content` - Content produced by another client's update
//! - `Ack` / `Error` - Outcome of the client's own update
//!
//! ## Example
//!
//! ```rust
//! use live_relay_protocol::{codec, Frame};
//!
//! let frame = Frame::update(b"+# Title".to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{error_codes, Frame};
