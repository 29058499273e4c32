//! # live-relay-core
//!
//! Connection registry and broadcast engine for the live-relay content relay.
//!
//! This crate provides the building blocks that keep every client editing or
//! viewing a topic on the same content:
//!
//! - **ContentStore** - Per-topic content and version counter
//! - **MergeFunction** - Pluggable reconciliation of content with a payload
//! - **ConnectionRegistry** - Live connections grouped by topic
//! - **BroadcastEngine** - Merge, store and fan out updates in order
//! - **ConnectionSession** - Per-connection receive loop and teardown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌──────────────┐
//! │   Session   │────▶│ BroadcastEngine │────▶│ ContentStore │
//! └─────────────┘     └─────────────────┘     └──────────────┘
//!        ▲                     │
//!        │ bounded queue       ▼
//!        │            ┌────────────────────┐
//!        └────────────│ ConnectionRegistry │
//!                     └────────────────────┘
//! ```

pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod merge;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod transport;

pub use connection::{ConnectionHandle, ConnectionId, Outbound, SendFailure, Update};
pub use engine::{BroadcastEngine, BroadcastPolicy, BroadcastReport, EngineStats};
pub use error::RelayError;
pub use events::{EventSink, RelayEvent, TracingSink};
pub use merge::{LinePatchMerge, MergeError, MergeFunction, MergeStrategy, ReplaceMerge};
pub use registry::{validate_topic, ConnectionRegistry, RegistryStats};
pub use session::{ConnectionSession, SessionConfig, SessionOutcome};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use store::{ContentState, ContentStore};
pub use transport::{PayloadSink, PayloadSource, TransportError};
