//! veil_proto — wire types and the relay transport contract.
//!
//! The relay is a DUMB PUB/SUB: it routes signed events by kind, author,
//! and tag filters. Delivery is unordered, at-most-once per subscription,
//! with possible duplicates and replays; all deduplication happens above
//! this layer, keyed by event id.
//!
//! # Modules
//! - `event`  — signed events, rumors (unsigned plaintext events), ids, kinds
//! - `filter` — subscription filters
//! - `relay`  — the `RelayTransport` trait + in-memory relay for tests

pub mod error;
pub mod event;
pub mod filter;
pub mod relay;

pub use error::ProtoError;
pub use event::{Event, Rumor};
pub use filter::Filter;
pub use relay::{EventSink, MemoryRelay, RelayTransport, Subscription};
