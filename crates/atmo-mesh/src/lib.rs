//! # atmo-mesh
//!
//! The gossiped view of the mesh.
//!
//! Every admitted peer periodically advertises its capabilities; this crate
//! keeps them in a [`CapabilityTable`] that forgets anything not refreshed
//! within the staleness window. [`MeshNode`] runs the token handshake that
//! decides who counts as a peer and feeds their adverts into the table.
//! Byte delivery itself is left to a [`PeerTransport`] implementation.

pub mod capability;
pub mod load;
pub mod node;
pub mod protocol;
pub mod sweeper;
pub mod transport;

pub use capability::{CapabilityEntry, CapabilityFilter, CapabilityTable, IngestOutcome, Supports};
pub use load::{PlatformMetrics, StaticMetrics, estimate_load};
pub use node::{MeshNode, MeshSettings, PeerInfo};
pub use protocol::GossipMessage;
pub use sweeper::{MIN_TICK, spawn_sweeper, tick_period};
pub use transport::{Envelope, MemoryHub, MemoryTransport, PeerTransport};
