//! Realtime fan-out subsystem.
//!
//! # Data Flow
//! ```text
//! WebSocket client ──(identity checked before upgrade)──→ http/websocket.rs
//!     → hub.rs register: CONNECTING → AUTHENTICATED
//!     → subscribe/unsubscribe: groups keyed by (tenant, topic)
//!     → user index keyed by (tenant, user)
//!
//! broadcast(tenant, topic) / send_to_user(tenant, user)
//!     → deliver to local members (bounded queue, drop when full)
//!     → backbone.rs publish ──→ other gateway instances
//!                                 → their listener → deliver to their members
//! ```
//!
//! # Design Decisions
//! - A connection belongs to one tenant for its lifetime
//! - Broadcast never waits on a slow subscriber
//! - Without a backbone (or while it is down) delivery is local-only
//! - Envelopes carry the publishing instance id; instances skip their own

pub mod backbone;
pub mod connection;
pub mod hub;
pub mod protocol;

pub use backbone::{Backbone, BackboneError, Envelope, MemoryBackbone, RedisBackbone, Target};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionState};
pub use hub::{FanoutHub, HubError, HubStats};
pub use protocol::{ClientMessage, ServerMessage};
