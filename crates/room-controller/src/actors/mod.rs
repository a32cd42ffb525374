//! Actor model implementation for the Room Controller.
//!
//! ```text
//! RoomRegistryActor (singleton per instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per open room)
//!         ├── owns the router and every peer's media resources
//!         └── delivers to N ConnectionActors
//!             └── ConnectionActor (one per signaling WebSocket)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per room**: every mutation of a room's state goes through its mailbox
//! - **CancellationToken propagation**: Parent actors pass child tokens for graceful shutdown
//! - **Mailbox monitoring**: Depth thresholds with metrics (Room: 100/500, Connection: 50/200)
//! - **Bounded outbound queues**: a peer that cannot keep up loses broadcasts, and is
//!   disconnected if it cannot take a response
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton that creates and closes rooms
//! - [`room`] - `RoomActor` per open room, owns peer session state
//! - [`connection`] - `ConnectionActor` per signaling WebSocket
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

// Re-export primary types
pub use connection::{serve_connection, ConnectionActor, ConnectionActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorMetricsSnapshot, ActorType, MailboxMonitor};
pub use registry::{RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle, RoomSettings, DEFAULT_MAX_PEERS};
