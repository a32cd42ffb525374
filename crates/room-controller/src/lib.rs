//! Room Controller Library
//!
//! Core of the Huddle room controller - a WebSocket signaling server that
//! orchestrates multi-party SFU rooms:
//!
//! - Pool of media workers, one router per room, assigned round-robin
//! - Room registry creating rooms on first join and closing them when empty
//! - Per-peer session state machine (transports, producers, consumers)
//! - Dominant-speaker detection per room
//! - Admin HTTP surface for stats, tenants and session dumps
//!
//! # Architecture
//!
//! ```text
//! RoomRegistryActor (singleton per instance)
//! └── RoomActor (one per open room, owns one router)
//!     └── ConnectionActor (one per signaling WebSocket)
//! ```
//!
//! The media engine is consumed through the traits in [`media`]; the
//! in-process [`media::loopback::LoopbackEngine`] implements them.
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors
//! - [`admin`] - Admin API and its bearer-token middleware
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with signaling error codes
//! - [`media`] - Media engine traits, worker pool, loopback engine
//! - [`observability`] - Metrics and health probes
//! - [`signaling`] - WebSocket endpoint and the signaling stream abstraction
//! - [`speaker`] - Dominant-speaker detector

pub mod actors;
pub mod admin;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod signaling;
pub mod speaker;
pub mod system_info;
