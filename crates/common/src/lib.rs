//! Common types shared across Huddle components.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes and media kinds
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
