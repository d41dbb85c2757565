//! Core library for agquota.
//!
//! Locates the local Antigravity language server, polls its quota endpoint,
//! aggregates per-model quota into groups with usage history and a runway
//! prediction, and keeps the on-disk conversation cache in check.
//!
//! The [`monitor::Monitor`] wires the pieces together; every component is
//! usable on its own.

pub mod aggregate;
pub mod config;
pub mod discovery;
pub mod housekeeping;
pub mod monitor;
pub mod quota;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod transport;
pub mod utils;
