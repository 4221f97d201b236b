//! Rusty Sync - real-time synchronization and optimistic mutation client core
//!
//! This library keeps a local entity cache in step with a social/collaboration
//! backend: request/response calls through the gateway, push events over a
//! single reconnecting channel, and speculative mutations that roll back
//! when the server disagrees.

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod storage;

// Re-export main components
pub use config::{ClientConfig, ReconnectPolicy};
pub use constants::*;
pub use crate::core::session::{SyncSession, SyncSessionBuilder};
pub use error::{Result, SyncError};
