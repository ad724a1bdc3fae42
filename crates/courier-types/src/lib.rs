//! Shared types for the frame courier protocol.
//!
//! This crate defines the error taxonomy and the configuration record used
//! across the protocol core and the command-line simulator. It contains no
//! protocol logic.

pub mod config;
pub mod error;

pub use config::{load_config, CourierConfig};
pub use error::{CourierError, CourierResult, Rejection};
