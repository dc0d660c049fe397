//! Shared foundation for the SkyShift control plane
//!
//! This crate holds everything the other crates agree on: the typed
//! object model and its validation, the error taxonomy, label matching,
//! resource accounting, retry/backoff helpers, telemetry setup and the
//! local `~/.skyconf` configuration files.

pub mod config;
pub mod error;
pub mod labels;
pub mod object;
pub mod resources;
pub mod retry;
pub mod telemetry;

pub use error::{Error, Result};
