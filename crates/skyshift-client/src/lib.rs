//! Client side of the SkyShift API
//!
//! [`ApiClient`] is the typed HTTP client; [`Informer`] layers a local
//! cache and Add/Update/Delete callbacks over its watch streams. The
//! scheduler and every skylet controller consume the control plane
//! exclusively through this crate.

pub mod client;
pub mod informer;
pub mod watch;

pub use client::{
    ApiClient, ApiErrorBody, InviteRequest, LoginRequest, RegisterRequest, RevokeInviteRequest,
    TokenResponse,
};
pub use informer::{EventHandlers, Informer, InformerCache};
pub use watch::ClientWatchStream;
