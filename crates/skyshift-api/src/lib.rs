//! The SkyShift API server
//!
//! Uniform CRUD + watch endpoints over every object kind, bearer-token
//! authentication, role-based authorization, JSON Patch, job log
//! aggregation, exec bridging and user/invite management.

pub mod auth;
pub mod authorize;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod server;
pub mod users;

pub use auth::{AuthConfig, AuthHandle, AuthUser};
pub use error::{ApiError, ApiResult};
pub use server::{bootstrap, build_router, serve, ApiServerConfig, AppState, ADMIN_USER};
