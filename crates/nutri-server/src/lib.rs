//! HTTP surface for the notification hub.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `auth` | Bearer token resolution into a practitioner identity |
//! | `client` | Per-connection WebSocket reader/writer loop |
//! | `server` | Router, `/hub`, `/events`, `/health`, lifecycle |

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod server;

pub use auth::{AuthError, JwtResolver, Principal, PrincipalResolver, StaticTokenResolver};
pub use config::ServerConfig;
pub use error::ServerError;
pub use server::{build_router, start, AppState, ServerHandle};
