//! Client-facing HTTP surface.

pub mod routes;
pub mod server;

pub use server::{build_router, serve, start_server, AppState};
