//! HTTP surface: `/code`, `/verify` and `/health`.

pub mod routes;
pub mod server;

pub use routes::{AppState, pairing_routes};
pub use server::{HttpServer, HttpServerConfig};
