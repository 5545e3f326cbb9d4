//! Parley server
//!
//! Real-time gateway plus the REST persistence surface. The gateway pushes
//! messages between live connections; durable history goes through the
//! storage backend.

pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod presence;
pub mod routing;
pub mod websocket;

pub use config::ServerConfig;
pub use websocket::ServerState;
