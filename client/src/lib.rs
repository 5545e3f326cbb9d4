//! Parley client
//!
//! Headless client for the Parley gateway: key storage, the REST
//! repository, the gateway connection and the per-conversation session
//! controller that ties them together.

pub mod api;
pub mod config;
pub mod error;
pub mod session;
pub mod vault;
pub mod websocket;

pub use api::HttpApi;
pub use config::ClientConfig;
pub use error::ClientError;
pub use session::{
    ChatSessionController, DeliveryState, SendReport, TranscriptEntry, UnkeyedReason,
    UNENCRYPTED_WARNING,
};
pub use vault::KeyVault;
pub use websocket::{GatewayConnection, GatewayLink};
