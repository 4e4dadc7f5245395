//! Liveness Relay - Core Library
//!
//! Relays opaque request blobs from an on-device capture engine to a
//! verification backend, one round trip at a time, and hands the response
//! (or a catastrophic abort) back to the engine.

pub mod config;
pub mod deeplink;
pub mod ffi;
pub mod relay;
pub mod session;
pub mod upload;

// Re-exports for convenience
pub use config::RelayConfig;
pub use deeplink::{DeepLinkPolicy, LaunchRequest};
pub use session::{CallbackHandle, EngineStatus, SessionController, SessionStatus};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
