//! Session Relay
//!
//! Tracks the verification session and the single outstanding engine request.

mod controller;
mod handle;
mod state;

pub use controller::*;
pub use handle::*;
pub use state::*;
