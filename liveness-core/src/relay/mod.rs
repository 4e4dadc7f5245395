//! Relay Transport
//!
//! Carries opaque request blobs across the runtime boundary to an uploader.

mod protocol;
mod transport;

pub use protocol::*;
pub use transport::{RelayCommand, RelayEvent, RelayHandle, RelayTransport, TransportError};
