//! Relay event handlers

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::relay::RelayEvent;
use crate::session::RelayError;
use crate::upload::UploadEvent;

use super::types::HostCallback;

/// Resolve a handle from a relay event
pub fn handle_relay_event(
    event: RelayEvent,
    callback: &Arc<RwLock<Option<Arc<dyn HostCallback>>>>,
) {
    let RelayEvent { handle, kind } = event;

    match kind {
        UploadEvent::Progress(progress) => {
            handle.update_progress(progress);
        }

        UploadEvent::Response(blob) => {
            if let Err(e) = handle.process_response(blob) {
                debug!("Response for handle {} not delivered: {}", handle.id(), e);
            }
        }

        UploadEvent::TransportFailure(message) => {
            warn!("Transport failure for handle {}: {}", handle.id(), message);
            match handle.abort_on_catastrophic_error() {
                Ok(()) => {
                    let cb = callback.read().clone();
                    if let Some(cb) = cb {
                        cb.on_error(message);
                    }
                }
                Err(RelayError::NotActive(_)) => {
                    debug!("Handle {} already stale, nothing to abort", handle.id());
                }
                Err(e) => {
                    debug!("Abort for handle {} not delivered: {}", handle.id(), e);
                }
            }
        }
    }
}
