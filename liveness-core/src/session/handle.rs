//! Single-use callback handle for one round trip

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

use super::controller::{RelayError, SessionController};
use super::state::HandleId;

/// The capture engine's request callback, implemented by each platform adapter
/// around the engine's own callback object.
#[uniffi::export(callback_interface)]
pub trait EngineRequestCallback: Send + Sync {
    fn process_response(&self, response_blob: String);
    fn update_progress(&self, progress: f32);
    fn abort_on_catastrophic_error(&self);
}

/// Why a handle stopped accepting operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A response blob was delivered
    Response,
    /// The engine was told to abort after a transport failure
    CatastrophicAbort,
    /// The engine exited while the request was still in flight
    SessionEnded,
}

/// Lifecycle of a handle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandleState {
    Open {
        /// Last progress value delivered to the engine
        last_progress: Option<f32>,
    },
    Resolved(Resolution),
}

impl HandleState {
    pub fn is_open(&self) -> bool {
        matches!(self, HandleState::Open { .. })
    }
}

/// Capability for one outstanding engine request.
///
/// Only the owning [`SessionController`] transitions the state. The state lock
/// is held while delivering to the engine, so a progress update can never
/// reach the engine after the terminal message of the same handle.
pub struct CallbackHandle {
    id: HandleId,
    correlation_id: String,
    request_blob: String,
    engine: Arc<dyn EngineRequestCallback>,
    state: Mutex<HandleState>,
    controller: SessionController,
}

impl CallbackHandle {
    pub(crate) fn new(
        id: HandleId,
        correlation_id: String,
        request_blob: String,
        engine: Arc<dyn EngineRequestCallback>,
        controller: SessionController,
    ) -> Self {
        Self {
            id,
            correlation_id,
            request_blob,
            engine,
            state: Mutex::new(HandleState::Open { last_progress: None }),
            controller,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Correlation id of the session this request belongs to
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn request_blob(&self) -> &str {
        &self.request_blob
    }

    /// Current state. An open handle the controller no longer holds is ended.
    pub fn state(&self) -> HandleState {
        let mut state = self.state.lock();
        if state.is_open() && !self.controller.holds(self) {
            *state = HandleState::Resolved(Resolution::SessionEnded);
        }
        *state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Hand the backend's response blob to the engine. Terminal.
    pub fn process_response(&self, response_blob: String) -> Result<(), RelayError> {
        self.controller.resolve_with_response(self, response_blob)
    }

    /// Forward upload progress to the engine.
    ///
    /// Progress racing with resolution is expected, so failures are only logged.
    pub fn update_progress(&self, progress: f32) {
        let _ = self.controller.report_progress(self, progress);
    }

    /// Tell the engine the request can never complete. Terminal.
    ///
    /// Reserved for unrecoverable transport failures.
    pub fn abort_on_catastrophic_error(&self) -> Result<(), RelayError> {
        self.controller.abort_catastrophically(self)
    }

    pub(super) fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock()
    }

    pub(super) fn try_lock_state(&self) -> Option<MutexGuard<'_, HandleState>> {
        self.state.try_lock()
    }

    pub(super) fn engine(&self) -> &dyn EngineRequestCallback {
        self.engine.as_ref()
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("request_len", &self.request_blob.len())
            // try_lock: Debug may run while the state lock is held
            .field("state", &self.state.try_lock().map(|s| *s))
            .finish()
    }
}
