//! Session Controller
//!
//! Single point of truth for "is there an outstanding request". Every
//! transition of the session or of a [`CallbackHandle`] goes through here,
//! serialized by one mutex around the session state.
//!
//! Lock order is always handle state first, then session state. Engine
//! callbacks run with only the handle's lock held, so the engine may issue its
//! next request from inside `process_response`.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::handle::{CallbackHandle, EngineRequestCallback, HandleState, Resolution};
use super::state::{
    ActiveHandle, ActiveSession, EngineStatus, HandleId, SessionPhase, SessionStatus,
};

/// Errors local to the relay. None of these cross the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("A session is already in progress")]
    AlreadyActive,

    #[error("No session in progress")]
    NoSession,

    #[error("Request {0} is still outstanding")]
    RequestInFlight(HandleId),

    #[error("Handle {0} is not the active request")]
    NotActive(HandleId),

    #[error("Handle {0} was already resolved")]
    AlreadyResolved(HandleId),
}

/// What the controller knows about a session once the engine has exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub status: EngineStatus,
    pub last_status: SessionStatus,
    /// None if the session had been aborted (or never started)
    pub correlation_id: Option<String>,
    pub round_trips: u32,
}

#[derive(Debug, Default)]
struct SessionInner {
    phase: SessionPhase,
    last_status: SessionStatus,
}

/// Orchestrates one verification session at a time
#[derive(Debug, Clone, Default)]
pub struct SessionController {
    inner: Arc<Mutex<SessionInner>>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a verification attempt and return its correlation id
    pub fn begin_session(&self) -> Result<String, RelayError> {
        let mut inner = self.inner.lock();
        if inner.phase.is_busy() {
            warn!("Refusing to begin a session while one is in progress");
            return Err(RelayError::AlreadyActive);
        }

        let correlation_id = new_correlation_id();
        inner.phase = SessionPhase::Active(ActiveSession::new(correlation_id.clone()));
        inner.last_status = SessionStatus::None;

        info!("Began session {}", correlation_id);
        Ok(correlation_id)
    }

    /// Register a new engine request as the active handle.
    ///
    /// A live handle is never overwritten: a second request while one is
    /// outstanding is refused and logged as a contract violation.
    pub fn on_session_request(
        &self,
        request_blob: String,
        engine: Arc<dyn EngineRequestCallback>,
    ) -> Result<Arc<CallbackHandle>, RelayError> {
        let mut inner = self.inner.lock();
        let session = match inner.phase.active_mut() {
            Some(session) => session,
            None => {
                warn!("Session request received with no session in progress");
                return Err(RelayError::NoSession);
            }
        };

        if let Some(live) = &session.active_handle {
            error!(
                "Session request received while handle {} is still outstanding, keeping the live handle",
                live.id
            );
            return Err(RelayError::RequestInFlight(live.id));
        }

        let handle = Arc::new(CallbackHandle::new(
            HandleId::next(),
            session.correlation_id.clone(),
            request_blob,
            engine,
            self.clone(),
        ));
        session.active_handle = Some(ActiveHandle {
            id: handle.id(),
            handle: Arc::downgrade(&handle),
        });
        session.round_trips += 1;

        debug!(
            "Registered handle {} (round trip {} of session {}, {} bytes)",
            handle.id(),
            session.round_trips,
            session.correlation_id,
            handle.request_blob().len()
        );
        Ok(handle)
    }

    /// Resolve the active handle with the backend's response
    pub fn resolve_with_response(
        &self,
        handle: &CallbackHandle,
        response_blob: String,
    ) -> Result<(), RelayError> {
        let mut state = handle.lock_state();
        check_open(handle, &state, "process_response")?;
        {
            let mut inner = self.inner.lock();
            take_active(&mut inner.phase, handle, &mut state, "process_response")?;
        }
        *state = HandleState::Resolved(Resolution::Response);

        debug!(
            "Delivering response for handle {} ({} bytes)",
            handle.id(),
            response_blob.len()
        );
        handle.engine().process_response(response_blob);
        Ok(())
    }

    /// Forward upload progress for the active handle.
    ///
    /// Values are clamped to [0, 1]; non-finite values and values below the
    /// last delivered one are dropped.
    pub fn report_progress(&self, handle: &CallbackHandle, progress: f32) -> Result<(), RelayError> {
        let mut state = handle.lock_state();
        let last_progress = match *state {
            HandleState::Open { last_progress } => last_progress,
            HandleState::Resolved(Resolution::SessionEnded) => {
                debug!("Dropping progress for handle {}, session ended", handle.id());
                return Err(RelayError::NotActive(handle.id()));
            }
            HandleState::Resolved(_) => {
                debug!("Dropping progress for resolved handle {}", handle.id());
                return Err(RelayError::AlreadyResolved(handle.id()));
            }
        };

        if !self.holds(handle) {
            debug!("Dropping progress for stale handle {}", handle.id());
            *state = HandleState::Resolved(Resolution::SessionEnded);
            return Err(RelayError::NotActive(handle.id()));
        }

        if !progress.is_finite() {
            warn!("Ignoring non-finite progress for handle {}", handle.id());
            return Ok(());
        }

        let progress = progress.clamp(0.0, 1.0);
        if last_progress.map(|last| progress < last).unwrap_or(false) {
            debug!("Ignoring progress regression for handle {}", handle.id());
            return Ok(());
        }

        *state = HandleState::Open {
            last_progress: Some(progress),
        };
        handle.engine().update_progress(progress);

        // The engine may have exited from inside the callback
        if !self.holds(handle) {
            debug!("Handle {} went stale during progress delivery", handle.id());
            *state = HandleState::Resolved(Resolution::SessionEnded);
        }
        Ok(())
    }

    /// Abort the active handle after an unrecoverable transport failure.
    ///
    /// The session stays busy until the engine reports its final status.
    pub fn abort_catastrophically(&self, handle: &CallbackHandle) -> Result<(), RelayError> {
        let mut state = handle.lock_state();
        check_open(handle, &state, "abort_on_catastrophic_error")?;
        let round_trips = {
            let mut inner = self.inner.lock();
            take_active(&mut inner.phase, handle, &mut state, "abort_on_catastrophic_error")?;
            let round_trips = inner.phase.active().map(|s| s.round_trips).unwrap_or(0);
            inner.phase = SessionPhase::Aborted { round_trips };
            inner.last_status = SessionStatus::Aborted;
            round_trips
        };
        *state = HandleState::Resolved(Resolution::CatastrophicAbort);

        warn!(
            "Catastrophic abort of handle {} in session {} after {} round trips",
            handle.id(),
            handle.correlation_id(),
            round_trips
        );
        handle.engine().abort_on_catastrophic_error();
        Ok(())
    }

    /// The engine has exited. Clears all session state.
    ///
    /// Resetting host-side correlation state on a non-completed status is the
    /// caller's job.
    pub fn on_engine_final_status(&self, status: EngineStatus) -> SessionSummary {
        let (previous, last_status) = {
            let mut inner = self.inner.lock();
            let previous = std::mem::take(&mut inner.phase);
            let last_status = match previous {
                SessionPhase::Aborted { .. } => SessionStatus::Aborted,
                _ => SessionStatus::from(status),
            };
            if previous.is_busy() {
                inner.last_status = last_status;
            }
            (previous, last_status)
        };

        let (correlation_id, round_trips, orphan) = match previous {
            SessionPhase::Active(session) => (
                Some(session.correlation_id),
                session.round_trips,
                session.active_handle,
            ),
            SessionPhase::Aborted { round_trips } => (None, round_trips, None),
            SessionPhase::Idle => {
                warn!("Engine reported {:?} with no session in progress", status);
                (None, 0, None)
            }
        };

        // Anything still in flight is now stale. try_lock: the engine may be
        // exiting from inside a delivery on this very handle. Whoever holds the
        // lock marks it instead, see `holds`.
        if let Some(orphan) = orphan.and_then(|active| active.handle.upgrade()) {
            if let Some(mut state) = orphan.try_lock_state() {
                if state.is_open() {
                    *state = HandleState::Resolved(Resolution::SessionEnded);
                }
            }
            info!("Handle {} was still outstanding when the engine exited", orphan.id());
        }

        info!(
            "Engine exited: {:?} ({:?}) after {} round trips",
            status, last_status, round_trips
        );

        SessionSummary {
            status,
            last_status,
            correlation_id,
            round_trips,
        }
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.inner.lock().phase.correlation_id().map(str::to_string)
    }

    pub fn last_status(&self) -> SessionStatus {
        self.inner.lock().last_status
    }

    /// True from `begin_session` until the engine's final status
    pub fn is_session_in_progress(&self) -> bool {
        self.inner.lock().phase.is_busy()
    }

    /// Check if the handle is still the active one.
    ///
    /// Callers holding the handle's lock mark an open handle as ended when this
    /// turns false.
    pub(super) fn holds(&self, handle: &CallbackHandle) -> bool {
        self.inner.lock().phase.holds(handle.id())
    }

    pub fn has_outstanding_request(&self) -> bool {
        self.inner
            .lock()
            .phase
            .active()
            .map(|s| s.active_handle.is_some())
            .unwrap_or(false)
    }
}

/// Called with the handle's state lock held
fn check_open(handle: &CallbackHandle, state: &HandleState, op: &str) -> Result<(), RelayError> {
    match state {
        HandleState::Open { .. } => Ok(()),
        HandleState::Resolved(Resolution::SessionEnded) => {
            warn!("{} on handle {} after its session ended, ignoring", op, handle.id());
            Err(RelayError::NotActive(handle.id()))
        }
        HandleState::Resolved(_) => {
            error!("{} on handle {} which was already resolved", op, handle.id());
            Err(RelayError::AlreadyResolved(handle.id()))
        }
    }
}

/// Clear the active handle if it is this one, otherwise mark the handle ended.
/// Called with the handle's state lock held.
fn take_active(
    phase: &mut SessionPhase,
    handle: &CallbackHandle,
    state: &mut HandleState,
    op: &str,
) -> Result<(), RelayError> {
    match phase.active_mut() {
        Some(session) if session.holds(handle.id()) => {
            session.active_handle = None;
            Ok(())
        }
        _ => {
            warn!("{} on stale handle {}, ignoring", op, handle.id());
            *state = HandleState::Resolved(Resolution::SessionEnded);
            Err(RelayError::NotActive(handle.id()))
        }
    }
}

/// 128 random bits as lowercase hex
fn new_correlation_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:032x}", rng.gen::<u128>())
}
