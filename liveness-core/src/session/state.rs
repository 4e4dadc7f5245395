//! Session State Management

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use super::handle::CallbackHandle;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, used as the request id on the wire
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Final status reported by the capture engine when it exits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, uniffi::Enum)]
pub enum EngineStatus {
    SessionCompleted,
    RequestAborted,
    CameraPermissionsDenied,
    UserCancelledFaceScan,
    UserCancelledIdScan,
    LockedOut,
    CameraError,
    UnknownInternalError,
}

impl EngineStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, EngineStatus::SessionCompleted)
    }

    /// Human-readable description for logs and host UI
    pub fn description(&self) -> &'static str {
        match self {
            EngineStatus::SessionCompleted => "Session was completed.",
            EngineStatus::RequestAborted => "A request was aborted.",
            EngineStatus::CameraPermissionsDenied => {
                "Camera is required but access prevented by user settings or administrator policy."
            }
            EngineStatus::UserCancelledFaceScan => "User cancelled before completing Face Scan session.",
            EngineStatus::UserCancelledIdScan => "User cancelled before completing ID Scan session.",
            EngineStatus::LockedOut => "Capture engine is in a lockout state.",
            EngineStatus::CameraError => "Session cancelled due to a camera error.",
            EngineStatus::UnknownInternalError => {
                "Session failed because an unknown or unexpected error occurred."
            }
        }
    }
}

/// How the last session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, uniffi::Enum)]
pub enum SessionStatus {
    #[default]
    None,
    Completed,
    Aborted,
    Failed,
}

impl From<EngineStatus> for SessionStatus {
    fn from(status: EngineStatus) -> Self {
        match status {
            EngineStatus::SessionCompleted => SessionStatus::Completed,
            EngineStatus::RequestAborted => SessionStatus::Aborted,
            _ => SessionStatus::Failed,
        }
    }
}

/// The handle currently allowed to resolve
#[derive(Debug, Clone)]
pub struct ActiveHandle {
    pub id: HandleId,
    /// Weak so the controller never keeps a handle (and through it, itself) alive
    pub handle: Weak<CallbackHandle>,
}

/// State of an in-progress verification attempt
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub correlation_id: String,
    pub active_handle: Option<ActiveHandle>,
    /// Number of requests issued so far
    pub round_trips: u32,
}

impl ActiveSession {
    pub fn new(correlation_id: String) -> Self {
        Self {
            correlation_id,
            active_handle: None,
            round_trips: 0,
        }
    }

    pub fn holds(&self, id: HandleId) -> bool {
        self.active_handle.as_ref().map(|a| a.id == id).unwrap_or(false)
    }
}

/// Where the controller is in the session lifecycle
#[derive(Debug, Default)]
pub enum SessionPhase {
    /// No verification attempt in progress
    #[default]
    Idle,
    /// A session is running
    Active(ActiveSession),
    /// A catastrophic abort happened, waiting for the engine to exit
    Aborted { round_trips: u32 },
}

impl SessionPhase {
    /// Check if a new session would be refused
    pub fn is_busy(&self) -> bool {
        !matches!(self, SessionPhase::Idle)
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        match self {
            SessionPhase::Active(session) => Some(session),
            _ => None,
        }
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveSession> {
        match self {
            SessionPhase::Active(session) => Some(session),
            _ => None,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.active().map(|s| s.correlation_id.as_str())
    }

    /// Check if the given handle is the active one
    pub fn holds(&self, id: HandleId) -> bool {
        self.active().map(|s| s.holds(id)).unwrap_or(false)
    }
}
