//! FFI types exposed via uniffi

use crate::config::ConfigError;
use crate::deeplink::DeepLinkError;
use crate::session::{EngineStatus, RelayError, SessionStatus, SessionSummary};
use crate::upload::ChannelError;

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("A session is already in progress")]
    SessionInProgress,

    #[error("No session in progress")]
    NoSession,

    #[error("Request error: {0}")]
    RequestError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Invalid launch URL: {0}")]
    InvalidLaunchUrl(String),
}

impl From<RelayError> for CoreError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::AlreadyActive => CoreError::SessionInProgress,
            RelayError::NoSession => CoreError::NoSession,
            other => CoreError::RequestError(other.to_string()),
        }
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::InvalidConfig(e.to_string())
    }
}

impl From<ChannelError> for CoreError {
    fn from(e: ChannelError) -> Self {
        CoreError::ChannelError(e.to_string())
    }
}

impl From<DeepLinkError> for CoreError {
    fn from(e: DeepLinkError) -> Self {
        CoreError::InvalidLaunchUrl(e.to_string())
    }
}

/// Outcome of a verification session, reported to the host
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct SessionResult {
    pub status: EngineStatus,
    pub last_status: SessionStatus,
    /// None if the session was aborted
    pub correlation_id: Option<String>,
    pub round_trips: u32,
    pub description: String,
}

impl SessionResult {
    pub fn is_successful(&self) -> bool {
        self.status.is_success()
    }
}

impl From<SessionSummary> for SessionResult {
    fn from(s: SessionSummary) -> Self {
        Self {
            status: s.status,
            last_status: s.last_status,
            correlation_id: s.correlation_id,
            round_trips: s.round_trips,
            description: s.status.description().to_string(),
        }
    }
}

/// Callback interface for host application events
#[uniffi::export(callback_interface)]
pub trait HostCallback: Send + Sync {
    fn on_session_started(&self, correlation_id: String);
    fn on_session_finished(&self, result: SessionResult);
    fn on_error(&self, message: String);
}
