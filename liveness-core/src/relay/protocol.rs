//! Relay Protocol Messages

use serde::{Deserialize, Serialize};

use crate::upload::UploadEvent;

/// One marshaled engine request, as handed to an uploader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    /// Session the request belongs to
    pub correlation_id: String,
    /// Opaque, never inspected
    pub request_blob: String,
    /// Host-application correlation id, omitted when empty
    #[serde(
        rename = "externalDatabaseRefID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub external_database_ref_id: String,
}

impl RelayEnvelope {
    pub fn new(correlation_id: impl Into<String>, request_blob: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            request_blob: request_blob.into(),
            external_database_ref_id: String::new(),
        }
    }

    pub fn with_external_database_ref_id(mut self, ref_id: impl Into<String>) -> Self {
        self.external_database_ref_id = ref_id.into();
        self
    }
}

/// Messages exchanged with a host that performs the network exchange itself.
///
/// JSON form is `{"method": "...", "arguments": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "arguments", rename_all = "camelCase")]
pub enum ChannelMessage {
    // === Outbound ===
    /// Ask the host to upload a request blob
    #[serde(rename_all = "camelCase")]
    ProcessSession {
        request_id: u64,
        correlation_id: String,
        request_blob: String,
        #[serde(
            rename = "externalDatabaseRefID",
            default,
            skip_serializing_if = "String::is_empty"
        )]
        external_database_ref_id: String,
    },

    // === Inbound ===
    /// The backend answered
    #[serde(rename_all = "camelCase")]
    OnResponseBlobReceived { request_id: u64, response_blob: String },

    /// Upload progress in [0, 1]
    #[serde(rename_all = "camelCase")]
    OnUploadProgress { request_id: u64, progress: f32 },

    /// The host gave up on the request
    #[serde(rename_all = "camelCase")]
    OnCatastrophicNetworkError {
        request_id: u64,
        #[serde(default)]
        message: String,
    },
}

impl ChannelMessage {
    pub fn process_session(request_id: u64, envelope: RelayEnvelope) -> Self {
        ChannelMessage::ProcessSession {
            request_id,
            correlation_id: envelope.correlation_id,
            request_blob: envelope.request_blob,
            external_database_ref_id: envelope.external_database_ref_id,
        }
    }

    pub fn request_id(&self) -> u64 {
        match self {
            ChannelMessage::ProcessSession { request_id, .. }
            | ChannelMessage::OnResponseBlobReceived { request_id, .. }
            | ChannelMessage::OnUploadProgress { request_id, .. }
            | ChannelMessage::OnCatastrophicNetworkError { request_id, .. } => *request_id,
        }
    }

    /// Convert an inbound message into the uploader event it carries.
    /// None for outbound messages.
    pub fn into_upload_event(self) -> Option<UploadEvent> {
        match self {
            ChannelMessage::ProcessSession { .. } => None,
            ChannelMessage::OnResponseBlobReceived { response_blob, .. } => {
                Some(UploadEvent::Response(response_blob))
            }
            ChannelMessage::OnUploadProgress { progress, .. } => Some(UploadEvent::Progress(progress)),
            ChannelMessage::OnCatastrophicNetworkError { message, .. } => {
                let message = if message.is_empty() {
                    "Host reported a catastrophic network error".to_string()
                } else {
                    message
                };
                Some(UploadEvent::TransportFailure(message))
            }
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
