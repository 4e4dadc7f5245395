//! Host-channel uploader
//!
//! For platforms that do their networking in the host runtime: requests go
//! out as `processSession` messages, results come back through
//! [`HostChannelUploader::deliver`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{receiver_stream, UploadEvent, UploadStream, Uploader};
use crate::relay::{ChannelMessage, RelayEnvelope};

/// Platform side of the host channel
#[uniffi::export(callback_interface)]
pub trait HostTransport: Send + Sync {
    /// Perform the upload described by a `processSession` message
    fn process_session(&self, message_json: String);
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Invalid channel message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unexpected outbound message for request {0}")]
    UnexpectedMethod(u64),

    #[error("No pending request {0}")]
    UnknownRequest(u64),
}

type PendingMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<UploadEvent>>>>;

#[derive(Clone)]
pub struct HostChannelUploader {
    transport: Arc<dyn HostTransport>,
    pending: PendingMap,
}

impl HostChannelUploader {
    pub fn new(transport: Arc<dyn HostTransport>) -> Self {
        Self {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Route an inbound message to its request
    pub fn deliver(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        let request_id = message.request_id();
        let event = message
            .into_upload_event()
            .ok_or(ChannelError::UnexpectedMethod(request_id))?;

        let mut pending = self.pending.lock();
        let sender = match pending.get(&request_id) {
            Some(sender) => sender,
            None => {
                warn!("Channel message for unknown request {}, ignoring", request_id);
                return Err(ChannelError::UnknownRequest(request_id));
            }
        };

        let terminal = event.is_terminal();
        if sender.send(event).is_err() || terminal {
            pending.remove(&request_id);
        }
        Ok(())
    }

    pub fn deliver_json(&self, json: &str) -> Result<(), ChannelError> {
        self.deliver(ChannelMessage::from_json(json)?)
    }

    /// Forget a request. Its stream ends; later messages for it are rejected.
    pub fn cancel(&self, request_id: u64) -> bool {
        self.pending.lock().remove(&request_id).is_some()
    }

    /// Number of requests awaiting a terminal message
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Uploader for HostChannelUploader {
    fn upload(&self, request_id: u64, envelope: RelayEnvelope) -> UploadStream {
        let (tx, rx) = mpsc::unbounded_channel();

        match ChannelMessage::process_session(request_id, envelope).to_json() {
            Ok(json) => {
                self.pending.lock().insert(request_id, tx);
                debug!("Handing request {} to the host transport", request_id);
                self.transport.process_session(json);
            }
            Err(e) => {
                let _ = tx.send(UploadEvent::TransportFailure(e.to_string()));
            }
        }

        receiver_stream(rx)
    }

    fn cancel_all(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            debug!("Dropping {} pending host requests", pending.len());
            pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
    }

    impl HostTransport for RecordingTransport {
        fn process_session(&self, message_json: String) {
            self.sent.lock().push(message_json);
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_host() {
        let transport = Arc::new(RecordingTransport::default());
        let uploader = HostChannelUploader::new(transport.clone());

        let stream = uploader.upload(9, RelayEnvelope::new("abc", "blobA"));
        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            ChannelMessage::from_json(&sent[0]).unwrap(),
            ChannelMessage::process_session(9, RelayEnvelope::new("abc", "blobA"))
        );
        assert_eq!(uploader.pending_requests(), 1);

        uploader
            .deliver_json(r#"{"method":"onUploadProgress","arguments":{"requestId":9,"progress":0.5}}"#)
            .unwrap();
        uploader
            .deliver_json(r#"{"method":"onResponseBlobReceived","arguments":{"requestId":9,"responseBlob":"respA"}}"#)
            .unwrap();
        assert_eq!(uploader.pending_requests(), 0);

        let events: Vec<UploadEvent> = stream.collect().await;
        assert_eq!(
            events,
            vec![UploadEvent::Progress(0.5), UploadEvent::Response("respA".to_string())]
        );
    }

    #[tokio::test]
    async fn test_messages_after_terminal_are_rejected() {
        let uploader = HostChannelUploader::new(Arc::new(RecordingTransport::default()));
        let _stream = uploader.upload(4, RelayEnvelope::new("abc", "blobA"));

        uploader
            .deliver(ChannelMessage::OnCatastrophicNetworkError {
                request_id: 4,
                message: "offline".to_string(),
            })
            .unwrap();

        let late = uploader.deliver(ChannelMessage::OnResponseBlobReceived {
            request_id: 4,
            response_blob: "late".to_string(),
        });
        assert!(matches!(late, Err(ChannelError::UnknownRequest(4))));
    }

    #[tokio::test]
    async fn test_cancelled_requests_end_their_streams() {
        let uploader = HostChannelUploader::new(Arc::new(RecordingTransport::default()));
        let first = uploader.upload(1, RelayEnvelope::new("abc", "blobA"));
        let second = uploader.upload(2, RelayEnvelope::new("abc", "blobB"));
        assert_eq!(uploader.pending_requests(), 2);

        assert!(uploader.cancel(1));
        assert!(!uploader.cancel(1));
        assert!(first.collect::<Vec<_>>().await.is_empty());

        uploader.cancel_all();
        assert_eq!(uploader.pending_requests(), 0);
        assert!(second.collect::<Vec<_>>().await.is_empty());

        let late = uploader.deliver(ChannelMessage::OnUploadProgress {
            request_id: 2,
            progress: 0.5,
        });
        assert!(matches!(late, Err(ChannelError::UnknownRequest(2))));
    }

    #[test]
    fn test_rejects_outbound_and_garbage() {
        let uploader = HostChannelUploader::new(Arc::new(RecordingTransport::default()));
        let outbound = ChannelMessage::process_session(1, RelayEnvelope::new("abc", "blob"));
        assert!(matches!(uploader.deliver(outbound), Err(ChannelError::UnexpectedMethod(1))));
        assert!(matches!(uploader.deliver_json("{}"), Err(ChannelError::Decode(_))));
    }
}
