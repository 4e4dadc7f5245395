//! Relay transport
//!
//! Background task that carries request envelopes to the uploader and
//! uploader events back to the session owner.

use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::protocol::RelayEnvelope;
use crate::session::CallbackHandle;
use crate::upload::{UploadEvent, UploadStream, Uploader};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Relay task closed")]
    Closed,
}

/// An uploader event, tagged with the handle it resolves
#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub handle: Arc<CallbackHandle>,
    pub kind: UploadEvent,
}

/// Commands sent to the relay task
#[derive(Debug)]
pub enum RelayCommand {
    /// Upload a request on behalf of a handle
    Forward {
        handle: Arc<CallbackHandle>,
        envelope: RelayEnvelope,
    },
    /// Stop the relay, dropping in-flight uploads
    Shutdown,
}

/// Handle to communicate with the running relay
#[derive(Clone)]
pub struct RelayHandle {
    command_tx: mpsc::UnboundedSender<RelayCommand>,
}

impl RelayHandle {
    pub fn forward(
        &self,
        handle: Arc<CallbackHandle>,
        envelope: RelayEnvelope,
    ) -> Result<(), TransportError> {
        self.command_tx
            .send(RelayCommand::Forward { handle, envelope })
            .map_err(|_| TransportError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(RelayCommand::Shutdown);
    }
}

pub struct RelayTransport {
    uploader: Arc<dyn Uploader>,
}

impl RelayTransport {
    pub fn new(uploader: Arc<dyn Uploader>) -> Self {
        Self { uploader }
    }

    /// Start the relay task and return a handle for communication.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> (RelayHandle, mpsc::UnboundedReceiver<RelayEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            self.run(event_tx, command_rx).await;
        });

        (RelayHandle { command_tx }, event_rx)
    }

    async fn run(
        self,
        event_tx: mpsc::UnboundedSender<RelayEvent>,
        mut command_rx: mpsc::UnboundedReceiver<RelayCommand>,
    ) {
        let mut uploads = JoinSet::new();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(RelayCommand::Forward { handle, envelope }) => {
                            debug!(
                                "Forwarding request {} of session {}",
                                handle.id(),
                                envelope.correlation_id
                            );
                            let stream = self.uploader.upload(handle.id().value(), envelope);
                            uploads.spawn(pump(stream, handle, event_tx.clone()));
                        }
                        Some(RelayCommand::Shutdown) | None => {
                            info!("Relay shutting down ({} uploads in flight)", uploads.len());
                            self.uploader.cancel_all();
                            break;
                        }
                    }
                }
                Some(_) = uploads.join_next(), if !uploads.is_empty() => {}
            }
        }

        uploads.abort_all();
    }
}

/// Pump one upload stream until its terminal event
async fn pump(
    mut stream: UploadStream,
    handle: Arc<CallbackHandle>,
    event_tx: mpsc::UnboundedSender<RelayEvent>,
) {
    while let Some(kind) = stream.next().await {
        let terminal = kind.is_terminal();
        let event = RelayEvent {
            handle: Arc::clone(&handle),
            kind,
        };
        if event_tx.send(event).is_err() || terminal {
            return;
        }
    }

    warn!("Upload for request {} ended without a result", handle.id());
    let _ = event_tx.send(RelayEvent {
        handle,
        kind: UploadEvent::TransportFailure("Upload ended without a response".to_string()),
    });
}
