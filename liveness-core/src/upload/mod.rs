//! Uploaders
//!
//! Perform the network exchange for one request blob and report back as a
//! stream of events.

mod channel;
mod http;

pub use channel::{ChannelError, HostChannelUploader, HostTransport};
pub use http::{HttpUploader, UploadError};

use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::relay::RelayEnvelope;

/// Something the uploader observed about one request
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// Fraction of the request sent so far
    Progress(f32),
    /// The backend's response blob
    Response(String),
    /// The request can never complete
    TransportFailure(String),
}

impl UploadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadEvent::Progress(_))
    }
}

pub type UploadStream = BoxStream<'static, UploadEvent>;

/// Performs the network exchange for request blobs.
///
/// A stream should end with exactly one terminal event. Retrying is the
/// uploader's business; whatever it reports as a failure is final.
pub trait Uploader: Send + Sync {
    fn upload(&self, request_id: u64, envelope: RelayEnvelope) -> UploadStream;

    /// Drop every in-flight request. Their streams end without a result.
    fn cancel_all(&self) {}
}

/// Adapt a channel receiver into an upload stream
pub(crate) fn receiver_stream(mut rx: mpsc::UnboundedReceiver<UploadEvent>) -> UploadStream {
    Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
}
