//! Verification session implementation for FFI

use parking_lot::RwLock;
use std::sync::{Arc, Once, OnceLock};
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::deeplink::{DeepLinkPolicy, LaunchRequest};
use crate::relay::{RelayEnvelope, RelayHandle, RelayTransport};
use crate::session::{
    CallbackHandle, EngineRequestCallback, EngineStatus, RelayError, SessionController,
    SessionStatus,
};
use crate::upload::{HostChannelUploader, HostTransport, HttpUploader, Uploader};

use super::handlers::handle_relay_event;
use super::types::*;

static TRACING_INIT: Once = Once::new();

const DEFAULT_LOG_FILTER: &str = "liveness_core=debug,reqwest=off,hyper=off,hyper_util=off";

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
        let _ = tracing_subscriber::fmt()
            .with_ansi(false) // Xcode / logcat consoles
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Engine-facing entry point and host delegate.
///
/// The engine calls `on_session_request` and `on_engine_exit`; everything in
/// between runs on the session's own runtime.
#[derive(uniffi::Object)]
pub struct VerificationSession {
    /// Taken on drop
    runtime: Option<Runtime>,
    controller: SessionController,
    relay: RelayHandle,
    /// Set when the host performs uploads itself
    channel: Option<HostChannelUploader>,
    callback: Arc<RwLock<Option<Arc<dyn HostCallback>>>>,
    /// Host-application correlation id sent with every upload
    external_database_ref_id: RwLock<String>,
}

#[uniffi::export]
impl VerificationSession {
    /// Create a session that uploads to the configured endpoint over HTTP
    #[uniffi::constructor]
    pub fn new(config: RelayConfig) -> Result<Arc<Self>, CoreError> {
        init_tracing();
        let uploader = HttpUploader::new(&config)?;
        info!("Initializing verification session for {}", uploader.endpoint());
        Ok(Arc::new(Self::start(Arc::new(uploader), None)))
    }

    /// Create a session whose uploads are performed by the host
    #[uniffi::constructor]
    pub fn with_host_transport(transport: Box<dyn HostTransport>) -> Arc<Self> {
        init_tracing();
        info!("Initializing verification session with host transport");
        let channel = HostChannelUploader::new(Arc::from(transport));
        Arc::new(Self::start(Arc::new(channel.clone()), Some(channel)))
    }

    /// Set the host event callback
    pub fn set_callback(&self, callback: Box<dyn HostCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Start a verification attempt, before launching the engine
    pub fn begin_session(&self) -> Result<String, CoreError> {
        let correlation_id = self.controller.begin_session()?;
        if let Some(cb) = self.host_callback() {
            cb.on_session_started(correlation_id.clone());
        }
        Ok(correlation_id)
    }

    /// Engine entry: a request blob is ready for the backend
    pub fn on_session_request(&self, request_blob: String, callback: Box<dyn EngineRequestCallback>) {
        if let Err(e) = self.submit_request(request_blob, Arc::from(callback)) {
            error!("Session request rejected: {}", e);
        }
    }

    /// Engine entry: the engine has exited with its final status
    pub fn on_engine_exit(&self, status: EngineStatus) -> SessionResult {
        let result = SessionResult::from(self.controller.on_engine_final_status(status));

        // Host replies for this session can no longer resolve anything
        if let Some(channel) = &self.channel {
            channel.cancel_all();
        }

        if !status.is_success() {
            let mut ref_id = self.external_database_ref_id.write();
            if !ref_id.is_empty() {
                debug!("Resetting external database ref id");
                ref_id.clear();
            }
        }

        info!("Session finished: {}", result.description);
        if let Some(cb) = self.host_callback() {
            cb.on_session_finished(result.clone());
        }
        result
    }

    pub fn set_external_database_ref_id(&self, ref_id: String) {
        *self.external_database_ref_id.write() = ref_id;
    }

    pub fn external_database_ref_id(&self) -> String {
        self.external_database_ref_id.read().clone()
    }

    /// Feed a host transport reply (JSON channel message) back into the relay
    pub fn deliver_channel_message(&self, message_json: String) -> Result<(), CoreError> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| CoreError::ChannelError("No host transport configured".to_string()))?;
        channel.deliver_json(&message_json)?;
        Ok(())
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.controller.correlation_id()
    }

    pub fn last_status(&self) -> SessionStatus {
        self.controller.last_status()
    }

    pub fn is_session_in_progress(&self) -> bool {
        self.controller.is_session_in_progress()
    }

    pub fn has_outstanding_request(&self) -> bool {
        self.controller.has_outstanding_request()
    }
}

impl VerificationSession {
    fn start(uploader: Arc<dyn Uploader>, channel: Option<HostChannelUploader>) -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");

        let (relay, mut event_rx) = runtime.block_on(async { RelayTransport::new(uploader).start() });

        let callback: Arc<RwLock<Option<Arc<dyn HostCallback>>>> = Arc::new(RwLock::new(None));
        let callback_clone = Arc::clone(&callback);
        runtime.spawn(async move {
            while let Some(event) = event_rx.recv().await {
                handle_relay_event(event, &callback_clone);
            }
            debug!("Relay event loop finished");
        });

        Self {
            runtime: Some(runtime),
            controller: SessionController::new(),
            relay,
            channel,
            callback,
            external_database_ref_id: RwLock::new(String::new()),
        }
    }

    /// Register the request and hand it to the relay
    pub(crate) fn submit_request(
        &self,
        request_blob: String,
        engine: Arc<dyn EngineRequestCallback>,
    ) -> Result<Arc<CallbackHandle>, RelayError> {
        let handle = self.controller.on_session_request(request_blob, engine)?;

        let envelope = RelayEnvelope::new(handle.correlation_id(), handle.request_blob())
            .with_external_database_ref_id(self.external_database_ref_id.read().clone());

        if let Err(e) = self.relay.forward(Arc::clone(&handle), envelope) {
            warn!("Could not forward handle {}: {}", handle.id(), e);
            let _ = handle.abort_on_catastrophic_error();
        }
        Ok(handle)
    }

    fn host_callback(&self) -> Option<Arc<dyn HostCallback>> {
        self.callback.read().clone()
    }
}

impl Drop for VerificationSession {
    fn drop(&mut self) {
        self.relay.shutdown();
        // Never block the host thread on in-flight uploads
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn default_policy() -> &'static DeepLinkPolicy {
    static POLICY: OnceLock<DeepLinkPolicy> = OnceLock::new();
    POLICY.get_or_init(DeepLinkPolicy::issuer_start_app)
}

/// Check whether a URL may launch a verification flow
#[uniffi::export]
pub fn is_valid_launch_url(url: String) -> bool {
    default_policy().accepts(&url)
}

/// Parse a launch URL into its session parameters
#[uniffi::export]
pub fn parse_launch_url(url: String) -> Result<LaunchRequest, CoreError> {
    Ok(default_policy().parse(&url)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ChannelMessage;
    use crate::session::testing::{EngineEvent, RecordingEngine};
    use parking_lot::{Condvar, Mutex};
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    struct Recorder<T> {
        items: Mutex<Vec<T>>,
        changed: Condvar,
    }

    impl<T: Clone> Recorder<T> {
        fn new() -> Self {
            Self {
                items: Mutex::new(Vec::new()),
                changed: Condvar::new(),
            }
        }

        fn push(&self, item: T) {
            self.items.lock().push(item);
            self.changed.notify_all();
        }

        fn items(&self) -> Vec<T> {
            self.items.lock().clone()
        }

        fn wait_for(&self, count: usize) -> Vec<T> {
            let deadline = Instant::now() + WAIT;
            let mut items = self.items.lock();
            while items.len() < count {
                if self.changed.wait_until(&mut items, deadline).timed_out() {
                    break;
                }
            }
            items.clone()
        }
    }

    struct RecordingTransport(Arc<Recorder<ChannelMessage>>);

    impl HostTransport for RecordingTransport {
        fn process_session(&self, message_json: String) {
            self.0.push(ChannelMessage::from_json(&message_json).unwrap());
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum HostEvent {
        Started(String),
        Finished(SessionResult),
        Error(String),
    }

    struct RecordingHost(Arc<Recorder<HostEvent>>);

    impl HostCallback for RecordingHost {
        fn on_session_started(&self, correlation_id: String) {
            self.0.push(HostEvent::Started(correlation_id));
        }

        fn on_session_finished(&self, result: SessionResult) {
            self.0.push(HostEvent::Finished(result));
        }

        fn on_error(&self, message: String) {
            self.0.push(HostEvent::Error(message));
        }
    }

    struct Fixture {
        session: Arc<VerificationSession>,
        sent: Arc<Recorder<ChannelMessage>>,
        host: Arc<Recorder<HostEvent>>,
    }

    fn fixture() -> Fixture {
        let sent = Arc::new(Recorder::new());
        let host = Arc::new(Recorder::new());
        let session = VerificationSession::with_host_transport(Box::new(RecordingTransport(sent.clone())));
        session.set_callback(Box::new(RecordingHost(host.clone())));
        Fixture { session, sent, host }
    }

    fn reply(session: &VerificationSession, json: String) {
        session.deliver_channel_message(json).unwrap();
    }

    #[test]
    fn test_single_round_trip_completes() {
        let f = fixture();
        let correlation_id = f.session.begin_session().unwrap();
        f.session.set_external_database_ref_id("user-1".to_string());

        let engine = Arc::new(RecordingEngine::default());
        let handle = f.session.submit_request("blobA".to_string(), engine.clone()).unwrap();

        let sent = f.sent.wait_for(1);
        assert_eq!(
            sent,
            vec![ChannelMessage::ProcessSession {
                request_id: handle.id().value(),
                correlation_id: correlation_id.clone(),
                request_blob: "blobA".to_string(),
                external_database_ref_id: "user-1".to_string(),
            }]
        );

        let id = handle.id().value();
        reply(
            &f.session,
            format!(r#"{{"method":"onUploadProgress","arguments":{{"requestId":{},"progress":0.5}}}}"#, id),
        );
        reply(
            &f.session,
            format!(
                r#"{{"method":"onResponseBlobReceived","arguments":{{"requestId":{},"responseBlob":"respA"}}}}"#,
                id
            ),
        );

        assert!(engine.wait_for(2, WAIT));
        assert_eq!(
            engine.events(),
            vec![EngineEvent::Progress(0.5), EngineEvent::Response("respA".to_string())]
        );
        assert!(!f.session.has_outstanding_request());

        let result = f.session.on_engine_exit(EngineStatus::SessionCompleted);
        assert!(result.is_successful());
        assert_eq!(result.last_status, SessionStatus::Completed);
        assert_eq!(result.correlation_id, Some(correlation_id.clone()));
        assert_eq!(result.round_trips, 1);
        assert_eq!(f.session.external_database_ref_id(), "user-1");

        assert_eq!(
            f.host.items(),
            vec![HostEvent::Started(correlation_id), HostEvent::Finished(result)]
        );
    }

    #[test]
    fn test_transport_failure_aborts_engine() {
        let f = fixture();
        f.session.begin_session().unwrap();
        f.session.set_external_database_ref_id("user-1".to_string());

        let engine = Arc::new(RecordingEngine::default());
        let handle = f.session.submit_request("blobC".to_string(), engine.clone()).unwrap();
        f.sent.wait_for(1);

        reply(
            &f.session,
            format!(
                r#"{{"method":"onCatastrophicNetworkError","arguments":{{"requestId":{},"message":"offline"}}}}"#,
                handle.id().value()
            ),
        );

        assert!(engine.wait_for(1, WAIT));
        assert_eq!(engine.events(), vec![EngineEvent::Abort]);
        let host = f.host.wait_for(2);
        assert_eq!(host[1], HostEvent::Error("offline".to_string()));

        assert_eq!(f.session.last_status(), SessionStatus::Aborted);
        assert_eq!(f.session.correlation_id(), None);
        assert!(matches!(f.session.begin_session(), Err(CoreError::SessionInProgress)));

        let result = f.session.on_engine_exit(EngineStatus::UnknownInternalError);
        assert_eq!(result.last_status, SessionStatus::Aborted);
        assert_eq!(result.correlation_id, None);
        assert_eq!(f.session.external_database_ref_id(), "");
        assert!(f.session.begin_session().is_ok());
    }

    #[test]
    fn test_second_request_while_in_flight_is_rejected() {
        let f = fixture();
        f.session.begin_session().unwrap();

        let first_engine = Arc::new(RecordingEngine::default());
        let first = f.session.submit_request("blobA".to_string(), first_engine.clone()).unwrap();

        let err = f
            .session
            .submit_request("blobB".to_string(), Arc::new(RecordingEngine::default()))
            .unwrap_err();
        assert_eq!(err, RelayError::RequestInFlight(first.id()));
        assert_eq!(f.sent.wait_for(1).len(), 1);

        reply(
            &f.session,
            format!(
                r#"{{"method":"onResponseBlobReceived","arguments":{{"requestId":{},"responseBlob":"respA"}}}}"#,
                first.id().value()
            ),
        );
        assert!(first_engine.wait_for(1, WAIT));
        assert_eq!(first_engine.events(), vec![EngineEvent::Response("respA".to_string())]);
    }

    #[test]
    fn test_request_without_session_is_dropped() {
        let f = fixture();
        let err = f
            .session
            .submit_request("blobA".to_string(), Arc::new(RecordingEngine::default()))
            .unwrap_err();
        assert_eq!(err, RelayError::NoSession);
        assert!(f.sent.items().is_empty());
    }

    #[test]
    fn test_engine_exit_drops_pending_host_request() {
        let f = fixture();
        f.session.begin_session().unwrap();

        let engine = Arc::new(RecordingEngine::default());
        let handle = f.session.submit_request("blobA".to_string(), engine.clone()).unwrap();
        f.sent.wait_for(1);

        let result = f.session.on_engine_exit(EngineStatus::UserCancelledFaceScan);
        assert_eq!(result.last_status, SessionStatus::Failed);

        assert!(!handle.is_open());

        // The pending host request was dropped with the session
        let late = f.session.deliver_channel_message(format!(
            r#"{{"method":"onResponseBlobReceived","arguments":{{"requestId":{},"responseBlob":"late"}}}}"#,
            handle.id().value()
        ));
        assert!(matches!(late, Err(CoreError::ChannelError(_))));

        // Give the event loop a chance to run
        std::thread::sleep(Duration::from_millis(50));
        assert!(engine.events().is_empty());
        assert!(!f.host.items().iter().any(|e| matches!(e, HostEvent::Error(_))));
    }

    #[test]
    fn test_channel_message_requires_host_transport() {
        let session = VerificationSession::new(RelayConfig::default()).unwrap();
        assert!(matches!(
            session.deliver_channel_message("{}".to_string()),
            Err(CoreError::ChannelError(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = VerificationSession::new(RelayConfig::new("ftp://example.com", "key"));
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_launch_url_exports() {
        let url = "https://passport-issuer.staging.yivi.app/start-app\
                   ?sessionId=AbCdEfGhIjKlMnOpQrStUvWxYz012345&nonce=0123456789abcdef0123456789abcdef";
        assert!(is_valid_launch_url(url.to_string()));
        assert_eq!(
            parse_launch_url(url.to_string()).unwrap().session_id,
            "AbCdEfGhIjKlMnOpQrStUvWxYz012345"
        );

        let http = url.replacen("https", "http", 1);
        assert!(!is_valid_launch_url(http.clone()));
        assert!(matches!(parse_launch_url(http), Err(CoreError::InvalidLaunchUrl(_))));
    }
}
