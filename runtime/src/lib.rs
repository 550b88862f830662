//! # Courier Runtime
//!
//! The messaging orchestrator: owns one [`Transporter`], keeps the handler
//! registries, builds envelopes and drives the per-item dispatch state
//! machine
//!
//! ```text
//! Received → Dispatched → {Replied | RepliedWithError | Forwarded |
//!                          Done | Dismissed} → {Deleted | Kept}
//! ```
//!
//! Correlation is carried entirely inside the envelope — the orchestrator
//! retains no per-request state between send and reply. Matching a response
//! to a call is the job of the response handler registered for the service,
//! using the `conversation` value it observes.
//!
//! # Example
//!
//! ```no_run
//! use courier_core::config::MessagingConfig;
//! use courier_runtime::Messaging;
//! use courier_testing::{DirectHub, DirectTransporter};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = DirectHub::new();
//!
//! let mut config = MessagingConfig::new("App1", "test");
//! config.worker = "worker-1".to_string();
//! let app1 = Messaging::new(config, Box::new(DirectTransporter::new(hub.clone())))?;
//!
//! app1.on_response("greet", |message| async move {
//!     println!("answer: {}", message.body());
//!     message.done().await
//! });
//! app1.initialize_queue().await?;
//!
//! app1.send_request("App2", "greet", json!("hi"), None, None).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use courier_core::config::MessagingConfig;
use courier_core::envelope::{Envelope, Identity, MessageKind};
use courier_core::error::{MessagingError, TransportError};
use courier_core::transporter::{
    BatchReport, DeliveredMessage, DispatchOutcome, Dispatcher, ItemResult, ReadParams,
    ReceiptHandle, SendReceipt, Transporter,
};
use serde_json::Value;

mod inbound;

use inbound::OutcomeSlot;
pub use inbound::{InboundRequest, InboundResponse};

/// Future returned by registered handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send>>;

type RequestHandler = Arc<dyn Fn(InboundRequest) -> HandlerFuture + Send + Sync>;
type ResponseHandler = Arc<dyn Fn(InboundResponse) -> HandlerFuture + Send + Sync>;

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// The messaging orchestrator.
///
/// Cheap to clone; clones share the transporter, the handler registries and
/// the drop counter.
#[derive(Clone)]
pub struct Messaging {
    inner: Arc<Inner>,
}

impl Messaging {
    /// Create an orchestrator owning `transporter`.
    ///
    /// Validates the configuration, runs the transporter's non-fatal
    /// `verify` check and binds the configuration to it. No I/O happens
    /// here; call [`initialize_queue`](Self::initialize_queue) next.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Configuration`] when the application
    /// identifier or stage cannot be determined, or when the transporter
    /// rejects the configuration.
    pub fn new(
        mut config: MessagingConfig,
        mut transporter: Box<dyn Transporter>,
    ) -> Result<Self, MessagingError> {
        config.validate()?;
        transporter.verify(&config);
        transporter.initialize(&config)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transporter,
                request_handlers: RwLock::new(HashMap::new()),
                response_handlers: RwLock::new(HashMap::new()),
                dropped_responses: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The validated configuration this instance runs with.
    #[must_use]
    pub fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    /// Establish this instance's own inbound delivery point. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the backend cannot be reached or the
    /// queue cannot be found/created.
    pub async fn initialize_queue(&self) -> Result<(), MessagingError> {
        let dispatcher: Arc<dyn Dispatcher> = Arc::clone(&self.inner) as Arc<dyn Dispatcher>;
        self.inner
            .transporter
            .initialize_queue(dispatcher)
            .await
            .map_err(MessagingError::from)
    }

    /// Register the handler invoked for inbound requests addressing
    /// `service`. Registering a service again overwrites the prior handler.
    pub fn on_request<F, Fut>(&self, service: impl Into<String>, handler: F)
    where
        F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
    {
        let handler: RequestHandler =
            Arc::new(move |message| -> HandlerFuture { Box::pin(handler(message)) });
        write_lock(&self.inner.request_handlers).insert(service.into(), handler);
    }

    /// Register the handler invoked for inbound responses addressing
    /// `service`. Registering a service again overwrites the prior handler.
    pub fn on_response<F, Fut>(&self, service: impl Into<String>, handler: F)
    where
        F: Fn(InboundResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
    {
        let handler: ResponseHandler =
            Arc::new(move |message| -> HandlerFuture { Box::pin(handler(message)) });
        write_lock(&self.inner.response_handlers).insert(service.into(), handler);
    }

    /// Send a request to `dest_app`.
    ///
    /// Builds a request envelope (generating the conversation id unless one
    /// is supplied) and delivers it through the transporter, which resolves
    /// the destination and stamps the reply callback.
    ///
    /// # Errors
    ///
    /// Rejects with [`MessagingError::NoResponseHandler`] — before any I/O —
    /// when no response handler is registered for `service`: a request must
    /// not be sent if its caller has no way to process the answer. Delivery
    /// failures, including [`MessagingError::DestinationNotFound`], are
    /// never retried by the core.
    pub async fn send_request(
        &self,
        dest_app: &str,
        service: &str,
        body: Value,
        payload: Option<Value>,
        conversation: Option<String>,
    ) -> Result<SendReceipt, MessagingError> {
        self.inner.ensure_open()?;

        if !read_lock(&self.inner.response_handlers).contains_key(service) {
            return Err(MessagingError::NoResponseHandler {
                service: service.to_string(),
            });
        }

        let envelope = Envelope::request(
            self.inner.identity(),
            service,
            body,
            payload,
            conversation,
        );
        self.inner
            .transporter
            .send_message(dest_app, envelope, None)
            .await
    }

    /// Answer `original` after its item was already settled with `done`.
    ///
    /// The response is delivered straight to the requester's reply callback,
    /// independent of the source item's lifecycle.
    ///
    /// # Errors
    ///
    /// Fails when the original envelope carries no reply callback or the
    /// delivery fails.
    pub async fn send_async_response(
        &self,
        original: &Envelope,
        answer: Value,
    ) -> Result<SendReceipt, MessagingError> {
        self.inner.send_response(original, answer).await
    }

    /// Answer `original` with an error after its item was already settled.
    ///
    /// # Errors
    ///
    /// Fails when the original envelope carries no reply callback or the
    /// delivery fails.
    pub async fn send_async_reply_error(
        &self,
        original: &Envelope,
        error: impl Into<String> + Send,
    ) -> Result<SendReceipt, MessagingError> {
        self.inner.send_error_response(original, error.into()).await
    }

    /// Re-address `original` to another application, preserving its sender
    /// and reply callback so the eventual response routes to the original
    /// sender, not to this instance.
    ///
    /// # Errors
    ///
    /// Fails when the destination cannot be resolved or the delivery fails.
    pub async fn send_async_forward(
        &self,
        original: &Envelope,
        destination: &str,
    ) -> Result<SendReceipt, MessagingError> {
        self.inner.send_forward(original, destination).await
    }

    /// Pull one batch of pending items and dispatch each of them.
    ///
    /// Items are dispatched concurrently; the report carries one result per
    /// item and a failing item never aborts its siblings.
    ///
    /// # Errors
    ///
    /// Fails when the backend read itself fails; per-item failures live in
    /// the report instead.
    pub async fn read_messages(
        &self,
        params: Option<ReadParams>,
    ) -> Result<BatchReport, MessagingError> {
        self.inner.ensure_open()?;
        let dispatcher: Arc<dyn Dispatcher> = Arc::clone(&self.inner) as Arc<dyn Dispatcher>;
        self.inner.transporter.read_messages(params, dispatcher).await
    }

    /// Responses that arrived for services with no registered response
    /// handler and were dropped (left for redelivery) since construction.
    #[must_use]
    pub fn dropped_responses(&self) -> u64 {
        self.inner.dropped_responses.load(Ordering::Relaxed)
    }

    /// Release the transporter. Idempotent; afterwards sends and reads fail
    /// cleanly instead of hanging.
    ///
    /// # Errors
    ///
    /// Fails when the backend refuses to shut down; the instance counts as
    /// closed regardless.
    pub async fn close(&self) -> Result<(), MessagingError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .transporter
            .close()
            .await
            .map_err(MessagingError::from)
    }
}

/// Shared state behind a [`Messaging`] instance.
///
/// Also the [`Dispatcher`] the transporter feeds delivered items into.
pub(crate) struct Inner {
    config: MessagingConfig,
    transporter: Box<dyn Transporter>,
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    response_handlers: RwLock<HashMap<String, ResponseHandler>>,
    dropped_responses: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::from(TransportError::Closed));
        }
        Ok(())
    }

    fn identity(&self) -> Identity {
        self.config.identity()
    }

    fn callback_of(original: &Envelope) -> Result<String, MessagingError> {
        original.sent_by.callback.clone().ok_or_else(|| {
            MessagingError::InvalidEnvelope("request carries no reply callback".to_string())
        })
    }

    pub(crate) async fn send_response(
        &self,
        original: &Envelope,
        answer: Value,
    ) -> Result<SendReceipt, MessagingError> {
        self.ensure_open()?;
        let callback = Self::callback_of(original)?;
        let reply = Envelope::response(original, answer, self.identity());
        self.transporter.send_direct(&callback, reply).await
    }

    pub(crate) async fn send_error_response(
        &self,
        original: &Envelope,
        error: String,
    ) -> Result<SendReceipt, MessagingError> {
        self.ensure_open()?;
        let callback = Self::callback_of(original)?;
        let reply = Envelope::error_response(original, error, self.identity());
        self.transporter.send_direct(&callback, reply).await
    }

    pub(crate) async fn send_forward(
        &self,
        original: &Envelope,
        destination: &str,
    ) -> Result<SendReceipt, MessagingError> {
        self.ensure_open()?;
        let callback = Self::callback_of(original)?;
        let forwarded = Envelope::forward(original, self.identity());
        self.transporter
            .send_message(destination, forwarded, Some(callback))
            .await
    }

    pub(crate) async fn delete(&self, handle: &ReceiptHandle) -> Result<(), MessagingError> {
        self.transporter
            .delete_message(handle)
            .await
            .map_err(MessagingError::from)
    }

    pub(crate) async fn keep(&self, handle: &ReceiptHandle) -> Result<(), MessagingError> {
        self.transporter
            .keep_message(handle)
            .await
            .map_err(MessagingError::from)
    }

    fn request_handler(&self, service: &str) -> Option<RequestHandler> {
        read_lock(&self.request_handlers).get(service).cloned()
    }

    fn response_handler(&self, service: &str) -> Option<ResponseHandler> {
        read_lock(&self.response_handlers).get(service).cloned()
    }

    async fn process_message(self: Arc<Self>, item: DeliveredMessage) -> ItemResult {
        tracing::debug!(body = %item.body, "processing incoming message");

        let envelope = match Envelope::from_json(&item.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(error = %err, "invalid message received, type should be request|response");
                return Err(err);
            }
        };

        match envelope.kind {
            MessageKind::Request => self.process_request(envelope, item.handle).await,
            MessageKind::Response => self.process_response(envelope, item.handle).await,
        }
    }

    async fn process_request(
        self: Arc<Self>,
        envelope: Envelope,
        handle: ReceiptHandle,
    ) -> ItemResult {
        let Some(handler) = self.request_handler(&envelope.service) else {
            // No handler registered means the service is not supported here.
            // Tell the sender so instead of failing the receiver.
            let unsupported = MessagingError::UnsupportedService {
                service: envelope.service.clone(),
            };
            tracing::warn!(
                service = %envelope.service,
                sender = %envelope.sent_by.application,
                "request for unsupported service, answering with an error response"
            );
            self.send_error_response(&envelope, unsupported.to_string())
                .await?;
            self.delete(&handle).await?;
            return Ok(DispatchOutcome::RepliedWithError);
        };

        let outcome = OutcomeSlot::default();
        let service = envelope.service.clone();
        let message = InboundRequest::new(Arc::clone(&self), envelope, handle, outcome.clone());

        match handler(message).await {
            Ok(()) => Ok(outcome.taken().unwrap_or_else(|| {
                tracing::warn!(
                    service = %service,
                    "request handler finished without settling the message, leaving it for redelivery"
                );
                DispatchOutcome::Unsettled
            })),
            Err(err) => {
                tracing::error!(service = %service, error = %err, "request handler failed");
                Err(MessagingError::HandlerExecution(err.to_string()))
            }
        }
    }

    async fn process_response(
        self: Arc<Self>,
        envelope: Envelope,
        handle: ReceiptHandle,
    ) -> ItemResult {
        let Some(handler) = self.response_handler(&envelope.service) else {
            // Nothing sensible can be replied to a response; log, count and
            // leave the item to the backend's redelivery.
            self.dropped_responses.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                service = %envelope.service,
                responder = %envelope.sent_by.application,
                application = %self.config.app,
                "response arrived for a service with no response handler, dropping it"
            );
            return Err(MessagingError::NoResponseHandler {
                service: envelope.service,
            });
        };

        let outcome = OutcomeSlot::default();
        let service = envelope.service.clone();
        let message = InboundResponse::new(Arc::clone(&self), envelope, handle, outcome.clone());

        match handler(message).await {
            Ok(()) => Ok(outcome.taken().unwrap_or_else(|| {
                tracing::warn!(
                    service = %service,
                    "response handler finished without settling the message, leaving it for redelivery"
                );
                DispatchOutcome::Unsettled
            })),
            Err(err) => {
                tracing::error!(service = %service, error = %err, "response handler failed");
                Err(MessagingError::HandlerExecution(err.to_string()))
            }
        }
    }
}

impl Dispatcher for Inner {
    fn dispatch(
        self: Arc<Self>,
        item: DeliveredMessage,
    ) -> Pin<Box<dyn Future<Output = ItemResult> + Send>> {
        Box::pin(self.process_message(item))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::Mutex;

    /// Call log shared between a test and its mock transporter.
    #[derive(Default)]
    struct MockState {
        sends: Mutex<Vec<(String, Envelope, Option<String>)>>,
        directs: Mutex<Vec<(String, Envelope)>>,
        deleted: Mutex<Vec<ReceiptHandle>>,
        kept: Mutex<Vec<ReceiptHandle>>,
        queued: Mutex<Vec<DeliveredMessage>>,
        closed: AtomicBool,
    }

    impl MockState {
        fn queue_item(&self, body: String) {
            let mut queued = self.queued.lock().expect("lock");
            let handle = ReceiptHandle::new(format!("receipt-{}", queued.len()));
            queued.push(DeliveredMessage { body, handle });
        }

        fn directs(&self) -> Vec<(String, Envelope)> {
            self.directs.lock().expect("lock").clone()
        }

        fn sends(&self) -> Vec<(String, Envelope, Option<String>)> {
            self.sends.lock().expect("lock").clone()
        }

        fn deleted_count(&self) -> usize {
            self.deleted.lock().expect("lock").len()
        }

        fn kept_count(&self) -> usize {
            self.kept.lock().expect("lock").len()
        }
    }

    struct MockTransporter {
        state: Arc<MockState>,
    }

    impl Transporter for MockTransporter {
        fn verify(&self, _config: &MessagingConfig) {}

        fn initialize(&mut self, _config: &MessagingConfig) -> Result<(), MessagingError> {
            Ok(())
        }

        fn initialize_queue(
            &self,
            _dispatcher: Arc<dyn Dispatcher>,
        ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn send_message(
            &self,
            dest_app: &str,
            mut envelope: Envelope,
            override_callback: Option<String>,
        ) -> Pin<Box<dyn Future<Output = Result<SendReceipt, MessagingError>> + Send + '_>>
        {
            let dest_app = dest_app.to_string();
            Box::pin(async move {
                envelope.sent_by.callback = Some(
                    override_callback
                        .clone()
                        .unwrap_or_else(|| "mock://own".to_string()),
                );
                self.state.sends.lock().expect("lock").push((
                    dest_app,
                    envelope,
                    override_callback,
                ));
                Ok(SendReceipt::default())
            })
        }

        fn send_direct(
            &self,
            address: &str,
            envelope: Envelope,
        ) -> Pin<Box<dyn Future<Output = Result<SendReceipt, MessagingError>> + Send + '_>>
        {
            let address = address.to_string();
            Box::pin(async move {
                self.state.directs.lock().expect("lock").push((address, envelope));
                Ok(SendReceipt::default())
            })
        }

        fn read_messages(
            &self,
            _params: Option<ReadParams>,
            dispatcher: Arc<dyn Dispatcher>,
        ) -> Pin<Box<dyn Future<Output = Result<BatchReport, MessagingError>> + Send + '_>>
        {
            Box::pin(async move {
                let items: Vec<DeliveredMessage> =
                    self.state.queued.lock().expect("lock").drain(..).collect();
                let results = join_all(
                    items
                        .into_iter()
                        .map(|item| Arc::clone(&dispatcher).dispatch(item)),
                )
                .await;
                Ok(BatchReport::new(results))
            })
        }

        fn delete_message(
            &self,
            handle: &ReceiptHandle,
        ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
            let handle = handle.clone();
            Box::pin(async move {
                self.state.deleted.lock().expect("lock").push(handle);
                Ok(())
            })
        }

        fn keep_message(
            &self,
            handle: &ReceiptHandle,
        ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
            let handle = handle.clone();
            Box::pin(async move {
                self.state.kept.lock().expect("lock").push(handle);
                Ok(())
            })
        }

        fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
            Box::pin(async {
                self.state.closed.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn messaging_with_mock() -> (Messaging, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let transporter = MockTransporter {
            state: Arc::clone(&state),
        };
        let mut config = MessagingConfig::new("App1", "test");
        config.worker = "worker-1".to_string();
        let messaging = Messaging::new(config, Box::new(transporter)).expect("constructs");
        (messaging, state)
    }

    fn inbound_request(service: &str, body: Value) -> String {
        let mut envelope = Envelope::request(Identity::new("App0", "w0"), service, body, None, None);
        envelope.sent_by.callback = Some("mock://app0".to_string());
        envelope.to_json().expect("serializes")
    }

    fn inbound_response(service: &str, body: Value) -> String {
        let mut request =
            Envelope::request(Identity::new("App1", "worker-1"), service, json!("hi"), None, None);
        request.sent_by.callback = Some("mock://app1".to_string());
        let response = Envelope::response(&request, body, Identity::new("App2", "w2"));
        response.to_json().expect("serializes")
    }

    #[tokio::test]
    async fn send_request_without_response_handler_rejects_before_io() {
        let (messaging, state) = messaging_with_mock();

        let err = messaging
            .send_request("App2", "greet", json!("hi"), None, None)
            .await;

        assert!(matches!(
            err,
            Err(MessagingError::NoResponseHandler { service }) if service == "greet"
        ));
        assert!(state.sends().is_empty(), "no I/O may happen");
    }

    #[tokio::test]
    async fn send_request_reaches_the_transporter() {
        let (messaging, state) = messaging_with_mock();
        messaging.on_response("greet", |message| async move { message.done().await });

        messaging
            .send_request("App2", "greet", json!("hi"), Some(json!("job=1")), None)
            .await
            .expect("sends");

        let sends = state.sends();
        assert_eq!(sends.len(), 1);
        let (dest, envelope, override_callback) = &sends[0];
        assert_eq!(dest, "App2");
        assert_eq!(envelope.kind, MessageKind::Request);
        assert_eq!(envelope.service, "greet");
        assert_eq!(envelope.payload, Some(json!("job=1")));
        assert!(!envelope.conversation.is_empty());
        assert!(override_callback.is_none());
    }

    #[tokio::test]
    async fn malformed_item_fails_alone_in_batch() {
        let (messaging, state) = messaging_with_mock();
        messaging.on_request("greet", |message| async move {
            message.reply(json!({"answer": "hello"})).await?;
            Ok(())
        });

        state.queue_item("not json at all".to_string());
        state.queue_item(inbound_request("greet", json!("hi")));

        let report = messaging.read_messages(None).await.expect("reads");

        assert_eq!(report.len(), 2);
        assert_eq!(report.failed(), 1);
        assert!(report.items().iter().any(|item| matches!(
            item,
            Err(MessagingError::InvalidEnvelope(_))
        )));
        assert!(report
            .items()
            .iter()
            .any(|item| matches!(item, Ok(DispatchOutcome::Replied))));
        assert_eq!(state.deleted_count(), 1);
    }

    #[tokio::test]
    async fn unsupported_service_gets_automatic_error_reply() {
        let (messaging, state) = messaging_with_mock();

        state.queue_item(inbound_request("wrong_service", json!("hi")));
        let report = messaging.read_messages(None).await.expect("reads");

        assert!(matches!(
            report.items(),
            [Ok(DispatchOutcome::RepliedWithError)]
        ));

        let directs = state.directs();
        assert_eq!(directs.len(), 1, "exactly one outbound response");
        let (address, reply) = &directs[0];
        assert_eq!(address, "mock://app0");
        assert_eq!(reply.success, Some(false));
        assert_eq!(
            reply.body,
            json!({"error": "Service 'wrong_service' not supported."})
        );
        assert_eq!(state.deleted_count(), 1, "source deleted exactly once");
    }

    #[tokio::test]
    async fn response_without_handler_is_dropped_and_counted() {
        let (messaging, state) = messaging_with_mock();

        state.queue_item(inbound_response("greet", json!({"answer": "hello"})));
        let report = messaging.read_messages(None).await.expect("reads");

        assert!(matches!(
            report.items(),
            [Err(MessagingError::NoResponseHandler { .. })]
        ));
        assert_eq!(messaging.dropped_responses(), 1);
        assert_eq!(state.deleted_count(), 0, "item must stay for redelivery");
        assert_eq!(state.kept_count(), 0);
        assert!(state.directs().is_empty(), "no automatic reply to a response");
    }

    #[tokio::test]
    async fn reply_sends_response_then_deletes_source() {
        let (messaging, state) = messaging_with_mock();
        messaging.on_request("greet", |message| async move {
            message.reply(json!({"answer": "hello"})).await?;
            Ok(())
        });

        state.queue_item(inbound_request("greet", json!("hi")));
        let report = messaging.read_messages(None).await.expect("reads");

        assert!(matches!(report.items(), [Ok(DispatchOutcome::Replied)]));
        let directs = state.directs();
        assert_eq!(directs.len(), 1);
        let (address, reply) = &directs[0];
        assert_eq!(address, "mock://app0");
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.success, Some(true));
        assert!(reply.original_message.is_some());
        assert_eq!(state.deleted_count(), 1);
    }

    #[tokio::test]
    async fn done_deletes_without_reply() {
        let (messaging, state) = messaging_with_mock();
        messaging.on_request("ingest", |message| async move { message.done().await });

        state.queue_item(inbound_request("ingest", json!([1, 2, 3])));
        let report = messaging.read_messages(None).await.expect("reads");

        assert!(matches!(report.items(), [Ok(DispatchOutcome::Done)]));
        assert!(state.directs().is_empty());
        assert_eq!(state.deleted_count(), 1);
    }

    #[tokio::test]
    async fn dismiss_never_deletes_the_source() {
        let (messaging, state) = messaging_with_mock();
        messaging.on_request("later", |message| async move { message.dismiss().await });

        state.queue_item(inbound_request("later", json!("hi")));
        let report = messaging.read_messages(None).await.expect("reads");

        assert!(matches!(report.items(), [Ok(DispatchOutcome::Dismissed)]));
        assert_eq!(state.deleted_count(), 0);
        assert_eq!(state.kept_count(), 1);
    }

    #[tokio::test]
    async fn unsettled_handler_leaves_the_item() {
        let (messaging, state) = messaging_with_mock();
        messaging.on_request("noop", |_message| async move { Ok(()) });

        state.queue_item(inbound_request("noop", json!("hi")));
        let report = messaging.read_messages(None).await.expect("reads");

        assert!(matches!(report.items(), [Ok(DispatchOutcome::Unsettled)]));
        assert_eq!(state.deleted_count(), 0);
        assert_eq!(state.kept_count(), 0);
    }

    #[tokio::test]
    async fn handler_failure_is_isolated_per_item() {
        let (messaging, state) = messaging_with_mock();
        messaging.on_request("broken", |_message| async move {
            Err(MessagingError::HandlerExecution("boom".to_string()))
        });
        messaging.on_request("greet", |message| async move {
            message.reply(json!({"answer": "hello"})).await?;
            Ok(())
        });

        state.queue_item(inbound_request("broken", json!("hi")));
        state.queue_item(inbound_request("greet", json!("hi")));
        let report = messaging.read_messages(None).await.expect("reads");

        assert_eq!(report.len(), 2);
        assert_eq!(report.failed(), 1);
        assert!(report
            .items()
            .iter()
            .any(|item| matches!(item, Err(MessagingError::HandlerExecution(_)))));
        assert!(report
            .items()
            .iter()
            .any(|item| matches!(item, Ok(DispatchOutcome::Replied))));
    }

    #[tokio::test]
    async fn forward_preserves_sender_and_reply_callback() {
        let (messaging, state) = messaging_with_mock();
        messaging.on_request("relay", |message| async move {
            message.forward("App3").await?;
            Ok(())
        });

        state.queue_item(inbound_request("relay", json!("hi")));
        let report = messaging.read_messages(None).await.expect("reads");

        assert!(matches!(report.items(), [Ok(DispatchOutcome::Forwarded)]));
        let sends = state.sends();
        assert_eq!(sends.len(), 1);
        let (dest, envelope, override_callback) = &sends[0];
        assert_eq!(dest, "App3");
        assert_eq!(envelope.sent_by.application, "App0", "original sender kept");
        assert_eq!(
            envelope.forwarded_by.as_ref().map(|f| f.application.as_str()),
            Some("App1")
        );
        assert_eq!(
            override_callback.as_deref(),
            Some("mock://app0"),
            "reply must route to the original sender"
        );
        assert_eq!(state.deleted_count(), 1);
    }

    #[tokio::test]
    async fn async_response_follows_a_done() {
        let (messaging, state) = messaging_with_mock();
        let parked: Arc<Mutex<Option<Envelope>>> = Arc::new(Mutex::new(None));
        let parked_in_handler = Arc::clone(&parked);

        messaging.on_request("slow", move |message| {
            let parked = Arc::clone(&parked_in_handler);
            async move {
                *parked.lock().expect("lock") = Some(message.envelope().clone());
                message.done().await
            }
        });

        state.queue_item(inbound_request("slow", json!("hi")));
        let report = messaging.read_messages(None).await.expect("reads");
        assert!(matches!(report.items(), [Ok(DispatchOutcome::Done)]));
        assert!(state.directs().is_empty());

        let original = parked.lock().expect("lock").take().expect("parked envelope");
        messaging
            .send_async_response(&original, json!({"answer": "finally"}))
            .await
            .expect("async response sends");

        let directs = state.directs();
        assert_eq!(directs.len(), 1);
        assert_eq!(directs[0].0, "mock://app0");
        assert_eq!(directs[0].1.success, Some(true));
        assert_eq!(directs[0].1.conversation, original.conversation);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_followups() {
        let (messaging, state) = messaging_with_mock();
        messaging.on_response("greet", |message| async move { message.done().await });

        messaging.close().await.expect("first close");
        messaging.close().await.expect("second close is a no-op");
        assert!(state.closed.load(Ordering::SeqCst));

        let send = messaging
            .send_request("App2", "greet", json!("hi"), None, None)
            .await;
        assert!(matches!(
            send,
            Err(MessagingError::Transport(TransportError::Closed))
        ));

        let read = messaging.read_messages(None).await;
        assert!(matches!(
            read,
            Err(MessagingError::Transport(TransportError::Closed))
        ));
    }
}
