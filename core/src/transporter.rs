//! The contract every delivery backend satisfies.
//!
//! A [`Transporter`] hides a concrete delivery substrate — a polling cloud
//! queue with visibility-timeout redelivery, a channel-based broker with
//! explicit ack/nack, or a synchronous in-process registry — behind one
//! interface with identical application-visible semantics. The orchestrator
//! owns exactly one transporter, selected at construction time, and never
//! inspects which backend it got.
//!
//! # Delivery models
//!
//! The contract is written so that each backend maps its native
//! acknowledgement model onto the same two verbs:
//!
//! | backend        | `delete_message`    | `keep_message`              |
//! |----------------|---------------------|-----------------------------|
//! | queue service  | delete (true ack)   | no-op (timeout redelivers)  |
//! | broker         | `ack`               | `nack` with requeue         |
//! | direct         | no-op               | no-op (nothing is buffered) |
//!
//! # Dyn Compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so
//! the trait stays object-safe — the orchestrator holds a
//! `Box<dyn Transporter>`. Implementations clone borrowed arguments into
//! owned values before moving into the async block; the returned future may
//! only borrow `self`.

use std::pin::Pin;
use std::sync::Arc;

use crate::config::MessagingConfig;
use crate::envelope::Envelope;
use crate::error::{MessagingError, TransportError};

/// Opaque acknowledgement handle for one delivered item.
///
/// Backends put whatever they need in here to ack or defer later — a
/// receipt handle, a delivery tag, nothing at all. The orchestrator only
/// carries it between `read_messages` and `delete_message`/`keep_message`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    /// Wrap a backend-specific handle value.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The backend-specific handle value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Raw item pulled from a backend, before envelope parsing.
#[derive(Clone, Debug)]
pub struct DeliveredMessage {
    /// Raw JSON document exactly as delivered.
    pub body: String,
    /// Handle used to ack or defer this item.
    pub handle: ReceiptHandle,
}

/// Backend acknowledgement for a completed send.
#[derive(Clone, Debug, Default)]
pub struct SendReceipt {
    /// Backend-assigned identifier of the delivered item, when one exists.
    pub message_id: Option<String>,
}

/// Per-call read parameters, merged over the configured consume defaults.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadParams {
    /// Override for the batch size.
    pub max_messages: Option<i32>,
    /// Override for the redelivery window, in seconds.
    pub visibility_timeout: Option<i32>,
    /// Override for the poll wait, in seconds.
    pub wait_time: Option<i32>,
}

/// Terminal state reached by one dispatched item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A response was sent and the source item deleted.
    Replied,
    /// An error response was sent and the source item deleted.
    RepliedWithError,
    /// The item was re-addressed to another application and the source
    /// deleted.
    Forwarded,
    /// The source item was deleted without a reply (one may follow
    /// asynchronously).
    Done,
    /// The item was explicitly left for the backend to redeliver.
    Dismissed,
    /// The handler finished without settling the item; it stays available
    /// for redelivery.
    Unsettled,
}

/// Result of dispatching a single delivered item.
pub type ItemResult = Result<DispatchOutcome, MessagingError>;

/// Aggregated per-item results of one `read_messages` call.
///
/// One entry per delivered item, in no particular order. A failed item
/// never aborts its siblings; it just shows up here as an `Err`.
#[derive(Debug, Default)]
pub struct BatchReport {
    items: Vec<ItemResult>,
}

impl BatchReport {
    /// Wrap per-item results into a report.
    #[must_use]
    pub fn new(items: Vec<ItemResult>) -> Self {
        Self { items }
    }

    /// Per-item results.
    #[must_use]
    pub fn items(&self) -> &[ItemResult] {
        &self.items
    }

    /// Number of items delivered in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items whose dispatch failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.items.iter().filter(|item| item.is_err()).count()
    }

    /// Consume the report.
    #[must_use]
    pub fn into_items(self) -> Vec<ItemResult> {
        self.items
    }
}

/// Dispatch entry point a transporter delivers items into.
///
/// The orchestrator implements this; transporters call it once per
/// delivered item. The `Arc` receiver lets push-based backends hold the
/// dispatcher inside long-lived consumer tasks.
pub trait Dispatcher: Send + Sync {
    /// Run one delivered item through the dispatch state machine.
    fn dispatch(
        self: Arc<Self>,
        item: DeliveredMessage,
    ) -> Pin<Box<dyn Future<Output = ItemResult> + Send>>;
}

/// A pluggable delivery backend.
///
/// Lifecycle: `verify` → `initialize` → `initialize_queue` → any number of
/// sends and reads → `close`. `initialize` binds configuration without
/// performing I/O; `initialize_queue` establishes the instance's own
/// inbound delivery point and is idempotent; `close` is idempotent and
/// causes subsequent operations to fail cleanly rather than hang.
pub trait Transporter: Send + Sync {
    /// Non-fatal configuration sanity check. Logs findings, never fails.
    fn verify(&self, config: &MessagingConfig);

    /// Bind configuration. No I/O happens here.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Configuration`] when the configuration
    /// lacks the settings this backend needs.
    fn initialize(&mut self, config: &MessagingConfig) -> Result<(), MessagingError>;

    /// Establish this instance's own inbound delivery point. Idempotent.
    ///
    /// Backends that deliver without polling retain `dispatcher` and feed
    /// items straight into it; polling backends ignore it and receive a
    /// dispatcher per `read_messages` call instead.
    fn initialize_queue(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Resolve `dest_app` to a concrete address, stamp the envelope's reply
    /// callback (`override_callback` or this instance's own inbound
    /// address) and deliver.
    fn send_message(
        &self,
        dest_app: &str,
        envelope: Envelope,
        override_callback: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<SendReceipt, MessagingError>> + Send + '_>>;

    /// Deliver to an already-resolved address, bypassing resolution. The
    /// reply callback is left untouched.
    fn send_direct(
        &self,
        address: &str,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<SendReceipt, MessagingError>> + Send + '_>>;

    /// Pull a bounded batch of pending items and dispatch each of them,
    /// concurrently, through `dispatcher`.
    ///
    /// Returns once every dispatched item has settled; per-item failures
    /// are aggregated in the report and never abort the batch.
    fn read_messages(
        &self,
        params: Option<ReadParams>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Pin<Box<dyn Future<Output = Result<BatchReport, MessagingError>> + Send + '_>>;

    /// Permanently acknowledge one item; it will not be redelivered.
    fn delete_message(
        &self,
        handle: &ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Explicitly defer one item; it stays available for a future read.
    fn keep_message(
        &self,
        handle: &ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Release connections and registrations. Idempotent.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}
