//! Inbound message wrappers and their terminal actions.
//!
//! Each dispatched item gets exactly one wrapper, bound to the owning
//! orchestrator and the item's acknowledgement handle. The wrapper exposes a
//! fixed capability set instead of ad hoc attached functions: a request can
//! be answered (`reply`, `reply_error`), re-addressed (`forward`),
//! acknowledged without an answer (`done`) or left for redelivery
//! (`dismiss`); a response only supports the last two. Terminal actions
//! consume the wrapper, so each item settles at most once, and record the
//! outcome the dispatch state machine reports for the item.

use std::sync::{Arc, Mutex, PoisonError};

use courier_core::envelope::{Envelope, Identity};
use courier_core::error::MessagingError;
use courier_core::transporter::{DispatchOutcome, ReceiptHandle, SendReceipt};
use serde_json::Value;

use crate::Inner;

/// Shared slot recording the terminal action taken for one dispatched item.
#[derive(Clone, Default)]
pub(crate) struct OutcomeSlot(Arc<Mutex<Option<DispatchOutcome>>>);

impl OutcomeSlot {
    pub(crate) fn record(&self, outcome: DispatchOutcome) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
    }

    pub(crate) fn taken(&self) -> Option<DispatchOutcome> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An inbound request together with its terminal actions.
///
/// Handed to request handlers by the dispatch state machine. The handler
/// must settle the item through exactly one of the consuming actions; a
/// handler that returns without settling leaves the item for the backend to
/// redeliver.
pub struct InboundRequest {
    inner: Arc<Inner>,
    envelope: Envelope,
    handle: ReceiptHandle,
    outcome: OutcomeSlot,
}

impl InboundRequest {
    pub(crate) fn new(
        inner: Arc<Inner>,
        envelope: Envelope,
        handle: ReceiptHandle,
        outcome: OutcomeSlot,
    ) -> Self {
        Self {
            inner,
            envelope,
            handle,
            outcome,
        }
    }

    /// The full envelope as received.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Logical operation name this request addresses.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.envelope.service
    }

    /// Opaque application payload.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.envelope.body
    }

    /// Caller correlation data, when present.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.envelope.payload.as_ref()
    }

    /// Correlation identifier of this exchange.
    #[must_use]
    pub fn conversation(&self) -> &str {
        &self.envelope.conversation
    }

    /// Who sent this request.
    #[must_use]
    pub fn sent_by(&self) -> &Identity {
        &self.envelope.sent_by
    }

    /// Who re-addressed this request, when it was forwarded.
    #[must_use]
    pub fn forwarded_by(&self) -> Option<&Identity> {
        self.envelope.forwarded_by.as_ref()
    }

    /// Send a successful response to the requester and acknowledge the
    /// source item.
    ///
    /// # Errors
    ///
    /// Fails when the response cannot be delivered or the source item cannot
    /// be acknowledged; in either case the item is left unsettled.
    pub async fn reply(self, answer: Value) -> Result<SendReceipt, MessagingError> {
        let receipt = self.inner.send_response(&self.envelope, answer).await?;
        self.inner.delete(&self.handle).await?;
        self.outcome.record(DispatchOutcome::Replied);
        Ok(receipt)
    }

    /// Send an error response to the requester and acknowledge the source
    /// item.
    ///
    /// # Errors
    ///
    /// Fails when the response cannot be delivered or the source item cannot
    /// be acknowledged.
    pub async fn reply_error(
        self,
        error: impl Into<String> + Send,
    ) -> Result<SendReceipt, MessagingError> {
        let receipt = self
            .inner
            .send_error_response(&self.envelope, error.into())
            .await?;
        self.inner.delete(&self.handle).await?;
        self.outcome.record(DispatchOutcome::RepliedWithError);
        Ok(receipt)
    }

    /// Re-address this request to another application and acknowledge the
    /// source item.
    ///
    /// The original sender and its reply callback are preserved, so the
    /// eventual response routes straight back to them; this instance only
    /// appears as the forwarder.
    ///
    /// # Errors
    ///
    /// Fails when the destination cannot be resolved, the forward cannot be
    /// delivered, or the source item cannot be acknowledged.
    pub async fn forward(self, destination: &str) -> Result<SendReceipt, MessagingError> {
        let receipt = self.inner.send_forward(&self.envelope, destination).await?;
        self.inner.delete(&self.handle).await?;
        self.outcome.record(DispatchOutcome::Forwarded);
        Ok(receipt)
    }

    /// Acknowledge the source item without sending any reply.
    ///
    /// Used when the answer will be produced later through
    /// `send_async_response` or `send_async_reply_error`; keep the envelope
    /// around for that.
    ///
    /// # Errors
    ///
    /// Fails when the backend refuses the acknowledgement.
    pub async fn done(self) -> Result<(), MessagingError> {
        self.inner.delete(&self.handle).await?;
        self.outcome.record(DispatchOutcome::Done);
        Ok(())
    }

    /// Leave the item unacknowledged so the backend redelivers it later.
    ///
    /// # Errors
    ///
    /// Fails when the backend refuses the deferral.
    pub async fn dismiss(self) -> Result<(), MessagingError> {
        self.inner.keep(&self.handle).await?;
        self.outcome.record(DispatchOutcome::Dismissed);
        Ok(())
    }
}

/// An inbound response together with its terminal actions.
///
/// Handed to response handlers by the dispatch state machine. Responses can
/// only be acknowledged or deferred — there is nobody left to reply to.
pub struct InboundResponse {
    inner: Arc<Inner>,
    envelope: Envelope,
    handle: ReceiptHandle,
    outcome: OutcomeSlot,
}

impl InboundResponse {
    pub(crate) fn new(
        inner: Arc<Inner>,
        envelope: Envelope,
        handle: ReceiptHandle,
        outcome: OutcomeSlot,
    ) -> Self {
        Self {
            inner,
            envelope,
            handle,
            outcome,
        }
    }

    /// The full envelope as received.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Logical operation name this response answers.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.envelope.service
    }

    /// The answer body.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.envelope.body
    }

    /// Caller correlation data round-tripped from the request.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.envelope.payload.as_ref()
    }

    /// Correlation identifier of this exchange.
    #[must_use]
    pub fn conversation(&self) -> &str {
        &self.envelope.conversation
    }

    /// Who answered.
    #[must_use]
    pub fn sent_by(&self) -> &Identity {
        &self.envelope.sent_by
    }

    /// Whether the answered operation succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.envelope.success.unwrap_or(false)
    }

    /// The request being answered, exactly as the responder received it.
    /// When the request travelled through a forwarder, its `forwardedBy`
    /// identifies the last hop.
    #[must_use]
    pub fn original_message(&self) -> Option<&Envelope> {
        self.envelope.original_message.as_deref()
    }

    /// Acknowledge the source item.
    ///
    /// # Errors
    ///
    /// Fails when the backend refuses the acknowledgement.
    pub async fn done(self) -> Result<(), MessagingError> {
        self.inner.delete(&self.handle).await?;
        self.outcome.record(DispatchOutcome::Done);
        Ok(())
    }

    /// Leave the item unacknowledged so the backend redelivers it later.
    ///
    /// # Errors
    ///
    /// Fails when the backend refuses the deferral.
    pub async fn dismiss(self) -> Result<(), MessagingError> {
        self.inner.keep(&self.handle).await?;
        self.outcome.record(DispatchOutcome::Dismissed);
        Ok(())
    }
}
