//! Error taxonomy for the messaging core and its transporters.
//!
//! Two layers: [`TransportError`] is the opaque failure a delivery backend
//! reports; [`MessagingError`] is the application-visible taxonomy, one
//! variant per failure kind the protocol distinguishes.
//!
//! Propagation policy: configuration errors are synchronous and fatal to
//! construction. Send-time errors reject the caller's future and are never
//! retried by the core (the broker's bounded backpressure retry is internal
//! flow control, not an application-visible failure). Dispatch-time errors
//! for one item of a batch are isolated to that item's result and never
//! abort sibling items.

use thiserror::Error;

/// Opaque failure reported by a delivery backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The backend could not be reached or refused the connection.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The backend accepted the connection but failed an operation.
    #[error("backend failure: {0}")]
    Backend(String),

    /// The transporter was closed; no further operations are possible.
    #[error("transporter is closed")]
    Closed,
}

/// Errors surfaced by the messaging core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Construction-time configuration problem. Always synchronous, always
    /// fatal: no instance is handed out.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A request was about to be sent for a service that has no response
    /// handler registered — its caller would have no way to process the
    /// answer.
    #[error("can't send to service '{service}' without a response handler registered")]
    NoResponseHandler {
        /// Service the send was attempted for.
        service: String,
    },

    /// Destination resolution failed and auto-create is disabled.
    #[error("no queue found for app: {destination}")]
    DestinationNotFound {
        /// Application name that could not be resolved.
        destination: String,
    },

    /// An inbound request named a service with no registered handler.
    ///
    /// Handled entirely inside dispatch: the display text of this variant is
    /// exactly the error body of the automatic reply, so taxonomy and wire
    /// text cannot drift apart. Never surfaced to the receiving application.
    #[error("Service '{service}' not supported.")]
    UnsupportedService {
        /// Service named by the inbound request.
        service: String,
    },

    /// A delivered item could not be parsed into an envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A handler failed while processing an item.
    #[error("handler execution failed: {0}")]
    HandlerExecution(String),

    /// Failure from the underlying backend.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
