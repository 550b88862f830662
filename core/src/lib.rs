//! # Courier Core
//!
//! Envelope protocol, transporter contract and error taxonomy for Courier —
//! correlated request/response messaging over pluggable delivery backends.
//!
//! Courier gives call-and-reply semantics on top of queue primitives that
//! only guarantee at-least-once, unordered delivery. This crate holds the
//! two load-bearing pieces:
//!
//! - the [`envelope`] module: how a request is built, correlated with its
//!   eventual response, forwarded, or answered asynchronously — all state
//!   travels inside the envelope, nothing is tracked server-side;
//! - the [`transporter`] module: the contract every delivery backend
//!   satisfies, hiding visibility-timeout redelivery, ack/nack channels and
//!   direct in-process delivery behind identical semantics.
//!
//! The orchestrator living in `courier-runtime` drives both; the concrete
//! backends (`courier-sqs`, `courier-amqp`, the direct transporter in
//! `courier-testing`) implement the contract independently.

pub mod config;
pub mod envelope;
pub mod error;
pub mod retry;
pub mod transporter;

pub use config::{
    AmqpSettings, ConsumeSettings, MessagingConfig, ReadingMode, SqsSettings, TransporterKind,
};
pub use envelope::{Envelope, Identity, MessageKind};
pub use error::{MessagingError, TransportError};
pub use transporter::{
    BatchReport, DeliveredMessage, DispatchOutcome, Dispatcher, ItemResult, ReadParams,
    ReceiptHandle, SendReceipt, Transporter,
};
