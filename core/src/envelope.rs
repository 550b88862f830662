//! The wire envelope exchanged between applications.
//!
//! An [`Envelope`] is the only entity that ever crosses a transporter: one
//! JSON document per delivered item, camelCase keys, no binary framing. The
//! envelope carries its own correlation state — the `conversation` identifier
//! links a response (and any forwards in between) back to the request that
//! started it, so no server-side correlation table exists anywhere.
//!
//! # Correlation
//!
//! - A **request** gets a fresh `conversation` unless the caller supplies
//!   one.
//! - A **response** copies the `conversation` of the request it answers and
//!   embeds that request verbatim as `originalMessage`.
//! - A **forward** re-addresses a request while keeping `conversation` and
//!   `sentBy` untouched; the forwarder only tags itself in `forwardedBy`.
//!
//! # Example
//!
//! ```
//! use courier_core::envelope::{Envelope, Identity, MessageKind};
//! use serde_json::json;
//!
//! let sender = Identity::new("App1", "worker-1");
//! let request = Envelope::request(sender, "greet", json!("hi"), None, None);
//!
//! let responder = Identity::new("App2", "worker-9");
//! let response = Envelope::response(&request, json!({"answer": "hello"}), responder);
//!
//! assert_eq!(response.kind, MessageKind::Response);
//! assert_eq!(response.conversation, request.conversation);
//! assert_eq!(response.success, Some(true));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MessagingError;

/// Discriminator selecting which handler registry an inbound envelope is
/// dispatched against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A call expecting an answer.
    Request,
    /// The answer to a previously sent request.
    Response,
}

/// Identity of a sending or forwarding party.
///
/// `callback` is the destination address the eventual response must be sent
/// to. It is stamped by `send_message` at delivery time — either the sender's
/// own inbound address or an explicit override when sending on someone
/// else's behalf. `send_direct` never stamps it, which is why responses
/// travel without one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Logical application name.
    pub application: String,
    /// Worker/instance identifier within the application.
    pub instance: String,
    /// Resolved address replies for this party should be delivered to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub callback: Option<String>,
}

impl Identity {
    /// Create an identity with no reply callback attached.
    #[must_use]
    pub fn new(application: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            instance: instance.into(),
            callback: None,
        }
    }
}

/// The JSON message exchanged between applications.
///
/// Field-for-field this is the wire shape; serde attributes keep the
/// serialized form camelCase with `type` as the kind discriminator.
/// Optional fields are omitted entirely when absent — in particular
/// `payload` never serializes as `null` or `""`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique identifier, generated when the envelope is built.
    pub id: Uuid,
    /// Correlation identifier, stable across a request/response pair and
    /// across forwards.
    pub conversation: String,
    /// Request or response.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Who sent this envelope (and, once stamped, where to reply).
    pub sent_by: Identity,
    /// Who re-addressed this envelope, when it was forwarded. The original
    /// `sent_by` is preserved unchanged next to it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub forwarded_by: Option<Identity>,
    /// Logical operation name used for handler lookup.
    pub service: String,
    /// Opaque application payload.
    pub body: Value,
    /// Opaque correlation data round-tripped for the caller. Omitted from
    /// the wire when empty.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Value>,
    /// Whether the answered operation succeeded. Responses only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub success: Option<bool>,
    /// The request being answered, exactly as received. Responses only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_message: Option<Box<Envelope>>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Build a request envelope.
    ///
    /// A fresh `conversation` is generated when the caller does not supply
    /// one. The reply callback is left unset; the transporter stamps it at
    /// delivery time.
    #[must_use]
    pub fn request(
        sender: Identity,
        service: impl Into<String>,
        body: Value,
        payload: Option<Value>,
        conversation: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation: conversation.unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: MessageKind::Request,
            sent_by: sender,
            forwarded_by: None,
            service: service.into(),
            body,
            payload: normalize_payload(payload),
            success: None,
            original_message: None,
            timestamp: Utc::now(),
        }
    }

    /// Build a successful response to `original`.
    ///
    /// Conversation, service and payload are copied from the request;
    /// the request itself is embedded as `originalMessage`, exactly as it
    /// was received (any `forwardedBy` tag included).
    #[must_use]
    pub fn response(original: &Envelope, answer: Value, sender: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation: original.conversation.clone(),
            kind: MessageKind::Response,
            sent_by: sender,
            forwarded_by: None,
            service: original.service.clone(),
            body: answer,
            payload: normalize_payload(original.payload.clone()),
            success: Some(true),
            original_message: Some(Box::new(original.clone())),
            timestamp: Utc::now(),
        }
    }

    /// Build a failed response to `original` with `{"error": <text>}` as the
    /// body.
    #[must_use]
    pub fn error_response(original: &Envelope, error: impl Into<String>, sender: Identity) -> Self {
        let mut reply = Self::response(original, serde_json::json!({ "error": error.into() }), sender);
        reply.success = Some(false);
        reply
    }

    /// Build a forward of `original`.
    ///
    /// The result is a request again: `sentBy` is copied verbatim (reply
    /// callback included, so the eventual response routes to the original
    /// sender), the forwarder only appears in `forwardedBy`. Body, payload,
    /// service and conversation are preserved; id and timestamp are fresh.
    #[must_use]
    pub fn forward(original: &Envelope, forwarder: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation: original.conversation.clone(),
            kind: MessageKind::Request,
            sent_by: original.sent_by.clone(),
            forwarded_by: Some(forwarder),
            service: original.service.clone(),
            body: original.body.clone(),
            payload: normalize_payload(original.payload.clone()),
            success: None,
            original_message: None,
            timestamp: Utc::now(),
        }
    }

    /// Parse an envelope from a delivered JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidEnvelope`] when the document is not
    /// valid JSON or its `type` is neither `request` nor `response`.
    pub fn from_json(raw: &str) -> Result<Self, MessagingError> {
        serde_json::from_str(raw).map_err(|e| MessagingError::InvalidEnvelope(e.to_string()))
    }

    /// Serialize this envelope into its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidEnvelope`] if the body or payload
    /// cannot be rendered as JSON.
    pub fn to_json(&self) -> Result<String, MessagingError> {
        serde_json::to_string(self).map_err(|e| MessagingError::InvalidEnvelope(e.to_string()))
    }
}

/// Drop payloads that carry no content so they stay off the wire.
fn normalize_payload(payload: Option<Value>) -> Option<Value> {
    payload.filter(|p| !p.is_null() && p.as_str() != Some(""))
}
