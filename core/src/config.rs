//! Configuration surface consumed by the orchestrator and the transporters.
//!
//! All types deserialize with serde so an embedding process can hand the
//! whole block over from whatever configuration source it uses; loading and
//! file handling stay outside this crate. Validation is synchronous and runs
//! before any I/O.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::envelope::Identity;
use crate::error::MessagingError;

/// Environment variable consulted when no deployment stage is configured.
pub const STAGE_ENV_VAR: &str = "current_stage";

/// Delivery backend selection key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransporterKind {
    /// Cloud queue service: polling consumption, visibility-timeout
    /// redelivery.
    Sqs,
    /// Channel-based broker: push or pull consumption, explicit ack/nack.
    Amqp,
}

impl fmt::Display for TransporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqs => write!(f, "SQS"),
            Self::Amqp => write!(f, "AMQP"),
        }
    }
}

impl FromStr for TransporterKind {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SQS" => Ok(Self::Sqs),
            "AMQP" => Ok(Self::Amqp),
            other => Err(MessagingError::Configuration(format!(
                "unknown transporter kind: {other}"
            ))),
        }
    }
}

/// Consume defaults merged into every `read_messages` call.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsumeSettings {
    /// Upper bound on items pulled per batch.
    pub max_messages: i32,
    /// Seconds a received-but-undeleted item stays invisible before the
    /// backend redelivers it.
    pub visibility_timeout: i32,
    /// Seconds a poll waits for items before returning empty.
    pub wait_time: i32,
}

impl Default for ConsumeSettings {
    fn default() -> Self {
        Self {
            max_messages: 10,
            visibility_timeout: 30,
            wait_time: 0,
        }
    }
}

/// Settings for the queue-service transporter.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SqsSettings {
    /// Region override; the client environment decides when absent.
    pub region: Option<String>,
    /// Endpoint override, e.g. a localstack address in tests.
    pub endpoint_url: Option<String>,
    /// Create destination queues when resolution finds none.
    pub create_queues: bool,
    /// Consume defaults.
    pub consume: ConsumeSettings,
}

/// How the broker transporter consumes its queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingMode {
    /// Push-based: a broker consumer delivers items continuously.
    #[default]
    Consume,
    /// Pull-based single fetch per `read_messages` call.
    Rpc,
}

/// Settings for the broker transporter.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AmqpSettings {
    /// Broker address, e.g. `amqp://127.0.0.1:5672/%2f`.
    pub address: String,
    /// Assert destination queues instead of checking their existence.
    pub create_queues: bool,
    /// Per-channel prefetch window.
    pub prefetch: u16,
    /// Push or pull consumption.
    pub reading_mode: ReadingMode,
    /// Publish attempts while the channel reports busy, before giving up.
    pub publish_retry_attempts: usize,
    /// Delay between publish attempts, in milliseconds.
    pub publish_retry_delay_ms: u64,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            address: "amqp://127.0.0.1:5672/%2f".to_string(),
            create_queues: false,
            prefetch: 10,
            reading_mode: ReadingMode::default(),
            publish_retry_attempts: 6,
            publish_retry_delay_ms: 500,
        }
    }
}

/// Top-level configuration for one messaging instance.
///
/// # Example
///
/// ```
/// use courier_core::config::MessagingConfig;
///
/// let mut config = MessagingConfig::new("App1", "test");
/// config.worker = "worker-1".to_string();
/// assert!(config.validate().is_ok());
/// assert_eq!(config.own_queue_name(), "App1_test");
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingConfig {
    /// Application identifier; owns the inbound queue `{app}_{stage}`.
    pub app: String,
    /// Deployment stage; part of every queue name. Falls back to the
    /// `current_stage` environment variable during validation.
    #[serde(default)]
    pub stage: String,
    /// Worker/instance identifier. Defaulted to `{hostname}_{pid}` during
    /// validation when unset.
    #[serde(default)]
    pub worker: String,
    /// Explicit transporter selection. When absent, the registry of known
    /// transporters detects one from the settings below.
    #[serde(default)]
    pub transporter: Option<TransporterKind>,
    /// Queue-service settings; their presence marks this configuration as
    /// SQS-capable.
    #[serde(default)]
    pub sqs: Option<SqsSettings>,
    /// Broker settings; their presence marks this configuration as
    /// AMQP-capable.
    #[serde(default)]
    pub amqp: Option<AmqpSettings>,
}

impl MessagingConfig {
    /// Create a configuration with the two identifiers every instance needs.
    #[must_use]
    pub fn new(app: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            stage: stage.into(),
            worker: String::new(),
            transporter: None,
            sqs: None,
            amqp: None,
        }
    }

    /// Validate and complete this configuration in place.
    ///
    /// The stage falls back to the `current_stage` environment variable; a
    /// missing worker id is defaulted to `{hostname}_{pid}` with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Configuration`] when the application
    /// identifier or the stage cannot be determined.
    pub fn validate(&mut self) -> Result<(), MessagingError> {
        if self.app.is_empty() {
            return Err(MessagingError::Configuration(
                "no application identifier was set".to_string(),
            ));
        }

        if self.stage.is_empty() {
            match std::env::var(STAGE_ENV_VAR) {
                Ok(stage) if !stage.is_empty() => {
                    tracing::info!(stage = %stage, "stage taken from environment");
                    self.stage = stage;
                }
                _ => {
                    return Err(MessagingError::Configuration(
                        "application stage not set".to_string(),
                    ));
                }
            }
        }

        if self.worker.is_empty() {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            self.worker = format!("{host}_{}", std::process::id());
            tracing::warn!(worker = %self.worker, "worker id not set, assuming default");
        }

        Ok(())
    }

    /// The sender identity stamped into outgoing envelopes.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.app.clone(), self.worker.clone())
    }

    /// Name of this instance's own inbound queue.
    #[must_use]
    pub fn own_queue_name(&self) -> String {
        self.queue_name_for(&self.app)
    }

    /// Queue name a destination application owns. Always the sender's own
    /// stage: applications only talk within one deployment stage.
    #[must_use]
    pub fn queue_name_for(&self, app: &str) -> String {
        format!("{app}_{}", self.stage)
    }
}
