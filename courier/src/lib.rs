//! # Courier
//!
//! Correlated request/response messaging over pluggable delivery backends.
//!
//! This umbrella crate re-exports the messaging surface and wires the
//! registry of known transporter kinds: build a [`Messaging`] instance from
//! configuration alone with [`from_config`], selecting the backend either
//! explicitly (the `transporter` key) or by detection from which backend
//! settings are present.
//!
//! # Quick start
//!
//! ```no_run
//! use courier::{MessagingConfig, SqsSettings, from_config};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = MessagingConfig::new("App1", "production");
//! config.sqs = Some(SqsSettings::default());
//!
//! let messaging = from_config(config)?;
//! messaging.on_response("greet", |message| async move {
//!     println!("{} answered: {}", message.sent_by().application, message.body());
//!     message.done().await
//! });
//! messaging.initialize_queue().await?;
//!
//! messaging.send_request("App2", "greet", json!("hi"), None, None).await?;
//! messaging.read_messages(None).await?;
//! # Ok(())
//! # }
//! ```

pub use courier_amqp::AmqpTransporter;
pub use courier_core::config::{
    AmqpSettings, ConsumeSettings, MessagingConfig, ReadingMode, SqsSettings, TransporterKind,
};
pub use courier_core::envelope::{Envelope, Identity, MessageKind};
pub use courier_core::error::{MessagingError, TransportError};
pub use courier_core::transporter::{
    BatchReport, DispatchOutcome, ItemResult, ReadParams, SendReceipt, Transporter,
};
pub use courier_runtime::{InboundRequest, InboundResponse, Messaging};
pub use courier_sqs::SqsTransporter;

/// One entry of the known-transporter registry: a kind and the
/// configuration shape that marks it.
struct KnownTransporter {
    kind: TransporterKind,
    detector: fn(&MessagingConfig) -> bool,
}

fn detect_sqs(config: &MessagingConfig) -> bool {
    config.sqs.is_some()
}

fn detect_amqp(config: &MessagingConfig) -> bool {
    config.amqp.is_some()
}

const KNOWN_TRANSPORTERS: &[KnownTransporter] = &[
    KnownTransporter {
        kind: TransporterKind::Sqs,
        detector: detect_sqs,
    },
    KnownTransporter {
        kind: TransporterKind::Amqp,
        detector: detect_amqp,
    },
];

/// Build the transporter for an explicitly selected kind.
#[must_use]
pub fn build_transporter(kind: TransporterKind) -> Box<dyn Transporter> {
    match kind {
        TransporterKind::Sqs => Box::new(SqsTransporter::new()),
        TransporterKind::Amqp => Box::new(AmqpTransporter::new()),
    }
}

/// Detect which known transporter a configuration is meant for.
///
/// When several backend settings are present the first match wins, with a
/// warning.
///
/// # Errors
///
/// Returns [`MessagingError::Configuration`] when no known transporter
/// matches the configuration.
pub fn detect_transporter(config: &MessagingConfig) -> Result<TransporterKind, MessagingError> {
    let mut found = KNOWN_TRANSPORTERS
        .iter()
        .filter(|entry| (entry.detector)(config));

    let Some(first) = found.next() else {
        return Err(MessagingError::Configuration(
            "no message transporter found".to_string(),
        ));
    };
    if found.next().is_some() {
        tracing::warn!(using = %first.kind, "multiple compatible transporters configured");
    }
    Ok(first.kind)
}

/// Construct a [`Messaging`] instance from configuration alone.
///
/// # Errors
///
/// Returns [`MessagingError::Configuration`] when no transporter can be
/// resolved or the configuration is incomplete; construction performs no
/// I/O, so no other failure kind can occur here.
pub fn from_config(config: MessagingConfig) -> Result<Messaging, MessagingError> {
    let kind = match config.transporter {
        Some(kind) => kind,
        None => detect_transporter(&config)?,
    };
    tracing::debug!(kind = %kind, "transporter selected");
    Messaging::new(config, build_transporter(kind))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn config() -> MessagingConfig {
        let mut config = MessagingConfig::new("App1", "test");
        config.worker = "w1".to_string();
        config
    }

    #[test]
    fn detects_sqs_from_its_settings() {
        let mut config = config();
        config.sqs = Some(SqsSettings::default());
        assert_eq!(detect_transporter(&config).ok(), Some(TransporterKind::Sqs));
    }

    #[test]
    fn detects_amqp_from_its_settings() {
        let mut config = config();
        config.amqp = Some(AmqpSettings::default());
        assert_eq!(detect_transporter(&config).ok(), Some(TransporterKind::Amqp));
    }

    #[test]
    fn first_match_wins_when_both_are_configured() {
        let mut config = config();
        config.sqs = Some(SqsSettings::default());
        config.amqp = Some(AmqpSettings::default());
        assert_eq!(detect_transporter(&config).ok(), Some(TransporterKind::Sqs));
    }

    #[test]
    fn bare_configuration_resolves_no_transporter() {
        let err = detect_transporter(&config());
        assert!(matches!(err, Err(MessagingError::Configuration(_))));
    }

    #[test]
    fn from_config_builds_a_detected_instance() {
        let mut config = config();
        config.sqs = Some(SqsSettings::default());
        let messaging = from_config(config).expect("constructs");
        assert_eq!(messaging.config().app, "App1");
    }

    #[test]
    fn explicit_selection_still_requires_its_settings() {
        let mut config = config();
        config.transporter = Some(TransporterKind::Amqp);
        // The AMQP transporter refuses a configuration without its block.
        assert!(matches!(
            from_config(config),
            Err(MessagingError::Configuration(_))
        ));
    }
}
