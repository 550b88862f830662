//! Broker transporter for Courier over AMQP.
//!
//! Each application owns a durable queue named `{app}_{stage}`, served by
//! its own channel with a configured prefetch window. Destination
//! resolution either asserts the target queue (`create_queues`) or checks
//! its existence with a passive declare — a failed passive declare kills
//! the channel, so the connection is recycled before
//! `DestinationNotFound` is reported.
//!
//! # Backpressure
//!
//! Publishing consults the channel state; while the channel reports busy
//! the publish is retried after a fixed delay. The retry is bounded by the
//! configured attempt cap and cancellable through `close`, surfacing a
//! transport error when exhausted — flow control never loops forever.
//!
//! # Consumption
//!
//! Two reading modes, selected by configuration: `rpc` pulls one pending
//! item per `read_messages` call and reports its dispatch outcome;
//! `consume` registers a push consumer on first read and dispatches
//! deliveries from a background task until `close`. Acknowledgement is
//! explicit either way — `delete_message` acks, `keep_message` nacks with
//! requeue.
//!
//! # Example
//!
//! The orchestrator in `courier-runtime` owns the transporter and drives
//! its lifecycle; standalone, the contract looks like this:
//!
//! ```no_run
//! use courier_core::config::{AmqpSettings, MessagingConfig};
//! use courier_core::transporter::Transporter;
//! use courier_amqp::AmqpTransporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = MessagingConfig::new("App1", "production");
//! config.worker = "worker-1".to_string();
//! config.amqp = Some(AmqpSettings {
//!     address: "amqp://127.0.0.1:5672/%2f".to_string(),
//!     ..AmqpSettings::default()
//! });
//!
//! let mut transporter = AmqpTransporter::new();
//! transporter.verify(&config);
//! transporter.initialize(&config)?;
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use courier_core::config::{AmqpSettings, MessagingConfig, ReadingMode};
use courier_core::envelope::Envelope;
use courier_core::error::{MessagingError, TransportError};
use courier_core::retry::{RetryError, RetryPolicy, retry_with_backoff};
use courier_core::transporter::{
    BatchReport, DeliveredMessage, Dispatcher, ReadParams, ReceiptHandle, SendReceipt, Transporter,
};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

/// Reply code used when this side closes a connection deliberately.
const CLOSE_OK: u16 = 200;

struct AmqpLink {
    connection: Connection,
    channel: Channel,
}

/// Transporter backed by an AMQP broker.
pub struct AmqpTransporter {
    app: String,
    stage: String,
    settings: AmqpSettings,
    link: RwLock<Option<AmqpLink>>,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
    closed: watch::Sender<bool>,
}

impl Default for AmqpTransporter {
    fn default() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            app: String::new(),
            stage: String::new(),
            settings: AmqpSettings::default(),
            link: RwLock::new(None),
            consumer_task: Mutex::new(None),
            closed,
        }
    }
}

impl AmqpTransporter {
    /// Create an unconfigured transporter; `initialize` binds it to an
    /// application.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn own_queue(&self) -> String {
        queue_name(&self.app, &self.stage)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn channel(&self) -> Result<Channel, TransportError> {
        let guard = self.link.read().await;
        guard
            .as_ref()
            .map(|link| link.channel.clone())
            .ok_or_else(|| {
                TransportError::Backend(
                    "broker link not initialized, call initialize_queue first".to_string(),
                )
            })
    }

    /// Connect and open the channel unless one is already up. Idempotent.
    async fn ensure_link(&self) -> Result<(), TransportError> {
        let mut guard = self.link.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let connection = Connection::connect(&self.settings.address, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connection(format!("broker connect failed: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("channel open failed: {e}")))?;
        channel
            .basic_qos(self.settings.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Backend(format!("qos failed: {e}")))?;

        tracing::info!(
            address = %self.settings.address,
            prefetch = self.settings.prefetch,
            "broker link established"
        );
        *guard = Some(AmqpLink { connection, channel });
        Ok(())
    }

    /// Tear the (possibly broken) connection down and build a fresh one
    /// with the own queue re-declared.
    async fn recycle(&self) -> Result<(), TransportError> {
        {
            let mut guard = self.link.write().await;
            if let Some(link) = guard.take() {
                if let Err(err) = link.connection.close(CLOSE_OK, "recycling").await {
                    tracing::debug!(error = %err, "old broker connection close failed");
                }
            }
        }

        self.ensure_link().await?;
        let channel = self.channel().await?;
        channel
            .queue_declare(&self.own_queue(), durable_queue(), FieldTable::default())
            .await
            .map_err(|e| TransportError::Backend(format!("queue assert failed: {e}")))?;
        Ok(())
    }

    /// Register the push consumer, once. Deliveries are dispatched from a
    /// background task until the close signal fires.
    async fn spawn_consumer(
        &self,
        channel: Channel,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<(), TransportError> {
        {
            let guard = self
                .consumer_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if guard.as_ref().is_some_and(|task| !task.is_finished()) {
                return Ok(());
            }
        }

        let queue = self.own_queue();
        let mut consumer = channel
            .basic_consume(
                &queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Backend(format!("consume failed: {e}")))?;

        let mut closed = self.closed.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivery = consumer.next() => {
                        match delivery {
                            Some(Ok(delivery)) => {
                                let item = DeliveredMessage {
                                    body: String::from_utf8_lossy(&delivery.data).into_owned(),
                                    handle: ReceiptHandle::new(delivery.delivery_tag.to_string()),
                                };
                                if let Err(err) = Arc::clone(&dispatcher).dispatch(item).await {
                                    tracing::error!(error = %err, "dispatch of consumed item failed");
                                }
                            }
                            Some(Err(err)) => {
                                tracing::error!(error = %err, "broker consumer failure");
                            }
                            None => break,
                        }
                    }
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("broker consumer task exiting");
        });

        *self
            .consumer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }
}

fn queue_name(app: &str, stage: &str) -> String {
    format!("{app}_{stage}")
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

fn passive_check() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: true,
        ..QueueDeclareOptions::default()
    }
}

fn parse_tag(handle: &ReceiptHandle) -> Result<u64, TransportError> {
    handle.as_str().parse().map_err(|_| {
        TransportError::Backend(format!("malformed delivery tag: {}", handle.as_str()))
    })
}

impl Transporter for AmqpTransporter {
    fn verify(&self, config: &MessagingConfig) {
        tracing::info!("checking broker configuration");
        match &config.amqp {
            None => tracing::warn!("broker settings not set"),
            Some(settings) => {
                tracing::info!(address = %settings.address, reading_mode = ?settings.reading_mode, "broker settings found");
            }
        }
    }

    fn initialize(&mut self, config: &MessagingConfig) -> Result<(), MessagingError> {
        let Some(settings) = config.amqp.clone() else {
            return Err(MessagingError::Configuration(
                "broker settings not set".to_string(),
            ));
        };
        self.app = config.app.clone();
        self.stage = config.stage.clone();
        self.settings = settings;
        Ok(())
    }

    fn initialize_queue(
        &self,
        _dispatcher: Arc<dyn Dispatcher>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_link().await?;
            let channel = self.channel().await?;
            let queue = self.own_queue();
            channel
                .queue_declare(&queue, durable_queue(), FieldTable::default())
                .await
                .map_err(|e| TransportError::Backend(format!("queue declare failed: {e}")))?;
            tracing::info!(queue = %queue, "inbound queue ready");
            Ok(())
        })
    }

    fn send_message(
        &self,
        dest_app: &str,
        mut envelope: Envelope,
        override_callback: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<SendReceipt, MessagingError>> + Send + '_>> {
        let dest_app = dest_app.to_string();
        Box::pin(async move {
            envelope.sent_by.callback =
                Some(override_callback.unwrap_or_else(|| self.own_queue()));
            let destination = queue_name(&dest_app, &self.stage);
            let channel = self.channel().await?;

            if self.settings.create_queues {
                channel
                    .queue_declare(&destination, durable_queue(), FieldTable::default())
                    .await
                    .map_err(|e| {
                        TransportError::Backend(format!("queue assert failed: {e}"))
                    })?;
            } else if let Err(err) = channel
                .queue_declare(&destination, passive_check(), FieldTable::default())
                .await
            {
                // The failed passive declare closed the channel underneath
                // us; restore the link before reporting.
                tracing::warn!(
                    queue = %destination,
                    error = %err,
                    "destination check failed, recycling broker connection"
                );
                self.recycle().await?;
                return Err(MessagingError::DestinationNotFound {
                    destination: dest_app,
                });
            }

            self.send_direct(&destination, envelope).await
        })
    }

    fn send_direct(
        &self,
        address: &str,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<SendReceipt, MessagingError>> + Send + '_>> {
        let address = address.to_string();
        Box::pin(async move {
            if self.is_closed() {
                return Err(TransportError::Closed.into());
            }
            let payload = envelope.to_json()?;
            let channel = self.channel().await?;
            let policy = RetryPolicy::fixed(
                self.settings.publish_retry_attempts,
                Duration::from_millis(self.settings.publish_retry_delay_ms),
            );

            let published = retry_with_backoff(&policy, self.closed.subscribe(), || {
                let channel = channel.clone();
                let payload = payload.clone();
                let address = address.clone();
                async move {
                    if !channel.status().connected() {
                        return Err(TransportError::Backend(
                            "channel busy, waiting to send again".to_string(),
                        ));
                    }
                    let confirm = channel
                        .basic_publish(
                            "",
                            &address,
                            BasicPublishOptions::default(),
                            payload.as_bytes(),
                            BasicProperties::default(),
                        )
                        .await
                        .map_err(|e| TransportError::Backend(format!("publish failed: {e}")))?;
                    confirm
                        .await
                        .map_err(|e| TransportError::Backend(format!("publish confirm failed: {e}")))?;
                    Ok(())
                }
            })
            .await;

            match published {
                Ok(()) => {
                    tracing::debug!(kind = ?envelope.kind, service = %envelope.service, "broker message sent");
                    Ok(SendReceipt::default())
                }
                Err(RetryError::Cancelled) => Err(TransportError::Closed.into()),
                Err(RetryError::Exhausted(err)) => Err(err.into()),
            }
        })
    }

    fn read_messages(
        &self,
        _params: Option<ReadParams>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Pin<Box<dyn Future<Output = Result<BatchReport, MessagingError>> + Send + '_>> {
        Box::pin(async move {
            tracing::debug!("broker reading messages");
            let channel = self.channel().await?;

            match self.settings.reading_mode {
                ReadingMode::Rpc => {
                    let fetched = channel
                        .basic_get(&self.own_queue(), BasicGetOptions::default())
                        .await
                        .map_err(|e| TransportError::Backend(format!("get failed: {e}")))?;

                    let Some(message) = fetched else {
                        return Ok(BatchReport::default());
                    };

                    let item = DeliveredMessage {
                        body: String::from_utf8_lossy(&message.delivery.data).into_owned(),
                        handle: ReceiptHandle::new(message.delivery.delivery_tag.to_string()),
                    };
                    let result = dispatcher.dispatch(item).await;
                    Ok(BatchReport::new(vec![result]))
                }
                ReadingMode::Consume => {
                    // Push mode: items arrive through the background
                    // consumer from now on; there is no batch to report.
                    self.spawn_consumer(channel, dispatcher).await?;
                    Ok(BatchReport::default())
                }
            }
        })
    }

    fn delete_message(
        &self,
        handle: &ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let handle = handle.clone();
        Box::pin(async move {
            tracing::debug!("acking broker message");
            let tag = parse_tag(&handle)?;
            let channel = self.channel().await?;
            channel
                .basic_ack(tag, BasicAckOptions::default())
                .await
                .map_err(|e| TransportError::Backend(format!("ack failed: {e}")))
        })
    }

    fn keep_message(
        &self,
        handle: &ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let handle = handle.clone();
        Box::pin(async move {
            tracing::debug!("nacking broker message for redelivery");
            let tag = parse_tag(&handle)?;
            let channel = self.channel().await?;
            channel
                .basic_nack(
                    tag,
                    BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    },
                )
                .await
                .map_err(|e| TransportError::Backend(format!("nack failed: {e}")))
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.closed.send_replace(true);

            let task = self
                .consumer_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(task) = task {
                task.abort();
            }

            let link = self.link.write().await.take();
            if let Some(link) = link {
                if let Err(err) = link.connection.close(CLOSE_OK, "closing").await {
                    tracing::warn!(error = %err, "broker connection close failed");
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use courier_core::envelope::Identity;

    #[test]
    fn transporter_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<AmqpTransporter>();
        assert_sync::<AmqpTransporter>();
    }

    #[test]
    fn delivery_tags_round_trip_through_handles() {
        let handle = ReceiptHandle::new("42");
        assert_eq!(parse_tag(&handle).expect("parses"), 42);

        let bad = ReceiptHandle::new("not-a-tag");
        assert!(parse_tag(&bad).is_err());
    }

    #[test]
    fn initialize_requires_broker_settings() {
        let mut transporter = AmqpTransporter::new();
        let mut config = MessagingConfig::new("App1", "test");
        config.worker = "w1".to_string();

        assert!(matches!(
            transporter.initialize(&config),
            Err(MessagingError::Configuration(_))
        ));

        config.amqp = Some(AmqpSettings::default());
        assert!(transporter.initialize(&config).is_ok());
        assert_eq!(transporter.own_queue(), "App1_test");
    }

    #[test]
    fn publish_retry_policy_uses_a_fixed_delay() {
        let settings = AmqpSettings::default();
        let policy = RetryPolicy::fixed(
            settings.publish_retry_attempts,
            Duration::from_millis(settings.publish_retry_delay_ms),
        );

        assert_eq!(policy.max_retries, 6);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn sending_before_link_setup_fails_cleanly() {
        let mut transporter = AmqpTransporter::new();
        let mut config = MessagingConfig::new("App1", "test");
        config.worker = "w1".to_string();
        config.amqp = Some(AmqpSettings::default());
        transporter.initialize(&config).expect("initializes");

        let envelope = Envelope::request(
            Identity::new("App1", "w1"),
            "greet",
            serde_json::json!("hi"),
            None,
            None,
        );
        let result = transporter.send_message("App2", envelope, None).await;
        assert!(matches!(
            result,
            Err(MessagingError::Transport(TransportError::Backend(_)))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_without_a_link() {
        let transporter = AmqpTransporter::new();
        transporter.close().await.expect("first close");
        transporter.close().await.expect("second close");
        assert!(transporter.is_closed());
    }
}
