//! Queue-service transporter for Courier over SQS.
//!
//! Each logical application owns exactly one named queue, `{app}_{stage}`.
//! Destination resolution is a name lookup (list by prefix), optionally
//! followed by queue creation when `create_queues` is configured.
//!
//! # Delivery semantics
//!
//! Consumption polls with a visibility timeout: a received-but-undeleted
//! item becomes invisible for a bounded window and reappears automatically
//! if not deleted in time. That timeout is the backend's only redelivery
//! mechanism, so here `keep_message` does nothing at all while
//! `delete_message` is a true acknowledgement. Multiple instances may poll
//! the same queue (competing consumers); the visibility timeout bounds how
//! long a crashed consumer can hold an item.
//!
//! # Example
//!
//! The orchestrator in `courier-runtime` owns the transporter and drives
//! its lifecycle; standalone, the contract looks like this:
//!
//! ```no_run
//! use courier_core::config::{MessagingConfig, SqsSettings};
//! use courier_core::transporter::Transporter;
//! use courier_sqs::SqsTransporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = MessagingConfig::new("App1", "production");
//! config.worker = "worker-1".to_string();
//! config.sqs = Some(SqsSettings::default());
//!
//! let mut transporter = SqsTransporter::new();
//! transporter.verify(&config);
//! transporter.initialize(&config)?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::Client;
use courier_core::config::{ConsumeSettings, MessagingConfig, SqsSettings};
use courier_core::envelope::Envelope;
use courier_core::error::{MessagingError, TransportError};
use courier_core::transporter::{
    BatchReport, DeliveredMessage, Dispatcher, ReadParams, ReceiptHandle, SendReceipt, Transporter,
};
use futures::future::join_all;
use tokio::sync::OnceCell;

/// Transporter backed by an SQS-compatible queue service.
#[derive(Default)]
pub struct SqsTransporter {
    app: String,
    stage: String,
    settings: SqsSettings,
    client: OnceCell<Client>,
    queue_url: OnceCell<String>,
    cached_urls: RwLock<HashMap<String, String>>,
}

impl SqsTransporter {
    /// Create an unconfigured transporter; `initialize` binds it to an
    /// application.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Some(region) = &self.settings.region {
                    loader = loader.region(Region::new(region.clone()));
                }
                if let Some(endpoint) = &self.settings.endpoint_url {
                    loader = loader.endpoint_url(endpoint.as_str());
                }
                let shared = loader.load().await;
                tracing::info!("queue-service client ready");
                Client::new(&shared)
            })
            .await
    }

    fn own_url(&self) -> Result<String, TransportError> {
        self.queue_url.get().cloned().ok_or_else(|| {
            TransportError::Backend(
                "own queue not initialized, call initialize_queue first".to_string(),
            )
        })
    }

    fn cached_url(&self, dest_app: &str) -> Option<String> {
        self.cached_urls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dest_app)
            .cloned()
    }

    fn cache_url(&self, dest_app: &str, url: &str) {
        self.cached_urls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dest_app.to_string(), url.to_string());
    }

    /// Look a queue up by its exact name, creating it when allowed.
    async fn find_queue(&self, queue_name: &str, auto_create: bool) -> Result<String, TransportError> {
        let client = self.client().await;
        let listed = client
            .list_queues()
            .queue_name_prefix(queue_name)
            .send()
            .await
            .map_err(|e| TransportError::Backend(format!("list queues failed: {e}")))?;

        if let Some(url) = listed.queue_urls().first() {
            return Ok(url.clone());
        }

        if auto_create {
            self.create_queue(queue_name).await
        } else {
            Err(TransportError::Backend(format!(
                "no queue found for {queue_name}"
            )))
        }
    }

    async fn create_queue(&self, queue_name: &str) -> Result<String, TransportError> {
        tracing::info!(queue = %queue_name, "creating queue");
        let created = self
            .client()
            .await
            .create_queue()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| TransportError::Backend(format!("create queue failed: {e}")))?;

        created
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| TransportError::Backend("create queue returned no url".to_string()))
    }

    /// Resolve a destination application to its queue URL, consulting the
    /// opportunistic cache first.
    async fn resolve_destination(&self, dest_app: &str) -> Result<String, MessagingError> {
        if let Some(url) = self.cached_url(dest_app) {
            return Ok(url);
        }

        let queue_name = queue_name(dest_app, &self.stage);
        match self.find_queue(&queue_name, self.settings.create_queues).await {
            Ok(url) => {
                self.cache_url(dest_app, &url);
                Ok(url)
            }
            Err(err) => {
                tracing::warn!(app = %dest_app, error = %err, "destination resolution failed");
                Err(MessagingError::DestinationNotFound {
                    destination: dest_app.to_string(),
                })
            }
        }
    }
}

fn queue_name(app: &str, stage: &str) -> String {
    format!("{app}_{stage}")
}

/// Merge per-call read parameters over the configured consume defaults.
fn effective_consume(defaults: ConsumeSettings, params: Option<ReadParams>) -> ConsumeSettings {
    let params = params.unwrap_or_default();
    ConsumeSettings {
        max_messages: params.max_messages.unwrap_or(defaults.max_messages),
        visibility_timeout: params.visibility_timeout.unwrap_or(defaults.visibility_timeout),
        wait_time: params.wait_time.unwrap_or(defaults.wait_time),
    }
}

impl Transporter for SqsTransporter {
    fn verify(&self, config: &MessagingConfig) {
        tracing::info!("checking queue-service configuration");
        match &config.sqs {
            None => {
                tracing::warn!("queue-service settings not set, relying on environment defaults");
            }
            Some(settings) => {
                if settings.region.is_none() && settings.endpoint_url.is_none() {
                    tracing::warn!("neither region nor endpoint configured, relying on environment defaults");
                }
            }
        }
    }

    fn initialize(&mut self, config: &MessagingConfig) -> Result<(), MessagingError> {
        self.app = config.app.clone();
        self.stage = config.stage.clone();
        self.settings = config.sqs.clone().unwrap_or_default();
        Ok(())
    }

    fn initialize_queue(
        &self,
        _dispatcher: Arc<dyn Dispatcher>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let queue_name = queue_name(&self.app, &self.stage);
            let url = self
                .queue_url
                .get_or_try_init(|| self.find_queue(&queue_name, self.settings.create_queues))
                .await?;
            tracing::info!(app = %self.app, queue_url = %url, "inbound queue ready");
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
            let own_url = self.own_url()?;
            envelope.sent_by.callback = Some(override_callback.unwrap_or(own_url));

            let destination = self.resolve_destination(&dest_app).await?;
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
            let body = envelope.to_json()?;
            tracing::debug!(queue_url = %address, service = %envelope.service, "sending message to queue");

            let sent = self
                .client()
                .await
                .send_message()
                .queue_url(&address)
                .message_body(body)
                .delay_seconds(0)
                .send()
                .await
                .map_err(|e| TransportError::Backend(format!("send failed: {e}")))?;

            Ok(SendReceipt {
                message_id: sent.message_id().map(str::to_string),
            })
        })
    }

    fn read_messages(
        &self,
        params: Option<ReadParams>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Pin<Box<dyn Future<Output = Result<BatchReport, MessagingError>> + Send + '_>> {
        Box::pin(async move {
            let queue_url = self.own_url()?;
            let consume = effective_consume(self.settings.consume, params);

            let received = self
                .client()
                .await
                .receive_message()
                .queue_url(&queue_url)
                .max_number_of_messages(consume.max_messages)
                .visibility_timeout(consume.visibility_timeout)
                .wait_time_seconds(consume.wait_time)
                .send()
                .await
                .map_err(|e| TransportError::Backend(format!("receive failed: {e}")))?;

            let mut items = Vec::new();
            for message in received.messages() {
                let (Some(body), Some(receipt)) = (message.body(), message.receipt_handle())
                else {
                    tracing::warn!("received item without body or receipt handle, skipping");
                    continue;
                };
                items.push(DeliveredMessage {
                    body: body.to_string(),
                    handle: ReceiptHandle::new(receipt),
                });
            }

            tracing::debug!(count = items.len(), "dispatching received batch");
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
            let queue_url = self.own_url()?;
            self.client()
                .await
                .delete_message()
                .queue_url(queue_url)
                .receipt_handle(handle.as_str())
                .send()
                .await
                .map_err(|e| TransportError::Backend(format!("delete failed: {e}")))?;
            Ok(())
        })
    }

    fn keep_message(
        &self,
        _handle: &ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        // The visibility timeout brings the item back on its own.
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        // The client is connectionless; there is nothing to release.
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn transporter_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<SqsTransporter>();
        assert_sync::<SqsTransporter>();
    }

    #[test]
    fn queue_names_follow_the_app_stage_convention() {
        assert_eq!(queue_name("App1", "test"), "App1_test");
    }

    #[test]
    fn read_params_override_consume_defaults() {
        let defaults = ConsumeSettings {
            max_messages: 10,
            visibility_timeout: 30,
            wait_time: 0,
        };

        let merged = effective_consume(
            defaults,
            Some(ReadParams {
                max_messages: Some(2),
                visibility_timeout: None,
                wait_time: Some(5),
            }),
        );

        assert_eq!(merged.max_messages, 2);
        assert_eq!(merged.visibility_timeout, 30);
        assert_eq!(merged.wait_time, 5);
    }

    #[test]
    fn missing_params_fall_back_to_defaults() {
        let merged = effective_consume(ConsumeSettings::default(), None);
        assert_eq!(merged.max_messages, 10);
        assert_eq!(merged.visibility_timeout, 30);
        assert_eq!(merged.wait_time, 0);
    }

    #[tokio::test]
    async fn sending_before_queue_initialization_fails_cleanly() {
        let mut transporter = SqsTransporter::new();
        let mut config = MessagingConfig::new("App1", "test");
        config.worker = "w1".to_string();
        transporter.initialize(&config).expect("initializes");

        let envelope = Envelope::request(
            courier_core::envelope::Identity::new("App1", "w1"),
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
}
