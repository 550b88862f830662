//! Synchronous in-process delivery for deterministic protocol tests.
//!
//! The [`DirectHub`] is an explicit shared registry mapping application
//! names to dispatch entry points; every participating transporter in a
//! test scope gets a clone of the same hub — there is no process-wide
//! global, and the registry dies with the scope that created it.
//!
//! Delivery is synchronous: `send_message`/`send_direct` look up the target
//! and run its dispatch state machine inline, so a request, the handler on
//! the other side, its reply and the caller's response handler all complete
//! within the one `send_request` call. Nothing is queued, which is why
//! `read_messages` has nothing to do and `delete_message`/`keep_message`
//! are no-ops.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use courier_core::config::MessagingConfig;
use courier_core::envelope::Envelope;
use courier_core::error::{MessagingError, TransportError};
use courier_core::transporter::{
    BatchReport, DeliveredMessage, Dispatcher, ReadParams, ReceiptHandle, SendReceipt, Transporter,
};

/// Shared registry of dispatch entry points, keyed by application name.
///
/// Clone it into every [`DirectTransporter`] that should see the same set
/// of applications.
#[derive(Clone, Default)]
pub struct DirectHub {
    registry: Arc<RwLock<HashMap<String, Arc<dyn Dispatcher>>>>,
}

impl DirectHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an application is currently registered.
    #[must_use]
    pub fn contains(&self, app: &str) -> bool {
        self.read().contains_key(app)
    }

    fn register(&self, app: String, dispatcher: Arc<dyn Dispatcher>) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app, dispatcher);
    }

    fn unregister(&self, app: &str) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(app);
    }

    fn lookup(&self, app: &str) -> Option<Arc<dyn Dispatcher>> {
        self.read().get(app).cloned()
    }

    fn read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Dispatcher>>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process transporter delivering straight into the target's dispatcher.
///
/// Addresses are application names; the stamped reply callback is simply the
/// sender's own name.
pub struct DirectTransporter {
    hub: DirectHub,
    app: String,
}

impl DirectTransporter {
    /// Create a transporter participating in `hub`.
    #[must_use]
    pub fn new(hub: DirectHub) -> Self {
        Self {
            hub,
            app: String::new(),
        }
    }

    async fn deliver(&self, address: &str, envelope: Envelope) -> Result<SendReceipt, MessagingError> {
        let body = envelope.to_json()?;
        let Some(target) = self.hub.lookup(address) else {
            return Err(MessagingError::DestinationNotFound {
                destination: address.to_string(),
            });
        };

        tracing::debug!(from = %self.app, to = %address, "delivering message in-process");
        let item = DeliveredMessage {
            body,
            handle: ReceiptHandle::default(),
        };
        let outcome = target.dispatch(item).await?;
        tracing::debug!(?outcome, "in-process dispatch settled");
        Ok(SendReceipt::default())
    }
}

impl Transporter for DirectTransporter {
    fn verify(&self, config: &MessagingConfig) {
        tracing::debug!(app = %config.app, "direct transporter needs no configuration");
    }

    fn initialize(&mut self, config: &MessagingConfig) -> Result<(), MessagingError> {
        self.app = config.app.clone();
        Ok(())
    }

    fn initialize_queue(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.hub.register(self.app.clone(), dispatcher);
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
                Some(override_callback.unwrap_or_else(|| self.app.clone()));
            self.deliver(&dest_app, envelope).await
        })
    }

    fn send_direct(
        &self,
        address: &str,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<SendReceipt, MessagingError>> + Send + '_>> {
        let address = address.to_string();
        Box::pin(async move { self.deliver(&address, envelope).await })
    }

    fn read_messages(
        &self,
        _params: Option<ReadParams>,
        _dispatcher: Arc<dyn Dispatcher>,
    ) -> Pin<Box<dyn Future<Output = Result<BatchReport, MessagingError>> + Send + '_>> {
        // Everything was already delivered synchronously at send time.
        Box::pin(async { Ok(BatchReport::default()) })
    }

    fn delete_message(
        &self,
        _handle: &ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn keep_message(
        &self,
        _handle: &ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.hub.unregister(&self.app);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use courier_core::envelope::Identity;
    use courier_core::transporter::{DispatchOutcome, ItemResult};
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingDispatcher {
        bodies: Mutex<Vec<String>>,
    }

    impl Dispatcher for RecordingDispatcher {
        fn dispatch(
            self: Arc<Self>,
            item: DeliveredMessage,
        ) -> Pin<Box<dyn Future<Output = ItemResult> + Send>> {
            Box::pin(async move {
                self.bodies.lock().expect("lock").push(item.body);
                Ok(DispatchOutcome::Done)
            })
        }
    }

    fn transporter_for(app: &str, hub: &DirectHub) -> DirectTransporter {
        let mut transporter = DirectTransporter::new(hub.clone());
        let mut config = MessagingConfig::new(app, "test");
        config.worker = "w1".to_string();
        transporter.initialize(&config).expect("initializes");
        transporter
    }

    fn envelope() -> Envelope {
        Envelope::request(Identity::new("App1", "w1"), "greet", json!("hi"), None, None)
    }

    #[tokio::test]
    async fn delivers_into_the_registered_dispatcher() {
        let hub = DirectHub::new();
        let sender = transporter_for("App1", &hub);
        let receiver = transporter_for("App2", &hub);

        let sink = Arc::new(RecordingDispatcher {
            bodies: Mutex::new(Vec::new()),
        });
        receiver
            .initialize_queue(Arc::clone(&sink) as Arc<dyn Dispatcher>)
            .await
            .expect("registers");

        sender
            .send_message("App2", envelope(), None)
            .await
            .expect("delivers");

        let bodies = sink.bodies.lock().expect("lock");
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].contains("\"callback\":\"App1\""));
    }

    #[tokio::test]
    async fn unknown_destination_is_reported() {
        let hub = DirectHub::new();
        let sender = transporter_for("App1", &hub);

        let err = sender.send_message("BLARGH", envelope(), None).await;
        assert!(matches!(
            err,
            Err(MessagingError::DestinationNotFound { destination }) if destination == "BLARGH"
        ));
    }

    #[tokio::test]
    async fn close_unregisters_the_application() {
        let hub = DirectHub::new();
        let transporter = transporter_for("App1", &hub);
        let sink = Arc::new(RecordingDispatcher {
            bodies: Mutex::new(Vec::new()),
        });
        transporter
            .initialize_queue(sink as Arc<dyn Dispatcher>)
            .await
            .expect("registers");
        assert!(hub.contains("App1"));

        transporter.close().await.expect("closes");
        assert!(!hub.contains("App1"));
        transporter.close().await.expect("close is idempotent");
    }
}
