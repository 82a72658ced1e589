//! Outbound status messages. Everything the controller says on the bus goes
//! through here as `{sender, message}`, tagged with its own identity so its
//! own subscription can recognise and drop the echo.

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct Notifier {
    identity: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Notifier {
    pub fn new(identity: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                identity: identity.into(),
                tx,
            },
            rx,
        )
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Queue `{sender, message}` for `topic`. Never blocks; if the pump is
    /// gone the message is logged and dropped.
    pub fn notify(&self, topic: &str, message: impl Serialize) {
        let payload = json!({
            "sender": self.identity,
            "message": message,
        });
        if self
            .tx
            .send(Outbound {
                topic: topic.to_string(),
                payload,
            })
            .is_err()
        {
            warn!(topic, "notification dropped, publisher stopped");
        }
    }
}

/// Drain queued notifications into the broker. Runs until every `Notifier`
/// clone is dropped.
pub async fn pump(mut rx: mpsc::UnboundedReceiver<Outbound>, client: AsyncClient) {
    while let Some(out) = rx.recv().await {
        let body = out.payload.to_string();
        debug!(topic = %out.topic, payload = %body, "publishing");
        if let Err(e) = client
            .publish(out.topic.as_str(), QoS::AtLeastOnce, false, body.into_bytes())
            .await
        {
            error!(topic = %out.topic, "failed to publish notification: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
