//! Kubernetes events emitted on services.
//!
//! Publishing is fire-and-forget: a failed event is logged and never
//! interrupts reconcilation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};

#[cfg(test)]
use mockall::automock;

use crate::consts;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a warning event about the referenced object.
    async fn warn(&self, object: &ObjectReference, reason: &str, note: String);
}

pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: consts::EVENT_REPORTER.to_string(),
                instance: std::env::var("HOSTNAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn warn(&self, object: &ObjectReference, reason: &str, note: String) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: consts::ACTION_RECONCILE.to_string(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            tracing::warn!(reason, "Failed to publish event: {}", err);
        }
    }
}
