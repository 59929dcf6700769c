//! best-effort fan-out of telemetry events to every registered viewer

use crate::domain::TelemetryEvent;
use crate::registry::SubscriberRegistry;
use std::sync::Arc;

/// outcome of one publish, for logging and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: SubscriberRegistry,
}

impl Broadcaster {
    pub fn new(registry: SubscriberRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Push `event` to every subscriber registered right now.
    ///
    /// The event is serialized once. A subscriber whose queue is closed or
    /// full is removed; the others still receive the frame. Never fails.
    pub async fn publish(&self, event: &TelemetryEvent) -> PublishReport {
        let frame: Arc<str> = match serde_json::to_string(&event.to_wire()) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize event");
                return PublishReport::default();
            }
        };

        let mut report = PublishReport::default();
        let mut failed = Vec::new();
        self.registry
            .for_each(|subscriber| match subscriber.try_deliver(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping viewer");
                    failed.push(subscriber.id());
                }
            })
            .await;

        for id in failed {
            self.registry.remove(id).await;
            report.dropped += 1;
        }
        report
    }
}
