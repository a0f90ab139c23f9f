//! Event Publisher Adapters
//!
//! `LoggingEventPublisher` turns domain events into audit log lines with the
//! same `workload`/`node`/`path`/`backend` fields the engine spans carry, so
//! one filter finds both. `InMemoryEventCollector` records events for tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Audit log publisher.
///
/// Conflicts, deregistrations and degraded mounts log at `warn`, routine
/// events at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let event_type = event.event_type();
        let workload = event.workload_id().unwrap_or("-");
        let (node, path) = event
            .path()
            .map(|(node, path)| (node, path.display().to_string()))
            .unwrap_or(("-", String::from("-")));
        let backend = event.backend_id().unwrap_or("-");
        let json = serde_json::to_string(&event)?;

        if event.needs_attention() {
            warn!(event_type, workload, node, %path, backend, event = %json, "Domain event");
        } else {
            info!(event_type, workload, node, %path, backend, event = %json, "Domain event");
        }
        Ok(())
    }
}

/// Records every published event for later assertions.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.read().clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Events about one workload, in publish order.
    pub fn events_for(&self, workload_id: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.workload_id() == Some(workload_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{NodeName, PathKey, PathKind};

    fn key() -> PathKey {
        PathKey::new(NodeName::new("node-1"), "/data/a")
    }

    #[tokio::test]
    async fn test_logging_publisher_accepts_every_kind() {
        let publisher = LoggingEventPublisher;
        for event in [
            DomainEvent::path_created(&key(), PathKind::Directory, 0o755),
            DomainEvent::binding_conflict("web-1", &key(), "readOnly true != bound false"),
            DomainEvent::backend_deregistered("lvm", "socket removed"),
        ] {
            publisher.publish(event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_collector_filters_by_type_and_workload() {
        let collector = InMemoryEventCollector::new();
        for event in [
            DomainEvent::volume_bound("web-0", &key(), 1),
            DomainEvent::volume_bound("web-1", &key(), 2),
            DomainEvent::volume_released("web-0", &key(), 1),
            DomainEvent::backend_deregistered("lvm", "heartbeat"),
        ] {
            collector.publish(event).await.unwrap();
        }

        assert_eq!(collector.events().len(), 4);
        assert_eq!(collector.events_of_type("VolumeBound").len(), 2);
        let web0: Vec<_> = collector
            .events_for("web-0")
            .iter()
            .map(|e| e.event_type())
            .collect();
        assert_eq!(web0, vec!["VolumeBound", "VolumeReleased"]);
    }
}
