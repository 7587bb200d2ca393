//! Event Types
//!
//! Every event carries a timestamp header and a body. Bodies are closed sums
//! so handlers match them exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// An event delivered to registered handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event was created
    pub time: DateTime<Utc>,

    /// Event payload
    pub body: EventBody,
}

impl Event {
    /// Create a new event stamped with the current time
    pub fn new(body: impl Into<EventBody>) -> Self {
        Self {
            time: Utc::now(),
            body: body.into(),
        }
    }

    /// Dotted namespace identifying the event kind (e.g. "Control.MetricSubscription")
    pub fn namespace(&self) -> &'static str {
        match &self.body {
            EventBody::Demand(d) => d.namespace(),
            EventBody::Control(c) => c.namespace(),
        }
    }

    /// The demand payload, if this is a demand event
    pub fn as_demand(&self) -> Option<&DemandEvent> {
        match &self.body {
            EventBody::Demand(d) => Some(d),
            EventBody::Control(_) => None,
        }
    }

    /// The control payload, if this is a control event
    pub fn as_control(&self) -> Option<&ControlEvent> {
        match &self.body {
            EventBody::Control(c) => Some(c),
            EventBody::Demand(_) => None,
        }
    }
}

impl From<DemandEvent> for Event {
    fn from(event: DemandEvent) -> Self {
        Event::new(event)
    }
}

impl From<ControlEvent> for Event {
    fn from(event: ControlEvent) -> Self {
        Event::new(event)
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum EventBody {
    /// Something now needs a plugin running
    Demand(DemandEvent),
    /// The control plane reporting on instances it supervises
    Control(ControlEvent),
}

impl From<DemandEvent> for EventBody {
    fn from(event: DemandEvent) -> Self {
        EventBody::Demand(event)
    }
}

impl From<ControlEvent> for EventBody {
    fn from(event: ControlEvent) -> Self {
        EventBody::Control(event)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Demand Events
// ─────────────────────────────────────────────────────────────────────────────

/// Demand signals that may cause plugin instances to be started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DemandEvent {
    /// A task subscribed to a publisher plugin
    PublisherSubscription {
        plugin_name: String,
        plugin_version: i32,
    },

    /// A task subscribed to a metric served by some collector
    MetricSubscription {
        metric_namespace: Vec<String>,
        version: i32,
    },
}

impl DemandEvent {
    pub fn publisher_subscription(name: impl Into<String>, version: i32) -> Self {
        DemandEvent::PublisherSubscription {
            plugin_name: name.into(),
            plugin_version: version,
        }
    }

    pub fn metric_subscription<S: Into<String>>(
        namespace: impl IntoIterator<Item = S>,
        version: i32,
    ) -> Self {
        DemandEvent::MetricSubscription {
            metric_namespace: namespace.into_iter().map(Into::into).collect(),
            version,
        }
    }

    pub fn namespace(&self) -> &'static str {
        match self {
            DemandEvent::PublisherSubscription { .. } => "Control.PublisherSubscription",
            DemandEvent::MetricSubscription { .. } => "Control.MetricSubscription",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control Events
// ─────────────────────────────────────────────────────────────────────────────

/// Events emitted by the control plane about the instances it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    /// An instance was started and registered
    AvailablePluginStarted {
        id: u64,
        name: String,
        version: i32,
        plugin_type: String,
    },

    /// An instance was stopped and removed
    AvailablePluginStopped {
        id: u64,
        name: String,
        version: i32,
        reason: String,
    },

    /// A health probe failed or timed out
    HealthCheckFailed {
        id: u64,
        name: String,
        version: i32,
        failures: u32,
    },

    /// An instance exceeded its health check failure limit and was disabled
    DeadAvailablePlugin {
        id: u64,
        name: String,
        version: i32,
        failures: u32,
    },
}

impl ControlEvent {
    pub fn namespace(&self) -> &'static str {
        match self {
            ControlEvent::AvailablePluginStarted { .. } => "Control.AvailablePluginStarted",
            ControlEvent::AvailablePluginStopped { .. } => "Control.AvailablePluginStopped",
            ControlEvent::HealthCheckFailed { .. } => "Control.HealthCheckFailed",
            ControlEvent::DeadAvailablePlugin { .. } => "Control.DeadAvailablePlugin",
        }
    }

    /// Id of the available plugin the event is about
    pub fn plugin_id(&self) -> u64 {
        match self {
            ControlEvent::AvailablePluginStarted { id, .. }
            | ControlEvent::AvailablePluginStopped { id, .. }
            | ControlEvent::HealthCheckFailed { id, .. }
            | ControlEvent::DeadAvailablePlugin { id, .. } => *id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_subscription_builder() {
        let event = DemandEvent::metric_subscription(["intel", "mock", "foo"], 2);

        assert_eq!(
            event,
            DemandEvent::MetricSubscription {
                metric_namespace: vec!["intel".into(), "mock".into(), "foo".into()],
                version: 2,
            }
        );
        assert_eq!(event.namespace(), "Control.MetricSubscription");
    }

    #[test]
    fn test_event_accessors() {
        let demand = Event::from(DemandEvent::publisher_subscription("file", 1));
        assert!(demand.as_demand().is_some());
        assert!(demand.as_control().is_none());
        assert_eq!(demand.namespace(), "Control.PublisherSubscription");

        let control = Event::from(ControlEvent::HealthCheckFailed {
            id: 4,
            name: "mock".into(),
            version: 1,
            failures: 1,
        });
        assert_eq!(control.as_control().map(|c| c.plugin_id()), Some(4));
        assert_eq!(control.namespace(), "Control.HealthCheckFailed");
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = Event::from(DemandEvent::publisher_subscription("file", 3));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["body"]["kind"], "demand");
        assert_eq!(json["body"]["event"]["type"], "PublisherSubscription");
        assert_eq!(json["body"]["event"]["plugin_name"], "file");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
