use std::fmt;

use tokio::sync::broadcast;

use crate::aa::state::AaResponse;

/// Event topic, rendered as the wire topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    AaResponse,
    AaResponseToUnit(String),
    AaResponseToAddress(String),
    AaResponseFromAa(String),
    NewAaUnit,
    /// New rows were queued in `aa_triggers`
    NewAaTriggers,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::AaResponse => write!(f, "aa_response"),
            Topic::AaResponseToUnit(unit) => write!(f, "aa_response_to_unit-{}", unit),
            Topic::AaResponseToAddress(address) => write!(f, "aa_response_to_address-{}", address),
            Topic::AaResponseFromAa(address) => write!(f, "aa_response_from_aa-{}", address),
            Topic::NewAaUnit => write!(f, "new_aa_unit"),
            Topic::NewAaTriggers => write!(f, "new_aa_triggers"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Response(AaResponse),
    Unit(String),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub topic: Topic,
    pub payload: EventPayload,
}

/// EventBus provides a publish-subscribe mechanism for engine events.
/// Uses a broadcast channel so multiple subscribers can receive events.
/// If the channel buffer is full, the oldest events are dropped for lagging receivers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new EventBus with a default buffer size (1024 events).
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers.
    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, topic: Topic, payload: EventPayload) -> usize {
        self.tx.send(EngineEvent { topic, payload }).unwrap_or(0)
    }

    /// Publish a response under all four response topics
    pub fn publish_response(&self, response: &AaResponse) {
        let topics = [
            Topic::AaResponse,
            Topic::AaResponseToUnit(response.trigger_unit.clone()),
            Topic::AaResponseToAddress(response.trigger_address.clone()),
            Topic::AaResponseFromAa(response.aa_address.clone()),
        ];
        for topic in topics {
            self.publish(topic, EventPayload::Response(response.clone()));
        }
    }

    pub fn notify_new_triggers(&self) -> usize {
        self.publish(Topic::NewAaTriggers, EventPayload::Empty)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aa::state::ResponseBody;

    #[test]
    fn topic_names() {
        assert_eq!(Topic::AaResponse.to_string(), "aa_response");
        assert_eq!(
            Topic::AaResponseToUnit("U1".into()).to_string(),
            "aa_response_to_unit-U1"
        );
        assert_eq!(
            Topic::AaResponseFromAa("AA".into()).to_string(),
            "aa_response_from_aa-AA"
        );
        assert_eq!(Topic::NewAaUnit.to_string(), "new_aa_unit");
    }

    #[tokio::test]
    async fn response_is_published_on_four_topics() {
        let bus = EventBus::with_capacity(16);
        let mut rx = bus.subscribe();
        let response = AaResponse {
            mci: 1,
            trigger_address: "USER".into(),
            trigger_unit: "U1".into(),
            aa_address: "AA".into(),
            bounced: false,
            response_unit: None,
            response: ResponseBody::default(),
        };
        bus.publish_response(&response);

        let mut topics = Vec::new();
        for _ in 0..4 {
            topics.push(rx.recv().await.expect("event").topic.to_string());
        }
        assert_eq!(
            topics,
            vec![
                "aa_response",
                "aa_response_to_unit-U1",
                "aa_response_to_address-USER",
                "aa_response_from_aa-AA"
            ]
        );
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Topic::NewAaUnit, EventPayload::Unit("U".into())), 0);
    }
}
