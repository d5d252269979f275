//! Domain events and the broker message envelope.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

/// Attribute carrying the dispatch key.
pub const EVENT_TYPE_ATTRIBUTE: &str = "event_type";

/// Attribute carrying the publisher-assigned event ID.
pub const EVENT_ID_ATTRIBUTE: &str = "event_id";

/// Attribute the broker sets to the delivery attempt, as a decimal string.
pub const DELIVERY_ATTEMPT_ATTRIBUTE: &str = "delivery_attempt";

/// String-keyed message attributes.
pub type Attributes = HashMap<String, String>;

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    /// Returns the event type name, used as the dispatch key.
    fn event_type(&self) -> &'static str;

    /// Messages sharing an ordering key are delivered in publish order.
    fn ordering_key(&self) -> Option<String> {
        None
    }
}

/// An opaque payload plus attributes, as carried by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Broker-assigned message ID.
    pub id: String,

    pub data: Vec<u8>,

    pub attributes: Attributes,

    pub ordering_key: Option<String>,

    pub publish_time: DateTime<Utc>,
}

impl Message {
    pub fn new(data: Vec<u8>, attributes: Attributes) -> Self {
        Self {
            id: String::new(),
            data,
            attributes,
            ordering_key: None,
            publish_time: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_ordering_key(mut self, key: Option<String>) -> Self {
        self.ordering_key = key;
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.attribute(EVENT_TYPE_ATTRIBUTE)
    }

    pub fn event_id(&self) -> Option<&str> {
        self.attribute(EVENT_ID_ATTRIBUTE)
    }

    /// The broker's delivery attempt counter. Absent, unparsable or
    /// non-positive values count as the first attempt.
    pub fn delivery_attempt(&self) -> u32 {
        self.attribute(DELIVERY_ATTEMPT_ATTRIBUTE)
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .filter(|attempt| *attempt > 0)
            .unwrap_or(1)
    }
}
