//! Publishing domain events to their configured topics.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::event::{EVENT_ID_ATTRIBUTE, EVENT_TYPE_ATTRIBUTE};
use crate::{Attributes, Broker, DomainEvent, EventSerializer, Message, PipelineError, Result};

/// Serializes events and sends them to the topic mapped to their type.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    topics: Arc<HashMap<String, String>>,
}

impl EventPublisher {
    pub fn new<I, K, V>(broker: Arc<dyn Broker>, topics: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let topics = topics
            .into_iter()
            .map(|(event_type, topic)| (event_type.into(), topic.into()))
            .collect();
        Self {
            broker,
            topics: Arc::new(topics),
        }
    }

    /// Topic configured for `event_type`.
    pub fn topic_for(&self, event_type: &str) -> Result<&str> {
        self.topics
            .get(event_type)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::UnknownTopic(event_type.to_string()))
    }

    /// Publishes `event` and returns the broker-assigned message id.
    ///
    /// The message carries `event_type` and a fresh `event_id`, and the
    /// event's ordering key if it has one.
    #[tracing::instrument(skip_all, fields(event_type = event.event_type()))]
    pub async fn publish<E: DomainEvent>(&self, event: &E) -> Result<String> {
        let event_type = event.event_type();
        let topic = self.topic_for(event_type)?;
        let event_id = Uuid::new_v4().to_string();

        let message = Message::new(EventSerializer::serialize(event)?, Attributes::new())
            .with_attribute(EVENT_TYPE_ATTRIBUTE, event_type)
            .with_attribute(EVENT_ID_ATTRIBUTE, event_id.clone())
            .with_ordering_key(event.ordering_key());

        let message_id = self.broker.publish(topic, message).await?;

        metrics::counter!("events_published_total", "event_type" => event_type).increment(1);
        tracing::debug!(topic, event_id = %event_id, message_id = %message_id, "event published");

        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ImageUploaded {
        image_id: String,
    }

    impl DomainEvent for ImageUploaded {
        fn event_type(&self) -> &'static str {
            "ImageUploaded"
        }

        fn ordering_key(&self) -> Option<String> {
            Some(self.image_id.clone())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Unmapped;

    impl DomainEvent for Unmapped {
        fn event_type(&self) -> &'static str {
            "Unmapped"
        }
    }

    #[tokio::test]
    async fn publish_attaches_dispatch_attributes() {
        let broker = InMemoryBroker::new();
        let publisher = EventPublisher::new(
            Arc::new(broker.clone()),
            [("ImageUploaded", "images.uploaded")],
        );

        let event = ImageUploaded {
            image_id: "img-1".into(),
        };
        let id = publisher.publish(&event).await.unwrap();

        let published = broker.published("images.uploaded").await;
        assert_eq!(published.len(), 1);
        let message = &published[0];
        assert_eq!(message.id, id);
        assert_eq!(message.event_type(), Some("ImageUploaded"));
        assert!(message.event_id().is_some_and(|id| !id.is_empty()));
        assert_eq!(message.ordering_key.as_deref(), Some("img-1"));
        let decoded: ImageUploaded = EventSerializer::deserialize(&message.data).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn event_ids_are_unique_per_publish() {
        let broker = InMemoryBroker::new();
        let publisher = EventPublisher::new(
            Arc::new(broker.clone()),
            [("ImageUploaded", "images.uploaded")],
        );
        let event = ImageUploaded {
            image_id: "img-1".into(),
        };

        publisher.publish(&event).await.unwrap();
        publisher.publish(&event).await.unwrap();

        let published = broker.published("images.uploaded").await;
        assert_ne!(published[0].event_id(), published[1].event_id());
    }

    #[tokio::test]
    async fn missing_topic_mapping_is_a_configuration_error() {
        let broker = InMemoryBroker::new();
        let publisher =
            EventPublisher::new(Arc::new(broker.clone()), Vec::<(String, String)>::new());

        assert!(matches!(
            publisher.publish(&Unmapped).await,
            Err(PipelineError::UnknownTopic(t)) if t == "Unmapped"
        ));
        assert_eq!(broker.published_count().await, 0);
    }
}
