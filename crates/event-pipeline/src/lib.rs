//! Event pipeline for the image service.
//!
//! Inbound messages flow from a [`Broker`] subscription, owned by the
//! [`Orchestrator`], into the [`EventRegistry`], which dispatches them by
//! their `event_type` attribute to handlers. Handlers built on
//! [`BaseEventHandler`] classify failures, report them to a
//! [`TelemetrySink`], and decide between acknowledging, dead-lettering and
//! asking the broker to redeliver. The [`EventPublisher`] sends domain events
//! to the topic configured for their type.

pub mod broker;
pub mod error;
pub mod event;
pub mod handler;
pub mod orchestrator;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod serializer;
pub mod telemetry;

pub use broker::{
    Broker, BrokerSettings, DEAD_LETTER_SOURCE_ATTRIBUTE, InMemoryBroker, SubscriptionStats,
    dead_letter_topic,
};
pub use error::{BoxError, ErrorCategory, EventError, PipelineError, Result, Severity};
pub use event::{
    Attributes, DELIVERY_ATTEMPT_ATTRIBUTE, DomainEvent, EVENT_ID_ATTRIBUTE, EVENT_TYPE_ATTRIBUTE,
    Message,
};
pub use handler::{BaseEventHandler, EventHandler, EventProcessor, RetryingHandler};
pub use orchestrator::Orchestrator;
pub use publisher::EventPublisher;
pub use registry::EventRegistry;
pub use retry::RetryConfig;
pub use serializer::EventSerializer;
pub use telemetry::{
    BrokerTelemetry, DeadLetterRecord, ErrorTelemetry, InMemoryTelemetry, TELEMETRY_TOPIC,
    TelemetrySink,
};
