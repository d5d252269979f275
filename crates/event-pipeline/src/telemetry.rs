//! Error telemetry and dead-letter sinks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    Attributes, Broker, ErrorCategory, EventError, EventSerializer, Message, PipelineError, Result,
    Severity, event::EVENT_TYPE_ATTRIBUTE,
};

/// Topic error telemetry is published to.
pub const TELEMETRY_TOPIC: &str = "telemetry.errors";

/// Topic dead-letter records for `topic` are published to.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

/// A handler failure, as reported to telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTelemetry {
    pub handler: String,
    pub event_type: Option<String>,
    pub event_id: Option<String>,
    pub attempt: u32,
    pub message: String,
    pub retryable: bool,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub context: HashMap<String, Value>,
    pub stack_trace: Option<String>,
    #[serde(with = "common::timestamp")]
    pub occurred_at: DateTime<Utc>,
}

impl ErrorTelemetry {
    pub fn from_error(handler: &str, message: &Message, error: &EventError) -> Self {
        Self {
            handler: handler.to_string(),
            event_type: message.event_type().map(str::to_string),
            event_id: message.event_id().map(str::to_string),
            attempt: message.delivery_attempt(),
            message: error.to_string(),
            retryable: error.retryable,
            category: error.category,
            severity: error.severity,
            context: error.context.clone(),
            stack_trace: error.stack_trace.clone(),
            occurred_at: common::timestamp::now(),
        }
    }
}

/// Terminal record of a message that will not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub topic: String,
    pub subscription: String,
    pub message_id: String,
    pub event_type: Option<String>,
    pub event_id: Option<String>,
    pub payload: Vec<u8>,
    pub attributes: Attributes,
    pub reason: String,
    pub error: Option<String>,
    pub category: Option<ErrorCategory>,
    pub severity: Option<Severity>,
    pub retry_count: u32,
    #[serde(with = "common::timestamp")]
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(
        topic: &str,
        subscription: &str,
        message: &Message,
        reason: impl Into<String>,
        error: Option<&EventError>,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            message_id: message.id.clone(),
            event_type: message.event_type().map(str::to_string),
            event_id: message.event_id().map(str::to_string),
            payload: message.data.clone(),
            attributes: message.attributes.clone(),
            reason: reason.into(),
            error: error.map(ToString::to_string),
            category: error.map(|e| e.category),
            severity: error.map(|e| e.severity),
            retry_count: message.delivery_attempt(),
            dead_lettered_at: common::timestamp::now(),
        }
    }
}

/// Destination for error telemetry and dead-letter records.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Reports a handler failure.
    async fn record_error(&self, telemetry: ErrorTelemetry) -> Result<()>;

    /// Stores a dead-letter record.
    async fn dead_letter(&self, record: DeadLetterRecord) -> Result<()>;
}

/// In-memory sink for testing and inspection.
#[derive(Clone, Default)]
pub struct InMemoryTelemetry {
    errors: Arc<RwLock<Vec<ErrorTelemetry>>>,
    dead_letters: Arc<RwLock<Vec<DeadLetterRecord>>>,
    fail_on_error: Arc<AtomicBool>,
    fail_on_dead_letter: Arc<AtomicBool>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `record_error` fail.
    pub fn set_fail_on_error(&self, fail: bool) {
        self.fail_on_error.store(fail, Ordering::SeqCst);
    }

    /// Makes `dead_letter` fail.
    pub fn set_fail_on_dead_letter(&self, fail: bool) {
        self.fail_on_dead_letter.store(fail, Ordering::SeqCst);
    }

    pub async fn errors(&self) -> Vec<ErrorTelemetry> {
        self.errors.read().await.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters.read().await.clone()
    }
}

#[async_trait]
impl TelemetrySink for InMemoryTelemetry {
    async fn record_error(&self, telemetry: ErrorTelemetry) -> Result<()> {
        if self.fail_on_error.load(Ordering::SeqCst) {
            return Err(PipelineError::Telemetry(
                "simulated telemetry failure".to_string(),
            ));
        }
        self.errors.write().await.push(telemetry);
        Ok(())
    }

    async fn dead_letter(&self, record: DeadLetterRecord) -> Result<()> {
        if self.fail_on_dead_letter.load(Ordering::SeqCst) {
            return Err(PipelineError::Telemetry(
                "simulated dead-letter failure".to_string(),
            ));
        }
        self.dead_letters.write().await.push(record);
        Ok(())
    }
}

/// Sink that publishes telemetry and dead-letter records through the broker.
#[derive(Clone)]
pub struct BrokerTelemetry {
    broker: Arc<dyn Broker>,
}

impl BrokerTelemetry {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    async fn publish<T: Serialize + Sync>(&self, topic: &str, kind: &str, body: &T) -> Result<()> {
        let data = EventSerializer::serialize(body)?;
        let message = Message::new(data, Attributes::new()).with_attribute(EVENT_TYPE_ATTRIBUTE, kind);
        self.broker.publish(topic, message).await?;
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for BrokerTelemetry {
    async fn record_error(&self, telemetry: ErrorTelemetry) -> Result<()> {
        self.publish(TELEMETRY_TOPIC, "HandlerError", &telemetry).await
    }

    async fn dead_letter(&self, record: DeadLetterRecord) -> Result<()> {
        let topic = dead_letter_topic(&record.topic);
        self.publish(&topic, "DeadLetter", &record).await
    }
}
