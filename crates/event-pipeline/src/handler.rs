//! Event handlers and the retry/dead-letter wrapper they share.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::telemetry::{DeadLetterRecord, ErrorTelemetry, TelemetrySink};
use crate::{
    BoxError, DomainEvent, ErrorCategory, EventError, EventSerializer, Message, PipelineError,
    Result, RetryConfig,
};

/// Something that consumes broker messages.
///
/// Returning `Ok` acknowledges the message; returning an error asks the
/// broker to redeliver it.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs, metrics and telemetry.
    fn name(&self) -> &str;

    async fn handle(&self, message: &Message) -> Result<()>;
}

/// Domain logic for one event type.
///
/// Errors may be [`EventError`]s carrying their own classification, or any
/// other error, which is treated as retryable.
#[async_trait]
pub trait EventProcessor<E: DomainEvent>: Send + Sync {
    async fn process(&self, event: E, message: &Message) -> std::result::Result<(), BoxError>;
}

/// Retry classification, telemetry and dead-lettering around a processing
/// function.
///
/// Never sleeps or retries in-process: a retryable failure is returned so
/// the broker redelivers, and the computed backoff is only logged.
#[derive(Clone)]
pub struct BaseEventHandler {
    name: String,
    topic: String,
    subscription: String,
    retry: RetryConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl BaseEventHandler {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        subscription: impl Into<String>,
        retry: RetryConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            subscription: subscription.into(),
            retry,
            telemetry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Runs `inner` for `message` and turns its outcome into an ack or nack.
    ///
    /// - At or past `max_attempts` the message is dead-lettered without
    ///   running `inner` and acknowledged.
    /// - A non-retryable failure is dead-lettered and acknowledged.
    /// - A retryable failure is returned as `PipelineError::Event`.
    ///
    /// Telemetry failures are logged and swallowed. A failed dead-letter
    /// write is returned, so the message is redelivered instead of lost.
    #[tracing::instrument(
        skip_all,
        fields(
            handler = %self.name,
            event_type = message.event_type().unwrap_or_default(),
            event_id = message.event_id().unwrap_or_default(),
            attempt = message.delivery_attempt(),
        )
    )]
    pub async fn handle_with_retry<F, Fut>(&self, message: &Message, inner: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send,
    {
        let attempt = message.delivery_attempt();
        let started = Instant::now();

        if attempt >= self.retry.max_attempts {
            tracing::warn!(
                max_attempts = self.retry.max_attempts,
                "delivery attempts exhausted, dead-lettering"
            );
            self.dead_letter(message, "max attempts exceeded", None).await?;
            self.record_outcome("exhausted", started);
            return Ok(());
        }

        let error = match inner().await {
            Ok(()) => {
                self.record_outcome("success", started);
                return Ok(());
            }
            Err(e) => EventError::classify(e),
        };

        self.report(message, &error).await;

        if !error.retryable {
            tracing::warn!(error = %error, "non-retryable failure, dead-lettering");
            self.dead_letter(message, "non-retryable error", Some(&error))
                .await?;
            self.record_outcome("dead_lettered", started);
            return Ok(());
        }

        let backoff = self.retry.backoff(attempt);
        tracing::warn!(
            error = %error,
            backoff_ms = backoff.as_millis() as u64,
            "retryable failure, requesting redelivery"
        );
        self.record_outcome("retry", started);
        Err(PipelineError::Event(error))
    }

    async fn report(&self, message: &Message, error: &EventError) {
        let telemetry = ErrorTelemetry::from_error(&self.name, message, error);
        if let Err(e) = self.telemetry.record_error(telemetry).await {
            tracing::error!(error = %e, "failed to publish error telemetry");
        }
    }

    async fn dead_letter(
        &self,
        message: &Message,
        reason: &'static str,
        error: Option<&EventError>,
    ) -> Result<()> {
        let record = DeadLetterRecord::new(&self.topic, &self.subscription, message, reason, error);
        if let Err(e) = self.telemetry.dead_letter(record).await {
            tracing::error!(error = %e, reason, "failed to dead-letter message");
            return Err(e);
        }
        metrics::counter!("events_dead_lettered_total", "reason" => reason).increment(1);
        Ok(())
    }

    fn record_outcome(&self, outcome: &'static str, started: Instant) {
        metrics::counter!(
            "events_handled_total",
            "handler" => self.name.clone(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("event_handler_duration_seconds", "handler" => self.name.clone())
            .record(started.elapsed().as_secs_f64());
    }
}

/// Decodes messages into `E` and feeds them to a processor through
/// [`BaseEventHandler::handle_with_retry`].
pub struct RetryingHandler<E, P> {
    base: BaseEventHandler,
    processor: Arc<P>,
    _event: PhantomData<fn() -> E>,
}

impl<E, P> RetryingHandler<E, P>
where
    E: DomainEvent,
    P: EventProcessor<E>,
{
    pub fn new(base: BaseEventHandler, processor: Arc<P>) -> Self {
        Self {
            base,
            processor,
            _event: PhantomData,
        }
    }

    pub fn base(&self) -> &BaseEventHandler {
        &self.base
    }
}

#[async_trait]
impl<E, P> EventHandler for RetryingHandler<E, P>
where
    E: DomainEvent,
    P: EventProcessor<E> + 'static,
{
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn handle(&self, message: &Message) -> Result<()> {
        let processor = Arc::clone(&self.processor);
        self.base
            .handle_with_retry(message, || async move {
                let event: E = EventSerializer::deserialize(&message.data).map_err(|e| {
                    EventError::non_retryable(e, ErrorCategory::Serialization)
                        .with_context("message_id", message.id.clone())
                })?;
                processor.process(event, message).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::InMemoryTelemetry;
    use crate::{Attributes, DELIVERY_ATTEMPT_ATTRIBUTE, EVENT_TYPE_ATTRIBUTE, Severity};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler(telemetry: &InMemoryTelemetry) -> BaseEventHandler {
        BaseEventHandler::new(
            "test-handler",
            "images.uploaded",
            "images.uploaded.test",
            RetryConfig::default(),
            Arc::new(telemetry.clone()),
        )
    }

    fn message(attempt: u32) -> Message {
        Message::new(b"{}".to_vec(), Attributes::new())
            .with_attribute(EVENT_TYPE_ATTRIBUTE, "ImageUploaded")
            .with_attribute(DELIVERY_ATTEMPT_ATTRIBUTE, attempt.to_string())
    }

    #[tokio::test]
    async fn success_acks_without_side_effects() {
        let telemetry = InMemoryTelemetry::new();
        let result = handler(&telemetry)
            .handle_with_retry(&message(1), || async { Ok::<_, BoxError>(()) })
            .await;

        assert!(result.is_ok());
        assert!(telemetry.errors().await.is_empty());
        assert!(telemetry.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter_without_running() {
        let telemetry = InMemoryTelemetry::new();
        let calls = AtomicUsize::new(0);

        let result = handler(&telemetry)
            .handle_with_retry(&message(5), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let dead = telemetry.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "max attempts exceeded");
        assert_eq!(dead[0].retry_count, 5);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_acked_and_dead_lettered() {
        let telemetry = InMemoryTelemetry::new();
        let result = handler(&telemetry)
            .handle_with_retry(&message(1), || async {
                Err::<(), BoxError>(
                    EventError::non_retryable("image missing", ErrorCategory::NotFound).into(),
                )
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(telemetry.errors().await.len(), 1);
        let dead = telemetry.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].category, Some(ErrorCategory::NotFound));
    }

    #[tokio::test]
    async fn unclassified_failure_is_retried() {
        let telemetry = InMemoryTelemetry::new();
        let result = handler(&telemetry)
            .handle_with_retry(&message(2), || async { Err::<(), BoxError>("connection reset".into()) })
            .await;

        match result {
            Err(PipelineError::Event(e)) => {
                assert!(e.retryable);
                assert_eq!(e.severity, Severity::High);
            }
            other => panic!("expected retryable event error, got {other:?}"),
        }
        assert!(telemetry.dead_letters().await.is_empty());
        let errors = telemetry.errors().await;
        assert_eq!(errors[0].attempt, 2);
        assert!(
            errors[0]
                .stack_trace
                .as_deref()
                .is_some_and(|trace| trace.starts_with("connection reset"))
        );
    }

    #[tokio::test]
    async fn telemetry_failure_does_not_change_outcome() {
        let telemetry = InMemoryTelemetry::new();
        telemetry.set_fail_on_error(true);

        let result = handler(&telemetry)
            .handle_with_retry(&message(1), || async {
                Err::<(), BoxError>(EventError::non_retryable("bad", ErrorCategory::Validation).into())
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(telemetry.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_dead_letter_write_nacks() {
        let telemetry = InMemoryTelemetry::new();
        telemetry.set_fail_on_dead_letter(true);

        let result = handler(&telemetry)
            .handle_with_retry(&message(1), || async {
                Err::<(), BoxError>(EventError::non_retryable("bad", ErrorCategory::Validation).into())
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Telemetry(_))));
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        value: u32,
    }

    impl DomainEvent for Ping {
        fn event_type(&self) -> &'static str {
            "Ping"
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: tokio::sync::Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl EventProcessor<Ping> for Recorder {
        async fn process(&self, event: Ping, _message: &Message) -> std::result::Result<(), BoxError> {
            self.seen.lock().await.push(event.value);
            Ok(())
        }
    }

    #[tokio::test]
    async fn retrying_handler_decodes_payload() {
        let telemetry = InMemoryTelemetry::new();
        let recorder = Arc::new(Recorder::default());
        let typed = RetryingHandler::new(handler(&telemetry), Arc::clone(&recorder));

        let data = EventSerializer::serialize(&Ping { value: 7 }).unwrap();
        typed
            .handle(&Message::new(data, Attributes::new()))
            .await
            .unwrap();

        assert_eq!(*recorder.seen.lock().await, vec![7]);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dead_lettered() {
        let telemetry = InMemoryTelemetry::new();
        let recorder = Arc::new(Recorder::default());
        let typed = RetryingHandler::new(handler(&telemetry), Arc::clone(&recorder));

        typed
            .handle(&Message::new(b"not json".to_vec(), Attributes::new()))
            .await
            .unwrap();

        let dead = telemetry.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].category, Some(ErrorCategory::Serialization));
        assert!(recorder.seen.lock().await.is_empty());
    }
}
