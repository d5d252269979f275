//! Dispatch of inbound messages to handlers by event type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::event::EVENT_TYPE_ATTRIBUTE;
use crate::{EventHandler, Message, PipelineError, Result};

type HandlerTable = HashMap<String, Vec<Arc<dyn EventHandler>>>;

/// Multimap from event type to handlers.
///
/// Registration normally happens once at startup; dispatch only takes the
/// read lock, and releases it before any handler runs.
#[derive(Clone, Default)]
pub struct EventRegistry {
    handlers: Arc<RwLock<HandlerTable>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` for `event_type`. Earlier registrations are kept.
    pub async fn register(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        tracing::debug!(event_type = %event_type, handler = handler.name(), "registering handler");
        self.handlers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    pub async fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub async fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Runs every handler registered for the message's `event_type`.
    ///
    /// All handlers run even if some fail; the last failure is returned. A
    /// message without `event_type`, or with a type nobody handles, is an
    /// error.
    #[tracing::instrument(skip_all, fields(message_id = %message.id, event_type = tracing::field::Empty))]
    pub async fn dispatch(&self, message: &Message) -> Result<()> {
        let event_type = message
            .event_type()
            .ok_or(PipelineError::MissingAttribute(EVENT_TYPE_ATTRIBUTE))?;
        tracing::Span::current().record("event_type", event_type);

        let handlers = self
            .handlers
            .read()
            .await
            .get(event_type)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::error!("no handler registered");
            return Err(PipelineError::NoHandler(event_type.to_string()));
        }

        let mut last_error = None;
        for handler in handlers {
            if let Err(e) = handler.handle(message).await {
                tracing::warn!(handler = handler.name(), error = %e, "handler failed");
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EventHandler for EventRegistry {
    fn name(&self) -> &str {
        "event-registry"
    }

    async fn handle(&self, message: &Message) -> Result<()> {
        self.dispatch(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attributes, ErrorCategory, EventError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        calls: AtomicUsize,
        fail_with: Option<&'static str>,
    }

    impl Counting {
        fn new(name: &'static str, fail_with: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail_with,
            })
        }
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _message: &Message) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(reason) => Err(EventError::retryable(reason, ErrorCategory::External).into()),
                None => Ok(()),
            }
        }
    }

    fn typed(event_type: &str) -> Message {
        Message::new(vec![], Attributes::new()).with_attribute(EVENT_TYPE_ATTRIBUTE, event_type)
    }

    #[tokio::test]
    async fn all_handlers_run_and_last_error_wins() {
        let registry = EventRegistry::new();
        let first = Counting::new("first", Some("first failed"));
        let second = Counting::new("second", None);
        let third = Counting::new("third", Some("third failed"));
        registry.register("ImageUploaded", first.clone()).await;
        registry.register("ImageUploaded", second.clone()).await;
        registry.register("ImageUploaded", third.clone()).await;

        let err = registry.dispatch(&typed("ImageUploaded")).await.unwrap_err();

        assert!(err.to_string().contains("third failed"));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_is_an_error() {
        let registry = EventRegistry::new();
        registry
            .register("ImageUploaded", Counting::new("h", None))
            .await;

        assert!(matches!(
            registry.dispatch(&typed("AlbumDeleted")).await,
            Err(PipelineError::NoHandler(t)) if t == "AlbumDeleted"
        ));
    }

    #[tokio::test]
    async fn missing_event_type_is_an_error() {
        let registry = EventRegistry::new();
        let message = Message::new(vec![], Attributes::new());

        assert!(matches!(
            registry.dispatch(&message).await,
            Err(PipelineError::MissingAttribute(EVENT_TYPE_ATTRIBUTE))
        ));
    }

    #[tokio::test]
    async fn dispatch_only_reaches_matching_type() {
        let registry = EventRegistry::new();
        let uploaded = Counting::new("uploaded", None);
        let completed = Counting::new("completed", None);
        registry.register("ImageUploaded", uploaded.clone()).await;
        registry
            .register("ImageProcessingCompleted", completed.clone())
            .await;

        registry.handle(&typed("ImageUploaded")).await.unwrap();

        assert_eq!(uploaded.calls.load(Ordering::SeqCst), 1);
        assert_eq!(completed.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            registry.event_types().await,
            vec!["ImageProcessingCompleted", "ImageUploaded"]
        );
    }
}
