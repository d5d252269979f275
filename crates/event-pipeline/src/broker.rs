//! Message broker abstraction and an in-process implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinSet;

use crate::event::DELIVERY_ATTEMPT_ATTRIBUTE;
use crate::{EventHandler, Message, PipelineError, Result};

/// Publish/subscribe client.
///
/// A handler returning `Ok` acknowledges a delivery; an error negatively
/// acknowledges it and the broker redelivers it later with an incremented
/// `delivery_attempt` attribute.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes `message` to `topic` and returns the assigned message id.
    async fn publish(&self, topic: &str, message: Message) -> Result<String>;

    /// Delivers messages from `subscription` to `handler` until `shutdown`
    /// becomes true, then waits for in-flight deliveries before returning.
    async fn receive(
        &self,
        subscription: &str,
        handler: Arc<dyn EventHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;

    /// Releases the client. Later publishes and receives fail.
    async fn close(&self) -> Result<()>;
}

/// Attribute naming the subscription a dead-lettered message came from.
pub const DEAD_LETTER_SOURCE_ATTRIBUTE: &str = "dead_letter_source_subscription";

/// Topic that receives messages `subscription` gave up on.
pub fn dead_letter_topic(subscription: &str) -> String {
    format!("{subscription}.dlq")
}

/// Flow control and retention for receivers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrokerSettings {
    /// Deliveries handed to handlers but not yet acked or nacked.
    pub max_outstanding: usize,
    /// Delay before a nacked message is queued again.
    pub redelivery_delay: Duration,
    /// Deliveries of one message before a nack moves it to the
    /// subscription's dead-letter topic instead of redelivering it.
    pub max_delivery_attempts: u32,
    /// Messages kept per topic for [`InMemoryBroker::published`]; the oldest
    /// are dropped first.
    pub history_limit: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_outstanding: 10,
            redelivery_delay: Duration::from_millis(100),
            max_delivery_attempts: 5,
            history_limit: 1000,
        }
    }
}

/// Delivery counters for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            nacked: self.nacked.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
        }
    }
}

struct Subscription {
    topic: String,
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: HashMap<String, Subscription>,
    published: HashMap<String, VecDeque<Message>>,
    next_id: u64,
}

/// In-process broker with topics, subscriptions and redelivery on nack.
///
/// A message published to a topic is copied to every subscription that
/// existed at publish time. Messages sharing an ordering key are handled
/// one at a time in queue order; a redelivered message rejoins the back of
/// the queue. A message nacked on its `max_delivery_attempts`th delivery is
/// published to [`dead_letter_topic`] instead.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
    settings: BrokerSettings,
    closed: Arc<AtomicBool>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_settings(BrokerSettings::default())
    }

    pub fn with_settings(settings: BrokerSettings) -> Self {
        Self {
            state: Arc::new(RwLock::new(BrokerState::default())),
            settings,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> BrokerSettings {
        self.settings
    }

    /// Creates `subscription` on `topic`. Repeating an existing pair is a
    /// no-op; reusing a subscription name for another topic is an error.
    pub async fn subscribe(&self, topic: &str, subscription: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.subscriptions.get(subscription) {
            if existing.topic == topic {
                return Ok(());
            }
            return Err(PipelineError::Broker(format!(
                "subscription '{subscription}' already exists on topic '{}'",
                existing.topic
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscriptions.insert(
            subscription.to_string(),
            Subscription {
                topic: topic.to_string(),
                sender,
                receiver: Arc::new(Mutex::new(receiver)),
                counters: Arc::new(Counters::default()),
            },
        );
        tracing::debug!(topic, subscription, "subscription created");
        Ok(())
    }

    /// The most recent messages published to `topic`, oldest first, up to
    /// the configured history limit.
    pub async fn published(&self, topic: &str) -> Vec<Message> {
        self.state
            .read()
            .await
            .published
            .get(topic)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn published_count(&self) -> usize {
        self.state.read().await.published.values().map(VecDeque::len).sum()
    }

    pub async fn stats(&self, subscription: &str) -> Option<SubscriptionStats> {
        self.state
            .read()
            .await
            .subscriptions
            .get(subscription)
            .map(|s| s.counters.snapshot())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PipelineError::Broker("broker is closed".to_string()));
        }
        Ok(())
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also stops the receiver.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, mut message: Message) -> Result<String> {
        self.ensure_open()?;

        let mut state = self.state.write().await;
        state.next_id += 1;
        message.id = format!("msg-{}", state.next_id);
        message.publish_time = Utc::now();

        for subscription in state.subscriptions.values() {
            if subscription.topic == topic {
                // The subscription holds its own receiver, so the channel is open.
                let _ = subscription.sender.send(message.clone());
            }
        }

        let id = message.id.clone();
        if self.settings.history_limit > 0 {
            let history = state.published.entry(topic.to_string()).or_default();
            if history.len() == self.settings.history_limit {
                history.pop_front();
            }
            history.push_back(message);
        }
        Ok(id)
    }

    #[tracing::instrument(skip(self, handler, shutdown), fields(handler = handler.name()))]
    async fn receive(
        &self,
        subscription: &str,
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.ensure_open()?;

        let (receiver, sender, counters) = {
            let state = self.state.read().await;
            let sub = state.subscriptions.get(subscription).ok_or_else(|| {
                PipelineError::Broker(format!("unknown subscription '{subscription}'"))
            })?;
            (
                Arc::clone(&sub.receiver),
                sub.sender.clone(),
                Arc::clone(&sub.counters),
            )
        };
        let mut receiver = receiver.try_lock_owned().map_err(|_| {
            PipelineError::Broker(format!(
                "subscription '{subscription}' already has an active receiver"
            ))
        })?;

        let permits = Arc::new(Semaphore::new(self.settings.max_outstanding.max(1)));
        let redelivery_delay = self.settings.redelivery_delay;
        let max_delivery_attempts = self.settings.max_delivery_attempts.max(1);
        let dead_letters = dead_letter_topic(subscription);
        let mut ordering_chains: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
        let mut tasks = JoinSet::new();

        tracing::info!("receiver started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                permit = Arc::clone(&permits).acquire_owned() => permit
                    .map_err(|e| PipelineError::Broker(e.to_string()))?,
            };
            let mut message = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            while tasks.try_join_next().is_some() {}
            ordering_chains.retain(|_, done| {
                matches!(done.try_recv(), Err(oneshot::error::TryRecvError::Empty))
            });

            let attempt = message.delivery_attempt();
            message
                .attributes
                .insert(DELIVERY_ATTEMPT_ATTRIBUTE.to_string(), attempt.to_string());

            let (predecessor, done) = match message.ordering_key.clone() {
                Some(key) => {
                    let (done_tx, done_rx) = oneshot::channel();
                    (ordering_chains.insert(key, done_rx), Some(done_tx))
                }
                None => (None, None),
            };

            let handler = Arc::clone(&handler);
            let sender = sender.clone();
            let counters = Arc::clone(&counters);
            let broker = self.clone();
            let dead_letters = dead_letters.clone();
            let source = subscription.to_string();

            tasks.spawn(async move {
                let _permit = permit;
                if let Some(predecessor) = predecessor {
                    let _ = predecessor.await;
                }

                counters.delivered.fetch_add(1, Ordering::SeqCst);
                match handler.handle(&message).await {
                    Ok(()) => {
                        counters.acked.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        counters.nacked.fetch_add(1, Ordering::SeqCst);
                        tracing::debug!(
                            message_id = %message.id,
                            attempt,
                            error = %e,
                            "delivery nacked"
                        );
                        if attempt >= max_delivery_attempts {
                            tracing::warn!(
                                message_id = %message.id,
                                attempt,
                                topic = %dead_letters,
                                "delivery attempts exhausted, dead-lettering"
                            );
                            message
                                .attributes
                                .insert(DEAD_LETTER_SOURCE_ATTRIBUTE.to_string(), source);
                            match broker.publish(&dead_letters, message).await {
                                Ok(_) => {
                                    counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "failed to dead-letter message");
                                }
                            }
                            drop(done);
                            return;
                        }
                        message.attributes.insert(
                            DELIVERY_ATTEMPT_ATTRIBUTE.to_string(),
                            (attempt + 1).to_string(),
                        );
                        tokio::spawn(async move {
                            tokio::time::sleep(redelivery_delay).await;
                            let _ = sender.send(message);
                        });
                    }
                }
                drop(done);
            });
        }

        let in_flight = tasks.len();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "delivery task panicked");
            }
        }
        tracing::info!(in_flight, "receiver stopped");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
