//! Subscription lifecycle management.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::{Broker, EventHandler, PipelineError, Result};

struct Worker {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

/// Runs one receive loop per subscription, all feeding the same handler
/// (normally the [`crate::EventRegistry`]).
///
/// Each subscription has its own cancellation signal. Stopping waits for
/// in-flight deliveries at most `shutdown_timeout` before aborting what is
/// left, then closes the broker.
pub struct Orchestrator {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn EventHandler>,
    subscriptions: Vec<String>,
    shutdown_timeout: Duration,
    workers: Mutex<HashMap<String, Worker>>,
}

impl Orchestrator {
    pub fn new<I, S>(broker: Arc<dyn Broker>, handler: Arc<dyn EventHandler>, subscriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            broker,
            handler,
            subscriptions: subscriptions.into_iter().map(Into::into).collect(),
            shutdown_timeout: Duration::from_secs(10),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Starts every configured subscription that is not already running.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        for subscription in &self.subscriptions {
            if workers.contains_key(subscription) {
                continue;
            }
            workers.insert(subscription.clone(), self.spawn(subscription));
        }
        tracing::info!(subscriptions = workers.len(), "orchestrator started");
        Ok(())
    }

    fn spawn(&self, subscription: &str) -> Worker {
        let (stop, shutdown) = watch::channel(false);
        let broker = Arc::clone(&self.broker);
        let handler = Arc::clone(&self.handler);
        let name = subscription.to_string();

        let task = tokio::spawn(async move {
            let result = broker.receive(&name, handler, shutdown).await;
            if let Err(e) = &result {
                tracing::error!(subscription = %name, error = %e, "subscription failed");
            }
            result
        });

        Worker { stop, task }
    }

    pub async fn is_running(&self, subscription: &str) -> bool {
        self.workers
            .lock()
            .await
            .get(subscription)
            .is_some_and(|w| !w.task.is_finished())
    }

    /// Stops one subscription and waits for its in-flight deliveries.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, subscription: &str) -> Result<()> {
        let worker = self
            .workers
            .lock()
            .await
            .remove(subscription)
            .ok_or_else(|| {
                PipelineError::Broker(format!("subscription '{subscription}' is not running"))
            })?;

        let _ = worker.stop.send(true);
        let abort = worker.task.abort_handle();
        match tokio::time::timeout(self.shutdown_timeout, worker.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(PipelineError::Broker(format!("subscription task failed: {e}"))),
            Err(_) => {
                tracing::warn!("subscription did not drain in time, aborting");
                abort.abort();
                Ok(())
            }
        }
    }

    /// Signals every subscription, waits for them within the shutdown
    /// timeout, then closes the broker.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let workers: Vec<(String, Worker)> = self.workers.lock().await.drain().collect();

        let mut names = Vec::with_capacity(workers.len());
        let mut aborts = Vec::with_capacity(workers.len());
        let mut tasks = Vec::with_capacity(workers.len());
        for (name, worker) in workers {
            let _ = worker.stop.send(true);
            aborts.push(worker.task.abort_handle());
            tasks.push(worker.task);
            names.push(name);
        }

        match tokio::time::timeout(self.shutdown_timeout, join_all(tasks)).await {
            Ok(results) => {
                for (name, joined) in names.iter().zip(results) {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(subscription = %name, error = %e, "subscription ended with error")
                        }
                        Err(e) => {
                            tracing::error!(subscription = %name, error = %e, "subscription task panicked")
                        }
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "shutdown timed out, aborting remaining subscriptions"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        self.broker.close().await?;
        tracing::info!("orchestrator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attributes, InMemoryBroker, Message};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, _message: &Message) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl EventHandler for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn handle(&self, _message: &Message) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn start_delivers_and_stop_closes_broker() {
        let broker = InMemoryBroker::new();
        broker.subscribe("t", "s1").await.unwrap();
        broker.subscribe("t", "s2").await.unwrap();
        let handler = Arc::new(Counting::default());

        let orchestrator = Orchestrator::new(
            Arc::new(broker.clone()),
            handler.clone(),
            ["s1", "s2"],
        );
        orchestrator.start().await.unwrap();
        assert!(orchestrator.is_running("s1").await);

        broker
            .publish("t", Message::new(vec![], Attributes::new()))
            .await
            .unwrap();
        eventually(async || handler.calls.load(Ordering::SeqCst) == 2).await;

        orchestrator.stop().await.unwrap();
        assert!(broker.is_closed());
        assert!(!orchestrator.is_running("s1").await);
    }

    #[tokio::test]
    async fn cancel_stops_only_one_subscription() {
        let broker = InMemoryBroker::new();
        broker.subscribe("t", "s1").await.unwrap();
        broker.subscribe("t", "s2").await.unwrap();
        let handler = Arc::new(Counting::default());
        let orchestrator =
            Orchestrator::new(Arc::new(broker.clone()), handler.clone(), ["s1", "s2"]);
        orchestrator.start().await.unwrap();

        orchestrator.cancel("s1").await.unwrap();
        assert!(!orchestrator.is_running("s1").await);
        assert!(orchestrator.is_running("s2").await);
        assert!(orchestrator.cancel("s1").await.is_err());

        broker
            .publish("t", Message::new(vec![], Attributes::new()))
            .await
            .unwrap();
        eventually(async || broker.stats("s2").await.is_some_and(|s| s.acked == 1)).await;
        assert_eq!(broker.stats("s1").await.unwrap().delivered, 0);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_bounded_by_timeout() {
        let broker = InMemoryBroker::new();
        broker.subscribe("t", "s").await.unwrap();
        let orchestrator = Orchestrator::new(Arc::new(broker.clone()), Arc::new(Stuck), ["s"])
            .with_shutdown_timeout(Duration::from_millis(50));
        orchestrator.start().await.unwrap();

        broker
            .publish("t", Message::new(vec![], Attributes::new()))
            .await
            .unwrap();
        eventually(async || broker.stats("s").await.is_some_and(|s| s.delivered == 1)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), orchestrator.stop()).await;
        assert!(stopped.is_ok());
        assert!(broker.is_closed());
    }
}
