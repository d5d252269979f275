//! Batch job runner collaborator.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{ImagingError, Result};

/// Launches the external image-processing worker.
#[async_trait]
pub trait BatchJobRunner: Send + Sync {
    /// Starts the job selected by `job_selector` with `env` and returns the
    /// execution ID.
    async fn trigger(&self, job_selector: &str, env: HashMap<String, String>) -> Result<String>;
}

/// A recorded trigger call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExecution {
    pub execution_id: String,
    pub job_selector: String,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct InMemoryRunnerState {
    executions: Vec<JobExecution>,
    fail_on_trigger: Option<String>,
}

/// In-memory batch runner for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBatchJobRunner {
    state: Arc<RwLock<InMemoryRunnerState>>,
}

impl InMemoryBatchJobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every trigger fail with `reason`, or succeed again with `None`.
    pub fn set_fail_on_trigger(&self, reason: Option<&str>) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_trigger = reason.map(str::to_string);
    }

    pub fn executions(&self) -> Vec<JobExecution> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .executions
            .clone()
    }
}

#[async_trait]
impl BatchJobRunner for InMemoryBatchJobRunner {
    async fn trigger(&self, job_selector: &str, env: HashMap<String, String>) -> Result<String> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = &state.fail_on_trigger {
            return Err(ImagingError::BatchJob(reason.clone()));
        }

        let execution_id = format!("exec-{:04}", state.executions.len() + 1);
        state.executions.push(JobExecution {
            execution_id: execution_id.clone(),
            job_selector: job_selector.to_string(),
            env,
        });
        Ok(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_executions() {
        let runner = InMemoryBatchJobRunner::new();
        let env = HashMap::from([("IMAGE_ID".to_string(), "img-1".to_string())]);

        let id = runner.trigger("image-processor", env.clone()).await.unwrap();

        assert_eq!(id, "exec-0001");
        let executions = runner.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].env, env);
    }

    #[tokio::test]
    async fn fail_on_trigger() {
        let runner = InMemoryBatchJobRunner::new();
        runner.set_fail_on_trigger(Some("quota exceeded"));

        let err = runner
            .trigger("image-processor", HashMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert!(runner.executions().is_empty());
    }
}
