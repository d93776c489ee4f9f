//! Job handler trait and the typed adapter plugins register with.

use std::future::Future;
use std::marker::PhantomData;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::progress::ProgressReporter;

/// Processes jobs of one type.
///
/// `validate` runs before `process` and rejects malformed payloads
/// without consuming a retry; a `None` fails the job as non-retryable.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Validate the raw payload, returning the parsed form or `None`.
    fn validate(&self, data: &serde_json::Value) -> Option<serde_json::Value>;

    /// Execute the job. Errors are classified by the worker and fed into
    /// the retry policy.
    async fn process(
        &self,
        data: serde_json::Value,
        job_id: Uuid,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value>;
}

/// Adapter that pairs a `DeserializeOwned` payload type with an async
/// closure, so plugins register handlers without hand-writing the trait.
///
/// # Example
///
/// ```ignore
/// let handler = TypedJobHandler::<EmbedJob, _>::new(|job, _id, progress| async move {
///     progress.report(0, 1, Some("embedding")).await;
///     Ok(serde_json::json!({ "embedded": job.entity_id }))
/// });
/// service.register_handler("embed", Arc::new(handler), "notes");
/// ```
pub struct TypedJobHandler<T, F> {
    handler: F,
    _payload: PhantomData<fn(T)>,
}

impl<T, F, Fut> TypedJobHandler<T, F>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(T, Uuid, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> JobHandler for TypedJobHandler<T, F>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(T, Uuid, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    fn validate(&self, data: &serde_json::Value) -> Option<serde_json::Value> {
        serde_json::from_value::<T>(data.clone())
            .ok()
            .map(|_| data.clone())
    }

    async fn process(
        &self,
        data: serde_json::Value,
        job_id: Uuid,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value> {
        let parsed: T = serde_json::from_value(data)
            .map_err(|e| anyhow!("failed to deserialize job payload: {}", e))?;
        (self.handler)(parsed, job_id, progress).await
    }
}
