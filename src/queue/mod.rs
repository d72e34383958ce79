//! Durable at-least-once job queue between the HTTP handlers and the worker.
//!
//! Retry policy lives with the job ([`JobOptions`]); the queue backend only
//! moves envelopes between its wait, active, delayed and failed sets.

mod job;
pub mod redis;

pub use job::{
    Backoff, DeleteJob, FailureDisposition, IngestionJob, JobEnvelope, JobHandle, JobOptions,
    PatchJob, UploadJob,
};
pub use self::redis::RedisJobQueue;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A job taken off the wait list and held by one consumer.
#[derive(Debug, Clone)]
pub struct ReservedJob {
    pub envelope: JobEnvelope,
    receipt: String,
}

impl ReservedJob {
    /// `receipt` is the backend's handle for acknowledging this delivery.
    pub fn new(envelope: JobEnvelope, receipt: String) -> Self {
        Self { envelope, receipt }
    }

    pub fn receipt(&self) -> &str {
        &self.receipt
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Stores `envelope` for delivery and returns its handle.
    async fn push(&self, envelope: JobEnvelope) -> QueueResult<JobHandle>;

    /// Takes the next ready job, waiting up to `wait` for one to arrive.
    async fn reserve(&self, wait: Duration) -> QueueResult<Option<ReservedJob>>;

    /// Acknowledges a successful run.
    async fn complete(&self, job: &ReservedJob) -> QueueResult<()>;

    /// Parks the job until `delay` has passed. The envelope carries the updated attempt count.
    async fn retry_later(&self, job: &ReservedJob, delay: Duration) -> QueueResult<()>;

    /// Moves an exhausted job to the failed set, retained for inspection.
    async fn dead_letter(&self, job: &ReservedJob) -> QueueResult<()>;

    /// Moves delayed jobs whose backoff has elapsed back onto the wait list.
    async fn promote_due(&self) -> QueueResult<usize>;

    /// Returns jobs orphaned in the active set by a crashed consumer to the wait list.
    async fn requeue_stalled(&self) -> QueueResult<usize>;

    async fn depth(&self) -> QueueResult<QueueDepth>;
}

/// Producer-side handle: applies the configured job options and trace context.
#[derive(Clone)]
pub struct QueueClient {
    backend: std::sync::Arc<dyn JobQueue>,
    options: JobOptions,
}

impl QueueClient {
    pub fn new(backend: std::sync::Arc<dyn JobQueue>, options: JobOptions) -> Self {
        Self { backend, options }
    }

    pub async fn enqueue(&self, job: IngestionJob) -> QueueResult<JobHandle> {
        let kind = job.kind();
        let mut envelope = JobEnvelope::new(job, self.options);
        envelope.trace_context = current_trace_context();

        let handle = self.backend.push(envelope).await?;
        metrics::counter!("streamify_jobs_enqueued_total", "kind" => kind).increment(1);
        tracing::info!(job_id = %handle.id, kind, "job enqueued");
        Ok(handle)
    }
}

/// W3C trace context of the current span, carried inside the envelope.
fn current_trace_context() -> HashMap<String, String> {
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let mut carrier = HashMap::new();
    TraceContextPropagator::new().inject_context(&tracing::Span::current().context(), &mut carrier);
    carrier
}

/// Restores the parent context recorded at enqueue time.
pub fn parent_context(envelope: &JobEnvelope) -> opentelemetry::Context {
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    if envelope.trace_context.is_empty() {
        opentelemetry::Context::new()
    } else {
        TraceContextPropagator::new().extract(&envelope.trace_context)
    }
}
