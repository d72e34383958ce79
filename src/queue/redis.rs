//! Redis-backed queue.
//!
//! Layout under `streamify:{queue}`:
//! - `wait` list: ready jobs, LPUSH in / BRPOPLPUSH out (FIFO)
//! - `active` list: jobs held by a consumer
//! - `delayed` sorted set: retries scored by the epoch millisecond they become due
//! - `failed` list: exhausted jobs, kept for operators

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{JobEnvelope, JobHandle, JobQueue, QueueDepth, QueueResult, ReservedJob};

const PROMOTE_BATCH: usize = 100;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, job in ipairs(due) do
  redis.call('ZREM', KEYS[1], job)
  redis.call('LPUSH', KEYS[2], job)
end
return #due
"#;

const REQUEUE_SCRIPT: &str = r#"
local moved = 0
while redis.call('RPOPLPUSH', KEYS[1], KEYS[2]) do
  moved = moved + 1
end
return moved
"#;

#[derive(Debug, Clone)]
struct QueueKeys {
    wait: String,
    active: String,
    delayed: String,
    failed: String,
    completed: String,
}

impl QueueKeys {
    fn new(queue_name: &str) -> Self {
        let prefix = format!("streamify:{}", queue_name);
        Self {
            wait: format!("{}:wait", prefix),
            active: format!("{}:active", prefix),
            delayed: format!("{}:delayed", prefix),
            failed: format!("{}:failed", prefix),
            completed: format!("{}:completed", prefix),
        }
    }
}

#[derive(Clone)]
pub struct RedisJobQueue {
    client: redis::Client,
    conn: ConnectionManager,
    keys: QueueKeys,
}

impl RedisJobQueue {
    pub async fn connect(client: redis::Client, queue_name: &str) -> QueueResult<Self> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            keys: QueueKeys::new(queue_name),
        })
    }

    /// Parks an undecodable payload in the failed list so it is not redelivered.
    async fn quarantine(&self, raw: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(&self.keys.active, 1, raw)
            .ignore()
            .lpush(&self.keys.failed, raw)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn push(&self, envelope: JobEnvelope) -> QueueResult<JobHandle> {
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.keys.wait, payload).await?;
        Ok(JobHandle { id: envelope.id })
    }

    async fn reserve(&self, wait: Duration) -> QueueResult<Option<ReservedJob>> {
        // Blocking pops get their own connection so they don't stall the shared one.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // A zero timeout would block forever.
        let timeout = wait.as_secs_f64().max(0.01);
        let raw: Option<String> = conn
            .brpoplpush(&self.keys.wait, &self.keys.active, timeout)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<JobEnvelope>(&raw) {
            Ok(envelope) => Ok(Some(ReservedJob::new(envelope, raw))),
            Err(e) => {
                tracing::error!(error = %e, "dropping malformed job payload");
                self.quarantine(&raw).await?;
                Ok(None)
            }
        }
    }

    async fn complete(&self, job: &ReservedJob) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().lrem(&self.keys.active, 1, job.receipt()).ignore();
        if !job.envelope.options.remove_on_success {
            pipe.lpush(&self.keys.completed, serde_json::to_string(&job.envelope)?)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn retry_later(&self, job: &ReservedJob, delay: Duration) -> QueueResult<()> {
        let due_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let payload = serde_json::to_string(&job.envelope)?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(&self.keys.active, 1, job.receipt())
            .ignore()
            .zadd(&self.keys.delayed, payload, due_at)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, job: &ReservedJob) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().lrem(&self.keys.active, 1, job.receipt()).ignore();
        if !job.envelope.options.remove_on_failure {
            pipe.lpush(&self.keys.failed, serde_json::to_string(&job.envelope)?)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = redis::Script::new(PROMOTE_SCRIPT)
            .key(&self.keys.delayed)
            .key(&self.keys.wait)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn requeue_stalled(&self) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = redis::Script::new(REQUEUE_SCRIPT)
            .key(&self.keys.active)
            .key(&self.keys.wait)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed, failed): (u64, u64, u64, u64) = redis::pipe()
            .llen(&self.keys.wait)
            .llen(&self.keys.active)
            .zcard(&self.keys.delayed)
            .llen(&self.keys.failed)
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepth {
            waiting,
            active,
            delayed,
            failed,
        })
    }
}
