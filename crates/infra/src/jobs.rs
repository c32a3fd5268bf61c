use std::time::Duration;

use benang_domain::ports::jobs::{JobEnvelope, JobQueue, JobQueueError};
use redis::AsyncCommands;
use redis::Value;
use redis::aio::ConnectionManager;

const DEFAULT_PREFIX: &str = "benang:links";
const DEFAULT_DEDUPE_TTL_MS: u64 = 60_000;

/// Key layout of one queue under its prefix.
#[derive(Clone, Debug)]
struct QueueKeys {
    ready: String,
    delayed: String,
    processing: String,
    payloads: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            ready: format!("{prefix}:ready"),
            delayed: format!("{prefix}:delayed"),
            processing: format!("{prefix}:processing"),
            payloads: format!("{prefix}:payloads"),
        }
    }

    fn dedupe(&self, job_id: &str) -> String {
        format!("{payloads}:dedupe:{job_id}", payloads = self.payloads)
    }
}

/// Redis-backed queue for deferred link work. Jobs wait on a ready list,
/// scheduled jobs on a delayed zset, and in-flight jobs on a processing
/// list so a crashed worker can be drained back into ready.
///
/// Every enqueue goes through a TTL dedupe marker keyed by job id, so
/// concurrent producers enqueueing the same message collapse into a
/// single job.
#[derive(Clone)]
pub struct RedisLinkQueue {
    manager: ConnectionManager,
    keys: QueueKeys,
    dedupe_ttl_ms: u64,
}

impl std::fmt::Debug for RedisLinkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLinkQueue")
            .field("keys", &self.keys)
            .field("dedupe_ttl_ms", &self.dedupe_ttl_ms)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct LinkQueueMetricsSnapshot {
    pub ready: u64,
    pub delayed: u64,
    pub processing: u64,
    pub oldest_delayed_ms: Option<i64>,
}

impl RedisLinkQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, JobQueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX, DEFAULT_DEDUPE_TTL_MS).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
        dedupe_ttl_ms: u64,
    ) -> Result<Self, JobQueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            keys: QueueKeys::new(&prefix.into()),
            dedupe_ttl_ms,
        })
    }

    fn serialize(job: &JobEnvelope) -> Result<String, JobQueueError> {
        serde_json::to_string(job).map_err(|err| JobQueueError::Serialization(err.to_string()))
    }

    fn deserialize(payload: &str) -> Result<JobEnvelope, JobQueueError> {
        serde_json::from_str(payload).map_err(|err| JobQueueError::Serialization(err.to_string()))
    }

    /// Enqueues unless a job with the same id was enqueued within the
    /// dedupe window. Link jobs are keyed by message id, so repeated
    /// flush notifications for one message collapse into a single job.
    /// Returns whether the job was inserted.
    pub async fn enqueue_if_absent(&self, job: &JobEnvelope) -> Result<bool, JobQueueError> {
        let payload = Self::serialize(job)?;
        let dedupe_key = self.keys.dedupe(&job.job_id);
        let now_ms = benang_domain::jobs::now_ms();
        let dedupe_ttl_ms = self.dedupe_ttl_ms.max(1);

        let mut conn = self.manager.clone();
        let script = redis::Script::new(
            r#"
                local payload_key = KEYS[1]
                local ready_key = KEYS[2]
                local delayed_key = KEYS[3]
                local marker_key = KEYS[4]
                local job_id = ARGV[1]
                local payload = ARGV[2]
                local run_at_ms = tonumber(ARGV[3])
                local now_ms = tonumber(ARGV[4])
                local dedupe_ttl_ms = tonumber(ARGV[5])

                if redis.call('SET', marker_key, 1, 'PX', dedupe_ttl_ms, 'NX') == false then
                    return 0
                end

                redis.call('HSET', payload_key, job_id, payload)
                if run_at_ms <= now_ms then
                    redis.call('RPUSH', ready_key, job_id)
                else
                    redis.call('ZADD', delayed_key, run_at_ms, job_id)
                end
                return 1
            "#,
        );
        let inserted: i32 = script
            .key(&self.keys.payloads)
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&dedupe_key)
            .arg(&job.job_id)
            .arg(payload)
            .arg(job.run_at_ms)
            .arg(now_ms)
            .arg(dedupe_ttl_ms as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| JobQueueError::Operation(err.to_string()))?;

        Ok(inserted == 1)
    }

    pub async fn metrics_snapshot(&self) -> Result<LinkQueueMetricsSnapshot, JobQueueError> {
        let mut conn = self.manager.clone();
        let ready: u64 = conn
            .llen(&self.keys.ready)
            .await
            .map_err(|err| JobQueueError::Operation(err.to_string()))?;
        let delayed: u64 = conn
            .zcard(&self.keys.delayed)
            .await
            .map_err(|err| JobQueueError::Operation(err.to_string()))?;
        let processing: u64 = conn
            .llen(&self.keys.processing)
            .await
            .map_err(|err| JobQueueError::Operation(err.to_string()))?;

        let oldest_delayed_ms: Option<i64> = if delayed == 0 {
            None
        } else {
            let result: Vec<(String, f64)> = redis::cmd("ZRANGE")
                .arg(&self.keys.delayed)
                .arg(0)
                .arg(0)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await
                .map_err(|err| JobQueueError::Operation(err.to_string()))?;
            result.into_iter().next().map(|(_, score)| score as i64)
        };

        Ok(LinkQueueMetricsSnapshot {
            ready,
            delayed,
            processing,
            oldest_delayed_ms,
        })
    }
}

impl JobQueue for RedisLinkQueue {
    fn enqueue(
        &self,
        job: &JobEnvelope,
    ) -> benang_domain::ports::BoxFuture<'_, Result<(), JobQueueError>> {
        let job = job.clone();
        Box::pin(async move {
            if !self.enqueue_if_absent(&job).await? {
                tracing::debug!(
                    job_id = job.job_id,
                    "duplicate job suppressed by dedupe marker"
                );
            }
            Ok(())
        })
    }

    fn dequeue(
        &self,
        timeout: Duration,
    ) -> benang_domain::ports::BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
        let timeout_secs = timeout.as_secs() as usize;
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let result: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&self.keys.ready)
                .arg(&self.keys.processing)
                .arg(timeout_secs)
                .query_async(&mut conn)
                .await
                .map_err(|err| JobQueueError::Operation(err.to_string()))?;
            let Some(job_id) = result else {
                return Ok(None);
            };
            let payload: Option<String> = redis::cmd("HGET")
                .arg(&self.keys.payloads)
                .arg(&job_id)
                .query_async(&mut conn)
                .await
                .map_err(|err| JobQueueError::Operation(err.to_string()))?;
            let Some(payload) = payload else {
                // Orphaned id; drop it from processing so it cannot wedge
                // the requeue path.
                let _: i64 = redis::cmd("LREM")
                    .arg(&self.keys.processing)
                    .arg(1)
                    .arg(&job_id)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| JobQueueError::Operation(err.to_string()))?;
                return Err(JobQueueError::Operation(format!(
                    "missing payload for job_id {job_id}"
                )));
            };
            Ok(Some(Self::deserialize(&payload)?))
        })
    }

    fn ack(&self, job_id: &str) -> benang_domain::ports::BoxFuture<'_, Result<(), JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline
                .cmd("LREM")
                .arg(&self.keys.processing)
                .arg(1)
                .arg(&job_id);
            pipeline.cmd("HDEL").arg(&self.keys.payloads).arg(&job_id);
            let _: Vec<Value> = pipeline
                .query_async(&mut conn)
                .await
                .map_err(|err| JobQueueError::Operation(err.to_string()))?;
            Ok(())
        })
    }

    fn promote_due(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> benang_domain::ports::BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut moved = 0usize;
            for _ in 0..limit {
                let result: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
                    .arg(&self.keys.delayed)
                    .arg(1)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| JobQueueError::Operation(err.to_string()))?;
                let Some((job_id, score)) = result.into_iter().next() else {
                    break;
                };
                if score as i64 > now_ms {
                    // Not due yet; push it back and stop.
                    let _: i64 = redis::cmd("ZADD")
                        .arg(&self.keys.delayed)
                        .arg(score)
                        .arg(job_id)
                        .query_async(&mut conn)
                        .await
                        .map_err(|err| JobQueueError::Operation(err.to_string()))?;
                    break;
                }
                let _: i64 = conn
                    .lpush(&self.keys.ready, job_id)
                    .await
                    .map_err(|err| JobQueueError::Operation(err.to_string()))?;
                moved += 1;
            }
            Ok(moved)
        })
    }

    fn requeue_processing(
        &self,
        limit: usize,
    ) -> benang_domain::ports::BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            if limit == 0 {
                return Ok(0);
            }
            let mut conn = self.manager.clone();
            let job_ids: Vec<String> = redis::cmd("LRANGE")
                .arg(&self.keys.processing)
                .arg(0)
                .arg((limit.saturating_sub(1)) as i64)
                .query_async(&mut conn)
                .await
                .map_err(|err| JobQueueError::Operation(err.to_string()))?;
            if job_ids.is_empty() {
                return Ok(0);
            }
            let _: i64 = redis::cmd("RPUSH")
                .arg(&self.keys.ready)
                .arg(job_ids.clone())
                .query_async(&mut conn)
                .await
                .map_err(|err| JobQueueError::Operation(err.to_string()))?;
            let _: String = redis::cmd("LTRIM")
                .arg(&self.keys.processing)
                .arg(job_ids.len() as i64)
                .arg(-1)
                .query_async(&mut conn)
                .await
                .map_err(|err| JobQueueError::Operation(err.to_string()))?;
            Ok(job_ids.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_derive_from_the_prefix() {
        let keys = QueueKeys::new("benang:links");
        assert_eq!(keys.ready, "benang:links:ready");
        assert_eq!(keys.delayed, "benang:links:delayed");
        assert_eq!(keys.processing, "benang:links:processing");
        assert_eq!(keys.payloads, "benang:links:payloads");
    }

    #[test]
    fn dedupe_marker_is_keyed_by_job_id() {
        let keys = QueueKeys::new("benang:links");
        assert_eq!(
            keys.dedupe("link:m-1"),
            "benang:links:payloads:dedupe:link:m-1"
        );
    }

    #[tokio::test]
    async fn connect_rejects_malformed_urls() {
        let err = RedisLinkQueue::connect("not a redis url").await.unwrap_err();
        assert!(matches!(err, JobQueueError::Unavailable(_)));
    }
}
