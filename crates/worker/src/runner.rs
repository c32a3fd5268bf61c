use std::sync::Arc;
use std::time::{Duration, Instant};

use benang_domain::DomainResult;
use benang_domain::error::DomainError;
use benang_domain::jobs::{ChainSweepPayload, ParentLinkPayload, now_ms};
use benang_domain::ports::jobs::{JobEnvelope, JobQueue, JobType};
use benang_domain::threading::ThreadingService;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::observability;

const REQUEUE_BATCH: usize = 200;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub promote_batch: usize,
    pub link_timeout: Duration,
    pub link_concurrency: usize,
}

/// Drains the link queue: promotes due jobs, dequeues with a blocking
/// poll, and processes each job on a bounded pool with a hard per-job
/// timeout. Failed or timed-out jobs are logged and acked; recovery is
/// an operator sweep, never an automatic retry.
#[derive(Clone)]
pub struct LinkWorker {
    queue: Arc<dyn JobQueue>,
    threading: ThreadingService,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
}

impl LinkWorker {
    pub fn new(queue: Arc<dyn JobQueue>, threading: ThreadingService, config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.link_concurrency.max(1)));
        Self {
            queue,
            threading,
            config,
            permits,
        }
    }

    pub async fn run(&self) {
        // Jobs stranded on the processing list by a previous crash go
        // back to ready before the first dequeue.
        match self.queue.requeue_processing(REQUEUE_BATCH).await {
            Ok(0) => {}
            Ok(requeued) => tracing::info!(requeued, "requeued stranded link jobs"),
            Err(err) => tracing::warn!(error = %err, "failed to requeue stranded jobs"),
        }

        loop {
            if let Err(err) = self.tick().await {
                tracing::warn!(error = %err, "link queue poll failed");
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    async fn tick(&self) -> Result<(), benang_domain::ports::jobs::JobQueueError> {
        let promoted = self
            .queue
            .promote_due(now_ms(), self.config.promote_batch)
            .await?;
        if promoted > 0 {
            tracing::debug!(promoted, "promoted delayed jobs");
        }

        let Some(job) = self.queue.dequeue(self.config.poll_interval).await? else {
            return Ok(());
        };

        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return Ok(());
        };
        let worker = self.clone();
        tokio::spawn(async move {
            worker.process(job).await;
            drop(permit);
        });
        Ok(())
    }

    /// Runs one job to completion, bounded by the link timeout. The job
    /// is acked whatever the outcome; a job that never completes is
    /// abandoned, not left to hold the queue.
    pub async fn process(&self, job: JobEnvelope) {
        let started = Instant::now();
        let job_type = job_type_label(&job.job_type);
        let result = match timeout(self.config.link_timeout, self.handle(&job)).await {
            Ok(Ok(())) => "ok",
            Ok(Err(err)) => {
                tracing::error!(
                    job_id = job.job_id,
                    job_type,
                    error = %err,
                    "link job failed"
                );
                "error"
            }
            Err(_) => {
                tracing::error!(
                    job_id = job.job_id,
                    job_type,
                    timeout_ms = self.config.link_timeout.as_millis() as u64,
                    "link job timed out, abandoning"
                );
                "timeout"
            }
        };
        observability::register_link_job(job_type, result, started.elapsed().as_millis() as f64);

        if let Err(err) = self.queue.ack(&job.job_id).await {
            tracing::error!(job_id = job.job_id, error = %err, "failed to ack link job");
        }
    }

    async fn handle(&self, job: &JobEnvelope) -> DomainResult<()> {
        match job.job_type {
            JobType::ParentLink => {
                let payload: ParentLinkPayload = serde_json::from_value(job.payload.clone())
                    .map_err(|err| {
                        DomainError::Validation(format!("invalid parent link payload: {err}"))
                    })?;
                let Some(message) = self
                    .threading
                    .store()
                    .get_message(&payload.message_id)
                    .await?
                else {
                    tracing::warn!(
                        message_id = payload.message_id,
                        conversation_id = payload.conversation_id,
                        "message gone before linking, skipping"
                    );
                    return Ok(());
                };
                self.threading.link_parent(&message).await?;
                Ok(())
            }
            JobType::ChainSweep => {
                let payload: ChainSweepPayload = serde_json::from_value(job.payload.clone())
                    .map_err(|err| {
                        DomainError::Validation(format!("invalid chain sweep payload: {err}"))
                    })?;
                let outcome = self
                    .threading
                    .sweep_chain(&payload.conversation_id)
                    .await?;
                observability::register_sweep_repairs(outcome.repaired);
                tracing::info!(
                    conversation_id = payload.conversation_id,
                    repaired = outcome.repaired,
                    valid = outcome.report.valid,
                    "chain sweep completed"
                );
                Ok(())
            }
        }
    }
}

fn job_type_label(job_type: &JobType) -> &'static str {
    match job_type {
        JobType::ParentLink => "parent_link",
        JobType::ChainSweep => "chain_sweep",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benang_domain::jobs::{chain_sweep_job_id, new_job, parent_link_job_id};
    use benang_domain::message::{InMemoryMessageStore, Message};
    use benang_domain::ports::BoxFuture;
    use benang_domain::ports::jobs::JobQueueError;
    use benang_domain::ports::messages::MessageStore;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct NullQueue {
        acked: Mutex<Vec<String>>,
    }

    impl JobQueue for NullQueue {
        fn enqueue(&self, _job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
            Box::pin(async { Ok(()) })
        }

        fn dequeue(
            &self,
            _timeout: Duration,
        ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
            Box::pin(async { Ok(None) })
        }

        fn ack(&self, job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
            let job_id = job_id.to_string();
            Box::pin(async move {
                self.acked.lock().unwrap().push(job_id);
                Ok(())
            })
        }

        fn promote_due(
            &self,
            _now_ms: i64,
            _limit: usize,
        ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
            Box::pin(async { Ok(0) })
        }

        fn requeue_processing(&self, _limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
            Box::pin(async { Ok(0) })
        }
    }

    fn worker(store: Arc<InMemoryMessageStore>, queue: Arc<NullQueue>) -> LinkWorker {
        LinkWorker::new(
            queue,
            ThreadingService::new(store),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                promote_batch: 10,
                link_timeout: Duration::from_secs(1),
                link_concurrency: 2,
            },
        )
    }

    fn draft(message_id: &str, conversation_id: &str, created_at_ms: i64) -> Message {
        Message {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            parent_message_id: None,
            role: "user".to_string(),
            body: "body".to_string(),
            created_at_ms,
            seq: 0,
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn parent_link_job_links_the_message() {
        let store = Arc::new(InMemoryMessageStore::new());
        let queue = Arc::new(NullQueue::default());
        let worker = worker(store.clone(), queue.clone());

        store.create_message(&draft("m-1", "c-1", 10)).await.unwrap();
        store.create_message(&draft("m-2", "c-1", 20)).await.unwrap();

        let job = new_job(
            parent_link_job_id("m-2"),
            JobType::ParentLink,
            json!({"message_id": "m-2", "conversation_id": "c-1"}),
            "req".to_string(),
            "c-1".to_string(),
        );
        worker.process(job).await;

        let linked = store.get_message("m-2").await.unwrap().unwrap();
        assert_eq!(linked.parent_message_id.as_deref(), Some("m-1"));
        assert_eq!(queue.acked.lock().unwrap().as_slice(), ["link:m-2"]);
    }

    #[tokio::test]
    async fn job_for_a_vanished_message_is_acked_without_error() {
        let store = Arc::new(InMemoryMessageStore::new());
        let queue = Arc::new(NullQueue::default());
        let worker = worker(store, queue.clone());

        let job = new_job(
            parent_link_job_id("m-ghost"),
            JobType::ParentLink,
            json!({"message_id": "m-ghost", "conversation_id": "c-1"}),
            "req".to_string(),
            "c-1".to_string(),
        );
        worker.process(job).await;

        assert_eq!(queue.acked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_terminal_but_acked() {
        let store = Arc::new(InMemoryMessageStore::new());
        let queue = Arc::new(NullQueue::default());
        let worker = worker(store, queue.clone());

        let job = new_job(
            parent_link_job_id("m-1"),
            JobType::ParentLink,
            json!({"wrong": "shape"}),
            "req".to_string(),
            "c-1".to_string(),
        );
        worker.process(job).await;

        assert_eq!(queue.acked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chain_sweep_job_repairs_gaps() {
        let store = Arc::new(InMemoryMessageStore::new());
        let queue = Arc::new(NullQueue::default());
        let worker = worker(store.clone(), queue.clone());

        store.create_message(&draft("m-1", "c-1", 10)).await.unwrap();
        store.create_message(&draft("m-2", "c-1", 20)).await.unwrap();

        let scheduled = now_ms();
        let job = new_job(
            chain_sweep_job_id("c-1", scheduled),
            JobType::ChainSweep,
            json!({"conversation_id": "c-1", "scheduled_ms": scheduled}),
            "req".to_string(),
            "c-1".to_string(),
        );
        worker.process(job).await;

        let swept = store.get_message("m-2").await.unwrap().unwrap();
        assert_eq!(swept.parent_message_id.as_deref(), Some("m-1"));
    }
}
