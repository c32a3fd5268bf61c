use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::jobs::{ParentLinkPayload, new_job, parent_link_job_id};
use crate::message::Message;
use crate::ports::jobs::{JobQueue, JobType};
use crate::threading::ThreadingService;
use crate::util::uuid_v7_without_dashes;

/// Lifecycle state of one message's link ticket. Terminal tickets are
/// simply dropped from the table, so a repeated flush can never
/// re-trigger linking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkState {
    Pending,
    Linking,
}

/// How link work leaves the persistence hook.
///
/// `Inline` awaits the linker before returning control, for callers that
/// can suspend inside the hook. `Queued` only performs a non-blocking
/// enqueue and leaves the query work to the worker, for callers that
/// must not block the write path.
#[derive(Clone)]
pub enum LinkDispatch {
    Inline(ThreadingService),
    Queued(Arc<dyn JobQueue>),
}

/// Observes the message persistence lifecycle and makes sure the parent
/// linker eventually runs for every new message, exactly once, without
/// failing the host write.
///
/// Work is tracked as explicit tickets keyed by message id rather than
/// as flags on the entity; the ticket table is the single source of
/// truth for what still needs linking.
pub struct LinkBridge {
    dispatch: LinkDispatch,
    tickets: Mutex<HashMap<String, LinkState>>,
}

impl LinkBridge {
    pub fn new(dispatch: LinkDispatch) -> Self {
        Self {
            dispatch,
            tickets: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-persist hook. Registers a `pending-link` ticket for messages
    /// created without a parent.
    pub fn on_message_about_to_persist(&self, message: &Message) {
        if message.parent_message_id.is_some() {
            return;
        }
        let Ok(mut tickets) = self.tickets.lock() else {
            tracing::error!("link ticket table poisoned, dropping registration");
            return;
        };
        tickets
            .entry(message.message_id.clone())
            .or_insert(LinkState::Pending);
    }

    /// Post-persist hook. Dispatches one link attempt per ticketed
    /// message in the batch. Every failure is logged and terminal for
    /// that attempt; retry is an operator action, and the host write has
    /// already succeeded either way.
    pub async fn on_message_persisted(&self, batch: &[Message]) {
        for message in batch {
            if !self.claim(&message.message_id) {
                continue;
            }
            match &self.dispatch {
                LinkDispatch::Inline(service) => {
                    if let Err(err) = service.link_parent(message).await {
                        tracing::error!(
                            message_id = message.message_id,
                            error = %err,
                            "inline parent link attempt failed"
                        );
                    }
                }
                LinkDispatch::Queued(queue) => {
                    if let Err(err) = self.enqueue_link(queue.as_ref(), message).await {
                        tracing::error!(
                            message_id = message.message_id,
                            error = %err,
                            "failed to enqueue parent link job"
                        );
                    }
                }
            }
            self.finish(&message.message_id);
        }
    }

    /// Tickets not yet dispatched, for operator gauges. Tickets already
    /// claimed by an in-flight dispatch are not counted.
    pub fn pending_count(&self) -> usize {
        self.tickets
            .lock()
            .map(|tickets| {
                tickets
                    .values()
                    .filter(|state| **state == LinkState::Pending)
                    .count()
            })
            .unwrap_or(0)
    }

    async fn enqueue_link(
        &self,
        queue: &dyn JobQueue,
        message: &Message,
    ) -> Result<(), crate::ports::jobs::JobQueueError> {
        let payload = serde_json::to_value(ParentLinkPayload {
            message_id: message.message_id.clone(),
            conversation_id: message.conversation_id.clone(),
        })
        .map_err(|err| crate::ports::jobs::JobQueueError::Serialization(err.to_string()))?;
        let job = new_job(
            parent_link_job_id(&message.message_id),
            JobType::ParentLink,
            payload,
            uuid_v7_without_dashes(),
            message.conversation_id.clone(),
        );
        queue.enqueue(&job).await
    }

    fn claim(&self, message_id: &str) -> bool {
        let Ok(mut tickets) = self.tickets.lock() else {
            return false;
        };
        match tickets.get_mut(message_id) {
            Some(state) if *state == LinkState::Pending => {
                *state = LinkState::Linking;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, message_id: &str) {
        if let Ok(mut tickets) = self.tickets.lock() {
            tickets.remove(message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DomainResult;
    use crate::message::InMemoryMessageStore;
    use crate::ports::BoxFuture;
    use crate::ports::jobs::{JobEnvelope, JobQueueError};
    use crate::ports::messages::MessageStore;
    use std::time::Duration;

    fn message(message_id: &str, conversation_id: &str, created_at_ms: i64) -> Message {
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

    #[derive(Default)]
    struct RecordingQueue {
        jobs: Mutex<Vec<JobEnvelope>>,
        fail: bool,
    }

    impl JobQueue for RecordingQueue {
        fn enqueue(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
            let job = job.clone();
            Box::pin(async move {
                if self.fail {
                    return Err(JobQueueError::Unavailable("queue down".to_string()));
                }
                self.jobs.lock().unwrap().push(job);
                Ok(())
            })
        }

        fn dequeue(
            &self,
            _timeout: Duration,
        ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
            Box::pin(async { Ok(None) })
        }

        fn ack(&self, _job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
            Box::pin(async { Ok(()) })
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

    async fn persist(store: &InMemoryMessageStore, draft: Message) -> DomainResult<Message> {
        store.create_message(&draft).await
    }

    #[tokio::test]
    async fn inline_dispatch_links_in_place() {
        let store = Arc::new(InMemoryMessageStore::new());
        let service = ThreadingService::new(store.clone());
        let bridge = LinkBridge::new(LinkDispatch::Inline(service));

        let first = persist(&store, message("m-1", "c-1", 10)).await.unwrap();
        bridge.on_message_about_to_persist(&first);
        bridge.on_message_persisted(std::slice::from_ref(&first)).await;

        let second = persist(&store, message("m-2", "c-1", 20)).await.unwrap();
        bridge.on_message_about_to_persist(&second);
        bridge.on_message_persisted(std::slice::from_ref(&second)).await;

        let linked = store.get_message("m-2").await.unwrap().unwrap();
        assert_eq!(linked.parent_message_id.as_deref(), Some("m-1"));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn queued_dispatch_enqueues_one_job_per_message() {
        let queue = Arc::new(RecordingQueue::default());
        let bridge = LinkBridge::new(LinkDispatch::Queued(queue.clone()));

        let created = message("m-1", "c-1", 10);
        bridge.on_message_about_to_persist(&created);
        bridge.on_message_persisted(std::slice::from_ref(&created)).await;
        // A second flush of the same batch must be a no-op.
        bridge.on_message_persisted(std::slice::from_ref(&created)).await;

        let jobs = queue.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "link:m-1");
        assert_eq!(jobs[0].job_type, JobType::ParentLink);
        assert_eq!(jobs[0].correlation_id, "c-1");
    }

    #[tokio::test]
    async fn messages_with_parent_are_never_ticketed() {
        let queue = Arc::new(RecordingQueue::default());
        let bridge = LinkBridge::new(LinkDispatch::Queued(queue.clone()));

        let mut created = message("m-1", "c-1", 10);
        created.parent_message_id = Some("m-0".to_string());
        bridge.on_message_about_to_persist(&created);
        assert_eq!(bridge.pending_count(), 0);
        bridge.on_message_persisted(std::slice::from_ref(&created)).await;
        assert!(queue.jobs.lock().unwrap().is_empty());
    }

    struct GatedQueue {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl JobQueue for GatedQueue {
        fn enqueue(&self, _job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
            Box::pin(async {
                self.entered.notify_one();
                self.release.notified().await;
                Ok(())
            })
        }

        fn dequeue(
            &self,
            _timeout: Duration,
        ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
            Box::pin(async { Ok(None) })
        }

        fn ack(&self, _job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
            Box::pin(async { Ok(()) })
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

    #[tokio::test]
    async fn pending_count_excludes_tickets_claimed_by_a_dispatch_in_flight() {
        let queue = Arc::new(GatedQueue {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let bridge = Arc::new(LinkBridge::new(LinkDispatch::Queued(queue.clone())));

        let created = message("m-1", "c-1", 10);
        bridge.on_message_about_to_persist(&created);
        assert_eq!(bridge.pending_count(), 1);

        let in_flight = {
            let bridge = bridge.clone();
            let batch = vec![created];
            tokio::spawn(async move { bridge.on_message_persisted(&batch).await })
        };
        queue.entered.notified().await;

        // The ticket is claimed but not yet terminal.
        assert_eq!(bridge.pending_count(), 0);

        queue.release.notify_one();
        in_flight.await.expect("dispatch task");
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn enqueue_failure_is_terminal_not_fatal() {
        let queue = Arc::new(RecordingQueue {
            fail: true,
            ..RecordingQueue::default()
        });
        let bridge = LinkBridge::new(LinkDispatch::Queued(queue));

        let created = message("m-1", "c-1", 10);
        bridge.on_message_about_to_persist(&created);
        bridge.on_message_persisted(std::slice::from_ref(&created)).await;

        // The attempt is spent; nothing is retried automatically.
        assert_eq!(bridge.pending_count(), 0);
    }
}
