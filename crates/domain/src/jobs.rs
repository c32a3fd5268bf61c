use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ports::jobs::{JobEnvelope, JobType};

/// Payload of a deferred parent-link attempt. One tuple per message, a
/// value object rather than a flag patched onto the entity, so a job can
/// be serialized, deduplicated and replayed without touching the row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentLinkPayload {
    pub message_id: String,
    pub conversation_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainSweepPayload {
    pub conversation_id: String,
    pub scheduled_ms: i64,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn new_job(
    job_id: String,
    job_type: JobType,
    payload: serde_json::Value,
    request_id: String,
    correlation_id: String,
) -> JobEnvelope {
    let now = now_ms();
    JobEnvelope {
        job_id,
        job_type,
        payload,
        request_id,
        correlation_id,
        run_at_ms: now,
        created_at_ms: now,
    }
}

/// Job id for a link attempt. Keyed by message id so queue-level dedupe
/// collapses repeated flush notifications for the same message.
pub fn parent_link_job_id(message_id: &str) -> String {
    format!("link:{message_id}")
}

pub fn chain_sweep_job_id(conversation_id: &str, scheduled_ms: i64) -> String {
    format!("sweep:{conversation_id}:{scheduled_ms}")
}
