use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::message::Message;
use crate::ports::messages::MessageStore;

/// Structural health report for one conversation's parent chain.
///
/// `message_count` and the coverage figures describe the live (non
/// soft-deleted) messages; parent references are resolved against the
/// full historical record, so a link to a soft-deleted predecessor is
/// history rather than breakage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChainReport {
    pub valid: bool,
    pub message_count: usize,
    pub messages_with_parent: usize,
    pub broken_chains: usize,
    pub first_message_valid: bool,
    pub chain_coverage: f64,
}

impl ChainReport {
    fn empty() -> Self {
        Self {
            valid: true,
            message_count: 0,
            messages_with_parent: 0,
            broken_chains: 0,
            first_message_valid: true,
            chain_coverage: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SweepOutcome {
    pub repaired: usize,
    pub report: ChainReport,
}

/// Parent-chain maintenance over a [`MessageStore`]: linking newly
/// persisted messages to their predecessor, operator-driven repair, and
/// read-only chain validation.
#[derive(Clone)]
pub struct ThreadingService {
    store: Arc<dyn MessageStore>,
}

impl ThreadingService {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }

    /// Assigns the parent of a freshly persisted message. A message that
    /// already carries a parent is left untouched; only
    /// [`repair_parent`](Self::repair_parent) may overwrite a link.
    ///
    /// Returns the parent id now in effect, `None` for a chain start.
    pub async fn link_parent(&self, message: &Message) -> DomainResult<Option<String>> {
        if message.parent_message_id.is_some() {
            return Ok(message.parent_message_id.clone());
        }

        let parent_id = self.resolve_parent(message).await?;
        match parent_id.as_deref() {
            Some(parent_id) => {
                if !self
                    .store
                    .update_parent(&message.message_id, Some(parent_id))
                    .await?
                {
                    return Err(DomainError::NotFound);
                }
                tracing::debug!(
                    message_id = message.message_id,
                    parent_id,
                    "parent link assigned"
                );
            }
            None => {
                tracing::debug!(
                    message_id = message.message_id,
                    conversation_id = message.conversation_id,
                    "no predecessor, message starts the chain"
                );
            }
        }
        Ok(parent_id)
    }

    /// Unconditionally recomputes and persists the parent of one message.
    /// Overwrites an existing link and clears a dangling one. Returns
    /// false when the message id does not exist.
    pub async fn repair_parent(&self, message_id: &str) -> DomainResult<bool> {
        let Some(message) = self.store.get_message(message_id).await? else {
            tracing::warn!(message_id, "repair requested for unknown message");
            return Ok(false);
        };

        let parent_id = self.resolve_parent(&message).await?;
        if parent_id == message.parent_message_id {
            return Ok(true);
        }
        if !self
            .store
            .update_parent(message_id, parent_id.as_deref())
            .await?
        {
            return Ok(false);
        }
        tracing::info!(
            message_id,
            old_parent = message.parent_message_id.as_deref(),
            new_parent = parent_id.as_deref(),
            "parent link repaired"
        );
        Ok(true)
    }

    /// Read-only structural audit of a conversation's chain. Never
    /// mutates the store; repeated calls on an unchanged conversation
    /// return identical reports.
    pub async fn validate_chain(&self, conversation_id: &str) -> DomainResult<ChainReport> {
        let all = self
            .store
            .list_by_conversation(conversation_id, true)
            .await?;
        let deleted_by_id: HashMap<&str, bool> = all
            .iter()
            .map(|message| (message.message_id.as_str(), message.is_deleted))
            .collect();
        let live: Vec<&Message> = all.iter().filter(|message| !message.is_deleted).collect();

        let Some(earliest) = live.first() else {
            return Ok(ChainReport::empty());
        };

        // A soft-deleted predecessor shifts the chain start; the new
        // earliest message keeps its historical link and stays valid.
        let first_message_valid = match earliest.parent_message_id.as_deref() {
            None => true,
            Some(parent_id) => {
                parent_id != earliest.message_id
                    && deleted_by_id.get(parent_id).copied().unwrap_or(false)
            }
        };

        let mut broken_chains = 0usize;
        for message in live.iter().skip(1) {
            let Some(parent_id) = message.parent_message_id.as_deref() else {
                continue;
            };
            if parent_id == message.message_id || !deleted_by_id.contains_key(parent_id) {
                broken_chains += 1;
            }
        }

        let message_count = live.len();
        let messages_with_parent = live
            .iter()
            .filter(|message| message.parent_message_id.is_some())
            .count();
        let chain_coverage =
            messages_with_parent as f64 / message_count.saturating_sub(1).max(1) as f64 * 100.0;

        Ok(ChainReport {
            valid: broken_chains == 0 && first_message_valid,
            message_count,
            messages_with_parent,
            broken_chains,
            first_message_valid,
            chain_coverage,
        })
    }

    /// Repairs every live message whose link is missing, self-referential
    /// or pointing outside the historical record, then re-validates.
    pub async fn sweep_chain(&self, conversation_id: &str) -> DomainResult<SweepOutcome> {
        let all = self
            .store
            .list_by_conversation(conversation_id, true)
            .await?;
        let known: HashMap<&str, bool> = all
            .iter()
            .map(|message| (message.message_id.as_str(), message.is_deleted))
            .collect();
        let live: Vec<&Message> = all.iter().filter(|message| !message.is_deleted).collect();

        let mut repaired = 0usize;
        for (index, message) in live.iter().enumerate() {
            let needs_repair = match message.parent_message_id.as_deref() {
                None => index > 0,
                Some(parent_id) if parent_id == message.message_id => true,
                Some(parent_id) => match known.get(parent_id) {
                    None => true,
                    // The chain start may keep a link to a soft-deleted
                    // predecessor, but never to a live one.
                    Some(parent_deleted) => index == 0 && !parent_deleted,
                },
            };
            if needs_repair && self.repair_parent(&message.message_id).await? {
                repaired += 1;
            }
        }

        let report = self.validate_chain(conversation_id).await?;
        Ok(SweepOutcome { repaired, report })
    }

    /// Predecessor lookup with the write-time invariant checks: the
    /// candidate must come from the same conversation and must not be the
    /// message itself.
    async fn resolve_parent(&self, message: &Message) -> DomainResult<Option<String>> {
        let predecessor = self
            .store
            .find_predecessor(
                &message.conversation_id,
                &message.message_id,
                Some(message.position()),
            )
            .await?;

        let Some(predecessor) = predecessor else {
            return Ok(None);
        };
        if predecessor.message_id == message.message_id {
            return Err(DomainError::Validation(format!(
                "predecessor of {id} resolved to itself",
                id = message.message_id
            )));
        }
        if predecessor.conversation_id != message.conversation_id {
            return Err(DomainError::Validation(format!(
                "predecessor of {id} belongs to conversation {other}",
                id = message.message_id,
                other = predecessor.conversation_id
            )));
        }
        Ok(Some(predecessor.message_id))
    }
}
