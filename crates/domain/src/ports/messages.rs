use crate::DomainResult;
use crate::message::{ChainPosition, Message};

/// Durable, ordered message collection per conversation. The linker only
/// ever writes `parent_message_id`; everything else is insert-once.
#[allow(clippy::needless_pass_by_value)]
pub trait MessageStore: Send + Sync {
    fn create_message(
        &self,
        message: &Message,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Message>>;

    fn get_message(
        &self,
        message_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<Message>>>;

    /// Most recent live message in the conversation, ordered by
    /// `(created_at_ms, seq)` descending, excluding the given id and,
    /// when a position is supplied, anything at or after it.
    fn find_predecessor(
        &self,
        conversation_id: &str,
        exclude_message_id: &str,
        before: Option<ChainPosition>,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<Message>>>;

    fn list_by_conversation(
        &self,
        conversation_id: &str,
        include_deleted: bool,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Vec<Message>>>;

    /// Returns false when the message id does not exist.
    fn update_parent(
        &self,
        message_id: &str,
        parent_message_id: Option<&str>,
    ) -> crate::ports::BoxFuture<'_, DomainResult<bool>>;

    /// Returns false when the message id does not exist.
    fn soft_delete_message(
        &self,
        message_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<bool>>;
}
