use std::sync::Arc;

use benang_domain::DomainResult;
use benang_domain::error::DomainError;
use benang_domain::message::{ChainPosition, Message};
use benang_domain::ports::messages::MessageStore;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::{
    Surreal,
    engine::remote::ws::{Client, Ws},
    opt::auth::Root,
};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::db::DbConfig;

const MESSAGE_FIELDS: &str = "\
    message_id,\n\
    conversation_id,\n\
    IF parent_message_id IS NONE THEN NONE ELSE parent_message_id END AS parent_message_id,\n\
    role,\n\
    body,\n\
    type::string(created_at) AS created_at,\n\
    seq,\n\
    is_deleted";

#[derive(Debug, Serialize, Deserialize)]
struct SurrealMessageRow {
    message_id: String,
    conversation_id: String,
    parent_message_id: Option<String>,
    role: String,
    body: String,
    created_at: String,
    seq: i64,
    is_deleted: bool,
}

/// Message store backed by SurrealDB. The per-conversation `seq` counter
/// row is bumped in the same transaction as the insert, so the ordering
/// tie-break survives same-millisecond writes.
#[derive(Clone)]
pub struct SurrealMessageStore {
    client: Arc<Surreal<Client>>,
}

impl SurrealMessageStore {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        let db = Surreal::<Client>::init();
        db.connect::<Ws>(&db_config.endpoint).await?;
        db.signin(Root {
            username: &db_config.username,
            password: &db_config.password,
        })
        .await?;
        db.use_ns(&db_config.namespace)
            .use_db(&db_config.database)
            .await?;
        Ok(Self {
            client: Arc::new(db),
        })
    }

    fn map_surreal_error(err: surrealdb::Error) -> DomainError {
        let error_message = err.to_string().to_lowercase();
        if error_message.contains("already exists")
            || error_message.contains("duplicate")
            || error_message.contains("unique")
            || error_message.contains("conflict")
        {
            return DomainError::Conflict;
        }
        DomainError::Store(format!("surreal query failed: {error_message}"))
    }

    fn to_rfc3339(created_at_ms: i64) -> DomainResult<String> {
        let instant = OffsetDateTime::from_unix_timestamp_nanos(created_at_ms as i128 * 1_000_000)
            .map_err(|err| DomainError::Validation(format!("invalid timestamp: {err}")))?;
        Ok(instant
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string()))
    }

    fn parse_datetime(value: &str) -> DomainResult<i64> {
        let datetime = OffsetDateTime::parse(value, &Rfc3339)
            .map_err(|err| DomainError::Validation(format!("invalid datetime: {err}")))?;
        Ok((datetime.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    fn decode_message_rows(rows: Vec<Value>) -> DomainResult<Vec<Message>> {
        rows.into_iter()
            .map(|row| {
                serde_json::from_value::<SurrealMessageRow>(row)
                    .map_err(|err| DomainError::Validation(format!("invalid message row: {err}")))
                    .and_then(Self::map_message_row)
            })
            .collect()
    }

    fn map_message_row(row: SurrealMessageRow) -> DomainResult<Message> {
        Ok(Message {
            message_id: row.message_id,
            conversation_id: row.conversation_id,
            parent_message_id: row.parent_message_id,
            role: row.role,
            body: row.body,
            created_at_ms: Self::parse_datetime(&row.created_at)?,
            seq: row.seq,
            is_deleted: row.is_deleted,
        })
    }

    fn take_rows(
        response: &mut surrealdb::Response,
        index: usize,
    ) -> DomainResult<Vec<Value>> {
        response
            .take(index)
            .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))
    }
}

impl MessageStore for SurrealMessageStore {
    fn create_message(
        &self,
        message: &Message,
    ) -> benang_domain::ports::BoxFuture<'_, DomainResult<Message>> {
        let created_at = match Self::to_rfc3339(message.created_at_ms) {
            Ok(created_at) => created_at,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let message = message.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    format!(
                        "BEGIN TRANSACTION;\n\
                         LET $next_seq = (UPSERT type::thing('message_seq', $conversation_id) SET value += 1 RETURN AFTER)[0].value;\n\
                         CREATE message CONTENT {{\n\
                            message_id: $message_id,\n\
                            conversation_id: $conversation_id,\n\
                            parent_message_id: IF $parent_message_id IS NONE THEN NONE ELSE $parent_message_id END,\n\
                            role: $role,\n\
                            body: $body,\n\
                            created_at: <datetime>$created_at,\n\
                            seq: $next_seq,\n\
                            is_deleted: $is_deleted\n\
                         }};\n\
                         SELECT {MESSAGE_FIELDS}\n\
                         FROM message WHERE message_id = $message_id LIMIT 1;\n\
                         COMMIT TRANSACTION;"
                    ),
                )
                .bind(("message_id", message.message_id.clone()))
                .bind(("conversation_id", message.conversation_id.clone()))
                .bind(("parent_message_id", message.parent_message_id.clone()))
                .bind(("role", message.role.clone()))
                .bind(("body", message.body.clone()))
                .bind(("created_at", created_at))
                .bind(("is_deleted", message.is_deleted))
                .await
                .map_err(Self::map_surreal_error)?;
            counter!("benang_store_messages_created_total").increment(1);
            let rows = Self::take_rows(&mut response, 2)?;
            let mut messages = Self::decode_message_rows(rows)?;
            messages
                .pop()
                .ok_or_else(|| DomainError::Validation("create returned no row".to_string()))
        })
    }

    fn get_message(
        &self,
        message_id: &str,
    ) -> benang_domain::ports::BoxFuture<'_, DomainResult<Option<Message>>> {
        let message_id = message_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "SELECT {MESSAGE_FIELDS}\n\
                     FROM message WHERE message_id = $message_id LIMIT 1"
                ))
                .bind(("message_id", message_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows = Self::take_rows(&mut response, 0)?;
            Ok(Self::decode_message_rows(rows)?.into_iter().next())
        })
    }

    fn find_predecessor(
        &self,
        conversation_id: &str,
        exclude_message_id: &str,
        before: Option<ChainPosition>,
    ) -> benang_domain::ports::BoxFuture<'_, DomainResult<Option<Message>>> {
        let conversation_id = conversation_id.to_string();
        let exclude_message_id = exclude_message_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut statement = format!(
                "SELECT {MESSAGE_FIELDS}\n\
                 FROM message\n\
                 WHERE conversation_id = $conversation_id\n\
                   AND message_id != $exclude_message_id\n\
                   AND is_deleted = false"
            );
            if before.is_some() {
                statement.push_str(
                    "\n   AND (created_at < <datetime>$before_at\n\
                        OR (created_at = <datetime>$before_at AND seq < $before_seq))",
                );
            }
            statement.push_str("\nORDER BY created_at DESC, seq DESC LIMIT 1");

            let mut query = client
                .query(statement)
                .bind(("conversation_id", conversation_id))
                .bind(("exclude_message_id", exclude_message_id));
            if let Some(position) = before {
                let before_at = Self::to_rfc3339(position.created_at_ms)?;
                query = query
                    .bind(("before_at", before_at))
                    .bind(("before_seq", position.seq));
            }
            let mut response = query.await.map_err(Self::map_surreal_error)?;
            let rows = Self::take_rows(&mut response, 0)?;
            Ok(Self::decode_message_rows(rows)?.into_iter().next())
        })
    }

    fn list_by_conversation(
        &self,
        conversation_id: &str,
        include_deleted: bool,
    ) -> benang_domain::ports::BoxFuture<'_, DomainResult<Vec<Message>>> {
        let conversation_id = conversation_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut statement = format!(
                "SELECT {MESSAGE_FIELDS}\n\
                 FROM message WHERE conversation_id = $conversation_id"
            );
            if !include_deleted {
                statement.push_str(" AND is_deleted = false");
            }
            statement.push_str("\nORDER BY created_at ASC, seq ASC");

            let mut response = client
                .query(statement)
                .bind(("conversation_id", conversation_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows = Self::take_rows(&mut response, 0)?;
            let mut messages = Self::decode_message_rows(rows)?;
            messages.sort_by(|a, b| {
                a.position()
                    .cmp(&b.position())
                    .then_with(|| a.message_id.cmp(&b.message_id))
            });
            Ok(messages)
        })
    }

    fn update_parent(
        &self,
        message_id: &str,
        parent_message_id: Option<&str>,
    ) -> benang_domain::ports::BoxFuture<'_, DomainResult<bool>> {
        let message_id = message_id.to_string();
        let parent_message_id = parent_message_id.map(str::to_string);
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "UPDATE message\n\
                     SET parent_message_id = IF $parent_message_id IS NONE THEN NONE ELSE $parent_message_id END\n\
                     WHERE message_id = $message_id\n\
                     RETURN AFTER",
                )
                .bind(("message_id", message_id))
                .bind(("parent_message_id", parent_message_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows = Self::take_rows(&mut response, 0)?;
            if rows.is_empty() {
                return Ok(false);
            }
            counter!("benang_store_parent_updates_total").increment(1);
            Ok(true)
        })
    }

    fn soft_delete_message(
        &self,
        message_id: &str,
    ) -> benang_domain::ports::BoxFuture<'_, DomainResult<bool>> {
        let message_id = message_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "UPDATE message SET is_deleted = true\n\
                     WHERE message_id = $message_id RETURN AFTER",
                )
                .bind(("message_id", message_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows = Self::take_rows(&mut response, 0)?;
            Ok(!rows.is_empty())
        })
    }
}
