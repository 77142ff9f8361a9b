//! Conversation store: the single place chat state is mutated.
//!
//! Conversations are append-only ordered message sequences. Ordering is by
//! the `seq` position assigned at insert, never by timestamp, because two
//! messages of the same turn routinely land within the same second. The
//! store also owns the per-conversation turn gate that keeps sends for one
//! conversation from interleaving while a dispatch is in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use r2d2_sqlite::rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::DbPool;
use crate::errors::RouterError;

/// Maximum title length before truncation, in characters.
const TITLE_MAX_CHARS: usize = 30;
const TITLE_ELLIPSIS: char = '…';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Representation of a conversation row returned through the API.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Compact listing entry, most-recently-updated first.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub updated_at: i64,
    pub message_count: i64,
}

/// Normalised chat message returned to callers. `timestamp` is the display
/// form (HH:MM); ordering always follows `seq`.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub role: Role,
    pub body: String,
    pub model_used: Option<String>,
    pub created_at: i64,
    pub timestamp: String,
}

/// RAII guard marking a turn in flight for one conversation. Dropping the
/// guard reopens the conversation for the next send.
pub struct TurnGuard {
    conversation_id: String,
    gates: Arc<Mutex<HashSet<String>>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Ok(mut gates) = self.gates.lock() {
            gates.remove(&self.conversation_id);
        }
    }
}

#[derive(Clone)]
pub struct ConversationStore {
    pool: DbPool,
    gates: Arc<Mutex<HashSet<String>>>,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            gates: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Allocate a conversation from its initiating user message. The title is
    /// the first thirty characters of the message, with an ellipsis marker
    /// when truncated.
    pub fn create(&self, first_message: &str) -> Result<(ConversationRecord, MessageRecord)> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let id = Uuid::new_v4().to_string();
        let title = derive_title(first_message);
        tx.execute(
            "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id, title, now],
        )?;
        let message = insert_message(&tx, &id, Role::User, first_message, None)?;
        tx.commit()?;
        Ok((
            ConversationRecord {
                id,
                title,
                created_at: now,
                updated_at: now,
            },
            message,
        ))
    }

    /// Append a message to an existing conversation and bump its
    /// last-updated timestamp.
    pub fn append(
        &self,
        conversation_id: &str,
        role: Role,
        body: &str,
        model_used: Option<&str>,
    ) -> Result<MessageRecord> {
        let conn = self.pool.get()?;
        if fetch_conversation(&conn, conversation_id)?.is_none() {
            return Err(RouterError::ConversationNotFound.into());
        }
        insert_message(&conn, conversation_id, role, body, model_used)
    }

    pub fn get(&self, conversation_id: &str) -> Result<ConversationRecord> {
        let conn = self.pool.get()?;
        fetch_conversation(&conn, conversation_id)?
            .ok_or_else(|| RouterError::ConversationNotFound.into())
    }

    /// Ordered messages for one conversation.
    pub fn messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.pool.get()?;
        if fetch_conversation(&conn, conversation_id)?.is_none() {
            return Err(RouterError::ConversationNotFound.into());
        }
        list_messages(&conn, conversation_id, limit)
    }

    /// Conversation summaries ordered by most recent activity.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<ConversationSummary>> {
        let conn = self.pool.get()?;
        let mut sql = "SELECT c.id, c.title, c.updated_at, \
                       (SELECT COUNT(1) FROM messages m WHERE m.conversation_id = c.id) \
                       FROM conversations c ORDER BY c.updated_at DESC, c.rowid DESC"
            .to_string();
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&limit.to_string());
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(ConversationSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                updated_at: row.get(2)?,
                message_count: row.get(3)?,
            })
        })?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    /// Mark a turn in flight for the conversation. Fails with `TurnInFlight`
    /// while a previous guard is alive; guards for different conversations
    /// never contend.
    pub fn begin_turn(&self, conversation_id: &str) -> Result<TurnGuard> {
        let mut gates = self
            .gates
            .lock()
            .map_err(|_| RouterError::Unknown)?;
        if !gates.insert(conversation_id.to_string()) {
            return Err(RouterError::TurnInFlight.into());
        }
        Ok(TurnGuard {
            conversation_id: conversation_id.to_string(),
            gates: self.gates.clone(),
        })
    }
}

fn derive_title(content: &str) -> String {
    let mut chars = content.chars();
    let title: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        let mut truncated = title;
        truncated.push(TITLE_ELLIPSIS);
        truncated
    } else {
        title
    }
}

fn display_time(unix: i64) -> String {
    OffsetDateTime::from_unix_timestamp(unix)
        .ok()
        .and_then(|dt| dt.format(&format_description!("[hour]:[minute]")).ok())
        .unwrap_or_default()
}

fn fetch_conversation(
    conn: &rusqlite::Connection,
    conversation_id: &str,
) -> Result<Option<ConversationRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
    )?;
    let row = stmt
        .query_row([conversation_id], |row| {
            Ok(ConversationRecord {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })
        .optional()?;
    Ok(row)
}

fn list_messages(
    conn: &rusqlite::Connection,
    conversation_id: &str,
    limit: Option<usize>,
) -> Result<Vec<MessageRecord>> {
    let mut sql = "SELECT id, conversation_id, seq, role, body, model_used, created_at \
                   FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC"
        .to_string();
    if let Some(limit) = limit {
        sql.push_str(" LIMIT ");
        sql.push_str(&limit.to_string());
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([conversation_id], map_message)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

fn insert_message(
    conn: &rusqlite::Connection,
    conversation_id: &str,
    role: Role,
    body: &str,
    model_used: Option<&str>,
) -> Result<MessageRecord> {
    let id = Uuid::new_v4().to_string();
    let created_at = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO messages (id, conversation_id, seq, role, body, model_used, created_at) \
         VALUES (?1, ?2, (SELECT COALESCE(MAX(seq) + 1, 0) FROM messages WHERE conversation_id = ?2), ?3, ?4, ?5, ?6)",
        params![id, conversation_id, role.as_str(), body, model_used, created_at],
    )?;
    let seq: i64 = conn.query_row(
        "SELECT seq FROM messages WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
        params![conversation_id, created_at],
    )?;
    Ok(MessageRecord {
        id,
        conversation_id: conversation_id.to_string(),
        seq,
        role,
        body: body.to_string(),
        model_used: model_used.map(|m| m.to_string()),
        created_at,
        timestamp: display_time(created_at),
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role_str: String = row.get(3)?;
    let created_at: i64 = row.get(6)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        role: role_from_db(&role_str),
        body: row.get(4)?,
        model_used: row.get(5)?,
        created_at,
        timestamp: display_time(created_at),
    })
}

fn role_from_db(value: &str) -> Role {
    match value {
        "assistant" => Role::Assistant,
        _ => Role::User,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[test]
    fn short_titles_are_kept_verbatim() {
        let store = ConversationStore::new(memory_pool());
        let (conversation, message) = store.create("Hello there").unwrap();
        assert_eq!(conversation.title, "Hello there");
        assert_eq!(message.seq, 0);
        assert_eq!(message.role, Role::User);

        let fetched = store.get(&conversation.id).unwrap();
        assert_eq!(fetched.title, "Hello there");
    }

    #[test]
    fn long_titles_are_truncated_with_an_ellipsis() {
        let store = ConversationStore::new(memory_pool());
        let prompt = "Explain the theory of relativity in simple words";
        let (conversation, _) = store.create(prompt).unwrap();
        let expected: String = prompt.chars().take(30).collect();
        assert_eq!(conversation.title, format!("{expected}…"));
        assert_eq!(conversation.title.chars().count(), 31);
    }

    #[test]
    fn title_truncation_counts_characters_not_bytes() {
        let store = ConversationStore::new(memory_pool());
        let prompt = "héllo ".repeat(10);
        let (conversation, _) = store.create(&prompt).unwrap();
        assert_eq!(conversation.title.chars().count(), 31);
    }

    #[test]
    fn appends_preserve_submission_order() {
        let store = ConversationStore::new(memory_pool());
        let (conversation, _) = store.create("first").unwrap();
        for i in 1..=5 {
            store
                .append(&conversation.id, Role::Assistant, &format!("reply {i}"), Some("Claude"))
                .unwrap();
        }
        let messages = store.messages(&conversation.id, None).unwrap();
        assert_eq!(messages.len(), 6);
        let seqs: Vec<i64> = messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(messages[3].body, "reply 3");
    }

    #[test]
    fn append_to_unknown_conversation_is_not_found() {
        let store = ConversationStore::new(memory_pool());
        let err = store
            .append("missing", Role::User, "hello", None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RouterError>(),
            Some(RouterError::ConversationNotFound)
        ));
    }

    #[test]
    fn get_unknown_conversation_is_not_found() {
        let store = ConversationStore::new(memory_pool());
        let err = store.get("missing").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RouterError>(),
            Some(RouterError::ConversationNotFound)
        ));
    }

    #[test]
    fn model_label_is_stored_on_assistant_rows_only() {
        let store = ConversationStore::new(memory_pool());
        let (conversation, user_message) = store.create("hi").unwrap();
        assert!(user_message.model_used.is_none());

        store
            .append(&conversation.id, Role::Assistant, "hello back", Some("ChatGPT"))
            .unwrap();
        let messages = store.messages(&conversation.id, None).unwrap();
        assert!(messages[0].model_used.is_none());
        assert_eq!(messages[1].model_used.as_deref(), Some("ChatGPT"));
    }

    #[test]
    fn listing_orders_by_recent_activity() {
        let pool = memory_pool();
        let store = ConversationStore::new(pool.clone());
        let (older, _) = store.create("older chat").unwrap();
        let (newer, _) = store.create("newer chat").unwrap();

        // Force distinct activity times; wall-clock seconds tie in tests.
        {
            let conn = pool.get().unwrap();
            conn.execute(
                "UPDATE conversations SET updated_at = 100 WHERE id = ?1",
                params![older.id],
            )
            .unwrap();
            conn.execute(
                "UPDATE conversations SET updated_at = 200 WHERE id = ?1",
                params![newer.id],
            )
            .unwrap();
        }

        let summaries = store.list(None).unwrap();
        assert_eq!(summaries[0].id, newer.id);
        assert_eq!(summaries[1].id, older.id);
        assert_eq!(summaries[0].message_count, 1);
    }

    #[test]
    fn appends_to_other_conversations_do_not_interleave() {
        let store = ConversationStore::new(memory_pool());
        let (a, _) = store.create("chat a").unwrap();
        let (b, _) = store.create("chat b").unwrap();

        store.append(&a.id, Role::Assistant, "a1", Some("Claude")).unwrap();
        store.append(&b.id, Role::Assistant, "b1", Some("ChatGPT")).unwrap();
        store.append(&a.id, Role::User, "a2", None).unwrap();

        let a_messages = store.messages(&a.id, None).unwrap();
        let bodies: Vec<&str> = a_messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["chat a", "a1", "a2"]);
        assert_eq!(store.messages(&b.id, None).unwrap().len(), 2);
    }

    #[test]
    fn second_turn_for_the_same_conversation_is_rejected() {
        let store = ConversationStore::new(memory_pool());
        let (conversation, _) = store.create("hello").unwrap();

        let guard = store.begin_turn(&conversation.id).unwrap();
        let err = store.begin_turn(&conversation.id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RouterError>(),
            Some(RouterError::TurnInFlight)
        ));

        // Unrelated conversations are not serialised against each other.
        let (other, _) = store.create("other").unwrap();
        let other_guard = store.begin_turn(&other.id).unwrap();
        drop(other_guard);

        drop(guard);
        assert!(store.begin_turn(&conversation.id).is_ok());
    }
}
