//! Database module for colloquy
//!
//! Provides persistence for conversations, turns, synthesized audio and
//! analytics events.

mod schema;

pub use schema::*;

use crate::analytics::{AnalyticsEvent, EventKind};
use crate::voice::AudioClip;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Sequence conflict in {conversation_id}: expected {expected}, got {got}")]
    SequenceConflict {
        conversation_id: String,
        expected: i64,
        got: i64,
    },
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    // A panic while holding the lock cannot leave a half-written turn behind
    // (every write is a single statement or a transaction), so a poisoned
    // mutex is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Conversation Operations ====================

    /// Create a new, empty conversation owned by `user_id`
    pub fn create_conversation(&self, id: &str, user_id: &str) -> DbResult<Conversation> {
        let conn = self.conn();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO conversations (id, user_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id, user_id, now.to_rfc3339()],
        )?;

        Ok(Conversation {
            id: id.to_string(),
            user_id: user_id.to_string(),
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a conversation with its full turn history
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn();
        let (user_id, created_at, updated_at) = conn
            .query_row(
                "SELECT user_id, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::ConversationNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })?;

        let turns = Self::query_turns(&conn, id)?;

        Ok(Conversation {
            id: id.to_string(),
            user_id,
            turns,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        })
    }

    /// List a user's conversations, most recently updated first
    pub fn list_conversations(&self, user_id: &str) -> DbResult<Vec<ConversationSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.user_id, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM turns t WHERE t.conversation_id = c.id),
                    (SELECT COALESCE(MAX(sequence_id), 0) FROM turns t WHERE t.conversation_id = c.id)
             FROM conversations c
             WHERE c.user_id = ?1
             ORDER BY c.updated_at DESC",
        )?;

        let rows = stmt.query_map(params![user_id], |row| {
            Ok(ConversationSummary {
                id: row.get(0)?,
                user_id: row.get(1)?,
                created_at: parse_datetime(&row.get::<_, String>(2)?),
                updated_at: parse_datetime(&row.get::<_, String>(3)?),
                turn_count: row.get(4)?,
                last_sequence: row.get(5)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Ids of conversations whose last turn is a user turn with no reply.
    /// These are left as they are; a new submission is the only way forward.
    pub fn list_unanswered_conversations(&self) -> DbResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.conversation_id FROM turns t
             WHERE t.role = 'user'
               AND t.sequence_id = (SELECT MAX(sequence_id) FROM turns WHERE conversation_id = t.conversation_id)
             ORDER BY t.conversation_id",
        )?;

        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Turn Operations ====================

    /// Append a turn. The sequence number must be exactly one past the
    /// current last sequence; anything else is rejected without writing.
    pub fn append_turn(&self, conversation_id: &str, turn: &NewTurn) -> DbResult<Turn> {
        let mut conn = self.conn();
        let now = Utc::now();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
            params![conversation_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }

        let last: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) FROM turns WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        if turn.sequence != last + 1 {
            return Err(DbError::SequenceConflict {
                conversation_id: conversation_id.to_string(),
                expected: last + 1,
                got: turn.sequence,
            });
        }

        tx.execute(
            "INSERT INTO turns (conversation_id, sequence_id, role, content, provenance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation_id,
                turn.sequence,
                turn.role.to_string(),
                turn.content,
                turn.provenance.map(|p| p.to_string()),
                now.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), conversation_id],
        )?;

        tx.commit()?;

        Ok(Turn {
            conversation_id: conversation_id.to_string(),
            sequence: turn.sequence,
            role: turn.role,
            content: turn.content.clone(),
            provenance: turn.provenance,
            created_at: now,
        })
    }

    /// Get turns for a conversation in sequence order
    #[allow(dead_code)] // Used in tests
    pub fn get_turns(&self, conversation_id: &str) -> DbResult<Vec<Turn>> {
        let conn = self.conn();
        Self::query_turns(&conn, conversation_id)
    }

    fn query_turns(conn: &Connection, conversation_id: &str) -> DbResult<Vec<Turn>> {
        let mut stmt = conn.prepare(
            "SELECT conversation_id, sequence_id, role, content, provenance, created_at
             FROM turns WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], parse_turn_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Get the last sequence ID for a conversation
    #[allow(dead_code)] // Used in tests
    pub fn get_last_sequence_id(&self, conversation_id: &str) -> DbResult<i64> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) FROM turns WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }

    // ==================== Audio Operations ====================

    /// Store synthesized audio for a turn, replacing any earlier clip
    pub fn save_audio(&self, conversation_id: &str, sequence: i64, clip: &AudioClip) -> DbResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO turn_audio (conversation_id, sequence_id, media_type, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation_id,
                sequence,
                clip.media_type,
                clip.data,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_audio(&self, conversation_id: &str, sequence: i64) -> DbResult<Option<AudioClip>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT media_type, data FROM turn_audio WHERE conversation_id = ?1 AND sequence_id = ?2",
            params![conversation_id, sequence],
            |row| {
                Ok(AudioClip {
                    media_type: row.get(0)?,
                    data: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(DbError::from)
    }

    // ==================== Analytics Operations ====================

    pub fn insert_analytics_event(&self, event: &AnalyticsEvent) -> DbResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO analytics_events (user_id, conversation_id, kind, sequence_id, latency_ms, retryable, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.user_id,
                event.conversation_id,
                event.kind.to_string(),
                event.sequence,
                i64::try_from(event.latency_ms).unwrap_or(i64::MAX),
                event.retryable,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Analytics events recorded for a conversation, oldest first
    #[allow(dead_code)] // Used in tests
    pub fn get_analytics_events(&self, conversation_id: &str) -> DbResult<Vec<AnalyticsEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT user_id, conversation_id, kind, sequence_id, latency_ms, retryable, recorded_at
             FROM analytics_events WHERE conversation_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok(AnalyticsEvent {
                user_id: row.get(0)?,
                conversation_id: row.get(1)?,
                kind: parse_event_kind(&row.get::<_, String>(2)?),
                sequence: row.get(3)?,
                latency_ms: u64::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
                retryable: row.get(5)?,
                timestamp: parse_datetime(&row.get::<_, String>(6)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

/// Parse a turn row from the database
fn parse_turn_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    Ok(Turn {
        conversation_id: row.get(0)?,
        sequence: row.get(1)?,
        role: parse_role(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        provenance: row
            .get::<_, Option<String>>(4)?
            .map(|p| parse_provenance(&p)),
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_role(s: &str) -> Role {
    match s {
        "assistant" => Role::Assistant,
        _ => Role::User,
    }
}

fn parse_provenance(s: &str) -> Provenance {
    match s {
        "voice" => Provenance::Voice,
        _ => Provenance::Text,
    }
}

fn parse_event_kind(s: &str) -> EventKind {
    match s {
        "message_failed" => EventKind::MessageFailed,
        "voice_used" => EventKind::VoiceUsed,
        _ => EventKind::MessageSent,
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
