//! # Data service
//!
//! ## Responsibility
//! Row storage for `streams`, `reactions`, `messages` and `clips`, filtered
//! selects, and insert notifications through the [`ChangeFeed`].
//!
//! ## Guarantees
//! - Append-only: reactions, messages and clips are never updated or deleted
//! - Every successful insert is published to the `(table, duel_id)` channel
//!   after the row is committed
//! - Messages and clips come back in ascending creation order (row id breaks ties)
//! - Thread-safe: `Send + Sync` via the `DataService` trait
//!
//! ## NOT Responsible For
//! - One-vote-per-user enforcement (no uniqueness constraint on reactions)
//! - Rate limiting (the reaction cooldown lives in the client components)

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{DuelError, Result};
use crate::models::{
    now_ms, Clip, Message, NewClip, NewMessage, NewReaction, Reaction, ReactionKind, Side, Stream,
    Table,
};
use crate::realtime::{ChangeFeed, Record, Subscription};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    id       TEXT PRIMARY KEY NOT NULL,
    title    TEXT NOT NULL,
    platform TEXT NOT NULL,
    url      TEXT NOT NULL,
    is_live  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS reactions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    duel_id          TEXT NOT NULL,
    side             TEXT NOT NULL,              -- left | right
    rtype            TEXT NOT NULL,              -- like | dislike
    user_fingerprint TEXT NOT NULL,
    created_at_ms    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reactions_duel_side ON reactions(duel_id, side);

CREATE TABLE IF NOT EXISTS messages (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    duel_id       TEXT NOT NULL,
    username      TEXT NOT NULL,
    content       TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_duel ON messages(duel_id, created_at_ms);

CREATE TABLE IF NOT EXISTS clips (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    duel_id       TEXT NOT NULL,
    side          TEXT NOT NULL,
    title         TEXT NOT NULL,
    ts_seconds    INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_clips_duel ON clips(duel_id);
"#;

/// The remote data service as seen by the view components.
pub trait DataService: Send + Sync {
    fn list_streams(&self) -> Result<Vec<Stream>>;
    fn get_stream(&self, id: &str) -> Result<Option<Stream>>;
    /// Out-of-band maintenance only; the view components never call this.
    fn upsert_stream(&self, stream: &Stream) -> Result<()>;

    fn insert_reaction(&self, reaction: NewReaction) -> Result<Reaction>;
    fn select_reactions(&self, duel_id: &str, side: Side) -> Result<Vec<Reaction>>;

    fn insert_message(&self, message: NewMessage) -> Result<Message>;
    fn select_messages(&self, duel_id: &str) -> Result<Vec<Message>>;

    fn insert_clip(&self, clip: NewClip) -> Result<Clip>;
    fn select_clips(&self, duel_id: &str) -> Result<Vec<Clip>>;

    /// Insert notifications for one table, filtered on `duel_id`.
    fn subscribe(&self, table: Table, duel_id: &str) -> Subscription;
}

/// SQLite-backed data service with an in-process change feed.
pub struct SqliteService {
    conn: Mutex<Connection>,
    feed: ChangeFeed,
}

impl SqliteService {
    /// Open (or create) a database file.
    pub fn open(path: &Path, feed: ChangeFeed) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "database opened");
        Self::with_connection(conn, feed)
    }

    /// Private in-memory database, mostly for tests and demos.
    pub fn in_memory(feed: ChangeFeed) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, feed)
    }

    fn with_connection(conn: Connection, feed: ChangeFeed) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(SqliteService {
            conn: Mutex::new(conn),
            feed,
        })
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DuelError::Internal("database lock poisoned".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn side_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Side> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: DuelError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn kind_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<ReactionKind> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: DuelError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn stream_from_row(row: &Row<'_>) -> rusqlite::Result<Stream> {
    Ok(Stream {
        id: row.get(0)?,
        title: row.get(1)?,
        platform: row.get(2)?,
        url: row.get(3)?,
        is_live: row.get::<_, i64>(4)? != 0,
    })
}

fn reaction_from_row(row: &Row<'_>) -> rusqlite::Result<Reaction> {
    Ok(Reaction {
        id: row.get(0)?,
        duel_id: row.get(1)?,
        side: side_column(row, 2)?,
        rtype: kind_column(row, 3)?,
        user_fingerprint: row.get(4)?,
        created_at_ms: row.get::<_, i64>(5)? as u64,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        duel_id: row.get(1)?,
        username: row.get(2)?,
        content: row.get(3)?,
        created_at_ms: row.get::<_, i64>(4)? as u64,
    })
}

fn clip_from_row(row: &Row<'_>) -> rusqlite::Result<Clip> {
    Ok(Clip {
        id: row.get(0)?,
        duel_id: row.get(1)?,
        side: side_column(row, 2)?,
        title: row.get(3)?,
        ts_seconds: row.get::<_, i64>(4)? as u64,
        created_at_ms: row.get::<_, i64>(5)? as u64,
    })
}

impl DataService for SqliteService {
    fn list_streams(&self) -> Result<Vec<Stream>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, platform, url, is_live FROM streams ORDER BY title ASC, id ASC",
        )?;
        let rows = stmt.query_map([], stream_from_row)?;
        let out = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    fn get_stream(&self, id: &str) -> Result<Option<Stream>> {
        let conn = self.conn()?;
        let stream = conn
            .query_row(
                "SELECT id, title, platform, url, is_live FROM streams WHERE id = ?1",
                params![id],
                stream_from_row,
            )
            .optional()?;
        Ok(stream)
    }

    fn upsert_stream(&self, stream: &Stream) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO streams (id, title, platform, url, is_live) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                platform = excluded.platform,
                url = excluded.url,
                is_live = excluded.is_live",
            params![stream.id, stream.title, stream.platform, stream.url, stream.is_live as i64],
        )?;
        Ok(())
    }

    fn insert_reaction(&self, new: NewReaction) -> Result<Reaction> {
        let reaction = {
            let conn = self.conn()?;
            let created_at_ms = now_ms();
            conn.execute(
                "INSERT INTO reactions (duel_id, side, rtype, user_fingerprint, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.duel_id,
                    new.side.as_str(),
                    new.rtype.as_str(),
                    new.user_fingerprint,
                    created_at_ms as i64
                ],
            )?;
            Reaction {
                id: conn.last_insert_rowid(),
                duel_id: new.duel_id,
                side: new.side,
                rtype: new.rtype,
                user_fingerprint: new.user_fingerprint,
                created_at_ms,
            }
        };
        self.feed.publish(Record::Reactions(reaction.clone()));
        Ok(reaction)
    }

    fn select_reactions(&self, duel_id: &str, side: Side) -> Result<Vec<Reaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, duel_id, side, rtype, user_fingerprint, created_at_ms
             FROM reactions WHERE duel_id = ?1 AND side = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![duel_id, side.as_str()], reaction_from_row)?;
        let out = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    fn insert_message(&self, new: NewMessage) -> Result<Message> {
        let message = {
            let conn = self.conn()?;
            let created_at_ms = now_ms();
            conn.execute(
                "INSERT INTO messages (duel_id, username, content, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![new.duel_id, new.username, new.content, created_at_ms as i64],
            )?;
            Message {
                id: conn.last_insert_rowid(),
                duel_id: new.duel_id,
                username: new.username,
                content: new.content,
                created_at_ms,
            }
        };
        self.feed.publish(Record::Messages(message.clone()));
        Ok(message)
    }

    fn select_messages(&self, duel_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, duel_id, username, content, created_at_ms
             FROM messages WHERE duel_id = ?1 ORDER BY created_at_ms ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![duel_id], message_from_row)?;
        let out = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    fn insert_clip(&self, new: NewClip) -> Result<Clip> {
        let clip = {
            let conn = self.conn()?;
            let created_at_ms = now_ms();
            conn.execute(
                "INSERT INTO clips (duel_id, side, title, ts_seconds, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.duel_id,
                    new.side.as_str(),
                    new.title,
                    new.ts_seconds as i64,
                    created_at_ms as i64
                ],
            )?;
            Clip {
                id: conn.last_insert_rowid(),
                duel_id: new.duel_id,
                side: new.side,
                title: new.title,
                ts_seconds: new.ts_seconds,
                created_at_ms,
            }
        };
        self.feed.publish(Record::Clips(clip.clone()));
        Ok(clip)
    }

    fn select_clips(&self, duel_id: &str) -> Result<Vec<Clip>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, duel_id, side, title, ts_seconds, created_at_ms
             FROM clips WHERE duel_id = ?1 ORDER BY created_at_ms ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![duel_id], clip_from_row)?;
        let out = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    fn subscribe(&self, table: Table, duel_id: &str) -> Subscription {
        self.feed.subscribe(table, duel_id)
    }
}
