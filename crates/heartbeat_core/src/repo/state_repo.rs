//! Pipeline state: per-source observer cursors and installation identity.
//!
//! # Responsibility
//! - Implement the cursor persistence port used by the observer.
//! - Implement the identity provider (owner id + share id).
//!
//! # Invariants
//! - The share id is created once and never rotated.
//! - A cursor is only ever handed back to the source id it was saved for.
//! - Saving a cursor replaces that source's previous one wholesale.

use crate::db::SharedConnection;
use crate::repo::{lock_conn, RepoError, RepoResult};
use crate::source::Cursor;
use log::{info, warn};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

const KEY_SHARE_ID: &str = "identity.share_id";
const KEY_OWNER_ID: &str = "identity.owner_id";
const SHARE_ID_LEN: usize = 8;

/// Persistence port for observer cursors, keyed by the issuing source.
pub trait CursorStore: Send + Sync {
    fn load_cursor(&self, source_id: &str) -> RepoResult<Option<Cursor>>;
    fn save_cursor(&self, source_id: &str, cursor: &Cursor) -> RepoResult<()>;
    /// Forgets the cursor so the next query replays full history.
    fn clear_cursor(&self, source_id: &str) -> RepoResult<()>;
}

/// Supplies the identifiers sink writes are keyed by.
pub trait IdentityProvider: Send + Sync {
    /// Owner id once the external sign-in has completed.
    fn owner_id(&self) -> Option<String>;
    /// Stable public share id, created on first use.
    fn get_or_create_share_id(&self) -> RepoResult<String>;
}

/// SQLite-backed state repository over the `app_state` table.
#[derive(Clone)]
pub struct SqliteStateRepo {
    conn: SharedConnection,
}

impl SqliteStateRepo {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Records the owner id produced by the identity bootstrap.
    pub fn set_owner_id(&self, owner_id: &str) -> RepoResult<()> {
        let normalized = owner_id.trim();
        if normalized.is_empty() {
            return Err(RepoError::InvalidInput("owner id cannot be empty".to_string()));
        }
        self.put_value(KEY_OWNER_ID, normalized)
    }

    /// Forgets the owner id (e.g. after sign-out).
    pub fn clear_owner_id(&self) -> RepoResult<()> {
        self.delete_value(KEY_OWNER_ID)
    }

    /// Source ids with a stored cursor, with that cursor.
    pub fn list_cursors(&self) -> RepoResult<Vec<(String, Cursor)>> {
        let conn = lock_conn(&self.conn);
        let mut stmt =
            conn.prepare("SELECT source_id, token FROM source_cursors ORDER BY source_id;")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, Cursor::new(row.get::<_, String>(1)?)))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Forgets every stored cursor; returns how many were removed.
    pub fn clear_all_cursors(&self) -> RepoResult<usize> {
        let conn = lock_conn(&self.conn);
        let removed = conn.execute("DELETE FROM source_cursors;", [])?;
        if removed > 0 {
            info!(
                "event=cursor_reset module=repo status=ok scope=all removed={}",
                removed
            );
        }
        Ok(removed)
    }

    fn get_value(&self, key: &str) -> RepoResult<Option<String>> {
        let conn = lock_conn(&self.conn);
        let value = conn
            .query_row(
                "SELECT value FROM app_state WHERE key = ?1;",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put_value(&self, key: &str, value: &str) -> RepoResult<()> {
        let conn = lock_conn(&self.conn);
        conn.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = (strftime('%s', 'now') * 1000);",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_value(&self, key: &str) -> RepoResult<()> {
        let conn = lock_conn(&self.conn);
        conn.execute("DELETE FROM app_state WHERE key = ?1;", [key])?;
        Ok(())
    }
}

impl CursorStore for SqliteStateRepo {
    fn load_cursor(&self, source_id: &str) -> RepoResult<Option<Cursor>> {
        let conn = lock_conn(&self.conn);
        let token = conn
            .query_row(
                "SELECT token FROM source_cursors WHERE source_id = ?1;",
                [source_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match token {
            Some(token) if token.is_empty() => Err(RepoError::InvalidData(format!(
                "empty cursor token for source `{source_id}`"
            ))),
            token => Ok(token.map(Cursor::new)),
        }
    }

    fn save_cursor(&self, source_id: &str, cursor: &Cursor) -> RepoResult<()> {
        if source_id.is_empty() {
            return Err(RepoError::InvalidInput("source id cannot be empty".to_string()));
        }
        if cursor.as_str().is_empty() {
            return Err(RepoError::InvalidInput("cursor token cannot be empty".to_string()));
        }
        let conn = lock_conn(&self.conn);
        conn.execute(
            "INSERT INTO source_cursors (source_id, token) VALUES (?1, ?2)
             ON CONFLICT(source_id) DO UPDATE SET
                token = excluded.token,
                updated_at = (strftime('%s', 'now') * 1000);",
            params![source_id, cursor.as_str()],
        )?;
        Ok(())
    }

    fn clear_cursor(&self, source_id: &str) -> RepoResult<()> {
        let conn = lock_conn(&self.conn);
        let removed = conn.execute(
            "DELETE FROM source_cursors WHERE source_id = ?1;",
            [source_id],
        )?;
        if removed > 0 {
            info!(
                "event=cursor_reset module=repo status=ok source={}",
                source_id
            );
        }
        Ok(())
    }
}

impl IdentityProvider for SqliteStateRepo {
    fn owner_id(&self) -> Option<String> {
        match self.get_value(KEY_OWNER_ID) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "event=identity_load module=repo status=error field=owner_id error={}",
                    err
                );
                None
            }
        }
    }

    fn get_or_create_share_id(&self) -> RepoResult<String> {
        let conn = lock_conn(&self.conn);
        let inserted = conn.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO NOTHING;",
            params![KEY_SHARE_ID, new_share_id()],
        )?;
        let share_id: String = conn.query_row(
            "SELECT value FROM app_state WHERE key = ?1;",
            [KEY_SHARE_ID],
            |row| row.get(0),
        )?;
        if !is_valid_share_id(&share_id) {
            return Err(RepoError::InvalidData(format!(
                "invalid share id `{share_id}` in app_state.{KEY_SHARE_ID}"
            )));
        }
        if inserted > 0 {
            info!("event=share_id_created module=repo status=ok");
        }
        Ok(share_id)
    }
}

fn new_share_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(SHARE_ID_LEN);
    id
}

fn is_valid_share_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}
