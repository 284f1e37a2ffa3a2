//! Keyed JSON document store mirroring the remote realtime database.
//!
//! # Responsibility
//! - Store one JSON document per slash-separated path with replace semantics.
//! - Enumerate the children of a path in numeric key order.
//!
//! # Invariants
//! - `set` on an existing path overwrites it (last write wins).
//! - Children are ordered by `(length(name), name)`, which equals numeric
//!   order for unpadded non-negative decimal keys.

use crate::db::SharedConnection;
use crate::pipeline::sink::{DocumentBackend, SinkError};
use crate::repo::{lock_conn, RepoError, RepoResult};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

/// Listing options for [`SqliteDocumentRepo::list_children`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildListQuery {
    pub limit: Option<u32>,
    pub newest_first: bool,
}

/// SQLite-backed document repository over the `documents` table.
#[derive(Clone)]
pub struct SqliteDocumentRepo {
    conn: SharedConnection,
}

impl SqliteDocumentRepo {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Writes (or overwrites) the document at `path`.
    pub fn set(&self, path: &str, body: &Value) -> RepoResult<()> {
        let (parent, name) = split_path(path)?;
        let body = serde_json::to_string(body)
            .map_err(|err| RepoError::InvalidInput(format!("unserializable document: {err}")))?;
        let conn = lock_conn(&self.conn);
        conn.execute(
            "INSERT INTO documents (path, parent, name, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET
                body = excluded.body,
                updated_at = (strftime('%s', 'now') * 1000);",
            params![path, parent, name, body],
        )?;
        Ok(())
    }

    /// Reads the document at `path`.
    pub fn get(&self, path: &str) -> RepoResult<Option<Value>> {
        let conn = lock_conn(&self.conn);
        let body = conn
            .query_row(
                "SELECT body FROM documents WHERE path = ?1;",
                [path],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        body.map(|raw| parse_body(path, &raw)).transpose()
    }

    /// Lists `(name, document)` pairs directly under `parent`.
    pub fn list_children(
        &self,
        parent: &str,
        query: &ChildListQuery,
    ) -> RepoResult<Vec<(String, Value)>> {
        let order = if query.newest_first { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT name, body FROM documents
             WHERE parent = ?1
             ORDER BY length(name) {order}, name {order}
             LIMIT ?2;"
        );
        let limit = query.limit.map_or(-1, i64::from);

        let conn = lock_conn(&self.conn);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![parent, limit])?;
        let mut children = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let raw: String = row.get(1)?;
            let value = parse_body(&format!("{parent}/{name}"), &raw)?;
            children.push((name, value));
        }
        Ok(children)
    }

    /// Counts documents directly under `parent`.
    pub fn count_children(&self, parent: &str) -> RepoResult<u64> {
        let conn = lock_conn(&self.conn);
        let count = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE parent = ?1;",
            [parent],
            |row| row.get::<_, i64>(0),
        )?;
        u64::try_from(count)
            .map_err(|_| RepoError::InvalidData(format!("negative child count {count}")))
    }
}

#[async_trait]
impl DocumentBackend for SqliteDocumentRepo {
    async fn set_document(&self, path: &str, body: &Value) -> Result<(), SinkError> {
        self.set(path, body)
            .map_err(|err| SinkError::Backend(err.to_string()))
    }
}

fn split_path(path: &str) -> RepoResult<(&str, &str)> {
    match path.rsplit_once('/') {
        Some((parent, name)) if !parent.is_empty() && !name.is_empty() => Ok((parent, name)),
        _ => Err(RepoError::InvalidInput(format!(
            "document path `{path}` must be `<parent>/<name>`"
        ))),
    }
}

fn parse_body(path: &str, raw: &str) -> RepoResult<Value> {
    serde_json::from_str(raw)
        .map_err(|err| RepoError::InvalidData(format!("document `{path}` is not valid JSON: {err}")))
}
