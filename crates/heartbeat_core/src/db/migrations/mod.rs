//! Ordered schema steps for the relay state database.
//!
//! # Responsibility
//! - v1 `app_state`: identity key/value pairs.
//! - v2 `documents`: the local keyed document store the sinks write through.
//! - v3 `source_cursors`: one observer cursor per source id.
//!
//! # Invariants
//! - Steps run in one transaction; a failed step leaves the previous version.
//! - The applied version is mirrored to `PRAGMA user_version`.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::{Connection, Transaction};

struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "app_state",
        sql: include_str!("0001_app_state.sql"),
    },
    Step {
        version: 2,
        name: "documents",
        sql: include_str!("0002_documents.sql"),
    },
    Step {
        version: 3,
        name: "source_cursors",
        sql: include_str!("0003_source_cursors.sql"),
    },
];

/// Schema version this binary writes.
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |step| step.version)
}

/// Schema version recorded in the database.
pub fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?)
}

/// Brings the schema up to [`latest_version`].
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the file was written by a newer binary.
/// - `MigrationFailed` naming the step whose SQL failed.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from = schema_version(conn)?;
    let latest = latest_version();
    if from > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: latest,
        });
    }

    let pending = STEPS.iter().filter(|step| step.version > from);
    let tx = conn.transaction()?;
    let mut applied = 0;
    for step in pending {
        run_step(&tx, step)?;
        applied += 1;
    }
    tx.commit()?;

    if applied > 0 {
        info!(
            "event=db_migrate module=db status=ok from_version={} to_version={} steps={}",
            from, latest, applied
        );
    }
    Ok(())
}

fn run_step(tx: &Transaction<'_>, step: &Step) -> DbResult<()> {
    tx.execute_batch(step.sql)
        .and_then(|()| tx.pragma_update(None, "user_version", step.version))
        .map_err(|source| DbError::MigrationFailed {
            version: step.version,
            name: step.name,
            source,
        })
}
