//! Physical connection setup for SQLite.
//!
//! # Responsibility
//! - Configure connection pragmas required by the session/cluster protocol.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON` unless disabled by config.
//! - Every connection carries a busy timeout so concurrent writers wait
//!   instead of failing immediately.

use super::factory::SqliteConnectionFactory;
use super::DbResult;
use log::debug;
use rusqlite::Connection;
use std::time::Duration;

/// Applies factory-level pragmas to a freshly opened connection.
pub fn configure_connection(
    conn: &Connection,
    factory: &SqliteConnectionFactory,
) -> DbResult<()> {
    conn.busy_timeout(Duration::from_millis(factory.busy_timeout_ms))?;
    let fk = if factory.foreign_keys { "ON" } else { "OFF" };
    conn.execute_batch(&format!("PRAGMA foreign_keys = {fk};"))?;

    let mode: String = conn.pragma_update_and_check(
        None,
        "journal_mode",
        factory.journal_mode.as_str(),
        |row| row.get(0),
    )?;
    if let Some(pages) = factory.cache_size {
        conn.execute_batch(&format!("PRAGMA cache_size = {pages};"))?;
    }

    debug!(
        "event=db_configure module=db status=ok journal_mode={} busy_timeout_ms={}",
        mode, factory.busy_timeout_ms
    );
    Ok(())
}
