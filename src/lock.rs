//! Session-level advisory locks.
//!
//! Acquire and release must happen on the same pooled connection; callers
//! hold the connection for the lock's whole lifetime.

use diesel::sql_types::{BigInt, Bool};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::Result;

/// Cluster-wide lock taken while installing watch triggers. Losers proceed
/// assuming the triggers exist.
pub const CREATE_WATCH_TRIGGERS_LOCK_ID: i64 = 0x43575452; // "CWTR"

#[derive(diesel::QueryableByName)]
struct LockRow {
    #[diesel(sql_type = Bool)]
    acquired: bool,
}

/// Try to take the advisory lock; `false` means another holder has it.
pub async fn try_acquire(conn: &mut AsyncPgConnection, lock_id: i64) -> Result<bool> {
    let row: LockRow = diesel::sql_query("SELECT pg_try_advisory_lock($1) AS acquired")
        .bind::<BigInt, _>(lock_id)
        .get_result(conn)
        .await?;
    Ok(row.acquired)
}

/// Release a lock taken on this connection.
pub async fn release(conn: &mut AsyncPgConnection, lock_id: i64) -> Result<()> {
    diesel::sql_query("SELECT pg_advisory_unlock($1)")
        .bind::<BigInt, _>(lock_id)
        .execute(conn)
        .await?;
    Ok(())
}
