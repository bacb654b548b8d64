//! Ledger write path: appending discovered versions to a config scope.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Jsonb, Text};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use crate::error::{EngineError, Result};
use crate::models::version::{canonical_json, MetadataField, Version};
use crate::schema::resource_config_scopes;

/// Append discovered versions to a scope's ledger, in slice order.
///
/// Inserts are idempotent on `(scope, version_md5)`. Every saved version is
/// bumped to `max(check_order) + 1`, so new versions extend the ledger and a
/// re-discovered old version moves to the newest position; the last input
/// ends up newest. Returns how many versions were processed.
pub async fn save_versions(
    conn: &mut AsyncPgConnection,
    scope_id: i64,
    versions: &[(Version, Vec<MetadataField>)],
) -> Result<usize> {
    conn.transaction::<_, EngineError, _>(|conn| {
        async move {
            for (version, metadata) in versions {
                let canonical = canonical_json(version)?;

                diesel::sql_query(
                    "INSERT INTO resource_config_versions \
                         (resource_config_scope_id, version, version_md5, metadata, check_order) \
                     VALUES ($1, $2, md5($3), $4, 0) \
                     ON CONFLICT (resource_config_scope_id, version_md5) DO NOTHING",
                )
                .bind::<BigInt, _>(scope_id)
                .bind::<Jsonb, _>(serde_json::to_value(version)?)
                .bind::<Text, _>(&canonical)
                .bind::<Jsonb, _>(serde_json::to_value(metadata)?)
                .execute(conn)
                .await?;

                // New rows start at 0; re-discovered rows sit below the
                // current maximum. Both move to the newest position.
                diesel::sql_query(
                    "UPDATE resource_config_versions \
                     SET check_order = mc.co + 1 \
                     FROM (SELECT COALESCE(MAX(check_order), 0) AS co \
                           FROM resource_config_versions \
                           WHERE resource_config_scope_id = $1) mc \
                     WHERE resource_config_scope_id = $1 \
                     AND version_md5 = md5($2) \
                     AND check_order <= mc.co",
                )
                .bind::<BigInt, _>(scope_id)
                .bind::<Text, _>(&canonical)
                .execute(conn)
                .await?;

                if !metadata.is_empty() {
                    diesel::sql_query(
                        "UPDATE resource_config_versions SET metadata = $1 \
                         WHERE resource_config_scope_id = $2 AND version_md5 = md5($3)",
                    )
                    .bind::<Jsonb, _>(serde_json::to_value(metadata)?)
                    .bind::<BigInt, _>(scope_id)
                    .bind::<Text, _>(&canonical)
                    .execute(conn)
                    .await?;
                }
            }

            Ok(versions.len())
        }
        .scope_boxed()
    })
    .await
}

#[derive(diesel::QueryableByName)]
struct LatestVersionRow {
    #[diesel(sql_type = Jsonb)]
    version: serde_json::Value,
}

/// The newest version in a scope, by `check_order`.
pub async fn latest_version(
    conn: &mut AsyncPgConnection,
    scope_id: i64,
) -> Result<Option<Version>> {
    let row: Option<LatestVersionRow> = diesel::sql_query(
        "SELECT version FROM resource_config_versions \
         WHERE resource_config_scope_id = $1 \
         ORDER BY check_order DESC \
         LIMIT 1",
    )
    .bind::<BigInt, _>(scope_id)
    .get_result(conn)
    .await
    .optional()?;

    match row {
        Some(row) => Ok(Some(serde_json::from_value(row.version)?)),
        None => Ok(None),
    }
}

pub async fn update_last_check_start_time(
    conn: &mut AsyncPgConnection,
    scope_id: i64,
    time: DateTime<Utc>,
) -> Result<()> {
    diesel::update(resource_config_scopes::table.find(scope_id))
        .set(resource_config_scopes::last_check_start_time.eq(time))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn update_last_check_end_time(
    conn: &mut AsyncPgConnection,
    scope_id: i64,
    time: DateTime<Utc>,
) -> Result<()> {
    diesel::update(resource_config_scopes::table.find(scope_id))
        .set(resource_config_scopes::last_check_end_time.eq(time))
        .execute(conn)
        .await?;
    Ok(())
}
