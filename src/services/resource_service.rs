//! Resource store operations.
//!
//! Every mutating operation runs in a single transaction and, on success,
//! bumps `schedule_requested` for each job consuming the resource so the
//! scheduler picks up the change.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Jsonb, Text};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use crate::bus::NotificationBus;
use crate::encryption::EncryptionStrategy;
use crate::error::{EngineError, Result};
use crate::models::resource::{Resource, ResourceRow, Source, VersionedResourceType};
use crate::models::version::{canonical_json, MetadataField, ResourceConfigVersion, Version};
use crate::schema::{job_inputs, jobs, resource_pins};

const RESOURCE_QUERY: &str = r#"
SELECT r.id, r.name, r.type AS kind, r.config, r.nonce,
       rs.last_check_start_time, rs.last_check_end_time,
       r.pipeline_id, p.name AS pipeline_name,
       t.id AS team_id, t.name AS team_name,
       r.resource_config_id, r.resource_config_scope_id,
       rp.version AS pinned_version, rp.comment_text AS pin_comment,
       rp.config AS pinned_through_config,
       b.id AS build_id, b.name AS build_name, b.status AS build_status,
       b.start_time AS build_start_time, b.end_time AS build_end_time
FROM resources r
JOIN pipelines p ON p.id = r.pipeline_id
JOIN teams t ON t.id = p.team_id
LEFT JOIN builds b ON b.id = r.build_id
LEFT JOIN resource_config_scopes rs ON rs.id = r.resource_config_scope_id
LEFT JOIN resource_pins rp ON rp.resource_id = r.id
WHERE r.active AND r.id = $1
"#;

/// Load an active resource with its pipeline, team, pin, and build context.
pub async fn get_resource(
    conn: &mut AsyncPgConnection,
    strategy: &dyn EncryptionStrategy,
    resource_id: i64,
) -> Result<Option<Resource>> {
    let row: Option<ResourceRow> = diesel::sql_query(RESOURCE_QUERY)
        .bind::<BigInt, _>(resource_id)
        .get_result(conn)
        .await
        .optional()?;

    match row {
        Some(row) => Ok(Some(row.into_resource(strategy)?)),
        None => Ok(None),
    }
}

/// Re-read the resource row. Returns `false` when the row is gone, which is
/// not an error.
pub async fn reload(
    conn: &mut AsyncPgConnection,
    strategy: &dyn EncryptionStrategy,
    resource: &mut Resource,
) -> Result<bool> {
    match get_resource(conn, strategy, resource.id).await? {
        Some(fresh) => {
            *resource = fresh;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Point the resource at a config and scope. The update is conditional: it
/// only writes (and only bumps downstream jobs) when the current pointers
/// are unset or differ.
pub async fn set_resource_config_scope(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    resource_config_id: i64,
    scope_id: i64,
) -> Result<()> {
    conn.transaction::<_, EngineError, _>(|conn| {
        async move {
            let affected = diesel::sql_query(
                "UPDATE resources \
                 SET resource_config_id = $1, resource_config_scope_id = $2 \
                 WHERE id = $3 \
                 AND (resource_config_id IS NULL OR resource_config_scope_id IS NULL \
                      OR resource_config_id != $1 OR resource_config_scope_id != $2)",
            )
            .bind::<BigInt, _>(resource_config_id)
            .bind::<BigInt, _>(scope_id)
            .bind::<BigInt, _>(resource_id)
            .execute(conn)
            .await?;

            if affected > 0 {
                request_schedule_for_jobs_using_resource(conn, resource_id).await?;
            }

            Ok(())
        }
        .scope_boxed()
    })
    .await
}

/// Interning a config directly through a resource is not supported; scopes
/// are produced elsewhere and attached via [`set_resource_config_scope`].
pub async fn set_resource_config(
    _conn: &mut AsyncPgConnection,
    _resource_id: i64,
    _source: &Source,
    _resource_types: &[VersionedResourceType],
) -> Result<i64> {
    Err(EngineError::Unsupported("set resource config"))
}

#[derive(diesel::QueryableByName)]
struct PinnedRow {
    #[diesel(sql_type = Bool)]
    pinned: bool,
}

/// Pin the resource to a ledger version.
///
/// Fails with `PinnedThroughConfig` when the pin is config-owned. Returns
/// `false` when the version id does not resolve to a pin row.
pub async fn pin_version(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    rcv_id: i64,
) -> Result<bool> {
    conn.transaction::<_, EngineError, _>(|conn| {
        async move {
            let row: PinnedRow = diesel::sql_query(
                "SELECT EXISTS ( \
                   SELECT 1 FROM resource_pins WHERE resource_id = $1 AND config \
                 ) AS pinned",
            )
            .bind::<BigInt, _>(resource_id)
            .get_result(conn)
            .await?;

            if row.pinned {
                return Err(EngineError::PinnedThroughConfig);
            }

            let affected = diesel::sql_query(
                "INSERT INTO resource_pins (resource_id, version, comment_text, config) \
                 VALUES ($1, \
                     (SELECT rcv.version FROM resource_config_versions rcv WHERE rcv.id = $2), \
                     '', false) \
                 ON CONFLICT (resource_id) DO UPDATE SET version = EXCLUDED.version",
            )
            .bind::<BigInt, _>(resource_id)
            .bind::<BigInt, _>(rcv_id)
            .execute(conn)
            .await?;

            if affected != 1 {
                return Ok(false);
            }

            request_schedule_for_jobs_using_resource(conn, resource_id).await?;

            Ok(true)
        }
        .scope_boxed()
    })
    .await
}

/// Remove the API pin. Exactly one row must go away.
pub async fn unpin_version(conn: &mut AsyncPgConnection, resource_id: i64) -> Result<()> {
    conn.transaction::<_, EngineError, _>(|conn| {
        async move {
            let affected = diesel::delete(
                resource_pins::table.filter(resource_pins::resource_id.eq(resource_id)),
            )
            .execute(conn)
            .await?;

            if affected != 1 {
                return Err(EngineError::NonOneRowAffected(affected));
            }

            request_schedule_for_jobs_using_resource(conn, resource_id).await?;

            Ok(())
        }
        .scope_boxed()
    })
    .await
}

/// Update the pin comment, if a pin exists.
pub async fn set_pin_comment(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    comment: &str,
) -> Result<()> {
    diesel::update(resource_pins::table.filter(resource_pins::resource_id.eq(resource_id)))
        .set(resource_pins::comment_text.eq(comment))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn enable_version(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    rcv_id: i64,
) -> Result<()> {
    toggle_version(conn, resource_id, rcv_id, true).await
}

pub async fn disable_version(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    rcv_id: i64,
) -> Result<()> {
    toggle_version(conn, resource_id, rcv_id, false).await
}

async fn toggle_version(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    rcv_id: i64,
    enable: bool,
) -> Result<()> {
    conn.transaction::<_, EngineError, _>(|conn| {
        async move {
            let affected = if enable {
                diesel::sql_query(
                    "DELETE FROM resource_disabled_versions \
                     WHERE resource_id = $1 \
                     AND version_md5 = \
                         (SELECT version_md5 FROM resource_config_versions rcv WHERE rcv.id = $2)",
                )
                .bind::<BigInt, _>(resource_id)
                .bind::<BigInt, _>(rcv_id)
                .execute(conn)
                .await?
            } else {
                diesel::sql_query(
                    "INSERT INTO resource_disabled_versions (resource_id, version_md5) \
                     SELECT $1, rcv.version_md5 \
                     FROM resource_config_versions rcv \
                     WHERE rcv.id = $2",
                )
                .bind::<BigInt, _>(resource_id)
                .bind::<BigInt, _>(rcv_id)
                .execute(conn)
                .await?
            };

            if affected != 1 {
                return Err(EngineError::NonOneRowAffected(affected));
            }

            request_schedule_for_jobs_using_resource(conn, resource_id).await?;

            Ok(())
        }
        .scope_boxed()
    })
    .await
}

/// Update a ledger row's metadata, matched by the canonical version hash.
/// Returns `true` when a row matched. The version payload itself is
/// immutable.
pub async fn update_metadata(
    conn: &mut AsyncPgConnection,
    resource: &Resource,
    version: &Version,
    metadata: &[MetadataField],
) -> Result<bool> {
    let Some(scope_id) = resource.resource_config_scope_id else {
        return Ok(false);
    };

    let affected = diesel::sql_query(
        "UPDATE resource_config_versions SET metadata = $1 \
         WHERE resource_config_scope_id = $2 AND version_md5 = md5($3)",
    )
    .bind::<Jsonb, _>(serde_json::to_value(metadata)?)
    .bind::<BigInt, _>(scope_id)
    .bind::<Text, _>(canonical_json(version)?)
    .execute(conn)
    .await?;

    Ok(affected > 0)
}

/// Find a ledger row by version payload within the resource's scope.
pub async fn find_version(
    conn: &mut AsyncPgConnection,
    resource: &Resource,
    version: &Version,
) -> Result<Option<ResourceConfigVersion>> {
    let Some(scope_id) = resource.resource_config_scope_id else {
        return Ok(None);
    };

    let row = diesel::sql_query(
        "SELECT v.id, v.resource_config_scope_id, v.version, v.version_md5, \
                v.metadata, v.check_order \
         FROM resource_config_versions v \
         WHERE v.resource_config_scope_id = $1 AND v.version_md5 = md5($2)",
    )
    .bind::<BigInt, _>(scope_id)
    .bind::<Text, _>(canonical_json(version)?)
    .get_result(conn)
    .await
    .optional()?;

    Ok(row)
}

/// Evict worker caches for the resource's config, optionally narrowed to one
/// version. Returns the number of cache rows removed.
pub async fn clear_resource_cache(
    conn: &mut AsyncPgConnection,
    resource: &Resource,
    version: Option<&Version>,
) -> Result<usize> {
    let Some(resource_config_id) = resource.resource_config_id else {
        return Ok(0);
    };

    conn.transaction::<_, EngineError, _>(|conn| {
        async move {
            let deleted = match version {
                Some(version) => {
                    diesel::sql_query(
                        "DELETE FROM worker_resource_caches WHERE resource_cache_id IN ( \
                           SELECT id FROM resource_caches \
                           WHERE resource_config_id = $1 AND version_md5 = md5($2))",
                    )
                    .bind::<BigInt, _>(resource_config_id)
                    .bind::<Text, _>(canonical_json(version)?)
                    .execute(conn)
                    .await?
                }
                None => {
                    diesel::sql_query(
                        "DELETE FROM worker_resource_caches WHERE resource_cache_id IN ( \
                           SELECT id FROM resource_caches WHERE resource_config_id = $1)",
                    )
                    .bind::<BigInt, _>(resource_config_id)
                    .execute(conn)
                    .await?
                }
            };

            Ok(deleted)
        }
        .scope_boxed()
    })
    .await
}

/// Wake any scanner watching this resource.
pub async fn notify_scan(bus: &NotificationBus, resource_id: i64) -> Result<()> {
    bus.notify(&scan_channel(resource_id), "").await
}

/// Bus channel carrying scan wake-up hints for one resource.
pub fn scan_channel(resource_id: i64) -> String {
    format!("resource_scan_{resource_id}")
}

/// Mark every job consuming this resource as needing scheduling.
///
/// Jobs are updated one row at a time in descending id order. A multi-row
/// UPDATE driven by a subquery does not preserve order and can deadlock
/// against writers that scan ascending.
pub async fn request_schedule_for_jobs_using_resource(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
) -> Result<()> {
    let job_ids: Vec<i64> = job_inputs::table
        .filter(job_inputs::resource_id.eq(resource_id))
        .select(job_inputs::job_id)
        .distinct()
        .order(job_inputs::job_id.desc())
        .load(conn)
        .await?;

    let bumped = job_ids.len();
    for job_id in job_ids {
        diesel::update(jobs::table.find(job_id))
            .set(jobs::schedule_requested.eq(diesel::dsl::now))
            .execute(conn)
            .await?;
    }

    crate::metrics::schedule_requested(bumped);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_channel_embeds_resource_id() {
        assert_eq!(scan_channel(42), "resource_scan_42");
    }
}
