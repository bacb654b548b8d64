//! Version ledger queries, paged around `check_order`.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Int4, Jsonb};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use crate::error::{EngineError, Result};
use crate::models::version::{
    Bound, Page, Pagination, ResourceVersion, Version, VersionPageRow,
};

// Base query: ledger rows for the resource's scope, with the enabled flag
// computed by the absence of a matching disabled-version row.
const VERSIONS_QUERY: &str = r#"
SELECT v.id, v.version, v.metadata, v.check_order,
    NOT EXISTS (
        SELECT 1
        FROM resource_disabled_versions d
        WHERE v.version_md5 = d.version_md5
        AND r.resource_config_scope_id = v.resource_config_scope_id
        AND r.id = d.resource_id
    ) AS enabled
FROM resource_config_versions v, resources r
WHERE r.id = $1 AND r.resource_config_scope_id = v.resource_config_scope_id
"#;

#[derive(diesel::QueryableByName)]
struct CursorRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

/// List ledger rows for a resource, newest first.
///
/// `filter` is a partial version predicate applied with JSON containment;
/// empty means no filtering. The page anchors on a version id: the `from`
/// case pages toward newer rows (computed ascending, delivered descending),
/// `to` pages toward older rows, and no anchor delivers the latest page.
/// Cursors are set only when strictly newer/older rows exist.
pub async fn versions(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    page: Page,
    filter: &Version,
) -> Result<(Vec<ResourceVersion>, Pagination)> {
    let filter_json = if filter.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::to_value(filter)?
    };

    conn.transaction::<_, EngineError, _>(|conn| {
        async move {
            let rows: Vec<VersionPageRow> = match page.bound {
                Bound::From(anchor) => {
                    diesel::sql_query(format!(
                        "SELECT sub.* FROM ( \
                           {VERSIONS_QUERY} \
                           AND version @> $4 \
                           AND v.check_order >= \
                               (SELECT check_order FROM resource_config_versions WHERE id = $2) \
                           ORDER BY v.check_order ASC \
                           LIMIT $3 \
                         ) sub \
                         ORDER BY sub.check_order DESC"
                    ))
                    .bind::<BigInt, _>(resource_id)
                    .bind::<BigInt, _>(anchor)
                    .bind::<BigInt, _>(page.limit)
                    .bind::<Jsonb, _>(filter_json)
                    .load(conn)
                    .await?
                }
                Bound::To(anchor) => {
                    diesel::sql_query(format!(
                        "{VERSIONS_QUERY} \
                         AND version @> $4 \
                         AND v.check_order <= \
                             (SELECT check_order FROM resource_config_versions WHERE id = $2) \
                         ORDER BY v.check_order DESC \
                         LIMIT $3"
                    ))
                    .bind::<BigInt, _>(resource_id)
                    .bind::<BigInt, _>(anchor)
                    .bind::<BigInt, _>(page.limit)
                    .bind::<Jsonb, _>(filter_json)
                    .load(conn)
                    .await?
                }
                Bound::Latest => {
                    diesel::sql_query(format!(
                        "{VERSIONS_QUERY} \
                         AND version @> $3 \
                         ORDER BY v.check_order DESC \
                         LIMIT $2"
                    ))
                    .bind::<BigInt, _>(resource_id)
                    .bind::<BigInt, _>(page.limit)
                    .bind::<Jsonb, _>(filter_json)
                    .load(conn)
                    .await?
                }
            };

            if rows.is_empty() {
                return Ok((Vec::new(), Pagination::default()));
            }

            let newest_order = rows[0].check_order;
            let oldest_order = rows[rows.len() - 1].check_order;

            let mut resource_versions = Vec::with_capacity(rows.len());
            for row in rows {
                resource_versions.push(row.into_resource_version()?);
            }

            let mut pagination = Pagination::default();

            let older: Option<CursorRow> = diesel::sql_query(
                "SELECT v.id \
                 FROM resource_config_versions v, resources r \
                 WHERE v.check_order < $2 AND r.id = $1 \
                 AND v.resource_config_scope_id = r.resource_config_scope_id \
                 ORDER BY v.check_order DESC \
                 LIMIT 1",
            )
            .bind::<BigInt, _>(resource_id)
            .bind::<Int4, _>(oldest_order)
            .get_result(conn)
            .await
            .optional()?;
            if let Some(row) = older {
                pagination.older = Some(Page::to(row.id, page.limit));
            }

            let newer: Option<CursorRow> = diesel::sql_query(
                "SELECT v.id \
                 FROM resource_config_versions v, resources r \
                 WHERE v.check_order > $2 AND r.id = $1 \
                 AND v.resource_config_scope_id = r.resource_config_scope_id \
                 ORDER BY v.check_order ASC \
                 LIMIT 1",
            )
            .bind::<BigInt, _>(resource_id)
            .bind::<Int4, _>(newest_order)
            .get_result(conn)
            .await
            .optional()?;
            if let Some(row) = newer {
                pagination.newer = Some(Page::from(row.id, page.limit));
            }

            Ok((resource_versions, pagination))
        }
        .scope_boxed()
    })
    .await
}
