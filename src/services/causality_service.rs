//! Causality graph reconstruction.
//!
//! Rooted at one ledger version, two recursive walks over `build_pipes`
//! collect every related build: downstream (builds the version fed, and
//! their descendants) and upstream (builds that produced it, and their
//! ancestors). Both walks prune self-feedback through the root resource by
//! requiring a consumed input of a different resource before propagating.

use diesel::prelude::*;
use diesel::sql_types::{Array, BigInt, Jsonb, Text, Varchar};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::Result;
use crate::models::causality::{CausalityBuild, CausalityGraph, CausalityResourceVersion};
use crate::models::resource::Resource;
use crate::models::version::Version;

const DOWNSTREAM_BUILDS_QUERY: &str = r#"
WITH RECURSIVE build_ids AS (
        SELECT DISTINCT i.build_id
            FROM build_resource_config_version_inputs i
            WHERE i.resource_id = $1 AND i.version_md5 = $2
    UNION ALL
        SELECT DISTINCT bp.to_build_id AS build_id
        FROM build_ids bi
        INNER JOIN build_pipes bp ON bi.build_id = bp.from_build_id
        INNER JOIN build_resource_config_version_inputs i ON i.build_id = bi.build_id
        WHERE i.resource_id != $1
)
SELECT build_id FROM build_ids
"#;

const UPSTREAM_BUILDS_QUERY: &str = r#"
WITH RECURSIVE build_ids AS (
        SELECT DISTINCT o.build_id
            FROM build_resource_config_version_outputs o
            WHERE o.resource_id = $1 AND o.version_md5 = $2
    UNION ALL
        SELECT DISTINCT bp.from_build_id AS build_id
        FROM build_ids bi
        INNER JOIN build_pipes bp ON bi.build_id = bp.to_build_id
        INNER JOIN build_resource_config_version_inputs i ON i.build_id = bi.build_id
        WHERE i.resource_id != $1
)
SELECT build_id FROM build_ids
"#;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Direction {
    Downstream,
    Upstream,
}

#[derive(diesel::QueryableByName)]
struct BuildIdRow {
    #[diesel(sql_type = BigInt)]
    build_id: i64,
}

#[derive(Debug, diesel::QueryableByName)]
pub(crate) struct BuildJobRow {
    #[diesel(sql_type = BigInt)]
    pub build_id: i64,
    #[diesel(sql_type = Varchar)]
    pub build_name: String,
    #[diesel(sql_type = BigInt)]
    pub job_id: i64,
    #[diesel(sql_type = Varchar)]
    pub job_name: String,
}

#[derive(Debug, diesel::QueryableByName)]
pub(crate) struct VersionEdgeRow {
    #[diesel(sql_type = BigInt)]
    pub resource_id: i64,
    #[diesel(sql_type = BigInt)]
    pub rcv_id: i64,
    #[diesel(sql_type = Varchar)]
    pub resource_name: String,
    #[diesel(sql_type = Jsonb)]
    pub version: serde_json::Value,
    #[diesel(sql_type = BigInt)]
    pub build_id: i64,
}

#[derive(diesel::QueryableByName)]
struct RootVersionRow {
    #[diesel(sql_type = Jsonb)]
    version: serde_json::Value,
    #[diesel(sql_type = Text)]
    version_md5: String,
}

/// Build the causality graph rooted at a ledger version of this resource.
/// Returns `None` when the version does not exist within the resource's
/// scope.
pub async fn causality(
    conn: &mut AsyncPgConnection,
    resource: &Resource,
    rcv_id: i64,
) -> Result<Option<CausalityGraph>> {
    let Some(scope_id) = resource.resource_config_scope_id else {
        return Ok(None);
    };

    let root_row: Option<RootVersionRow> = diesel::sql_query(
        "SELECT version, version_md5 FROM resource_config_versions \
         WHERE id = $1 AND resource_config_scope_id = $2",
    )
    .bind::<BigInt, _>(rcv_id)
    .bind::<BigInt, _>(scope_id)
    .get_result(conn)
    .await
    .optional()?;

    let Some(root_row) = root_row else {
        return Ok(None);
    };

    let version: Version = serde_json::from_value(root_row.version)?;
    let version_md5 = root_row.version_md5;

    let mut graph = CausalityGraph::seeded(CausalityResourceVersion::new(
        rcv_id,
        resource.id,
        resource.name.clone(),
        version,
    ));

    for (query, direction) in [
        (DOWNSTREAM_BUILDS_QUERY, Direction::Downstream),
        (UPSTREAM_BUILDS_QUERY, Direction::Upstream),
    ] {
        let build_ids: Vec<i64> = diesel::sql_query(query)
            .bind::<BigInt, _>(resource.id)
            .bind::<Text, _>(&version_md5)
            .load::<BuildIdRow>(conn)
            .await?
            .into_iter()
            .map(|row| row.build_id)
            .collect();

        let builds: Vec<BuildJobRow> = diesel::sql_query(
            "SELECT b.id AS build_id, b.name AS build_name, \
                    j.id AS job_id, j.name AS job_name \
             FROM builds b \
             JOIN jobs j ON b.job_id = j.id \
             WHERE b.id = ANY($1)",
        )
        .bind::<Array<BigInt>, _>(build_ids.clone())
        .load(conn)
        .await?;

        let inputs: Vec<VersionEdgeRow> = diesel::sql_query(
            "SELECT r.id AS resource_id, rcv.id AS rcv_id, r.name AS resource_name, \
                    rcv.version, i.build_id \
             FROM build_resource_config_version_inputs i \
             JOIN resources r ON r.id = i.resource_id \
             JOIN resource_config_versions rcv \
                 ON rcv.version_md5 = i.version_md5 \
                 AND rcv.resource_config_scope_id = r.resource_config_scope_id \
             WHERE i.build_id = ANY($1)",
        )
        .bind::<Array<BigInt>, _>(build_ids.clone())
        .load(conn)
        .await?;

        let outputs: Vec<VersionEdgeRow> = diesel::sql_query(
            "SELECT r.id AS resource_id, rcv.id AS rcv_id, r.name AS resource_name, \
                    rcv.version, o.build_id \
             FROM build_resource_config_version_outputs o \
             JOIN resources r ON r.id = o.resource_id \
             JOIN resource_config_versions rcv \
                 ON rcv.version_md5 = o.version_md5 \
                 AND rcv.resource_config_scope_id = r.resource_config_scope_id \
             WHERE o.build_id = ANY($1)",
        )
        .bind::<Array<BigInt>, _>(build_ids.clone())
        .load(conn)
        .await?;

        assemble(&mut graph, builds, inputs, outputs, direction)?;
    }

    Ok(Some(graph))
}

/// Fold one walk's fetched rows into the graph arenas.
///
/// Downstream, an input edge marks the version as feeding the build and an
/// output edge marks the build as producing the version; upstream the
/// attachments run the other way. Version and build nodes are shared across
/// both walks through the arenas, the root included.
pub(crate) fn assemble(
    graph: &mut CausalityGraph,
    builds: Vec<BuildJobRow>,
    inputs: Vec<VersionEdgeRow>,
    outputs: Vec<VersionEdgeRow>,
    direction: Direction,
) -> Result<()> {
    for row in builds {
        graph.builds.entry(row.build_id).or_insert(CausalityBuild {
            id: row.build_id,
            name: row.build_name,
            job_id: row.job_id,
            job_name: row.job_name,
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
    }

    for row in inputs {
        if !graph.builds.contains_key(&row.build_id) {
            // a build without job metadata (e.g. a check build in the pipe
            // chain); nothing to attach the edge to
            tracing::debug!(build_id = row.build_id, "Skipping input edge for unknown build");
            continue;
        }

        let version: Version = serde_json::from_value(row.version)?;
        let rv = graph
            .resource_versions
            .entry(row.rcv_id)
            .or_insert_with(|| {
                CausalityResourceVersion::new(row.rcv_id, row.resource_id, row.resource_name, version)
            });

        match direction {
            Direction::Downstream => rv.input_to.push(row.build_id),
            Direction::Upstream => {
                if let Some(build) = graph.builds.get_mut(&row.build_id) {
                    build.inputs.push(row.rcv_id);
                }
            }
        }
    }

    for row in outputs {
        if !graph.builds.contains_key(&row.build_id) {
            tracing::debug!(build_id = row.build_id, "Skipping output edge for unknown build");
            continue;
        }

        let version: Version = serde_json::from_value(row.version)?;
        let rv = graph
            .resource_versions
            .entry(row.rcv_id)
            .or_insert_with(|| {
                CausalityResourceVersion::new(row.rcv_id, row.resource_id, row.resource_name, version)
            });

        match direction {
            Direction::Downstream => {
                let rcv_id = rv.id;
                if let Some(build) = graph.builds.get_mut(&row.build_id) {
                    build.outputs.push(rcv_id);
                }
            }
            Direction::Upstream => rv.output_of.push(row.build_id),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(pairs: &[(&str, &str)]) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), serde_json::json!(v));
        }
        serde_json::Value::Object(map)
    }

    fn root_graph() -> CausalityGraph {
        let mut root_version = Version::new();
        root_version.insert("ref".to_string(), "v".to_string());
        CausalityGraph::seeded(CausalityResourceVersion::new(
            1,
            100,
            "root-resource".to_string(),
            root_version,
        ))
    }

    // root v is input to B1, which outputs w, which is input to B2, which
    // outputs x: the downstream chain reaches B2 through w and upstream is
    // empty.
    #[test]
    fn downstream_chain_reaches_second_build_through_shared_version() {
        let mut graph = root_graph();

        let builds = vec![
            BuildJobRow {
                build_id: 10,
                build_name: "1".to_string(),
                job_id: 50,
                job_name: "unit".to_string(),
            },
            BuildJobRow {
                build_id: 20,
                build_name: "1".to_string(),
                job_id: 51,
                job_name: "ship".to_string(),
            },
        ];
        let inputs = vec![
            VersionEdgeRow {
                resource_id: 100,
                rcv_id: 1,
                resource_name: "root-resource".to_string(),
                version: version(&[("ref", "v")]),
                build_id: 10,
            },
            VersionEdgeRow {
                resource_id: 101,
                rcv_id: 2,
                resource_name: "artifact".to_string(),
                version: version(&[("ref", "w")]),
                build_id: 20,
            },
        ];
        let outputs = vec![
            VersionEdgeRow {
                resource_id: 101,
                rcv_id: 2,
                resource_name: "artifact".to_string(),
                version: version(&[("ref", "w")]),
                build_id: 10,
            },
            VersionEdgeRow {
                resource_id: 102,
                rcv_id: 3,
                resource_name: "release".to_string(),
                version: version(&[("ref", "x")]),
                build_id: 20,
            },
        ];

        assemble(&mut graph, builds, inputs, outputs, Direction::Downstream).unwrap();

        // root -> B1
        assert_eq!(graph.root().input_to, vec![10]);
        // B1 -> w
        assert_eq!(graph.builds[&10].outputs, vec![2]);
        // w -> B2
        assert_eq!(graph.resource_versions[&2].input_to, vec![20]);
        // B2 -> x
        assert_eq!(graph.builds[&20].outputs, vec![3]);
        // upstream side untouched
        assert!(graph.root().output_of.is_empty());
        assert!(graph.builds[&10].inputs.is_empty());
    }

    #[test]
    fn upstream_attaches_inputs_to_builds_and_producers_to_versions() {
        let mut graph = root_graph();

        let builds = vec![BuildJobRow {
            build_id: 30,
            build_name: "4".to_string(),
            job_id: 52,
            job_name: "bump".to_string(),
        }];
        let inputs = vec![VersionEdgeRow {
            resource_id: 103,
            rcv_id: 7,
            resource_name: "dep".to_string(),
            version: version(&[("ref", "d1")]),
            build_id: 30,
        }];
        let outputs = vec![VersionEdgeRow {
            resource_id: 100,
            rcv_id: 1,
            resource_name: "root-resource".to_string(),
            version: version(&[("ref", "v")]),
            build_id: 30,
        }];

        assemble(&mut graph, builds, inputs, outputs, Direction::Upstream).unwrap();

        assert_eq!(graph.builds[&30].inputs, vec![7]);
        assert_eq!(graph.root().output_of, vec![30]);
        // the root node stayed shared, not duplicated
        assert_eq!(graph.resource_versions.len(), 2);
    }

    #[test]
    fn malformed_stored_version_is_an_error_in_both_passes() {
        let mut graph = root_graph();
        let builds = vec![BuildJobRow {
            build_id: 10,
            build_name: "1".to_string(),
            job_id: 50,
            job_name: "unit".to_string(),
        }];
        let bad = VersionEdgeRow {
            resource_id: 100,
            rcv_id: 9,
            resource_name: "r".to_string(),
            version: serde_json::json!({"ref": {"nested": true}}),
            build_id: 10,
        };

        let err = assemble(&mut graph, builds, Vec::new(), vec![bad], Direction::Downstream);
        assert!(err.is_err());
    }

    #[test]
    fn edges_for_unknown_builds_are_skipped() {
        let mut graph = root_graph();
        let inputs = vec![VersionEdgeRow {
            resource_id: 100,
            rcv_id: 1,
            resource_name: "root-resource".to_string(),
            version: version(&[("ref", "v")]),
            build_id: 999,
        }];

        assemble(&mut graph, Vec::new(), inputs, Vec::new(), Direction::Downstream).unwrap();

        assert!(graph.root().input_to.is_empty());
        assert!(graph.builds.is_empty());
    }
}
