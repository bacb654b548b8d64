//! Causality graph types.
//!
//! The graph is cyclic through shared version nodes, so nodes live in
//! id-keyed arenas and edges are id vectors; the result is a rooted view,
//! never a pointer cycle.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::version::Version;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CausalityResourceVersion {
    pub id: i64,
    pub resource_id: i64,
    pub resource_name: String,
    pub version: Version,
    /// Builds that consumed this version (downstream walk).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input_to: Vec<i64>,
    /// Builds that produced this version (upstream walk).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output_of: Vec<i64>,
}

impl CausalityResourceVersion {
    pub fn new(id: i64, resource_id: i64, resource_name: String, version: Version) -> Self {
        CausalityResourceVersion {
            id,
            resource_id,
            resource_name,
            version,
            input_to: Vec::new(),
            output_of: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CausalityBuild {
    pub id: i64,
    pub name: String,
    pub job_id: i64,
    pub job_name: String,
    /// Versions this build consumed (upstream walk).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<i64>,
    /// Versions this build produced (downstream walk).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<i64>,
}

/// Rooted causality view over the version and build arenas.
#[derive(Debug, Clone, Serialize)]
pub struct CausalityGraph {
    /// The root resource version id; always present in `resource_versions`.
    pub root_id: i64,
    pub resource_versions: BTreeMap<i64, CausalityResourceVersion>,
    pub builds: BTreeMap<i64, CausalityBuild>,
}

impl CausalityGraph {
    pub fn seeded(root: CausalityResourceVersion) -> Self {
        let root_id = root.id;
        let mut resource_versions = BTreeMap::new();
        resource_versions.insert(root_id, root);
        CausalityGraph {
            root_id,
            resource_versions,
            builds: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &CausalityResourceVersion {
        &self.resource_versions[&self.root_id]
    }
}
