//! Resource versions and ledger pagination.

use std::collections::BTreeMap;

use diesel::sql_types::{Bool, Int4, Int8, Jsonb, Nullable, Text};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A resource version as reported by a check: a flat string map.
///
/// `BTreeMap` keeps serialization sorted by key, so
/// `serde_json::to_string(&version)` is the canonical form whose md5 is
/// stored in `version_md5`.
pub type Version = BTreeMap<String, String>;

/// Canonical JSON for a version, matching the database's `md5(...)` input.
pub fn canonical_json(version: &Version) -> Result<String> {
    Ok(serde_json::to_string(version)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// A row of the version ledger, scoped to a resource config scope.
#[derive(Debug, Clone, diesel::QueryableByName)]
pub struct ResourceConfigVersion {
    #[diesel(sql_type = Int8)]
    pub id: i64,
    #[diesel(sql_type = Int8)]
    pub resource_config_scope_id: i64,
    #[diesel(sql_type = Jsonb)]
    pub version: serde_json::Value,
    #[diesel(sql_type = Text)]
    pub version_md5: String,
    #[diesel(sql_type = Nullable<Jsonb>)]
    pub metadata: Option<serde_json::Value>,
    #[diesel(sql_type = Int4)]
    pub check_order: i32,
}

/// A ledger row projected for a specific resource, with its enabled flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceVersion {
    pub id: i64,
    pub version: Version,
    pub metadata: Vec<MetadataField>,
    pub enabled: bool,
    pub check_order: i32,
}

/// Page boundary for ledger queries: at most one of `from`/`to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// The newest page.
    Latest,
    /// Rows at or newer than the version with this id, oldest-first
    /// internally, delivered newest-first.
    From(i64),
    /// Rows at or older than the version with this id.
    To(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub bound: Bound,
    pub limit: i64,
}

impl Page {
    pub fn latest(limit: i64) -> Self {
        Page { bound: Bound::Latest, limit }
    }

    pub fn from(id: i64, limit: i64) -> Self {
        Page { bound: Bound::From(id), limit }
    }

    pub fn to(id: i64, limit: i64) -> Self {
        Page { bound: Bound::To(id), limit }
    }
}

/// Cursors around a delivered page. Set only when strictly newer/older rows
/// exist in the scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    pub newer: Option<Page>,
    pub older: Option<Page>,
}

/// Raw row shape for the paged `versions` query.
#[derive(Debug, diesel::QueryableByName)]
pub struct VersionPageRow {
    #[diesel(sql_type = Int8)]
    pub id: i64,
    #[diesel(sql_type = Jsonb)]
    pub version: serde_json::Value,
    #[diesel(sql_type = Nullable<Jsonb>)]
    pub metadata: Option<serde_json::Value>,
    #[diesel(sql_type = Int4)]
    pub check_order: i32,
    #[diesel(sql_type = Bool)]
    pub enabled: bool,
}

impl VersionPageRow {
    pub fn into_resource_version(self) -> Result<ResourceVersion> {
        let version: Version = serde_json::from_value(self.version)?;
        let metadata = match self.metadata {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        Ok(ResourceVersion {
            id: self.id,
            version,
            metadata,
            enabled: self.enabled,
            check_order: self.check_order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_keys() {
        let mut version = Version::new();
        version.insert("ref".to_string(), "abc123".to_string());
        version.insert("branch".to_string(), "main".to_string());
        assert_eq!(
            canonical_json(&version).unwrap(),
            r#"{"branch":"main","ref":"abc123"}"#
        );
    }

    #[test]
    fn page_row_decodes_metadata() {
        let row = VersionPageRow {
            id: 7,
            version: serde_json::json!({"ref": "v1"}),
            metadata: Some(serde_json::json!([{"name": "commit", "value": "abc"}])),
            check_order: 3,
            enabled: false,
        };
        let rv = row.into_resource_version().unwrap();
        assert_eq!(rv.version.get("ref").map(String::as_str), Some("v1"));
        assert_eq!(rv.metadata.len(), 1);
        assert!(!rv.enabled);
    }

    #[test]
    fn page_row_rejects_non_flat_version() {
        let row = VersionPageRow {
            id: 7,
            version: serde_json::json!({"ref": {"nested": true}}),
            metadata: None,
            check_order: 1,
            enabled: true,
        };
        assert!(row.into_resource_version().is_err());
    }
}
