//! Resources and their decoded configuration.

use chrono::{DateTime, Utc};
use diesel::sql_types::{Bool, Int8, Jsonb, Nullable, Text, Timestamptz, Varchar};
use serde::{Deserialize, Serialize};

use crate::encryption::EncryptionStrategy;
use crate::error::Result;
use crate::models::build::BuildSummary;
use crate::models::version::Version;

/// Resource source configuration, opaque to the engine.
pub type Source = serde_json::Map<String, serde_json::Value>;

/// The decoded `resources.config` blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub check_every: Option<String>,
    #[serde(default)]
    pub check_timeout: Option<String>,
    #[serde(default)]
    pub webhook_token: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// A resource type from the pipeline's versioned resource type chain,
/// serialized into check plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

/// A resource with its pipeline, team, pin, and current-build context.
///
/// Only `active = true` rows load; an inactive resource reads as absent.
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub pipeline_id: i64,
    pub pipeline_name: String,
    pub team_id: i64,
    pub team_name: String,
    pub config: ResourceConfig,
    pub last_check_start_time: Option<DateTime<Utc>>,
    pub last_check_end_time: Option<DateTime<Utc>>,
    pub resource_config_id: Option<i64>,
    pub resource_config_scope_id: Option<i64>,
    pub config_pinned_version: Option<Version>,
    pub api_pinned_version: Option<Version>,
    pub pin_comment: Option<String>,
    pub build_summary: Option<BuildSummary>,
}

impl Resource {
    /// The effective pin: a config pin always overrides an API pin.
    pub fn current_pinned_version(&self) -> Option<&Version> {
        self.config_pinned_version
            .as_ref()
            .or(self.api_pinned_version.as_ref())
    }

    pub fn has_webhook(&self) -> bool {
        self.config
            .webhook_token
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }
}

/// Raw row shape for the resource lookup join.
#[derive(Debug, diesel::QueryableByName)]
pub struct ResourceRow {
    #[diesel(sql_type = Int8)]
    pub id: i64,
    #[diesel(sql_type = Varchar)]
    pub name: String,
    #[diesel(sql_type = Varchar)]
    pub kind: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub config: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub nonce: Option<String>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub last_check_start_time: Option<DateTime<Utc>>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub last_check_end_time: Option<DateTime<Utc>>,
    #[diesel(sql_type = Int8)]
    pub pipeline_id: i64,
    #[diesel(sql_type = Varchar)]
    pub pipeline_name: String,
    #[diesel(sql_type = Int8)]
    pub team_id: i64,
    #[diesel(sql_type = Varchar)]
    pub team_name: String,
    #[diesel(sql_type = Nullable<Int8>)]
    pub resource_config_id: Option<i64>,
    #[diesel(sql_type = Nullable<Int8>)]
    pub resource_config_scope_id: Option<i64>,
    #[diesel(sql_type = Nullable<Jsonb>)]
    pub pinned_version: Option<serde_json::Value>,
    #[diesel(sql_type = Nullable<Text>)]
    pub pin_comment: Option<String>,
    #[diesel(sql_type = Nullable<Bool>)]
    pub pinned_through_config: Option<bool>,
    #[diesel(sql_type = Nullable<Int8>)]
    pub build_id: Option<i64>,
    #[diesel(sql_type = Nullable<Varchar>)]
    pub build_name: Option<String>,
    #[diesel(sql_type = Nullable<Varchar>)]
    pub build_status: Option<String>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub build_start_time: Option<DateTime<Utc>>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub build_end_time: Option<DateTime<Utc>>,
}

impl ResourceRow {
    pub fn into_resource(self, strategy: &dyn EncryptionStrategy) -> Result<Resource> {
        let config = match self.config {
            Some(blob) => {
                let plaintext = strategy.decrypt(&blob, self.nonce.as_deref())?;
                serde_json::from_slice(&plaintext)?
            }
            None => ResourceConfig::default(),
        };

        let (config_pinned_version, api_pinned_version) = match self.pinned_version {
            Some(value) => {
                let version: Version = serde_json::from_value(value)?;
                if self.pinned_through_config.unwrap_or(false) {
                    (Some(version), None)
                } else {
                    (None, Some(version))
                }
            }
            None => (None, None),
        };

        let build_summary = self.build_id.map(|id| BuildSummary {
            id,
            name: self.build_name.unwrap_or_default(),
            status: self.build_status.unwrap_or_default(),
            start_time: self.build_start_time,
            end_time: self.build_end_time,
        });

        Ok(Resource {
            id: self.id,
            name: self.name,
            kind: self.kind,
            pipeline_id: self.pipeline_id,
            pipeline_name: self.pipeline_name,
            team_id: self.team_id,
            team_name: self.team_name,
            config,
            last_check_start_time: self.last_check_start_time,
            last_check_end_time: self.last_check_end_time,
            resource_config_id: self.resource_config_id,
            resource_config_scope_id: self.resource_config_scope_id,
            config_pinned_version,
            api_pinned_version,
            pin_comment: self.pin_comment,
            build_summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::NoEncryption;

    fn row() -> ResourceRow {
        ResourceRow {
            id: 1,
            name: "repo".to_string(),
            kind: "git".to_string(),
            config: Some(r#"{"source":{"uri":"git://x"},"check_every":"30s"}"#.to_string()),
            nonce: None,
            last_check_start_time: None,
            last_check_end_time: None,
            pipeline_id: 2,
            pipeline_name: "main".to_string(),
            team_id: 3,
            team_name: "ops".to_string(),
            resource_config_id: Some(4),
            resource_config_scope_id: Some(5),
            pinned_version: None,
            pin_comment: None,
            pinned_through_config: None,
            build_id: None,
            build_name: None,
            build_status: None,
            build_start_time: None,
            build_end_time: None,
        }
    }

    #[test]
    fn decodes_config_blob() {
        let resource = row().into_resource(&NoEncryption).unwrap();
        assert_eq!(resource.config.check_every.as_deref(), Some("30s"));
        assert_eq!(
            resource.config.source.get("uri").and_then(|v| v.as_str()),
            Some("git://x")
        );
        assert!(!resource.has_webhook());
    }

    #[test]
    fn config_pin_overrides_api_pin() {
        let mut with_config_pin = row();
        with_config_pin.pinned_version = Some(serde_json::json!({"ref": "v1"}));
        with_config_pin.pinned_through_config = Some(true);
        let resource = with_config_pin.into_resource(&NoEncryption).unwrap();

        let pinned = resource.current_pinned_version().unwrap();
        assert_eq!(pinned.get("ref").map(String::as_str), Some("v1"));
        assert!(resource.api_pinned_version.is_none());

        let mut with_api_pin = row();
        with_api_pin.pinned_version = Some(serde_json::json!({"ref": "v2"}));
        with_api_pin.pinned_through_config = Some(false);
        let resource = with_api_pin.into_resource(&NoEncryption).unwrap();
        assert_eq!(
            resource.current_pinned_version().unwrap().get("ref").map(String::as_str),
            Some("v2")
        );
        assert!(resource.config_pinned_version.is_none());
    }
}
