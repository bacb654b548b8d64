//! Builds, as the resource engine sees them.
//!
//! The build lifecycle is owned by the external build tracker; this engine
//! creates started check builds and completes the ones it runs.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::builds;

pub const CHECK_BUILD_NAME: &str = "check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = builds)]
pub struct Build {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub pipeline_id: Option<i64>,
    pub team_id: i64,
    pub job_id: Option<i64>,
    pub resource_id: Option<i64>,
    pub manually_triggered: bool,
    pub plan: Option<serde_json::Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub completed: bool,
}

/// Denormalized build header carried on a resource row (its current or most
/// recent check build).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildSummary {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_serde() {
        let json = serde_json::to_string(&BuildStatus::Succeeded).unwrap();
        assert_eq!(json, r#""succeeded""#);
        let back: BuildStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BuildStatus::Succeeded);
        assert_eq!(back.as_str(), "succeeded");
    }
}
