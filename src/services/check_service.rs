//! Check build coordination: plan construction and at-most-one in-flight
//! check build per resource.

use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};

use crate::bus::NotificationBus;
use crate::error::{EngineError, Result};
use crate::models::build::{Build, BuildStatus, CHECK_BUILD_NAME};
use crate::models::resource::{Resource, Source, VersionedResourceType};
use crate::models::version::Version;
use crate::schema::{builds, resources};

/// Channel signalling the build tracker that a new build exists.
pub const BUILD_TRACKER_CHANNEL: &str = "build_tracker";

/// The payload a check build executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPlan {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<Version>,
    pub interval: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<VersionedResourceType>,
    pub resource: String,
}

/// Build the check plan for a resource. Pure; no side effects.
///
/// `source_defaults` merge under the resource's own source, which wins on
/// conflicts. The resource type chain is serialized into the plan so the
/// worker can resolve custom types without another lookup.
pub fn check_plan(
    resource: &Resource,
    from_version: Option<Version>,
    interval: chrono::Duration,
    resource_types: &[VersionedResourceType],
    source_defaults: &Source,
) -> CheckPlan {
    let mut source = source_defaults.clone();
    for (key, value) in resource.config.source.clone() {
        source.insert(key, value);
    }

    CheckPlan {
        name: resource.name.clone(),
        kind: resource.kind.clone(),
        source,
        tags: resource.config.tags.clone(),
        timeout: resource.config.check_timeout.clone().unwrap_or_default(),
        from_version,
        interval: format_interval(interval),
        resource_types: resource_types.to_vec(),
        resource: resource.name.clone(),
    }
}

pub fn format_interval(interval: chrono::Duration) -> String {
    format!("{}s", interval.num_seconds())
}

/// Create a started check build for the resource.
///
/// Unless manually triggered, the create is suppressed (returns `None`) when
/// the resource's last build exists and is not completed. Concurrent creates
/// serialize through the transaction and the `resources.build_id` update.
/// The post-commit tracker notification is best effort: its failure is
/// surfaced, but the build is already durable.
pub async fn create_build(
    conn: &mut AsyncPgConnection,
    bus: &NotificationBus,
    resource: &Resource,
    manually_triggered: bool,
    plan: &CheckPlan,
) -> Result<Option<Build>> {
    let plan_value = serde_json::to_value(plan)?;
    let resource_id = resource.id;
    let pipeline_id = resource.pipeline_id;
    let team_id = resource.team_id;

    let created = conn
        .transaction::<_, EngineError, _>(|conn| {
            async move {
                if !manually_triggered {
                    let last_completed: Option<bool> = builds::table
                        .filter(builds::resource_id.eq(resource_id))
                        .order(builds::id.desc())
                        .select(builds::completed)
                        .first(conn)
                        .await
                        .optional()?;

                    if last_completed == Some(false) {
                        // a build is already running; leave it be
                        return Ok(None);
                    }
                }

                let build: Build = diesel::insert_into(builds::table)
                    .values((
                        builds::name.eq(CHECK_BUILD_NAME),
                        builds::status.eq(BuildStatus::Started.as_str()),
                        builds::pipeline_id.eq(pipeline_id),
                        builds::team_id.eq(team_id),
                        builds::resource_id.eq(resource_id),
                        builds::manually_triggered.eq(manually_triggered),
                        builds::plan.eq(plan_value),
                        builds::start_time.eq(diesel::dsl::now
                            .into_sql::<diesel::sql_types::Timestamptz>()
                            .nullable()),
                        builds::completed.eq(false),
                    ))
                    .returning(Build::as_returning())
                    .get_result(conn)
                    .await?;

                diesel::update(resources::table.find(resource_id))
                    .set(resources::build_id.eq(build.id))
                    .execute(conn)
                    .await?;

                Ok(Some(build))
            }
            .scope_boxed()
        })
        .await?;

    let Some(build) = created else {
        crate::metrics::check_build_suppressed();
        return Ok(None);
    };

    crate::metrics::check_build_created(if manually_triggered { "manual" } else { "auto" });
    tracing::info!(
        build_id = build.id,
        resource_id,
        manually_triggered,
        "Check build created"
    );

    bus.notify(BUILD_TRACKER_CHANNEL, "").await?;

    let build = builds::table
        .find(build.id)
        .select(Build::as_select())
        .first(conn)
        .await?;

    Ok(Some(build))
}

/// Complete a build with a terminal status.
pub async fn finish_build(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    status: BuildStatus,
) -> Result<()> {
    diesel::update(builds::table.find(build_id))
        .set((
            builds::status.eq(status.as_str()),
            builds::end_time.eq(diesel::dsl::now
                .into_sql::<diesel::sql_types::Timestamptz>()
                .nullable()),
            builds::completed.eq(true),
        ))
        .execute(conn)
        .await?;

    tracing::info!(build_id, status = status.as_str(), "Build finished");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::NoEncryption;
    use crate::models::resource::ResourceRow;

    fn resource_with_config(config: &str) -> Resource {
        ResourceRow {
            id: 1,
            name: "repo".to_string(),
            kind: "git".to_string(),
            config: Some(config.to_string()),
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
        .into_resource(&NoEncryption)
        .unwrap()
    }

    #[test]
    fn resource_source_wins_over_defaults() {
        let resource = resource_with_config(
            r#"{"source":{"uri":"git://theirs","branch":"main"},"check_timeout":"5m"}"#,
        );
        let mut defaults = Source::new();
        defaults.insert("uri".to_string(), serde_json::json!("git://defaults"));
        defaults.insert("depth".to_string(), serde_json::json!(1));

        let plan = check_plan(&resource, None, chrono::Duration::seconds(60), &[], &defaults);

        assert_eq!(plan.source.get("uri"), Some(&serde_json::json!("git://theirs")));
        assert_eq!(plan.source.get("depth"), Some(&serde_json::json!(1)));
        assert_eq!(plan.source.get("branch"), Some(&serde_json::json!("main")));
        assert_eq!(plan.timeout, "5m");
        assert_eq!(plan.interval, "60s");
        assert_eq!(plan.resource, "repo");
    }

    #[test]
    fn plan_round_trips_through_build_row_json() {
        let resource = resource_with_config(r#"{"source":{"uri":"git://x"}}"#);
        let mut from = Version::new();
        from.insert("ref".to_string(), "abc".to_string());

        let plan = check_plan(
            &resource,
            Some(from.clone()),
            chrono::Duration::seconds(30),
            &[VersionedResourceType {
                name: "custom".to_string(),
                kind: "registry-image".to_string(),
                source: Source::new(),
                version: None,
            }],
            &Source::new(),
        );

        let stored = serde_json::to_value(&plan).unwrap();
        let decoded: CheckPlan = serde_json::from_value(stored).unwrap();
        assert_eq!(decoded, plan);
        assert_eq!(decoded.from_version.as_ref(), Some(&from));
        assert_eq!(decoded.resource_types.len(), 1);
    }

    #[test]
    fn interval_formats_as_seconds() {
        assert_eq!(format_interval(chrono::Duration::minutes(2)), "120s");
    }
}
