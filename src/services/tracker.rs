//! Check tracker: claims started check builds, runs the check step through
//! the worker client, and appends discovered versions to the ledger.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use diesel::sql_types::{BigInt, Nullable};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::bus::{NotificationBus, QueuePolicy};
use crate::config::EngineConfig;
use crate::db::DbPool;
use crate::encryption::NoEncryption;
use crate::error::{EngineError, Result};
use crate::models::build::BuildStatus;
use crate::services::{check_service, resource_service, scope_service};
use crate::worker::{
    Client, ContainerMetadata, ContainerOwner, ContainerSpec, PlacementStrategy, ProcessSpec,
    ResourceHandle, WorkerSpec,
};

/// Run the tracker loop forever. Wakes on build-tracker notifications, with
/// a periodic fallback for signals lost across reconnects.
pub async fn run_tracker<C: Client + 'static>(
    pool: DbPool,
    bus: NotificationBus,
    client: Arc<C>,
    config: EngineConfig,
) {
    let mut listener = match bus
        .listen(check_service::BUILD_TRACKER_CHANNEL, QueuePolicy::Queue)
        .await
    {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Tracker failed to listen: {e}");
            return;
        }
    };

    tracing::info!("Check tracker started");

    loop {
        if let Err(e) = track_pending(&pool, client.as_ref()).await {
            tracing::error!("Tracker sweep error: {e}");
        }

        tokio::select! {
            notification = listener.recv() => {
                if notification.is_none() {
                    tracing::info!("Tracker listener closed, stopping");
                    return;
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(config.tracker_fallback_secs)) => {}
        }
    }
}

#[derive(Debug, diesel::QueryableByName)]
struct CheckBuildRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = BigInt)]
    team_id: i64,
    #[diesel(sql_type = BigInt)]
    resource_id: i64,
    #[diesel(sql_type = Nullable<diesel::sql_types::Jsonb>)]
    plan: Option<serde_json::Value>,
}

/// Claim and run every started, incomplete check build.
async fn track_pending<C: Client>(pool: &DbPool, client: &C) -> anyhow::Result<()> {
    let mut conn = pool.get().await.map_err(|e| anyhow::anyhow!("pool: {e}"))?;

    let pending: Vec<CheckBuildRow> = diesel::sql_query(
        "SELECT b.id, b.team_id, b.resource_id, b.plan \
         FROM builds b \
         WHERE b.resource_id IS NOT NULL AND b.status = 'started' AND NOT b.completed \
         ORDER BY b.id ASC",
    )
    .load(&mut conn)
    .await?;

    for build in pending {
        if let Err(e) = run_check_build(&mut conn, client, &build).await {
            tracing::error!(build_id = build.id, "Check build failed: {e}");
        }
    }

    Ok(())
}

/// Everything the worker client needs to run one check step, derived from
/// the stored plan.
pub(crate) struct CheckStepArgs {
    pub owner: ContainerOwner,
    pub container_spec: ContainerSpec,
    pub worker_spec: WorkerSpec,
    pub strategy: PlacementStrategy,
    pub metadata: ContainerMetadata,
    pub process_spec: ProcessSpec,
    pub resource: ResourceHandle,
}

pub(crate) fn check_step_args(
    build_id: i64,
    team_id: i64,
    plan: &check_service::CheckPlan,
) -> CheckStepArgs {
    CheckStepArgs {
        owner: ContainerOwner {
            build_id,
            plan_id: "check".to_string(),
        },
        container_spec: ContainerSpec {
            image_resource_type: plan.kind.clone(),
            env: Vec::new(),
            dir: String::new(),
        },
        worker_spec: WorkerSpec {
            platform: "linux".to_string(),
            tags: plan.tags.clone(),
            team_id,
        },
        strategy: PlacementStrategy::default(),
        metadata: ContainerMetadata {
            kind: "check".to_string(),
            step_name: plan.name.clone(),
            attempt: String::new(),
        },
        process_spec: ProcessSpec::default(),
        resource: ResourceHandle {
            source: plan.source.clone(),
            params: None,
            version: plan.from_version.clone(),
        },
    }
}

struct StepLogger {
    build_id: i64,
}

impl crate::worker::StartingEventDelegate for StepLogger {
    fn starting(&self) {
        tracing::debug!(build_id = self.build_id, "Check step starting");
    }
}

async fn run_check_build<C: Client>(
    conn: &mut AsyncPgConnection,
    client: &C,
    build: &CheckBuildRow,
) -> Result<()> {
    let Some(resource) =
        resource_service::get_resource(conn, &NoEncryption, build.resource_id).await?
    else {
        // resource went away under the build
        check_service::finish_build(conn, build.id, BuildStatus::Errored).await?;
        return Err(EngineError::Consistency(format!(
            "check build {} references missing resource {}",
            build.id, build.resource_id
        )));
    };

    let Some(scope_id) = resource.resource_config_scope_id else {
        check_service::finish_build(conn, build.id, BuildStatus::Errored).await?;
        return Err(EngineError::Consistency(format!(
            "resource {} has no config scope",
            resource.id
        )));
    };

    let plan: check_service::CheckPlan = match &build.plan {
        Some(value) => serde_json::from_value(value.clone())?,
        None => {
            check_service::finish_build(conn, build.id, BuildStatus::Errored).await?;
            return Err(EngineError::Consistency(format!(
                "check build {} has no plan",
                build.id
            )));
        }
    };

    scope_service::update_last_check_start_time(conn, scope_id, Utc::now()).await?;

    let args = check_step_args(build.id, build.team_id, &plan);
    let delegate = StepLogger { build_id: build.id };
    let started = Instant::now();

    let result = client
        .run_check_step(
            args.owner,
            args.container_spec,
            args.worker_spec,
            args.strategy,
            args.metadata,
            args.process_spec,
            &delegate,
            args.resource,
        )
        .await;

    crate::metrics::check_duration(started.elapsed().as_millis() as u64);

    match result {
        Ok(check) => {
            let versions: Vec<_> = check
                .versions
                .into_iter()
                .map(|version| (version, Vec::new()))
                .collect();
            let saved = scope_service::save_versions(conn, scope_id, &versions).await?;
            crate::metrics::versions_saved(saved);

            scope_service::update_last_check_end_time(conn, scope_id, Utc::now()).await?;
            check_service::finish_build(conn, build.id, BuildStatus::Succeeded).await?;

            tracing::info!(
                build_id = build.id,
                resource_id = resource.id,
                versions = saved,
                "Check succeeded"
            );
            Ok(())
        }
        Err(e) => {
            scope_service::update_last_check_end_time(conn, scope_id, Utc::now()).await?;
            check_service::finish_build(conn, build.id, BuildStatus::Errored).await?;
            tracing::warn!(
                build_id = build.id,
                resource_id = resource.id,
                "Check step failed: {e}"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::NoEncryption;
    use crate::models::resource::{ResourceRow, Source};
    use crate::models::version::Version;
    use crate::worker::{
        CheckResult, GetResult, PutResult, ResourceCacheHandle, StartingEventDelegate,
        TaskLockFactory, TaskResult,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn plan() -> check_service::CheckPlan {
        let row = ResourceRow {
            id: 1,
            name: "repo".to_string(),
            kind: "git".to_string(),
            config: Some(r#"{"source":{"uri":"git://x"},"tags":["edge"]}"#.to_string()),
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
        };
        let resource = row.into_resource(&NoEncryption).unwrap();
        let mut from = Version::new();
        from.insert("ref".to_string(), "abc".to_string());
        check_service::check_plan(
            &resource,
            Some(from),
            chrono::Duration::seconds(60),
            &[],
            &Source::new(),
        )
    }

    #[test]
    fn step_args_derive_from_plan() {
        let plan = plan();
        let args = check_step_args(9, 3, &plan);

        assert_eq!(args.owner.build_id, 9);
        assert_eq!(args.owner.plan_id, "check");
        assert_eq!(args.container_spec.image_resource_type, "git");
        assert_eq!(args.worker_spec.team_id, 3);
        assert_eq!(args.worker_spec.tags, vec!["edge".to_string()]);
        assert_eq!(args.metadata.step_name, "repo");
        assert_eq!(
            args.resource.version.as_ref().and_then(|v| v.get("ref")).map(String::as_str),
            Some("abc")
        );
        assert_eq!(
            args.resource.source.get("uri"),
            Some(&serde_json::json!("git://x"))
        );
    }

    /// Call-recording worker client.
    #[derive(Default)]
    struct RecordingClient {
        check_calls: Mutex<Vec<(ContainerOwner, ResourceHandle)>>,
        versions: Vec<Version>,
    }

    #[async_trait]
    impl Client for RecordingClient {
        async fn run_check_step(
            &self,
            owner: ContainerOwner,
            _container_spec: ContainerSpec,
            _worker_spec: WorkerSpec,
            _strategy: PlacementStrategy,
            _metadata: ContainerMetadata,
            _process_spec: ProcessSpec,
            delegate: &dyn StartingEventDelegate,
            resource: ResourceHandle,
        ) -> anyhow::Result<CheckResult> {
            delegate.starting();
            self.check_calls
                .lock()
                .expect("recorder poisoned")
                .push((owner, resource));
            Ok(CheckResult {
                versions: self.versions.clone(),
            })
        }

        async fn run_get_step(
            &self,
            _owner: ContainerOwner,
            _container_spec: ContainerSpec,
            _worker_spec: WorkerSpec,
            _strategy: PlacementStrategy,
            _metadata: ContainerMetadata,
            _process_spec: ProcessSpec,
            _delegate: &dyn StartingEventDelegate,
            _cache: ResourceCacheHandle,
            _resource: ResourceHandle,
        ) -> anyhow::Result<GetResult> {
            Ok(GetResult::default())
        }

        async fn run_put_step(
            &self,
            _owner: ContainerOwner,
            _container_spec: ContainerSpec,
            _worker_spec: WorkerSpec,
            _strategy: PlacementStrategy,
            _metadata: ContainerMetadata,
            _process_spec: ProcessSpec,
            _delegate: &dyn StartingEventDelegate,
            _resource: ResourceHandle,
        ) -> anyhow::Result<PutResult> {
            Ok(PutResult::default())
        }

        async fn run_task_step(
            &self,
            _owner: ContainerOwner,
            _container_spec: ContainerSpec,
            _worker_spec: WorkerSpec,
            _strategy: PlacementStrategy,
            _metadata: ContainerMetadata,
            _process_spec: ProcessSpec,
            _delegate: &dyn StartingEventDelegate,
            _locks: Arc<dyn TaskLockFactory>,
        ) -> anyhow::Result<TaskResult> {
            Ok(TaskResult::default())
        }
    }

    #[tokio::test]
    async fn check_step_receives_plan_derived_arguments() {
        let plan = plan();
        let client = RecordingClient {
            versions: vec![plan.from_version.clone().unwrap()],
            ..RecordingClient::default()
        };

        let args = check_step_args(9, 3, &plan);
        let delegate = StepLogger { build_id: 9 };
        let result = client
            .run_check_step(
                args.owner,
                args.container_spec,
                args.worker_spec,
                args.strategy,
                args.metadata,
                args.process_spec,
                &delegate,
                args.resource,
            )
            .await
            .unwrap();

        assert_eq!(result.versions.len(), 1);
        let calls = client.check_calls.lock().expect("recorder poisoned");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.build_id, 9);
        assert_eq!(
            calls[0].1.source.get("uri"),
            Some(&serde_json::json!("git://x"))
        );
    }
}
