//! Worker step contract.
//!
//! The pool that places containers and runs steps lives outside this crate;
//! the engine only consumes this interface. One concrete implementation
//! exists in the worker process; tests use call-recording fakes.

use async_trait::async_trait;

use crate::models::resource::Source;
use crate::models::version::{MetadataField, Version};

/// Identifies the container's owning step for reuse across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOwner {
    pub build_id: i64,
    pub plan_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub image_resource_type: String,
    pub env: Vec<String>,
    pub dir: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerSpec {
    pub platform: String,
    pub tags: Vec<String>,
    pub team_id: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlacementStrategy {
    #[default]
    VolumeLocality,
    FewestBuildContainers,
    Random,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub kind: String,
    pub step_name: String,
    pub attempt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub dir: String,
}

/// Notified just before the step process starts.
pub trait StartingEventDelegate: Send + Sync {
    fn starting(&self);
}

/// The resource a check/get/put step operates on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceHandle {
    pub source: Source,
    pub params: Option<serde_json::Value>,
    pub version: Option<Version>,
}

/// Cache handle for get steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCacheHandle {
    pub resource_cache_id: i64,
}

/// Lock factory handed to task steps for cross-build serialization.
#[async_trait]
pub trait TaskLockFactory: Send + Sync {
    async fn try_acquire(&self, name: &str) -> anyhow::Result<bool>;
    async fn release(&self, name: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckResult {
    pub versions: Vec<Version>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionResult {
    pub version: Version,
    pub metadata: Vec<MetadataField>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetResult {
    pub exit_status: i32,
    pub version_result: VersionResult,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutResult {
    pub exit_status: i32,
    pub version_result: VersionResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskResult {
    pub exit_status: i32,
}

/// Client to the worker pool.
#[allow(clippy::too_many_arguments)]
#[async_trait]
pub trait Client: Send + Sync {
    async fn run_check_step(
        &self,
        owner: ContainerOwner,
        container_spec: ContainerSpec,
        worker_spec: WorkerSpec,
        strategy: PlacementStrategy,
        metadata: ContainerMetadata,
        process_spec: ProcessSpec,
        delegate: &dyn StartingEventDelegate,
        resource: ResourceHandle,
    ) -> anyhow::Result<CheckResult>;

    async fn run_get_step(
        &self,
        owner: ContainerOwner,
        container_spec: ContainerSpec,
        worker_spec: WorkerSpec,
        strategy: PlacementStrategy,
        metadata: ContainerMetadata,
        process_spec: ProcessSpec,
        delegate: &dyn StartingEventDelegate,
        cache: ResourceCacheHandle,
        resource: ResourceHandle,
    ) -> anyhow::Result<GetResult>;

    async fn run_put_step(
        &self,
        owner: ContainerOwner,
        container_spec: ContainerSpec,
        worker_spec: WorkerSpec,
        strategy: PlacementStrategy,
        metadata: ContainerMetadata,
        process_spec: ProcessSpec,
        delegate: &dyn StartingEventDelegate,
        resource: ResourceHandle,
    ) -> anyhow::Result<PutResult>;

    async fn run_task_step(
        &self,
        owner: ContainerOwner,
        container_spec: ContainerSpec,
        worker_spec: WorkerSpec,
        strategy: PlacementStrategy,
        metadata: ContainerMetadata,
        process_spec: ProcessSpec,
        delegate: &dyn StartingEventDelegate,
        locks: std::sync::Arc<dyn TaskLockFactory>,
    ) -> anyhow::Result<TaskResult>;
}
