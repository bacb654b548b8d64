//! Schema migration for the resource engine tables.

use diesel_async::AsyncPgConnection;
use diesel_async::SimpleAsyncConnection;

/// SQL migration for the resource engine.
///
/// Creates the resource, version, build, and job tables. Idempotent; safe to
/// run on every boot. Watch triggers are installed separately by the jobs
/// watcher under its advisory lock.
pub const MIGRATION_SQL: &str = r#"
-- ================================================================
-- Resource Engine Tables
-- ================================================================

CREATE TABLE IF NOT EXISTS teams (
    id              BIGSERIAL PRIMARY KEY,
    name            VARCHAR(255) NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS pipelines (
    id              BIGSERIAL PRIMARY KEY,
    team_id         BIGINT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    name            VARCHAR(255) NOT NULL,
    public          BOOLEAN NOT NULL DEFAULT FALSE,
    instance_vars   JSONB,
    UNIQUE (team_id, name)
);

CREATE TABLE IF NOT EXISTS resource_config_scopes (
    id                    BIGSERIAL PRIMARY KEY,
    resource_config_id    BIGINT,
    last_check_start_time TIMESTAMPTZ,
    last_check_end_time   TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS resources (
    id                       BIGSERIAL PRIMARY KEY,
    name                     VARCHAR(255) NOT NULL,
    type                     VARCHAR(255) NOT NULL,
    config                   TEXT,
    nonce                    TEXT,
    pipeline_id              BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    active                   BOOLEAN NOT NULL DEFAULT TRUE,
    resource_config_id       BIGINT,
    resource_config_scope_id BIGINT REFERENCES resource_config_scopes(id),
    build_id                 BIGINT,
    UNIQUE (pipeline_id, name)
);

CREATE INDEX IF NOT EXISTS idx_resources_pipeline ON resources (pipeline_id);
CREATE INDEX IF NOT EXISTS idx_resources_scope ON resources (resource_config_scope_id);

CREATE TABLE IF NOT EXISTS resource_config_versions (
    id                       BIGSERIAL PRIMARY KEY,
    resource_config_scope_id BIGINT NOT NULL REFERENCES resource_config_scopes(id) ON DELETE CASCADE,
    version                  JSONB NOT NULL,
    version_md5              TEXT NOT NULL,
    metadata                 JSONB,
    check_order              INTEGER NOT NULL DEFAULT 0,
    UNIQUE (resource_config_scope_id, version_md5)
);

CREATE INDEX IF NOT EXISTS idx_rcv_scope_order
    ON resource_config_versions (resource_config_scope_id, check_order DESC);

CREATE TABLE IF NOT EXISTS resource_disabled_versions (
    resource_id BIGINT NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    version_md5 TEXT NOT NULL,
    PRIMARY KEY (resource_id, version_md5)
);

CREATE TABLE IF NOT EXISTS resource_pins (
    resource_id  BIGINT PRIMARY KEY REFERENCES resources(id) ON DELETE CASCADE,
    version      JSONB NOT NULL,
    comment_text TEXT,
    config       BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS resource_caches (
    id                 BIGSERIAL PRIMARY KEY,
    resource_config_id BIGINT NOT NULL,
    version_md5        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_resource_caches_config ON resource_caches (resource_config_id);

CREATE TABLE IF NOT EXISTS worker_resource_caches (
    id                BIGSERIAL PRIMARY KEY,
    worker_name       VARCHAR(255) NOT NULL,
    resource_cache_id BIGINT NOT NULL REFERENCES resource_caches(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_wrc_cache ON worker_resource_caches (resource_cache_id);

CREATE TABLE IF NOT EXISTS jobs (
    id                        BIGSERIAL PRIMARY KEY,
    pipeline_id               BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name                      VARCHAR(255) NOT NULL,
    config                    TEXT,
    active                    BOOLEAN NOT NULL DEFAULT TRUE,
    paused                    BOOLEAN NOT NULL DEFAULT FALSE,
    has_new_inputs            BOOLEAN NOT NULL DEFAULT FALSE,
    tags                      TEXT[],
    schedule_requested        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    latest_completed_build_id BIGINT,
    next_build_id             BIGINT,
    transition_build_id       BIGINT,
    UNIQUE (pipeline_id, name)
);

CREATE TABLE IF NOT EXISTS job_inputs (
    job_id      BIGINT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    resource_id BIGINT NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    name        VARCHAR(255) NOT NULL,
    PRIMARY KEY (job_id, name)
);

CREATE INDEX IF NOT EXISTS idx_job_inputs_resource ON job_inputs (resource_id);

CREATE TABLE IF NOT EXISTS builds (
    id                 BIGSERIAL PRIMARY KEY,
    name               VARCHAR(255) NOT NULL,
    status             VARCHAR(32) NOT NULL DEFAULT 'pending',
    pipeline_id        BIGINT REFERENCES pipelines(id) ON DELETE CASCADE,
    team_id            BIGINT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    job_id             BIGINT REFERENCES jobs(id) ON DELETE CASCADE,
    resource_id        BIGINT REFERENCES resources(id) ON DELETE CASCADE,
    manually_triggered BOOLEAN NOT NULL DEFAULT FALSE,
    plan               JSONB,
    start_time         TIMESTAMPTZ,
    end_time           TIMESTAMPTZ,
    completed          BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE INDEX IF NOT EXISTS idx_builds_resource ON builds (resource_id);
CREATE INDEX IF NOT EXISTS idx_builds_job ON builds (job_id);
CREATE INDEX IF NOT EXISTS idx_builds_status ON builds (status);

CREATE TABLE IF NOT EXISTS build_pipes (
    from_build_id BIGINT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    to_build_id   BIGINT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    PRIMARY KEY (from_build_id, to_build_id)
);

CREATE INDEX IF NOT EXISTS idx_build_pipes_to ON build_pipes (to_build_id);

CREATE TABLE IF NOT EXISTS build_resource_config_version_inputs (
    build_id    BIGINT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    resource_id BIGINT NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    version_md5 TEXT NOT NULL,
    name        VARCHAR(255) NOT NULL,
    PRIMARY KEY (build_id, resource_id, version_md5, name)
);

CREATE INDEX IF NOT EXISTS idx_brcvi_version
    ON build_resource_config_version_inputs (resource_id, version_md5);

CREATE TABLE IF NOT EXISTS build_resource_config_version_outputs (
    build_id    BIGINT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    resource_id BIGINT NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    version_md5 TEXT NOT NULL,
    name        VARCHAR(255) NOT NULL,
    PRIMARY KEY (build_id, resource_id, version_md5, name)
);

CREATE INDEX IF NOT EXISTS idx_brcvo_version
    ON build_resource_config_version_outputs (resource_id, version_md5);
"#;

/// Run the resource engine migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("resource engine migration failed: {e}"))?;
    Ok(())
}
