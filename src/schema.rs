//! Diesel table definitions for the resource engine.
//!
//! Tables: resources, resource_config_scopes, resource_config_versions,
//! resource_disabled_versions, resource_pins, resource_caches,
//! worker_resource_caches, builds, build_pipes,
//! build_resource_config_version_inputs/outputs, job_inputs, jobs,
//! pipelines, teams.

diesel::table! {
    resources (id) {
        id -> Int8,
        name -> Varchar,
        #[sql_name = "type"]
        kind -> Varchar,
        config -> Nullable<Text>,
        nonce -> Nullable<Text>,
        pipeline_id -> Int8,
        active -> Bool,
        resource_config_id -> Nullable<Int8>,
        resource_config_scope_id -> Nullable<Int8>,
        build_id -> Nullable<Int8>,
    }
}

diesel::table! {
    resource_config_scopes (id) {
        id -> Int8,
        resource_config_id -> Nullable<Int8>,
        last_check_start_time -> Nullable<Timestamptz>,
        last_check_end_time -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    resource_config_versions (id) {
        id -> Int8,
        resource_config_scope_id -> Int8,
        version -> Jsonb,
        version_md5 -> Text,
        metadata -> Nullable<Jsonb>,
        check_order -> Int4,
    }
}

diesel::table! {
    resource_disabled_versions (resource_id, version_md5) {
        resource_id -> Int8,
        version_md5 -> Text,
    }
}

diesel::table! {
    resource_pins (resource_id) {
        resource_id -> Int8,
        version -> Jsonb,
        comment_text -> Nullable<Text>,
        config -> Bool,
    }
}

diesel::table! {
    resource_caches (id) {
        id -> Int8,
        resource_config_id -> Int8,
        version_md5 -> Text,
    }
}

diesel::table! {
    worker_resource_caches (id) {
        id -> Int8,
        worker_name -> Varchar,
        resource_cache_id -> Int8,
    }
}

diesel::table! {
    builds (id) {
        id -> Int8,
        name -> Varchar,
        status -> Varchar,
        pipeline_id -> Nullable<Int8>,
        team_id -> Int8,
        job_id -> Nullable<Int8>,
        resource_id -> Nullable<Int8>,
        manually_triggered -> Bool,
        plan -> Nullable<Jsonb>,
        start_time -> Nullable<Timestamptz>,
        end_time -> Nullable<Timestamptz>,
        completed -> Bool,
    }
}

diesel::table! {
    build_pipes (from_build_id, to_build_id) {
        from_build_id -> Int8,
        to_build_id -> Int8,
    }
}

diesel::table! {
    build_resource_config_version_inputs (build_id, resource_id, version_md5, name) {
        build_id -> Int8,
        resource_id -> Int8,
        version_md5 -> Text,
        name -> Varchar,
    }
}

diesel::table! {
    build_resource_config_version_outputs (build_id, resource_id, version_md5, name) {
        build_id -> Int8,
        resource_id -> Int8,
        version_md5 -> Text,
        name -> Varchar,
    }
}

diesel::table! {
    job_inputs (job_id, name) {
        job_id -> Int8,
        resource_id -> Int8,
        name -> Varchar,
    }
}

diesel::table! {
    jobs (id) {
        id -> Int8,
        pipeline_id -> Int8,
        name -> Varchar,
        config -> Nullable<Text>,
        active -> Bool,
        paused -> Bool,
        has_new_inputs -> Bool,
        tags -> Nullable<Array<Text>>,
        schedule_requested -> Timestamptz,
        latest_completed_build_id -> Nullable<Int8>,
        next_build_id -> Nullable<Int8>,
        transition_build_id -> Nullable<Int8>,
    }
}

diesel::table! {
    pipelines (id) {
        id -> Int8,
        team_id -> Int8,
        name -> Varchar,
        public -> Bool,
        instance_vars -> Nullable<Jsonb>,
    }
}

diesel::table! {
    teams (id) {
        id -> Int8,
        name -> Varchar,
    }
}

// Foreign key relationships
diesel::joinable!(resources -> pipelines (pipeline_id));
diesel::joinable!(pipelines -> teams (team_id));
diesel::joinable!(jobs -> pipelines (pipeline_id));
diesel::joinable!(job_inputs -> jobs (job_id));
diesel::joinable!(job_inputs -> resources (resource_id));
diesel::joinable!(resource_config_versions -> resource_config_scopes (resource_config_scope_id));
diesel::joinable!(worker_resource_caches -> resource_caches (resource_cache_id));

diesel::allow_tables_to_appear_in_same_query!(
    resources,
    resource_config_scopes,
    resource_config_versions,
    resource_disabled_versions,
    resource_pins,
    resource_caches,
    worker_resource_caches,
    builds,
    build_pipes,
    build_resource_config_version_inputs,
    build_resource_config_version_outputs,
    job_inputs,
    jobs,
    pipelines,
    teams,
);
