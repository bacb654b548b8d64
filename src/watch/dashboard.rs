//! Dashboard query: jobs with denormalized pipeline and team context.

use diesel::sql_types::BigInt;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::Result;
use crate::models::job::JobSummary;

const DASHBOARD_QUERY: &str = "\
SELECT j.id, j.name, \
       p.id AS pipeline_id, p.name AS pipeline_name, p.public AS pipeline_public, \
       tm.id AS team_id, tm.name AS team_name, \
       j.paused, j.has_new_inputs, \
       j.latest_completed_build_id, j.next_build_id, j.transition_build_id \
FROM jobs j \
JOIN pipelines p ON p.id = j.pipeline_id \
JOIN teams tm ON tm.id = p.team_id \
WHERE j.active";

/// Predicate narrowing the dashboard to the rows touched by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardFilter {
    Job(i64),
    Pipeline(i64),
    Team(i64),
}

/// Fetch the dashboard rows matching the filter. Deactivated jobs never
/// appear; callers treat an empty result for a known job as a removal.
pub async fn list_jobs(
    conn: &mut AsyncPgConnection,
    filter: DashboardFilter,
) -> Result<Vec<JobSummary>> {
    let (clause, id) = match filter {
        DashboardFilter::Job(id) => ("j.id = $1", id),
        DashboardFilter::Pipeline(id) => ("p.id = $1", id),
        DashboardFilter::Team(id) => ("tm.id = $1", id),
    };

    let jobs = diesel::sql_query(format!("{DASHBOARD_QUERY} AND {clause}"))
        .bind::<BigInt, _>(id)
        .load(conn)
        .await?;

    Ok(jobs)
}
