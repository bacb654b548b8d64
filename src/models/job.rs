//! Job dashboard summaries, as delivered to watch subscribers.

use diesel::sql_types::{BigInt, Bool, Nullable, Varchar};
use serde::Serialize;

/// A job with denormalized pipeline and team context.
#[derive(Debug, Clone, PartialEq, Serialize, diesel::QueryableByName)]
pub struct JobSummary {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Varchar)]
    pub name: String,
    #[diesel(sql_type = BigInt)]
    pub pipeline_id: i64,
    #[diesel(sql_type = Varchar)]
    pub pipeline_name: String,
    #[diesel(sql_type = Bool)]
    pub pipeline_public: bool,
    #[diesel(sql_type = BigInt)]
    pub team_id: i64,
    #[diesel(sql_type = Varchar)]
    pub team_name: String,
    #[diesel(sql_type = Bool)]
    pub paused: bool,
    #[diesel(sql_type = Bool)]
    pub has_new_inputs: bool,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub latest_completed_build_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub next_build_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub transition_build_id: Option<i64>,
}
