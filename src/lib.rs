//! Centrix Resource Engine.
//!
//! The resource side of the Centrix CI platform: models resources and their
//! discovered/pinned/disabled versions against PostgreSQL, coordinates check
//! builds that scan external resources for new versions, reconstructs the
//! causality graph linking versions to builds, and fans database change
//! events out to in-process subscribers.
//!
//! The worker pool that actually runs check/get/put/task steps and the job
//! scheduler that consumes `schedule_requested` bumps are external
//! collaborators; only their interfaces live here.

pub mod bus;
pub mod config;
pub mod db;
pub mod encryption;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod migration;
pub mod models;
pub mod schema;
pub mod services;
pub mod watch;
pub mod worker;
