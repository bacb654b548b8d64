//! Check scheduler: a background loop that enqueues check builds for
//! resources whose interval has elapsed or that received a scan wake-up.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use diesel::sql_types::{BigInt, Nullable, Timestamptz};
use diesel_async::RunQueryDsl;

use crate::bus::{BusListener, NotificationBus, QueuePolicy};
use crate::config::EngineConfig;
use crate::db::DbPool;
use crate::encryption::NoEncryption;
use crate::models::resource::Source;
use crate::services::{check_service, resource_service, scope_service};

/// Run the scheduler loop forever. Spawned as a background tokio task.
pub async fn run_scanner(pool: DbPool, bus: NotificationBus, config: EngineConfig) {
    tracing::info!(
        scan_interval_secs = config.scan_interval_secs,
        default_check_interval_secs = config.default_check_interval_secs,
        "Check scanner started"
    );

    let mut wakeups: HashMap<i64, BusListener> = HashMap::new();

    loop {
        if let Err(e) = sweep(&pool, &bus, &config, &mut wakeups).await {
            tracing::error!("Scanner sweep error: {e}");
        }
        tokio::time::sleep(std::time::Duration::from_secs(config.scan_interval_secs)).await;
    }
}

#[derive(diesel::QueryableByName)]
struct ScanCandidate {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = BigInt)]
    scope_id: i64,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    last_check_end_time: Option<DateTime<Utc>>,
}

/// One pass: collect due resources and enqueue a check build for each.
async fn sweep(
    pool: &DbPool,
    bus: &NotificationBus,
    config: &EngineConfig,
    wakeups: &mut HashMap<i64, BusListener>,
) -> anyhow::Result<()> {
    let mut conn = pool.get().await.map_err(|e| anyhow::anyhow!("pool: {e}"))?;

    let candidates: Vec<ScanCandidate> = diesel::sql_query(
        "SELECT r.id, rs.id AS scope_id, rs.last_check_end_time \
         FROM resources r \
         JOIN resource_config_scopes rs ON rs.id = r.resource_config_scope_id \
         WHERE r.active",
    )
    .load(&mut conn)
    .await?;

    // Wake-up hints force a resource due regardless of its interval.
    let mut forced: HashSet<i64> = HashSet::new();
    for candidate in &candidates {
        if !wakeups.contains_key(&candidate.id) {
            let listener = bus
                .listen(&resource_service::scan_channel(candidate.id), QueuePolicy::Drop)
                .await?;
            wakeups.insert(candidate.id, listener);
        }
        if let Some(listener) = wakeups.get_mut(&candidate.id) {
            while let Some(notification) = listener.try_recv() {
                if notification.healthy {
                    forced.insert(candidate.id);
                }
            }
        }
    }

    let now = Utc::now();

    for candidate in candidates {
        let Some(resource) =
            resource_service::get_resource(&mut conn, &NoEncryption, candidate.id).await?
        else {
            continue;
        };

        let interval = parse_interval(
            resource.config.check_every.as_deref(),
            config.default_check_interval_secs,
        );

        if !forced.contains(&candidate.id)
            && !is_due(candidate.last_check_end_time, interval, now)
        {
            continue;
        }

        let from_version = scope_service::latest_version(&mut conn, candidate.scope_id).await?;
        let plan = check_service::check_plan(&resource, from_version, interval, &[], &Source::new());

        match check_service::create_build(&mut conn, bus, &resource, false, &plan).await {
            Ok(Some(build)) => {
                tracing::info!(
                    resource_id = resource.id,
                    build_id = build.id,
                    "Enqueued check build"
                );
            }
            Ok(None) => {
                tracing::debug!(resource_id = resource.id, "Check already in flight");
            }
            Err(e) => {
                tracing::error!(resource_id = resource.id, "Failed to enqueue check: {e}");
            }
        }
    }

    Ok(())
}

/// Whether a resource is due for a check. Never-checked resources are
/// always due.
pub(crate) fn is_due(
    last_check_end_time: Option<DateTime<Utc>>,
    interval: Duration,
    now: DateTime<Utc>,
) -> bool {
    match last_check_end_time {
        Some(last) => now - last >= interval,
        None => true,
    }
}

/// Parse a `check_every` value like "30s", "5m", or "1h". Falls back to the
/// configured default when absent or malformed.
pub(crate) fn parse_interval(check_every: Option<&str>, default_secs: u64) -> Duration {
    let default = Duration::seconds(default_secs as i64);
    let Some(raw) = check_every else {
        return default;
    };

    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };

    let Ok(value) = digits.parse::<i64>() else {
        tracing::warn!(check_every = raw, "Unparseable check interval, using default");
        return default;
    };

    match unit {
        "s" => Duration::seconds(value),
        "m" => Duration::minutes(value),
        "h" => Duration::hours(value),
        _ => {
            tracing::warn!(check_every = raw, "Unknown interval unit, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_checked_resources_are_due() {
        assert!(is_due(None, Duration::seconds(60), Utc::now()));
    }

    #[test]
    fn due_only_after_interval_elapses() {
        let now = Utc::now();
        let interval = Duration::seconds(60);
        assert!(!is_due(Some(now - Duration::seconds(30)), interval, now));
        assert!(is_due(Some(now - Duration::seconds(60)), interval, now));
        assert!(is_due(Some(now - Duration::seconds(90)), interval, now));
    }

    #[test]
    fn interval_parsing_handles_units_and_fallback() {
        assert_eq!(parse_interval(Some("30s"), 60), Duration::seconds(30));
        assert_eq!(parse_interval(Some("5m"), 60), Duration::minutes(5));
        assert_eq!(parse_interval(Some("2h"), 60), Duration::hours(2));
        assert_eq!(parse_interval(Some("45"), 60), Duration::seconds(45));
        assert_eq!(parse_interval(Some("soon"), 60), Duration::seconds(60));
        assert_eq!(parse_interval(None, 60), Duration::seconds(60));
    }
}
