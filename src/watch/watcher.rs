//! The jobs watcher: installs change triggers, drains the events channel,
//! and fans enriched dashboard deltas out to subscribers.

use std::sync::Arc;

use anyhow::Context;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, SimpleAsyncConnection};

use crate::bus::{BusListener, NotificationBus, QueuePolicy};
use crate::db::DbPool;
use crate::error::{EngineError, Result};
use crate::lock;
use crate::watch::dashboard::{self, DashboardFilter};
use crate::watch::subscribers::{SubscriberSet, Subscription};
use crate::watch::{
    trigger_ddl, ChangeNotification, EventType, JobSummaryEvent, EVENTS_CHANNEL,
    NOTIFY_FUNCTION_SQL, WATCH_TABLES,
};

pub struct JobsWatcher {
    pool: DbPool,
    subscribers: SubscriberSet,
}

impl JobsWatcher {
    /// Install triggers (under the cluster-wide advisory lock), subscribe to
    /// the events channel, and spawn the drain loop.
    pub async fn new(pool: DbPool, bus: &NotificationBus) -> anyhow::Result<Arc<Self>> {
        let watcher = Arc::new(JobsWatcher {
            pool,
            subscribers: SubscriberSet::new(),
        });

        watcher.setup_triggers().await.context("setup triggers")?;

        let listener = bus
            .listen(EVENTS_CHANNEL, QueuePolicy::Queue)
            .await
            .context("listen")?;

        tokio::spawn(watcher.clone().drain(listener));

        Ok(watcher)
    }

    /// Subscribe to dashboard deltas. After an unhealthy bus marker the
    /// stream closes; consumers re-subscribe and re-fetch their baseline.
    pub fn watch_list_all_jobs(&self) -> Subscription {
        self.subscribers.subscribe()
    }

    async fn setup_triggers(&self) -> anyhow::Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("pool: {e}"))?;

        let acquired = lock::try_acquire(&mut conn, lock::CREATE_WATCH_TRIGGERS_LOCK_ID)
            .await
            .context("acquire lock")?;
        if !acquired {
            tracing::debug!("Watch trigger lock already held, assuming triggers exist");
            return Ok(());
        }

        let installed = install_triggers(&mut conn).await;
        let released = lock::release(&mut conn, lock::CREATE_WATCH_TRIGGERS_LOCK_ID).await;
        installed?;
        released.context("release lock")?;

        tracing::info!("Watch triggers installed");
        Ok(())
    }

    async fn drain(self: Arc<Self>, mut listener: BusListener) {
        while let Some(notification) = listener.recv().await {
            if !notification.healthy {
                tracing::info!("Bus connection reset, terminating watch subscribers");
                self.subscribers.terminate_all();
                continue;
            }

            // fast path: nobody is watching, skip decoding entirely
            if self.subscribers.is_empty() {
                continue;
            }

            if let Err(e) = self.process(&notification.payload).await {
                tracing::error!(
                    payload = %notification.payload,
                    "Failed to process watch notification: {e}"
                );
            }
        }
    }

    async fn process(&self, payload: &str) -> Result<()> {
        let notification: ChangeNotification = serde_json::from_str(payload)?;
        crate::metrics::watch_event(&notification.table);

        let Some(route) = route(&notification)? else {
            return Ok(());
        };

        match route {
            Route::ImmediateDelete(id) => {
                self.subscribers.publish(vec![JobSummaryEvent {
                    id,
                    event_type: EventType::Delete,
                    job: None,
                }]);
            }
            Route::Refetch {
                filter,
                delete_on_empty,
            } => {
                let mut conn = self.pool.get().await.map_err(EngineError::pool)?;
                let jobs = dashboard::list_jobs(&mut conn, filter).await?;
                let events = refetch_events(jobs, delete_on_empty);
                if !events.is_empty() {
                    self.subscribers.publish(events);
                }
            }
        }

        Ok(())
    }
}

async fn install_triggers(conn: &mut AsyncPgConnection) -> Result<()> {
    conn.transaction::<_, EngineError, _>(|conn| {
        async move {
            conn.batch_execute(NOTIFY_FUNCTION_SQL).await?;
            for table in WATCH_TABLES {
                conn.batch_execute(&trigger_ddl(table)).await?;
            }
            Ok(())
        }
        .scope_boxed()
    })
    .await
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Route {
    /// A row vanished; emit the delete without touching the database.
    ImmediateDelete(i64),
    /// Re-query the dashboard. `delete_on_empty` synthesizes a delete when
    /// the job updated itself out of visibility.
    Refetch {
        filter: DashboardFilter,
        delete_on_empty: Option<i64>,
    },
}

pub(crate) fn route(notification: &ChangeNotification) -> Result<Option<Route>> {
    match notification.table.as_str() {
        "jobs" => {
            let id = row_id(notification)?;
            if notification.operation == "DELETE" {
                Ok(Some(Route::ImmediateDelete(id)))
            } else {
                Ok(Some(Route::Refetch {
                    filter: DashboardFilter::Job(id),
                    delete_on_empty: (notification.operation == "UPDATE").then_some(id),
                }))
            }
        }
        "pipelines" => Ok(Some(Route::Refetch {
            filter: DashboardFilter::Pipeline(row_id(notification)?),
            delete_on_empty: None,
        })),
        "teams" => Ok(Some(Route::Refetch {
            filter: DashboardFilter::Team(row_id(notification)?),
            delete_on_empty: None,
        })),
        _ => Ok(None),
    }
}

fn row_id(notification: &ChangeNotification) -> Result<i64> {
    notification
        .data
        .get("id")
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| {
            EngineError::Decode(format!(
                "notification for {} has no usable id",
                notification.table
            ))
        })
}

pub(crate) fn refetch_events(
    jobs: Vec<crate::models::job::JobSummary>,
    delete_on_empty: Option<i64>,
) -> Vec<JobSummaryEvent> {
    if jobs.is_empty() {
        // an update that hides the job means active flipped to false (or
        // already was); a delete is reasonable as long as repeats carry no
        // guarantees
        return delete_on_empty
            .map(|id| {
                vec![JobSummaryEvent {
                    id,
                    event_type: EventType::Delete,
                    job: None,
                }]
            })
            .unwrap_or_default();
    }

    jobs.into_iter()
        .map(|job| JobSummaryEvent {
            id: job.id,
            event_type: EventType::Put,
            job: Some(job),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobSummary;
    use std::collections::HashMap;

    fn notification(table: &str, operation: &str, id: &str) -> ChangeNotification {
        let mut data = HashMap::new();
        data.insert("id".to_string(), id.to_string());
        ChangeNotification {
            table: table.to_string(),
            operation: operation.to_string(),
            data,
            columns: vec!["id".to_string()],
        }
    }

    fn summary(id: i64) -> JobSummary {
        JobSummary {
            id,
            name: format!("job-{id}"),
            pipeline_id: 1,
            pipeline_name: "main".to_string(),
            pipeline_public: false,
            team_id: 1,
            team_name: "ops".to_string(),
            paused: false,
            has_new_inputs: false,
            latest_completed_build_id: None,
            next_build_id: None,
            transition_build_id: None,
        }
    }

    #[test]
    fn job_delete_skips_the_refetch() {
        let route = route(&notification("jobs", "DELETE", "7")).unwrap();
        assert_eq!(route, Some(Route::ImmediateDelete(7)));
    }

    #[test]
    fn job_update_refetches_with_delete_fallback() {
        let route = route(&notification("jobs", "UPDATE", "7")).unwrap();
        assert_eq!(
            route,
            Some(Route::Refetch {
                filter: DashboardFilter::Job(7),
                delete_on_empty: Some(7),
            })
        );
    }

    #[test]
    fn job_insert_has_no_delete_fallback() {
        let route = route(&notification("jobs", "INSERT", "7")).unwrap();
        assert_eq!(
            route,
            Some(Route::Refetch {
                filter: DashboardFilter::Job(7),
                delete_on_empty: None,
            })
        );
    }

    #[test]
    fn pipeline_and_team_updates_route_to_their_filters() {
        assert_eq!(
            route(&notification("pipelines", "UPDATE", "3")).unwrap(),
            Some(Route::Refetch {
                filter: DashboardFilter::Pipeline(3),
                delete_on_empty: None,
            })
        );
        assert_eq!(
            route(&notification("teams", "UPDATE", "4")).unwrap(),
            Some(Route::Refetch {
                filter: DashboardFilter::Team(4),
                delete_on_empty: None,
            })
        );
    }

    #[test]
    fn unknown_tables_are_ignored() {
        assert_eq!(route(&notification("workers", "UPDATE", "1")).unwrap(), None);
    }

    #[test]
    fn unparseable_id_is_a_decode_error() {
        let err = route(&notification("jobs", "UPDATE", "not-a-number"));
        assert!(matches!(err, Err(EngineError::Decode(_))));
    }

    #[test]
    fn empty_refetch_after_update_synthesizes_delete() {
        let events = refetch_events(Vec::new(), Some(7));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 7);
        assert_eq!(events[0].event_type, EventType::Delete);
        assert!(events[0].job.is_none());
    }

    #[test]
    fn empty_refetch_without_fallback_emits_nothing() {
        assert!(refetch_events(Vec::new(), None).is_empty());
    }

    #[test]
    fn refetched_jobs_become_puts() {
        let events = refetch_events(vec![summary(1), summary(2)], Some(1));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == EventType::Put));
        assert_eq!(events[1].job.as_ref().map(|j| j.id), Some(2));
    }
}
