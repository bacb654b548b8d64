//! Database change watching: triggers, notification payloads, and
//! subscriber fan-out for the jobs dashboard.

pub mod dashboard;
pub mod subscribers;
pub mod watcher;

use std::collections::HashMap;

use serde::Deserialize;

use crate::models::job::JobSummary;

/// Channel carrying trigger payloads for watched tables.
pub const EVENTS_CHANNEL: &str = "events";

/// A trigger payload, one per affected row.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeNotification {
    pub table: String,
    pub operation: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A dashboard delta delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummaryEvent {
    pub id: i64,
    pub event_type: EventType,
    /// Present on `Put`; `Delete` carries only the id.
    pub job: Option<JobSummary>,
}

pub(crate) struct WatchTable {
    pub table: &'static str,
    pub insert: bool,
    pub update_columns: &'static [&'static str],
    pub delete: bool,
}

pub(crate) const WATCH_TABLES: &[WatchTable] = &[
    WatchTable {
        table: "jobs",
        insert: true,
        update_columns: &[
            "name",
            "active",
            "paused",
            "has_new_inputs",
            "tags",
            "latest_completed_build_id",
            "next_build_id",
            "transition_build_id",
            "config",
        ],
        delete: true,
    },
    WatchTable {
        table: "pipelines",
        insert: false,
        update_columns: &["name", "public"],
        delete: false,
    },
    WatchTable {
        table: "teams",
        insert: false,
        update_columns: &["name"],
        delete: false,
    },
];

/// Trigger function posting `{table, operation, data, columns}` payloads on
/// the events channel for each affected row.
pub(crate) const NOTIFY_FUNCTION_SQL: &str = r#"
CREATE OR REPLACE FUNCTION notify_watch_event() RETURNS TRIGGER AS $$
DECLARE
    rec RECORD;
BEGIN
    IF TG_OP = 'DELETE' THEN
        rec := OLD;
    ELSE
        rec := NEW;
    END IF;
    PERFORM pg_notify('events', json_build_object(
        'table', TG_TABLE_NAME,
        'operation', TG_OP,
        'data', json_build_object('id', rec.id::text),
        'columns', array_to_json(TG_ARGV)
    )::text);
    RETURN rec;
END;
$$ LANGUAGE plpgsql;
"#;

pub(crate) fn trigger_ddl(table: &WatchTable) -> String {
    let mut operations = Vec::new();
    if table.insert {
        operations.push("INSERT".to_string());
    }
    if !table.update_columns.is_empty() {
        operations.push(format!("UPDATE OF {}", table.update_columns.join(", ")));
    }
    if table.delete {
        operations.push("DELETE".to_string());
    }

    format!(
        "DROP TRIGGER IF EXISTS watch_{name}_events ON {name};\n\
         CREATE TRIGGER watch_{name}_events\n\
         AFTER {operations} ON {name}\n\
         FOR EACH ROW EXECUTE FUNCTION notify_watch_event('id');",
        name = table.table,
        operations = operations.join(" OR "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_decodes_with_data_and_columns() {
        let payload = r#"{
            "table": "jobs",
            "operation": "UPDATE",
            "data": {"id": "12"},
            "columns": ["id"]
        }"#;
        let notification: ChangeNotification = serde_json::from_str(payload).unwrap();
        assert_eq!(notification.table, "jobs");
        assert_eq!(notification.operation, "UPDATE");
        assert_eq!(notification.data.get("id").map(String::as_str), Some("12"));
        assert_eq!(notification.columns, vec!["id".to_string()]);
    }

    #[test]
    fn payload_decodes_without_optional_fields() {
        let notification: ChangeNotification =
            serde_json::from_str(r#"{"table": "teams", "operation": "UPDATE"}"#).unwrap();
        assert!(notification.data.is_empty());
        assert!(notification.columns.is_empty());
    }

    #[test]
    fn jobs_trigger_covers_all_three_operations() {
        let ddl = trigger_ddl(&WATCH_TABLES[0]);
        assert!(ddl.contains("AFTER INSERT OR UPDATE OF name, active, paused"));
        assert!(ddl.contains("OR DELETE ON jobs"));
        assert!(ddl.contains("watch_jobs_events"));
    }

    #[test]
    fn pipelines_trigger_is_update_only() {
        let ddl = trigger_ddl(&WATCH_TABLES[1]);
        assert!(ddl.contains("AFTER UPDATE OF name, public ON pipelines"));
        assert!(!ddl.contains("INSERT"));
        assert!(!ddl.contains("OR DELETE"));
    }
}
