//! Bounded per-workflow execution history.
//!
//! Keeps the most recent runs of each workflow in memory, newest first,
//! evicting the oldest once the retention limit is reached. Secret-looking
//! values are redacted before a record is stored -- history is shown in the
//! UI and must never echo credentials back.

use std::collections::VecDeque;

use dashmap::DashMap;
use loomflow_types::workflow::ExecutionRecord;
use serde_json::Value;
use uuid::Uuid;

/// Default number of past runs retained per workflow.
pub const DEFAULT_RETENTION: usize = 5;

/// Key-name markers that flag a value as secret (case-insensitive
/// substring match).
const SECRET_KEY_MARKERS: &[&str] = &[
    "api_key",
    "apikey",
    "token",
    "secret",
    "password",
    "authorization",
];

const REDACTED: &str = "[redacted]";

/// In-memory store of recent execution records, keyed by workflow ID.
#[derive(Debug)]
pub struct HistoryStore {
    runs: DashMap<Uuid, VecDeque<ExecutionRecord>>,
    default_retention: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl HistoryStore {
    pub fn new(default_retention: usize) -> Self {
        Self {
            runs: DashMap::new(),
            default_retention: default_retention.max(1),
        }
    }

    /// Store a finished run, redacting secrets and evicting the oldest
    /// record past the retention limit. `retention` overrides the store
    /// default for this workflow (a workflow-level setting).
    pub fn record(&self, mut record: ExecutionRecord, retention: Option<usize>) {
        redact_record(&mut record);

        let limit = retention.unwrap_or(self.default_retention).max(1);
        let mut entry = self.runs.entry(record.workflow_id).or_default();
        entry.push_front(record);
        while entry.len() > limit {
            entry.pop_back();
        }
    }

    /// Recent runs of a workflow, newest first.
    pub fn list(&self, workflow_id: &Uuid) -> Vec<ExecutionRecord> {
        self.runs
            .get(workflow_id)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Look up a single run of a workflow.
    pub fn get(&self, workflow_id: &Uuid, run_id: &Uuid) -> Option<ExecutionRecord> {
        self.runs
            .get(workflow_id)
            .and_then(|entry| entry.iter().find(|r| &r.run_id == run_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

fn redact_record(record: &mut ExecutionRecord) {
    for (key, value) in record.inputs.iter_mut() {
        if is_secret_key(key) {
            *value = Value::String(REDACTED.to_string());
        } else {
            redact_value(value);
        }
    }
    for step in &mut record.steps {
        if let Some(output) = &mut step.output {
            redact_value(output);
        }
    }
}

/// Recursively replace values under secret-looking keys.
fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map.iter_mut() {
                if is_secret_key(key) {
                    *nested = Value::String(REDACTED.to_string());
                } else {
                    redact_value(nested);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item);
            }
        }
        _ => {}
    }
}

fn is_secret_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SECRET_KEY_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loomflow_types::workflow::{RunStatus, StepResult};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample_record(workflow_id: Uuid) -> ExecutionRecord {
        ExecutionRecord {
            workflow_id,
            run_id: Uuid::now_v7(),
            status: RunStatus::Succeeded,
            inputs: BTreeMap::new(),
            steps: vec![],
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            duration_ms: 10,
            error: None,
        }
    }

    #[test]
    fn test_record_and_list_newest_first() {
        let store = HistoryStore::default();
        let workflow_id = Uuid::now_v7();

        let first = sample_record(workflow_id);
        let second = sample_record(workflow_id);
        let first_run = first.run_id;
        let second_run = second.run_id;

        store.record(first, None);
        store.record(second, None);

        let listed = store.list(&workflow_id);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].run_id, second_run);
        assert_eq!(listed[1].run_id, first_run);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let store = HistoryStore::new(3);
        let workflow_id = Uuid::now_v7();

        let mut run_ids = Vec::new();
        for _ in 0..5 {
            let record = sample_record(workflow_id);
            run_ids.push(record.run_id);
            store.record(record, None);
        }

        let listed = store.list(&workflow_id);
        assert_eq!(listed.len(), 3);
        // Newest three survive; the first two were evicted.
        assert_eq!(listed[0].run_id, run_ids[4]);
        assert_eq!(listed[2].run_id, run_ids[2]);
        assert!(store.get(&workflow_id, &run_ids[0]).is_none());
    }

    #[test]
    fn test_per_workflow_retention_override() {
        let store = HistoryStore::default();
        let workflow_id = Uuid::now_v7();
        for _ in 0..4 {
            store.record(sample_record(workflow_id), Some(2));
        }
        assert_eq!(store.list(&workflow_id).len(), 2);
    }

    #[test]
    fn test_workflows_isolated() {
        let store = HistoryStore::default();
        let wf_a = Uuid::now_v7();
        let wf_b = Uuid::now_v7();
        store.record(sample_record(wf_a), None);

        assert_eq!(store.list(&wf_a).len(), 1);
        assert!(store.list(&wf_b).is_empty());
    }

    #[test]
    fn test_get_by_run_id() {
        let store = HistoryStore::default();
        let workflow_id = Uuid::now_v7();
        let record = sample_record(workflow_id);
        let run_id = record.run_id;
        store.record(record, None);

        assert!(store.get(&workflow_id, &run_id).is_some());
        assert!(store.get(&workflow_id, &Uuid::now_v7()).is_none());
        assert!(store.get(&Uuid::now_v7(), &run_id).is_none());
    }

    // -----------------------------------------------------------------------
    // Redaction
    // -----------------------------------------------------------------------

    #[test]
    fn test_secret_inputs_redacted() {
        let store = HistoryStore::default();
        let workflow_id = Uuid::now_v7();
        let mut record = sample_record(workflow_id);
        record.inputs = BTreeMap::from([
            ("api_key".to_string(), json!("sk-live-abc")),
            ("GithubToken".to_string(), json!("ghp_xyz")),
            ("project".to_string(), json!("loomflow")),
        ]);
        let run_id = record.run_id;
        store.record(record, None);

        let stored = store.get(&workflow_id, &run_id).unwrap();
        assert_eq!(stored.inputs["api_key"], json!("[redacted]"));
        assert_eq!(stored.inputs["GithubToken"], json!("[redacted]"));
        assert_eq!(stored.inputs["project"], json!("loomflow"));
    }

    #[test]
    fn test_nested_secrets_in_step_outputs_redacted() {
        let store = HistoryStore::default();
        let workflow_id = Uuid::now_v7();
        let mut record = sample_record(workflow_id);
        record.steps = vec![StepResult::success(
            "configure",
            json!({
                "endpoint": "https://api.example.com",
                "credentials": {"password": "hunter2", "user": "svc"},
                "headers": [{"Authorization": "Bearer abc"}],
            }),
            Utc::now(),
            1,
        )];
        let run_id = record.run_id;
        store.record(record, None);

        let stored = store.get(&workflow_id, &run_id).unwrap();
        let output = stored.steps[0].output.as_ref().unwrap();
        assert_eq!(output["credentials"]["password"], json!("[redacted]"));
        assert_eq!(output["credentials"]["user"], json!("svc"));
        assert_eq!(output["headers"][0]["Authorization"], json!("[redacted]"));
        assert_eq!(output["endpoint"], json!("https://api.example.com"));
    }
}
