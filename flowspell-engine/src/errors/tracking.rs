// ABOUTME: Error history and analysis: bounded rings, summaries, patterns,
// ABOUTME: recovery statistics, and JSON/CSV export

use crate::errors::models::ErrorRecord;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Bounded error history: a ring per workflow plus a process-wide ring.
pub struct ErrorHistory {
    max_per_workflow: usize,
    max_global: usize,
    per_workflow: DashMap<String, VecDeque<ErrorRecord>>,
    global: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorHistory {
    pub fn new(max_per_workflow: usize, max_global: usize) -> Self {
        Self {
            max_per_workflow,
            max_global,
            per_workflow: DashMap::new(),
            global: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add(&self, record: ErrorRecord) {
        {
            let mut ring = self
                .per_workflow
                .entry(record.workflow_id.clone())
                .or_default();
            if ring.len() == self.max_per_workflow {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }
        let mut global = self.global.lock();
        if global.len() == self.max_global {
            global.pop_front();
        }
        global.push_back(record);
    }

    pub fn workflow_errors(&self, workflow_id: &str) -> Vec<ErrorRecord> {
        self.per_workflow
            .get(workflow_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn recent(&self, window: ChronoDuration) -> Vec<ErrorRecord> {
        let cutoff = Utc::now() - window;
        self.global
            .lock()
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn by_id(&self, error_id: &str) -> Option<ErrorRecord> {
        self.global
            .lock()
            .iter()
            .find(|e| e.id == error_id)
            .cloned()
    }

    pub fn step_errors(&self, workflow_id: &str, step_id: &str) -> Vec<ErrorRecord> {
        self.workflow_errors(workflow_id)
            .into_iter()
            .filter(|e| e.step_id.as_deref() == Some(step_id))
            .collect()
    }

    fn all_global(&self) -> Vec<ErrorRecord> {
        self.global.lock().iter().cloned().collect()
    }

    /// Summary by severity and type, with first/last timestamps and a
    /// recent (last hour) count.
    pub fn summary(&self, workflow_id: Option<&str>) -> Value {
        let errors = match workflow_id {
            Some(id) => self.workflow_errors(id),
            None => self.all_global(),
        };
        if errors.is_empty() {
            return json!({
                "total_errors": 0,
                "by_severity": {},
                "by_type": {},
                "recent_errors": 0,
            });
        }

        let mut by_severity: BTreeMap<&str, u64> = BTreeMap::new();
        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        for error in &errors {
            *by_severity.entry(error.severity.as_str()).or_default() += 1;
            *by_type.entry(error.error_type.clone()).or_default() += 1;
        }
        let recent_cutoff = Utc::now() - ChronoDuration::hours(1);
        let recent = errors.iter().filter(|e| e.timestamp >= recent_cutoff).count();

        json!({
            "total_errors": errors.len(),
            "by_severity": by_severity,
            "by_type": by_type,
            "recent_errors": recent,
            "first_error": errors.first().map(|e| e.timestamp.to_rfc3339()),
            "last_error": errors.last().map(|e| e.timestamp.to_rfc3339()),
        })
    }

    pub fn purge_workflow(&self, workflow_id: &str) {
        self.per_workflow.remove(workflow_id);
    }
}

/// A detected recurring error pattern.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub error_type: String,
    pub step_id: String,
    pub occurrences: usize,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
}

/// Error tracking and analysis on top of the history rings.
pub struct ErrorTracker {
    pub history: ErrorHistory,
    patterns: DashMap<(String, String), Vec<DateTime<Utc>>>,
    recovery_stats: DashMap<String, u64>,
}

impl ErrorTracker {
    pub fn new(max_per_workflow: usize, max_global: usize) -> Self {
        Self {
            history: ErrorHistory::new(max_per_workflow, max_global),
            patterns: DashMap::new(),
            recovery_stats: DashMap::new(),
        }
    }

    /// Record an error, its pattern key, and any recovery action taken.
    pub fn track(&self, record: ErrorRecord, recovery_action: Option<&str>) {
        let pattern_key = (
            record.error_type.clone(),
            record.step_id.clone().unwrap_or_default(),
        );
        self.patterns
            .entry(pattern_key)
            .or_default()
            .push(record.timestamp);
        if let Some(action) = recovery_action {
            *self.recovery_stats.entry(action.to_string()).or_default() += 1;
        }
        debug!(error_id = %record.id, workflow_id = %record.workflow_id, "tracked error");
        self.history.add(record);
    }

    /// Mark a recorded error as recovered.
    pub fn mark_recovered(&self, error_id: &str) {
        let mut found = false;
        {
            let mut global = self.history.global.lock();
            for error in global.iter_mut() {
                if error.id == error_id {
                    error.recovered = true;
                    found = true;
                }
            }
        }
        if found {
            for mut ring in self.history.per_workflow.iter_mut() {
                for error in ring.value_mut().iter_mut() {
                    if error.id == error_id {
                        error.recovered = true;
                    }
                }
            }
            *self.recovery_stats.entry("recovered".to_string()).or_default() += 1;
        }
    }

    /// `(error_type, step_id)` pairs with at least three occurrences in the
    /// last 24 hours, most frequent first.
    pub fn detect_patterns(&self) -> Vec<ErrorPattern> {
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let mut out = Vec::new();
        for entry in self.patterns.iter() {
            let recent: Vec<DateTime<Utc>> = entry
                .value()
                .iter()
                .copied()
                .filter(|ts| *ts >= cutoff)
                .collect();
            if recent.len() >= 3 {
                let (error_type, step_id) = entry.key().clone();
                out.push(ErrorPattern {
                    error_type,
                    step_id,
                    occurrences: recent.len(),
                    first_occurrence: recent.iter().min().copied().unwrap_or_else(Utc::now),
                    last_occurrence: recent.iter().max().copied().unwrap_or_else(Utc::now),
                });
            }
        }
        out.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        out
    }

    /// Most common error signatures in the recent window.
    pub fn top_errors(&self, limit: usize, window: ChronoDuration) -> Vec<Value> {
        let recent = self.history.recent(window);
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for error in &recent {
            let mut signature = format!("{}:{}", error.error_type, error.message);
            signature.truncate(120);
            *counts.entry(signature).or_default() += 1;
        }
        let mut rows: Vec<(String, u64)> = counts.into_iter().collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        rows.truncate(limit);
        rows.into_iter()
            .map(|(signature, count)| {
                json!({
                    "error_signature": signature,
                    "count": count,
                    "percentage": if recent.is_empty() {
                        0.0
                    } else {
                        (count as f64 / recent.len() as f64) * 100.0
                    },
                })
            })
            .collect()
    }

    pub fn recovery_stats(&self) -> Value {
        let actions: BTreeMap<String, u64> = self
            .recovery_stats
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        let total: u64 = actions.values().sum();
        json!({
            "recovery_actions": actions,
            "total_recoveries": total,
        })
    }

    /// Export error data as JSON or CSV.
    pub fn export(&self, workflow_id: Option<&str>, format: &str) -> Option<String> {
        let errors = match workflow_id {
            Some(id) => self.history.workflow_errors(id),
            None => self.history.all_global(),
        };
        match format {
            "json" => {
                let rows: Vec<Value> = errors.iter().map(ErrorRecord::to_json).collect();
                serde_json::to_string_pretty(&rows).ok()
            }
            "csv" => {
                let mut lines =
                    vec!["id,workflow_id,step_id,error_type,message,timestamp,severity".to_string()];
                for error in &errors {
                    lines.push(format!(
                        "{},{},{},{},\"{}\",{},{}",
                        error.id,
                        error.workflow_id,
                        error.step_id.as_deref().unwrap_or(""),
                        error.error_type,
                        error.message.replace('"', "'"),
                        error.timestamp.to_rfc3339(),
                        error.severity.as_str(),
                    ));
                }
                Some(lines.join("\n"))
            }
            _ => None,
        }
    }

    /// Drop pattern timestamps older than the cutoff.
    pub fn cleanup_old_patterns(&self, older_than: ChronoDuration) {
        let cutoff = Utc::now() - older_than;
        for mut entry in self.patterns.iter_mut() {
            entry.value_mut().retain(|ts| *ts >= cutoff);
        }
        self.patterns.retain(|_, timestamps| !timestamps.is_empty());
    }

    pub fn purge_workflow(&self, workflow_id: &str) {
        self.history.purge_workflow(workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowspell_core::FlowError;

    fn record(workflow: &str, step: &str, error_type: &str) -> ErrorRecord {
        ErrorRecord::from_client_report(error_type, "boom", workflow, Some(step.to_string()))
    }

    #[test]
    fn per_workflow_ring_is_bounded() {
        let history = ErrorHistory::new(3, 100);
        for i in 0..5 {
            history.add(record("wf_1", &format!("s{i}"), "OPERATION_FAILED"));
        }
        let errors = history.workflow_errors("wf_1");
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].step_id.as_deref(), Some("s2"));
    }

    #[test]
    fn global_ring_is_bounded() {
        let history = ErrorHistory::new(100, 4);
        for i in 0..6 {
            history.add(record(&format!("wf_{i}"), "s", "TIMEOUT"));
        }
        assert_eq!(history.all_global().len(), 4);
    }

    #[test]
    fn summary_counts_by_severity_and_type() {
        let history = ErrorHistory::new(10, 10);
        history.add(ErrorRecord::from_flow_error(
            &FlowError::Timeout {
                message: "t".into(),
            },
            "wf_1",
            Some("s1".into()),
        ));
        history.add(ErrorRecord::from_flow_error(
            &FlowError::validation("bad"),
            "wf_1",
            Some("s2".into()),
        ));
        let summary = history.summary(Some("wf_1"));
        assert_eq!(summary["total_errors"], 2);
        assert_eq!(summary["by_type"]["TIMEOUT"], 1);
        assert_eq!(summary["by_severity"]["high"], 1);
        assert_eq!(summary["recent_errors"], 2);
    }

    #[test]
    fn patterns_require_three_occurrences() {
        let tracker = ErrorTracker::new(10, 100);
        for _ in 0..2 {
            tracker.track(record("wf_1", "flaky", "TimeoutError"), None);
        }
        assert!(tracker.detect_patterns().is_empty());
        tracker.track(record("wf_1", "flaky", "TimeoutError"), None);
        let patterns = tracker.detect_patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].step_id, "flaky");
        assert_eq!(patterns[0].occurrences, 3);
    }

    #[test]
    fn recovery_marking_and_stats() {
        let tracker = ErrorTracker::new(10, 100);
        let rec = record("wf_1", "s1", "TimeoutError");
        let id = rec.id.clone();
        tracker.track(rec, Some("retry"));
        tracker.mark_recovered(&id);
        assert!(tracker.history.by_id(&id).unwrap().recovered);
        let stats = tracker.recovery_stats();
        assert_eq!(stats["recovery_actions"]["retry"], 1);
        assert_eq!(stats["recovery_actions"]["recovered"], 1);
    }

    #[test]
    fn export_formats() {
        let tracker = ErrorTracker::new(10, 100);
        tracker.track(record("wf_1", "s1", "TIMEOUT"), None);
        let as_json = tracker.export(Some("wf_1"), "json").unwrap();
        assert!(as_json.contains("TIMEOUT"));
        let as_csv = tracker.export(Some("wf_1"), "csv").unwrap();
        assert!(as_csv.starts_with("id,workflow_id"));
        assert_eq!(as_csv.lines().count(), 2);
        assert!(tracker.export(None, "xml").is_none());
    }

    #[test]
    fn top_errors_sorted_by_count() {
        let tracker = ErrorTracker::new(50, 100);
        for _ in 0..3 {
            tracker.track(record("wf_1", "s1", "TimeoutError"), None);
        }
        tracker.track(record("wf_1", "s2", "ValidationError"), None);
        let top = tracker.top_errors(5, ChronoDuration::hours(1));
        assert_eq!(top[0]["count"], 3);
    }
}
