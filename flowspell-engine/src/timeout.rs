// ABOUTME: Deadline tracking for steps and workflows with cascade cancellation
// ABOUTME: Expiry fires cleanup callbacks and surfaces a TIMEOUT error upstream

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type CleanupFn = Box<dyn FnOnce() + Send>;

/// One expired deadline, with the descendant keys that were cancelled by the
/// cascade rule.
#[derive(Debug)]
pub struct Expiry {
    pub key: String,
    pub cancelled_descendants: Vec<String>,
}

/// Tracks deadlines keyed by scope (`<workflow_id>` for workflow deadlines,
/// `<workflow_id>/<step_id>` for step deadlines) plus a cascade graph of
/// parent -> child keys. When a parent expires, descendant deadlines are
/// cancelled rather than fired.
#[derive(Default)]
pub struct TimeoutManager {
    deadlines: DashMap<String, Instant>,
    children: DashMap<String, Vec<String>>,
    cleanups: Mutex<HashMap<String, Vec<CleanupFn>>>,
}

impl TimeoutManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step_key(workflow_id: &str, step_id: &str) -> String {
        format!("{workflow_id}/{step_id}")
    }

    pub fn set_deadline(&self, key: impl Into<String>, timeout: Duration) {
        let key = key.into();
        debug!(key = %key, timeout_ms = timeout.as_millis() as u64, "deadline set");
        self.deadlines.insert(key, Instant::now() + timeout);
    }

    /// Record a parent -> child deadline relationship for the cascade rule.
    /// Re-linking the same pair (a retried step re-arms its deadline) is a
    /// no-op.
    pub fn link(&self, parent_key: impl Into<String>, child_key: impl Into<String>) {
        let child = child_key.into();
        let mut children = self.children.entry(parent_key.into()).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    /// Register a cleanup callback fired when (and only when) the key's own
    /// deadline expires.
    pub fn on_expire(&self, key: impl Into<String>, cleanup: CleanupFn) {
        self.cleanups.lock().entry(key.into()).or_default().push(cleanup);
    }

    pub fn has_deadline(&self, key: &str) -> bool {
        self.deadlines.contains_key(key)
    }

    /// Cancel a deadline without firing cleanups (the guarded work finished
    /// in time). Descendants are cancelled too.
    pub fn cancel(&self, key: &str) -> Vec<String> {
        let mut cancelled = Vec::new();
        self.cancel_inner(key, &mut cancelled);
        cancelled
    }

    fn cancel_inner(&self, key: &str, cancelled: &mut Vec<String>) {
        self.deadlines.remove(key);
        self.cleanups.lock().remove(key);
        let child_keys = self
            .children
            .remove(key)
            .map(|(_, v)| v)
            .unwrap_or_default();
        for child in child_keys {
            cancelled.push(child.clone());
            self.cancel_inner(&child, cancelled);
        }
    }

    /// Collect and process all expired deadlines: cleanups fire
    /// synchronously, descendants are cancelled.
    pub fn sweep(&self) -> Vec<Expiry> {
        let now = Instant::now();
        let expired_keys: Vec<String> = self
            .deadlines
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut out = Vec::new();
        for key in expired_keys {
            // a cascade from an earlier expiry may already have cancelled it
            if self.deadlines.remove(&key).is_none() {
                continue;
            }
            warn!(key = %key, "deadline expired");
            let callbacks = self.cleanups.lock().remove(&key).unwrap_or_default();
            for callback in callbacks {
                callback();
            }
            let mut cancelled = Vec::new();
            let child_keys = self
                .children
                .remove(&key)
                .map(|(_, v)| v)
                .unwrap_or_default();
            for child in child_keys {
                cancelled.push(child.clone());
                self.cancel_inner(&child, &mut cancelled);
            }
            out.push(Expiry {
                key,
                cancelled_descendants: cancelled,
            });
        }
        out
    }

    /// Drop every deadline, link, and cleanup belonging to a workflow.
    pub fn purge_workflow(&self, workflow_id: &str) {
        let step_prefix = format!("{workflow_id}/");
        let matches =
            |key: &str| -> bool { key == workflow_id || key.starts_with(&step_prefix) };
        self.deadlines.retain(|k, _| !matches(k));
        self.children.retain(|k, _| !matches(k));
        self.cleanups.lock().retain(|k, _| !matches(k));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn expired_deadline_fires_cleanup() {
        let manager = TimeoutManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        manager.set_deadline("wf_1/step", Duration::from_millis(0));
        manager.on_expire(
            "wf_1/step",
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        std::thread::sleep(Duration::from_millis(5));
        let expired = manager.sweep();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, "wf_1/step");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // idempotent
        assert!(manager.sweep().is_empty());
    }

    #[test]
    fn cascade_cancels_descendants_without_firing_them() {
        let manager = TimeoutManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        manager.set_deadline("wf_1/parent", Duration::from_millis(0));
        manager.set_deadline("wf_1/child", Duration::from_secs(60));
        manager.set_deadline("wf_1/grandchild", Duration::from_secs(60));
        manager.link("wf_1/parent", "wf_1/child");
        manager.link("wf_1/child", "wf_1/grandchild");
        manager.on_expire(
            "wf_1/child",
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        std::thread::sleep(Duration::from_millis(5));
        let expired = manager.sweep();
        assert_eq!(expired.len(), 1);
        assert_eq!(
            expired[0].cancelled_descendants,
            vec!["wf_1/child".to_string(), "wf_1/grandchild".to_string()]
        );
        // the child's cleanup must not have fired
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!manager.has_deadline("wf_1/child"));
    }

    #[test]
    fn cancel_clears_without_firing() {
        let manager = TimeoutManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        manager.set_deadline("wf_1/s", Duration::from_millis(0));
        manager.on_expire(
            "wf_1/s",
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        manager.cancel("wf_1/s");
        std::thread::sleep(Duration::from_millis(5));
        assert!(manager.sweep().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn purge_is_scoped_to_the_workflow() {
        let manager = TimeoutManager::new();
        manager.set_deadline("wf_1", Duration::from_secs(60));
        manager.set_deadline("wf_1/s", Duration::from_secs(60));
        manager.set_deadline("wf_10/s", Duration::from_secs(60));
        manager.purge_workflow("wf_1");
        assert!(!manager.has_deadline("wf_1"));
        assert!(!manager.has_deadline("wf_1/s"));
        assert!(manager.has_deadline("wf_10/s"));
    }
}
