// ABOUTME: Engine configuration: history caps, instance TTLs, default deadlines

use std::time::Duration;

/// Tunables for the workflow engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on the per-workflow error history ring.
    pub max_errors_per_workflow: usize,
    /// Cap on the process-wide error history ring.
    pub max_global_errors: usize,
    /// How long a terminal workflow instance lingers before the sweep drops
    /// it (late `submit_step_result` calls still land during the linger).
    pub terminal_linger: Duration,
    /// Inactivity TTL for non-terminal instances.
    pub inactivity_ttl: Duration,
    /// Default per-workflow deadline; `None` means unbounded.
    pub default_workflow_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_errors_per_workflow: 100,
            max_global_errors: 1000,
            terminal_linger: Duration::from_secs(300),
            inactivity_ttl: Duration::from_secs(3600),
            default_workflow_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Tight limits for tests.
    pub fn for_testing() -> Self {
        Self {
            max_errors_per_workflow: 10,
            max_global_errors: 50,
            terminal_linger: Duration::from_millis(200),
            inactivity_ttl: Duration::from_secs(5),
            default_workflow_timeout: None,
        }
    }
}
