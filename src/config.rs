//! Configuration for the orchestrator.
//!
//! This struct is intentionally minimal and is always constructed explicitly and threaded
//! through constructors; nothing here lives behind a global or a `lazy_static`. No TOML or
//! YAML parsing is introduced — callers build a `Configuration` however they like (env
//! vars, a CLI, hardcoded defaults) and pass it in.
//!
//! # Example
//!
//! ```rust
//! use reconloop::Configuration;
//!
//! let config = Configuration::default();
//! assert_eq!(config.max_iterations, 15);
//! ```

use std::time::Duration;

/// Process-wide tunables for scan budgets, the hybrid router's thresholds, and the
/// tool execution engine's pool capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    /// Hard cap on agent loop iterations per scan (§4.6).
    pub max_iterations: u32,
    /// Wall-clock budget for an entire scan.
    pub max_scan_duration: Duration,
    /// Router threshold: escalate to `deep` once finding_count reaches this and
    /// any finding is severity >= high.
    pub finding_threshold: u32,
    /// Router threshold: escalate to `deep` once subdomain_count reaches this.
    pub subdomain_threshold: u32,
    /// Size of the subprocess worker pool shared across all scans.
    pub max_concurrent_tool_executions: usize,
    /// Grace period between SIGTERM and a forceful kill.
    pub kill_grace: Duration,
    /// Optional per-scan cost cap in US dollars. `None` means unbounded.
    pub budget_usd: Option<f64>,
    /// Event bus backpressure bound: a subscriber lagging by more than this
    /// many events is dropped with `stream_overflow`.
    pub max_lag: usize,
    /// How long a terminal scan's events remain available for late catch-up.
    pub event_retention: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            max_scan_duration: Duration::from_secs(30 * 60),
            finding_threshold: 20,
            subdomain_threshold: 100,
            max_concurrent_tool_executions: 4,
            kill_grace: Duration::from_secs(5),
            budget_usd: None,
            max_lag: 1024,
            event_retention: Duration::from_secs(10 * 60),
        }
    }
}

impl Configuration {
    /// Build a config with a per-scan dollar cap, keeping every other default.
    pub fn with_budget_usd(mut self, budget: f64) -> Self {
        self.budget_usd = Some(budget);
        self
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_max_concurrent_tool_executions(mut self, n: usize) -> Self {
        self.max_concurrent_tool_executions = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_thresholds() {
        let c = Configuration::default();
        assert_eq!(c.finding_threshold, 20);
        assert_eq!(c.subdomain_threshold, 100);
        assert_eq!(c.max_iterations, 15);
        assert_eq!(c.max_scan_duration, Duration::from_secs(1800));
        assert!(c.budget_usd.is_none());
    }

    #[test]
    fn builder_methods_override_defaults_independently() {
        let c = Configuration::default()
            .with_budget_usd(12.5)
            .with_max_iterations(5);
        assert_eq!(c.budget_usd, Some(12.5));
        assert_eq!(c.max_iterations, 5);
        assert_eq!(c.max_concurrent_tool_executions, 4);
    }
}
