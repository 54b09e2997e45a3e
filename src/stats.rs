//! Process-wide counters shared across every [`Worker`](crate::worker::Worker).
//!
//! Everything here has at least one writer per key and may have many
//! readers; readers accept eventually-consistent snapshots. We keep this as
//! a single struct with interior mutability rather than scattering module
//! globals, so status-line reporting doesn't leak process-wide state into
//! unrelated modules.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// How far back we look when computing rates like `kudos_per_hour`. Must be
/// >1 minute and <24 hours; we use 5 minutes, which is responsive enough to
/// reflect a worker's current throughput without being noisy.
const SAMPLE_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Completion {
    at: Instant,
    kudos: f64,
}

#[derive(Debug, Default)]
struct Inner {
    completions: Vec<Completion>,
    pop_latencies_by_node: HashMap<String, Vec<Duration>>,
    last_job_at: Option<Instant>,
    last_job_model: Option<String>,
    running_models: HashMap<String, u32>,
}

impl Inner {
    fn prune(&mut self, now: Instant) {
        self.completions
            .retain(|c| now.duration_since(c.at) <= SAMPLE_WINDOW);
    }
}

/// Shared, thread-safe counters. Cheaply cloneable; all clones refer to the
/// same underlying state.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl Stats {
    /// Create a fresh, empty set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a job finished successfully and earned `kudos`.
    pub fn record_job_completion(&self, model: &str, kudos: f64) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner.prune(now);
        inner.completions.push(Completion { at: now, kudos });
        inner.last_job_at = Some(now);
        inner.last_job_model = Some(model.to_string());
    }

    /// Record the latency of a dispatcher pop, optionally attributed to the
    /// `horde-node` that served it.
    pub fn record_pop_latency(&self, node: Option<&str>, latency: Duration) {
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner
            .pop_latencies_by_node
            .entry(node.unwrap_or("unknown").to_string())
            .or_default()
            .push(latency);
    }

    /// Record how many jobs a worker currently has in flight, for the
    /// "running models" query used by status messages.
    pub fn set_worker_running(&self, worker_name: &str, running: u32) {
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner
            .running_models
            .insert(worker_name.to_string(), running);
    }

    /// Jobs completed per hour, over the sample window.
    pub fn jobs_per_hour(&self) -> f64 {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner.prune(now);
        rate_per_hour(inner.completions.len() as f64, SAMPLE_WINDOW)
    }

    /// Kudos earned per hour, over the sample window.
    pub fn kudos_per_hour(&self) -> f64 {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner.prune(now);
        let total_kudos: f64 = inner.completions.iter().map(|c| c.kudos).sum();
        rate_per_hour(total_kudos, SAMPLE_WINDOW)
    }

    /// How long it's been since any worker completed a job.
    pub fn time_since_last_job(&self) -> Option<Duration> {
        let inner = self.inner.lock().expect("stats mutex poisoned");
        inner.last_job_at.map(|at| Instant::now().duration_since(at))
    }

    /// The model of the most recently completed job, if any.
    pub fn last_job_model(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("stats mutex poisoned")
            .last_job_model
            .clone()
    }

    /// A snapshot of which workers are currently running jobs, and how many.
    pub fn running_models(&self) -> HashMap<String, u32> {
        self.inner
            .lock()
            .expect("stats mutex poisoned")
            .running_models
            .clone()
    }
}

fn rate_per_hour(total: f64, window: Duration) -> f64 {
    if window.is_zero() {
        return 0.0;
    }
    total * 3600.0 / window.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kudos_and_jobs_per_hour_reflect_recent_completions() {
        let stats = Stats::new();
        stats.record_job_completion("gridbridge/gpt2", 5.0);
        stats.record_job_completion("gridbridge/gpt2", 5.0);
        assert!(stats.kudos_per_hour() > 0.0);
        assert!(stats.jobs_per_hour() > 0.0);
        assert_eq!(stats.last_job_model().as_deref(), Some("gridbridge/gpt2"));
    }

    #[test]
    fn running_models_snapshot_reflects_latest_set() {
        let stats = Stats::new();
        stats.set_worker_running("worker-1", 2);
        stats.set_worker_running("worker-2", 0);
        let snapshot = stats.running_models();
        assert_eq!(snapshot.get("worker-1"), Some(&2));
        assert_eq!(snapshot.get("worker-2"), Some(&0));
    }
}
