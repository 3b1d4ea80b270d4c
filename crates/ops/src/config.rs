use std::time::Duration;

/// Timing knobs for orchestration runs. Built once at process start and
/// passed into [`crate::Orchestrator::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Poll interval of the reconciliation loop.
    pub tick: Duration,
    /// How long a service may stay failing before the run aborts or forces it.
    pub failure_timeout: Duration,
    /// Volume removal window; restarts whenever a volume disappears.
    pub volume_timeout: Duration,
    pub volume_poll: Duration,
    /// Overall bound for an image pull fan-out.
    pub pull_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(30),
            volume_timeout: Duration::from_secs(30),
            volume_poll: Duration::from_secs(1),
            pull_timeout: Duration::from_secs(5 * 120),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `AMP_TICK_MS`, `AMP_FAILURE_TIMEOUT_SECS`,
    /// `AMP_VOLUME_TIMEOUT_SECS`, `AMP_VOLUME_POLL_MS`, `AMP_PULL_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            tick: env_u64("AMP_TICK_MS").map(Duration::from_millis).unwrap_or(d.tick),
            failure_timeout: env_u64("AMP_FAILURE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.failure_timeout),
            volume_timeout: env_u64("AMP_VOLUME_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.volume_timeout),
            volume_poll: env_u64("AMP_VOLUME_POLL_MS").map(Duration::from_millis).unwrap_or(d.volume_poll),
            pull_timeout: env_u64("AMP_PULL_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.pull_timeout),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).filter(|v| *v > 0)
}
