//! Compute engine configuration.
//!
//! [`CeConfiguration`] is built once at startup from [`Settings`]. When a
//! [`WorkerCountProvider`] is supplied, the worker count is re-resolved on
//! every read; otherwise it is fixed for the life of the process.
//!
//! Without a provider: `worker_max_count` is the hardware parallelism and
//! `worker_count` is `min(ce.worker_count, worker_max_count)`, with
//! `ce.worker_count` defaulting to 1.

pub mod settings;
pub mod worker_count;

pub use settings::Settings;
pub use worker_count::{EnvWorkerCountProvider, WorkerCountProvider};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use worker_count::{available_cores, clamp_worker_count};

/// Static worker count used when no dynamic provider is configured.
pub const WORKER_COUNT_KEY: &str = "ce.worker_count";
/// How long a graceful stop waits for in-flight tasks.
pub const GRACEFUL_STOP_TIMEOUT_KEY: &str = "ce.graceful_stop_timeout_ms";

const DEFAULT_WORKER_COUNT: usize = 1;
// 6 hours
const DEFAULT_GRACEFUL_STOP_TIMEOUT_MS: u64 = 6 * 60 * 60 * 1000;
const QUEUE_POLLING_DELAY: Duration = Duration::from_secs(2);
const CLEAN_TASKS_INITIAL_DELAY: Duration = Duration::ZERO;
const CLEAN_TASKS_DELAY: Duration = Duration::from_secs(2 * 60);

pub struct CeConfiguration {
    provider: Option<Arc<dyn WorkerCountProvider>>,
    static_worker_count: usize,
    worker_max_count: usize,
    graceful_stop_timeout: Duration,
}

impl CeConfiguration {
    /// Build the configuration against this host's parallelism.
    pub fn new(settings: &Settings, provider: Option<Arc<dyn WorkerCountProvider>>) -> Self {
        Self::with_available_cores(settings, provider, available_cores())
    }

    /// Build the configuration against an explicit core count.
    pub fn with_available_cores(
        settings: &Settings,
        provider: Option<Arc<dyn WorkerCountProvider>>,
        cores: usize,
    ) -> Self {
        let worker_max_count = cores.max(1);
        let static_worker_count = settings
            .get_i64(WORKER_COUNT_KEY)
            .and_then(|count| usize::try_from(count).ok())
            .filter(|count| *count > 0)
            .unwrap_or(DEFAULT_WORKER_COUNT)
            .min(worker_max_count);
        let graceful_stop_timeout = Duration::from_millis(
            settings
                .get_u64(GRACEFUL_STOP_TIMEOUT_KEY)
                .unwrap_or(DEFAULT_GRACEFUL_STOP_TIMEOUT_MS),
        );

        let config = Self {
            provider,
            static_worker_count,
            worker_max_count,
            graceful_stop_timeout,
        };
        info!(
            worker_count = config.worker_count(),
            worker_max_count,
            dynamic = config.provider.is_some(),
            graceful_stop_timeout_ms = graceful_stop_timeout.as_millis() as u64,
            "compute engine configuration loaded"
        );
        config
    }

    /// Number of workers that should currently be enabled.
    pub fn worker_count(&self) -> usize {
        match &self.provider {
            Some(provider) => {
                let reported = provider.worker_count();
                let count = clamp_worker_count(reported, self.worker_max_count);
                if i64::try_from(count).ok() != Some(reported) {
                    debug!(
                        reported,
                        resolved = count,
                        "reported worker count out of range, using available cores"
                    );
                }
                count
            }
            None => self.static_worker_count,
        }
    }

    /// Hardware-derived ceiling on the number of workers. Informative, not enforced.
    pub fn worker_max_count(&self) -> usize {
        self.worker_max_count
    }

    /// Whether the worker count is re-read on every call.
    pub fn has_dynamic_worker_count(&self) -> bool {
        self.provider.is_some()
    }

    /// Pause between two queue polls of an idle worker.
    pub fn queue_polling_delay(&self) -> Duration {
        QUEUE_POLLING_DELAY
    }

    pub fn clean_tasks_initial_delay(&self) -> Duration {
        CLEAN_TASKS_INITIAL_DELAY
    }

    pub fn clean_tasks_delay(&self) -> Duration {
        CLEAN_TASKS_DELAY
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        self.graceful_stop_timeout
    }
}
