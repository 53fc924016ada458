//! Worker count resolution.
//!
//! A [`WorkerCountProvider`] reports how many workers should run. The
//! reported value is re-read on every call, so operators can resize the pool
//! without a restart. Whatever it reports is bounded by hardware parallelism
//! through [`clamp_worker_count`].

/// Environment variable holding an explicit worker count.
pub const WORKER_COUNT_VAR: &str = "CE_WORKER_COUNT";
/// Environment variable holding the per-core multiplier used when no explicit count is set.
pub const CORE_MULTIPLIER_VAR: &str = "CE_CORE_MULTIPLIER";

const CORE_MULTIPLIER_DEFAULT: i64 = 1;
const CORE_MULTIPLIER_MAX: i64 = 3;

/// Dynamic source of the worker count.
pub trait WorkerCountProvider: Send + Sync {
    /// Number of workers the engine should run. May differ between calls.
    fn worker_count(&self) -> i64;
}

impl<F> WorkerCountProvider for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn worker_count(&self) -> i64 {
        self()
    }
}

/// Hardware parallelism available to this process, 1 when it cannot be determined.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Parse a core multiplier. Anything unparseable or outside `[1, 3]` yields 1.
pub fn resolve_core_multiplier(raw: Option<&str>) -> i64 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|mul| (CORE_MULTIPLIER_DEFAULT..=CORE_MULTIPLIER_MAX).contains(mul))
        .unwrap_or(CORE_MULTIPLIER_DEFAULT)
}

/// Bound a reported worker count: non-positive or above `cores` falls back to `cores`.
pub fn clamp_worker_count(reported: i64, cores: usize) -> usize {
    match usize::try_from(reported) {
        Ok(count) if count > 0 && count <= cores => count,
        _ => cores,
    }
}

type VarLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads [`WORKER_COUNT_VAR`], falling back to `cores * multiplier`.
pub struct EnvWorkerCountProvider {
    cores: usize,
    lookup: VarLookup,
}

impl EnvWorkerCountProvider {
    /// Provider backed by the process environment.
    pub fn new() -> Self {
        Self::with_lookup(available_cores(), |name| std::env::var(name).ok())
    }

    /// Provider with an explicit core count and variable lookup.
    pub fn with_lookup(
        cores: usize,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            cores,
            lookup: Box::new(lookup),
        }
    }

    fn sized_from_cores(&self) -> i64 {
        let multiplier = resolve_core_multiplier((self.lookup)(CORE_MULTIPLIER_VAR).as_deref());
        i64::try_from(self.cores).unwrap_or(i64::MAX) * multiplier
    }
}

impl Default for EnvWorkerCountProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerCountProvider for EnvWorkerCountProvider {
    fn worker_count(&self) -> i64 {
        match (self.lookup)(WORKER_COUNT_VAR).and_then(|v| v.trim().parse::<i64>().ok()) {
            Some(count) => count,
            None => self.sized_from_cores(),
        }
    }
}
