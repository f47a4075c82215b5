use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_FETCH_BACKOFF_INITIAL_MS: u64 = 250;
const DEFAULT_FETCH_BACKOFF_MAX_SECS: u64 = 5;

/// Runtime configuration for a processing run.
///
/// All instances must be constructed via [`RunConfig::builder`] or
/// [`RunConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    chunk_size: usize,
    worker_count: usize,
    queue_capacity: usize,
    max_retries: u32,
    fetch_backoff_initial: Duration,
    fetch_backoff_max: Duration,
    metrics_interval: Duration,
}

pub struct RunConfigParams {
    pub chunk_size: usize,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub fetch_backoff_initial: Duration,
    pub fetch_backoff_max: Duration,
    pub metrics_interval: Duration,
}

impl RunConfig {
    /// Returns a builder to incrementally construct and validate a
    /// configuration.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`RunConfig::builder`] when many values use defaults.
    pub fn new(params: RunConfigParams) -> Result<Self> {
        let RunConfigParams {
            chunk_size,
            worker_count,
            queue_capacity,
            max_retries,
            fetch_backoff_initial,
            fetch_backoff_max,
            metrics_interval,
        } = params;

        let config = Self {
            chunk_size,
            worker_count,
            queue_capacity,
            max_retries,
            fetch_backoff_initial,
            fetch_backoff_max,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Number of rows fetched per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of concurrent worker tasks.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Maximum number of fetched-but-unprocessed chunks buffered between the
    /// reader and the workers.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Retry budget shared by transient fetch errors and retryable chunk
    /// failures.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Initial delay of the exponential backoff applied to transient errors.
    pub fn fetch_backoff_initial(&self) -> Duration {
        self.fetch_backoff_initial
    }

    /// Upper bound of the exponential backoff delay.
    pub fn fetch_backoff_max(&self) -> Duration {
        self.fetch_backoff_max
    }

    /// Interval used by the metrics reporter task.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than 0");
        }

        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }

        if self.queue_capacity < self.worker_count {
            bail!(
                "queue_capacity ({}) must be at least worker_count ({})",
                self.queue_capacity,
                self.worker_count
            );
        }

        if self.fetch_backoff_initial.is_zero() {
            bail!("fetch_backoff_initial must be greater than 0");
        }

        if self.fetch_backoff_max < self.fetch_backoff_initial {
            bail!("fetch_backoff_max must be at least fetch_backoff_initial");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct RunConfigBuilder {
    chunk_size: Option<usize>,
    worker_count: Option<usize>,
    queue_capacity: Option<usize>,
    max_retries: Option<u32>,
    fetch_backoff_initial: Option<Duration>,
    fetch_backoff_max: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl RunConfigBuilder {
    pub fn chunk_size(mut self, rows: usize) -> Self {
        self.chunk_size = Some(rows);
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn queue_capacity(mut self, chunks: usize) -> Self {
        self.queue_capacity = Some(chunks);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn fetch_backoff_initial(mut self, delay: Duration) -> Self {
        self.fetch_backoff_initial = Some(delay);
        self
    }

    pub fn fetch_backoff_max(mut self, delay: Duration) -> Self {
        self.fetch_backoff_max = Some(delay);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<RunConfig> {
        let worker_count = self.worker_count.context("worker_count is required")?;
        let params = RunConfigParams {
            chunk_size: self.chunk_size.context("chunk_size is required")?,
            worker_count,
            queue_capacity: self.queue_capacity.unwrap_or(worker_count),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            fetch_backoff_initial: self
                .fetch_backoff_initial
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_FETCH_BACKOFF_INITIAL_MS)),
            fetch_backoff_max: self
                .fetch_backoff_max
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_FETCH_BACKOFF_MAX_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(crate::runtime::telemetry::DEFAULT_METRICS_INTERVAL),
        };

        RunConfig::new(params)
    }
}
