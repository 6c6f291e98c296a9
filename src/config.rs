use crate::error::{Error, Result};
use crate::executor::PanicStrategy;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub num_threads: Option<usize>,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,

    /// Upper bound on how long an idle worker sleeps before re-checking
    /// lifecycle and delayed tasks, even without a wake-up signal.
    pub idle_timeout: Duration,

    /// A queued task counts as overdue once its eligibility time lies this
    /// far in the past.
    pub overdue_grace: Duration,

    /// When set, any single `body` call running longer than this is logged.
    pub slow_task_threshold: Option<Duration>,

    pub panic_strategy: PanicStrategy,

    pub registry_cleanup_threshold: usize,
    pub registry_scan_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: None,
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "kriya-worker".to_string(),
            idle_timeout: Duration::from_millis(100),
            overdue_grace: Duration::from_secs(1),
            slow_task_threshold: None,
            panic_strategy: PanicStrategy::default(),
            registry_cleanup_threshold: 64,
            registry_scan_budget: 16,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.num_threads {
            if n == 0 {
                return Err(Error::config("num_threads must be > 0"));
            }
            if n > 1024 {
                return Err(Error::config("num_threads too large (max 1024)"));
            }
        }

        if self.idle_timeout.is_zero() {
            return Err(Error::config("idle_timeout must be > 0"));
        }

        if let Some(threshold) = self.slow_task_threshold {
            if threshold.is_zero() {
                return Err(Error::config("slow_task_threshold must be > 0"));
            }
        }

        if self.registry_cleanup_threshold == 0 {
            return Err(Error::config("registry_cleanup_threshold must be > 0"));
        }
        if self.registry_scan_budget == 0 {
            return Err(Error::config("registry_scan_budget must be > 0"));
        }

        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = Some(n);
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn overdue_grace(mut self, grace: Duration) -> Self {
        self.config.overdue_grace = grace;
        self
    }

    pub fn slow_task_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_task_threshold = Some(threshold);
        self
    }

    pub fn panic_strategy(mut self, strategy: PanicStrategy) -> Self {
        self.config.panic_strategy = strategy;
        self
    }

    pub fn registry_cleanup(mut self, threshold: usize, scan_budget: usize) -> Self {
        self.config.registry_cleanup_threshold = threshold;
        self.config.registry_scan_budget = scan_budget;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
