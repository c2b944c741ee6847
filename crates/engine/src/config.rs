//! Configuration for the leader sync processor.

use std::time::Duration;

use rand::Rng;

use crate::error::EngineError;

/// Upper bound for both push and pull batches.
pub const MAX_BATCH_SIZE: usize = 100;

/// How strictly the leader checks its own invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyMode {
    /// No extra checks.
    #[default]
    Off,
    /// Materializer output is hashed and compared with the hash recorded the
    /// last time the same event was applied, and appended events must have
    /// their parent in the log.
    Checked,
}

impl ConsistencyMode {
    pub fn is_checked(&self) -> bool {
        matches!(self, Self::Checked)
    }
}

/// Whether boot waits for the first pull from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialSyncOptions {
    #[default]
    Skip,
    /// Pull until caught up or until `timeout` elapses, then continue offline.
    Blocking { timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of events per backend push.
    pub push_batch_size: usize,
    /// Maximum number of events requested per backend pull.
    pub pull_batch_size: usize,
    pub retry: RetryConfig,
    pub consistency: ConsistencyMode,
    pub initial_sync: InitialSyncOptions,
    /// Drop changesets of confirmed events. They cannot be rolled back anyway.
    pub prune_confirmed_changesets: bool,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            push_batch_size: MAX_BATCH_SIZE,
            pull_batch_size: MAX_BATCH_SIZE,
            retry: RetryConfig::default(),
            consistency: ConsistencyMode::default(),
            initial_sync: InitialSyncOptions::default(),
            prune_confirmed_changesets: true,
        }
    }

    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_consistency(mut self, mode: ConsistencyMode) -> Self {
        self.consistency = mode;
        self
    }

    pub fn with_initial_sync(mut self, initial_sync: InitialSyncOptions) -> Self {
        self.initial_sync = initial_sync;
        self
    }

    pub fn with_prune_confirmed_changesets(mut self, prune: bool) -> Self {
        self.prune_confirmed_changesets = prune;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, size) in [
            ("push_batch_size", self.push_batch_size),
            ("pull_batch_size", self.pull_batch_size),
        ] {
            if size == 0 || size > MAX_BATCH_SIZE {
                return Err(EngineError::InvalidConfig(format!(
                    "{name} must be between 1 and {MAX_BATCH_SIZE}, got {size}"
                )));
            }
        }
        if let RetrySchedule::Exponential { multiplier, .. } = self.retry.schedule
            && !(multiplier.is_finite() && multiplier >= 1.0)
        {
            return Err(EngineError::InvalidConfig(format!(
                "retry multiplier must be a finite number >= 1, got {multiplier}"
            )));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetrySchedule {
    Exponential {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    },
    Fixed(Duration),
}

/// Delay schedule for reconnecting after a transport failure.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub schedule: RetrySchedule,
    /// Adds up to 25% random jitter to every delay.
    pub add_jitter: bool,
}

impl RetryConfig {
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            schedule: RetrySchedule::Exponential {
                initial_delay,
                max_delay,
                multiplier: 2.0,
            },
            add_jitter: true,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            schedule: RetrySchedule::Fixed(delay),
            add_jitter: false,
        }
    }

    /// Retry on every tick.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_multiplier(mut self, value: f64) -> Self {
        if let RetrySchedule::Exponential { multiplier, .. } = &mut self.schedule {
            *multiplier = value;
        }
        self
    }

    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay before attempt `attempt` (0-indexed; attempt 0 is immediate).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_secs = match self.schedule {
            RetrySchedule::Fixed(delay) => delay.as_secs_f64(),
            RetrySchedule::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let base = initial_delay.as_secs_f64()
                    * multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
                base.min(max_delay.as_secs_f64())
            }
        };
        // a negative or NaN multiplier must not produce a negative duration
        let delay_secs = delay_secs.max(0.0);

        if self.add_jitter && delay_secs > 0.0 {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100), Duration::from_secs(30))
    }
}
