use thiserror::Error;

/// Default capacity of the graph's ready ring.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Default prefix of worker thread names.
pub const DEFAULT_THREAD_NAME: &str = "ctg-worker";

/// Error returned when a constructor-time parameter is out of range.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Queue capacity is not a power of two, or is smaller than two.
    #[error("queue capacity must be a power of two and at least 2, got {capacity}")]
    QueueCapacity {
        /// Rejected capacity.
        capacity: usize,
    },
    /// Handle pool capacity is zero or does not fit a `u32` index.
    #[error("handle pool capacity must be in 1..={max}, got {capacity}", max = u32::MAX)]
    PoolCapacity {
        /// Rejected capacity.
        capacity: usize,
    },
    /// A task graph needs at least one worker thread.
    #[error("task graph needs at least one worker thread")]
    ZeroWorkers,
}

/// Constructor-time parameters of a [`TaskGraph`](crate::graph::TaskGraph).
///
/// None of these can be changed once the graph is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGraphConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Capacity of the lock-free ready ring. Must be a power of two.
    pub queue_capacity: usize,
    /// Prefix of worker thread names; the worker index is appended.
    pub thread_name: String,
}

impl Default for TaskGraphConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl TaskGraphConfig {
    /// Sets the number of worker threads.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the ready ring capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Checks every parameter.
    ///
    /// # Errors
    /// If the worker count is zero or the queue capacity is not a power of two
    /// of at least 2.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        validate_queue_capacity(self.queue_capacity)
    }
}

pub(crate) fn validate_queue_capacity(capacity: usize) -> Result<(), ConfigError> {
    if capacity < 2 || !capacity.is_power_of_two() {
        return Err(ConfigError::QueueCapacity { capacity });
    }
    Ok(())
}

pub(crate) fn validate_pool_capacity(capacity: usize) -> Result<u32, ConfigError> {
    match u32::try_from(capacity) {
        Ok(capacity) if capacity > 0 => Ok(capacity),
        _ => Err(ConfigError::PoolCapacity { capacity }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = TaskGraphConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_parameters() {
        let config = TaskGraphConfig::default().with_workers(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroWorkers));

        for capacity in [0, 1, 3, 1000] {
            let config = TaskGraphConfig::default().with_queue_capacity(capacity);
            assert_eq!(
                config.validate(),
                Err(ConfigError::QueueCapacity { capacity })
            );
        }
        assert_eq!(
            TaskGraphConfig::default()
                .with_queue_capacity(2)
                .with_thread_name("io")
                .validate(),
            Ok(())
        );
    }

    #[test]
    fn pool_capacity_bounds() {
        assert_eq!(
            validate_pool_capacity(0),
            Err(ConfigError::PoolCapacity { capacity: 0 })
        );
        assert_eq!(validate_pool_capacity(17), Ok(17));
    }
}
