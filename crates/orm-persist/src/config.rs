//! Executor configuration.

use std::time::{SystemTime, UNIX_EPOCH};

/// Configuration for [`PersistExecutor`](crate::PersistExecutor) behavior.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Whether the executor may open (and then commit or roll back) its own
    /// transaction when none is active.
    pub transaction: bool,
    /// Whether before/after lifecycle broadcasts run.
    pub listeners: bool,
    /// Whether generated ids, dates, versions and tree levels are written
    /// back onto entities after a successful batch.
    pub reload: bool,
    /// Clock for date columns, in microseconds since the Unix epoch.
    /// Read once per batch.
    pub clock: fn() -> i64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            transaction: true,
            listeners: true,
            reload: true,
            clock: system_clock,
        }
    }
}

impl PersistConfig {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `transaction` option (builder pattern).
    #[must_use]
    pub fn transaction(mut self, value: bool) -> Self {
        self.transaction = value;
        self
    }

    /// Set the `listeners` option (builder pattern).
    #[must_use]
    pub fn listeners(mut self, value: bool) -> Self {
        self.listeners = value;
        self
    }

    /// Set the `reload` option (builder pattern).
    #[must_use]
    pub fn reload(mut self, value: bool) -> Self {
        self.reload = value;
        self
    }

    /// Set the clock used for date columns (builder pattern).
    #[must_use]
    pub fn clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Read the configured clock.
    pub fn now(&self) -> i64 {
        (self.clock)()
    }
}

/// Microseconds since the Unix epoch, 0 if the system clock is before it.
pub fn system_clock() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PersistConfig::default();
        assert!(config.transaction);
        assert!(config.listeners);
        assert!(config.reload);
        assert!(config.now() > 0);
    }

    #[test]
    fn test_builder() {
        let config = PersistConfig::new()
            .transaction(false)
            .listeners(false)
            .reload(false)
            .clock(|| 42);
        assert!(!config.transaction);
        assert!(!config.listeners);
        assert!(!config.reload);
        assert_eq!(config.now(), 42);
    }
}
