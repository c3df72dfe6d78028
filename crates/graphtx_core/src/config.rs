//! Engine configuration.

use std::time::Duration;

/// Configuration for a [`crate::Domain`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of precommit trigger-command iterations before the
    /// commit fails closed with `TriggerLoopExceeded`.
    pub max_trigger_iterations: usize,

    /// Number of times a queued writer may be bypassed by readers before
    /// new readers are made to wait behind it.
    pub writer_priority_after: u32,

    /// How often a blocked lock wait re-checks its cancellation token.
    pub wait_slice: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_trigger_iterations: 32,
            writer_priority_after: 3,
            wait_slice: Duration::from_millis(50),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the trigger-loop iteration cap.
    #[must_use]
    pub const fn max_trigger_iterations(mut self, value: usize) -> Self {
        self.max_trigger_iterations = value;
        self
    }

    /// Sets how many reader bypasses a queued writer tolerates.
    #[must_use]
    pub const fn writer_priority_after(mut self, value: u32) -> Self {
        self.writer_priority_after = value;
        self
    }

    /// Sets the cancellation re-check interval for blocked waits.
    #[must_use]
    pub const fn wait_slice(mut self, value: Duration) -> Self {
        self.wait_slice = value;
        self
    }
}
