//! Configuration for bulk-watch sessions.

use std::time::Duration;

/// Default interval between authorization rechecks of an open watch.
pub const DEFAULT_PERMISSION_RECHECK: Duration = Duration::from_secs(10);

/// Default number of responses buffered for the outbound writer.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 100;

/// Configuration for one connection's [`Session`](super::Session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long an authorization decision is reused before an event
    /// triggers a new check. Zero rechecks on every event.
    pub permission_recheck: Duration,

    /// Close the connection when no frame was received or sent for this long.
    pub idle_timeout: Option<Duration>,

    /// Capacity of the outbound queue.
    ///
    /// When the client reads slower than watches produce, producers wait
    /// for room. Nothing is dropped.
    pub outbound_capacity: usize,

    /// Maximum number of concurrently open watches.
    pub max_watches: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            permission_recheck: DEFAULT_PERMISSION_RECHECK,
            idle_timeout: None,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_watches: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the permission recheck interval.
    pub fn with_permission_recheck(mut self, interval: Duration) -> Self {
        self.permission_recheck = interval;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the outbound queue capacity. A capacity of zero is raised to one.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Limit the number of concurrently open watches.
    pub fn with_max_watches(mut self, max: usize) -> Self {
        self.max_watches = Some(max);
        self
    }
}
