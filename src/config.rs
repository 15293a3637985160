//! Manager and pool configuration options

use std::time::Duration;

const DEFAULT_MAX_CONNECTION_SIZE: usize = 8;
const DEFAULT_BORROW_TIMEOUT: Duration = Duration::from_millis(3_600_000);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(300_000);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
const DEFAULT_SCHEDULE_PERIOD: Duration = Duration::from_millis(600_000);
const DEFAULT_BORROW_MAX_WAIT: Duration = Duration::from_millis(60_000);

/// Configuration for connection manager behavior
///
/// # Examples
///
/// ```
/// use esox_connection_manager::ManagerConfiguration;
/// use std::time::Duration;
///
/// let config = ManagerConfiguration::new()
///     .with_max_connection_size(4)
///     .with_idle_timeout(Duration::from_secs(60))
///     .with_auto_inspect(false);
///
/// assert_eq!(config.max_connection_size, 4);
/// assert_eq!(config.borrow_timeout, Duration::from_secs(3600));
/// assert!(!config.auto_inspect);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfiguration {
    /// Maximum number of connections per identity, across all execution contexts
    pub max_connection_size: usize,

    /// How long a slot may stay borrowed before it is forced back to idle
    pub borrow_timeout: Duration,

    /// How long a slot may stay idle before it is closed
    pub idle_timeout: Duration,

    /// Passed to the handle when opening a session
    pub connect_timeout: Duration,

    /// Period of the background inspection
    pub schedule_period: Duration,

    /// Whether the background inspection runs
    pub auto_inspect: bool,

    /// How long the pooled manager waits for a free handle
    pub borrow_max_wait: Duration,
}

impl Default for ManagerConfiguration {
    fn default() -> Self {
        Self {
            max_connection_size: DEFAULT_MAX_CONNECTION_SIZE,
            borrow_timeout: DEFAULT_BORROW_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            schedule_period: DEFAULT_SCHEDULE_PERIOD,
            auto_inspect: true,
            borrow_max_wait: DEFAULT_BORROW_MAX_WAIT,
        }
    }
}

impl ManagerConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections per identity
    pub fn with_max_connection_size(mut self, size: usize) -> Self {
        self.max_connection_size = size;
        self
    }

    /// Set the borrow timeout
    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_timeout = timeout;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_schedule_period(mut self, period: Duration) -> Self {
        self.schedule_period = period;
        self
    }

    pub fn with_auto_inspect(mut self, enabled: bool) -> Self {
        self.auto_inspect = enabled;
        self
    }

    /// Set the pooled borrow wait
    pub fn with_borrow_max_wait(mut self, wait: Duration) -> Self {
        self.borrow_max_wait = wait;
        self
    }

    /// The generic pool settings the pooled manager derives from this configuration
    pub fn pool_configuration(&self) -> PoolConfiguration {
        PoolConfiguration::new()
            .with_max_pool_size(self.max_connection_size)
            .with_idle_timeout(self.idle_timeout)
            .with_max_wait(self.borrow_max_wait)
    }
}

/// Configuration for a generic object pool
///
/// # Examples
///
/// ```
/// use esox_connection_manager::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_max_pool_size(16)
///     .with_max_wait(Duration::from_millis(250));
///
/// assert_eq!(config.max_pool_size, 16);
/// assert_eq!(config.idle_timeout, None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfiguration {
    /// Maximum number of objects alive at once, idle and borrowed together
    pub max_pool_size: usize,

    /// Idle objects older than this are destroyed
    pub idle_timeout: Option<Duration>,

    /// How long a blocking borrow waits for a free object
    pub max_wait: Duration,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_CONNECTION_SIZE,
            idle_timeout: None,
            max_wait: DEFAULT_BORROW_MAX_WAIT,
        }
    }
}

impl PoolConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }
}
