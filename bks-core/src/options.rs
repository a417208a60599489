//! Endpoint configuration options
//!
//! Options shared by the coordinator (listening side) and workers
//! (connecting side): negotiation limits, timer resolution, reconnection
//! backoff and buffer sizing.

use std::time::Duration;

/// Default read buffer size (8KB)
pub const DEFAULT_READ_BUF_SIZE: usize = 8192;

/// Default negotiation timeout (60 seconds)
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of concurrently negotiating connections
pub const DEFAULT_MAX_NEGOTIATIONS: usize = 20;

/// Default housekeeping tick of the I/O loop (5 seconds)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Endpoint configuration options.
///
/// # Examples
///
/// ```
/// use bks_core::options::EndpointOptions;
/// use std::time::Duration;
///
/// let opts = EndpointOptions::default()
///     .with_negotiation_timeout(Duration::from_secs(10))
///     .with_reconnect_ivl(Duration::from_millis(250));
/// ```
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Negotiation timeout
    ///
    /// A connection that has not completed session establishment within
    /// this time is aborted and its session id released.
    /// - Default: 60 seconds
    pub negotiation_timeout: Duration,

    /// Maximum number of connections negotiating at the same time.
    ///
    /// When a new connection arrives while the limit is reached the oldest
    /// negotiation is aborted.
    /// - Default: 20
    pub max_negotiations: usize,

    /// Housekeeping tick.
    ///
    /// Upper bound on how long the I/O loop waits before checking timeouts
    /// and keepalives when no socket or wake event arrives.
    /// - Default: 5 seconds
    pub poll_interval: Duration,

    /// Reconnect interval
    ///
    /// Initial reconnection delay after connection loss (workers only).
    /// - Default: 100ms
    pub reconnect_ivl: Duration,

    /// Maximum reconnect interval
    ///
    /// Upper bound for the exponential backoff.
    /// - Default: 30 seconds
    pub reconnect_ivl_max: Duration,

    /// Maximum time a worker keeps trying to reach its coordinator.
    ///
    /// - `None`: retry forever (default)
    /// - `Some(duration)`: give up once no connection succeeded for this long
    pub max_connect_wait: Option<Duration>,

    /// Connection timeout
    ///
    /// Maximum time to wait for a TCP connect to complete.
    /// - `None`: use the OS default (default)
    pub connect_timeout: Option<Duration>,

    /// Read buffer size (bytes)
    ///
    /// Capacity of each buffer handed to the kernel by the reader task.
    /// - Default: 8192 (8KB)
    pub read_buffer_size: usize,

    /// Disable Nagle's algorithm on every connection.
    /// - Default: true
    pub tcp_nodelay: bool,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            max_negotiations: DEFAULT_MAX_NEGOTIATIONS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::from_secs(30),
            max_connect_wait: None,
            connect_timeout: None,
            read_buffer_size: DEFAULT_READ_BUF_SIZE,
            tcp_nodelay: true,
        }
    }
}

impl EndpointOptions {
    /// Create new endpoint options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the negotiation timeout.
    #[must_use]
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Set the maximum number of concurrent negotiations (at least 1).
    #[must_use]
    pub fn with_max_negotiations(mut self, max: usize) -> Self {
        self.max_negotiations = max.max(1);
        self
    }

    /// Set the housekeeping tick.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the initial reconnect interval.
    #[must_use]
    pub fn with_reconnect_ivl(mut self, ivl: Duration) -> Self {
        self.reconnect_ivl = ivl;
        self
    }

    /// Set the maximum reconnect interval.
    #[must_use]
    pub fn with_reconnect_ivl_max(mut self, max: Duration) -> Self {
        self.reconnect_ivl_max = max;
        self
    }

    /// Give up reconnecting after `wait` without a successful connection.
    #[must_use]
    pub fn with_max_connect_wait(mut self, wait: Option<Duration>) -> Self {
        self.max_connect_wait = wait;
        self
    }

    /// Set the TCP connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the read buffer size.
    ///
    /// Very small buffers only cost extra reads; the frame decoder copes
    /// with frames split across any number of reads.
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(64);
        self
    }

    /// Enable or disable TCP_NODELAY.
    #[must_use]
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }
}
