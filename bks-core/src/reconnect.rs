//! Reconnection utilities with exponential backoff support.
//!
//! Workers use this to pace connection attempts to their coordinator and to
//! decide when to stop trying.

use crate::options::EndpointOptions;
use std::time::{Duration, Instant};

/// Reconnection state tracker for managing connection attempts and backoff.
///
/// # Example
///
/// ```rust
/// use bks_core::reconnect::ReconnectState;
/// use bks_core::options::EndpointOptions;
/// use std::time::Duration;
///
/// let options = EndpointOptions::default()
///     .with_reconnect_ivl(Duration::from_millis(100))
///     .with_reconnect_ivl_max(Duration::from_secs(10));
///
/// let mut reconnect = ReconnectState::new(&options);
///
/// // First attempt uses base interval
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
///
/// // Subsequent attempts use exponential backoff
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(200));
///
/// // Reset on successful connection
/// reconnect.reset();
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectState {
    /// Base reconnection interval
    base_interval: Duration,
    /// Maximum reconnection interval
    max_interval: Duration,
    /// Give up after this long without a connection
    max_wait: Option<Duration>,
    /// Current reconnection attempt (0 = first attempt)
    attempt: u32,
    /// Current backoff interval
    current_interval: Duration,
    /// Start of the current run of failed attempts
    waiting_since: Option<Instant>,
}

impl ReconnectState {
    /// Create a new reconnection state tracker from endpoint options.
    #[must_use]
    pub const fn new(options: &EndpointOptions) -> Self {
        Self {
            base_interval: options.reconnect_ivl,
            max_interval: options.reconnect_ivl_max,
            max_wait: options.max_connect_wait,
            attempt: 0,
            current_interval: options.reconnect_ivl,
            waiting_since: None,
        }
    }

    /// Get the delay for the next reconnection attempt.
    ///
    /// The delay doubles with each attempt until it reaches
    /// `reconnect_ivl_max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_interval;

        self.attempt += 1;
        self.current_interval = self.base_interval * (1_u32 << self.attempt.min(10));

        if self.current_interval > self.max_interval {
            self.current_interval = self.max_interval;
        }

        delay
    }

    /// Record a failed attempt and check the overall wait budget.
    ///
    /// # Errors
    ///
    /// Returns [`ReconnectError::MaxWaitExceeded`] once attempts have kept
    /// failing for longer than `max_connect_wait`.
    pub fn record_failure(&mut self, now: Instant) -> Result<(), ReconnectError> {
        let since = *self.waiting_since.get_or_insert(now);
        match self.max_wait {
            Some(max) if now.saturating_duration_since(since) >= max => {
                Err(ReconnectError::MaxWaitExceeded {
                    attempts: self.attempt + 1,
                    waited: now.saturating_duration_since(since),
                })
            }
            _ => Ok(()),
        }
    }

    /// Reset the reconnection state after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_interval = self.base_interval;
        self.waiting_since = None;
    }

    /// Get the current attempt number.
    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Error type for reconnection operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    /// No connection succeeded within the configured wait
    MaxWaitExceeded { attempts: u32, waited: Duration },
}

impl std::fmt::Display for ReconnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxWaitExceeded { attempts, waited } => {
                write!(f, "Gave up after {attempts} connection attempts over {waited:?}")
            }
        }
    }
}

impl std::error::Error for ReconnectError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let options = EndpointOptions::default()
            .with_reconnect_ivl(Duration::from_millis(100))
            .with_reconnect_ivl_max(Duration::from_secs(10));

        let mut state = ReconnectState::new(&options);

        assert_eq!(state.next_delay(), Duration::from_millis(100));
        assert_eq!(state.attempt(), 1);

        assert_eq!(state.next_delay(), Duration::from_millis(200));
        assert_eq!(state.next_delay(), Duration::from_millis(400));
        assert_eq!(state.next_delay(), Duration::from_millis(800));
        assert_eq!(state.attempt(), 4);
    }

    #[test]
    fn test_max_interval_cap() {
        let options = EndpointOptions::default()
            .with_reconnect_ivl(Duration::from_millis(100))
            .with_reconnect_ivl_max(Duration::from_millis(500));

        let mut state = ReconnectState::new(&options);

        assert_eq!(state.next_delay(), Duration::from_millis(100));
        assert_eq!(state.next_delay(), Duration::from_millis(200));
        assert_eq!(state.next_delay(), Duration::from_millis(400));

        // Should be capped at max
        assert_eq!(state.next_delay(), Duration::from_millis(500));
        assert_eq!(state.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_reset() {
        let options = EndpointOptions::default()
            .with_reconnect_ivl(Duration::from_millis(100))
            .with_reconnect_ivl_max(Duration::from_secs(10));

        let mut state = ReconnectState::new(&options);

        state.next_delay();
        state.next_delay();
        state.next_delay();
        assert_eq!(state.attempt(), 3);

        state.reset();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_max_wait() {
        let options = EndpointOptions::default().with_max_connect_wait(Some(Duration::from_secs(5)));
        let mut state = ReconnectState::new(&options);
        let start = Instant::now();

        assert!(state.record_failure(start).is_ok());
        assert!(state.record_failure(start + Duration::from_secs(4)).is_ok());
        assert!(matches!(
            state.record_failure(start + Duration::from_secs(5)),
            Err(ReconnectError::MaxWaitExceeded { .. })
        ));

        // A successful connection restarts the budget.
        state.reset();
        assert!(state.record_failure(start + Duration::from_secs(6)).is_ok());
    }

    #[test]
    fn test_unbounded_wait() {
        let mut state = ReconnectState::new(&EndpointOptions::default());
        let start = Instant::now();
        assert!(state.record_failure(start).is_ok());
        assert!(state.record_failure(start + Duration::from_secs(86_400)).is_ok());
    }
}
