//! Client configuration constants.
//!
//! Defaults for [`ClientConfig`](crate::ClientConfig) live here so the RON
//! loader and the `Default` impls agree.

use std::time::Duration;

/// First retry delay after the change feed drops.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// Ceiling for the retry delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Growth factor applied after each failed attempt.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Fraction of each delay randomized (0.0 = none, 0.5 = ±50%).
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

/// Listener → processing task channel depth. A full channel applies
/// backpressure to the pump rather than dropping batches.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Session error channel depth. Errors beyond this are logged and dropped.
pub const DEFAULT_ERROR_CAPACITY: usize = 32;

/// Transaction descriptions kept by the mutator for undo-log display.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;
