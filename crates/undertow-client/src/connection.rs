// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Online-state tracking and retry pacing for the pull/push loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use exponential_backoff::Backoff;

use crate::options::RequestOptions;

/// Edge-triggered online flag: the callback fires once per transition.
pub(crate) struct OnlineTracker {
    online: AtomicBool,
    callback: Option<Arc<dyn Fn(bool) + Send + Sync>>,
}

impl OnlineTracker {
    pub(crate) fn new(callback: Option<Arc<dyn Fn(bool) + Send + Sync>>) -> Self {
        Self {
            online: AtomicBool::new(true),
            callback,
        }
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns `true` when this call was the transition edge.
    pub(crate) fn set(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        let transitioned = previous != online;
        if transitioned {
            tracing::info!(online, "connectivity changed");
            if let Some(callback) = &self.callback {
                callback(online);
            }
        }
        transitioned
    }
}

/// Bounded exponential retry delays for transport failures.
pub(crate) struct RetryBackoff {
    backoff: Backoff,
    attempt: u32,
    max: Duration,
}

impl RetryBackoff {
    pub(crate) fn new(options: RequestOptions) -> Self {
        let max = Duration::from_millis(options.max_delay_ms);
        Self {
            backoff: Backoff::new(
                u32::MAX,
                Duration::from_millis(options.min_delay_ms),
                Some(max),
            ),
            attempt: 0,
            max,
        }
    }

    /// Next delay; grows per failed attempt up to the configured maximum.
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.backoff.next(self.attempt).unwrap_or(self.max)
    }

    /// A success resets the sequence.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}
