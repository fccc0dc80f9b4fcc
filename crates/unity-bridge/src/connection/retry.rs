//! Backoff between transport retries.

use std::time::Duration;

use rand::Rng;

use crate::error::TransportError;

const TRANSIENT_CAP: Duration = Duration::from_millis(250);
const RELOADING_CAP: Duration = Duration::from_secs(3);
const DEFAULT_CAP: Duration = Duration::from_millis(800);

/// How a failed attempt is treated when picking the next delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Refused, reset or timed out: the peer is usually back almost at once.
    Transient,
    /// The peer's status file says a domain reload is running.
    Reloading,
    Other,
}

impl FailureClass {
    pub fn classify(err: &TransportError, peer_reloading: bool) -> Self {
        if err.is_transient() {
            Self::Transient
        } else if peer_reloading {
            Self::Reloading
        } else {
            Self::Other
        }
    }

    fn cap(self) -> Duration {
        match self {
            Self::Transient => TRANSIENT_CAP,
            Self::Reloading => RELOADING_CAP,
            Self::Other => DEFAULT_CAP,
        }
    }
}

/// Jittered exponential backoff: `base * 2^attempt * jitter`, with jitter
/// drawn from `0.1..0.3`, capped per [`FailureClass`].
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    pub fn delay(&self, attempt: u32, class: FailureClass) -> Duration {
        let jitter = rand::rng().random_range(0.1..0.3);
        let secs = self.base.as_secs_f64() * 2f64.powi(attempt.min(16) as i32) * jitter;
        Duration::from_secs_f64(secs).min(class.cap())
    }
}
