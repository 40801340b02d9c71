use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_ms;
use crate::error::ErrorClass;

/// Delay before the next attempt, per error class.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_ms")]
    pub dns: Duration,
    #[serde(with = "duration_ms")]
    pub connect: Duration,
    /// Long enough to ride out a cold-starting server.
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub server: Duration,
    #[serde(with = "duration_ms")]
    pub other: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            dns: Duration::from_secs(3),
            connect: Duration::from_secs(5),
            read_timeout: Duration::from_secs(8),
            server: Duration::from_secs(5),
            other: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    delays: BackoffConfig,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(delays: BackoffConfig, max_attempts: u32) -> Self {
        Self {
            delays,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempt` is the 1-based number of the attempt that just failed.
    /// `None` means give up and surface the error.
    pub fn next_delay(&self, class: ErrorClass, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        match class {
            ErrorClass::Unsupported | ErrorClass::Fatal => None,
            ErrorClass::Dns => Some(self.delays.dns),
            ErrorClass::Connect => Some(self.delays.connect),
            ErrorClass::ReadTimeout => Some(self.delays.read_timeout),
            ErrorClass::Server => Some(self.delays.server),
            ErrorClass::Other => Some(self.delays.other),
        }
    }
}
