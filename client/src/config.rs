// Copyright 2025-2026 Maurice S. Barnum
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;

use crate::ConsistencyLevel;
use crate::Error;
use crate::Result;

/// Budgets for the retry controller.
///
/// `attempts` bounds retries of throttled and transient failures; `partition_moved` and
/// `routing_refresh` are separate, smaller caps so stale routing metadata cannot loop forever.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub(crate) attempts: usize,
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) max_elapsed: Duration,
    pub(crate) partition_moved: usize,
    pub(crate) routing_refresh: usize,
}

impl RetryConfig {
    pub fn new(attempts: usize, initial_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
            max_delay: initial_delay.saturating_mul(10),
            max_elapsed: Duration::from_secs(30),
            partition_moved: 3,
            routing_refresh: 3,
        }
    }

    /// No retries of any kind: every outcome is returned as observed.
    pub fn disabled() -> Self {
        Self {
            attempts: 0,
            partition_moved: 0,
            routing_refresh: 0,
            ..Self::new(0, Duration::ZERO)
        }
    }

    #[must_use]
    pub fn max(mut self, x: Duration) -> Self {
        self.max_delay = x;
        self
    }

    #[must_use]
    pub fn max_elapsed(mut self, x: Duration) -> Self {
        self.max_elapsed = x;
        self
    }

    #[must_use]
    pub fn partition_moved(mut self, n: usize) -> Self {
        self.partition_moved = n;
        self
    }

    #[must_use]
    pub fn routing_refresh(mut self, n: usize) -> Self {
        self.routing_refresh = n;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(9, Duration::from_millis(100))
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    max_parallel_requests: usize,      // fan-out limit for multi-partition requests, at least 1
    request_timeout: Option<Duration>, // per-attempt timeout if set
    retry: RetryConfig,
    default_max_item_count: usize, // page size when the caller does not pick one
    feed_max_wait: Duration,       // how long a change feed poll may wait for new entries
    consistency: ConsistencyLevel,
}

impl Config {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn max_parallel_requests(&self) -> usize {
        self.max_parallel_requests
    }
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
    pub fn retry(&self) -> RetryConfig {
        self.retry
    }
    pub fn default_max_item_count(&self) -> usize {
        self.default_max_item_count
    }
    pub fn feed_max_wait(&self) -> Duration {
        self.feed_max_wait
    }
    pub fn consistency(&self) -> ConsistencyLevel {
        self.consistency
    }
}

#[derive(Clone)]
pub struct Builder {
    c: Config,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            c: Config {
                max_parallel_requests: 4,
                request_timeout: None,
                retry: RetryConfig::default(),
                default_max_item_count: 100,
                feed_max_wait: Duration::from_millis(500),
                consistency: ConsistencyLevel::Session,
            },
        }
    }

    pub fn new_from(config: &Config) -> Self {
        Self { c: config.clone() }
    }

    #[must_use]
    pub fn max_parallel_requests(mut self, x: usize) -> Self {
        self.c.max_parallel_requests = x.max(1);
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, x: Duration) -> Self {
        self.c.request_timeout = if x.is_zero() { None } else { Some(x) };
        self
    }

    #[must_use]
    pub fn retry(mut self, x: RetryConfig) -> Self {
        self.c.retry = x;
        self
    }

    #[must_use]
    pub fn default_max_item_count(mut self, x: usize) -> Self {
        self.c.default_max_item_count = x;
        self
    }

    #[must_use]
    pub fn feed_max_wait(mut self, x: Duration) -> Self {
        self.c.feed_max_wait = x;
        self
    }

    #[must_use]
    pub fn consistency(mut self, x: ConsistencyLevel) -> Self {
        self.c.consistency = x;
        self
    }

    pub fn build(self) -> Result<Arc<Config>> {
        if self.c.default_max_item_count == 0 {
            return Err(Error::Malformed(
                "default_max_item_count must be positive".to_string(),
            ));
        }
        if self.c.retry.max_delay < self.c.retry.initial_delay {
            return Err(Error::Malformed(format!(
                "retry max delay {:?} is below the initial delay {:?}",
                self.c.retry.max_delay, self.c.retry.initial_delay
            )));
        }
        Ok(Arc::new(self.c))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = Builder::new().build().unwrap();
        assert_eq!(4, config.max_parallel_requests());
        assert_eq!(None, config.request_timeout());
        assert_eq!(100, config.default_max_item_count());
        assert_eq!(ConsistencyLevel::Session, config.consistency());
        assert_eq!(9, config.retry().attempts());
    }

    #[test]
    fn test_builder_clamps_parallelism() {
        let config = Builder::new().max_parallel_requests(0).build().unwrap();
        assert_eq!(1, config.max_parallel_requests());
    }

    #[test]
    fn test_builder_zero_timeout_disables() {
        let config = Builder::new()
            .request_timeout(Duration::ZERO)
            .build()
            .unwrap();
        assert!(config.request_timeout().is_none());
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(Builder::new().default_max_item_count(0).build().is_err());

        let retry = RetryConfig::new(3, Duration::from_secs(1)).max(Duration::from_millis(1));
        let err = Builder::new().retry(retry).build().unwrap_err();
        assert_eq!(crate::ErrorKind::Malformed, err.kind());
    }

    #[test]
    fn test_new_from_keeps_values() {
        let base = Builder::new()
            .default_max_item_count(7)
            .feed_max_wait(Duration::from_millis(5))
            .build()
            .unwrap();
        let copy = Builder::new_from(&base).build().unwrap();
        assert_eq!(7, copy.default_max_item_count());
        assert_eq!(Duration::from_millis(5), copy.feed_max_wait());
    }
}
