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

//! Retry policy around single attempts.
//!
//! | outcome               | action                                                     |
//! |-----------------------|------------------------------------------------------------|
//! | throttled             | wait the hint or the next backoff step, bounded by budget  |
//! | partition moved       | refresh routing; key-routed ops retry at once, page fetches |
//! |                       | return to their caller to re-resolve                       |
//! | routing unavailable   | back off and retry, separately capped                      |
//! | unavailable / timeout | back off and retry reads; writes only when opted in        |
//! | anything else         | returned as is                                             |

use std::future::Future;
use std::time::Duration;
use std::time::Instant;

use backon::BackoffBuilder;
use backon::ExponentialBackoff;
use backon::ExponentialBuilder;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::ConsistencyLevel;
use crate::Error;
use crate::ErrorKind;
use crate::Result;
use crate::config::RetryConfig;
use crate::executor::Operation;
use crate::executor::RequestExecutor;
use crate::executor::RequestOutcome;
use crate::executor::Response;
use crate::session::SessionTracker;

/// Cancellation sources for one operation: the owning session and, optionally, the caller.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    session: CancellationToken,
    op: Option<CancellationToken>,
}

impl CancelSignal {
    pub fn new(session: CancellationToken, op: Option<CancellationToken>) -> Self {
        Self { session, op }
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled() || self.op.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub async fn cancelled(&self) {
        match &self.op {
            Some(op) => tokio::select! {
                () = self.session.cancelled() => {}
                () = op.cancelled() => {}
            },
            None => self.session.cancelled().await,
        }
    }

    /// Run `fut` unless cancelled first
    pub async fn run<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            () = self.cancelled() => Err(Error::Cancelled),
            r = fut => r,
        }
    }

    async fn sleep(&self, d: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(d).await;
            Ok(())
        })
        .await
    }
}

impl From<CancellationToken> for CancelSignal {
    fn from(session: CancellationToken) -> Self {
        Self::new(session, None)
    }
}

/// Per-call knobs for [`RetryController::run`]
#[derive(Copy, Clone, Debug, Default)]
pub struct RunOptions {
    pub consistency: ConsistencyLevel,
    /// Retry writes after failures that leave their effect unknown
    pub retry_writes: bool,
}

/// Drives a [`RequestExecutor`] until an operation succeeds or its budget is spent.
#[derive(Debug)]
pub struct RetryController<E> {
    executor: E,
    retry: RetryConfig,
}

#[derive(Default)]
struct Budget {
    attempts: usize,
    retries: usize,
    moved: usize,
    routing: usize,
    request_charge: f64,
    retry_after: Option<Duration>,
}

impl<E: RequestExecutor> RetryController<E> {
    pub fn new(executor: E, retry: RetryConfig) -> Self {
        Self { executor, retry }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.retry.initial_delay)
            .with_max_delay(self.retry.max_delay)
            .with_max_times(self.retry.attempts)
            .with_jitter()
            .build()
    }

    /// Perform `op`, retrying as the outcome allows.
    ///
    /// The returned response carries the number of attempts made and the request charge
    /// summed over all of them.  Cancellation interrupts both attempts and waits.
    pub async fn run(
        &self,
        session: &SessionTracker,
        op: &Operation,
        opts: RunOptions,
        cancel: &CancelSignal,
    ) -> Result<Response> {
        let start = Instant::now();
        let mut backoff = self.backoff();
        let mut b = Budget::default();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            b.attempts += 1;
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                o = self.executor.execute(session, op, opts.consistency) => o,
            };

            let wait = match outcome {
                RequestOutcome::Success(mut rsp) => {
                    rsp.request_charge += b.request_charge;
                    rsp.attempts = b.attempts;
                    return Ok(rsp);
                }

                RequestOutcome::Throttled {
                    retry_after,
                    request_charge,
                } => {
                    b.request_charge += request_charge;
                    b.retry_after = retry_after;
                    let delay = retry_after.or_else(|| backoff.next());
                    match delay.filter(|d| self.within_budget(&b, start, *d)) {
                        Some(d) => {
                            b.retries += 1;
                            d
                        }
                        None => {
                            let elapsed = start.elapsed();
                            warn!(attempts = b.attempts, ?elapsed, "throttling budget exhausted");
                            return Err(Error::Throttled {
                                attempts: b.attempts,
                                elapsed,
                                retry_after: b.retry_after,
                            });
                        }
                    }
                }

                RequestOutcome::PartitionMoved {
                    partition,
                    map_version,
                } => {
                    if b.moved >= self.retry.partition_moved {
                        warn!(%partition, moved = b.moved, "partition moved too many times");
                        return Err(Error::PartitionMoved { partition });
                    }
                    b.moved += 1;
                    debug!(%partition, map_version, "partition moved, refreshing routing");

                    let refreshed = cancel
                        .run(self.executor.refresh_routing(map_version))
                        .await;
                    match refreshed {
                        Ok(()) if op.is_key_routed() => Duration::ZERO,
                        Ok(()) => return Err(Error::PartitionMoved { partition }),
                        Err(e) => self.routing_retry(&mut b, &mut backoff, e)?,
                    }
                }

                RequestOutcome::Failed(e) => match e.kind() {
                    ErrorKind::RoutingUnavailable => {
                        self.routing_retry(&mut b, &mut backoff, e)?
                    }
                    ErrorKind::Unavailable => {
                        if op.is_write() && e.is_ambiguous() && !opts.retry_writes {
                            debug!(?e, "not retrying write of unknown outcome");
                            return Err(e);
                        }
                        match backoff
                            .next()
                            .filter(|d| self.within_budget(&b, start, *d))
                        {
                            Some(d) => {
                                b.retries += 1;
                                d
                            }
                            None => {
                                warn!(attempts = b.attempts, ?e, "retry budget exhausted");
                                return Err(e);
                            }
                        }
                    }
                    _ => return Err(e),
                },
            };

            if !wait.is_zero() {
                debug!(attempt = b.attempts, ?wait, "retrying after backoff");
                cancel.sleep(wait).await?;
            }
        }
    }

    fn within_budget(&self, b: &Budget, start: Instant, wait: Duration) -> bool {
        b.retries < self.retry.attempts && start.elapsed() + wait <= self.retry.max_elapsed
    }

    fn routing_retry(
        &self,
        b: &mut Budget,
        backoff: &mut ExponentialBackoff,
        e: Error,
    ) -> Result<Duration> {
        if e.kind() != ErrorKind::RoutingUnavailable || b.routing >= self.retry.routing_refresh {
            warn!(?e, refreshes = b.routing, "routing unavailable");
            return Err(e);
        }
        b.routing += 1;
        Ok(backoff.next().unwrap_or(self.retry.initial_delay))
    }
}
