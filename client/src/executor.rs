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

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::trace;

use crate::ConsistencyLevel;
use crate::ETag;
use crate::Error;
use crate::Item;
use crate::Order;
use crate::PartitionId;
use crate::PartitionKey;
use crate::Result;
use crate::SessionToken;
use crate::routing::PartitionKeyRange;
use crate::routing::Router;
use crate::session::SessionTracker;
use crate::transport::ContinuationToken;
use crate::transport::RawResponse;
use crate::transport::Request;
use crate::transport::RequestBody;
use crate::transport::ResponseBody;
use crate::transport::Status;
use crate::transport::Transport;
use crate::util;

/// One logical operation against a container.
///
/// Point operations are routed by partition key.  Page fetches name the partition range they
/// target, and `low`/`high` may narrow that to part of the partition.
#[derive(Clone, Debug)]
pub enum Operation {
    Read {
        id: String,
        partition_key: PartitionKey,
    },
    Create {
        item: Item,
    },
    Upsert {
        item: Item,
        if_match: Option<ETag>,
    },
    Replace {
        item: Item,
        if_match: Option<ETag>,
    },
    Delete {
        id: String,
        partition_key: PartitionKey,
        if_match: Option<ETag>,
    },
    QueryPage {
        range: PartitionKeyRange,
        low: u64,
        high: u64,
        query: Arc<str>,
        order: Option<Order>,
        continuation: Option<ContinuationToken>,
        max_item_count: usize,
    },
    FeedPage {
        range: PartitionKeyRange,
        after: u64,
        max_item_count: usize,
        max_wait: Duration,
    },
}

impl Operation {
    pub fn partition_key(&self) -> Option<&PartitionKey> {
        match self {
            Operation::Read { partition_key, .. } | Operation::Delete { partition_key, .. } => {
                Some(partition_key)
            }
            Operation::Create { item }
            | Operation::Upsert { item, .. }
            | Operation::Replace { item, .. } => {
                Some(&item.partition_key)
            }
            Operation::QueryPage { .. } | Operation::FeedPage { .. } => None,
        }
    }

    /// Routed by partition key, as opposed to aimed at a partition range
    pub fn is_key_routed(&self) -> bool {
        self.partition_key().is_some()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Operation::Read { .. } | Operation::QueryPage { .. } | Operation::FeedPage { .. }
        )
    }

    pub fn is_write(&self) -> bool {
        !self.is_read_only()
    }

    fn name(&self) -> &'static str {
        match self {
            Operation::Read { .. } => "read",
            Operation::Create { .. } => "create",
            Operation::Upsert { .. } => "upsert",
            Operation::Replace { .. } => "replace",
            Operation::Delete { .. } => "delete",
            Operation::QueryPage { .. } => "query_page",
            Operation::FeedPage { .. } => "feed_page",
        }
    }

    fn to_body(&self) -> RequestBody {
        match self {
            Operation::Read { id, partition_key } => RequestBody::Read {
                id: id.clone(),
                partition_key: partition_key.clone(),
            },
            Operation::Create { item } => RequestBody::Create { item: item.clone() },
            Operation::Upsert { item, if_match } => RequestBody::Upsert {
                item: item.clone(),
                if_match: *if_match,
            },
            Operation::Replace { item, if_match } => RequestBody::Replace {
                item: item.clone(),
                if_match: *if_match,
            },
            Operation::Delete {
                id,
                partition_key,
                if_match,
            } => RequestBody::Delete {
                id: id.clone(),
                partition_key: partition_key.clone(),
                if_match: *if_match,
            },
            Operation::QueryPage {
                query,
                order,
                continuation,
                max_item_count,
                ..
            } => RequestBody::QueryPage {
                query: Arc::clone(query),
                order: *order,
                continuation: continuation.clone(),
                max_item_count: *max_item_count,
            },
            Operation::FeedPage {
                after,
                max_item_count,
                max_wait,
                ..
            } => RequestBody::FeedPage {
                after: *after,
                max_item_count: *max_item_count,
                max_wait: *max_wait,
            },
        }
    }
}

/// A successful response, after classification
#[derive(Clone, Debug)]
pub struct Response {
    pub partition: PartitionId,
    pub status: Status,
    pub body: ResponseBody,
    pub session_token: Option<SessionToken>,
    pub continuation: Option<ContinuationToken>,
    /// Summed over every attempt once the retry controller is done with it
    pub request_charge: f64,
    pub attempts: usize,
}

/// Classified result of a single attempt
#[derive(Debug)]
pub enum RequestOutcome {
    Success(Response),
    Throttled {
        retry_after: Option<Duration>,
        request_charge: f64,
    },
    /// The addressed partition no longer exists in the layout at `map_version`
    PartitionMoved {
        partition: PartitionId,
        map_version: u64,
    },
    Failed(Error),
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success(_))
    }
}

/// Something that performs single attempts.  The retry controller is written against this
/// so it can be driven by a scripted executor.
pub trait RequestExecutor: Send + Sync {
    fn execute(
        &self,
        session: &SessionTracker,
        op: &Operation,
        consistency: ConsistencyLevel,
    ) -> impl Future<Output = RequestOutcome> + Send;

    /// Refresh routing metadata found stale at `stale_version`
    fn refresh_routing(&self, stale_version: u64) -> impl Future<Output = Result<()>> + Send;
}

/// Performs one attempt of an operation against the partition currently owning it.
#[derive(Debug)]
pub struct Executor {
    router: Arc<Router>,
    transport: Arc<dyn Transport>,
    request_timeout: Option<Duration>,
}

impl Executor {
    pub fn new(
        router: Arc<Router>,
        transport: Arc<dyn Transport>,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            router,
            transport,
            request_timeout,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    // The range `op` is aimed at, its bounds, and the routing version it was resolved with
    async fn target(&self, op: &Operation) -> Result<(PartitionKeyRange, u64, u64, u64)> {
        match op {
            Operation::QueryPage {
                range, low, high, ..
            } => Ok((range.clone(), *low, *high, self.router.version())),
            Operation::FeedPage { range, .. } => {
                Ok((range.clone(), range.low, range.high, self.router.version()))
            }
            _ => {
                let pk = op
                    .partition_key()
                    .ok_or_else(|| Error::Malformed(format!("{} has no partition key", op.name())))?;
                let map = self.router.loaded().await?;
                let range = map
                    .resolve(pk)
                    .cloned()
                    .ok_or_else(|| Error::routing(format!("no partition for key {pk}")))?;
                let (low, high) = (range.low, range.high);
                Ok((range, low, high, map.version()))
            }
        }
    }

    fn timeout_for(&self, op: &Operation) -> Option<Duration> {
        match op {
            Operation::FeedPage { max_wait, .. } => self.request_timeout.map(|t| t + *max_wait),
            _ => self.request_timeout,
        }
    }

    async fn attempt(
        &self,
        session: &SessionTracker,
        op: &Operation,
        consistency: ConsistencyLevel,
    ) -> RequestOutcome {
        let (range, low, high, map_version) = match self.target(op).await {
            Ok(t) => t,
            Err(e) => return RequestOutcome::Failed(e),
        };

        let session_token = match op {
            Operation::Read { .. } | Operation::QueryPage { .. }
                if consistency == ConsistencyLevel::Session =>
            {
                session.token_for_range(&range)
            }
            _ => None,
        };

        let request = Request {
            container: Arc::from(self.router.container()),
            partition: range.id,
            low,
            high,
            session_token,
            body: op.to_body(),
        };

        trace!(op = op.name(), partition = %range.id, ?session_token, "sending");
        let raw = util::with_timeout(self.timeout_for(op), self.transport.send(request)).await;
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                debug!(op = op.name(), partition = %range.id, ?e, "transport failure");
                return RequestOutcome::Failed(e);
            }
        };

        let outcome = classify(raw, range.id, map_version, session_token);
        if let RequestOutcome::Success(rsp) = &outcome
            && let Some(token) = rsp.session_token
        {
            session.observe(token);
        }
        outcome
    }
}

fn classify(
    raw: RawResponse,
    partition: PartitionId,
    map_version: u64,
    sent_token: Option<SessionToken>,
) -> RequestOutcome {
    let status = raw.status;
    if !status.is_success() {
        debug!(%partition, ?status, "request failed");
    }
    match status {
        Status::Ok | Status::Created | Status::NoContent | Status::NotModified => {
            RequestOutcome::Success(Response {
                partition,
                status,
                session_token: raw.headers.session_token,
                continuation: raw.headers.continuation,
                request_charge: raw.headers.request_charge,
                attempts: 1,
                body: raw.body,
            })
        }
        Status::TooManyRequests => RequestOutcome::Throttled {
            retry_after: raw.headers.retry_after,
            request_charge: raw.headers.request_charge,
        },
        Status::Gone => RequestOutcome::PartitionMoved {
            partition,
            map_version,
        },
        Status::NotFound => RequestOutcome::Failed(Error::NotFound(raw.reason())),
        Status::Conflict | Status::PreconditionFailed => {
            RequestOutcome::Failed(Error::Conflict(raw.reason()))
        }
        Status::SessionNotAvailable => RequestOutcome::Failed(Error::SessionNotAvailable {
            token: sent_token.unwrap_or(SessionToken::new(partition, 0)),
        }),
        Status::ServiceUnavailable => RequestOutcome::Failed(Error::unavailable(raw.reason())),
        Status::BadRequest => RequestOutcome::Failed(Error::Malformed(raw.reason())),
    }
}

impl RequestExecutor for Executor {
    async fn execute(
        &self,
        session: &SessionTracker,
        op: &Operation,
        consistency: ConsistencyLevel,
    ) -> RequestOutcome {
        self.attempt(session, op, consistency).await
    }

    async fn refresh_routing(&self, stale_version: u64) -> Result<()> {
        self.router.invalidate(stale_version);
        self.router.loaded().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::memory::Fault;
    use crate::memory::FaultScope;
    use crate::memory::MemoryStore;

    fn setup(partitions: usize) -> (MemoryStore, Executor) {
        let store = MemoryStore::new();
        store.create_container("c", partitions).unwrap();
        let transport: Arc<dyn Transport> = Arc::new(store.clone());
        let router = Arc::new(Router::new(Arc::from("c"), Arc::clone(&transport)));
        (store, Executor::new(router, transport, None))
    }

    fn item(id: &str, pk: &str) -> Item {
        Item::new(id, pk, bytes::Bytes::from_static(b"{}"))
    }

    #[test_log::test(tokio::test)]
    async fn test_write_then_read_carries_token() {
        let (_store, executor) = setup(2);
        let session = SessionTracker::new();

        let create = Operation::Create {
            item: item("1", "a"),
        };
        let RequestOutcome::Success(rsp) = executor
            .execute(&session, &create, ConsistencyLevel::Session)
            .await
        else {
            panic!("create failed");
        };
        let token = rsp.session_token.unwrap();
        assert_eq!(Some(token), session.token_for(rsp.partition));

        let read = Operation::Read {
            id: "1".to_string(),
            partition_key: PartitionKey::from("a"),
        };
        let outcome = executor
            .execute(&session, &read, ConsistencyLevel::Session)
            .await;
        assert!(outcome.is_success(), "{outcome:?}");
    }

    #[test_log::test(tokio::test)]
    async fn test_classification() {
        let (store, executor) = setup(1);
        let session = SessionTracker::new();
        let read = Operation::Read {
            id: "missing".to_string(),
            partition_key: PartitionKey::from("a"),
        };

        let outcome = executor
            .execute(&session, &read, ConsistencyLevel::Eventual)
            .await;
        assert!(
            matches!(&outcome, RequestOutcome::Failed(e) if e.kind() == ErrorKind::NotFound),
            "{outcome:?}"
        );

        store.inject_fault(
            "c",
            Fault::Throttle {
                retry_after: Some(Duration::from_millis(3)),
            },
            FaultScope::Any,
            1,
        );
        let outcome = executor
            .execute(&session, &read, ConsistencyLevel::Eventual)
            .await;
        assert!(
            matches!(
                outcome,
                RequestOutcome::Throttled {
                    retry_after: Some(d),
                    ..
                } if d == Duration::from_millis(3)
            ),
            "{outcome:?}"
        );

        store.inject_fault("c", Fault::Gone, FaultScope::Any, 1);
        let outcome = executor
            .execute(&session, &read, ConsistencyLevel::Eventual)
            .await;
        assert!(
            matches!(outcome, RequestOutcome::PartitionMoved { .. }),
            "{outcome:?}"
        );

        store.inject_fault("c", Fault::Disconnect, FaultScope::Any, 1);
        let outcome = executor
            .execute(&session, &read, ConsistencyLevel::Eventual)
            .await;
        assert!(
            matches!(&outcome, RequestOutcome::Failed(e) if e.kind() == ErrorKind::Unavailable),
            "{outcome:?}"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_conflict_is_terminal_outcome() {
        let (_store, executor) = setup(1);
        let session = SessionTracker::new();
        let create = Operation::Create {
            item: item("1", "a"),
        };
        assert!(
            executor
                .execute(&session, &create, ConsistencyLevel::Session)
                .await
                .is_success()
        );
        let outcome = executor
            .execute(&session, &create, ConsistencyLevel::Session)
            .await;
        assert!(
            matches!(&outcome, RequestOutcome::Failed(e) if e.kind() == ErrorKind::Conflict),
            "{outcome:?}"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_route_reports_partition_moved() {
        let (store, executor) = setup(1);
        let session = SessionTracker::new();
        let create = Operation::Create {
            item: item("1", "a"),
        };
        assert!(
            executor
                .execute(&session, &create, ConsistencyLevel::Session)
                .await
                .is_success()
        );

        store.split_partition("c", PartitionId::new(0)).unwrap();
        let read = Operation::Read {
            id: "1".to_string(),
            partition_key: PartitionKey::from("a"),
        };
        let outcome = executor
            .execute(&session, &read, ConsistencyLevel::Session)
            .await;
        let RequestOutcome::PartitionMoved {
            partition,
            map_version,
        } = outcome
        else {
            panic!("unexpected {outcome:?}");
        };
        assert_eq!(PartitionId::new(0), partition);

        executor.refresh_routing(map_version).await.unwrap();
        let outcome = executor
            .execute(&session, &read, ConsistencyLevel::Session)
            .await;
        assert!(outcome.is_success(), "{outcome:?}");
    }
}
