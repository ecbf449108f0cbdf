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

use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use bon::Builder;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::executor::Executor;
use crate::executor::Operation;
use crate::executor::Response;
use crate::retry::CancelSignal;
use crate::retry::RetryController;
use crate::retry::RunOptions;
use crate::routing::Router;
use crate::session::SessionTracker;
use crate::transport::IntoTransport;
use crate::transport::ResponseBody;
use crate::transport::Transport;

pub mod blocking;
pub mod config;
pub mod errors;
pub mod executor;
pub mod feed;
pub mod memory;
pub mod query;
pub mod retry;
pub mod routing;
pub mod session;
pub mod transport;
mod util;

pub use errors::*;
pub use feed::FeedBatch;
pub use feed::FeedCheckpoint;
pub use feed::FeedCursor;
pub use feed::FeedCursorManager;
pub use feed::FeedPoll;
pub use query::QueryContinuation;
pub use query::QueryIterator;
pub use query::QueryPage;
pub use query::QueryState;
pub use routing::PartitionId;
pub use routing::PartitionKeyRange;
pub use session::SessionToken;

pub type Result<T> = std::result::Result<T, Error>;

/// Value items are distributed across partitions by
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PartitionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version of a stored item, changed by every write to it
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ETag(u64);

impl ETag {
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

/// An opaque document, identified by `(partition_key, id)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub partition_key: PartitionKey,
    pub body: Bytes,
}

impl Item {
    pub fn new(
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: id.into(),
            partition_key: partition_key.into(),
            body: body.into(),
        }
    }
}

/// Order-by value of a query row.  Values of different kinds sort `Null < Bool < Int < Str`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SortKey {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConsistencyLevel {
    /// Reads observe every write made earlier in the same session
    #[default]
    Session,
    Eventual,
}

#[derive(Clone, Debug)]
pub struct ItemResponse {
    pub item: Item,
    pub etag: ETag,
    pub session_token: Option<SessionToken>,
    pub request_charge: f64,
    pub attempts: usize,
}

impl ItemResponse {
    fn from_response(rsp: Response) -> Result<Self> {
        match rsp.body {
            ResponseBody::Item { item, etag } => Ok(Self {
                item,
                etag,
                session_token: rsp.session_token,
                request_charge: rsp.request_charge,
                attempts: rsp.attempts,
            }),
            other => Err(Error::Malformed(format!(
                "expected an item in the response, got {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeleteResponse {
    pub session_token: Option<SessionToken>,
    pub request_charge: f64,
    pub attempts: usize,
}

#[derive(Builder, Clone, Debug)]
pub struct RequestOptions {
    /// Only apply the write if the stored item has this etag
    if_match: Option<ETag>,
    /// Retry writes after failures of unknown effect.  Only safe for idempotent writes.
    #[builder(default = false)]
    retry_writes: bool,
    consistency: Option<ConsistencyLevel>, // default: the client's
    cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Builder, Clone, Debug)]
pub struct QueryOptions {
    max_item_count: Option<usize>, // default: Config::default_max_item_count
    /// Merge results across partitions into one global order
    order: Option<Order>,
    consistency: Option<ConsistencyLevel>,
    cancel: Option<CancellationToken>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Where a new change feed starts reading
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum StartFrom {
    #[default]
    Beginning,
    /// Only changes committed after the feed is created
    Now,
}

#[derive(Builder, Clone, Debug)]
pub struct FeedOptions {
    max_item_count: Option<usize>, // default: Config::default_max_item_count
    max_wait: Option<Duration>,    // default: Config::feed_max_wait
    #[builder(default)]
    start_from: StartFrom,
}

impl FeedOptions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Progress report from one step of a continuation-driven loop
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub processed: usize,
    /// The server has more work for another step
    pub more: bool,
}

/// One logical unit of work.  Tracks read-your-writes state and cancels every operation
/// issued through it when cancelled.
#[derive(Clone, Debug)]
pub struct Session {
    tracker: Arc<SessionTracker>,
    cancel: CancellationToken,
}

impl Session {
    fn new() -> Self {
        Self {
            tracker: Arc::new(SessionTracker::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn token_for(&self, partition: PartitionId) -> Option<SessionToken> {
        self.tracker.token_for(partition)
    }

    /// Abort every in-flight and future operation of this session
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn signal(&self, op: Option<CancellationToken>) -> CancelSignal {
        CancelSignal::new(self.cancel.clone(), op)
    }
}

#[derive(Clone, Debug)]
pub struct Client {
    config: Arc<config::Config>,
    transport: Arc<dyn Transport>,
    routers: Arc<Mutex<HashMap<String, Arc<Router>>>>,
}

impl Client {
    pub fn new(config: Arc<config::Config>, transport: impl IntoTransport) -> Self {
        Self {
            config,
            transport: transport.into_arc(),
            routers: Arc::default(),
        }
    }

    pub fn config(&self) -> &Arc<config::Config> {
        &self.config
    }

    pub fn new_session(&self) -> Session {
        Session::new()
    }

    /// Handle to a container.  Handles to the same container share one routing cache.
    pub fn container(&self, name: impl Into<String>) -> Container {
        let name = name.into();
        let router = {
            let mut routers = self.routers.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(routers.entry(name.clone()).or_insert_with(|| {
                Arc::new(Router::new(Arc::from(name.as_str()), Arc::clone(&self.transport)))
            }))
        };
        let executor = Executor::new(
            router,
            Arc::clone(&self.transport),
            self.config.request_timeout(),
        );
        Container {
            inner: Arc::new(ContainerInner {
                name: Arc::from(name),
                config: Arc::clone(&self.config),
                controller: RetryController::new(executor, self.config.retry()),
            }),
        }
    }
}

#[derive(Debug)]
struct ContainerInner {
    name: Arc<str>,
    config: Arc<config::Config>,
    controller: RetryController<Executor>,
}

#[derive(Clone, Debug)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

fn check_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Malformed("item id must not be empty".to_string()));
    }
    Ok(())
}

impl Container {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &Arc<config::Config> {
        &self.inner.config
    }

    pub fn router(&self) -> &Arc<Router> {
        self.inner.controller.executor().router()
    }

    /// The partition range currently owning `partition_key`
    pub async fn resolve(&self, partition_key: &PartitionKey) -> Result<PartitionKeyRange> {
        self.router().resolve(partition_key).await
    }

    /// Fetch fresh routing metadata now
    pub async fn refresh_routing(&self) -> Result<()> {
        let router = self.router();
        router.refresh(router.version()).await.map(|_| ())
    }

    pub(crate) async fn run(
        &self,
        session: &Session,
        op: &Operation,
        opts: RunOptions,
        cancel: &CancelSignal,
    ) -> Result<Response> {
        self.inner
            .controller
            .run(session.tracker(), op, opts, cancel)
            .await
    }

    /// Perform one logical operation with retries
    pub async fn execute(
        &self,
        session: &Session,
        op: Operation,
        options: &RequestOptions,
    ) -> Result<Response> {
        let opts = RunOptions {
            consistency: options
                .consistency
                .unwrap_or_else(|| self.inner.config.consistency()),
            retry_writes: options.retry_writes,
        };
        let cancel = session.signal(options.cancel.clone());
        self.run(session, &op, opts, &cancel).await
    }

    pub async fn read_item_with_options(
        &self,
        session: &Session,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
        options: &RequestOptions,
    ) -> Result<ItemResponse> {
        let id = id.into();
        check_id(&id)?;
        let op = Operation::Read {
            id,
            partition_key: partition_key.into(),
        };
        ItemResponse::from_response(self.execute(session, op, options).await?)
    }

    pub async fn read_item(
        &self,
        session: &Session,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
    ) -> Result<ItemResponse> {
        self.read_item_with_options(session, id, partition_key, &RequestOptions::default())
            .await
    }

    /// Whether the item exists.  Not found is an answer here, not an error.
    pub async fn item_exists(
        &self,
        session: &Session,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
    ) -> Result<bool> {
        match self.read_item(session, id, partition_key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn create_item_with_options(
        &self,
        session: &Session,
        item: Item,
        options: &RequestOptions,
    ) -> Result<ItemResponse> {
        check_id(&item.id)?;
        let rsp = self.execute(session, Operation::Create { item }, options).await?;
        ItemResponse::from_response(rsp)
    }

    pub async fn create_item(&self, session: &Session, item: Item) -> Result<ItemResponse> {
        self.create_item_with_options(session, item, &RequestOptions::default())
            .await
    }

    pub async fn upsert_item_with_options(
        &self,
        session: &Session,
        item: Item,
        options: &RequestOptions,
    ) -> Result<ItemResponse> {
        check_id(&item.id)?;
        let op = Operation::Upsert {
            item,
            if_match: options.if_match,
        };
        ItemResponse::from_response(self.execute(session, op, options).await?)
    }

    pub async fn upsert_item(&self, session: &Session, item: Item) -> Result<ItemResponse> {
        self.upsert_item_with_options(session, item, &RequestOptions::default())
            .await
    }

    /// Replace an existing item.  With `if_match` set, a concurrent write in between yields
    /// `Conflict`.
    pub async fn replace_item_with_options(
        &self,
        session: &Session,
        item: Item,
        options: &RequestOptions,
    ) -> Result<ItemResponse> {
        check_id(&item.id)?;
        let op = Operation::Replace {
            item,
            if_match: options.if_match,
        };
        ItemResponse::from_response(self.execute(session, op, options).await?)
    }

    pub async fn replace_item(&self, session: &Session, item: Item) -> Result<ItemResponse> {
        self.replace_item_with_options(session, item, &RequestOptions::default())
            .await
    }

    pub async fn delete_item_with_options(
        &self,
        session: &Session,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
        options: &RequestOptions,
    ) -> Result<DeleteResponse> {
        let id = id.into();
        check_id(&id)?;
        let op = Operation::Delete {
            id,
            partition_key: partition_key.into(),
            if_match: options.if_match,
        };
        let rsp = self.execute(session, op, options).await?;
        Ok(DeleteResponse {
            session_token: rsp.session_token,
            request_charge: rsp.request_charge,
            attempts: rsp.attempts,
        })
    }

    pub async fn delete_item(
        &self,
        session: &Session,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
    ) -> Result<DeleteResponse> {
        self.delete_item_with_options(session, id, partition_key, &RequestOptions::default())
            .await
    }

    /// Lazily iterate the results of `query` across every partition
    pub fn query(
        &self,
        session: &Session,
        query: impl Into<String>,
        options: QueryOptions,
    ) -> QueryIterator {
        QueryIterator::new(self.clone(), session.clone(), query.into(), options)
    }

    /// Open a change feed with one cursor per current partition
    pub async fn change_feed(
        &self,
        session: &Session,
        options: FeedOptions,
    ) -> Result<FeedCursorManager> {
        FeedCursorManager::new(self.clone(), session.clone(), options).await
    }

    /// Call `step` until it reports nothing more to do, returning the total processed.
    ///
    /// `step` receives the count processed so far.  This is the shape of server-side bulk
    /// operations that do part of the work per call and report whether to call again.
    pub async fn drain_with_continuation<F, Fut>(&self, session: &Session, mut step: F) -> Result<usize>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<Step>>,
    {
        let cancel = session.signal(None);
        let mut total = 0;
        loop {
            let Step { processed, more } = cancel.run(step(total)).await?;
            total += processed;
            debug!(container = %self.name(), processed, total, more, "continuation step");
            if !more {
                return Ok(total);
            }
            if processed == 0 {
                return Err(Error::Malformed(
                    "continuation step made no progress".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn client() -> (MemoryStore, Client) {
        let store = MemoryStore::new();
        store.create_container("c", 3).unwrap();
        let config = config::Config::builder().build().unwrap();
        (store.clone(), Client::new(config, store))
    }

    #[test_log::test(tokio::test)]
    async fn test_containers_share_routing() {
        let (_store, client) = client();
        let a = client.container("c");
        let b = client.container("c");
        assert!(Arc::ptr_eq(a.router(), b.router()));
        assert!(!Arc::ptr_eq(a.router(), client.container("d").router()));
    }

    #[test_log::test(tokio::test)]
    async fn test_empty_id_is_malformed() {
        let (_store, client) = client();
        let session = client.new_session();
        let err = client
            .container("c")
            .create_item(&session, Item::new("", "pk", Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Malformed, err.kind());
    }

    #[test_log::test(tokio::test)]
    async fn test_drain_with_continuation() {
        let (_store, client) = client();
        let session = client.new_session();
        let container = client.container("c");

        let total = container
            .drain_with_continuation(&session, |done| async move {
                let processed = (25 - done).min(10);
                Ok(Step {
                    processed,
                    more: done + processed < 25,
                })
            })
            .await
            .unwrap();
        assert_eq!(25, total);

        let err = container
            .drain_with_continuation(&session, |_| async {
                Ok(Step {
                    processed: 0,
                    more: true,
                })
            })
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Malformed, err.kind());
    }

    #[test]
    fn test_options_defaults() {
        let o = RequestOptions::new();
        assert!(!o.retry_writes);
        assert!(o.if_match.is_none());

        let o = FeedOptions::builder().max_item_count(5).build();
        assert_eq!(StartFrom::Beginning, o.start_from);
        assert_eq!(Some(5), o.max_item_count);
    }
}
