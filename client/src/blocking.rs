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

//! Synchronous wrappers for callers without an async runtime.
//!
//! Every call blocks the current thread until the operation completes.  Independent operations
//! may be issued from separate threads; they share the client's runtime, routing cache and
//! session state.  Must not be called from within an async context.

use std::sync::Arc;

use tokio::runtime::Runtime;

use crate::DeleteResponse;
use crate::FeedBatch;
use crate::FeedCheckpoint;
use crate::FeedCursor;
use crate::FeedOptions;
use crate::FeedPoll;
use crate::Item;
use crate::ItemResponse;
use crate::PartitionId;
use crate::PartitionKey;
use crate::PartitionKeyRange;
use crate::QueryContinuation;
use crate::QueryOptions;
use crate::QueryPage;
use crate::QueryState;
use crate::RequestOptions;
use crate::Result;
use crate::Session;
use crate::config::Config;
use crate::executor::Operation;
use crate::executor::Response;
use crate::transport::IntoTransport;

#[derive(Clone, Debug)]
pub struct Client {
    inner: crate::Client,
    rt: Arc<Runtime>,
}

impl Client {
    pub fn new(config: Arc<Config>, transport: impl IntoTransport) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("docstore-client")
            .build()?;
        Ok(Self {
            inner: crate::Client::new(config, transport),
            rt: Arc::new(rt),
        })
    }

    pub fn new_session(&self) -> Session {
        self.inner.new_session()
    }

    pub fn container(&self, name: impl Into<String>) -> Container {
        Container {
            inner: self.inner.container(name),
            rt: Arc::clone(&self.rt),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Container {
    inner: crate::Container,
    rt: Arc<Runtime>,
}

impl Container {
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn resolve(&self, partition_key: &PartitionKey) -> Result<PartitionKeyRange> {
        self.rt.block_on(self.inner.resolve(partition_key))
    }

    pub fn execute(
        &self,
        session: &Session,
        op: Operation,
        options: &RequestOptions,
    ) -> Result<Response> {
        self.rt.block_on(self.inner.execute(session, op, options))
    }

    pub fn read_item(
        &self,
        session: &Session,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
    ) -> Result<ItemResponse> {
        self.rt
            .block_on(self.inner.read_item(session, id, partition_key))
    }

    pub fn item_exists(
        &self,
        session: &Session,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
    ) -> Result<bool> {
        self.rt
            .block_on(self.inner.item_exists(session, id, partition_key))
    }

    pub fn create_item(&self, session: &Session, item: Item) -> Result<ItemResponse> {
        self.rt.block_on(self.inner.create_item(session, item))
    }

    pub fn upsert_item(&self, session: &Session, item: Item) -> Result<ItemResponse> {
        self.rt.block_on(self.inner.upsert_item(session, item))
    }

    pub fn replace_item_with_options(
        &self,
        session: &Session,
        item: Item,
        options: &RequestOptions,
    ) -> Result<ItemResponse> {
        self.rt
            .block_on(self.inner.replace_item_with_options(session, item, options))
    }

    pub fn replace_item(&self, session: &Session, item: Item) -> Result<ItemResponse> {
        self.rt.block_on(self.inner.replace_item(session, item))
    }

    pub fn delete_item(
        &self,
        session: &Session,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
    ) -> Result<DeleteResponse> {
        self.rt
            .block_on(self.inner.delete_item(session, id, partition_key))
    }

    pub fn query(
        &self,
        session: &Session,
        query: impl Into<String>,
        options: QueryOptions,
    ) -> QueryIterator {
        QueryIterator {
            inner: self.inner.query(session, query, options),
            rt: Arc::clone(&self.rt),
            failed: false,
        }
    }

    pub fn change_feed(&self, session: &Session, options: FeedOptions) -> Result<FeedCursorManager> {
        let inner = self.rt.block_on(self.inner.change_feed(session, options))?;
        Ok(FeedCursorManager {
            inner,
            rt: Arc::clone(&self.rt),
        })
    }

    pub fn feed_from_checkpoint(
        &self,
        session: &Session,
        checkpoint: &FeedCheckpoint,
        options: FeedOptions,
    ) -> FeedCursorManager {
        FeedCursorManager {
            inner: crate::FeedCursorManager::from_checkpoint(
                &self.inner,
                session,
                checkpoint,
                options,
            ),
            rt: Arc::clone(&self.rt),
        }
    }
}

#[derive(Debug)]
pub struct QueryIterator {
    inner: crate::QueryIterator,
    rt: Arc<Runtime>,
    // iteration ends after the first error
    failed: bool,
}

impl QueryIterator {
    pub fn state(&self) -> QueryState {
        self.inner.state()
    }

    pub fn continuation(&self) -> QueryContinuation {
        self.inner.continuation()
    }

    pub fn reset(&mut self, continuation: QueryContinuation) {
        self.inner.reset(continuation);
        self.failed = false;
    }

    pub fn collect_all(self) -> Result<Vec<Item>> {
        self.rt.block_on(self.inner.collect_all())
    }
}

impl Iterator for QueryIterator {
    type Item = Result<QueryPage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let r = self.rt.block_on(self.inner.next()).transpose();
        self.failed = matches!(r, Some(Err(_)));
        r
    }
}

#[derive(Debug)]
pub struct FeedCursorManager {
    inner: crate::FeedCursorManager,
    rt: Arc<Runtime>,
}

impl FeedCursorManager {
    pub fn partitions(&self) -> Vec<PartitionId> {
        self.inner.partitions()
    }

    pub fn poll(&self, partition: PartitionId) -> Result<FeedPoll> {
        self.rt.block_on(self.inner.poll(partition))
    }

    /// Poll and unwrap a batch, for callers that follow splits through [`partitions`](Self::partitions)
    pub fn poll_batch(&self, partition: PartitionId) -> Result<Option<FeedBatch>> {
        match self.poll(partition)? {
            FeedPoll::Batch(b) => Ok(Some(b)),
            FeedPoll::Split { .. } => Ok(None),
        }
    }

    pub fn ack(&self, cursor: &FeedCursor) -> Result<()> {
        self.inner.ack(cursor)
    }

    pub fn checkpoint(&self) -> FeedCheckpoint {
        self.inner.checkpoint()
    }
}
