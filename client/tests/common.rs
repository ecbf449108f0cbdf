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

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use docstore_client::Client;
use docstore_client::Container;
use docstore_client::Item;
use docstore_client::PartitionId;
use docstore_client::PartitionKey;
use docstore_client::SortKey;
use docstore_client::config;
use docstore_client::memory::MemoryStore;

pub const CONTAINER: &str = "test";

pub trait TestResultExt<T> {
    fn trace_err(self) -> Self;
    fn trace_err_at(self, target: &'static str, file: &'static str, line: u32) -> Self;
}

impl<T, E: std::fmt::Debug> TestResultExt<T> for Result<T, E> {
    fn trace_err(self) -> Self {
        if let Err(ref e) = self {
            tracing::error!(?e, "Operation failed");
        }
        self
    }

    fn trace_err_at(self, target: &'static str, file: &'static str, line: u32) -> Self {
        if let Err(ref e) = self {
            tracing::error!(target, file, line, ?e, "Operation failed");
        }
        self
    }
}

#[macro_export]
macro_rules! trace_err {
    ($expr:expr) => {{ $expr.trace_err_at(module_path!(), file!(), line!()) }};
}

/// An in-process store with one container, and a client connected to it
pub struct TestStore {
    pub store: MemoryStore,
    pub client: Client,
}

impl TestStore {
    pub fn start(partitions: usize) -> anyhow::Result<Self> {
        Self::start_with(partitions, fast_retries())
    }

    pub fn start_with(partitions: usize, builder: config::Builder) -> anyhow::Result<Self> {
        let store = MemoryStore::new();
        store.create_container(CONTAINER, partitions)?;
        let client = Client::new(builder.build()?, store.clone());
        Ok(Self { store, client })
    }

    pub fn container(&self) -> Container {
        self.client.container(CONTAINER)
    }

    /// Split `partition` and return its children
    pub fn split(&self, partition: PartitionId) -> anyhow::Result<(PartitionId, PartitionId)> {
        Ok(self.store.split_partition(CONTAINER, partition)?)
    }
}

/// Default settings with retry delays short enough for tests
pub fn fast_retries() -> config::Builder {
    config::Config::builder()
        .retry(config::RetryConfig::new(5, Duration::from_millis(5)))
        .feed_max_wait(Duration::from_millis(20))
}

/// Item whose body is the decimal text of `n`
pub fn number_item(id: impl Into<String>, pk: impl Into<PartitionKey>, n: i64) -> Item {
    Item::new(id, pk, Bytes::from(n.to_string()))
}

/// Query evaluator ordering items by the number in their body.  Items without one don't match.
pub fn by_number(_query: &str, item: &Item) -> Option<SortKey> {
    std::str::from_utf8(&item.body)
        .ok()?
        .parse()
        .ok()
        .map(SortKey::Int)
}

/// `n` partition keys owned by `partition`
pub async fn keys_in(
    container: &Container,
    partition: PartitionId,
    n: usize,
) -> anyhow::Result<Vec<PartitionKey>> {
    let mut keys = Vec::with_capacity(n);
    for i in 0.. {
        if keys.len() == n {
            break;
        }
        let pk = PartitionKey::new(format!("pk-{i}"));
        if container.resolve(&pk).await?.id == partition {
            keys.push(pk);
        }
    }
    Ok(keys)
}
