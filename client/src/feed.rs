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

//! Incremental change feed with per-partition cursors.
//!
//! Each partition has a committed sequence number.  `poll` returns entries written after it and
//! `ack` moves it forward, so until a batch is acknowledged every poll returns it again.  A
//! checkpoint is the set of committed positions; restarting from one redelivers whatever was
//! polled but not acknowledged.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::Container;
use crate::Error;
use crate::ErrorKind;
use crate::FeedOptions;
use crate::Result;
use crate::Session;
use crate::StartFrom;
use crate::executor::Operation;
use crate::executor::Response;
use crate::retry::CancelSignal;
use crate::retry::RunOptions;
use crate::routing::KEY_SPACE_END;
use crate::routing::PartitionId;
use crate::routing::PartitionKeyRange;
use crate::transport::FeedEntry;
use crate::transport::ResponseBody;
use crate::util;

/// Position in one partition's feed: everything up to and including `sequence` is consumed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCursor {
    pub partition: PartitionId,
    pub low: u64,
    pub high: u64,
    pub sequence: u64,
}

#[derive(Clone, Debug)]
pub struct FeedBatch {
    pub partition: PartitionId,
    /// In commit order.  Empty when nothing new arrived within the wait.
    pub items: Vec<FeedEntry>,
    /// Pass to [`FeedCursorManager::ack`] once the items are processed
    pub cursor: FeedCursor,
    /// Last sequence written to the partition when the batch was read
    pub latest: u64,
    pub request_charge: f64,
}

#[derive(Clone, Debug)]
pub enum FeedPoll {
    Batch(FeedBatch),
    /// The partition was split.  Poll the children instead; they continue from the parent's
    /// committed position.
    Split {
        parent: PartitionId,
        children: Vec<PartitionId>,
    },
}

/// Committed positions of every partition, restorable with
/// [`FeedCursorManager::from_checkpoint`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCheckpoint {
    cursors: Vec<FeedCursor>,
}

const CHECKPOINT_TAG: &str = "f1";

impl FeedCheckpoint {
    pub fn cursors(&self) -> &[FeedCursor] {
        &self.cursors
    }
}

impl fmt::Display for FeedCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = util::encode_token(CHECKPOINT_TAG, self).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

impl FromStr for FeedCheckpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let cp: Self = util::decode_token(s, "feed checkpoint", CHECKPOINT_TAG)?;
        if let Some(c) = cp
            .cursors
            .iter()
            .find(|c| c.low >= c.high || c.high > KEY_SPACE_END)
        {
            return Err(Error::Malformed(format!(
                "invalid feed checkpoint: bad range [{}, {}) for partition {}",
                c.low, c.high, c.partition
            )));
        }
        Ok(cp)
    }
}

#[derive(Debug)]
struct Slot {
    range: PartitionKeyRange,
    committed: AtomicU64,
    // held for the length of a poll: one consumer per partition
    poll_lock: tokio::sync::Mutex<()>,
}

impl Slot {
    fn new(range: PartitionKeyRange, committed: u64) -> Arc<Self> {
        Arc::new(Self {
            range,
            committed: AtomicU64::new(committed),
            poll_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    fn cursor(&self, sequence: u64) -> FeedCursor {
        FeedCursor {
            partition: self.range.id,
            low: self.range.low,
            high: self.range.high,
            sequence,
        }
    }
}

#[derive(Debug, Default)]
struct Slots {
    live: BTreeMap<PartitionId, Arc<Slot>>,
    forks: HashMap<PartitionId, Vec<PartitionId>>,
}

/// Pull interface over a container's change feed.
///
/// Different partitions may be polled concurrently; polls of the same partition are serialised.
#[derive(Debug)]
pub struct FeedCursorManager {
    container: Container,
    session: Session,
    max_item_count: usize,
    max_wait: Duration,
    run_options: RunOptions,
    slots: Mutex<Slots>,
}

impl FeedCursorManager {
    pub(crate) async fn new(
        container: Container,
        session: Session,
        options: FeedOptions,
    ) -> Result<Self> {
        let manager = Self::with_slots(container, session, &options, Slots::default());
        let cancel = manager.session.signal(None);
        let map = cancel.run(manager.container.router().loaded()).await?;

        let ranges: Vec<PartitionKeyRange> = map.ranges().to_vec();
        let starts: Vec<(PartitionKeyRange, u64)> = match options.start_from {
            StartFrom::Beginning => ranges.into_iter().map(|r| (r, 0)).collect(),
            StartFrom::Now => {
                let parallel = manager.container.config().max_parallel_requests();
                let m = &manager;
                let cancel = &cancel;
                futures::stream::iter(ranges)
                    .map(|range| async move {
                        let latest = m.latest(range.clone(), cancel).await?;
                        Ok::<_, Error>((range, latest))
                    })
                    .buffered(parallel)
                    .collect::<Vec<_>>()
                    .await
                    .into_iter()
                    .collect::<Result<_>>()?
            }
        };

        {
            let mut slots = manager.lock();
            for (range, committed) in starts {
                slots.live.insert(range.id, Slot::new(range, committed));
            }
        }
        info!(
            container = %manager.container.name(),
            partitions = manager.partitions().len(),
            start_from = ?options.start_from,
            "change feed opened"
        );
        Ok(manager)
    }

    /// Resume from committed positions saved by [`checkpoint`](Self::checkpoint).  Partitions
    /// split since then are forked on their first poll.
    pub fn from_checkpoint(
        container: &Container,
        session: &Session,
        checkpoint: &FeedCheckpoint,
        options: FeedOptions,
    ) -> Self {
        let mut slots = Slots::default();
        for c in &checkpoint.cursors {
            let range = PartitionKeyRange::new(c.partition, c.low, c.high);
            slots.live.insert(c.partition, Slot::new(range, c.sequence));
        }
        Self::with_slots(container.clone(), session.clone(), &options, slots)
    }

    fn with_slots(
        container: Container,
        session: Session,
        options: &FeedOptions,
        slots: Slots,
    ) -> Self {
        let config = container.config();
        let max_item_count = options
            .max_item_count
            .unwrap_or_else(|| config.default_max_item_count())
            .max(1);
        let max_wait = options.max_wait.unwrap_or_else(|| config.feed_max_wait());
        let run_options = RunOptions {
            consistency: config.consistency(),
            retry_writes: false,
        };
        Self {
            container,
            session,
            max_item_count,
            max_wait,
            run_options,
            slots: Mutex::new(slots),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Partitions currently being followed, in id order
    pub fn partitions(&self) -> Vec<PartitionId> {
        self.lock().live.keys().copied().collect()
    }

    /// Read the next batch of `partition`, starting after its committed position.
    ///
    /// Waits up to the feed's `max_wait` for new writes and returns an empty batch if none
    /// arrive.  Returns [`FeedPoll::Split`] once the partition has been split.
    pub async fn poll(&self, partition: PartitionId) -> Result<FeedPoll> {
        let slot = {
            let slots = self.lock();
            match slots.live.get(&partition) {
                Some(slot) => Arc::clone(slot),
                None => {
                    return match slots.forks.get(&partition) {
                        Some(children) => Ok(FeedPoll::Split {
                            parent: partition,
                            children: children.clone(),
                        }),
                        None => Err(Error::NotFound(format!(
                            "partition {partition} is not part of this feed"
                        ))),
                    };
                }
            }
        };

        let cancel = self.session.signal(None);
        let _guard = cancel.run(async { Ok(slot.poll_lock.lock().await) }).await?;

        let after = slot.committed();
        let op = Operation::FeedPage {
            range: slot.range.clone(),
            after,
            max_item_count: self.max_item_count,
            max_wait: self.max_wait,
        };
        let mut moved = 0;
        loop {
            match self
                .container
                .run(&self.session, &op, self.run_options, &cancel)
                .await
            {
                Ok(rsp) => return self.batch(&slot, after, rsp).map(FeedPoll::Batch),
                Err(e) if e.kind() == ErrorKind::PartitionMoved => {
                    if let Some(split) = self.fork(&slot, &cancel).await? {
                        return Ok(split);
                    }
                    moved += 1;
                    if moved > self.container.config().retry().partition_moved {
                        return Err(e);
                    }
                    debug!(
                        container = %self.container.name(),
                        %partition,
                        moved,
                        "partition unchanged after refresh, polling again"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn batch(&self, slot: &Slot, after: u64, rsp: Response) -> Result<FeedBatch> {
        let ResponseBody::FeedPage { entries, latest } = rsp.body else {
            return Err(Error::Malformed(format!(
                "expected a feed page, got {:?}",
                rsp.body
            )));
        };
        let sequence = entries.last().map_or(after, |e| e.sequence);
        debug!(
            container = %self.container.name(),
            partition = %slot.range.id,
            after,
            count = entries.len(),
            latest,
            "feed batch"
        );
        Ok(FeedBatch {
            partition: slot.range.id,
            items: entries,
            cursor: slot.cursor(sequence),
            latest,
            request_charge: rsp.request_charge,
        })
    }

    // Replace a split partition's cursor with cursors for its children.  `None` if the refreshed
    // layout still has the partition in place.
    async fn fork(&self, slot: &Slot, cancel: &CancelSignal) -> Result<Option<FeedPoll>> {
        let map = cancel.run(self.container.router().loaded()).await?;
        let parent = slot.range.id;
        let children: Vec<PartitionKeyRange> = map
            .overlapping(slot.range.low, slot.range.high)
            .filter_map(|r| {
                let (low, high) = r.clip(slot.range.low, slot.range.high)?;
                Some(PartitionKeyRange::new(r.id, low, high).with_parents(r.parents.clone()))
            })
            .collect();
        if children.is_empty() || (children.len() == 1 && children[0].id == parent) {
            return Ok(None);
        }

        let committed = slot.committed();
        let ids: Vec<PartitionId> = children.iter().map(|r| r.id).collect();
        {
            let mut slots = self.lock();
            slots.live.remove(&parent);
            for range in children {
                slots
                    .live
                    .entry(range.id)
                    .or_insert_with(|| Slot::new(range, committed));
            }
            slots.forks.insert(parent, ids.clone());
        }
        info!(
            container = %self.container.name(),
            %parent,
            children = ?ids,
            committed,
            "feed cursor forked"
        );
        Ok(Some(FeedPoll::Split {
            parent,
            children: ids,
        }))
    }

    /// Commit everything up to `cursor`.  Positions only move forward: acknowledging an older
    /// cursor is a no-op.  A cursor of a partition that has since been split advances its
    /// children.
    pub fn ack(&self, cursor: &FeedCursor) -> Result<()> {
        let slots = self.lock();
        let targets: Vec<&Arc<Slot>> = match slots.live.get(&cursor.partition) {
            Some(slot) => vec![slot],
            None => slots
                .live
                .values()
                .filter(|s| {
                    s.range.descends_from(cursor.partition)
                        && s.range.low >= cursor.low
                        && s.range.high <= cursor.high
                })
                .collect(),
        };
        if targets.is_empty() {
            return Err(Error::NotFound(format!(
                "partition {} is not part of this feed",
                cursor.partition
            )));
        }
        for slot in targets {
            let prev = slot.committed.fetch_max(cursor.sequence, Ordering::AcqRel);
            debug!(
                partition = %slot.range.id,
                prev,
                sequence = cursor.sequence.max(prev),
                "feed ack"
            );
        }
        Ok(())
    }

    /// Committed positions of every followed partition
    pub fn checkpoint(&self) -> FeedCheckpoint {
        FeedCheckpoint {
            cursors: self
                .lock()
                .live
                .values()
                .map(|s| s.cursor(s.committed()))
                .collect(),
        }
    }

    // Last sequence written to the partition, without waiting or reading entries
    async fn latest(&self, range: PartitionKeyRange, cancel: &CancelSignal) -> Result<u64> {
        let op = Operation::FeedPage {
            range,
            after: u64::MAX,
            max_item_count: 0,
            max_wait: Duration::ZERO,
        };
        let rsp = self
            .container
            .run(&self.session, &op, self.run_options, cancel)
            .await?;
        match rsp.body {
            ResponseBody::FeedPage { latest, .. } => Ok(latest),
            other => Err(Error::Malformed(format!(
                "expected a feed page, got {other:?}"
            ))),
        }
    }
}
