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

//! Paged, resumable iteration over query results.
//!
//! The iterator keeps one cursor per key range in scope.  Each cursor remembers two positions:
//! the last row fetched from the store and the last row handed to the caller.  Positions are
//! `(order key, id, partition key)` tuples rather than partition-local offsets, so when a
//! partition splits its cursor is replaced by cursors for the children that carry on from the
//! same position.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::stream::Stream;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::Container;
use crate::Error;
use crate::ErrorKind;
use crate::Item;
use crate::Order;
use crate::QueryOptions;
use crate::Result;
use crate::Session;
use crate::executor::Operation;
use crate::retry::CancelSignal;
use crate::retry::RunOptions;
use crate::routing::KEY_SPACE_END;
use crate::routing::PartitionKeyRange;
use crate::transport::ContinuationToken;
use crate::transport::QueryRow;
use crate::transport::ResponseBody;
use crate::transport::position_cmp;
use crate::util;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueryState {
    NotStarted,
    Fetching,
    HasBatch,
    Exhausted,
    /// A terminal failure was returned; every later `next` returns it again
    Errored,
}

/// One batch of results
#[derive(Clone, Debug, Default)]
pub struct QueryPage {
    pub rows: Vec<QueryRow>,
    /// Charge of the fetches made to produce this page
    pub request_charge: f64,
}

impl QueryPage {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.rows.iter().map(|r| &r.item)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct RangePosition {
    low: u64,
    high: u64,
    after: Option<ContinuationToken>,
}

/// Where a query left off: every key range with results still to deliver, and the last
/// position delivered from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContinuation {
    ranges: Vec<RangePosition>,
}

const QUERY_CONTINUATION_TAG: &str = "q1";

impl QueryContinuation {
    fn full() -> Self {
        Self {
            ranges: vec![RangePosition {
                low: 0,
                high: KEY_SPACE_END,
                after: None,
            }],
        }
    }

    /// Nothing left to deliver
    pub fn is_complete(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl fmt::Display for QueryContinuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = util::encode_token(QUERY_CONTINUATION_TAG, self).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

impl FromStr for QueryContinuation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let c: Self = util::decode_token(s, "query continuation", QUERY_CONTINUATION_TAG)?;
        if let Some(r) = c
            .ranges
            .iter()
            .find(|r| r.low >= r.high || r.high > KEY_SPACE_END)
        {
            return Err(Error::Malformed(format!(
                "invalid query continuation: bad range [{}, {})",
                r.low, r.high
            )));
        }
        Ok(c)
    }
}

#[derive(Debug)]
struct RangeCursor {
    range: PartitionKeyRange,
    low: u64,
    high: u64,
    // last row fetched from the store
    next: Option<ContinuationToken>,
    // last row returned to the caller
    emitted: Option<ContinuationToken>,
    buffer: VecDeque<QueryRow>,
    done: bool,
}

impl RangeCursor {
    fn new(range: PartitionKeyRange, low: u64, high: u64, after: Option<ContinuationToken>) -> Self {
        Self {
            range,
            low,
            high,
            next: after.clone(),
            emitted: after,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    fn is_finished(&self) -> bool {
        self.done && self.buffer.is_empty()
    }

    fn needs_fetch(&self) -> bool {
        !self.done && self.buffer.is_empty()
    }

    fn pop(&mut self) -> Option<QueryRow> {
        let row = self.buffer.pop_front()?;
        self.emitted = Some(row.position());
        Some(row)
    }
}

struct FetchSpec {
    index: usize,
    range: PartitionKeyRange,
    low: u64,
    high: u64,
    after: Option<ContinuationToken>,
}

enum Fetched {
    Page {
        rows: Vec<QueryRow>,
        next: Option<ContinuationToken>,
        request_charge: f64,
    },
    Split(Vec<PartitionKeyRange>),
}

/// A lazy, finite, restartable sequence of result pages.
///
/// Without an order, partitions are drained in key space order, one buffered page per call,
/// while up to `max_parallel_requests` partitions are fetched ahead.  With an order, every page
/// is a k-way merge of the per-partition streams, so the concatenation of all pages is in
/// global order.
pub struct QueryIterator {
    container: Container,
    session: Session,
    query: Arc<str>,
    order: Option<Order>,
    max_item_count: usize,
    run_options: RunOptions,
    cancel: CancelSignal,
    state: QueryState,
    cursors: Vec<RangeCursor>,
    start: QueryContinuation,
    error: Option<Arc<Error>>,
}

impl fmt::Debug for QueryIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIterator")
            .field("container", &self.container.name())
            .field("query", &self.query)
            .field("order", &self.order)
            .field("state", &self.state)
            .field("cursors", &self.cursors.len())
            .finish_non_exhaustive()
    }
}

impl QueryIterator {
    pub(crate) fn new(
        container: Container,
        session: Session,
        query: String,
        options: QueryOptions,
    ) -> Self {
        let config = container.config();
        let max_item_count = options
            .max_item_count
            .unwrap_or_else(|| config.default_max_item_count())
            .max(1);
        let run_options = RunOptions {
            consistency: options
                .consistency
                .unwrap_or_else(|| config.consistency()),
            retry_writes: false,
        };
        let cancel = session.signal(options.cancel);
        Self {
            container,
            session,
            query: Arc::from(query),
            order: options.order,
            max_item_count,
            run_options,
            cancel,
            state: QueryState::NotStarted,
            cursors: Vec::new(),
            start: QueryContinuation::full(),
            error: None,
        }
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Position to resume from with [`reset`](Self::reset), possibly in another process
    pub fn continuation(&self) -> QueryContinuation {
        match self.state {
            QueryState::NotStarted => self.start.clone(),
            _ => QueryContinuation {
                ranges: self
                    .cursors
                    .iter()
                    .filter(|c| !c.is_finished())
                    .map(|c| RangePosition {
                        low: c.low,
                        high: c.high,
                        after: c.emitted.clone(),
                    })
                    .collect(),
            },
        }
    }

    /// Resume from `continuation`.  Rows returned before it was taken are not returned again.
    pub fn reset(&mut self, continuation: QueryContinuation) {
        self.start = continuation;
        self.cursors.clear();
        self.error = None;
        self.state = QueryState::NotStarted;
    }

    /// Start over from the first result
    pub fn restart(&mut self) {
        self.reset(QueryContinuation::full());
    }

    /// The next page, or `None` once every partition is drained
    pub async fn next(&mut self) -> Result<Option<QueryPage>> {
        match self.state {
            QueryState::Exhausted => return Ok(None),
            QueryState::Errored => {
                if let Some(e) = &self.error {
                    return Err(Error::Shared(Arc::clone(e)));
                }
            }
            _ => {}
        }

        let was = self.state;
        self.state = QueryState::Fetching;
        let page = if was == QueryState::NotStarted {
            match self.open().await {
                Ok(()) => self.next_page().await,
                Err(e) => Err(e),
            }
        } else {
            self.next_page().await
        };

        match page {
            Ok(Some(page)) => {
                self.state = QueryState::HasBatch;
                Ok(Some(page))
            }
            Ok(None) => {
                self.state = QueryState::Exhausted;
                Ok(None)
            }
            Err(e) => {
                debug!(container = %self.container.name(), ?e, "query failed");
                let e = Arc::new(e);
                self.error = Some(Arc::clone(&e));
                self.state = QueryState::Errored;
                Err(Error::Shared(e))
            }
        }
    }

    /// Drain the remaining pages as a stream, ending after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<QueryPage>> {
        futures::stream::unfold(Some(self), |it| async move {
            let mut it = it?;
            match it.next().await {
                Ok(Some(page)) => Some((Ok(page), Some(it))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Every remaining item, in result order
    pub async fn collect_all(mut self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        while let Some(page) = self.next().await? {
            items.extend(page.rows.into_iter().map(|r| r.item));
        }
        Ok(items)
    }

    async fn open(&mut self) -> Result<()> {
        let map = self.cancel.run(self.container.router().loaded()).await?;
        self.cursors = self
            .start
            .ranges
            .iter()
            .flat_map(|pos| {
                map.overlapping(pos.low, pos.high).filter_map(|r| {
                    let (low, high) = r.clip(pos.low, pos.high)?;
                    Some(RangeCursor::new(r.clone(), low, high, pos.after.clone()))
                })
            })
            .collect();
        Ok(())
    }

    async fn next_page(&mut self) -> Result<Option<QueryPage>> {
        match self.order {
            Some(order) => self.next_merged(order).await,
            None => self.next_unordered().await,
        }
    }

    async fn next_unordered(&mut self) -> Result<Option<QueryPage>> {
        let mut request_charge = 0.0;
        loop {
            if let Some(cursor) = self.cursors.iter_mut().find(|c| !c.buffer.is_empty()) {
                let mut rows = Vec::new();
                while rows.len() < self.max_item_count
                    && let Some(row) = cursor.pop()
                {
                    rows.push(row);
                }
                return Ok(Some(QueryPage {
                    rows,
                    request_charge,
                }));
            }

            let parallel = self.container.config().max_parallel_requests();
            let need: Vec<usize> = (0..self.cursors.len())
                .filter(|&i| self.cursors[i].needs_fetch())
                .take(parallel)
                .collect();
            if need.is_empty() {
                return Ok(None);
            }
            request_charge += self.fill(need).await?;
        }
    }

    async fn next_merged(&mut self, order: Order) -> Result<Option<QueryPage>> {
        let mut rows = Vec::new();
        let mut request_charge = 0.0;
        while rows.len() < self.max_item_count {
            // Every live cursor needs a head before the smallest can be picked
            let need: Vec<usize> = (0..self.cursors.len())
                .filter(|&i| self.cursors[i].needs_fetch())
                .collect();
            if !need.is_empty() {
                request_charge += self.fill(need).await?;
                continue;
            }

            let best = self
                .cursors
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.buffer.front().map(|row| (i, row.position())))
                .min_by(|(_, a), (_, b)| position_cmp(order, a, b))
                .map(|(i, _)| i);
            let Some(i) = best else {
                break;
            };
            if let Some(row) = self.cursors[i].pop() {
                rows.push(row);
            }
        }

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(QueryPage {
            rows,
            request_charge,
        }))
    }

    /// Fetch one page for each cursor in `indices`, concurrently.  Returns the request charge.
    async fn fill(&mut self, indices: Vec<usize>) -> Result<f64> {
        let specs: Vec<FetchSpec> = indices
            .into_iter()
            .map(|index| {
                let c = &self.cursors[index];
                FetchSpec {
                    index,
                    range: c.range.clone(),
                    low: c.low,
                    high: c.high,
                    after: c.next.clone(),
                }
            })
            .collect();

        let parallel = self.container.config().max_parallel_requests();
        let mut results: Vec<(usize, Result<Fetched>)> = {
            let this = &*self;
            futures::stream::iter(specs)
                .map(|req| async move { (req.index, this.fetch(req).await) })
                .buffer_unordered(parallel)
                .collect()
                .await
        };

        // Highest index first so splicing in children keeps the other indices valid
        results.sort_unstable_by(|(a, _), (b, _)| b.cmp(a));
        let mut request_charge = 0.0;
        for (index, result) in results {
            match result? {
                Fetched::Page {
                    rows,
                    next,
                    request_charge: charge,
                } => {
                    request_charge += charge;
                    let c = &mut self.cursors[index];
                    c.buffer.extend(rows);
                    match next {
                        Some(next) => c.next = Some(next),
                        None => c.done = true,
                    }
                }
                Fetched::Split(children) => {
                    let parent = &self.cursors[index];
                    let replacements: Vec<RangeCursor> = children
                        .into_iter()
                        .filter_map(|r| {
                            let (low, high) = r.clip(parent.low, parent.high)?;
                            let mut c = RangeCursor::new(r, low, high, parent.next.clone());
                            c.emitted = parent.emitted.clone();
                            Some(c)
                        })
                        .collect();
                    info!(
                        container = %self.container.name(),
                        partition = %parent.range.id,
                        children = replacements.len(),
                        "query range split"
                    );
                    self.cursors.splice(index..=index, replacements);
                }
            }
        }
        Ok(request_charge)
    }

    async fn fetch(&self, req: FetchSpec) -> Result<Fetched> {
        let op = Operation::QueryPage {
            range: req.range.clone(),
            low: req.low,
            high: req.high,
            query: Arc::clone(&self.query),
            order: self.order,
            continuation: req.after,
            max_item_count: self.max_item_count,
        };
        let mut moved = 0;
        loop {
            let rsp = self
                .container
                .run(&self.session, &op, self.run_options, &self.cancel)
                .await;

            match rsp {
                Ok(rsp) => {
                    return match rsp.body {
                        ResponseBody::QueryPage { rows } => Ok(Fetched::Page {
                            rows,
                            next: rsp.continuation,
                            request_charge: rsp.request_charge,
                        }),
                        other => Err(Error::Malformed(format!(
                            "expected a query page, got {other:?}"
                        ))),
                    };
                }
                Err(e) if e.kind() == ErrorKind::PartitionMoved => {
                    // routing was refreshed before the error came back
                    let map = self.cancel.run(self.container.router().loaded()).await?;
                    let children: Vec<PartitionKeyRange> =
                        map.overlapping(req.low, req.high).cloned().collect();
                    let unchanged = children.is_empty()
                        || (children.len() == 1 && children[0].id == req.range.id);
                    if !unchanged {
                        return Ok(Fetched::Split(children));
                    }
                    moved += 1;
                    if moved > self.container.config().retry().partition_moved {
                        return Err(e);
                    }
                    debug!(
                        container = %self.container.name(),
                        partition = %req.range.id,
                        moved,
                        "partition unchanged after refresh, fetching again"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PartitionKey;
    use crate::SortKey;

    fn position(key: i64, id: &str) -> ContinuationToken {
        ContinuationToken {
            order_key: SortKey::Int(key),
            id: id.to_string(),
            partition_key: PartitionKey::from("pk"),
        }
    }

    #[test]
    fn test_continuation_text_form() {
        let c = QueryContinuation {
            ranges: vec![
                RangePosition {
                    low: 0,
                    high: 0x1000,
                    after: Some(position(3, "a")),
                },
                RangePosition {
                    low: 0x1000,
                    high: KEY_SPACE_END,
                    after: None,
                },
            ],
        };
        let s = c.to_string();
        assert_eq!(c, s.parse::<QueryContinuation>().unwrap());

        let empty = QueryContinuation { ranges: vec![] };
        assert!(empty.is_complete());
        assert_eq!(empty, empty.to_string().parse().unwrap());
    }

    #[test]
    fn test_continuation_rejects_bad_ranges() {
        let bad = QueryContinuation {
            ranges: vec![RangePosition {
                low: 5,
                high: 5,
                after: None,
            }],
        };
        assert!(bad.to_string().parse::<QueryContinuation>().is_err());
        assert!("q2.e30".parse::<QueryContinuation>().is_err());
        assert!("q1.e30".parse::<QueryContinuation>().is_err());
    }

    #[test]
    fn test_cursor_tracks_emitted() {
        let range = PartitionKeyRange::new(crate::PartitionId::new(0), 0, KEY_SPACE_END);
        let mut c = RangeCursor::new(range, 0, KEY_SPACE_END, None);
        assert!(c.needs_fetch());
        c.buffer.push_back(QueryRow {
            item: Item::new("a", "pk", bytes::Bytes::new()),
            etag: crate::ETag::new(1),
            order_key: SortKey::Int(3),
        });
        c.done = true;
        assert!(!c.needs_fetch());
        assert!(!c.is_finished());
        c.pop();
        assert!(c.is_finished());
        assert_eq!(Some(position(3, "a")), c.emitted);
    }
}
