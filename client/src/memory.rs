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

//! An in-process document store.
//!
//! Partitions own slices of the hashed key space, keep their items and an append-only change
//! log, and can be split while clients are using them.  Faults can be queued per container to
//! exercise throttling, stale routing and transport failures.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::debug;
use tracing::info;

use crate::ETag;
use crate::Error;
use crate::Item;
use crate::PartitionId;
use crate::PartitionKey;
use crate::Result;
use crate::SessionToken;
use crate::SortKey;
use crate::routing::KEY_SPACE_END;
use crate::routing::PartitionKeyRange;
use crate::routing::hash_partition_key;
use crate::transport::ContinuationToken;
use crate::transport::FeedEntry;
use crate::transport::PartitionMapResponse;
use crate::transport::QueryRow;
use crate::transport::RawResponse;
use crate::transport::Request;
use crate::transport::RequestBody;
use crate::transport::ResponseBody;
use crate::transport::Status;
use crate::transport::Transport;
use crate::transport::position_cmp;

/// Decides which items a query matches and the key they are ordered by
pub trait QueryEvaluator: Send + Sync {
    /// The order key of `item` if it matches `query`
    fn evaluate(&self, query: &str, item: &Item) -> Option<SortKey>;
}

impl<F> QueryEvaluator for F
where
    F: Fn(&str, &Item) -> Option<SortKey> + Send + Sync,
{
    fn evaluate(&self, query: &str, item: &Item) -> Option<SortKey> {
        self(query, item)
    }
}

// Matches everything, ordered by id
fn match_all(_query: &str, item: &Item) -> Option<SortKey> {
    Some(SortKey::Str(item.id.clone()))
}

/// A failure the store plays back instead of serving a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    Throttle { retry_after: Option<Duration> },
    ServiceUnavailable,
    SessionNotAvailable,
    Gone,
    /// Fail the round trip itself
    Disconnect,
    /// Serve the request normally after a pause
    Delay(Duration),
}

/// Requests a fault applies to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultScope {
    Any,
    Reads,
    Writes,
    Queries,
    Feeds,
}

impl FaultScope {
    fn matches(self, body: &RequestBody) -> bool {
        match self {
            FaultScope::Any => true,
            FaultScope::Reads => matches!(body, RequestBody::Read { .. }),
            FaultScope::Writes => body.is_write(),
            FaultScope::Queries => matches!(body, RequestBody::QueryPage { .. }),
            FaultScope::Feeds => matches!(body, RequestBody::FeedPage { .. }),
        }
    }
}

struct ArmedFault {
    fault: Fault,
    scope: FaultScope,
    remaining: usize,
}

struct StoredItem {
    item: Item,
    etag: ETag,
    hash: u64,
}

struct LogEntry {
    hash: u64,
    entry: FeedEntry,
}

struct PartitionState {
    range: PartitionKeyRange,
    lsn: u64,
    items: BTreeMap<(PartitionKey, String), StoredItem>,
    log: Vec<LogEntry>,
}

impl PartitionState {
    fn new(range: PartitionKeyRange) -> Self {
        Self {
            range,
            lsn: 0,
            items: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    fn token(&self) -> SessionToken {
        SessionToken::new(self.range.id, self.lsn)
    }
}

struct ContainerState {
    sequence: u64,
    map_version: u64,
    next_partition_id: i64,
    partitions: BTreeMap<PartitionId, PartitionState>,
    retired: HashSet<PartitionId>,
    faults: VecDeque<ArmedFault>,
    partition_map_failures: usize,
    evaluator: Arc<dyn QueryEvaluator>,
    notify: Arc<Notify>,
}

impl ContainerState {
    fn new(partitions: usize) -> Self {
        let n = partitions as u64;
        let step = KEY_SPACE_END / n;
        let partitions = (0..n)
            .map(|i| {
                #[allow(clippy::cast_possible_wrap)]
                let id = PartitionId::new(i as i64);
                let high = if i + 1 == n { KEY_SPACE_END } else { (i + 1) * step };
                (id, PartitionState::new(PartitionKeyRange::new(id, i * step, high)))
            })
            .collect();
        #[allow(clippy::cast_possible_wrap)]
        let next_partition_id = n as i64;
        Self {
            sequence: 0,
            map_version: 1,
            next_partition_id,
            partitions,
            retired: HashSet::new(),
            faults: VecDeque::new(),
            partition_map_failures: 0,
            evaluator: Arc::new(match_all),
            notify: Arc::new(Notify::new()),
        }
    }

    fn take_fault(&mut self, body: &RequestBody) -> Option<Fault> {
        let i = self.faults.iter().position(|f| f.scope.matches(body))?;
        let armed = &mut self.faults[i];
        armed.remaining -= 1;
        let fault = armed.fault.clone();
        if armed.remaining == 0 {
            self.faults.remove(i);
        }
        Some(fault)
    }

    // The live partition `request` is addressed to, or the response to send instead
    fn partition(
        &mut self,
        request: &Request,
    ) -> std::result::Result<&mut PartitionState, RawResponse> {
        match self.partitions.get_mut(&request.partition) {
            Some(p) => Ok(p),
            None if self.retired.contains(&request.partition) => Err(RawResponse::message(
                Status::Gone,
                format!("partition {} was split", request.partition),
            )),
            None => Err(RawResponse::message(
                Status::BadRequest,
                format!("unknown partition {}", request.partition),
            )),
        }
    }

    fn write(&mut self, request: &Request) -> RawResponse {
        let (id, partition_key) = match &request.body {
            RequestBody::Create { item }
            | RequestBody::Upsert { item, .. }
            | RequestBody::Replace { item, .. } => (&item.id, &item.partition_key),
            RequestBody::Delete {
                id, partition_key, ..
            } => (id, partition_key),
            _ => return RawResponse::message(Status::BadRequest, "not a write"),
        };
        if id.is_empty() {
            return RawResponse::message(Status::BadRequest, "item id must not be empty");
        }
        let hash = key_hash(partition_key);
        let key = (partition_key.clone(), id.clone());

        let sequence = self.sequence + 1;
        let p = match self.partition(request) {
            Ok(p) => p,
            Err(rsp) => return rsp,
        };
        if !p.range.contains(hash) {
            return misrouted(p);
        }

        let (item, status) = match &request.body {
            RequestBody::Create { item } => {
                if p.items.contains_key(&key) {
                    return RawResponse::message(
                        Status::Conflict,
                        format!("item {} already exists", item.id),
                    );
                }
                (item, Status::Created)
            }
            RequestBody::Upsert { item, if_match } => {
                let stored = p.items.get(&key);
                if let Some(etag) = if_match
                    && stored.is_none_or(|s| s.etag != *etag)
                {
                    return RawResponse::message(
                        Status::PreconditionFailed,
                        format!("etag {etag} does not match item {}", item.id),
                    );
                }
                let status = if stored.is_some() {
                    Status::Ok
                } else {
                    Status::Created
                };
                (item, status)
            }
            RequestBody::Replace { item, if_match } => {
                if let Err(rsp) = check_precondition(p.items.get(&key), *if_match) {
                    return rsp;
                }
                (item, Status::Ok)
            }
            RequestBody::Delete { if_match, .. } => {
                if let Err(rsp) = check_precondition(p.items.get(&key), *if_match) {
                    return rsp;
                }
                p.items.remove(&key);
                p.lsn = sequence;
                let token = p.token();
                self.sequence = sequence;
                return RawResponse::empty(Status::NoContent)
                    .with_session_token(token)
                    .with_charge(5.0);
            }
            _ => return RawResponse::message(Status::BadRequest, "not a write"),
        };

        let etag = ETag::new(sequence);
        p.lsn = sequence;
        p.items.insert(
            key,
            StoredItem {
                item: item.clone(),
                etag,
                hash,
            },
        );
        p.log.push(LogEntry {
            hash,
            entry: FeedEntry {
                sequence,
                item: item.clone(),
                etag,
            },
        });
        let token = p.token();
        self.sequence = sequence;
        self.notify.notify_waiters();

        RawResponse::new(
            status,
            ResponseBody::Item {
                item: item.clone(),
                etag,
            },
        )
        .with_session_token(token)
        .with_charge(5.0 + kb(&item.body))
    }

    fn read(&mut self, request: &Request) -> RawResponse {
        let RequestBody::Read { id, partition_key } = &request.body else {
            return RawResponse::message(Status::BadRequest, "not a read");
        };
        let p = match self.partition(request) {
            Ok(p) => p,
            Err(rsp) => return rsp,
        };
        if !p.range.contains(key_hash(partition_key)) {
            return misrouted(p);
        }
        if let Some(rsp) = check_session(p, request.session_token) {
            return rsp;
        }

        let token = p.token();
        match p.items.get(&(partition_key.clone(), id.clone())) {
            Some(stored) => RawResponse::new(
                Status::Ok,
                ResponseBody::Item {
                    item: stored.item.clone(),
                    etag: stored.etag,
                },
            )
            .with_session_token(token)
            .with_charge(1.0 + kb(&stored.item.body)),
            None => RawResponse::message(Status::NotFound, format!("item {id} not found"))
                .with_session_token(token)
                .with_charge(1.0),
        }
    }

    fn query_page(&mut self, request: &Request) -> RawResponse {
        let RequestBody::QueryPage {
            query,
            order,
            continuation,
            max_item_count,
        } = &request.body
        else {
            return RawResponse::message(Status::BadRequest, "not a query");
        };
        if *max_item_count == 0 {
            return RawResponse::message(Status::BadRequest, "max item count must be positive");
        }
        let evaluator = Arc::clone(&self.evaluator);
        let p = match self.partition(request) {
            Ok(p) => p,
            Err(rsp) => return rsp,
        };
        if request.low < p.range.low || request.high > p.range.high || request.low >= request.high
        {
            return RawResponse::message(
                Status::BadRequest,
                format!(
                    "range [{:#x}, {:#x}) is not within {}",
                    request.low, request.high, p.range
                ),
            );
        }
        if let Some(rsp) = check_session(p, request.session_token) {
            return rsp;
        }

        let order = order.unwrap_or_default();
        let mut rows: Vec<(ContinuationToken, QueryRow)> = p
            .items
            .values()
            .filter(|s| request.low <= s.hash && s.hash < request.high)
            .filter_map(|s| {
                let order_key = evaluator.evaluate(query, &s.item)?;
                let row = QueryRow {
                    item: s.item.clone(),
                    etag: s.etag,
                    order_key,
                };
                Some((row.position(), row))
            })
            .filter(|(pos, _)| {
                continuation
                    .as_ref()
                    .is_none_or(|c| position_cmp(order, pos, c).is_gt())
            })
            .collect();
        rows.sort_by(|(a, _), (b, _)| position_cmp(order, a, b));

        let more = rows.len() > *max_item_count;
        rows.truncate(*max_item_count);
        let charge = 2.5 + rows.iter().map(|(_, r)| kb(&r.item.body)).sum::<f64>();
        let last = rows.last().map(|(pos, _)| pos.clone());

        let mut rsp = RawResponse::new(
            Status::Ok,
            ResponseBody::QueryPage {
                rows: rows.into_iter().map(|(_, r)| r).collect(),
            },
        )
        .with_session_token(p.token())
        .with_charge(charge);
        if more {
            rsp.headers.continuation = last;
        }
        rsp
    }

    // None when nothing is available yet and the caller may wait
    fn feed_page(&mut self, request: &Request, may_wait: bool) -> Option<RawResponse> {
        let RequestBody::FeedPage {
            after,
            max_item_count,
            ..
        } = &request.body
        else {
            return Some(RawResponse::message(Status::BadRequest, "not a feed request"));
        };
        let p = match self.partition(request) {
            Ok(p) => p,
            Err(rsp) => return Some(rsp),
        };

        let entries: Vec<FeedEntry> = p
            .log
            .iter()
            .filter(|e| e.entry.sequence > *after)
            .take(*max_item_count)
            .map(|e| e.entry.clone())
            .collect();
        if entries.is_empty() && *max_item_count > 0 && may_wait {
            return None;
        }

        let charge = 2.0 + entries.iter().map(|e| kb(&e.item.body)).sum::<f64>();
        Some(
            RawResponse::new(
                Status::Ok,
                ResponseBody::FeedPage {
                    entries,
                    latest: p.lsn,
                },
            )
            .with_session_token(p.token())
            .with_charge(charge),
        )
    }

    fn split(&mut self, partition: PartitionId) -> Result<(PartitionId, PartitionId)> {
        let parent = self
            .partitions
            .remove(&partition)
            .ok_or_else(|| Error::NotFound(format!("partition {partition}")))?;
        let PartitionKeyRange {
            low, high, parents, ..
        } = parent.range.clone();
        if high - low < 2 {
            self.partitions.insert(partition, parent);
            return Err(Error::Malformed(format!(
                "partition {partition} is too small to split"
            )));
        }

        let mid = low + (high - low) / 2;
        let mut lineage = parents;
        lineage.push(partition);

        let mut children = [(low, mid), (mid, high)].map(|(l, h)| {
            let id = PartitionId::new(self.next_partition_id);
            self.next_partition_id += 1;
            let mut child =
                PartitionState::new(PartitionKeyRange::new(id, l, h).with_parents(lineage.clone()));
            child.lsn = parent.lsn;
            child
        });

        for (key, stored) in parent.items {
            let i = usize::from(stored.hash >= mid);
            children[i].items.insert(key, stored);
        }
        for entry in parent.log {
            let i = usize::from(entry.hash >= mid);
            children[i].log.push(entry);
        }

        let ids = (children[0].range.id, children[1].range.id);
        for child in children {
            self.partitions.insert(child.range.id, child);
        }
        self.retired.insert(partition);
        self.map_version += 1;
        self.notify.notify_waiters();
        Ok(ids)
    }
}

fn key_hash(pk: &PartitionKey) -> u64 {
    u64::from(hash_partition_key(pk))
}

#[allow(clippy::cast_precision_loss)]
fn kb(body: &bytes::Bytes) -> f64 {
    body.len() as f64 / 1024.0
}

fn misrouted(p: &PartitionState) -> RawResponse {
    RawResponse::message(
        Status::Gone,
        format!("key is not owned by partition {}", p.range),
    )
}

fn check_precondition(
    stored: Option<&StoredItem>,
    if_match: Option<ETag>,
) -> std::result::Result<(), RawResponse> {
    match (stored, if_match) {
        (None, _) => Err(RawResponse::message(Status::NotFound, "item not found")),
        (Some(s), Some(etag)) if s.etag != etag => Err(RawResponse::message(
            Status::PreconditionFailed,
            format!("etag {etag} does not match {}", s.etag),
        )),
        _ => Ok(()),
    }
}

fn check_session(p: &PartitionState, token: Option<SessionToken>) -> Option<RawResponse> {
    let token = token?;
    (token.sequence > p.lsn).then(|| {
        RawResponse::message(
            Status::SessionNotAvailable,
            format!("{token} is ahead of partition at {}", p.lsn),
        )
    })
}

fn fault_response(fault: &Fault) -> RawResponse {
    match fault {
        Fault::Throttle { retry_after } => {
            let mut rsp = RawResponse::message(Status::TooManyRequests, "request rate too large");
            rsp.headers.retry_after = *retry_after;
            rsp
        }
        Fault::ServiceUnavailable => {
            RawResponse::message(Status::ServiceUnavailable, "service unavailable")
        }
        Fault::SessionNotAvailable => {
            RawResponse::message(Status::SessionNotAvailable, "read session not available")
        }
        Fault::Gone => RawResponse::message(Status::Gone, "partition gone"),
        Fault::Disconnect | Fault::Delay(_) => {
            RawResponse::message(Status::BadRequest, format!("{fault:?} has no response"))
        }
    }
}

#[derive(Default)]
struct State {
    containers: HashMap<String, ContainerState>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    partition_map_requests: AtomicUsize,
}

/// Shared handle to an in-process store.  Clones refer to the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

enum Admission {
    Respond(RawResponse),
    Delay(Duration),
    Proceed,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_container<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut ContainerState) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        let c = state
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("container {name}")))?;
        f(c)
    }

    /// Create a container with `partitions` equal slices of the key space
    pub fn create_container(&self, name: impl Into<String>, partitions: usize) -> Result<()> {
        let name = name.into();
        if partitions == 0 {
            return Err(Error::Malformed(
                "a container needs at least one partition".to_string(),
            ));
        }
        let mut state = self.lock();
        if state.containers.contains_key(&name) {
            return Err(Error::Conflict(format!("container {name} already exists")));
        }
        info!(container = %name, partitions, "container created");
        state
            .containers
            .insert(name, ContainerState::new(partitions));
        Ok(())
    }

    /// Split `partition` at the midpoint of its range, returning the two children
    pub fn split_partition(
        &self,
        container: &str,
        partition: PartitionId,
    ) -> Result<(PartitionId, PartitionId)> {
        let ids = self.with_container(container, |c| c.split(partition))?;
        info!(container, %partition, children = ?ids, "partition split");
        Ok(ids)
    }

    /// Queue `fault` for the next `times` requests in `scope`
    pub fn inject_fault(&self, container: &str, fault: Fault, scope: FaultScope, times: usize) {
        if times == 0 {
            return;
        }
        let mut state = self.lock();
        if let Some(c) = state.containers.get_mut(container) {
            c.faults.push_back(ArmedFault {
                fault,
                scope,
                remaining: times,
            });
        }
    }

    /// Fail the next `times` partition map requests for `container`
    pub fn fail_partition_map(&self, container: &str, times: usize) {
        let mut state = self.lock();
        if let Some(c) = state.containers.get_mut(container) {
            c.partition_map_failures += times;
        }
    }

    pub fn set_query_evaluator(
        &self,
        container: &str,
        evaluator: impl QueryEvaluator + 'static,
    ) -> Result<()> {
        self.with_container(container, |c| {
            c.evaluator = Arc::new(evaluator);
            Ok(())
        })
    }

    /// Number of partition map requests served or failed so far
    pub fn partition_map_requests(&self) -> usize {
        self.inner.partition_map_requests.load(Ordering::Relaxed)
    }

    /// Live partition ranges of `container`, in key space order
    pub fn partitions(&self, container: &str) -> Result<Vec<PartitionKeyRange>> {
        self.with_container(container, |c| {
            let mut ranges: Vec<_> = c.partitions.values().map(|p| p.range.clone()).collect();
            ranges.sort_unstable_by_key(|r| r.low);
            Ok(ranges)
        })
    }

    pub fn item_count(&self, container: &str) -> Result<usize> {
        self.with_container(container, |c| {
            Ok(c.partitions.values().map(|p| p.items.len()).sum())
        })
    }

    fn admit(&self, request: &Request) -> Result<Admission> {
        let mut state = self.lock();
        let Some(c) = state.containers.get_mut(&*request.container) else {
            return Ok(Admission::Respond(RawResponse::message(
                Status::NotFound,
                format!("container {} not found", request.container),
            )));
        };
        match c.take_fault(&request.body) {
            None => Ok(Admission::Proceed),
            Some(Fault::Delay(d)) => Ok(Admission::Delay(d)),
            Some(Fault::Disconnect) => Err(io::Error::from(io::ErrorKind::ConnectionReset).into()),
            Some(fault) => {
                debug!(container = %request.container, ?fault, "injecting fault");
                Ok(Admission::Respond(fault_response(&fault)))
            }
        }
    }

    fn serve(&self, request: &Request, may_wait: bool) -> Option<RawResponse> {
        let mut state = self.lock();
        let Some(c) = state.containers.get_mut(&*request.container) else {
            return Some(RawResponse::message(
                Status::NotFound,
                format!("container {} not found", request.container),
            ));
        };
        match &request.body {
            RequestBody::Read { .. } => Some(c.read(request)),
            RequestBody::QueryPage { .. } => Some(c.query_page(request)),
            RequestBody::FeedPage { .. } => c.feed_page(request, may_wait),
            _ => Some(c.write(request)),
        }
    }

    fn notifier(&self, container: &str) -> Option<Arc<Notify>> {
        let state = self.lock();
        state
            .containers
            .get(container)
            .map(|c| Arc::clone(&c.notify))
    }

    async fn handle(&self, request: Request) -> Result<RawResponse> {
        match self.admit(&request)? {
            Admission::Respond(rsp) => return Ok(rsp),
            Admission::Delay(d) => tokio::time::sleep(d).await,
            Admission::Proceed => {}
        }

        let max_wait = match &request.body {
            RequestBody::FeedPage { max_wait, .. } => *max_wait,
            _ => Duration::ZERO,
        };
        let deadline = Instant::now() + max_wait;
        let notify = self.notifier(&request.container);

        loop {
            let notified = notify.as_ref().map(|n| n.notified());
            let may_wait = notify.is_some() && Instant::now() < deadline;
            if let Some(rsp) = self.serve(&request, may_wait) {
                return Ok(rsp);
            }
            if let Some(notified) = notified {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let _ = tokio::time::timeout(remaining, notified).await;
            }
        }
    }
}

impl Transport for MemoryStore {
    fn partition_map<'a>(
        &'a self,
        container: &'a str,
    ) -> BoxFuture<'a, Result<PartitionMapResponse>> {
        Box::pin(async move {
            self.inner
                .partition_map_requests
                .fetch_add(1, Ordering::Relaxed);
            self.with_container(container, |c| {
                if c.partition_map_failures > 0 {
                    c.partition_map_failures -= 1;
                    return Err(Error::unavailable("partition map service unavailable"));
                }
                Ok(PartitionMapResponse {
                    version: c.map_version,
                    ranges: c.partitions.values().map(|p| p.range.clone()).collect(),
                })
            })
        })
    }

    fn send(&self, request: Request) -> BoxFuture<'_, Result<RawResponse>> {
        Box::pin(self.handle(request))
    }
}
