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

//! The boundary to the remote document store.
//!
//! The store is an opaque request/response collaborator.  Headers carry the session token,
//! the continuation position, the request charge and throttling hints; the client core never
//! looks past this module at how the bytes travel.

use std::cmp::Ordering;
use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;

use crate::ETag;
use crate::Error;
use crate::Item;
use crate::Order;
use crate::PartitionId;
use crate::PartitionKey;
use crate::Result;
use crate::SessionToken;
use crate::SortKey;
use crate::routing::PartitionKeyRange;
use crate::util;

/// Routing metadata returned by the store for one container
#[derive(Clone, Debug)]
pub struct PartitionMapResponse {
    pub version: u64,
    pub ranges: Vec<PartitionKeyRange>,
}

/// A remote document store.
///
/// Implementations perform exactly one round trip per call and never retry.  Failures to
/// reach the store are returned as `Err`; anything the store answered is a `RawResponse`,
/// whatever its status.
pub trait Transport: Send + Sync + Debug {
    /// Current partition layout of `container`
    fn partition_map<'a>(&'a self, container: &'a str)
    -> BoxFuture<'a, Result<PartitionMapResponse>>;

    fn send(&self, request: Request) -> BoxFuture<'_, Result<RawResponse>>;
}

/// Conversion into `Arc<dyn Transport>` for [`Client::new`](crate::Client::new).
///
/// Accepts a concrete [`Transport`] (wrapped in `Arc`) or a pre-built `Arc<dyn Transport>`.
pub trait IntoTransport {
    fn into_arc(self) -> Arc<dyn Transport>;
}

impl<T: Transport + 'static> IntoTransport for T {
    fn into_arc(self) -> Arc<dyn Transport> {
        Arc::new(self)
    }
}

impl IntoTransport for Arc<dyn Transport> {
    fn into_arc(self) -> Arc<dyn Transport> {
        self
    }
}

/// One request addressed to one partition.  `low`/`high` narrow range-targeted requests to
/// part of the partition; key-routed requests carry the partition's full range.
#[derive(Clone, Debug)]
pub struct Request {
    pub container: Arc<str>,
    pub partition: PartitionId,
    pub low: u64,
    pub high: u64,
    pub session_token: Option<SessionToken>,
    pub body: RequestBody,
}

#[derive(Clone, Debug)]
pub enum RequestBody {
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
        query: Arc<str>,
        order: Option<Order>,
        continuation: Option<ContinuationToken>,
        max_item_count: usize,
    },
    FeedPage {
        /// Return entries with a sequence number strictly above this
        after: u64,
        max_item_count: usize,
        max_wait: Duration,
    },
}

impl RequestBody {
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            RequestBody::Read { .. } | RequestBody::QueryPage { .. } | RequestBody::FeedPage { .. }
        )
    }

    pub fn is_write(&self) -> bool {
        !self.is_read_only()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Created,
    NoContent,
    NotModified,
    BadRequest,
    NotFound,
    Conflict,
    PreconditionFailed,
    TooManyRequests,
    Gone,
    SessionNotAvailable,
    ServiceUnavailable,
}

impl Status {
    pub const fn is_success(self) -> bool {
        matches!(
            self,
            Status::Ok | Status::Created | Status::NoContent | Status::NotModified
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct Headers {
    pub session_token: Option<SessionToken>,
    pub retry_after: Option<Duration>,
    pub request_charge: f64,
    /// Position of the last row returned when the store has more rows for the request
    pub continuation: Option<ContinuationToken>,
}

#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: Status,
    pub headers: Headers,
    pub body: ResponseBody,
}

impl RawResponse {
    pub fn new(status: Status, body: ResponseBody) -> Self {
        Self {
            status,
            headers: Headers::default(),
            body,
        }
    }

    pub fn empty(status: Status) -> Self {
        Self::new(status, ResponseBody::Empty)
    }

    pub fn message(status: Status, msg: impl Into<String>) -> Self {
        Self::new(status, ResponseBody::Message(msg.into()))
    }

    #[must_use]
    pub fn with_charge(mut self, request_charge: f64) -> Self {
        self.headers.request_charge = request_charge;
        self
    }

    #[must_use]
    pub fn with_session_token(mut self, token: SessionToken) -> Self {
        self.headers.session_token = Some(token);
        self
    }

    /// Human readable cause carried by an error response
    pub fn reason(&self) -> String {
        match &self.body {
            ResponseBody::Message(m) => m.clone(),
            _ => format!("{:?}", self.status),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Item {
        item: Item,
        etag: ETag,
    },
    QueryPage {
        rows: Vec<QueryRow>,
    },
    FeedPage {
        entries: Vec<FeedEntry>,
        /// Highest sequence number written to the partition so far
        latest: u64,
    },
    Message(String),
}

/// One query result with the key it was ordered by
#[derive(Clone, Debug, PartialEq)]
pub struct QueryRow {
    pub item: Item,
    pub etag: ETag,
    pub order_key: SortKey,
}

impl QueryRow {
    pub fn position(&self) -> ContinuationToken {
        ContinuationToken {
            order_key: self.order_key.clone(),
            id: self.item.id.clone(),
            partition_key: self.item.partition_key.clone(),
        }
    }
}

/// One committed write in a partition's change log
#[derive(Clone, Debug, PartialEq)]
pub struct FeedEntry {
    pub sequence: u64,
    pub item: Item,
    pub etag: ETag,
}

/// A position in a query's result order: the last row returned.
///
/// Positions are independent of the partition layout, so a continuation recorded against a
/// partition stays meaningful for the partitions it is split into.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContinuationToken {
    pub order_key: SortKey,
    pub id: String,
    pub partition_key: PartitionKey,
}

const CONTINUATION_TAG: &str = "c1";

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = util::encode_token(CONTINUATION_TAG, self).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

impl FromStr for ContinuationToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        util::decode_token(s, "continuation token", CONTINUATION_TAG)
    }
}

/// Compare two result positions in the requested order.  Ties on the order key fall back to
/// the item id and then the partition key, so positions are total.
pub fn position_cmp(order: Order, a: &ContinuationToken, b: &ContinuationToken) -> Ordering {
    let asc = a
        .order_key
        .cmp(&b.order_key)
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.partition_key.cmp(&b.partition_key));
    match order {
        Order::Ascending => asc,
        Order::Descending => asc.reverse(),
    }
}
