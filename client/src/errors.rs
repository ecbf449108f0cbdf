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

use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error as ThisError;

use crate::PartitionId;
use crate::SessionToken;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, PartialEq, Eq)]
pub struct OverlappingRangesData {
    pub range1_low: u64,
    pub range1_high: u64,
    pub range2_low: u64,
    pub range2_high: u64,
}

impl Display for OverlappingRangesData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{range1_low:#x}, {range1_high:#x}) overlaps with [{range2_low:#x}, {range2_high:#x})",
            range1_low = self.range1_low,
            range1_high = self.range1_high,
            range2_low = self.range2_low,
            range2_high = self.range2_high,
        )
    }
}

/// Reasons a partition map received from the store is rejected
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum RoutingError {
    #[error("No partition ranges defined")]
    NoRanges,

    #[error("Key space must start at 0, first range starts at {low:#x}")]
    MissingStart { low: u64 },

    #[error("Key space must end at {expected:#x}, last range ends at {high:#x}")]
    MissingEnd { high: u64, expected: u64 },

    #[error("Gap in key space between {end:#x} and {next_start:#x}")]
    Gap { end: u64, next_start: u64 },

    #[error("Overlapping partition ranges: {0}")]
    OverlappingRanges(Box<OverlappingRangesData>),

    #[error("Empty range for partition {0}")]
    EmptyRange(PartitionId),

    #[error("Duplicate partition ID: {0}")]
    DuplicatePartitionId(PartitionId),
}

/// The taxonomy every failure surfaced by this crate maps into.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Rate limited by the store, retryable
    Throttled,
    /// Stale routing, retryable after a routing refresh
    PartitionMoved,
    /// Write conflict or failed precondition, terminal
    Conflict,
    /// Item or container does not exist, terminal
    NotFound,
    /// Cancelled by the caller, terminal
    Cancelled,
    /// Routing metadata could not be loaded, retryable a bounded number of times
    RoutingUnavailable,
    /// Caller error, never retried
    Malformed,
    /// Transport or service failure of unknown effect
    Unavailable,
}

#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    #[error("Request throttled: gave up after {attempts} attempts in {elapsed:?}")]
    Throttled {
        attempts: usize,
        elapsed: Duration,
        retry_after: Option<Duration>,
    },

    #[error("Partition {partition} moved")]
    PartitionMoved { partition: PartitionId },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Routing unavailable: {source}")]
    RoutingUnavailable {
        #[source]
        source: BoxError,
    },

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Service unavailable: {source}")]
    Unavailable {
        #[source]
        source: BoxError,
    },

    #[error("Read session not available for {token}")]
    SessionNotAvailable { token: SessionToken },

    #[error("Request time out")]
    RequestTimeout {
        #[source]
        source: BoxError,
    },

    #[error("Shared error: {0}")]
    Shared(#[source] Arc<Error>),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Throttled { .. } => ErrorKind::Throttled,
            Error::PartitionMoved { .. } => ErrorKind::PartitionMoved,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::RoutingUnavailable { .. } => ErrorKind::RoutingUnavailable,
            Error::Malformed(_) => ErrorKind::Malformed,
            Error::Unavailable { .. }
            | Error::SessionNotAvailable { .. }
            | Error::RequestTimeout { .. } => ErrorKind::Unavailable,
            Error::Shared(e) => e.kind(),
        }
    }

    /// Whether the error is likely transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Throttled
                | ErrorKind::PartitionMoved
                | ErrorKind::RoutingUnavailable
                | ErrorKind::Unavailable
        )
    }

    /// Whether the request may have been applied by the store.  Retrying a write after such a
    /// failure is only safe when the caller opted in.
    pub(crate) fn is_ambiguous(&self) -> bool {
        match self {
            Error::Unavailable { .. } | Error::RequestTimeout { .. } => true,
            Error::Shared(e) => e.is_ambiguous(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn routing(source: impl Into<BoxError>) -> Self {
        Error::RoutingUnavailable {
            source: source.into(),
        }
    }

    pub fn unavailable(source: impl Into<BoxError>) -> Self {
        Error::Unavailable {
            source: source.into(),
        }
    }

    pub(crate) fn from_tokio_elapsed(e: tokio::time::error::Elapsed) -> Self {
        Error::RequestTimeout {
            source: Box::new(e),
        }
    }
}

impl From<RoutingError> for Error {
    fn from(value: RoutingError) -> Self {
        Error::routing(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        if value.kind() == io::ErrorKind::TimedOut {
            Error::RequestTimeout {
                source: Box::new(value),
            }
        } else {
            Error::unavailable(value)
        }
    }
}

impl From<Arc<Error>> for Error {
    fn from(value: Arc<Error>) -> Self {
        Error::Shared(value)
    }
}
