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
use std::collections::hash_map::Entry;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::Error;
use crate::PartitionId;
use crate::routing::PartitionKeyRange;

/// Write-sequence marker for one partition.  Attaching it to a read asks the store to serve
/// the read from a replica that has applied at least `sequence`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionToken {
    pub partition: PartitionId,
    pub sequence: u64,
}

impl SessionToken {
    pub const fn new(partition: PartitionId, sequence: u64) -> Self {
        Self {
            partition,
            sequence,
        }
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.sequence)
    }
}

impl FromStr for SessionToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::Malformed(format!("invalid session token {s:?}"));
        let (p, seq) = s.split_once(':').ok_or_else(malformed)?;
        let partition: i64 = p.parse().map_err(|_| malformed())?;
        let sequence: u64 = seq.parse().map_err(|_| malformed())?;
        Ok(Self::new(PartitionId::new(partition), sequence))
    }
}

/// Latest write sequence seen per partition within one logical session.
///
/// Entries are atomics behind a read-mostly map lock: the write lock is only taken the first
/// time a partition is seen, so observing tokens on unrelated partitions never contends.
#[derive(Debug, Default)]
pub struct SessionTracker {
    entries: RwLock<HashMap<PartitionId, Arc<AtomicU64>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, partition: PartitionId) -> Option<Arc<AtomicU64>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&partition).cloned()
    }

    /// Merge `token`, keeping the higher sequence.  Returns whether the token advanced the
    /// session; a stale token is dropped.  The first token of a partition always advances it.
    pub fn observe(&self, token: SessionToken) -> bool {
        let slot = match self.entry(token.partition) {
            Some(slot) => slot,
            None => {
                let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
                match entries.entry(token.partition) {
                    Entry::Occupied(e) => Arc::clone(e.get()),
                    Entry::Vacant(e) => {
                        e.insert(Arc::new(AtomicU64::new(token.sequence)));
                        return true;
                    }
                }
            }
        };
        let prev = slot.fetch_max(token.sequence, Ordering::AcqRel);
        let advanced = token.sequence > prev;
        if !advanced {
            trace!(%token, prev, "dropping stale session token");
        }
        advanced
    }

    pub fn token_for(&self, partition: PartitionId) -> Option<SessionToken> {
        let slot = self.entry(partition)?;
        Some(SessionToken::new(partition, slot.load(Ordering::Acquire)))
    }

    /// Best token to attach to a read served by `range`.
    ///
    /// Children of a split inherit their parent's log, so a write observed on a retired parent
    /// still bounds reads on its children.
    pub fn token_for_range(&self, range: &PartitionKeyRange) -> Option<SessionToken> {
        std::iter::once(range.id)
            .chain(range.parents.iter().copied())
            .filter_map(|p| self.token_for(p))
            .map(|t| t.sequence)
            .max()
            .map(|sequence| SessionToken::new(range.id, sequence))
    }

    /// Fold another session's state into this one
    pub fn merge(&self, other: &SessionTracker) {
        for token in other.snapshot() {
            self.observe(token);
        }
    }

    /// The current token of every partition, sorted by partition
    pub fn snapshot(&self) -> Vec<SessionToken> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut tokens: Vec<_> = entries
            .iter()
            .map(|(&p, seq)| SessionToken::new(p, seq.load(Ordering::Acquire)))
            .collect();
        tokens.sort_unstable_by_key(|t| t.partition);
        tokens
    }
}
