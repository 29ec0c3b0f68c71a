//! External sort-merge pipeline: chunk split, per-chunk sort/dedupe,
//! balanced pairwise merge, and the sorted set-difference used to plan a
//! catalog sync.
//!
//! Everything here assumes one ordering function,
//! [`cinesync_core::canonical_cmp`]. Merge and diff consume only
//! [`SortedWorks`] values produced by this module, so the sorted + deduped
//! precondition is enforced by construction (and re-checked in debug
//! builds), not validated at runtime.

use std::cmp::Ordering;

use anyhow::{Context, Result};
use cinesync_core::{canonical_cmp, Work};
use tokio::task::JoinSet;
use tracing::debug;

pub const CRATE_NAME: &str = "cinesync-pipeline";

/// Default number of rows per chunk during the split phase.
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// An ordered, duplicate-free sequence of works under the canonical order.
///
/// Only the sorter/deduper and the merge combiner construct these, which is
/// what lets the merge and diff stages skip precondition checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedWorks(Vec<Work>);

impl SortedWorks {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    fn from_sorted(works: Vec<Work>) -> Self {
        debug_assert!(
            works
                .windows(2)
                .all(|pair| canonical_cmp(&pair[0], &pair[1]) == Ordering::Less),
            "sorted-set invariant violated"
        );
        Self(works)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Work] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Work> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<Work> {
        self.0
    }
}

/// Additions and removals computed for one sync run. Disjoint by
/// construction: a work appears in at most one of the two sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncDelta {
    pub additions: SortedWorks,
    pub removals: SortedWorks,
}

impl SyncDelta {
    pub fn is_noop(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// Partition `rows` into chunks of at most `max_chunk_size` works, the last
/// possibly smaller. Order-preserving and purely size-bounded; an empty
/// input yields zero chunks.
pub fn split_into_chunks<I>(rows: I, max_chunk_size: usize) -> Vec<Vec<Work>>
where
    I: IntoIterator<Item = Work>,
{
    assert!(max_chunk_size > 0, "chunk size must be positive");

    let mut chunks = Vec::new();
    let mut current = Vec::new();
    for work in rows {
        if current.len() == max_chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(work);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Sort one chunk under the canonical order and collapse each run of
/// key-equivalent works to its first occurrence.
pub fn sort_dedupe(mut chunk: Vec<Work>) -> SortedWorks {
    chunk.sort_by(canonical_cmp);
    chunk.dedup_by(|current, retained| canonical_cmp(retained, current) == Ordering::Equal);
    SortedWorks::from_sorted(chunk)
}

/// Merge any number of sorted sets into their deduplicated union via a
/// balanced pairwise reduction: pair adjacent sets, two-way merge each pair,
/// carry an odd leftover forward, repeat until one set remains. Converges in
/// `ceil(log2(n))` rounds.
pub fn merge_sorted(sets: Vec<SortedWorks>) -> SortedWorks {
    let mut sets: Vec<SortedWorks> = sets.into_iter().filter(|s| !s.is_empty()).collect();
    while sets.len() > 1 {
        let mut next_round = Vec::with_capacity(sets.len().div_ceil(2));
        let mut remaining = sets.into_iter();
        while let Some(first) = remaining.next() {
            match remaining.next() {
                Some(second) => next_round.push(merge_pair(first, second)),
                None => next_round.push(first),
            }
        }
        sets = next_round;
    }
    sets.pop().unwrap_or_default()
}

/// Two-way merge of sorted, deduped inputs. A key tie consumes one element
/// from each side and emits the left one, which keeps the output
/// duplicate-free across the pair boundary.
fn merge_pair(left: SortedWorks, right: SortedWorks) -> SortedWorks {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left_iter = left.0.into_iter();
    let mut right_iter = right.0.into_iter();
    let mut left_next = left_iter.next();
    let mut right_next = right_iter.next();

    loop {
        match (left_next.take(), right_next.take()) {
            (Some(l), Some(r)) => match canonical_cmp(&l, &r) {
                Ordering::Less => {
                    out.push(l);
                    left_next = left_iter.next();
                    right_next = Some(r);
                }
                Ordering::Greater => {
                    out.push(r);
                    left_next = Some(l);
                    right_next = right_iter.next();
                }
                Ordering::Equal => {
                    out.push(l);
                    left_next = left_iter.next();
                    right_next = right_iter.next();
                }
            },
            (Some(l), None) => {
                out.push(l);
                out.extend(left_iter.by_ref());
                break;
            }
            (None, Some(r)) => {
                out.push(r);
                out.extend(right_iter.by_ref());
                break;
            }
            (None, None) => break,
        }
    }
    SortedWorks::from_sorted(out)
}

/// Single-pass set difference between two sorted, deduped sets:
/// `additions = scraped - catalog`, `removals = catalog - scraped`.
pub fn diff_sorted(scraped: SortedWorks, catalog: SortedWorks) -> SyncDelta {
    let mut additions = Vec::new();
    let mut removals = Vec::new();
    let mut scraped_iter = scraped.0.into_iter();
    let mut catalog_iter = catalog.0.into_iter();
    let mut scraped_next = scraped_iter.next();
    let mut catalog_next = catalog_iter.next();

    loop {
        match (scraped_next.take(), catalog_next.take()) {
            (Some(s), Some(c)) => match canonical_cmp(&s, &c) {
                Ordering::Less => {
                    additions.push(s);
                    scraped_next = scraped_iter.next();
                    catalog_next = Some(c);
                }
                Ordering::Greater => {
                    removals.push(c);
                    scraped_next = Some(s);
                    catalog_next = catalog_iter.next();
                }
                Ordering::Equal => {
                    scraped_next = scraped_iter.next();
                    catalog_next = catalog_iter.next();
                }
            },
            (Some(s), None) => {
                additions.push(s);
                additions.extend(scraped_iter.by_ref());
                break;
            }
            (None, Some(c)) => {
                removals.push(c);
                removals.extend(catalog_iter.by_ref());
                break;
            }
            (None, None) => break,
        }
    }

    SyncDelta {
        additions: SortedWorks::from_sorted(additions),
        removals: SortedWorks::from_sorted(removals),
    }
}

/// Sort and dedupe every chunk concurrently on blocking workers. Chunks are
/// independent, so this is the embarrassingly parallel stage; results come
/// back in the original chunk order.
pub async fn sort_chunks(chunks: Vec<Vec<Work>>) -> Result<Vec<SortedWorks>> {
    let chunk_count = chunks.len();
    debug!(chunks = chunk_count, "sorting chunks");

    let mut workers = JoinSet::new();
    for (index, chunk) in chunks.into_iter().enumerate() {
        workers.spawn_blocking(move || (index, sort_dedupe(chunk)));
    }

    let mut sorted: Vec<Option<SortedWorks>> = (0..chunk_count).map(|_| None).collect();
    while let Some(joined) = workers.join_next().await {
        let (index, set) = joined.context("chunk sort worker failed")?;
        sorted[index] = Some(set);
    }
    Ok(sorted.into_iter().flatten().collect())
}

/// Balanced pairwise merge with each round's pair merges running
/// concurrently; rounds are separated by a barrier (all merges of round `k`
/// complete before round `k + 1` starts).
pub async fn merge_rounds(sets: Vec<SortedWorks>) -> Result<SortedWorks> {
    let mut sets: Vec<SortedWorks> = sets.into_iter().filter(|s| !s.is_empty()).collect();
    let mut round = 0usize;
    while sets.len() > 1 {
        round += 1;
        debug!(round, sets = sets.len(), "merge round");

        let mut workers = JoinSet::new();
        let mut carried = Vec::new();
        let mut pair_count = 0usize;
        let mut remaining = sets.into_iter();
        while let Some(first) = remaining.next() {
            match remaining.next() {
                Some(second) => {
                    let index = pair_count;
                    workers.spawn_blocking(move || (index, merge_pair(first, second)));
                    pair_count += 1;
                }
                None => carried.push(first),
            }
        }

        let mut merged: Vec<Option<SortedWorks>> = (0..pair_count).map(|_| None).collect();
        while let Some(joined) = workers.join_next().await {
            let (index, set) = joined.context("merge worker failed")?;
            merged[index] = Some(set);
        }
        sets = merged.into_iter().flatten().chain(carried).collect();
    }
    Ok(sets.pop().unwrap_or_default())
}
