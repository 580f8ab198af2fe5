// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of ddsnap.

// ddsnap is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// ddsnap is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with ddsnap.  If not, see <http://www.gnu.org/licenses/>.

//! In-flight server queries.
//!
//! A pending record is born when `map` accepts an I/O, waits on the query
//! queue until the worker sends it, then sits in a hash bucket keyed by its
//! identifier until the matching reply removes it. One lock covers the
//! queue, the buckets and the identifier counter.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::bio::{Bio, IoDir};

/// Width of the identifier space.
pub const ID_BITS: u32 = 16;

/// Number of hash buckets for in-flight queries.
pub const NUM_BUCKETS: usize = 64;

const MASK_BUCKETS: u32 = (NUM_BUCKETS - 1) as u32;
const MASK_ID: u32 = (1 << ID_BITS) - 1;

fn hash_pending(id: u32) -> usize {
    (id & MASK_BUCKETS) as usize
}

/// One outstanding server query and the I/O waiting on it.
pub(crate) struct Pending {
    pub id: u32,
    pub chunk: u64,
    pub chunks: u32,
    pub bio: Bio,
}

/// What the worker needs to emit a query once the record is in its bucket.
pub(crate) struct QueryInfo {
    pub id: u32,
    pub chunk: u64,
    pub chunks: u32,
    pub dir: IoDir,
}

struct Lists {
    next_id: u32,
    queries: VecDeque<Pending>,
    buckets: [Vec<Pending>; NUM_BUCKETS],
}

/// The pending table: query queue plus hash buckets, under one lock.
pub(crate) struct PendingTable {
    lists: Mutex<Lists>,
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable {
            lists: Mutex::new(Lists {
                next_id: 0,
                queries: VecDeque::new(),
                buckets: std::array::from_fn(|_| Vec::new()),
            }),
        }
    }

    /// Allocates the next identifier and queues a record for `bio`.
    pub fn queue(&self, chunk: u64, bio: Bio) -> u32 {
        let mut lists = self.lists.lock();
        let id = lists.next_id;
        lists.next_id = (id + 1) & MASK_ID;
        lists.queries.push_back(Pending {
            id,
            chunk,
            chunks: 1,
            bio,
        });
        id
    }

    /// Moves the oldest queued record into its bucket and describes the
    /// query the worker should send for it.
    pub fn pop_query(&self) -> Option<QueryInfo> {
        let mut lists = self.lists.lock();
        let pending = lists.queries.pop_front()?;
        let info = QueryInfo {
            id: pending.id,
            chunk: pending.chunk,
            chunks: pending.chunks,
            dir: pending.bio.dir,
        };
        lists.buckets[hash_pending(pending.id)].push(pending);
        Some(info)
    }

    /// Removes the in-flight record with identifier `id`, if any.
    pub fn remove(&self, id: u32) -> Option<Pending> {
        let mut lists = self.lists.lock();
        let bucket = &mut lists.buckets[hash_pending(id)];
        let at = bucket.iter().position(|pending| pending.id == id)?;
        Some(bucket.remove(at))
    }

    /// Moves every in-flight record back onto the query queue, ahead of
    /// records that have not been sent yet, so retransmits go out first.
    /// Returns how many records moved.
    pub fn requeue_all(&self) -> usize {
        let mut lists = self.lists.lock();
        let Lists {
            queries, buckets, ..
        } = &mut *lists;
        let mut requeued = VecDeque::new();
        for bucket in buckets.iter_mut() {
            requeued.extend(bucket.drain(..));
        }
        let moved = requeued.len();
        requeued.append(queries);
        *queries = requeued;
        moved
    }

    /// Number of records on the query queue and in flight, respectively.
    pub fn counts(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        let in_flight = lists.buckets.iter().map(Vec::len).sum();
        (lists.queries.len(), in_flight)
    }

    /// Empties the table for shutdown, returning every owned I/O.
    pub fn drain_all(&self) -> Vec<Bio> {
        let mut lists = self.lists.lock();
        let mut bios = Vec::new();
        bios.extend(lists.queries.drain(..).map(|pending| pending.bio));
        for bucket in lists.buckets.iter_mut() {
            bios.extend(bucket.drain(..).map(|pending| pending.bio));
        }
        bios
    }

    /// Logs bucket occupancy at trace level.
    pub fn dump(&self) {
        let lists = self.lists.lock();
        let mut total = 0;
        for (index, bucket) in lists.buckets.iter().enumerate() {
            for pending in bucket {
                trace!(target: "ddsnap", "[{}]: {}:{:x}", index, pending.id, pending.chunk);
                total += 1;
            }
        }
        trace!(target: "ddsnap", "{} pending, {} queued", total, lists.queries.len());
    }

    #[cfg(test)]
    fn in_flight_ids(&self) -> Vec<u32> {
        let lists = self.lists.lock();
        lists
            .buckets
            .iter()
            .flat_map(|bucket| bucket.iter().map(|pending| pending.id))
            .collect()
    }
}
