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

//! Origin reads held under a cluster-wide read lock.
//!
//! When the server serves a snapshot read from the origin it takes a global
//! read lock on the chunk. The client hooks the read's completion so the
//! lock can be released once the data is safely read. A hook whose captured
//! callback has been taken (`None`) marks an I/O that already finished.
//!
//! Completion may run in interrupt context: everything it does here is a
//! short critical section on one lock.

use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};

use crate::bio::EndIo;

/// One origin read holding a cluster read lock.
pub(crate) struct Hook {
    /// Original starting sector; the release message is derived from it.
    pub sector: u64,
    old_end_io: Mutex<Option<EndIo>>,
}

impl Hook {
    pub fn new(sector: u64, old_end_io: EndIo) -> Hook {
        Hook {
            sector,
            old_end_io: Mutex::new(Some(old_end_io)),
        }
    }

    fn finished(&self) -> bool {
        self.old_end_io.lock().is_none()
    }
}

struct Lists {
    locked: VecDeque<Arc<Hook>>,
    releases: VecDeque<Arc<Hook>>,
    dont_switch_lists: bool,
}

/// The locked and release lists, under the end-I/O lock.
pub(crate) struct LockedReads {
    lists: Mutex<Lists>,
}

impl LockedReads {
    pub fn new() -> Self {
        LockedReads {
            lists: Mutex::new(Lists {
                locked: VecDeque::new(),
                releases: VecDeque::new(),
                dont_switch_lists: false,
            }),
        }
    }

    /// Puts a freshly hooked read on the locked list.
    pub fn install(&self, hook: Arc<Hook>) {
        self.lists.lock().locked.push_back(hook);
    }

    /// End-of-I/O transition: takes the captured callback (leaving the
    /// finished sentinel) and moves the hook to the release list unless an
    /// upload cycle is in progress, in which case the upload sweep will
    /// move it.
    pub fn complete(&self, hook: &Arc<Hook>) -> Option<EndIo> {
        let mut lists = self.lists.lock();
        let old_end_io = hook.old_end_io.lock().take();
        if !lists.dont_switch_lists {
            if let Some(at) = lists.locked.iter().position(|h| Arc::ptr_eq(h, hook)) {
                let hook = lists.locked.remove(at).expect("position is in range");
                lists.releases.push_back(hook);
            }
        }
        old_end_io
    }

    /// Takes the oldest completed read awaiting a lock release.
    pub fn pop_release(&self) -> Option<Arc<Hook>> {
        self.lists.lock().releases.pop_front()
    }

    /// Starts an upload cycle: completions stop switching lists, and reads
    /// already awaiting release are dropped (the new server never heard of
    /// their locks).
    pub fn begin_upload(&self) {
        let mut lists = self.lists.lock();
        lists.dont_switch_lists = true;
        lists.releases.clear();
    }

    /// Drops hooks whose I/O finished while the upload was pending and
    /// returns the hooks whose locks must be uploaded.
    pub fn upload_candidates(&self) -> Vec<Arc<Hook>> {
        let mut lists = self.lists.lock();
        lists.locked.retain(|hook| !hook.finished());
        lists.locked.iter().cloned().collect()
    }

    /// Ends an upload cycle: reads that finished during the upload move to
    /// the release list and completions switch lists again.
    pub fn finish_upload(&self) {
        let mut lists = self.lists.lock();
        let mut index = 0;
        while index < lists.locked.len() {
            if lists.locked[index].finished() {
                let hook = lists.locked.remove(index).expect("index is in range");
                lists.releases.push_back(hook);
            } else {
                index += 1;
            }
        }
        lists.dont_switch_lists = false;
    }

    /// Number of hooks on the locked and release lists, respectively.
    pub fn counts(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.locked.len(), lists.releases.len())
    }

    /// Empties both lists for shutdown.
    pub fn clear(&self) {
        let mut lists = self.lists.lock();
        lists.locked.clear();
        lists.releases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hook(sector: u64) -> Arc<Hook> {
        Arc::new(Hook::new(sector, Box::new(|_, _| {})))
    }

    #[test]
    fn completion_moves_hook_to_releases() {
        let reads = LockedReads::new();
        let hook = test_hook(40);
        reads.install(hook.clone());
        assert_eq!(reads.counts(), (1, 0));

        let old = reads.complete(&hook);
        assert!(old.is_some());
        assert_eq!(reads.counts(), (0, 1));
        assert_eq!(reads.pop_release().unwrap().sector, 40);
    }

    #[test]
    fn completion_during_upload_leaves_hook_locked() {
        let reads = LockedReads::new();
        let hook = test_hook(8);
        reads.install(hook.clone());

        reads.begin_upload();
        let old = reads.complete(&hook);
        assert!(old.is_some());
        // Sentinel set, but the hook stays on the locked list.
        assert_eq!(reads.counts(), (1, 0));

        reads.finish_upload();
        assert_eq!(reads.counts(), (0, 1));
    }

    #[test]
    fn begin_upload_drops_queued_releases() {
        let reads = LockedReads::new();
        let done = test_hook(0);
        let live = test_hook(16);
        reads.install(done.clone());
        reads.install(live.clone());
        reads.complete(&done);
        assert_eq!(reads.counts(), (1, 1));

        reads.begin_upload();
        assert_eq!(reads.counts(), (1, 0));

        let candidates = reads.upload_candidates();
        assert_eq!(candidates.len(), 1);
        assert!(Arc::ptr_eq(&candidates[0], &live));
    }

    #[test]
    fn upload_candidates_drop_finished_hooks() {
        let reads = LockedReads::new();
        let hook = test_hook(24);
        reads.install(hook.clone());

        reads.begin_upload();
        // I/O finishes between begin_upload and the locked-list walk.
        reads.complete(&hook);
        assert!(reads.upload_candidates().is_empty());
        reads.finish_upload();
        assert_eq!(reads.counts(), (0, 0));
    }
}
