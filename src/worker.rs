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

//! The worker thread.
//!
//! A single-threaded event loop throttled by a counting semaphore: each up
//! corresponds to at least one queued event, and draining more than one
//! event per cycle just makes later cycles find nothing to do, which is
//! harmless. The worker owns all steady-state egress on the server socket
//! (queries and lock releases) and runs recovery when a socket error or a
//! fresh server connection demands it.

use std::sync::Arc;

use crate::{
    bio::IoDir,
    device::{DeviceInner, RECOVER_FLAG, REPORT_FLAG},
    error::Error,
    message::{self, ChunkRange},
};

pub(crate) fn run(inner: Arc<DeviceInner>) {
    trace!(target: "ddsnap", "worker thread started for snapshot {}", inner.snap);
    // A fresh start passes through recovery, so held locks (vacuously none)
    // are uploaded to the first server that connects.
    let mut need_recover = true;
    'cycle: loop {
        if need_recover {
            inner.recover_sem.down();
            if !inner.running() {
                break;
            }
            trace!(target: "ddsnap", "worker recovering for snapshot {}", inner.snap);
            if inner.is_snapshot() {
                upload_locks(&inner);
            }
            requeue_queries(&inner);
            inner.clear_flags(RECOVER_FLAG | REPORT_FLAG);
            inner.recover_sem.up();
            trace!(target: "ddsnap", "worker resuming for snapshot {}", inner.snap);
            need_recover = false;
        }

        while inner.worker_running() {
            inner.more_work_sem.down();
            if send_queries(&inner).is_err() || send_releases(&inner).is_err() {
                // The failed send kept the egress permit; recovery sends
                // reuse it and IDENTIFY_OK releases it afterwards.
                need_recover = true;
                continue 'cycle;
            }
        }

        if inner.flag_set(RECOVER_FLAG) {
            // The error came in through ingress: take the egress permit for
            // the recovery sends and leave a wakeup for the next cycle.
            inner.server_out_sem.down();
            inner.more_work_sem.up();
            need_recover = true;
            continue 'cycle;
        }
        break;
    }
    trace!(target: "ddsnap", "worker exiting for snapshot {}", inner.snap);
}

/// Sends a server query for each queued pending record, moving each record
/// into its hash bucket first so the reply can find it.
fn send_queries(inner: &DeviceInner) -> Result<(), Error> {
    while inner.worker_running() {
        let Some(query) = inner.pending.pop_query() else {
            break;
        };
        trace!(target: "ddsnap", "server query [{:x}/{:x}]", query.chunk, query.chunks);
        inner.server_out_sem.down();
        let code = match query.dir {
            IoDir::Write => message::QUERY_WRITE,
            IoDir::Read => message::QUERY_SNAPSHOT_READ,
        };
        let body = message::rw_request(
            query.id,
            &[ChunkRange {
                chunk: query.chunk,
                chunks: query.chunks,
            }],
        );
        if let Err(err) = inner.send_server(code, &body) {
            warn!(target: "ddsnap", "worker socket error {}", err);
            inner.report_error();
            return Err(err);
        }
        inner.server_out_sem.up();
    }
    Ok(())
}

/// Sends a lock release for each completed origin read.
fn send_releases(inner: &DeviceInner) -> Result<(), Error> {
    while inner.worker_running() {
        let Some(hook) = inner.locked_reads.pop_release() else {
            break;
        };
        let chunk = hook.sector >> inner.chunkshift();
        trace!(target: "ddsnap", "release sector {:x}, chunk {:x}", hook.sector, chunk);
        drop(hook);
        inner.server_out_sem.down();
        let body = message::rw_request(0, &[ChunkRange { chunk, chunks: 1 }]);
        if let Err(err) = inner.send_server(message::FINISH_SNAPSHOT_READ, &body) {
            warn!(target: "ddsnap", "worker socket error {}", err);
            inner.report_error();
            return Err(err);
        }
        inner.server_out_sem.up();
    }
    Ok(())
}

/// Tells a freshly connected server about every cluster read lock this
/// client still holds. Queued releases are dropped first: the new server
/// never heard of those locks, so there is nothing to release.
fn upload_locks(inner: &DeviceInner) {
    inner.locked_reads.begin_upload();
    for hook in inner.locked_reads.upload_candidates() {
        let chunk = hook.sector >> inner.chunkshift();
        let body = message::rw_request(0, &[ChunkRange { chunk, chunks: 1 }]);
        if let Err(err) = inner.send_server(message::UPLOAD_LOCK, &body) {
            warn!(target: "ddsnap", "unable to upload lock for chunk {:x}: {}", chunk, err);
        }
    }
    if let Err(err) = inner.send_server(message::FINISH_UPLOAD_LOCK, &[]) {
        warn!(target: "ddsnap", "unable to finish lock upload: {}", err);
    }
    inner.locked_reads.finish_upload();
}

/// Moves every in-flight query back onto the query queue for retransmission
/// and wakes the worker once per record.
fn requeue_queries(inner: &DeviceInner) {
    let moved = inner.pending.requeue_all();
    for _ in 0..moved {
        inner.more_work_sem.up();
    }
    inner.pending.dump();
}
