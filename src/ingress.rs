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

//! The ingress thread.
//!
//! There are four flavors of server reply to rw queries, two write and two
//! read, but the symmetry ends there. Only one flavor (write) is for origin
//! I/O, because origin reads need no global synchronization. Snapshot writes
//! always land in the snapshot store. Snapshot reads can be served from
//! either the origin or the snapshot store, only the server knows which, and
//! the two reply kinds for one read request can be fragmented across
//! messages and interleaved arbitrarily with replies to other requests. The
//! pending table matches all these fragments back to their requests; origin
//! reads additionally pick up a completion hook, because the server holds a
//! cluster read lock on them until we send a release.

use std::sync::Arc;

use crate::{
    bio::{Bio, IoDir, TargetDevice},
    device::{DeviceInner, READY_FLAG},
    error::Error,
    hooks::Hook,
    message::{self, Message},
};

pub(crate) fn run(inner: Arc<DeviceInner>) {
    trace!(target: "ddsnap", "client thread started for snapshot {}", inner.snap);
    'connect: while inner.running() {
        trace!(target: "ddsnap", "request server connection");
        if let Err(err) = inner.send_control(message::NEED_SERVER, &[]) {
            warn!(target: "ddsnap", "unable to send NEED_SERVER message to agent: {}", err);
        }
        inner.server_in_sem.down();
        if !inner.running() {
            break;
        }
        let Some(mut sock) = inner.server_clone() else {
            warn!(target: "ddsnap", "server socket vanished before use");
            continue 'connect;
        };

        while inner.running() {
            let msg = match message::read_message(&mut sock) {
                Ok(msg) => msg,
                Err(Error::OversizeMessage { code, length }) => {
                    // The body was drained off the stream; drop the message
                    // and keep the session.
                    warn!(target: "ddsnap", "message {:x} too long ({} bytes)", code, length);
                    continue;
                }
                Err(err) => {
                    warn!(target: "ddsnap", "socket error {}", err);
                    if !inner.running() {
                        break 'connect;
                    }
                    warn!(target: "ddsnap", "halting worker for snapshot {}", inner.snap);
                    inner.report_error();
                    continue 'connect;
                }
            };
            dispatch(&inner, &msg);
        }
    }
    trace!(target: "ddsnap", "client thread exiting for snapshot {}", inner.snap);
}

fn dispatch(inner: &Arc<DeviceInner>, msg: &Message) {
    match msg.code {
        message::IDENTIFY_OK => identify_ok(inner, &msg.body),
        message::IDENTIFY_ERROR => identify_error(inner, &msg.body),
        message::REPLY_ORIGIN_WRITE => {
            replied_rw(inner, msg.code, &msg.body, IoDir::Write, false, false)
        }
        message::REPLY_SNAPSHOT_WRITE => {
            replied_rw(inner, msg.code, &msg.body, IoDir::Write, true, false)
        }
        message::REPLY_SNAPSHOT_READ_ORIGIN => {
            replied_rw(inner, msg.code, &msg.body, IoDir::Read, false, false)
        }
        message::REPLY_SNAPSHOT_READ => {
            replied_rw(inner, msg.code, &msg.body, IoDir::Read, true, false)
        }
        message::REPLY_ERROR => {
            warn!(target: "ddsnap", "failed i/o");
            replied_rw(inner, msg.code, &msg.body, IoDir::Read, false, true)
        }
        code => warn!(target: "ddsnap", "{}", Error::UnknownMessage(code)),
    }
}

fn identify_ok(inner: &DeviceInner, body: &[u8]) {
    let chunksize_bits = match message::parse_identify_ok(body) {
        Ok(bits) => bits,
        Err(err) => {
            warn!(target: "ddsnap", "{}", err);
            return;
        }
    };
    debug!(target: "ddsnap", "identify succeeded, chunksize {}", chunksize_bits);
    // Geometry first: map derives chunk numbers as soon as it sees READY.
    inner.set_chunk_geometry(chunksize_bits);
    inner.set_flags(READY_FLAG);

    let body = message::usecount(inner.snap, 0, 1);
    if inner.send_server(message::USECOUNT, &body).is_err() {
        warn!(target: "ddsnap", "unable to send USECOUNT message to snapshot server");
    }
    inner.server_out_sem.up();
    if inner.send_control(message::CONNECT_SERVER_OK, &[]).is_err() {
        warn!(target: "ddsnap", "unable to send CONNECT_SERVER_OK message to agent");
    }
}

fn identify_error(inner: &DeviceInner, body: &[u8]) {
    let (err, msg) = match message::parse_error_body(message::IDENTIFY_ERROR, body) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(target: "ddsnap", "{}", err);
            return;
        }
    };
    warn!(
        target: "ddsnap",
        "unable to identify snapshot device with id {}, error {}: {}",
        inner.snap, err, msg,
    );
    let forward = message::error_body(err, msg.as_bytes());
    if inner
        .send_control(message::CONNECT_SERVER_ERROR, &forward)
        .is_err()
    {
        warn!(target: "ddsnap", "unable to send CONNECT_SERVER_ERROR message to agent");
    }
}

/// Completes pending queries from one reply message: looks each reported
/// range's id up in the pending table, rewrites the bio's target for
/// snapstore destinations, hooks origin-served snapshot reads, and hands
/// the bio back to the block layer.
fn replied_rw(
    inner: &Arc<DeviceInner>,
    code: u32,
    body: &[u8],
    dir: IoDir,
    to_snap: bool,
    failed_io: bool,
) {
    let reply = match message::parse_rw_reply(code, body, to_snap && !failed_io) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(target: "ddsnap", "{}", err);
            return;
        }
    };
    let shift = inner.chunkshift();
    let mask = (1u64 << shift) - 1;
    let mut submitted = false;

    for (range, physical) in &reply.ranges {
        trace!(target: "ddsnap", "[{:x}/{:x}]", range.chunk, range.chunks);
        if range.chunks != 1 {
            warn!(target: "ddsnap", "unsupported multi-chunk range [{:x}/{:x}]", range.chunk, range.chunks);
            break;
        }
        let Some(pending) = inner.pending.remove(reply.id) else {
            warn!(target: "ddsnap", "can't find pending rw for chunk {}:{:x}", reply.id, range.chunk);
            break;
        };
        let mut bio = pending.bio;

        if failed_io {
            warn!(target: "ddsnap", "unable to handle pending io at sector {:x}", bio.sector);
            bio.fail();
            break;
        }
        if range.chunks != pending.chunks {
            let mismatch = Error::RangeMismatch {
                expected: pending.chunks,
                got: range.chunks,
            };
            warn!(target: "ddsnap", "{}", mismatch);
            bio.fail();
            break;
        }

        if to_snap {
            let physical_sector = (physical[0] << shift) | (bio.sector & mask);
            trace!(target: "ddsnap", "logical {:x} = physical {:x}", bio.sector, physical_sector);
            bio.device = TargetDevice::Snapstore;
            bio.sector = physical_sector;
        } else if dir == IoDir::Read {
            // Snapshot read served from the origin: globally read-locked.
            hook_end_io(inner, &mut bio);
        }

        inner.block.submit(bio);
        submitted = true;
    }

    if submitted {
        inner.block.kick(TargetDevice::Origin);
        inner.block.kick(TargetDevice::Snapstore);
    }
}

/// Captures the bio's completion callback into a hook on the locked list and
/// substitutes the snapshot-read end-of-I/O callback, which queues the lock
/// release once the read finishes.
fn hook_end_io(inner: &Arc<DeviceInner>, bio: &mut Bio) {
    trace!(target: "ddsnap", "hook end_io for {:x}", bio.sector);
    let Some(old_end_io) = bio.take_end_io() else {
        return;
    };
    let hook = Arc::new(Hook::new(bio.sector, old_end_io));
    let device = inner.clone();
    let handle = hook.clone();
    bio.set_end_io(Box::new(move |mut bio: Bio, status| {
        trace!(target: "ddsnap", "sector {:x}", handle.sector);
        let old_end_io = device.locked_reads.complete(&handle);
        device.more_work_sem.up();
        if let Some(old_end_io) = old_end_io {
            bio.set_end_io(old_end_io);
        }
        bio.complete(status);
    }));
    inner.locked_reads.install(hook);
}
