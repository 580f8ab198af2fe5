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

//! A cluster snapshot virtual device instance.
//!
//! Creating a device connects the agent control socket and spawns the three
//! long-lived threads: the ingress thread reading server replies, the worker
//! sending queries and lock releases, and the control thread talking to the
//! agent. The block-layer adapter feeds I/O in through [`SnapDevice::map`]
//! and receives remapped I/O back through its [`BlockLayer`].

use parking_lot::Mutex;
use std::{
    net::Shutdown,
    os::unix::net::UnixStream,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crate::{
    bio::{Bio, BlockLayer, IoDir, MapDisposition, TargetDevice},
    control,
    error::Error,
    hooks::LockedReads,
    ingress, message,
    pending::PendingTable,
    semaphore::Semaphore,
    worker,
};

/// log2 of the sector size.
pub const SECTOR_SHIFT: u32 = 9;

pub(crate) const IS_SNAP_FLAG: u32 = 1 << 0;
pub(crate) const REPORT_FLAG: u32 = 1 << 1;
pub(crate) const RECOVER_FLAG: u32 = 1 << 2;
pub(crate) const FINISH_FLAG: u32 = 1 << 3;
pub(crate) const READY_FLAG: u32 = 1 << 4;

// Until the server tells us otherwise, assume 4K chunks.
const DEFAULT_CHUNKSIZE_BITS: u32 = 12;

/// Constructor arguments, in device-table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceParams {
    /// Snapshot store backing device.
    pub snapdev: PathBuf,
    /// Origin backing device.
    pub origdev: PathBuf,
    /// Agent socket path. A leading `'@'` names an abstract socket.
    pub sockname: String,
    /// Snapshot number; negative means this client serves the origin.
    pub snapshot: i32,
}

impl DeviceParams {
    /// Parses the four positional constructor arguments.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<DeviceParams, Error> {
        const USAGE: &str = "usage: snapdev orgdev sockname snapnum";
        if args.len() != 4 {
            return Err(Error::Usage(USAGE.into()));
        }
        let snapshot = args[3]
            .as_ref()
            .parse::<i32>()
            .map_err(|_| Error::Usage(USAGE.into()))?;
        Ok(DeviceParams {
            snapdev: PathBuf::from(args[0].as_ref()),
            origdev: PathBuf::from(args[1].as_ref()),
            sockname: args[2].as_ref().to_owned(),
            snapshot,
        })
    }
}

/// Table occupancy snapshot, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    /// Queries waiting to be sent.
    pub queued_queries: usize,
    /// Queries sent and awaiting a reply.
    pub in_flight_queries: usize,
    /// Origin reads holding a cluster read lock.
    pub locked_reads: usize,
    /// Completed reads whose lock release is queued.
    pub queued_releases: usize,
}

/// Shared state of one device instance.
pub(crate) struct DeviceInner {
    pub params: DeviceParams,
    pub snap: i32,
    pub begin: u64,
    pub len: u64,
    /// Cluster identity, assigned by the agent via SET_IDENTITY.
    pub id: AtomicU64,
    flags: AtomicU32,
    chunksize_bits: AtomicU32,
    chunkshift: AtomicU32,
    pub block: Arc<dyn BlockLayer>,
    pub control: UnixStream,
    pub server: Mutex<Option<UnixStream>>,
    pub pending: PendingTable,
    pub locked_reads: LockedReads,
    pub server_in_sem: Semaphore,
    pub server_out_sem: Semaphore,
    pub more_work_sem: Semaphore,
    pub recover_sem: Semaphore,
}

impl DeviceInner {
    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::SeqCst);
    }

    pub fn clear_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::SeqCst);
    }

    pub fn flag_set(&self, bits: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & bits != 0
    }

    fn test_and_set_flag(&self, bits: u32) -> bool {
        self.flags.fetch_or(bits, Ordering::SeqCst) & bits != 0
    }

    pub fn is_snapshot(&self) -> bool {
        self.flag_set(IS_SNAP_FLAG)
    }

    pub fn running(&self) -> bool {
        !self.flag_set(FINISH_FLAG)
    }

    pub fn worker_running(&self) -> bool {
        !self.flag_set(FINISH_FLAG | RECOVER_FLAG)
    }

    pub fn ready(&self) -> bool {
        self.flag_set(READY_FLAG)
    }

    /// Publishes the chunk geometry the server announced.
    pub fn set_chunk_geometry(&self, bits: u32) {
        self.chunksize_bits.store(bits, Ordering::SeqCst);
        self.chunkshift.store(bits - SECTOR_SHIFT, Ordering::SeqCst);
    }

    pub fn chunksize_bits(&self) -> u32 {
        self.chunksize_bits.load(Ordering::SeqCst)
    }

    pub fn chunkshift(&self) -> u32 {
        self.chunkshift.load(Ordering::SeqCst)
    }

    pub fn install_server(&self, sock: UnixStream) {
        *self.server.lock() = Some(sock);
    }

    /// Clones the server stream for the ingress read loop.
    pub fn server_clone(&self) -> Option<UnixStream> {
        self.server
            .lock()
            .as_ref()
            .and_then(|sock| sock.try_clone().ok())
    }

    /// Writes one framed message to the server socket. Callers serialize
    /// through the egress permit; recovery holds the permit for its whole
    /// send sequence.
    pub fn send_server(&self, code: u32, body: &[u8]) -> Result<(), Error> {
        let guard = self.server.lock();
        let mut sock = guard.as_ref().ok_or(Error::Disconnected)?;
        message::send(&mut sock, code, body)
    }

    /// Writes one framed message to the agent socket.
    pub fn send_control(&self, code: u32, body: &[u8]) -> Result<(), Error> {
        message::send(&mut (&self.control), code, body)
    }

    /// Idempotent error report. The first reporter wakes the worker, takes
    /// the recovery token (waiting out any recovery already in progress)
    /// and raises RECOVER.
    pub fn report_error(&self) {
        if self.test_and_set_flag(REPORT_FLAG) {
            return;
        }
        self.more_work_sem.up();
        if !self.running() {
            return;
        }
        self.recover_sem.down();
        self.set_flags(RECOVER_FLAG);
    }
}

/// Handle on a running snapshot client device.
///
/// Dropping the handle tears the device down: all three threads are told to
/// finish, woken out of any blocking wait, and joined before owned I/O is
/// failed back to its completion callbacks.
pub struct SnapDevice {
    inner: Arc<DeviceInner>,
    threads: Vec<JoinHandle<()>>,
}

impl SnapDevice {
    /// Instantiates a device: connects the agent socket and spawns the
    /// ingress, worker and control threads.
    pub fn create(
        params: DeviceParams,
        begin: u64,
        len: u64,
        block: Arc<dyn BlockLayer>,
    ) -> Result<SnapDevice, Error> {
        let control_sock = connect_control(&params.sockname)?;
        let flags = if params.snapshot >= 0 { IS_SNAP_FLAG } else { 0 };
        let snap = params.snapshot;
        let inner = Arc::new(DeviceInner {
            params,
            snap,
            begin,
            len,
            id: AtomicU64::new(0),
            flags: AtomicU32::new(flags),
            chunksize_bits: AtomicU32::new(DEFAULT_CHUNKSIZE_BITS),
            chunkshift: AtomicU32::new(DEFAULT_CHUNKSIZE_BITS - SECTOR_SHIFT),
            block,
            control: control_sock,
            server: Mutex::new(None),
            pending: PendingTable::new(),
            locked_reads: LockedReads::new(),
            server_in_sem: Semaphore::new(0),
            server_out_sem: Semaphore::new(0),
            more_work_sem: Semaphore::new(0),
            recover_sem: Semaphore::new(0),
        });

        let mut threads = Vec::with_capacity(3);
        for (name, entry) in [
            ("ddsnap-clnt", ingress::run as fn(Arc<DeviceInner>)),
            ("ddsnap-wrkr", worker::run as fn(Arc<DeviceInner>)),
            ("ddsnap-cntl", control::run as fn(Arc<DeviceInner>)),
        ] {
            let inner = inner.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("{name} {snap}"))
                    .spawn(move || entry(inner))?,
            );
        }

        debug!(
            target: "ddsnap",
            "created snapshot device origin={} snapstore={} socket={} snapshot={}",
            inner.params.origdev.display(),
            inner.params.snapdev.display(),
            inner.params.sockname,
            snap,
        );
        Ok(SnapDevice { inner, threads })
    }

    /// Maps one incoming block I/O.
    ///
    /// Origin reads on an origin-role client come straight back with an
    /// identity mapping. Everything else is remembered in the pending table
    /// and answered later through the block layer, once the server has been
    /// asked where the I/O belongs.
    pub fn map(&self, mut bio: Bio) -> MapDisposition {
        let inner = &self.inner;
        if !inner.ready() {
            warn!(target: "ddsnap", "snapshot device with id {} is not ready", inner.snap);
            return MapDisposition::Fail(bio);
        }

        bio.device = TargetDevice::Origin;
        if bio.dir == IoDir::Read && !inner.is_snapshot() {
            return MapDisposition::Submit(bio);
        }

        if u64::from(bio.size) > 1u64 << inner.chunksize_bits() {
            warn!(target: "ddsnap", "oversize bio {:x}/{:x}", bio.sector, bio.size);
            return MapDisposition::Fail(bio);
        }
        if inner.server.lock().is_none() {
            return MapDisposition::Fail(bio);
        }

        let chunk = bio.sector >> inner.chunkshift();
        trace!(target: "ddsnap", "map {:x}/{:x}, chunk {:x}", bio.sector, bio.size, chunk);
        inner.pending.queue(chunk, bio);
        inner.more_work_sem.up();
        MapDisposition::Taken
    }

    /// True once the server has answered our IDENTIFY.
    pub fn is_ready(&self) -> bool {
        self.inner.ready()
    }

    /// Current table occupancy.
    pub fn queue_info(&self) -> QueueInfo {
        let (queued_queries, in_flight_queries) = self.inner.pending.counts();
        let (locked_reads, queued_releases) = self.inner.locked_reads.counts();
        QueueInfo {
            queued_queries,
            in_flight_queries,
            locked_reads,
            queued_releases,
        }
    }

    /// Device table line: origin, snapstore, chunk size in bytes.
    pub fn status(&self) -> String {
        format!(
            "{} {} {}",
            self.inner.params.origdev.display(),
            self.inner.params.snapdev.display(),
            1u64 << self.inner.chunksize_bits(),
        )
    }
}

impl Drop for SnapDevice {
    fn drop(&mut self) {
        trace!(target: "shutdown", "[SnapDevice] closing...");
        let inner = &self.inner;
        inner.set_flags(FINISH_FLAG);

        // Unblock helper threads, then feed errors to any blocked reader.
        inner.server_in_sem.up();
        inner.server_out_sem.up();
        inner.recover_sem.up();
        if let Some(server) = inner.server.lock().as_ref() {
            if let Err(err) = server.shutdown(Shutdown::Both) {
                warn!(target: "shutdown", "server socket shutdown error {err}");
            }
        }
        if let Err(err) = inner.control.shutdown(Shutdown::Both) {
            warn!(target: "shutdown", "control socket shutdown error {err}");
        }
        inner.more_work_sem.up();

        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!(target: "shutdown", "client thread panicked");
            }
        }

        for bio in inner.pending.drain_all() {
            bio.fail();
        }
        inner.locked_reads.clear();
        trace!(target: "shutdown", "[SnapDevice] closed");
    }
}

fn connect_control(sockname: &str) -> Result<UnixStream, Error> {
    trace!(target: "ddsnap", "connect to control socket {}", sockname);
    if let Some(name) = sockname.strip_prefix('@') {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        Ok(UnixStream::connect_addr(&addr)?)
    } else {
        Ok(UnixStream::connect(sockname)?)
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceParams;
    use crate::error::Error;

    #[test]
    fn parses_constructor_args() {
        let params =
            DeviceParams::from_args(&["/dev/test-snap", "/dev/test-org", "@ddsnap.control", "3"])
                .unwrap();
        assert_eq!(params.snapdev.to_str(), Some("/dev/test-snap"));
        assert_eq!(params.origdev.to_str(), Some("/dev/test-org"));
        assert_eq!(params.sockname, "@ddsnap.control");
        assert_eq!(params.snapshot, 3);
    }

    #[test]
    fn negative_snapshot_means_origin_role() {
        let params =
            DeviceParams::from_args(&["/dev/snap", "/dev/org", "/tmp/control", "-1"]).unwrap();
        assert_eq!(params.snapshot, -1);
    }

    #[test]
    fn rejects_bad_argument_counts() {
        assert!(matches!(
            DeviceParams::from_args(&["/dev/snap", "/dev/org", "/tmp/control"]),
            Err(Error::Usage(_))
        ));
        assert!(matches!(
            DeviceParams::from_args(&["/dev/snap", "/dev/org", "/tmp/control", "zero"]),
            Err(Error::Usage(_))
        ));
    }
}
