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

//! Client side of a cluster-coordinated copy-on-write snapshot block device.
//!
//! The client interposes on every block I/O aimed at the virtual device.
//! With help from a remote snapshot server owning the cluster-wide metadata
//! it decides, chunk by chunk, whether the I/O belongs on the origin volume
//! or in the snapshot store, and at which physical offset. Snapshot reads
//! the server chooses to serve from the origin come back under a
//! cluster-wide read lock, which the client releases once the read
//! completes.
//!
//! A local agent process hands the client its server connection over a Unix
//! control socket (the socket itself rides in SCM_RIGHTS ancillary data),
//! and hands it a fresh one whenever the server is replaced. The client
//! survives that: it re-uploads every read lock it still holds and
//! retransmits every in-flight query before accepting new work.

#[macro_use]
extern crate log;

mod control;
mod device;
mod error;
mod hooks;
mod ingress;
mod pending;
mod semaphore;
mod worker;

pub mod bio;
pub mod message;

pub use bio::{Bio, BlockLayer, EndIo, IoDir, IoStatus, MapDisposition, TargetDevice};
pub use control::send_server_socket;
pub use device::{DeviceParams, QueueInfo, SnapDevice, SECTOR_SHIFT};
pub use error::Error;
pub use pending::{ID_BITS, NUM_BUCKETS};
