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

//! Block I/O model at the crate boundary.
//!
//! The block-layer adapter that presents the virtual device hands each I/O
//! to [`SnapDevice::map`](crate::SnapDevice::map) as a [`Bio`] and receives
//! remapped I/O back through its [`BlockLayer`] implementation.

use std::io;

/// Direction of a block I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    /// Read from the device.
    Read,
    /// Write to the device.
    Write,
}

/// Backing device an I/O is aimed at after mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetDevice {
    /// The live origin volume.
    Origin,
    /// The copy-on-write snapshot store.
    Snapstore,
}

/// Completion status delivered to a bio's end-I/O callback.
pub type IoStatus = Result<(), io::Error>;

/// End-of-I/O callback. Receives the finished bio and its status.
pub type EndIo = Box<dyn FnOnce(Bio, IoStatus) + Send>;

/// One block I/O in flight through the client.
///
/// A fresh bio targets the virtual device; mapping rewrites `device` and
/// possibly `sector` before the bio reaches the block layer again.
pub struct Bio {
    /// Transfer direction.
    pub dir: IoDir,
    /// Backing device, rewritten by mapping.
    pub device: TargetDevice,
    /// Starting sector, rewritten for snapstore targets.
    pub sector: u64,
    /// Transfer length in bytes. At most one chunk.
    pub size: u32,
    end_io: Option<EndIo>,
}

impl Bio {
    /// Creates a bio aimed at the virtual device.
    pub fn new(dir: IoDir, sector: u64, size: u32, end_io: EndIo) -> Bio {
        Bio {
            dir,
            device: TargetDevice::Origin,
            sector,
            size,
            end_io: Some(end_io),
        }
    }

    /// Invokes the current end-I/O callback with `status`.
    pub fn complete(mut self, status: IoStatus) {
        if let Some(end_io) = self.end_io.take() {
            end_io(self, status);
        }
    }

    /// Completes the bio with an I/O error.
    pub fn fail(self) {
        self.complete(Err(io::Error::from_raw_os_error(libc::EIO)));
    }

    /// Detaches the current end-I/O callback so a hook can capture it.
    pub(crate) fn take_end_io(&mut self) -> Option<EndIo> {
        self.end_io.take()
    }

    /// Reinstalls a captured end-I/O callback.
    pub(crate) fn set_end_io(&mut self, end_io: EndIo) {
        self.end_io = Some(end_io);
    }
}

/// Submission seam to the block-layer adapter.
pub trait BlockLayer: Send + Sync {
    /// Hands a fully mapped bio to the lower layer for submission.
    fn submit(&self, bio: Bio);

    /// Best-effort dispatch nudge for a backing device's request queue.
    fn kick(&self, device: TargetDevice);
}

/// What the caller should do with a bio it offered to `map`.
pub enum MapDisposition {
    /// Submit the bio as returned; the target device has been rewritten.
    Submit(Bio),
    /// The client took ownership and will submit or fail the bio itself.
    Taken,
    /// The bio cannot be serviced; the caller should fail it.
    Fail(Bio),
}
