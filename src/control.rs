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

//! The control thread.
//!
//! Talks to the local agent: accepts the cluster identity and, whenever the
//! agent has (re)connected us to a snapshot server, takes delivery of the
//! server socket itself. The descriptor rides in SCM_RIGHTS ancillary data
//! on a 4-byte carrier message following the CONNECT_SERVER frame, the
//! standard POSIX mechanism for passing an open descriptor between
//! processes.

use std::{
    io, mem,
    os::unix::{
        io::{AsRawFd, FromRawFd, RawFd},
        net::UnixStream,
    },
    ptr,
    sync::{atomic::Ordering, Arc},
};

use crate::{device::DeviceInner, error::Error, message};

/// Length of the data carrier accompanying the descriptor.
const CARRIER_LEN: usize = 4;

pub(crate) fn run(inner: Arc<DeviceInner>) {
    trace!(target: "ddsnap", "control thread started for snapshot {}", inner.snap);
    while inner.running() {
        let msg = match message::read_message(&mut (&inner.control)) {
            Ok(msg) => msg,
            Err(Error::OversizeMessage { code, length }) => {
                warn!(target: "ddsnap", "message {:x} too long ({} bytes)", code, length);
                continue;
            }
            Err(err) => {
                warn!(target: "ddsnap", "socket error {}", err);
                break;
            }
        };
        match msg.code {
            message::SET_IDENTITY => match message::parse_set_identity(&msg.body) {
                Ok(id) => {
                    inner.id.store(id, Ordering::SeqCst);
                    debug!(target: "ddsnap", "id set: {}", id);
                }
                Err(err) => warn!(target: "ddsnap", "{}", err),
            },
            message::CONNECT_SERVER => {
                if !connect_server(&inner) {
                    break;
                }
            }
            code => warn!(target: "ddsnap", "{}", Error::UnknownMessage(code)),
        }
    }
    trace!(target: "ddsnap", "control thread exiting for snapshot {}", inner.snap);
}

/// Installs a freshly delivered server socket: unblocks the ingress thread,
/// identifies to the server, and releases the worker into its lock-upload
/// pass. Returns false when the thread should exit.
fn connect_server(inner: &DeviceInner) -> bool {
    let fd = match recv_fd(&inner.control) {
        Ok(fd) => fd,
        Err(err) => {
            warn!(target: "ddsnap", "can't receive server socket: {}", err);
            return true;
        }
    };
    trace!(target: "ddsnap", "received server socket {}", fd);
    let sock = unsafe { UnixStream::from_raw_fd(fd) };
    inner.install_server(sock);
    inner.server_in_sem.up();

    let body = message::identify(
        inner.id.load(Ordering::SeqCst),
        inner.snap,
        inner.begin,
        inner.len,
    );
    if let Err(err) = inner.send_server(message::IDENTIFY, &body) {
        warn!(target: "ddsnap", "unable to send IDENTIFY message: {}", err);
        return false;
    }
    // Worker uploads locks now.
    inner.recover_sem.up();
    true
}

/// Receives the descriptor carrier, extracting the SCM_RIGHTS payload.
fn recv_fd(sock: &UnixStream) -> Result<RawFd, Error> {
    let mut carrier = [0u8; CARRIER_LEN];
    let fd_size = mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: carrier.as_mut_ptr() as *mut libc::c_void,
        iov_len: carrier.len(),
    };
    // Field-by-field init: libc::msghdr carries private padding on some
    // platforms, so a struct literal does not compile everywhere.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    let received = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if received == 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(Error::MissingDescriptor);
        }
        if (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
            || (*cmsg).cmsg_len != libc::CMSG_LEN(fd_size as u32) as _
        {
            return Err(Error::MissingDescriptor);
        }
        Ok(ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int))
    }
}

/// Agent-side half of CONNECT_SERVER: writes the frame, then a carrier with
/// `fd` attached as SCM_RIGHTS ancillary data. The kernel duplicates the
/// descriptor into the receiving process; the caller keeps its own copy.
pub fn send_server_socket(control: &UnixStream, fd: RawFd) -> Result<(), Error> {
    message::send(&mut (&*control), message::CONNECT_SERVER, &[])?;
    send_with_fd(control, &[0u8; CARRIER_LEN], fd)
}

fn send_with_fd(stream: &UnixStream, data: &[u8], fd: RawFd) -> Result<(), Error> {
    let fd_size = mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
    }

    let sent = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{recv_fd, send_server_socket};
    use crate::message;
    use std::{
        io::{Read, Write},
        os::unix::{io::AsRawFd, net::UnixStream},
    };

    #[test]
    fn passes_descriptor_through_scm_rights() {
        let (agent, client) = UnixStream::pair().unwrap();
        let (payload_in, mut payload_out) = UnixStream::pair().unwrap();

        send_server_socket(&agent, payload_in.as_raw_fd()).unwrap();

        let msg = message::read_message(&mut (&client)).unwrap();
        assert_eq!(msg.code, message::CONNECT_SERVER);
        let fd = recv_fd(&client).unwrap();

        // The received descriptor is an independent handle on the same
        // stream: bytes written into it come out of the original pair.
        let mut received = unsafe {
            use std::os::unix::io::FromRawFd;
            UnixStream::from_raw_fd(fd)
        };
        received.write_all(b"through the side door").unwrap();
        drop(received);
        drop(payload_in);

        let mut bytes = Vec::new();
        payload_out.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"through the side door");
    }
}
