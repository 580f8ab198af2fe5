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

use std::{fmt, io::Error as IoError};

/// Client-side errors.
#[derive(Debug)]
pub enum Error {
    /// IO error on the server or control socket.
    Io(IoError),
    /// Message body exceeds the fixed cap.
    OversizeMessage {
        /// Message opcode.
        code: u32,
        /// Advertised body length.
        length: u32,
    },
    /// Message body too short for its opcode.
    TruncatedMessage {
        /// Message opcode.
        code: u32,
    },
    /// Opcode this client does not understand.
    UnknownMessage(u32),
    /// Range in a reply disagrees with the pending record.
    RangeMismatch {
        /// Chunk count the pending record carries.
        expected: u32,
        /// Chunk count the reply carries.
        got: u32,
    },
    /// CONNECT_SERVER arrived without a descriptor in its ancillary data.
    MissingDescriptor,
    /// No server socket is installed.
    Disconnected,
    /// Bad constructor arguments.
    Usage(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let s = match *self {
            Error::Io(ref err) => err.to_string(),
            Error::OversizeMessage { code, length } => {
                format!("message {code:x} too long ({length} bytes)")
            }
            Error::TruncatedMessage { code } => format!("message {code:x} too short"),
            Error::UnknownMessage(code) => format!("unknown message {code:x}"),
            Error::RangeMismatch { expected, got } => {
                format!("message mismatch, expected {expected:x} got {got:x}")
            }
            Error::MissingDescriptor => "no descriptor in ancillary data".into(),
            Error::Disconnected => "no server connection".into(),
            Error::Usage(ref s) => s.clone(),
        };

        write!(f, "{s}")
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Error::Io(err)
    }
}
