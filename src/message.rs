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

//! Wire codec for the snapshot server and agent protocols.
//!
//! Every message is a fixed `{code: u32, length: u32}` header followed by an
//! opcode-specific body of `length` bytes, packed little-endian. Both ends
//! of the local protocol are built from this module: the client proper, and
//! the agent that hands it a server socket.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::error::Error;

/// Fixed cap on a message body.
pub const MAX_BODY: usize = 500;

/// Size of the message header on the wire.
pub const HEADER_SIZE: usize = 8;

// Opcodes. Identification first, then the query/reply pairs, then the lock
// protocol, then the agent protocol.
pub const IDENTIFY: u32 = 1;
pub const IDENTIFY_OK: u32 = 2;
pub const IDENTIFY_ERROR: u32 = 3;
pub const QUERY_WRITE: u32 = 4;
pub const REPLY_ORIGIN_WRITE: u32 = 5;
pub const REPLY_SNAPSHOT_WRITE: u32 = 6;
pub const QUERY_SNAPSHOT_READ: u32 = 7;
pub const REPLY_SNAPSHOT_READ: u32 = 8;
pub const REPLY_SNAPSHOT_READ_ORIGIN: u32 = 9;
pub const FINISH_SNAPSHOT_READ: u32 = 10;
pub const REPLY_ERROR: u32 = 11;
pub const UPLOAD_LOCK: u32 = 12;
pub const FINISH_UPLOAD_LOCK: u32 = 13;
pub const USECOUNT: u32 = 14;
pub const NEED_SERVER: u32 = 15;
pub const SET_IDENTITY: u32 = 16;
pub const CONNECT_SERVER: u32 = 17;
pub const CONNECT_SERVER_OK: u32 = 18;
pub const CONNECT_SERVER_ERROR: u32 = 19;

/// One contiguous run of chunks in a query or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// First logical chunk of the run.
    pub chunk: u64,
    /// Number of chunks in the run. The client only ever issues 1.
    pub chunks: u32,
}

/// A message read off a stream socket.
#[derive(Debug)]
pub struct Message {
    /// Opcode from the header.
    pub code: u32,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

/// A decoded rw reply body: the query id and, per range, the optional
/// snapstore physical chunk numbers that follow the range entry.
#[derive(Debug)]
pub struct RwReply {
    /// Identifier of the query this reply answers.
    pub id: u32,
    /// Ranges reported, each with its trailing physical chunks (empty when
    /// the reply targets the origin).
    pub ranges: Vec<(ChunkRange, Vec<u64>)>,
}

/// Reads one message: header, then body. Oversize bodies are drained off the
/// stream so the caller can abandon the message and keep the session.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, Error> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let mut cursor = Cursor::new(&header[..]);
    let code = cursor.read_u32::<LittleEndian>()?;
    let length = cursor.read_u32::<LittleEndian>()?;
    if length as usize > MAX_BODY {
        io::copy(&mut reader.by_ref().take(length as u64), &mut io::sink())?;
        return Err(Error::OversizeMessage { code, length });
    }
    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body)?;
    Ok(Message { code, body })
}

/// Writes one framed message as a single contiguous buffer, so a frame is
/// never left half-written by an interrupted sender.
pub fn send<W: Write>(writer: &mut W, code: u32, body: &[u8]) -> Result<(), Error> {
    debug_assert!(body.len() <= MAX_BODY);
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.write_u32::<LittleEndian>(code)?;
    frame.write_u32::<LittleEndian>(body.len() as u32)?;
    frame.extend_from_slice(body);
    writer.write_all(&frame)?;
    Ok(())
}

/// Encodes an `rw_request` body: `{id, count, ranges[count]}`.
pub fn rw_request(id: u32, ranges: &[ChunkRange]) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + 12 * ranges.len());
    body.write_u32::<LittleEndian>(id).expect("vec write");
    body.write_u32::<LittleEndian>(ranges.len() as u32)
        .expect("vec write");
    for range in ranges {
        body.write_u64::<LittleEndian>(range.chunk).expect("vec write");
        body.write_u32::<LittleEndian>(range.chunks).expect("vec write");
    }
    body
}

/// Encodes an rw reply body carrying snapstore addresses: each range entry
/// is immediately followed by its physical chunk numbers.
pub fn rw_reply_with_physical(id: u32, ranges: &[(ChunkRange, &[u64])]) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u32::<LittleEndian>(id).expect("vec write");
    body.write_u32::<LittleEndian>(ranges.len() as u32)
        .expect("vec write");
    for (range, physical) in ranges {
        body.write_u64::<LittleEndian>(range.chunk).expect("vec write");
        body.write_u32::<LittleEndian>(range.chunks).expect("vec write");
        for chunk in *physical {
            body.write_u64::<LittleEndian>(*chunk).expect("vec write");
        }
    }
    body
}

/// Encodes an `IDENTIFY` body: `{id, snap, off, len}`.
pub fn identify(id: u64, snap: i32, off: u64, len: u64) -> Vec<u8> {
    let mut body = Vec::with_capacity(28);
    body.write_u64::<LittleEndian>(id).expect("vec write");
    body.write_i32::<LittleEndian>(snap).expect("vec write");
    body.write_u64::<LittleEndian>(off).expect("vec write");
    body.write_u64::<LittleEndian>(len).expect("vec write");
    body
}

/// Encodes an `IDENTIFY_OK` body.
pub fn identify_ok(chunksize_bits: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(4);
    body.write_u32::<LittleEndian>(chunksize_bits).expect("vec write");
    body
}

/// Encodes an `IDENTIFY_ERROR` or `CONNECT_SERVER_ERROR` body.
pub fn error_body(err: i32, msg: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + msg.len());
    body.write_i32::<LittleEndian>(err).expect("vec write");
    body.extend_from_slice(msg);
    body
}

/// Encodes a `USECOUNT` body: `{snap, usecnt_dev, delta}`.
pub fn usecount(snap: i32, usecnt_dev: i32, delta: i32) -> Vec<u8> {
    let mut body = Vec::with_capacity(12);
    body.write_i32::<LittleEndian>(snap).expect("vec write");
    body.write_i32::<LittleEndian>(usecnt_dev).expect("vec write");
    body.write_i32::<LittleEndian>(delta).expect("vec write");
    body
}

/// Encodes a `SET_IDENTITY` body.
pub fn set_identity(id: u64) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.write_u64::<LittleEndian>(id).expect("vec write");
    body
}

/// Decodes an rw reply body. `with_physical` selects the layouts that carry
/// snapstore addresses. Each range's count is read exactly once, before the
/// trailing physical chunk numbers are consumed.
pub fn parse_rw_reply(code: u32, body: &[u8], with_physical: bool) -> Result<RwReply, Error> {
    let truncated = || Error::TruncatedMessage { code };
    let mut cursor = Cursor::new(body);
    let id = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;
    let count = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;
    // The count comes off the wire untrusted; bound it by what the body can
    // actually hold before reserving anything for it.
    let range_size = if with_physical { 20 } else { 12 };
    if count as usize > body.len().saturating_sub(8) / range_size {
        return Err(truncated());
    }
    let mut ranges = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let chunk = cursor.read_u64::<LittleEndian>().map_err(|_| truncated())?;
        let chunks = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;
        let mut physical = Vec::new();
        if with_physical {
            for _ in 0..chunks {
                physical.push(cursor.read_u64::<LittleEndian>().map_err(|_| truncated())?);
            }
        }
        ranges.push((ChunkRange { chunk, chunks }, physical));
    }
    Ok(RwReply { id, ranges })
}

/// Decodes an `IDENTIFY_OK` body.
pub fn parse_identify_ok(body: &[u8]) -> Result<u32, Error> {
    Cursor::new(body)
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::TruncatedMessage { code: IDENTIFY_OK })
}

/// Decodes an `IDENTIFY_ERROR` or `CONNECT_SERVER_ERROR` body into the error
/// code and message text.
pub fn parse_error_body(code: u32, body: &[u8]) -> Result<(i32, String), Error> {
    let mut cursor = Cursor::new(body);
    let err = cursor
        .read_i32::<LittleEndian>()
        .map_err(|_| Error::TruncatedMessage { code })?;
    let msg = String::from_utf8_lossy(&body[4..]).into_owned();
    Ok((err, msg))
}

/// Decodes a `SET_IDENTITY` body.
pub fn parse_set_identity(body: &[u8]) -> Result<u64, Error> {
    Cursor::new(body)
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::TruncatedMessage { code: SET_IDENTITY })
}
