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

//! End-to-end scenarios against a scripted agent and snapshot server.

extern crate ddsnap_client;
extern crate env_logger;
extern crate tempdir;

use ddsnap_client::{
    message::{self, ChunkRange},
    send_server_socket, Bio, BlockLayer, DeviceParams, IoDir, MapDisposition, SnapDevice,
    TargetDevice, ID_BITS,
};
use std::{
    collections::HashSet,
    os::unix::{
        io::AsRawFd,
        net::{UnixListener, UnixStream},
    },
    sync::{mpsc, Arc, Mutex},
    time::Duration,
};
use tempdir::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Block layer that forwards every submitted bio to the test thread.
struct TestBlockLayer {
    submitted: Mutex<mpsc::Sender<Bio>>,
}

impl BlockLayer for TestBlockLayer {
    fn submit(&self, bio: Bio) {
        let _ = self.submitted.lock().unwrap().send(bio);
    }

    fn kick(&self, _device: TargetDevice) {}
}

/// A device wired to a scripted agent, and (once connected) server.
struct Cluster {
    device: SnapDevice,
    bios: mpsc::Receiver<Bio>,
    agent: UnixStream,
    _dir: TempDir,
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Creates a device and accepts its control connection; no server yet.
fn start_unconnected(snapshot: i32) -> Cluster {
    init_logger();
    let dir = TempDir::new("ddsnap").expect("temp dir");
    let sock_path = dir.path().join("control");
    let listener = UnixListener::bind(&sock_path).expect("bind control socket");

    let (submitted, bios) = mpsc::channel();
    let block = Arc::new(TestBlockLayer {
        submitted: Mutex::new(submitted),
    });
    let params = DeviceParams::from_args(&[
        "/dev/test-snap",
        "/dev/test-org",
        sock_path.to_str().expect("utf-8 path"),
        &snapshot.to_string(),
    ])
    .expect("params");
    let device = SnapDevice::create(params, 0, 1 << 20, block).expect("create device");
    let (agent, _) = listener.accept().expect("accept control connection");
    message::send(
        &mut (&agent),
        message::SET_IDENTITY,
        &message::set_identity(0xfeed_face),
    )
    .expect("send SET_IDENTITY");
    Cluster {
        device,
        bios,
        agent,
        _dir: dir,
    }
}

/// Answers the client's NEED_SERVER with a fresh server socket and walks the
/// identify handshake. Asserts that a snapshot-role client uploads exactly
/// `expected_upload_locks` locks before FINISH_UPLOAD_LOCK. Returns the
/// server end once the device is ready.
fn connect_server(
    agent: &UnixStream,
    is_snapshot: bool,
    chunksize_bits: u32,
    expected_upload_locks: usize,
) -> UnixStream {
    let need = message::read_message(&mut (&*agent)).expect("read NEED_SERVER");
    assert_eq!(need.code, message::NEED_SERVER);

    let (server, remote) = UnixStream::pair().expect("server socket pair");
    send_server_socket(agent, remote.as_raw_fd()).expect("pass server socket");
    drop(remote);

    let identify = message::read_message(&mut (&server)).expect("read IDENTIFY");
    assert_eq!(identify.code, message::IDENTIFY);
    // The cluster identity assigned via SET_IDENTITY leads the body.
    assert_eq!(&identify.body[0..8], &0xfeed_faceu64.to_le_bytes());

    if is_snapshot {
        let mut uploads = 0;
        loop {
            let msg = message::read_message(&mut (&server)).expect("read lock upload");
            match msg.code {
                message::UPLOAD_LOCK => uploads += 1,
                message::FINISH_UPLOAD_LOCK => break,
                code => panic!("unexpected message {code:x} during lock upload"),
            }
        }
        assert_eq!(uploads, expected_upload_locks);
    }

    message::send(
        &mut (&server),
        message::IDENTIFY_OK,
        &message::identify_ok(chunksize_bits),
    )
    .expect("send IDENTIFY_OK");
    let usecount = message::read_message(&mut (&server)).expect("read USECOUNT");
    assert_eq!(usecount.code, message::USECOUNT);
    let ok = message::read_message(&mut (&*agent)).expect("read CONNECT_SERVER_OK");
    assert_eq!(ok.code, message::CONNECT_SERVER_OK);
    server
}

/// Full bring-up: device, agent, connected server, READY set.
fn start(snapshot: i32, chunksize_bits: u32) -> (Cluster, UnixStream) {
    let cluster = start_unconnected(snapshot);
    let server = connect_server(&cluster.agent, snapshot >= 0, chunksize_bits, 0);
    assert!(cluster.device.is_ready());
    (cluster, server)
}

/// Maps a bio whose completion reports into `done` as `(sector, ok)`.
fn tracked_bio(dir: IoDir, sector: u64, done: &mpsc::Sender<(u64, bool)>) -> Bio {
    let done = done.clone();
    Bio::new(
        dir,
        sector,
        4096,
        Box::new(move |bio, status| {
            let _ = done.send((bio.sector, status.is_ok()));
        }),
    )
}

/// Reads one query from the server and returns `(code, id, range)`.
fn read_query(server: &UnixStream) -> (u32, u32, ChunkRange) {
    let msg = message::read_message(&mut (&*server)).expect("read query");
    let request = message::parse_rw_reply(msg.code, &msg.body, false).expect("parse query");
    assert_eq!(request.ranges.len(), 1);
    (msg.code, request.id, request.ranges[0].0)
}

#[test]
fn origin_read_is_identity_mapped() {
    let (cluster, _server) = start(-1, 12);
    let (done, done_rx) = mpsc::channel();

    match cluster.device.map(tracked_bio(IoDir::Read, 8, &done)) {
        MapDisposition::Submit(bio) => {
            assert_eq!(bio.device, TargetDevice::Origin);
            assert_eq!(bio.sector, 8);
            bio.complete(Ok(()));
        }
        _ => panic!("origin read should come back with an identity mapping"),
    }
    assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap(), (8, true));
}

#[test]
fn map_fails_before_identify() {
    let cluster = start_unconnected(0);
    let (done, _done_rx) = mpsc::channel();
    match cluster.device.map(tracked_bio(IoDir::Write, 0, &done)) {
        MapDisposition::Fail(bio) => bio.fail(),
        _ => panic!("map must fail while the device is not ready"),
    }
}

#[test]
fn snapshot_write_remaps_to_snapstore() {
    let (cluster, server) = start(0, 12);
    let (done, done_rx) = mpsc::channel();

    // 4 KiB write at sector 24; with 4K chunks that is chunk 3.
    assert!(matches!(
        cluster.device.map(tracked_bio(IoDir::Write, 24, &done)),
        MapDisposition::Taken
    ));

    let (code, id, range) = read_query(&server);
    assert_eq!(code, message::QUERY_WRITE);
    assert_eq!(range, ChunkRange { chunk: 3, chunks: 1 });

    let reply =
        message::rw_reply_with_physical(id, &[(ChunkRange { chunk: 3, chunks: 1 }, &[0x1000][..])]);
    message::send(&mut (&server), message::REPLY_SNAPSHOT_WRITE, &reply).unwrap();

    let bio = cluster.bios.recv_timeout(TIMEOUT).expect("remapped bio");
    assert_eq!(bio.device, TargetDevice::Snapstore);
    assert_eq!(bio.sector, 32768);
    bio.complete(Ok(()));
    assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap(), (32768, true));
}

#[test]
fn origin_served_snapshot_read_releases_its_lock() {
    let (cluster, server) = start(0, 12);
    let (done, done_rx) = mpsc::channel();

    // Read of chunk 5 (sector 40), served from the origin under lock.
    assert!(matches!(
        cluster.device.map(tracked_bio(IoDir::Read, 40, &done)),
        MapDisposition::Taken
    ));
    let (code, id, range) = read_query(&server);
    assert_eq!(code, message::QUERY_SNAPSHOT_READ);
    assert_eq!(range, ChunkRange { chunk: 5, chunks: 1 });

    let reply = message::rw_request(id, &[ChunkRange { chunk: 5, chunks: 1 }]);
    message::send(&mut (&server), message::REPLY_SNAPSHOT_READ_ORIGIN, &reply).unwrap();

    let bio = cluster.bios.recv_timeout(TIMEOUT).expect("hooked bio");
    assert_eq!(bio.device, TargetDevice::Origin);
    assert_eq!(bio.sector, 40);
    assert_eq!(cluster.device.queue_info().locked_reads, 1);

    // Completion restores and chains the original callback, then the worker
    // releases the cluster lock.
    bio.complete(Ok(()));
    assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap(), (40, true));

    let msg = message::read_message(&mut (&server)).expect("read release");
    assert_eq!(msg.code, message::FINISH_SNAPSHOT_READ);
    let release = message::parse_rw_reply(msg.code, &msg.body, false).unwrap();
    assert_eq!(release.ranges[0].0, ChunkRange { chunk: 5, chunks: 1 });
}

#[test]
fn status_reports_devices_and_chunk_size() {
    let (cluster, _server) = start(0, 12);
    // Origin, snapstore, chunk size in bytes, as the device table shows it.
    assert_eq!(cluster.device.status(), "/dev/test-org /dev/test-snap 4096");
}

#[test]
fn snapstore_served_snapshot_read_needs_no_lock() {
    let (cluster, server) = start(0, 12);
    let (done, done_rx) = mpsc::channel();

    assert!(matches!(
        cluster.device.map(tracked_bio(IoDir::Read, 48, &done)),
        MapDisposition::Taken
    ));
    let (code, id, range) = read_query(&server);
    assert_eq!(code, message::QUERY_SNAPSHOT_READ);
    assert_eq!(range, ChunkRange { chunk: 6, chunks: 1 });

    let reply = message::rw_reply_with_physical(id, &[(range, &[0x30][..])]);
    message::send(&mut (&server), message::REPLY_SNAPSHOT_READ, &reply).unwrap();

    let bio = cluster.bios.recv_timeout(TIMEOUT).expect("remapped bio");
    assert_eq!(bio.device, TargetDevice::Snapstore);
    assert_eq!(bio.sector, 0x180);
    assert_eq!(cluster.device.queue_info().locked_reads, 0);

    // No cluster lock was taken, so completion emits no release.
    bio.complete(Ok(()));
    assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap(), (0x180, true));
    server
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    assert!(message::read_message(&mut (&server)).is_err());
}

#[test]
fn unknown_opcode_is_logged_and_session_continues() {
    let (cluster, server) = start(0, 12);
    let (done, done_rx) = mpsc::channel();

    assert!(matches!(
        cluster.device.map(tracked_bio(IoDir::Write, 24, &done)),
        MapDisposition::Taken
    ));
    let (_, id, range) = read_query(&server);

    // Garbage opcode first; the client must keep the session alive and
    // still handle the real reply behind it.
    message::send(&mut (&server), 0xdead, &[1, 2, 3]).unwrap();
    let reply = message::rw_reply_with_physical(id, &[(range, &[0x1000][..])]);
    message::send(&mut (&server), message::REPLY_SNAPSHOT_WRITE, &reply).unwrap();

    let bio = cluster.bios.recv_timeout(TIMEOUT).expect("reply after junk survives");
    assert_eq!(bio.device, TargetDevice::Snapstore);
    bio.complete(Ok(()));
    assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap().1, true);
}

#[test]
fn reply_error_fails_only_its_own_bio() {
    let (cluster, server) = start(0, 12);
    let (done, done_rx) = mpsc::channel();

    assert!(matches!(
        cluster.device.map(tracked_bio(IoDir::Write, 0, &done)),
        MapDisposition::Taken
    ));
    assert!(matches!(
        cluster.device.map(tracked_bio(IoDir::Write, 8, &done)),
        MapDisposition::Taken
    ));
    let (_, first_id, first_range) = read_query(&server);
    let (_, second_id, second_range) = read_query(&server);

    let error = message::rw_request(first_id, &[first_range]);
    message::send(&mut (&server), message::REPLY_ERROR, &error).unwrap();

    // The failed bio comes back through its completion callback, not the
    // block layer.
    assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap(), (0, false));

    let reply = message::rw_reply_with_physical(second_id, &[(second_range, &[0x20][..])]);
    message::send(&mut (&server), message::REPLY_SNAPSHOT_WRITE, &reply).unwrap();
    let bio = cluster.bios.recv_timeout(TIMEOUT).expect("second bio survives");
    assert_eq!(bio.device, TargetDevice::Snapstore);
    assert_eq!(bio.sector, 0x100);
    bio.complete(Ok(()));
    assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap(), (0x100, true));
    assert_eq!(cluster.device.queue_info().in_flight_queries, 0);
}

#[test]
fn reconnect_uploads_locks_and_retransmits_queries() {
    let (cluster, server) = start(0, 12);
    let (done, done_rx) = mpsc::channel();

    // Two origin-served reads stay incomplete, so their locks stay held.
    let mut held = Vec::new();
    for chunk in [5u64, 9] {
        assert!(matches!(
            cluster.device.map(tracked_bio(IoDir::Read, chunk << 3, &done)),
            MapDisposition::Taken
        ));
        let (code, id, range) = read_query(&server);
        assert_eq!(code, message::QUERY_SNAPSHOT_READ);
        assert_eq!(range.chunk, chunk);
        let reply = message::rw_request(id, &[range]);
        message::send(&mut (&server), message::REPLY_SNAPSHOT_READ_ORIGIN, &reply).unwrap();
        held.push(cluster.bios.recv_timeout(TIMEOUT).expect("hooked bio"));
    }

    // Seven queries in flight with no replies.
    let mut sent = HashSet::new();
    for index in 0..7u64 {
        assert!(matches!(
            cluster
                .device
                .map(tracked_bio(IoDir::Write, (20 + index) << 3, &done)),
            MapDisposition::Taken
        ));
        let (code, id, range) = read_query(&server);
        assert_eq!(code, message::QUERY_WRITE);
        sent.insert((id, range.chunk));
    }

    // The server dies mid-flight.
    drop(server);

    // A new server arrives: exactly two UPLOAD_LOCKs precede the single
    // FINISH_UPLOAD_LOCK, then every in-flight query is retransmitted.
    let server = connect_server(&cluster.agent, true, 12, 2);
    let mut retransmitted = HashSet::new();
    for _ in 0..7 {
        let (code, id, range) = read_query(&server);
        assert_eq!(code, message::QUERY_WRITE);
        retransmitted.insert((id, range.chunk));
    }
    assert_eq!(retransmitted, sent);

    // Replies complete each write exactly once.
    for (id, chunk) in retransmitted {
        let reply = message::rw_reply_with_physical(
            id,
            &[(ChunkRange { chunk, chunks: 1 }, &[0x1000 + chunk][..])],
        );
        message::send(&mut (&server), message::REPLY_SNAPSHOT_WRITE, &reply).unwrap();
    }
    for _ in 0..7 {
        let bio = cluster.bios.recv_timeout(TIMEOUT).expect("retransmitted write lands");
        assert_eq!(bio.device, TargetDevice::Snapstore);
        bio.complete(Ok(()));
    }
    for _ in 0..7 {
        assert!(done_rx.recv_timeout(TIMEOUT).unwrap().1);
    }
    assert_eq!(cluster.device.queue_info().in_flight_queries, 0);

    // The re-uploaded locks release normally once the reads complete.
    let mut released = HashSet::new();
    for bio in held {
        bio.complete(Ok(()));
        assert!(done_rx.recv_timeout(TIMEOUT).unwrap().1);
        let msg = message::read_message(&mut (&server)).expect("read release");
        assert_eq!(msg.code, message::FINISH_SNAPSHOT_READ);
        let release = message::parse_rw_reply(msg.code, &msg.body, false).unwrap();
        released.insert(release.ranges[0].0.chunk);
    }
    assert_eq!(released, HashSet::from([5, 9]));
    assert!(
        done_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "no duplicate completions"
    );
}

#[test]
fn identify_refusal_is_forwarded_to_agent() {
    let cluster = start_unconnected(2);
    let agent = &cluster.agent;

    let need = message::read_message(&mut (&*agent)).unwrap();
    assert_eq!(need.code, message::NEED_SERVER);
    let (server, remote) = UnixStream::pair().unwrap();
    send_server_socket(agent, remote.as_raw_fd()).unwrap();
    drop(remote);

    let identify = message::read_message(&mut (&server)).unwrap();
    assert_eq!(identify.code, message::IDENTIFY);
    message::send(
        &mut (&server),
        message::IDENTIFY_ERROR,
        &message::error_body(-5, b"no such snapshot"),
    )
    .unwrap();

    let forwarded = message::read_message(&mut (&*agent)).unwrap();
    assert_eq!(forwarded.code, message::CONNECT_SERVER_ERROR);
    let (err, msg) = message::parse_error_body(forwarded.code, &forwarded.body).unwrap();
    assert_eq!(err, -5);
    assert_eq!(msg, "no such snapshot");

    // The device never became ready, so mapping still fails.
    assert!(!cluster.device.is_ready());
    let (done, _done_rx) = mpsc::channel();
    assert!(matches!(
        cluster.device.map(tracked_bio(IoDir::Write, 0, &done)),
        MapDisposition::Fail(_)
    ));
}

#[test]
fn identifier_wrap_stress_with_reversed_replies() {
    let (cluster, server) = start(0, 12);
    let total = (1usize << ID_BITS) + 1;
    let batch = 256;
    let mut completed = 0usize;
    let mut issued = 0usize;

    while issued < total {
        let count = batch.min(total - issued);
        for offset in 0..count {
            let sector = ((issued + offset) as u64) << 3;
            let bio = Bio::new(IoDir::Write, sector, 4096, Box::new(|_, _| {}));
            assert!(matches!(cluster.device.map(bio), MapDisposition::Taken));
        }
        let queries: Vec<_> = (0..count).map(|_| read_query(&server)).collect();
        for (code, id, range) in queries.into_iter().rev() {
            assert_eq!(code, message::QUERY_WRITE);
            let reply = message::rw_reply_with_physical(id, &[(range, &[range.chunk][..])]);
            message::send(&mut (&server), message::REPLY_SNAPSHOT_WRITE, &reply).unwrap();
        }
        for _ in 0..count {
            let bio = cluster.bios.recv_timeout(TIMEOUT).expect("write lands");
            bio.complete(Ok(()));
            completed += 1;
        }
        issued += count;
    }

    assert_eq!(completed, total);
    let info = cluster.device.queue_info();
    assert_eq!(info.queued_queries, 0);
    assert_eq!(info.in_flight_queries, 0);
}

#[test]
fn shutdown_joins_threads_and_fails_owned_io() {
    let (cluster, server) = start(0, 12);
    let (done, done_rx) = mpsc::channel();

    // Leave two queries in flight and one not yet sent... the worker may
    // send it before shutdown, which is equally fine: either way the bios
    // are still owned by the client when the device goes down.
    for sector in [0u64, 8, 16] {
        assert!(matches!(
            cluster.device.map(tracked_bio(IoDir::Write, sector, &done)),
            MapDisposition::Taken
        ));
    }
    read_query(&server);
    read_query(&server);

    drop(cluster.device);

    // Destroy returned with all threads joined; every owned bio was failed.
    let mut failures = 0;
    while let Ok((_, ok)) = done_rx.recv_timeout(TIMEOUT) {
        assert!(!ok);
        failures += 1;
        if failures == 3 {
            break;
        }
    }
    assert_eq!(failures, 3);
    drop(server);
}
