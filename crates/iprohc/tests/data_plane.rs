// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data-plane scenarios with a live worker and live router threads.
//!
//! The virtual interface is stood in for by a pipe and the raw socket by
//! a loopback UDP socket, so the whole path runs without privileges:
//! packets still traverse the real worker thread, the real codec and the
//! real demux code.

use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::bounded;
use iprohc::net::{RawTunnelSocket, VirtualInterface, TUN_PI_LEN};
use iprohc::router::{Router, SessionTable, SlotPorts};
use iprohc::session::SessionShared;
use iprohc::tunnel::codec;
use iprohc::tunnel::packing::{depacketize, Packetizer};
use iprohc::tunnel::worker::PIPE_DEPTH;
use iprohc::tunnel::{TunnelParams, TunnelWorker};

const PEER: Ipv4Addr = Ipv4Addr::LOCALHOST;

fn pipe_device() -> (VirtualInterface, VirtualInterface) {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: pipe2 fills the two descriptors on success.
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(ret, 0);
    // SAFETY: both descriptors were just created and are unowned.
    let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    (VirtualInterface::from_fd(rd), VirtualInterface::from_fd(wr))
}

fn ipv4_packet(dest: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&[10, 99, 0, 1]);
    pkt[16..20].copy_from_slice(&dest);
    pkt[20..].copy_from_slice(payload);
    pkt
}

/// Outer IPv4 datagram as the raw path would deliver it.
fn outer_dgram(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let mut dgram = vec![0u8; 20 + payload.len()];
    dgram[0] = 0x45;
    dgram[9] = 4; // IPPROTO_IPIP
    dgram[12..16].copy_from_slice(&src.octets());
    dgram[16..20].copy_from_slice(&dst.octets());
    dgram[20..].copy_from_slice(payload);
    dgram
}

struct WorkerRig {
    handle: iprohc::tunnel::worker::WorkerHandle,
    shared: Arc<SessionShared>,
    tun_tx: crossbeam::channel::Sender<Vec<u8>>,
    raw_tx: crossbeam::channel::Sender<Vec<u8>>,
    /// Where worker raw output lands.
    wire_rx: UdpSocket,
    /// Where worker TUN output lands.
    tun_out: VirtualInterface,
    params: TunnelParams,
}

fn start_worker(packing: u8) -> WorkerRig {
    let wire_rx = UdpSocket::bind("127.0.0.1:0").unwrap();
    wire_rx
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let wire_port = wire_rx.local_addr().unwrap().port();

    let out_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let raw = Arc::new(RawTunnelSocket::from_datagram(out_sock, wire_port).unwrap());

    let (tun_out, tun_in) = pipe_device();

    let (tun_tx, tun_rx) = bounded(PIPE_DEPTH);
    let (raw_tx, raw_rx) = bounded(PIPE_DEPTH);

    let mut params = TunnelParams::default();
    params.packing = packing;
    let shared = Arc::new(SessionShared::new());

    let handle = TunnelWorker {
        tun_rx,
        raw_rx,
        tun: Arc::new(tun_in),
        raw,
        peer: PEER,
        params,
        shared: Arc::clone(&shared),
    }
    .spawn()
    .unwrap();

    WorkerRig {
        handle,
        shared,
        tun_tx,
        raw_tx,
        wire_rx,
        tun_out,
        params,
    }
}

#[test]
fn outbound_packets_are_compressed_and_batched() {
    let rig = start_worker(3);
    let packets: Vec<Vec<u8>> = (0..3u8)
        .map(|i| ipv4_packet([10, 99, 0, 50 + i], &[i; 32]))
        .collect();
    for pkt in &packets {
        rig.tun_tx.send(pkt.clone()).unwrap();
    }

    // Usually one full datagram; a slow scheduler may split the batch
    // across threshold flushes, so collect until all three arrive.
    let mut elems: Vec<Vec<u8>> = Vec::new();
    let mut buf = [0u8; 65536];
    while elems.len() < 3 {
        let n = rig.wire_rx.recv(&mut buf).unwrap();
        for elem in depacketize(&buf[..n]) {
            elems.push(elem.unwrap().to_vec());
        }
    }
    assert_eq!(elems.len(), 3);

    let mut decomp = codec::decompressor_for(&rig.params);
    for (elem, original) in elems.iter().zip(&packets) {
        assert_eq!(&decomp.decompress(elem).unwrap(), original);
    }

    let snap = rig.shared.stats.snapshot();
    assert_eq!(snap.comp_total, 3);
    assert_eq!(snap.comp_failed, 0);

    rig.handle.stop();
    rig.handle.join();
}

#[test]
fn underfilled_batch_flushes_on_threshold() {
    let rig = start_worker(5);
    rig.tun_tx
        .send(ipv4_packet([10, 99, 0, 50], b"lonely packet"))
        .unwrap();

    // One packet with packing 5: only the flush threshold sends it.
    let mut buf = [0u8; 65536];
    let n = rig.wire_rx.recv(&mut buf).unwrap();
    let elems: Vec<&[u8]> = depacketize(&buf[..n]).collect::<Result<_, _>>().unwrap();
    assert_eq!(elems.len(), 1);

    // The histogram entry lands right after the send; give it a moment.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if rig.shared.stats.snapshot().packing_histogram[1] == 1 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "histogram never updated");
        std::thread::sleep(Duration::from_millis(10));
    }

    rig.handle.stop();
    rig.handle.join();
}

#[test]
fn inbound_datagrams_are_unpacked_and_written_to_tun() {
    let rig = start_worker(2);
    let inner = ipv4_packet([10, 99, 0, 7], b"hello through the tunnel");

    let mut comp = codec::compressor_for(&rig.params);
    let compressed = comp.compress(&inner).unwrap();
    let mut batch = Packetizer::new(2);
    batch.push(&compressed.data).unwrap();
    let (payload, _) = batch.take();

    rig.raw_tx
        .send(outer_dgram(PEER, Ipv4Addr::new(10, 99, 0, 1), &payload))
        .unwrap();

    let mut buf = [0u8; 65536];
    let n = rig.tun_out.read_frame(&mut buf).unwrap();
    assert_eq!(&buf[TUN_PI_LEN..n], inner.as_slice());

    let snap = rig.shared.stats.snapshot();
    assert_eq!(snap.total_received, 1);
    assert_eq!(snap.decomp_total, 1);
    assert_eq!(snap.decomp_failed, 0);

    rig.handle.stop();
    rig.handle.join();
}

#[test]
fn corrupt_inbound_element_only_bumps_counters() {
    let rig = start_worker(2);

    // A framed element that is not valid codec output.
    let mut batch = Packetizer::new(2);
    batch.push(b"definitely not deflate").unwrap();
    let (payload, _) = batch.take();
    rig.raw_tx
        .send(outer_dgram(PEER, Ipv4Addr::new(10, 99, 0, 1), &payload))
        .unwrap();

    // Followed by a healthy datagram: the session must still work.
    let inner = ipv4_packet([10, 99, 0, 7], b"still alive");
    let mut comp = codec::compressor_for(&rig.params);
    let compressed = comp.compress(&inner).unwrap();
    let mut batch = Packetizer::new(2);
    batch.push(&compressed.data).unwrap();
    let (payload, _) = batch.take();
    rig.raw_tx
        .send(outer_dgram(PEER, Ipv4Addr::new(10, 99, 0, 1), &payload))
        .unwrap();

    let mut buf = [0u8; 65536];
    let n = rig.tun_out.read_frame(&mut buf).unwrap();
    assert_eq!(&buf[TUN_PI_LEN..n], inner.as_slice());

    let snap = rig.shared.stats.snapshot();
    assert_eq!(snap.decomp_failed, 1);
    assert_eq!(snap.total_received, 2);

    rig.handle.stop();
    rig.handle.join();
}

#[test]
fn worker_stops_when_pipes_close() {
    let rig = start_worker(2);
    drop(rig.tun_tx);
    drop(rig.raw_tx);

    // Closing the pipes must be observed within one read cycle.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !rig.handle.is_finished() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(rig.handle.is_finished());
    rig.handle.join();
}

/// Router demux end to end: packets read from the shared devices reach
/// exactly the pipes of the session they belong to.
#[test]
fn router_demultiplexes_to_the_right_session() {
    let local = Ipv4Addr::new(10, 99, 0, 1);
    let table = Arc::new(SessionTable::new(4));

    let make_slot = |tunnel: [u8; 4], peer: [u8; 4]| {
        let (tun_tx, tun_rx) = bounded(PIPE_DEPTH);
        let (raw_tx, raw_rx) = bounded(PIPE_DEPTH);
        (
            Arc::new(SlotPorts {
                tunnel_addr: tunnel.into(),
                peer_addr: peer.into(),
                local_addr: local,
                tun_tx,
                raw_tx,
                shared: Arc::new(SessionShared::new()),
            }),
            tun_rx,
            raw_rx,
        )
    };

    let (slot_a, a_tun, a_raw) = make_slot([10, 99, 0, 2], [192, 0, 2, 10]);
    let (slot_b, b_tun, b_raw) = make_slot([10, 99, 0, 3], [192, 0, 2, 11]);
    table.publish(0, slot_a);
    table.publish(1, slot_b);

    // Shared devices: a pipe as the TUN, a loopback UDP socket as RAW.
    let (tun_read_side, tun_feeder) = pipe_device();
    let raw_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let raw_port = raw_sock.local_addr().unwrap().port();
    let raw = Arc::new(RawTunnelSocket::from_datagram(raw_sock, 0).unwrap());

    let router = Router::start(Arc::clone(&table), Arc::new(tun_read_side), raw).unwrap();

    // A packet for A's tunnel address appears only on A's TUN pipe.
    let packet_for_a = ipv4_packet([10, 99, 0, 2], b"to client A");
    tun_feeder.write_packet(&packet_for_a).unwrap();
    let delivered = a_tun.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(delivered, packet_for_a);
    assert!(b_tun.try_recv().is_err());

    // A datagram from B's peer appears only on B's RAW pipe.
    let dgram = outer_dgram(Ipv4Addr::new(192, 0, 2, 11), local, b"from B");
    let feeder = UdpSocket::bind("127.0.0.1:0").unwrap();
    feeder.send_to(&dgram, ("127.0.0.1", raw_port)).unwrap();
    let delivered = b_raw.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(delivered, dgram);
    assert!(a_raw.try_recv().is_err());

    router.stop();
}
