//! Receiver state machine: passive open, in-order acceptance with
//! cumulative ACKs, and four-way teardown with duplicate-FIN handling.

use std::fs::File;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::err::Result;
use crate::io::{recv_blocking, Outcome, Waiter};
use crate::rtt::RttEstimator;
use crate::segment::{Segment, FLAG_ACK, FLAG_FIN, FLAG_SYN};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub file: PathBuf,
    pub listen_port: u16,
    pub peer_ack_addr: Ipv4Addr,
    pub peer_ack_port: u16,
}

impl ReceiverConfig {
    pub fn peer(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.peer_ack_addr, self.peer_ack_port)
    }
}

fn send(socket: &UdpSocket, dst: SocketAddrV4, seg: &Segment) -> Result<()> {
    socket.send_to(&seg.encode(), dst)?;
    Ok(())
}

/// Runs the receiver end to end: LISTEN, handshake, data transfer, teardown.
pub fn run(cfg: &ReceiverConfig) -> Result<()> {
    let mut out = File::create(&cfg.file)?;
    let socket = UdpSocket::bind(("0.0.0.0", cfg.listen_port))?;
    let peer = cfg.peer();
    let waiter = Waiter::new(&socket);
    let mut rtt = RttEstimator::new();

    info!(state = "LISTEN", "waiting for a connection");
    let next_expected_peer_seq = listen(&socket)?;

    info!(state = "SYN_RCVD", "handshaking");
    let next_expected_peer_seq =
        syn_rcvd_to_established(&socket, &waiter, &mut rtt, cfg, peer, next_expected_peer_seq)?;

    info!(state = "ESTABLISHED", "receiving file");
    let next_expected_peer_seq = data_receive_loop(&socket, cfg, peer, &mut out, next_expected_peer_seq)?;

    info!(state = "LAST_ACK", "closing");
    last_ack(&socket, &waiter, &mut rtt, cfg, peer, next_expected_peer_seq)?;

    info!("receiver closed cleanly");
    Ok(())
}

/// LISTEN: block forever for a SYN. Any other validated segment is ignored.
fn listen(socket: &UdpSocket) -> Result<u32> {
    loop {
        let buf = recv_blocking(socket)?;
        if !Segment::is_valid(&buf) {
            debug!("discarding corrupt segment in LISTEN");
            continue;
        }
        let seg = Segment::decode(&buf).unwrap();
        if seg.is_syn() {
            return Ok(seg.seq.wrapping_add(1));
        }
    }
}

/// SYN_RCVD -> ESTABLISHED: send SYN|ACK, retry on timeout until the
/// peer's post-SYN ACK arrives.
fn syn_rcvd_to_established(
    socket: &UdpSocket,
    waiter: &Waiter,
    rtt: &mut RttEstimator,
    cfg: &ReceiverConfig,
    peer: SocketAddrV4,
    next_expected_peer_seq: u32,
) -> Result<u32> {
    let syn_ack = Segment::new(
        cfg.listen_port,
        cfg.peer_ack_port,
        0,
        next_expected_peer_seq,
        FLAG_SYN | FLAG_ACK,
        &[],
    );
    send(socket, peer, &syn_ack)?;

    loop {
        let (outcome, _elapsed) = waiter.wait_or_recv(rtt.timeout())?;
        match outcome {
            Outcome::Timeout => {
                rtt.backoff();
                warn!(timeout_us = rtt.timeout().as_micros() as u64, "SYN-ACK timed out, retransmitting");
                send(socket, peer, &syn_ack)?;
            }
            Outcome::Datagram(buf) => {
                if !Segment::is_valid(&buf) {
                    debug!("discarding corrupt segment in SYN_RCVD");
                    continue;
                }
                let seg = Segment::decode(&buf).unwrap();
                if seg.is_ack() && seg.ack == 1 {
                    info!("handshake complete");
                    return Ok(next_expected_peer_seq.wrapping_add(1));
                }
                debug!("ignoring unrelated segment in SYN_RCVD");
            }
        }
    }
}

/// The data-receive loop: a blocking (untimed) receive. In-order segments
/// are appended to the file and cumulatively ACKed; anything else
/// (corrupt, out-of-order, duplicate) is either discarded or re-ACKed at
/// the current cumulative point, never buffered.
fn data_receive_loop(
    socket: &UdpSocket,
    cfg: &ReceiverConfig,
    peer: SocketAddrV4,
    file: &mut File,
    mut next_expected_peer_seq: u32,
) -> Result<u32> {
    loop {
        let buf = recv_blocking(socket)?;
        if !Segment::is_valid(&buf) {
            debug!("discarding corrupt segment in data-receive loop");
            continue;
        }
        let seg = Segment::decode(&buf).unwrap();

        if seg.seq == next_expected_peer_seq {
            if seg.is_fin() {
                info!(seq = seg.seq, "received FIN");
                return Ok(next_expected_peer_seq);
            }

            file.write_all(&seg.data)?;
            next_expected_peer_seq = next_expected_peer_seq.wrapping_add(seg.data.len() as u32);
            debug!(ack = next_expected_peer_seq, len = seg.data.len(), "accepted data segment");

            let ack = Segment::new(cfg.listen_port, cfg.peer_ack_port, 1, next_expected_peer_seq, FLAG_ACK, &[]);
            send(socket, peer, &ack)?;
        } else {
            debug!(got = seg.seq, expected = next_expected_peer_seq, "out-of-order segment, re-ACKing");
            let ack = Segment::new(cfg.listen_port, cfg.peer_ack_port, 1, next_expected_peer_seq, FLAG_ACK, &[]);
            send(socket, peer, &ack)?;
        }
    }
}

/// LAST_ACK: ACK the peer's FIN, send our own FIN, retry on timeout until
/// it's ACKed — re-ACKing any retransmitted peer FIN along the way.
fn last_ack(
    socket: &UdpSocket,
    waiter: &Waiter,
    rtt: &mut RttEstimator,
    cfg: &ReceiverConfig,
    peer: SocketAddrV4,
    next_expected_peer_seq: u32,
) -> Result<()> {
    let fin_ack = Segment::new(
        cfg.listen_port,
        cfg.peer_ack_port,
        1,
        next_expected_peer_seq.wrapping_add(1),
        FLAG_ACK,
        &[],
    );
    send(socket, peer, &fin_ack)?;

    let own_fin = Segment::new(
        cfg.listen_port,
        cfg.peer_ack_port,
        1,
        next_expected_peer_seq.wrapping_add(1),
        FLAG_FIN,
        &[],
    );
    send(socket, peer, &own_fin)?;

    loop {
        let (outcome, _elapsed) = waiter.wait_or_recv(rtt.timeout())?;
        match outcome {
            Outcome::Timeout => {
                rtt.backoff();
                warn!("FIN timed out, retransmitting");
                send(socket, peer, &own_fin)?;
            }
            Outcome::Datagram(buf) => {
                if !Segment::is_valid(&buf) {
                    debug!("discarding corrupt segment in LAST_ACK");
                    continue;
                }
                let seg = Segment::decode(&buf).unwrap();
                if seg.is_ack() && seg.ack == 2 {
                    return Ok(());
                }
                if seg.seq == next_expected_peer_seq && seg.is_fin() {
                    debug!("duplicate peer FIN in LAST_ACK, re-ACKing");
                    send(socket, peer, &fin_ack)?;
                }
            }
        }
    }
}
