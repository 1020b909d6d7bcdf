//! Sender state machine: three-way handshake, pipelined file transmission,
//! and four-way teardown.

use std::fs::File;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::err::Result;
use crate::io::{recv_blocking, Waiter};
use crate::io::Outcome;
use crate::rtt::RttEstimator;
use crate::segment::{Segment, FLAG_ACK, FLAG_FIN, FLAG_SYN, MSS};
use crate::window::{InFlight, RingWindow};

/// Fixed quiet-timer budget for TIME_WAIT, per spec.
const TIME_WAIT_BUDGET: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub file: PathBuf,
    pub peer_addr: Ipv4Addr,
    pub peer_port: u16,
    pub window_bytes: u32,
    pub local_ack_port: u16,
}

impl SenderConfig {
    pub fn peer(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.peer_addr, self.peer_port)
    }

    pub fn window_capacity(&self) -> usize {
        ((self.window_bytes as usize) / MSS).max(1)
    }
}

fn send(socket: &UdpSocket, dst: SocketAddrV4, seg: &Segment) -> Result<()> {
    socket.send_to(&seg.encode(), dst)?;
    Ok(())
}

/// Runs the sender end to end: handshake, file transfer, teardown. Returns
/// `Ok(())` only after TIME_WAIT has quietly expired.
pub fn run(cfg: &SenderConfig) -> Result<()> {
    let mut file = File::open(&cfg.file)?;
    let socket = UdpSocket::bind(("0.0.0.0", cfg.local_ack_port))?;
    let peer = cfg.peer();
    let waiter = Waiter::new(&socket);
    let mut rtt = RttEstimator::new();

    info!(state = "SYN_SENT", "starting handshake");
    let next_expected_peer_seq = syn_sent(&socket, &waiter, &mut rtt, cfg, peer)?;

    info!(state = "ESTAB_SENDING", "transmitting file");
    let (next_seq, next_expected_peer_seq) = estab_sending(
        &socket,
        &waiter,
        &mut rtt,
        cfg,
        peer,
        &mut file,
        next_expected_peer_seq,
    )?;

    info!(state = "FIN_SENT", "file exhausted, closing");
    let (next_seq, next_expected_peer_seq) =
        fin_sent(&socket, &waiter, &mut rtt, cfg, peer, next_seq, next_expected_peer_seq)?;

    info!(state = "TIME_WAIT", "waiting for peer teardown");
    time_wait(&socket, &waiter, cfg, peer, next_seq, next_expected_peer_seq)?;

    info!("sender closed cleanly");
    Ok(())
}

/// SYN_SENT: send SYN, retry indefinitely on timeout, until a SYN|ACK
/// acking the SYN arrives. Returns the peer's next-expected-seq.
fn syn_sent(
    socket: &UdpSocket,
    waiter: &Waiter,
    rtt: &mut RttEstimator,
    cfg: &SenderConfig,
    peer: SocketAddrV4,
) -> Result<u32> {
    let syn = Segment::new(cfg.local_ack_port, cfg.peer_port, 0, 0, FLAG_SYN, &[]);
    let mut retransmitted = false;
    let mut sent_at = Instant::now();
    send(socket, peer, &syn)?;

    loop {
        let (outcome, _elapsed) = waiter.wait_or_recv(rtt.timeout())?;
        match outcome {
            Outcome::Timeout => {
                rtt.backoff();
                warn!(timeout_us = rtt.timeout().as_micros() as u64, "SYN timed out, retransmitting");
                retransmitted = true;
                sent_at = Instant::now();
                send(socket, peer, &syn)?;
            }
            Outcome::Datagram(buf) => {
                if !Segment::is_valid(&buf) {
                    debug!("discarding corrupt segment in SYN_SENT");
                    continue;
                }
                let seg = Segment::decode(&buf).unwrap();
                if seg.ack == 1 && seg.is_syn() && seg.is_ack() {
                    let next_expected_peer_seq = seg.seq.wrapping_add(1);
                    if !retransmitted {
                        rtt.update(sent_at.elapsed().as_micros() as i64);
                    }
                    let ack = Segment::new(
                        cfg.local_ack_port,
                        cfg.peer_port,
                        1,
                        next_expected_peer_seq,
                        FLAG_ACK,
                        &[],
                    );
                    send(socket, peer, &ack)?;
                    info!(peer_isn = seg.seq, "handshake complete");
                    return Ok(next_expected_peer_seq);
                }
                debug!("ignoring unrelated segment in SYN_SENT");
            }
        }
    }
}

/// ESTAB_SENDING: pipelines the file through a fixed-capacity window,
/// advancing on cumulative ACKs and bulk-retransmitting the whole window on
/// timeout. Returns `(nextSeq, nextExpectedPeerSeq)` once the file is fully
/// read and the window has drained.
fn estab_sending(
    socket: &UdpSocket,
    waiter: &Waiter,
    rtt: &mut RttEstimator,
    cfg: &SenderConfig,
    peer: SocketAddrV4,
    file: &mut File,
    next_expected_peer_seq: u32,
) -> Result<(u32, u32)> {
    let mut window = RingWindow::new(cfg.window_capacity());
    let mut next_seq: u32 = 2;
    let mut eof = false;

    // The single seq currently being timed for an RTT sample, if any.
    let mut seq_timed: Option<u32> = None;
    let mut t_start = Instant::now();
    let mut time_remaining = rtt.timeout();

    loop {
        while !window.is_full() && !eof {
            let mut buf = [0u8; MSS];
            let n = file.read(&mut buf)?;
            if n == 0 {
                eof = true;
                break;
            }

            let seg = Segment::new(
                cfg.local_ack_port,
                cfg.peer_port,
                next_seq,
                next_expected_peer_seq,
                0,
                &buf[..n],
            );
            let wire = seg.encode();
            window.offer(InFlight {
                seq: next_seq,
                data_len: n,
                wire: wire.clone(),
            });
            socket.send_to(&wire, peer)?;
            debug!(seq = next_seq, len = n, "sent data segment");

            if seq_timed.is_none() {
                seq_timed = Some(next_seq);
                t_start = Instant::now();
            }
            next_seq = next_seq.wrapping_add(n as u32);
        }

        if eof && window.is_empty() {
            return Ok((next_seq, next_expected_peer_seq));
        }

        let (outcome, elapsed) = waiter.wait_or_recv(time_remaining)?;
        match outcome {
            Outcome::Timeout => {
                rtt.backoff();
                time_remaining = rtt.timeout();
                warn!(
                    timeout_us = rtt.timeout().as_micros() as u64,
                    in_flight = window.len(),
                    "retransmission timer expired, resending window"
                );
                for rec in window.iter() {
                    socket.send_to(&rec.wire, peer)?;
                }
                seq_timed = None;
            }
            Outcome::Datagram(buf) => {
                time_remaining = time_remaining.saturating_sub(elapsed);
                if !Segment::is_valid(&buf) {
                    debug!("discarding corrupt segment in ESTAB_SENDING");
                    continue;
                }
                let seg = Segment::decode(&buf).unwrap();
                if !seg.is_ack() {
                    continue;
                }

                let ack = seg.ack;
                let head_seq = window.front().map(|r| r.seq);
                match head_seq {
                    Some(head) if ack > head => {
                        while let Some(front) = window.front() {
                            if front.seq >= ack {
                                break;
                            }
                            let removed_seq = front.seq;
                            window.delete_head();
                            if Some(removed_seq) == seq_timed {
                                rtt.update(t_start.elapsed().as_micros() as i64);
                                seq_timed = None;
                            }
                        }
                        time_remaining = rtt.timeout();
                    }
                    _ => {
                        if ack == 1 && seg.is_syn() {
                            debug!("duplicate SYN-ACK after handshake, re-sending post-SYN ACK");
                            let dup_ack = Segment::new(
                                cfg.local_ack_port,
                                cfg.peer_port,
                                1,
                                next_expected_peer_seq,
                                FLAG_ACK,
                                &[],
                            );
                            send(socket, peer, &dup_ack)?;
                        }
                        // else: stale ACK at or below the window head, ignored.
                    }
                }
            }
        }
    }
}

/// FIN_SENT: send FIN, retry indefinitely on timeout, until it's ACKed.
fn fin_sent(
    socket: &UdpSocket,
    waiter: &Waiter,
    rtt: &mut RttEstimator,
    cfg: &SenderConfig,
    peer: SocketAddrV4,
    next_seq: u32,
    next_expected_peer_seq: u32,
) -> Result<(u32, u32)> {
    let fin_seq = next_seq;
    let next_seq = next_seq.wrapping_add(1);
    let fin = Segment::new(
        cfg.local_ack_port,
        cfg.peer_port,
        fin_seq,
        next_expected_peer_seq,
        FLAG_FIN,
        &[],
    );
    send(socket, peer, &fin)?;

    loop {
        let (outcome, _elapsed) = waiter.wait_or_recv(rtt.timeout())?;
        match outcome {
            Outcome::Timeout => {
                rtt.backoff();
                warn!("FIN timed out, retransmitting");
                send(socket, peer, &fin)?;
            }
            Outcome::Datagram(buf) => {
                if !Segment::is_valid(&buf) {
                    debug!("discarding corrupt segment in FIN_SENT");
                    continue;
                }
                let seg = Segment::decode(&buf).unwrap();
                if seg.is_ack() && seg.ack == next_seq {
                    return Ok((next_seq, next_expected_peer_seq));
                }
            }
        }
    }
}

/// TIME_WAIT: block for the peer's FIN, ACK it, then quietly wait a fixed
/// 3 seconds — re-ACKing any duplicate FIN the peer retransmits — before
/// closing. The 3-second deadline is absolute: time spent servicing
/// duplicate FINs counts against it.
fn time_wait(
    socket: &UdpSocket,
    waiter: &Waiter,
    cfg: &SenderConfig,
    peer: SocketAddrV4,
    next_seq: u32,
    next_expected_peer_seq: u32,
) -> Result<()> {
    loop {
        let buf = recv_blocking(socket)?;
        if !Segment::is_valid(&buf) {
            continue;
        }
        let seg = Segment::decode(&buf).unwrap();
        if seg.seq == next_expected_peer_seq && seg.is_fin() {
            break;
        }
    }

    let ack = Segment::new(
        cfg.local_ack_port,
        cfg.peer_port,
        next_seq,
        next_expected_peer_seq.wrapping_add(1),
        FLAG_ACK,
        &[],
    );
    send(socket, peer, &ack)?;

    let deadline = Instant::now() + TIME_WAIT_BUDGET;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        let (outcome, _elapsed) = waiter.wait_or_recv(remaining)?;
        match outcome {
            Outcome::Timeout => return Ok(()),
            Outcome::Datagram(buf) => {
                if !Segment::is_valid(&buf) {
                    continue;
                }
                let seg = Segment::decode(&buf).unwrap();
                if seg.seq == next_expected_peer_seq && seg.is_fin() {
                    debug!("duplicate FIN during TIME_WAIT, re-ACKing");
                    send(socket, peer, &ack)?;
                }
            }
        }
    }
}
