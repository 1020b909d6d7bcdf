//! Deadline-bounded "receive a datagram or time out" primitive.
//!
//! The original C implementation used `SIGALRM`/`ualarm` to interrupt a
//! blocking `recvfrom`. That mechanism is signal plumbing in service of a
//! simple abstract need: wait for a datagram up to a deadline, and report
//! how much of the deadline is left over. Here that's a non-blocking
//! readiness check (`nix::poll::poll` on the socket's raw fd) followed by a
//! non-blocking `recv_from` — no signal handler, no alarm, nothing exposed
//! to the state machines beyond `Outcome`.

use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};

use crate::err::Result;
use crate::segment::MAX_DATAGRAM;

pub enum Outcome {
    Datagram(Vec<u8>),
    Timeout,
}

/// Borrows a socket for the duration of a wait. Read-only: it never sends.
pub struct Waiter<'a> {
    socket: &'a UdpSocket,
}

impl<'a> Waiter<'a> {
    pub fn new(socket: &'a UdpSocket) -> Self {
        Waiter { socket }
    }

    /// Waits up to `budget` for a datagram. Returns the datagram (or a
    /// timeout) together with the wall time actually spent, so the caller
    /// can compute `time_remaining = budget - elapsed` and resume a partial
    /// wait on the next call.
    pub fn wait_or_recv(&self, budget: Duration) -> Result<(Outcome, Duration)> {
        let started = Instant::now();
        let millis = i32::try_from(budget.as_millis()).unwrap_or(i32::MAX);

        let mut fds = [PollFd::new(self.socket.as_raw_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, millis).map_err(std::io::Error::from)?;

        if ready == 0 {
            return Ok((Outcome::Timeout, started.elapsed()));
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _src)) => Ok((Outcome::Datagram(buf[..len].to_vec()), started.elapsed())),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Ok((Outcome::Timeout, started.elapsed()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Blocks indefinitely for the next datagram. Used only for the two
/// genuinely unbounded waits: the receiver's initial LISTEN and its
/// in-data blocking receive.
pub fn recv_blocking(socket: &UdpSocket) -> Result<Vec<u8>> {
    let mut buf = [0u8; MAX_DATAGRAM];
    let (len, _src) = socket.recv_from(&mut buf)?;
    Ok(buf[..len].to_vec())
}
