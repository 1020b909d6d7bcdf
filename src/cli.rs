//! Argument parsing and validation for the two binaries. Parsing happens
//! in two stages: `clap` turns `argv` into plain strings/integers with no
//! domain-specific validation attached, then `into_config` re-validates
//! every constraint `spec.md` calls out — port ranges, minimum window
//! size, dotted-quad addresses — and turns the result into the state
//! machines' config structs. Keeping that validation out of `clap`'s own
//! `value_parser`s matters: a `value_parser` failure makes `clap` print its
//! own multi-line diagnostic and exit directly, bypassing this crate's
//! `Error`/one-line-diagnostic/exit-1 contract entirely. Nothing is opened
//! — no socket, no file handle — until `into_config` succeeds.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

use crate::err::{Error, Result};
use crate::receiver::ReceiverConfig;
use crate::segment::MSS;
use crate::sender::SenderConfig;

fn validate_port(raw: u32, field: &str) -> Result<u16> {
    if (1024..=65535).contains(&raw) {
        Ok(raw as u16)
    } else {
        Err(Error::InvalidArgument(format!(
            "{field} {raw} is outside the valid range 1024-65535"
        )))
    }
}

fn validate_window_bytes(raw: u32) -> Result<u32> {
    if raw as usize >= MSS {
        Ok(raw)
    } else {
        Err(Error::InvalidArgument(format!(
            "window size must be at least {MSS} bytes, got {raw}"
        )))
    }
}

fn validate_ipv4(raw: &str, field: &str) -> Result<Ipv4Addr> {
    raw.parse::<Ipv4Addr>()
        .map_err(|_| Error::InvalidArgument(format!("'{raw}' is not a valid IPv4 address for {field}")))
}

/// `<prog> <file> <peerAddr> <peerPort> <windowBytes> <localAckPort>`
#[derive(Parser, Debug)]
#[command(name = "sender", about = "Sends a file reliably over a lossy UDP channel")]
pub struct SenderArgs {
    pub file: PathBuf,
    pub peer_addr: String,
    pub peer_port: u32,
    pub window_bytes: u32,
    pub local_ack_port: u32,
}

impl SenderArgs {
    pub fn into_config(self) -> Result<SenderConfig> {
        if !self.file.is_file() {
            return Err(Error::InvalidArgument(format!(
                "file '{}' does not exist or is not readable",
                self.file.display()
            )));
        }
        let peer_addr = validate_ipv4(&self.peer_addr, "peerAddr")?;
        let peer_port = validate_port(self.peer_port, "peerPort")?;
        let window_bytes = validate_window_bytes(self.window_bytes)?;
        let local_ack_port = validate_port(self.local_ack_port, "localAckPort")?;
        Ok(SenderConfig {
            file: self.file,
            peer_addr,
            peer_port,
            window_bytes,
            local_ack_port,
        })
    }
}

/// `<prog> <file> <listenPort> <peerAckAddr> <peerAckPort>`
#[derive(Parser, Debug)]
#[command(name = "receiver", about = "Receives a file reliably over a lossy UDP channel")]
pub struct ReceiverArgs {
    pub file: PathBuf,
    pub listen_port: u32,
    pub peer_ack_addr: String,
    pub peer_ack_port: u32,
}

impl ReceiverArgs {
    pub fn into_config(self) -> Result<ReceiverConfig> {
        let listen_port = validate_port(self.listen_port, "listenPort")?;
        let peer_ack_addr = validate_ipv4(&self.peer_ack_addr, "peerAckAddr")?;
        let peer_ack_port = validate_port(self.peer_ack_port, "peerAckPort")?;
        Ok(ReceiverConfig {
            file: self.file,
            listen_port,
            peer_ack_addr,
            peer_ack_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ports_below_1024() {
        assert!(validate_port(80, "port").is_err());
    }

    #[test]
    fn rejects_ports_above_65535() {
        assert!(validate_port(70_000, "port").is_err());
    }

    #[test]
    fn accepts_ports_in_range() {
        assert_eq!(validate_port(9090, "port").unwrap(), 9090);
    }

    #[test]
    fn rejects_window_sizes_below_one_segment() {
        assert!(validate_window_bytes(575).is_err());
    }

    #[test]
    fn accepts_window_size_equal_to_one_segment() {
        assert_eq!(validate_window_bytes(576).unwrap(), 576);
    }

    #[test]
    fn rejects_malformed_ipv4_addresses() {
        assert!(validate_ipv4("not-an-ip", "peerAddr").is_err());
    }

    #[test]
    fn accepts_dotted_quad_addresses() {
        assert_eq!(validate_ipv4("127.0.0.1", "peerAddr").unwrap(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn sender_args_reject_a_missing_file() {
        let args = SenderArgs {
            file: PathBuf::from("/does/not/exist"),
            peer_addr: "127.0.0.1".to_string(),
            peer_port: 9090,
            window_bytes: 1152,
            local_ack_port: 9091,
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn sender_args_reject_an_out_of_range_port_without_panicking() {
        let args = SenderArgs {
            file: PathBuf::from("Cargo.toml"),
            peer_addr: "127.0.0.1".to_string(),
            peer_port: 80,
            window_bytes: 1152,
            local_ack_port: 9091,
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn receiver_args_reject_a_malformed_peer_address() {
        let args = ReceiverArgs {
            file: PathBuf::from("/tmp/out"),
            listen_port: 9090,
            peer_ack_addr: "not-an-ip".to_string(),
            peer_ack_port: 9091,
        };
        assert!(args.into_config().is_err());
    }
}
