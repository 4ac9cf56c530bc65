// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Lifecycle protocol endpoint, grounded on
//! `misc/services/life_mngr/life_mngr.c` (legacy two-word vocabulary) and
//! its Windows counterpart (the newer `req_sys_shutdown`/`user_vm_shutdown`/
//! `poweroff_cmd` vocabulary). Both speak a newline-framed plaintext
//! handshake over a serial TTY or a TCP socket: the host side requests a
//! shutdown/reboot, the guest-side agent acknowledges, and the host retries
//! up to `MAX_RETRIES` times at `RETRY_INTERVAL` apart before giving up.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

pub const MAX_RETRIES: u32 = 3;
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Serial lifecycle traffic conventionally rides these two ports (spec.md
/// §6): one for host->guest requests, one for guest->host acks.
pub const REQUEST_PORT: u16 = 0x2000;
pub const ACK_PORT: u16 = 0x2001;

#[derive(Debug)]
pub enum LifecycleError {
    Io(io::Error),
    UnexpectedMessage(String),
    RetriesExhausted,
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::Io(e) => write!(f, "lifecycle transport I/O error: {e}"),
            LifecycleError::UnexpectedMessage(m) => write!(f, "unexpected lifecycle message: {m:?}"),
            LifecycleError::RetriesExhausted => write!(f, "guest did not acknowledge within {MAX_RETRIES} retries"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<io::Error> for LifecycleError {
    fn from(e: io::Error) -> Self {
        LifecycleError::Io(e)
    }
}

/// Which wire vocabulary this endpoint speaks. The Windows vocabulary is
/// the canonical default (newer superset); the legacy vocabulary remains
/// available for the older life_mngr.c-speaking guest agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    Windows,
    Legacy,
}

impl Vocabulary {
    fn shutdown_request(self) -> &'static str {
        match self {
            Vocabulary::Windows => "req_sys_shutdown",
            Vocabulary::Legacy => "shutdown",
        }
    }

    fn shutdown_ack(self) -> &'static str {
        match self {
            Vocabulary::Windows => "ack_req_sys_shutdown",
            Vocabulary::Legacy => "acked",
        }
    }

    fn user_vm_shutdown_request(self) -> &'static str {
        match self {
            Vocabulary::Windows => "user_vm_shutdown",
            Vocabulary::Legacy => "shutdown",
        }
    }

    fn user_vm_shutdown_ack(self) -> &'static str {
        match self {
            Vocabulary::Windows => "ack_user_vm_shutdown",
            Vocabulary::Legacy => "acked",
        }
    }

    fn poweroff_request(self) -> &'static str {
        match self {
            Vocabulary::Windows => "poweroff_cmd",
            Vocabulary::Legacy => "shutdown",
        }
    }

    fn poweroff_ack(self) -> &'static str {
        match self {
            Vocabulary::Windows => "ack_poweroff",
            Vocabulary::Legacy => "acked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleRequest {
    ReqSysShutdown,
    UserVmShutdown,
    Poweroff,
}

impl LifecycleRequest {
    fn request_word(self, vocab: Vocabulary) -> &'static str {
        match self {
            LifecycleRequest::ReqSysShutdown => vocab.shutdown_request(),
            LifecycleRequest::UserVmShutdown => vocab.user_vm_shutdown_request(),
            LifecycleRequest::Poweroff => vocab.poweroff_request(),
        }
    }

    fn ack_word(self, vocab: Vocabulary) -> &'static str {
        match self {
            LifecycleRequest::ReqSysShutdown => vocab.shutdown_ack(),
            LifecycleRequest::UserVmShutdown => vocab.user_vm_shutdown_ack(),
            LifecycleRequest::Poweroff => vocab.poweroff_ack(),
        }
    }
}

/// Guest-side agent state machine, mirrored here so the host endpoint can
/// simulate/validate a peer in tests without a real guest attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    ReqWaiting,
    AckWaiting,
    ReqFromService,
    ReqFromGuest,
}

/// A lifecycle transport is anything line-framed that can carry the
/// handshake: a serial TTY file or a `TcpStream`, both already
/// `Read + Write`.
pub trait Transport: Read + Write {}
impl Transport for TcpStream {}
impl Transport for std::fs::File {}

pub struct LifecycleEndpoint<T: Transport> {
    transport: BufReader<T>,
    vocab: Vocabulary,
}

impl<T: Transport> LifecycleEndpoint<T> {
    pub fn new(transport: T, vocab: Vocabulary) -> Self {
        LifecycleEndpoint {
            transport: BufReader::new(transport),
            vocab,
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), LifecycleError> {
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        self.transport.get_mut().write_all(framed.as_bytes())?;
        self.transport.get_mut().flush()?;
        Ok(())
    }

    fn recv_line(&mut self) -> Result<String, LifecycleError> {
        let mut buf = String::new();
        self.transport.read_line(&mut buf)?;
        Ok(buf.trim_end_matches(['\n', '\r']).to_string())
    }

    /// Host-side: sends the request word, waits for the ack word, retrying
    /// up to `MAX_RETRIES` times if nothing (or the wrong thing) arrives.
    /// Matches `life_mngr.c`'s host loop: request, wait, retry up to 3
    /// times at a >=2s interval, then give up.
    pub fn request_and_wait_ack(&mut self, request: LifecycleRequest) -> Result<(), LifecycleError> {
        let req_word = request.request_word(self.vocab);
        let ack_word = request.ack_word(self.vocab);
        for attempt in 0..=MAX_RETRIES {
            self.send_line(req_word)?;
            match self.recv_line() {
                Ok(line) if line == ack_word => return Ok(()),
                _ if attempt == MAX_RETRIES => return Err(LifecycleError::RetriesExhausted),
                _ => {
                    std::thread::sleep(RETRY_INTERVAL);
                    continue;
                }
            }
        }
        Err(LifecycleError::RetriesExhausted)
    }

    /// Guest-side: waits for a request word, replies with the ack word.
    pub fn wait_request_and_ack(&mut self, request: LifecycleRequest) -> Result<(), LifecycleError> {
        let req_word = request.request_word(self.vocab);
        let ack_word = request.ack_word(self.vocab);
        let line = self.recv_line()?;
        if line != req_word {
            return Err(LifecycleError::UnexpectedMessage(line));
        }
        self.send_line(ack_word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// An in-memory duplex pipe good enough to exercise the framing logic
    /// without a real socket or TTY.
    struct LoopbackPipe {
        inbound: Cursor<Vec<u8>>,
        outbound: Vec<u8>,
    }

    impl Read for LoopbackPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inbound.read(buf)
        }
    }
    impl Write for LoopbackPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl Transport for LoopbackPipe {}

    #[test]
    fn guest_side_acks_matching_request() {
        let pipe = LoopbackPipe {
            inbound: Cursor::new(b"req_sys_shutdown\n".to_vec()),
            outbound: Vec::new(),
        };
        let mut ep = LifecycleEndpoint::new(pipe, Vocabulary::Windows);
        ep.wait_request_and_ack(LifecycleRequest::ReqSysShutdown).unwrap();
        assert_eq!(ep.transport.get_ref().outbound, b"ack_req_sys_shutdown\n");
    }

    #[test]
    fn guest_side_rejects_mismatched_request() {
        let pipe = LoopbackPipe {
            inbound: Cursor::new(b"poweroff_cmd\n".to_vec()),
            outbound: Vec::new(),
        };
        let mut ep = LifecycleEndpoint::new(pipe, Vocabulary::Windows);
        let res = ep.wait_request_and_ack(LifecycleRequest::ReqSysShutdown);
        assert!(matches!(res, Err(LifecycleError::UnexpectedMessage(_))));
    }

    #[test]
    fn legacy_vocabulary_uses_shutdown_acked_words() {
        let pipe = LoopbackPipe {
            inbound: Cursor::new(b"shutdown\n".to_vec()),
            outbound: Vec::new(),
        };
        let mut ep = LifecycleEndpoint::new(pipe, Vocabulary::Legacy);
        ep.wait_request_and_ack(LifecycleRequest::UserVmShutdown).unwrap();
        assert_eq!(ep.transport.get_ref().outbound, b"acked\n");
    }

    #[test]
    fn host_side_succeeds_on_first_correct_ack() {
        let pipe = LoopbackPipe {
            inbound: Cursor::new(b"ack_poweroff\n".to_vec()),
            outbound: Vec::new(),
        };
        let mut ep = LifecycleEndpoint::new(pipe, Vocabulary::Windows);
        ep.request_and_wait_ack(LifecycleRequest::Poweroff).unwrap();
        assert_eq!(ep.transport.get_ref().outbound, b"poweroff_cmd\n");
    }
}
