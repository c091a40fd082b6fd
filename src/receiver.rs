//! The receiver core (§4.5): a read loop over a fixed-size buffer with a
//! sliding accepted-to cursor. Each read appends to the tail; the
//! unaccepted region is offered to a frontend that decides how much of it
//! it has consumed.

use std::io::{self, Read};

use crate::error::{Error, InternalKind, Result};

/// What the frontend did with the bytes it was offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendAction {
    /// Consumed everything offered; reset and keep reading.
    Normal,
    /// Consumed `accepted` bytes but wants more before it can make
    /// progress (e.g. a partial frame).
    Again,
    /// The frontend rejected the input; propagate as an error.
    Error,
    /// Consumed `accepted` bytes and wants the read loop to stop for now
    /// (backpressure).
    InputBlocked,
}

pub struct FrontendResponse {
    pub action: FrontendAction,
    pub accepted: usize,
}

pub trait Frontend {
    /// Offered `buf`; returns how it wants to proceed and how many leading
    /// bytes of `buf` it consumed.
    fn process_input(&mut self, buf: &[u8]) -> FrontendResponse;

    /// Delivered once, after any buffered bytes have been offered, when the
    /// peer has closed its write half.
    fn process_eof(&mut self) {}

    fn process_error(&mut self, _err: &Error) {}
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiverConfig {
    pub buf_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> ReceiverConfig {
        ReceiverConfig { buf_size: 65536 }
    }
}

/// Drives one connection's inbound half. Not `Sync`; owned by the thread
/// context that polls the connection's fd.
pub struct Receiver {
    buf: Vec<u8>,
    buf_pos: usize,
    accepted_pos: usize,
    error_reported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The read loop stopped because the socket would block; re-arm input
    /// interest and wait for the next readiness event.
    WouldBlock,
    /// The frontend asked to stop for now (`InputBlocked`).
    InputBlocked,
    /// The peer closed its write half; no more reads will occur.
    Eof,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Receiver {
        Receiver {
            buf: vec![0u8; config.buf_size],
            buf_pos: 0,
            accepted_pos: 0,
            error_reported: false,
        }
    }

    /// Reads as much as is available from `reader`, offering newly-read
    /// bytes (plus any carried-over unaccepted tail) to `frontend` after
    /// each read, until the socket blocks, EOF is reached, or the frontend
    /// asks to stop.
    pub fn read_loop<R: Read>(&mut self, reader: &mut R, frontend: &mut dyn Frontend) -> Result<ReadOutcome> {
        loop {
            if self.buf_pos == self.buf.len() {
                return Err(Error::internal(InternalKind::IncorrectUsage(
                    "receive buffer full but frontend still wants more input".into(),
                )));
            }

            let n = match reader.read(&mut self.buf[self.buf_pos..]) {
                Ok(0) => {
                    self.offer_remaining(frontend)?;
                    frontend.process_eof();
                    return Ok(ReadOutcome::Eof);
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = Error::from(e);
                    self.report_error(frontend, &err);
                    return Err(err);
                }
            };

            self.buf_pos += n;

            match self.offer(frontend)? {
                Some(outcome) => return Ok(outcome),
                None => continue,
            }
        }
    }

    fn offer(&mut self, frontend: &mut dyn Frontend) -> Result<Option<ReadOutcome>> {
        let response = frontend.process_input(&self.buf[self.accepted_pos..self.buf_pos]);

        match response.action {
            FrontendAction::Normal => {
                self.buf_pos = 0;
                self.accepted_pos = 0;
                Ok(None)
            }
            FrontendAction::Again => {
                self.accepted_pos += response.accepted;
                self.compact_if_half_full();
                Ok(None)
            }
            FrontendAction::InputBlocked => {
                self.accepted_pos += response.accepted;
                self.compact_if_half_full();
                Ok(Some(ReadOutcome::InputBlocked))
            }
            FrontendAction::Error => {
                let err = Error::internal(InternalKind::FrontendError);
                self.report_error(frontend, &err);
                Err(err)
            }
        }
    }

    fn offer_remaining(&mut self, frontend: &mut dyn Frontend) -> Result<()> {
        if self.accepted_pos < self.buf_pos {
            self.offer(frontend)?;
        }
        Ok(())
    }

    fn compact_if_half_full(&mut self) {
        if self.accepted_pos * 2 >= self.buf.len() {
            self.buf.copy_within(self.accepted_pos..self.buf_pos, 0);
            self.buf_pos -= self.accepted_pos;
            self.accepted_pos = 0;
        }
    }

    fn report_error(&mut self, frontend: &mut dyn Frontend, err: &Error) {
        if !self.error_reported {
            self.error_reported = true;
            frontend.process_error(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct EchoFrontend {
        collected: Vec<u8>,
    }

    impl Frontend for EchoFrontend {
        fn process_input(&mut self, buf: &[u8]) -> FrontendResponse {
            self.collected.extend_from_slice(buf);
            FrontendResponse { action: FrontendAction::Normal, accepted: buf.len() }
        }
    }

    #[test]
    fn normal_action_resets_cursors_and_keeps_reading() {
        let mut receiver = Receiver::new(ReceiverConfig { buf_size: 16 });
        let mut reader = Cursor::new(b"hello".to_vec());
        let mut frontend = EchoFrontend { collected: Vec::new() };

        let outcome = receiver.read_loop(&mut reader, &mut frontend).unwrap();
        assert_eq!(outcome, ReadOutcome::Eof);
        assert_eq!(frontend.collected, b"hello");
    }

    /// Consumes complete 3-byte frames and leaves a short tail pending,
    /// mimicking a frontend that needs more bytes before it can make
    /// progress on the next frame.
    struct FramingFrontend {
        frames: Vec<Vec<u8>>,
    }

    impl Frontend for FramingFrontend {
        fn process_input(&mut self, buf: &[u8]) -> FrontendResponse {
            let whole_frames = buf.len() / 3;
            for chunk in buf[..whole_frames * 3].chunks(3) {
                self.frames.push(chunk.to_vec());
            }
            FrontendResponse { action: FrontendAction::Again, accepted: whole_frames * 3 }
        }
    }

    #[test]
    fn again_action_leaves_a_partial_frame_for_the_next_read() {
        let mut receiver = Receiver::new(ReceiverConfig { buf_size: 64 });
        let mut reader = Cursor::new(b"abcdefgh".to_vec());
        let mut frontend = FramingFrontend { frames: Vec::new() };

        let outcome = receiver.read_loop(&mut reader, &mut frontend).unwrap();
        assert_eq!(outcome, ReadOutcome::Eof);
        assert_eq!(frontend.frames, vec![b"abc".to_vec(), b"def".to_vec()]);
    }

    struct BlockingFrontend;

    impl Frontend for BlockingFrontend {
        fn process_input(&mut self, buf: &[u8]) -> FrontendResponse {
            FrontendResponse { action: FrontendAction::InputBlocked, accepted: buf.len().min(1) }
        }
    }

    #[test]
    fn input_blocked_stops_the_read_loop() {
        let mut receiver = Receiver::new(ReceiverConfig { buf_size: 8 });
        let mut reader = Cursor::new(b"abcdefgh".to_vec());
        let mut frontend = BlockingFrontend;

        let outcome = receiver.read_loop(&mut reader, &mut frontend).unwrap();
        assert_eq!(outcome, ReadOutcome::InputBlocked);
    }

    struct RejectingFrontend;

    impl Frontend for RejectingFrontend {
        fn process_input(&mut self, _buf: &[u8]) -> FrontendResponse {
            FrontendResponse { action: FrontendAction::Error, accepted: 0 }
        }
    }

    #[test]
    fn error_action_surfaces_once() {
        let mut receiver = Receiver::new(ReceiverConfig { buf_size: 8 });
        let mut reader = Cursor::new(b"x".to_vec());
        let mut frontend = RejectingFrontend;

        let err = receiver.read_loop(&mut reader, &mut frontend).unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::Internal(InternalKind::FrontendError)));
    }
}
