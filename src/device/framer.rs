use super::transport::{Transport, TransportError};
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 2_048;
// Longest run of bytes without a newline we are willing to hold on to.
const MAX_PENDING: usize = 4_096;

// Turns a timeout-only byte stream into newline-terminated frames.
// Bytes that arrive after a terminator stay in `pending` for the next call.
pub struct LineFramer<T: Transport> {
    transport: T,
    pending: Vec<u8>,
    scratch: Vec<u8>,
}

impl<T: Transport> LineFramer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pending: Vec::with_capacity(READ_CHUNK),
            scratch: vec![0_u8; READ_CHUNK],
        }
    }

    /// Return the next complete frame (terminator included), or `None` if no
    /// terminator showed up within `max_wait`. Only hard transport failures are errors.
    pub fn read_frame(&mut self, max_wait: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(frame) = self.take_frame() {
            return Ok(Some(frame));
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let size = self.transport.read(&mut self.scratch, remaining)?;
            if size == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&self.scratch[..size]);

            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }
            if self.pending.len() > MAX_PENDING {
                log::warn!(
                    "discarding {} bytes received without a line terminator",
                    self.pending.len()
                );
                self.pending.clear();
            }
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.transport.write_all(bytes)
    }

    // Drop anything buffered, e.g. stale samples left over before a configuration query.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn close(&mut self) {
        self.pending.clear();
        self.transport.close();
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&byte| byte == b'\n')?;
        let rest = self.pending.split_off(end + 1);
        Some(std::mem::replace(&mut self.pending, rest))
    }
}
