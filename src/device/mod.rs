// One barometer on one serial link: identity, transport, lifecycle and failure bookkeeping.
pub mod codec;
pub mod framer;
#[cfg(test)]
pub mod sim;
pub mod transport;

use codec::{CodecError, Command, Response};
use framer::LineFramer;
use std::fmt;
use std::time::{Duration, Instant};
use transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Discovering,
    Configuring,
    Sampling,
    Failed,
    Stopped,
}

impl DeviceState {
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, next),
            (Discovering, Configuring)
                | (Discovering, Failed)
                | (Configuring, Sampling)
                | (Configuring, Failed)
                | (Sampling, Failed)
                | (Sampling, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeviceState::Failed | DeviceState::Stopped)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceState::Discovering => "discovering",
            DeviceState::Configuring => "configuring",
            DeviceState::Sampling => "sampling",
            DeviceState::Failed => "failed",
            DeviceState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("no {key} response within {waited:?}")]
    NoResponse { key: String, waited: Duration },

    #[error("fixed setting(s) differ from factory configuration: {}", .0.join(", "))]
    FixedSettingMismatch(Vec<String>),

    #[error("writing {key}={expected} was not confirmed, device reports {key}={actual}")]
    WriteNotConfirmed {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("setting {key} has unreadable value {value:?}")]
    BadSetting { key: String, value: String },

    #[error("sample rate {rate} Hz is under twice the IA={anti_alias} cutoff of {cutoff_hz} Hz")]
    Nyquist {
        rate: u32,
        anti_alias: u32,
        cutoff_hz: f64,
    },

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: DeviceState, to: DeviceState },
}

pub struct Device {
    serial_number: String,
    port: String,
    link: LineFramer<Box<dyn Transport>>,
    state: DeviceState,
    consecutive_failures: u32,
    samples: u64,
}

impl Device {
    pub fn new(port: &str, transport: Box<dyn Transport>) -> Self {
        Self {
            serial_number: String::new(),
            port: port.to_string(),
            link: LineFramer::new(transport),
            state: DeviceState::Discovering,
            consecutive_failures: 0,
            samples: 0,
        }
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn set_serial_number(&mut self, serial_number: &str) {
        self.serial_number = serial_number.to_string();
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    // Move to `next`, closing the transport when the state is terminal.
    pub fn transition(&mut self, next: DeviceState) -> Result<(), DeviceError> {
        if !self.state.can_transition_to(next) {
            return Err(DeviceError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!("{} [{}]: {} -> {}", self.label(), self.port, self.state, next);
        self.state = next;
        if next.is_terminal() {
            self.link.close();
        }
        Ok(())
    }

    // Terminal failure from whatever state we are in; a device that already failed stays failed.
    pub fn fail(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = DeviceState::Failed;
        self.link.close();
    }

    // Record a read timeout and return the new consecutive count.
    pub fn record_timeout(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    pub fn record_frame(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_sample(&mut self) {
        self.samples += 1;
    }

    // Fire-and-forget command; used for P4 and the stop command.
    pub fn send(&mut self, command: &Command) -> Result<(), DeviceError> {
        log::debug!("{} command: {}", self.label(), command.text());
        self.link.write_all(&command.encode())?;
        Ok(())
    }

    // Send a command and wait for the response carrying the same key.
    // Frames for other keys (stale samples, echoes) are skipped until `timeout` runs out.
    pub fn query(&mut self, command: &Command, timeout: Duration) -> Result<Response, DeviceError> {
        let dropped = self.link.discard_pending();
        if dropped > 0 {
            log::debug!("{} dropped {} stale bytes before query", self.label(), dropped);
        }
        self.send(command)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(frame) = self.link.read_frame(remaining)? else {
                return Err(DeviceError::NoResponse {
                    key: command.mnemonic.clone(),
                    waited: timeout,
                });
            };
            match decode_resynced(&frame) {
                Ok(response) if response.key == command.mnemonic => {
                    log::debug!(
                        "{} response: {}={}",
                        self.label(),
                        response.key,
                        response.value
                    );
                    return Ok(response);
                }
                Ok(other) => {
                    log::debug!("{} ignoring {} response", self.label(), other.key);
                }
                Err(err) => {
                    log::debug!("{} ignoring frame: {}", self.label(), err);
                }
            }
        }
    }

    // One framed read bounded by `max_wait`. `None` means the wait ran out.
    pub fn read_frame(&mut self, max_wait: Duration) -> Result<Option<Vec<u8>>, DeviceError> {
        Ok(self.link.read_frame(max_wait)?)
    }

    // Name used in console output: serial number once known, port before that.
    pub fn label(&self) -> &str {
        if self.serial_number.is_empty() {
            &self.port
        } else {
            &self.serial_number
        }
    }
}

// A cut-off frame left in the receive buffer can end up glued in front of a response.
// If the whole line does not decode, retry from the last start marker.
fn decode_resynced(frame: &[u8]) -> Result<Response, CodecError> {
    codec::decode_response(frame).or_else(|err| {
        match frame.iter().rposition(|&byte| byte == b'*') {
            Some(start) if start > 0 => codec::decode_response(&frame[start..]),
            _ => Err(err),
        }
    })
}
