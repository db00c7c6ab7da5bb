// In-memory DigiQuartz stand-in. Parses the commands written to it, answers from a
// settings table, and streams scripted samples once continuous mode is started.
// Clones share state so a test can keep a handle after boxing one into a Device.

use super::codec::{self, Address, Response};
use super::transport::{Transport, TransportError};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::Duration;

pub const MODEL: &str = "6000-16B-IS";

#[derive(Default)]
struct SimState {
    settings: BTreeMap<String, String>,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    commands: Vec<String>,
    eeprom_writes: Vec<String>,
    // `Some(payload)` yields a sample frame, `None` a read timeout.
    script: VecDeque<Option<String>>,
    rejected_writes: BTreeSet<String>,
    streaming: bool,
    mute: bool,
    unplugged: bool,
    closed: bool,
}

#[derive(Clone)]
pub struct SimBarometer {
    state: Rc<RefCell<SimState>>,
}

impl SimBarometer {
    // Factory-fresh unit already set up for 20 Hz with the 8 Hz filter.
    pub fn new(serial_number: &str) -> Self {
        let mut settings = BTreeMap::new();
        for (key, value) in [
            ("MN", MODEL),
            ("VR", "Q1.03"),
            ("XM", "1"),
            ("UN", "2"),
            ("MD", "0"),
            ("XN", "0"),
            ("TS", "1"),
            ("GE", "1"),
            ("TJ", "0"),
            ("TF", ".00"),
            ("TP", "0"),
            ("GT", "1"),
            ("GD", "0"),
            ("TH", "20,P4;>OK"),
            ("IA", "6"),
            ("GR", "01/01/18 00:00:00"),
        ] {
            settings.insert(key.to_string(), value.to_string());
        }
        settings.insert("SN".to_string(), serial_number.to_string());

        Self {
            state: Rc::new(RefCell::new(SimState {
                settings,
                ..SimState::default()
            })),
        }
    }

    pub fn with_setting(self, key: &str, value: &str) -> Self {
        self.state
            .borrow_mut()
            .settings
            .insert(key.to_string(), value.to_string());
        self
    }

    // Queue `count` good samples followed by nothing.
    pub fn with_samples(self, count: usize) -> Self {
        self.push_samples(count);
        self
    }

    pub fn push_samples(&self, count: usize) {
        let mut state = self.state.borrow_mut();
        for _ in 0..count {
            let idx = state.script.iter().filter(|entry| entry.is_some()).count();
            state
                .script
                .push_back(Some(format!("{:04} 1013.{:06}", idx, idx)));
        }
    }

    pub fn push_silence(&self, cycles: usize) {
        let mut state = self.state.borrow_mut();
        for _ in 0..cycles {
            state.script.push_back(None);
        }
    }

    // Bytes that are already waiting in the receive buffer, e.g. leftovers from a previous run.
    pub fn push_raw(&self, raw: &str) {
        self.state.borrow_mut().outbox.extend(raw.bytes());
    }

    pub fn reject_writes_to(&self, key: &str) {
        self.state
            .borrow_mut()
            .rejected_writes
            .insert(key.to_string());
    }

    pub fn set_mute(&self, mute: bool) {
        self.state.borrow_mut().mute = mute;
    }

    pub fn unplug(&self) {
        self.state.borrow_mut().unplugged = true;
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    pub fn count_commands(&self, text: &str) -> usize {
        self.state
            .borrow()
            .commands
            .iter()
            .filter(|command| command.as_str() == text)
            .count()
    }

    pub fn eeprom_writes(&self) -> Vec<String> {
        self.state.borrow().eeprom_writes.clone()
    }

    pub fn setting(&self, key: &str) -> Option<String> {
        self.state.borrow().settings.get(key).cloned()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.borrow().streaming
    }

    pub fn is_open(&self) -> bool {
        !self.state.borrow().closed
    }
}

impl SimState {
    fn handle_line(&mut self, line: &[u8]) {
        let Ok(command) = codec::decode_command(line) else {
            return;
        };
        self.commands.push(command.text());

        // Any command knocks the unit out of continuous mode.
        self.streaming = false;
        if command.mnemonic == codec::START_CONTINUOUS {
            self.streaming = true;
            return;
        }

        if command.write_enable {
            if let Some(value) = &command.value
                && !self.rejected_writes.contains(&command.mnemonic)
            {
                self.settings.insert(command.mnemonic.clone(), value.clone());
                self.eeprom_writes.push(command.text());
            }
        }

        if self.mute {
            return;
        }
        if let Some(value) = self.settings.get(&command.mnemonic) {
            let response = Response {
                address: Address::DEVICE_TO_HOST,
                key: command.mnemonic.clone(),
                value: value.clone(),
            };
            self.outbox.extend(response.encode());
        }
    }
}

impl Transport for SimBarometer {
    fn read(&mut self, buf: &mut [u8], _max_wait: Duration) -> Result<usize, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged").into());
        }

        if state.outbox.is_empty() && state.streaming {
            if let Some(Some(payload)) = state.script.pop_front() {
                let frame = format!("*0001P4{payload}\r\n");
                state.outbox.extend(frame.bytes());
            }
        }

        let size = state.outbox.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..size)) {
            *slot = byte;
        }
        Ok(size)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged").into());
        }
        state.inbox.extend_from_slice(bytes);
        while let Some(end) = state.inbox.windows(2).position(|pair| pair == b"\r\n") {
            let line: Vec<u8> = state.inbox.drain(..end + 2).collect();
            state.handle_line(&line);
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.streaming = false;
    }

    fn is_open(&self) -> bool {
        !self.state.borrow().closed
    }
}
