//! Wire format of the DigiQuartz ASCII command set.
//!
//! Host to device: `*<dest><src><mnemonic>[=<value>]\r\n`, where destination and
//! source are two decimal digits each (`*0100MN` asks unit 01 for its model).
//! Settings that live in EEPROM are written through an `EW` wrapper:
//! `*0100EW*0100IA=6\r\n`.
//!
//! Device to host: `*0001<mnemonic>=<value>\r\n` for command responses, and
//! `*0001<tag><payload>\r\n` for continuous-mode samples.

use std::fmt;

pub const TERMINATOR: &[u8] = b"\r\n";

pub const MODEL_NUMBER: &str = "MN";
pub const SERIAL_NUMBER: &str = "SN";
pub const START_CONTINUOUS: &str = "P4";
pub const EEPROM_WRITE: &str = "EW";
pub const CLOCK: &str = "GR";
pub const SAMPLE_RATE: &str = "TH";
pub const ANTI_ALIAS: &str = "IA";

// '*' plus four address digits plus a two-character tag.
const HEADER_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame is not valid ASCII")]
    NotAscii,

    #[error("frame does not start with '*': {0:?}")]
    MissingStart(String),

    #[error("frame is too short: {0:?}")]
    Truncated(String),

    #[error("invalid address in frame: {0:?}")]
    BadAddress(String),

    #[error("invalid mnemonic in frame: {0:?}")]
    BadMnemonic(String),

    #[error("response has no '=' separator: {0:?}")]
    MissingValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub destination: u8,
    pub source: u8,
}

impl Address {
    pub const HOST_TO_DEVICE: Self = Self {
        destination: 1,
        source: 0,
    };
    #[cfg(test)]
    pub const DEVICE_TO_HOST: Self = Self {
        destination: 0,
        source: 1,
    };

    fn parse(raw: &str) -> Result<Self, CodecError> {
        let bad = || CodecError::BadAddress(raw.to_string());
        if raw.len() != 4 || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(bad());
        }
        let destination = raw[..2].parse().map_err(|_| bad())?;
        let source = raw[2..].parse().map_err(|_| bad())?;
        Ok(Self {
            destination,
            source,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}{:02}", self.destination, self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub address: Address,
    pub mnemonic: String,
    pub value: Option<String>,
    // Wrap in an EEPROM-write (`EW`) prefix.
    pub write_enable: bool,
}

impl Command {
    pub fn query(mnemonic: &str) -> Self {
        Self {
            address: Address::HOST_TO_DEVICE,
            mnemonic: mnemonic.to_string(),
            value: None,
            write_enable: false,
        }
    }

    pub fn write(mnemonic: &str, value: &str) -> Self {
        Self {
            address: Address::HOST_TO_DEVICE,
            mnemonic: mnemonic.to_string(),
            value: Some(value.to_string()),
            write_enable: true,
        }
    }

    // Text form without the terminator, as echoed in verbose output.
    pub fn text(&self) -> String {
        let mut out = String::new();
        if self.write_enable {
            out.push_str(&format!("*{}{}", self.address, EEPROM_WRITE));
        }
        out.push_str(&format!("*{}{}", self.address, self.mnemonic));
        if let Some(value) = &self.value {
            out.push('=');
            out.push_str(value);
        }
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.text().into_bytes();
        bytes.extend_from_slice(TERMINATOR);
        bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub address: Address,
    pub key: String,
    pub value: String,
}

// The host never sends responses; the simulated barometer does.
#[cfg(test)]
impl Response {
    pub fn encode(&self) -> Vec<u8> {
        format!("*{}{}={}\r\n", self.address, self.key, self.value).into_bytes()
    }
}

pub fn decode_response(frame: &[u8]) -> Result<Response, CodecError> {
    let text = frame_text(frame)?;
    let (address, key, rest) = split_header(text)?;
    let value = rest
        .strip_prefix('=')
        .ok_or_else(|| CodecError::MissingValue(text.to_string()))?;
    Ok(Response {
        address,
        key: key.to_string(),
        value: value.to_string(),
    })
}

// Inverse of `Command::encode`, used by the simulated barometer.
#[cfg(test)]
pub fn decode_command(frame: &[u8]) -> Result<Command, CodecError> {
    let text = frame_text(frame)?;
    let (address, mnemonic, rest) = split_header(text)?;

    if mnemonic == EEPROM_WRITE && rest.starts_with('*') {
        let inner = decode_command(rest.as_bytes())?;
        return Ok(Command {
            write_enable: true,
            ..inner
        });
    }

    let value = if rest.is_empty() {
        None
    } else {
        let value = rest
            .strip_prefix('=')
            .ok_or_else(|| CodecError::MissingValue(text.to_string()))?;
        Some(value.to_string())
    };
    Ok(Command {
        address,
        mnemonic: mnemonic.to_string(),
        value,
        write_enable: false,
    })
}

// Strip the sample header and terminator, leaving the device-native record.
pub fn decode_sample(frame: &[u8]) -> Result<String, CodecError> {
    let text = frame_text(frame)?;
    if !text.starts_with('*') {
        return Err(CodecError::MissingStart(text.to_string()));
    }
    if text.len() <= HEADER_LEN {
        return Err(CodecError::Truncated(text.to_string()));
    }
    Address::parse(&text[1..5])?;
    Ok(text[HEADER_LEN..].to_string())
}

fn frame_text(frame: &[u8]) -> Result<&str, CodecError> {
    if !frame.is_ascii() {
        return Err(CodecError::NotAscii);
    }
    let text = std::str::from_utf8(frame).map_err(|_| CodecError::NotAscii)?;
    Ok(text.trim_end_matches(['\r', '\n']))
}

fn split_header(text: &str) -> Result<(Address, &str, &str), CodecError> {
    let body = text
        .strip_prefix('*')
        .ok_or_else(|| CodecError::MissingStart(text.to_string()))?;
    if body.len() < 6 {
        return Err(CodecError::Truncated(text.to_string()));
    }
    let address = Address::parse(&body[..4])?;
    let mnemonic = &body[4..6];
    if !mnemonic.bytes().all(|byte| byte.is_ascii_alphanumeric()) {
        return Err(CodecError::BadMnemonic(text.to_string()));
    }
    Ok((address, mnemonic, &body[6..]))
}
