use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("transport is closed")]
    Closed,
}

// Byte-level channel to one device. A read that times out is not an error: it returns 0.
pub trait Transport {
    // Read whatever is available, waiting at most `max_wait`. Returns 0 on timeout.
    fn read(&mut self, buf: &mut [u8], max_wait: Duration) -> Result<usize, TransportError>;

    // Queue bytes for transmission. Returns once they are handed to the driver.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    // Release the underlying handle. Calling it twice is harmless.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8], max_wait: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, max_wait)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(bytes)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

// Serial line settings. Barometers always talk 115200 8N1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineParams {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub timeout: Duration,
}

impl LineParams {
    pub fn barometer(timeout: Duration) -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout,
        }
    }
}

// Opens transports by port name. Discovery goes through this so tests can hand out
// simulated devices.
pub trait PortOpener {
    fn open(
        &mut self,
        port: &str,
        params: &LineParams,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(
        &mut self,
        port: &str,
        params: &LineParams,
    ) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(SerialTransport::open(port, params)?))
    }
}

pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

impl SerialTransport {
    pub fn open(port: &str, params: &LineParams) -> Result<Self, TransportError> {
        let serial = serialport::new(port, params.baud_rate)
            .data_bits(params.data_bits)
            .parity(params.parity)
            .stop_bits(params.stop_bits)
            .timeout(params.timeout)
            .open()?;
        Ok(Self {
            port: Some(serial),
            timeout: params.timeout,
        })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8], max_wait: Duration) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        // Only touch the driver when the wait budget actually changes.
        if max_wait != self.timeout {
            port.set_timeout(max_wait)?;
            self.timeout = max_wait;
        }
        match port.read(buf) {
            Ok(size) => Ok(size),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}
