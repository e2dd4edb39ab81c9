//! Byte transports the serial reader runs on.

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::prelude::{LinkResult, SerialSettings};

/// Byte-level access to the radio modem.
pub trait RadioPort: Send {
    /// Reads available bytes. A read timeout is reported as `Ok(0)`.
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Discards anything received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Modem attached through an OS serial device.
pub struct SerialDevice {
    port: Box<dyn SerialPort>,
}

impl SerialDevice {
    /// Opens the device at 8N1 with no flow control.
    pub fn open(path: &str, settings: &SerialSettings) -> LinkResult<Self> {
        let port = serialport::new(path, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.read_timeout())
            .open()?;

        log::info!("Opened serial port {} at {} baud", path, settings.baud_rate);
        Ok(Self { port })
    }
}

impl RadioPort for SerialDevice {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

#[derive(Default)]
struct MemoryState {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    failure: Option<io::ErrorKind>,
}

/// In-memory modem used for simulation and tests.
///
/// The paired [`MemoryPortHandle`] injects received bytes and inspects what the
/// reader wrote.
pub struct MemoryPort {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Clone)]
pub struct MemoryPortHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryPort {
    pub fn new() -> (Self, MemoryPortHandle) {
        let state = Arc::new(Mutex::new(MemoryState::default()));
        (
            Self {
                state: state.clone(),
            },
            MemoryPortHandle { state },
        )
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory port poisoned"))
    }
}

impl RadioPort for MemoryPort {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock()?;
        if let Some(kind) = state.failure {
            return Err(io::Error::new(kind, "injected read failure"));
        }
        let count = buffer.len().min(state.incoming.len());
        for (slot, byte) in buffer.iter_mut().zip(state.incoming.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.lock()?.written.extend_from_slice(data);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.lock()?.incoming.clear();
        Ok(())
    }
}

impl MemoryPortHandle {
    pub fn push_bytes(&self, bytes: &[u8]) {
        if let Ok(mut state) = self.state.lock() {
            state.incoming.extend(bytes);
        }
    }

    /// Queues one modem line, CRLF-terminated.
    pub fn push_line(&self, line: &str) {
        self.push_bytes(line.as_bytes());
        self.push_bytes(b"\r\n");
    }

    /// Everything written to the port so far, lossily decoded.
    pub fn written(&self) -> String {
        self.state
            .lock()
            .map(|s| String::from_utf8_lossy(&s.written).into_owned())
            .unwrap_or_default()
    }

    pub fn pending_input(&self) -> usize {
        self.state.lock().map(|s| s.incoming.len()).unwrap_or(0)
    }

    /// Makes every later read fail with `kind`.
    pub fn fail_reads(&self, kind: io::ErrorKind) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = Some(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_port_round_trips_bytes() {
        let (mut port, handle) = MemoryPort::new();
        handle.push_line("+TEST: RX \"41\"");

        let mut buffer = [0u8; 64];
        let n = port.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"+TEST: RX \"41\"\r\n");
        assert_eq!(port.read(&mut buffer).unwrap(), 0);

        port.write_all(b"at\r\n").unwrap();
        assert_eq!(handle.written(), "at\r\n");
    }

    #[test]
    fn clear_input_drops_unread_bytes() {
        let (mut port, handle) = MemoryPort::new();
        handle.push_line("stale");
        port.clear_input().unwrap();
        assert_eq!(handle.pending_input(), 0);
    }
}
