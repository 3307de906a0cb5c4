// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::io::{Read, Write};
use std::thread::JoinHandle;
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

// ============================================================================
// SerialPort Traits
// ============================================================================

/// Transmit side of the controller link
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn flush(&mut self) -> std::io::Result<()>;
}

/// Receive side of the controller link, polled by the reader thread
pub trait SerialRead: Send {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }

    /// Second handle on the same device for the reader thread.
    pub fn try_clone_reader(&self) -> Result<RealSerialPort, serialport::Error> {
        Ok(RealSerialPort { port: self.port.try_clone()? })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

impl SerialRead for RealSerialPort {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.port.read(buf)
    }
}

// ============================================================================
// Reader Thread
// ============================================================================

/// Forwards everything the controller sends to the event loop.
///
/// Stops when the event loop drops its receiver or the port fails.
pub fn spawn_reader<R>(mut reader: R, tx: UnboundedSender<Vec<u8>>, poll: Duration) -> JoinHandle<()>
where
    R: SerialRead + 'static,
{
    std::thread::spawn(move || {
        let mut buf = [0u8; 256];
        loop {
            match reader.read_timeout(&mut buf, poll) {
                Ok(0) => {}
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    error!("Serial read failed: {}", e);
                    break;
                }
            }
            if tx.is_closed() {
                break;
            }
        }
        debug!("Serial reader stopped");
    })
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
    flushes: usize,
    fail_writes: bool,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            write_log: Vec::new(),
            expected_writes,
            flushes: 0,
            fail_writes: false,
        }
    }

    /// Port whose every write fails, as if the device was unplugged.
    pub fn broken() -> Self {
        MockSerialPort {
            write_log: Vec::new(),
            expected_writes: Vec::new(),
            flushes: 0,
            fail_writes: true,
        }
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        if self.fail_writes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "Mock port gone"
            ));
        }
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:?}\nGot {} bytes:\n{:?}",
            self.expected_writes.len(),
            String::from_utf8_lossy(&self.expected_writes),
            self.write_log.len(),
            String::from_utf8_lossy(&self.write_log)
        );

        if !self.fail_writes && !self.write_log.is_empty() {
            assert!(self.flushes > 0, "MockSerialPort written but never flushed");
        }
    }
}

/// Scripted controller output (None = timeout)
#[cfg(test)]
pub struct MockSerialReader {
    responses: Vec<Option<Vec<u8>>>,
    read_pos: usize,
}

#[cfg(test)]
impl MockSerialReader {
    pub fn new(responses: Vec<Option<Vec<u8>>>) -> Self {
        MockSerialReader { responses, read_pos: 0 }
    }
}

#[cfg(test)]
impl SerialRead for MockSerialReader {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        // Out of responses = timeout
        let Some(Some(data)) = self.responses.get(self.read_pos).cloned() else {
            self.read_pos += 1;
            std::thread::sleep(timeout);
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        };

        self.read_pos += 1;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}
