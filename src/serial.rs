//! Serial transport (§4.1): opens and configures the UART, and switches
//! its baud rate between the romload identification phase (19200) and
//! everything else (115200).

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use log::debug;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};

use crate::error::Result;

/// Baud rate used for the compal profiles and the romload data phase.
pub const BAUD_DATA: u32 = 115_200;

/// Baud rate used while waiting for the romloader's identification beacon
/// reply and during parameter negotiation.
pub const BAUD_IDENT: u32 = 19_200;

/// What the compal and romload state machines need from a UART: a
/// non-blocking byte stream and a baud-rate switch. A trait rather than a
/// concrete type so the state machines can be driven in tests against a
/// fake transport instead of a real device.
pub trait Transport {
    /// `Ok(None)` means no bytes are available right now; `Ok(Some(0))`
    /// after the session has started means the peer closed the line;
    /// `Ok(Some(n))` for `n > 0` is normal progress.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
    /// `Ok(0)` means the write would have blocked.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn set_baud(&mut self, baud: u32) -> Result<()>;
}

/// The open UART, configured raw (no canonical mode, no echo, no signals,
/// no flow control, no CR/LF translation), 8N1, DTR+RTS asserted.
pub struct Serial {
    port: TTYPort,
}

impl Serial {
    pub fn open(path: &Path) -> Result<Self> {
        debug!("opening serial port {}", path.display());
        let mut port = serialport::new(path.to_string_lossy(), BAUD_DATA)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(0))
            .open_native()?;

        port.write_data_terminal_ready(true)?;
        port.write_request_to_send(true)?;
        // Non-blocking: the reactor never waits on the UART directly.
        port.set_timeout(Duration::from_millis(0))?;

        Ok(Self { port })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.port.as_raw_fd()
    }
}

impl Transport for Serial {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.port.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.port.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        debug!("switching UART baud rate to {baud}");
        self.port.set_baud_rate(baud)?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory stand-in for [`Serial`] used by the state-machine unit
    /// tests: bytes pushed onto `rx` are handed out one read at a time,
    /// bytes written land in `tx`.
    #[derive(Default)]
    pub struct FakeTransport {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
        pub baud_history: Vec<u32>,
    }

    impl Transport for FakeTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            if self.rx.is_empty() {
                return Ok(None);
            }
            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(Some(n))
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn set_baud(&mut self, baud: u32) -> Result<()> {
            self.baud_history.push(baud);
            Ok(())
        }
    }
}
