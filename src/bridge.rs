//! Multiplexor bridge (§4.7): after boot-loader handoff, HDLC-framed
//! traffic is routed between the UART and per-DLCI Unix-domain tool
//! servers.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{DownloadError, Result};
use crate::hdlc::Hdlc;

/// Console traffic (stdout passthrough), conventional low DLCI value,
/// assumed per §10 since `sercomm.h` was not in the retrieved source.
pub const DLCI_CONSOLE: u8 = 0x00;
/// Debug-log traffic, same caveat as [`DLCI_CONSOLE`].
pub const DLCI_DEBUG: u8 = 0x01;
/// Layer-2 radio signalling tool server (`SC_DLCI_L1A_L23`, §3).
pub const DLCI_LAYER2: u8 = 0x05;
/// Secondary loader tool server (`SC_DLCI_LOADER`, §3).
pub const DLCI_LOADER: u8 = 0x09;

/// Payloads larger than this are rejected at tool-connection ingress (§4.7).
const MAX_TOOL_PAYLOAD: usize = 512;

/// One accepted connection on a tool server: an inbound length-prefix
/// parser and an outbound write queue.
struct ToolConnection {
    stream: UnixStream,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
}

impl ToolConnection {
    fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            inbox: Vec::new(),
            outbox: Vec::new(),
        })
    }

    /// Reads whatever is available and extracts complete
    /// length-prefixed payloads, oversized ones rejected per §4.7.
    fn drain_readable(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.inbox.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(DownloadError::Io(e)),
            }
        }

        let mut payloads = Vec::new();
        loop {
            if self.inbox.len() < 2 {
                break;
            }
            let len = u16::from_be_bytes([self.inbox[0], self.inbox[1]]) as usize;
            if len > MAX_TOOL_PAYLOAD {
                warn!("tool connection payload of {len} bytes rejected at ingress");
                self.inbox.drain(..2 + len.min(self.inbox.len().saturating_sub(2)));
                continue;
            }
            if self.inbox.len() < 2 + len {
                break;
            }
            let payload = self.inbox[2..2 + len].to_vec();
            self.inbox.drain(..2 + len);
            payloads.push(payload);
        }
        Ok(payloads)
    }

    /// Queues a length-prefixed frame for delivery to this connection
    /// (§4.7: tool-server fan-out prepends a 2-byte big-endian length).
    fn queue(&mut self, frame: &[u8]) {
        self.outbox.extend_from_slice(&(frame.len() as u16).to_be_bytes());
        self.outbox.extend_from_slice(frame);
    }

    fn flush(&mut self) -> Result<()> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        match self.stream.write(&self.outbox) {
            Ok(n) => {
                self.outbox.drain(..n);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(DownloadError::Io(e)),
        }
    }
}

/// One DLCI's Unix-domain listener plus its accepted connections.
pub struct ToolServer {
    dlci: u8,
    listener: UnixListener,
    path: PathBuf,
    connections: Vec<ToolConnection>,
}

impl ToolServer {
    pub fn bind(dlci: u8, path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            dlci,
            listener,
            path: path.to_path_buf(),
            connections: Vec::new(),
        })
    }

    /// Accepts every pending connection; failures are logged and ignored
    /// per §7(f).
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => match ToolConnection::new(stream) {
                    Ok(conn) => self.connections.push(conn),
                    Err(e) => warn!("failed to configure accepted connection: {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed on dlci {:#04x}: {e}", self.dlci);
                    break;
                }
            }
        }
    }
}

impl Drop for ToolServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Owns the HDLC framer and every registered DLCI's tool server.
pub struct Bridge {
    hdlc: Hdlc,
    servers: HashMap<u8, ToolServer>,
    console_buf: Vec<u8>,
}

impl Bridge {
    pub fn new() -> Self {
        let mut hdlc = Hdlc::init();
        hdlc.register_rx(DLCI_CONSOLE);
        hdlc.register_rx(DLCI_DEBUG);
        Self {
            hdlc,
            servers: HashMap::new(),
            console_buf: Vec::new(),
        }
    }

    pub fn register_tool_server(&mut self, server: ToolServer) {
        self.hdlc.register_rx(server.dlci);
        self.servers.insert(server.dlci, server);
    }

    /// Feeds one byte read off the UART into the framer, then routes any
    /// frames it assembled to their destination (§4.7).
    pub fn on_uart_byte(&mut self, byte: u8) {
        let _ = self.hdlc.rx_char(byte);
        for (dlci, frame) in self.hdlc.take_delivered() {
            self.route(dlci, &frame);
        }
    }

    fn route(&mut self, dlci: u8, frame: &[u8]) {
        match dlci {
            DLCI_CONSOLE => {
                self.console_buf.extend_from_slice(frame);
                let mut stdout = io::stdout();
                let _ = stdout.write_all(frame);
                let _ = stdout.flush();
            }
            DLCI_DEBUG => {
                debug!("phone debug: {}", String::from_utf8_lossy(frame));
            }
            other => {
                if let Some(server) = self.servers.get_mut(&other) {
                    for conn in &mut server.connections {
                        conn.queue(frame);
                    }
                }
            }
        }
    }

    /// Polls every tool server for new connections and inbound payloads,
    /// handing payloads to the framer for outbound transmission.
    pub fn poll_tool_servers(&mut self) -> Result<()> {
        for server in self.servers.values_mut() {
            server.accept_pending();
            let dlci = server.dlci;
            let mut dead = Vec::new();
            for (i, conn) in server.connections.iter_mut().enumerate() {
                match conn.drain_readable() {
                    Ok(payloads) => {
                        for payload in payloads {
                            self.hdlc.send(dlci, &payload);
                        }
                    }
                    Err(_) => dead.push(i),
                }
                conn.flush()?;
            }
            for i in dead.into_iter().rev() {
                server.connections.remove(i);
            }
        }
        Ok(())
    }

    /// Pulls the next byte queued for transmission on the UART, if any.
    pub fn pull_tx(&mut self) -> Option<u8> {
        self.hdlc.pull_tx()
    }

    pub fn has_pending_tx(&self) -> bool {
        self.hdlc.has_pending_tx()
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_bytes_are_buffered_for_stdout() {
        let mut bridge = Bridge::new();
        let mut framer = Hdlc::init();
        framer.send(DLCI_CONSOLE, b"hello\n");
        while let Some(b) = framer.pull_tx() {
            bridge.on_uart_byte(b);
        }
        assert_eq!(bridge.console_buf, b"hello\n");
    }

    #[test]
    fn oversized_tool_payload_is_dropped_without_reaching_hdlc() {
        let mut listener_path = std::env::temp_dir();
        listener_path.push(format!("osmoload-bridge-test-{}", std::process::id()));
        let server = ToolServer::bind(DLCI_LAYER2, &listener_path).unwrap();
        let mut bridge = Bridge::new();
        bridge.register_tool_server(server);

        let mut client = UnixStream::connect(&listener_path).unwrap();
        bridge.poll_tool_servers().unwrap();

        let oversized = vec![0xAAu8; MAX_TOOL_PAYLOAD + 1];
        let mut frame = ((oversized.len()) as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(&oversized);
        client.write_all(&frame).unwrap();

        bridge.poll_tool_servers().unwrap();
        assert!(!bridge.has_pending_tx());
    }
}
