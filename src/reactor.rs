//! Single-threaded reactor (§4.6): multiplexes the UART, tool-server
//! listeners, accepted connections and the romload beacon timer.

use std::path::Path;
use std::time::{Duration, Instant};

use log::info;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::bridge::{Bridge, ToolServer, DLCI_LAYER2, DLCI_LOADER};
use crate::error::{DownloadError, Result};
use crate::serial::Serial;
use crate::session::Session;
use crate::{compal, romload};

const UART_TOKEN: Token = Token(0);

/// Romload identification beacon interval (§4.5).
const BEACON_INTERVAL: Duration = Duration::from_millis(50);

/// Drives the download session to completion, then the multiplexor
/// bridge until the UART closes.
pub struct Reactor {
    poll: Poll,
    events: Events,
    serial: Serial,
    session: Session,
    bridge: Bridge,
    next_beacon: Instant,
}

impl Reactor {
    pub fn new(
        serial: Serial,
        session: Session,
        layer2_socket: &Path,
        loader_socket: &Path,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let mut bridge = Bridge::new();
        bridge.register_tool_server(ToolServer::bind(DLCI_LAYER2, layer2_socket)?);
        bridge.register_tool_server(ToolServer::bind(DLCI_LOADER, loader_socket)?);

        let fd = serial.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), UART_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(16),
            serial,
            session,
            bridge,
            next_beacon: Instant::now(),
        })
    }

    /// Runs until the UART reports peer-close, returning the error that
    /// ended the session (`PeerClosed` in the ordinary case).
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.reregister_uart_interest()?;
            let timeout = self.next_wakeup();
            self.poll.poll(&mut self.events, Some(timeout))?;

            if self.events.iter().any(|e| e.token() == UART_TOKEN && e.is_readable()) {
                self.drain_uart()?;
            }
            if self.events.iter().any(|e| e.token() == UART_TOKEN && e.is_writable()) {
                self.service_writes()?;
            }

            // Tool-server listeners and connections are plain nonblocking
            // Unix sockets, not registered with `poll` (§4.6); polled
            // unconditionally every tick instead.
            self.service_beacon()?;
            self.bridge.poll_tool_servers()?;

            if self.session.bridge_active {
                self.drain_bridge_tx()?;
            }
        }
    }

    fn next_wakeup(&self) -> Duration {
        self.next_beacon.saturating_duration_since(Instant::now())
    }

    fn reregister_uart_interest(&mut self) -> Result<()> {
        let wants_write = if self.session.bridge_active {
            self.bridge.has_pending_tx()
        } else if self.session.profile.is_compal() {
            compal::wants_write(&self.session)
        } else {
            romload::wants_write(&self.session)
        };
        let interest = if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let fd = self.serial.as_raw_fd();
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), UART_TOKEN, interest)?;
        Ok(())
    }

    fn drain_uart(&mut self) -> Result<()> {
        let mut buf = [0u8; 256];
        loop {
            match self.serial.read(&mut buf)? {
                None => break,
                Some(0) => return Err(DownloadError::PeerClosed),
                Some(n) => {
                    for &byte in &buf[..n] {
                        self.feed_byte(byte)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn feed_byte(&mut self, byte: u8) -> Result<()> {
        if self.session.bridge_active {
            self.bridge.on_uart_byte(byte);
            return Ok(());
        }
        if self.session.profile.is_compal() {
            compal::on_byte(&mut self.session, &mut self.serial, byte)?;
        } else {
            romload::on_byte(&mut self.session, &mut self.serial, byte)?;
            if self.session.bridge_active {
                info!("romload handoff complete, routing through multiplexor bridge");
            }
        }
        Ok(())
    }

    fn service_writes(&mut self) -> Result<()> {
        if self.session.bridge_active {
            return self.drain_bridge_tx();
        }
        if self.session.profile.is_compal() {
            compal::on_writable(&mut self.session, &mut self.serial)
        } else {
            romload::on_writable(&mut self.session, &mut self.serial)
        }
    }

    fn drain_bridge_tx(&mut self) -> Result<()> {
        let mut chunk = Vec::new();
        while let Some(b) = self.bridge.pull_tx() {
            chunk.push(b);
            if chunk.len() == 256 {
                break;
            }
        }
        if !chunk.is_empty() {
            self.serial.write(&chunk)?;
        }
        Ok(())
    }

    fn service_beacon(&mut self) -> Result<()> {
        if Instant::now() < self.next_beacon {
            return Ok(());
        }
        self.next_beacon = Instant::now() + BEACON_INTERVAL;
        if !self.session.profile.is_compal() {
            romload::on_beacon_tick(&mut self.session, &mut self.serial)?;
        }
        Ok(())
    }
}
