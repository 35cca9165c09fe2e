//! Minimal HDLC-style DLCI multiplexor (§1, §4.7).
//!
//! The real framing/deframing codec is explicitly out of scope of this
//! design; the spec treats it as a pre-existing library and only
//! describes the four calls the core makes against it. No such crate
//! exists on the registry for this proprietary wire format, so this
//! module is a small in-repo stand-in implementing exactly those calls:
//! `init`, `register_rx`, `rx_char`, `send`, `pull_tx`. It is not the
//! focus of the grounding effort (see `DESIGN.md`).
//!
//! Framing: `7E` flag, DLCI byte, 2-byte big-endian length, payload,
//! with `7E` and `7D` escaped as `7D` + (byte XOR `20`) inside DLCI,
//! length and payload, the same escape convention the reactor's own
//! framing would need regardless of which concrete codec backs it.

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

/// Number of DLCIs addressable by one byte.
const DLCI_COUNT: usize = 256;

#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
enum RxState {
    #[default]
    WaitingFlag,
    Dlci,
    LenHi,
    LenLo,
    Payload,
}

struct RxChannel {
    state: RxState,
    dlci: u8,
    len: usize,
    buf: Vec<u8>,
    escaped: bool,
}

impl Default for RxChannel {
    fn default() -> Self {
        Self {
            state: RxState::default(),
            dlci: 0,
            len: 0,
            buf: Vec::new(),
            escaped: false,
        }
    }
}

/// Frame deframer plus per-DLCI callback table and outgoing byte queue.
pub struct Hdlc {
    rx: RxChannel,
    callbacks: Vec<Option<()>>,
    tx_queue: std::collections::VecDeque<u8>,
    delivered: Vec<(u8, Vec<u8>)>,
}

impl Hdlc {
    pub fn init() -> Self {
        Self {
            rx: RxChannel::default(),
            callbacks: vec![None; DLCI_COUNT],
            tx_queue: std::collections::VecDeque::new(),
            delivered: Vec::new(),
        }
    }

    /// Marks `dlci` as having a registered receiver; the actual callback
    /// dispatch happens by the caller draining [`Hdlc::take_delivered`]
    /// after each `rx_char`, since the bridge needs `&mut self` access to
    /// its own tool-server state that a boxed closure here couldn't reach
    /// without extra indirection.
    pub fn register_rx(&mut self, dlci: u8) {
        self.callbacks[dlci as usize] = Some(());
    }

    /// Feed one byte received from the UART. Returns `Ok(())` on success,
    /// `Err(())` if the byte was dropped (unescaped flag mid-frame from a
    /// DLCI with no registered receiver).
    pub fn rx_char(&mut self, byte: u8) -> Result<(), ()> {
        if byte == FLAG {
            self.rx = RxChannel::default();
            self.rx.state = RxState::Dlci;
            return Ok(());
        }
        if self.rx.state == RxState::WaitingFlag {
            return Ok(());
        }
        if byte == ESCAPE && !self.rx.escaped {
            self.rx.escaped = true;
            return Ok(());
        }
        let byte = if self.rx.escaped {
            self.rx.escaped = false;
            byte ^ ESCAPE_XOR
        } else {
            byte
        };

        match self.rx.state {
            RxState::WaitingFlag => unreachable!(),
            RxState::Dlci => {
                self.rx.dlci = byte;
                self.rx.state = RxState::LenHi;
            }
            RxState::LenHi => {
                self.rx.len = (byte as usize) << 8;
                self.rx.state = RxState::LenLo;
            }
            RxState::LenLo => {
                self.rx.len |= byte as usize;
                self.rx.buf.clear();
                self.rx.state = if self.rx.len == 0 {
                    RxState::WaitingFlag
                } else {
                    RxState::Payload
                };
                if self.rx.len == 0 {
                    self.deliver();
                }
            }
            RxState::Payload => {
                self.rx.buf.push(byte);
                if self.rx.buf.len() >= self.rx.len {
                    self.deliver();
                    self.rx.state = RxState::WaitingFlag;
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self) {
        if self.callbacks[self.rx.dlci as usize].is_some() {
            self.delivered.push((self.rx.dlci, self.rx.buf.clone()));
        }
    }

    /// Drains frames assembled since the last call, for the bridge to
    /// route to stdout / debug callback / tool-server connections.
    pub fn take_delivered(&mut self) -> Vec<(u8, Vec<u8>)> {
        std::mem::take(&mut self.delivered)
    }

    /// Queue `frame` for transmission on `dlci`, escaping as it is
    /// framed (§4.7).
    pub fn send(&mut self, dlci: u8, frame: &[u8]) {
        self.tx_queue.push_back(FLAG);
        self.push_escaped(dlci);
        self.push_escaped((frame.len() >> 8) as u8);
        self.push_escaped((frame.len() & 0xFF) as u8);
        for &b in frame {
            self.push_escaped(b);
        }
    }

    fn push_escaped(&mut self, byte: u8) {
        if byte == FLAG || byte == ESCAPE {
            self.tx_queue.push_back(ESCAPE);
            self.tx_queue.push_back(byte ^ ESCAPE_XOR);
        } else {
            self.tx_queue.push_back(byte);
        }
    }

    /// Pull the next outgoing byte, if any.
    pub fn pull_tx(&mut self) -> Option<u8> {
        self.tx_queue.pop_front()
    }

    pub fn has_pending_tx(&self) -> bool {
        !self.tx_queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame_through_rx_and_tx() {
        let mut tx = Hdlc::init();
        tx.send(0x05, &[0xAA, 0xBB, 0xCC]);

        let mut rx = Hdlc::init();
        rx.register_rx(0x05);
        while let Some(b) = tx.pull_tx() {
            rx.rx_char(b).unwrap();
        }
        let delivered = rx.take_delivered();
        assert_eq!(delivered, vec![(0x05, vec![0xAA, 0xBB, 0xCC])]);
    }

    #[test]
    fn frames_with_flag_and_escape_bytes_in_payload_round_trip() {
        let mut tx = Hdlc::init();
        tx.send(0x09, &[FLAG, ESCAPE, 0x00, 0xFF]);

        let mut rx = Hdlc::init();
        rx.register_rx(0x09);
        while let Some(b) = tx.pull_tx() {
            rx.rx_char(b).unwrap();
        }
        assert_eq!(
            rx.take_delivered(),
            vec![(0x09, vec![FLAG, ESCAPE, 0x00, 0xFF])]
        );
    }

    #[test]
    fn unregistered_dlci_is_silently_dropped() {
        let mut tx = Hdlc::init();
        tx.send(0x02, &[0x01]);
        let mut rx = Hdlc::init();
        while let Some(b) = tx.pull_tx() {
            rx.rx_char(b).unwrap();
        }
        assert!(rx.take_delivered().is_empty());
    }
}
