//! Compal ramloader state machine (§4.4): prompt1 → cmd → prompt2 →
//! bulk-write → ack/nack.

use log::{info, warn};

use crate::serial::Transport;
use crate::session::{CompalState, ProtocolState, Session};

const PROMPT1: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x41, 0x01, 0x40];
const CMD: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x52, 0x01, 0x53];
const PROMPT2: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x41, 0x02, 0x43];
const ACK: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x41, 0x03, 0x42];
const NACK: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x45, 0x53, 0x16];
const MAGIC_NACK: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x41, 0x03, 0x57];
const FTMTOOL: [u8; 7] = *b"ftmtool";

/// Maximum TX chunk per write-ready event (§4.4).
const WRITE_CHUNK: usize = 4096;

fn compal_state(session: &Session) -> CompalState {
    match session.state {
        ProtocolState::Compal(s) => s,
        ProtocolState::Romload(_) => unreachable!("compal handler invoked for romload profile"),
    }
}

fn set_state(session: &mut Session, state: CompalState) {
    session.state = ProtocolState::Compal(state);
}

/// Feed one byte received from the UART into the sliding 7-byte head
/// match (§4.4). `ftmtool` matches regardless of state; the other
/// sentinels only fire from the state the table lists for them.
pub fn on_byte<T: Transport>(
    session: &mut Session,
    serial: &mut T,
    byte: u8,
) -> crate::error::Result<()> {
    session.recv_head.push(byte);
    if session.recv_head.len() > PROMPT1.len() {
        session.recv_head.remove(0);
    }
    if session.recv_head.len() < PROMPT1.len() {
        return Ok(());
    }

    let head: [u8; 7] = session.recv_head.as_slice().try_into().unwrap();
    let state = compal_state(session);

    if head == FTMTOOL {
        warn!("received ftmtool from phone, ramloader has aborted");
        set_state(session, CompalState::WaitingPrompt1);
        session.recv_head.clear();
        return Ok(());
    }

    match (state, head) {
        (CompalState::WaitingPrompt1, h) if h == PROMPT1 => {
            info!("received PROMPT1 from phone, responding with CMD");
            serial.write(&CMD)?;
            session.rebuild_image()?;
            set_state(session, CompalState::WaitingPrompt2);
        }
        (CompalState::WaitingPrompt2, h) if h == PROMPT2 => {
            info!("received PROMPT2 from phone, starting download");
            set_state(session, CompalState::Downloading);
            session.image.reset_cursor();
        }
        (CompalState::Downloading, h) if h == ACK => {
            info!("received download ACK from phone, your code is running now");
            set_state(session, CompalState::WaitingPrompt1);
            session.image.reset_cursor();
        }
        (CompalState::Downloading, h) if h == NACK => {
            warn!("received download NACK from phone, transfer failed");
            set_state(session, CompalState::WaitingPrompt1);
            session.image.reset_cursor();
        }
        (CompalState::Downloading, h) if h == MAGIC_NACK => {
            warn!("magic must live at 0x803ce0, received MAGIC NACK from phone");
            set_state(session, CompalState::WaitingPrompt1);
            session.image.reset_cursor();
        }
        _ => {}
    }
    Ok(())
}

/// Whether the UART should currently be polled for write-readiness.
pub fn wants_write(session: &Session) -> bool {
    matches!(compal_state(session), CompalState::Downloading) && !session.image.is_fully_sent()
}

/// Stream up to [`WRITE_CHUNK`] bytes of the prepared image on one
/// write-ready event (§4.4).
pub fn on_writable<T: Transport>(session: &mut Session, serial: &mut T) -> crate::error::Result<()> {
    if !matches!(compal_state(session), CompalState::Downloading) {
        return Ok(());
    }

    if session.image.cursor() == 0 && session.profile.sends_xor_seed_first() {
        serial.write(&[0x02])?;
    }
    // Non-xor profiles pause one microsecond before the first byte in the
    // original; omitted here since the reactor tick already yields to
    // other readiness sources between writes.

    let chunk = session.image.peek(WRITE_CHUNK);
    if chunk.is_empty() {
        return Ok(());
    }
    let n = serial.write(chunk)?;
    session.image.advance(n);

    if session.image.is_fully_sent() {
        info!("image fully transmitted, waiting for ack/nack");
    }
    Ok(())
}
