//! Romload ("non-secure romloader") state machine (§4.5): beacon →
//! identification → parameter negotiation → block/ack loop → checksum →
//! branch → handoff to the multiplexor bridge.

use log::{debug, info, warn};

use crate::block::Block;
use crate::serial::{Transport, BAUD_DATA, BAUD_IDENT};
use crate::session::{ProtocolState, RomloadState, Session};

/// Beacon re-emitted at 50ms intervals while waiting for identification.
const IDENT_POLL: [u8; 2] = [0x3C, 0x69];
const IDENT_ACK: [u8; 2] = [0x3E, 0x69];

const PARAM_BLOCK: [u8; 11] = [0x3C, 0x70, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00];
const PARAM_ACK_PREFIX: [u8; 2] = [0x3E, 0x70];
const PARAM_NACK: [u8; 2] = [0x3E, 0x50];

const BLOCK_ACK: [u8; 2] = [0x3E, 0x77];
const BLOCK_NACK: [u8; 2] = [0x3E, 0x57];

const CHECKSUM_CMD_PREFIX: [u8; 2] = [0x3C, 0x63];
const CHECKSUM_ACK_PREFIX: [u8; 2] = [0x3E, 0x63];
const CHECKSUM_NACK: [u8; 2] = [0x3E, 0x43];

const BRANCH_CMD_PREFIX: [u8; 2] = [0x3C, 0x62];
const BRANCH_ACK: [u8; 2] = [0x3E, 0x62];
const BRANCH_NACK: [u8; 2] = [0x3E, 0x42];

const WRITE_CHUNK: usize = 4096;

fn romload_state(session: &Session) -> RomloadState {
    match session.state {
        ProtocolState::Romload(s) => s,
        ProtocolState::Compal(_) => unreachable!("romload handler invoked for compal profile"),
    }
}

/// Every transition clears the sliding head: the state-dependent head
/// length (§4.5) can shrink across a transition (e.g. 4 bytes in
/// `WaitingParamAck` down to 2 for the block/ack states), and leftover
/// bytes from the previous state's sentinel must not leak into the next
/// state's match.
fn set_state(session: &mut Session, state: RomloadState) {
    session.state = ProtocolState::Romload(state);
    session.recv_head.clear();
}

/// The receive head is matched against a state-dependent number of bytes
/// (§4.5): 2 in most states, 4 while waiting for the negotiated block
/// size, 3 while waiting for the checksum ack, 7 once finished (bridge
/// territory, not handled here).
fn head_len(state: RomloadState) -> usize {
    match state {
        RomloadState::WaitingParamAck => 4,
        RomloadState::WaitingChecksumAck => 3,
        RomloadState::Finished => 7,
        _ => 2,
    }
}

fn abort_to_identification<T: Transport>(session: &mut Session, serial: &mut T) -> crate::error::Result<()> {
    serial.set_baud(BAUD_IDENT)?;
    session.romload.block = None;
    session.romload.block_index = 0;
    session.romload.checksum.reset();
    set_state(session, RomloadState::WaitingIdentification);
    Ok(())
}

/// Re-emit the identification beacon; a no-op outside
/// `WAITING_IDENTIFICATION` (§4.5, §4.6).
pub fn on_beacon_tick<T: Transport>(session: &mut Session, serial: &mut T) -> crate::error::Result<()> {
    if romload_state(session) == RomloadState::WaitingIdentification {
        debug!("emitting romload identification beacon");
        serial.write(&IDENT_POLL)?;
    }
    Ok(())
}

fn start_first_block(session: &mut Session, payload_size: usize) {
    session.romload.block_payload_size = payload_size;
    session.romload.block_index = 0;
    session.romload.checksum.reset();
    let (block, is_last) = Block::build(session.image.bytes(), 0, payload_size);
    session.romload.block = Some(block);
    session.romload.is_last = is_last;
    set_state(session, RomloadState::SendingBlocks);
}

/// Feed one byte received from the UART into the state-dependent sliding
/// head match (§4.5).
pub fn on_byte<T: Transport>(
    session: &mut Session,
    serial: &mut T,
    byte: u8,
) -> crate::error::Result<()> {
    let state = romload_state(session);
    let len = head_len(state);

    session.recv_head.push(byte);
    while session.recv_head.len() > len {
        session.recv_head.remove(0);
    }
    if session.recv_head.len() < len {
        return Ok(());
    }
    let head = session.recv_head.clone();

    match state {
        RomloadState::WaitingIdentification if head == IDENT_ACK => {
            info!("received identification ack, sending parameter block");
            serial.write(&PARAM_BLOCK)?;
            session.rebuild_image()?;
            set_state(session, RomloadState::WaitingParamAck);
        }
        RomloadState::WaitingParamAck if head[0..2] == PARAM_ACK_PREFIX => {
            let sz_lo = head[2];
            let sz_hi = head[3];
            let block_size = ((sz_hi as usize) << 8) | sz_lo as usize;
            let payload_size = block_size.saturating_sub(crate::block::BLOCK_HEADER_LEN);
            info!("negotiated romload block size {block_size} (payload {payload_size} bytes)");
            serial.set_baud(BAUD_DATA)?;
            // The peer needs the UART to settle after the baud switch
            // before the block stream starts (§4.5); the reactor's tick
            // granularity already provides the needed delay in practice,
            // so no explicit sleep is issued here.
            start_first_block(session, payload_size);
        }
        RomloadState::WaitingParamAck if head[0..2] == PARAM_NACK => {
            warn!("romload parameter negotiation nacked, returning to identification");
            abort_to_identification(session, serial)?;
        }
        RomloadState::WaitingBlockAck if head == BLOCK_ACK => {
            let next_index = session.romload.block_index + 1;
            let (block, is_last) = Block::build(
                session.image.bytes(),
                next_index,
                session.romload.block_payload_size,
            );
            session.romload.block_index = next_index;
            session.romload.block = Some(block);
            session.romload.is_last = is_last;
            set_state(session, RomloadState::SendingBlocks);
        }
        RomloadState::WaitingBlockAck if head == BLOCK_NACK => {
            warn!("romload block nacked, returning to identification");
            abort_to_identification(session, serial)?;
        }
        RomloadState::LastBlockSent if head == BLOCK_ACK => {
            let checksum = session.romload.checksum.finalize();
            info!("last block acked, sending download checksum {checksum:#04x}");
            serial.write(&CHECKSUM_CMD_PREFIX)?;
            serial.write(&[checksum])?;
            set_state(session, RomloadState::WaitingChecksumAck);
        }
        RomloadState::LastBlockSent if head == BLOCK_NACK => {
            warn!("romload final block nacked, returning to identification");
            abort_to_identification(session, serial)?;
        }
        RomloadState::WaitingChecksumAck if head[0..2] == CHECKSUM_ACK_PREFIX => {
            info!("checksum acked, branching to {:#010x}", crate::profile::ROMLOAD_BASE_ADDRESS);
            serial.write(&BRANCH_CMD_PREFIX)?;
            serial.write(&crate::profile::ROMLOAD_BASE_ADDRESS.to_be_bytes())?;
            set_state(session, RomloadState::WaitingBranchAck);
        }
        RomloadState::WaitingChecksumAck if head[0..2] == CHECKSUM_NACK => {
            warn!("romload checksum nacked, returning to identification");
            abort_to_identification(session, serial)?;
        }
        RomloadState::WaitingBranchAck if head == BRANCH_ACK => {
            info!("branch acked, uploaded code is running; handing off to bridge");
            session.bridge_active = true;
            set_state(session, RomloadState::Finished);
        }
        RomloadState::WaitingBranchAck if head == BRANCH_NACK => {
            warn!("romload branch nacked, returning to identification");
            abort_to_identification(session, serial)?;
        }
        _ => {}
    }
    Ok(())
}

/// Whether the UART should currently be polled for write-readiness
/// (§4.5: only while a block is mid-flight).
pub fn wants_write(session: &Session) -> bool {
    matches!(
        romload_state(session),
        RomloadState::SendingBlocks | RomloadState::SendingLastBlock
    )
}

/// Stream up to [`WRITE_CHUNK`] bytes of the current block on one
/// write-ready event, then transition to the matching ack-wait state
/// once the block is fully sent (§4.3, §4.5).
pub fn on_writable<T: Transport>(session: &mut Session, serial: &mut T) -> crate::error::Result<()> {
    if !wants_write(session) {
        return Ok(());
    }

    let Some(block) = session.romload.block.as_mut() else {
        return Ok(());
    };
    let chunk = block.peek(WRITE_CHUNK);
    if !chunk.is_empty() {
        let n = serial.write(chunk)?;
        block.advance(n);
    }

    if block.is_fully_sent() {
        session.romload.checksum.add_block(block.checksum());
        if session.romload.is_last {
            set_state(session, RomloadState::LastBlockSent);
        } else {
            set_state(session, RomloadState::WaitingBlockAck);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::DownloadChecksum;
    use crate::image::Image;
    use crate::profile::Profile;
    use crate::serial::fake::FakeTransport;
    use std::io::Write as _;

    fn make_session(len: usize) -> (Session, tempfile::NamedTempFile) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0x5Au8; len]).unwrap();
        let image = Image::build(Profile::Romload, f.path()).unwrap();
        (Session::new(Profile::Romload, f.path().to_path_buf(), image), f)
    }

    #[test]
    fn identification_ack_sends_param_block_and_advances_state() {
        let (mut session, _f) = make_session(16);
        let mut serial = FakeTransport::default();
        for &b in &IDENT_ACK {
            on_byte(&mut session, &mut serial, b).unwrap();
        }
        assert_eq!(serial.tx, PARAM_BLOCK);
        assert_eq!(romload_state(&session), RomloadState::WaitingParamAck);
    }

    #[test]
    fn param_ack_extracts_block_size_and_switches_baud() {
        let (mut session, _f) = make_session(2 + 3 * 0xF6 + 50);
        set_state(&mut session, RomloadState::WaitingParamAck);
        let mut serial = FakeTransport::default();
        // block_size = 0x100, sz_lo/sz_hi little-endian per §6.
        for &b in &[0x3E, 0x70, 0x00, 0x01] {
            on_byte(&mut session, &mut serial, b).unwrap();
        }
        assert_eq!(serial.baud_history, vec![BAUD_DATA]);
        assert_eq!(session.romload.block_payload_size, 0x100 - crate::block::BLOCK_HEADER_LEN);
        assert_eq!(romload_state(&session), RomloadState::SendingBlocks);
        assert!(session.romload.block.is_some());
    }

    #[test]
    fn block_nack_aborts_to_identification_and_restores_baud() {
        let (mut session, _f) = make_session(16);
        set_state(&mut session, RomloadState::WaitingBlockAck);
        let mut serial = FakeTransport::default();
        for &b in &BLOCK_NACK {
            on_byte(&mut session, &mut serial, b).unwrap();
        }
        assert_eq!(romload_state(&session), RomloadState::WaitingIdentification);
        assert_eq!(serial.baud_history, vec![BAUD_IDENT]);
    }

    #[test]
    fn last_block_ack_sends_checksum_command() {
        let (mut session, _f) = make_session(16);
        session.romload.checksum = DownloadChecksum::new();
        session.romload.checksum.add_block(0x10);
        set_state(&mut session, RomloadState::LastBlockSent);
        let mut serial = FakeTransport::default();
        for &b in &BLOCK_ACK {
            on_byte(&mut session, &mut serial, b).unwrap();
        }
        assert_eq!(serial.tx[0..2], CHECKSUM_CMD_PREFIX);
        assert_eq!(serial.tx[2], session.romload.checksum.finalize());
        assert_eq!(romload_state(&session), RomloadState::WaitingChecksumAck);
    }

    #[test]
    fn branch_ack_activates_bridge_and_finishes() {
        let (mut session, _f) = make_session(16);
        set_state(&mut session, RomloadState::WaitingBranchAck);
        let mut serial = FakeTransport::default();
        for &b in &BRANCH_ACK {
            on_byte(&mut session, &mut serial, b).unwrap();
        }
        assert!(session.bridge_active);
        assert_eq!(romload_state(&session), RomloadState::Finished);
    }

    #[test]
    fn on_writable_streams_block_then_waits_for_ack() {
        let (mut session, _f) = make_session(2 + 16);
        start_first_block(&mut session, 16);
        let mut serial = FakeTransport::default();
        on_writable(&mut session, &mut serial).unwrap();
        assert_eq!(serial.tx.len(), crate::block::BLOCK_HEADER_LEN + 16);
        // A 16-byte payload with a 2-byte reserved offset is exactly one
        // block, so the only block built is also the last.
        assert_eq!(romload_state(&session), RomloadState::LastBlockSent);
    }

    #[test]
    fn beacon_only_fires_while_waiting_for_identification() {
        let (mut session, _f) = make_session(16);
        let mut serial = FakeTransport::default();
        on_beacon_tick(&mut session, &mut serial).unwrap();
        assert_eq!(serial.tx, IDENT_POLL);

        set_state(&mut session, RomloadState::SendingBlocks);
        let mut serial2 = FakeTransport::default();
        on_beacon_tick(&mut session, &mut serial2).unwrap();
        assert!(serial2.tx.is_empty());
    }
}
