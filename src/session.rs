//! The download session (§3): the process-wide state describing one
//! ongoing transfer, shared between the compal and romload state
//! machines, the reactor, and the bridge handoff.

use std::path::PathBuf;

use crate::block::{Block, DownloadChecksum};
use crate::image::Image;
use crate::profile::Profile;

/// Compal ("ramloader") sub-state (§3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompalState {
    WaitingPrompt1,
    WaitingPrompt2,
    Downloading,
}

/// Romload ("non-secure romloader") sub-state (§3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomloadState {
    WaitingIdentification,
    WaitingParamAck,
    SendingBlocks,
    SendingLastBlock,
    LastBlockSent,
    WaitingBlockAck,
    WaitingChecksumAck,
    WaitingBranchAck,
    Finished,
}

/// The two handshakes are mutually exclusive and chosen once, at startup,
/// by profile (§9 design notes): a fused top-level tag rather than
/// carrying both state sets simultaneously.
pub enum ProtocolState {
    Compal(CompalState),
    Romload(RomloadState),
}

/// Romload-only block bookkeeping (§3): the current block buffer, the
/// next block index, the negotiated per-block payload size, and the
/// accumulated download checksum.
#[derive(Default)]
pub struct RomloadBlockState {
    pub block: Option<Block>,
    pub block_index: u32,
    pub block_payload_size: usize,
    pub checksum: DownloadChecksum,
    /// Whether the block currently in `block` is the final one (§4.3).
    pub is_last: bool,
}

/// Process-wide singleton describing one ongoing transfer (§3).
pub struct Session {
    pub profile: Profile,
    pub filename: PathBuf,
    pub image: Image,
    pub state: ProtocolState,
    pub romload: RomloadBlockState,
    /// Sliding receive buffer (§4.4) / state-dependent head (§4.5).
    pub recv_head: Vec<u8>,
    /// Whether the loader handshake has handed control to the uploaded
    /// code; once true the reactor routes all further UART bytes through
    /// the multiplexor bridge instead of the state machine (§4.5, §4.7).
    pub bridge_active: bool,
}

impl Session {
    pub fn new(profile: Profile, filename: PathBuf, image: Image) -> Self {
        let state = if profile.is_compal() {
            ProtocolState::Compal(CompalState::WaitingPrompt1)
        } else {
            ProtocolState::Romload(RomloadState::WaitingIdentification)
        };
        Self {
            profile,
            filename,
            image,
            state,
            romload: RomloadBlockState::default(),
            recv_head: Vec::new(),
            bridge_active: false,
        }
    }

    pub fn rebuild_image(&mut self) -> crate::error::Result<()> {
        self.image = Image::build(self.profile, &self.filename)?;
        Ok(())
    }
}
