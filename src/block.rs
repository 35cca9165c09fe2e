//! Block packer (§4.3, romload only): slices the prepared image into
//! fixed-size blocks with a 10-byte header and a per-block checksum.
//!
//! The `+2` read offset is carried over unchanged from the original
//! implementation even though the romload image has no 2-byte length
//! prefix of its own (§9 Open Questions); every block's source window
//! starts two bytes further into the image than its own index would
//! suggest. This is preserved literally rather than "corrected", per the
//! instruction to reproduce it byte-for-byte.

use crate::profile::ROMLOAD_BASE_ADDRESS;

/// Fixed 10-byte block header layout (§3): `3C 77 01 01 size_hi size_lo
/// addr_b3 addr_b2 addr_b1 addr_b0`.
pub const BLOCK_HEADER_LEN: usize = 10;

/// One romload block: header followed by a fixed-size payload.
pub struct Block {
    data: Vec<u8>,
    send_cursor: usize,
    checksum: u8,
}

impl Block {
    /// Build block number `index` (0-based) from `image`, whose payload
    /// size per block is `payload_size`. Returns the block and whether it
    /// is the final one (`remaining bytes <= payload_size`).
    ///
    /// Reads from `image` at offset `2 + index * payload_size`; the `+2`
    /// skips the length prefix that only compal profiles actually have;
    /// for romload this is reproduced literally per §4.3.
    pub fn build(image: &[u8], index: u32, payload_size: usize) -> (Self, bool) {
        let mut data = vec![0u8; BLOCK_HEADER_LEN + payload_size];
        data[0] = 0x3C;
        data[1] = 0x77;
        data[2] = 0x01; // hardcoded per §9: hangs if != 0x01
        data[3] = 0x01; // ditto
        data[4] = ((payload_size >> 8) & 0xFF) as u8;
        data[5] = (payload_size & 0xFF) as u8;

        let address = ROMLOAD_BASE_ADDRESS.wrapping_add(index.wrapping_mul(payload_size as u32));
        data[6] = ((address >> 24) & 0xFF) as u8;
        data[7] = ((address >> 16) & 0xFF) as u8;
        data[8] = ((address >> 8) & 0xFF) as u8;
        data[9] = (address & 0xFF) as u8;

        let source_offset = 2 + index as usize * payload_size;
        let remaining = image.len().saturating_sub(source_offset);
        let is_last = remaining <= payload_size;

        let available = image.len().saturating_sub(source_offset).min(payload_size);
        if available > 0 {
            data[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + available]
                .copy_from_slice(&image[source_offset..source_offset + available]);
        }
        // Short final block: the remainder stays zero-filled (§4.3).

        let checksum = Self::compute_checksum(&data);

        (
            Self {
                data,
                send_cursor: 0,
                checksum,
            },
            is_last,
        )
    }

    /// `low_byte(!(5 + sum(block[5..])))` (§3).
    fn compute_checksum(block: &[u8]) -> u8 {
        let sum: u32 = 5 + block[5..].iter().map(|&b| b as u32).sum::<u32>();
        (!sum) as u8
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn send_cursor(&self) -> usize {
        self.send_cursor
    }

    pub fn is_fully_sent(&self) -> bool {
        self.send_cursor >= self.data.len()
    }

    pub fn peek(&self, max_len: usize) -> &[u8] {
        let end = (self.send_cursor + max_len).min(self.data.len());
        &self.data[self.send_cursor..end]
    }

    pub fn advance(&mut self, n: usize) {
        self.send_cursor = (self.send_cursor + n).min(self.data.len());
    }
}

/// `low_byte(!(sum of per-block checksums))` accumulated across a whole
/// download (§3).
#[derive(Default)]
pub struct DownloadChecksum(u32);

impl DownloadChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self, block_checksum: u8) {
        self.0 += block_checksum as u32;
    }

    pub fn finalize(&self) -> u8 {
        (!self.0) as u8
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_addresses_follow_base_plus_index_times_payload_size() {
        let image = vec![0x01u8; 2 + 3 * 0xF6 + 100];
        let payload_size = 0xF6;
        for i in 0..4u32 {
            let (block, _) = Block::build(&image, i, payload_size);
            let addr = u32::from_be_bytes(block.bytes()[6..10].try_into().unwrap());
            assert_eq!(addr, ROMLOAD_BASE_ADDRESS + i * payload_size as u32);
            assert_eq!(&block.bytes()[0..6], &[0x3C, 0x77, 0x01, 0x01, 0x00, 0xF6]);
        }
    }

    #[test]
    fn three_full_blocks_then_one_partial() {
        // 2-byte read-offset reservation (§4.3) + 3 full blocks + a 100-byte tail.
        let image = vec![0x01u8; 2 + 3 * 0xF6 + 100];
        let payload_size = 0xF6;
        let last_flags: Vec<bool> = (0..4)
            .map(|i| Block::build(&image, i, payload_size).1)
            .collect();
        assert_eq!(last_flags, vec![false, false, false, true]);
    }

    #[test]
    fn download_checksum_is_ones_complement_of_block_checksum_sum() {
        // low_byte(!(5 + sum)) is a one's-complement checksum: summing every
        // per-block checksum with the final download checksum always lands
        // on 0xFF (-1 mod 256), never 0: bitwise NOT, not negation.
        let image = vec![0x7Fu8; 300];
        let payload_size = 64;
        let mut total = DownloadChecksum::new();
        let mut sum_of_checksums: u32 = 0;
        let mut i = 0u32;
        loop {
            let (block, is_last) = Block::build(&image, i, payload_size);
            total.add_block(block.checksum());
            sum_of_checksums += block.checksum() as u32;
            i += 1;
            if is_last {
                break;
            }
        }
        let final_checksum = total.finalize();
        assert_eq!((sum_of_checksums + final_checksum as u32) % 256, 0xFF);
    }
}
