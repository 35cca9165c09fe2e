//! Image builder (§4.2): wraps a raw payload file into the exact byte
//! pattern the target bootstrap expects.

use std::fs;
use std::path::Path;

use log::warn;

use crate::error::{DownloadError, Result};
use crate::profile::{Profile, MAGIC_OFFSET, MAX_PAYLOAD_SIZE, PHONE_MAGIC};

/// The prepared image buffer, with its write cursor.
///
/// For compal profiles the layout is
/// `[length_hi, length_lo, header…, payload…, trailing_xor]`; for romload
/// it is the raw payload bytes, verbatim (§3).
#[derive(Debug, Default)]
pub struct Image {
    data: Vec<u8>,
    write_cursor: usize,
}

impl Image {
    /// Build (or rebuild) the image for `profile` from the file at `path`.
    ///
    /// Idempotent: the image builder may run twice per session, once on
    /// profile selection and once when the peer re-prompts (§4.2).
    pub fn build(profile: Profile, path: &Path) -> Result<Self> {
        let payload = fs::read(path)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(DownloadError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if profile.is_compal() {
            Ok(Self::build_compal(profile, &payload))
        } else {
            Ok(Self {
                data: payload,
                write_cursor: 0,
            })
        }
    }

    fn build_compal(profile: Profile, payload: &[u8]) -> Self {
        let header = profile.header();
        let mut padded_payload_len = payload.len();

        if profile.needs_magic_stamp() {
            if payload.len() < MAGIC_OFFSET + PHONE_MAGIC.len() {
                padded_payload_len = MAGIC_OFFSET + PHONE_MAGIC.len();
            } else {
                warn!(
                    "payload ({} bytes) is larger than the magic offset region; \
                     magic \"1003\" will not be stamped",
                    payload.len()
                );
            }
        }

        let total_len = header.len() + padded_payload_len;
        let mut data = Vec::with_capacity(2 + total_len + 1);

        let length_hi = (total_len >> 8) as u8;
        let length_lo = (total_len & 0xFF) as u8;
        data.push(length_hi);
        data.push(length_lo);
        data.extend_from_slice(header);
        data.extend_from_slice(payload);
        data.resize(2 + total_len, 0x00);

        if profile.needs_magic_stamp() && padded_payload_len > payload.len() {
            // The magic is stamped at absolute offset `MAGIC_OFFSET` of the
            // prepared image itself (length prefix and header included),
            // not at `MAGIC_OFFSET` bytes into the payload — the original
            // writes `dnload.data + MAGIC_OFFSET` directly, and §8's
            // testable property pins this down as an absolute image offset.
            data[MAGIC_OFFSET..MAGIC_OFFSET + PHONE_MAGIC.len()].copy_from_slice(&PHONE_MAGIC);
        }

        let mut running_xor: u8 = 0x02;
        for &b in &data {
            running_xor ^= b;
        }
        data.push(running_xor);

        Self {
            data,
            write_cursor: 0,
        }
    }

    /// Raw bytes of the prepared image.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.write_cursor
    }

    pub fn reset_cursor(&mut self) {
        self.write_cursor = 0;
    }

    pub fn is_fully_sent(&self) -> bool {
        self.write_cursor >= self.data.len()
    }

    /// Returns up to `max_len` bytes starting at the write cursor, without
    /// advancing it.
    pub fn peek(&self, max_len: usize) -> &[u8] {
        let end = (self.write_cursor + max_len).min(self.data.len());
        &self.data[self.write_cursor..end]
    }

    pub fn advance(&mut self, n: usize) {
        self.write_cursor = (self.write_cursor + n).min(self.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_payload(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    #[test]
    fn c123_two_byte_payload_matches_spec_scenario() {
        let f = write_payload(&[0xAA, 0xBB]);
        let image = Image::build(Profile::C123, f.path()).unwrap();
        assert_eq!(
            image.bytes(),
            &[0x00, 0x06, 0xEE, 0x4C, 0x9F, 0x63, 0xAA, 0xBB, 0x4B]
        );
    }

    #[test]
    fn c155_two_byte_payload_matches_spec_scenario() {
        let f = write_payload(&[0x11, 0x22]);
        let image = Image::build(Profile::C155, f.path()).unwrap();
        assert_eq!(
            image.bytes(),
            &[0x00, 0x06, 0x78, 0x47, 0xC0, 0x46, 0x11, 0x22, 0x8E]
        );
    }

    #[test]
    fn trailing_xor_is_0x02_xor_everything_before_it() {
        let f = write_payload(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        for profile in [Profile::C123, Profile::C123xor, Profile::C155] {
            let image = Image::build(profile, f.path()).unwrap();
            let (body, last) = image.bytes().split_at(image.bytes().len() - 1);
            let expect = body.iter().fold(0x02u8, |acc, &b| acc ^ b);
            assert_eq!(last[0], expect, "profile {profile:?}");
        }
    }

    #[test]
    fn c140_stamps_magic_at_absolute_image_offset() {
        // §8: bytes at *absolute* offsets 0x3BE2..0x3BE5 of the prepared
        // image are "1003" — the magic offset is measured from the start
        // of the prepared image (length prefix and header included), not
        // from the start of the payload.
        let f = write_payload(&[0xFF; 16]);
        let image = Image::build(Profile::C140, f.path()).unwrap();
        assert_eq!(&image.bytes()[MAGIC_OFFSET..MAGIC_OFFSET + 4], b"1003");
    }

    #[test]
    fn c140_skips_stamp_when_payload_too_large() {
        let f = write_payload(&vec![0xAB; MAGIC_OFFSET + 8]);
        let image = Image::build(Profile::C140, f.path()).unwrap();
        assert_eq!(&image.bytes()[MAGIC_OFFSET..MAGIC_OFFSET + 4], &[0xAB; 4]);
    }

    #[test]
    fn romload_is_the_raw_payload_verbatim() {
        let payload = [0x01u8; 1024];
        let f = write_payload(&payload);
        let image = Image::build(Profile::Romload, f.path()).unwrap();
        assert_eq!(image.bytes(), &payload[..]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let f = write_payload(&vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            Image::build(Profile::C123, f.path()),
            Err(DownloadError::PayloadTooLarge { .. })
        ));
    }
}
