//! The image header page.
//!
//! Written last, to the swap slot reserved before anything else, and found
//! by the resumer through the committed swap signature. Fixed little-endian
//! layout; everything fits one page with room to spare.

use bitflags::bitflags;

use crate::{Error, Result};

/// Upper bound for the stored public-key material (DER).
pub const RSA_DATA_SIZE: usize = 768;
/// Upper bound for the RSA-wrapped session key.
pub const KEY_DATA_SIZE: usize = 512;
/// Cipher block and salt length.
pub const CIPHER_BLOCK: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImageFlags: u64 {
        const CHECKSUM = 0x0001;
        const COMPRESSED = 0x0002;
        const ENCRYPTED = 0x0004;
        const USE_RSA = 0x0008;
        const PLATFORM_SUSPEND = 0x0010;
    }
}

/// Public-key material and the wrapped session key, present when the image
/// was encrypted in RSA mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RsaKeyBlob {
    /// DER of the public key the session key was wrapped with.
    pub public_der: Vec<u8>,
    /// The wrapped session key and initial vector.
    pub wrapped_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageHeader {
    /// Logical (pre-transform) data pages that follow.
    pub pages: u64,
    pub flags: ImageFlags,
    /// Swap offset of the first extent-map page.
    pub map_start: u64,
    /// Bytes actually written, post-transform.
    pub image_data_size: u64,
    /// Seconds from snapshot to image-complete; diagnostic only.
    pub writeout_time: f64,
    /// Opaque hint handed through to the resumer.
    pub resume_pause: u32,
    /// MD5 over the pre-transform data stream.
    pub checksum: [u8; 16],
    /// Salt XORed into the initial vector in passphrase mode.
    pub salt: [u8; CIPHER_BLOCK],
    pub rsa: Option<RsaKeyBlob>,
}

const OFF_PAGES: usize = 0;
const OFF_FLAGS: usize = 8;
const OFF_MAP_START: usize = 16;
const OFF_DATA_SIZE: usize = 24;
const OFF_WRITEOUT_TIME: usize = 32;
const OFF_RESUME_PAUSE: usize = 40;
const OFF_CHECKSUM: usize = 48;
const OFF_SALT: usize = 64;
const OFF_RSA_LEN: usize = 80;
const OFF_RSA_DATA: usize = 84;
const OFF_KEY_LEN: usize = OFF_RSA_DATA + RSA_DATA_SIZE;
const OFF_KEY_DATA: usize = OFF_KEY_LEN + 4;
const HEADER_BYTES: usize = OFF_KEY_DATA + KEY_DATA_SIZE;

impl ImageHeader {
    /// Serialize into a zeroed page.
    pub fn encode(&self, page: &mut [u8]) {
        assert!(page.len() >= HEADER_BYTES);

        page.fill(0);
        page[OFF_PAGES..OFF_PAGES + 8].copy_from_slice(&self.pages.to_le_bytes());
        page[OFF_FLAGS..OFF_FLAGS + 8].copy_from_slice(&self.flags.bits().to_le_bytes());
        page[OFF_MAP_START..OFF_MAP_START + 8].copy_from_slice(&self.map_start.to_le_bytes());
        page[OFF_DATA_SIZE..OFF_DATA_SIZE + 8].copy_from_slice(&self.image_data_size.to_le_bytes());
        page[OFF_WRITEOUT_TIME..OFF_WRITEOUT_TIME + 8]
            .copy_from_slice(&self.writeout_time.to_bits().to_le_bytes());
        page[OFF_RESUME_PAUSE..OFF_RESUME_PAUSE + 4]
            .copy_from_slice(&self.resume_pause.to_le_bytes());
        page[OFF_CHECKSUM..OFF_CHECKSUM + 16].copy_from_slice(&self.checksum);
        page[OFF_SALT..OFF_SALT + CIPHER_BLOCK].copy_from_slice(&self.salt);

        if let Some(rsa) = &self.rsa {
            assert!(rsa.public_der.len() <= RSA_DATA_SIZE);
            assert!(rsa.wrapped_key.len() <= KEY_DATA_SIZE);
            page[OFF_RSA_LEN..OFF_RSA_LEN + 4]
                .copy_from_slice(&(rsa.public_der.len() as u32).to_le_bytes());
            page[OFF_RSA_DATA..OFF_RSA_DATA + rsa.public_der.len()]
                .copy_from_slice(&rsa.public_der);
            page[OFF_KEY_LEN..OFF_KEY_LEN + 4]
                .copy_from_slice(&(rsa.wrapped_key.len() as u32).to_le_bytes());
            page[OFF_KEY_DATA..OFF_KEY_DATA + rsa.wrapped_key.len()]
                .copy_from_slice(&rsa.wrapped_key);
        }
    }

    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < HEADER_BYTES {
            return Err(Error::Corrupt("image header page too small"));
        }

        let u64_at = |at: usize| u64::from_le_bytes(page[at..at + 8].try_into().unwrap());
        let flags = ImageFlags::from_bits(u64_at(OFF_FLAGS))
            .ok_or(Error::Corrupt("unknown image header flags"))?;

        let rsa = if flags.contains(ImageFlags::USE_RSA) {
            let rsa_len =
                u32::from_le_bytes(page[OFF_RSA_LEN..OFF_RSA_LEN + 4].try_into().unwrap()) as usize;
            let key_len =
                u32::from_le_bytes(page[OFF_KEY_LEN..OFF_KEY_LEN + 4].try_into().unwrap()) as usize;
            if rsa_len > RSA_DATA_SIZE || key_len > KEY_DATA_SIZE {
                return Err(Error::Corrupt("oversized key material in image header"));
            }
            Some(RsaKeyBlob {
                public_der: page[OFF_RSA_DATA..OFF_RSA_DATA + rsa_len].to_vec(),
                wrapped_key: page[OFF_KEY_DATA..OFF_KEY_DATA + key_len].to_vec(),
            })
        } else {
            None
        };

        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&page[OFF_CHECKSUM..OFF_CHECKSUM + 16]);
        let mut salt = [0u8; CIPHER_BLOCK];
        salt.copy_from_slice(&page[OFF_SALT..OFF_SALT + CIPHER_BLOCK]);

        Ok(ImageHeader {
            pages: u64_at(OFF_PAGES),
            flags,
            map_start: u64_at(OFF_MAP_START),
            image_data_size: u64_at(OFF_DATA_SIZE),
            writeout_time: f64::from_bits(u64_at(OFF_WRITEOUT_TIME)),
            resume_pause: u32::from_le_bytes(
                page[OFF_RESUME_PAUSE..OFF_RESUME_PAUSE + 4].try_into().unwrap(),
            ),
            checksum,
            salt,
            rsa,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_one_page() {
        assert!(HEADER_BYTES <= 4096);
    }

    #[test]
    fn round_trip_plain() {
        let header = ImageHeader {
            pages: 1234,
            flags: ImageFlags::CHECKSUM | ImageFlags::COMPRESSED,
            map_start: 0x8000,
            image_data_size: 1234 * 4096,
            writeout_time: 3.25,
            resume_pause: 2,
            checksum: [7; 16],
            salt: [0; 16],
            rsa: None,
        };

        let mut page = vec![0u8; 4096];
        header.encode(&mut page);
        assert_eq!(ImageHeader::decode(&page).unwrap(), header);
    }

    #[test]
    fn round_trip_rsa() {
        let header = ImageHeader {
            pages: 9,
            flags: ImageFlags::ENCRYPTED | ImageFlags::USE_RSA,
            map_start: 0x3000,
            image_data_size: 9 * 4096,
            writeout_time: 0.5,
            resume_pause: 0,
            checksum: [0; 16],
            salt: [9; 16],
            rsa: Some(RsaKeyBlob {
                public_der: vec![1, 2, 3, 4],
                wrapped_key: vec![5; 256],
            }),
        };

        let mut page = vec![0u8; 4096];
        header.encode(&mut page);
        assert_eq!(ImageHeader::decode(&page).unwrap(), header);
    }

    #[test]
    fn rejects_unknown_flags() {
        let mut page = vec![0u8; 4096];
        ImageHeader::default().encode(&mut page);
        page[OFF_FLAGS + 7] = 0x80;
        assert!(ImageHeader::decode(&page).is_err());
    }
}
