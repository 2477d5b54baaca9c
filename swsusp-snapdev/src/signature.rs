use tracing::{error, info};

use crate::{Error, ResumeDevice, Result};

/// The hibernation sentinel, NUL included, exactly ten bytes like the swap
/// magics it replaces.
pub const SWSUSP_SIG: [u8; 10] = *b"S1SUSPEND\0";

/// Size of the on-disk tail this module owns.
pub const SWAP_HEADER_SIZE: usize = 28;

const SWAP_MAGICS: [&[u8; 10]; 2] = [b"SWAP-SPACE", b"SWAPSPACE2"];

/// Trailing fields of the swap super-block page.
///
/// The swap header occupies the page at `resume_offset`; its last 28 bytes
/// are the image pointer, the stashed original magic and the live signature.
/// Rewriting this tail is the commit: after it reaches the platter, the next
/// boot resumes from the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapHeader {
    pub image: u64,
    pub orig_sig: [u8; 10],
    pub sig: [u8; 10],
}

impl SwapHeader {
    /// Byte offset of the tail inside the resume device.
    pub fn tail_offset(page_size: usize, resume_offset: u64) -> u64 {
        (resume_offset + 1) * page_size as u64 - SWAP_HEADER_SIZE as u64
    }

    pub fn decode(raw: &[u8; SWAP_HEADER_SIZE]) -> Self {
        let mut orig_sig = [0u8; 10];
        let mut sig = [0u8; 10];
        orig_sig.copy_from_slice(&raw[8..18]);
        sig.copy_from_slice(&raw[18..28]);
        SwapHeader {
            image: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            orig_sig,
            sig,
        }
    }

    pub fn encode(&self) -> [u8; SWAP_HEADER_SIZE] {
        let mut raw = [0u8; SWAP_HEADER_SIZE];
        raw[0..8].copy_from_slice(&self.image.to_le_bytes());
        raw[8..18].copy_from_slice(&self.orig_sig);
        raw[18..28].copy_from_slice(&self.sig);
        raw
    }

    pub fn read(dev: &ResumeDevice, resume_offset: u64) -> Result<Self> {
        let mut raw = [0u8; SWAP_HEADER_SIZE];
        let off = Self::tail_offset(dev.page_size(), resume_offset);
        use std::os::unix::fs::FileExt;
        dev.file()
            .read_exact_at(&mut raw, off)
            .map_err(|e| Error::io("read swap signature", e))?;
        Ok(Self::decode(&raw))
    }

    fn write(&self, dev: &ResumeDevice, resume_offset: u64) -> Result<()> {
        let off = Self::tail_offset(dev.page_size(), resume_offset);
        use std::os::unix::fs::FileExt;
        dev.file()
            .write_all_at(&self.encode(), off)
            .map_err(|e| Error::io("write swap signature", e))
    }
}

/// Commit the image: replace the swap magic with the hibernation sentinel
/// and record where the image header page lives.
///
/// The tail is re-read after the fsync; if the sentinel is not there the
/// on-disk state can no longer be reasoned about and the caller must treat
/// the machine as committed-or-corrupt, never as safe to keep running.
pub fn mark_swap(dev: &ResumeDevice, resume_offset: u64, start: u64) -> Result<()> {
    let mut header = SwapHeader::read(dev, resume_offset)?;
    if !SWAP_MAGICS.iter().any(|m| **m == header.sig) {
        return Err(Error::NoSignature);
    }
    header.orig_sig = header.sig;
    header.sig = SWSUSP_SIG;
    header.image = start;
    header.write(dev, resume_offset)?;
    dev.sync()?;

    let check = SwapHeader::read(dev, resume_offset)?;
    if check.sig != SWSUSP_SIG || check.image != start {
        error!("swap signature did not persist");
        return Err(Error::CommitCorrupted);
    }
    info!(start, "swap signature committed");
    Ok(())
}

/// Undo the commit after a test run or an in-place resume.
pub fn reset_signature(dev: &ResumeDevice, resume_offset: u64) -> Result<()> {
    let mut header = SwapHeader::read(dev, resume_offset)?;
    if header.sig != SWSUSP_SIG {
        // We wrote the sentinel earlier and it is not there now.
        return Err(Error::CommitCorrupted);
    }
    header.sig = header.orig_sig;
    header.write(dev, resume_offset)?;
    dev.sync()?;
    info!("swap signature restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_swap(page_size: usize, resume_offset: u64) -> ResumeDevice {
        let file = tempfile::tempfile().unwrap();
        file.set_len((resume_offset + 4) * page_size as u64).unwrap();
        use std::os::unix::fs::FileExt;
        let magic_off = (resume_offset + 1) * page_size as u64 - 10;
        file.write_all_at(b"SWAPSPACE2", magic_off).unwrap();
        ResumeDevice::from_file(file, page_size)
    }

    #[test]
    fn mark_then_reset_round_trips() {
        let dev = fake_swap(4096, 0);
        mark_swap(&dev, 0, 0x7000).unwrap();

        let header = SwapHeader::read(&dev, 0).unwrap();
        assert_eq!(header.sig, SWSUSP_SIG);
        assert_eq!(&header.orig_sig, b"SWAPSPACE2");
        assert_eq!(header.image, 0x7000);

        reset_signature(&dev, 0).unwrap();
        let header = SwapHeader::read(&dev, 0).unwrap();
        assert_eq!(&header.sig, b"SWAPSPACE2");
    }

    #[test]
    fn mark_respects_resume_offset() {
        let dev = fake_swap(4096, 3);
        mark_swap(&dev, 3, 0x9000).unwrap();
        let header = SwapHeader::read(&dev, 3).unwrap();
        assert_eq!(header.sig, SWSUSP_SIG);
    }

    #[test]
    fn mark_refuses_foreign_device() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4 * 4096).unwrap();
        let dev = ResumeDevice::from_file(file, 4096);
        assert!(matches!(mark_swap(&dev, 0, 0x7000), Err(Error::NoSignature)));
    }

    #[test]
    fn reset_detects_missing_sentinel() {
        let dev = fake_swap(4096, 0);
        assert!(matches!(
            reset_signature(&dev, 0),
            Err(Error::CommitCorrupted)
        ));
    }
}
