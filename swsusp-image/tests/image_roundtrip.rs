//! End-to-end runs against scripted swap and tempfile-backed resume
//! devices.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use swsusp_image::crypto::CryptoContext;
use swsusp_image::extents::SwapSpace;
use swsusp_image::header::{ImageFlags, ImageHeader};
use swsusp_image::verify::verify_image;
use swsusp_image::writer::PageIo;
use swsusp_image::{page_size, write_image, Error, ImageConfig, Result, WriteParams};

/// Swap allocator scripted with a fixed offset sequence.
struct ScriptedSwap {
    offsets: Mutex<std::vec::IntoIter<u64>>,
    avail: u64,
}

impl ScriptedSwap {
    fn pages(count: u64) -> Self {
        let ps = page_size() as u64;
        let offsets: Vec<u64> = (1..=count).map(|i| i * ps).collect();
        ScriptedSwap {
            offsets: Mutex::new(offsets.into_iter()),
            avail: count * ps,
        }
    }
}

impl SwapSpace for ScriptedSwap {
    fn alloc_swap_page(&self) -> Result<Option<u64>> {
        Ok(self.offsets.lock().unwrap().next())
    }

    fn free_swap_pages(&self) -> Result<()> {
        Ok(())
    }

    fn avail_swap(&self) -> Result<u64> {
        Ok(self.avail)
    }
}

fn fake_resume_device(pages: u64) -> std::fs::File {
    let file = tempfile::tempfile().unwrap();
    file.set_len(pages * page_size() as u64).unwrap();
    file
}

fn patterned_pages(count: usize) -> Vec<u8> {
    let ps = page_size();
    let mut data = vec![0u8; count * ps];
    for (i, page) in data.chunks_mut(ps).enumerate() {
        for (j, byte) in page.iter_mut().enumerate() {
            *byte = (i * 131 + j * 7) as u8;
        }
    }
    data
}

fn random_pages(count: usize) -> Vec<u8> {
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    (0..count * page_size())
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

fn write(
    dev: &dyn PageIo,
    swap: &dyn SwapSpace,
    data: &[u8],
    config: &ImageConfig,
    crypto: Option<&CryptoContext>,
) -> Result<(ImageHeader, u64)> {
    let mut input = Cursor::new(data.to_vec());
    let outcome = write_image(
        dev,
        swap,
        &mut input,
        page_size(),
        WriteParams {
            config,
            crypto,
            image_size: data.len() as u64,
            abort: None,
            progress: None,
        },
    )?;
    Ok((outcome.header, outcome.start))
}

#[test]
fn tiny_image_no_transforms() {
    let ps = page_size();
    let dev = fake_resume_device(64);
    let swap = ScriptedSwap::pages(40);
    let data = patterned_pages(16);
    let config = ImageConfig {
        checksum: true,
        ..ImageConfig::default()
    };

    let (header, start) = write(&dev, &swap, &data, &config, None).unwrap();

    assert_eq!(header.pages, 16);
    assert_eq!(header.image_data_size, 16 * ps as u64);
    assert!(header.flags.contains(ImageFlags::CHECKSUM));
    assert_eq!(header.checksum, md5::compute(&data).0);
    assert!(start != 0);

    verify_image(&dev, None, &header, ps, 32).unwrap();
}

#[test]
fn constant_input_compresses_well() {
    let ps = page_size();
    let dev = fake_resume_device(1200);
    let swap = ScriptedSwap::pages(1200);
    let data = vec![0xAA; 1024 * ps];
    let config = ImageConfig {
        checksum: true,
        compress: true,
        ..ImageConfig::default()
    };

    let (header, _) = write(&dev, &swap, &data, &config, None).unwrap();

    assert!(header.flags.contains(ImageFlags::COMPRESSED));
    assert!(header.image_data_size < (1024 * ps as u64) / 4);
    verify_image(&dev, None, &header, ps, 32).unwrap();
}

#[test]
fn incompressible_input_fits_the_slack() {
    let ps = page_size();
    let dev = fake_resume_device(1400);
    let swap = ScriptedSwap::pages(1400);
    let data = random_pages(1024);
    let config = ImageConfig {
        checksum: true,
        compress: true,
        ..ImageConfig::default()
    };

    let (header, _) = write(&dev, &swap, &data, &config, None).unwrap();

    let plain = 1024 * ps as u64;
    assert!(header.image_data_size <= plain + plain * 7 / 100);
    verify_image(&dev, None, &header, ps, 32).unwrap();
}

#[test]
fn swap_exhaustion_leaves_no_header_behind() {
    let ps = page_size();
    let dev = fake_resume_device(600);
    // Far too few pages for a 1024-page image; generous avail_swap so the
    // failure happens midstream, not at preflight.
    let offsets: Vec<u64> = (1..=500).map(|i| i * ps as u64).collect();
    let swap = ScriptedSwap {
        offsets: Mutex::new(offsets.into_iter()),
        avail: 4096 * ps as u64,
    };
    let data = patterned_pages(1024);
    let config = ImageConfig::default();

    let err = write(&dev, &swap, &data, &config, None).unwrap_err();
    assert!(err.is_no_swap_space());
    assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));

    // The header slot was the first page handed out; it must still be
    // untouched.
    let mut page = vec![0u8; ps];
    dev.read_page_at(&mut page, ps as u64).unwrap();
    assert!(page.iter().all(|b| *b == 0));
}

#[test]
fn threaded_and_single_threaded_images_agree() {
    let ps = page_size();
    let data = patterned_pages(200);

    let run = |threads: bool| {
        let dev = fake_resume_device(400);
        let swap = ScriptedSwap::pages(400);
        let config = ImageConfig {
            checksum: true,
            compress: true,
            threads,
            ..ImageConfig::default()
        };
        let (header, _) = write(&dev, &swap, &data, &config, None).unwrap();
        verify_image(&dev, None, &header, ps, 32).unwrap();
        header
    };

    let single = run(false);
    let threaded = run(true);

    assert_eq!(single.pages, threaded.pages);
    assert_eq!(single.flags, threaded.flags);
    assert_eq!(single.map_start, threaded.map_start);
    assert_eq!(single.image_data_size, threaded.image_data_size);
    assert_eq!(single.checksum, threaded.checksum);
}

#[test]
fn encrypted_roundtrip_with_all_stages() {
    let ps = page_size();
    let dev = fake_resume_device(300);
    let swap = ScriptedSwap::pages(300);
    let data = patterned_pages(100);
    let crypto = CryptoContext::with_passphrase("hunter2");
    let config = ImageConfig {
        checksum: true,
        compress: true,
        threads: true,
        ..ImageConfig::default()
    };

    let (header, _) = write(&dev, &swap, &data, &config, Some(&crypto)).unwrap();

    assert!(header.flags.contains(ImageFlags::ENCRYPTED));
    assert!(!header.flags.contains(ImageFlags::USE_RSA));
    verify_image(&dev, Some(&crypto), &header, ps, 32).unwrap();

    // Without the key the digest cannot come out right.
    let err = verify_image(&dev, None, &header, ps, 32).unwrap_err();
    assert!(matches!(err, Error::Crypto(_)));
}

#[test]
fn rsa_mode_stores_the_wrapped_key() {
    use rsa::pkcs8::EncodePublicKey;

    let ps = page_size();
    let mut rng = rand::thread_rng();
    let private = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let pem = private
        .to_public_key()
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .unwrap();

    let dev = fake_resume_device(100);
    let swap = ScriptedSwap::pages(100);
    let data = patterned_pages(16);
    let crypto = CryptoContext::with_rsa_key(&pem).unwrap();
    let config = ImageConfig {
        checksum: true,
        ..ImageConfig::default()
    };

    let (header, _) = write(&dev, &swap, &data, &config, Some(&crypto)).unwrap();

    assert!(header.flags.contains(ImageFlags::ENCRYPTED));
    assert!(header.flags.contains(ImageFlags::USE_RSA));
    let blob = header.rsa.as_ref().unwrap();
    assert!(!blob.public_der.is_empty());
    assert_eq!(blob.wrapped_key.len(), 128);

    verify_image(&dev, Some(&crypto), &header, ps, 32).unwrap();
}

#[test]
fn commit_makes_the_image_discoverable() {
    let ps = page_size();
    let file = tempfile::tempfile().unwrap();
    file.set_len(200 * ps as u64).unwrap();
    use std::os::unix::fs::FileExt;
    file.write_all_at(b"SWAPSPACE2", ps as u64 - 10).unwrap();

    let swap = ScriptedSwap::pages(150);
    let data = patterned_pages(32);
    let config = ImageConfig {
        checksum: true,
        ..ImageConfig::default()
    };
    let (header, start) = write(&file, &swap, &data, &config, None).unwrap();

    // Before the commit the original magic is intact.
    let resume = swsusp_snapdev::ResumeDevice::from_file(file.try_clone().unwrap(), ps);
    let tail = swsusp_snapdev::SwapHeader::read(&resume, 0).unwrap();
    assert_eq!(&tail.sig, b"SWAPSPACE2");

    swsusp_snapdev::mark_swap(&resume, 0, start).unwrap();

    // After the commit: sentinel in place, image pointer set, and the
    // on-disk header alone is enough to walk the chain.
    let tail = swsusp_snapdev::SwapHeader::read(&resume, 0).unwrap();
    assert_eq!(tail.sig, swsusp_snapdev::SWSUSP_SIG);
    assert_eq!(tail.image, start);

    let mut page = vec![0u8; ps];
    file.read_page_at(&mut page, start).unwrap();
    let reread = ImageHeader::decode(&page).unwrap();
    assert_eq!(reread, header);
    verify_image(&file, None, &reread, ps, 32).unwrap();

    swsusp_snapdev::reset_signature(&resume, 0).unwrap();
    let tail = swsusp_snapdev::SwapHeader::read(&resume, 0).unwrap();
    assert_eq!(&tail.sig, b"SWAPSPACE2");
}

/// Device that writes slowly and tracks how far the reader runs ahead.
struct SlowDev {
    inner: std::fs::File,
    pages_written: AtomicU64,
}

impl PageIo for SlowDev {
    fn write_page_at(&self, page: &[u8], offset: u64) -> std::io::Result<()> {
        std::thread::sleep(Duration::from_millis(2));
        self.inner.write_page_at(page, offset)?;
        self.pages_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_page_at(&self, page: &mut [u8], offset: u64) -> std::io::Result<()> {
        self.inner.read_page_at(page, offset)
    }

    fn sync(&self) -> std::io::Result<()> {
        self.inner.sync()
    }
}

/// Input that records the reader's lead over the slow writer.
struct LeadTrackingInput<'a> {
    inner: Cursor<Vec<u8>>,
    dev: &'a SlowDev,
    page_size: usize,
    bytes_read: u64,
    max_lead_pages: u64,
}

impl std::io::Read for LeadTrackingInput<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = std::io::Read::read(&mut self.inner, buf)?;
        self.bytes_read += n as u64;
        let read_pages = self.bytes_read / self.page_size as u64;
        let written = self.dev.pages_written.load(Ordering::SeqCst);
        self.max_lead_pages = self.max_lead_pages.max(read_pages.saturating_sub(written));
        Ok(n)
    }
}

#[test]
fn slow_saver_stalls_the_reader() {
    let ps = page_size();
    let file = fake_resume_device(400);
    let dev = SlowDev {
        inner: file,
        pages_written: AtomicU64::new(0),
    };
    let swap = ScriptedSwap::pages(300);
    let data = patterned_pages(256);

    let buffer_pages = 4;
    let write_buffers = 2;
    let config = ImageConfig {
        threads: true,
        buffer_pages,
        write_buffers,
        ..ImageConfig::default()
    };

    let mut input = LeadTrackingInput {
        inner: Cursor::new(data),
        dev: &dev,
        page_size: ps,
        bytes_read: 0,
        max_lead_pages: 0,
    };

    write_image(
        &dev,
        &swap,
        &mut input,
        ps,
        WriteParams {
            config: &config,
            crypto: None,
            image_size: 256 * ps as u64,
            abort: None,
            progress: None,
        },
    )
    .unwrap();

    // The reader may hold one work buffer plus the full write ring plus
    // the batch being drained; beyond that it must have been blocked.
    let bound = ((write_buffers + 2) * buffer_pages) as u64;
    assert!(
        input.max_lead_pages <= bound,
        "reader ran {} pages ahead, bound {}",
        input.max_lead_pages,
        bound
    );
}
