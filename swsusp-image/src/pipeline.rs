//! The save pipeline.
//!
//! Single-threaded, the stream is read, hashed, compressed and written from
//! one loop. With threads enabled the stages are decoupled by two rings:
//! full write buffers travel from the reader to the mover, encrypted pages
//! from the mover to the saver, and each ring's buffers return through a
//! free list of the same capacity. A stage that cannot get a buffer blocks,
//! which is all the back-pressure there is: a slow disk stalls the mover,
//! a stalled mover stalls the reader.
//!
//! The first error wins. A failing stage parks its error in the shared
//! fault slot and drops its channel endpoints; the disconnect wakes every
//! other stage, which then drains and exits without overwriting the fault.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::checksum::Checksum;
use crate::compress::{compress_buf_size, Compressor};
use crate::crypto::{CryptoContext, PageEncryptor};
use crate::image::ImageConfig;
use crate::mem::{round_up_page_size, PageBuf};
use crate::writer::{PageIo, SwapWriter};
use crate::{Error, Result};

/// Write-buffer ring depth.
pub const WRITE_BUFFERS: usize = 4;
/// Work buffer size, in pages; one batch.
pub const BUFFER_PAGES: usize = 32;
/// Encrypt-buffer ring depth, in pages.
pub const ENCRYPT_BUF_PAGES: usize = 64;

/// One filled write buffer in flight, with its true payload length.
struct Batch {
    buf: PageBuf,
    len: usize,
}

pub(crate) struct SaveContext<'a, 'b> {
    pub config: &'a ImageConfig,
    pub crypto: Option<&'a CryptoContext>,
    pub checksum: Checksum,
    /// Expected page count; drives the progress meter only, the stream
    /// itself is read to end-of-image.
    pub nr_pages: u64,
    /// Bytes already read off the stream by the caller, to be prepended.
    pub preloaded: &'b [u8],
    pub abort: Option<&'a AtomicBool>,
    pub progress: Option<&'a mut dyn FnMut(u32)>,
}

/// Stream the whole image through the configured transforms into the
/// writer, then terminate the extent-map chain. Returns the digest over the
/// plaintext stream.
pub(crate) fn save_image(
    writer: &mut SwapWriter<'_>,
    input: &mut dyn Read,
    ctx: SaveContext<'_, '_>,
) -> Result<[u8; 16]> {
    let digest = if ctx.config.threads {
        save_threaded(writer, input, ctx)?
    } else {
        save_single(writer, input, ctx)?
    };
    writer.save_extents(true)?;
    Ok(digest)
}

/// Read one page, tolerating split reads. `Ok(false)` is a clean end of
/// image at a page boundary; anything else short is an error.
pub(crate) fn read_full_page(input: &mut dyn Read, page: &mut [u8]) -> Result<bool> {
    let mut got = 0;
    while got < page.len() {
        match input.read(&mut page[got..])? {
            0 => break,
            n => got += n,
        }
    }
    if got == 0 {
        Ok(false)
    } else if got == page.len() {
        Ok(true)
    } else {
        Err(Error::Corrupt("image ends inside a page"))
    }
}

/// Progress meter and abort hook, polled once per page read.
struct Meter<'a> {
    every: u64,
    pages: u64,
    writeout_rate: u64,
    abort: Option<&'a AtomicBool>,
    progress: Option<&'a mut dyn FnMut(u32)>,
}

impl<'a> Meter<'a> {
    fn new(
        nr_pages: u64,
        early_writeout: bool,
        abort: Option<&'a AtomicBool>,
        progress: Option<&'a mut dyn FnMut(u32)>,
    ) -> Meter<'a> {
        let every = (nr_pages / 100).max(1);
        Meter {
            every,
            pages: 0,
            writeout_rate: if early_writeout { every } else { u64::MAX },
            abort,
            progress,
        }
    }

    fn tick(&mut self, dev: &dyn PageIo) -> Result<()> {
        self.pages += 1;
        if self.pages % self.every == 0 {
            if let Some(flag) = self.abort {
                if flag.load(Ordering::Relaxed) {
                    return Err(Error::Aborted);
                }
            }
            if let Some(progress) = &mut self.progress {
                progress(((self.pages / self.every) as u32).min(100));
            }
        }
        if self.pages % self.writeout_rate == 0 {
            dev.start_writeout();
        }
        Ok(())
    }
}

fn save_single(
    writer: &mut SwapWriter<'_>,
    input: &mut dyn Read,
    ctx: SaveContext<'_, '_>,
) -> Result<[u8; 16]> {
    let SaveContext {
        config,
        crypto,
        mut checksum,
        nr_pages,
        preloaded,
        abort,
        progress,
    } = ctx;

    let page_size = writer.page_size();
    let buffer_size = config.buffer_pages * page_size;
    let dev = writer.device();

    let mut work = PageBuf::new(buffer_size)?;
    let mut compressor = config.compress.then(Compressor::new);
    let mut scratch = match compressor {
        Some(_) => Some(PageBuf::new(compress_buf_size(buffer_size, page_size))?),
        None => None,
    };
    let mut crypter = crypto.map(CryptoContext::encryptor).transpose()?;
    let mut enc_page = match crypter {
        Some(_) => Some(PageBuf::new(page_size)?),
        None => None,
    };

    assert!(preloaded.len() < buffer_size);
    work[..preloaded.len()].copy_from_slice(preloaded);
    let mut fill = preloaded.len();
    let mut meter = Meter::new(nr_pages, config.early_writeout, abort, progress);

    let mut flush = |work: &PageBuf, fill: usize, checksum: &mut Checksum| -> Result<()> {
        if fill == 0 {
            return Ok(());
        }
        checksum.update(&work[..fill]);
        let (src, len): (&[u8], usize) = match (&mut compressor, &mut scratch) {
            (Some(compressor), Some(scratch)) => {
                let frame = compressor.compress_batch(&work[..fill], scratch)?;
                (scratch, frame)
            }
            _ => (work, fill),
        };
        let padded = round_up_page_size(len as u64, page_size) as usize;
        for chunk in src[..padded].chunks(page_size) {
            match (&mut crypter, &mut enc_page) {
                (Some(crypter), Some(enc_page)) => {
                    crypter.encrypt_page(chunk, enc_page);
                    writer.save_page(enc_page)?;
                }
                _ => writer.save_page(chunk)?,
            }
        }
        Ok(())
    };

    loop {
        if !read_full_page(input, &mut work[fill..fill + page_size])? {
            break;
        }
        fill += page_size;
        meter.tick(dev)?;
        if fill == buffer_size {
            flush(&work, fill, &mut checksum)?;
            fill = 0;
        }
    }
    flush(&work, fill, &mut checksum)?;

    Ok(checksum.finish())
}

fn set_fault(fault: &Mutex<Option<Error>>, err: Error) {
    let mut slot = fault.lock().unwrap();
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn save_threaded(
    writer: &mut SwapWriter<'_>,
    input: &mut dyn Read,
    ctx: SaveContext<'_, '_>,
) -> Result<[u8; 16]> {
    let SaveContext {
        config,
        crypto,
        mut checksum,
        nr_pages,
        preloaded,
        abort,
        progress,
    } = ctx;

    let page_size = writer.page_size();
    let buffer_size = config.buffer_pages * page_size;
    let write_buf_size = if config.compress {
        compress_buf_size(buffer_size, page_size)
    } else {
        buffer_size
    };
    let dev = writer.device();

    let ring = config.write_buffers.max(2);
    let (batch_tx, batch_rx) = bounded::<Batch>(ring);
    let (bfree_tx, bfree_rx) = bounded::<PageBuf>(ring);
    for _ in 0..ring {
        let buf = PageBuf::new(write_buf_size)?;
        bfree_tx.send(buf).expect("free ring sized to its buffers");
    }

    let crypter = crypto.map(CryptoContext::encryptor).transpose()?;
    let enc_ring = config.encrypt_pages.max(2);
    let mut enc_pages = Vec::new();
    if crypter.is_some() {
        for _ in 0..enc_ring {
            enc_pages.push(PageBuf::new(page_size)?);
        }
    }

    let fault = Mutex::new(None::<Error>);

    let mut work = PageBuf::new(buffer_size)?;
    assert!(preloaded.len() < buffer_size);
    work[..preloaded.len()].copy_from_slice(preloaded);
    let mut fill = preloaded.len();
    let mut compressor = config.compress.then(Compressor::new);
    let mut meter = Meter::new(nr_pages, config.early_writeout, abort, progress);

    std::thread::scope(|scope| {
        let fault = &fault;

        if let Some(crypter) = crypter {
            let (page_tx, page_rx) = bounded::<PageBuf>(enc_ring);
            let (pfree_tx, pfree_rx) = bounded::<PageBuf>(enc_ring);
            for buf in enc_pages.drain(..) {
                pfree_tx.send(buf).expect("free ring sized to its buffers");
            }

            scope.spawn(move || {
                move_and_encrypt(batch_rx, bfree_tx, pfree_rx, page_tx, crypter, page_size)
            });

            let writer = &mut *writer;
            scope.spawn(move || save_encrypted(page_rx, pfree_tx, writer, fault));
        } else {
            let writer = &mut *writer;
            scope.spawn(move || move_and_save(batch_rx, bfree_tx, writer, page_size, fault));
        }

        // The reader stays on this thread: pull pages, hash, compress,
        // publish batches. Ends by dropping its sender so the stages drain.
        let result = (|| -> Result<()> {
            loop {
                if !read_full_page(input, &mut work[fill..fill + page_size])? {
                    break;
                }
                fill += page_size;
                meter.tick(dev)?;
                if fill == buffer_size {
                    checksum.update(&work[..fill]);
                    publish(&work, fill, &bfree_rx, &batch_tx, &mut compressor)?;
                    fill = 0;
                }
            }
            if fill > 0 {
                checksum.update(&work[..fill]);
                publish(&work, fill, &bfree_rx, &batch_tx, &mut compressor)?;
            }
            Ok(())
        })();

        if let Err(err) = result {
            // A closed ring means a downstream stage already filed the
            // real cause; anything else is the reader's own failure.
            set_fault(fault, err);
        }
        drop(batch_tx);
        drop(bfree_rx);
    });

    match fault.into_inner().unwrap() {
        Some(err) => Err(err),
        None => Ok(checksum.finish()),
    }
}

/// Hand one filled work buffer downstream. Blocks on the free list while
/// all write buffers are in flight; that block is the reader's
/// back-pressure.
fn publish(
    work: &PageBuf,
    fill: usize,
    bfree_rx: &Receiver<PageBuf>,
    batch_tx: &Sender<Batch>,
    compressor: &mut Option<Compressor>,
) -> Result<()> {
    let mut buf = bfree_rx
        .recv()
        .map_err(|_| Error::Corrupt("write-buffer ring closed"))?;
    let len = match compressor {
        Some(compressor) => compressor.compress_batch(&work[..fill], &mut buf)?,
        None => {
            buf[..fill].copy_from_slice(&work[..fill]);
            fill
        }
    };
    batch_tx
        .send(Batch { buf, len })
        .map_err(|_| Error::Corrupt("write-buffer ring closed"))?;
    Ok(())
}

/// Mover stage with encryption: pages of each batch go through the cipher
/// into the encrypt ring, the emptied write buffer returns to the reader.
fn move_and_encrypt(
    batch_rx: Receiver<Batch>,
    bfree_tx: Sender<PageBuf>,
    pfree_rx: Receiver<PageBuf>,
    page_tx: Sender<PageBuf>,
    mut crypter: PageEncryptor,
    page_size: usize,
) {
    while let Ok(batch) = batch_rx.recv() {
        let padded = round_up_page_size(batch.len as u64, page_size) as usize;
        for chunk in batch.buf[..padded].chunks(page_size) {
            let Ok(mut page) = pfree_rx.recv() else {
                // The saver died; its error is already filed.
                return;
            };
            crypter.encrypt_page(chunk, &mut page);
            if page_tx.send(page).is_err() {
                return;
            }
        }
        // The reader may be gone already while batches still drain; then
        // nobody needs the buffer back.
        let _ = bfree_tx.send(batch.buf);
    }
    debug!("mover drained");
}

/// Saver stage behind the encrypt ring.
fn save_encrypted(
    page_rx: Receiver<PageBuf>,
    pfree_tx: Sender<PageBuf>,
    writer: &mut SwapWriter<'_>,
    fault: &Mutex<Option<Error>>,
) {
    while let Ok(page) = page_rx.recv() {
        if let Err(err) = writer.save_page(&page) {
            set_fault(fault, err);
            return;
        }
        let _ = pfree_tx.send(page);
    }
    debug!("saver drained");
}

/// Combined mover/saver when there is nothing to encrypt.
fn move_and_save(
    batch_rx: Receiver<Batch>,
    bfree_tx: Sender<PageBuf>,
    writer: &mut SwapWriter<'_>,
    page_size: usize,
    fault: &Mutex<Option<Error>>,
) {
    while let Ok(batch) = batch_rx.recv() {
        let padded = round_up_page_size(batch.len as u64, page_size) as usize;
        for chunk in batch.buf[..padded].chunks(page_size) {
            if let Err(err) = writer.save_page(chunk) {
                set_fault(fault, err);
                return;
            }
        }
        let _ = bfree_tx.send(batch.buf);
    }
    debug!("writer drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn full_pages_only() {
        let mut page = [0u8; 8];
        let mut input = Cursor::new(vec![1u8; 16]);
        assert!(read_full_page(&mut input, &mut page).unwrap());
        assert!(read_full_page(&mut input, &mut page).unwrap());
        assert!(!read_full_page(&mut input, &mut page).unwrap());
    }

    #[test]
    fn torn_tail_is_an_error() {
        let mut page = [0u8; 8];
        let mut input = Cursor::new(vec![1u8; 12]);
        assert!(read_full_page(&mut input, &mut page).unwrap());
        assert!(read_full_page(&mut input, &mut page).is_err());
    }
}
