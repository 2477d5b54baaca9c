//! The suspend supervisor: freeze, snapshot, write, commit, power off.

use std::fs::File;
use std::io::Read;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tracing::{error, info, warn};

use swsusp_image::crypto::CryptoContext;
use swsusp_image::verify::verify_image;
use swsusp_image::writer::PageIo;
use swsusp_image::{write_image, Error, ImageConfig, Result, WriteOutcome, WriteParams};
use swsusp_snapdev::{
    mark_swap, power_off, reboot, reset_signature, ResumeDevice, Snapshot, SnapshotDevice,
};

use crate::config::{Config, ShutdownMethod};

pub struct Run {
    pub config: Config,
    pub image_config: ImageConfig,
    pub crypto: Option<CryptoContext>,
    pub snapshot: SnapshotDevice,
    pub resume: ResumeDevice,
    pub test_file: Option<(File, u64)>,
    pub page_size: usize,
    pub abort: &'static AtomicBool,
}

/// Never hand control back to a system whose on-disk state we can no
/// longer vouch for.
fn sleep_forever() -> ! {
    error!(
        "cannot establish a sane on-disk state; refusing to continue. \
         Power the machine down manually."
    );
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

/// Freeze, snapshot and write the image. Returns only on failure or after
/// a resume; success leaves through the machine's power switch.
pub fn suspend_system(run: &mut Run) -> Result<()> {
    let avail_swap = run.snapshot.avail_swap()?;
    if avail_swap == 0 {
        error!("no free swap on the resume device");
        return Err(Error::NoSwapSpace);
    }
    let preferred = if run.config.image_size > 0 {
        run.config.image_size
    } else {
        avail_swap
    };
    let mut image_size = preferred.min(avail_swap);

    if let Err(err) = run.snapshot.freeze() {
        let _ = run.snapshot.unfreeze();
        return Err(err.into());
    }
    let result = suspend_frozen(run, &mut image_size);
    // We only get here on failure or after the kernel restored the image;
    // the committed path never returns.
    run.snapshot.unfreeze()?;
    result
}

fn suspend_frozen(run: &mut Run, image_size: &mut u64) -> Result<()> {
    if run.test_file.is_some() {
        info!("running in test mode");
        return test_run(run);
    }

    if run.config.shutdown_method == ShutdownMethod::Platform {
        if let Err(err) = run.snapshot.platform_prepare() {
            warn!(%err, "platform hibernation unavailable, using shutdown mode");
            run.config.shutdown_method = ShutdownMethod::Shutdown;
        }
    }

    let mut attempts = 2;
    loop {
        run.snapshot.set_image_size(*image_size)?;
        match run.snapshot.create_image()? {
            Snapshot::Resumed => {
                info!("returned to userspace after resume");
                run.snapshot.free_snapshot()?;
                return Ok(());
            }
            Snapshot::Snapshotted => {}
        }

        match write_and_commit(run) {
            Ok(()) => {
                // Committed. The signature is on disk; from here the only
                // acceptable exits are through the firmware.
                shutdown(run);
            }
            Err(err) => {
                let _ = run.snapshot.free_swap_pages();
                let _ = run.snapshot.free_snapshot();
                *image_size = 0;
                attempts -= 1;
                // Retry once with a minimal image; anything but swap
                // shortage is final, as is the second shortage.
                if !err.is_no_swap_space() || attempts == 0 {
                    return Err(err);
                }
                warn!("not enough swap, retrying with a minimal image");
            }
        }
    }
}

/// Write the image from the snapshot device and commit the signature.
fn write_and_commit(run: &mut Run) -> Result<()> {
    // Zero means the kernel cannot report the size; the writer then pulls
    // it out of the image's own first page.
    let image_size = run.snapshot.image_size()?;

    let outcome = write_to_resume(run, image_size, None)?;
    verify_if_configured(run, &outcome)?;
    commit(run, outcome.start)?;
    Ok(())
}

fn write_to_resume(
    run: &mut Run,
    image_size: u64,
    test_input: Option<&mut dyn Read>,
) -> Result<WriteOutcome> {
    let mut shown = 0;
    let mut progress = |percent: u32| {
        if percent != shown {
            shown = percent;
            eprint!("\rs2disk: saving image... {percent:3}%");
            if percent == 100 {
                eprintln!();
            }
        }
    };

    let params = WriteParams {
        config: &run.image_config,
        crypto: run.crypto.as_ref(),
        image_size,
        abort: Some(run.abort),
        progress: Some(&mut progress),
    };

    let dev: &dyn PageIo = &run.resume;
    match test_input {
        Some(input) => write_image(dev, &run.snapshot, input, run.page_size, params),
        None => {
            let mut input = SnapshotReader(&run.snapshot);
            write_image(dev, &run.snapshot, &mut input, run.page_size, params)
        }
    }
}

/// `Read` view of the snapshot device for the image data stream.
struct SnapshotReader<'a>(&'a SnapshotDevice);

impl Read for SnapshotReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let ret = unsafe { libc::read(self.0.raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if ret < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

fn verify_if_configured(run: &Run, outcome: &WriteOutcome) -> Result<()> {
    if !run.config.verify_image {
        return Ok(());
    }
    info!("verifying the written image");
    let dev: &dyn PageIo = &run.resume;
    match verify_image(
        dev,
        run.crypto.as_ref(),
        &outcome.header,
        run.page_size,
        run.image_config.buffer_pages,
    ) {
        Ok(()) => {
            info!("image verified successfully");
            Ok(())
        }
        Err(err) => {
            error!(%err, "image verification failed");
            Err(err)
        }
    }
}

fn commit(run: &Run, start: u64) -> Result<()> {
    match mark_swap(&run.resume, run.config.resume_offset, start) {
        Ok(()) => Ok(()),
        Err(swsusp_snapdev::Error::CommitCorrupted) => sleep_forever(),
        Err(err) => Err(err.into()),
    }
}

fn uncommit(run: &Run) {
    if reset_signature(&run.resume, run.config.resume_offset).is_err() {
        // There may be a valid image on disk; continuing to run would
        // resume into stale caches on the next boot.
        sleep_forever();
    }
}

/// Test mode: the image comes from a regular file, nothing is powered off,
/// and the commit is undone at the end so the machine stays usable.
fn test_run(run: &mut Run) -> Result<()> {
    let (file, size) = run
        .test_file
        .as_ref()
        .map(|(file, size)| (file.try_clone(), *size))
        .expect("test mode without a test file");
    let mut input = file.map_err(Error::Io)?.take(size);

    let result = (|| {
        let outcome = write_to_resume(run, size, Some(&mut input))?;
        verify_if_configured(run, &outcome)?;
        commit(run, outcome.start)?;
        uncommit(run);
        Ok(())
    })();
    let _ = run.snapshot.free_swap_pages();
    result
}

/// Leave through the configured power transition. Only returns to the
/// eternal sleep below, never to the caller.
fn shutdown(run: &Run) -> ! {
    info!("image committed, shutting down");
    match run.config.shutdown_method {
        ShutdownMethod::Reboot => {
            reboot();
        }
        ShutdownMethod::Platform => {
            if let Err(err) = run.snapshot.platform_enter() {
                warn!(%err, "could not enter the platform state, powering off");
            }
            power_off();
        }
        ShutdownMethod::Shutdown => {
            power_off();
        }
    }
    // The signature is on disk; running on would corrupt the resumed
    // system with today's caches.
    error!("power-off failed; that should be impossible");
    sleep_forever();
}
