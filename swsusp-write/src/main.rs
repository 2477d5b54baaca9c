mod config;
mod supervisor;
mod system;

use std::fs::File;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::error;

use swsusp_image::crypto::CryptoContext;
use swsusp_image::{page_size, Error, ImageConfig};
use swsusp_snapdev::{ResumeDevice, SnapshotDevice};

use config::{Cli, Config};
use supervisor::Run;

static ABORT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_abort_signal(_: libc::c_int) {
    ABORT.store(true, Ordering::Relaxed);
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::from_cli(Cli::parse()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("s2disk: {err}");
            return exit_errno(libc::EINVAL);
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "suspend failed");
            exit_errno(err.raw_os_error().unwrap_or(libc::EINVAL))
        }
    }
}

fn exit_errno(errno: i32) -> ExitCode {
    ExitCode::from((errno & 0xff) as u8)
}

fn run(config: Config) -> Result<(), Error> {
    let page_size = page_size();

    system::ensure_stdio()?;
    system::lock_memory()?;

    let test_file = match &config.test_file {
        Some(path) => {
            let mut file = File::open(path)?;
            let size = system::test_file_size(&mut file, page_size)?;
            if size == 0 {
                error!(path = %path.display(), "test image file is empty");
                return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENODATA)));
            }
            Some((file, size))
        }
        None => None,
    };

    // Key material is set up before descriptors are locked down; a
    // passphrase prompt is the last interactive thing we do.
    let crypto = if config.encrypt {
        match &config.rsa_key_file {
            Some(path) if path.exists() => {
                let pem = std::fs::read_to_string(path)?;
                Some(CryptoContext::with_rsa_key(&pem)?)
            }
            _ => {
                let passphrase = system::read_passphrase("s2disk: passphrase: ")?;
                Some(CryptoContext::with_passphrase(&passphrase))
            }
        }
    } else {
        None
    };

    // The resume device is reached through a node on a private tmpfs; the
    // name disappears with the unmount whatever happens later.
    let mount = match system::PrivateMount::with_resume_node(&config.resume_device) {
        Ok(mount) => mount,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            error!(device = %config.resume_device.display(), "no such resume device");
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENODEV)));
        }
        Err(err) => return Err(err.into()),
    };
    let resume = ResumeDevice::from_file(mount.device.try_clone()?, page_size);

    let snapshot = match SnapshotDevice::open(&config.snapshot_device) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(device = %config.snapshot_device.display(), "could not open the snapshot device");
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => {
                    Error::Io(std::io::Error::from_raw_os_error(libc::ENODEV))
                }
                _ => err.into(),
            });
        }
    };

    let rdev = std::fs::metadata(&config.resume_device)?;
    use std::os::unix::fs::MetadataExt;
    snapshot.set_swap_area(rdev.rdev(), config.resume_offset)?;

    unsafe {
        libc::signal(libc::SIGINT, on_abort_signal as usize);
    }

    let image_config = ImageConfig {
        checksum: config.compute_checksum || config.verify_image,
        compress: config.compress,
        threads: config.threads,
        early_writeout: config.early_writeout,
        platform_suspend: config.shutdown_method == config::ShutdownMethod::Platform,
        resume_pause: config.resume_pause,
        ..ImageConfig::default()
    };

    let _loglevel = system::save_console_loglevel(config.suspend_loglevel);
    let _swappiness = system::save_swappiness(config.suspend_swappiness);
    system::sync_filesystems();
    system::drop_rlimits();

    let mut run = Run {
        config,
        image_config,
        crypto,
        snapshot,
        resume,
        test_file,
        page_size,
        abort: &ABORT,
    };
    supervisor::suspend_system(&mut run)

    // `mount`, `_loglevel` and `_swappiness` restore their state when this
    // frame unwinds; on the committed path the machine is off before that.
}
