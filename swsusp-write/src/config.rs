//! Runtime configuration.
//!
//! Config-file handling lives outside this program; everything is driven
//! from the command line, with `-P "name = value"` accepting the classic
//! parameter names as overrides for scripts that carry them around.

use std::path::PathBuf;

use clap::Parser;

pub const DEFAULT_SNAPSHOT_DEVICE: &str = "/dev/snapshot";
pub const DEFAULT_RESUME_DEVICE: &str = "/dev/resume";
const RESUME_PAUSE_MAX: u32 = 10;

#[derive(Parser)]
#[command(
    name = "s2disk",
    version,
    about = "Write a hibernation image to the resume device and power off"
)]
pub struct Cli {
    /// Device that contains the swap area.
    #[arg(short = 'r', long)]
    resume_device: Option<PathBuf>,

    /// Page offset of the swap header inside the resume device.
    #[arg(short = 'o', long)]
    resume_offset: Option<u64>,

    /// Desired size of the image in bytes; zero means "as much as fits".
    #[arg(short = 's', long)]
    image_size: Option<u64>,

    /// Override a configuration parameter, e.g. -P "compress = y".
    #[arg(short = 'P', long = "parameter", value_name = "NAME=VALUE")]
    parameters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMethod {
    Shutdown,
    Platform,
    Reboot,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub snapshot_device: PathBuf,
    pub resume_device: PathBuf,
    pub resume_offset: u64,
    /// Preferred image size in bytes; zero lets free swap decide.
    pub image_size: u64,
    pub suspend_loglevel: i32,
    pub suspend_swappiness: i32,
    pub compute_checksum: bool,
    pub compress: bool,
    pub encrypt: bool,
    pub rsa_key_file: Option<PathBuf>,
    pub early_writeout: bool,
    pub shutdown_method: ShutdownMethod,
    pub resume_pause: u32,
    pub test_file: Option<PathBuf>,
    pub verify_image: bool,
    pub threads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            snapshot_device: DEFAULT_SNAPSHOT_DEVICE.into(),
            resume_device: DEFAULT_RESUME_DEVICE.into(),
            resume_offset: 0,
            image_size: 0,
            suspend_loglevel: 1,
            suspend_swappiness: 0,
            compute_checksum: false,
            compress: false,
            encrypt: false,
            rsa_key_file: None,
            early_writeout: true,
            shutdown_method: ShutdownMethod::Platform,
            resume_pause: 0,
            test_file: None,
            verify_image: false,
            threads: false,
        }
    }
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, String> {
        let mut config = Config::default();
        for parameter in &cli.parameters {
            config.apply_parameter(parameter)?;
        }
        if let Some(device) = cli.resume_device {
            config.resume_device = device;
        }
        if let Some(offset) = cli.resume_offset {
            config.resume_offset = offset;
        }
        if let Some(size) = cli.image_size {
            config.image_size = size;
        }
        config.resume_pause = config.resume_pause.min(RESUME_PAUSE_MAX);
        Ok(config)
    }

    /// Apply one `name = value` override using the traditional parameter
    /// names.
    pub fn apply_parameter(&mut self, parameter: &str) -> Result<(), String> {
        let (name, value) = parameter
            .split_once('=')
            .ok_or_else(|| format!("malformed parameter '{parameter}'"))?;
        let name = name.trim();
        let value = value.trim();

        let yes = |value: &str| matches!(value, "y" | "Y" | "1" | "yes");
        match name {
            "snapshot device" => self.snapshot_device = value.into(),
            "resume device" => self.resume_device = value.into(),
            "resume offset" => {
                self.resume_offset = value
                    .parse()
                    .map_err(|_| format!("bad resume offset '{value}'"))?
            }
            "image size" => {
                self.image_size = value
                    .parse()
                    .map_err(|_| format!("bad image size '{value}'"))?
            }
            "suspend loglevel" => {
                self.suspend_loglevel = value
                    .parse()
                    .map_err(|_| format!("bad loglevel '{value}'"))?
            }
            "compute checksum" => self.compute_checksum = yes(value),
            "compress" => self.compress = yes(value),
            "encrypt" => self.encrypt = yes(value),
            "RSA key file" => self.rsa_key_file = Some(value.into()),
            "early writeout" => self.early_writeout = !matches!(value, "n" | "N" | "0" | "no"),
            "shutdown method" => {
                self.shutdown_method = match value {
                    "shutdown" => ShutdownMethod::Shutdown,
                    "platform" => ShutdownMethod::Platform,
                    "reboot" => ShutdownMethod::Reboot,
                    other => return Err(format!("unknown shutdown method '{other}'")),
                }
            }
            "resume pause" => {
                self.resume_pause = value
                    .parse()
                    .map_err(|_| format!("bad resume pause '{value}'"))?
            }
            "debug test file" => self.test_file = Some(value.into()),
            "debug verify image" => self.verify_image = yes(value),
            "threads" => self.threads = yes(value),
            other => return Err(format!("unknown parameter '{other}'")),
        }
        Ok(())
    }
}
