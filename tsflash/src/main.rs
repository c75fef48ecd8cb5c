use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use console::style;
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::process::ExitCode;
use tsflash_core::cancel::CancelToken;
use tsflash_core::config::DEFAULT_CONFIG_PATH;
use tsflash_core::device::PortPath;
use tsflash_core::rpiboot::DEFAULT_BOOTCODE_PATH;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

mod daemon;
mod flash;
mod tui;
mod ui;
mod usb;

/// Exit code for a run stopped with Ctrl+C.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "tsflash")]
#[command(about = "Hands-off, parallel SD card flashing for USB hubs", version)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only show warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a single device
    Flash(FlashArgs),
    /// Show the USB devices on the hub
    Usb {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        /// List the whole USB tree instead of the first hub
        #[arg(long, conflicts_with = "port")]
        all: bool,

        /// Only list this port and what is below it, e.g. 1-2
        #[arg(long)]
        port: Option<PortPath>,
    },
    /// Put a Raspberry Pi boot ROM into mass-storage mode
    Rpiboot {
        /// Port of the device to boot; the first boot ROM found otherwise
        #[arg(long)]
        port: Option<PortPath>,

        /// Second-stage loader sent to the boot ROM
        #[arg(long, default_value = DEFAULT_BOOTCODE_PATH)]
        bootcode: PathBuf,
    },
    /// Flash every card plugged into the hub, logging to stderr
    Daemon {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Flash every card plugged into the hub with a live view
    Tui(TuiArgs),
}

#[derive(Args)]
pub struct FlashArgs {
    /// Image file to write (raw, .gz, .xz or .zst)
    pub image: PathBuf,

    /// Device to write to, e.g. /dev/sda
    pub target: PathBuf,

    /// Size of each write, e.g. 4M or 512K
    #[arg(short, long, default_value = "4M")]
    pub block_size: String,

    /// Skip write verification
    #[arg(short = 'n', long = "no-verify")]
    pub no_verify: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Log progress instead of drawing progress bars; implies no prompts
    #[arg(long)]
    pub non_interactive: bool,
}

#[derive(Args)]
pub struct TuiArgs {
    /// Image file to write (raw, .gz, .xz or .zst)
    pub image: PathBuf,

    /// Hub port to watch, e.g. 1-2; the first hub found otherwise
    #[arg(long)]
    pub port: Option<PortPath>,

    /// Size of each write, e.g. 4M or 512K
    #[arg(short, long, default_value = "4M")]
    pub block_size: String,

    /// Seconds a device must stay attached before it is used
    #[arg(long, default_value_t = 3.0)]
    pub stable_delay: f64,

    /// Skip write verification
    #[arg(short = 'n', long = "no-verify")]
    pub no_verify: bool,

    /// Maximum number of cards written at once
    #[arg(short, long)]
    pub parallelism: Option<usize>,

    /// Second-stage loader sent to boot ROMs
    #[arg(long, default_value = DEFAULT_BOOTCODE_PATH)]
    pub bootcode: PathBuf,
}

/// How a command ended, when it did not fail outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
    Cancelled,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Turning it off keeps progress bars intact when the user cancels. The
/// original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

impl Cli {
    /// The level chosen on the command line, if any.
    fn log_level(&self) -> Option<log::LevelFilter> {
        if self.verbose {
            Some(log::LevelFilter::Debug)
        } else if self.quiet {
            Some(log::LevelFilter::Warn)
        } else {
            None
        }
    }
}

/// Installs the logger. `RUST_LOG`, when set, wins over `level`.
pub fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .format_target(false)
        .parse_default_env()
        .init();
}

fn run(cli: Cli, cancel: CancelToken) -> Result<Outcome> {
    let level = cli.log_level();
    match cli.command {
        Commands::Flash(args) => {
            init_logging(level.unwrap_or(log::LevelFilter::Info));
            flash::run(args, cancel)
        }
        Commands::Usb { json, all, port } => {
            init_logging(level.unwrap_or(log::LevelFilter::Warn));
            usb::list(json, all, port)
        }
        Commands::Rpiboot { port, bootcode } => {
            init_logging(level.unwrap_or(log::LevelFilter::Info));
            usb::rpiboot(port, &bootcode)
        }
        Commands::Daemon { config } => daemon::run(&config, level, cancel),
        Commands::Tui(args) => {
            // Log lines would tear the live view apart.
            init_logging(level.unwrap_or(log::LevelFilter::Error));
            tui::run(args, cancel)
        }
    }
}

fn main() -> ExitCode {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();

    // Ctrl+C and SIGTERM both ask the running command to stop cleanly.
    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || on_signal.cancel()) {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        return ExitCode::FAILURE;
    }

    match run(cli, cancel) {
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::Failed) => ExitCode::FAILURE,
        Ok(Outcome::Cancelled) => ExitCode::from(EXIT_CANCELLED),
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
