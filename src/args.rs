use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

// CLI root definition. This is the single entrypoint for all supported modes.
#[derive(Parser, Debug)]
#[command(name = "dqlogger", version)]
#[command(about = "Continuous logger for DigiQuartz 6000-16B-IS infrasound barometers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: AppCommand,
}

// Subcommands map directly to one module each under src/commands/.
#[derive(Subcommand, Debug)]
pub enum AppCommand {
    /// Discover and configure barometers, then log continuous samples to hourly files
    Log(LogArgs),
    /// Discover barometers and print their settings without changing anything
    Probe(ProbeArgs),
}

impl AppCommand {
    pub fn verbose(&self) -> bool {
        match self {
            AppCommand::Log(args) => args.verbose,
            AppCommand::Probe(args) => args.verbose,
        }
    }
}

// Port selection and response timing shared by both commands.
#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    /// Serial port to probe (repeatable); skips port enumeration
    #[arg(long = "port")]
    pub ports: Vec<String>,
    /// Substring an enumerated port name must contain to be probed (repeatable)
    #[arg(long = "port-pattern", default_values = ["USB", "usbserial"])]
    pub port_patterns: Vec<String>,
    /// How long to wait for a model-number answer while probing
    #[arg(long, default_value_t = 200)]
    pub probe_timeout_ms: u64,
    /// How long to wait for any configuration response
    #[arg(long, default_value_t = 2_000)]
    pub response_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Print samples to the console instead of saving them
    #[arg(short, long)]
    pub test: bool,
    /// Echo every command and response
    #[arg(short, long)]
    pub verbose: bool,
    /// Continuous sample rate in Hz (1-45)
    #[arg(short = 's', long, default_value_t = 20)]
    pub sample_rate: u32,
    /// Root directory for DQLOG-YYYYMMDD folders; must already exist
    #[arg(short = 'r', long, env = "DQLOGGER_LOG_ROOT", default_value = "./")]
    pub log_root: PathBuf,
    #[command(flatten)]
    pub link: LinkArgs,
    /// Consecutive read timeouts before a barometer is considered failed
    #[arg(long, default_value_t = 3)]
    pub failure_threshold: u32,
    /// Read wait as a multiple of the sample period
    #[arg(long, default_value_t = 1.5)]
    pub timeout_multiplier: f64,
    #[arg(long, default_value_t = 5)]
    pub flush_interval_secs: u64,
    /// Pause after each stop command during shutdown
    #[arg(long, default_value_t = 200)]
    pub stop_settle_ms: u64,
    /// Single-instance lock file (default: <log root>/dqlogger.lock)
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    #[arg(short, long)]
    pub verbose: bool,
    /// Sample rate the reported settings are compared against
    #[arg(short = 's', long, default_value_t = 20)]
    pub sample_rate: u32,
    #[command(flatten)]
    pub link: LinkArgs,
}
