// Command implementations split by subcommand for clarity.
pub mod log;
pub mod probe;

pub use self::log::run_log;
pub use self::probe::run_probe;
