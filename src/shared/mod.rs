pub mod clock;
pub mod lock;
pub mod log_writer;
pub mod signal;
