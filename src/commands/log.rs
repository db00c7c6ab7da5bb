use crate::acquire::configure::{DesiredConfig, configure_all};
use crate::acquire::discovery::{MODEL_ID, ProbeSettings, candidate_ports, discover};
use crate::acquire::scheduler::{RunOutcome, SamplingPolicy, Scheduler};
use crate::args::LogArgs;
use crate::device::DeviceState;
use crate::device::transport::{PortOpener, SerialOpener};
use crate::shared::clock::SystemClock;
use crate::shared::lock::{LockGuard, default_lock_path};
use crate::shared::log_writer::{LogWriter, Output};
use crate::shared::signal::install_ctrlc_handler;
use anyhow::{Result, bail};
use std::path::Path;
use std::time::Duration;

pub const MIN_SAMPLE_RATE: u32 = 1;
pub const MAX_SAMPLE_RATE: u32 = 45;

// Public log command entrypoint: validate, discover, configure, then sample until Ctrl-C.
pub fn run_log(args: LogArgs) -> Result<()> {
    run_log_with_opener(args, &mut SerialOpener)
}

pub(crate) fn run_log_with_opener(args: LogArgs, opener: &mut dyn PortOpener) -> Result<()> {
    // Startup checks come before any port is touched. The log root must exist even in
    // test mode.
    let sample_rate = validate_sample_rate(args.sample_rate)?;
    validate_log_root(&args.log_root)?;
    let policy = sampling_policy(&args)?;

    log::info!("test mode   = {}", args.test);
    log::info!("sample rate = {} Hz", sample_rate);
    log::info!("log root directory = {}", args.log_root.display());

    let ports = candidate_ports(&args.link.ports, &args.link.port_patterns)?;
    if ports.is_empty() {
        bail!("no usbserial ports found");
    }
    for port in &ports {
        log::info!("found: {}", port);
    }

    let probe = ProbeSettings {
        timeout: Duration::from_millis(args.link.probe_timeout_ms),
        ..ProbeSettings::default()
    };
    let mut devices = discover(&ports, opener, &probe);
    if devices.is_empty() {
        bail!("no {} barometer(s) found", MODEL_ID);
    }
    log::info!("{} barometer(s) found", devices.len());

    let desired = DesiredConfig::for_sample_rate(sample_rate);
    let configured = configure_all(
        &mut devices,
        &desired,
        Duration::from_millis(args.link.response_timeout_ms),
        &SystemClock,
    );
    if configured == 0 {
        bail!("every barometer failed configuration");
    }
    // Devices that failed configuration are already closed; the scheduler never sees them.
    devices.retain(|device| device.state() == DeviceState::Configuring);

    let (output, _lock) = if args.test {
        (Output::Console, None)
    } else {
        let lock_path = args
            .lock_file
            .clone()
            .unwrap_or_else(|| default_lock_path(&args.log_root));
        let lock = LockGuard::acquire(&lock_path)?;
        (Output::Files(args.log_root.clone()), Some(lock))
    };
    let writer = LogWriter::new(
        output,
        sample_rate,
        devices.len(),
        Duration::from_secs(args.flush_interval_secs.max(1)),
    );

    // Until here Ctrl-C still kills the process outright; nothing is streaming yet.
    let running = install_ctrlc_handler()?;

    let mut scheduler = Scheduler::new(devices, writer, Box::new(SystemClock), policy);
    if scheduler.start() == 0 {
        scheduler.shutdown()?;
        bail!("no barometer entered continuous sampling");
    }
    log::info!("running...quit with ctrl-C...");

    let outcome = scheduler.run(&running)?;
    let failed = scheduler
        .devices()
        .iter()
        .filter(|device| device.state() == DeviceState::Failed)
        .count();
    log::info!(
        "logger stopped, wrote {} samples to {} file(s), {} of {} barometer(s) failed",
        scheduler.sink().lines_written(),
        scheduler.sink().files_opened(),
        failed,
        scheduler.devices().len()
    );
    match outcome {
        RunOutcome::Interrupted => Ok(()),
        RunOutcome::AllFailed => bail!("all barometers failed during sampling"),
    }
}

pub fn validate_sample_rate(sample_rate: u32) -> Result<u32> {
    if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
        bail!(
            "sample rate must be an integer between {} and {} Hz, got {}",
            MIN_SAMPLE_RATE,
            MAX_SAMPLE_RATE,
            sample_rate
        );
    }
    Ok(sample_rate)
}

pub fn validate_log_root(log_root: &Path) -> Result<()> {
    if !log_root.is_dir() {
        bail!("log root directory \"{}\" does not exist", log_root.display());
    }
    Ok(())
}

fn sampling_policy(args: &LogArgs) -> Result<SamplingPolicy> {
    if args.failure_threshold == 0 {
        bail!("failure threshold must be at least 1");
    }
    if !(args.timeout_multiplier.is_finite() && args.timeout_multiplier > 0.0) {
        bail!(
            "timeout multiplier must be a positive number, got {}",
            args.timeout_multiplier
        );
    }
    Ok(SamplingPolicy {
        sample_rate: args.sample_rate,
        failure_threshold: args.failure_threshold,
        timeout_multiplier: args.timeout_multiplier,
        stop_settle: Duration::from_millis(args.stop_settle_ms),
    })
}
