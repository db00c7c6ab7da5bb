use crate::device::codec::{self, Command};
use crate::device::{Device, DeviceState};
use crate::shared::clock::{Clock, stamp};
use crate::shared::log_writer::{SampleRecord, SampleSink};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    pub sample_rate: u32,
    // Consecutive read timeouts before a device is given up on.
    pub failure_threshold: u32,
    // Read wait as a multiple of the sample period.
    pub timeout_multiplier: f64,
    // Pause after each stop command so the unit can drop out of continuous mode.
    pub stop_settle: Duration,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            sample_rate: 20,
            failure_threshold: 3,
            timeout_multiplier: 1.5,
            stop_settle: Duration::from_millis(200),
        }
    }
}

impl SamplingPolicy {
    pub fn read_wait(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_multiplier / f64::from(self.sample_rate.max(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    AllFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Interrupted,
    AllFailed,
}

// Drives continuous sampling for every device from one loop. Devices are polled in
// registry order; each read is bounded so no device can hold up the others for longer
// than its own wait.
pub struct Scheduler<S: SampleSink> {
    devices: Vec<Device>,
    sink: S,
    clock: Box<dyn Clock>,
    policy: SamplingPolicy,
    torn_down: bool,
}

impl<S: SampleSink> Scheduler<S> {
    pub fn new(
        devices: Vec<Device>,
        sink: S,
        clock: Box<dyn Clock>,
        policy: SamplingPolicy,
    ) -> Self {
        Self {
            devices,
            sink,
            clock,
            policy,
            torn_down: false,
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sampling_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|device| device.state() == DeviceState::Sampling)
            .count()
    }

    // Put every configured device into continuous mode. Returns how many are sampling.
    pub fn start(&mut self) -> usize {
        let start = Command::query(codec::START_CONTINUOUS);
        for device in self
            .devices
            .iter_mut()
            .filter(|device| device.state() == DeviceState::Configuring)
        {
            if let Err(err) = device.transition(DeviceState::Sampling) {
                log::error!("{}: {}", device.label(), err);
                device.fail();
                continue;
            }
            if let Err(err) = device.send(&start) {
                log::error!(
                    "{}: starting continuous sampling failed at {}: {}",
                    device.label(),
                    stamp(self.clock.now()),
                    err
                );
                device.fail();
            }
        }
        self.sampling_count()
    }

    // One pass over all sampling devices. Only sink failures are errors; device trouble is
    // handled here and reflected in device state.
    pub fn poll_cycle(&mut self) -> Result<CycleOutcome> {
        let wait = self.policy.read_wait();

        for device in self.devices.iter_mut() {
            if device.state() != DeviceState::Sampling {
                continue;
            }

            match device.read_frame(wait) {
                Ok(Some(frame)) => {
                    device.record_frame();
                    let received_at = self.clock.now();
                    match codec::decode_sample(&frame) {
                        Ok(payload) => {
                            let record = SampleRecord {
                                serial_number: device.serial_number().to_string(),
                                received_at,
                                payload,
                            };
                            self.sink.accept(&record)?;
                            device.record_sample();
                        }
                        Err(err) => {
                            log::warn!("{}: discarding frame: {}", device.label(), err);
                        }
                    }
                }
                Ok(None) => on_timeout(device, &self.policy, self.clock.as_ref()),
                Err(err) => {
                    log::error!(
                        "{}: read failed at {}: {}",
                        device.label(),
                        stamp(self.clock.now()),
                        err
                    );
                    device.fail();
                }
            }
        }

        if self
            .devices
            .iter()
            .all(|device| device.state() == DeviceState::Failed)
        {
            log::error!(
                "all barometers appear to have failed at {}",
                stamp(self.clock.now())
            );
            return Ok(CycleOutcome::AllFailed);
        }
        Ok(CycleOutcome::Continue)
    }

    // Poll until interrupted or every device has failed, then tear down. Teardown runs on
    // every path out of here, including a sink error.
    pub fn run(&mut self, running: &AtomicBool) -> Result<RunOutcome> {
        let polled = self.poll_until_stopped(running);
        let teardown = self.shutdown();
        let outcome = polled?;
        teardown?;
        Ok(outcome)
    }

    fn poll_until_stopped(&mut self, running: &AtomicBool) -> Result<RunOutcome> {
        loop {
            if !running.load(Ordering::SeqCst) {
                log::info!("got interrupt");
                return Ok(RunOutcome::Interrupted);
            }
            if self.poll_cycle()? == CycleOutcome::AllFailed {
                return Ok(RunOutcome::AllFailed);
            }
        }
    }

    // Stop every sampling device, close its port, then close the log. Runs once; later
    // calls do nothing.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        log::info!("quitting...");

        // Any command takes a unit out of continuous mode.
        let stop = Command::query(codec::SERIAL_NUMBER);
        for device in self
            .devices
            .iter_mut()
            .filter(|device| device.state() == DeviceState::Sampling)
        {
            if let Err(err) = device.send(&stop) {
                log::warn!("{}: stop command failed: {}", device.label(), err);
            }
            if !self.policy.stop_settle.is_zero() {
                thread::sleep(self.policy.stop_settle);
            }
            if let Err(err) = device.transition(DeviceState::Stopped) {
                log::warn!("{}: {}", device.label(), err);
            }
            debug_assert!(!device.is_open());
        }

        for device in &self.devices {
            log::info!(
                "{} [{}]: {}, {} samples, {} trailing timeout(s)",
                device.label(),
                device.port(),
                device.state(),
                device.samples(),
                device.consecutive_failures()
            );
        }

        self.sink.close()
    }
}

impl<S: SampleSink> Drop for Scheduler<S> {
    // Make sure ports and the log file are released even if `run` was never reached.
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("shutdown failed: {:#}", err);
        }
    }
}

fn on_timeout(device: &mut Device, policy: &SamplingPolicy, clock: &dyn Clock) {
    let failures = device.record_timeout();
    let now = clock.now();
    log::warn!("{}: timeout during read at {}", device.label(), stamp(now));

    if failures >= policy.failure_threshold {
        log::error!("{}: appears to have failed at {}", device.label(), stamp(now));
        device.fail();
        return;
    }

    // First miss usually means a power or link glitch that reset continuous mode.
    if failures == 1 {
        log::info!("{}: restarting continuous sampling", device.label());
        if let Err(err) = device.send(&Command::query(codec::START_CONTINUOUS)) {
            log::error!("{}: restart failed at {}: {}", device.label(), stamp(now), err);
            device.fail();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimBarometer;
    use crate::shared::clock::fixed::SteppingClock;
    use crate::shared::log_writer::{LogWriter, Output};
    use chrono::{TimeZone, Utc};
    use std::fs;

    #[derive(Default)]
    struct MemorySink {
        records: Vec<SampleRecord>,
        closes: usize,
    }

    impl SampleSink for MemorySink {
        fn accept(&mut self, record: &SampleRecord) -> Result<()> {
            self.records.push(record.clone());
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.closes += 1;
            Ok(())
        }
    }

    fn ready_device(port: &str, serial: &str, sim: &SimBarometer) -> Device {
        let mut device = Device::new(port, Box::new(sim.clone()));
        device.set_serial_number(serial);
        device.transition(DeviceState::Configuring).unwrap();
        device
    }

    fn policy(sample_rate: u32) -> SamplingPolicy {
        SamplingPolicy {
            sample_rate,
            stop_settle: Duration::ZERO,
            ..SamplingPolicy::default()
        }
    }

    fn clock_at(h: u32, m: u32, s: u32, step_ms: i64) -> Box<dyn Clock> {
        Box::new(SteppingClock::new(
            Utc.with_ymd_and_hms(2018, 6, 24, h, m, s).unwrap(),
            chrono::Duration::milliseconds(step_ms),
        ))
    }

    #[test]
    fn read_wait_is_one_and_a_half_periods() {
        assert!((policy(20).read_wait().as_secs_f64() - 0.075).abs() < 1e-6);
        assert!((policy(1).read_wait().as_secs_f64() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn start_sends_continuous_command_once_per_device() {
        let a = SimBarometer::new("A");
        let b = SimBarometer::new("B");
        let devices = vec![ready_device("p0", "A", &a), ready_device("p1", "B", &b)];
        let mut scheduler =
            Scheduler::new(devices, MemorySink::default(), clock_at(10, 0, 0, 50), policy(20));

        assert_eq!(scheduler.start(), 2);
        assert_eq!(a.count_commands("*0100P4"), 1);
        assert_eq!(b.count_commands("*0100P4"), 1);
        assert!(a.is_streaming() && b.is_streaming());
    }

    #[test]
    fn silent_device_fails_while_the_other_keeps_logging() {
        let dir = tempfile::tempdir().unwrap();
        let a = SimBarometer::new("100001").with_samples(10);
        a.push_silence(3);
        let b = SimBarometer::new("100002").with_samples(13);
        let devices = vec![
            ready_device("/dev/ttyUSB0", "100001", &a),
            ready_device("/dev/ttyUSB1", "100002", &b),
        ];
        let output = Output::Files(dir.path().to_path_buf());
        let writer = LogWriter::new(output, 20, 2, Duration::ZERO);
        let mut scheduler = Scheduler::new(devices, writer, clock_at(10, 0, 0, 10), policy(20));
        scheduler.start();

        for cycle in 1..=13 {
            assert_eq!(scheduler.poll_cycle().unwrap(), CycleOutcome::Continue, "cycle {cycle}");
            let expected = if cycle < 13 { DeviceState::Sampling } else { DeviceState::Failed };
            assert_eq!(scheduler.devices()[0].state(), expected, "cycle {cycle}");
        }

        assert_eq!(scheduler.devices()[1].state(), DeviceState::Sampling);
        // Initial start plus one restart after the first timeout.
        assert_eq!(a.count_commands("*0100P4"), 2);
        assert_eq!(b.count_commands("*0100P4"), 1);
        assert!(!a.is_open());

        scheduler.shutdown().unwrap();
        assert_eq!(b.count_commands("*0100SN"), 1);
        assert_eq!(a.count_commands("*0100SN"), 0);
        assert_eq!(scheduler.devices()[1].state(), DeviceState::Stopped);

        let path = dir.path().join("DQLOG-20180624/DQ-20180624-100000-20-2.txt");
        let lines: Vec<String> = fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        let mut expected = Vec::new();
        for idx in 0..13 {
            if idx < 10 {
                expected.push(format!("100001, {:04} 1013.{:06}", idx, idx));
            }
            expected.push(format!("100002, {:04} 1013.{:06}", idx, idx));
        }
        assert_eq!(lines, expected);
        assert_eq!(scheduler.devices()[0].samples(), 10);
        assert_eq!(scheduler.devices()[1].samples(), 13);
    }

    #[test]
    fn fewer_than_threshold_timeouts_reset_on_next_frame() {
        let sim = SimBarometer::new("A");
        sim.push_silence(2);
        sim.push_samples(1);
        sim.push_silence(3);
        let devices = vec![ready_device("p0", "A", &sim)];
        let mut scheduler =
            Scheduler::new(devices, MemorySink::default(), clock_at(10, 0, 0, 50), policy(20));
        scheduler.start();

        scheduler.poll_cycle().unwrap();
        scheduler.poll_cycle().unwrap();
        assert_eq!(scheduler.devices()[0].consecutive_failures(), 2);
        assert_eq!(scheduler.devices()[0].state(), DeviceState::Sampling);

        scheduler.poll_cycle().unwrap();
        assert_eq!(scheduler.devices()[0].consecutive_failures(), 0);
        assert_eq!(scheduler.sink().records.len(), 1);

        scheduler.poll_cycle().unwrap();
        scheduler.poll_cycle().unwrap();
        assert_eq!(scheduler.devices()[0].state(), DeviceState::Sampling);
        assert_eq!(scheduler.poll_cycle().unwrap(), CycleOutcome::AllFailed);
        assert_eq!(scheduler.devices()[0].state(), DeviceState::Failed);
        // Start, restart after the first miss of each run of timeouts.
        assert_eq!(sim.count_commands("*0100P4"), 3);
    }

    #[test]
    fn all_failed_runs_one_shutdown() {
        let a = SimBarometer::new("A");
        let b = SimBarometer::new("B");
        let devices = vec![ready_device("p0", "A", &a), ready_device("p1", "B", &b)];
        let mut scheduler =
            Scheduler::new(devices, MemorySink::default(), clock_at(10, 0, 0, 50), policy(20));
        scheduler.start();

        let running = AtomicBool::new(true);
        assert_eq!(scheduler.run(&running).unwrap(), RunOutcome::AllFailed);
        assert!(scheduler
            .devices()
            .iter()
            .all(|device| device.state() == DeviceState::Failed && !device.is_open()));
        assert_eq!(scheduler.sink().closes, 1);

        scheduler.shutdown().unwrap();
        assert_eq!(scheduler.sink().closes, 1);
    }

    #[test]
    fn interrupt_stops_every_sampling_device() {
        let a = SimBarometer::new("A").with_samples(5);
        let devices = vec![ready_device("p0", "A", &a)];
        let mut scheduler =
            Scheduler::new(devices, MemorySink::default(), clock_at(10, 0, 0, 50), policy(20));
        scheduler.start();
        scheduler.poll_cycle().unwrap();

        let running = AtomicBool::new(false);
        assert_eq!(scheduler.run(&running).unwrap(), RunOutcome::Interrupted);
        assert_eq!(scheduler.devices()[0].state(), DeviceState::Stopped);
        assert_eq!(a.count_commands("*0100SN"), 1);
        assert!(!a.is_streaming());
        assert!(!a.is_open());
        assert_eq!(scheduler.sink().records.len(), 1);
    }

    #[test]
    fn unplugged_device_fails_immediately() {
        let a = SimBarometer::new("A").with_samples(5);
        let b = SimBarometer::new("B").with_samples(5);
        let devices = vec![ready_device("p0", "A", &a), ready_device("p1", "B", &b)];
        let mut scheduler =
            Scheduler::new(devices, MemorySink::default(), clock_at(10, 0, 0, 50), policy(20));
        scheduler.start();

        a.unplug();
        assert_eq!(scheduler.poll_cycle().unwrap(), CycleOutcome::Continue);
        assert_eq!(scheduler.devices()[0].state(), DeviceState::Failed);
        assert_eq!(scheduler.devices()[1].state(), DeviceState::Sampling);
        assert_eq!(scheduler.sink().records.len(), 1);
    }

    #[test]
    fn malformed_frame_keeps_device_alive_without_a_record() {
        let a = SimBarometer::new("A");
        let devices = vec![ready_device("p0", "A", &a)];
        let mut scheduler =
            Scheduler::new(devices, MemorySink::default(), clock_at(10, 0, 0, 50), policy(20));
        scheduler.start();

        scheduler.poll_cycle().unwrap();
        assert_eq!(scheduler.devices()[0].consecutive_failures(), 1);
        a.push_raw("line noise\r\n");
        scheduler.poll_cycle().unwrap();
        assert_eq!(scheduler.devices()[0].consecutive_failures(), 0);
        assert!(scheduler.sink().records.is_empty());
    }

    #[test]
    fn dropping_the_scheduler_still_stops_devices() {
        let a = SimBarometer::new("A").with_samples(1);
        let devices = vec![ready_device("p0", "A", &a)];
        let mut scheduler =
            Scheduler::new(devices, MemorySink::default(), clock_at(10, 0, 0, 50), policy(20));
        scheduler.start();
        drop(scheduler);

        assert_eq!(a.count_commands("*0100SN"), 1);
        assert!(!a.is_open());
    }

    #[test]
    fn one_hertz_run_across_the_hour_writes_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimBarometer::new("100001").with_samples(4);
        let devices = vec![ready_device("/dev/ttyUSB0", "100001", &sim)];
        let output = Output::Files(dir.path().to_path_buf());
        let writer = LogWriter::new(output, 1, 1, Duration::ZERO);
        let mut scheduler = Scheduler::new(devices, writer, clock_at(13, 59, 58, 1_000), policy(1));
        scheduler.start();

        for _ in 0..4 {
            scheduler.poll_cycle().unwrap();
        }
        scheduler.shutdown().unwrap();

        let day = dir.path().join("DQLOG-20180624");
        let before = fs::read_to_string(day.join("DQ-20180624-135958-1-1.txt")).unwrap();
        let after = fs::read_to_string(day.join("DQ-20180624-140000-1-1.txt")).unwrap();
        assert_eq!(before.lines().count(), 2);
        assert_eq!(after.lines().count(), 2);
        assert!(after.starts_with("100001, 0002 "));
        assert_eq!(fs::read_dir(&day).unwrap().count(), 2);
    }
}
