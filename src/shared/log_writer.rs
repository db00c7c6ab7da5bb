use crate::shared::clock::floor_to_hour;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

// One accepted frame from one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub serial_number: String,
    pub received_at: DateTime<Utc>,
    pub payload: String,
}

impl SampleRecord {
    pub fn line(&self) -> String {
        format!("{}, {}", self.serial_number, self.payload)
    }
}

// Where accepted samples go. The scheduler only knows this trait.
pub trait SampleSink {
    fn accept(&mut self, record: &SampleRecord) -> Result<()>;

    // Flush and release whatever is open. Must be safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    // Test mode: print every sample, keep no file state.
    Console,
    // Hour-bucketed files under this root directory.
    Files(PathBuf),
}

struct ActiveFile {
    hour: DateTime<Utc>,
    path: PathBuf,
    writer: BufWriter<File>,
}

// Hourly rotating sample log. The open handle and its hour bucket are owned here
// and only change through `accept`/`close`.
pub struct LogWriter {
    output: Output,
    sample_rate: u32,
    device_count: usize,
    flush_interval: Duration,
    last_flush: Instant,
    active: Option<ActiveFile>,
    files_opened: usize,
    lines_written: u64,
}

impl LogWriter {
    pub fn new(
        output: Output,
        sample_rate: u32,
        device_count: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            output,
            sample_rate,
            device_count,
            flush_interval,
            last_flush: Instant::now(),
            active: None,
            files_opened: 0,
            lines_written: 0,
        }
    }

    pub fn files_opened(&self) -> usize {
        self.files_opened
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    fn write_to_file(&mut self, root: &Path, record: &SampleRecord) -> Result<()> {
        let hour = floor_to_hour(record.received_at);
        if self.active.as_ref().map(|active| active.hour) != Some(hour) {
            self.rotate(root, record.received_at)?;
        }

        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        writeln!(active.writer, "{}", record.line())
            .with_context(|| format!("writing sample to {} failed", active.path.display()))?;
        self.lines_written += 1;

        if self.last_flush.elapsed() >= self.flush_interval {
            active
                .writer
                .flush()
                .with_context(|| format!("periodic flush of {} failed", active.path.display()))?;
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    // Close the current hour's file before the next one is created, so only one is ever open.
    fn rotate(&mut self, root: &Path, opened_at: DateTime<Utc>) -> Result<()> {
        self.close_active()?;

        let path = log_file_path(root, opened_at, self.sample_rate, self.device_count);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory failed: {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log output failed: {}", path.display()))?;
        log::info!("opening log file: {}", path.display());

        self.active = Some(ActiveFile {
            hour: floor_to_hour(opened_at),
            path,
            writer: BufWriter::new(file),
        });
        self.files_opened += 1;
        self.last_flush = Instant::now();
        Ok(())
    }

    fn close_active(&mut self) -> Result<()> {
        if let Some(mut active) = self.active.take() {
            active
                .writer
                .flush()
                .with_context(|| format!("flushing log file failed: {}", active.path.display()))?;
            log::info!("closed log file: {}", active.path.display());
        }
        Ok(())
    }
}

impl SampleSink for LogWriter {
    fn accept(&mut self, record: &SampleRecord) -> Result<()> {
        match &self.output {
            Output::Console => {
                let mut stdout = io::stdout().lock();
                writeln!(stdout, "{}", record.line()).context("writing sample to stdout failed")?;
                self.lines_written += 1;
                Ok(())
            }
            Output::Files(root) => {
                let root = root.clone();
                self.write_to_file(&root, record)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.close_active()
    }
}

// `<root>/DQLOG-YYYYMMDD/DQ-YYYYMMDD-HHMMSS-<rate>-<count>.txt`
pub fn log_file_path(
    root: &Path,
    opened_at: DateTime<Utc>,
    sample_rate: u32,
    device_count: usize,
) -> PathBuf {
    let dir = root.join(opened_at.format("DQLOG-%Y%m%d").to_string());
    let name = format!(
        "{}-{}-{}.txt",
        opened_at.format("DQ-%Y%m%d-%H%M%S"),
        sample_rate,
        device_count
    );
    dir.join(name)
}
