use crate::acquire::configure::{DesiredConfig, read_settings};
use crate::acquire::discovery::{MODEL_ID, ProbeSettings, candidate_ports, discover};
use crate::args::ProbeArgs;
use crate::commands::log::validate_sample_rate;
use crate::device::transport::SerialOpener;
use anyhow::{Result, bail};
use std::time::Duration;

// Read-only survey: find barometers and show how their settings compare with what
// `log` would want. Nothing is written to the devices.
pub fn run_probe(args: ProbeArgs) -> Result<()> {
    let sample_rate = validate_sample_rate(args.sample_rate)?;

    let ports = candidate_ports(&args.link.ports, &args.link.port_patterns)?;
    if ports.is_empty() {
        bail!("no usbserial ports found");
    }

    let probe = ProbeSettings {
        timeout: Duration::from_millis(args.link.probe_timeout_ms),
        ..ProbeSettings::default()
    };
    let mut devices = discover(&ports, &mut SerialOpener, &probe);
    if devices.is_empty() {
        bail!("no {} barometer(s) found", MODEL_ID);
    }

    let desired = DesiredConfig::for_sample_rate(sample_rate);
    let timeout = Duration::from_millis(args.link.response_timeout_ms);
    for device in devices.iter_mut() {
        println!("SN={} on {}", device.serial_number(), device.port());
        for (key, reading) in read_settings(device, &desired, timeout) {
            let want = desired
                .settings
                .iter()
                .find(|setting| setting.key == key)
                .map(|setting| setting.desired.as_str());
            match reading {
                Ok(value) => println!("  {}", describe(&key, &value, want)),
                Err(err) => println!("  {key}: {err}"),
            }
        }
    }
    Ok(())
}

fn describe(key: &str, actual: &str, want: Option<&str>) -> String {
    match want {
        Some(want) if want == actual => format!("{key}={actual}"),
        Some(want) => format!("{key}={actual}  (want {want})"),
        None => format!("{key}={actual}"),
    }
}
