use crate::device::codec::{self, Command};
use crate::device::transport::{LineParams, PortOpener};
use crate::device::{Device, DeviceError, DeviceState};
use anyhow::{Context, Result};
use std::time::Duration;

// Model string the logger is written for.
pub const MODEL_ID: &str = "6000-16B-IS";

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    // Long enough to wake a sleeping barometer, short enough to skip other ports quickly.
    pub timeout: Duration,
    pub model: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(200),
            model: MODEL_ID.to_string(),
        }
    }
}

// Ports to probe: the explicit list when given, otherwise every enumerated port whose
// name contains one of `patterns`.
pub fn candidate_ports(explicit: &[String], patterns: &[String]) -> Result<Vec<String>> {
    if !explicit.is_empty() {
        return Ok(explicit.to_vec());
    }
    let ports = serialport::available_ports().context("enumerating serial ports failed")?;
    Ok(filter_ports(
        ports.into_iter().map(|info| info.port_name),
        patterns,
    ))
}

pub fn filter_ports(names: impl IntoIterator<Item = String>, patterns: &[String]) -> Vec<String> {
    let mut matched: Vec<String> = names
        .into_iter()
        .filter(|name| patterns.iter().any(|pattern| name.contains(pattern.as_str())))
        .collect();
    matched.sort();
    matched.dedup();
    matched
}

// Probe every port in order and return the barometers found, each left in `Configuring`.
pub fn discover(
    ports: &[String],
    opener: &mut dyn PortOpener,
    probe: &ProbeSettings,
) -> Vec<Device> {
    let mut registry: Vec<Device> = Vec::new();

    for port in ports {
        log::info!("checking: {}", port);
        match probe_port(port, opener, probe) {
            Ok(Some(device)) => {
                if registry
                    .iter()
                    .any(|known| known.serial_number() == device.serial_number())
                {
                    log::warn!(
                        "{}: serial number {} already registered, skipping",
                        port,
                        device.serial_number()
                    );
                    continue;
                }
                log::info!("  found serial number: SN={}", device.serial_number());
                registry.push(device);
            }
            Ok(None) => {}
            Err(err) => log::warn!("{}: probe failed: {}", port, err),
        }
    }

    registry
}

fn probe_port(
    port: &str,
    opener: &mut dyn PortOpener,
    probe: &ProbeSettings,
) -> Result<Option<Device>, DeviceError> {
    let transport = opener.open(port, &LineParams::barometer(probe.timeout))?;
    let mut device = Device::new(port, transport);

    let model = match device.query(&Command::query(codec::MODEL_NUMBER), probe.timeout) {
        Ok(response) => response.value,
        Err(DeviceError::NoResponse { .. }) => {
            log::debug!("{}: no answer to model query", port);
            device.fail();
            return Ok(None);
        }
        Err(err) => {
            device.fail();
            return Err(err);
        }
    };
    if !model.contains(&probe.model) {
        log::debug!("{}: unexpected model {:?}", port, model);
        device.fail();
        return Ok(None);
    }

    let serial = match device.query(&Command::query(codec::SERIAL_NUMBER), probe.timeout) {
        Ok(response) => response.value.trim().to_string(),
        Err(err) => {
            device.fail();
            return Err(err);
        }
    };
    device.set_serial_number(&serial);
    device.transition(DeviceState::Configuring)?;
    Ok(Some(device))
}
