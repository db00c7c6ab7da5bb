use crate::device::codec::{self, Command};
use crate::device::{Device, DeviceError, DeviceState};
use crate::shared::clock::{Clock, stamp};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingClass {
    // Must already match from the factory; never written.
    Fixed,
    // Written only when the read-back value differs.
    Configurable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub key: &'static str,
    pub desired: String,
    pub class: SettingClass,
}

// Factory configuration for infrasound work:
// firmware, nano-resolution on, hPa, display output off, default digits,
// timestamps on, GPS interface on, ms timestamps, UTC, timestamp first, 24h clock, MM/dd/yy.
const FIXED_SETTINGS: [(&str, &str); 12] = [
    ("VR", "Q1.03"),
    ("XM", "1"),
    ("UN", "2"),
    ("MD", "0"),
    ("XN", "0"),
    ("TS", "1"),
    ("GE", "1"),
    ("TJ", "0"),
    ("TF", ".00"),
    ("TP", "0"),
    ("GT", "1"),
    ("GD", "0"),
];

// TH replies carry the continuous-mode suffix after the rate.
const SAMPLE_RATE_SUFFIX: &str = ",P4;>OK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredConfig {
    pub sample_rate: u32,
    pub anti_alias: u32,
    pub settings: Vec<Setting>,
}

impl DesiredConfig {
    pub fn for_sample_rate(sample_rate: u32) -> Self {
        let anti_alias = anti_alias_for_rate(sample_rate);
        let mut settings: Vec<Setting> = FIXED_SETTINGS
            .iter()
            .map(|&(key, value)| Setting {
                key,
                desired: value.to_string(),
                class: SettingClass::Fixed,
            })
            .collect();
        settings.push(Setting {
            key: codec::SAMPLE_RATE,
            desired: format!("{sample_rate}{SAMPLE_RATE_SUFFIX}"),
            class: SettingClass::Configurable,
        });
        settings.push(Setting {
            key: codec::ANTI_ALIAS,
            desired: anti_alias.to_string(),
            class: SettingClass::Configurable,
        });
        Self {
            sample_rate,
            anti_alias,
            settings,
        }
    }

    pub fn of_class(&self, class: SettingClass) -> impl Iterator<Item = &Setting> {
        self.settings
            .iter()
            .filter(move |setting| setting.class == class)
    }
}

// Widest anti-alias filter that still satisfies Nyquist: smallest IA with 2^(10-IA) <= rate.
pub fn anti_alias_for_rate(sample_rate: u32) -> u32 {
    (0..=10_u32)
        .find(|&ia| (1_u32 << (10 - ia)) <= sample_rate)
        .unwrap_or(10)
}

// Filter cutoff in Hz for an IA index: 2^(9-IA).
pub fn cutoff_hz(anti_alias: u32) -> f64 {
    2_f64.powi(9 - anti_alias as i32)
}

pub fn check_nyquist(sample_rate: u32, anti_alias: u32) -> Result<(), DeviceError> {
    let cutoff = cutoff_hz(anti_alias);
    if f64::from(sample_rate) >= 2.0 * cutoff {
        Ok(())
    } else {
        Err(DeviceError::Nyquist {
            rate: sample_rate,
            anti_alias,
            cutoff_hz: cutoff,
        })
    }
}

// "20,P4;>OK" -> 20
pub fn parse_sample_rate(value: &str) -> Result<u32, DeviceError> {
    value
        .split(',')
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .map_err(|_| DeviceError::BadSetting {
            key: codec::SAMPLE_RATE.to_string(),
            value: value.to_string(),
        })
}

pub fn parse_anti_alias(value: &str) -> Result<u32, DeviceError> {
    match value.trim().parse::<u32>() {
        Ok(ia) if ia <= 20 => Ok(ia),
        _ => Err(DeviceError::BadSetting {
            key: codec::ANTI_ALIAS.to_string(),
            value: value.to_string(),
        }),
    }
}

// Device clock string for GR writes: MM/dd/yy HH:MM:SS, matching GD=0 and GT=1.
pub fn clock_value(now: DateTime<Utc>) -> String {
    now.format("%m/%d/%y %H:%M:%S").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configured {
    pub sample_rate: u32,
    pub anti_alias: u32,
    pub eeprom_writes: usize,
    pub clock: String,
}

fn read_value(device: &mut Device, key: &str, timeout: Duration) -> Result<String, DeviceError> {
    Ok(device.query(&Command::query(key), timeout)?.value)
}

// Bring one device to `desired`, touching EEPROM only for settings that differ.
pub fn configure_device(
    device: &mut Device,
    desired: &DesiredConfig,
    timeout: Duration,
    clock: &dyn Clock,
) -> Result<Configured, DeviceError> {
    let mut mismatches = Vec::new();
    for setting in desired.of_class(SettingClass::Fixed) {
        let actual = read_value(device, setting.key, timeout)?;
        if actual != setting.desired {
            log::warn!(
                "{}: {}={}, NOT OK, want: {}={}",
                device.label(),
                setting.key,
                actual,
                setting.key,
                setting.desired
            );
            mismatches.push(format!("{}={} (want {})", setting.key, actual, setting.desired));
        }
    }
    if !mismatches.is_empty() {
        return Err(DeviceError::FixedSettingMismatch(mismatches));
    }
    log::info!("{}: fixed settings OK", device.label());

    let mut eeprom_writes = 0;
    let mut confirmed_rate = None;
    let mut confirmed_anti_alias = None;
    for setting in desired.of_class(SettingClass::Configurable) {
        let mut actual = read_value(device, setting.key, timeout)?;
        if actual != setting.desired {
            log::warn!(
                "{}: {}={}, NOT OK, want: {}={}",
                device.label(),
                setting.key,
                actual,
                setting.key,
                setting.desired
            );
            device.query(&Command::write(setting.key, &setting.desired), timeout)?;
            eeprom_writes += 1;
            actual = read_value(device, setting.key, timeout)?;
            if actual != setting.desired {
                return Err(DeviceError::WriteNotConfirmed {
                    key: setting.key.to_string(),
                    expected: setting.desired.clone(),
                    actual,
                });
            }
            log::info!("{}: {} change successful", device.label(), setting.key);
        }
        match setting.key {
            codec::SAMPLE_RATE => confirmed_rate = Some(parse_sample_rate(&actual)?),
            codec::ANTI_ALIAS => confirmed_anti_alias = Some(parse_anti_alias(&actual)?),
            _ => {}
        }
    }
    log::info!("{}: configurable settings OK", device.label());

    let sample_rate = match confirmed_rate {
        Some(rate) => rate,
        None => parse_sample_rate(&read_value(device, codec::SAMPLE_RATE, timeout)?)?,
    };
    let anti_alias = match confirmed_anti_alias {
        Some(ia) => ia,
        None => parse_anti_alias(&read_value(device, codec::ANTI_ALIAS, timeout)?)?,
    };
    check_nyquist(sample_rate, anti_alias)?;
    log::info!(
        "{}: sample rate = {} Hz, anti-alias cutoff = {} ({} Hz), OK",
        device.label(),
        sample_rate,
        anti_alias,
        cutoff_hz(anti_alias)
    );

    // The clock lives in volatile memory, so setting it every run costs no EEPROM cycles.
    let clock = device
        .query(&Command::write(codec::CLOCK, &clock_value(clock.now())), timeout)?
        .value;
    log::info!("{}: date/time: {}", device.label(), clock);

    Ok(Configured {
        sample_rate,
        anti_alias,
        eeprom_writes,
        clock,
    })
}

// Configure every device still in `Configuring`, in discovery order. Devices that fail
// are marked failed and closed; the rest are left ready for sampling. Returns how many succeeded.
pub fn configure_all(
    devices: &mut [Device],
    desired: &DesiredConfig,
    timeout: Duration,
    clock: &dyn Clock,
) -> usize {
    let mut configured = 0;
    for device in devices
        .iter_mut()
        .filter(|device| device.state() == DeviceState::Configuring)
    {
        log::info!("configuring serial number: {}", device.serial_number());
        match configure_device(device, desired, timeout, clock) {
            Ok(result) => {
                log::info!(
                    "{}: ready at {} Hz, IA={}, clock {}, {} EEPROM write(s)",
                    device.serial_number(),
                    result.sample_rate,
                    result.anti_alias,
                    result.clock,
                    result.eeprom_writes
                );
                configured += 1;
            }
            Err(err) => {
                log::error!(
                    "{}: configuration failed at {}: {}",
                    device.serial_number(),
                    stamp(clock.now()),
                    err
                );
                device.fail();
            }
        }
    }
    configured
}

// Read-only survey of every tracked setting plus the device clock, for the probe command.
pub fn read_settings(
    device: &mut Device,
    desired: &DesiredConfig,
    timeout: Duration,
) -> Vec<(String, Result<String, DeviceError>)> {
    desired
        .settings
        .iter()
        .map(|setting| setting.key)
        .chain(std::iter::once(codec::CLOCK))
        .map(|key| (key.to_string(), read_value(device, key, timeout)))
        .collect()
}
