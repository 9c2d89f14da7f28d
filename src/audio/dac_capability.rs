//! Playback device capability probing and ALSA device enumeration.

use alsa::device_name::HintIter;
use alsa::pcm::{HwParams, PCM};
use alsa::{Direction, ValueOr};
use serde::Serialize;

/// Rates probed on the playback device, ascending.
pub const PROBE_RATES: [u32; 10] = [
    44_100, 48_000, 88_200, 96_000, 176_400, 192_000, 352_800, 384_000, 705_600, 768_000,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DacCapability {
    pub device_name: String,
    pub min_rate: u32,
    pub max_rate: u32,
    pub supported_rates: Vec<u32>,
    pub max_channels: u32,
    pub is_valid: bool,
    pub error_message: String,
}

impl DacCapability {
    pub fn invalid(device: &str, message: impl Into<String>) -> Self {
        Self {
            device_name: device.to_string(),
            error_message: message.into(),
            ..Default::default()
        }
    }

    /// A sink that accepts every probe rate, used for the `null` device and
    /// file output.
    pub fn unconstrained(device: &str, channels: u32) -> Self {
        Self {
            device_name: device.to_string(),
            min_rate: PROBE_RATES[0],
            max_rate: PROBE_RATES[PROBE_RATES.len() - 1],
            supported_rates: PROBE_RATES.to_vec(),
            max_channels: channels,
            is_valid: true,
            error_message: String::new(),
        }
    }
}

/// Opens the playback device and records which probe rates it accepts natively.
pub fn probe(device: &str) -> DacCapability {
    let pcm = match PCM::new(device, Direction::Playback, false) {
        Ok(pcm) => pcm,
        Err(e) => return DacCapability::invalid(device, format!("cannot open device: {}", e)),
    };

    let (min_rate, max_rate, max_channels) = match HwParams::any(&pcm) {
        Ok(hwp) => (
            hwp.get_rate_min().unwrap_or(0),
            hwp.get_rate_max().unwrap_or(0),
            hwp.get_channels_max().unwrap_or(0),
        ),
        Err(e) => return DacCapability::invalid(device, format!("cannot query hw params: {}", e)),
    };

    let supported_rates: Vec<u32> = PROBE_RATES
        .iter()
        .copied()
        .filter(|&rate| {
            // fresh configuration space per candidate
            HwParams::any(&pcm)
                .and_then(|hwp| {
                    hwp.set_rate_resample(false)?;
                    hwp.set_rate(rate, ValueOr::Nearest)
                })
                .is_ok()
        })
        .collect();

    log::info!(
        "DAC {}: rates {}..{}, supported {:?}, max channels {}",
        device,
        min_rate,
        max_rate,
        supported_rates,
        max_channels
    );

    if supported_rates.is_empty() {
        return DacCapability {
            min_rate,
            max_rate,
            max_channels,
            ..DacCapability::invalid(device, "no supported sample rates")
        };
    }

    DacCapability {
        device_name: device.to_string(),
        min_rate,
        max_rate,
        supported_rates,
        max_channels,
        is_valid: true,
        error_message: String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub description: String,
}

/// Enumerates ALSA PCM hints, split by direction.
pub fn list_devices() -> (Vec<DeviceInfo>, Vec<DeviceInfo>) {
    let mut playback = Vec::new();
    let mut capture = Vec::new();

    let hints = match HintIter::new_str(None, "pcm") {
        Ok(hints) => hints,
        Err(e) => {
            log::warn!("Failed to enumerate ALSA devices: {}", e);
            return (playback, capture);
        }
    };

    for hint in hints {
        let Some(name) = hint.name else {
            continue;
        };
        let info = DeviceInfo {
            name,
            description: hint
                .desc
                .unwrap_or_default()
                .replace('\n', " "),
        };
        match hint.direction {
            Some(Direction::Playback) => playback.push(info),
            Some(Direction::Capture) => capture.push(info),
            None => {
                playback.push(info.clone());
                capture.push(info);
            }
        }
    }

    (playback, capture)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_capability_carries_message() {
        let cap = DacCapability::invalid("hw:9,9", "Device not found");
        assert!(!cap.is_valid);
        assert_eq!(cap.device_name, "hw:9,9");
        assert!(!cap.error_message.is_empty());
        assert!(cap.supported_rates.is_empty());
    }

    #[test]
    fn probe_of_missing_device_is_invalid() {
        let cap = probe("definitely_not_a_pcm_device");
        assert!(!cap.is_valid);
        assert!(!cap.error_message.is_empty());
    }

    #[test]
    fn serializes_for_control_replies() {
        let cap = DacCapability {
            device_name: "hw:0".into(),
            min_rate: 44_100,
            max_rate: 192_000,
            supported_rates: vec![44_100, 192_000],
            max_channels: 2,
            is_valid: true,
            error_message: String::new(),
        };
        let json = serde_json::to_value(&cap).unwrap();
        assert_eq!(json["max_rate"], 192_000);
        assert_eq!(json["supported_rates"][1], 192_000);
    }
}
