//! Rate family classification and output rate negotiation.
//!
//! Output rates stay inside the input's family (no fractional resampling).
//! A same-family rate change re-locks instantly; a cross-family change
//! needs the playback device reconfigured, which the caller performs.

use serde::Serialize;

use super::dac_capability::DacCapability;

pub const BASE_RATE_44K: u32 = 44_100;
pub const BASE_RATE_48K: u32 = 48_000;
pub const TARGET_RATE_44K_FAMILY: u32 = 705_600;
pub const TARGET_RATE_48K_FAMILY: u32 = 768_000;

const SUPPORTED_RATIOS: [u32; 5] = [1, 2, 4, 8, 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateFamily {
    Unknown,
    Rate44k,
    Rate48k,
}

impl RateFamily {
    pub fn base_rate(self) -> u32 {
        match self {
            RateFamily::Rate44k => BASE_RATE_44K,
            RateFamily::Rate48k => BASE_RATE_48K,
            RateFamily::Unknown => 0,
        }
    }
}

pub fn rate_family(rate: u32) -> RateFamily {
    if rate == 0 {
        RateFamily::Unknown
    } else if rate % BASE_RATE_44K == 0 {
        RateFamily::Rate44k
    } else if rate % BASE_RATE_48K == 0 {
        RateFamily::Rate48k
    } else {
        RateFamily::Unknown
    }
}

pub fn is_same_family(a: u32, b: u32) -> bool {
    let family = rate_family(a);
    family != RateFamily::Unknown && family == rate_family(b)
}

/// `output / input` when it is an exact integer, else 0.
pub fn upsample_ratio(input_rate: u32, output_rate: u32) -> u32 {
    if input_rate == 0 || output_rate == 0 || output_rate % input_rate != 0 {
        return 0;
    }
    output_rate / input_rate
}

pub fn target_rate_for_family(family: RateFamily) -> u32 {
    match family {
        RateFamily::Rate44k => TARGET_RATE_44K_FAMILY,
        RateFamily::Rate48k => TARGET_RATE_48K_FAMILY,
        RateFamily::Unknown => 0,
    }
}

/// Highest supported rate of the family at or below the family target.
pub fn best_rate_for_family(family: RateFamily, dac: &DacCapability) -> u32 {
    let base = family.base_rate();
    if base == 0 {
        return 0;
    }
    let target = target_rate_for_family(family);
    dac.supported_rates
        .iter()
        .copied()
        .filter(|&rate| rate <= target && rate % base == 0)
        .max()
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiatedConfig {
    pub input_rate: u32,
    pub input_family: RateFamily,
    pub output_rate: u32,
    pub upsample_ratio: u32,
    pub is_valid: bool,
    pub requires_reconfiguration: bool,
    pub error_message: String,
}

impl NegotiatedConfig {
    fn invalid(input_rate: i64, family: RateFamily, message: String) -> Self {
        Self {
            input_rate: input_rate.max(0) as u32,
            input_family: family,
            output_rate: 0,
            upsample_ratio: 0,
            is_valid: false,
            requires_reconfiguration: false,
            error_message: message,
        }
    }
}

/// Picks the output rate and ratio for `input_rate` on `dac`.
///
/// `current_output_rate` is the rate the playback device is configured
/// for, or 0 before the first configuration.
pub fn negotiate(input_rate: i64, dac: &DacCapability, current_output_rate: u32) -> NegotiatedConfig {
    if !dac.is_valid {
        let reason = if dac.error_message.is_empty() {
            "invalid DAC capability".to_string()
        } else {
            dac.error_message.clone()
        };
        return NegotiatedConfig::invalid(
            input_rate,
            RateFamily::Unknown,
            format!("DAC {} unusable: {}", dac.device_name, reason),
        );
    }
    if input_rate <= 0 || input_rate > u32::MAX as i64 {
        return NegotiatedConfig::invalid(
            input_rate,
            RateFamily::Unknown,
            format!("invalid input rate: {}", input_rate),
        );
    }
    let input = input_rate as u32;

    let family = rate_family(input);
    if family == RateFamily::Unknown {
        return NegotiatedConfig::invalid(
            input_rate,
            family,
            format!("unsupported rate family: {}", input),
        );
    }

    let output_rate = best_rate_for_family(family, dac);
    if output_rate == 0 {
        return NegotiatedConfig::invalid(
            input_rate,
            family,
            format!("DAC {} supports no {} Hz family rate", dac.device_name, family.base_rate()),
        );
    }

    let ratio = upsample_ratio(input, output_rate);
    if !SUPPORTED_RATIOS.contains(&ratio) {
        return NegotiatedConfig::invalid(
            input_rate,
            family,
            format!("unsupported ratio {} -> {} Hz", input, output_rate),
        );
    }

    let requires_reconfiguration =
        current_output_rate == 0 || !is_same_family(current_output_rate, output_rate);

    NegotiatedConfig {
        input_rate: input,
        input_family: family,
        output_rate,
        upsample_ratio: ratio,
        is_valid: true,
        requires_reconfiguration,
        error_message: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_dac() -> DacCapability {
        DacCapability {
            device_name: "test:full".into(),
            min_rate: 44_100,
            max_rate: 768_000,
            supported_rates: vec![
                44_100, 48_000, 88_200, 96_000, 176_400, 192_000, 352_800, 384_000, 705_600,
                768_000,
            ],
            max_channels: 2,
            is_valid: true,
            error_message: String::new(),
        }
    }

    fn limited_dac() -> DacCapability {
        DacCapability {
            device_name: "test:limited".into(),
            max_rate: 192_000,
            supported_rates: vec![44_100, 48_000, 88_200, 96_000, 176_400, 192_000],
            ..full_dac()
        }
    }

    #[test]
    fn classifies_families() {
        for rate in [44_100, 88_200, 176_400, 352_800, 705_600] {
            assert_eq!(rate_family(rate), RateFamily::Rate44k);
        }
        for rate in [48_000, 96_000, 192_000, 384_000, 768_000] {
            assert_eq!(rate_family(rate), RateFamily::Rate48k);
        }
        assert_eq!(rate_family(0), RateFamily::Unknown);
        assert_eq!(rate_family(11_025), RateFamily::Unknown);
    }

    #[test]
    fn same_family_detection() {
        assert!(is_same_family(44_100, 88_200));
        assert!(is_same_family(48_000, 192_000));
        assert!(!is_same_family(44_100, 48_000));
        assert!(!is_same_family(176_400, 192_000));
    }

    #[test]
    fn integer_ratios_only() {
        assert_eq!(upsample_ratio(44_100, 705_600), 16);
        assert_eq!(upsample_ratio(352_800, 705_600), 2);
        assert_eq!(upsample_ratio(192_000, 768_000), 4);
        assert_eq!(upsample_ratio(0, 705_600), 0);
        assert_eq!(upsample_ratio(44_100, 0), 0);
        assert_eq!(upsample_ratio(44_100, 100_000), 0);
    }

    #[test]
    fn full_dac_reaches_family_targets() {
        let dac = full_dac();
        let cfg = negotiate(44_100, &dac, 0);
        assert!(cfg.is_valid);
        assert_eq!(cfg.input_family, RateFamily::Rate44k);
        assert_eq!(cfg.output_rate, 705_600);
        assert_eq!(cfg.upsample_ratio, 16);
        assert!(cfg.requires_reconfiguration);

        let cfg = negotiate(88_200, &dac, 0);
        assert_eq!(cfg.upsample_ratio, 8);

        let cfg = negotiate(48_000, &dac, 0);
        assert_eq!(cfg.output_rate, 768_000);
        assert_eq!(cfg.upsample_ratio, 16);
    }

    #[test]
    fn reconfiguration_only_across_families() {
        let dac = full_dac();
        assert!(!negotiate(88_200, &dac, 705_600).requires_reconfiguration);
        let cross = negotiate(48_000, &dac, 705_600);
        assert!(cross.requires_reconfiguration);
        assert_eq!(cross.output_rate, 768_000);
    }

    #[test]
    fn limited_dac_falls_back() {
        let dac = limited_dac();
        let cfg = negotiate(44_100, &dac, 0);
        assert!(cfg.is_valid);
        assert_eq!(cfg.output_rate, 176_400);
        assert_eq!(cfg.upsample_ratio, 4);

        let cfg = negotiate(48_000, &dac, 0);
        assert_eq!(cfg.output_rate, 192_000);
        assert_eq!(cfg.upsample_ratio, 4);
    }

    #[test]
    fn rejects_bad_inputs() {
        let invalid = DacCapability::invalid("test:invalid", "Device not found");
        let cfg = negotiate(44_100, &invalid, 0);
        assert!(!cfg.is_valid);
        assert!(!cfg.error_message.is_empty());

        let dac = full_dac();
        assert!(!negotiate(0, &dac, 0).is_valid);
        assert!(!negotiate(-1, &dac, 0).is_valid);
        // would need 64x
        assert!(!negotiate(11_025, &dac, 0).is_valid);
    }
}
