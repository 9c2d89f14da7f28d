use rustfft::FftPlanner;
use rustfft::num_complex::Complex32;

use crate::error::{Result, UpsamplerError};
use crate::filter::FilterConfig;

/// Zero-pads the taps to `fft_size` and forward-transforms them (unscaled).
pub fn prepare_spectrum(config: &FilterConfig, coefficients: &[f32]) -> Result<Vec<Complex32>> {
    if config.taps > config.fft_size {
        return Err(UpsamplerError::Config(format!(
            "taps {} exceed fft_size {}",
            config.taps, config.fft_size
        )));
    }
    if coefficients.len() != config.taps {
        return Err(UpsamplerError::SizeMismatch {
            what: "coefficient count",
            expected: config.taps,
            actual: coefficients.len(),
        });
    }

    let mut spectrum = vec![Complex32::new(0.0, 0.0); config.fft_size];
    for (slot, &c) in spectrum.iter_mut().zip(coefficients) {
        slot.re = c;
    }

    let mut planner = FftPlanner::<f32>::new();
    planner.plan_fft_forward(config.fft_size).process(&mut spectrum);
    Ok(spectrum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn dc_bin_is_tap_sum() {
        let config = FilterConfig::new("x", 5, 16, 12, 1).unwrap();
        let spectrum = prepare_spectrum(&config, &[1.0, 2.0, 3.0, 2.0, 1.0]).unwrap();
        assert_eq!(spectrum.len(), 16);
        assert_relative_eq!(spectrum[0].re, 9.0, epsilon = 1e-5);
        assert_relative_eq!(spectrum[0].im, 0.0, epsilon = 1e-5);
        // Nyquist bin: alternating sum
        assert_relative_eq!(spectrum[8].re, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn rejects_wrong_coefficient_count() {
        let config = FilterConfig::new("x", 5, 16, 12, 1).unwrap();
        assert!(matches!(
            prepare_spectrum(&config, &[1.0, 2.0]),
            Err(UpsamplerError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_taps_larger_than_fft() {
        // bypasses FilterConfig::new validation on purpose
        let config = FilterConfig {
            coefficients_path: "x".into(),
            taps: 32,
            fft_size: 16,
            block_size: 12,
            upsample_factor: 1,
        };
        assert!(matches!(
            prepare_spectrum(&config, &[0.0; 32]),
            Err(UpsamplerError::Config(_))
        ));
    }
}
