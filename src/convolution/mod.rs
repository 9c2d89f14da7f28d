//! Overlap-save streaming convolution with zero-stuffing upsampling.
//!
//! One [`StreamingUpsampler`] filters one channel. The FFT work is delegated
//! to an [`FftBackend`]: the rustfft CPU backend is always present, the wgpu
//! compute backend is selected at load time when the `gpu` feature is built
//! and an adapter is available.

mod cpu;
#[cfg(feature = "gpu")]
mod gpu;
mod spectrum;

use std::path::Path;
use std::sync::Arc;

use rustfft::num_complex::Complex32;

use crate::error::Result;
use crate::filter::{self, FilterConfig};

pub use cpu::CpuFft;
pub use spectrum::prepare_spectrum;

/// One forward transform, pointwise multiply, and 1/N-scaled inverse.
///
/// The CPU and GPU backends must be numerically interchangeable.
pub trait FftBackend: Send {
    fn name(&self) -> &'static str;

    /// Replaces `buffer` with `IFFT(FFT(buffer) * spectrum) / N`.
    fn convolve(&mut self, buffer: &mut [Complex32], spectrum: &[Complex32]) -> Result<()>;

    /// A fresh backend instance for another channel.
    fn boxed_clone(&self) -> Box<dyn FftBackend>;
}

/// Creates the preferred backend, falling back to the CPU one.
pub fn select_backend(fft_size: usize, prefer_gpu: bool) -> Box<dyn FftBackend> {
    #[cfg(feature = "gpu")]
    if prefer_gpu {
        match gpu::GpuFft::new(fft_size) {
            Ok(gpu) => return Box::new(gpu),
            Err(e) => log::warn!("GPU FFT unavailable, using CPU backend: {}", e),
        }
    }
    #[cfg(not(feature = "gpu"))]
    if prefer_gpu {
        log::debug!("Built without the gpu feature, using CPU backend");
    }

    Box::new(CpuFft::new(fft_size))
}

pub struct StreamingUpsampler {
    config: FilterConfig,
    spectrum: Arc<Vec<Complex32>>,
    overlap: Vec<f32>,
    next_overlap: Vec<f32>,
    time: Vec<Complex32>,
    backend: Box<dyn FftBackend>,
}

impl StreamingUpsampler {
    /// Loads a sidecar and its coefficients, then prepares the spectrum.
    pub fn load(path: impl AsRef<Path>, prefer_gpu: bool) -> Result<Self> {
        let config = FilterConfig::load(path)?;
        let coefficients = filter::load_coefficients(&config)?;
        Self::from_coefficients(config, &coefficients, prefer_gpu)
    }

    pub fn from_coefficients(
        config: FilterConfig,
        coefficients: &[f32],
        prefer_gpu: bool,
    ) -> Result<Self> {
        let spectrum = prepare_spectrum(&config, coefficients)?;
        let backend = select_backend(config.fft_size, prefer_gpu);
        Ok(Self::with_backend(config, Arc::new(spectrum), backend))
    }

    pub fn with_backend(
        config: FilterConfig,
        spectrum: Arc<Vec<Complex32>>,
        backend: Box<dyn FftBackend>,
    ) -> Self {
        let overlap_len = config.overlap_len();
        let fft_size = config.fft_size;
        Self {
            config,
            spectrum,
            overlap: vec![0.0; overlap_len],
            next_overlap: vec![0.0; overlap_len],
            time: vec![Complex32::new(0.0, 0.0); fft_size],
            backend,
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Filters one block of `config().input_block()` samples and returns
    /// `config().output_block()` samples. A wrong-length input or a backend
    /// failure returns an empty vector and leaves the overlap untouched.
    pub fn process_block(&mut self, input: &[f32]) -> Vec<f32> {
        if input.len() != self.config.input_block() {
            return Vec::new();
        }

        let overlap_len = self.config.overlap_len();
        let factor = self.config.upsample_factor;
        let block = self.config.block_size;

        let zero = Complex32::new(0.0, 0.0);
        for (slot, &s) in self.time[..overlap_len].iter_mut().zip(&self.overlap) {
            *slot = Complex32::new(s, 0.0);
        }
        self.time[overlap_len..].fill(zero);
        for (i, &s) in input.iter().enumerate() {
            self.time[overlap_len + i * factor].re = s;
        }

        // tail of the stuffed time buffer, before the in-place transform
        for (dst, src) in self
            .next_overlap
            .iter_mut()
            .zip(&self.time[self.config.fft_size - overlap_len..])
        {
            *dst = src.re;
        }

        if let Err(e) = self.backend.convolve(&mut self.time, &self.spectrum) {
            log::error!("{} convolution failed: {}", self.backend.name(), e);
            return Vec::new();
        }

        std::mem::swap(&mut self.overlap, &mut self.next_overlap);
        self.time[overlap_len..overlap_len + block]
            .iter()
            .map(|c| c.re)
            .collect()
    }

    /// Zeroes the overlap history.
    pub fn reset(&mut self) {
        self.overlap.fill(0.0);
    }
}

impl Clone for StreamingUpsampler {
    /// Shares the read-only spectrum, duplicates the backend and state.
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            spectrum: Arc::clone(&self.spectrum),
            overlap: self.overlap.clone(),
            next_overlap: vec![0.0; self.next_overlap.len()],
            time: vec![Complex32::new(0.0, 0.0); self.time.len()],
            backend: self.backend.boxed_clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const TAPS: [f32; 5] = [1.0, 2.0, 3.0, 2.0, 1.0];

    fn engine(factor: usize) -> StreamingUpsampler {
        let config = FilterConfig::new("mem", 5, 16, 12, factor).unwrap();
        StreamingUpsampler::from_coefficients(config, &TAPS, false).unwrap()
    }

    fn direct_convolution(signal: &[f32], taps: &[f32]) -> Vec<f32> {
        (0..signal.len())
            .map(|n| {
                taps.iter()
                    .enumerate()
                    .filter(|(k, _)| *k <= n)
                    .map(|(k, h)| h * signal[n - k])
                    .sum()
            })
            .collect()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-3);
        }
    }

    #[test]
    fn impulse_reproduces_taps() {
        let mut up = engine(1);
        let mut block = vec![0.0; 12];
        block[4] = 1.0;

        let out = up.process_block(&block);
        assert_close(&out, &direct_convolution(&block, &TAPS));
        assert_abs_diff_eq!(out[4], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(out[6], 3.0, epsilon = 1e-3);
    }

    #[test]
    fn streaming_matches_one_shot_convolution() {
        let mut up = engine(1);
        let a: Vec<f32> = (1..=12).map(|v| v as f32).collect();
        let b: Vec<f32> = (101..=112).map(|v| v as f32).collect();
        let joined: Vec<f32> = a.iter().chain(&b).copied().collect();
        let expected = direct_convolution(&joined, &TAPS);

        let out_a = up.process_block(&a);
        let out_b = up.process_block(&b);
        assert_close(&out_a, &expected[..12]);
        assert_close(&out_b, &expected[12..]);
    }

    #[test]
    fn upsampling_equals_filtering_zero_stuffed_input() {
        let mut up2 = engine(2);
        let mut up1 = engine(1);
        assert_eq!(up2.config().input_block(), 6);

        for round in 0..3 {
            let x: Vec<f32> = (0..6).map(|i| (i + round * 6) as f32 * 0.1 - 0.5).collect();
            let mut stuffed = vec![0.0; 12];
            for (i, v) in x.iter().enumerate() {
                stuffed[i * 2] = *v;
            }
            let out2 = up2.process_block(&x);
            let out1 = up1.process_block(&stuffed);
            assert_eq!(out2.len(), 12);
            assert_close(&out2, &out1);
        }
    }

    #[test]
    fn zero_stuffed_impulse_lands_on_even_slot() {
        let mut up = engine(2);
        let mut x = vec![0.0; 6];
        x[2] = 1.0;
        let out = up.process_block(&x);
        let mut expected = vec![0.0; 12];
        expected[4..9].copy_from_slice(&TAPS);
        assert_close(&out, &expected);
    }

    #[test]
    fn wrong_length_input_yields_empty_output() {
        let mut up = engine(2);
        assert!(up.process_block(&[0.0; 12]).is_empty());
        assert!(up.process_block(&[]).is_empty());

        // state untouched: a following valid block behaves like a fresh engine
        let mut fresh = engine(2);
        let x = [0.5, -0.25, 0.0, 1.0, 0.0, 0.0];
        assert_close(&up.process_block(&x), &fresh.process_block(&x));
    }

    #[test]
    fn reset_matches_fresh_engine() {
        let mut used = engine(1);
        let noise: Vec<f32> = (0..12).map(|i| ((i * 7) % 5) as f32 - 2.0).collect();
        used.process_block(&noise);
        used.process_block(&noise);
        used.reset();

        let mut fresh = engine(1);
        let seq: Vec<f32> = (0..12).map(|i| i as f32 * 0.25).collect();
        assert_close(&used.process_block(&seq), &fresh.process_block(&seq));
        assert_close(&used.process_block(&seq), &fresh.process_block(&seq));
    }

    #[test]
    fn clones_stream_independently() {
        let mut left = engine(1);
        let mut right = left.clone();
        let a: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let silence = vec![0.0; 12];

        left.process_block(&a);
        right.process_block(&silence);
        // right carried no history from left
        let tail_left = left.process_block(&silence);
        let tail_right = right.process_block(&silence);
        assert!(tail_left.iter().any(|v| v.abs() > 1e-3));
        assert!(tail_right.iter().all(|v| v.abs() < 1e-3));
        assert_eq!(right.backend_name(), "cpu");
    }

    #[test]
    fn loads_from_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let json =
            crate::filter::config::tests::write_filter(dir.path(), "f", &TAPS, 16, 12, 1);
        let mut up = StreamingUpsampler::load(&json, false).unwrap();
        let mut block = vec![0.0; 12];
        block[0] = 1.0;
        let out = up.process_block(&block);
        assert_close(&out[..5], &TAPS);
    }
}
