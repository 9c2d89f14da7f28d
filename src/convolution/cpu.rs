//! rustfft backend, always available.

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use super::FftBackend;
use crate::error::{Result, UpsamplerError};

pub struct CpuFft {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
}

impl CpuFft {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Self {
            size,
            forward,
            inverse,
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
        }
    }
}

impl FftBackend for CpuFft {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn convolve(&mut self, buffer: &mut [Complex32], spectrum: &[Complex32]) -> Result<()> {
        if buffer.len() != self.size || spectrum.len() != self.size {
            return Err(UpsamplerError::SizeMismatch {
                what: "fft buffer",
                expected: self.size,
                actual: buffer.len(),
            });
        }

        self.forward.process_with_scratch(buffer, &mut self.scratch);
        for (x, h) in buffer.iter_mut().zip(spectrum) {
            *x *= *h;
        }
        self.inverse.process_with_scratch(buffer, &mut self.scratch);

        let scale = 1.0 / self.size as f32;
        for x in buffer.iter_mut() {
            *x *= scale;
        }
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn FftBackend> {
        // Plans are shared, scratch is per instance
        Box::new(Self {
            size: self.size,
            forward: Arc::clone(&self.forward),
            inverse: Arc::clone(&self.inverse),
            scratch: vec![Complex32::new(0.0, 0.0); self.scratch.len()],
        })
    }
}
