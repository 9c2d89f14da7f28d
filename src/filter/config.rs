//! Filter sidecar loading and validation.
//!
//! A filter is described by a small JSON sidecar next to a raw float32
//! coefficient file:
//!
//! ```json
//! {"coefficients_bin": "filter.bin", "taps": 5, "fft_size": 16,
//!  "block_size": 12, "upsample_factor": 1}
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, UpsamplerError};

/// Validated filter geometry. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    pub coefficients_path: PathBuf,
    pub taps: usize,
    pub fft_size: usize,
    pub block_size: usize,
    pub upsample_factor: usize,
}

#[derive(Debug, Deserialize)]
struct Sidecar {
    coefficients_bin: Option<String>,
    taps: Option<u64>,
    fft_size: Option<u64>,
    block_size: Option<u64>,
    upsample_factor: Option<u64>,
}

impl FilterConfig {
    /// Builds a config from raw values, enforcing the overlap-save geometry.
    pub fn new(
        coefficients_path: impl Into<PathBuf>,
        taps: usize,
        fft_size: usize,
        block_size: usize,
        upsample_factor: usize,
    ) -> Result<Self> {
        if taps == 0 || fft_size == 0 || block_size == 0 {
            return Err(UpsamplerError::Config(
                "taps, fft_size and block_size must be non-zero".into(),
            ));
        }
        if !fft_size.is_power_of_two() {
            return Err(UpsamplerError::Config(format!(
                "fft_size {} is not a power of two",
                fft_size
            )));
        }
        if block_size >= fft_size {
            return Err(UpsamplerError::Config(format!(
                "block_size {} must be smaller than fft_size {}",
                block_size, fft_size
            )));
        }
        if fft_size - block_size != taps - 1 {
            return Err(UpsamplerError::Config(format!(
                "fft_size - block_size ({}) must equal taps - 1 ({})",
                fft_size - block_size,
                taps - 1
            )));
        }
        // 0 means "not specified"
        let upsample_factor = upsample_factor.max(1);
        if upsample_factor > 1 && block_size % upsample_factor != 0 {
            return Err(UpsamplerError::Config(format!(
                "block_size {} is not divisible by upsample_factor {}",
                block_size, upsample_factor
            )));
        }

        Ok(Self {
            coefficients_path: coefficients_path.into(),
            taps,
            fft_size,
            block_size,
            upsample_factor,
        })
    }

    /// Parses and validates a JSON sidecar. A relative `coefficients_bin`
    /// is resolved against the sidecar's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| UpsamplerError::io(path, e))?;
        let sidecar: Sidecar = serde_json::from_str(&text).map_err(|e| {
            UpsamplerError::Config(format!("invalid filter sidecar {}: {}", path.display(), e))
        })?;

        let bin = sidecar
            .coefficients_bin
            .filter(|s| !s.is_empty())
            .ok_or_else(|| UpsamplerError::Config("coefficients_bin is required".into()))?;
        let required = |value: Option<u64>, key: &str| -> Result<usize> {
            match value {
                Some(v) if v > 0 => Ok(v as usize),
                _ => Err(UpsamplerError::Config(format!("{} is missing or zero", key))),
            }
        };
        let taps = required(sidecar.taps, "taps")?;
        let fft_size = required(sidecar.fft_size, "fft_size")?;
        let block_size = required(sidecar.block_size, "block_size")?;
        let upsample_factor = sidecar.upsample_factor.unwrap_or(1) as usize;

        let mut coefficients_path = PathBuf::from(&bin);
        if coefficients_path.is_relative() {
            if let Some(parent) = path.parent() {
                coefficients_path = parent.join(coefficients_path);
            }
        }

        let config = Self::new(coefficients_path, taps, fft_size, block_size, upsample_factor)?;
        log::debug!(
            "Loaded filter {}: taps={}, fft={}, block={}, factor={}",
            path.display(),
            config.taps,
            config.fft_size,
            config.block_size,
            config.upsample_factor
        );
        Ok(config)
    }

    /// Length of the overlap tail carried between blocks.
    pub fn overlap_len(&self) -> usize {
        self.fft_size - self.block_size
    }

    /// Input frames consumed by one `process_block` call.
    pub fn input_block(&self) -> usize {
        self.block_size / self.upsample_factor
    }

    /// Output frames produced by one `process_block` call.
    pub fn output_block(&self) -> usize {
        self.block_size
    }
}

/// Reads exactly `taps` little-endian float32 coefficients.
pub fn load_coefficients(config: &FilterConfig) -> Result<Vec<f32>> {
    let expected = config.taps.checked_mul(4).ok_or_else(|| {
        UpsamplerError::Config(format!("taps {} overflow the coefficient size", config.taps))
    })?;
    let bytes = fs::read(&config.coefficients_path)
        .map_err(|e| UpsamplerError::io(&config.coefficients_path, e))?;
    if bytes.len() != expected {
        return Err(UpsamplerError::SizeMismatch {
            what: "coefficient file length",
            expected,
            actual: bytes.len(),
        });
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
