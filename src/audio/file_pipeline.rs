//! Offline mode: raw interleaved PCM file in, upsampled raw PCM file out.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use super::dac_capability::DacCapability;
use super::pcm_format::{SampleFormat, float_to_pcm, pcm_to_float};
use super::streamer::{FilterOptions, load_engines, resolve_ratio};

const DEFAULT_PERIOD_FRAMES: usize = 1024;

#[derive(Debug, Clone)]
pub struct FileJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
    pub period_frames: usize,
    pub filter: FilterOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSummary {
    pub frames_in: u64,
    pub frames_out: u64,
    pub upsample_factor: usize,
}

/// Fills `buf` from `reader`, returning how many bytes were read before EOF.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub fn run(job: &FileJob) -> Result<FileSummary> {
    if job.rate == 0 {
        bail!("file mode needs an input rate (--rate)");
    }
    if job.channels == 0 {
        bail!("file mode needs at least one channel");
    }
    let channels = job.channels as usize;

    let ratio = if job.filter.explicit.is_none() && job.filter.ratio == 0 {
        resolve_ratio(&job.filter, job.rate, &DacCapability::unconstrained("file", job.channels))
    } else {
        job.filter.ratio
    };
    let mut engines = load_engines(&job.filter, job.rate, ratio, job.channels)?;

    let (period, factor) = match engines.as_ref().and_then(|e| e.first()) {
        Some(engine) => (engine.config().input_block(), engine.config().upsample_factor),
        None if job.period_frames != 0 => (job.period_frames, 1),
        None => (DEFAULT_PERIOD_FRAMES, 1),
    };

    let mut reader = BufReader::new(
        File::open(&job.input).with_context(|| format!("Failed to open {}", job.input.display()))?,
    );
    let mut writer = BufWriter::new(
        File::create(&job.output)
            .with_context(|| format!("Failed to create {}", job.output.display()))?,
    );

    log::info!(
        "File mode: {} -> {}, {} Hz -> {} Hz, {} ch, {}",
        job.input.display(),
        job.output.display(),
        job.rate,
        job.rate as usize * factor,
        channels,
        job.format
    );

    let frame_bytes = job.format.bytes_per_sample() * channels;
    let mut raw_in = vec![0u8; period * frame_bytes];
    let mut floats = Vec::with_capacity(period * channels);
    let mut planar = vec![vec![0.0f32; period]; channels];
    let mut interleaved = vec![0.0f32; period * factor * channels];
    let mut raw_out = Vec::with_capacity(interleaved.len() * job.format.bytes_per_sample());
    let mut summary = FileSummary {
        frames_in: 0,
        frames_out: 0,
        upsample_factor: factor,
    };

    loop {
        let bytes = read_up_to(&mut reader, &mut raw_in)
            .with_context(|| format!("Failed to read {}", job.input.display()))?;
        let frames = bytes / frame_bytes;
        if frames == 0 {
            break;
        }
        // zero-pad the final partial period
        raw_in[frames * frame_bytes..].fill(0);
        pcm_to_float(&raw_in, job.format, &mut floats);

        let out_frames = frames * factor;
        match engines.as_mut() {
            Some(engines) => {
                for (ch, samples) in planar.iter_mut().enumerate() {
                    for (i, s) in samples.iter_mut().enumerate() {
                        *s = floats[i * channels + ch];
                    }
                }
                for (ch, (engine, input)) in engines.iter_mut().zip(&planar).enumerate() {
                    let out = engine.process_block(input);
                    if out.len() != period * factor {
                        bail!(
                            "engine produced {} samples, expected {}",
                            out.len(),
                            period * factor
                        );
                    }
                    for (i, s) in out.iter().enumerate() {
                        interleaved[i * channels + ch] = *s;
                    }
                }
                float_to_pcm(&interleaved[..out_frames * channels], job.format, &mut raw_out);
            }
            None => float_to_pcm(&floats[..out_frames * channels], job.format, &mut raw_out),
        }
        writer
            .write_all(&raw_out)
            .with_context(|| format!("Failed to write {}", job.output.display()))?;

        summary.frames_in += frames as u64;
        summary.frames_out += out_frames as u64;
        if frames < period {
            break;
        }
    }

    writer
        .flush()
        .with_context(|| format!("Failed to write {}", job.output.display()))?;
    log::info!(
        "File mode done: {} frames in, {} frames out",
        summary.frames_in,
        summary.frames_out
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PhaseType;
    use crate::filter::config::tests::write_filter;
    use std::fs;

    fn options(explicit: Option<PathBuf>) -> FilterOptions {
        FilterOptions {
            explicit,
            directory: None,
            phase: PhaseType::Minimum,
            ratio: 1,
            prefer_gpu: false,
        }
    }

    fn s32_bytes(samples: &[i32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn filtered_output_is_factor_times_longer() {
        let dir = tempfile::tempdir().unwrap();
        let filter = write_filter(dir.path(), "lp", &[0.5, 0.5, 0.0, 0.0, 0.0], 16, 12, 2);

        // 10 stereo frames, 6-frame blocks: one full block, one padded
        let input: Vec<i32> = (0..20).map(|i| (i as i32 + 1) * 1_000_000).collect();
        let in_path = dir.path().join("in.raw");
        let out_path = dir.path().join("out.raw");
        fs::write(&in_path, s32_bytes(&input)).unwrap();

        let summary = run(&FileJob {
            input: in_path,
            output: out_path.clone(),
            rate: 48_000,
            channels: 2,
            format: SampleFormat::S32Le,
            period_frames: 0,
            filter: options(Some(filter)),
        })
        .unwrap();

        assert_eq!(summary.frames_in, 10);
        assert_eq!(summary.frames_out, 20);
        assert_eq!(summary.upsample_factor, 2);
        assert_eq!(fs::read(&out_path).unwrap().len(), 20 * 2 * 4);
    }

    #[test]
    fn unfiltered_is_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let input: Vec<i32> = vec![0, 1 << 20, -(1 << 20), 12_345_600];
        let in_path = dir.path().join("in.raw");
        let out_path = dir.path().join("out.raw");
        fs::write(&in_path, s32_bytes(&input)).unwrap();

        let summary = run(&FileJob {
            input: in_path.clone(),
            output: out_path.clone(),
            rate: 44_100,
            channels: 2,
            format: SampleFormat::S32Le,
            period_frames: 3,
            filter: options(None),
        })
        .unwrap();

        assert_eq!(summary.frames_in, 2);
        assert_eq!(summary.frames_out, 2);
        assert_eq!(fs::read(&out_path).unwrap(), fs::read(&in_path).unwrap());
    }

    #[test]
    fn rate_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(&FileJob {
            input: dir.path().join("in.raw"),
            output: dir.path().join("out.raw"),
            rate: 0,
            channels: 2,
            format: SampleFormat::S16Le,
            period_frames: 0,
            filter: options(None),
        });
        assert!(err.is_err());
    }
}
