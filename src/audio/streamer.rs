//! The real-time capture -> convolve -> playback pipeline.
//!
//! Uses std::thread (not tokio tasks) for the audio path so that blocking
//! ALSA calls never contend with the control server.
//!
//! - I/O thread: capture read -> float -> per-channel input rings, then
//!   output ring -> PCM -> playback write.
//! - Processing thread: one block per channel from the input rings ->
//!   `StreamingUpsampler` -> interleaved into the output ring.
//!
//! Without a filter the I/O thread converts and writes directly and no
//! processing thread is started.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use super::alsa_device::{self, PcmRequest};
use super::dac_capability::{self, DacCapability};
use super::negotiation;
use super::pcm_format::{SampleFormat, float_to_pcm, pcm_to_float};
use super::pcm_stream::{NULL_DEVICE, PcmStream, Transfer};
use super::ring_buffer::{RingReader, RingWriter, float_ring};
use super::stats::{RateLimitedLog, StreamStats};
use crate::convolution::StreamingUpsampler;
use crate::error::UpsamplerError;
use crate::filter::{PhaseType, resolve_filter_path};

const DEFAULT_PERIOD_FRAMES: usize = 1024;
const POLL_BACKOFF: Duration = Duration::from_micros(500);
const RING_BLOCKS: usize = 3;

/// How the filter is chosen for a run.
#[derive(Debug, Clone)]
pub struct FilterOptions {
    pub explicit: Option<PathBuf>,
    pub directory: Option<PathBuf>,
    pub phase: PhaseType,
    /// 0 negotiates the ratio against the playback device.
    pub ratio: u32,
    pub prefer_gpu: bool,
}

impl FilterOptions {
    fn needs_lookup(&self) -> bool {
        self.explicit.is_none()
            && self
                .directory
                .as_ref()
                .is_some_and(|d| !d.as_os_str().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub capture_device: String,
    pub playback_device: String,
    pub channels: u32,
    pub format: SampleFormat,
    /// 0 probes the common capture rates.
    pub rate: u32,
    /// 0 uses the filter's input block, or 1024 without a filter.
    pub period_frames: usize,
    /// 0 derives the buffer from the period.
    pub buffer_frames: usize,
    pub filter: FilterOptions,
}

/// Sent to the supervisor when a pipeline thread dies on an error.
#[derive(Debug, Clone)]
pub struct PipelineFailure {
    pub thread: &'static str,
    pub message: String,
}

/// Picks the ratio used for filter lookup at `input_rate`.
///
/// A configured ratio is used as is. Otherwise the ratio comes from
/// negotiating against `sink`; a failed negotiation falls back to 1x.
pub fn resolve_ratio(options: &FilterOptions, input_rate: u32, sink: &DacCapability) -> u32 {
    if options.ratio != 0 {
        return options.ratio;
    }
    let negotiated = negotiation::negotiate(input_rate as i64, sink, 0);
    if negotiated.is_valid {
        log::info!(
            "Negotiated {} Hz -> {} Hz (x{}) on {}",
            negotiated.input_rate,
            negotiated.output_rate,
            negotiated.upsample_ratio,
            sink.device_name
        );
        negotiated.upsample_ratio
    } else {
        log::warn!("Rate negotiation failed: {}; using 1x", negotiated.error_message);
        1
    }
}

/// Loads one engine per channel, or `None` to run unfiltered.
///
/// A missing explicit filter or a malformed filter file is an error. A
/// directory scan that finds nothing only warns.
pub fn load_engines(
    options: &FilterOptions,
    input_rate: u32,
    ratio: u32,
    channels: u32,
) -> Result<Option<Vec<StreamingUpsampler>>> {
    let resolved = resolve_filter_path(
        options.explicit.as_deref(),
        options.directory.as_deref(),
        options.phase.as_str(),
        ratio,
        input_rate,
    );
    let path = match resolved {
        Ok(Some(path)) => path,
        Ok(None) => return Ok(None),
        Err(e) if options.explicit.is_none() => {
            log::warn!("{}; running without a filter", e);
            return Ok(None);
        }
        Err(e) => return Err(e).context("Failed to resolve filter"),
    };

    let prototype = StreamingUpsampler::load(&path, options.prefer_gpu)
        .with_context(|| format!("Failed to load filter {}", path.display()))?;
    let config = prototype.config();
    log::info!(
        "Filter {}: taps={}, fft={}, block={}, x{}, backend={}",
        path.display(),
        config.taps,
        config.fft_size,
        config.block_size,
        config.upsample_factor,
        prototype.backend_name()
    );

    let mut engines = Vec::with_capacity(channels as usize);
    for _ in 1..channels {
        engines.push(prototype.clone());
    }
    engines.push(prototype);
    Ok(Some(engines))
}

fn playback_buffer(configured: usize, out_period: usize, factor: usize) -> usize {
    if configured != 0 {
        return configured;
    }
    let periods = if factor <= 1 { 4 } else { (4 * factor).min(16) };
    out_period * periods
}

fn deinterleave(interleaved: &[f32], planar: &mut [Vec<f32>]) {
    let channels = planar.len();
    for (ch, out) in planar.iter_mut().enumerate() {
        out.clear();
        out.extend(interleaved.iter().skip(ch).step_by(channels));
    }
}

fn interleave(planar: &[Vec<f32>], interleaved: &mut [f32]) {
    let channels = planar.len();
    for (ch, samples) in planar.iter().enumerate() {
        for (i, &s) in samples.iter().enumerate() {
            interleaved[i * channels + ch] = s;
        }
    }
}

/// A running pipeline. Dropping it stops the threads.
pub struct Streamer {
    running: Arc<AtomicBool>,
    io_handle: Option<JoinHandle<()>>,
}

impl Streamer {
    /// Opens the devices, loads the filter and spawns the audio threads.
    ///
    /// Blocks while devices are probed and the FFT backend initialises.
    pub fn start(
        config: StreamerConfig,
        stats: Arc<StreamStats>,
        failures: mpsc::UnboundedSender<PipelineFailure>,
    ) -> Result<Self> {
        let channels = config.channels;
        if channels == 0 {
            return Err(UpsamplerError::Config("channel count must be non-zero".into()).into());
        }
        log::info!(
            "Streamer starting: capture \"{}\", playback \"{}\", {} ch, {}",
            config.capture_device,
            config.playback_device,
            channels,
            config.format
        );

        // the filter lookup needs the input family before capture is sized
        let mut input_rate = config.rate;
        if input_rate == 0 && config.filter.needs_lookup() {
            let mut preview = alsa_device::open_capture_auto_rate(&PcmRequest {
                device: config.capture_device.clone(),
                format: config.format,
                channels,
                rate: 0,
                period_frames: config.period_frames,
                buffer_frames: config.buffer_frames,
            })
            .context("Failed to open capture device")?;
            input_rate = preview.params().rate;
            preview.close(false);
        }

        let engines = if config.filter.needs_lookup() || config.filter.explicit.is_some() {
            let ratio = if config.filter.needs_lookup() && config.filter.ratio == 0 {
                let sink = if config.playback_device == NULL_DEVICE {
                    DacCapability::unconstrained(NULL_DEVICE, channels)
                } else {
                    dac_capability::probe(&config.playback_device)
                };
                resolve_ratio(&config.filter, input_rate, &sink)
            } else {
                config.filter.ratio
            };
            load_engines(&config.filter, input_rate, ratio, channels)?
        } else {
            None
        };

        let factor = engines
            .as_ref()
            .and_then(|e| e.first())
            .map_or(1, |e| e.config().upsample_factor);
        let period = match engines.as_ref().and_then(|e| e.first()) {
            Some(engine) => engine.config().input_block(),
            None if config.period_frames != 0 => config.period_frames,
            None => DEFAULT_PERIOD_FRAMES,
        };

        let capture = alsa_device::open_capture_auto_rate(&PcmRequest {
            device: config.capture_device.clone(),
            format: config.format,
            channels,
            rate: input_rate,
            period_frames: period,
            buffer_frames: config.buffer_frames,
        })
        .context("Failed to open capture device")?;
        let cap = *capture.params();

        let output_rate = cap.rate * factor as u32;
        let out_period = cap.period_frames * factor;
        let playback = alsa_device::open_playback(&PcmRequest {
            device: config.playback_device.clone(),
            format: config.format,
            channels: cap.channels,
            rate: output_rate,
            period_frames: out_period,
            buffer_frames: playback_buffer(config.buffer_frames, out_period, factor),
        })
        .context("Failed to open playback device")?;
        if playback.params().rate != output_rate {
            return Err(UpsamplerError::Negotiation(format!(
                "playback {} runs at {} Hz, need {} Hz",
                config.playback_device,
                playback.params().rate,
                output_rate
            ))
            .into());
        }

        let backend = engines
            .as_ref()
            .and_then(|e| e.first())
            .map(|e| e.backend_name());
        stats.begin_run(cap.rate, output_rate, factor as u32, backend);
        log::info!(
            "Pipeline: {} Hz -> {} Hz (x{}), backend {}",
            cap.rate,
            output_rate,
            factor,
            backend.unwrap_or("none")
        );

        let running = Arc::new(AtomicBool::new(true));
        let io_handle = {
            let running = running.clone();
            let stats = stats.clone();
            let failures = failures.clone();
            match engines {
                Some(engines) => {
                    let processing = spawn_processing(
                        engines,
                        cap.channels as usize,
                        cap.period_frames,
                        playback.params().period_frames,
                        &running,
                        &stats,
                        &failures,
                    )?;
                    thread::Builder::new().name("audio-io".into()).spawn(move || {
                        let (capture, playback, result) =
                            filtered_io_loop(capture, playback, processing.rings, &running, &stats);
                        report("audio-io", result, &running, &failures);
                        running.store(false, Ordering::Release);
                        let _ = processing.handle.join();
                        shutdown_devices(capture, playback, &stats);
                    })?
                }
                None => thread::Builder::new().name("audio-io".into()).spawn(move || {
                    let (capture, playback, result) =
                        passthrough_io_loop(capture, playback, &running, &stats);
                    report("audio-io", result, &running, &failures);
                    shutdown_devices(capture, playback, &stats);
                })?,
            }
        };

        Ok(Self {
            running,
            io_handle: Some(io_handle),
        })
    }

    /// Signals the threads to stop and waits for the devices to close.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(h) = self.io_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn report(
    thread: &'static str,
    result: Result<()>,
    running: &AtomicBool,
    failures: &mpsc::UnboundedSender<PipelineFailure>,
) {
    if let Err(e) = result {
        log::error!("{} thread error: {:#}", thread, e);
        running.store(false, Ordering::Release);
        let _ = failures.send(PipelineFailure {
            thread,
            message: format!("{:#}", e),
        });
    }
}

fn shutdown_devices(
    mut capture: Box<dyn PcmStream>,
    mut playback: Box<dyn PcmStream>,
    stats: &StreamStats,
) {
    capture.close(false);
    playback.close(true);
    stats.running.store(false, Ordering::Release);
    log::info!("Pipeline stopped");
}

// ======================== Processing thread ========================

struct ProcessingHandle {
    handle: JoinHandle<()>,
    /// I/O-side ends: per-channel input writers, interleaved output reader.
    rings: (Vec<RingWriter>, RingReader),
}

fn spawn_processing(
    engines: Vec<StreamingUpsampler>,
    channels: usize,
    capture_period: usize,
    playback_period: usize,
    running: &Arc<AtomicBool>,
    stats: &Arc<StreamStats>,
    failures: &mpsc::UnboundedSender<PipelineFailure>,
) -> Result<ProcessingHandle> {
    let block_in = engines[0].config().input_block();
    let block_out = engines[0].config().output_block();
    let factor = engines[0].config().upsample_factor;
    let mut input_writers = Vec::with_capacity(channels);
    let mut input_readers = Vec::with_capacity(channels);
    for _ in 0..channels {
        let (w, r) = float_ring(block_in.max(capture_period) * RING_BLOCKS);
        input_writers.push(w);
        input_readers.push(r);
    }
    let (output_writer, output_reader) = float_ring(output_ring_samples(
        block_out,
        capture_period * factor,
        playback_period,
        channels,
    ));
    log::debug!(
        "Rings: {} x {} input samples, {} output samples",
        channels,
        input_writers.first().map_or(0, RingWriter::capacity),
        output_reader.capacity()
    );

    let running = running.clone();
    let stats = stats.clone();
    let failures = failures.clone();
    let handle = thread::Builder::new()
        .name("audio-process".into())
        .spawn(move || {
            let result = processing_loop(engines, input_readers, output_writer, &running, &stats);
            report("audio-process", result, &running, &failures);
        })?;

    Ok(ProcessingHandle {
        handle,
        rings: (input_writers, output_reader),
    })
}

/// The I/O thread pops whole playback periods, which ALSA may have rounded
/// past the requested size, so the ring holds several of the largest unit.
fn output_ring_samples(
    block_out: usize,
    upsampled_capture_period: usize,
    playback_period: usize,
    channels: usize,
) -> usize {
    block_out.max(upsampled_capture_period).max(playback_period) * RING_BLOCKS * channels
}

fn processing_loop(
    mut engines: Vec<StreamingUpsampler>,
    mut inputs: Vec<RingReader>,
    mut output: RingWriter,
    running: &AtomicBool,
    stats: &StreamStats,
) -> Result<()> {
    let block_in = engines[0].config().input_block();
    let block_out = engines[0].config().output_block();
    let channels = engines.len();

    let mut planar_in = vec![vec![0.0f32; block_in]; channels];
    let mut planar_out: Vec<Vec<f32>> = vec![Vec::new(); channels];
    let mut interleaved = vec![0.0f32; block_out * channels];
    let mut overflow_log = RateLimitedLog::new("Output ring");

    log::info!(
        "Processing started: {} ch, {} -> {} frames per block",
        channels,
        block_in,
        block_out
    );

    while running.load(Ordering::Acquire) {
        if stats.take_reset_request() {
            // queued input predates the discontinuity
            inputs.iter_mut().for_each(RingReader::clear);
            engines.iter_mut().for_each(StreamingUpsampler::reset);
            stats.engine_resets.fetch_add(1, Ordering::Relaxed);
            log::info!("Convolution state reset");
        }

        let ready = inputs.iter().all(|r| r.available_to_read() >= block_in)
            && output.available_to_write() >= interleaved.len();
        if !ready {
            thread::sleep(POLL_BACKOFF);
            continue;
        }

        for (ring, buf) in inputs.iter_mut().zip(planar_in.iter_mut()) {
            ring.pop(buf);
        }
        for ((engine, input), out) in engines.iter_mut().zip(&planar_in).zip(planar_out.iter_mut()) {
            *out = engine.process_block(input);
            if out.len() != block_out {
                return Err(UpsamplerError::FatalStream(format!(
                    "engine produced {} samples, expected {}",
                    out.len(),
                    block_out
                ))
                .into());
            }
        }
        interleave(&planar_out, &mut interleaved);

        if output.push(&interleaved) {
            stats.blocks_processed.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.output_overflows.fetch_add(1, Ordering::Relaxed);
            overflow_log.hit();
        }
    }
    Ok(())
}

// ======================== I/O thread ========================

type IoOutcome = (Box<dyn PcmStream>, Box<dyn PcmStream>, Result<()>);

fn filtered_io_loop(
    mut capture: Box<dyn PcmStream>,
    mut playback: Box<dyn PcmStream>,
    (mut inputs, mut output): (Vec<RingWriter>, RingReader),
    running: &AtomicBool,
    stats: &StreamStats,
) -> IoOutcome {
    let result = (|| -> Result<()> {
        let cap = *capture.params();
        let play = *playback.params();
        let channels = cap.channels as usize;

        let mut raw_in = vec![0u8; cap.period_frames * cap.frame_bytes()];
        let mut floats = Vec::with_capacity(cap.period_frames * channels);
        let mut planar = vec![Vec::with_capacity(cap.period_frames); channels];
        let mut out_floats = vec![0.0f32; play.period_frames * channels];
        let mut raw_out = Vec::with_capacity(out_floats.len() * play.format.bytes_per_sample());
        let mut overflow_log = RateLimitedLog::new("Input ring");

        while running.load(Ordering::Acquire) {
            match capture.read_full(&mut raw_in, running)? {
                Transfer::Stopped => break,
                Transfer::Recovered => {
                    stats.xrun_recoveries.fetch_add(1, Ordering::Relaxed);
                    // the overlap no longer matches the stream
                    stats.request_reset();
                }
                Transfer::Complete => {}
            }

            pcm_to_float(&raw_in, cap.format, &mut floats);
            deinterleave(&floats, &mut planar);
            if inputs.iter().all(|r| r.available_to_write() >= cap.period_frames) {
                for (ring, samples) in inputs.iter_mut().zip(&planar) {
                    ring.push(samples);
                }
            } else {
                stats.input_overflows.fetch_add(1, Ordering::Relaxed);
                overflow_log.hit();
            }

            while output.available_to_read() >= out_floats.len() && output.pop(&mut out_floats) {
                float_to_pcm(&out_floats, play.format, &mut raw_out);
                match playback.write_full(&raw_out, running)? {
                    Transfer::Stopped => break,
                    Transfer::Recovered => {
                        stats.xrun_recoveries.fetch_add(1, Ordering::Relaxed);
                    }
                    Transfer::Complete => {}
                }
            }
        }
        Ok(())
    })();
    (capture, playback, result)
}

fn passthrough_io_loop(
    mut capture: Box<dyn PcmStream>,
    mut playback: Box<dyn PcmStream>,
    running: &AtomicBool,
    stats: &StreamStats,
) -> IoOutcome {
    let result = (|| -> Result<()> {
        let cap = *capture.params();
        let play_format = playback.params().format;
        let mut raw_in = vec![0u8; cap.period_frames * cap.frame_bytes()];
        let mut floats = Vec::with_capacity(cap.period_frames * cap.channels as usize);
        let mut raw_out = Vec::with_capacity(raw_in.len());

        log::info!("Passthrough started: period={}", cap.period_frames);
        while running.load(Ordering::Acquire) {
            match capture.read_full(&mut raw_in, running)? {
                Transfer::Stopped => break,
                Transfer::Recovered => {
                    stats.xrun_recoveries.fetch_add(1, Ordering::Relaxed);
                }
                Transfer::Complete => {}
            }
            pcm_to_float(&raw_in, cap.format, &mut floats);
            float_to_pcm(&floats, play_format, &mut raw_out);
            if playback.write_full(&raw_out, running)? == Transfer::Recovered {
                stats.xrun_recoveries.fetch_add(1, Ordering::Relaxed);
            }
            stats.blocks_processed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    })();
    (capture, playback, result)
}
