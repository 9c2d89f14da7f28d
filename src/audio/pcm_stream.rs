//! Blocking interleaved PCM endpoints.
//!
//! The streamer only talks to [`PcmStream`]; `alsa_device` provides the
//! hardware implementation and [`NullPcm`] stands in for the device name
//! `"null"` (silence in, discard out, paced at the nominal rate).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::pcm_format::SampleFormat;
use crate::error::Result;

pub const NULL_DEVICE: &str = "null";

/// How a blocking transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Complete,
    /// Complete, but an XRUN was recovered along the way.
    Recovered,
    /// The run flag cleared before the buffer was satisfied.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
    pub period_frames: usize,
    pub buffer_frames: usize,
}

impl StreamParams {
    pub fn frame_bytes(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }
}

pub trait PcmStream: Send {
    fn params(&self) -> &StreamParams;

    /// Reads until `buf` is full or `running` clears.
    fn read_full(&mut self, buf: &mut [u8], running: &AtomicBool) -> Result<Transfer>;

    /// Writes all of `buf` unless `running` clears.
    fn write_full(&mut self, buf: &[u8], running: &AtomicBool) -> Result<Transfer>;

    /// Capture discards in-flight frames, playback drains when `drain` is set.
    fn close(&mut self, drain: bool);
}

pub struct NullPcm {
    params: StreamParams,
    started: Option<Instant>,
    frames: u64,
}

impl NullPcm {
    pub fn new(params: StreamParams) -> Self {
        log::info!(
            "Null PCM: rate={}, channels={}, format={}, period={}",
            params.rate,
            params.channels,
            params.format,
            params.period_frames
        );
        Self {
            params,
            started: None,
            frames: 0,
        }
    }

    fn pace(&mut self, frames: usize, running: &AtomicBool) -> Transfer {
        let started = *self.started.get_or_insert_with(Instant::now);
        self.frames += frames as u64;
        let due = Duration::from_secs_f64(self.frames as f64 / self.params.rate.max(1) as f64);
        while running.load(Ordering::Relaxed) {
            let elapsed = started.elapsed();
            if elapsed >= due {
                return Transfer::Complete;
            }
            std::thread::sleep((due - elapsed).min(Duration::from_millis(10)));
        }
        Transfer::Stopped
    }
}

impl PcmStream for NullPcm {
    fn params(&self) -> &StreamParams {
        &self.params
    }

    fn read_full(&mut self, buf: &mut [u8], running: &AtomicBool) -> Result<Transfer> {
        buf.fill(0);
        let frames = buf.len() / self.params.frame_bytes().max(1);
        Ok(self.pace(frames, running))
    }

    fn write_full(&mut self, buf: &[u8], running: &AtomicBool) -> Result<Transfer> {
        let frames = buf.len() / self.params.frame_bytes().max(1);
        Ok(self.pace(frames, running))
    }

    fn close(&mut self, _drain: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm_format::pcm_to_float;

    fn params(format: SampleFormat) -> StreamParams {
        StreamParams {
            rate: 192_000,
            channels: 2,
            format,
            period_frames: 64,
            buffer_frames: 256,
        }
    }

    #[test]
    fn null_capture_yields_silence() {
        let running = AtomicBool::new(true);
        for format in [SampleFormat::S16Le, SampleFormat::S24Le3, SampleFormat::S32Le] {
            let mut pcm = NullPcm::new(params(format));
            let frame_bytes = pcm.params().frame_bytes();
            let mut raw = vec![0xAAu8; 64 * frame_bytes];
            assert_eq!(pcm.read_full(&mut raw, &running).unwrap(), Transfer::Complete);

            let mut floats = Vec::new();
            pcm_to_float(&raw, format, &mut floats);
            assert_eq!(floats.len(), 128);
            assert!(floats.iter().all(|v| v.abs() < 1e-6));
        }
    }

    #[test]
    fn stops_when_run_flag_clears() {
        let running = AtomicBool::new(false);
        let mut pcm = NullPcm::new(StreamParams {
            rate: 1,
            ..params(SampleFormat::S16Le)
        });
        let buf = vec![0u8; 4 * 10];
        assert_eq!(pcm.write_full(&buf, &running).unwrap(), Transfer::Stopped);
    }
}
