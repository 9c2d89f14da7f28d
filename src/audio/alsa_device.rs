//! ALSA PCM device wrappers for capture and playback.

use std::sync::atomic::{AtomicBool, Ordering};

use alsa::pcm::{Access, Frames, HwParams, PCM};
use alsa::{Direction, ValueOr};

use super::pcm_format::SampleFormat;
use super::pcm_stream::{NULL_DEVICE, NullPcm, PcmStream, StreamParams, Transfer};
use crate::error::{Result, UpsamplerError};

/// Rates tried in order when the capture rate is not given.
pub const CAPTURE_RATE_CANDIDATES: [u32; 6] = [44_100, 48_000, 88_200, 96_000, 176_400, 192_000];

/// What the caller asks for. Zero period/buffer mean "derive".
#[derive(Debug, Clone)]
pub struct PcmRequest {
    pub device: String,
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
    pub period_frames: usize,
    pub buffer_frames: usize,
}

pub struct AlsaPcm {
    device: String,
    pcm: PCM,
    params: StreamParams,
    label: &'static str,
}

fn dir_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    }
}

fn hw_err(device: &str, what: &str, e: alsa::Error) -> UpsamplerError {
    UpsamplerError::device(device, format!("cannot set {}: {}", what, e))
}

/// Opens and fully configures a PCM (hw params, sw params, prepare).
pub fn open_pcm(request: &PcmRequest, direction: Direction) -> Result<Box<dyn PcmStream>> {
    let name = dir_name(direction);
    let period = if request.period_frames == 0 { 1024 } else { request.period_frames };
    let buffer = if request.buffer_frames == 0 { period * 4 } else { request.buffer_frames };

    if request.device == NULL_DEVICE {
        return Ok(Box::new(NullPcm::new(StreamParams {
            rate: request.rate,
            channels: request.channels,
            format: request.format,
            period_frames: period,
            buffer_frames: buffer,
        })));
    }

    let device = request.device.as_str();
    let pcm = PCM::new(device, direction, false).map_err(|e| {
        UpsamplerError::io(
            device,
            std::io::Error::from_raw_os_error(e.errno()),
        )
    })?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).map_err(|e| hw_err(device, "hw params", e))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| hw_err(device, "access", e))?;
        hwp.set_format(request.format.alsa_format())
            .map_err(|e| hw_err(device, "format", e))?;
        hwp.set_channels(request.channels)
            .map_err(|e| hw_err(device, "channels", e))?;
        hwp.set_rate_near(request.rate, ValueOr::Nearest)
            .map_err(|e| hw_err(device, "rate", e))?;
        hwp.set_period_size_near(period as Frames, ValueOr::Nearest)
            .map_err(|e| hw_err(device, "period", e))?;
        hwp.set_buffer_size_near(buffer as Frames)
            .map_err(|e| hw_err(device, "buffer", e))?;
        pcm.hw_params(&hwp)
            .map_err(|e| hw_err(device, "hw params", e))?;
    }

    // Read back actual negotiated parameters
    let (rate, channels, period_frames, buffer_frames) = {
        let hwp = pcm
            .hw_params_current()
            .map_err(|e| hw_err(device, "hw params", e))?;
        let read = |e| hw_err(device, "readback", e);
        (
            hwp.get_rate().map_err(read)?,
            hwp.get_channels().map_err(read)?,
            hwp.get_period_size().map_err(read)? as usize,
            hwp.get_buffer_size().map_err(read)? as usize,
        )
    };

    if direction == Direction::Playback {
        // start only once the whole buffer is primed
        let swp = pcm
            .sw_params_current()
            .map_err(|e| hw_err(device, "sw params", e))?;
        swp.set_start_threshold(buffer_frames as Frames)
            .map_err(|e| hw_err(device, "start threshold", e))?;
        swp.set_avail_min(period_frames as Frames)
            .map_err(|e| hw_err(device, "avail min", e))?;
        pcm.sw_params(&swp)
            .map_err(|e| hw_err(device, "sw params", e))?;
    }

    pcm.prepare().map_err(|e| hw_err(device, "prepare", e))?;

    log::info!(
        "ALSA {}: device={}, format={}, rate={}, channels={}, period={}, buffer={}",
        name,
        device,
        request.format,
        rate,
        channels,
        period_frames,
        buffer_frames,
    );

    Ok(Box::new(AlsaPcm {
        device: device.to_string(),
        pcm,
        params: StreamParams {
            rate,
            channels,
            format: request.format,
            period_frames,
            buffer_frames,
        },
        label: name,
    }))
}

pub fn open_playback(request: &PcmRequest) -> Result<Box<dyn PcmStream>> {
    open_pcm(request, Direction::Playback)
}

/// Opens capture at `request.rate`, or probes the common rates when it is 0.
pub fn open_capture_auto_rate(request: &PcmRequest) -> Result<Box<dyn PcmStream>> {
    if request.rate != 0 {
        return open_pcm(request, Direction::Capture);
    }

    let mut last_err = None;
    for rate in CAPTURE_RATE_CANDIDATES {
        let attempt = PcmRequest {
            rate,
            ..request.clone()
        };
        match open_pcm(&attempt, Direction::Capture) {
            Ok(stream) if stream.params().rate == rate => return Ok(stream),
            Ok(mut stream) => {
                // set_rate_near picked something else; keep probing
                log::debug!(
                    "Capture {} negotiated {} instead of {}",
                    request.device,
                    stream.params().rate,
                    rate
                );
                stream.close(false);
            }
            Err(e) => {
                log::debug!("Capture {} rejected {} Hz: {}", request.device, rate, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        UpsamplerError::device(&request.device, "no common capture rate accepted")
    }))
}

fn is_recoverable(errno: i32) -> bool {
    errno == libc::EPIPE || errno == libc::ESTRPIPE || errno == libc::EINTR
}

impl AlsaPcm {
    fn recover(&self, err: alsa::Error) -> Result<()> {
        let errno = err.errno();
        if !is_recoverable(errno) {
            return Err(UpsamplerError::FatalStream(format!(
                "ALSA {} error on {}: {}",
                self.label, self.device, err
            )));
        }
        let xrun = UpsamplerError::RecoverableStream(format!("{} on {}: {}", self.label, self.device, err));
        log::warn!("{}, recovering...", xrun);
        self.pcm.recover(-errno, true).map_err(|e| {
            log::error!("Failed to recover PCM {}: {}", self.label, e);
            UpsamplerError::FatalStream(format!("recover failed on {}: {}", self.device, e))
        })
    }
}

impl PcmStream for AlsaPcm {
    fn params(&self) -> &StreamParams {
        &self.params
    }

    fn read_full(&mut self, buf: &mut [u8], running: &AtomicBool) -> Result<Transfer> {
        let frame_bytes = self.params.frame_bytes();
        let io = self.pcm.io_bytes();
        let mut offset = 0;
        let mut recovered = false;
        while offset < buf.len() {
            if !running.load(Ordering::Relaxed) {
                return Ok(Transfer::Stopped);
            }
            match io.readi(&mut buf[offset..]) {
                Ok(frames) => offset += frames * frame_bytes,
                Err(e) => {
                    self.recover(e)?;
                    recovered = true;
                }
            }
        }
        Ok(if recovered { Transfer::Recovered } else { Transfer::Complete })
    }

    fn write_full(&mut self, buf: &[u8], running: &AtomicBool) -> Result<Transfer> {
        let frame_bytes = self.params.frame_bytes();
        let io = self.pcm.io_bytes();
        let mut offset = 0;
        let mut recovered = false;
        while offset < buf.len() {
            if !running.load(Ordering::Relaxed) {
                return Ok(Transfer::Stopped);
            }
            match io.writei(&buf[offset..]) {
                Ok(frames) => offset += frames * frame_bytes,
                Err(e) => {
                    self.recover(e)?;
                    recovered = true;
                }
            }
        }
        Ok(if recovered { Transfer::Recovered } else { Transfer::Complete })
    }

    fn close(&mut self, drain: bool) {
        let result = if drain { self.pcm.drain() } else { self.pcm.drop() };
        if let Err(e) = result {
            log::debug!("ALSA {} close on {}: {}", self.label, self.device, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(device: &str) -> PcmRequest {
        PcmRequest {
            device: device.to_string(),
            format: SampleFormat::S32Le,
            channels: 2,
            rate: 48_000,
            period_frames: 0,
            buffer_frames: 0,
        }
    }

    #[test]
    fn recoverable_errnos() {
        assert!(is_recoverable(libc::EPIPE));
        assert!(is_recoverable(libc::ESTRPIPE));
        assert!(is_recoverable(libc::EINTR));
        assert!(!is_recoverable(libc::ENODEV));
    }

    #[test]
    fn null_device_derives_period_and_buffer() {
        let stream = open_pcm(&request(NULL_DEVICE), Direction::Playback).unwrap();
        assert_eq!(stream.params().period_frames, 1024);
        assert_eq!(stream.params().buffer_frames, 4096);
        assert_eq!(stream.params().rate, 48_000);
    }

    #[test]
    fn null_capture_keeps_requested_rate() {
        let mut req = request(NULL_DEVICE);
        req.rate = 96_000;
        req.period_frames = 256;
        let stream = open_capture_auto_rate(&req).unwrap();
        assert_eq!(stream.params().rate, 96_000);
        assert_eq!(stream.params().period_frames, 256);
    }
}
