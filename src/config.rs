use std::path::PathBuf;

use clap::Parser;

use crate::audio::file_pipeline::FileJob;
use crate::audio::pcm_format::SampleFormat;
use crate::audio::{FilterOptions, StreamerConfig};
use crate::filter::PhaseType;

/// Real-time ALSA upsampler with FFT convolution.
#[derive(Parser, Debug)]
#[command(name = "gpu_upsampler", version, about)]
pub struct Cli {
    /// Capture device (e.g. hw:0,0, or "null" for silence)
    #[arg(long = "in")]
    pub capture_device: Option<String>,

    /// Playback device (e.g. hw:1,0, or "null" to discard)
    #[arg(long = "out")]
    pub playback_device: Option<String>,

    /// Raw interleaved PCM input file (file mode)
    #[arg(long, requires = "out_file")]
    pub in_file: Option<PathBuf>,

    /// Raw interleaved PCM output file (file mode)
    #[arg(long, requires = "in_file")]
    pub out_file: Option<PathBuf>,

    /// Explicit filter sidecar; disables auto-selection
    #[arg(long)]
    pub filter: Option<PathBuf>,

    /// Directory scanned for filter_<fam>k_<ratio>x_<taps>_<phase>_phase.json
    #[arg(long)]
    pub filter_dir: Option<String>,

    /// min | linear
    #[arg(long)]
    pub phase: Option<PhaseType>,

    /// Upsample ratio for filter lookup, 0 = negotiate with the DAC
    #[arg(long)]
    pub ratio: Option<u32>,

    /// Input sample rate, 0 = probe
    #[arg(long)]
    pub rate: Option<u32>,

    #[arg(long)]
    pub channels: Option<u32>,

    /// s16 | s24 | s32
    #[arg(long)]
    pub format: Option<SampleFormat>,

    /// Period in frames, 0 = filter block size
    #[arg(long)]
    pub period: Option<usize>,

    /// Buffer in frames, 0 = derived
    #[arg(long)]
    pub buffer: Option<usize>,

    /// Command endpoint (ipc://path or tcp://host:port)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Notification endpoint, empty disables
    #[arg(long)]
    pub pub_endpoint: Option<String>,

    /// Always use the CPU FFT backend
    #[arg(long)]
    pub no_gpu: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    // 音频设备
    pub capture_device: String,
    pub playback_device: String,
    pub channels: u32,
    pub format: SampleFormat,
    pub rate: u32,
    pub period: usize,
    pub buffer: usize,

    // 滤波器
    pub filter_directory: Option<PathBuf>,
    pub filter: Option<PathBuf>,
    pub phase: PhaseType,
    pub ratio: u32,
    pub prefer_gpu: bool,

    // 控制端口
    pub control_endpoint: String,
    pub pub_endpoint: String,

    // 文件模式
    pub in_file: Option<PathBuf>,
    pub out_file: Option<PathBuf>,
}

fn non_empty(path: &str) -> Option<PathBuf> {
    (!path.is_empty()).then(|| PathBuf::from(path))
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            capture_device: env!("AUDIO_CAPTURE_DEVICE").to_string(),
            playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
            channels: env!("AUDIO_CHANNELS")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_CHANNELS")?,
            format: env!("AUDIO_FORMAT")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_FORMAT")?,
            rate: env!("AUDIO_RATE")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_RATE")?,
            period: env!("AUDIO_PERIOD")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_PERIOD")?,
            buffer: env!("AUDIO_BUFFER")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_BUFFER")?,

            filter_directory: non_empty(env!("FILTER_DIRECTORY")),
            filter: None,
            phase: env!("FILTER_PHASE")
                .parse()
                .map_err(|_| "Failed to parse FILTER_PHASE")?,
            ratio: env!("FILTER_RATIO")
                .parse()
                .map_err(|_| "Failed to parse FILTER_RATIO")?,
            prefer_gpu: env!("FILTER_PREFER_GPU")
                .parse()
                .map_err(|_| "Failed to parse FILTER_PREFER_GPU")?,

            control_endpoint: env!("CONTROL_ENDPOINT").to_string(),
            pub_endpoint: env!("CONTROL_PUB_ENDPOINT").to_string(),

            in_file: None,
            out_file: None,
        })
    }

    /// Endpoint overrides from `UPSAMPLER_CONTROL_ENDPOINT` / `UPSAMPLER_PUB_ENDPOINT`.
    pub fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var("UPSAMPLER_CONTROL_ENDPOINT") {
            self.control_endpoint = endpoint;
        }
        if let Ok(endpoint) = std::env::var("UPSAMPLER_PUB_ENDPOINT") {
            self.pub_endpoint = endpoint;
        }
    }

    pub fn apply_cli(&mut self, cli: Cli) {
        if let Some(v) = cli.capture_device {
            self.capture_device = v;
        }
        if let Some(v) = cli.playback_device {
            self.playback_device = v;
        }
        if let Some(v) = cli.filter_dir {
            self.filter_directory = non_empty(&v);
        }
        if let Some(v) = cli.phase {
            self.phase = v;
        }
        if let Some(v) = cli.ratio {
            self.ratio = v;
        }
        if let Some(v) = cli.rate {
            self.rate = v;
        }
        if let Some(v) = cli.channels {
            self.channels = v;
        }
        if let Some(v) = cli.format {
            self.format = v;
        }
        if let Some(v) = cli.period {
            self.period = v;
        }
        if let Some(v) = cli.buffer {
            self.buffer = v;
        }
        if let Some(v) = cli.endpoint {
            self.control_endpoint = v;
        }
        if let Some(v) = cli.pub_endpoint {
            self.pub_endpoint = v;
        }
        if cli.no_gpu {
            self.prefer_gpu = false;
        }
        self.filter = cli.filter.or(self.filter.take());
        self.in_file = cli.in_file;
        self.out_file = cli.out_file;
    }

    /// Filter options for a run at the given phase.
    pub fn filter_options(&self, phase: PhaseType) -> FilterOptions {
        FilterOptions {
            explicit: self.filter.clone(),
            directory: self.filter_directory.clone(),
            phase,
            ratio: self.ratio,
            prefer_gpu: self.prefer_gpu,
        }
    }

    pub fn streamer_config(&self, phase: PhaseType) -> StreamerConfig {
        StreamerConfig {
            capture_device: self.capture_device.clone(),
            playback_device: self.playback_device.clone(),
            channels: self.channels,
            format: self.format,
            rate: self.rate,
            period_frames: self.period,
            buffer_frames: self.buffer,
            filter: self.filter_options(phase),
        }
    }

    pub fn file_job(&self) -> Option<FileJob> {
        Some(FileJob {
            input: self.in_file.clone()?,
            output: self.out_file.clone()?,
            rate: self.rate,
            channels: self.channels,
            format: self.format,
            period_frames: self.period,
            filter: self.filter_options(self.phase),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_time_defaults_parse() {
        let config = Config::new().unwrap();
        assert!(config.channels > 0);
        assert!(!config.control_endpoint.is_empty());
        assert!(config.file_job().is_none());
    }

    #[test]
    fn cli_overrides_defaults() {
        let mut config = Config::new().unwrap();
        let cli = Cli::parse_from([
            "gpu_upsampler",
            "--in",
            "null",
            "--out",
            "hw:2,0",
            "--phase",
            "linear",
            "--ratio",
            "4",
            "--format",
            "s24",
            "--filter-dir",
            "",
            "--pub-endpoint",
            "tcp://127.0.0.1:5556",
            "--no-gpu",
        ]);
        config.apply_cli(cli);

        assert_eq!(config.capture_device, "null");
        assert_eq!(config.playback_device, "hw:2,0");
        assert_eq!(config.phase, PhaseType::Linear);
        assert_eq!(config.ratio, 4);
        assert_eq!(config.format, SampleFormat::S24Le3);
        assert_eq!(config.filter_directory, None);
        assert_eq!(config.pub_endpoint, "tcp://127.0.0.1:5556");
        assert!(!config.prefer_gpu);

        let options = config.filter_options(PhaseType::Minimum);
        assert_eq!(options.ratio, 4);
        assert_eq!(options.phase, PhaseType::Minimum);
    }

    #[test]
    fn file_mode_needs_both_files() {
        assert!(Cli::try_parse_from(["gpu_upsampler", "--in-file", "a.raw"]).is_err());

        let mut config = Config::new().unwrap();
        config.apply_cli(Cli::parse_from([
            "gpu_upsampler",
            "--in-file",
            "a.raw",
            "--out-file",
            "b.raw",
            "--rate",
            "44100",
        ]));
        let job = config.file_job().unwrap();
        assert_eq!(job.rate, 44_100);
        assert_eq!(job.output, PathBuf::from("b.raw"));
    }
}
