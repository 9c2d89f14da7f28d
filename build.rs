use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    audio: Audio,
    filter: Filter,
    control: Control,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    channels: u32,
    format: String,
    rate: u32,
    period: usize,
    buffer: usize,
}

#[derive(Deserialize)]
struct Filter {
    directory: String,
    phase: String,
    ratio: u32,
    prefer_gpu: bool,
}

#[derive(Deserialize)]
struct Control {
    endpoint: String,
    pub_endpoint: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 音频设备
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_FORMAT={}", config.audio.format);
    println!("cargo:rustc-env=AUDIO_RATE={}", config.audio.rate);
    println!("cargo:rustc-env=AUDIO_PERIOD={}", config.audio.period);
    println!("cargo:rustc-env=AUDIO_BUFFER={}", config.audio.buffer);

    // 滤波器
    println!("cargo:rustc-env=FILTER_DIRECTORY={}", config.filter.directory);
    println!("cargo:rustc-env=FILTER_PHASE={}", config.filter.phase);
    println!("cargo:rustc-env=FILTER_RATIO={}", config.filter.ratio);
    println!("cargo:rustc-env=FILTER_PREFER_GPU={}", config.filter.prefer_gpu);

    // 控制端口
    println!("cargo:rustc-env=CONTROL_ENDPOINT={}", config.control.endpoint);
    println!("cargo:rustc-env=CONTROL_PUB_ENDPOINT={}", config.control.pub_endpoint);
}
