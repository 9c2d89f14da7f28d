pub mod alsa_device;
pub mod dac_capability;
pub mod file_pipeline;
pub mod negotiation;
pub mod pcm_format;
pub mod pcm_stream;
pub mod ring_buffer;
pub mod stats;
pub mod streamer;

pub use stats::StreamStats;
pub use streamer::{FilterOptions, PipelineFailure, Streamer, StreamerConfig};
