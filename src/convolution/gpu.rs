//! wgpu compute FFT backend.
//!
//! The host uploads interleaved (re, im) pairs, the forward transform runs
//! as a bit-reversal pass followed by one butterfly pass per stage, the
//! result is read back and multiplied by the filter spectrum on the host,
//! and the same passes run again with conjugated twiddles for the inverse.

use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use rustfft::num_complex::Complex32;

use super::{CpuFft, FftBackend};
use crate::error::{Result, UpsamplerError};

const WORKGROUP_SIZE: u32 = 256;
const MAX_WORKGROUPS: u32 = 65_535;
const READBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct StageParams {
    n: u32,
    log2n: u32,
    half_span: u32,
    twiddle_stride: u32,
    inverse: u32,
    _pad: [u32; 3],
}

fn gpu_err(message: impl std::fmt::Display) -> UpsamplerError {
    UpsamplerError::device("gpu", message)
}

pub struct GpuFft {
    size: usize,
    device: wgpu::Device,
    queue: wgpu::Queue,
    input: wgpu::Buffer,
    work: wgpu::Buffer,
    staging: wgpu::Buffer,
    bit_reverse: wgpu::ComputePipeline,
    butterfly: wgpu::ComputePipeline,
    forward_stages: Vec<wgpu::BindGroup>,
    inverse_stages: Vec<wgpu::BindGroup>,
    host: Vec<[f32; 2]>,
}

impl GpuFft {
    pub fn new(size: usize) -> Result<Self> {
        if !size.is_power_of_two() || size < 2 {
            return Err(gpu_err(format!("unsupported FFT size {}", size)));
        }

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| gpu_err("no compute adapter found"))?;

        let bytes = (size * std::mem::size_of::<[f32; 2]>()) as u64;
        let limits = adapter.limits();
        if bytes > limits.max_storage_buffer_binding_size as u64 {
            return Err(gpu_err(format!(
                "FFT buffer of {} bytes exceeds storage binding limit",
                bytes
            )));
        }

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Upsampler FFT Device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits,
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(gpu_err)?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Radix-2 FFT"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("../../shaders/fft_radix2.wgsl").into(),
            ),
        });

        let input = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("FFT Input"),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let work = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("FFT Work"),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("FFT Staging"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // exp(-2*pi*i*k/N), computed in f64 for long transforms
        let twiddle_table: Vec<[f32; 2]> = (0..(size / 2).max(1))
            .map(|k| {
                let angle = -2.0 * std::f64::consts::PI * k as f64 / size as f64;
                [angle.cos() as f32, angle.sin() as f32]
            })
            .collect();
        let twiddles = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("FFT Twiddles"),
            size: (twiddle_table.len() * std::mem::size_of::<[f32; 2]>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&twiddles, 0, bytemuck::cast_slice(&twiddle_table));

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("FFT Bind Group Layout"),
            entries: &[
                storage(0, true),
                storage(1, false),
                storage(2, true),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("FFT Pipeline Layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let bit_reverse = pipeline("bit_reverse");
        let butterfly = pipeline("butterfly");

        let log2n = size.trailing_zeros();
        let stage_groups = |inverse: bool| -> Vec<wgpu::BindGroup> {
            (0..log2n)
                .map(|stage| {
                    let half_span = 1u32 << stage;
                    let params = StageParams {
                        n: size as u32,
                        log2n,
                        half_span,
                        twiddle_stride: size as u32 / (half_span * 2),
                        inverse: inverse as u32,
                        _pad: [0; 3],
                    };
                    let uniform = device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some("FFT Stage Params"),
                        size: std::mem::size_of::<StageParams>() as u64,
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                        mapped_at_creation: false,
                    });
                    queue.write_buffer(&uniform, 0, bytemuck::bytes_of(&params));
                    device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("FFT Stage Bind Group"),
                        layout: &layout,
                        entries: &[
                            wgpu::BindGroupEntry {
                                binding: 0,
                                resource: input.as_entire_binding(),
                            },
                            wgpu::BindGroupEntry {
                                binding: 1,
                                resource: work.as_entire_binding(),
                            },
                            wgpu::BindGroupEntry {
                                binding: 2,
                                resource: twiddles.as_entire_binding(),
                            },
                            wgpu::BindGroupEntry {
                                binding: 3,
                                resource: uniform.as_entire_binding(),
                            },
                        ],
                    })
                })
                .collect()
        };
        let forward_stages = stage_groups(false);
        let inverse_stages = stage_groups(true);

        log::info!(
            "GPU FFT backend ready: adapter={}, fft_size={}",
            adapter.get_info().name,
            size
        );

        Ok(Self {
            size,
            device,
            queue,
            input,
            work,
            staging,
            bit_reverse,
            butterfly,
            forward_stages,
            inverse_stages,
            host: vec![[0.0; 2]; size],
        })
    }

    fn workgroups(&self, items: usize) -> u32 {
        let groups = (items as u32).div_ceil(WORKGROUP_SIZE);
        groups.clamp(1, MAX_WORKGROUPS)
    }

    /// Uploads `self.host`, transforms it, and reads the result back into it.
    fn transform(&mut self, inverse: bool) -> Result<()> {
        self.queue
            .write_buffer(&self.input, 0, bytemuck::cast_slice(&self.host));

        let stages = if inverse {
            &self.inverse_stages
        } else {
            &self.forward_stages
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("FFT Encoder"),
            });

        // separate passes order the storage writes between stages
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Bit Reverse Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.bit_reverse);
            pass.set_bind_group(0, &stages[0], &[]);
            pass.dispatch_workgroups(self.workgroups(self.size), 1, 1);
        }
        for group in stages {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Butterfly Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.butterfly);
            pass.set_bind_group(0, group, &[]);
            pass.dispatch_workgroups(self.workgroups(self.size / 2), 1, 1);
        }

        let bytes = (self.size * std::mem::size_of::<[f32; 2]>()) as u64;
        encoder.copy_buffer_to_buffer(&self.work, 0, &self.staging, 0, bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = self.staging.slice(..);
        let (sender, receiver) = flume::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv_timeout(READBACK_TIMEOUT)
            .map_err(|e| UpsamplerError::FatalStream(format!("GPU fence wait: {}", e)))?
            .map_err(|e| UpsamplerError::FatalStream(format!("GPU readback: {}", e)))?;

        {
            let data = slice.get_mapped_range();
            self.host.copy_from_slice(bytemuck::cast_slice(&data));
        }
        self.staging.unmap();
        Ok(())
    }
}

impl FftBackend for GpuFft {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn convolve(&mut self, buffer: &mut [Complex32], spectrum: &[Complex32]) -> Result<()> {
        if buffer.len() != self.size || spectrum.len() != self.size {
            return Err(UpsamplerError::SizeMismatch {
                what: "fft buffer",
                expected: self.size,
                actual: buffer.len(),
            });
        }

        for (dst, src) in self.host.iter_mut().zip(buffer.iter()) {
            *dst = [src.re, src.im];
        }
        self.transform(false)?;

        for (x, h) in self.host.iter_mut().zip(spectrum) {
            let product = Complex32::new(x[0], x[1]) * *h;
            *x = [product.re, product.im];
        }
        self.transform(true)?;

        let scale = 1.0 / self.size as f32;
        for (dst, src) in buffer.iter_mut().zip(&self.host) {
            *dst = Complex32::new(src[0] * scale, src[1] * scale);
        }
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn FftBackend> {
        match GpuFft::new(self.size) {
            Ok(gpu) => Box::new(gpu),
            Err(e) => {
                log::warn!("GPU context for cloned channel failed, using CPU: {}", e);
                Box::new(CpuFft::new(self.size))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn matches_cpu_backend() {
        let size = 64;
        let Ok(mut gpu) = GpuFft::new(size) else {
            eprintln!("no GPU adapter, skipping");
            return;
        };
        let mut cpu = CpuFft::new(size);

        let spectrum: Vec<Complex32> = (0..size)
            .map(|i| Complex32::new((i as f32 * 0.3).cos(), (i as f32 * 0.7).sin()))
            .collect();
        let signal: Vec<Complex32> = (0..size)
            .map(|i| Complex32::new(((i * 13) % 7) as f32 - 3.0, 0.0))
            .collect();

        let mut a = signal.clone();
        let mut b = signal;
        gpu.convolve(&mut a, &spectrum).unwrap();
        cpu.convolve(&mut b, &spectrum).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(x.re, y.re, epsilon = 1e-3);
            assert_abs_diff_eq!(x.im, y.im, epsilon = 1e-3);
        }
    }
}
