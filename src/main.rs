mod audio;
mod config;
mod control;
mod convolution;
mod error;
mod filter;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::{Value, json};
use tokio::signal;
use tokio::signal::unix::{Signal, SignalKind};
use tokio::sync::mpsc;

use audio::{PipelineFailure, StreamStats, Streamer};
use config::{Cli, Config};
use control::server::{run_command_endpoint, run_publish_endpoint};
use control::{CommandServer, ControlState, Endpoint, Listener, Publisher, register_handlers};

#[tokio::main]
async fn main() -> ExitCode {
    // 初始化日志
    env_logger::init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("gpu_upsampler: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    // 加载配置：编译期默认值 < 环境变量 < 命令行
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    config.apply_env();
    config.apply_cli(Cli::parse());

    if let Some(job) = config.file_job() {
        let summary = tokio::task::spawn_blocking(move || audio::file_pipeline::run(&job))
            .await
            .context("file pipeline panicked")??;
        log::info!(
            "Wrote {} frames (x{})",
            summary.frames_out,
            summary.upsample_factor
        );
        return Ok(ExitCode::SUCCESS);
    }

    let stats = Arc::new(StreamStats::default());
    let state = Arc::new(ControlState::new(config.phase, stats.clone()));
    let publisher = if config.pub_endpoint.is_empty() {
        Publisher::disabled()
    } else {
        Publisher::new()
    };

    // 控制端口
    let mut server = CommandServer::new();
    register_handlers(&mut server, state.clone(), publisher.clone());
    let server = Arc::new(server);

    let endpoint: Endpoint = config
        .control_endpoint
        .parse()
        .map_err(anyhow::Error::msg)?;
    let listener = Listener::bind(&endpoint).await?;
    let control_task = tokio::spawn(async move {
        if let Err(e) = run_command_endpoint(listener, server).await {
            log::error!("Control endpoint error: {:#}", e);
        }
    });

    let publish_task = if config.pub_endpoint.is_empty() {
        None
    } else {
        let endpoint: Endpoint = config.pub_endpoint.parse().map_err(anyhow::Error::msg)?;
        let listener = Listener::bind(&endpoint).await?;
        let publisher = publisher.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_publish_endpoint(listener, publisher).await {
                log::error!("Publish endpoint error: {:#}", e);
            }
        }))
    };

    // 音频管线
    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<PipelineFailure>();
    let mut streamer = Some(start_streamer(&config, &state, &failure_tx).await?);
    publisher.publish("pipeline_started", pipeline_info(&stats));
    println!("gpu_upsampler started, control on {}", endpoint);

    let mut terminate = terminate_signal()?;
    let code = loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break ExitCode::SUCCESS;
            }

            _ = terminate.recv() => {
                log::info!("Received SIGTERM, shutting down...");
                break ExitCode::SUCCESS;
            }

            _ = state.shutdown.notified() => {
                break ExitCode::SUCCESS;
            }

            _ = state.reload.notified() => {
                log::info!("Reloading pipeline with {} phase filter", state.phase());
                stop_streamer(streamer.take()).await;
                // a stopped run cannot fail any more; drop what it reported
                while failure_rx.try_recv().is_ok() {}

                match start_streamer(&config, &state, &failure_tx).await {
                    Ok(s) => {
                        streamer = Some(s);
                        publisher.publish("pipeline_started", pipeline_info(&stats));
                    }
                    Err(e) => {
                        log::error!("Reload failed: {:#}", e);
                        publisher.publish("pipeline_failed", json!({ "message": format!("{:#}", e) }));
                        break ExitCode::FAILURE;
                    }
                }
            }

            Some(failure) = failure_rx.recv() => {
                log::error!("Pipeline failed in {}: {}", failure.thread, failure.message);
                publisher.publish(
                    "pipeline_failed",
                    json!({ "thread": failure.thread, "message": failure.message }),
                );
                break ExitCode::FAILURE;
            }
        }
    };

    stop_streamer(streamer.take()).await;
    publisher.publish("pipeline_stopped", Value::Null);

    // dropping the listeners removes ipc socket files
    control_task.abort();
    let _ = control_task.await;
    if let Some(task) = publish_task {
        task.abort();
        let _ = task.await;
    }
    Ok(code)
}

/// SIGTERM from a service manager shuts down like Ctrl+C.
fn terminate_signal() -> anyhow::Result<Signal> {
    signal::unix::signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")
}

fn pipeline_info(stats: &StreamStats) -> Value {
    serde_json::to_value(stats.snapshot()).unwrap_or(Value::Null)
}

/// Device setup blocks, so it runs off the async workers.
async fn start_streamer(
    config: &Config,
    state: &ControlState,
    failures: &mpsc::UnboundedSender<PipelineFailure>,
) -> anyhow::Result<Streamer> {
    let streamer_config = config.streamer_config(state.phase());
    let stats = state.stats.clone();
    let failures = failures.clone();
    tokio::task::spawn_blocking(move || Streamer::start(streamer_config, stats, failures))
        .await
        .context("pipeline start panicked")?
}

async fn stop_streamer(streamer: Option<Streamer>) {
    if let Some(mut streamer) = streamer {
        let _ = tokio::task::spawn_blocking(move || streamer.stop()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sigterm_is_delivered_to_the_supervisor() {
        let mut terminate = terminate_signal().unwrap();
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        tokio::time::timeout(Duration::from_secs(5), terminate.recv())
            .await
            .unwrap()
            .unwrap();
    }
}
