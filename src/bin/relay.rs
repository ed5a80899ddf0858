//! Process Audio Relay
//!
//! Spawns the capture producer, plays the captured process audio on the
//! local output device and prints session events.
//!
//! Usage: `relay [producer-executable] [pid]`

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use process_audio_relay::{
    audio::{device::list_output_devices, playback::AudioPlayback, render::render_link},
    config::AppConfig,
    relay::spawn_producer_relay,
    session::UiEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Process Audio Relay");

    let mut config = AppConfig::load()?;
    let mut args = std::env::args().skip(1);
    if let Some(executable) = args.next() {
        config.producer.executable = PathBuf::from(executable);
    }
    let target_pid = args.next();

    // List available output devices
    println!("\n=== Available Output Devices ===");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let (link, endpoint) = render_link();

    let mut playback = if config.playback.enabled {
        match AudioPlayback::new(config.playback.device_id.as_deref(), config.playback.sample_rate) {
            Ok(mut playback) => {
                playback.start(endpoint)?;
                tracing::info!(
                    "Playback started: {}Hz, {} channels",
                    playback.sample_rate(),
                    playback.channels()
                );
                Some(playback)
            }
            Err(e) => {
                tracing::warn!("Playback unavailable, relaying events only: {}", e);
                None
            }
        }
    } else {
        tracing::info!("Playback disabled in configuration");
        None
    };

    let (relay, mut events) = spawn_producer_relay(&config, link)?;
    relay.get_audio_sessions().await?;

    if let Some(pid) = target_pid {
        match relay.start_capture(pid.as_str()).await {
            Ok(pid) => tracing::info!("Capturing pid {}", pid),
            Err(e) => tracing::error!("Cannot start capture: {}", e),
        }
    }

    tracing::info!("Relay running - press Ctrl+C to stop");

    let mut stats_interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(UiEvent::PcmData(_)) => {}
                Some(UiEvent::AudioSessions(sessions)) => {
                    println!("\n=== Audio Sessions ===");
                    for session in sessions {
                        println!("  {:>6}  {}", session.pid, session.process_name);
                    }
                    println!();
                }
                Some(UiEvent::CaptureFormat(format)) => {
                    println!("capture-format: {}Hz, {} channels", format.sample_rate, format.channels);
                }
                Some(UiEvent::CaptureStopped) => println!("capture-stopped"),
                Some(UiEvent::CpaError(payload)) => println!("cpa-error: {}", payload),
                None => break,
            },
            _ = stats_interval.tick() => {
                if let Some(playback) = playback.as_ref() {
                    if let Some(e) = playback.check_errors() {
                        tracing::warn!("Playback error: {}", e);
                    }
                    let status = relay.observer().snapshot();
                    tracing::debug!(
                        "Playback: {} callbacks, session {}, {} audio sessions listed",
                        playback.callbacks(),
                        status.state.name(),
                        status.sessions.len()
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received");
                break;
            }
        }
    }

    relay.shutdown().await;
    if let Some(playback) = playback.as_mut() {
        playback.stop();
    }

    tracing::info!("Relay stopped");
    Ok(())
}
