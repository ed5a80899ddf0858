//! Audio output stream
//!
//! cpal streams are not `Send` on every host, so the stream is built and
//! owned by a dedicated thread. That thread parks on a stop channel while
//! the device callback drives a [`RenderEndpoint`].

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::audio::device::get_output_device;
use crate::audio::render::RenderEndpoint;
use crate::error::AudioError;

/// Output stream parameters chosen when the playback was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Handle to the running output thread
struct OutputThread {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// Plays the relayed capture stream on a local output device
pub struct AudioPlayback {
    device_id: Option<String>,
    format: OutputFormat,
    output: Option<OutputThread>,
    /// Device errors reported by the stream, drained by [`check_errors`](Self::check_errors)
    faults: Option<Receiver<AudioError>>,
    callbacks: Arc<AtomicU64>,
}

impl AudioPlayback {
    /// Open `device_id` (default output when `None`) at `sample_rate`.
    ///
    /// Channel count follows the device's default output configuration.
    /// Fails with [`AudioError::UnsupportedFormat`] if the device cannot
    /// play f32 at that rate and channel count.
    pub fn new(device_id: Option<&str>, sample_rate: u32) -> Result<Self, AudioError> {
        let device = get_output_device(device_id)?;
        let preferred = device.default_output_config()?;
        let channels = preferred.channels();

        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| AudioError::CpalError(e.to_string()))?
            .collect();
        if !supports_f32(&ranges, sample_rate, channels) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{}Hz f32 with {} channels",
                sample_rate, channels
            )));
        }

        if preferred.sample_rate().0 != sample_rate {
            tracing::warn!(
                "Output device prefers {}Hz, opening at {}Hz",
                preferred.sample_rate().0,
                sample_rate
            );
        }

        Ok(Self {
            device_id: device_id.map(str::to_owned),
            format: OutputFormat {
                sample_rate,
                channels,
            },
            output: None,
            faults: None,
            callbacks: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start rendering from `endpoint`. Returns once the stream is playing.
    ///
    /// Consumers attached to `endpoint` render at the device rate,
    /// resampling captures announced at any other rate.
    pub fn start(&mut self, mut endpoint: RenderEndpoint) -> Result<(), AudioError> {
        if self.output.is_some() {
            return Ok(());
        }
        endpoint.set_output_rate(self.format.sample_rate);

        let device = get_output_device(self.device_id.as_deref())?;
        let stream_config = cpal::StreamConfig {
            channels: self.format.channels,
            sample_rate: cpal::SampleRate(self.format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let out_channels = self.format.channels as usize;

        let (fault_tx, fault_rx) = bounded::<AudioError>(16);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let callbacks = self.callbacks.clone();

        let join = std::thread::Builder::new()
            .name("relay-playback".to_string())
            .spawn(move || {
                let stream = device
                    .build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            callbacks.fetch_add(1, Ordering::Relaxed);
                            endpoint.render_interleaved(data, out_channels);
                        },
                        move |err| {
                            let _ = fault_tx.try_send(AudioError::StreamError(err.to_string()));
                        },
                        None,
                    )
                    .map_err(AudioError::from)
                    .and_then(|stream| {
                        stream
                            .play()
                            .map(|()| stream)
                            .map_err(|e| AudioError::StreamError(e.to_string()))
                    });

                match stream {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Parked until stop() or the handle is dropped.
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e);
            }
            Err(_) => {
                let _ = join.join();
                return Err(AudioError::StreamError("playback thread exited".into()));
            }
        }

        self.faults = Some(fault_rx);
        self.output = Some(OutputThread { stop_tx, join });
        Ok(())
    }

    /// Stop the stream and join its thread
    pub fn stop(&mut self) {
        if let Some(output) = self.output.take() {
            let _ = output.stop_tx.send(());
            if output.join.join().is_err() {
                tracing::error!("Playback thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.output.is_some()
    }

    /// Device callbacks served so far
    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    /// Next stream error reported by the device, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.faults.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Whether any range plays f32 at `sample_rate` with `channels` channels
fn supports_f32(ranges: &[cpal::SupportedStreamConfigRange], sample_rate: u32, channels: u16) -> bool {
    let rate = cpal::SampleRate(sample_rate);
    ranges.iter().any(|range| {
        range.channels() == channels
            && range.sample_format() == cpal::SampleFormat::F32
            && range.min_sample_rate() <= rate
            && rate <= range.max_sample_rate()
    })
}
