//! Real-time render consumer
//!
//! Runs inside the audio callback: never blocks, never allocates, never
//! locks. Each cycle either delivers a full block from the ring or
//! outputs silence; there is no partial output and no skipping ahead.
//!
//! The I/O context installs and removes consumers through a
//! [`RenderLink`]; the callback side ([`RenderEndpoint`]) picks changes
//! up at the start of each cycle and hands retired consumers back so
//! they are freed outside the callback.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::audio::buffer::SampleConsumer;
use crate::constants::RENDER_LINK_DEPTH;
use crate::protocol::CaptureFormat;

/// How a multi-channel source is folded into a single output channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonoDownmix {
    /// Take the first source channel
    #[default]
    FirstChannel,
    /// Average all source channels
    Average,
}

/// Consumer for one capture format.
///
/// Channel count drives the de-interleaving arithmetic, so a format
/// change means building a new consumer rather than mutating this one.
pub struct RenderConsumer {
    ring: SampleConsumer,
    format: CaptureFormat,
    downmix: MonoDownmix,
    /// Interleaved scratch block (reused to avoid allocations)
    scratch: Vec<f32>,
    resampler: LinearResampler,
}

impl RenderConsumer {
    /// `max_block_frames` sizes the scratch block; larger requests are
    /// served in several passes.
    pub fn new(
        ring: SampleConsumer,
        format: CaptureFormat,
        downmix: MonoDownmix,
        max_block_frames: usize,
    ) -> Self {
        let scratch = vec![0.0; max_block_frames.max(1) * format.channels as usize];
        Self {
            ring,
            format,
            downmix,
            scratch,
            resampler: LinearResampler::new(format),
        }
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    pub fn ring(&self) -> &SampleConsumer {
        &self.ring
    }

    /// Declare the device rate this consumer renders at.
    ///
    /// `0` or the capture rate renders source frames one to one; any other
    /// rate interpolates linearly between source frames. Does not allocate.
    pub fn set_output_rate(&mut self, rate: u32) {
        self.resampler.set_output_rate(rate);
    }

    /// Whether source frames are interpolated to a different device rate
    pub fn is_resampling(&self) -> bool {
        self.resampler.is_active()
    }

    /// Render into an interleaved output buffer with `out_channels` channels.
    ///
    /// Returns `false` if the cycle underran and `output` was silenced.
    pub fn render_interleaved(&mut self, output: &mut [f32], out_channels: usize) -> bool {
        if out_channels == 0 {
            output.fill(0.0);
            return false;
        }
        let frames = output.len() / out_channels;
        if !self.has_frames(frames) {
            output.fill(0.0);
            return false;
        }

        if self.resampler.is_active() {
            for dst in output.chunks_exact_mut(out_channels) {
                let src = self.resampler.advance(&mut self.ring);
                for (ch, sample) in dst.iter_mut().enumerate() {
                    *sample = route(src, ch, out_channels, self.downmix);
                }
            }
        } else {
            let src_channels = self.format.channels as usize;
            let block_frames = self.scratch.len() / src_channels;
            let mut done = 0;
            while done < frames {
                let n = (frames - done).min(block_frames);
                let block = &mut self.scratch[..n * src_channels];
                self.ring.pull(block);

                let out = &mut output[done * out_channels..(done + n) * out_channels];
                for (src, dst) in block
                    .chunks_exact(src_channels)
                    .zip(out.chunks_exact_mut(out_channels))
                {
                    for (ch, sample) in dst.iter_mut().enumerate() {
                        *sample = route(src, ch, out_channels, self.downmix);
                    }
                }
                done += n;
            }
        }

        // Samples past the last whole frame
        output[frames * out_channels..].fill(0.0);
        true
    }

    /// Render into one slice per output channel. All slices share the
    /// length of the first.
    ///
    /// Returns `false` if the cycle underran and every channel was silenced.
    pub fn render_planar(&mut self, outputs: &mut [&mut [f32]]) -> bool {
        let out_channels = outputs.len();
        let frames = outputs.first().map_or(0, |c| c.len());
        if out_channels == 0 || !self.has_frames(frames) {
            for channel in outputs.iter_mut() {
                channel.fill(0.0);
            }
            return false;
        }

        if self.resampler.is_active() {
            for i in 0..frames {
                let src = self.resampler.advance(&mut self.ring);
                for (ch, channel) in outputs.iter_mut().enumerate() {
                    if let Some(sample) = channel.get_mut(i) {
                        *sample = route(src, ch, out_channels, self.downmix);
                    }
                }
            }
            return true;
        }

        let src_channels = self.format.channels as usize;
        let block_frames = self.scratch.len() / src_channels;
        let mut done = 0;
        while done < frames {
            let n = (frames - done).min(block_frames);
            let block = &mut self.scratch[..n * src_channels];
            self.ring.pull(block);

            for (i, src) in block.chunks_exact(src_channels).enumerate() {
                for (ch, channel) in outputs.iter_mut().enumerate() {
                    if let Some(sample) = channel.get_mut(done + i) {
                        *sample = route(src, ch, out_channels, self.downmix);
                    }
                }
            }
            done += n;
        }
        true
    }

    /// Check availability for the whole cycle up front, counting an underrun if short
    fn has_frames(&self, frames: usize) -> bool {
        let source_frames = if self.resampler.is_active() {
            self.resampler.frames_needed(frames)
        } else {
            frames
        };
        let required = source_frames * self.format.channels as usize;
        if self.ring.available_read() < required {
            self.ring.record_underrun();
            return false;
        }
        true
    }
}

/// Linear interpolation from the capture rate to the device rate.
///
/// `phase` counts in units of `1 / (source_rate * output_rate)` seconds:
/// one output frame advances it by `source_rate`, one source frame is
/// worth `output_rate`. Integer arithmetic keeps long sessions drift free.
struct LinearResampler {
    source_rate: u32,
    output_rate: u32,
    phase: u64,
    cur: Vec<f32>,
    next: Vec<f32>,
    frame: Vec<f32>,
}

impl LinearResampler {
    fn new(format: CaptureFormat) -> Self {
        let channels = format.channels as usize;
        Self {
            source_rate: format.sample_rate,
            output_rate: 0,
            phase: 0,
            cur: vec![0.0; channels],
            next: vec![0.0; channels],
            frame: vec![0.0; channels],
        }
    }

    fn set_output_rate(&mut self, rate: u32) {
        self.output_rate = rate;
        // Two source frames are loaded before the first output frame.
        self.phase = 2 * rate as u64;
    }

    fn is_active(&self) -> bool {
        self.output_rate != 0 && self.output_rate != self.source_rate
    }

    /// Source frames consumed by the next `frames` output frames
    fn frames_needed(&self, frames: usize) -> usize {
        if frames == 0 {
            return 0;
        }
        let span = self.phase + (frames as u64 - 1) * self.source_rate as u64;
        (span / self.output_rate as u64) as usize
    }

    /// Produce one output frame. The caller has checked `frames_needed`.
    fn advance(&mut self, ring: &mut SampleConsumer) -> &[f32] {
        let step = self.output_rate as u64;
        while self.phase >= step {
            std::mem::swap(&mut self.cur, &mut self.next);
            ring.pull(&mut self.next);
            self.phase -= step;
        }

        let t = self.phase as f32 / step as f32;
        for ((out, a), b) in self.frame.iter_mut().zip(&self.cur).zip(&self.next) {
            *out = a + (b - a) * t;
        }
        self.phase += self.source_rate as u64;
        &self.frame
    }
}

/// Value of output channel `ch` for one interleaved source frame.
///
/// Mono output folds the source per `downmix`; a mono source feeds every
/// output channel; output channels the source lacks are silent.
#[inline]
fn route(src: &[f32], ch: usize, out_channels: usize, downmix: MonoDownmix) -> f32 {
    if out_channels == 1 {
        return match downmix {
            MonoDownmix::FirstChannel => src[0],
            MonoDownmix::Average => src.iter().sum::<f32>() / src.len() as f32,
        };
    }
    if src.len() == 1 {
        return src[0];
    }
    src.get(ch).copied().unwrap_or(0.0)
}

enum RenderUpdate {
    Attach(RenderConsumer),
    Detach,
}

/// Create the link between the I/O context and the audio callback
pub fn render_link() -> (RenderLink, RenderEndpoint) {
    let (update_tx, update_rx) = bounded(RENDER_LINK_DEPTH);
    let (retired_tx, retired_rx) = bounded(RENDER_LINK_DEPTH * 2);
    (
        RenderLink {
            updates: update_tx,
            stale: update_rx.clone(),
            retired: retired_rx,
        },
        RenderEndpoint {
            updates: update_rx,
            retired: retired_tx,
            active: None,
            parked: None,
            output_rate: 0,
            underruns: 0,
        },
    )
}

/// I/O-side handle that installs and removes the active consumer.
///
/// Only the latest request matters: anything the callback has not picked
/// up yet is superseded by the next `attach` or `detach`.
pub struct RenderLink {
    updates: Sender<RenderUpdate>,
    /// Second receiver on `updates`, used to withdraw superseded requests
    stale: Receiver<RenderUpdate>,
    retired: Receiver<RenderConsumer>,
}

impl RenderLink {
    /// Replace whatever consumer the callback holds with `consumer`
    pub fn attach(&self, consumer: RenderConsumer) {
        self.collect_retired();
        self.send(RenderUpdate::Attach(consumer));
    }

    /// Leave the callback with no consumer; it outputs silence from its next cycle
    pub fn detach(&self) {
        self.collect_retired();
        self.send(RenderUpdate::Detach);
    }

    /// Free consumers the callback has handed back
    pub fn collect_retired(&self) -> usize {
        self.retired.try_iter().count()
    }

    fn send(&self, update: RenderUpdate) {
        let superseded = self.stale.try_iter().count();
        if superseded > 0 {
            tracing::debug!("Superseded {} pending render update(s)", superseded);
        }
        match self.updates.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Render link full after withdrawing pending updates");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("No render callback attached");
            }
        }
    }
}

/// Callback-side end of the link
pub struct RenderEndpoint {
    updates: Receiver<RenderUpdate>,
    retired: Sender<RenderConsumer>,
    active: Option<RenderConsumer>,
    /// Retired consumer waiting for room on `retired`; never freed in the callback
    parked: Option<RenderConsumer>,
    output_rate: u32,
    underruns: u64,
}

impl RenderEndpoint {
    /// Device rate applied to every consumer attached from now on
    pub fn set_output_rate(&mut self, rate: u32) {
        self.output_rate = rate;
        if let Some(consumer) = self.active.as_mut() {
            consumer.set_output_rate(rate);
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Apply pending attach/detach requests.
    ///
    /// While a retired consumer cannot be handed back, later requests stay
    /// queued until it can.
    fn poll_updates(&mut self) {
        if let Some(old) = self.parked.take() {
            if let Err(err) = self.retired.try_send(old) {
                self.parked = Some(err.into_inner());
                return;
            }
        }

        while let Ok(update) = self.updates.try_recv() {
            let next = match update {
                RenderUpdate::Attach(mut consumer) => {
                    consumer.set_output_rate(self.output_rate);
                    Some(consumer)
                }
                RenderUpdate::Detach => None,
            };
            if let Some(old) = std::mem::replace(&mut self.active, next) {
                if let Err(err) = self.retired.try_send(old) {
                    self.parked = Some(err.into_inner());
                    return;
                }
            }
        }
    }

    /// Render one interleaved cycle; silence when no consumer is attached
    pub fn render_interleaved(&mut self, output: &mut [f32], out_channels: usize) {
        self.poll_updates();
        match self.active.as_mut() {
            Some(consumer) => {
                if !consumer.render_interleaved(output, out_channels) {
                    self.underruns += 1;
                }
            }
            None => output.fill(0.0),
        }
    }

    /// Render one planar cycle; silence when no consumer is attached
    pub fn render_planar(&mut self, outputs: &mut [&mut [f32]]) {
        self.poll_updates();
        match self.active.as_mut() {
            Some(consumer) => {
                if !consumer.render_planar(outputs) {
                    self.underruns += 1;
                }
            }
            None => {
                for channel in outputs.iter_mut() {
                    channel.fill(0.0);
                }
            }
        }
    }

    /// Whether a consumer was attached as of the last cycle
    pub fn is_attached(&self) -> bool {
        self.active.is_some()
    }

    /// Underrun cycles seen by this endpoint across all consumers
    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}
