//! Audio subsystem module

pub mod buffer;
pub mod device;
pub mod pcm;
pub mod playback;
pub mod render;

pub use buffer::{sample_ring, RingStats, SampleConsumer, SampleProducer};
pub use device::{get_output_device, list_output_devices, OutputDeviceInfo};
pub use pcm::PcmConverter;
pub use playback::{AudioPlayback, OutputFormat};
pub use render::{render_link, MonoDownmix, RenderConsumer, RenderEndpoint, RenderLink};
