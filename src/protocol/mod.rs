//! Wire protocol spoken with the capture producer over its stdio pipes

pub mod decoder;
pub mod messages;
pub mod sender;

pub use decoder::{StreamDecoder, StreamItem, StreamMode};
pub use messages::{AudioSession, CaptureFormat, Command, ControlEvent, PidInput, ProducerDiagnostic};
pub use sender::CommandSender;
