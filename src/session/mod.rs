//! Capture session: state machine, ring ownership and UI events

pub mod capture;
pub mod state;

pub use capture::{CaptureSession, SessionOptions};
pub use state::{SessionObserver, SessionSnapshot, SessionState, UiEvent};
