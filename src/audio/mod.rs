//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod format;
pub mod render;

pub use buffer::{AudioFrame, RingBuffer, SampleFifo};
pub use capture::{CaptureClient, CaptureSource, CpalCapture};
pub use device::{AudioDevice, DataFlow, DeviceInfo, DeviceState, Role, StateMask};
pub use format::{ChannelMask, ChannelPosition, StreamFormat};
pub use render::{CpalRenderer, RenderClient, RenderDevice, RenderSink};
