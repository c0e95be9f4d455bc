//! Sink contract and chain building blocks
//!
//! Every pipeline element implements [`Sink`]. A chain is a singly-linked
//! list of sinks, each owning its successor; stages are built innermost
//! first so that each one can read its successor's format at construction.
//!
//! Most stages are decorators: they embed a [`Chain`], forward every query
//! to it and override only the operations they change.

pub mod convert;
pub mod stdout;

pub use convert::{ChannelConvertSink, ChannelSource, SampleRateConvertSink};
pub use stdout::StdoutSink;

use crate::audio::format::{ChannelMask, StreamFormat};
use crate::error::Result;

/// A pipeline stage.
///
/// `process` receives `frames` interleaved frames in `samples`; the slice may
/// be longer than `frames * channels`, the excess is ignored. Stages must not
/// keep references to `samples` past return.
pub trait Sink {
    /// Short stage name for logs and chain descriptions
    fn name(&self) -> &'static str;

    /// Format this stage accepts, fixed at construction
    fn format(&self) -> StreamFormat;

    /// Successor, `None` for terminal sinks
    fn next(&self) -> Option<&dyn Sink>;

    /// Whether the ultimate destination can consume audio at all
    fn can_play(&self) -> bool;

    /// Whether the destination is still viable
    fn is_open(&self) -> bool;

    /// Whether the destination currently accepts data
    fn is_playing(&self) -> bool;

    /// Consume frames. Returns whether a terminal [`Sink::flush`] is needed.
    fn process(&mut self, samples: &[f32], frames: usize) -> Result<bool>;

    /// Drain internal state
    fn flush(&mut self) -> Result<()>;

    fn sample_rate(&self) -> u32 {
        self.format().sample_rate
    }

    fn channel_mask(&self) -> ChannelMask {
        self.format().channel_mask
    }

    fn channels(&self) -> usize {
        self.format().channels()
    }
}

/// Stage names from `sink` to the terminal sink
pub fn describe(sink: &dyn Sink) -> Vec<&'static str> {
    let mut names = Vec::new();
    let mut current = Some(sink);
    while let Some(stage) = current {
        names.push(stage.name());
        current = stage.next();
    }
    names
}

/// Decorator base: owns the successor and forwards to it.
pub struct Chain {
    format: StreamFormat,
    next: Box<dyn Sink>,
}

impl Chain {
    /// Chain with the successor's format
    pub fn new(next: Box<dyn Sink>) -> Self {
        let format = next.format();
        Self { format, next }
    }

    /// Chain accepting `format`, which may differ from the successor's
    pub fn with_format(next: Box<dyn Sink>, format: StreamFormat) -> Self {
        Self { format, next }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    pub fn next(&self) -> &dyn Sink {
        self.next.as_ref()
    }

    pub fn next_mut(&mut self) -> &mut dyn Sink {
        self.next.as_mut()
    }

    pub fn can_play(&self) -> bool {
        self.next.can_play()
    }

    pub fn is_open(&self) -> bool {
        self.next.is_open()
    }

    pub fn is_playing(&self) -> bool {
        self.next.is_playing()
    }

    pub fn process(&mut self, samples: &[f32], frames: usize) -> Result<bool> {
        self.next.process(samples, frames)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.next.flush()
    }
}

/// Terminal sink that accepts and discards everything.
pub struct NullSink {
    format: StreamFormat,
}

impl NullSink {
    pub fn new(format: StreamFormat) -> Self {
        Self { format }
    }
}

impl Sink for NullSink {
    fn name(&self) -> &'static str {
        "null"
    }

    fn format(&self) -> StreamFormat {
        self.format
    }

    fn next(&self) -> Option<&dyn Sink> {
        None
    }

    fn can_play(&self) -> bool {
        false
    }

    fn is_open(&self) -> bool {
        true
    }

    fn is_playing(&self) -> bool {
        false
    }

    fn process(&mut self, _samples: &[f32], _frames: usize) -> Result<bool> {
        Ok(true)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
