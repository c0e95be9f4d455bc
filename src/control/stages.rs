//! Control-driven stages: flow gating, smoothing and the raw tap

use std::sync::Arc;

use super::SharedControl;
use crate::audio::format::StreamFormat;
use crate::error::Result;
use crate::sink::{Chain, Sink};

/// Gates the chain on the controller's open/enabled state.
pub struct FlowControlSink {
    chain: Chain,
    control: Arc<SharedControl>,
}

impl FlowControlSink {
    pub fn new(next: Box<dyn Sink>, control: Arc<SharedControl>) -> Self {
        Self {
            chain: Chain::new(next),
            control,
        }
    }
}

impl Sink for FlowControlSink {
    fn name(&self) -> &'static str {
        "flow-control"
    }

    fn format(&self) -> StreamFormat {
        self.chain.format()
    }

    fn next(&self) -> Option<&dyn Sink> {
        Some(self.chain.next())
    }

    fn can_play(&self) -> bool {
        self.chain.can_play()
    }

    fn is_open(&self) -> bool {
        self.chain.is_open() && self.control.is_open()
    }

    fn is_playing(&self) -> bool {
        self.chain.is_playing() && self.control.is_playing()
    }

    fn process(&mut self, samples: &[f32], frames: usize) -> Result<bool> {
        if !self.control.is_open() || !self.control.is_playing() {
            return Ok(false);
        }
        self.chain.process(samples, frames)
    }

    fn flush(&mut self) -> Result<()> {
        self.chain.flush()
    }
}

/// Per-channel exponential smoothing, weight read from the control block
/// on every batch.
pub struct AveragingSink {
    chain: Chain,
    control: Arc<SharedControl>,
    averages: Vec<f64>,
    smoothed: Vec<f32>,
}

impl AveragingSink {
    pub fn new(next: Box<dyn Sink>, control: Arc<SharedControl>) -> Self {
        let chain = Chain::new(next);
        let averages = vec![0.0; chain.channels()];
        Self {
            chain,
            control,
            averages,
            smoothed: Vec::new(),
        }
    }
}

impl Sink for AveragingSink {
    fn name(&self) -> &'static str {
        "averaging"
    }

    fn format(&self) -> StreamFormat {
        self.chain.format()
    }

    fn next(&self) -> Option<&dyn Sink> {
        Some(self.chain.next())
    }

    fn can_play(&self) -> bool {
        self.chain.can_play()
    }

    fn is_open(&self) -> bool {
        self.chain.is_open()
    }

    fn is_playing(&self) -> bool {
        self.chain.is_playing()
    }

    fn process(&mut self, samples: &[f32], frames: usize) -> Result<bool> {
        let weight = self.control.block().averaging_weight.load() as f64;
        let samples = &samples[..frames * self.chain.channels()];
        if weight == 0.0 {
            return self.chain.process(samples, frames);
        }

        self.smoothed.clear();
        self.smoothed.reserve(samples.len());
        for frame in samples.chunks_exact(self.averages.len()) {
            for (average, &sample) in self.averages.iter_mut().zip(frame) {
                *average = weight * *average + (1.0 - weight) * sample as f64;
                self.smoothed.push(*average as f32);
            }
        }

        self.chain.process(&self.smoothed, frames)
    }

    fn flush(&mut self) -> Result<()> {
        self.averages.fill(0.0);
        self.chain.flush()
    }
}

/// Copies every batch, raw, into the control block's tap ring, then
/// forwards it.
pub struct TapSink {
    chain: Chain,
    control: Arc<SharedControl>,
    bytes: Vec<u8>,
    warned: bool,
}

impl TapSink {
    pub fn new(next: Box<dyn Sink>, control: Arc<SharedControl>) -> Self {
        Self {
            chain: Chain::new(next),
            control,
            bytes: Vec::new(),
            warned: false,
        }
    }

    fn has_tap(&self) -> bool {
        self.control.block().tap_capacity() > 0
    }
}

impl Sink for TapSink {
    fn name(&self) -> &'static str {
        "tap"
    }

    fn format(&self) -> StreamFormat {
        self.chain.format()
    }

    fn next(&self) -> Option<&dyn Sink> {
        Some(self.chain.next())
    }

    fn can_play(&self) -> bool {
        self.chain.can_play() || self.has_tap()
    }

    fn is_open(&self) -> bool {
        self.chain.is_open()
    }

    fn is_playing(&self) -> bool {
        self.chain.is_playing() || self.has_tap()
    }

    fn process(&mut self, samples: &[f32], frames: usize) -> Result<bool> {
        let samples = &samples[..frames * self.chain.channels()];

        if self.has_tap() {
            self.bytes.clear();
            self.bytes
                .extend(samples.iter().flat_map(|s| s.to_le_bytes()));
            if !self.control.write_tap(&self.bytes) && !self.warned {
                tracing::warn!(
                    "Tap region of {} does not fit the mapping, tap disabled",
                    self.control.name()
                );
                self.warned = true;
            }
        }

        self.chain.process(samples, frames)
    }

    fn flush(&mut self) -> Result<()> {
        self.chain.flush()
    }
}
