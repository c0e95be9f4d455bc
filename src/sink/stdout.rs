//! Raw sample output on standard output

use std::io::{self, Write};

use super::{Chain, Sink};
use crate::audio::format::StreamFormat;
use crate::error::Result;

/// Writes interleaved little-endian f32 samples to stdout, then forwards.
pub struct StdoutSink {
    chain: Chain,
    scratch: Vec<u8>,
}

impl StdoutSink {
    pub fn new(next: Box<dyn Sink>) -> Self {
        Self {
            chain: Chain::new(next),
            scratch: Vec::new(),
        }
    }
}

impl Sink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn format(&self) -> StreamFormat {
        self.chain.format()
    }

    fn next(&self) -> Option<&dyn Sink> {
        Some(self.chain.next())
    }

    fn can_play(&self) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        self.chain.is_open()
    }

    fn is_playing(&self) -> bool {
        true
    }

    fn process(&mut self, samples: &[f32], frames: usize) -> Result<bool> {
        let samples = &samples[..frames * self.chain.channels()];
        self.scratch.clear();
        self.scratch.reserve(samples.len() * 4);
        for sample in samples {
            self.scratch.extend_from_slice(&sample.to_le_bytes());
        }
        io::stdout().lock().write_all(&self.scratch)?;

        self.chain.process(samples, frames)
    }

    fn flush(&mut self) -> Result<()> {
        io::stdout().lock().flush()?;
        self.chain.flush()
    }
}
