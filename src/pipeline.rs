//! Chain assembly and the outer run loop
//!
//! Chains are built innermost first. From the destination outwards:
//!
//! ```text
//! null ─ render ─ [rate] ─ network ─ [rate] ─ stdout ─ tap ─ volume ─ averaging ─ flow ─ [rate] ─ [channels]
//! ```
//!
//! Bracketed stages are inserted only when formats differ; each destination
//! is optional. Format conversions nearest the destination come first, so
//! the source-facing end of the chain always matches the capture format.

use std::sync::Arc;
use std::thread;

use crate::audio::capture::{CaptureSource, CpalCapture};
use crate::audio::device::{self, AudioDevice, DataFlow};
use crate::audio::format::{ChannelMask, StreamFormat};
use crate::audio::render::{RenderDevice, RenderSink};
use crate::config::CaptureConfig;
use crate::constants::POLL_INTERVAL;
use crate::control::{AveragingSink, FlowControlSink, SharedControl, TapSink, VolumeSink};
use crate::error::{ConfigError, Result};
use crate::network::{NetworkSink, NetworkTarget};
use crate::protocol::adjust_sample_rate;
use crate::sink::{describe, ChannelConvertSink, NullSink, SampleRateConvertSink, Sink, StdoutSink};

/// Control stages driven by a shared control block
pub struct ControlStages {
    pub control: Arc<SharedControl>,
    pub tap: bool,
    pub averaging: bool,
}

/// Where the chain delivers audio
#[derive(Default)]
pub struct Destinations {
    pub render: Option<Box<dyn RenderDevice>>,
    pub network: Option<NetworkTarget>,
    pub stdout: bool,
    pub control: Option<ControlStages>,
}

/// Format the chain runs at, independent of source and destinations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainFormat {
    /// Source rate if unset
    pub sample_rate: Option<u32>,
    /// Source layout if unset
    pub channel_mask: Option<ChannelMask>,
}

fn convert_rate(next: Box<dyn Sink>, source_rate: u32) -> Box<dyn Sink> {
    if next.sample_rate() == source_rate {
        next
    } else {
        Box::new(SampleRateConvertSink::new(next, source_rate))
    }
}

/// Prefix `next` with the conversions needed to accept `source`: a rate
/// convert nearest `next`, then a channel convert.
pub fn adapt_to_source(next: Box<dyn Sink>, source: StreamFormat) -> Box<dyn Sink> {
    let sink = convert_rate(next, source.sample_rate);
    if sink.channel_mask() == source.channel_mask {
        sink
    } else {
        Box::new(ChannelConvertSink::new(sink, source.channel_mask))
    }
}

/// Assemble the chain for a source producing `source`.
///
/// Fails with [`ConfigError::UnableToPlay`] if no destination can consume
/// audio.
pub fn build_chain(
    source: StreamFormat,
    chain: ChainFormat,
    destinations: Destinations,
) -> Result<Box<dyn Sink>> {
    let chain_rate = chain.sample_rate.unwrap_or(source.sample_rate);
    let chain_mask = chain.channel_mask.unwrap_or(source.channel_mask);

    let before_render_rate = if destinations.network.is_some() {
        adjust_sample_rate(chain_rate)
    } else {
        chain_rate
    };

    let mut sink: Box<dyn Sink> = match destinations.render {
        Some(device) => {
            let render_format = StreamFormat::new(device.sample_rate()?, chain_mask);
            let null = Box::new(NullSink::new(render_format));
            let render = Box::new(RenderSink::open(null, device)?);
            convert_rate(render, before_render_rate)
        }
        None => Box::new(NullSink::new(StreamFormat::new(before_render_rate, chain_mask))),
    };

    if let Some(target) = destinations.network.as_ref() {
        sink = Box::new(NetworkSink::new(sink, target)?);
    }

    sink = convert_rate(sink, chain_rate);

    if destinations.stdout {
        sink = Box::new(StdoutSink::new(sink));
    }

    if let Some(stages) = destinations.control {
        if stages.tap {
            sink = Box::new(TapSink::new(sink, stages.control.clone()));
        }
        sink = Box::new(VolumeSink::new(sink, stages.control.clone()));
        if stages.averaging {
            sink = Box::new(AveragingSink::new(sink, stages.control.clone()));
        }
        sink = Box::new(FlowControlSink::new(sink, stages.control));
    }

    sink = adapt_to_source(sink, source);

    if !sink.can_play() {
        return Err(ConfigError::UnableToPlay.into());
    }

    tracing::info!("Chain for {}: {}", source, describe(sink.as_ref()).join(" -> "));

    Ok(sink)
}

/// A capture source bound to its chain
pub struct Pipeline {
    source: CaptureSource,
    chain: Box<dyn Sink>,
}

impl Pipeline {
    pub fn new(source: CaptureSource, chain: Box<dyn Sink>) -> Self {
        Self { source, chain }
    }

    /// Open devices and the control block named by `config` and assemble
    /// the chain.
    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        config.validate()?;

        let source_device = match config.source_device.as_deref() {
            Some(id) => device::get_device_by_id(id)?,
            None => device::default_device(config.source_flow, config.source_role)?,
        };
        tracing::info!("Capturing from {} ({})", source_device.name, source_device.id);
        let capture = CpalCapture::new(source_device)?;
        let source = CaptureSource::new(Box::new(capture));

        let render = if config.render.enabled {
            let device: AudioDevice = match config.render.device.as_deref() {
                Some(id) => device::get_device_by_id(id)?,
                None => device::default_device(DataFlow::Render, config.render.role)?,
            };
            Some(Box::new(device) as Box<dyn RenderDevice>)
        } else {
            None
        };

        let control = match config.shared_memory.name.as_deref() {
            Some(name) => Some(ControlStages {
                control: Arc::new(SharedControl::open(name)?),
                tap: config.shared_memory.tap,
                averaging: config.shared_memory.averaging,
            }),
            None => None,
        };

        let destinations = Destinations {
            render,
            network: config
                .network
                .enabled
                .then(|| config.network.target.clone()),
            stdout: config.stdout,
            control,
        };

        let chain_format = ChainFormat {
            sample_rate: config.sample_rate,
            channel_mask: config.chain_mask(),
        };
        let chain = build_chain(source.format(), chain_format, destinations)?;

        Ok(Self::new(source, chain))
    }

    pub fn chain(&self) -> &dyn Sink {
        self.chain.as_ref()
    }

    /// Run for `duration` seconds, or until the chain closes if unbounded.
    ///
    /// While unbounded, capture restarts in one-hour frame budgets and
    /// idles while the chain is open but not playing.
    pub fn run(&mut self, duration: Option<f64>) -> Result<()> {
        let rate = self.source.format().sample_rate as u64;

        match duration {
            None => {
                while self.chain.is_open() {
                    if self.chain.is_playing() {
                        self.source.run(self.chain.as_mut(), rate * 3600)?;
                    } else {
                        thread::sleep(POLL_INTERVAL);
                    }
                }
                tracing::info!("Chain closed");
            }
            Some(seconds) => {
                if self.chain.is_open() && self.chain.is_playing() {
                    let frames = (rate as f64 * seconds) as u64;
                    self.source.run(self.chain.as_mut(), frames)?;
                }
            }
        }

        Ok(())
    }
}
