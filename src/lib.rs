//! # PCM Relay
//!
//! Low-latency capture of endpoint audio, relayed through a chain of
//! processing stages to a playback device, a UDP stream, stdout, or a
//! shared-memory tap.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         CAPTURE THREAD (single)                          │
//! │                                                                          │
//! │  ┌────────────────┐   pull batch   ┌──────────────────────────────────┐  │
//! │  │ CaptureSource  │───────────────▶│ chain head (sink::Sink)          │  │
//! │  │ (audio::capture)│               └────────────────┬─────────────────┘  │
//! │  └───────▲────────┘                                 │                    │
//! │          │ RingBuffer<AudioFrame>                   ▼                    │
//! │  ┌───────┴────────┐               ┌──────────────────────────────────┐   │
//! │  │ cpal callback  │               │ channel-convert / rate-convert   │   │
//! │  └────────────────┘               ├──────────────────────────────────┤   │
//! │                                   │ flow-control → averaging →       │   │
//! │   external controller ◀─ shm ───▶ │ volume/limiter → tap (control)   │   │
//! │                                   ├──────────────────────────────────┤   │
//! │                                   │ stdout                           │   │
//! │                                   ├──────────────────────────────────┤   │
//! │                                   │ rate-convert → network (UDP)     │───┼──▶ peer
//! │                                   ├──────────────────────────────────┤   │
//! │                                   │ rate-convert → render            │───┼──▶ device
//! │                                   ├──────────────────────────────────┤   │
//! │                                   │ null                             │   │
//! │                                   └──────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every stage owns its successor and shares the [`sink::Sink`] contract, so
//! stages compose in any order. [`pipeline::build_chain`] assembles the
//! conventional order shown above.

pub mod audio;
pub mod config;
pub mod control;
pub mod error;
pub mod lifetime;
pub mod network;
pub mod pipeline;
pub mod protocol;
pub mod sink;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default sample rate when a network stage needs a representable rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Channel positions addressable by a channel mask
    pub const MAX_CHANNELS: usize = 32;

    /// Maximum f32 samples carried by one datagram
    pub const MAX_PAYLOAD_SAMPLES: usize = 288;

    /// Default multicast group for the network stage
    pub const DEFAULT_PEER_ADDRESS: &str = "239.255.77.77";

    /// Default UDP port for the network stage
    pub const DEFAULT_PEER_SERVICE: &str = "4010";

    /// Sleep between polls of devices and flow state
    pub const POLL_INTERVAL: Duration = Duration::from_millis(6);

    /// Capture callbacks buffered between the device and the pipeline
    pub const CAPTURE_RING_CAPACITY: usize = 256;

    /// Render FIFO length in milliseconds of audio
    pub const RENDER_BUFFER_MS: u32 = 100;

    /// How often the lifetime watcher checks the bound process
    pub const LIFETIME_POLL_INTERVAL: Duration = Duration::from_millis(250);
}
