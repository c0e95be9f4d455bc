//! Wire format of the UDP audio stream
//!
//! Every datagram starts with a fixed 5-byte header followed by interleaved
//! little-endian f32 samples:
//!
//! ```text
//! ┌───────────┬──────────────┬──────────┬───────────────────────┬─────────────────┐
//! │ rate code │ bits/sample  │ channels │ channel mask (hi, lo) │ f32 LE samples… │
//! │  1 byte   │ 1 byte (=32) │  1 byte  │        2 bytes        │                 │
//! └───────────┴──────────────┴──────────┴───────────────────────┴─────────────────┘
//! ```
//!
//! The rate code's low 7 bits are a multiplier (1..=127) of the base rate;
//! the high bit selects 44100 Hz as the base instead of 48000 Hz.

use crate::audio::format::{ChannelMask, StreamFormat};
use crate::error::{ConfigError, NetworkError};

/// Header length in bytes
pub const HEADER_LEN: usize = 5;

/// Sample width carried on the wire
pub const BITS_PER_SAMPLE: u8 = 32;

const BASE_48K: u32 = 48000;
const BASE_44K1: u32 = 44100;
const FAMILY_44K1: u8 = 0x80;
const MAX_MULTIPLIER: u32 = 127;

/// Encodes a sample rate as a rate-family code.
pub fn rate_code(sample_rate: u32) -> Result<u8, ConfigError> {
    let (base, family) = if sample_rate != 0 && sample_rate % BASE_48K == 0 {
        (BASE_48K, 0)
    } else if sample_rate != 0 && sample_rate % BASE_44K1 == 0 {
        (BASE_44K1, FAMILY_44K1)
    } else {
        return Err(ConfigError::UnsupportedSampleRate(sample_rate));
    };

    let multiplier = sample_rate / base;
    if multiplier > MAX_MULTIPLIER {
        return Err(ConfigError::SampleRateMultiplier {
            rate: sample_rate,
            base,
            multiplier,
        });
    }

    Ok(multiplier as u8 | family)
}

/// Sample rate for a rate-family code, `None` for a zero multiplier
pub fn rate_from_code(code: u8) -> Option<u32> {
    let multiplier = (code & !FAMILY_44K1) as u32;
    if multiplier == 0 {
        return None;
    }
    let base = if code & FAMILY_44K1 != 0 {
        BASE_44K1
    } else {
        BASE_48K
    };
    Some(base * multiplier)
}

/// Rate to use upstream of a network stage: representable rates are kept,
/// anything else becomes 48000 Hz.
pub fn adjust_sample_rate(sample_rate: u32) -> u32 {
    if sample_rate != 0 && (sample_rate % BASE_48K == 0 || sample_rate % BASE_44K1 == 0) {
        sample_rate
    } else {
        BASE_48K
    }
}

/// Decoded datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub rate_code: u8,
    pub bits_per_sample: u8,
    pub channels: u8,
    pub channel_mask: u16,
}

impl PacketHeader {
    /// Header for a stream format.
    ///
    /// Only the low 16 bits of the channel mask fit on the wire.
    pub fn for_format(format: &StreamFormat) -> Result<Self, ConfigError> {
        Ok(Self {
            rate_code: rate_code(format.sample_rate)?,
            bits_per_sample: BITS_PER_SAMPLE,
            channels: format.channels() as u8,
            channel_mask: format.channel_mask.bits() as u16,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let [mask_hi, mask_lo] = self.channel_mask.to_be_bytes();
        [
            self.rate_code,
            self.bits_per_sample,
            self.channels,
            mask_hi,
            mask_lo,
        ]
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, NetworkError> {
        if datagram.len() < HEADER_LEN {
            return Err(NetworkError::InvalidPacket);
        }
        Ok(Self {
            rate_code: datagram[0],
            bits_per_sample: datagram[1],
            channels: datagram[2],
            channel_mask: u16::from_be_bytes([datagram[3], datagram[4]]),
        })
    }

    /// Stream format announced by this header
    pub fn format(&self) -> Option<StreamFormat> {
        rate_from_code(self.rate_code)
            .map(|rate| StreamFormat::new(rate, ChannelMask(self.channel_mask as u32)))
    }
}

/// Samples carried by a datagram, after its header
pub fn decode_samples(datagram: &[u8]) -> Result<Vec<f32>, NetworkError> {
    let payload = datagram
        .get(HEADER_LEN..)
        .ok_or(NetworkError::InvalidPacket)?;
    if payload.len() % 4 != 0 {
        return Err(NetworkError::InvalidPacket);
    }
    Ok(payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
