//! Stream descriptors and speaker positions
//!
//! A stream is described by its sample rate and a channel mask: one bit per
//! speaker position, channel order within a frame follows ascending bit
//! order.

use std::fmt;

use crate::constants::MAX_CHANNELS;

/// Speaker position of a single channel.
///
/// Positions 0..=17 are the named speaker layout bits; the remaining bits of
/// a 32-bit mask have no defined placement and are carried as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPosition {
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    BackLeft,
    BackRight,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    BackCenter,
    SideLeft,
    SideRight,
    TopCenter,
    TopFrontLeft,
    TopFrontCenter,
    TopFrontRight,
    TopBackLeft,
    TopBackCenter,
    TopBackRight,
    Other(u8),
}

impl ChannelPosition {
    const NAMED: [ChannelPosition; 18] = [
        Self::FrontLeft,
        Self::FrontRight,
        Self::FrontCenter,
        Self::LowFrequency,
        Self::BackLeft,
        Self::BackRight,
        Self::FrontLeftOfCenter,
        Self::FrontRightOfCenter,
        Self::BackCenter,
        Self::SideLeft,
        Self::SideRight,
        Self::TopCenter,
        Self::TopFrontLeft,
        Self::TopFrontCenter,
        Self::TopFrontRight,
        Self::TopBackLeft,
        Self::TopBackCenter,
        Self::TopBackRight,
    ];

    /// Position for a mask bit index. Returns `None` for indices >= 32.
    pub fn from_index(index: u32) -> Option<Self> {
        match index as usize {
            i if i < Self::NAMED.len() => Some(Self::NAMED[i]),
            i if i < MAX_CHANNELS => Some(Self::Other(i as u8)),
            _ => None,
        }
    }

    /// Mask bit index of this position
    pub fn index(self) -> usize {
        match self {
            Self::Other(i) => i as usize,
            named => Self::NAMED
                .iter()
                .position(|p| *p == named)
                .unwrap_or_default(),
        }
    }

    /// Single-channel substitute, used when the position itself is missing
    /// from a source layout.
    pub fn counterpart(self) -> Option<Self> {
        use ChannelPosition::*;
        match self {
            FrontLeft => Some(FrontRight),
            FrontRight => Some(FrontLeft),
            BackLeft => Some(BackRight),
            BackRight => Some(BackLeft),
            FrontLeftOfCenter => Some(FrontRightOfCenter),
            FrontRightOfCenter => Some(FrontLeftOfCenter),
            SideLeft => Some(SideRight),
            SideRight => Some(SideLeft),
            TopFrontLeft => Some(TopFrontRight),
            TopFrontRight => Some(TopFrontLeft),
            TopBackLeft => Some(TopBackRight),
            TopBackRight => Some(TopBackLeft),
            FrontCenter | LowFrequency | BackCenter | TopCenter | TopFrontCenter
            | TopBackCenter | Other(_) => None,
        }
    }

    /// Neighbouring positions that are mixed (averaged if both exist) when
    /// neither the position nor its counterpart is available.
    pub fn neighbours(self) -> (Option<Self>, Option<Self>) {
        use ChannelPosition::*;
        match self {
            FrontLeft | FrontRight => (Some(FrontCenter), None),
            FrontCenter => (Some(FrontLeft), Some(FrontRight)),
            BackLeft | BackRight => (Some(BackCenter), None),
            FrontLeftOfCenter => (Some(FrontLeft), Some(FrontCenter)),
            FrontRightOfCenter => (Some(FrontRight), Some(FrontCenter)),
            BackCenter => (Some(BackLeft), Some(BackRight)),
            TopFrontLeft | TopFrontRight => (Some(TopFrontCenter), None),
            TopFrontCenter => (Some(TopFrontLeft), Some(TopFrontRight)),
            TopBackLeft | TopBackRight => (Some(TopBackCenter), None),
            TopBackCenter => (Some(TopBackLeft), Some(TopBackRight)),
            LowFrequency | SideLeft | SideRight | TopCenter | Other(_) => (None, None),
        }
    }
}

/// Bitset over up to 32 speaker positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelMask(pub u32);

impl ChannelMask {
    pub const MONO: ChannelMask = ChannelMask(0x4);
    pub const STEREO: ChannelMask = ChannelMask(0x3);
    pub const QUAD: ChannelMask = ChannelMask(0x33);
    pub const SURROUND_5_1: ChannelMask = ChannelMask(0x3f);
    pub const SURROUND_7_1: ChannelMask = ChannelMask(0x63f);

    /// Mask made of the lowest `count` bits.
    pub fn low_bits(count: u32) -> Self {
        match count {
            0 => ChannelMask(0),
            c if c as usize >= MAX_CHANNELS => ChannelMask(u32::MAX),
            c => ChannelMask((1u32 << c) - 1),
        }
    }

    /// Conventional speaker layout for a device that only reports a channel
    /// count.
    pub fn for_channel_count(count: u16) -> Self {
        match count {
            1 => Self::MONO,
            2 => Self::STEREO,
            4 => Self::QUAD,
            6 => Self::SURROUND_5_1,
            8 => Self::SURROUND_7_1,
            n => Self::low_bits(n as u32),
        }
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn channels(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Positions in channel order (ascending bit index)
    pub fn positions(self) -> impl Iterator<Item = ChannelPosition> {
        let mut remaining = self.0;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let index = remaining.trailing_zeros();
            remaining &= remaining - 1;
            ChannelPosition::from_index(index)
        })
    }

    /// Channel slot of `position` within a frame, if present
    pub fn slot_of(self, position: ChannelPosition) -> Option<usize> {
        self.positions().position(|p| p == position)
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ch ({:08x})", self.channels(), self.0)
    }
}

/// Sample rate and channel layout of an interleaved f32 stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channel_mask: ChannelMask,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channel_mask: ChannelMask) -> Self {
        Self {
            sample_rate,
            channel_mask,
        }
    }

    pub fn channels(&self) -> usize {
        self.channel_mask.channels()
    }

    pub fn with_sample_rate(self, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..self
        }
    }

    pub fn with_channel_mask(self, channel_mask: ChannelMask) -> Self {
        Self {
            channel_mask,
            ..self
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz, {}", self.sample_rate, self.channel_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_follow_bit_order() {
        let positions: Vec<_> = ChannelMask::SURROUND_5_1.positions().collect();
        assert_eq!(
            positions,
            vec![
                ChannelPosition::FrontLeft,
                ChannelPosition::FrontRight,
                ChannelPosition::FrontCenter,
                ChannelPosition::LowFrequency,
                ChannelPosition::BackLeft,
                ChannelPosition::BackRight,
            ]
        );
    }

    #[test]
    fn test_position_index_roundtrip() {
        for index in 0..32 {
            let position = ChannelPosition::from_index(index).unwrap();
            assert_eq!(position.index(), index as usize);
        }
        assert!(ChannelPosition::from_index(32).is_none());
    }

    #[test]
    fn test_low_bits() {
        assert_eq!(ChannelMask::low_bits(2), ChannelMask(0b11));
        assert_eq!(ChannelMask::low_bits(32), ChannelMask(u32::MAX));
        assert_eq!(ChannelMask::low_bits(32).channels(), 32);
    }

    #[test]
    fn test_counterparts_are_symmetric() {
        for index in 0..32 {
            let position = ChannelPosition::from_index(index).unwrap();
            if let Some(other) = position.counterpart() {
                assert_eq!(other.counterpart(), Some(position));
            }
        }
    }

    #[test]
    fn test_slot_of() {
        let mask = ChannelMask::SURROUND_7_1;
        assert_eq!(mask.slot_of(ChannelPosition::SideLeft), Some(6));
        assert_eq!(mask.slot_of(ChannelPosition::BackCenter), None);
    }
}
