//! Format conversion stages
//!
//! [`SampleRateConvertSink`] resamples by linear interpolation over the
//! reduced rational ratio of the two rates. [`ChannelConvertSink`] remaps
//! channel layouts using exact position matches with fallbacks.

use super::{Chain, Sink};
use crate::audio::format::{ChannelMask, StreamFormat};
use crate::error::Result;

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Interpolation entry for one output frame of a period
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lerp {
    pub first: usize,
    pub second: usize,
    pub first_weight: f32,
    pub second_weight: f32,
}

/// Builds the per-period mapping table: `target_period` entries spread
/// evenly over the `source_period` input frames, first and last frames
/// aligned.
pub fn lerp_table(source_period: usize, target_period: usize) -> Vec<Lerp> {
    (0..target_period)
        .map(|i| {
            let position = if i == 0 {
                0.0
            } else {
                (i * (source_period - 1)) as f64 / (target_period - 1) as f64
            };
            let first = (position.floor() as usize).min(source_period - 1);
            let second_weight = (position - first as f64) as f32;
            let second = if second_weight == 0.0 {
                first
            } else {
                (first + 1).min(source_period - 1)
            };
            Lerp {
                first,
                second,
                first_weight: 1.0 - second_weight,
                second_weight,
            }
        })
        .collect()
}

fn convert_period(mappings: &[Lerp], channels: usize, source: &[f32], destination: &mut Vec<f32>) {
    for mapping in mappings {
        let first = &source[mapping.first * channels..(mapping.first + 1) * channels];
        let second = &source[mapping.second * channels..(mapping.second + 1) * channels];
        destination.extend(
            first
                .iter()
                .zip(second)
                .map(|(a, b)| a * mapping.first_weight + b * mapping.second_weight),
        );
    }
}

/// Converts from a source rate to the successor's rate.
///
/// Input is consumed in periods of `source_rate / gcd` frames, each producing
/// `target_rate / gcd` frames. Incomplete periods are carried over to the
/// next call and padded with silence on flush.
///
/// Must not be inserted between equal rates; it then degenerates to a copy.
pub struct SampleRateConvertSink {
    chain: Chain,
    source_period: usize,
    target_period: usize,
    mappings: Vec<Lerp>,
    carry: Vec<f32>,
    converted: Vec<f32>,
}

impl SampleRateConvertSink {
    pub fn new(next: Box<dyn Sink>, source_rate: u32) -> Self {
        debug_assert!(source_rate > 0 && next.sample_rate() > 0);

        let format = next.format().with_sample_rate(source_rate);
        let target_rate = next.sample_rate() as usize;
        let divisor = gcd(target_rate, source_rate as usize);
        let source_period = source_rate as usize / divisor;
        let target_period = target_rate / divisor;
        let channels = format.channels();

        Self {
            chain: Chain::with_format(next, format),
            source_period,
            target_period,
            mappings: lerp_table(source_period, target_period),
            carry: Vec::with_capacity(source_period * channels),
            converted: Vec::new(),
        }
    }

    /// Input frames per conversion period
    pub fn source_period(&self) -> usize {
        self.source_period
    }

    /// Output frames per conversion period
    pub fn target_period(&self) -> usize {
        self.target_period
    }

    pub fn mappings(&self) -> &[Lerp] {
        &self.mappings
    }

    /// Frames waiting for a complete period
    pub fn carried_frames(&self) -> usize {
        self.carry.len() / self.chain.channels()
    }
}

impl Sink for SampleRateConvertSink {
    fn name(&self) -> &'static str {
        "samplerate-convert"
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
        let channels = self.chain.channels();
        let period_len = self.source_period * channels;
        let mut input = &samples[..frames * channels];

        if !self.carry.is_empty() {
            let take = (period_len - self.carry.len()).min(input.len());
            self.carry.extend_from_slice(&input[..take]);
            input = &input[take..];
        }

        self.converted.clear();
        let mut periods = 0;

        if self.carry.len() == period_len {
            convert_period(&self.mappings, channels, &self.carry, &mut self.converted);
            self.carry.clear();
            periods += 1;
        }

        let mut chunks = input.chunks_exact(period_len);
        for period in &mut chunks {
            convert_period(&self.mappings, channels, period, &mut self.converted);
            periods += 1;
        }
        self.carry.extend_from_slice(chunks.remainder());

        if periods == 0 {
            return Ok(false);
        }

        self.chain
            .process(&self.converted, periods * self.target_period)
    }

    fn flush(&mut self) -> Result<()> {
        if !self.carry.is_empty() {
            let channels = self.chain.channels();
            let carried = self.carry.len() / channels;
            self.carry.resize(self.source_period * channels, 0.0);

            self.converted.clear();
            convert_period(&self.mappings, channels, &self.carry, &mut self.converted);
            self.carry.clear();

            // Rounds up: the last emitted frame may be partly padding.
            let frames = (carried * self.target_period).div_ceil(self.source_period);
            self.chain.process(&self.converted, frames)?;
        }

        self.chain.flush()
    }
}

/// Where an output channel takes its samples from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSource {
    Silent,
    Copy(usize),
    Mix(usize, usize),
}

/// Maps every channel of `target` to source slots of `source`.
///
/// A target position is taken from the same source position, else from its
/// counterpart, else from the mean of its neighbours (or whichever one of
/// them exists), else it is silent.
pub fn channel_mapping(source: ChannelMask, target: ChannelMask) -> Vec<ChannelSource> {
    target
        .positions()
        .map(|position| {
            if let Some(slot) = source.slot_of(position) {
                return ChannelSource::Copy(slot);
            }
            if let Some(slot) = position.counterpart().and_then(|p| source.slot_of(p)) {
                return ChannelSource::Copy(slot);
            }
            let (first, second) = position.neighbours();
            match (
                first.and_then(|p| source.slot_of(p)),
                second.and_then(|p| source.slot_of(p)),
            ) {
                (Some(a), Some(b)) => ChannelSource::Mix(a, b),
                (Some(a), None) | (None, Some(a)) => ChannelSource::Copy(a),
                (None, None) => ChannelSource::Silent,
            }
        })
        .collect()
}

/// Converts from a source channel layout to the successor's layout.
pub struct ChannelConvertSink {
    chain: Chain,
    mappings: Vec<ChannelSource>,
    converted: Vec<f32>,
}

impl ChannelConvertSink {
    pub fn new(next: Box<dyn Sink>, source_mask: ChannelMask) -> Self {
        let mappings = channel_mapping(source_mask, next.channel_mask());
        let format = next.format().with_channel_mask(source_mask);
        Self {
            chain: Chain::with_format(next, format),
            mappings,
            converted: Vec::new(),
        }
    }

    pub fn mappings(&self) -> &[ChannelSource] {
        &self.mappings
    }
}

impl Sink for ChannelConvertSink {
    fn name(&self) -> &'static str {
        "channel-convert"
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
        let channels = self.chain.channels();

        self.converted.clear();
        self.converted.reserve(frames * self.mappings.len());
        for frame in samples[..frames * channels].chunks_exact(channels) {
            self.converted
                .extend(self.mappings.iter().map(|mapping| match *mapping {
                    ChannelSource::Silent => 0.0,
                    ChannelSource::Copy(c) => frame[c],
                    ChannelSource::Mix(a, b) => 0.5 * (frame[a] + frame[b]),
                }));
        }

        self.chain.process(&self.converted, frames)
    }

    fn flush(&mut self) -> Result<()> {
        self.chain.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::RecordingSink;
    use proptest::prelude::*;

    fn recording(rate: u32, mask: ChannelMask) -> (Box<dyn Sink>, std::rc::Rc<std::cell::RefCell<crate::sink::testing::Recording>>) {
        let (sink, log) = RecordingSink::new(StreamFormat::new(rate, mask));
        (Box::new(sink), log)
    }

    #[test]
    fn test_table_length_is_reduced_target_rate() {
        let (next, _) = recording(44100, ChannelMask::MONO);
        let sink = SampleRateConvertSink::new(next, 48000);
        assert_eq!(sink.source_period(), 160);
        assert_eq!(sink.target_period(), 147);
        assert_eq!(sink.mappings().len(), 147);
    }

    #[test]
    fn test_table_endpoints() {
        let table = lerp_table(3, 2);
        assert_eq!(table[0].first, 0);
        assert_eq!(table[0].first_weight, 1.0);
        assert_eq!(table[1].first, 2);
        assert_eq!(table[1].second, 2);

        let table = lerp_table(2, 3);
        assert_eq!(table[1].first, 0);
        assert_eq!(table[1].second, 1);
        assert!((table[1].second_weight - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_equal_rates_behave_as_identity() {
        let (next, log) = recording(48000, ChannelMask::STEREO);
        let mut sink = SampleRateConvertSink::new(next, 48000);
        let input: Vec<f32> = (0..20).map(|i| i as f32).collect();
        assert!(sink.process(&input, 10).unwrap());
        assert_eq!(log.borrow().samples, input);
        assert_eq!(sink.carried_frames(), 0);
    }

    #[test]
    fn test_upsample_interpolates() {
        // 1:2 ratio, period of 1 source frame -> 2 target frames
        let (next, log) = recording(2000, ChannelMask::MONO);
        let mut sink = SampleRateConvertSink::new(next, 1000);
        sink.process(&[1.0, 3.0], 2).unwrap();
        // Single-frame periods map both outputs to the same input frame
        assert_eq!(log.borrow().samples, vec![1.0, 1.0, 3.0, 3.0]);
    }

    #[test]
    fn test_partial_period_is_carried() {
        let (next, log) = recording(44100, ChannelMask::MONO);
        let mut sink = SampleRateConvertSink::new(next, 48000);

        let input = vec![0.25f32; 100];
        assert!(!sink.process(&input, 100).unwrap());
        assert_eq!(sink.carried_frames(), 100);
        assert_eq!(log.borrow().calls, 0);

        assert!(sink.process(&input, 100).unwrap());
        assert_eq!(sink.carried_frames(), 40);
        assert_eq!(log.borrow().frames, 147);
        assert!(log.borrow().samples.iter().all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_flush_rounds_up_and_forwards() {
        let (next, log) = recording(44100, ChannelMask::MONO);
        let mut sink = SampleRateConvertSink::new(next, 48000);
        sink.process(&vec![0.5f32; 10], 10).unwrap();
        sink.flush().unwrap();

        let log = log.borrow();
        // ceil(10 * 147 / 160) = 10
        assert_eq!(log.frames, 10);
        assert_eq!(log.flushes, 1);
        assert_eq!(sink.carried_frames(), 0);
    }

    #[test]
    fn test_flush_without_carry_only_forwards_flush() {
        let (next, log) = recording(44100, ChannelMask::MONO);
        let mut sink = SampleRateConvertSink::new(next, 48000);
        sink.flush().unwrap();
        assert_eq!(log.borrow().calls, 0);
        assert_eq!(log.borrow().flushes, 1);
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let (next, log) = recording(48000, ChannelMask::STEREO);
        let mut sink = ChannelConvertSink::new(next, ChannelMask::MONO);
        assert_eq!(sink.channels(), 1);
        sink.process(&[0.1, -0.2], 2).unwrap();
        assert_eq!(log.borrow().samples, vec![0.1, 0.1, -0.2, -0.2]);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let (next, log) = recording(48000, ChannelMask::MONO);
        let mut sink = ChannelConvertSink::new(next, ChannelMask::STEREO);
        sink.process(&[0.2, 0.4, -1.0, 1.0], 2).unwrap();
        let samples = log.borrow().samples.clone();
        assert!((samples[0] - 0.3).abs() < 1e-6);
        assert_eq!(samples[1], 0.0);
    }

    #[test]
    fn test_unmappable_channel_is_silent() {
        // Stereo source has nothing to feed the LFE channel of 5.1
        let mapping = channel_mapping(ChannelMask::STEREO, ChannelMask::SURROUND_5_1);
        assert_eq!(mapping[0], ChannelSource::Copy(0));
        assert_eq!(mapping[1], ChannelSource::Copy(1));
        assert_eq!(mapping[2], ChannelSource::Mix(0, 1));
        assert_eq!(mapping[3], ChannelSource::Silent);
        assert_eq!(mapping[4], ChannelSource::Silent);
    }

    #[test]
    fn test_counterpart_fallback() {
        // Only front-left available: front-right copies it
        let mapping = channel_mapping(ChannelMask(0x1), ChannelMask::STEREO);
        assert_eq!(mapping, vec![ChannelSource::Copy(0), ChannelSource::Copy(0)]);
    }

    #[test]
    fn test_surround_downmix_keeps_fronts() {
        let mapping = channel_mapping(ChannelMask::SURROUND_7_1, ChannelMask::STEREO);
        assert_eq!(mapping, vec![ChannelSource::Copy(0), ChannelSource::Copy(1)]);
    }

    proptest! {
        #[test]
        fn prop_table_length(source in 1usize..2000, target in 1usize..2000) {
            let divisor = gcd(source, target);
            let table = lerp_table(source / divisor, target / divisor);
            prop_assert_eq!(table.len(), target / divisor);
            for entry in &table {
                prop_assert!(entry.second < source / divisor || source / divisor == 0);
                prop_assert!((entry.first_weight + entry.second_weight - 1.0).abs() < 1e-5);
            }
        }

        #[test]
        fn prop_output_duration_matches_input(
            source_rate in prop::sample::select(vec![8000u32, 22050, 44100, 48000, 96000]),
            target_rate in prop::sample::select(vec![8000u32, 16000, 44100, 48000, 192000]),
            chunks in prop::collection::vec(0usize..700, 1..12),
        ) {
            prop_assume!(source_rate != target_rate);
            let (next, log) = recording(target_rate, ChannelMask::MONO);
            let mut sink = SampleRateConvertSink::new(next, source_rate);
            let mut total = 0usize;
            for frames in &chunks {
                sink.process(&vec![0.0; *frames], *frames).unwrap();
                total += frames;
            }
            sink.flush().unwrap();

            let produced = log.borrow().frames as u64;
            let expected = total as u64 * target_rate as u64;
            // out * source - in * target lies in [0, source)
            prop_assert!(produced * source_rate as u64 >= expected);
            prop_assert!(produced * source_rate as u64 - expected < source_rate as u64);
        }

        #[test]
        fn prop_chunking_does_not_change_output(split in 0usize..500) {
            let input: Vec<f32> = (0..500).map(|i| (i as f32 * 0.01).sin()).collect();

            let (next, whole) = recording(44100, ChannelMask::MONO);
            let mut sink = SampleRateConvertSink::new(next, 48000);
            sink.process(&input, input.len()).unwrap();

            let (next, parts) = recording(44100, ChannelMask::MONO);
            let mut split_sink = SampleRateConvertSink::new(next, 48000);
            split_sink.process(&input[..split], split).unwrap();
            split_sink.process(&input[split..], input.len() - split).unwrap();

            prop_assert_eq!(&whole.borrow().samples, &parts.borrow().samples);
        }
    }
}
