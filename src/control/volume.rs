//! Volume stage with a peak limiter
//!
//! The limiter keeps two volumes in the control block. The effective volume
//! drops immediately when a batch would exceed the saturation threshold. The
//! debounce volume is a floor under it that is pushed down on saturation and
//! climbs back by the recovery factor on every batch, which gives fast
//! attack and slow release.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{ControlBlock, SharedControl};
use crate::audio::format::StreamFormat;
use crate::error::Result;
use crate::sink::{Chain, Sink};

/// Limiter settings read from the control block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterParams {
    /// Peak level not to exceed, 0 disables limiting
    pub threshold: f32,
    pub debounce_factor: f32,
    pub recovery_factor: f32,
}

/// Limiter volumes carried between batches
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterState {
    pub effective: f32,
    pub debounce: f32,
}

impl LimiterParams {
    fn read(block: &ControlBlock) -> Self {
        Self {
            threshold: block.saturation_threshold.load(),
            debounce_factor: block.saturation_debounce_factor.load(),
            recovery_factor: block.saturation_recovery_factor.load(),
        }
    }

    /// Advance the limiter by one batch with scaled peak `peak`
    pub fn apply(&self, peak: f32, state: LimiterState) -> LimiterState {
        let LimiterState {
            mut effective,
            mut debounce,
        } = state;

        if self.threshold != 0.0 {
            if peak * effective > self.threshold {
                effective = self.threshold / peak;
                tracing::trace!("Limiter clamped to {:.3} at peak {:.3}", effective, peak);
            }
            if peak * debounce / self.debounce_factor > self.threshold {
                debounce = self.threshold / peak * self.debounce_factor;
            }
        }

        debounce = (debounce * self.recovery_factor).min(1.0);
        effective = effective.max(debounce);

        LimiterState {
            effective,
            debounce,
        }
    }
}

impl LimiterState {
    fn read(block: &ControlBlock) -> Self {
        Self {
            effective: block.saturation_effective_volume.load(),
            debounce: block.saturation_debounce_volume.load(),
        }
    }

    fn publish(&self, block: &ControlBlock) {
        block.saturation_debounce_volume.store(self.debounce);
        block.saturation_effective_volume.store(self.effective);
    }
}

/// Applies master and per-position volumes from the control block, limits
/// peaks and drops silent batches.
pub struct VolumeSink {
    chain: Chain,
    control: Arc<SharedControl>,
    /// Control slot (speaker position index) of each channel
    slots: Vec<usize>,
    peaks: Vec<f32>,
    volumes: Vec<f32>,
    gains: Vec<f32>,
    scaled: Vec<f32>,
}

impl VolumeSink {
    /// Publishes the chain format into the control block.
    pub fn new(next: Box<dyn Sink>, control: Arc<SharedControl>) -> Self {
        let chain = Chain::new(next);
        let format = chain.format();

        let block = control.block();
        block
            .samplerate
            .store(format.sample_rate as i32, Ordering::Relaxed);
        block
            .channel_mask
            .store(format.channel_mask.bits(), Ordering::Relaxed);

        let slots: Vec<usize> = format.channel_mask.positions().map(|p| p.index()).collect();
        let channels = slots.len();

        Self {
            chain,
            control,
            slots,
            peaks: vec![0.0; channels],
            volumes: vec![0.0; channels],
            gains: vec![0.0; channels],
            scaled: Vec::new(),
        }
    }

    /// Peak of `samples` after channel volumes, refreshing `self.volumes`
    fn scaled_peak(&mut self, samples: &[f32]) -> f32 {
        self.peaks.fill(0.0);
        for frame in samples.chunks_exact(self.slots.len()) {
            for (peak, sample) in self.peaks.iter_mut().zip(frame) {
                *peak = peak.max(sample.abs());
            }
        }

        let block = self.control.block();
        for (volume, &slot) in self.volumes.iter_mut().zip(&self.slots) {
            *volume = block.channel_volumes[slot].load();
        }

        self.peaks
            .iter()
            .zip(&self.volumes)
            .map(|(peak, volume)| peak * volume)
            .fold(0.0, f32::max)
    }
}

impl Sink for VolumeSink {
    fn name(&self) -> &'static str {
        "volume"
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
        let samples = &samples[..frames * self.slots.len()];
        let peak = self.scaled_peak(samples);

        let control = Arc::clone(&self.control);
        let block = control.block();
        let silence = block.silence_threshold.load();
        let limiter = LimiterParams::read(block).apply(peak, LimiterState::read(block));

        block
            .last_frame_tick_count
            .store(chrono::Utc::now().timestamp_millis().max(0) as u64);
        block.last_frame_max_amplitude.store(peak);
        limiter.publish(block);

        if peak < silence || !block.is_playing() {
            return Ok(false);
        }

        let master = block.master_volume.load() * limiter.effective;
        if peak * master < silence {
            return Ok(false);
        }

        for (gain, volume) in self.gains.iter_mut().zip(&self.volumes) {
            *gain = master * volume;
        }
        if self.gains.iter().all(|&gain| gain == 1.0) {
            return self.chain.process(samples, frames);
        }

        self.scaled.clear();
        self.scaled.reserve(samples.len());
        for frame in samples.chunks_exact(self.gains.len()) {
            self.scaled
                .extend(frame.iter().zip(&self.gains).map(|(s, gain)| s * gain));
        }

        self.chain.process(&self.scaled, frames)
    }

    fn flush(&mut self) -> Result<()> {
        self.chain.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{ChannelMask, ChannelPosition};
    use crate::control::testing::control_block;
    use crate::control::FLAG_ENABLED;
    use crate::sink::testing::RecordingSink;
    use proptest::prelude::*;

    fn stereo() -> StreamFormat {
        StreamFormat::new(48000, ChannelMask::STEREO)
    }

    #[test]
    fn test_registers_format() {
        let (_dir, control) = control_block(0);
        let format = StreamFormat::new(44100, ChannelMask::SURROUND_5_1);
        let (recording, _log) = RecordingSink::new(format);
        let _sink = VolumeSink::new(Box::new(recording), control.clone());

        let block = control.block();
        assert_eq!(block.samplerate.load(Ordering::Relaxed), 44100);
        assert_eq!(block.channel_mask.load(Ordering::Relaxed), 0x3f);
    }

    #[test]
    fn test_unity_gain_forwards_untouched() {
        let (_dir, control) = control_block(0);
        let (recording, log) = RecordingSink::new(stereo());
        let mut sink = VolumeSink::new(Box::new(recording), control.clone());

        assert!(sink.process(&[0.25, -0.5], 1).unwrap());
        assert_eq!(log.borrow().samples, vec![0.25, -0.5]);
        assert_eq!(control.block().last_frame_max_amplitude.load(), 0.5);
        assert!(control.block().last_frame_tick_count.load() > 0);
    }

    #[test]
    fn test_applies_position_volumes() {
        let (_dir, control) = control_block(0);
        let block = control.block();
        block.master_volume.store(0.5);
        block.channel_volumes[ChannelPosition::FrontRight.index()].store(0.5);

        let (recording, log) = RecordingSink::new(stereo());
        let mut sink = VolumeSink::new(Box::new(recording), control.clone());

        sink.process(&[1.0, 1.0, 0.5, 0.5], 2).unwrap();
        assert_eq!(log.borrow().samples, vec![0.5, 0.25, 0.25, 0.125]);
    }

    #[test]
    fn test_drops_silence() {
        let (_dir, control) = control_block(0);
        control.block().silence_threshold.store(0.01);
        let (recording, log) = RecordingSink::new(stereo());
        let mut sink = VolumeSink::new(Box::new(recording), control.clone());

        assert!(!sink.process(&[0.001, -0.002], 1).unwrap());

        control.block().master_volume.store(0.001);
        assert!(!sink.process(&[0.5, 0.5], 1).unwrap());

        assert_eq!(log.borrow().calls, 0);
    }

    #[test]
    fn test_drops_when_disabled() {
        let (_dir, control) = control_block(0);
        control.block().set_flags(FLAG_ENABLED, false);
        let (recording, log) = RecordingSink::new(stereo());
        let mut sink = VolumeSink::new(Box::new(recording), control.clone());

        assert!(!sink.process(&[0.5, 0.5], 1).unwrap());
        assert_eq!(log.borrow().calls, 0);
        // Telemetry is still published
        assert_eq!(control.block().last_frame_max_amplitude.load(), 0.5);
    }

    #[test]
    fn test_limits_loud_batch() {
        let (_dir, control) = control_block(0);
        control.block().saturation_threshold.store(0.5);
        let (recording, log) = RecordingSink::new(stereo());
        let mut sink = VolumeSink::new(Box::new(recording), control.clone());

        sink.process(&[1.0, -1.0], 1).unwrap();
        assert_eq!(log.borrow().samples, vec![0.5, -0.5]);
        assert_eq!(control.block().saturation_effective_volume.load(), 0.5);
        assert_eq!(control.block().saturation_debounce_volume.load(), 0.5);
    }

    #[test]
    fn test_limiter_disabled_without_threshold() {
        let params = LimiterParams {
            threshold: 0.0,
            debounce_factor: 1.0,
            recovery_factor: 1.0,
        };
        let state = LimiterState {
            effective: 1.0,
            debounce: 1.0,
        };
        assert_eq!(params.apply(10.0, state), state);
    }

    #[test]
    fn test_debounce_factor_lowers_floor_further() {
        let params = LimiterParams {
            threshold: 0.5,
            debounce_factor: 0.5,
            recovery_factor: 1.0,
        };
        let state = LimiterState {
            effective: 1.0,
            debounce: 1.0,
        };
        let next = params.apply(1.0, state);
        assert_eq!(next.debounce, 0.25);
        assert_eq!(next.effective, 0.5);
    }

    proptest! {
        #[test]
        fn prop_limiter_attack_bounds_output(
            peak in 0.01f32..10.0,
            threshold in 0.01f32..1.0,
            effective in 0.0f32..=1.0,
        ) {
            prop_assume!(peak * effective > threshold);
            let params = LimiterParams {
                threshold,
                debounce_factor: 1.0,
                recovery_factor: 1.0,
            };
            let state = LimiterState { effective, debounce: 0.0 };
            let next = params.apply(peak, state);
            prop_assert!(peak * next.effective <= threshold * 1.0001);
        }

        #[test]
        fn prop_limiter_recovery(
            start in 0.01f32..1.0,
            recovery in 1.0f32..1.5,
            steps in 1usize..50,
        ) {
            let params = LimiterParams {
                threshold: 1.0,
                debounce_factor: 1.0,
                recovery_factor: recovery,
            };
            let mut state = LimiterState { effective: start, debounce: start };
            for _ in 0..steps {
                let next = params.apply(0.1, state);
                let expected = (state.debounce * recovery).min(1.0);
                prop_assert_eq!(next.debounce, expected);
                prop_assert!(next.debounce >= state.debounce);
                prop_assert!(next.debounce <= 1.0);
                state = next;
            }
        }
    }
}
