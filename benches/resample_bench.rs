//! Conversion stage throughput
//!
//! Feeds 10 ms batches of a stereo sine through the rate and channel
//! conversion stages into a null sink.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pcm_relay::audio::{ChannelMask, StreamFormat};
use pcm_relay::sink::{ChannelConvertSink, NullSink, SampleRateConvertSink, Sink};

const SOURCE_RATE: u32 = 48000;
const BATCH_FRAMES: usize = 480;

fn stereo_batch() -> Vec<f32> {
    (0..BATCH_FRAMES)
        .flat_map(|i| {
            let s = (i as f32 * 440.0 * std::f32::consts::TAU / SOURCE_RATE as f32).sin();
            [s, s * 0.5]
        })
        .collect()
}

fn bench_sample_rate_convert(c: &mut Criterion) {
    let mut group = c.benchmark_group("samplerate_convert");
    group.throughput(Throughput::Elements(BATCH_FRAMES as u64));
    let batch = stereo_batch();

    for target_rate in [44100u32, 96000, 16000] {
        let next = Box::new(NullSink::new(StreamFormat::new(target_rate, ChannelMask::STEREO)));
        let mut sink = SampleRateConvertSink::new(next, SOURCE_RATE);

        group.bench_with_input(
            BenchmarkId::new("48000_to", target_rate),
            &batch,
            |b, batch| {
                b.iter(|| sink.process(black_box(batch), BATCH_FRAMES));
            },
        );
    }

    group.finish();
}

fn bench_channel_convert(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_convert");
    group.throughput(Throughput::Elements(BATCH_FRAMES as u64));
    let batch = stereo_batch();

    for (label, mask) in [
        ("mono", ChannelMask::MONO),
        ("5.1", ChannelMask::SURROUND_5_1),
        ("7.1", ChannelMask::SURROUND_7_1),
    ] {
        let next = Box::new(NullSink::new(StreamFormat::new(SOURCE_RATE, mask)));
        let mut sink = ChannelConvertSink::new(next, ChannelMask::STEREO);

        group.bench_with_input(BenchmarkId::new("stereo_to", label), &batch, |b, batch| {
            b.iter(|| sink.process(black_box(batch), BATCH_FRAMES));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sample_rate_convert, bench_channel_convert);
criterion_main!(benches);
