use criterion::{black_box, criterion_group, criterion_main, Criterion};

use process_audio_relay::audio::{sample_ring, MonoDownmix, PcmConverter, RenderConsumer};
use process_audio_relay::protocol::CaptureFormat;

const BLOCK_FRAMES: usize = 512;

fn ring_push_pull(c: &mut Criterion) {
    let (mut producer, mut consumer) = sample_ring(48_000 * 2);
    let input = vec![0.25f32; BLOCK_FRAMES * 2];
    let mut output = vec![0.0f32; BLOCK_FRAMES * 2];

    c.bench_function("ring_push_pull_512_stereo", |b| {
        b.iter(|| {
            producer.push(black_box(&input));
            black_box(consumer.pull(&mut output));
        })
    });
}

fn pcm_convert(c: &mut Criterion) {
    let bytes: Vec<u8> = (0..BLOCK_FRAMES * 4).map(|i| i as u8).collect();
    let mut converter = PcmConverter::new();

    c.bench_function("pcm_convert_512_stereo", |b| {
        b.iter(|| black_box(converter.convert(black_box(&bytes)).len()))
    });
}

fn render_interleaved(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_interleaved");

    for (name, source_channels, out_channels) in [
        ("stereo_to_stereo", 2u16, 2usize),
        ("mono_to_stereo", 1, 2),
        ("stereo_to_mono_average", 2, 1),
        ("stereo_to_5_1", 2, 6),
    ] {
        let format = CaptureFormat::new(48_000, source_channels).unwrap();
        let (mut producer, consumer) = sample_ring(format.ring_capacity(1.0));
        let mut render =
            RenderConsumer::new(consumer, format, MonoDownmix::Average, BLOCK_FRAMES);
        let input = vec![0.5f32; BLOCK_FRAMES * source_channels as usize];
        let mut output = vec![0.0f32; BLOCK_FRAMES * out_channels];

        group.bench_function(name, |b| {
            b.iter(|| {
                producer.push(&input);
                black_box(render.render_interleaved(&mut output, out_channels));
            })
        });
    }

    group.finish();
}

fn render_resampled(c: &mut Criterion) {
    let format = CaptureFormat::new(44_100, 2).unwrap();
    let (mut producer, consumer) = sample_ring(format.ring_capacity(1.0));
    let mut render = RenderConsumer::new(consumer, format, MonoDownmix::Average, BLOCK_FRAMES);
    render.set_output_rate(48_000);
    let input = vec![0.5f32; BLOCK_FRAMES * 2];
    let mut output = vec![0.0f32; BLOCK_FRAMES * 2];

    c.bench_function("render_44100_to_48000_stereo", |b| {
        b.iter(|| {
            producer.push(&input);
            black_box(render.render_interleaved(&mut output, 2));
        })
    });
}

criterion_group!(
    benches,
    ring_push_pull,
    pcm_convert,
    render_interleaved,
    render_resampled
);
criterion_main!(benches);
