//! Crossfade Mixing Performance Benchmark
//!
//! Measures the per-frame crossfade arithmetic (fade-out gain, fade-in
//! gain, mix, clamp) that runs for every frame of an active transition.
//!
//! **Goal:** Crossfade mixing must never be the bottleneck of the fill
//! loop.
//! **Target:** >100x realtime for a full 10-second fade window

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use attacca_common::{EqPreset, FadeCurve};
use attacca_player::audio::{AudioFrame, Equalizer};

/// 10 seconds @ 44.1kHz
const FADE_FRAMES: usize = 441_000;

fn bench_crossfade_curves(c: &mut Criterion) {
    let mut group = c.benchmark_group("crossfade_mix");

    for curve in FadeCurve::all_variants() {
        group.bench_function(BenchmarkId::new("full_window", curve), |b| {
            b.iter(|| {
                for i in 0..FADE_FRAMES {
                    let t = i as f32 / FADE_FRAMES as f32;
                    let mut out_frame = AudioFrame::new(0.8, -0.6);
                    let mut in_frame = AudioFrame::new(-0.4, 0.7);
                    out_frame.apply_volume(curve.fade_out(t));
                    in_frame.apply_volume(curve.fade_in(t));
                    out_frame.mix(&in_frame);
                    out_frame.clamp();
                    black_box(out_frame);
                }
            });
        });
    }

    group.finish();
}

fn bench_crossfade_with_eq(c: &mut Criterion) {
    let mut group = c.benchmark_group("crossfade_mix_eq");

    for preset in [EqPreset::Flat, EqPreset::BassBoost] {
        let mut equalizer = Equalizer::new(preset).unwrap();
        group.bench_function(BenchmarkId::new("full_window", preset.as_str()), |b| {
            b.iter(|| {
                for i in 0..FADE_FRAMES {
                    let t = i as f32 / FADE_FRAMES as f32;
                    let mut out_frame = AudioFrame::new(0.8, -0.6);
                    let mut in_frame = AudioFrame::new(-0.4, 0.7);
                    out_frame.apply_volume(FadeCurve::Linear.fade_out(t));
                    in_frame.apply_volume(FadeCurve::Linear.fade_in(t));
                    out_frame.mix(&in_frame);
                    out_frame.clamp();
                    equalizer.process(&mut out_frame);
                    black_box(out_frame);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_crossfade_curves, bench_crossfade_with_eq);
criterion_main!(benches);
