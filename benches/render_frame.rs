//! Frame render benchmarks for the software rasterizer.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use halftone::prefilter::SampleMode;
use halftone::software::render_frame;
use halftone::{HalftoneParameters, RenderTarget, Texture};

fn gradient(width: u32, height: u32) -> Texture {
    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            rgba.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8, 255]);
        }
    }
    Texture::from_rgba8(width, height, rgba).expect("gradient texture")
}

fn bench_software_render(c: &mut Criterion) {
    let texture = gradient(600, 400);
    let target = RenderTarget::new(600, 400);

    let mut group = c.benchmark_group("render_frame");
    group.sample_size(20);

    let defaults = HalftoneParameters::default();
    group.bench_function("software_600x400_defaults", |b| {
        b.iter(|| black_box(render_frame(&texture, &defaults, target)))
    });

    let blurred = HalftoneParameters {
        blur: 12.0,
        ..HalftoneParameters::default()
    };
    group.bench_function("software_600x400_blur12", |b| {
        b.iter(|| black_box(render_frame(&texture, &blurred, target)))
    });

    let cell_center = HalftoneParameters {
        sample_mode: SampleMode::CellCenter,
        ..HalftoneParameters::default()
    };
    group.bench_function("software_600x400_cell_center", |b| {
        b.iter(|| black_box(render_frame(&texture, &cell_center, target)))
    });

    group.finish();
}

criterion_group!(benches, bench_software_render);
criterion_main!(benches);
