use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::GrayImage;
use stereoscope_core::{DepthMap, Intrinsics};
use stereoscope_depth::{
    BlockMatcher, BlockMatcherParams, CloudOptions, PointCloud, SgmMatcher, SgmParams,
    StereoMatcher,
};

fn textured(w: u32, h: u32) -> GrayImage {
    GrayImage::from_fn(w, h, |x, y| {
        let v = (x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503)) >> 7;
        image::Luma([(v & 0xff) as u8])
    })
}

fn bench_block_matcher(c: &mut Criterion) {
    let left = textured(320, 240);
    let right = GrayImage::from_fn(320, 240, |x, y| *left.get_pixel((x + 12).min(319), y));
    let matcher = BlockMatcher::new(BlockMatcherParams {
        num_disparities: 64,
        ..BlockMatcherParams::default()
    })
    .expect("valid params");
    c.bench_function("block_matcher_320x240_64d", |b| {
        b.iter(|| matcher.compute(black_box(&left), black_box(&right)))
    });
}

fn bench_sgm_matcher(c: &mut Criterion) {
    let left = textured(320, 240);
    let right = GrayImage::from_fn(320, 240, |x, y| *left.get_pixel((x + 12).min(319), y));
    let matcher = SgmMatcher::new(SgmParams {
        num_disparities: 64,
        ..SgmParams::default()
    })
    .expect("valid params");
    c.bench_function("sgm_matcher_320x240_64d", |b| {
        b.iter(|| matcher.compute(black_box(&left), black_box(&right)))
    });
}

fn bench_cloud(c: &mut Criterion) {
    let depth = DepthMap::from_fn(640, 480, |x, y| 400.0 + 0.1 * x as f32 + 0.05 * y as f32);
    let k = Intrinsics::new(500.0, 500.0, 320.0, 240.0);
    c.bench_function("point_cloud_640x480", |b| {
        b.iter(|| PointCloud::build(black_box(&depth), None, &k, &CloudOptions::default()))
    });
}

criterion_group!(benches, bench_block_matcher, bench_sgm_matcher, bench_cloud);
criterion_main!(benches);
