use std::fs;
use std::path::Path;

use approx::assert_relative_eq;
use image::{Rgb, RgbImage};
use stereoscope_core::ImageSize;
use stereoscope_correction::{
    write_json, CalibrationError, CalibrationSource, CorrectionMask, CorrectionOptions,
    CorrectionPipeline, DirectoryCalibrationSource, CALIBRATION_JSON_FILE, EXTRINSICS_FILE,
    LEFT_INTRINSICS_FILE, RIGHT_INTRINSICS_FILE,
};

const SIZE: ImageSize = ImageSize::new(320, 240);

fn write_dat_triplet(dir: &Path) {
    let intr = "intrinsic:\n400.0 0.0 161.0\n0.0 400.0 118.5\n0.0 0.0 1.0\n\
                distortion:\n-0.05 0.002 0.0 0.0 0.0\n";
    fs::write(dir.join(LEFT_INTRINSICS_FILE), intr).unwrap();
    fs::write(dir.join(RIGHT_INTRINSICS_FILE), intr).unwrap();
    fs::write(
        dir.join(EXTRINSICS_FILE),
        "R:\n0.99995 0.0 0.01\n0.0 1.0 0.0\n-0.01 0.0 0.99995\nT:\n-4.2\n0.03\n0.01\n",
    )
    .unwrap();
}

#[test]
fn dat_directory_drives_the_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    write_dat_triplet(dir.path());

    let calib = DirectoryCalibrationSource::new(SIZE)
        .load(dir.path())
        .expect("load calibration");
    assert_eq!(calib.image_size, SIZE);
    assert_relative_eq!(calib.baseline(), 4.2, max_relative = 1e-3);

    let mut pipeline = CorrectionPipeline::with_calibration(calib).unwrap();
    pipeline
        .configure(SIZE, CorrectionOptions::default())
        .unwrap();
    assert!(pipeline.remap_initialized());

    let left = RgbImage::from_fn(SIZE.width, SIZE.height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let frames = pipeline
        .correct(&left, &left, CorrectionMask::ALL)
        .unwrap();
    let record = frames.record;
    assert!(record.rectified_size.width <= SIZE.width);
    assert_eq!(
        frames.rectified_left.dimensions(),
        (record.rectified_size.width, record.rectified_size.height)
    );

    let rect = pipeline.rectification().unwrap();
    let (ox, oy) = record
        .rectify_roi
        .map(|r| (r.x as f64, r.y as f64))
        .unwrap_or((0.0, 0.0));
    let k = pipeline.effective_left_intrinsic().unwrap();
    assert_relative_eq!(k.cx, rect.p1[(0, 2)] - ox, epsilon = 1e-9);
    assert_relative_eq!(k.cy, rect.p1[(1, 2)] - oy, epsilon = 1e-9);
}

#[test]
fn json_layout_takes_precedence_and_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    write_dat_triplet(dir.path());
    let calib = DirectoryCalibrationSource::new(SIZE)
        .load(dir.path())
        .unwrap();

    let mut json_calib = calib.clone();
    json_calib.translation.x = -5.0;
    write_json(&json_calib, dir.path().join(CALIBRATION_JSON_FILE)).unwrap();

    let loaded = DirectoryCalibrationSource::new(SIZE)
        .load(dir.path())
        .unwrap();
    assert_eq!(loaded, json_calib);
}

#[test]
fn missing_files_are_named() {
    let dir = tempfile::tempdir().unwrap();
    let err = DirectoryCalibrationSource::new(SIZE)
        .load(dir.path())
        .unwrap_err();
    match err {
        CalibrationError::Missing(p) => assert!(p.ends_with(LEFT_INTRINSICS_FILE)),
        other => panic!("unexpected error {other}"),
    }
}
