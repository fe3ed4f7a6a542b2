//! Stereo calibration model and loaders.
//!
//! Two on-disk layouts are understood by [`DirectoryCalibrationSource`]:
//!
//! - `calibration.json`: the serde form of [`StereoCalibration`], matrices
//!   written row by row;
//! - the plain-text triplet `camera0_intrinsics.dat`,
//!   `camera1_intrinsics.dat`, `camera1_rot_trans.dat` produced by the
//!   calibration tool:
//!
//! ```text
//! intrinsic:
//! fx 0 cx
//! 0 fy cy
//! 0 0 1
//! distortion:
//! k1 k2 p1 p2 k3
//! ```
//!
//! and for the extrinsics `R:` followed by three rows, then `T:` followed
//! by three single-number rows. Numbers may be separated by whitespace or
//! commas.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use stereoscope_core::{BrownConrady5, ImageSize, Intrinsics, PixelRect, PROJECTION_EPS};

/// File names of the plain-text calibration layout.
pub const LEFT_INTRINSICS_FILE: &str = "camera0_intrinsics.dat";
pub const RIGHT_INTRINSICS_FILE: &str = "camera1_intrinsics.dat";
pub const EXTRINSICS_FILE: &str = "camera1_rot_trans.dat";
/// File name of the JSON calibration layout.
pub const CALIBRATION_JSON_FILE: &str = "calibration.json";

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("missing calibration file {0}")]
    Missing(PathBuf),
    #[error("{path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid calibration: {0}")]
    Invalid(String),
}

/// Intrinsics and lens distortion of one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    #[serde(with = "rows3")]
    pub camera_matrix: Matrix3<f64>,
    pub distortion: BrownConrady5,
}

impl CameraCalibration {
    pub fn new(camera_matrix: Matrix3<f64>, distortion: BrownConrady5) -> Self {
        Self {
            camera_matrix,
            distortion,
        }
    }

    #[inline]
    pub fn intrinsics(&self) -> Intrinsics {
        Intrinsics::from_matrix(&self.camera_matrix)
    }
}

/// Products of stereo rectification for the configured image size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RectificationProducts {
    #[serde(with = "rows3")]
    pub r1: Matrix3<f64>,
    #[serde(with = "rows3")]
    pub r2: Matrix3<f64>,
    #[serde(with = "rows3x4")]
    pub p1: Matrix3x4<f64>,
    #[serde(with = "rows3x4")]
    pub p2: Matrix3x4<f64>,
    #[serde(with = "rows4")]
    pub q: Matrix4<f64>,
    pub roi1: PixelRect,
    pub roi2: PixelRect,
}

impl RectificationProducts {
    /// Rectified focal length times baseline, `f·B`, in the units of `T`.
    pub fn focal_baseline(&self) -> f64 {
        -self.p2[(0, 3)]
    }
}

/// Calibration of a stereo rig; immutable for a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoCalibration {
    pub left: CameraCalibration,
    pub right: CameraCalibration,
    /// Rotation from the left to the right camera frame.
    #[serde(with = "rows3")]
    pub rotation: Matrix3<f64>,
    /// Translation from the left to the right camera frame, millimetres.
    pub translation: Vector3<f64>,
    /// Image size the intrinsics were calibrated at.
    pub image_size: ImageSize,
    /// Precomputed rectification, if the calibration tool produced one.
    #[serde(default)]
    pub rectification: Option<RectificationProducts>,
}

impl StereoCalibration {
    /// Baseline length, same unit as the translation.
    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }

    /// Reject calibrations that cannot drive the geometry: non-finite
    /// elements, vanishing focal lengths, a zero baseline.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        for (name, cam) in [("left", &self.left), ("right", &self.right)] {
            if !cam.camera_matrix.iter().all(|v| v.is_finite()) {
                return Err(CalibrationError::Invalid(format!(
                    "{name} camera matrix has non-finite elements"
                )));
            }
            if !cam.distortion.is_finite() {
                return Err(CalibrationError::Invalid(format!(
                    "{name} distortion has non-finite coefficients"
                )));
            }
            if !cam.intrinsics().is_usable() {
                return Err(CalibrationError::Invalid(format!(
                    "{name} focal length is zero"
                )));
            }
        }
        if !self.rotation.iter().all(|v| v.is_finite())
            || !self.translation.iter().all(|v| v.is_finite())
        {
            return Err(CalibrationError::Invalid(
                "extrinsics have non-finite elements".into(),
            ));
        }
        if self.baseline() < PROJECTION_EPS {
            return Err(CalibrationError::Invalid("baseline is zero".into()));
        }
        if let Some(rect) = &self.rectification {
            let finite = rect.r1.iter().all(|v| v.is_finite())
                && rect.r2.iter().all(|v| v.is_finite())
                && rect.p1.iter().all(|v| v.is_finite())
                && rect.p2.iter().all(|v| v.is_finite())
                && rect.q.iter().all(|v| v.is_finite());
            if !finite {
                return Err(CalibrationError::Invalid(
                    "rectification products have non-finite elements".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Provider of stereo calibrations.
pub trait CalibrationSource {
    fn load(&self, path: &Path) -> Result<StereoCalibration, CalibrationError>;
}

/// Reads a calibration directory in either supported layout.
///
/// The plain-text layout does not record the image size, so it is taken
/// from `image_size`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirectoryCalibrationSource {
    pub image_size: ImageSize,
}

impl DirectoryCalibrationSource {
    pub fn new(image_size: ImageSize) -> Self {
        Self { image_size }
    }
}

impl CalibrationSource for DirectoryCalibrationSource {
    fn load(&self, path: &Path) -> Result<StereoCalibration, CalibrationError> {
        let json = if path.is_file() {
            path.to_path_buf()
        } else {
            path.join(CALIBRATION_JSON_FILE)
        };
        let calib = if json.is_file() {
            let raw = read(&json)?;
            serde_json::from_str::<StereoCalibration>(&raw)?
        } else {
            load_dat_dir(path, self.image_size)?
        };
        calib.validate()?;
        log::info!(
            "loaded stereo calibration from {} ({}x{}, baseline {:.3})",
            path.display(),
            calib.image_size.width,
            calib.image_size.height,
            calib.baseline()
        );
        Ok(calib)
    }
}

fn read(path: &Path) -> Result<String, CalibrationError> {
    fs::read_to_string(path).map_err(|source| CalibrationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the plain-text calibration triplet from `dir`.
pub fn load_dat_dir(dir: &Path, image_size: ImageSize) -> Result<StereoCalibration, CalibrationError> {
    let left = dir.join(LEFT_INTRINSICS_FILE);
    let right = dir.join(RIGHT_INTRINSICS_FILE);
    let rt = dir.join(EXTRINSICS_FILE);
    for p in [&left, &right, &rt] {
        if !p.is_file() {
            return Err(CalibrationError::Missing(p.clone()));
        }
    }
    let (rotation, translation) = parse_extrinsics(&read(&rt)?, &rt)?;
    Ok(StereoCalibration {
        left: parse_intrinsics(&read(&left)?, &left)?,
        right: parse_intrinsics(&read(&right)?, &right)?,
        rotation,
        translation,
        image_size,
        rectification: None,
    })
}

struct Lines<'a> {
    path: &'a Path,
    inner: std::iter::Filter<std::str::Lines<'a>, fn(&&str) -> bool>,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str, path: &'a Path) -> Self {
        fn non_blank(l: &&str) -> bool {
            !l.trim().is_empty()
        }
        Self {
            path,
            inner: text.lines().filter(non_blank as fn(&&str) -> bool),
        }
    }

    fn err(&self, message: String) -> CalibrationError {
        CalibrationError::Parse {
            path: self.path.to_path_buf(),
            message,
        }
    }

    fn header(&mut self, tag: &str) -> Result<(), CalibrationError> {
        match self.inner.next() {
            Some(l) if l.trim().to_lowercase().starts_with(tag) => Ok(()),
            Some(l) => Err(self.err(format!("expected '{tag}' header, got '{}'", l.trim()))),
            None => Err(self.err(format!("unexpected end of file before '{tag}'"))),
        }
    }

    fn numbers<const N: usize>(&mut self, what: &str) -> Result<[f64; N], CalibrationError> {
        let line = self
            .inner
            .next()
            .ok_or_else(|| self.err(format!("unexpected end of file reading {what}")))?;
        let parts: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .collect();
        if parts.len() != N {
            return Err(self.err(format!(
                "{what}: expected {N} numbers, got {} in '{}'",
                parts.len(),
                line.trim()
            )));
        }
        let mut out = [0.0; N];
        for (o, p) in out.iter_mut().zip(parts) {
            *o = p
                .parse()
                .map_err(|_| self.err(format!("{what}: invalid number '{p}'")))?;
        }
        Ok(out)
    }
}

/// Parse one `cameraN_intrinsics.dat` file.
pub fn parse_intrinsics(text: &str, path: &Path) -> Result<CameraCalibration, CalibrationError> {
    let mut lines = Lines::new(text, path);
    lines.header("intrinsic:")?;
    let mut k = Matrix3::zeros();
    for r in 0..3 {
        let row = lines.numbers::<3>("camera matrix row")?;
        for (c, v) in row.into_iter().enumerate() {
            k[(r, c)] = v;
        }
    }
    lines.header("distortion:")?;
    let d = lines.numbers::<5>("distortion")?;
    Ok(CameraCalibration::new(k, BrownConrady5::from_coeffs(d)))
}

/// Parse a `camera1_rot_trans.dat` file.
pub fn parse_extrinsics(
    text: &str,
    path: &Path,
) -> Result<(Matrix3<f64>, Vector3<f64>), CalibrationError> {
    let mut lines = Lines::new(text, path);
    lines.header("r:")?;
    let mut r = Matrix3::zeros();
    for i in 0..3 {
        let row = lines.numbers::<3>("rotation row")?;
        for (j, v) in row.into_iter().enumerate() {
            r[(i, j)] = v;
        }
    }
    lines.header("t:")?;
    let mut t = Vector3::zeros();
    for i in 0..3 {
        t[i] = lines.numbers::<1>("translation")?[0];
    }
    Ok((r, t))
}

macro_rules! row_major_serde {
    ($name:ident, $ty:ty, $rows:literal, $cols:literal) => {
        mod $name {
            use serde::{Deserialize, Deserializer, Serialize, Serializer};

            pub fn serialize<S: Serializer>(m: &$ty, s: S) -> Result<S::Ok, S::Error> {
                let mut rows = [[0.0f64; $cols]; $rows];
                for (r, row) in rows.iter_mut().enumerate() {
                    for (c, v) in row.iter_mut().enumerate() {
                        *v = m[(r, c)];
                    }
                }
                rows.serialize(s)
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<$ty, D::Error> {
                let rows = <[[f64; $cols]; $rows]>::deserialize(d)?;
                Ok(<$ty>::from_fn(|r, c| rows[r][c]))
            }
        }
    };
}

row_major_serde!(rows3, nalgebra::Matrix3<f64>, 3, 3);
row_major_serde!(rows3x4, nalgebra::Matrix3x4<f64>, 3, 4);
row_major_serde!(rows4, nalgebra::Matrix4<f64>, 4, 4);

#[cfg(test)]
mod tests {
    use super::*;

    const LEFT: &str = "intrinsic:\n1000 0 640\n0 1000 360\n0 0 1\ndistortion:\n-0.1, 0.01, 0, 0, 0\n";
    const RT: &str = "R:\n1 0 0\n0 1 0\n0 0 1\nT:\n-4.0\n0\n0\n";

    #[test]
    fn parses_intrinsics_with_mixed_separators() {
        let cam = parse_intrinsics(LEFT, Path::new("left.dat")).unwrap();
        assert_eq!(cam.camera_matrix[(0, 2)], 640.0);
        assert_eq!(cam.distortion.k1, -0.1);
        assert_eq!(cam.distortion.k2, 0.01);
    }

    #[test]
    fn rejects_wrong_number_count_naming_the_file() {
        let bad = "intrinsic:\n1000 0\n";
        let err = parse_intrinsics(bad, Path::new("cam.dat")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cam.dat"), "{msg}");
        assert!(msg.contains("expected 3 numbers"), "{msg}");
    }

    #[test]
    fn parses_extrinsics() {
        let (r, t) = parse_extrinsics(RT, Path::new("rt.dat")).unwrap();
        assert_eq!(r, Matrix3::identity());
        assert_eq!(t, Vector3::new(-4.0, 0.0, 0.0));
    }

    #[test]
    fn validate_flags_non_finite_and_zero_focal() {
        let cam = parse_intrinsics(LEFT, Path::new("l")).unwrap();
        let mut calib = StereoCalibration {
            left: cam.clone(),
            right: cam,
            rotation: Matrix3::identity(),
            translation: Vector3::new(-4.0, 0.0, 0.0),
            image_size: ImageSize::new(1280, 720),
            rectification: None,
        };
        assert!(calib.validate().is_ok());

        calib.right.camera_matrix[(1, 1)] = f64::NAN;
        assert!(matches!(calib.validate(), Err(CalibrationError::Invalid(_))));

        calib.right.camera_matrix[(1, 1)] = 0.0;
        assert!(calib.validate().is_err());
    }
}
