//! JSON configuration helpers and frame persistence.

use crate::CorrectionOptions;
use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Read any serde value from a JSON file.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, IoError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Write any serde value to disk as pretty JSON.
pub fn write_json<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<(), IoError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

impl CorrectionOptions {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, IoError> {
        load_json(path)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), IoError> {
        write_json(self, path)
    }
}

/// `YYYYMMDD_HHMMSS_<camera>.jpg`.
pub fn frame_file_name(timestamp: &DateTime<Local>, camera: &str) -> String {
    format!("{}_{camera}.jpg", timestamp.format("%Y%m%d_%H%M%S"))
}

/// Write a stereo pair as `<stamp>_left.jpg` / `<stamp>_right.jpg` in `dir`.
pub fn save_frame_pair(
    dir: impl AsRef<Path>,
    timestamp: &DateTime<Local>,
    left: &RgbImage,
    right: &RgbImage,
) -> Result<[PathBuf; 2], IoError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let left_path = dir.join(frame_file_name(timestamp, "left"));
    let right_path = dir.join(frame_file_name(timestamp, "right"));
    left.save(&left_path)?;
    right.save(&right_path)?;
    log::info!("saved frame pair {}", left_path.display());
    Ok([left_path, right_path])
}

/// Write a screenshot as PNG, creating parent directories.
pub fn save_png(path: impl AsRef<Path>, img: &RgbImage) -> Result<(), IoError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    img.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}
