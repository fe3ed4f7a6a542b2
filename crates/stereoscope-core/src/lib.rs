//! Core types for stereo-endoscope measurement.
//!
//! Pixel containers, camera models, explicit coordinate frames, planar
//! transforms and the closed-form 3-D geometry used by the measurement
//! calculator. No I/O and no image processing beyond cropping lives here.

mod camera;
mod distortion;
mod frame;
mod geometry;
mod image;
mod logger;
mod transform;

pub use camera::{all_finite3, flip_y, project_point, Intrinsics, PROJECTION_EPS};
pub use distortion::BrownConrady5;
pub use frame::{CoordinateFrame, FrameRecord};
pub use geometry::{
    centroid, closest_points_between_lines, fan_area, line_intersection_2d, plane_normal,
    polyline_length, project_onto_plane, project_onto_segment, signed_plane_distance,
    LineClosestPoints, SegmentProjection, GEOMETRY_EPS, PARALLEL_EPS,
};
pub use image::{crop_rgb, is_valid_depth, DepthMap, ImageError, ImageSize, NearestDepth, PixelRect};
pub use transform::{Homography, Rotation, ViewTransform, MAX_ZOOM};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
