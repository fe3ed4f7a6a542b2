//! Depth validation applied to stereo depth before fusion.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stereoscope_core::{is_valid_depth, DepthMap};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthValidationParams {
    pub min_depth_mm: f32,
    pub max_depth_mm: f32,
    /// Half-size of the neighbourhood used for the consistency vote.
    pub consistency_radius: u32,
    /// Neighbours closer than this in depth count as agreeing.
    pub consistency_threshold_mm: f32,
    /// Minimum fraction of agreeing valid neighbours.
    pub min_consistent_ratio: f32,
}

impl Default for DepthValidationParams {
    fn default() -> Self {
        Self {
            min_depth_mm: 10.0,
            max_depth_mm: 10_000.0,
            consistency_radius: 3,
            consistency_threshold_mm: 50.0,
            min_consistent_ratio: 0.3,
        }
    }
}

/// Invalidate out-of-range pixels and pixels whose valid neighbours mostly
/// disagree with them. Pixels without valid neighbours are kept.
pub fn validate_depth(depth: &DepthMap, params: &DepthValidationParams) -> DepthMap {
    let mut ranged = depth.clone();
    for v in ranged.data_mut() {
        if !is_valid_depth(*v) || *v < params.min_depth_mm || *v > params.max_depth_mm {
            *v = f32::NAN;
        }
    }
    if params.consistency_radius == 0 {
        return ranged;
    }

    let w = ranged.width() as usize;
    let r = params.consistency_radius as i64;
    let mut out = ranged.clone();
    if w == 0 {
        return out;
    }
    out.data_mut()
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, v) in row.iter_mut().enumerate() {
                let z = *v;
                if !z.is_finite() {
                    continue;
                }
                let (mut neighbours, mut agreeing) = (0u32, 0u32);
                for dy in -r..=r {
                    for dx in -r..=r {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        if let Some(n) = ranged.get(x as i64 + dx, y as i64 + dy) {
                            neighbours += 1;
                            if (n - z).abs() <= params.consistency_threshold_mm {
                                agreeing += 1;
                            }
                        }
                    }
                }
                if neighbours > 0
                    && (agreeing as f32) < params.min_consistent_ratio * neighbours as f32
                {
                    *v = f32::NAN;
                }
            }
        });

    log::debug!(
        "depth validation kept {} of {} valid pixels",
        out.valid_count(),
        depth.valid_count()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_limits_are_enforced() {
        let map = DepthMap::from_vec(4, 1, vec![5.0, 500.0, 20_000.0, -1.0]).unwrap();
        let out = validate_depth(
            &map,
            &DepthValidationParams {
                consistency_radius: 0,
                ..Default::default()
            },
        );
        assert_eq!(out.valid_count(), 1);
        assert_eq!(out.get(1, 0), Some(500.0));
    }

    #[test]
    fn isolated_spike_is_removed_and_surface_kept() {
        let mut map = DepthMap::filled(9, 9, 500.0);
        map.set(4, 4, 2_000.0);
        let out = validate_depth(&map, &DepthValidationParams::default());
        assert!(out.get(4, 4).is_none());
        assert_eq!(out.valid_count(), 80);
    }
}
