// config.rs — extractor configuration.
//
// Plain value types with `Default`. Two configurations compare equal when
// every field is equal; the extractor's parameter cache is keyed on these
// values, never on a global version counter.
//
// Defaults are the classic SIFT settings for 8-bit intensity input
// (values in [0, 255]):
//
//   num_octaves  5        upscale    false
//   init_blur    1.0      max_points 0x8000
//   threshold    3.0      normalizer L2 → clamp 0.2 → L2
//   min_scale    0.0
//   edge_limit   10.0

use crate::error::{Result, SiftError};
use crate::normalizer::DescriptorNormalizer;
use crate::scale_space::MAX_OCTAVES;

/// Whether `extract` copies the keypoints back to host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostSync {
    /// Keypoints stay on the device; only the counters are read.
    #[default]
    Skip,
    /// Copy the stored keypoints into the host mirror after the pass.
    CopyKeypoints,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiftConfig {
    /// Requested octave count. The plan may build fewer for small images.
    pub num_octaves: usize,
    /// Sigma of the low-pass applied to the input before the pyramid.
    pub init_blur: f32,
    /// Minimum absolute DoG response of a candidate extremum.
    pub threshold: f32,
    /// Keypoints with a smaller scale (original-image pixels) are rejected.
    pub min_scale: f32,
    /// Principal-curvature ratio limit `r`; rejects `tr²/det >= (r+1)²/r`.
    pub edge_limit: f32,
    /// Double the input resolution before building octave 0.
    pub upscale: bool,
    /// Capacity of the keypoint buffer.
    pub max_points: u32,
    pub normalizer: DescriptorNormalizer,
}

impl Default for SiftConfig {
    fn default() -> Self {
        SiftConfig {
            num_octaves: 5,
            init_blur: 1.0,
            threshold: 3.0,
            min_scale: 0.0,
            edge_limit: 10.0,
            upscale: false,
            max_points: 0x8000,
            normalizer: DescriptorNormalizer::sift(),
        }
    }
}

impl SiftConfig {
    /// Reject values the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.num_octaves == 0 || self.num_octaves > MAX_OCTAVES {
            return Err(SiftError::InvalidConfig(format!(
                "num_octaves must be in 1..={MAX_OCTAVES}, got {}",
                self.num_octaves
            )));
        }
        if self.max_points == 0 {
            return Err(SiftError::InvalidConfig("max_points must be at least 1".into()));
        }
        let non_negative = [
            ("init_blur", self.init_blur),
            ("threshold", self.threshold),
            ("min_scale", self.min_scale),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(SiftError::InvalidConfig(format!(
                    "{name} must be finite and >= 0, got {value}"
                )));
            }
        }
        if !self.edge_limit.is_finite() || self.edge_limit < 1.0 {
            return Err(SiftError::InvalidConfig(format!(
                "edge_limit must be finite and >= 1, got {}",
                self.edge_limit
            )));
        }
        Ok(())
    }

    /// Upper bound on `tr²/det` accepted by the edge test.
    pub fn edge_ratio_bound(&self) -> f32 {
        let r = self.edge_limit;
        (r + 1.0) * (r + 1.0) / r
    }

    /// True when switching from `self` to `other` changes arena geometry.
    pub fn changes_layout(&self, other: &SiftConfig) -> bool {
        self.num_octaves != other.num_octaves || self.upscale != other.upscale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let cfg = SiftConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_points, 32768);
        assert_eq!(cfg.num_octaves, 5);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let bad = [
            SiftConfig { num_octaves: 0, ..Default::default() },
            SiftConfig { num_octaves: MAX_OCTAVES + 1, ..Default::default() },
            SiftConfig { max_points: 0, ..Default::default() },
            SiftConfig { threshold: -1.0, ..Default::default() },
            SiftConfig { init_blur: f32::NAN, ..Default::default() },
            SiftConfig { edge_limit: 0.5, ..Default::default() },
        ];
        for cfg in bad {
            assert!(
                matches!(cfg.validate(), Err(SiftError::InvalidConfig(_))),
                "{cfg:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_edge_ratio_bound() {
        let cfg = SiftConfig::default();
        assert!((cfg.edge_ratio_bound() - 12.1).abs() < 1e-5);
    }

    #[test]
    fn test_changes_layout() {
        let a = SiftConfig::default();
        let b = SiftConfig { threshold: 5.0, max_points: 10, ..Default::default() };
        let c = SiftConfig { upscale: true, ..Default::default() };
        assert!(!a.changes_layout(&b));
        assert!(a.changes_layout(&c));
    }
}
