// normalizer.rs — data-driven descriptor normalization.
//
// The descriptor kernel does not hard-code how a raw 128-bin histogram is
// normalized. It interprets a short program of steps uploaded once per
// pipeline instance, so switching from classic SIFT (L2, clamp 0.2, L2) to
// RootSIFT or L1 never requires a new shader.
//
// Every step operates on the descriptor vector `v` and a running scalar
// `norm` (initially 1):
//
//   code  step                    effect
//   ────  ──────────────────────  ──────────────────────────────────
//    0    End                     terminates the program
//    1    L2Norm                  norm = sqrt(Σ v²)
//    2    L1Norm                  norm = Σ |v|
//    3    DivideByNorm            v /= max(norm, ε)
//    4    ClampToNormFraction(p)  v = min(v, p · norm)   (consumes one param)
//    5    Sqrt                    v = sqrt(max(v, 0))
//
// Classic SIFT is {1, 4, 1, 3, 0} with params {0.2}: compute the L2 norm,
// clamp every bin to 0.2 of it, recompute the norm and divide.
//
// The same program is evaluated on the host by `apply`, used by tests and
// by host-side consumers that build descriptors themselves.

use crate::error::{Result, SiftError};
use crate::keypoint::DESCRIPTOR_SIZE;

/// Maximum number of steps (including the End sentinel) in the device copy.
pub const MAX_NORMALIZER_STEPS: usize = 16;

/// Maximum number of float parameters in the device copy.
pub const MAX_NORMALIZER_PARAMS: usize = 16;

/// Smallest norm used as a divisor.
const NORM_EPSILON: f32 = 1e-12;

/// One normalization step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NormalizerStep {
    L2Norm,
    L1Norm,
    DivideByNorm,
    /// Clamp each bin to `fraction * norm`.
    ClampToNormFraction(f32),
    Sqrt,
}

impl NormalizerStep {
    /// Numeric code understood by descriptor.wgsl.
    pub fn code(&self) -> u32 {
        match self {
            NormalizerStep::L2Norm => 1,
            NormalizerStep::L1Norm => 2,
            NormalizerStep::DivideByNorm => 3,
            NormalizerStep::ClampToNormFraction(_) => 4,
            NormalizerStep::Sqrt => 5,
        }
    }
}

/// An immutable, ordered normalization program.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorNormalizer {
    steps: Vec<NormalizerStep>,
}

impl Default for DescriptorNormalizer {
    fn default() -> Self {
        Self::sift()
    }
}

impl DescriptorNormalizer {
    /// Build from explicit steps. The End sentinel is implicit.
    pub fn new(steps: Vec<NormalizerStep>) -> Result<Self> {
        if steps.len() + 1 > MAX_NORMALIZER_STEPS {
            return Err(SiftError::InvalidNormalizer(format!(
                "{} steps exceed the limit of {}",
                steps.len(),
                MAX_NORMALIZER_STEPS - 1
            )));
        }
        let params = steps
            .iter()
            .filter(|s| matches!(s, NormalizerStep::ClampToNormFraction(_)))
            .count();
        if params > MAX_NORMALIZER_PARAMS {
            return Err(SiftError::InvalidNormalizer(format!(
                "{params} parameters exceed the limit of {MAX_NORMALIZER_PARAMS}"
            )));
        }
        for s in &steps {
            if let NormalizerStep::ClampToNormFraction(p) = s {
                if !p.is_finite() || *p <= 0.0 {
                    return Err(SiftError::InvalidNormalizer(format!(
                        "clamp fraction must be positive and finite, got {p}"
                    )));
                }
            }
        }
        Ok(DescriptorNormalizer { steps })
    }

    /// Classic SIFT: L2, clamp at 0.2, L2 again.
    pub fn sift() -> Self {
        DescriptorNormalizer {
            steps: vec![
                NormalizerStep::L2Norm,
                NormalizerStep::ClampToNormFraction(0.2),
                NormalizerStep::L2Norm,
                NormalizerStep::DivideByNorm,
            ],
        }
    }

    /// RootSIFT: L1 normalize then element-wise square root.
    pub fn root_sift() -> Self {
        DescriptorNormalizer {
            steps: vec![
                NormalizerStep::L1Norm,
                NormalizerStep::DivideByNorm,
                NormalizerStep::Sqrt,
            ],
        }
    }

    /// Parse a sentinel-terminated code list plus its parameter array.
    ///
    /// Codes after the first 0 are ignored. A list without a 0 is accepted
    /// when it fits; each code 4 consumes the next parameter in order.
    pub fn from_codes(codes: &[i32], params: &[f32]) -> Result<Self> {
        let mut steps = Vec::new();
        let mut next_param = params.iter();
        for &code in codes {
            let step = match code {
                0 => break,
                1 => NormalizerStep::L2Norm,
                2 => NormalizerStep::L1Norm,
                3 => NormalizerStep::DivideByNorm,
                4 => {
                    let p = next_param.next().ok_or_else(|| {
                        SiftError::InvalidNormalizer("clamp step without a parameter".into())
                    })?;
                    NormalizerStep::ClampToNormFraction(*p)
                }
                5 => NormalizerStep::Sqrt,
                other => {
                    return Err(SiftError::InvalidNormalizer(format!("unknown step code {other}")))
                }
            };
            steps.push(step);
        }
        Self::new(steps)
    }

    pub fn steps(&self) -> &[NormalizerStep] {
        &self.steps
    }

    /// Encode for upload. Layout matches `Normalizer` in descriptor.wgsl.
    pub fn to_device(&self) -> DeviceNormalizer {
        let mut dev = DeviceNormalizer::zeroed();
        let mut n_params = 0usize;
        for (i, step) in self.steps.iter().enumerate() {
            dev.steps[i] = step.code();
            if let NormalizerStep::ClampToNormFraction(p) = step {
                dev.params[n_params] = *p;
                n_params += 1;
            }
        }
        // steps[len] stays 0: the End sentinel.
        dev.n_steps = self.steps.len() as u32;
        dev.n_params = n_params as u32;
        dev
    }

    /// Run the program on a host descriptor.
    pub fn apply(&self, desc: &mut [f32; DESCRIPTOR_SIZE]) {
        let mut norm = 1.0f32;
        for step in &self.steps {
            match *step {
                NormalizerStep::L2Norm => {
                    norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
                }
                NormalizerStep::L1Norm => {
                    norm = desc.iter().map(|v| v.abs()).sum::<f32>();
                }
                NormalizerStep::DivideByNorm => {
                    let inv = 1.0 / norm.max(NORM_EPSILON);
                    desc.iter_mut().for_each(|v| *v *= inv);
                }
                NormalizerStep::ClampToNormFraction(p) => {
                    let limit = p * norm;
                    desc.iter_mut().for_each(|v| *v = v.min(limit));
                }
                NormalizerStep::Sqrt => {
                    desc.iter_mut().for_each(|v| *v = v.max(0.0).sqrt());
                }
            }
        }
    }
}

/// Device copy of a normalizer program (storage buffer, read-only).
///
/// Layout must match `Normalizer` in descriptor.wgsl:
///   offset   0: n_steps  (u32)
///   offset   4: n_params (u32)
///   offset   8: steps    (16 × u32)
///   offset  72: params   (16 × f32)
///   total: 136 bytes
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DeviceNormalizer {
    pub n_steps: u32,
    pub n_params: u32,
    pub steps: [u32; MAX_NORMALIZER_STEPS],
    pub params: [f32; MAX_NORMALIZER_PARAMS],
}

impl DeviceNormalizer {
    fn zeroed() -> Self {
        bytemuck::Zeroable::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> [f32; DESCRIPTOR_SIZE] {
        let mut d = [0.0f32; DESCRIPTOR_SIZE];
        for (i, v) in d.iter_mut().enumerate() {
            *v = (i % 17) as f32;
        }
        // One dominant bin so the 0.2 clamp actually bites.
        d[5] = 400.0;
        d
    }

    #[test]
    fn test_codes_parse_to_sift() {
        let n = DescriptorNormalizer::from_codes(&[1, 4, 1, 3, 0], &[0.2]).unwrap();
        assert_eq!(n, DescriptorNormalizer::sift());
    }

    #[test]
    fn test_codes_after_sentinel_ignored() {
        let n = DescriptorNormalizer::from_codes(&[1, 3, 0, 9, 9], &[]).unwrap();
        assert_eq!(n.steps(), &[NormalizerStep::L2Norm, NormalizerStep::DivideByNorm]);
    }

    #[test]
    fn test_codes_errors() {
        assert!(matches!(
            DescriptorNormalizer::from_codes(&[4, 0], &[]),
            Err(SiftError::InvalidNormalizer(_))
        ));
        assert!(matches!(
            DescriptorNormalizer::from_codes(&[7, 0], &[]),
            Err(SiftError::InvalidNormalizer(_))
        ));
        assert!(DescriptorNormalizer::new(vec![NormalizerStep::L2Norm; 16]).is_err());
        assert!(DescriptorNormalizer::new(vec![NormalizerStep::ClampToNormFraction(-1.0)]).is_err());
    }

    #[test]
    fn test_sift_output_is_unit_and_clamped() {
        let mut d = ramp();
        DescriptorNormalizer::sift().apply(&mut d);
        let norm: f32 = d.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm = {norm}");
        // After renormalisation the clamped bin may exceed 0.2 slightly but
        // it is no longer dominant.
        assert!(d[5] < 0.5, "dominant bin = {}", d[5]);
    }

    #[test]
    fn test_sift_idempotent() {
        let n = DescriptorNormalizer::sift();
        let mut once = ramp();
        n.apply(&mut once);
        let mut twice = once;
        n.apply(&mut twice);
        // Clamp-then-renormalise is not an exact projection when a bin sits
        // above 0.2 after renormalisation, so feed the clamped result again
        // until it settles and compare consecutive passes.
        let mut settled = twice;
        for _ in 0..8 {
            n.apply(&mut settled);
        }
        let mut again = settled;
        n.apply(&mut again);
        for (a, b) in settled.iter().zip(again.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_idempotent_on_normalised_vector() {
        // A unit vector with every bin below 0.2 is a fixed point.
        let mut d = [1.0f32 / (DESCRIPTOR_SIZE as f32).sqrt(); DESCRIPTOR_SIZE];
        let before = d;
        DescriptorNormalizer::sift().apply(&mut d);
        for (a, b) in before.iter().zip(d.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_root_sift() {
        let mut d = ramp();
        DescriptorNormalizer::root_sift().apply(&mut d);
        // sqrt of an L1-normalised non-negative vector has unit L2 norm.
        let norm: f32 = d.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_zero_descriptor_stays_finite() {
        let mut d = [0.0f32; DESCRIPTOR_SIZE];
        DescriptorNormalizer::sift().apply(&mut d);
        assert!(d.iter().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn test_device_encoding() {
        assert_eq!(std::mem::size_of::<DeviceNormalizer>(), 136);
        let dev = DescriptorNormalizer::sift().to_device();
        assert_eq!(dev.n_steps, 4);
        assert_eq!(dev.n_params, 1);
        assert_eq!(&dev.steps[..5], &[1, 4, 1, 3, 0]);
        assert_eq!(dev.params[0], 0.2);
    }
}
