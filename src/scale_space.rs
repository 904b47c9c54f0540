// scale_space.rs — host-side numeric policy for the scale-space pyramid.
//
// Everything here is pure arithmetic that the GPU stages consume:
//
//   OctavePlan       : the precomputed octave sequence (dimensions,
//                      cumulative blur, subsampling factor). The orchestrator
//                      iterates it in a loop instead of recursing per octave.
//   laplace_kernels  : per-octave, per-level 1D blur coefficients for the
//                      difference-of-Gaussian stage.
//   half_kernel      : normalized half-taps of a sampled Gaussian, used for
//                      the low-pass and downsample coefficient uniforms.
//
//
// LEVEL SIGMAS
// ────────────
// Each octave holds LEVELS_PER_OCTAVE = NUM_SCALES + 3 blurred levels. Level i
// is blurred (directly from the octave base image) to
//
//     sigma_i = 2^((i - 1) / NUM_SCALES)
//
// so the base blur is 2^(-1/NUM_SCALES) and adjacent levels differ by the
// ratio 2^(1/NUM_SCALES). The base image of octave o already carries blur
// b_o, so the kernel variance applied to reach sigma_i is sigma_i² - b_o².
//
// CUMULATIVE BLUR
// ───────────────
// Octave o+1 is the 2x downsample of octave o's base image. Downsampling adds
// (0.5)² of variance in the finer octave's pixels and then halves the
// sampling density:
//
//     b_{o+1} = sqrt(b_o² + 0.5²) / 2
//
// b_0 is the initial blur argument. The extractor passes 0: the low-pass
// applied to the input image is treated as anti-aliasing, not as scale.

/// Scales per octave. Extrema are searched in NUM_SCALES DoG levels.
pub const NUM_SCALES: usize = 5;

/// Blurred levels per octave.
pub const LEVELS_PER_OCTAVE: usize = NUM_SCALES + 3;

/// Difference-of-Gaussian levels per octave.
pub const DOG_LEVELS: usize = NUM_SCALES + 2;

/// Radius of the per-level blur kernels (LAPLACE_R + 1 half-taps).
pub const LAPLACE_R: usize = 4;

/// Float slots reserved per level in the device coefficient table.
/// Must match KERNEL_STRIDE in dog.wgsl.
pub const KERNEL_STRIDE: usize = 8;

/// Radius of the input low-pass filter.
pub const LOWPASS_R: usize = 4;

/// Radius of the anti-aliasing filter used by `downsample` (5 taps).
pub const DOWNSAMPLE_R: usize = 2;

/// Variance of the downsample anti-aliasing filter.
pub const DOWNSAMPLE_VARIANCE: f32 = 0.5;

/// Extra blur (in the finer octave's pixels) accounted for per downsample.
pub const OCTAVE_BLUR_STEP: f32 = 0.5;

/// Smallest low-pass sigma; zero would produce a degenerate kernel.
pub const MIN_LOWPASS_SIGMA: f32 = 0.001;

/// Upper bound on octaves in one plan.
pub const MAX_OCTAVES: usize = 12;

/// Octaves whose shorter side is below this are not built. The extremum
/// detector needs a 3×3 neighbourhood plus a one-pixel border.
pub const MIN_OCTAVE_DIM: u32 = 8;

/// Smallest kernel variance; guards levels whose target sigma is already
/// reached by the octave's inherited blur.
const MIN_KERNEL_VARIANCE: f32 = 1e-4;

/// Blur of level 0 in every octave: 2^(-1/NUM_SCALES).
pub fn base_blur() -> f32 {
    2f32.powf(-1.0 / NUM_SCALES as f32)
}

/// Ratio between the sigmas of adjacent levels: 2^(1/NUM_SCALES).
pub fn scale_ratio() -> f32 {
    2f32.powf(1.0 / NUM_SCALES as f32)
}

/// Target sigma of blurred level `level`, in octave pixels.
pub fn level_sigma(level: usize) -> f32 {
    base_blur() * scale_ratio().powi(level as i32)
}

/// Blur carried by the next-coarser octave's base image.
pub fn next_octave_blur(blur: f32) -> f32 {
    (blur * blur + OCTAVE_BLUR_STEP * OCTAVE_BLUR_STEP).sqrt() / 2.0
}

/// `ceil(n / 2)`, the dimension of the next-coarser octave.
pub fn half_dim(n: u32) -> u32 {
    n.div_ceil(2)
}

// ---------------------------------------------------------------------------
// Octave plan
// ---------------------------------------------------------------------------

/// One entry of the octave sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OctaveDesc {
    /// 0 is the finest octave.
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// Blur already present in the octave's base image (octave pixels).
    pub blur: f32,
    /// Size of one octave pixel in original-image pixels.
    pub subsampling: f32,
}

/// The precomputed octave sequence for one source size.
#[derive(Debug, Clone, PartialEq)]
pub struct OctavePlan {
    source_width: u32,
    source_height: u32,
    upscale: bool,
    requested: usize,
    octaves: Vec<OctaveDesc>,
}

impl OctavePlan {
    /// Plan up to `num_octaves` octaves for a `width × height` source.
    ///
    /// Octave 0 is the source (or its 2x upscale); octave k+1 is
    /// `ceil(w_k/2) × ceil(h_k/2)`. The sequence stops early when an octave
    /// would fall below `MIN_OCTAVE_DIM`, so a tiny or empty source yields a
    /// short or empty plan instead of a failure.
    pub fn new(
        width: u32,
        height: u32,
        num_octaves: usize,
        upscale: bool,
        initial_blur: f32,
    ) -> Self {
        let factor = if upscale { 2 } else { 1 };
        let mut octaves = Vec::with_capacity(num_octaves.min(MAX_OCTAVES));
        let mut w = width.saturating_mul(factor);
        let mut h = height.saturating_mul(factor);
        let mut blur = initial_blur;
        let mut subsampling = 1.0 / factor as f32;

        for index in 0..num_octaves.min(MAX_OCTAVES) {
            if w == 0 || h == 0 || w.min(h) < MIN_OCTAVE_DIM {
                break;
            }
            octaves.push(OctaveDesc { index, width: w, height: h, blur, subsampling });
            w = half_dim(w);
            h = half_dim(h);
            blur = next_octave_blur(blur);
            subsampling *= 2.0;
        }

        OctavePlan {
            source_width: width,
            source_height: height,
            upscale,
            requested: num_octaves,
            octaves,
        }
    }

    pub fn len(&self) -> usize {
        self.octaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.octaves.is_empty()
    }

    /// Octave count requested by the configuration (may exceed `len()`).
    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn upscale(&self) -> bool {
        self.upscale
    }

    pub fn source_size(&self) -> (u32, u32) {
        (self.source_width, self.source_height)
    }

    pub fn octave(&self, index: usize) -> &OctaveDesc {
        &self.octaves[index]
    }

    /// Finest to coarsest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &OctaveDesc> + '_ {
        self.octaves.iter()
    }
}

// ---------------------------------------------------------------------------
// Kernel generation
// ---------------------------------------------------------------------------

/// Normalized right half of a sampled Gaussian with the given variance.
///
/// Returns `radius + 1` taps for offsets 0..=radius. The full symmetric
/// kernel `[k_r .. k_1, k_0, k_1 .. k_r]` sums to 1.
pub fn half_kernel(variance: f32, radius: usize) -> Vec<f32> {
    let var = variance.max(MIN_KERNEL_VARIANCE);
    let mut taps: Vec<f32> = (0..=radius)
        .map(|j| (-((j * j) as f32) / (2.0 * var)).exp())
        .collect();
    let sum: f32 = taps
        .iter()
        .enumerate()
        .map(|(j, &t)| if j == 0 { t } else { 2.0 * t })
        .sum();
    for t in &mut taps {
        *t /= sum;
    }
    taps
}

/// Per-octave, per-level blur coefficients for the DoG stage.
///
/// Layout: `table[(octave * LEVELS_PER_OCTAVE + level) * KERNEL_STRIDE + tap]`
/// with taps 0..=LAPLACE_R; the remaining slots of each level are zero.
pub fn laplace_kernels(plan: &OctavePlan) -> Vec<f32> {
    let mut table = vec![0.0f32; plan.len() * LEVELS_PER_OCTAVE * KERNEL_STRIDE];
    for oct in plan.iter() {
        for level in 0..LEVELS_PER_OCTAVE {
            let sigma = level_sigma(level);
            let variance = sigma * sigma - oct.blur * oct.blur;
            let taps = half_kernel(variance, LAPLACE_R);
            let base = (oct.index * LEVELS_PER_OCTAVE + level) * KERNEL_STRIDE;
            table[base..base + taps.len()].copy_from_slice(&taps);
        }
    }
    table
}

/// Scale (in octave pixels) represented by DoG level `s` with sub-level
/// offset `ds`: the geometric mean of the two blurred levels it subtracts.
pub fn dog_sigma(s: f32) -> f32 {
    2f32.powf((s - 0.5) / NUM_SCALES as f32)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn full_sum(taps: &[f32]) -> f32 {
        taps[0] + 2.0 * taps[1..].iter().sum::<f32>()
    }

    #[test]
    fn test_level_sigma_policy() {
        assert!((base_blur() - 2f32.powf(-0.2)).abs() < 1e-6);
        assert!((level_sigma(1) - 1.0).abs() < 1e-6);
        assert!((level_sigma(NUM_SCALES + 1) - 2.0).abs() < 1e-5);
        for i in 1..LEVELS_PER_OCTAVE {
            let ratio = level_sigma(i) / level_sigma(i - 1);
            assert!((ratio - scale_ratio()).abs() < 1e-5);
        }
    }

    #[test]
    fn test_half_kernel_normalised() {
        for &var in &[0.05f32, 0.5, 1.0, 4.0] {
            let k = half_kernel(var, 4);
            assert_eq!(k.len(), 5);
            assert!((full_sum(&k) - 1.0).abs() < 1e-5, "var={var} sum={}", full_sum(&k));
            for w in k.windows(2) {
                assert!(w[0] >= w[1], "taps must decrease away from the centre");
            }
        }
    }

    #[test]
    fn test_half_kernel_degenerate_variance() {
        // A non-positive variance collapses to (almost) the identity.
        let k = half_kernel(-1.0, 4);
        assert!(k[0] > 0.999);
    }

    #[test]
    fn test_plan_ceil_chain() {
        let plan = OctavePlan::new(101, 75, 4, false, 0.0);
        let dims: Vec<(u32, u32)> = plan.iter().map(|o| (o.width, o.height)).collect();
        assert_eq!(dims, vec![(101, 75), (51, 38), (26, 19), (13, 10)]);
        let sub: Vec<f32> = plan.iter().map(|o| o.subsampling).collect();
        assert_eq!(sub, vec![1.0, 2.0, 4.0, 8.0]);
    }

    #[test]
    fn test_plan_upscale() {
        let plan = OctavePlan::new(64, 48, 3, true, 0.0);
        assert_eq!(plan.octave(0).width, 128);
        assert_eq!(plan.octave(0).height, 96);
        assert_eq!(plan.octave(0).subsampling, 0.5);
        assert_eq!(plan.octave(1).subsampling, 1.0);
    }

    #[test]
    fn test_plan_stops_at_minimum_footprint() {
        let plan = OctavePlan::new(40, 40, 8, false, 0.0);
        // 40 → 20 → 10 → 5 (< MIN_OCTAVE_DIM)
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.requested(), 8);

        assert!(OctavePlan::new(4, 4, 5, false, 0.0).is_empty());
        assert!(OctavePlan::new(0, 480, 5, false, 0.0).is_empty());
    }

    #[test]
    fn test_cumulative_blur_recurrence() {
        let plan = OctavePlan::new(512, 512, 4, false, 0.0);
        assert_eq!(plan.octave(0).blur, 0.0);
        assert!((plan.octave(1).blur - 0.25).abs() < 1e-6);
        let expected = (0.25f32 * 0.25 + 0.25).sqrt() / 2.0;
        assert!((plan.octave(2).blur - expected).abs() < 1e-6);
    }

    #[test]
    fn test_laplace_table_shape_and_rows() {
        let plan = OctavePlan::new(256, 256, 3, false, 0.0);
        let table = laplace_kernels(&plan);
        assert_eq!(table.len(), 3 * LEVELS_PER_OCTAVE * KERNEL_STRIDE);
        for o in 0..3 {
            for l in 0..LEVELS_PER_OCTAVE {
                let base = (o * LEVELS_PER_OCTAVE + l) * KERNEL_STRIDE;
                let row = &table[base..base + LAPLACE_R + 1];
                assert!((full_sum(row) - 1.0).abs() < 1e-5, "octave {o} level {l}");
                assert!(table[base + LAPLACE_R + 1..base + KERNEL_STRIDE].iter().all(|&v| v == 0.0));
            }
        }
        // Finer levels blur less: centre tap decreases with level.
        let c0 = table[0];
        let c7 = table[(LEVELS_PER_OCTAVE - 1) * KERNEL_STRIDE];
        assert!(c0 > c7);
    }

    #[test]
    fn test_dog_sigma_between_levels() {
        for s in 0..DOG_LEVELS {
            let sigma = dog_sigma(s as f32);
            assert!(sigma > level_sigma(s) && sigma < level_sigma(s + 1));
        }
    }
}
