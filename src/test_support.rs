// test_support.rs — helpers shared by the unit tests (cfg(test) only).
//
// SUBPROCESS ISOLATION
// ────────────────────
// dzn (Microsoft's D3D12-to-Vulkan layer on WSL2) crashes with SIGSEGV
// during process exit once any Vulkan device has been created. GPU tests
// therefore come in pairs:
//
//   inner_*  #[ignore]d, runs the real assertions, prints "GPU_TEST_OK"
//   test_*   spawns `cargo test` for the inner test and looks for the token
//
// The exit status of the child is deliberately ignored.

use crate::image::Image;

/// Run one named lib test in a child process and return stdout + stderr.
pub(crate) fn run_gpu_test_in_subprocess(test_name: &str) -> String {
    let output = std::process::Command::new("cargo")
        .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    print!("{stdout}");
    eprint!("{stderr}");
    stdout + &stderr
}

/// Dark Gaussian blob on a bright background, values in [0, 255].
pub(crate) fn gaussian_blob(width: usize, height: usize, cx: f32, cy: f32, sigma: f32) -> Image<f32> {
    Image::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let g = (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
        200.0 - 150.0 * g
    })
}

/// Deterministic pseudo-random texture (LCG), values in [0, 255].
pub(crate) fn noise(width: usize, height: usize, seed: u32) -> Image<f32> {
    let mut rng = seed;
    Image::from_fn(width, height, |_, _| {
        rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
        (rng >> 24) as f32
    })
}

/// Rotate by 90°: `out(x, y) = img(y, h - 1 - x)`, so `out` is `h × w`.
///
/// A point `(px, py)` of `img` lands at `(h - 1 - py, px)` and image-space
/// directions turn by +90° (y pointing down).
pub(crate) fn rotate_90(img: &Image<f32>) -> Image<f32> {
    let h = img.height();
    Image::from_fn(h, img.width(), |x, y| img.get(y, h - 1 - x))
}
