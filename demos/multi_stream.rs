// demos/multi_stream.rs — two extractors on two streams, one device.
//
// Each thread owns a `SiftExtractor` with its own stream and configuration
// and extracts one image of a pair (the second is the first shifted by a
// known offset). The keypoints are then matched on the host by descriptor
// distance and the match fields are filled in.
//
// USAGE
//   cargo run --example multi_stream --release
//   cargo run --example multi_stream --release -- path/to/image.png [dx] [dy]

use std::sync::Arc;
use std::time::Instant;

use sift_wgpu::{
    DescriptorNormalizer, GpuDevice, HostSync, Image, Keypoint, SiftConfig, SiftExtractor, SiftKernels, Stream,
};

/// Ratio test: best distance must be below this fraction of the second best.
const MAX_AMBIGUITY: f32 = 0.8;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let base = match args.get(1) {
        Some(path) => {
            let gray = image::open(path).expect("failed to open image").to_luma8();
            let (w, h) = gray.dimensions();
            Image::from_vec(w as usize, h as usize, gray.into_raw()).to_f32()
        }
        None => make_texture(400, 300),
    };
    let dx: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(7);
    let dy: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(4);
    let shifted = shift(&base, dx, dy);
    let (w, h) = (base.width() as u32, base.height() as u32);

    let gpu = Arc::new(GpuDevice::new().expect("failed to initialise a GPU"));
    println!("GPU: {}", gpu.adapter_info);
    let kernels = Arc::new(SiftKernels::new(&gpu).expect("kernel compilation failed"));

    // The two extractors deliberately use different settings.
    let configs = [
        SiftConfig::default(),
        SiftConfig { threshold: 2.5, normalizer: DescriptorNormalizer::sift(), ..SiftConfig::default() },
    ];
    let mut extractors: Vec<SiftExtractor> = configs
        .into_iter()
        .enumerate()
        .map(|(i, config)| {
            SiftExtractor::new(kernels.clone(), Stream::new(gpu.clone(), format!("stream{i}")), w, h, config)
                .expect("failed to build extractor")
        })
        .collect();

    let t0 = Instant::now();
    std::thread::scope(|s| {
        for (sift, img) in extractors.iter_mut().zip([&base, &shifted]) {
            s.spawn(move || {
                let result = sift.extract(img, HostSync::CopyKeypoints).expect("extraction failed");
                println!("{}: {} keypoints ({} raw)", sift.stream().label(), result.count, result.raw_count);
            });
        }
    });
    println!("both streams done in {:.2} ms", t0.elapsed().as_secs_f64() * 1e3);

    let (first, second) = extractors.split_at_mut(1);
    let reference = second[0].keypoints().to_vec();
    let kps = first[0].keypoint_buffer_mut().host_mut();
    match_keypoints(kps, &reference);

    let matched: Vec<&Keypoint> = kps.iter().filter(|k| k.is_matched() && k.ambiguity < MAX_AMBIGUITY).collect();
    let correct = matched
        .iter()
        .filter(|k| ((k.match_x - k.x - dx as f32).powi(2) + (k.match_y - k.y - dy as f32).powi(2)).sqrt() < 3.0)
        .count();
    println!(
        "{} / {} keypoints matched, {} consistent with the ({dx}, {dy}) shift",
        matched.len(),
        kps.len(),
        correct
    );
}

/// Brute-force nearest neighbour by descriptor distance.
///
/// Fills `match_index`, `match_x`, `match_y`, `match_error` (distance to the
/// best) and `ambiguity` (best / second-best distance).
fn match_keypoints(kps: &mut [Keypoint], reference: &[Keypoint]) {
    for kp in kps.iter_mut() {
        let mut best = (f32::MAX, usize::MAX);
        let mut second = f32::MAX;
        for (j, r) in reference.iter().enumerate() {
            let d = kp.descriptor_distance_sq(r);
            if d < best.0 {
                second = best.0;
                best = (d, j);
            } else if d < second {
                second = d;
            }
        }
        if best.1 == usize::MAX {
            continue;
        }
        let r = &reference[best.1];
        kp.match_index = best.1 as i32;
        kp.match_x = r.x;
        kp.match_y = r.y;
        kp.match_error = best.0.sqrt();
        kp.ambiguity = if second > 0.0 && second < f32::MAX { (best.0 / second).sqrt() } else { 0.0 };
    }
}

/// Smooth random texture: a few overlapping blobs of mixed sign.
fn make_texture(w: usize, h: usize) -> Image<f32> {
    let mut rng = 12345u32;
    let mut next = || {
        rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
        (rng >> 8) as f32 / (1u32 << 24) as f32
    };
    let blobs: Vec<(f32, f32, f32, f32)> = (0..60)
        .map(|_| (next() * w as f32, next() * h as f32, 2.0 + next() * 8.0, next() * 160.0 - 80.0))
        .collect();
    Image::from_fn(w, h, |x, y| {
        let mut v = 128.0;
        for &(cx, cy, s, a) in &blobs {
            let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            v += a * (-d2 / (2.0 * s * s)).exp();
        }
        v
    })
}

/// `out(x, y) = img(x - dx, y - dy)`, edge-clamped.
fn shift(img: &Image<f32>, dx: usize, dy: usize) -> Image<f32> {
    Image::from_fn(img.width(), img.height(), |x, y| img.get(x.saturating_sub(dx), y.saturating_sub(dy)))
}
