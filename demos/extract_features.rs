// demos/extract_features.rs — extract SIFT keypoints and draw them.
//
// Writes vis_output/<name>_sift.svg with one circle per keypoint (radius =
// scale) and a tick for its orientation, drawn over the input image.
//
// USAGE
//   cargo run --example extract_features --release
//   cargo run --example extract_features --release -- path/to/image.png [threshold] [--upscale]
//
// Set RUST_LOG=debug to see adapter selection and per-stage progress.

use std::fmt::Write;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use sift_wgpu::{GpuDevice, HostSync, Image, Keypoint, SiftConfig, SiftExtractor, SiftKernels, Stream};

/// Images wider than this are drawn without the pixel background.
const MAX_RENDER_DIM: usize = 320;

fn main() {
    env_logger::init();
    fs::create_dir_all("vis_output").expect("failed to create vis_output/");

    let args: Vec<String> = std::env::args().collect();
    let (name, img) = match args.get(1).filter(|a| !a.starts_with("--")) {
        Some(path) => (
            std::path::Path::new(path)
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy()
                .into_owned(),
            load_image(path),
        ),
        None => ("blobs".to_string(), make_blobs()),
    };
    let threshold: f32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(3.0);
    let upscale = args.iter().any(|a| a == "--upscale");
    println!("Image: {name} {}×{}", img.width(), img.height());

    let gpu = Arc::new(GpuDevice::new().expect("failed to initialise a GPU"));
    println!("GPU: {} [{}], workgroup {}", gpu.adapter_info, gpu.profile, gpu.workgroup_size);
    let kernels = Arc::new(SiftKernels::new(&gpu).expect("kernel compilation failed"));

    let config = SiftConfig { threshold, upscale, ..SiftConfig::default() };
    let mut sift = SiftExtractor::new(
        kernels,
        Stream::new(gpu, "main"),
        img.width() as u32,
        img.height() as u32,
        config,
    )
    .expect("failed to build extractor");

    // First run pays pipeline warm-up.
    let _ = sift.extract(&img, HostSync::Skip).expect("extraction failed");
    let t0 = Instant::now();
    let result = sift.extract(&img, HostSync::CopyKeypoints).expect("extraction failed");
    let elapsed = t0.elapsed();

    println!(
        "{} keypoints ({} raw, {} dropped) in {:.2} ms",
        result.count,
        result.raw_count,
        result.dropped(),
        elapsed.as_secs_f64() * 1e3
    );
    for slice in &result.octaves {
        println!("  octave {}: {} keypoints [{}..{})", slice.octave, slice.len(), slice.start, slice.end);
    }

    let kps = sift.keypoints();
    if let Some(best) = kps.iter().max_by(|a, b| a.contrast.abs().total_cmp(&b.contrast.abs())) {
        println!(
            "strongest: ({:.1}, {:.1}) scale {:.2} orientation {:.1}° contrast {:.2}",
            best.x, best.y, best.scale, best.orientation, best.contrast
        );
    }

    let svg = render_svg(&img, kps, &name);
    let out = format!("vis_output/{name}_sift.svg");
    fs::write(&out, svg).expect("failed to write SVG");
    println!("wrote {out}");
}

// ============================================================
// Scenes
// ============================================================

fn load_image(path: &str) -> Image<f32> {
    let gray = image::open(path).expect("failed to open image").to_luma8();
    let (w, h) = gray.dimensions();
    Image::from_vec(w as usize, h as usize, gray.into_raw()).to_f32()
}

/// Dark Gaussian blobs of increasing size on a light background.
fn make_blobs() -> Image<f32> {
    let blobs = [(48.0, 48.0, 3.0), (140.0, 60.0, 5.0), (240.0, 80.0, 8.0), (90.0, 170.0, 12.0), (230.0, 190.0, 4.0)];
    Image::from_fn(320, 240, |x, y| {
        let mut v = 200.0;
        for &(cx, cy, s) in &blobs {
            let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            v -= 150.0 * (-d2 / (2.0 * s * s)).exp();
        }
        v
    })
}

// ============================================================
// SVG
// ============================================================

fn render_svg(img: &Image<f32>, kps: &[Keypoint], title: &str) -> String {
    let (w, h) = (img.width(), img.height());
    let mut svg = String::new();
    writeln!(svg, r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {w} {}" width="{}" height="{}">"#, h + 20, w * 2, (h + 20) * 2).unwrap();
    writeln!(svg, r##"<rect width="{w}" height="{h}" fill="#808080"/>"##).unwrap();

    if w <= MAX_RENDER_DIM && h <= MAX_RENDER_DIM {
        for y in 0..h {
            for x in 0..w {
                let g = img.get(x, y).clamp(0.0, 255.0) as u8;
                writeln!(svg, r#"<rect x="{x}" y="{y}" width="1" height="1" fill="rgb({g},{g},{g})"/>"#).unwrap();
            }
        }
    }

    for kp in kps {
        let (dx, dy) = (kp.orientation_rad().cos() * kp.scale, kp.orientation_rad().sin() * kp.scale);
        let colour = if kp.contrast > 0.0 { "#00e0ff" } else { "#ff4040" };
        writeln!(
            svg,
            r#"<circle cx="{:.2}" cy="{:.2}" r="{:.2}" fill="none" stroke="{colour}" stroke-width="0.4"/>"#,
            kp.x, kp.y, kp.scale
        )
        .unwrap();
        writeln!(
            svg,
            r#"<line x1="{:.2}" y1="{:.2}" x2="{:.2}" y2="{:.2}" stroke="{colour}" stroke-width="0.4"/>"#,
            kp.x, kp.y, kp.x + dx, kp.y + dy
        )
        .unwrap();
    }

    writeln!(svg, r#"<text x="2" y="{}" font-size="10" font-family="monospace">{title}: {} keypoints</text>"#, h + 14, kps.len()).unwrap();
    svg.push_str("</svg>\n");
    svg
}
