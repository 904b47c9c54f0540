// image.rs — host image container, generic over pixel type.
//
// The extractor consumes single-channel f32 images. Decoded 8-bit frames
// arrive as `Image<u8>` and are widened with `to_f32()` before upload; GPU
// readback produces `Image<f32>` again.
//
// MEMORY LAYOUT
// ─────────────
// Row-major with an explicit stride (in elements, not bytes):
//
//   data index:  0  1  2  3 [4]  5  6  7  8 [9]
//   pixel:       ■  ■  ■  ■  ·   ■  ■  ■  ■  ·
//   row:         |--- row 0 ---|  |--- row 1 ---|
//
// Padding elements are never read by the pipeline; uploads copy only the
// first `width` elements of each row.

use std::fmt;

// ---------------------------------------------------------------------------
// Pixel trait
// ---------------------------------------------------------------------------

/// Types that can be stored in an [`Image`].
pub trait Pixel: Copy + Default + Send + Sync + PartialOrd + 'static {
    /// Raw conversion to f32 (not normalised).
    fn to_f32(self) -> f32;

    /// Conversion from f32 with clamping and rounding where needed.
    fn from_f32(v: f32) -> Self;
}

impl Pixel for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, 255.0).round() as u8
    }
}

impl Pixel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D image with runtime dimensions.
#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    data: Vec<T>,
    width: usize,
    height: usize,
    /// Row stride in elements. `stride >= width`.
    stride: usize,
}

impl<T: Pixel> Image<T> {
    /// Zero-initialised image with `stride == width`.
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_stride(width, height, width)
    }

    /// Zero-initialised image with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        Image {
            data: vec![T::default(); stride * height],
            width,
            height,
            stride,
        }
    }

    /// Wrap an existing tightly packed buffer.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "buffer length {} does not match {}x{}",
            data.len(),
            width,
            height
        );
        Image { data, width, height, stride: width }
    }

    /// Build an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Image { data, width, height, stride: width }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        debug_assert!(x < self.width && y < self.height, "({x}, {y}) out of bounds");
        self.data[y * self.stride + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        debug_assert!(x < self.width && y < self.height, "({x}, {y}) out of bounds");
        self.data[y * self.stride + x] = value;
    }

    /// Active pixels of row `y` (padding excluded).
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    /// Raw backing buffer including padding.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Convert every pixel to f32, dropping stride padding.
    pub fn to_f32(&self) -> Image<f32> {
        let mut out = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            out.extend(self.row(y).iter().map(|p| p.to_f32()));
        }
        Image::from_vec(self.width, self.height, out)
    }
}

impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image<{}>({}x{}, stride={})",
            std::any::type_name::<T>(),
            self.width,
            self.height,
            self.stride
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
