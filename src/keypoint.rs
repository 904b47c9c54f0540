// keypoint.rs — the keypoint record shared by host and device.
//
// One `#[repr(C)]` layout is used by the WGSL kernels (`Keypoint` in
// common.wgsl), the device keypoint buffer and the host mirror, so a
// readback is a plain byte copy.
//
//   offset   0: x, y             (f32)  original-image coordinates
//   offset   8: scale            (f32)  original-image pixels
//   offset  12: orientation      (f32)  degrees, [0, 360)
//   offset  16: contrast         (f32)  interpolated DoG response
//   offset  20: edgeness         (f32)  tr²/det of the spatial Hessian
//   offset  24: subsampling      (f32)  octave pixel size
//   offset  28: octave           (u32)
//   offset  32: match_index      (i32)  -1 = unmatched
//   offset  36: match_x, match_y (f32)
//   offset  44: match_error      (f32)
//   offset  48: ambiguity        (f32)
//   offset  52: _pad             (3 × f32)
//   offset  64: descriptor       (128 × f32)
//   total: 576 bytes
//
// The match_* fields are owned by an external matcher; extraction resets
// them to "unmatched".

/// Number of floats in a descriptor: 4×4 spatial cells × 8 orientations.
pub const DESCRIPTOR_SIZE: usize = 128;

/// Sentinel for `Keypoint::match_index`.
pub const NO_MATCH: i32 = -1;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub orientation: f32,
    pub contrast: f32,
    pub edgeness: f32,
    pub subsampling: f32,
    pub octave: u32,
    pub match_index: i32,
    pub match_x: f32,
    pub match_y: f32,
    pub match_error: f32,
    pub ambiguity: f32,
    pub _pad: [f32; 3],
    pub descriptor: [f32; DESCRIPTOR_SIZE],
}

impl Default for Keypoint {
    fn default() -> Self {
        Keypoint {
            match_index: NO_MATCH,
            ..bytemuck::Zeroable::zeroed()
        }
    }
}

impl Keypoint {
    pub fn is_matched(&self) -> bool {
        self.match_index >= 0
    }

    /// Squared Euclidean distance between two descriptors.
    pub fn descriptor_distance_sq(&self, other: &Keypoint) -> f32 {
        self.descriptor
            .iter()
            .zip(other.descriptor.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    /// Orientation in radians.
    pub fn orientation_rad(&self) -> f32 {
        self.orientation.to_radians()
    }
}

impl std::fmt::Debug for Keypoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypoint")
            .field("x", &self.x)
            .field("y", &self.y)
            .field("scale", &self.scale)
            .field("orientation", &self.orientation)
            .field("contrast", &self.contrast)
            .field("edgeness", &self.edgeness)
            .field("octave", &self.octave)
            .field("match_index", &self.match_index)
            .finish_non_exhaustive()
    }
}
