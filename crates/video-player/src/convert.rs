//! 4:2:0 interleaved-chroma to RGBA conversion.
//!
//! Input is one luma plane followed by one interleaved `U,V` plane at half resolution in
//! both dimensions. Both planes use a row stride rounded up to the configured alignment.
//! Output is tightly packed RGBA (`width * 4` bytes per row); the alpha byte of each pixel
//! is never written, so whatever the buffer was initialized with passes through.
//!
//! The conversion uses 10-bit fixed point coefficients:
//!
//! ```text
//! R = Y + (1435 * V) >> 10
//! G = Y + (-352 * U - 731 * V) >> 10
//! B = Y + (1814 * U) >> 10
//! ```
//!
//! with `U`/`V` centered on 128 and each channel clamped to `0..=255`.

use crate::config::EngineConfig;

/// Stride geometry of a planar sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Bytes per luma row (also used for the interleaved chroma rows).
    pub stride_width: usize,
    /// Rows in the luma plane before the chroma plane starts.
    pub stride_height: usize,
}

impl PlaneLayout {
    /// Layout with both dimensions rounded up to `alignment`.
    pub fn aligned(width: usize, height: usize, alignment: usize) -> Self {
        Self {
            stride_width: align_up(width, alignment),
            stride_height: align_up(height, alignment),
        }
    }

    /// Layout for a delivered sample of `sample_len` bytes.
    ///
    /// Some decoders align the row stride but not the plane height. When the aligned plane
    /// size does not fit in the sample the unaligned height is used to locate the chroma
    /// plane (if the config allows it).
    pub fn for_sample(width: usize, height: usize, sample_len: usize, config: &EngineConfig) -> Self {
        let layout = Self::aligned(width, height, config.alignment());
        if config.unaligned_height_fallback && layout.planar_len() > sample_len {
            tracing::trace!(
                width,
                height,
                sample_len,
                aligned_len = layout.planar_len(),
                "sample smaller than aligned planes; using unaligned height"
            );
            return Self {
                stride_width: layout.stride_width,
                stride_height: height,
            };
        }
        layout
    }

    /// Total bytes of luma + chroma planes for this layout.
    pub fn planar_len(&self) -> usize {
        self.stride_width.saturating_mul(self.stride_height).saturating_mul(3) / 2
    }

    /// Byte offset of the interleaved chroma plane.
    pub fn chroma_offset(&self) -> usize {
        self.stride_width.saturating_mul(self.stride_height)
    }
}

/// Round `value` up to a multiple of `alignment`.
pub fn align_up(value: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Size of the RGBA buffer for a `width` x `height` frame.
///
/// One spare row keeps odd heights addressable, `margin` pads the tail.
pub fn rgba_len(width: usize, height: usize, margin: usize) -> usize {
    width
        .saturating_mul(height.saturating_add(1))
        .saturating_mul(4)
        .saturating_add(margin)
}

/// Allocate an RGBA buffer with every alpha byte set to opaque.
pub fn opaque_buffer(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    for px in buf.chunks_exact_mut(4) {
        px[3] = u8::MAX;
    }
    buf
}

/// Per-block color offsets derived from one chroma pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ChromaDelta {
    red: i32,
    green: i32,
    blue: i32,
}

impl ChromaDelta {
    #[inline]
    fn new(u: u8, v: u8) -> Self {
        let u = i32::from(u) - 128;
        let v = i32::from(v) - 128;
        Self {
            red: (1435 * v) >> 10,
            green: (-352 * u - 731 * v) >> 10,
            blue: (1814 * u) >> 10,
        }
    }

    #[inline]
    fn write(self, luma: u8, px: &mut [u8]) {
        let y = i32::from(luma);
        px[0] = clamp_channel(y + self.red);
        px[1] = clamp_channel(y + self.green);
        px[2] = clamp_channel(y + self.blue);
    }
}

#[inline]
fn clamp_channel(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Convert one planar frame into `dst`.
///
/// `dst` should be at least [`rgba_len`] bytes. Samples shorter than `layout` describes
/// read as black luma / neutral chroma instead of panicking; output pixels outside `dst`
/// are skipped.
pub fn convert_into(src: &[u8], width: usize, height: usize, layout: PlaneLayout, dst: &mut [u8]) {
    let stride = layout.stride_width;
    let chroma_base = layout.chroma_offset();
    let dst_stride = width * 4;

    for y in (0..height).step_by(2) {
        let chroma_row = chroma_base + (y / 2) * stride;
        let rows = if y + 1 < height { 2 } else { 1 };

        for x in (0..width).step_by(2) {
            let u = src.get(chroma_row + x).copied().unwrap_or(128);
            let v = src.get(chroma_row + x + 1).copied().unwrap_or(128);
            let delta = ChromaDelta::new(u, v);
            let cols = if x + 1 < width { 2 } else { 1 };

            for row in y..y + rows {
                let luma_row = row * stride;
                let out_row = row * dst_stride;
                for col in x..x + cols {
                    let luma = src.get(luma_row + col).copied().unwrap_or(0);
                    let out = out_row + col * 4;
                    if let Some(px) = dst.get_mut(out..out + 3) {
                        delta.write(luma, px);
                    }
                }
            }
        }
    }
}

/// Convert one planar frame into a freshly allocated, opaque RGBA buffer.
pub fn convert(src: &[u8], width: usize, height: usize, layout: PlaneLayout, margin: usize) -> Vec<u8> {
    let mut out = opaque_buffer(rgba_len(width, height, margin));
    convert_into(src, width, height, layout, &mut out);
    out
}
