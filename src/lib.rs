// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Filter-graph runtime for Codec2-style hardware video pipelines.
//!
//! A pipeline is a chain of filter stages, each running on its own worker
//! thread: a color-space-convert stage backed by a hardware scaler, and an
//! encoder stage backed by a hardware codec session. Buffers come from a
//! platform block pool through [`allocator::BufferAllocator`] and flow from
//! stage to stage via queue submission, so a slow downstream stage creates
//! backpressure instead of blocking its producer.
//!
//! The hardware itself is out of scope: codec sessions, scalers and block
//! pools are capability traits in [`backend`], with software stand-ins in
//! [`backend::dummy`] for tests and demos.

use std::str::FromStr;

pub mod allocator;
pub mod backend;
pub mod buffer;
pub mod filter;
pub mod params;
pub mod pipeline;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Crop or placement rectangle, in pixels relative to the buffer origin.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn from_resolution(resolution: Resolution) -> Self {
        Self { left: 0, top: 0, width: resolution.width, height: resolution.height }
    }

    pub fn size(&self) -> Resolution {
        Resolution { width: self.width, height: self.height }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    NV12,
    NV21,
    I420,
    YV12,
    Argb8888,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::NV12 | PixelFormat::NV21 => 2,
            PixelFormat::I420 | PixelFormat::YV12 => 3,
            PixelFormat::Argb8888 => 1,
        }
    }
}

impl FromStr for PixelFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(PixelFormat::NV12),
            "nv21" | "NV21" => Ok(PixelFormat::NV21),
            "i420" | "I420" => Ok(PixelFormat::I420),
            "yv12" | "YV12" => Ok(PixelFormat::YV12),
            "argb" | "ARGB" => Ok(PixelFormat::Argb8888),
            _ => Err("unrecognized pixel format. Valid values: nv12, nv21, i420, yv12, argb"),
        }
    }
}

/// Bitstream formats the encoder stage can target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodedFormat {
    H264,
    H263,
    Mpeg4,
    VP8,
    VP9,
}

impl FromStr for CodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(CodedFormat::H264),
            "h263" | "H263" => Ok(CodedFormat::H263),
            "mpeg4" | "MPEG4" => Ok(CodedFormat::Mpeg4),
            "vp8" | "VP8" => Ok(CodedFormat::VP8),
            "vp9" | "VP9" => Ok(CodedFormat::VP9),
            _ => Err("unrecognized coded format. Valid values: h264, h263, mpeg4, vp8, vp9"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorRange {
    #[default]
    Limited,
    Full,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorGamut {
    #[default]
    Bt709,
    Bt470bg,
    Smpte170m,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorTransfer {
    #[default]
    Bt709,
    Smpte170m,
    Iec61966_2_1,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorMatrix {
    Rgb,
    #[default]
    Bt709,
    Bt470bg,
    Smpte170m,
}

/// Color-space tagging carried alongside a frame through the CSC stage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorAspects {
    pub range: ColorRange,
    pub primaries: ColorGamut,
    pub transfer: ColorTransfer,
    pub matrix: ColorMatrix,
}

/// Returns the per-plane byte sizes of a `width`x`height` frame of `format`
/// whose luma (or only) plane has `stride` bytes per line.
pub fn plane_sizes(format: PixelFormat, width: u32, height: u32, stride: u32) -> Vec<usize> {
    let height = height as usize;
    let stride = stride as usize;
    // Chroma planes are aligned to 2 in both dimensions.
    let chroma_height = (height + 1) / 2;
    match format {
        PixelFormat::NV12 | PixelFormat::NV21 => {
            vec![stride * height, stride * chroma_height]
        }
        PixelFormat::I420 | PixelFormat::YV12 => {
            let chroma_stride = (stride + 1) / 2;
            vec![stride * height, chroma_stride * chroma_height, chroma_stride * chroma_height]
        }
        PixelFormat::Argb8888 => {
            let stride = std::cmp::max(stride, width as usize * 4);
            vec![stride * height]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_sizes_nv12() {
        let sizes = plane_sizes(PixelFormat::NV12, 320, 240, 320);
        assert_eq!(sizes, vec![320 * 240, 320 * 120]);
        // Odd height rounds the chroma plane up.
        let sizes = plane_sizes(PixelFormat::NV12, 320, 241, 320);
        assert_eq!(sizes, vec![320 * 241, 320 * 121]);
    }

    #[test]
    fn test_plane_sizes_i420() {
        let sizes = plane_sizes(PixelFormat::I420, 320, 240, 320);
        assert_eq!(sizes, vec![320 * 240, 160 * 120, 160 * 120]);
    }

    #[test]
    fn test_plane_sizes_argb() {
        let sizes = plane_sizes(PixelFormat::Argb8888, 64, 64, 0);
        assert_eq!(sizes, vec![64 * 4 * 64]);
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!(PixelFormat::from_str("NV12"), Ok(PixelFormat::NV12));
        assert_eq!(CodedFormat::from_str("h264"), Ok(CodedFormat::H264));
        assert!(PixelFormat::from_str("rgb565").is_err());
    }
}
