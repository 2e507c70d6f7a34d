// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pipeline buffers and the transient descriptors exchanged with hardware.
//!
//! A [`Buffer`] is a reference-counted unit of pool memory shared between
//! the stage that produced it and the stage currently processing it; the
//! backing block returns to its pool when the last `Arc` drops. A
//! [`BufferInfo`] is built fresh for every exchange with a codec or scaler
//! session and never stored.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use thiserror::Error;

use crate::allocator::Block;
use crate::params::FilterParams;
use crate::plane_sizes;
use crate::PixelFormat;
use crate::Rect;
use crate::Resolution;

pub const FRAME_FLAG_KEY_FRAME: u32 = 1 << 0;
pub const FRAME_FLAG_CODEC_SPECIFIC_DATA: u32 = 1 << 1;
pub const FRAME_FLAG_END_OF_STREAM: u32 = 1 << 2;
/// The buffer stands in for a frame but carries no payload of its own
/// (e.g. an empty end-of-stream marker).
pub const FRAME_FLAG_REPLICA: u32 = 1 << 3;

/// Image descriptor attached to every buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub crop: Rect,
    pub flags: u32,
}

impl ImageInfo {
    pub fn new(format: PixelFormat, resolution: Resolution) -> Self {
        Self {
            format,
            width: resolution.width,
            height: resolution.height,
            stride: resolution.width,
            crop: Rect::from_resolution(resolution),
            flags: 0,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution { width: self.width, height: self.height }
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("buffer of {capacity} bytes cannot hold a {required} byte frame")]
    Insufficient { capacity: usize, required: usize },
}

type BufferRelease = Box<dyn FnOnce(Block) + Send>;

/// A reference-counted unit of pool memory flowing through the pipeline.
pub struct Buffer {
    block: Block,
    image: Mutex<ImageInfo>,
    data_len: Mutex<usize>,
    params: Mutex<FilterParams>,
    release: Mutex<Option<BufferRelease>>,
}

impl Buffer {
    /// Wraps `block` without a release hook; the block is simply dropped
    /// with the buffer. Used for imported memory the host still owns.
    pub fn new(block: Block, image: ImageInfo) -> Self {
        Self {
            block,
            image: Mutex::new(image),
            data_len: Mutex::new(0),
            params: Mutex::new(FilterParams::new()),
            release: Mutex::new(None),
        }
    }

    /// Wraps `block` and arranges for `release` to run with it when the
    /// last reference drops.
    pub fn with_release(block: Block, image: ImageInfo, release: BufferRelease) -> Self {
        Self {
            block,
            image: Mutex::new(image),
            data_len: Mutex::new(0),
            params: Mutex::new(FilterParams::new()),
            release: Mutex::new(Some(release)),
        }
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn capacity(&self) -> usize {
        self.block.size
    }

    pub fn image(&self) -> ImageInfo {
        *self.image.lock().unwrap()
    }

    pub fn set_image(&self, image: ImageInfo) {
        *self.image.lock().unwrap() = image;
    }

    pub fn data_len(&self) -> usize {
        *self.data_len.lock().unwrap()
    }

    pub fn set_data_len(&self, len: usize) {
        *self.data_len.lock().unwrap() = len;
    }

    pub fn set_flags(&self, flags: u32) {
        self.image.lock().unwrap().flags |= flags;
    }

    pub fn has_flags(&self, flags: u32) -> bool {
        self.image.lock().unwrap().flags & flags == flags
    }

    pub fn is_replica(&self) -> bool {
        self.has_flags(FRAME_FLAG_REPLICA)
    }

    pub fn is_csd(&self) -> bool {
        self.has_flags(FRAME_FLAG_CODEC_SPECIFIC_DATA)
    }

    pub fn is_eos(&self) -> bool {
        self.has_flags(FRAME_FLAG_END_OF_STREAM)
    }

    /// Parameter bag attached to this buffer's metadata.
    pub fn params(&self) -> MutexGuard<'_, FilterParams> {
        self.params.lock().unwrap()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.lock().unwrap().take() {
            release(self.block.clone());
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("block", &self.block.id)
            .field("capacity", &self.block.size)
            .field("image", &self.image.lock().unwrap())
            .field("data_len", &self.data_len.lock().unwrap())
            .finish()
    }
}

/// Per-plane slice of a [`BufferInfo`].
#[derive(Clone, Debug)]
pub struct PlaneInfo {
    pub fd: i64,
    pub offset: usize,
    pub alloc_size: usize,
    pub data_size: usize,
    /// CPU mapping of the backing block, when one exists.
    pub map: Option<Arc<Mutex<Vec<u8>>>>,
}

/// Transient descriptor bundling a buffer with its per-plane backing for
/// one exchange with a hardware session.
#[derive(Clone, Debug)]
pub struct BufferInfo {
    pub planes: Vec<PlaneInfo>,
    pub image: ImageInfo,
    pub id: Option<u64>,
}

impl BufferInfo {
    /// Builds an input descriptor from `buffer`'s image, with format-aware
    /// per-plane sizes. A replica buffer submits zero data on every plane
    /// regardless of its allocated length.
    pub fn from_buffer(buffer: &Buffer) -> Result<Self, LayoutError> {
        let image = buffer.image();
        let sizes = plane_sizes(image.format, image.width, image.height, image.stride);
        let required: usize = sizes.iter().sum();
        if buffer.capacity() < required {
            return Err(LayoutError::Insufficient { capacity: buffer.capacity(), required });
        }

        let block = buffer.block();
        let replica = image.flags & FRAME_FLAG_REPLICA != 0;
        let mut planes = Vec::with_capacity(sizes.len());
        let mut offset = 0;
        for size in sizes {
            planes.push(PlaneInfo {
                fd: block.id as i64,
                offset,
                alloc_size: size,
                data_size: if replica { 0 } else { size },
                map: Some(block.data.clone()),
            });
            offset += size;
        }

        Ok(Self { planes, image, id: None })
    }

    /// Builds an output descriptor: a single plane spanning the buffer's
    /// full capacity, zero used length and no logical id yet.
    pub fn for_output(buffer: &Buffer) -> Self {
        let block = buffer.block();
        Self {
            planes: vec![PlaneInfo {
                fd: block.id as i64,
                offset: 0,
                alloc_size: buffer.capacity(),
                data_size: 0,
                map: Some(block.data.clone()),
            }],
            image: buffer.image(),
            id: None,
        }
    }

    pub fn data_size(&self) -> usize {
        self.planes.iter().map(|p| p.data_size).sum()
    }
}
