// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware capability traits the filter stages drive.
//!
//! The codec session and scaler are opaque external collaborators; only
//! their exchange and failure contracts are specified here. [`dummy`]
//! provides software stand-ins for tests and demos.

use thiserror::Error;

use crate::buffer::BufferInfo;
use crate::buffer::ImageInfo;
use crate::params::Param;
use crate::ColorAspects;
use crate::PixelFormat;
use crate::Rect;
use crate::Resolution;

pub mod dummy;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is in the wrong state for this operation")]
    InvalidState,
    #[error("unsupported configuration")]
    Unsupported,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Output geometry discovered when a codec session is set up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputInfo {
    pub resolution: Resolution,
    pub req_out_buf_count: u32,
}

/// Completed output descriptor, as reported by the codec.
#[derive(Clone, Debug)]
pub struct OutputDesc {
    /// Backing handle of the output buffer this result landed in.
    pub fd: i64,
    pub image: ImageInfo,
    pub data_size: usize,
    pub flags: u32,
    /// Average QP of the encoded frame, when the codec reports it.
    pub average_qp: Option<u32>,
    /// The codec's current output-buffer requirement; may only be refined
    /// after setup.
    pub req_out_buf_count: u32,
}

/// One completed (input, output) pair. `input_id` is absent for outputs
/// with no corresponding input, such as codec-specific data.
#[derive(Clone, Debug)]
pub struct CompletedWork {
    pub input_id: Option<u64>,
    pub output: OutputDesc,
}

/// Hardware video-encoder session capability.
pub trait CodecSession: Send {
    /// Configures the codec from the first input's descriptor and reports
    /// the discovered output geometry.
    fn setup(&mut self, input: &BufferInfo) -> SessionResult<OutputInfo>;

    fn output_info(&self) -> SessionResult<OutputInfo>;

    /// Applies one dynamic configuration update. A translation failure is
    /// reported as an error; the caller drops the update and continues.
    fn set_param(&mut self, param: &Param) -> SessionResult<()>;

    fn queue_input(&mut self, info: BufferInfo) -> SessionResult<()>;

    fn queue_output(&mut self, info: BufferInfo) -> SessionResult<()>;

    /// Returns the next completed (input, output) pair, if any.
    fn dequeue(&mut self) -> SessionResult<Option<CompletedWork>>;

    /// Drains buffers already submitted to the hardware.
    fn flush(&mut self) -> SessionResult<()>;

    fn in_buf_count(&self) -> u32;

    /// Output buffers currently outstanding with the codec.
    fn out_buf_count(&self) -> u32;

    /// The codec's minimum output-buffer requirement, 0 while unknown.
    fn req_out_buf_count(&self) -> u32;

    /// Margin on top of the minimum that the codec can work without.
    fn extra_buf_num(&self) -> u32;
}

/// Crop/scale/format configuration of the CSC stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalerConfig {
    pub src_crop: Rect,
    pub dst_pos: Rect,
    pub dst_size: Resolution,
    pub dst_format: PixelFormat,
    pub aspects: ColorAspects,
}

/// Hardware scaler capability, owned exclusively by one CSC filter.
pub trait ScalerSession: Send {
    fn configure(&mut self, config: &ScalerConfig) -> SessionResult<()>;

    /// Transforms one source frame into `dst` under the current config.
    fn run(&mut self, src: &BufferInfo, dst: &mut BufferInfo) -> SessionResult<()>;

    fn flush(&mut self) -> SessionResult<()>;

    fn stop(&mut self) -> SessionResult<()>;
}
