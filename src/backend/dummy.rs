// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software stand-ins for the hardware capabilities, used by tests and the
//! demo pipeline. The dummy session mimics the exchange behavior of a
//! stateful hardware encoder: it emits one codec-specific-data output with
//! no paired input before the first frame, then one coded output per input,
//! in submission order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::allocator::Block;
use crate::allocator::BlockPool;
use crate::allocator::PoolError;
use crate::backend::CodecSession;
use crate::backend::CompletedWork;
use crate::backend::OutputDesc;
use crate::backend::OutputInfo;
use crate::backend::ScalerConfig;
use crate::backend::ScalerSession;
use crate::backend::SessionError;
use crate::backend::SessionResult;
use crate::buffer::BufferInfo;
use crate::buffer::FRAME_FLAG_CODEC_SPECIFIC_DATA;
use crate::buffer::FRAME_FLAG_END_OF_STREAM;
use crate::buffer::FRAME_FLAG_KEY_FRAME;
use crate::params::Param;

/// Byte length of the synthetic codec-specific-data payload.
pub const DUMMY_CSD_SIZE: usize = 12;

/// Heap-backed block pool with a fixed block budget; exhaustion answers
/// `TryAgain` like a pressured platform pool.
pub struct HeapBlockPool {
    capacity: u32,
    state: Mutex<HeapPoolState>,
}

#[derive(Default)]
struct HeapPoolState {
    outstanding: u32,
    next_id: u64,
}

impl HeapBlockPool {
    pub fn new(capacity: u32) -> Self {
        Self { capacity, state: Mutex::new(Default::default()) }
    }

    pub fn outstanding(&self) -> u32 {
        self.state.lock().unwrap().outstanding
    }
}

impl BlockPool for HeapBlockPool {
    fn alloc_block(&self, size: usize, _usage: u64) -> Result<Block, PoolError> {
        let mut state = self.state.lock().unwrap();
        if state.outstanding >= self.capacity {
            return Err(PoolError::TryAgain);
        }
        state.outstanding += 1;
        state.next_id += 1;
        Ok(Block { id: state.next_id, size, data: Arc::new(Mutex::new(vec![0; size])) })
    }

    fn free_block(&self, _block: Block) {
        let mut state = self.state.lock().unwrap();
        state.outstanding = state.outstanding.saturating_sub(1);
    }
}

struct DummyEncoderState {
    output_info: Option<OutputInfo>,
    req_out_buf_count: u32,
    extra_buf_num: u32,
    inputs: VecDeque<BufferInfo>,
    outputs: VecDeque<BufferInfo>,
    ready: VecDeque<CompletedWork>,
    csd_emitted: bool,
    frame_index: u64,
    params: Vec<Param>,
}

/// Software [`CodecSession`]. Clones share one session, so a test can keep
/// a handle to the instance it moved into a filter.
#[derive(Clone)]
pub struct DummyEncoderSession {
    inner: Arc<Mutex<DummyEncoderState>>,
}

impl DummyEncoderSession {
    pub fn new(req_out_buf_count: u32, extra_buf_num: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DummyEncoderState {
                output_info: None,
                req_out_buf_count,
                extra_buf_num,
                inputs: VecDeque::new(),
                outputs: VecDeque::new(),
                ready: VecDeque::new(),
                csd_emitted: false,
                frame_index: 0,
                params: Vec::new(),
            })),
        }
    }

    /// Changes the advertised output-buffer requirement, as a codec whose
    /// requirement is only discovered (or revised) after setup would.
    pub fn set_req_out_buf_count(&self, count: u32) {
        self.inner.lock().unwrap().req_out_buf_count = count;
    }

    pub fn recorded_params(&self) -> Vec<Param> {
        self.inner.lock().unwrap().params.clone()
    }

    pub fn queued_output_count(&self) -> u32 {
        self.inner.lock().unwrap().outputs.len() as u32
    }
}

fn write_payload(info: &BufferInfo, bytes: &[u8]) {
    if let Some(map) = &info.planes[0].map {
        let mut data = map.lock().unwrap();
        let offset = info.planes[0].offset;
        let end = std::cmp::min(offset + bytes.len(), data.len());
        data[offset..end].copy_from_slice(&bytes[..end - offset]);
    }
}

impl DummyEncoderState {
    fn pump(&mut self) {
        let req = self.req_out_buf_count;

        if !self.csd_emitted {
            let Some(info) = &self.output_info else { return };
            let resolution = info.resolution;
            let Some(out) = self.outputs.pop_front() else { return };

            let mut csd = [0u8; DUMMY_CSD_SIZE];
            csd[..4].copy_from_slice(b"CSDH");
            LittleEndian::write_u32(&mut csd[4..8], resolution.width);
            LittleEndian::write_u32(&mut csd[8..12], resolution.height);
            write_payload(&out, &csd);

            self.ready.push_back(CompletedWork {
                input_id: None,
                output: OutputDesc {
                    fd: out.planes[0].fd,
                    image: out.image,
                    data_size: DUMMY_CSD_SIZE,
                    flags: FRAME_FLAG_CODEC_SPECIFIC_DATA,
                    average_qp: None,
                    req_out_buf_count: req,
                },
            });
            self.csd_emitted = true;
        }

        while !self.inputs.is_empty() && !self.outputs.is_empty() {
            let input = self.inputs.pop_front().unwrap();
            let out = self.outputs.pop_front().unwrap();

            if input.data_size() == 0 {
                // Empty end-of-stream marker, nothing to encode.
                self.ready.push_back(CompletedWork {
                    input_id: input.id,
                    output: OutputDesc {
                        fd: out.planes[0].fd,
                        image: out.image,
                        data_size: 0,
                        flags: FRAME_FLAG_END_OF_STREAM,
                        average_qp: None,
                        req_out_buf_count: req,
                    },
                });
                continue;
            }

            let area = input.image.resolution().get_area();
            let coded_size =
                std::cmp::min(std::cmp::max(area / 16, 64), out.planes[0].alloc_size);
            let mut header = [0u8; 12];
            header[..4].copy_from_slice(b"FRM0");
            LittleEndian::write_u32(&mut header[4..8], self.frame_index as u32);
            LittleEndian::write_u32(&mut header[8..12], coded_size as u32);
            write_payload(&out, &header);

            let flags = if self.frame_index == 0 { FRAME_FLAG_KEY_FRAME } else { 0 };
            self.ready.push_back(CompletedWork {
                input_id: input.id,
                output: OutputDesc {
                    fd: out.planes[0].fd,
                    image: out.image,
                    data_size: coded_size,
                    flags,
                    average_qp: Some(26 + (self.frame_index % 4) as u32),
                    req_out_buf_count: req,
                },
            });
            self.frame_index += 1;
        }
    }
}

impl CodecSession for DummyEncoderSession {
    fn setup(&mut self, input: &BufferInfo) -> SessionResult<OutputInfo> {
        let mut state = self.inner.lock().unwrap();
        let info = OutputInfo {
            resolution: input.image.resolution(),
            req_out_buf_count: state.req_out_buf_count,
        };
        state.output_info = Some(info);
        Ok(info)
    }

    fn output_info(&self) -> SessionResult<OutputInfo> {
        self.inner.lock().unwrap().output_info.ok_or(SessionError::InvalidState)
    }

    fn set_param(&mut self, param: &Param) -> SessionResult<()> {
        // The average-QP index is a codec report, not a control.
        if matches!(param, Param::AverageQp(_)) {
            return Err(SessionError::Unsupported);
        }
        self.inner.lock().unwrap().params.push(param.clone());
        Ok(())
    }

    fn queue_input(&mut self, info: BufferInfo) -> SessionResult<()> {
        let mut state = self.inner.lock().unwrap();
        if state.output_info.is_none() {
            return Err(SessionError::InvalidState);
        }
        state.inputs.push_back(info);
        state.pump();
        Ok(())
    }

    fn queue_output(&mut self, info: BufferInfo) -> SessionResult<()> {
        let mut state = self.inner.lock().unwrap();
        if state.output_info.is_none() {
            return Err(SessionError::InvalidState);
        }
        state.outputs.push_back(info);
        state.pump();
        Ok(())
    }

    fn dequeue(&mut self) -> SessionResult<Option<CompletedWork>> {
        Ok(self.inner.lock().unwrap().ready.pop_front())
    }

    fn flush(&mut self) -> SessionResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.inputs.clear();
        state.outputs.clear();
        Ok(())
    }

    fn in_buf_count(&self) -> u32 {
        self.inner.lock().unwrap().inputs.len() as u32
    }

    fn out_buf_count(&self) -> u32 {
        self.inner.lock().unwrap().outputs.len() as u32
    }

    fn req_out_buf_count(&self) -> u32 {
        self.inner.lock().unwrap().req_out_buf_count
    }

    fn extra_buf_num(&self) -> u32 {
        self.inner.lock().unwrap().extra_buf_num
    }
}

#[derive(Default)]
struct DummyScalerState {
    config: Option<ScalerConfig>,
    configure_calls: usize,
    run_calls: usize,
    stopped: bool,
}

/// Software [`ScalerSession`]. Clones share one scaler.
#[derive(Clone, Default)]
pub struct DummyScaler {
    inner: Arc<Mutex<DummyScalerState>>,
}

impl DummyScaler {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn configure_calls(&self) -> usize {
        self.inner.lock().unwrap().configure_calls
    }

    pub fn run_calls(&self) -> usize {
        self.inner.lock().unwrap().run_calls
    }
}

impl ScalerSession for DummyScaler {
    fn configure(&mut self, config: &ScalerConfig) -> SessionResult<()> {
        let mut state = self.inner.lock().unwrap();
        if state.stopped {
            return Err(SessionError::InvalidState);
        }
        state.config = Some(config.clone());
        state.configure_calls += 1;
        Ok(())
    }

    fn run(&mut self, src: &BufferInfo, dst: &mut BufferInfo) -> SessionResult<()> {
        let mut state = self.inner.lock().unwrap();
        if state.config.is_none() {
            return Err(SessionError::InvalidState);
        }
        state.run_calls += 1;

        // Fill every destination plane; copy what we can from the source so
        // the demo output is recognizable.
        for plane in dst.planes.iter_mut() {
            plane.data_size = plane.alloc_size;
        }
        if let (Some(src_map), Some(dst_map)) = (&src.planes[0].map, &dst.planes[0].map) {
            let src_data = src_map.lock().unwrap();
            let mut dst_data = dst_map.lock().unwrap();
            let len = std::cmp::min(
                src.planes[0].data_size.min(src_data.len() - src.planes[0].offset),
                dst.planes[0].alloc_size.min(dst_data.len() - dst.planes[0].offset),
            );
            let src_off = src.planes[0].offset;
            let dst_off = dst.planes[0].offset;
            dst_data[dst_off..dst_off + len].copy_from_slice(&src_data[src_off..src_off + len]);
        }
        Ok(())
    }

    fn flush(&mut self) -> SessionResult<()> {
        Ok(())
    }

    fn stop(&mut self) -> SessionResult<()> {
        self.inner.lock().unwrap().stopped = true;
        Ok(())
    }
}
