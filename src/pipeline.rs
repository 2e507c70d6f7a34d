// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Builds and drives a filter chain for one bitstream format.
//!
//! The chain layout is explicit data passed in at construction; there are
//! no per-format tables baked into the crate. Client configuration is
//! wrapped into filter-targeted params and attached to the next queued
//! buffer, so every stage sees updates in stream order. Teardown is
//! ordered: stages stop (and flush their sessions) before the sessions and
//! finally the allocator go away.

use std::sync::Arc;
use std::sync::Mutex;

use crate::allocator::BlockPool;
use crate::allocator::BufferAllocator;
use crate::backend::CodecSession;
use crate::backend::ScalerSession;
use crate::buffer::Buffer;
use crate::filter::codecs::CodecCapability;
use crate::filter::csc::CscFilter;
use crate::filter::encoder::EncoderFilter;
use crate::filter::DoneCb;
use crate::filter::FilterError;
use crate::filter::FilterStage;
use crate::filter::FilterWork;
use crate::filter::StageControl;
use crate::filter::WorkDone;
use crate::params::FilterId;
use crate::params::FilterParam;
use crate::params::FilterParams;
use crate::params::FilterTarget;
use crate::params::Param;
use crate::params::ParamIndex;
use crate::CodedFormat;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StageKind {
    Csc,
    Encoder,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub coded: CodedFormat,
    pub secure: bool,
    pub conserve_memory: bool,
    pub stages: Vec<StageKind>,
}

impl PipelineConfig {
    /// The standard encode chain: color conversion in front of the codec.
    pub fn encode(coded: CodedFormat) -> Self {
        Self {
            coded,
            secure: false,
            conserve_memory: false,
            stages: vec![StageKind::Csc, StageKind::Encoder],
        }
    }
}

/// A running filter chain. Stages are declared before the allocator so the
/// sessions they own are torn down first when the pipeline drops.
pub struct Pipeline {
    stages: Vec<Box<dyn StageControl>>,
    csc_target: Option<FilterTarget>,
    encoder_target: FilterTarget,
    pending_params: Mutex<FilterParams>,
    errors: Arc<Mutex<Vec<String>>>,
    allocator: Arc<BufferAllocator>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        session: Box<dyn CodecSession>,
        scaler: Option<Box<dyn ScalerSession>>,
        pool: Arc<dyn BlockPool>,
        sink: DoneCb,
    ) -> Result<Self, FilterError> {
        if config.stages.last() != Some(&StageKind::Encoder) {
            return Err(FilterError::Other(anyhow::anyhow!(
                "pipeline must end in an encoder stage"
            )));
        }

        let allocator = Arc::new(BufferAllocator::new(pool));
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let error_cb = {
            let errors = errors.clone();
            Arc::new(Mutex::new(move |err: &FilterError| {
                log::error!("pipeline stage error: {}", err);
                errors.lock().unwrap().push(err.to_string());
            }))
        };

        let encoder_id = FilterId(config.stages.len() as u32 - 1);
        let capability = CodecCapability::for_format(config.coded, config.secure);
        let mut encoder_filter =
            EncoderFilter::new(capability, session, allocator.clone(), config.conserve_memory);
        encoder_filter.set_done_cb(sink);
        let mut encoder_stage = FilterStage::new(encoder_id, encoder_filter);
        encoder_stage.set_error_cb(error_cb.clone());

        let mut scaler = scaler;
        let mut stages: Vec<Box<dyn StageControl>> = Vec::new();
        let mut csc_target = None;
        for (position, kind) in config.stages.iter().enumerate() {
            match kind {
                StageKind::Encoder => {}
                StageKind::Csc => {
                    let Some(scaler) = scaler.take() else {
                        return Err(FilterError::Other(anyhow::anyhow!(
                            "chain has a CSC stage but no scaler was provided"
                        )));
                    };
                    let csc_id = FilterId(position as u32);
                    csc_target = Some(FilterTarget::Filter(csc_id));

                    // Converted frames go straight onto the next stage's
                    // queue; an end-of-stream marker with no frame becomes
                    // a drain request.
                    let encoder_link = encoder_stage.link();
                    let forward: DoneCb = Arc::new(Mutex::new(move |done: WorkDone| {
                        match done.output {
                            Some(output) => encoder_link.post(FilterWork::Frame(output)),
                            None if done.eos => encoder_link.post(FilterWork::Drain),
                            None => {}
                        }
                    }));

                    let mut csc_filter = CscFilter::new(scaler, allocator.clone());
                    csc_filter.set_done_cb(forward);
                    let mut csc_stage = FilterStage::new(csc_id, csc_filter);
                    csc_stage.set_error_cb(error_cb.clone());
                    stages.push(Box::new(csc_stage));
                    break; // at most one CSC stage in front of the encoder
                }
            }
        }
        stages.push(Box::new(encoder_stage));

        Ok(Self {
            stages,
            csc_target,
            encoder_target: FilterTarget::Filter(encoder_id),
            pending_params: Mutex::new(FilterParams::new()),
            errors,
            allocator,
        })
    }

    /// The allocator backing this pipeline's buffers, shared with the
    /// component for input allocation.
    pub fn allocator(&self) -> &Arc<BufferAllocator> {
        &self.allocator
    }

    pub fn start(&mut self) -> Result<(), FilterError> {
        for stage in self.stages.iter_mut() {
            stage.start()?;
        }
        Ok(())
    }

    fn target_for(&self, index: ParamIndex) -> FilterTarget {
        match index {
            ParamIndex::InputCrop
            | ParamIndex::OutputPosition
            | ParamIndex::ScaleSize
            | ParamIndex::OutputFormat
            | ParamIndex::ColorAspects => self.csc_target.unwrap_or(self.encoder_target),
            _ => self.encoder_target,
        }
    }

    /// Records configuration updates; they ride down the chain on the next
    /// queued buffer.
    pub fn configure(&self, params: Vec<Param>) {
        let mut pending = self.pending_params.lock().unwrap();
        for param in params {
            let target = self.target_for(param.index());
            pending.push(FilterParam { target, param });
        }
    }

    /// Submits one input frame to the head of the chain.
    pub fn queue(&self, buffer: Arc<Buffer>) -> Result<(), FilterError> {
        buffer.params().append(&mut self.pending_params.lock().unwrap());
        self.stages[0].queue(buffer)
    }

    /// Signals end of input; an end-of-stream work item surfaces through
    /// the sink once all pending frames have drained.
    pub fn drain(&self) -> Result<(), FilterError> {
        self.stages[0].drain()
    }

    /// Flushes every stage front to back and returns the frames that were
    /// still waiting in stage queues.
    pub fn flush(&mut self) -> Result<Vec<Arc<Buffer>>, FilterError> {
        let mut pending = Vec::new();
        for stage in self.stages.iter_mut() {
            pending.append(&mut stage.flush()?);
        }
        Ok(pending)
    }

    /// Stops every stage front to back. Sessions are released when the
    /// pipeline drops, after all workers have joined.
    pub fn stop(&mut self) -> Result<(), FilterError> {
        let mut result = Ok(());
        for stage in self.stages.iter_mut() {
            if let Err(err) = stage.stop() {
                log::error!("failed to stop stage {:?}: {}", stage.id(), err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Errors reported by stage workers since the last call.
    pub fn take_errors(&self) -> Vec<String> {
        std::mem::take(&mut self.errors.lock().unwrap())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
