// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder filter stage: drives one hardware video-encoder session.
//!
//! The filter configures the codec from the first input, keeps the codec's
//! output queue supplied from the buffer allocator under a bounded retry
//! scheme when the pool is pressured, splits off codec-specific data and
//! re-attaches it to the next real frame's work item, and surfaces
//! per-frame codec reports (average QP) as component-targeted parameters.
//!
//! Transient pool exhaustion is never a pipeline error: a starved
//! allocation round is skipped and retried on the next fill cycle.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::allocator::AllocArg;
use crate::allocator::AllocError;
use crate::allocator::BufferAllocator;
use crate::allocator::USAGE_CPU_READ;
use crate::allocator::USAGE_CPU_WRITE;
use crate::allocator::USAGE_PROTECTED;
use crate::backend::CodecSession;
use crate::backend::CompletedWork;
use crate::backend::OutputInfo;
use crate::buffer::Buffer;
use crate::buffer::BufferInfo;
use crate::buffer::ImageInfo;
use crate::buffer::FRAME_FLAG_CODEC_SPECIFIC_DATA;
use crate::buffer::FRAME_FLAG_END_OF_STREAM;
use crate::filter::codecs::CodecCapability;
use crate::filter::DoneCb;
use crate::filter::Filter;
use crate::filter::FilterError;
use crate::filter::FilterWork;
use crate::filter::StageLink;
use crate::filter::WorkDone;
use crate::params::FilterParam;
use crate::params::FilterTarget;
use crate::params::Param;
use crate::PixelFormat;

/// Delay between two attempts to allocate an output buffer.
pub const WAIT_ALLOC_TIME: Duration = Duration::from_millis(10);
/// Total time budget for consecutive failing allocation attempts.
pub const ALLOC_RETRY_TIME: Duration = Duration::from_secs(1);
/// Ceiling on consecutive failing attempts before the filter considers
/// itself resource starved and pauses until the next fill cycle.
pub const MAX_ALLOC_RETRY_COUNT: u32 =
    (ALLOC_RETRY_TIME.as_millis() / WAIT_ALLOC_TIME.as_millis()) as u32;

const MIN_OUT_BUFFER_SIZE: usize = 64 * 1024;

pub struct EncoderFilter {
    capability: CodecCapability,
    session: Box<dyn CodecSession>,
    allocator: Arc<BufferAllocator>,
    /// Give up the codec's extra-buffer margin when allocating, to conserve
    /// pool memory.
    conserve_memory: bool,
    done_cb: Option<DoneCb>,
    link: Option<StageLink>,
    output_info: Option<OutputInfo>,
    /// Highest output-buffer requirement observed so far; the codec may
    /// only report (or revise) it after setup.
    req_out_buf_count: u32,
    /// Consecutive failed allocation attempts since the last success.
    alloc_retry_count: u32,
    /// Allocation retry tasks currently on the stage queue.
    fills_in_flight: Arc<AtomicU32>,
    pending_csd: Option<Arc<Buffer>>,
    submitted_inputs: HashMap<u64, Arc<Buffer>>,
    queued_outputs: HashMap<i64, Arc<Buffer>>,
    next_input_id: u64,
}

impl EncoderFilter {
    pub fn new(
        capability: CodecCapability,
        session: Box<dyn CodecSession>,
        allocator: Arc<BufferAllocator>,
        conserve_memory: bool,
    ) -> Self {
        Self {
            capability,
            session,
            allocator,
            conserve_memory,
            done_cb: None,
            link: None,
            output_info: None,
            req_out_buf_count: 0,
            alloc_retry_count: 0,
            fills_in_flight: Arc::new(AtomicU32::new(0)),
            pending_csd: None,
            submitted_inputs: HashMap::new(),
            queued_outputs: HashMap::new(),
            next_input_id: 0,
        }
    }

    pub fn set_done_cb(&mut self, done_cb: DoneCb) {
        self.done_cb = Some(done_cb);
    }

    fn emit(&mut self, done: WorkDone) {
        if let Some(cb) = &self.done_cb {
            (*cb.lock().unwrap())(done);
        }
    }

    fn output_buffer_size(&self) -> usize {
        let area = self
            .output_info
            .map(|info| info.resolution.get_area())
            .unwrap_or_default();
        if self.capability.secure {
            // Protected sessions cannot be probed for their fill level, so
            // size for a worst-case uncompressed frame.
            std::cmp::max(area * 3 / 2, 2 * MIN_OUT_BUFFER_SIZE)
        } else {
            std::cmp::max(area / 2, MIN_OUT_BUFFER_SIZE)
        }
    }

    /// How many more output buffers the codec needs beyond what is already
    /// outstanding or about to be retried.
    fn check_need_more_buffer(&self) -> u32 {
        let required = std::cmp::max(self.req_out_buf_count, self.session.req_out_buf_count());
        let in_flight = self.fills_in_flight.load(Ordering::Acquire);
        if required == 0 {
            // Requirement not yet known; one buffer keeps the session able
            // to make progress.
            return u32::from(self.session.out_buf_count() == 0 && in_flight == 0);
        }
        let margin = if self.conserve_memory { self.session.extra_buf_num() } else { 0 };
        required
            .saturating_sub(margin)
            .saturating_sub(self.session.out_buf_count())
            .saturating_sub(in_flight)
    }

    fn post_fill_retry(&mut self) {
        match &self.link {
            Some(link) => {
                self.fills_in_flight.fetch_add(1, Ordering::AcqRel);
                link.post_delayed(FilterWork::FillOutputBuffer, WAIT_ALLOC_TIME);
            }
            None => log::warn!("encoder: no stage link to schedule an allocation retry"),
        }
    }

    /// Allocates one output buffer and hands it to the codec's output
    /// queue. Returns `Ok(false)` when this fill round should stop: the
    /// pool is pressured (a retry task was scheduled if one was needed) or
    /// the attempt failed in a way that only loses this round.
    fn alloc_out_buffer(&mut self) -> Result<bool, FilterError> {
        let Some(output_info) = self.output_info else {
            return Err(FilterError::BadState);
        };

        let usage = if self.capability.secure {
            USAGE_PROTECTED
        } else {
            USAGE_CPU_READ | USAGE_CPU_WRITE
        };
        let mut arg = AllocArg::new(self.output_buffer_size(), usage);
        arg.count_hint = std::cmp::max(self.req_out_buf_count, output_info.req_out_buf_count);

        let image = ImageInfo::new(PixelFormat::NV12, output_info.resolution);
        match self.allocator.alloc(&arg, image) {
            Ok(buffer) => {
                self.alloc_retry_count = 0;
                let info = BufferInfo::for_output(&buffer);
                let fd = info.planes[0].fd;
                self.queued_outputs.insert(fd, buffer);
                if let Err(err) = self.session.queue_output(info) {
                    log::error!("encoder: failed to queue output buffer: {}", err);
                    self.queued_outputs.remove(&fd);
                    return Ok(false);
                }
                Ok(true)
            }
            Err(AllocError::TryAgain) => {
                if self.check_need_more_buffer() > 0 {
                    let required_known =
                        std::cmp::max(self.req_out_buf_count, self.session.req_out_buf_count())
                            > 0;
                    if required_known {
                        if self.alloc_retry_count >= MAX_ALLOC_RETRY_COUNT {
                            // Resource starved; pause instead of storming
                            // the pool. The next fill cycle tries afresh.
                            log::warn!(
                                "encoder: output allocation starved after {} attempts",
                                self.alloc_retry_count
                            );
                            return Ok(false);
                        }
                        self.alloc_retry_count += 1;
                    }
                    if self.fills_in_flight.load(Ordering::Acquire) == 0 {
                        self.post_fill_retry();
                    }
                }
                Ok(false)
            }
            Err(err) => {
                // Only this allocation round is lost; the pipeline goes on.
                log::error!("encoder: output buffer allocation failed: {}", err);
                Ok(false)
            }
        }
    }

    fn fill_out_buffers(&mut self) -> Result<(), FilterError> {
        // The codec may consume a queued buffer while we fill (e.g. to emit
        // its codec-specific data), so the need is recomputed as we go.
        while self.check_need_more_buffer() > 0 {
            if !self.alloc_out_buffer()? {
                break;
            }
        }
        Ok(())
    }

    fn poll_completions(&mut self) -> Result<(), FilterError> {
        while let Some(work) = self.session.dequeue()? {
            self.process_done(work)?;
        }
        Ok(())
    }

    /// Handles one completed (input, output) pair from the codec.
    fn process_done(&mut self, work: CompletedWork) -> Result<(), FilterError> {
        self.req_out_buf_count =
            std::cmp::max(self.req_out_buf_count, work.output.req_out_buf_count);

        let output = self.queued_outputs.remove(&work.output.fd);

        let Some(input_id) = work.input_id else {
            if work.output.flags & FRAME_FLAG_CODEC_SPECIFIC_DATA != 0 {
                // Codec-specific data has no paired input; hold it until
                // the next real output is available.
                let csd = output.ok_or(FilterError::InvalidInput)?;
                if self.pending_csd.is_some() {
                    return Err(FilterError::CsdOverrun);
                }
                csd.set_data_len(work.output.data_size);
                csd.set_flags(FRAME_FLAG_CODEC_SPECIFIC_DATA);
                self.pending_csd = Some(csd);
                return Ok(());
            }
            log::debug!("encoder: completed output has no matching input");
            return Err(FilterError::InvalidInput);
        };

        let input =
            self.submitted_inputs.remove(&input_id).ok_or(FilterError::InvalidInput)?;

        // Ordering guarantee: stashed codec-specific data precedes the
        // first real frame's payload in the emitted work.
        let csd = self.pending_csd.take();

        if let Some(qp) = work.output.average_qp {
            input.params().push(FilterParam {
                target: FilterTarget::Component,
                param: Param::AverageQp(qp),
            });
        }

        if let Some(out) = &output {
            let mut image = work.output.image;
            image.flags = work.output.flags;
            out.set_image(image);
            out.set_data_len(work.output.data_size);
        }

        let eos = work.output.flags & FRAME_FLAG_END_OF_STREAM != 0;
        self.emit(WorkDone { input: Some(input), output, csd, eos });
        Ok(())
    }
}

impl Filter for EncoderFilter {
    fn name(&self) -> &'static str {
        "codec-enc"
    }

    fn bind(&mut self, link: StageLink) {
        self.link = Some(link);
    }

    fn on_apply_config(&mut self, params: Vec<Param>) {
        for param in params {
            let index = param.index();
            if !self.capability.recognizes(index) {
                log::debug!(
                    "encoder: {:?} is not recognized for {:?}, dropping",
                    index,
                    self.capability.coded
                );
                continue;
            }
            if let Err(err) = self.session.set_param(&param) {
                // The update is dropped; the codec keeps its prior value.
                log::debug!("encoder: failed to apply {:?}: {}", index, err);
            }
        }
    }

    fn on_process(&mut self, buffer: Arc<Buffer>) -> Result<(), FilterError> {
        let mut input_info = BufferInfo::from_buffer(&buffer)?;

        if self.output_info.is_none() {
            let info = self.session.setup(&input_info)?;
            log::debug!(
                "encoder: session configured, output {}x{}, {} buffers required",
                info.resolution.width,
                info.resolution.height,
                info.req_out_buf_count
            );
            self.output_info = Some(info);
            self.req_out_buf_count =
                std::cmp::max(self.req_out_buf_count, info.req_out_buf_count);
            self.fill_out_buffers()?;
        }

        let input_id = self.next_input_id;
        self.next_input_id += 1;
        input_info.id = Some(input_id);
        self.submitted_inputs.insert(input_id, buffer);
        if let Err(err) = self.session.queue_input(input_info) {
            self.submitted_inputs.remove(&input_id);
            return Err(err.into());
        }

        // Keep the codec's output queue topped up, then surface whatever
        // already completed.
        self.fill_out_buffers()?;
        self.poll_completions()
    }

    fn on_fill_out_buffers(&mut self) -> Result<(), FilterError> {
        // This retry task is no longer in flight.
        let _ = self.fills_in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            v.checked_sub(1)
        });
        if self.output_info.is_none() {
            // Flushed or stopped while the retry was pending.
            return Ok(());
        }
        self.fill_out_buffers()
    }

    fn on_poll(&mut self) -> Result<(), FilterError> {
        if self.output_info.is_none() {
            return Ok(());
        }
        self.poll_completions()
    }

    fn on_drain(&mut self) -> Result<(), FilterError> {
        if self.output_info.is_some() {
            self.poll_completions()?;
            self.session.flush()?;
            self.poll_completions()?;
        }
        self.emit(WorkDone { input: None, output: None, csd: None, eos: true });
        Ok(())
    }

    fn on_flush(&mut self) -> Result<(), FilterError> {
        if self.output_info.is_some() {
            self.session.flush()?;
        }
        self.submitted_inputs.clear();
        self.queued_outputs.clear();
        self.pending_csd = None;
        self.alloc_retry_count = 0;
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), FilterError> {
        if self.output_info.is_some() {
            self.session.flush()?;
        }
        self.submitted_inputs.clear();
        self.queued_outputs.clear();
        self.pending_csd = None;
        self.alloc_retry_count = 0;
        self.output_info = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::allocator::Block;
    use crate::allocator::BlockPool;
    use crate::allocator::PoolError;
    use crate::backend::dummy::DummyEncoderSession;
    use crate::backend::dummy::HeapBlockPool;
    use crate::backend::OutputDesc;
    use crate::buffer::FRAME_FLAG_REPLICA;
    use crate::filter::FilterStage;
    use crate::params::FilterId;
    use crate::plane_sizes;
    use crate::Resolution;

    fn collector() -> (DoneCb, Arc<Mutex<Vec<WorkDone>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        (
            Arc::new(Mutex::new(move |done: WorkDone| sink.lock().unwrap().push(done))),
            collected,
        )
    }

    struct Harness {
        stage: FilterStage<EncoderFilter>,
        session: DummyEncoderSession,
        collected: Arc<Mutex<Vec<WorkDone>>>,
    }

    fn harness_with(
        capability: CodecCapability,
        req_out: u32,
        pool_capacity: u32,
        conserve_memory: bool,
    ) -> Harness {
        let session = DummyEncoderSession::new(req_out, 1);
        let allocator = Arc::new(BufferAllocator::new(Arc::new(HeapBlockPool::new(pool_capacity))));
        let mut filter =
            EncoderFilter::new(capability, Box::new(session.clone()), allocator, conserve_memory);
        let (done_cb, collected) = collector();
        filter.set_done_cb(done_cb);
        Harness { stage: FilterStage::new(FilterId(1), filter), session, collected }
    }

    fn harness(req_out: u32, pool_capacity: u32) -> Harness {
        harness_with(CodecCapability::h264(false), req_out, pool_capacity, false)
    }

    fn input_frame(width: u32, height: u32) -> Arc<Buffer> {
        let image = ImageInfo::new(PixelFormat::NV12, Resolution { width, height });
        let size: usize = plane_sizes(image.format, width, height, image.stride).iter().sum();
        let block = Block { id: 1000, size, data: Arc::new(Mutex::new(vec![0; size])) };
        let buffer = Arc::new(Buffer::new(block, image));
        buffer.set_data_len(size);
        buffer
    }

    #[test]
    fn test_first_work_item_carries_csd_exactly_once() {
        let h = harness(4, 32);

        h.stage.with_filter(|f| {
            f.on_process(input_frame(64, 64)).unwrap();
            f.on_process(input_frame(64, 64)).unwrap();
        });

        let collected = h.collected.lock().unwrap();
        assert_eq!(collected.len(), 2);

        let first = &collected[0];
        let csd = first.csd.as_ref().expect("first frame must carry the stashed CSD");
        assert!(csd.is_csd());
        assert_eq!(csd.data_len(), crate::backend::dummy::DUMMY_CSD_SIZE);
        assert!(first.input.is_some());
        // 64x64 coded payload from the dummy session.
        assert_eq!(first.output.as_ref().unwrap().data_len(), 256);

        // The pending slot is empty afterwards.
        assert!(collected[1].csd.is_none());
        assert!(collected[1].input.is_some());
    }

    #[test]
    fn test_average_qp_is_reported_to_the_component() {
        let h = harness(4, 32);
        h.stage.with_filter(|f| f.on_process(input_frame(64, 64)).unwrap());

        let collected = h.collected.lock().unwrap();
        let input = collected[0].input.as_ref().unwrap();
        let reported = input.params().drain_for(FilterTarget::Component);
        assert_eq!(reported, vec![Param::AverageQp(26)]);
    }

    #[test]
    fn test_csd_without_input_emits_no_work() {
        let h = harness(4, 32);
        h.stage.with_filter(|f| {
            // Configure and fill without submitting an input.
            let info = BufferInfo::from_buffer(&input_frame(64, 64)).unwrap();
            f.output_info = Some(f.session.setup(&info).unwrap());
            f.fill_out_buffers().unwrap();
            f.poll_completions().unwrap();
            assert!(f.pending_csd.is_some());
        });
        assert!(h.collected.lock().unwrap().is_empty());
    }

    #[test]
    fn test_second_pending_csd_is_an_error() {
        let h = harness(4, 32);
        h.stage.with_filter(|f| {
            let info = BufferInfo::from_buffer(&input_frame(64, 64)).unwrap();
            f.output_info = Some(f.session.setup(&info).unwrap());

            let csd_work = |fd: i64| CompletedWork {
                input_id: None,
                output: OutputDesc {
                    fd,
                    image: ImageInfo::new(
                        PixelFormat::NV12,
                        Resolution { width: 64, height: 64 },
                    ),
                    data_size: 12,
                    flags: FRAME_FLAG_CODEC_SPECIFIC_DATA,
                    average_qp: None,
                    req_out_buf_count: 4,
                },
            };

            for fd in [90i64, 91] {
                let block =
                    Block { id: fd as u64, size: 256, data: Arc::new(Mutex::new(vec![0; 256])) };
                let image =
                    ImageInfo::new(PixelFormat::NV12, Resolution { width: 64, height: 64 });
                f.queued_outputs.insert(fd, Arc::new(Buffer::new(block, image)));
            }

            assert!(f.process_done(csd_work(90)).is_ok());
            assert!(matches!(f.process_done(csd_work(91)), Err(FilterError::CsdOverrun)));
            // The first CSD is still the one pending.
            assert_eq!(f.pending_csd.as_ref().unwrap().block().id, 90);
        });
    }

    #[test]
    fn test_completion_without_input_or_csd_is_invalid() {
        let h = harness(4, 32);
        h.stage.with_filter(|f| {
            let info = BufferInfo::from_buffer(&input_frame(64, 64)).unwrap();
            f.output_info = Some(f.session.setup(&info).unwrap());
            let work = CompletedWork {
                input_id: None,
                output: OutputDesc {
                    fd: 1,
                    image: ImageInfo::new(
                        PixelFormat::NV12,
                        Resolution { width: 64, height: 64 },
                    ),
                    data_size: 100,
                    flags: 0,
                    average_qp: None,
                    req_out_buf_count: 4,
                },
            };
            assert!(matches!(f.process_done(work), Err(FilterError::InvalidInput)));
        });
    }

    #[test]
    fn test_no_more_buffers_needed_when_requirement_met() {
        let h = harness(5, 32);
        h.stage.with_filter(|f| {
            let info = BufferInfo::from_buffer(&input_frame(64, 64)).unwrap();
            f.output_info = Some(f.session.setup(&info).unwrap());
            f.req_out_buf_count = 5;
            f.fill_out_buffers().unwrap();
            // The dummy consumed one queued buffer for its CSD; the fill
            // loop keeps allocating until five are outstanding.
            assert_eq!(f.session.out_buf_count(), 5);
            assert_eq!(f.fills_in_flight.load(Ordering::Acquire), 0);
            assert_eq!(f.check_need_more_buffer(), 0);
        });
    }

    #[test]
    fn test_conserve_memory_reduces_requirement() {
        // extra_buf_num is 1 in the harness session.
        let h = harness_with(CodecCapability::h264(false), 5, 32, true);
        h.stage.with_filter(|f| {
            let info = BufferInfo::from_buffer(&input_frame(64, 64)).unwrap();
            f.output_info = Some(f.session.setup(&info).unwrap());
            f.req_out_buf_count = 5;
            f.fill_out_buffers().unwrap();
            assert_eq!(f.session.out_buf_count(), 4);
            assert_eq!(f.check_need_more_buffer(), 0);
        });
    }

    #[test]
    fn test_try_again_bumps_retry_counter_and_schedules_one_retry() {
        // Five blockers hold the whole pool: every allocation fails with
        // TryAgain until they are released.
        let pool = Arc::new(HeapBlockPool::new(5));
        let allocator = Arc::new(BufferAllocator::new(pool));
        let blocker_image = ImageInfo::new(PixelFormat::NV12, Resolution { width: 2, height: 2 });
        let blockers: Vec<_> = (0..5)
            .map(|_| allocator.alloc(&AllocArg::new(16, USAGE_CPU_WRITE), blocker_image).unwrap())
            .collect();

        let session = DummyEncoderSession::new(4, 1);
        let mut filter = EncoderFilter::new(
            CodecCapability::h264(false),
            Box::new(session.clone()),
            allocator.clone(),
            false,
        );
        let (done_cb, _collected) = collector();
        filter.set_done_cb(done_cb);
        let stage = FilterStage::new(FilterId(1), filter);

        stage.with_filter(|f| {
            let info = BufferInfo::from_buffer(&input_frame(320, 240)).unwrap();
            f.output_info = Some(f.session.setup(&info).unwrap());

            // One exhausted attempt: TryAgain, counter bumped by one,
            // nothing enqueued to the codec, one retry scheduled.
            assert!(!f.alloc_out_buffer().unwrap());
            assert_eq!(f.alloc_retry_count, 1);
            assert_eq!(f.fills_in_flight.load(Ordering::Acquire), 1);
            assert_eq!(f.session.out_buf_count(), 0);

            // Consecutive retries keep failing: the counter grows but a
            // second retry task is never queued alongside the first.
            for _ in 0..3 {
                f.on_fill_out_buffers().unwrap();
            }
            assert_eq!(f.alloc_retry_count, 4);
            assert_eq!(f.fills_in_flight.load(Ordering::Acquire), 1);

            // A successful allocation resets the counter.
            drop(blockers);
            f.on_fill_out_buffers().unwrap();
            assert_eq!(f.alloc_retry_count, 0);
            assert_eq!(f.session.out_buf_count(), 4);
        });
    }

    #[test]
    fn test_retry_counter_never_exceeds_ceiling() {
        let pool = Arc::new(HeapBlockPool::new(0));
        let allocator = Arc::new(BufferAllocator::new(pool));
        let session = DummyEncoderSession::new(4, 1);
        let mut filter = EncoderFilter::new(
            CodecCapability::h264(false),
            Box::new(session.clone()),
            allocator,
            false,
        );
        let (done_cb, _collected) = collector();
        filter.set_done_cb(done_cb);
        let stage = FilterStage::new(FilterId(1), filter);

        stage.with_filter(|f| {
            f.on_process(input_frame(64, 64)).unwrap();
            for _ in 0..(MAX_ALLOC_RETRY_COUNT * 2) {
                f.on_fill_out_buffers().unwrap();
            }
            assert_eq!(f.alloc_retry_count, MAX_ALLOC_RETRY_COUNT);
        });
    }

    #[test]
    fn test_generic_allocation_failure_is_not_fatal() {
        struct BrokenPool;
        impl BlockPool for BrokenPool {
            fn alloc_block(&self, _size: usize, _usage: u64) -> Result<Block, PoolError> {
                Err(PoolError::Other(anyhow::anyhow!("allocator went away")))
            }
            fn free_block(&self, _block: Block) {}
        }

        let session = DummyEncoderSession::new(4, 1);
        let mut filter = EncoderFilter::new(
            CodecCapability::h264(false),
            Box::new(session.clone()),
            Arc::new(BufferAllocator::new(Arc::new(BrokenPool))),
            false,
        );
        let (done_cb, collected) = collector();
        filter.set_done_cb(done_cb);
        let stage = FilterStage::new(FilterId(1), filter);

        stage.with_filter(|f| {
            // The frame is accepted; only the allocation round is lost.
            f.on_process(input_frame(64, 64)).unwrap();
            assert_eq!(f.alloc_retry_count, 0);
            assert_eq!(f.fills_in_flight.load(Ordering::Acquire), 0);
        });
        assert!(collected.lock().unwrap().is_empty());
    }

    #[test]
    fn test_secure_output_buffers_are_larger() {
        let secure = harness_with(CodecCapability::h264(true), 4, 32, false);
        let plain = harness(4, 32);
        let info = OutputInfo {
            resolution: Resolution { width: 320, height: 240 },
            req_out_buf_count: 4,
        };
        let secure_size = secure.stage.with_filter(|f| {
            f.output_info = Some(info);
            f.output_buffer_size()
        });
        let plain_size = plain.stage.with_filter(|f| {
            f.output_info = Some(info);
            f.output_buffer_size()
        });
        assert!(secure_size > plain_size);
    }

    #[test]
    fn test_replica_end_of_stream_flow() {
        let h = harness(4, 32);
        h.stage.with_filter(|f| {
            f.on_process(input_frame(64, 64)).unwrap();

            let marker = input_frame(64, 64);
            marker.set_flags(FRAME_FLAG_REPLICA | FRAME_FLAG_END_OF_STREAM);
            marker.set_data_len(0);
            f.on_process(marker).unwrap();
        });

        let collected = h.collected.lock().unwrap();
        assert_eq!(collected.len(), 2);
        let last = &collected[1];
        assert!(last.eos);
        assert_eq!(last.output.as_ref().unwrap().data_len(), 0);
    }

    #[test]
    fn test_unrecognized_and_untranslatable_params_are_dropped() {
        let h = harness_with(CodecCapability::vp8(false), 4, 32, false);
        h.stage.with_filter(|f| {
            f.on_apply_config(vec![
                Param::SliceSize(1500),  // not recognized for VP8
                Param::Bitrate(900_000), // recognized and applied
                Param::AverageQp(30),    // recognized but untranslatable
            ]);
        });
        let recorded = h.session.recorded_params();
        assert_eq!(recorded, vec![Param::Bitrate(900_000)]);
    }

    #[test]
    fn test_flush_clears_in_flight_state() {
        let h = harness(4, 32);
        h.stage.with_filter(|f| {
            let info = BufferInfo::from_buffer(&input_frame(64, 64)).unwrap();
            f.output_info = Some(f.session.setup(&info).unwrap());
            f.fill_out_buffers().unwrap();
            f.poll_completions().unwrap();
            assert!(f.pending_csd.is_some());
            assert!(!f.queued_outputs.is_empty());

            f.on_flush().unwrap();
            assert!(f.pending_csd.is_none());
            assert!(f.queued_outputs.is_empty());
            assert_eq!(f.alloc_retry_count, 0);
            // The session itself survives a flush.
            assert!(f.output_info.is_some());
        });
    }
}
