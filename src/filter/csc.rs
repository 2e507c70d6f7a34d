// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Color-space-convert filter stage.
//!
//! Crops, positions, scales and reformats one input frame into one output
//! frame using a hardware scaler owned exclusively by this filter.
//! Configuration arrives through the buffer's parameter bag and is applied
//! to the scaler only when it actually changes; reapplying identical values
//! never reaches the hardware.

use std::sync::Arc;

use crate::allocator::AllocArg;
use crate::allocator::AllocError;
use crate::allocator::BufferAllocator;
use crate::allocator::USAGE_CPU_READ;
use crate::allocator::USAGE_CPU_WRITE;
use crate::backend::ScalerConfig;
use crate::backend::ScalerSession;
use crate::buffer::Buffer;
use crate::buffer::BufferInfo;
use crate::buffer::ImageInfo;
use crate::buffer::FRAME_FLAG_END_OF_STREAM;
use crate::filter::Filter;
use crate::filter::FilterError;
use crate::filter::FilterWork;
use crate::filter::StageLink;
use crate::filter::WorkDone;
use crate::filter::DoneCb;
use crate::filter::POLL_INTERVAL;
use crate::params::Param;
use crate::plane_sizes;
use crate::PixelFormat;
use crate::Rect;
use crate::Resolution;

pub struct CscFilter {
    scaler: Box<dyn ScalerSession>,
    allocator: Arc<BufferAllocator>,
    /// Requested values; zero-sized rects and resolutions mean "follow the
    /// source frame".
    config: ScalerConfig,
    /// Last configuration actually applied to the scaler.
    applied: Option<ScalerConfig>,
    done_cb: Option<DoneCb>,
    link: Option<StageLink>,
}

impl CscFilter {
    pub fn new(scaler: Box<dyn ScalerSession>, allocator: Arc<BufferAllocator>) -> Self {
        Self {
            scaler,
            allocator,
            config: ScalerConfig {
                src_crop: Rect::default(),
                dst_pos: Rect::default(),
                dst_size: Resolution::default(),
                dst_format: PixelFormat::NV12,
                aspects: Default::default(),
            },
            applied: None,
            done_cb: None,
            link: None,
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

    /// Resolves the requested configuration against one source frame.
    fn effective_config(&self, image: &ImageInfo) -> ScalerConfig {
        let src_crop =
            if self.config.src_crop.size().get_area() == 0 { image.crop } else { self.config.src_crop };
        let dst_size = if self.config.dst_size.get_area() == 0 {
            src_crop.size()
        } else {
            self.config.dst_size
        };
        let dst_pos = if self.config.dst_pos.size().get_area() == 0 {
            Rect::from_resolution(dst_size)
        } else {
            self.config.dst_pos
        };
        ScalerConfig {
            src_crop,
            dst_pos,
            dst_size,
            dst_format: self.config.dst_format,
            aspects: self.config.aspects,
        }
    }
}

impl Filter for CscFilter {
    fn name(&self) -> &'static str {
        "csc"
    }

    fn bind(&mut self, link: StageLink) {
        self.link = Some(link);
    }

    fn on_apply_config(&mut self, params: Vec<Param>) {
        for param in params {
            match param {
                Param::InputCrop(rect) => self.config.src_crop = rect,
                Param::OutputPosition(rect) => self.config.dst_pos = rect,
                Param::ScaleSize(size) => self.config.dst_size = size,
                Param::OutputFormat(format) => self.config.dst_format = format,
                Param::ColorAspects(aspects) => self.config.aspects = aspects,
                other => {
                    log::debug!("csc: dropping config update {:?}", other.index());
                }
            }
        }
    }

    fn on_process(&mut self, buffer: Arc<Buffer>) -> Result<(), FilterError> {
        let image = buffer.image();

        // An empty marker has nothing to convert; pass it along untouched.
        if buffer.is_replica() || buffer.data_len() == 0 && buffer.is_eos() {
            let eos = buffer.is_eos();
            self.emit(WorkDone { input: None, output: Some(buffer), csd: None, eos });
            return Ok(());
        }

        let config = self.effective_config(&image);
        if self.applied.as_ref() != Some(&config) {
            self.scaler.configure(&config)?;
            self.applied = Some(config.clone());
        }

        let dst_resolution = config.dst_size;
        let mut dst_image = ImageInfo::new(config.dst_format, dst_resolution);
        dst_image.crop = config.dst_pos;
        dst_image.flags = image.flags;
        let dst_bytes: usize = plane_sizes(
            config.dst_format,
            dst_resolution.width,
            dst_resolution.height,
            dst_image.stride,
        )
        .iter()
        .sum();

        let dst = match self
            .allocator
            .alloc(&AllocArg::new(dst_bytes, USAGE_CPU_READ | USAGE_CPU_WRITE), dst_image)
        {
            Ok(dst) => dst,
            Err(AllocError::TryAgain) => {
                // Transient pressure; put the frame back on our own queue.
                log::trace!("csc: destination pool exhausted, retrying later");
                match &self.link {
                    Some(link) => link.post_delayed(FilterWork::Frame(buffer), POLL_INTERVAL),
                    None => log::warn!("csc: no stage link, dropping frame under pressure"),
                }
                return Ok(());
            }
            Err(AllocError::InvalidArg) => return Err(FilterError::InvalidInput),
            Err(AllocError::Other(err)) => return Err(FilterError::Other(err)),
        };

        let src_info = BufferInfo::from_buffer(&buffer)?;
        let mut dst_info = BufferInfo::from_buffer(&dst)?;
        self.scaler.run(&src_info, &mut dst_info)?;
        dst.set_data_len(dst_info.data_size());

        // Updates addressed further down the chain ride on the converted
        // frame from here on.
        dst.params().append(&mut buffer.params());

        let eos = image.flags & FRAME_FLAG_END_OF_STREAM != 0;
        self.emit(WorkDone { input: Some(buffer), output: Some(dst), csd: None, eos });
        Ok(())
    }

    fn on_flush(&mut self) -> Result<(), FilterError> {
        self.scaler.flush()?;
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), FilterError> {
        self.scaler.stop()?;
        Ok(())
    }

    fn on_drain(&mut self) -> Result<(), FilterError> {
        self.emit(WorkDone { input: None, output: None, csd: None, eos: true });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::backend::dummy::DummyScaler;
    use crate::backend::dummy::HeapBlockPool;
    use crate::buffer::FRAME_FLAG_REPLICA;
    use crate::filter::FilterStage;
    use crate::params::FilterId;

    fn collector() -> (DoneCb, Arc<Mutex<Vec<WorkDone>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        (
            Arc::new(Mutex::new(move |done: WorkDone| sink.lock().unwrap().push(done))),
            collected,
        )
    }

    fn filter_under_test(
        pool_capacity: u32,
    ) -> (FilterStage<CscFilter>, DummyScaler, Arc<Mutex<Vec<WorkDone>>>, Arc<BufferAllocator>)
    {
        let allocator = Arc::new(BufferAllocator::new(Arc::new(HeapBlockPool::new(pool_capacity))));
        let scaler = DummyScaler::new();
        let mut filter = CscFilter::new(Box::new(scaler.clone()), allocator.clone());
        let (done_cb, collected) = collector();
        filter.set_done_cb(done_cb);
        (FilterStage::new(FilterId(0), filter), scaler, collected, allocator)
    }

    fn source_frame(allocator: &BufferAllocator, width: u32, height: u32) -> Arc<Buffer> {
        let image = ImageInfo::new(PixelFormat::NV12, Resolution { width, height });
        let size: usize = plane_sizes(image.format, width, height, image.stride).iter().sum();
        let buffer =
            allocator.alloc(&AllocArg::new(size, USAGE_CPU_READ | USAGE_CPU_WRITE), image).unwrap();
        buffer.set_data_len(size);
        buffer
    }

    #[test]
    fn test_identical_config_reaches_scaler_once() {
        let (stage, scaler, collected, allocator) = filter_under_test(8);
        let first = source_frame(&allocator, 64, 64);
        let second = source_frame(&allocator, 64, 64);

        stage.with_filter(|f| {
            f.on_process(first).unwrap();
            f.on_process(second).unwrap();
        });

        assert_eq!(scaler.configure_calls(), 1);
        assert_eq!(scaler.run_calls(), 2);
        assert_eq!(collected.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_config_change_reconfigures_scaler() {
        let (stage, scaler, _collected, allocator) = filter_under_test(8);

        stage.with_filter(|f| {
            f.on_process(source_frame(&allocator, 64, 64)).unwrap();
            f.on_apply_config(vec![Param::ScaleSize(Resolution { width: 32, height: 32 })]);
            f.on_process(source_frame(&allocator, 64, 64)).unwrap();
            // Same values again: no further configure.
            f.on_apply_config(vec![Param::ScaleSize(Resolution { width: 32, height: 32 })]);
            f.on_process(source_frame(&allocator, 64, 64)).unwrap();
        });

        assert_eq!(scaler.configure_calls(), 2);
    }

    #[test]
    fn test_scale_and_reformat_output() {
        let (stage, _scaler, collected, allocator) = filter_under_test(8);

        stage.with_filter(|f| {
            f.on_apply_config(vec![
                Param::ScaleSize(Resolution { width: 32, height: 16 }),
                Param::OutputFormat(PixelFormat::I420),
            ]);
            f.on_process(source_frame(&allocator, 64, 64)).unwrap();
        });

        let collected = collected.lock().unwrap();
        let output = collected[0].output.as_ref().unwrap();
        let image = output.image();
        assert_eq!(image.format, PixelFormat::I420);
        assert_eq!(image.width, 32);
        assert_eq!(image.height, 16);
        let expected: usize = plane_sizes(PixelFormat::I420, 32, 16, 32).iter().sum();
        assert_eq!(output.data_len(), expected);
    }

    #[test]
    fn test_replica_passes_through_unconverted() {
        let (stage, scaler, collected, allocator) = filter_under_test(8);
        let marker = source_frame(&allocator, 64, 64);
        marker.set_flags(FRAME_FLAG_REPLICA | FRAME_FLAG_END_OF_STREAM);

        stage.with_filter(|f| f.on_process(marker).unwrap());

        assert_eq!(scaler.run_calls(), 0);
        let collected = collected.lock().unwrap();
        assert!(collected[0].eos);
        assert!(collected[0].output.as_ref().unwrap().is_replica());
    }

    #[test]
    fn test_pool_pressure_requeues_frame() {
        // Pool of 1: the source frame itself exhausts it.
        let (stage, scaler, collected, allocator) = filter_under_test(1);
        let frame = source_frame(&allocator, 64, 64);

        stage.with_filter(|f| f.on_process(frame).unwrap());

        // No conversion happened and nothing was emitted; the frame went
        // back to the stage queue for a later attempt.
        assert_eq!(scaler.run_calls(), 0);
        assert!(collected.lock().unwrap().is_empty());
    }

    #[test]
    fn test_params_for_other_stages_ride_the_output() {
        let (stage, _scaler, collected, allocator) = filter_under_test(8);
        let frame = source_frame(&allocator, 64, 64);
        frame.params().push(crate::params::FilterParam {
            target: crate::params::FilterTarget::Filter(FilterId(1)),
            param: Param::Bitrate(750_000),
        });

        stage.with_filter(|f| f.on_process(frame).unwrap());

        let collected = collected.lock().unwrap();
        let output = collected[0].output.as_ref().unwrap();
        assert_eq!(output.params().len(), 1);
    }
}
