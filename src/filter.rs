// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Filter stages and their worker-thread runtime.
//!
//! Every stage owns a dedicated worker thread and a work queue; buffers are
//! handed from stage to stage by queue submission, never by direct calls.
//! The worker is woken through an eventfd and additionally polls on a short
//! timeout, since hardware sessions are poll based. All `Filter` callbacks
//! run on the worker thread; `stop` joins the worker and `flush` serializes
//! against an in-flight `on_process` before touching the filter, so neither
//! ever overlaps buffer processing.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::backend::SessionError;
use crate::buffer::Buffer;
use crate::buffer::LayoutError;
use crate::params::FilterId;
use crate::params::FilterTarget;
use crate::params::Param;

pub mod codecs;
pub mod csc;
pub mod encoder;

/// How long the worker sleeps when there is nothing to wake it.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterState {
    Created,
    Started,
    Processing,
    Stopped,
    Flushed,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter is in the wrong state for this operation")]
    BadState,
    #[error("invalid buffer or session reference")]
    InvalidInput,
    #[error("codec-specific data arrived while one was already pending")]
    CsdOverrun,
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Work items submitted to a stage's queue.
pub enum FilterWork {
    Frame(Arc<Buffer>),
    /// Retry an output-buffer allocation that previously got `TryAgain`.
    FillOutputBuffer,
    Drain,
}

/// A completed unit of work reported by a stage.
pub struct WorkDone {
    pub input: Option<Arc<Buffer>>,
    pub output: Option<Arc<Buffer>>,
    /// Codec-specific data that must precede `output`'s payload.
    pub csd: Option<Arc<Buffer>>,
    pub eos: bool,
}

pub type DoneCb = Arc<Mutex<dyn FnMut(WorkDone) + Send + 'static>>;
pub type ErrorCb = Arc<Mutex<dyn FnMut(&FilterError) + Send + 'static>>;

/// Handle a filter uses to submit work to its own stage queue, e.g. the
/// delayed allocation retry task.
#[derive(Clone)]
pub struct StageLink {
    queue: Arc<Mutex<VecDeque<FilterWork>>>,
    delayed: Arc<Mutex<Vec<(Instant, FilterWork)>>>,
    event: Arc<EventFd>,
}

impl StageLink {
    pub fn post(&self, work: FilterWork) {
        self.queue.lock().unwrap().push_back(work);
        let _ = self.event.write(1);
    }

    pub fn post_delayed(&self, work: FilterWork, delay: Duration) {
        self.delayed.lock().unwrap().push((Instant::now() + delay, work));
        // No wakeup needed; the worker polls at least every POLL_INTERVAL.
    }
}

/// One pipeline stage's behavior. All methods run on the stage's worker
/// thread, except `bind` and `on_start` which run before it exists.
pub trait Filter: Send + 'static {
    fn name(&self) -> &'static str;

    /// Receives the link to this filter's own stage queue.
    fn bind(&mut self, link: StageLink) {
        let _ = link;
    }

    fn on_start(&mut self) -> Result<(), FilterError> {
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), FilterError> {
        Ok(())
    }

    fn on_flush(&mut self) -> Result<(), FilterError> {
        Ok(())
    }

    /// Consumes the configuration updates addressed to this stage, in
    /// order, before the buffer they rode in on is processed.
    fn on_apply_config(&mut self, params: Vec<Param>) {
        if !params.is_empty() {
            log::debug!("{}: dropping {} unhandled config updates", self.name(), params.len());
        }
    }

    fn on_process(&mut self, buffer: Arc<Buffer>) -> Result<(), FilterError>;

    fn on_fill_out_buffers(&mut self) -> Result<(), FilterError> {
        Ok(())
    }

    fn on_drain(&mut self) -> Result<(), FilterError> {
        Ok(())
    }

    /// Called once per worker iteration, also on wakeup timeouts.
    fn on_poll(&mut self) -> Result<(), FilterError> {
        Ok(())
    }
}

/// Owns one filter, its worker thread and its work queue.
pub struct FilterStage<F: Filter> {
    id: FilterId,
    filter: Arc<Mutex<F>>,
    state: Arc<Mutex<FilterState>>,
    queue: Arc<Mutex<VecDeque<FilterWork>>>,
    delayed: Arc<Mutex<Vec<(Instant, FilterWork)>>>,
    awaiting_work_event: Arc<EventFd>,
    error_cb: ErrorCb,
    worker: Option<JoinHandle<()>>,
}

impl<F: Filter> FilterStage<F> {
    pub fn new(id: FilterId, mut filter: F) -> Self {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let delayed = Arc::new(Mutex::new(Vec::new()));
        let event = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)
                .expect("failed to create stage eventfd"),
        );
        filter.bind(StageLink {
            queue: queue.clone(),
            delayed: delayed.clone(),
            event: event.clone(),
        });
        Self {
            id,
            filter: Arc::new(Mutex::new(filter)),
            state: Arc::new(Mutex::new(FilterState::Created)),
            queue,
            delayed,
            awaiting_work_event: event,
            error_cb: Arc::new(Mutex::new(|err: &FilterError| {
                log::error!("unhandled stage error: {}", err);
            })),
            worker: None,
        }
    }

    pub fn set_error_cb(&mut self, error_cb: ErrorCb) {
        self.error_cb = error_cb;
    }

    pub(crate) fn link(&self) -> StageLink {
        StageLink {
            queue: self.queue.clone(),
            delayed: self.delayed.clone(),
            event: self.awaiting_work_event.clone(),
        }
    }

    /// Locked access to the filter, for wiring done before start.
    pub fn with_filter<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        f(&mut self.filter.lock().unwrap())
    }

    fn worker_loop(
        id: FilterId,
        filter: Arc<Mutex<F>>,
        state: Arc<Mutex<FilterState>>,
        queue: Arc<Mutex<VecDeque<FilterWork>>>,
        delayed: Arc<Mutex<Vec<(Instant, FilterWork)>>>,
        event: Arc<EventFd>,
        error_cb: ErrorCb,
    ) {
        let epoll = Epoll::new(EpollCreateFlags::empty()).expect("failed to create Epoll");
        epoll
            .add(event.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1))
            .expect("failed to add stage event to Epoll");

        let fail = |err: FilterError| {
            (*error_cb.lock().unwrap())(&err);
            *state.lock().unwrap() = FilterState::Stopped;
        };

        'run: loop {
            if *state.lock().unwrap() == FilterState::Stopped {
                break;
            }

            let mut events = [EpollEvent::empty()];
            let _ = epoll
                .wait(&mut events, EpollTimeout::try_from(POLL_INTERVAL).unwrap())
                .expect("Epoll wait failed");
            if events == [EpollEvent::new(EpollFlags::EPOLLIN, 1)] {
                let _ = event.read();
            }

            // Promote delayed work that has come due.
            {
                let now = Instant::now();
                let mut delayed = delayed.lock().unwrap();
                let mut queue = queue.lock().unwrap();
                let mut i = 0;
                while i < delayed.len() {
                    if delayed[i].0 <= now {
                        queue.push_back(delayed.remove(i).1);
                    } else {
                        i += 1;
                    }
                }
            }

            loop {
                if *state.lock().unwrap() == FilterState::Stopped {
                    break 'run;
                }
                // The filter lock is taken before popping so that flush,
                // which drains the queue and then locks the filter, never
                // races with a frame between pop and process.
                let mut filter = filter.lock().unwrap();
                let work = queue.lock().unwrap().pop_front();
                let Some(work) = work else { break };
                let result = match work {
                    FilterWork::Frame(buffer) => {
                        *state.lock().unwrap() = FilterState::Processing;
                        let params = buffer.params().drain_for(FilterTarget::Filter(id));
                        if !params.is_empty() {
                            filter.on_apply_config(params);
                        }
                        let result = filter.on_process(buffer);
                        let mut state = state.lock().unwrap();
                        if *state == FilterState::Processing {
                            *state = FilterState::Started;
                        }
                        result
                    }
                    FilterWork::FillOutputBuffer => filter.on_fill_out_buffers(),
                    FilterWork::Drain => filter.on_drain(),
                };
                if let Err(err) = result {
                    log::debug!("{}: error processing work: {}", filter.name(), err);
                    drop(filter);
                    fail(err);
                    break 'run;
                }
            }

            let mut filter = filter.lock().unwrap();
            if let Err(err) = filter.on_poll() {
                log::debug!("{}: error polling: {}", filter.name(), err);
                drop(filter);
                fail(err);
                break;
            }
        }
    }

    /// Starts the stage: runs `on_start` and spawns the worker thread.
    pub fn start(&mut self) -> Result<(), FilterError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                FilterState::Created | FilterState::Stopped => {}
                _ => {
                    (*self.error_cb.lock().unwrap())(&FilterError::BadState);
                    return Err(FilterError::BadState);
                }
            }
            self.filter.lock().unwrap().on_start()?;
            *state = FilterState::Started;
        }

        let id = self.id;
        let filter = self.filter.clone();
        let state = self.state.clone();
        let queue = self.queue.clone();
        let delayed = self.delayed.clone();
        let event = self.awaiting_work_event.clone();
        let error_cb = self.error_cb.clone();
        self.worker = Some(thread::spawn(move || {
            Self::worker_loop(id, filter, state, queue, delayed, event, error_cb);
        }));
        Ok(())
    }

    /// Stops the stage: joins the worker, drops queued work and lets the
    /// filter flush its session.
    pub fn stop(&mut self) -> Result<(), FilterError> {
        *self.state.lock().unwrap() = FilterState::Stopped;
        let _ = self.awaiting_work_event.write(1);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.queue.lock().unwrap().clear();
        self.delayed.lock().unwrap().clear();
        self.filter.lock().unwrap().on_stop()
    }

    /// Flushes the stage mid-stream without tearing the worker down.
    /// Returns the queued-but-unprocessed frames.
    pub fn flush(&mut self) -> Result<Vec<Arc<Buffer>>, FilterError> {
        match *self.state.lock().unwrap() {
            FilterState::Started | FilterState::Processing | FilterState::Flushed => {}
            _ => {
                (*self.error_cb.lock().unwrap())(&FilterError::BadState);
                return Err(FilterError::BadState);
            }
        }

        let mut pending = Vec::new();
        for work in self.queue.lock().unwrap().drain(..) {
            if let FilterWork::Frame(buffer) = work {
                pending.push(buffer);
            }
        }
        self.delayed.lock().unwrap().clear();

        // Taking the filter lock serializes with any in-flight on_process.
        self.filter.lock().unwrap().on_flush()?;
        *self.state.lock().unwrap() = FilterState::Flushed;
        Ok(pending)
    }

    /// Submits one buffer. Valid only while the stage is running.
    pub fn queue(&self, buffer: Arc<Buffer>) -> Result<(), FilterError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                FilterState::Started | FilterState::Processing => {}
                FilterState::Flushed => *state = FilterState::Started,
                _ => {
                    (*self.error_cb.lock().unwrap())(&FilterError::BadState);
                    return Err(FilterError::BadState);
                }
            }
        }
        self.link().post(FilterWork::Frame(buffer));
        Ok(())
    }

    /// Signals that no more input is coming; the filter drains its session.
    pub fn drain(&self) -> Result<(), FilterError> {
        match *self.state.lock().unwrap() {
            FilterState::Started | FilterState::Processing => {}
            _ => {
                (*self.error_cb.lock().unwrap())(&FilterError::BadState);
                return Err(FilterError::BadState);
            }
        }
        self.link().post(FilterWork::Drain);
        Ok(())
    }

    pub fn state(&self) -> FilterState {
        *self.state.lock().unwrap()
    }

    pub fn id(&self) -> FilterId {
        self.id
    }
}

impl<F: Filter> Drop for FilterStage<F> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Object-safe stage handle, so a pipeline can hold a heterogeneous chain.
pub trait StageControl: Send {
    fn id(&self) -> FilterId;
    fn start(&mut self) -> Result<(), FilterError>;
    fn stop(&mut self) -> Result<(), FilterError>;
    fn flush(&mut self) -> Result<Vec<Arc<Buffer>>, FilterError>;
    fn queue(&self, buffer: Arc<Buffer>) -> Result<(), FilterError>;
    fn drain(&self) -> Result<(), FilterError>;
    fn state(&self) -> FilterState;
}

impl<F: Filter> StageControl for FilterStage<F> {
    fn id(&self) -> FilterId {
        FilterStage::id(self)
    }

    fn start(&mut self) -> Result<(), FilterError> {
        FilterStage::start(self)
    }

    fn stop(&mut self) -> Result<(), FilterError> {
        FilterStage::stop(self)
    }

    fn flush(&mut self) -> Result<Vec<Arc<Buffer>>, FilterError> {
        FilterStage::flush(self)
    }

    fn queue(&self, buffer: Arc<Buffer>) -> Result<(), FilterError> {
        FilterStage::queue(self, buffer)
    }

    fn drain(&self) -> Result<(), FilterError> {
        FilterStage::drain(self)
    }

    fn state(&self) -> FilterState {
        FilterStage::state(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Block;
    use crate::buffer::ImageInfo;
    use crate::PixelFormat;
    use crate::Resolution;

    fn frame() -> Arc<Buffer> {
        let block = Block { id: 1, size: 16, data: Arc::new(Mutex::new(vec![0; 16])) };
        Arc::new(Buffer::new(
            block,
            ImageInfo::new(PixelFormat::NV12, Resolution { width: 2, height: 2 }),
        ))
    }

    struct CountingFilter {
        processed: Arc<Mutex<u32>>,
        fills: Arc<Mutex<u32>>,
        delay: Duration,
        link: Option<StageLink>,
        retry_once: bool,
    }

    impl CountingFilter {
        fn new() -> (Self, Arc<Mutex<u32>>, Arc<Mutex<u32>>) {
            let processed = Arc::new(Mutex::new(0));
            let fills = Arc::new(Mutex::new(0));
            (
                Self {
                    processed: processed.clone(),
                    fills: fills.clone(),
                    delay: Duration::ZERO,
                    link: None,
                    retry_once: false,
                },
                processed,
                fills,
            )
        }
    }

    impl Filter for CountingFilter {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn bind(&mut self, link: StageLink) {
            self.link = Some(link);
        }

        fn on_process(&mut self, _buffer: Arc<Buffer>) -> Result<(), FilterError> {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            *self.processed.lock().unwrap() += 1;
            if self.retry_once {
                self.retry_once = false;
                self.link
                    .as_ref()
                    .unwrap()
                    .post_delayed(FilterWork::FillOutputBuffer, Duration::from_millis(1));
            }
            Ok(())
        }

        fn on_fill_out_buffers(&mut self) -> Result<(), FilterError> {
            *self.fills.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn wait_for(check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for stage");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_queue_before_start_is_bad_state() {
        let (filter, _, _) = CountingFilter::new();
        let stage = FilterStage::new(FilterId(0), filter);
        assert!(matches!(stage.queue(frame()), Err(FilterError::BadState)));
    }

    #[test]
    fn test_frames_flow_through_worker() {
        let (filter, processed, _) = CountingFilter::new();
        let mut stage = FilterStage::new(FilterId(0), filter);
        stage.start().unwrap();
        for _ in 0..3 {
            stage.queue(frame()).unwrap();
        }
        wait_for(|| *processed.lock().unwrap() == 3);
        stage.stop().unwrap();
        assert_eq!(stage.state(), FilterState::Stopped);
    }

    #[test]
    fn test_delayed_work_is_delivered() {
        let (mut filter, _, fills) = CountingFilter::new();
        filter.retry_once = true;
        let mut stage = FilterStage::new(FilterId(0), filter);
        stage.start().unwrap();
        stage.queue(frame()).unwrap();
        wait_for(|| *fills.lock().unwrap() == 1);
        stage.stop().unwrap();
    }

    #[test]
    fn test_flush_returns_unprocessed_frames() {
        let (mut filter, processed, _) = CountingFilter::new();
        filter.delay = Duration::from_millis(20);
        let mut stage = FilterStage::new(FilterId(0), filter);
        stage.start().unwrap();
        for _ in 0..5 {
            stage.queue(frame()).unwrap();
        }
        let pending = stage.flush().unwrap();
        assert_eq!(stage.state(), FilterState::Flushed);
        // Nothing is lost: every frame was either processed or returned.
        let processed = *processed.lock().unwrap();
        assert_eq!(processed as usize + pending.len(), 5);

        // The stage accepts new work after a flush.
        stage.queue(frame()).unwrap();
        stage.stop().unwrap();
    }

    #[test]
    fn test_restart_after_stop() {
        let (filter, processed, _) = CountingFilter::new();
        let mut stage = FilterStage::new(FilterId(0), filter);
        stage.start().unwrap();
        stage.stop().unwrap();
        stage.start().unwrap();
        stage.queue(frame()).unwrap();
        wait_for(|| *processed.lock().unwrap() == 1);
        stage.stop().unwrap();
    }
}
