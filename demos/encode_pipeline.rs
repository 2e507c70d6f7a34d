// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs a CSC -> encoder chain over synthetic frames using the software
//! stand-in backends, printing every completed work item.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use argh::FromArgs;

use c2_filters::allocator::AllocArg;
use c2_filters::allocator::USAGE_CPU_READ;
use c2_filters::allocator::USAGE_CPU_WRITE;
use c2_filters::backend::dummy::DummyEncoderSession;
use c2_filters::backend::dummy::DummyScaler;
use c2_filters::backend::dummy::HeapBlockPool;
use c2_filters::buffer::ImageInfo;
use c2_filters::filter::WorkDone;
use c2_filters::params::Param;
use c2_filters::pipeline::Pipeline;
use c2_filters::pipeline::PipelineConfig;
use c2_filters::plane_sizes;
use c2_filters::CodedFormat;
use c2_filters::PixelFormat;
use c2_filters::Resolution;

/// Synthetic encode pipeline demo
#[derive(Debug, FromArgs)]
struct Args {
    /// input frames width
    #[argh(option, default = "320")]
    width: u32,

    /// input frames height
    #[argh(option, default = "240")]
    height: u32,

    /// number of frames to encode
    #[argh(option, default = "10")]
    count: u32,

    /// target bitrate in bits per second
    #[argh(option, default = "512000")]
    bitrate: u32,

    /// coded format to produce (h264, h263, mpeg4, vp8, vp9)
    #[argh(option, default = "String::from(\"h264\")")]
    codec: String,

    /// scale the stream down to half resolution mid-way
    #[argh(switch)]
    rescale: bool,
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();
    let coded = CodedFormat::from_str(&args.codec).expect("unsupported codec");

    let done: Arc<Mutex<Vec<WorkDone>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let done = done.clone();
        Arc::new(Mutex::new(move |work: WorkDone| done.lock().unwrap().push(work)))
    };

    let mut pipeline = Pipeline::new(
        PipelineConfig::encode(coded),
        Box::new(DummyEncoderSession::new(4, 1)),
        Some(Box::new(DummyScaler::new())),
        Arc::new(HeapBlockPool::new(64)),
        sink,
    )
    .expect("error building pipeline");
    pipeline.start().expect("error starting pipeline");
    pipeline.configure(vec![Param::Bitrate(args.bitrate), Param::Framerate(30)]);

    let image =
        ImageInfo::new(PixelFormat::NV12, Resolution { width: args.width, height: args.height });
    let frame_size: usize =
        plane_sizes(image.format, args.width, args.height, image.stride).iter().sum();

    for index in 0..args.count {
        if args.rescale && index == args.count / 2 {
            pipeline.configure(vec![Param::ScaleSize(Resolution {
                width: args.width / 2,
                height: args.height / 2,
            })]);
        }

        let buffer = pipeline
            .allocator()
            .alloc(&AllocArg::new(frame_size, USAGE_CPU_READ | USAGE_CPU_WRITE), image)
            .expect("error allocating input frame");
        {
            let block = buffer.block();
            let mut data = block.data.lock().unwrap();
            data.fill((index % 256) as u8);
        }
        buffer.set_data_len(frame_size);
        pipeline.queue(buffer).expect("error queueing frame");
    }

    pipeline.drain().expect("error draining pipeline");

    let deadline = Instant::now() + Duration::from_secs(10);
    while !done.lock().unwrap().iter().any(|work| work.eos) {
        assert!(Instant::now() < deadline, "pipeline did not drain in time");
        std::thread::sleep(Duration::from_millis(5));
    }

    for (index, work) in done.lock().unwrap().iter().enumerate() {
        if work.eos && work.output.is_none() {
            println!("[{index}] end of stream");
            continue;
        }
        let output = work.output.as_ref().unwrap();
        let image = output.image();
        println!(
            "[{index}] {}x{} coded={} bytes csd={} key={}",
            image.width,
            image.height,
            output.data_len(),
            work.csd.as_ref().map(|csd| csd.data_len()).unwrap_or(0),
            output.has_flags(c2_filters::buffer::FRAME_FLAG_KEY_FRAME),
        );
    }

    pipeline.stop().expect("error stopping pipeline");
    for error in pipeline.take_errors() {
        eprintln!("stage error: {error}");
    }
}
