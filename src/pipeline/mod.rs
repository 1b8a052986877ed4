//! Encode pipeline orchestration.
//!
//! The producer side loads raw pictures, stages them on the transfer queue
//! and pushes them through the reorder buffer. Frames leave the reorder
//! buffer in encode order and collect in a deferred batch until a batch
//! boundary, where a [`BatchDriver`] runs the remaining stages either inline
//! or on the consumer thread.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pixelforge_pipeline::{
//!     EncodeDevice, EncodePipeline, PipelineConfig, RawLayout, RawYuvSource,
//!     SlidingWindowReferences,
//! };
//!
//! # fn run(device: Arc<dyn EncodeDevice>, parameter_sets: Vec<u8>) -> pixelforge_pipeline::Result<()> {
//! let config = PipelineConfig::h264(1920, 1080)
//!     .with_total_frames(300)
//!     .with_b_frames(2);
//! let references = SlidingWindowReferences::new(Arc::clone(&device), &config, parameter_sets)?;
//! let source = RawYuvSource::new(std::fs::File::open("input.yuv")?, RawLayout::Planar);
//! let sink = std::fs::File::create("output.h264")?;
//!
//! let mut pipeline = EncodePipeline::new(device, config, source, references, sink)?;
//! pipeline.encode_all()?;
//! # Ok(())
//! # }
//! ```

mod batch;
mod stages;
mod worker;

pub use batch::{BatchDriver, Stage, StageRunner};
pub use worker::{BoundedQueue, PushError};

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{video_format, PipelineConfig, RateControlParams};
use crate::control::ControlCoalescer;
use crate::device::{
    BitstreamBufferResource, CommandBufferResource, EncodeDevice, ImageDescriptor, ImageResource,
    ImageRole, QueueKind,
};
use crate::error::{PipelineError, Result};
use crate::frame::{DeferredBatch, FrameStatePool, FrameState};
use crate::gop::GopStructure;
use crate::pool::ResourcePool;
use crate::references::ReferenceManager;
use crate::reorder::FrameReorderBuffer;
use crate::source::FrameSource;
use crate::temporal::TemporalLayers;
use stages::StageState;
use worker::BatchWorker;

/// Every resource pool a frame draws from.
struct Pools {
    staging: ResourcePool<ImageResource>,
    encode_input: ResourcePool<ImageResource>,
    qp_staging: Option<ResourcePool<ImageResource>>,
    qp_map: Option<ResourcePool<ImageResource>>,
    input_commands: ResourcePool<CommandBufferResource>,
    /// Only present for linear quantization maps.
    qp_commands: Option<ResourcePool<CommandBufferResource>>,
    encode_commands: ResourcePool<CommandBufferResource>,
    bitstream: ResourcePool<BitstreamBufferResource>,
}

impl Pools {
    fn new(device: &Arc<dyn EncodeDevice>, config: &PipelineConfig) -> Result<Self> {
        let capabilities = device.capabilities();
        let in_flight = config.num_input_images_in_flight as usize;
        let format = video_format(config.pixel_format, config.bit_depth);
        let picture = |role: ImageRole, linear: bool| ImageDescriptor {
            role,
            format,
            extent: config.dimensions.into(),
            pixel_format: config.pixel_format,
            linear,
        };
        let fixed_images = |descriptor: ImageDescriptor| {
            ResourcePool::<ImageResource>::fixed(Arc::clone(device), in_flight, descriptor)
                .map(|pool| pool.with_timeout(config.fence_timeout))
        };
        let fixed_commands = |queue: QueueKind| {
            ResourcePool::<CommandBufferResource>::fixed(Arc::clone(device), in_flight, queue)
                .map(|pool| pool.with_timeout(config.fence_timeout))
        };

        let (qp_staging, qp_map, qp_commands) = match config.qp_map {
            Some(mode) => {
                let texel = capabilities.quantization_map_texel_size;
                let extent = vk::Extent2D {
                    width: config.dimensions.width.div_ceil(texel.width.max(1)),
                    height: config.dimensions.height.div_ceil(texel.height.max(1)),
                };
                let qp = |role: ImageRole, linear: bool| ImageDescriptor {
                    role,
                    format: mode.format(),
                    extent,
                    pixel_format: config.pixel_format,
                    linear,
                };
                let linear = capabilities.quantization_map_linear;
                (
                    Some(fixed_images(qp(ImageRole::QpMapStaging, true))?),
                    Some(fixed_images(qp(ImageRole::QpMap, linear))?),
                    if linear {
                        Some(fixed_commands(QueueKind::Transfer)?)
                    } else {
                        None
                    },
                )
            }
            None => (None, None, None),
        };

        Ok(Self {
            staging: fixed_images(picture(ImageRole::Staging, true))?,
            encode_input: fixed_images(picture(ImageRole::EncodeInput, false))?,
            qp_staging,
            qp_map,
            input_commands: fixed_commands(QueueKind::Transfer)?,
            qp_commands,
            encode_commands: fixed_commands(QueueKind::Encode)?,
            bitstream: ResourcePool::growable(
                Arc::clone(device),
                config.bitstream_buffer_preallocate_count as usize,
                config.max_bitstream_buffers as usize,
                config.bitstream_buffer_size,
            )?
            .with_timeout(config.fence_timeout),
        })
    }
}

/// State shared by the producer and the consumer thread.
pub(crate) struct PipelineShared {
    device: Arc<dyn EncodeDevice>,
    pools: Pools,
    frames: FrameStatePool,
    control: Mutex<ControlCoalescer>,
    stage: Mutex<StageState>,
    driver: BatchDriver,
    inline_queries: bool,
    fence_timeout_ns: u64,
    frames_submitted: AtomicU64,
    frames_assembled: AtomicU64,
}

impl PipelineShared {
    fn record_submitted(&self) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_assembled(&self) {
        self.frames_assembled.fetch_add(1, Ordering::Relaxed);
    }
}

/// How a deferred batch is handed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// Keep the batch deferred if the consumer queue is full.
    TryPush,
    /// Wait for room in the consumer queue.
    Blocking,
}

/// Drives frames from a [`FrameSource`] through the encoder into a sink.
pub struct EncodePipeline {
    config: PipelineConfig,
    device: Arc<dyn EncodeDevice>,
    source: Box<dyn FrameSource>,
    shared: Arc<PipelineShared>,
    gop: GopStructure,
    reorder: FrameReorderBuffer,
    deferred: DeferredBatch,
    next_input_order: u64,
    worker: Option<BatchWorker>,
    drained: bool,
}

impl EncodePipeline {
    /// Build the pipeline, checking the configuration against the device.
    ///
    /// Capability problems are reported here and never per frame.
    pub fn new(
        device: Arc<dyn EncodeDevice>,
        mut config: PipelineConfig,
        source: impl FrameSource + 'static,
        references: impl ReferenceManager + 'static,
        sink: impl Write + Send + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let capabilities = device.capabilities().clone();

        if !capabilities.codecs.contains(&config.codec) {
            return Err(PipelineError::Capability(format!(
                "device cannot encode {:?}",
                config.codec
            )));
        }
        if config.qp_map.is_some() && !capabilities.quantization_map {
            return Err(PipelineError::Capability(
                "quantization maps requested but not supported".to_string(),
            ));
        }
        if config.consecutive_b_frames > capabilities.max_b_frames {
            warn!(
                "Clamping consecutive B-frames from {} to the device maximum {}",
                config.consecutive_b_frames, capabilities.max_b_frames
            );
            config.consecutive_b_frames = capabilities.max_b_frames;
        }

        let mut control = ControlCoalescer::new(capabilities.max_quality_levels);
        control.request_reset();
        control.request_quality_level(config.quality_level)?;
        control.request_rate_control(config.rate_control)?;

        let temporal = TemporalLayers::new(config.temporal_layer_count)?;
        let shared = Arc::new(PipelineShared {
            pools: Pools::new(&device, &config)?,
            device: Arc::clone(&device),
            frames: FrameStatePool::new(),
            control: Mutex::new(control),
            stage: Mutex::new(StageState::new(
                temporal,
                Box::new(references),
                Box::new(sink),
            )),
            driver: BatchDriver::from_config(&config),
            inline_queries: capabilities.inline_queries,
            fence_timeout_ns: config.fence_timeout_ns(),
            frames_submitted: AtomicU64::new(0),
            frames_assembled: AtomicU64::new(0),
        });

        let worker = if config.async_processing {
            Some(BatchWorker::spawn(
                Arc::clone(&shared),
                config.max_pending_batches(),
            )?)
        } else {
            None
        };

        info!(
            "Encode pipeline ready: {:?} {}x{}, {} frames, GOP {}, {} B-frames, {} in flight, {:?} driver{}",
            config.codec,
            config.dimensions.width,
            config.dimensions.height,
            config.total_frames,
            config.gop_frame_count,
            config.consecutive_b_frames,
            config.num_input_images_in_flight,
            shared.driver,
            if worker.is_some() { ", async" } else { "" }
        );

        Ok(Self {
            gop: GopStructure::new(
                config.gop_frame_count,
                config.consecutive_b_frames,
                config.idr_period,
            ),
            reorder: FrameReorderBuffer::new(config.consecutive_b_frames),
            config,
            device,
            source: Box::new(source),
            shared,
            deferred: DeferredBatch::new(),
            next_input_order: 0,
            worker,
            drained: false,
        })
    }

    /// The configuration in effect, after clamping to the device.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Load the next raw picture into a staging image.
    pub fn load_next_frame(&mut self) -> Result<FrameState> {
        if self.drained || self.next_input_order >= self.config.total_frames {
            return Err(PipelineError::InvalidInput(format!(
                "all {} frames were already loaded",
                self.config.total_frames
            )));
        }

        let input_order = self.next_input_order;
        let mut frame = self.shared.frames.acquire();
        frame.input_order = input_order;
        frame.is_last = input_order + 1 == self.config.total_frames;
        frame.gop_position = self.gop.get_next_frame(frame.is_last);

        if let Err(err) = self.fill_staging(&mut frame) {
            self.shared.release_frame(frame);
            return Err(err);
        }
        self.next_input_order += 1;
        Ok(frame)
    }

    fn fill_staging(&mut self, frame: &mut FrameState) -> Result<()> {
        let device = &*self.device;
        let staging = self.shared.pools.staging.acquire()?;
        let result = self.source.load_frame(device, frame.input_order, &staging);
        frame.staging = Some(staging);
        result?;

        if let Some(pool) = &self.shared.pools.qp_staging {
            let qp_staging = pool.acquire()?;
            let result = self
                .source
                .load_qp_map(device, frame.input_order, &qp_staging);
            frame.qp_staging = Some(qp_staging);
            result?;
        }
        Ok(())
    }

    /// Stage a loaded frame and queue it for encoding.
    ///
    /// Batches are processed (or handed to the consumer thread) at the end of
    /// each GOP, at the last frame, and whenever the deferred frames would
    /// otherwise exhaust the input pools.
    pub fn enqueue_or_process(&mut self, mut frame: FrameState) -> Result<()> {
        if let Err(err) = self.shared.stage_frame(&mut frame) {
            self.shared.release_frame(frame);
            return Err(err);
        }

        let ready = self.reorder.submit_frame(frame);
        if ready.is_empty() {
            return Ok(());
        }
        let end_of_gop = ready.iter().any(|frame| frame.gop_position.end_of_gop);
        for frame in ready {
            self.deferred.push(frame);
        }

        let needed = self.deferred.len() + self.config.consecutive_b_frames as usize + 1;
        if self.reorder.is_empty() && needed > self.config.num_input_images_in_flight as usize {
            debug!(
                deferred = self.deferred.len(),
                "Dispatching batch at pool capacity"
            );
            self.dispatch(Dispatch::Blocking)
        } else if end_of_gop {
            self.dispatch(Dispatch::TryPush)
        } else {
            Ok(())
        }
    }

    /// Hand the deferred frames to the batch driver.
    fn dispatch(&mut self, mode: Dispatch) -> Result<()> {
        if self.deferred.is_empty() {
            return Ok(());
        }
        let batch = self.deferred.take();
        let Some(worker) = &self.worker else {
            return self.shared.process_batch(batch);
        };

        let pushed = match mode {
            Dispatch::TryPush => worker.queue().push(batch),
            Dispatch::Blocking => worker.queue().push_blocking(batch),
        };
        match pushed {
            Ok(()) => Ok(()),
            Err(PushError::Full(batch)) => {
                debug!(frames = batch.len(), "Consumer queue full, keeping batch deferred");
                self.deferred = batch;
                Ok(())
            }
            Err(PushError::Shutdown(batch)) => {
                self.shared.release_batch(batch);
                Err(self.consumer_error())
            }
        }
    }

    /// Join the consumer and return the error that stopped it.
    fn consumer_error(&mut self) -> PipelineError {
        let result = match self.worker.as_mut() {
            Some(worker) => worker.join(),
            None => Ok(()),
        };
        self.worker = None;
        match result {
            Err(err) => err,
            Ok(()) => PipelineError::QueueClosed("consumer thread stopped".to_string()),
        }
    }

    /// Encode every frame still buffered and wait for all of them.
    pub fn flush_and_drain(&mut self) -> Result<()> {
        if self.drained {
            return Ok(());
        }
        self.drained = true;

        for frame in self.reorder.flush() {
            self.deferred.push(frame);
        }
        let dispatched = self.dispatch(Dispatch::Blocking);
        let joined = match self.worker.take() {
            Some(mut worker) => worker.join(),
            None => Ok(()),
        };
        dispatched?;
        joined?;
        self.device.wait_idle()?;

        info!(
            "Pipeline drained: {} frames submitted, {} assembled",
            self.frames_submitted(),
            self.frames_assembled()
        );
        Ok(())
    }

    /// Load, stage and encode every configured frame, then drain.
    pub fn encode_all(&mut self) -> Result<()> {
        while self.next_input_order < self.config.total_frames {
            let frame = self.load_next_frame()?;
            self.enqueue_or_process(frame)?;
        }
        self.flush_and_drain()
    }

    /// Reset the coding session before the next staged frame.
    pub fn request_reset(&self) {
        self.shared.control.lock().request_reset();
    }

    /// Change the encoder quality level from the next staged frame on.
    pub fn request_quality_level(&self, level: u32) -> Result<()> {
        self.shared.control.lock().request_quality_level(level)
    }

    /// Change rate control from the next staged frame on.
    pub fn request_rate_control(&self, params: RateControlParams) -> Result<()> {
        self.shared.control.lock().request_rate_control(params)
    }

    /// Frames submitted to the encode queue so far.
    pub fn frames_submitted(&self) -> u64 {
        self.shared.frames_submitted.load(Ordering::Relaxed)
    }

    /// Frames written to the sink so far.
    pub fn frames_assembled(&self) -> u64 {
        self.shared.frames_assembled.load(Ordering::Relaxed)
    }
}

impl Drop for EncodePipeline {
    fn drop(&mut self) {
        // Stop the consumer first; it may still hold frames.
        if let Some(mut worker) = self.worker.take() {
            if let Err(err) = worker.join() {
                warn!("Consumer thread failed: {}", err);
            }
        }
        let leftover = self.deferred.take();
        if !leftover.is_empty() || !self.reorder.is_empty() {
            warn!(
                "Dropping pipeline with {} frames not encoded",
                leftover.len() + self.reorder.len()
            );
        }
        self.shared.release_batch(leftover);
        for frame in self.reorder.drain() {
            self.shared.release_frame(frame);
        }
        if let Err(err) = self.device.wait_idle() {
            warn!("Device did not go idle: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Codec, QpMapMode, RateControlMode};
    use crate::control::ControlCommandChain;
    use crate::device::CommandKind;
    use crate::references::SlidingWindowReferences;
    use crate::testing::{init_tracing, MockDevice, PatternSource, Recorded, SharedSink};

    struct Harness {
        mock: Arc<MockDevice>,
        source: PatternSource,
        sink: SharedSink,
        pipeline: EncodePipeline,
    }

    fn harness_with(mock: MockDevice, config: PipelineConfig) -> Result<Harness> {
        init_tracing();
        let mock = Arc::new(mock);
        let device: Arc<dyn EncodeDevice> = mock.clone();
        let source = PatternSource::default();
        let sink = SharedSink::default();
        let references =
            SlidingWindowReferences::new(Arc::clone(&device), &config, b"HDR;".to_vec())?;
        let pipeline =
            EncodePipeline::new(device, config, source.clone(), references, sink.clone())?;
        Ok(Harness {
            mock,
            source,
            sink,
            pipeline,
        })
    }

    fn harness(config: PipelineConfig) -> Harness {
        harness_with(MockDevice::new(), config).unwrap()
    }

    fn ipbbp() -> PipelineConfig {
        PipelineConfig::h264(64, 64)
            .with_total_frames(5)
            .with_b_frames(2)
    }

    #[test]
    fn test_idr_p_b_b_p_output_order() {
        let mut h = harness(ipbbp());
        h.pipeline.encode_all().unwrap();

        assert_eq!(h.sink.contents(), "HDR;F0E0;F1E1;F4E2;F2E3;F3E4;");
        assert_eq!(*h.source.loaded.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(h.pipeline.frames_submitted(), 5);
        assert_eq!(h.pipeline.frames_assembled(), 5);
    }

    #[test]
    fn test_encode_order_strictly_increases_with_references_first() {
        let config = PipelineConfig::h265(64, 64)
            .with_total_frames(23)
            .with_gop_frame_count(8)
            .with_b_frames(3)
            .with_input_images_in_flight(5);
        let mut h = harness(config);
        h.pipeline.encode_all().unwrap();

        let mut encode_of = std::collections::HashMap::new();
        let mut last = None;
        for submission in h.mock.encode_submissions() {
            for command in submission {
                if let Recorded::Encode {
                    input_order,
                    encode_order: Some(encode_order),
                    ..
                } = command
                {
                    assert!(last < Some(encode_order));
                    last = Some(encode_order);
                    encode_of.insert(input_order, encode_order);
                }
            }
        }
        assert_eq!(encode_of.len(), 23);

        // Every reference read by a frame was encoded before it.
        for submission in h.mock.encode_submissions() {
            let mut references = Vec::new();
            for command in &submission {
                match command {
                    Recorded::BeginCoding { references: r, .. } => references = r.clone(),
                    Recorded::Encode { input_order, .. } => {
                        for reference in &references {
                            assert!(encode_of[reference] < encode_of[input_order]);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn test_command_order_with_inline_queries() {
        let mut h = harness(ipbbp());
        h.pipeline.encode_all().unwrap();

        let submissions = h.mock.encode_submissions();
        let kinds: Vec<_> = submissions[1].iter().map(Recorded::kind).collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::ResetQueries,
                CommandKind::DpbBarrier,
                CommandKind::BeginCoding,
                CommandKind::Encode,
                CommandKind::EndCoding,
            ]
        );
        // B-frames are not kept as references, so no barrier.
        let kinds: Vec<_> = submissions[3].iter().map(Recorded::kind).collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::ResetQueries,
                CommandKind::BeginCoding,
                CommandKind::Encode,
                CommandKind::EndCoding,
            ]
        );
    }

    #[test]
    fn test_explicit_queries_without_inline_support() {
        let mut mock = MockDevice::new();
        mock.update_capabilities(|caps| caps.inline_queries = false);
        let mut h = harness_with(mock, ipbbp()).unwrap();
        h.pipeline.encode_all().unwrap();

        let submissions = h.mock.encode_submissions();
        let kinds: Vec<_> = submissions[1].iter().map(Recorded::kind).collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::ResetQueries,
                CommandKind::DpbBarrier,
                CommandKind::BeginCoding,
                CommandKind::BeginQuery,
                CommandKind::Encode,
                CommandKind::EndQuery,
                CommandKind::EndCoding,
            ]
        );
        assert_eq!(h.sink.contents(), "HDR;F0E0;F1E1;F4E2;F2E3;F3E4;");
    }

    #[test]
    fn test_first_frame_carries_control_chain() {
        let rate_control = RateControlParams {
            mode: RateControlMode::Cbr,
            average_bitrate: 2_000_000,
            max_bitrate: 2_000_000,
            ..Default::default()
        };
        let config = PipelineConfig::h264(64, 64)
            .with_total_frames(3)
            .with_quality_level(2)
            .with_rate_control(rate_control);
        let mut h = harness(config);
        h.pipeline.encode_all().unwrap();

        let submissions = h.mock.encode_submissions();
        let expected = ControlCommandChain::new(true, Some(2), Some(rate_control)).unwrap();
        assert!(submissions[0].contains(&Recorded::ControlCoding(expected)));
        assert!(submissions[0].contains(&Recorded::BeginCoding {
            setup: Some(0),
            references: Vec::new(),
            rate_control: None,
        }));

        // Later frames begin coding with the rate control in effect.
        assert!(!submissions[1]
            .iter()
            .any(|command| command.kind() == CommandKind::ControlCoding));
        let begin = submissions[1]
            .iter()
            .find(|command| command.kind() == CommandKind::BeginCoding)
            .unwrap();
        assert!(matches!(
            begin,
            Recorded::BeginCoding { rate_control: Some(params), .. } if *params == rate_control
        ));
    }

    #[test]
    fn test_requested_quality_level_rides_on_next_frame() {
        let config = PipelineConfig::h264(64, 64).with_total_frames(3);
        let mut h = harness(config);
        let first = h.pipeline.load_next_frame().unwrap();
        h.pipeline.enqueue_or_process(first).unwrap();

        h.pipeline.request_quality_level(1).unwrap();
        h.pipeline.request_quality_level(3).unwrap();
        assert!(h.pipeline.request_quality_level(4).is_err());
        h.pipeline.encode_all().unwrap();

        let submissions = h.mock.encode_submissions();
        let chain = ControlCommandChain::new(false, Some(3), None).unwrap();
        assert!(submissions[1].contains(&Recorded::ControlCoding(chain)));
        assert!(!submissions[2]
            .iter()
            .any(|command| command.kind() == CommandKind::ControlCoding));
    }

    #[test]
    fn test_out_of_order_recording_keeps_output() {
        let mut h = harness(ipbbp().with_out_of_order_recording(true));
        h.pipeline.encode_all().unwrap();

        assert_eq!(h.sink.contents(), "HDR;F0E0;F1E1;F4E2;F2E3;F3E4;");
        // One batch, recorded back to front.
        assert_eq!(h.mock.recorded_encodes(), vec![3, 2, 4, 1, 0]);
    }

    #[test]
    fn test_async_processing_matches_sync_output() {
        let config = PipelineConfig::h264(64, 64)
            .with_total_frames(40)
            .with_gop_frame_count(6)
            .with_b_frames(2)
            .with_input_images_in_flight(4);

        let mut sync = harness(config.clone());
        sync.pipeline.encode_all().unwrap();
        let mut asynchronous = harness(config.with_async_processing(true));
        asynchronous.pipeline.encode_all().unwrap();

        assert_eq!(asynchronous.sink.contents(), sync.sink.contents());
        assert_eq!(asynchronous.pipeline.frames_assembled(), 40);
    }

    #[test]
    fn test_batch_larger_than_default_bitstream_cap() {
        let config = PipelineConfig::h264(64, 64)
            .with_total_frames(20)
            .with_gop_frame_count(20)
            .with_input_images_in_flight(20);
        let mut h = harness(config);
        h.pipeline.encode_all().unwrap();

        assert_eq!(h.pipeline.frames_assembled(), 20);
        assert_eq!(h.pipeline.shared.pools.bitstream.allocated_count(), 20);
    }

    #[test]
    fn test_incomplete_query_fails_and_releases_frames() {
        let mock = MockDevice::new();
        mock.fail_query_for(1);
        let mut h = harness_with(mock, ipbbp()).unwrap();

        let err = h.pipeline.encode_all().unwrap_err();
        assert!(matches!(err, PipelineError::QueryIncomplete(_)));
        assert_eq!(h.sink.contents(), "HDR;F0E0;");
        assert_eq!(h.pipeline.shared.pools.staging.available_count(), 8);
        assert_eq!(h.pipeline.shared.pools.encode_commands.available_count(), 8);
        assert_eq!(h.pipeline.shared.frames.free_count(), 5);
    }

    #[test]
    fn test_failed_batch_waits_for_queued_encodes() {
        let mock = MockDevice::new();
        mock.complete_encodes_on_wait();
        mock.fail_query_for(1);
        let mut h = harness_with(mock, ipbbp()).unwrap();

        let err = h.pipeline.encode_all().unwrap_err();
        assert!(matches!(err, PipelineError::QueryIncomplete(_)));
        // Frames 4, 2 and 3 were queued behind the failing frame.
        assert_eq!(h.mock.encode_submissions().len(), 5);
        assert_eq!(h.mock.pending_fences(), 0);
        assert_eq!(h.pipeline.shared.pools.encode_input.available_count(), 8);
        assert_eq!(h.pipeline.shared.frames.free_count(), 5);
    }

    #[test]
    fn test_encodes_finishing_late_keep_output() {
        let mock = MockDevice::new();
        mock.complete_encodes_on_wait();
        let mut h = harness_with(mock, ipbbp().with_async_processing(true)).unwrap();
        h.pipeline.encode_all().unwrap();

        assert_eq!(h.sink.contents(), "HDR;F0E0;F1E1;F4E2;F2E3;F3E4;");
        assert_eq!(h.mock.pending_fences(), 0);
    }

    #[test]
    fn test_async_failure_surfaces_consumer_error() {
        let mock = MockDevice::new();
        mock.fail_query_for(2);
        let config = PipelineConfig::h264(64, 64)
            .with_total_frames(30)
            .with_gop_frame_count(4)
            .with_async_processing(true);
        let mut h = harness_with(mock, config).unwrap();

        let err = h.pipeline.encode_all().unwrap_err();
        assert!(matches!(err, PipelineError::QueryIncomplete(_)));
        assert!(h.pipeline.frames_assembled() < 30);
    }

    #[test]
    fn test_linear_qp_map_gets_its_own_submission() {
        let mut mock = MockDevice::new();
        mock.update_capabilities(|caps| caps.quantization_map_linear = true);
        let config = PipelineConfig::h264(64, 64)
            .with_total_frames(2)
            .with_qp_map(QpMapMode::DeltaQp);
        let mut h = harness_with(mock, config).unwrap();
        h.pipeline.encode_all().unwrap();

        assert_eq!(*h.source.qp_maps.lock(), vec![0, 1]);
        let transfers: Vec<_> = h
            .mock
            .submissions()
            .into_iter()
            .filter(|s| s.queue == QueueKind::Transfer)
            .collect();
        assert_eq!(transfers.len(), 4);
        assert!(transfers.iter().all(|s| s.signals));
        let encodes: Vec<_> = h
            .mock
            .submissions()
            .into_iter()
            .filter(|s| s.queue == QueueKind::Encode)
            .collect();
        assert!(encodes.iter().all(|s| s.wait_semaphores == 2 && !s.signals));
    }

    #[test]
    fn test_optimal_qp_map_shares_the_input_copy() {
        let config = PipelineConfig::h264(64, 64)
            .with_total_frames(2)
            .with_qp_map(QpMapMode::Emphasis);
        let mut h = harness(config);
        h.pipeline.encode_all().unwrap();

        let transfers: Vec<_> = h
            .mock
            .submissions()
            .into_iter()
            .filter(|s| s.queue == QueueKind::Transfer)
            .collect();
        assert_eq!(transfers.len(), 2);
        assert!(transfers.iter().all(|s| s.commands.len() == 2));

        // Each encode reads the map its own transfer filled.
        for (transfer, encode) in transfers.iter().zip(h.mock.encode_submissions()) {
            let Some(Recorded::CopyImage { dst: map }) = transfer.commands.get(1) else {
                panic!("second transfer command is not the map copy");
            };
            assert!(encode.iter().any(|command| matches!(
                command,
                Recorded::Encode { qp_map: Some(image), .. } if image == map
            )));
        }
    }

    #[test]
    fn test_capability_checks() {
        let mut mock = MockDevice::new();
        mock.update_capabilities(|caps| {
            caps.codecs = vec![Codec::H264];
            caps.quantization_map = false;
        });
        let mock = Arc::new(mock);
        let device: Arc<dyn EncodeDevice> = mock.clone();

        let build = |config: PipelineConfig| {
            let references =
                SlidingWindowReferences::new(Arc::clone(&device), &config, Vec::new())?;
            EncodePipeline::new(
                Arc::clone(&device),
                config,
                PatternSource::default(),
                references,
                SharedSink::default(),
            )
        };

        assert!(matches!(
            build(PipelineConfig::av1(64, 64).with_total_frames(1)),
            Err(PipelineError::Capability(_))
        ));
        assert!(matches!(
            build(
                PipelineConfig::h264(64, 64)
                    .with_total_frames(1)
                    .with_qp_map(QpMapMode::DeltaQp)
            ),
            Err(PipelineError::Capability(_))
        ));
    }

    #[test]
    fn test_b_frames_clamped_to_device_maximum() {
        let mut mock = MockDevice::new();
        mock.update_capabilities(|caps| caps.max_b_frames = 1);
        let h = harness_with(mock, ipbbp().with_b_frames(3)).unwrap();
        assert_eq!(h.pipeline.config().consecutive_b_frames, 1);
    }

    #[test]
    fn test_load_past_total_frames_fails() {
        let mut h = harness(PipelineConfig::h264(64, 64).with_total_frames(1));
        let frame = h.pipeline.load_next_frame().unwrap();
        assert!(frame.is_last);
        assert!(matches!(
            h.pipeline.load_next_frame(),
            Err(PipelineError::InvalidInput(_))
        ));
        h.pipeline.enqueue_or_process(frame).unwrap();
        h.pipeline.flush_and_drain().unwrap();
        assert_eq!(h.sink.contents(), "HDR;F0E0;");
    }

    #[test]
    fn test_drop_releases_every_resource() {
        let mut h = harness(ipbbp());
        for _ in 0..3 {
            let frame = h.pipeline.load_next_frame().unwrap();
            h.pipeline.enqueue_or_process(frame).unwrap();
        }
        let Harness { mock, pipeline, .. } = h;
        drop(pipeline);
        assert_eq!(mock.live_images(), 0);
        assert_eq!(mock.live_bitstream_buffers(), 0);
        assert_eq!(mock.live_command_buffers(), 0);
    }
}
