// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode-and-present pipeline.
//!
//! One call to [`DecodePipeline::decode`] pushes a complete access unit
//! through the decoder: reclaim finished input slots, pick a free one, copy
//! the compressed bytes in under a dma-buf sync bracket, enqueue, then drain
//! every decoded frame the driver has ready and hand each to the presenter
//! before returning its slot to the driver.
//!
//! A device error observed on poll flags the pipeline for a full reset; the
//! next decode call rebuilds both pools from scratch before accepting data.

use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::PollFlags;
use thiserror::Error;

use crate::device::DequeuedBuffer;
use crate::device::DeviceError;
use crate::device::DeviceEvent;
use crate::device::QueueKind;
use crate::device::QueuedBuffer;
use crate::device::VideoDevice;
use crate::display::DisplayError;
use crate::display::DrmDisplay;
use crate::display::FrameInfo;
use crate::dmabuf::AllocError;
use crate::dmabuf::DmaHeapAllocator;
use crate::pool::BufferPool;
use crate::pool::PoolError;
use crate::presenter::FrameOutput;
use crate::presenter::FramePresenter;
use crate::presenter::PREPAINT_CHROMA;
use crate::presenter::PREPAINT_LUMA;
use crate::streaming::StreamingController;
use crate::streaming::StreamingError;
use crate::streaming::StreamTarget;
use crate::Fourcc;
use crate::Resolution;

/// How long to wait for the driver to hand back an input buffer when the
/// pool is exhausted.
const INPUT_RESCUE_POLL_MS: u16 = 20;

/// Flush keeps polling in 50 ms slices until this many pass without a frame.
const FLUSH_POLL_MS: u16 = 50;
const FLUSH_MAX_ATTEMPTS: u32 = 20;

/// Reset settle times: first for in-flight driver work to retire, then for
/// the kernel to actually release DMA-contiguous memory.
const RESET_QUEUE_SETTLE: Duration = Duration::from_millis(50);
const RESET_MEMORY_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(&'static str),
    #[error("video device unavailable")]
    DeviceUnavailable(#[source] DeviceError),
    #[error("DMA heap allocator unavailable")]
    AllocatorUnavailable(#[source] AllocError),
    #[error("no free input slot available")]
    NoFreeInputSlot,
    #[error("empty access unit")]
    EmptyAccessUnit,
    #[error("decoder device signalled an error; reset scheduled")]
    DeviceFault,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Streaming(#[from] StreamingError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Display(#[from] DisplayError),
}

/// Decoder configuration. The defaults decode 1080p H.264 into planar
/// YUV420 with six input and four output buffers.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub device_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub input_format: Fourcc,
    pub output_format: Fourcc,
    pub input_buffer_count: usize,
    pub output_buffer_count: usize,
    /// Input buffer size used when the driver does not report one.
    pub default_input_buffer_size: usize,
    pub enable_display: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            width: 1920,
            height: 1080,
            input_format: Fourcc::H264,
            output_format: Fourcc::YUV420,
            input_buffer_count: 6,
            output_buffer_count: 4,
            default_input_buffer_size: 2 * 1024 * 1024,
            enable_display: true,
        }
    }
}

/// Streaming operations over the real device and output pool.
struct DeviceStreamTarget<'a> {
    device: &'a VideoDevice,
    output_pool: &'a BufferPool,
}

impl StreamTarget for DeviceStreamTarget<'_> {
    fn queue_output_slots(&mut self) -> Result<(), DeviceError> {
        log::debug!("queuing {} output buffers", self.output_pool.count());
        for index in 0..self.output_pool.count() {
            let Some(buffer) = self.output_pool.buffer(index) else {
                log::error!("output slot {} has no buffer to queue", index);
                return Err(DeviceError::Ioctl("VIDIOC_QBUF", Errno::ENXIO));
            };
            self.device.queue_buffer(&QueuedBuffer {
                queue: QueueKind::Output,
                index: index as u32,
                fd: buffer.fd(),
                bytesused: 0,
                length: buffer.size() as u32,
                last: false,
            })?;
        }
        Ok(())
    }

    fn stream_on(&mut self, queue: QueueKind) -> Result<(), DeviceError> {
        self.device.stream_on(queue)
    }

    fn stream_off(&mut self, queue: QueueKind) -> Result<(), DeviceError> {
        self.device.stream_off(queue)
    }
}

/// Lazy zero-copy import plus scan-out, borrowed from the pipeline for the
/// duration of one presentation.
struct DisplayOutput<'a> {
    display: &'a mut DrmDisplay,
    ready: &'a mut [bool],
    pool: &'a BufferPool,
    size: Resolution,
}

impl FrameOutput for DisplayOutput<'_> {
    fn prepare_slot(&mut self, index: usize) -> Result<(), DisplayError> {
        if self.ready.get(index).copied().unwrap_or(false) {
            return Ok(());
        }
        let Some(buffer) = self.pool.buffer(index) else {
            return Err(DisplayError::ImportFailed(format!("slot {} has no buffer", index)));
        };
        self.display.import_buffer(buffer.fd(), self.size.width, self.size.height)?;
        if let Some(flag) = self.ready.get_mut(index) {
            *flag = true;
        }
        log::info!("zero-copy scan-out ready for output slot {}", index);
        Ok(())
    }

    fn show(&mut self, frame: &FrameInfo) -> Result<(), DisplayError> {
        self.display.present(frame)
    }
}

pub struct DecodePipeline {
    config: PipelineConfig,
    allocator: DmaHeapAllocator,
    input_pool: BufferPool,
    output_pool: BufferPool,
    streaming: StreamingController,
    presenter: FramePresenter,
    display: Option<DrmDisplay>,
    device: VideoDevice,
    zero_copy_ready: Vec<bool>,
    frame_size: Resolution,
    decoder_ready: bool,
    needs_reset: bool,
}

impl DecodePipeline {
    /// Opens and verifies the decoder and the DMA heap, negotiates formats,
    /// opens the display, and realizes both buffer pools.
    pub fn initialize(config: PipelineConfig) -> Result<Self, PipelineError> {
        if config.width == 0 || config.height == 0 {
            return Err(PipelineError::ConfigInvalid("frame size must be non-zero"));
        }
        if config.input_buffer_count == 0 || config.output_buffer_count == 0 {
            return Err(PipelineError::ConfigInvalid("buffer counts must be non-zero"));
        }

        let device = VideoDevice::initialize_for_decoding(&config.device_path)
            .map_err(PipelineError::DeviceUnavailable)?;
        let allocator = DmaHeapAllocator::open().map_err(PipelineError::AllocatorUnavailable)?;

        device.configure_decoder_formats(
            config.width,
            config.height,
            config.input_format,
            config.output_format,
        )?;
        let negotiated = device.get_format(QueueKind::Output)?;
        let frame_size = Resolution { width: negotiated.width, height: negotiated.height };
        log::info!("negotiated output: {} {}", negotiated.pixelformat, frame_size);

        let display = if config.enable_display {
            let display = DrmDisplay::open()?;
            log::info!("{}", display.display_info());
            Some(display)
        } else {
            None
        };

        let zero_copy_ready = vec![false; config.output_buffer_count];
        let mut pipeline = Self {
            input_pool: BufferPool::new(QueueKind::Input, config.input_buffer_count),
            output_pool: BufferPool::new(QueueKind::Output, config.output_buffer_count),
            config,
            allocator,
            streaming: StreamingController::new(),
            presenter: FramePresenter::new(),
            display,
            device,
            zero_copy_ready,
            frame_size,
            decoder_ready: false,
            needs_reset: false,
        };
        pipeline.setup_buffers()?;
        Ok(pipeline)
    }

    pub fn decoded_frame_count(&self) -> u64 {
        self.presenter.frame_count()
    }

    pub fn frame_size(&self) -> Resolution {
        self.frame_size
    }

    /// Allocates and realizes both pools at the driver-reported buffer
    /// sizes, pre-painting the output slots so the presenter can tell an
    /// untouched buffer from a decoded one.
    fn setup_buffers(&mut self) -> Result<(), PipelineError> {
        self.zero_copy_ready = vec![false; self.config.output_buffer_count];

        let input_sizeimage = self.device.get_format(QueueKind::Input)?.sizeimage as usize;
        let output_sizeimage = self.device.get_format(QueueKind::Output)?.sizeimage as usize;
        let input_size = if input_sizeimage != 0 {
            input_sizeimage
        } else {
            self.config.default_input_buffer_size
        };
        let nominal_frame =
            self.frame_size.width as usize * self.frame_size.height as usize * 3 / 2;
        let output_size = if output_sizeimage != 0 { output_sizeimage } else { nominal_frame };
        log::info!("buffer sizes: input {} bytes, output {} bytes", input_size, output_size);

        self.input_pool.allocate(&self.allocator, input_size)?;
        self.input_pool.request_on_device(&self.device)?;

        self.output_pool.allocate(&self.allocator, output_size)?;
        self.prepaint_output_buffers();
        self.output_pool.request_on_device(&self.device)?;

        log::info!(
            "pools realized: {} input, {} output buffers",
            self.input_pool.count(),
            self.output_pool.count()
        );
        Ok(())
    }

    fn prepaint_output_buffers(&mut self) {
        let luma = (self.frame_size.width as usize) * (self.frame_size.height as usize);
        for index in 0..self.output_pool.count() {
            let Some(data) =
                self.output_pool.buffer_mut(index).and_then(|buffer| buffer.as_mut_slice())
            else {
                continue;
            };
            let luma_end = luma.min(data.len());
            data[..luma_end].fill(PREPAINT_LUMA);
            let chroma_end = (luma + luma / 2).min(data.len());
            data[luma_end..chroma_end].fill(PREPAINT_CHROMA);
        }
    }

    fn with_stream_target<R>(
        &mut self,
        f: impl FnOnce(&mut StreamingController, &mut DeviceStreamTarget) -> R,
    ) -> R {
        let Self { streaming, device, output_pool, .. } = self;
        let mut target = DeviceStreamTarget { device, output_pool };
        f(streaming, &mut target)
    }

    fn start_streaming(&mut self) -> Result<(), PipelineError> {
        self.with_stream_target(|streaming, target| streaming.start(target))?;
        Ok(())
    }

    /// Decodes one complete access unit and presents whatever frames the
    /// decoder has finished.
    pub fn decode(&mut self, access_unit: &[u8]) -> Result<(), PipelineError> {
        if access_unit.is_empty() {
            return Err(PipelineError::EmptyAccessUnit);
        }

        if self.needs_reset {
            log::info!("performing scheduled decoder reset");
            self.reset_buffers()?;
            self.start_streaming()?;
            self.needs_reset = false;
        }

        if !self.decoder_ready {
            self.decoder_ready = true;
            log::info!("decoder ready to accept data");
        }

        if !self.streaming.is_active() {
            self.start_streaming()?;
        }

        self.drain_input_completions();

        let slot = self.select_input_slot()?;

        let chunk = {
            let buffer = self
                .input_pool
                .buffer_mut(slot)
                .ok_or(PipelineError::NoFreeInputSlot)?;
            if let Err(e) = buffer.sync_start() {
                log::warn!("dma-buf sync-start failed on input slot {}: {}", slot, e);
            }
            let chunk = {
                let data = buffer.as_mut_slice().ok_or(PipelineError::NoFreeInputSlot)?;
                let chunk = access_unit.len().min(data.len());
                data[..chunk].copy_from_slice(&access_unit[..chunk]);
                chunk
            };
            if let Err(e) = buffer.sync_end() {
                log::warn!("dma-buf sync-end failed on input slot {}: {}", slot, e);
            }
            if chunk == 0 {
                return Err(PipelineError::EmptyAccessUnit);
            }
            chunk
        };
        if chunk < access_unit.len() {
            log::warn!(
                "access unit of {} bytes truncated to input buffer size {}",
                access_unit.len(),
                chunk
            );
        }

        let (fd, length) = {
            let buffer = self.input_pool.buffer(slot).ok_or(PipelineError::NoFreeInputSlot)?;
            (buffer.fd(), buffer.size() as u32)
        };
        self.device.queue_buffer(&QueuedBuffer {
            queue: QueueKind::Input,
            index: slot as u32,
            fd,
            bytesused: chunk as u32,
            length,
            last: false,
        })?;
        self.input_pool.mark_in_use(slot);

        self.drain_output_completions()
    }

    /// Reclaims every input buffer the driver is done with.
    fn drain_input_completions(&mut self) {
        loop {
            match self.device.dequeue_buffer(QueueKind::Input) {
                Ok(Some(done)) => self.input_pool.mark_free(done.index as usize),
                Ok(None) => break,
                Err(e) => {
                    log::debug!("input drain stopped: {}", e);
                    break;
                }
            }
        }
    }

    /// Peeks a free input slot; with the pool exhausted, waits briefly for
    /// the driver to finish one.
    fn select_input_slot(&mut self) -> Result<usize, PipelineError> {
        if let Some(slot) = self.input_pool.get_free_buffer_index() {
            return Ok(slot);
        }

        match self.device.poll(
            PollFlags::POLLOUT | PollFlags::POLLERR,
            INPUT_RESCUE_POLL_MS,
        ) {
            Ok(()) if self.device.is_ready_for_write() => {
                if let Ok(Some(done)) = self.device.dequeue_buffer(QueueKind::Input) {
                    let slot = done.index as usize;
                    self.input_pool.mark_free(slot);
                    log::debug!("reclaimed input slot {} after waiting", slot);
                    return Ok(slot);
                }
            }
            Ok(()) => {}
            Err(e) => log::warn!("input rescue poll failed: {}", e),
        }

        log::error!("input pool exhausted, dropping access unit");
        Err(PipelineError::NoFreeInputSlot)
    }

    /// Drains decoded frames until the driver has none ready, presenting
    /// each and handing its slot straight back.
    fn drain_output_completions(&mut self) -> Result<(), PipelineError> {
        loop {
            self.device
                .poll(PollFlags::POLLIN | PollFlags::POLLPRI | PollFlags::POLLERR, 0)?;

            if self.device.has_event() {
                self.handle_events();
            }
            if self.device.has_error() {
                log::error!("device poll reported POLLERR");
                self.needs_reset = true;
                return Err(PipelineError::DeviceFault);
            }
            if !self.device.is_ready_for_read() {
                return Ok(());
            }

            match self.device.dequeue_buffer(QueueKind::Output) {
                Ok(Some(frame)) => {
                    self.present_frame(frame);
                    self.requeue_output(frame.index);
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    log::warn!("output dequeue failed: {}", e);
                    return Ok(());
                }
            }
        }
    }

    fn present_frame(&mut self, frame: DequeuedBuffer) {
        let Self { presenter, display, zero_copy_ready, output_pool, frame_size, .. } = self;
        let result = match display.as_mut() {
            Some(display) => {
                let mut output = DisplayOutput {
                    display,
                    ready: zero_copy_ready,
                    pool: &*output_pool,
                    size: *frame_size,
                };
                presenter.present(frame, &*output_pool, *frame_size, Some(&mut output))
            }
            None => presenter.present(frame, &*output_pool, *frame_size, None),
        };
        if let Err(e) = result {
            log::warn!("frame in output buffer {} not presented: {}", frame.index, e);
        }
    }

    /// Hands an output slot back to the driver so it can decode into it
    /// again. The fd and full length always accompany a DMABUF enqueue.
    fn requeue_output(&mut self, index: u32) {
        let Some(buffer) = self.output_pool.buffer(index as usize) else {
            log::error!("cannot requeue unknown output slot {}", index);
            return;
        };
        let request = QueuedBuffer {
            queue: QueueKind::Output,
            index,
            fd: buffer.fd(),
            bytesused: 0,
            length: buffer.size() as u32,
            last: false,
        };
        if let Err(e) = self.device.queue_buffer(&request) {
            log::error!("failed to return output buffer {} to driver: {}", index, e);
        }
    }

    fn handle_events(&mut self) {
        while let Some(event) = self.device.dequeue_event() {
            match event {
                DeviceEvent::SourceChange { resolution_changed: true } => {
                    log::info!("source change: resolution changed, continuing without reset");
                }
                DeviceEvent::SourceChange { resolution_changed: false } => {
                    log::info!("source change event");
                }
                DeviceEvent::EndOfStream => log::info!("end-of-stream event"),
                DeviceEvent::FrameSync => log::debug!("frame-sync event"),
                DeviceEvent::Unknown(kind) => log::debug!("unknown device event {}", kind),
            }
        }
    }

    /// Pushes the decoder's tail through: enqueues one empty last-of-stream
    /// buffer, then keeps draining until the driver stays quiet for
    /// [`FLUSH_MAX_ATTEMPTS`] polls in a row. Streaming stays active.
    pub fn flush(&mut self) -> Result<(), PipelineError> {
        log::info!("flushing decoder");

        let slot = match self.input_pool.get_free_buffer_index() {
            Some(slot) => slot,
            None => match self.device.dequeue_buffer(QueueKind::Input) {
                Ok(Some(done)) => {
                    let slot = done.index as usize;
                    self.input_pool.mark_free(slot);
                    slot
                }
                _ => {
                    log::error!("no input slot available for flush");
                    return Err(PipelineError::NoFreeInputSlot);
                }
            },
        };

        let (fd, length) = {
            let buffer = self.input_pool.buffer(slot).ok_or(PipelineError::NoFreeInputSlot)?;
            (buffer.fd(), buffer.size() as u32)
        };
        self.device.queue_buffer(&QueuedBuffer {
            queue: QueueKind::Input,
            index: slot as u32,
            fd,
            bytesused: 0,
            length,
            last: true,
        })?;
        self.input_pool.mark_in_use(slot);

        let mut attempts = 0;
        while attempts < FLUSH_MAX_ATTEMPTS {
            if let Err(e) = self.device.poll(
                PollFlags::POLLIN | PollFlags::POLLPRI | PollFlags::POLLERR,
                FLUSH_POLL_MS,
            ) {
                log::warn!("flush poll failed: {}", e);
                attempts += 1;
                continue;
            }

            if self.device.has_event() {
                self.handle_events();
            }
            if self.device.has_error() {
                log::error!("device error while flushing");
                return Err(PipelineError::DeviceFault);
            }

            if self.device.is_ready_for_read() {
                match self.device.dequeue_buffer(QueueKind::Output) {
                    Ok(Some(frame)) => {
                        self.present_frame(frame);
                        self.requeue_output(frame.index);
                        attempts = 0;
                    }
                    _ => attempts += 1,
                }
            } else {
                attempts += 1;
            }
        }

        log::info!("decoder flush complete");
        Ok(())
    }

    /// Full recovery: tears both pools down, lets the kernel settle, and
    /// rebuilds everything, including the display's framebuffer cache.
    pub fn reset_buffers(&mut self) -> Result<(), PipelineError> {
        log::info!("resetting decoder buffers");

        if self.streaming.is_active() {
            self.with_stream_target(|streaming, target| streaming.stop(target));
        }
        self.streaming.force_stopped();

        self.input_pool.release_on_device(&self.device);
        self.output_pool.release_on_device(&self.device);

        sleep(RESET_QUEUE_SETTLE);

        self.input_pool.reset_usage();
        self.output_pool.reset_usage();

        self.input_pool.deallocate();
        self.output_pool.deallocate();

        // Every cached framebuffer references an fd that just closed.
        self.zero_copy_ready = vec![false; self.config.output_buffer_count];
        if let Some(display) = self.display.as_mut() {
            display.release_framebuffers();
        }

        sleep(RESET_MEMORY_SETTLE);

        self.setup_buffers()?;
        log::info!("decoder buffers rebuilt");
        Ok(())
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        if self.streaming.is_active() {
            self.with_stream_target(|streaming, target| streaming.stop(target));
        }

        self.input_pool.release_on_device(&self.device);
        self.output_pool.release_on_device(&self.device);
        self.input_pool.deallocate();
        self.output_pool.deallocate();
        self.zero_copy_ready.clear();

        // The display holds handles imported from the pools' dma-bufs; it
        // goes first, the decoder device closes last.
        self.display = None;

        log::info!(
            "decoder shut down after {} dequeued frames",
            self.presenter.frame_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_decoder_expectations() {
        let config = PipelineConfig::default();
        assert_eq!(config.input_buffer_count, 6);
        assert_eq!(config.output_buffer_count, 4);
        assert_eq!(config.input_format, Fourcc::H264);
        assert_eq!(config.output_format, Fourcc::YUV420);
        assert_eq!(config.default_input_buffer_size, 2 * 1024 * 1024);
    }

    #[test]
    fn zero_sized_config_is_rejected_before_touching_devices() {
        let config = PipelineConfig { width: 0, ..Default::default() };
        assert!(matches!(
            DecodePipeline::initialize(config),
            Err(PipelineError::ConfigInvalid(_))
        ));

        let config = PipelineConfig { output_buffer_count: 0, ..Default::default() };
        assert!(matches!(
            DecodePipeline::initialize(config),
            Err(PipelineError::ConfigInvalid(_))
        ));
    }
}
