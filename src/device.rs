// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed handle to a V4L2 stateful memory-to-memory decoder device.
//!
//! All operations are synchronous ioctl round-trips except
//! [`VideoDevice::dequeue_buffer`], which reports "nothing available" as
//! `Ok(None)`, and [`VideoDevice::poll`], which caches the readiness flags
//! of its last call for the accessors to inspect.

pub mod uapi;

use std::fs::File;
use std::mem;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::libc;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use thiserror::Error;
use zerocopy::FromZeros;

use crate::Fourcc;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open video device: {0}")]
    Open(std::io::Error),
    #[error("device does not support multi-planar memory-to-memory video")]
    MissingCapability,
    #[error("device does not accept DMABUF memory on its input queue")]
    DmabufUnsupported,
    #[error("{0} failed: {1}")]
    Ioctl(&'static str, Errno),
    #[error("poll failed: {0}")]
    Poll(Errno),
}

/// The two queues of a memory-to-memory decoder, named from the pipeline's
/// point of view: `Input` carries compressed access units into the decoder
/// (V4L2 `OUTPUT`), `Output` carries decoded frames back (V4L2 `CAPTURE`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Input,
    Output,
}

impl QueueKind {
    fn buf_type(self) -> u32 {
        match self {
            QueueKind::Input => uapi::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            QueueKind::Output => uapi::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            QueueKind::Input => write!(f, "input"),
            QueueKind::Output => write!(f, "output"),
        }
    }
}

/// Negotiated single-plane multi-planar format of one queue.
#[derive(Copy, Clone, Debug)]
pub struct MplaneFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: Fourcc,
    pub sizeimage: u32,
}

/// One buffer to enqueue on a decoder queue, always DMABUF-backed.
#[derive(Debug)]
pub struct QueuedBuffer {
    pub queue: QueueKind,
    pub index: u32,
    pub fd: i32,
    pub bytesused: u32,
    pub length: u32,
    /// Marks the end of the stream; used by the flush procedure.
    pub last: bool,
}

/// A buffer handed back by the driver.
#[derive(Copy, Clone, Debug)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytesused: u32,
    pub flags: u32,
}

impl DequeuedBuffer {
    /// True when the driver flagged the payload as corrupt.
    pub fn has_error(self) -> bool {
        self.flags & uapi::V4L2_BUF_FLAG_ERROR != 0
    }
}

/// An asynchronous notification dequeued from the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    SourceChange { resolution_changed: bool },
    EndOfStream,
    FrameSync,
    Unknown(u32),
}

fn parse_c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Hint for the compressed input plane; 2 MiB holds any realistic H.264
/// access unit at the bitrates this player targets.
pub const INPUT_PLANE_SIZE_HINT: u32 = 2 * 1024 * 1024;

pub struct VideoDevice {
    file: File,
    revents: PollFlags,
}

impl VideoDevice {
    /// Opens the device in non-blocking mode without further checks.
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(DeviceError::Open)?;
        log::info!("opened video device {} (fd {})", path.display(), file.as_raw_fd());
        Ok(Self { file, revents: PollFlags::empty() })
    }

    /// Opens and verifies a decoder: the device must advertise multi-planar
    /// M2M capability and accept DMABUF memory on its input queue. Failure
    /// to subscribe to asynchronous events is only a warning.
    pub fn initialize_for_decoding(path: &Path) -> Result<Self, DeviceError> {
        let device = Self::open(path)?;

        let mut cap = uapi::v4l2_capability::new_zeroed();
        // SAFETY: valid fd, valid struct pointer.
        unsafe { uapi::vidioc_querycap(device.raw_fd(), &mut cap) }
            .map_err(|e| DeviceError::Ioctl("VIDIOC_QUERYCAP", e))?;
        log::info!(
            "decoder: {} ({})",
            parse_c_str(&cap.card),
            parse_c_str(&cap.driver)
        );
        if cap.capabilities & uapi::V4L2_CAP_VIDEO_M2M_MPLANE == 0 {
            log::error!(
                "device lacks V4L2_CAP_VIDEO_M2M_MPLANE (capabilities {:#010x})",
                cap.capabilities
            );
            return Err(DeviceError::MissingCapability);
        }

        if !device.probe_dmabuf_support() {
            return Err(DeviceError::DmabufUnsupported);
        }

        if let Err(e) = device.subscribe_events() {
            log::warn!("failed to subscribe to decoder events: {}", e);
        }

        Ok(device)
    }

    pub fn raw_fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    /// Asks for one DMABUF slot on the input queue, then gives it back. The
    /// request only succeeds on drivers that implement DMABUF import.
    fn probe_dmabuf_support(&self) -> bool {
        let supported = self.request_buffers(QueueKind::Input, 1).is_ok();
        if supported {
            let _ = self.request_buffers(QueueKind::Input, 0);
        }
        log::info!("DMABUF support on input queue: {}", if supported { "ok" } else { "missing" });
        supported
    }

    fn subscribe_events(&self) -> Result<(), DeviceError> {
        for event_type in [uapi::V4L2_EVENT_SOURCE_CHANGE, uapi::V4L2_EVENT_EOS] {
            let mut sub = uapi::v4l2_event_subscription::new_zeroed();
            sub.type_ = event_type;
            // SAFETY: valid fd, valid struct pointer.
            unsafe { uapi::vidioc_subscribe_event(self.raw_fd(), &sub) }
                .map_err(|e| DeviceError::Ioctl("VIDIOC_SUBSCRIBE_EVENT", e))?;
        }
        log::info!("subscribed to source-change and end-of-stream events");
        Ok(())
    }

    /// Negotiates both queue formats: compressed single-plane input with a
    /// 2 MiB plane, and single-plane decoded output. Also asks the driver to
    /// keep only one capture buffer queued, which lowers latency; drivers
    /// that refuse are tolerated.
    pub fn configure_decoder_formats(
        &self,
        width: u32,
        height: u32,
        input_format: Fourcc,
        output_format: Fourcc,
    ) -> Result<(), DeviceError> {
        // SAFETY: all-zero bytes are a valid v4l2_format.
        let mut fmt: uapi::v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = QueueKind::Input.buf_type();
        // SAFETY: pix_mp is the active member for the M2M queue types.
        unsafe {
            fmt.fmt.pix_mp.width = width;
            fmt.fmt.pix_mp.height = height;
            fmt.fmt.pix_mp.pixelformat = input_format.0;
            fmt.fmt.pix_mp.num_planes = 1;
            fmt.fmt.pix_mp.plane_fmt[0].sizeimage = INPUT_PLANE_SIZE_HINT;
        }
        // SAFETY: valid fd, valid struct pointer.
        unsafe { uapi::vidioc_s_fmt(self.raw_fd(), &mut fmt) }
            .map_err(|e| DeviceError::Ioctl("VIDIOC_S_FMT(input)", e))?;
        log::info!("input format set: {} {}x{}", input_format, width, height);

        // SAFETY: as above.
        let mut fmt: uapi::v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = QueueKind::Output.buf_type();
        // SAFETY: as above.
        unsafe {
            fmt.fmt.pix_mp.width = width;
            fmt.fmt.pix_mp.height = height;
            fmt.fmt.pix_mp.pixelformat = output_format.0;
            fmt.fmt.pix_mp.num_planes = 1;
        }
        // SAFETY: valid fd, valid struct pointer.
        unsafe { uapi::vidioc_s_fmt(self.raw_fd(), &mut fmt) }
            .map_err(|e| DeviceError::Ioctl("VIDIOC_S_FMT(output)", e))?;
        log::info!("output format set: {} {}x{}", output_format, width, height);

        let mut ctrl = uapi::v4l2_control::new_zeroed();
        ctrl.id = uapi::V4L2_CID_MIN_BUFFERS_FOR_CAPTURE;
        ctrl.value = 1;
        // SAFETY: valid fd, valid struct pointer.
        match unsafe { uapi::vidioc_s_ctrl(self.raw_fd(), &mut ctrl) } {
            Ok(_) => log::info!("capture buffering reduced to 1 for low latency"),
            Err(e) => log::warn!("cannot reduce capture buffering (may add latency): {}", e),
        }

        Ok(())
    }

    pub fn get_format(&self, queue: QueueKind) -> Result<MplaneFormat, DeviceError> {
        // SAFETY: all-zero bytes are a valid v4l2_format.
        let mut fmt: uapi::v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = queue.buf_type();
        // SAFETY: valid fd, valid struct pointer.
        unsafe { uapi::vidioc_g_fmt(self.raw_fd(), &mut fmt) }
            .map_err(|e| DeviceError::Ioctl("VIDIOC_G_FMT", e))?;
        // SAFETY: the driver filled the pix_mp member for this queue type.
        let pix = unsafe { &fmt.fmt.pix_mp };
        Ok(MplaneFormat {
            width: pix.width,
            height: pix.height,
            pixelformat: Fourcc(pix.pixelformat),
            sizeimage: pix.plane_fmt[0].sizeimage,
        })
    }

    /// Asks the driver to realize `count` DMABUF slots on a queue; 0
    /// releases them. Returns the count granted by the driver.
    pub fn request_buffers(&self, queue: QueueKind, count: u32) -> Result<u32, DeviceError> {
        let mut req = uapi::v4l2_requestbuffers::new_zeroed();
        req.count = count;
        req.type_ = queue.buf_type();
        req.memory = uapi::V4L2_MEMORY_DMABUF;
        // SAFETY: valid fd, valid struct pointer.
        unsafe { uapi::vidioc_reqbufs(self.raw_fd(), &mut req) }
            .map_err(|e| DeviceError::Ioctl("VIDIOC_REQBUFS", e))?;
        Ok(req.count)
    }

    pub fn queue_buffer(&self, buffer: &QueuedBuffer) -> Result<(), DeviceError> {
        // SAFETY: all-zero bytes are valid for both structs.
        let mut plane: uapi::v4l2_plane = unsafe { mem::zeroed() };
        plane.m.fd = buffer.fd;
        plane.bytesused = buffer.bytesused;
        plane.length = buffer.length;

        // SAFETY: as above.
        let mut buf: uapi::v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = buffer.index;
        buf.type_ = buffer.queue.buf_type();
        buf.memory = uapi::V4L2_MEMORY_DMABUF;
        buf.m.planes = &mut plane;
        buf.length = 1;
        if buffer.last {
            buf.flags |= uapi::V4L2_BUF_FLAG_LAST;
        }

        // SAFETY: valid fd; `buf` points at `plane`, which outlives the call.
        unsafe { uapi::vidioc_qbuf(self.raw_fd(), &mut buf) }
            .map_err(|e| DeviceError::Ioctl("VIDIOC_QBUF", e))?;
        Ok(())
    }

    /// Non-blocking dequeue. `Ok(None)` means the driver has nothing for us
    /// yet; the index of a returned buffer is always valid driver output.
    pub fn dequeue_buffer(&self, queue: QueueKind) -> Result<Option<DequeuedBuffer>, DeviceError> {
        // SAFETY: all-zero bytes are valid for both structs.
        let mut plane: uapi::v4l2_plane = unsafe { mem::zeroed() };
        let mut buf: uapi::v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = queue.buf_type();
        buf.memory = uapi::V4L2_MEMORY_DMABUF;
        buf.m.planes = &mut plane;
        buf.length = 1;

        // SAFETY: valid fd; `buf` points at `plane`, which outlives the call.
        match unsafe { uapi::vidioc_dqbuf(self.raw_fd(), &mut buf) } {
            Ok(_) => Ok(Some(DequeuedBuffer {
                index: buf.index,
                bytesused: plane.bytesused,
                flags: buf.flags,
            })),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(DeviceError::Ioctl("VIDIOC_DQBUF", e)),
        }
    }

    pub fn stream_on(&self, queue: QueueKind) -> Result<(), DeviceError> {
        let buf_type = queue.buf_type() as libc::c_int;
        // SAFETY: valid fd, valid pointer to the type value.
        unsafe { uapi::vidioc_streamon(self.raw_fd(), &buf_type) }
            .map_err(|e| DeviceError::Ioctl("VIDIOC_STREAMON", e))?;
        Ok(())
    }

    pub fn stream_off(&self, queue: QueueKind) -> Result<(), DeviceError> {
        let buf_type = queue.buf_type() as libc::c_int;
        // SAFETY: valid fd, valid pointer to the type value.
        unsafe { uapi::vidioc_streamoff(self.raw_fd(), &buf_type) }
            .map_err(|e| DeviceError::Ioctl("VIDIOC_STREAMOFF", e))?;
        Ok(())
    }

    /// Drains one pending event, if any. Any dequeue failure is treated as
    /// "no more events", which is what an empty event queue reports.
    pub fn dequeue_event(&self) -> Option<DeviceEvent> {
        // SAFETY: all-zero bytes are a valid v4l2_event.
        let mut event: uapi::v4l2_event = unsafe { mem::zeroed() };
        // SAFETY: valid fd, valid struct pointer.
        if unsafe { uapi::vidioc_dqevent(self.raw_fd(), &mut event) }.is_err() {
            return None;
        }
        Some(match event.type_ {
            uapi::V4L2_EVENT_SOURCE_CHANGE => DeviceEvent::SourceChange {
                resolution_changed: event.src_change_flags()
                    & uapi::V4L2_EVENT_SRC_CH_RESOLUTION
                    != 0,
            },
            uapi::V4L2_EVENT_EOS => DeviceEvent::EndOfStream,
            uapi::V4L2_EVENT_FRAME_SYNC => DeviceEvent::FrameSync,
            other => DeviceEvent::Unknown(other),
        })
    }

    /// Polls the device for the given readiness flags. A zero timeout is a
    /// non-blocking probe. The result is cached for the accessors below;
    /// a timeout leaves them all false.
    pub fn poll(&mut self, events: PollFlags, timeout_ms: u16) -> Result<(), DeviceError> {
        self.revents = PollFlags::empty();
        let mut fds = [PollFd::new(self.file.as_fd(), events)];
        let n = poll(&mut fds, PollTimeout::from(timeout_ms)).map_err(DeviceError::Poll)?;
        if n > 0 {
            self.revents = fds[0].revents().unwrap_or(PollFlags::empty());
        }
        Ok(())
    }

    pub fn has_event(&self) -> bool {
        self.revents.contains(PollFlags::POLLPRI)
    }

    pub fn has_error(&self) -> bool {
        self.revents.contains(PollFlags::POLLERR)
    }

    pub fn is_ready_for_read(&self) -> bool {
        self.revents.contains(PollFlags::POLLIN)
    }

    pub fn is_ready_for_write(&self) -> bool {
        self.revents.contains(PollFlags::POLLOUT)
    }
}

impl std::fmt::Debug for VideoDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VideoDevice").field("fd", &self.raw_fd()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_kind_maps_to_m2m_buffer_types() {
        // The decoder consumes on the V4L2 OUTPUT queue and produces on
        // CAPTURE; mixing these up queues compressed data as frames.
        assert_eq!(QueueKind::Input.buf_type(), 10);
        assert_eq!(QueueKind::Output.buf_type(), 9);
    }

    #[test]
    fn error_flag_detection() {
        let clean = DequeuedBuffer { index: 0, bytesused: 100, flags: 0 };
        let broken =
            DequeuedBuffer { index: 0, bytesused: 100, flags: uapi::V4L2_BUF_FLAG_ERROR };
        assert!(!clean.has_error());
        assert!(broken.has_error());
    }

    #[test]
    fn c_string_parsing() {
        assert_eq!(parse_c_str(b"bcm2835-codec\0\0\0"), "bcm2835-codec");
        assert_eq!(parse_c_str(b"full-length-name"), "full-length-name");
    }
}
