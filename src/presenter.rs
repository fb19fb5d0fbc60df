// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Validation and presentation of dequeued decoder output.
//!
//! The presenter sees every buffer the decoder hands back, in queue order.
//! It rejects buffers that cannot possibly hold a decoded frame; a rejected
//! buffer is still requeued by the pipeline so the driver regains ownership.
//! The frame counter counts dequeue attempts, not successful scan-outs,
//! matching the ordering guarantees of the decoder queue.

use thiserror::Error;

use crate::device::DequeuedBuffer;
use crate::display::DisplayError;
use crate::display::FrameInfo;
use crate::dmabuf::DmaBuffer;
use crate::pool::BufferPool;
use crate::Fourcc;
use crate::Resolution;

/// Luma value the pipeline pre-paints output buffers with.
pub const PREPAINT_LUMA: u8 = 16;
/// Chroma value the pipeline pre-paints output buffers with.
pub const PREPAINT_CHROMA: u8 = 128;

/// How far into the buffer the liveness probe looks, and at what stride.
const PROBE_WINDOW: usize = 1024;
const PROBE_STRIDE: usize = 64;

#[derive(Debug, Error)]
pub enum PresentError {
    #[error("output buffer index {0} out of range")]
    InvalidSlot(u32),
    #[error("decoder flagged buffer {0} as corrupt")]
    DecoderRejected(u32),
    #[error("buffer {index} too small: {got} < {need} bytes")]
    BufferTooSmall { index: u32, got: u32, need: u32 },
    #[error("buffer {0} still holds only pre-painted data")]
    BufferUntouched(u32),
    #[error(transparent)]
    Display(#[from] DisplayError),
}

/// Read-only view of the output pool the presenter validates against.
pub trait OutputSlots {
    fn slot_count(&self) -> usize;
    /// The slot's dma-buf fd, or `None` when the slot holds no buffer.
    fn slot_fd(&self, index: usize) -> Option<i32>;
    /// The slot's CPU mapping, or `None` when it is not mapped.
    fn slot_data(&self, index: usize) -> Option<&[u8]>;
}

impl OutputSlots for BufferPool {
    fn slot_count(&self) -> usize {
        self.count()
    }

    fn slot_fd(&self, index: usize) -> Option<i32> {
        self.buffer(index).map(DmaBuffer::fd)
    }

    fn slot_data(&self, index: usize) -> Option<&[u8]> {
        self.buffer(index).and_then(DmaBuffer::as_slice)
    }
}

/// Where accepted frames go: lazy zero-copy import of the slot on first
/// use, then scan-out. Implemented by the pipeline over its display
/// controller and import bookkeeping.
pub trait FrameOutput {
    fn prepare_slot(&mut self, index: usize) -> Result<(), DisplayError>;
    fn show(&mut self, frame: &FrameInfo) -> Result<(), DisplayError>;
}

/// True when every probed byte still carries the pre-paint luma sentinel,
/// meaning the decoder has not written the buffer yet. Probes the start of
/// the luma plane only; for any realistic frame size the first KiB is luma.
fn looks_prepainted(data: &[u8], bytes_used: usize) -> bool {
    let window = PROBE_WINDOW.min(bytes_used).min(data.len());
    let mut offset = 0;
    while offset + 1 < window {
        if data[offset] != PREPAINT_LUMA || data[offset + 1] != PREPAINT_LUMA {
            return false;
        }
        offset += PROBE_STRIDE;
    }
    true
}

/// Smallest payload a plausible 4:2:0 frame can have. Half the nominal
/// frame size leaves room for drivers that report compressed tail planes.
fn minimum_payload(size: Resolution) -> u32 {
    (size.width * size.height * 3 / 2) / 2
}

#[derive(Default)]
pub struct FramePresenter {
    frames: u64,
}

impl FramePresenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dequeue attempts seen so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Validates one dequeued output buffer and, with a display attached,
    /// imports its slot on first use and scans it out.
    pub fn present(
        &mut self,
        frame: DequeuedBuffer,
        slots: &dyn OutputSlots,
        size: Resolution,
        output: Option<&mut dyn FrameOutput>,
    ) -> Result<(), PresentError> {
        self.frames += 1;

        let index = frame.index as usize;
        if index >= slots.slot_count() {
            return Err(PresentError::InvalidSlot(frame.index));
        }
        let fd = match slots.slot_fd(index) {
            Some(fd) if fd >= 0 => fd,
            _ => return Err(PresentError::InvalidSlot(frame.index)),
        };
        let data = slots
            .slot_data(index)
            .ok_or(PresentError::InvalidSlot(frame.index))?;
        if frame.has_error() {
            return Err(PresentError::DecoderRejected(frame.index));
        }

        let need = minimum_payload(size);
        if frame.bytesused < need {
            return Err(PresentError::BufferTooSmall {
                index: frame.index,
                got: frame.bytesused,
                need,
            });
        }
        if looks_prepainted(data, frame.bytesused as usize) {
            return Err(PresentError::BufferUntouched(frame.index));
        }

        log::debug!(
            "frame #{} (buffer {}, {} bytes)",
            self.frames,
            frame.index,
            frame.bytesused
        );

        if let Some(output) = output {
            output.prepare_slot(index)?;
            output.show(&FrameInfo {
                fd,
                width: size.width,
                height: size.height,
                fourcc: Fourcc::YUV420,
                bytes_used: frame.bytesused,
                is_dmabuf: true,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSlots {
        data: Vec<Vec<u8>>,
    }

    impl FakeSlots {
        /// Slots pre-painted the way the pipeline paints them.
        fn prepainted(count: usize, size: Resolution) -> Self {
            let luma = (size.width * size.height) as usize;
            let mut slot = vec![PREPAINT_LUMA; luma];
            slot.extend(std::iter::repeat(PREPAINT_CHROMA).take(luma / 2));
            Self { data: vec![slot; count] }
        }
    }

    impl OutputSlots for FakeSlots {
        fn slot_count(&self) -> usize {
            self.data.len()
        }

        fn slot_fd(&self, index: usize) -> Option<i32> {
            self.data.get(index).map(|_| 40 + index as i32)
        }

        fn slot_data(&self, index: usize) -> Option<&[u8]> {
            self.data.get(index).map(Vec::as_slice)
        }
    }

    #[derive(Default)]
    struct RecordingOutput {
        prepared: Vec<usize>,
        shown: Vec<i32>,
    }

    impl FrameOutput for RecordingOutput {
        fn prepare_slot(&mut self, index: usize) -> Result<(), DisplayError> {
            self.prepared.push(index);
            Ok(())
        }

        fn show(&mut self, frame: &FrameInfo) -> Result<(), DisplayError> {
            assert!(frame.is_dmabuf);
            self.shown.push(frame.fd);
            Ok(())
        }
    }

    const SIZE: Resolution = Resolution { width: 64, height: 64 };

    fn decoded(index: u32, bytesused: u32) -> DequeuedBuffer {
        DequeuedBuffer { index, bytesused, flags: 0 }
    }

    #[test]
    fn accepts_a_decoded_frame_and_presents_it() {
        let mut slots = FakeSlots::prepainted(4, SIZE);
        slots.data[1][0] = 42;
        let mut output = RecordingOutput::default();
        let mut presenter = FramePresenter::new();

        presenter
            .present(decoded(1, 6144), &slots, SIZE, Some(&mut output))
            .unwrap();
        assert_eq!(presenter.frame_count(), 1);
        assert_eq!(output.prepared, vec![1]);
        assert_eq!(output.shown, vec![41]);
    }

    #[test]
    fn counter_tracks_attempts_not_successes() {
        let slots = FakeSlots::prepainted(4, SIZE);
        let mut presenter = FramePresenter::new();

        assert!(presenter.present(decoded(9, 6144), &slots, SIZE, None).is_err());
        assert!(presenter.present(decoded(0, 6144), &slots, SIZE, None).is_err());
        assert_eq!(presenter.frame_count(), 2);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let slots = FakeSlots::prepainted(4, SIZE);
        let mut presenter = FramePresenter::new();
        assert!(matches!(
            presenter.present(decoded(4, 6144), &slots, SIZE, None),
            Err(PresentError::InvalidSlot(4))
        ));
    }

    #[test]
    fn rejects_driver_error_flag() {
        let mut slots = FakeSlots::prepainted(4, SIZE);
        slots.data[0][0] = 42;
        let mut presenter = FramePresenter::new();
        let frame = DequeuedBuffer {
            index: 0,
            bytesused: 6144,
            flags: crate::device::uapi::V4L2_BUF_FLAG_ERROR,
        };
        assert!(matches!(
            presenter.present(frame, &slots, SIZE, None),
            Err(PresentError::DecoderRejected(0))
        ));
    }

    #[test]
    fn rejects_undersized_payload() {
        let mut slots = FakeSlots::prepainted(4, SIZE);
        slots.data[0][0] = 42;
        let mut presenter = FramePresenter::new();
        // Minimum for 64x64 is (64*64*3/2)/2 = 3072 bytes.
        assert!(matches!(
            presenter.present(decoded(0, 3071), &slots, SIZE, None),
            Err(PresentError::BufferTooSmall { need: 3072, .. })
        ));
        assert!(presenter.present(decoded(0, 3072), &slots, SIZE, None).is_ok());
    }

    #[test]
    fn rejects_untouched_buffer() {
        let slots = FakeSlots::prepainted(4, SIZE);
        let mut presenter = FramePresenter::new();
        assert!(matches!(
            presenter.present(decoded(2, 6144), &slots, SIZE, None),
            Err(PresentError::BufferUntouched(2))
        ));
    }

    #[test]
    fn prepaint_detection_law() {
        // All-sentinel at every probed position: untouched.
        let painted = vec![PREPAINT_LUMA; 4096];
        assert!(looks_prepainted(&painted, painted.len()));

        // One violating sample anywhere in the window: live content.
        let mut live = painted.clone();
        live[640] = 57;
        assert!(!looks_prepainted(&live, live.len()));

        // A violation between probe points goes unseen; the heuristic is a
        // sample, not a scan.
        let mut between = painted.clone();
        between[3] = 57;
        assert!(looks_prepainted(&between, between.len()));
    }
}
