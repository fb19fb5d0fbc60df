// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Streaming state machine for the two decoder queues.
//!
//! Starting a stream pre-queues every output slot (the decoder's scratch
//! area for decoded frames), then streams on input followed by output,
//! rolling the input queue back if the output queue refuses. Stopping is
//! best-effort and always lands in `Stopped`.

use std::thread::sleep;
use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceError;
use crate::device::QueueKind;

/// Settle time after stream-off so in-flight driver work can retire.
const STOP_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("failed to pre-queue output buffers: {0}")]
    QueueOutputs(#[source] DeviceError),
    #[error("failed to start streaming: {0}")]
    StreamOn(#[source] DeviceError),
}

/// The device-facing operations the controller sequences. The pipeline
/// implements this over its device and output pool; tests use a mock.
pub trait StreamTarget {
    /// Queues every output-pool slot to the driver.
    fn queue_output_slots(&mut self) -> Result<(), DeviceError>;
    fn stream_on(&mut self, queue: QueueKind) -> Result<(), DeviceError>;
    fn stream_off(&mut self, queue: QueueKind) -> Result<(), DeviceError>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Starting,
    Active,
    Stopping,
    Error,
}

pub struct StreamingController {
    state: StreamState,
}

impl Default for StreamingController {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingController {
    pub fn new() -> Self {
        Self { state: StreamState::Stopped }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == StreamState::Active
    }

    /// Forces the controller back to `Stopped` without touching the device.
    /// Used by the full-reset path after queues have been torn down.
    pub fn force_stopped(&mut self) {
        self.state = StreamState::Stopped;
    }

    /// Brings both queues up. Calling this while already active is an
    /// idempotent success.
    pub fn start(&mut self, target: &mut dyn StreamTarget) -> Result<(), StreamingError> {
        if self.state == StreamState::Active {
            log::debug!("streaming already active");
            return Ok(());
        }
        self.state = StreamState::Starting;

        if let Err(e) = target.queue_output_slots() {
            self.state = StreamState::Error;
            return Err(StreamingError::QueueOutputs(e));
        }

        if let Err(e) = target.stream_on(QueueKind::Input) {
            self.state = StreamState::Error;
            return Err(StreamingError::StreamOn(e));
        }
        if let Err(e) = target.stream_on(QueueKind::Output) {
            // Leave no queue half-started behind.
            if let Err(off) = target.stream_off(QueueKind::Input) {
                log::warn!("rollback of input streaming failed: {}", off);
            }
            self.state = StreamState::Error;
            return Err(StreamingError::StreamOn(e));
        }

        self.state = StreamState::Active;
        log::info!("streaming started");
        Ok(())
    }

    /// Takes both queues down. Stream-off failures are logged and ignored;
    /// the controller always ends up `Stopped`.
    pub fn stop(&mut self, target: &mut dyn StreamTarget) {
        if self.state == StreamState::Stopped {
            return;
        }
        self.state = StreamState::Stopping;

        if let Err(e) = target.stream_off(QueueKind::Output) {
            log::debug!("output stream-off failed: {}", e);
        }
        if let Err(e) = target.stream_off(QueueKind::Input) {
            log::debug!("input stream-off failed: {}", e);
        }

        self.state = StreamState::Stopped;
        sleep(STOP_SETTLE);
        log::info!("streaming stopped");
    }
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Op {
        QueueOutputs,
        On(QueueKind),
        Off(QueueKind),
    }

    #[derive(Default)]
    struct MockTarget {
        ops: Vec<Op>,
        fail_queue_outputs: bool,
        fail_output_stream_on: bool,
    }

    impl StreamTarget for MockTarget {
        fn queue_output_slots(&mut self) -> Result<(), DeviceError> {
            self.ops.push(Op::QueueOutputs);
            if self.fail_queue_outputs {
                Err(DeviceError::Ioctl("VIDIOC_QBUF", Errno::EINVAL))
            } else {
                Ok(())
            }
        }

        fn stream_on(&mut self, queue: QueueKind) -> Result<(), DeviceError> {
            self.ops.push(Op::On(queue));
            if self.fail_output_stream_on && queue == QueueKind::Output {
                Err(DeviceError::Ioctl("VIDIOC_STREAMON", Errno::EIO))
            } else {
                Ok(())
            }
        }

        fn stream_off(&mut self, queue: QueueKind) -> Result<(), DeviceError> {
            self.ops.push(Op::Off(queue));
            Ok(())
        }
    }

    #[test]
    fn start_sequences_prequeue_then_both_queues() {
        let mut target = MockTarget::default();
        let mut controller = StreamingController::new();
        controller.start(&mut target).unwrap();

        assert_eq!(
            target.ops,
            vec![Op::QueueOutputs, Op::On(QueueKind::Input), Op::On(QueueKind::Output)]
        );
        assert!(controller.is_active());
    }

    #[test]
    fn start_is_idempotent_when_active() {
        let mut target = MockTarget::default();
        let mut controller = StreamingController::new();
        controller.start(&mut target).unwrap();
        let ops_after_first = target.ops.len();

        controller.start(&mut target).unwrap();
        assert_eq!(target.ops.len(), ops_after_first);
        assert!(controller.is_active());
    }

    #[test]
    fn output_stream_on_failure_rolls_back_input() {
        let mut target = MockTarget { fail_output_stream_on: true, ..Default::default() };
        let mut controller = StreamingController::new();

        assert!(matches!(
            controller.start(&mut target),
            Err(StreamingError::StreamOn(_))
        ));
        assert_eq!(controller.state(), StreamState::Error);
        assert_eq!(target.ops.last(), Some(&Op::Off(QueueKind::Input)));
    }

    #[test]
    fn prequeue_failure_enters_error_state() {
        let mut target = MockTarget { fail_queue_outputs: true, ..Default::default() };
        let mut controller = StreamingController::new();

        assert!(matches!(
            controller.start(&mut target),
            Err(StreamingError::QueueOutputs(_))
        ));
        assert_eq!(controller.state(), StreamState::Error);
        // Nothing was streamed on, so nothing to roll back.
        assert_eq!(target.ops, vec![Op::QueueOutputs]);
    }

    #[test]
    fn restart_after_error_is_allowed() {
        let mut target = MockTarget { fail_output_stream_on: true, ..Default::default() };
        let mut controller = StreamingController::new();
        let _ = controller.start(&mut target);
        assert_eq!(controller.state(), StreamState::Error);

        target.fail_output_stream_on = false;
        controller.start(&mut target).unwrap();
        assert!(controller.is_active());
    }

    #[test]
    fn stop_takes_output_down_first_and_lands_stopped() {
        let mut target = MockTarget::default();
        let mut controller = StreamingController::new();
        controller.start(&mut target).unwrap();
        target.ops.clear();

        controller.stop(&mut target);
        assert_eq!(target.ops, vec![Op::Off(QueueKind::Output), Op::Off(QueueKind::Input)]);
        assert_eq!(controller.state(), StreamState::Stopped);
    }

    #[test]
    fn stop_when_stopped_is_a_no_op() {
        let mut target = MockTarget::default();
        let mut controller = StreamingController::new();
        controller.stop(&mut target);
        assert!(target.ops.is_empty());
    }
}
