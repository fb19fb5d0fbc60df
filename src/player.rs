// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffered playback between a receiver callback thread and the decoder.
//!
//! Incoming access units land in a small bounded queue; when the queue is
//! full the oldest unit is dropped, which keeps playback live at the cost
//! of a skipped frame. The decoder thread owns the whole decode pipeline,
//! so the single-threaded device contract never needs a lock, and it holds
//! back until the stream has produced a sequence parameter set, since the
//! hardware decoder cannot start on a slice without one.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use thiserror::Error;

use crate::pipeline::DecodePipeline;
use crate::pipeline::PipelineConfig;
use crate::pipeline::PipelineError;

/// Frames buffered between the receiver and the decoder. Small enough to
/// keep latency in check; overflow drops the oldest frame.
const QUEUE_CAPACITY: usize = 5;

/// NAL unit type of a sequence parameter set.
const NAL_TYPE_SPS: u8 = 7;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Init(#[from] PipelineError),
    #[error("decoder thread exited before reporting readiness")]
    ThreadStartup,
}

/// One complete H.264 access unit with its RTP timestamp, as delivered by
/// the external receiver.
#[derive(Clone, Debug)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub timestamp: u32,
}

/// Scans a byte-stream access unit for an SPS NAL unit, walking both the
/// four- and three-byte start code forms.
pub fn contains_sps(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        let start_code_len = if i + 4 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            4
        } else if data[i..i + 3] == [0, 0, 1] {
            3
        } else {
            i += 1;
            continue;
        };
        let header = i + start_code_len;
        if header < data.len() && data[header] & 0x1f == NAL_TYPE_SPS {
            return true;
        }
        i += start_code_len;
    }
    false
}

struct Shared {
    queue: Mutex<VecDeque<AccessUnit>>,
    available: Condvar,
    running: AtomicBool,
    has_sps: AtomicBool,
    frames_dropped: AtomicU64,
    decoded_frames: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            running: AtomicBool::new(true),
            has_sps: AtomicBool::new(false),
            frames_dropped: AtomicU64::new(0),
            decoded_frames: AtomicU64::new(0),
        }
    }

    fn enqueue(&self, unit: AccessUnit) {
        if unit.data.is_empty() {
            return;
        }

        if !self.has_sps.load(Ordering::Acquire) && contains_sps(&unit.data) {
            log::info!("sequence parameter set received, decoder can start");
            self.has_sps.store(true, Ordering::Release);
        }

        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= QUEUE_CAPACITY {
                queue.pop_front();
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(unit);
        }
        self.available.notify_one();
    }
}

/// Handle given to the receiver thread; cheap to clone.
#[derive(Clone)]
pub struct PlayerHandle(Arc<Shared>);

impl PlayerHandle {
    /// Receiver callback entry point: hands one access unit to the decoder
    /// thread. The payload is copied into the queue, so the caller may
    /// reuse its buffer immediately.
    pub fn push(&self, unit: AccessUnit) {
        self.0.enqueue(unit);
    }
}

pub struct PlaybackLoop {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackLoop {
    /// Spawns the decoder thread and initializes the pipeline on it. Does
    /// not return until initialization succeeded or failed.
    pub fn start(config: PipelineConfig) -> Result<Self, PlayerError> {
        let shared = Arc::new(Shared::new());
        let thread_shared = shared.clone();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("decoder".to_string())
            .spawn(move || {
                raise_thread_priority();
                let pipeline = match DecodePipeline::initialize(config) {
                    Ok(pipeline) => {
                        let _ = ready_tx.send(Ok(()));
                        pipeline
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                decode_loop(&thread_shared, pipeline);
            })
            .expect("failed to spawn decoder thread");

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { shared, thread: Some(thread) }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e.into())
            }
            Err(_) => {
                let _ = thread.join();
                Err(PlayerError::ThreadStartup)
            }
        }
    }

    pub fn handle(&self) -> PlayerHandle {
        PlayerHandle(self.shared.clone())
    }

    pub fn decoded_frames(&self) -> u64 {
        self.shared.decoded_frames.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.shared.frames_dropped.load(Ordering::Relaxed)
    }

    /// Signals the decoder thread to finish and joins it. The thread first
    /// decodes whatever is still queued.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.available.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PlaybackLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Asks the scheduler for real-time FIFO priority on the calling thread.
/// Decode deadlines are per-frame, so losing the CPU to a background task
/// shows up as a visible stutter. Refusal (no privileges) is only a warning.
fn raise_thread_priority() {
    // SAFETY: plain libc calls with a valid param struct; pid 0 addresses
    // the calling thread.
    unsafe {
        let priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let param = libc::sched_param { sched_priority: priority };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            log::warn!(
                "cannot raise decoder thread to SCHED_FIFO (run with privileges?): {}",
                Errno::last()
            );
        } else {
            log::info!("decoder thread running at real-time priority");
        }
    }
}

fn decode_loop(shared: &Shared, mut pipeline: DecodePipeline) {
    log::info!("decode loop starting (queue capacity {})", QUEUE_CAPACITY);

    while shared.running.load(Ordering::Acquire) && !shared.has_sps.load(Ordering::Acquire) {
        log::info!("waiting for a sequence parameter set");
        thread::sleep(Duration::from_secs(1));
    }

    loop {
        let unit = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(unit) = queue.pop_front() {
                    break unit;
                }
                if !shared.running.load(Ordering::Acquire) {
                    drop(queue);
                    finish(shared, &mut pipeline);
                    return;
                }
                queue = shared.available.wait(queue).unwrap();
            }
        };

        match pipeline.decode(&unit.data) {
            Ok(()) => {
                let decoded = shared.decoded_frames.fetch_add(1, Ordering::Relaxed) + 1;
                if decoded == 1 {
                    log::info!("first frame decoded and displayed");
                } else if decoded % 100 == 0 {
                    log::info!("{} frames decoded", decoded);
                }
            }
            Err(e) => log::warn!("failed to decode access unit of {} bytes: {}", unit.data.len(), e),
        }
    }
}

fn finish(shared: &Shared, pipeline: &mut DecodePipeline) {
    if shared.decoded_frames.load(Ordering::Relaxed) > 0 {
        if let Err(e) = pipeline.flush() {
            log::warn!("decoder flush on shutdown failed: {}", e);
        }
    }
    log::info!("decode loop finished after {} frames", pipeline.decoded_frame_count());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(tag: u8) -> AccessUnit {
        AccessUnit { data: vec![0, 0, 0, 1, tag], timestamp: tag as u32 * 3000 }
    }

    #[test]
    fn sps_detection_with_long_start_code() {
        // NAL header 0x67: nal_ref_idc 3, type 7 (SPS).
        assert!(contains_sps(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f]));
    }

    #[test]
    fn sps_detection_with_short_start_code() {
        assert!(contains_sps(&[0, 0, 1, 0x67, 0x42]));
    }

    #[test]
    fn sps_detection_mid_stream() {
        // A slice NAL followed by an SPS in the same access unit.
        let mut data = vec![0, 0, 0, 1, 0x41, 0xaa, 0xbb];
        data.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42]);
        assert!(contains_sps(&data));
    }

    #[test]
    fn non_sps_units_do_not_open_the_gate() {
        // Types 1 (slice) and 6 (SEI) must not be mistaken for an SPS.
        assert!(!contains_sps(&[0, 0, 0, 1, 0x41, 0x9a]));
        assert!(!contains_sps(&[0, 0, 0, 1, 0x06, 0x05]));
        assert!(!contains_sps(&[]));
        assert!(!contains_sps(&[0, 0]));
    }

    #[test]
    fn gate_stays_closed_without_sps() {
        let shared = Shared::new();
        for tag in [0x41, 0x06, 0x41, 0x41, 0x06] {
            shared.enqueue(unit(tag));
        }
        assert!(!shared.has_sps.load(Ordering::Acquire));
        assert_eq!(shared.queue.lock().unwrap().len(), 5);
    }

    #[test]
    fn gate_opens_on_sps() {
        let shared = Shared::new();
        shared.enqueue(unit(0x41));
        assert!(!shared.has_sps.load(Ordering::Acquire));
        shared.enqueue(unit(0x67));
        assert!(shared.has_sps.load(Ordering::Acquire));
    }

    #[test]
    fn overflow_drops_the_oldest() {
        let shared = Shared::new();
        for timestamp in 0..7u8 {
            shared.enqueue(AccessUnit { data: vec![0x41], timestamp: timestamp as u32 });
        }

        let queue = shared.queue.lock().unwrap();
        assert_eq!(queue.len(), QUEUE_CAPACITY);
        assert_eq!(shared.frames_dropped.load(Ordering::Relaxed), 2);
        // The first two units are gone; order of the survivors is intact.
        let timestamps: Vec<u32> = queue.iter().map(|u| u.timestamp).collect();
        assert_eq!(timestamps, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn empty_units_are_ignored() {
        let shared = Shared::new();
        shared.enqueue(AccessUnit { data: vec![], timestamp: 0 });
        assert!(shared.queue.lock().unwrap().is_empty());
    }
}
