// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-count pool of DMA-heap buffers bound to one decoder queue.
//!
//! Every slot is owned either by userspace or by the driver, never both;
//! `in_use` tracks driver ownership. Slot selection walks a rolling cursor
//! so reuse spreads round-robin across the pool instead of hammering slot 0.

use thiserror::Error;

use crate::device::DeviceError;
use crate::device::QueueKind;
use crate::device::VideoDevice;
use crate::dmabuf::AllocError;
use crate::dmabuf::DmaBuffer;
use crate::dmabuf::DmaHeapAllocator;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("failed to realize pool on device: {0}")]
    Device(#[from] DeviceError),
}

pub struct BufferPool {
    queue: QueueKind,
    count: usize,
    buffers: Vec<DmaBuffer>,
    in_use: Vec<bool>,
    cursor: usize,
}

impl BufferPool {
    pub fn new(queue: QueueKind, count: usize) -> Self {
        Self { queue, count, buffers: Vec::new(), in_use: vec![false; count], cursor: 0 }
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_allocated(&self) -> bool {
        !self.buffers.is_empty()
    }

    /// Mints and maps all `count` buffers at `size` bytes each. All-or-
    /// nothing: a mid-way failure releases everything allocated so far.
    pub fn allocate(
        &mut self,
        allocator: &DmaHeapAllocator,
        size: usize,
    ) -> Result<(), PoolError> {
        self.deallocate();
        for i in 0..self.count {
            let mut buffer = match allocator.allocate(size) {
                Ok(buffer) => buffer,
                Err(e) => {
                    log::error!("allocation of {} buffer {} failed: {}", self.queue, i, e);
                    self.deallocate();
                    return Err(e.into());
                }
            };
            if let Err(e) = buffer.map() {
                log::error!("mapping of {} buffer {} failed: {}", self.queue, i, e);
                self.deallocate();
                return Err(e.into());
            }
            self.buffers.push(buffer);
        }
        self.in_use = vec![false; self.count];
        self.cursor = 0;
        Ok(())
    }

    /// Unmaps and releases every buffer. The fds close here and nowhere
    /// else, no matter how many subsystems held views of them.
    pub fn deallocate(&mut self) {
        self.buffers.clear();
        self.in_use = vec![false; self.count];
        self.cursor = 0;
    }

    /// Asks the driver to prepare `count` DMABUF slots for this queue.
    pub fn request_on_device(&self, device: &VideoDevice) -> Result<(), PoolError> {
        let granted = device.request_buffers(self.queue, self.count as u32)?;
        if granted as usize != self.count {
            log::warn!(
                "driver granted {} {} buffers instead of {}",
                granted,
                self.queue,
                self.count
            );
        }
        Ok(())
    }

    /// Asks the driver to drop its slots for this queue. Failures are
    /// ignored; this runs on teardown and reset paths.
    pub fn release_on_device(&self, device: &VideoDevice) {
        if let Err(e) = device.request_buffers(self.queue, 0) {
            log::debug!("releasing {} buffers on device failed: {}", self.queue, e);
        }
    }

    /// Peeks the next free slot starting from the cursor. Does not commit
    /// the slot; callers do that with [`Self::mark_in_use`] once the driver
    /// actually owns it.
    pub fn get_free_buffer_index(&self) -> Option<usize> {
        (0..self.count)
            .map(|i| (self.cursor + i) % self.count)
            .find(|&idx| !self.in_use[idx])
    }

    /// Records driver ownership of a slot. The cursor only advances when
    /// the committed slot is the one it pointed at, which keeps selection
    /// round-robin without skipping slots freed out of order.
    pub fn mark_in_use(&mut self, index: usize) {
        if index < self.count {
            self.in_use[index] = true;
            if index == self.cursor % self.count {
                self.cursor = (index + 1) % self.count;
            }
        }
    }

    /// Records that the driver returned a slot. Out-of-range indices are
    /// ignored; a confused driver must not panic the pipeline.
    pub fn mark_free(&mut self, index: usize) {
        if index < self.count {
            self.in_use[index] = false;
        }
    }

    pub fn reset_usage(&mut self) {
        self.in_use = vec![false; self.count];
        self.cursor = 0;
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.iter().filter(|&&used| used).count()
    }

    pub fn buffer(&self, index: usize) -> Option<&DmaBuffer> {
        self.buffers.get(index)
    }

    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut DmaBuffer> {
        self.buffers.get_mut(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BufferPool {
        BufferPool::new(QueueKind::Input, 4)
    }

    #[test]
    fn peek_does_not_mutate() {
        let pool = pool();
        assert_eq!(pool.get_free_buffer_index(), Some(0));
        assert_eq!(pool.get_free_buffer_index(), Some(0));
        assert_eq!(pool.in_use_count(), 0);
    }

    #[test]
    fn selection_is_round_robin() {
        let mut pool = pool();
        for expected in 0..4 {
            let idx = pool.get_free_buffer_index().unwrap();
            assert_eq!(idx, expected);
            pool.mark_in_use(idx);
        }
        assert_eq!(pool.get_free_buffer_index(), None);

        // Freeing slot 1 makes it the only candidate even though the cursor
        // has wrapped to 0.
        pool.mark_free(1);
        assert_eq!(pool.get_free_buffer_index(), Some(1));
    }

    #[test]
    fn cursor_only_advances_past_its_own_slot() {
        let mut pool = pool();
        // Committing a slot the cursor does not point at leaves the cursor
        // alone, so the pointed-at slot is still preferred.
        pool.mark_in_use(2);
        assert_eq!(pool.get_free_buffer_index(), Some(0));
        pool.mark_in_use(0);
        assert_eq!(pool.get_free_buffer_index(), Some(1));
    }

    #[test]
    fn out_of_range_marks_are_ignored() {
        let mut pool = pool();
        pool.mark_in_use(17);
        pool.mark_free(17);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.get_free_buffer_index(), Some(0));
    }

    #[test]
    fn ownership_accounting_balances() {
        // |enqueued| - |dequeued| = |in_use| over an arbitrary interleaving.
        let mut pool = pool();
        let mut enqueued = 0usize;
        let mut dequeued = 0usize;

        for round in 0..3 {
            while let Some(idx) = pool.get_free_buffer_index() {
                pool.mark_in_use(idx);
                enqueued += 1;
            }
            for idx in 0..=round {
                pool.mark_free(idx);
                dequeued += 1;
            }
            assert_eq!(enqueued - dequeued, pool.in_use_count());
        }
    }

    #[test]
    fn reset_clears_usage_and_cursor() {
        let mut pool = pool();
        pool.mark_in_use(0);
        pool.mark_in_use(1);
        pool.reset_usage();
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.get_free_buffer_index(), Some(0));
    }
}
