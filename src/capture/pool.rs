//! Consumer-provided buffer pool with an explicit ownership token.
//!
//! Buffers enter the pool with `add_buffer` and leave with `remove_buffer`;
//! both come from the consumer. Between a render and the consumer's release
//! a buffer belongs to the consumer and is never written. The only legal
//! token cycle is Free -> Producer -> Consumer -> Free.

use std::os::fd::OwnedFd;

use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::debug;

use crate::utils::Size;

/// Pool-local buffer identifier, also used on the bus to name the buffer in
/// frame hand-offs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// One plane of a DMA-BUF backed buffer.
#[derive(Debug)]
pub struct DmabufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// Backing memory of a capture buffer.
#[derive(Debug)]
pub enum BufferBacking {
    /// GPU buffer; the pipeline blits into it and never touches bytes.
    Dmabuf {
        planes: Vec<DmabufPlane>,
        modifier: DrmModifier,
    },
    /// CPU-visible linear buffer with stride = width * bytes per pixel.
    Shm { data: Vec<u8> },
}

/// Which side may touch the buffer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    Free,
    Producer,
    Consumer,
}

#[derive(Debug)]
pub struct CaptureBuffer {
    id: BufferId,
    pub(crate) backing: BufferBacking,
    size: Size<i32>,
    stride: u32,
    fourcc: DrmFourcc,
    owner: BufferOwner,
}

impl CaptureBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> Size<i32> {
        self.size
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> DrmFourcc {
        self.fourcc
    }

    pub fn owner(&self) -> BufferOwner {
        self.owner
    }

    /// Mutable bytes of a shared-memory buffer, `None` for DMA-BUF.
    pub fn shm_data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.backing {
            BufferBacking::Shm { data } => Some(data.as_mut_slice()),
            BufferBacking::Dmabuf { .. } => None,
        }
    }

    /// Read-only bytes of a shared-memory buffer, `None` for DMA-BUF.
    pub fn shm_data(&self) -> Option<&[u8]> {
        match &self.backing {
            BufferBacking::Shm { data } => Some(data.as_slice()),
            BufferBacking::Dmabuf { .. } => None,
        }
    }
}

/// The per-stream pool. Never blocks: a full pool drops the frame and
/// counts it.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Vec<CaptureBuffer>,
    next_id: u32,
    dropped: u64,
}

impl BufferPool {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Frames dropped because no buffer was free.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    pub(crate) fn record_drop(&mut self) {
        self.dropped += 1;
    }

    /// Register a consumer buffer. The id is assigned by the pool and
    /// reported back on every frame hand-off.
    pub fn add_buffer(
        &mut self,
        backing: BufferBacking,
        size: Size<i32>,
        stride: u32,
        fourcc: DrmFourcc,
    ) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.buffers.push(CaptureBuffer {
            id,
            backing,
            size,
            stride,
            fourcc,
            owner: BufferOwner::Free,
        });
        id
    }

    /// Drop a buffer from the pool. A buffer currently held by the
    /// producer finishes its render into discarded memory first.
    pub fn remove_buffer(&mut self, id: BufferId) {
        self.buffers.retain(|b| b.id != id);
    }

    /// Claim a free buffer for the producer. Never blocks.
    pub fn acquire_free(&mut self) -> Option<&mut CaptureBuffer> {
        let buffer = self.buffers.iter_mut().find(|b| b.owner == BufferOwner::Free)?;
        buffer.owner = BufferOwner::Producer;
        Some(buffer)
    }

    /// Hand a rendered buffer to the consumer.
    pub fn to_consumer(&mut self, id: BufferId) {
        let Some(buffer) = self.buffers.iter_mut().find(|b| b.id == id) else {
            return;
        };
        debug_assert_eq!(buffer.owner, BufferOwner::Producer, "hand-off outside the token cycle");
        buffer.owner = BufferOwner::Consumer;
    }

    /// Consumer released the buffer. A release of a buffer the consumer
    /// does not hold is a consumer bug and is ignored.
    pub fn release(&mut self, id: BufferId) {
        let Some(buffer) = self.buffers.iter_mut().find(|b| b.id == id) else {
            debug!(?id, "release of an unknown buffer");
            return;
        };
        if buffer.owner != BufferOwner::Consumer {
            debug!(?id, owner = ?buffer.owner, "release outside the token cycle");
            return;
        }
        buffer.owner = BufferOwner::Free;
    }

    /// Abort a claimed render, returning the buffer to the free set.
    pub(crate) fn abandon(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.iter_mut().find(|b| b.id == id) {
            debug_assert_eq!(buffer.owner, BufferOwner::Producer);
            buffer.owner = BufferOwner::Free;
        }
    }

    pub fn get(&self, id: BufferId) -> Option<&CaptureBuffer> {
        self.buffers.iter().find(|b| b.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: BufferId) -> Option<&mut CaptureBuffer> {
        self.buffers.iter_mut().find(|b| b.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shm_pool(count: usize) -> BufferPool {
        let mut pool = BufferPool::new();
        for _ in 0..count {
            pool.add_buffer(
                BufferBacking::Shm {
                    data: vec![0; 100 * 100 * 4],
                },
                Size::from((100, 100)),
                400,
                DrmFourcc::Xrgb8888,
            );
        }
        pool
    }

    #[test]
    fn token_cycle() {
        let mut pool = shm_pool(2);
        let id = pool.acquire_free().unwrap().id();
        assert_eq!(pool.get(id).unwrap().owner(), BufferOwner::Producer);
        pool.to_consumer(id);
        assert_eq!(pool.get(id).unwrap().owner(), BufferOwner::Consumer);
        pool.release(id);
        assert_eq!(pool.get(id).unwrap().owner(), BufferOwner::Free);
    }

    #[test]
    fn exhausted_pool_never_blocks() {
        let mut pool = shm_pool(2);
        let a = pool.acquire_free().unwrap().id();
        let b = pool.acquire_free().unwrap().id();
        assert_ne!(a, b);
        assert!(pool.acquire_free().is_none());
        pool.to_consumer(a);
        assert!(pool.acquire_free().is_none());
        pool.release(a);
        assert_eq!(pool.acquire_free().unwrap().id(), a);
    }

    #[test]
    fn double_release_is_ignored() {
        let mut pool = shm_pool(1);
        let id = pool.acquire_free().unwrap().id();
        pool.to_consumer(id);
        pool.release(id);
        pool.release(id);
        assert_eq!(pool.get(id).unwrap().owner(), BufferOwner::Free);
    }
}
