//! Deferred destruction of GPU objects.
//!
//! GPU commands execute asynchronously, up to `MAX_FRAMES_IN_FLIGHT - 1` frames
//! behind the CPU. An object dropped on the CPU may still be referenced by a
//! submission the device has not finished, so it cannot be destroyed right away.
//!
//! ```text
//! Drop(resource)
//!   -> DeletionSink::queue_object_deletion
//!   -> DeletionQueue of the slot whose work may reference the object
//!
//! begin_frame (slot i, after waiting slot i's fence)
//!   -> DeletionQueue::flush: destroy every queued object, in enqueue order
//! ```
//!
//! An object queued on slot `i` is therefore destroyed only after the next
//! submission of slot `i` has been proven complete.

use std::sync::Arc;

use crate::backend::{GpuBackend, GpuObject};
use crate::profiling::profile_function;

use super::FrameShared;

/// Objects waiting for their slot to be reclaimed.
#[derive(Debug, Default)]
pub struct DeletionQueue {
    objects: Vec<GpuObject>,
    /// Set once the device is idle for good; later enqueues destroy immediately.
    closed: bool,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object to be destroyed at the next flush.
    pub fn queue(&mut self, object: GpuObject) {
        log::trace!("Queued {} {:#x} for deletion", object.kind(), object.raw());
        self.objects.push(object);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Destroy every queued object in enqueue order and empty the queue.
    ///
    /// Only valid once the device has finished all work that may reference
    /// the queued objects. Returns the number of objects destroyed.
    pub(crate) fn flush(&mut self, backend: &dyn GpuBackend) -> usize {
        profile_function!();
        let count = self.objects.len();
        for object in self.objects.drain(..) {
            backend.destroy(object);
        }
        count
    }

    /// Flush and refuse further deferral. Used at shutdown after the device is idle.
    pub(crate) fn close(&mut self, backend: &dyn GpuBackend) -> usize {
        self.closed = true;
        self.flush(backend)
    }
}

/// Capability to hand GPU objects over for deferred destruction.
///
/// Resource wrappers receive a sink at construction and call
/// [`DeletionSink::queue_object_deletion`] from their `Drop`. The sink
/// appends to the deletion queue of the slot whose submitted or in-progress
/// work may still reference the object:
///
/// - while a frame is being recorded, the current slot
/// - between frames, the most recently submitted slot
///
/// Once the owning [`crate::FrameCore`] has been dropped (and the device
/// drained), objects are destroyed immediately.
#[derive(Clone)]
pub struct DeletionSink {
    shared: Arc<FrameShared>,
}

impl std::fmt::Debug for DeletionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionSink").finish_non_exhaustive()
    }
}

impl DeletionSink {
    pub(crate) fn new(shared: Arc<FrameShared>) -> Self {
        Self { shared }
    }

    /// Defer destruction of `object` until no pending GPU work can reference it.
    pub fn queue_object_deletion(&self, object: GpuObject) {
        let slot = &self.shared.slots[self.shared.deletion_slot_index()];
        let mut queue = slot.deletion.lock();
        if queue.is_closed() {
            self.shared.backend.destroy(object);
        } else {
            queue.queue(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::ObjectKind;

    #[test]
    fn test_flush_destroys_in_enqueue_order() {
        let backend = DummyBackend::new();
        let mut queue = DeletionQueue::new();
        let objects = [
            backend.create_object(ObjectKind::Pipeline),
            backend.create_object(ObjectKind::Sampler),
            backend.create_object(ObjectKind::TextureView),
        ];
        for object in objects {
            queue.queue(object);
        }
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.flush(&backend), 3);
        assert!(queue.is_empty());
        assert_eq!(backend.destroyed_objects(), objects.to_vec());

        // A second flush has nothing left to destroy.
        assert_eq!(queue.flush(&backend), 0);
        assert!(backend.violations().is_empty());
    }

    #[test]
    fn test_close_marks_queue() {
        let backend = DummyBackend::new();
        let mut queue = DeletionQueue::new();
        queue.queue(backend.create_object(ObjectKind::Event));

        assert_eq!(queue.close(&backend), 1);
        assert!(queue.is_closed());
        assert_eq!(backend.live_count(ObjectKind::Event), 0);
    }
}
