//! Per-frame pools of scratch records.

use std::sync::Arc;

use crate::render_mesh::RenderMesh;

struct Slot<T> {
    frame: u64,
    data: T,
}

/// Hands out records that are free for the current frame.
///
/// A record is taken once its tag differs from the live frame number, so
/// every record claimed in a previous frame is implicitly free again.
pub struct FrameDataHolder<T> {
    slots: Vec<Slot<T>>,
    next: usize,
    last_frame: Option<u64>,
}

impl<T: Default> Default for FrameDataHolder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> FrameDataHolder<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next: 0,
            last_frame: None,
        }
    }

    /// Returns an unused record and whether it was freshly created.
    pub fn get_unused_data(&mut self, frame: u64) -> (&mut T, bool) {
        if self.last_frame != Some(frame) {
            self.last_frame = Some(frame);
            self.next = 0;
        }

        while self.next < self.slots.len() && self.slots[self.next].frame == frame {
            self.next += 1;
        }

        let created = self.next == self.slots.len();
        if created {
            self.slots.push(Slot {
                frame,
                data: T::default(),
            });
        }

        let slot = &mut self.slots[self.next];
        slot.frame = frame;
        self.next += 1;
        (&mut slot.data, created)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.next = 0;
        self.last_frame = None;
    }
}

/// Pool of render meshes reused from frame to frame.
///
/// Records are shared with the render tree once filled; mutate them through
/// [`Arc::make_mut`], which only copies if last frame's tree is still alive.
#[derive(Default)]
pub struct RenderMeshHolder {
    meshes: FrameDataHolder<Arc<RenderMesh>>,
}

impl RenderMeshHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_unused_mesh(&mut self, frame: u64) -> (&mut Arc<RenderMesh>, bool) {
        self.meshes.get_unused_data(frame)
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_reused_across_frames() {
        let mut holder: FrameDataHolder<Vec<u32>> = FrameDataHolder::new();

        let (first, created) = holder.get_unused_data(1);
        assert!(created);
        first.push(1);
        let (_, created) = holder.get_unused_data(1);
        assert!(created);
        assert_eq!(holder.len(), 2);

        let (reused, created) = holder.get_unused_data(2);
        assert!(!created);
        assert_eq!(reused, &vec![1]);
        let (_, created) = holder.get_unused_data(2);
        assert!(!created);
        let (_, created) = holder.get_unused_data(2);
        assert!(created);
        assert_eq!(holder.len(), 3);
    }

    #[test]
    fn test_mesh_holder_make_mut() {
        let mut holder = RenderMeshHolder::new();
        let (slot, created) = holder.get_unused_mesh(7);
        assert!(created);
        Arc::make_mut(slot).name = "[portal]".into();
        let shared = slot.clone();

        // Last frame's tree still holds the mesh: mutation must not leak into it.
        let (slot, created) = holder.get_unused_mesh(8);
        assert!(!created);
        Arc::make_mut(slot).name = "[other]".into();
        assert_eq!(shared.name, "[portal]");
    }
}
