//! Mock implementation of RenderContext for testing.
//!
//! Records resource creation without touching a GPU, and can be told to fail
//! upcoming allocations so allocation-failure paths can be exercised.

use std::collections::HashMap;

use crate::{gpu_types::*, render_context::RenderContext};
use parking_lot::Mutex;
use wgpu::*;

/// Records a GPU operation call for verification in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderCall {
    CreateBuffer {
        size: u64,
        usage: BufferUsages,
    },
    WriteBuffer {
        buffer_id: usize,
        offset: u64,
        size: usize,
    },
    CreateTexture {
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsages,
        label: Option<String>,
    },
    /// A creation request that was refused by failure injection.
    FailedAllocation,
}

#[derive(Default)]
struct MockState {
    calls: Vec<RenderCall>,
    next_buffer_id: usize,
    next_texture_id: usize,
    buffer_contents: HashMap<usize, Vec<u8>>,
    failing_texture_creates: usize,
    failing_buffer_creates: usize,
}

/// Mock implementation of RenderContext for testing.
///
/// Uses a `parking_lot::Mutex` so `&self` methods can record calls while the
/// type stays `Send + Sync`.
///
/// # Example
///
/// ```rust
/// use portalis_test_utils::{MockRenderContext, RenderContext};
/// use wgpu::*;
///
/// let mock = MockRenderContext::new();
/// mock.fail_next_texture_creates(1);
///
/// let desc = TextureDescriptor {
///     label: None,
///     size: Extent3d { width: 8, height: 8, depth_or_array_layers: 1 },
///     mip_level_count: 1,
///     sample_count: 1,
///     dimension: TextureDimension::D2,
///     format: TextureFormat::Rgba8Unorm,
///     usage: TextureUsages::RENDER_ATTACHMENT,
///     view_formats: &[],
/// };
/// assert!(mock.create_texture(&desc).is_none());
/// assert!(mock.create_texture(&desc).is_some());
/// assert_eq!(mock.count_texture_creates(), 1);
/// ```
pub struct MockRenderContext {
    state: Mutex<MockState>,
}

impl MockRenderContext {
    /// Create a new mock render context.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Get a copy of all recorded calls (for test assertions).
    pub fn calls(&self) -> Vec<RenderCall> {
        self.state.lock().calls.clone()
    }

    /// Make the next `count` texture creations fail.
    pub fn fail_next_texture_creates(&self, count: usize) {
        self.state.lock().failing_texture_creates = count;
    }

    /// Make the next `count` buffer creations fail.
    pub fn fail_next_buffer_creates(&self, count: usize) {
        self.state.lock().failing_buffer_creates = count;
    }

    pub fn count_buffer_creates(&self) -> usize {
        self.count(|call| matches!(call, RenderCall::CreateBuffer { .. }))
    }

    pub fn count_buffer_writes(&self) -> usize {
        self.count(|call| matches!(call, RenderCall::WriteBuffer { .. }))
    }

    pub fn count_texture_creates(&self) -> usize {
        self.count(|call| matches!(call, RenderCall::CreateTexture { .. }))
    }

    pub fn count_failed_allocations(&self) -> usize {
        self.count(|call| matches!(call, RenderCall::FailedAllocation))
    }

    /// Last bytes written to a mock buffer, laid out from offset zero.
    pub fn buffer_contents(&self, buffer: &GpuBuffer) -> Option<Vec<u8>> {
        let id = buffer.mock_id()?;
        self.state.lock().buffer_contents.get(&id).cloned()
    }

    /// Clear recorded calls (useful between test steps).
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Get total number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    fn count(&self, predicate: impl Fn(&RenderCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }
}

impl Default for MockRenderContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderContext for MockRenderContext {
    fn create_buffer(&self, desc: &BufferDescriptor) -> Option<GpuBuffer> {
        let mut state = self.state.lock();
        if state.failing_buffer_creates > 0 {
            state.failing_buffer_creates -= 1;
            state.calls.push(RenderCall::FailedAllocation);
            return None;
        }

        let id = state.next_buffer_id;
        state.next_buffer_id += 1;
        state.calls.push(RenderCall::CreateBuffer {
            size: desc.size,
            usage: desc.usage,
        });

        Some(GpuBuffer::mock(id, desc.size))
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) {
        let Some(buffer_id) = buffer.mock_id() else {
            return;
        };

        let mut state = self.state.lock();
        state.calls.push(RenderCall::WriteBuffer {
            buffer_id,
            offset,
            size: data.len(),
        });

        let contents = state.buffer_contents.entry(buffer_id).or_default();
        let start = offset as usize;
        if contents.len() < start + data.len() {
            contents.resize(start + data.len(), 0);
        }
        contents[start..start + data.len()].copy_from_slice(data);
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Option<GpuTexture> {
        let mut state = self.state.lock();
        if state.failing_texture_creates > 0 {
            state.failing_texture_creates -= 1;
            state.calls.push(RenderCall::FailedAllocation);
            return None;
        }

        let id = state.next_texture_id;
        state.next_texture_id += 1;
        state.calls.push(RenderCall::CreateTexture {
            width: desc.size.width,
            height: desc.size.height,
            format: desc.format,
            usage: desc.usage,
            label: desc.label.map(str::to_string),
        });

        Some(GpuTexture::mock(
            id,
            desc.size.width,
            desc.size.height,
            desc.format,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_desc(size: u64) -> BufferDescriptor<'static> {
        BufferDescriptor {
            label: Some("test"),
            size,
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }
    }

    #[test]
    fn test_write_buffer_keeps_contents() {
        let mock = MockRenderContext::new();
        let buffer = mock.create_buffer(&buffer_desc(8)).unwrap();
        mock.write_buffer(&buffer, 0, &[1, 2, 3, 4]);
        mock.write_buffer(&buffer, 4, &[5, 6, 7, 8]);

        assert_eq!(mock.buffer_contents(&buffer), Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(mock.count_buffer_writes(), 2);
    }

    #[test]
    fn test_buffer_failure_injection() {
        let mock = MockRenderContext::new();
        mock.fail_next_buffer_creates(2);
        assert!(mock.create_buffer(&buffer_desc(4)).is_none());
        assert!(mock.create_buffer(&buffer_desc(4)).is_none());
        assert!(mock.create_buffer(&buffer_desc(4)).is_some());
        assert_eq!(mock.count_failed_allocations(), 2);
        assert_eq!(mock.count_buffer_creates(), 1);
    }

    #[test]
    fn test_ids_are_sequential() {
        let mock = MockRenderContext::new();
        let a = mock.create_buffer(&buffer_desc(4)).unwrap();
        let b = mock.create_buffer(&buffer_desc(4)).unwrap();
        assert_eq!(a.mock_id(), Some(0));
        assert_eq!(b.mock_id(), Some(1));
        mock.clear_calls();
        assert_eq!(mock.call_count(), 0);
    }
}
