//! Trait abstracting GPU resource creation.

use crate::gpu_types::*;
use wgpu::{BufferDescriptor, TextureDescriptor};

/// GPU resource creation used by the render manager's caches.
///
/// Creation returns `None` when the backend fails to allocate the resource.
/// Callers treat that as "skip this effect for the frame" rather than as a
/// fatal error.
///
/// # Example
///
/// ```rust,no_run
/// use portalis_test_utils::RenderContext;
/// use wgpu::{BufferDescriptor, BufferUsages};
///
/// fn upload(ctx: &dyn RenderContext, data: &[u8]) -> bool {
///     let desc = BufferDescriptor {
///         label: Some("portal coords"),
///         size: data.len() as u64,
///         usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
///         mapped_at_creation: false,
///     };
///     let Some(buffer) = ctx.create_buffer(&desc) else {
///         return false;
///     };
///     ctx.write_buffer(&buffer, 0, data);
///     true
/// }
/// ```
pub trait RenderContext: Send + Sync {
    /// Create a GPU buffer.
    fn create_buffer(&self, desc: &BufferDescriptor) -> Option<GpuBuffer>;

    /// Write data to a buffer.
    ///
    /// For real buffers, this maps to `queue.write_buffer()`.
    /// For mock buffers, this records the operation for test verification.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]);

    /// Create a GPU texture.
    fn create_texture(&self, desc: &TextureDescriptor) -> Option<GpuTexture>;
}
