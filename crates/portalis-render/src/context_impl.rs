//! Implementation of RenderContext trait for GraphicsContext.
//!
//! Creation calls run inside an out-of-memory error scope so an allocation
//! failure surfaces as `None` instead of a device-lost panic later on.

use crate::context::GraphicsContext;
use portalis_test_utils::{GpuBuffer, GpuTexture, RenderContext};
use wgpu::{BufferDescriptor, TextureDescriptor};

impl GraphicsContext {
    fn scoped<T>(&self, what: &str, create: impl FnOnce(&wgpu::Device) -> T) -> Option<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let resource = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            None => Some(resource),
            Some(err) => {
                tracing::warn!("GPU refused to create {}: {}", what, err);
                None
            }
        }
    }
}

impl RenderContext for GraphicsContext {
    fn create_buffer(&self, desc: &BufferDescriptor) -> Option<GpuBuffer> {
        self.scoped("buffer", |device| device.create_buffer(desc))
            .map(GpuBuffer::from_wgpu)
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) {
        match buffer.as_wgpu() {
            Some(wgpu_buffer) => self.queue.write_buffer(wgpu_buffer, offset, data),
            None => tracing::error!("write_buffer called with a non-wgpu buffer"),
        }
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Option<GpuTexture> {
        self.scoped("texture", |device| device.create_texture(desc))
            .map(GpuTexture::from_wgpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portalis_test_utils::MockRenderContext;

    #[test]
    fn test_render_context_trait_object() {
        let mock_ctx = MockRenderContext::new();

        fn uses_render_context(ctx: &dyn RenderContext) -> bool {
            let buffer = ctx.create_buffer(&BufferDescriptor {
                label: Some("Test Buffer"),
                size: 256,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            match buffer {
                Some(buffer) => {
                    ctx.write_buffer(&buffer, 0, &[0u8; 16]);
                    true
                }
                None => false,
            }
        }

        assert!(uses_render_context(&mock_ctx));
        assert_eq!(mock_ctx.count_buffer_creates(), 1);
        assert_eq!(mock_ctx.count_buffer_writes(), 1);
    }
}
