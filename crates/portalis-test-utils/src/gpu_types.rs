//! GPU resource handles that can be real or mock.
//!
//! Both handle types are cheap to clone and share one allocation between
//! clones. The number of live clones is observable through `ref_count`, which
//! is what reference-count based cache policies query before recycling.

use std::sync::Arc;

/// Shared handle to a GPU buffer.
#[derive(Clone, Debug)]
pub struct GpuBuffer {
    inner: Arc<GpuBufferInner>,
}

#[derive(Debug)]
enum GpuBufferInner {
    Real(wgpu::Buffer),
    #[cfg(feature = "mock")]
    Mock { id: usize, size: u64 },
}

impl GpuBuffer {
    /// Create from real WGPU buffer
    pub fn from_wgpu(buffer: wgpu::Buffer) -> Self {
        Self {
            inner: Arc::new(GpuBufferInner::Real(buffer)),
        }
    }

    /// Create mock buffer (for testing)
    #[cfg(feature = "mock")]
    pub fn mock(id: usize, size: u64) -> Self {
        Self {
            inner: Arc::new(GpuBufferInner::Mock { id, size }),
        }
    }

    /// The underlying wgpu::Buffer, if this is a real buffer.
    pub fn as_wgpu(&self) -> Option<&wgpu::Buffer> {
        match self.inner.as_ref() {
            GpuBufferInner::Real(buffer) => Some(buffer),
            #[cfg(feature = "mock")]
            GpuBufferInner::Mock { .. } => None,
        }
    }

    pub fn size(&self) -> u64 {
        match self.inner.as_ref() {
            GpuBufferInner::Real(buffer) => buffer.size(),
            #[cfg(feature = "mock")]
            GpuBufferInner::Mock { size, .. } => *size,
        }
    }

    /// Whether two handles refer to the same buffer.
    pub fn ptr_eq(&self, other: &GpuBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live handles to this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Check if this is a mock (useful in tests)
    #[cfg(feature = "mock")]
    pub fn is_mock(&self) -> bool {
        matches!(self.inner.as_ref(), GpuBufferInner::Mock { .. })
    }

    /// Get mock ID (for test assertions)
    #[cfg(feature = "mock")]
    pub fn mock_id(&self) -> Option<usize> {
        match self.inner.as_ref() {
            GpuBufferInner::Mock { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Shared handle to a GPU texture.
#[derive(Clone, Debug)]
pub struct GpuTexture {
    inner: Arc<GpuTextureInner>,
}

#[derive(Debug)]
enum GpuTextureInner {
    Real(wgpu::Texture),
    #[cfg(feature = "mock")]
    Mock {
        id: usize,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    },
}

impl GpuTexture {
    /// Create from real WGPU texture
    pub fn from_wgpu(texture: wgpu::Texture) -> Self {
        Self {
            inner: Arc::new(GpuTextureInner::Real(texture)),
        }
    }

    /// Create mock texture (for testing)
    #[cfg(feature = "mock")]
    pub fn mock(id: usize, width: u32, height: u32, format: wgpu::TextureFormat) -> Self {
        Self {
            inner: Arc::new(GpuTextureInner::Mock {
                id,
                width,
                height,
                format,
            }),
        }
    }

    /// The underlying wgpu::Texture, if this is a real texture.
    pub fn as_wgpu(&self) -> Option<&wgpu::Texture> {
        match self.inner.as_ref() {
            GpuTextureInner::Real(texture) => Some(texture),
            #[cfg(feature = "mock")]
            GpuTextureInner::Mock { .. } => None,
        }
    }

    pub fn width(&self) -> u32 {
        match self.inner.as_ref() {
            GpuTextureInner::Real(texture) => texture.width(),
            #[cfg(feature = "mock")]
            GpuTextureInner::Mock { width, .. } => *width,
        }
    }

    pub fn height(&self) -> u32 {
        match self.inner.as_ref() {
            GpuTextureInner::Real(texture) => texture.height(),
            #[cfg(feature = "mock")]
            GpuTextureInner::Mock { height, .. } => *height,
        }
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        match self.inner.as_ref() {
            GpuTextureInner::Real(texture) => texture.format(),
            #[cfg(feature = "mock")]
            GpuTextureInner::Mock { format, .. } => *format,
        }
    }

    /// Whether two handles refer to the same texture.
    pub fn ptr_eq(&self, other: &GpuTexture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live handles to this texture.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Check if this is a mock
    #[cfg(feature = "mock")]
    pub fn is_mock(&self) -> bool {
        matches!(self.inner.as_ref(), GpuTextureInner::Mock { .. })
    }

    /// Get mock ID (for test assertions)
    #[cfg(feature = "mock")]
    pub fn mock_id(&self) -> Option<usize> {
        match self.inner.as_ref() {
            GpuTextureInner::Mock { id, .. } => Some(*id),
            _ => None,
        }
    }
}
