//! GPU handle wrappers and test infrastructure for Portalis.
//!
//! # Overview
//!
//! - [`RenderContext`] - Trait abstracting GPU resource creation
//! - `MockRenderContext` - Mock implementation for testing (requires `mock` feature)
//! - [`GpuBuffer`], [`GpuTexture`] - Shared handles that can be real or mock
//!
//! # Example
//!
//! ```rust
//! # #[cfg(feature = "mock")]
//! # {
//! use portalis_test_utils::{MockRenderContext, RenderContext};
//! use wgpu::*;
//!
//! let mock = MockRenderContext::new();
//!
//! let texture = mock
//!     .create_texture(&TextureDescriptor {
//!         label: Some("portal"),
//!         size: Extent3d { width: 128, height: 64, depth_or_array_layers: 1 },
//!         mip_level_count: 1,
//!         sample_count: 1,
//!         dimension: TextureDimension::D2,
//!         format: TextureFormat::Rgba8Unorm,
//!         usage: TextureUsages::RENDER_ATTACHMENT,
//!         view_formats: &[],
//!     })
//!     .unwrap();
//!
//! assert_eq!(texture.width(), 128);
//! assert_eq!(mock.count_texture_creates(), 1);
//! # }
//! ```
//!
//! # Design
//!
//! Handles are owned and reference counted, so caches can hand the same
//! texture to several holders and ask how many are still alive. The
//! `RenderContext` trait is object-safe and takes `&self`; mock
//! implementations record calls through interior mutability.

pub mod gpu_types;
#[cfg(feature = "mock")]
pub mod mock_render;
pub mod render_context;

pub use gpu_types::*;
#[cfg(feature = "mock")]
pub use mock_render::*;
pub use render_context::*;
