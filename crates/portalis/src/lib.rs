//! Portalis - portal rendering on wgpu
//!
//! Portalis draws scenes split into sectors joined by portals. Every frame a
//! render tree is built from the camera's sector: each visible portal either
//! reclips the view into the sector behind it (a simple portal) or renders
//! that sector into a cached texture which is then drawn as a quad (a heavy
//! portal, used for mirrors and warping portals).
//!
//! - **Render manager**: per-frame driver owning the caches
//! - **Portal setup**: recursive traversal with cycle and recursion guards
//! - **Texture caches**: leased render targets aged by frame ticks
//! - **Shadows**: shadow map contexts configured per technique
//! - **Post effects**: layered full-screen passes with texture reuse
//! - **HDR**: luminance reduction and exposure control
//!
//! # Quick Start
//!
//! ```ignore
//! use portalis::prelude::*;
//!
//! fn frame(manager: &mut RenderManager, backend: &mut impl GraphicsBackend, room: Arc<dyn Sector>, tick: Ticks) {
//!     manager.update_new_frame(tick);
//!     let camera = Camera::perspective(std::f32::consts::FRAC_PI_2, 16.0 / 9.0, 0.1, 500.0);
//!     let report = manager.render_view(backend, camera, room, &[]);
//!     tracing::debug!("{} contexts drawn", report.contexts);
//! }
//!
//! fn main() {
//!     portalis::core::logging::init();
//!     let config = ConfigStore::load_file("portalis.cfg").unwrap_or_default();
//!     let _profiler = Profiler::start(&ProfilingOptions::from_config(&config));
//!     let mut manager = RenderManager::new(&config, RenderLayerConfig::single(None));
//!     // ...
//! }
//! ```
//!
//! # Sub-crates
//!
//! - [`core`] - logging, profiling, configuration and math
//! - [`render`] - render trees, portal setup and caches (feature `render`)
//! - [`test_utils`] - GPU handles and the resource creation trait

pub use portalis_core as core;
pub use portalis_core::math;
pub use portalis_core::{Ticks, config::ConfigStore};

pub use portalis_test_utils as test_utils;
pub use portalis_test_utils::{GpuBuffer, GpuTexture, RenderContext};

#[cfg(feature = "render")]
pub use portalis_render as render;

/// Prelude module for convenient imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use portalis_core::Ticks;
    pub use portalis_core::config::ConfigStore;
    pub use portalis_core::math::{Mat4, Vec2, Vec3, Vec4};
    pub use portalis_core::profiling::{Profiler, ProfilingOptions};
    pub use portalis_test_utils::{GpuTexture, RenderContext};

    #[cfg(feature = "render")]
    pub use portalis_render::{
        Camera, Clipper2D, ContextRender, ContextSetup, FrameReport, GraphicsBackend, GraphicsContext, LayerOptions,
        LinearExposure, LuminanceReducer, Material, MeshSorting, MeshWrapper, Portal, PortalContainer, PortalFlags,
        PostEffectManager, RenderLayer, RenderLayerConfig, RenderManager, RenderMesh, RenderPriority, RenderTree,
        RenderView, Sector, SectorId, ShaderHandle, StandardContextSetup, TextureCache, WgpuBackend,
    };
}
