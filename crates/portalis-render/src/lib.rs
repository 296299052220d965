//! Portalis Render
//!
//! Portal traversal and render-tree construction on top of wgpu.
//!
//! A frame is built in three steps:
//!
//! 1. A [`RenderTree`] is created and a root context added for the view.
//! 2. A [`ContextSetup`] (normally [`StandardContextSetup`]) fills the
//!    context with meshes and runs [`StandardPortalSetup`], which creates a
//!    child context for everything visible through a portal. Portals that
//!    need an off-screen target lease one from a [`TextureCache`].
//! 3. [`ContextRender`] draws the contexts grouped by render target, portal
//!    targets first.
//!
//! [`RenderManager`] runs these steps for a camera and keeps the caches
//! alive between frames.
//!
//! Drawing goes through a [`GraphicsBackend`]. [`WgpuBackend`] is the one
//! for a real device.

pub mod camera;
pub mod clipper;
pub mod context;
mod context_impl;
pub mod context_render;
pub mod context_setup;
pub mod error;
pub mod hdr;
pub mod layers;
pub mod manager;
pub mod mesh_holder;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod operations;
pub mod portal_setup;
pub mod post_effects;
pub mod render_mesh;
pub mod render_tree;
pub mod render_view;
pub mod resource_cache;
pub mod scene;
pub mod shadow;
pub mod texture_cache;
pub mod wgpu_backend;

pub use portalis_core::Ticks;

pub use camera::Camera;
pub use clipper::{BoxClipperCache, Clipper2D};
pub use context::{GraphicsContext, GraphicsContextDescriptor, GraphicsContextError};
pub use context_render::{ContextRender, DrawScope, GraphicsBackend, RenderStats};
pub use context_setup::{MeshSorting, StandardContextSetup};
pub use error::{RenderError, RenderResult};
pub use hdr::{LinearExposure, LuminanceReducer, LuminanceStats};
pub use layers::{RenderLayer, RenderLayerConfig};
pub use manager::{FrameReport, RenderManager};
pub use mesh_holder::RenderMeshHolder;
pub use portal_setup::{
    ContextSetup, ContextSetupData, PortalPersistentData, PortalSetupStats, StandardPortalSetup,
};
pub use post_effects::{LayerId, LayerInput, LayerOptions, PostEffectManager};
pub use render_mesh::{
    BufferHolder, Material, MeshType, MixMode, RenderMesh, RenderPriority, ShaderHandle, ShaderVarName,
    ShaderVarStringSet, ShaderVariableContext, ShaderVariableValue, ZBufMode,
};
pub use render_tree::{Attachment, ContextId, ContextNode, DrawFlags, RenderTarget, RenderTree, TreePersistentData};
pub use render_view::RenderView;
pub use resource_cache::GenericResourceCache;
pub use scene::{MeshWrapper, Portal, PortalContainer, PortalFlags, Sector, SectorId};
pub use shadow::{ShadowConfigError, ShadowMap, ShadowSettings, ShadowSplit, split_distances};
pub use texture_cache::{LeasedTexture, TextureCache, TextureCacheOptions, TextureProperties};
pub use wgpu_backend::{ShaderBindings, TexcoordLayout, TextureBinding, WgpuBackend};
