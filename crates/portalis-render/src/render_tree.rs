//! Per-frame tree of rendering contexts.
//!
//! A [`RenderTree`] is built fresh for every rendered view. It owns the
//! contexts created during traversal; everything that has to survive the
//! frame lives in [`TreePersistentData`].

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use bitflags::bitflags;
use portalis_core::math::{Mat4, Plane3, Vec2, Vec3};
use portalis_test_utils::GpuTexture;

use crate::mesh_holder::RenderMeshHolder;
use crate::render_mesh::{RenderMesh, RenderPriority, ShaderHandle, ShaderVariableContext};
use crate::render_view::RenderView;
use crate::scene::{MeshWrapper, PortalContainer, SectorId};

/// Render target attachment point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attachment {
    Depth,
    Color0,
}

impl Attachment {
    pub const COUNT: usize = 2;
    pub const ALL: [Attachment; Attachment::COUNT] = [Attachment::Depth, Attachment::Color0];

    pub fn index(self) -> usize {
        match self {
            Attachment::Depth => 0,
            Attachment::Color0 => 1,
        }
    }

    /// Parses a configuration value (`depth`, `color0`), case-insensitively.
    pub fn parse(value: &str) -> Option<Attachment> {
        match value.to_ascii_lowercase().as_str() {
            "depth" => Some(Attachment::Depth),
            "color0" | "color" => Some(Attachment::Color0),
            _ => None,
        }
    }
}

/// A texture bound as render target.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub texture: GpuTexture,
    pub subtexture: u32,
}

impl RenderTarget {
    pub fn new(texture: GpuTexture) -> Self {
        Self { texture, subtexture: 0 }
    }
}

impl PartialEq for RenderTarget {
    fn eq(&self, other: &Self) -> bool {
        self.texture.ptr_eq(&other.texture) && self.subtexture == other.subtexture
    }
}

/// Per-attachment targets; `None` everywhere means the screen.
pub type RenderTargets = [Option<RenderTarget>; Attachment::COUNT];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DrawFlags: u32 {
        const CLEAR_SCREEN = 1 << 0;
        const CLEAR_ZBUFFER = 1 << 1;
        const GRAPHICS_3D = 1 << 2;
    }
}

/// A render mesh queued in a context.
#[derive(Debug, Clone)]
pub struct SingleMesh {
    pub render_mesh: Arc<RenderMesh>,
    /// Shader per render layer; `None` skips the mesh in that layer.
    pub shaders: Vec<Option<ShaderHandle>>,
    pub context_local_id: usize,
    /// Camera-space depth, filled in by sorting.
    pub sort_depth: f32,
}

/// All meshes of one render priority in a context.
#[derive(Debug, Clone)]
pub struct MeshNode {
    pub priority: RenderPriority,
    pub meshes: Vec<SingleMesh>,
}

/// Portals of one portal-carrying mesh seen in a context.
#[derive(Clone)]
pub struct PortalHolder {
    pub mesh: Arc<dyn MeshWrapper>,
    pub container: Arc<dyn PortalContainer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

impl ContextId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One (sector, camera, clip region) rendering unit.
pub struct ContextNode {
    pub render_view: RenderView,
    pub render_targets: RenderTargets,
    /// Applied on top of the camera projection when drawing.
    pub perspective_fixup: Mat4,
    pub draw_flags: DrawFlags,
    /// Context-wide shader variables.
    pub shader_variables: ShaderVariableContext,
    pub all_portals: Vec<PortalHolder>,
    pub(crate) mesh_nodes: BTreeMap<RenderPriority, MeshNode>,
    total_render_meshes: usize,
    /// Portal nesting depth this context was created at.
    pub recursion_depth: u32,
}

impl ContextNode {
    fn new(render_view: RenderView) -> Self {
        Self {
            render_view,
            render_targets: [None, None],
            perspective_fixup: Mat4::IDENTITY,
            draw_flags: DrawFlags::empty(),
            shader_variables: ShaderVariableContext::new(),
            all_portals: Vec::new(),
            mesh_nodes: BTreeMap::new(),
            total_render_meshes: 0,
            recursion_depth: 0,
        }
    }

    pub fn add_render_mesh(&mut self, render_mesh: Arc<RenderMesh>, priority: RenderPriority) {
        let node = self.mesh_nodes.entry(priority).or_insert_with(|| MeshNode {
            priority,
            meshes: Vec::new(),
        });
        node.meshes.push(SingleMesh {
            render_mesh,
            shaders: Vec::new(),
            context_local_id: 0,
            sort_depth: 0.0,
        });
        self.total_render_meshes += 1;
    }

    pub fn total_render_meshes(&self) -> usize {
        self.total_render_meshes
    }

    /// Mesh nodes in ascending priority.
    pub fn mesh_nodes(&self) -> impl DoubleEndedIterator<Item = &MeshNode> {
        self.mesh_nodes.values()
    }

    pub fn mesh_nodes_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut MeshNode> {
        self.mesh_nodes.values_mut()
    }

    pub fn mesh_node(&self, priority: RenderPriority) -> Option<&MeshNode> {
        self.mesh_nodes.get(&priority)
    }

    pub fn target(&self, attachment: Attachment) -> Option<&RenderTarget> {
        self.render_targets[attachment.index()].as_ref()
    }

    pub fn set_target(&mut self, attachment: Attachment, target: Option<RenderTarget>) {
        self.render_targets[attachment.index()] = target;
    }

    /// Size of the bound render target, `None` when drawing to the screen.
    pub fn target_dimensions(&self) -> Option<(u32, u32)> {
        Attachment::ALL
            .iter()
            .rev()
            .find_map(|attachment| self.target(*attachment))
            .map(|target| (target.texture.width(), target.texture.height()))
    }
}

/// Named debug switches shared by all trees.
#[derive(Debug, Default)]
pub struct DebugPersistent {
    flags: Vec<(String, bool)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebugFlag(usize);

impl DebugPersistent {
    pub fn register_debug_flag(&mut self, name: &str) -> DebugFlag {
        if let Some(index) = self.flags.iter().position(|(flag, _)| flag == name) {
            return DebugFlag(index);
        }
        self.flags.push((name.to_owned(), false));
        DebugFlag(self.flags.len() - 1)
    }

    /// Toggles `name` and every flag below it (`draw` covers `draw.portals.planes`).
    /// Returns whether any flag matched.
    pub fn enable_debug_flag(&mut self, name: &str, enabled: bool) -> bool {
        let mut matched = false;
        for (flag, state) in &mut self.flags {
            let child = flag.len() > name.len() && flag.starts_with(name) && flag.as_bytes()[name.len()] == b'.';
            if flag == name || child {
                *state = enabled;
                matched = true;
            }
        }
        matched
    }

    pub fn is_enabled(&self, flag: DebugFlag) -> bool {
        self.flags.get(flag.0).is_some_and(|(_, state)| *state)
    }
}

/// Data owned by the render manager and lent to every tree.
#[derive(Default)]
pub struct TreePersistentData {
    pub mesh_holder: RenderMeshHolder,
    pub debug: DebugPersistent,
}

impl TreePersistentData {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Screen-space line, pixel coordinates with the origin top left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebugLine {
    pub from: Vec2,
    pub to: Vec2,
    pub color: [u8; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebugPlane {
    pub plane: Plane3,
    pub center: Vec3,
    pub color: Vec3,
}

#[derive(Debug, Clone)]
pub struct DebugTexture {
    pub texture: GpuTexture,
    pub aspect: f32,
}

/// Contexts sharing one render target, in drawing order.
#[derive(Debug, Clone)]
pub struct ContextsContainer {
    pub targets: RenderTargets,
    pub contexts: Vec<ContextId>,
}

/// Portal counters aggregated over a whole tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub simple_portals: usize,
    pub heavy_portals: usize,
    /// Portals not followed because of recursion limits.
    pub recursion_skips: usize,
    /// Heavy portals dropped because no target could be allocated.
    pub failed_portals: usize,
}

pub struct RenderTree<'p> {
    persistent: &'p mut TreePersistentData,
    contexts: Vec<ContextNode>,
    order: Vec<ContextId>,
    sector_rec_levels: AHashMap<SectorId, u32>,
    debug_lines: Vec<DebugLine>,
    debug_planes: Vec<DebugPlane>,
    debug_textures: Vec<DebugTexture>,
    pub stats: TreeStats,
}

impl<'p> RenderTree<'p> {
    pub fn new(persistent: &'p mut TreePersistentData) -> Self {
        Self {
            persistent,
            contexts: Vec::new(),
            order: Vec::new(),
            sector_rec_levels: AHashMap::new(),
            debug_lines: Vec::new(),
            debug_planes: Vec::new(),
            debug_textures: Vec::new(),
            stats: TreeStats::default(),
        }
    }

    /// Creates a context, placed right after `insert_after` in drawing
    /// order, or at the end.
    pub fn create_context(&mut self, view: RenderView, insert_after: Option<ContextId>) -> ContextId {
        let id = ContextId(self.contexts.len());
        self.contexts.push(ContextNode::new(view));

        let position = insert_after
            .and_then(|after| self.order.iter().position(|c| *c == after))
            .map(|index| index + 1)
            .unwrap_or(self.order.len());
        self.order.insert(position, id);

        tracing::trace!("Created render context {} at position {}", id.0, position);
        id
    }

    pub fn context(&self, id: ContextId) -> &ContextNode {
        &self.contexts[id.0]
    }

    pub fn context_mut(&mut self, id: ContextId) -> &mut ContextNode {
        &mut self.contexts[id.0]
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Context ids in tree order (parents before the contexts they spawn).
    pub fn order(&self) -> &[ContextId] {
        &self.order
    }

    /// Contexts grouped by render target, in drawing order.
    ///
    /// The tree is walked backwards so the contexts spawned by a portal are
    /// drawn before the context showing the portal. Neighbours with equal
    /// targets share a container.
    pub fn containers(&self) -> Vec<ContextsContainer> {
        let mut containers: Vec<ContextsContainer> = Vec::new();
        for id in self.order.iter().rev() {
            let targets = &self.contexts[id.0].render_targets;
            match containers.last_mut() {
                Some(container) if &container.targets == targets => container.contexts.push(*id),
                _ => containers.push(ContextsContainer {
                    targets: targets.clone(),
                    contexts: vec![*id],
                }),
            }
        }
        containers
    }

    pub fn persistent_data(&mut self) -> &mut TreePersistentData {
        &mut *self.persistent
    }

    pub fn mesh_holder(&mut self) -> &mut RenderMeshHolder {
        &mut self.persistent.mesh_holder
    }

    pub fn rec_level(&self, sector: SectorId) -> u32 {
        self.sector_rec_levels.get(&sector).copied().unwrap_or(0)
    }

    pub fn inc_rec_level(&mut self, sector: SectorId) {
        *self.sector_rec_levels.entry(sector).or_insert(0) += 1;
    }

    pub fn dec_rec_level(&mut self, sector: SectorId) {
        if let Some(level) = self.sector_rec_levels.get_mut(&sector) {
            *level = level.saturating_sub(1);
        }
    }

    pub fn is_debug_flag_enabled(&self, flag: DebugFlag) -> bool {
        self.persistent.debug.is_enabled(flag)
    }

    pub fn add_debug_line_screen(&mut self, from: Vec2, to: Vec2, color: [u8; 3]) {
        self.debug_lines.push(DebugLine { from, to, color });
    }

    pub fn add_debug_plane(&mut self, plane: Plane3, center: Vec3, color: Vec3) {
        self.debug_planes.push(DebugPlane { plane, center, color });
    }

    pub fn add_debug_texture(&mut self, texture: GpuTexture, aspect: f32) {
        self.debug_textures.push(DebugTexture { texture, aspect });
    }

    pub fn debug_lines(&self) -> &[DebugLine] {
        &self.debug_lines
    }

    pub fn debug_planes(&self) -> &[DebugPlane] {
        &self.debug_planes
    }

    pub fn debug_textures(&self) -> &[DebugTexture] {
        &self.debug_textures
    }
}
