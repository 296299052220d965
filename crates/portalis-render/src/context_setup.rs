//! Standard population of a context: visible meshes, portals, shaders,
//! sorting and numbering.

use ahash::AHashMap;
use portalis_core::config::ConfigStore;
use portalis_core::profiling::profile_function;
use portalis_test_utils::RenderContext;

use crate::layers::RenderLayerConfig;
use crate::operations::{for_each_mesh_node, number_meshes};
use crate::portal_setup::{ContextSetup, ContextSetupData, PortalPersistentData, StandardPortalSetup};
use crate::render_mesh::RenderPriority;
use crate::render_tree::{ContextId, PortalHolder, RenderTree};

/// Default limit of nested portal setups.
pub const DEFAULT_MAX_RECURSION: u32 = 30;

/// Order of meshes within one render priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeshSorting {
    #[default]
    None,
    BackToFront,
    FrontToBack,
}

pub struct StandardContextSetup {
    layers: RenderLayerConfig,
    max_recursion: u32,
    follow_portals: bool,
    sorting: AHashMap<RenderPriority, MeshSorting>,
    recursion: u32,
}

impl StandardContextSetup {
    pub fn new(layers: RenderLayerConfig) -> Self {
        Self {
            layers,
            max_recursion: DEFAULT_MAX_RECURSION,
            follow_portals: true,
            sorting: AHashMap::new(),
            recursion: 0,
        }
    }

    /// Reads `RenderManager.Portals.MaxRecursion`.
    pub fn from_config(config: &ConfigStore, layers: RenderLayerConfig) -> Self {
        let max = config.get_int("RenderManager.Portals.MaxRecursion", DEFAULT_MAX_RECURSION as i64);
        Self::new(layers).with_max_recursion(max.max(0) as u32)
    }

    pub fn with_max_recursion(mut self, max_recursion: u32) -> Self {
        self.max_recursion = max_recursion;
        self
    }

    /// Whether portals are set up at all (shadow map contexts don't).
    pub fn with_portals(mut self, follow_portals: bool) -> Self {
        self.follow_portals = follow_portals;
        self
    }

    pub fn with_sorting(mut self, priority: RenderPriority, sorting: MeshSorting) -> Self {
        self.sorting.insert(priority, sorting);
        self
    }

    pub fn set_sorting(&mut self, priority: RenderPriority, sorting: MeshSorting) {
        self.sorting.insert(priority, sorting);
    }

    pub fn layers(&self) -> &RenderLayerConfig {
        &self.layers
    }

    fn collect_meshes(&self, tree: &mut RenderTree<'_>, context: ContextId) {
        let view = tree.context(context).render_view.clone();
        let Some(sector) = view.this_sector().cloned() else {
            tracing::warn!("Context {} has no sector to draw", context.index());
            return;
        };

        let frame = view.frame_number();
        for mesh in sector.visible_meshes(&view) {
            let priority = mesh.render_priority();
            let render_meshes = mesh.render_meshes(&view, frame);
            let portal_container = mesh.portal_container();

            let node = tree.context_mut(context);
            for render_mesh in render_meshes {
                node.add_render_mesh(render_mesh, priority);
            }
            if let Some(container) = portal_container {
                node.all_portals.push(PortalHolder { mesh, container });
            }
        }
    }

    fn finish(&self, tree: &mut RenderTree<'_>, context: ContextId) {
        let node = tree.context_mut(context);
        let camera = *node.render_view.camera().transform();

        let layers = &self.layers;
        for_each_mesh_node(node, |mesh_node| {
            for mesh in &mut mesh_node.meshes {
                let material = mesh.render_mesh.material.clone();
                mesh.shaders = layers
                    .iter()
                    .map(|layer| {
                        material
                            .as_ref()
                            .and_then(|material| material.shader(&layer.shader_type).cloned())
                            .or_else(|| layer.default_shader.clone())
                    })
                    .collect();
            }
        });

        let sorting = &self.sorting;
        for_each_mesh_node(node, |mesh_node| {
            let mode = sorting.get(&mesh_node.priority).copied().unwrap_or_default();
            if mode == MeshSorting::None {
                return;
            }
            for mesh in &mut mesh_node.meshes {
                mesh.sort_depth = camera.other_to_this(mesh.render_mesh.bounding_center).z;
            }
            match mode {
                MeshSorting::BackToFront => mesh_node.meshes.sort_by(|a, b| b.sort_depth.total_cmp(&a.sort_depth)),
                MeshSorting::FrontToBack => mesh_node.meshes.sort_by(|a, b| a.sort_depth.total_cmp(&b.sort_depth)),
                MeshSorting::None => {}
            }
        });

        number_meshes(node);
    }
}

impl ContextSetup for StandardContextSetup {
    fn setup_context(
        &mut self,
        tree: &mut RenderTree<'_>,
        context: ContextId,
        setup_data: &mut ContextSetupData,
        portals: &mut PortalPersistentData,
        graphics: &dyn RenderContext,
    ) {
        profile_function!();
        self.collect_meshes(tree, context);

        if self.follow_portals && !tree.context(context).all_portals.is_empty() {
            if self.recursion < self.max_recursion {
                self.recursion += 1;
                StandardPortalSetup::new(portals, graphics).run(tree, context, setup_data, self);
                self.recursion -= 1;
            } else {
                tracing::debug!(
                    "Portal recursion limit {} reached in context {}",
                    self.max_recursion,
                    context.index()
                );
                tree.stats.recursion_skips += 1;
            }
        }

        self.finish(tree, context);
    }
}
