//! Drawing a finished render tree.

use portalis_core::math::{Mat4, ReversibleTransform, Vec4};
use portalis_core::profiling::{profile_function, profile_scope};
use portalis_test_utils::{GpuTexture, RenderContext};

use crate::clipper::Clipper2D;
use crate::error::{RenderError, RenderResult};
use crate::render_mesh::{RenderMesh, ShaderHandle, ShaderVariableContext};
use crate::render_tree::{Attachment, ContextId, ContextsContainer, DrawFlags, RenderTarget, RenderTargets, RenderTree};

/// The drawing side of a graphics device.
///
/// Resource creation goes through [`GraphicsBackend::resources`]; everything
/// else mutates the device's binding state and therefore takes `&mut self`.
pub trait GraphicsBackend {
    fn resources(&self) -> &dyn RenderContext;

    fn screen_size(&self) -> (u32, u32);

    /// Binds `target` to `attachment`; `None` means the screen.
    fn set_render_target(&mut self, attachment: Attachment, target: Option<&RenderTarget>);

    /// Checks that the bound targets form a usable combination.
    fn validate_render_targets(&mut self) -> RenderResult<()>;

    fn unset_render_targets(&mut self);

    fn set_projection(&mut self, projection: Mat4, aspect: f32);

    fn set_clipper(&mut self, clipper: Option<&Clipper2D>);

    /// Returns `false` if drawing cannot start.
    fn begin_draw(&mut self, flags: DrawFlags) -> bool;

    fn finish_draw(&mut self);

    fn set_world_to_camera(&mut self, transform: &ReversibleTransform);

    /// Variables every mesh of the current context can see.
    fn set_shader_variables(&mut self, variables: &ShaderVariableContext);

    fn draw_mesh(&mut self, mesh: &RenderMesh, shader: &ShaderHandle, layer: usize);

    /// Reads back the first texel of a texture, if the backend can.
    fn read_pixel(&mut self, texture: &GpuTexture) -> Option<Vec4>;
}

/// Guard pairing [`GraphicsBackend::begin_draw`] with `finish_draw`.
pub struct DrawScope<'s, B: GraphicsBackend + ?Sized> {
    backend: &'s mut B,
}

impl<'s, B: GraphicsBackend + ?Sized> DrawScope<'s, B> {
    pub fn begin(backend: &'s mut B, flags: DrawFlags) -> Option<Self> {
        if backend.begin_draw(flags) {
            Some(Self { backend })
        } else {
            None
        }
    }

    pub fn backend(&mut self) -> &mut B {
        self.backend
    }
}

impl<B: GraphicsBackend + ?Sized> Drop for DrawScope<'_, B> {
    fn drop(&mut self) {
        self.backend.finish_draw();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub containers: usize,
    pub skipped_containers: usize,
    pub contexts: usize,
    pub draw_calls: usize,
}

/// Renders containers of contexts, binding each container's target once.
pub struct ContextRender<'b, B: GraphicsBackend + ?Sized> {
    backend: &'b mut B,
    layer_count: usize,
    /// Targets currently bound on the backend.
    current_targets: RenderTargets,
    stats: RenderStats,
}

impl<'b, B: GraphicsBackend + ?Sized> ContextRender<'b, B> {
    pub fn new(backend: &'b mut B, layer_count: usize) -> Self {
        Self {
            backend,
            layer_count,
            current_targets: [None, None],
            stats: RenderStats::default(),
        }
    }

    /// Draws every container of `tree`; targets spawned by portals come first.
    pub fn render(mut self, tree: &RenderTree<'_>) -> RenderStats {
        profile_function!();
        for container in tree.containers() {
            if let Err(err) = self.render_container(tree, &container) {
                tracing::warn!("Skipping {} context(s): {}", container.contexts.len(), err);
                self.stats.skipped_containers += 1;
            }
        }
        self.backend.unset_render_targets();
        self.current_targets = [None, None];
        self.stats
    }

    fn bind_targets(&mut self, targets: &RenderTargets) {
        if &self.current_targets == targets {
            return;
        }
        for attachment in Attachment::ALL {
            self.backend
                .set_render_target(attachment, targets[attachment.index()].as_ref());
        }
        self.current_targets = targets.clone();
    }

    fn render_container(&mut self, tree: &RenderTree<'_>, container: &ContextsContainer) -> RenderResult<()> {
        profile_scope!("render_container");
        self.bind_targets(&container.targets);
        self.backend.validate_render_targets()?;

        for id in &container.contexts {
            let valid = tree.context(*id).render_view.clipper().is_none_or(Clipper2D::is_valid);
            if !valid {
                return Err(RenderError::InvalidClipper { context: id.index() });
            }
        }

        let flags = container
            .contexts
            .iter()
            .fold(DrawFlags::GRAPHICS_3D, |flags, id| flags | tree.context(*id).draw_flags);
        let (width, height) = container
            .targets
            .iter()
            .rev()
            .flatten()
            .next()
            .map(|target| (target.texture.width(), target.texture.height()))
            .unwrap_or_else(|| self.backend.screen_size());
        let aspect = width as f32 / height.max(1) as f32;

        let Some(mut scope) = DrawScope::begin(&mut *self.backend, flags) else {
            return Err(RenderError::InvalidRenderTarget {
                attachment: Attachment::Color0,
                reason: "drawing could not begin".into(),
            });
        };

        let mut bound_context: Option<ContextId> = None;
        for layer in 0..self.layer_count {
            for id in &container.contexts {
                let context = tree.context(*id);
                if bound_context != Some(*id) {
                    let camera = context.render_view.camera();
                    let backend = scope.backend();
                    backend.set_projection(context.perspective_fixup * camera.projection(), aspect);
                    backend.set_clipper(context.render_view.clipper());
                    backend.set_world_to_camera(camera.transform());
                    backend.set_shader_variables(&context.shader_variables);
                    bound_context = Some(*id);
                }

                for node in context.mesh_nodes() {
                    for mesh in &node.meshes {
                        if let Some(Some(shader)) = mesh.shaders.get(layer) {
                            scope.backend().draw_mesh(&mesh.render_mesh, shader, layer);
                            self.stats.draw_calls += 1;
                        }
                    }
                }
            }
        }
        drop(scope);

        self.stats.containers += 1;
        self.stats.contexts += container.contexts.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context_setup::StandardContextSetup;
    use crate::layers::{RenderLayer, RenderLayerConfig};
    use crate::mock::{DrawCall, MockGraphicsBackend, TestMesh, TestPortal, TestPortalContainer, TestSector};
    use crate::mock::{room_and_hall, test_camera};
    use crate::portal_setup::{ContextSetup, ContextSetupData, PortalPersistentData};
    use crate::render_mesh::ShaderVarStringSet;
    use crate::render_tree::TreePersistentData;
    use crate::render_view::RenderView;
    use crate::scene::{PortalFlags, Sector};
    use portalis_core::math::{Box2, Vec3};

    struct Fixture {
        tree_data: TreePersistentData,
        portals: PortalPersistentData,
        backend: MockGraphicsBackend,
    }

    impl Fixture {
        fn new() -> Self {
            let mut strings = ShaderVarStringSet::new();
            let mut tree_data = TreePersistentData::new();
            let portals = PortalPersistentData::new(&mut strings, &mut tree_data.debug);
            Self {
                tree_data,
                portals,
                backend: MockGraphicsBackend::new(256, 256),
            }
        }
    }

    fn base_layers() -> RenderLayerConfig {
        let mut layers = RenderLayerConfig::new();
        layers.add_layer(RenderLayer::new("base", "base"));
        layers
    }

    /// Builds the tree for `sector` and returns it with its root.
    fn build<'p>(
        tree_data: &'p mut TreePersistentData,
        portals: &mut PortalPersistentData,
        backend: &MockGraphicsBackend,
        sector: &Arc<dyn Sector>,
        layers: RenderLayerConfig,
    ) -> (RenderTree<'p>, ContextId) {
        let mut view = RenderView::new(test_camera(), 256, 256);
        view.set_this_sector(Some(sector.clone()));
        let mut tree = RenderTree::new(tree_data);
        tree.inc_rec_level(sector.id());
        let root = tree.create_context(view, None);
        let mut data = ContextSetupData::new(root);
        StandardContextSetup::new(layers).setup_context(&mut tree, root, &mut data, portals, backend.mock_resources());
        tree.dec_rec_level(sector.id());
        (tree, root)
    }

    fn heavy_context(tree: &RenderTree<'_>) -> ContextId {
        *tree
            .order()
            .iter()
            .find(|id| tree.context(**id).target(Attachment::Color0).is_some())
            .unwrap()
    }

    #[test]
    fn test_portal_target_drawn_before_parent() {
        let mut fx = Fixture::new();
        let (room, _hall) = room_and_hall();
        let (tree, _root) = build(&mut fx.tree_data, &mut fx.portals, &fx.backend, &room, base_layers());
        let heavy = heavy_context(&tree);
        let texture_id = tree.context(heavy).target(Attachment::Color0).unwrap().texture.mock_id();

        let stats = ContextRender::new(&mut fx.backend, 1).render(&tree);
        assert_eq!(stats.containers, 2);
        assert_eq!(stats.contexts, 3);
        assert_eq!(stats.skipped_containers, 0);
        assert_eq!(stats.draw_calls, 4);

        // Heavy context first, then the simple portal's hall, then the room.
        assert_eq!(
            fx.backend.drawn_meshes(),
            vec!["statue", "statue", "floor", "[portal from room to hall]"]
        );

        let trace = fx.backend.trace();
        let bind = trace
            .iter()
            .position(|c| {
                *c == DrawCall::SetRenderTarget {
                    attachment: Attachment::Color0,
                    texture: texture_id,
                }
            })
            .unwrap();
        let first_statue = trace
            .iter()
            .position(|c| matches!(c, DrawCall::DrawMesh { name, .. } if name == "statue"))
            .unwrap();
        let footprint = trace
            .iter()
            .position(|c| matches!(c, DrawCall::DrawMesh { name, .. } if name.starts_with("[portal")))
            .unwrap();
        assert!(bind < first_statue);
        assert!(first_statue < footprint);
        assert_eq!(trace.last(), Some(&DrawCall::UnsetRenderTargets));
        assert!(!fx.backend.is_drawing());
    }

    #[test]
    fn test_container_flags_and_single_bind() {
        let mut fx = Fixture::new();
        let (room, _hall) = room_and_hall();
        let (tree, _root) = build(&mut fx.tree_data, &mut fx.portals, &fx.backend, &room, base_layers());
        ContextRender::new(&mut fx.backend, 1).render(&tree);

        let trace = fx.backend.trace();
        let begins: Vec<DrawFlags> = trace
            .iter()
            .filter_map(|c| match c {
                DrawCall::BeginDraw(flags) => Some(*flags),
                _ => None,
            })
            .collect();
        assert_eq!(
            begins,
            vec![
                DrawFlags::CLEAR_SCREEN | DrawFlags::CLEAR_ZBUFFER | DrawFlags::GRAPHICS_3D,
                DrawFlags::GRAPHICS_3D,
            ]
        );
        let binds = trace.iter().filter(|c| matches!(c, DrawCall::SetRenderTarget { .. })).count();
        assert_eq!(binds, 2 * Attachment::COUNT);
        let finishes = trace.iter().filter(|c| matches!(c, DrawCall::FinishDraw)).count();
        assert_eq!(finishes, 2);
    }

    #[test]
    fn test_rejected_target_skips_only_its_container() {
        let mut fx = Fixture::new();
        let (room, _hall) = room_and_hall();
        let (tree, _root) = build(&mut fx.tree_data, &mut fx.portals, &fx.backend, &room, base_layers());
        let heavy = heavy_context(&tree);
        let texture = tree.context(heavy).target(Attachment::Color0).unwrap().texture.clone();
        fx.backend.reject_target(texture);

        let stats = ContextRender::new(&mut fx.backend, 1).render(&tree);
        assert_eq!(stats.skipped_containers, 1);
        assert_eq!(stats.containers, 1);
        assert_eq!(fx.backend.drawn_meshes(), vec!["statue", "floor", "[portal from room to hall]"]);
    }

    #[test]
    fn test_degenerate_clipper_skips_container() {
        let mut fx = Fixture::new();
        let (room, _hall) = room_and_hall();
        let (mut tree, root) = build(&mut fx.tree_data, &mut fx.portals, &fx.backend, &room, base_layers());
        let simple = *tree
            .order()
            .iter()
            .find(|id| **id != root && tree.context(**id).target(Attachment::Color0).is_none())
            .unwrap();
        tree.context_mut(simple)
            .render_view
            .set_clipper(Clipper2D::Box(Box2::new(5.0, 5.0, 5.0, 5.0)));

        let stats = ContextRender::new(&mut fx.backend, 1).render(&tree);
        assert_eq!(stats.skipped_containers, 1);
        // The simple portal shares the screen container with the room.
        assert_eq!(fx.backend.drawn_meshes(), vec!["statue"]);
        assert!(!fx.backend.is_drawing());
    }

    #[test]
    fn test_refused_begin_draws_nothing() {
        let mut fx = Fixture::new();
        let (room, _hall) = room_and_hall();
        let (tree, _root) = build(&mut fx.tree_data, &mut fx.portals, &fx.backend, &room, base_layers());
        fx.backend.refuse_begin_draw(true);

        let stats = ContextRender::new(&mut fx.backend, 1).render(&tree);
        assert_eq!(stats.skipped_containers, 2);
        assert_eq!(stats.draw_calls, 0);
        assert!(!fx.backend.trace().iter().any(|c| matches!(c, DrawCall::FinishDraw)));
    }

    #[test]
    fn test_portal_behind_camera_draws_nothing_extra() {
        let mut fx = Fixture::new();
        let hall: Arc<dyn Sector> = TestSector::new(2, "hall");
        let room = TestSector::new(1, "room");
        room.add_mesh(TestMesh::simple("floor", "lit", Vec3::new(0.0, -1.0, 3.0)));
        room.add_mesh(TestMesh::portals(
            "walls",
            TestPortalContainer::new(vec![TestPortal::quad("behind", PortalFlags::empty(), &hall, -4.0)]),
        ));
        let room: Arc<dyn Sector> = room;
        let (tree, _root) = build(&mut fx.tree_data, &mut fx.portals, &fx.backend, &room, base_layers());

        let stats = ContextRender::new(&mut fx.backend, 1).render(&tree);
        assert_eq!(stats.contexts, 1);
        assert_eq!(fx.backend.drawn_meshes(), vec!["floor"]);
    }

    #[test]
    fn test_layers_draw_in_order() {
        let mut fx = Fixture::new();
        let room = TestSector::new(1, "room");
        room.add_mesh(TestMesh::simple("floor", "lit", Vec3::new(0.0, -1.0, 3.0)));
        room.add_mesh(TestMesh::simple("table", "lit", Vec3::new(0.0, 0.0, 5.0)));
        let room: Arc<dyn Sector> = room;
        let mut layers = base_layers();
        layers.add_layer(RenderLayer::new("ambient", "ambient").with_default_shader(ShaderHandle::new("amb")));
        let (tree, _root) = build(&mut fx.tree_data, &mut fx.portals, &fx.backend, &room, layers);

        let stats = ContextRender::new(&mut fx.backend, 2).render(&tree);
        assert_eq!(stats.draw_calls, 4);
        let draws: Vec<(String, usize)> = fx
            .backend
            .trace()
            .iter()
            .filter_map(|c| match c {
                DrawCall::DrawMesh { shader, layer, .. } => Some((shader.clone(), *layer)),
                _ => None,
            })
            .collect();
        assert_eq!(
            draws,
            vec![
                ("lit".to_owned(), 0),
                ("lit".to_owned(), 0),
                ("amb".to_owned(), 1),
                ("amb".to_owned(), 1),
            ]
        );
        // One context: its state is bound once for both layers.
        let binds = fx
            .backend
            .trace()
            .iter()
            .filter(|c| matches!(c, DrawCall::SetWorldToCamera))
            .count();
        assert_eq!(binds, 1);
    }
}
