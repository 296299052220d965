//! GPU-free graphics backend and scene fixtures for tests.

use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;
use portalis_core::math::{Box2, Mat4, Plane3, ReversibleTransform, Vec2, Vec3, Vec4};
use portalis_test_utils::{GpuTexture, MockRenderContext, RenderContext};

use crate::camera::Camera;
use crate::clipper::Clipper2D;
use crate::context_render::GraphicsBackend;
use crate::error::{RenderError, RenderResult};
use crate::render_mesh::{Material, RenderMesh, RenderPriority, ShaderHandle, ShaderVariableContext};
use crate::render_tree::{Attachment, DrawFlags, RenderTarget};
use crate::render_view::RenderView;
use crate::scene::{MeshWrapper, Portal, PortalContainer, PortalFlags, Sector, SectorId};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCall {
    /// Mock id of the bound texture, `None` for the screen.
    SetRenderTarget { attachment: Attachment, texture: Option<usize> },
    UnsetRenderTargets,
    SetProjection { aspect: f32 },
    SetClipper(Option<Box2>),
    BeginDraw(DrawFlags),
    FinishDraw,
    SetWorldToCamera,
    /// Number of context variables bound.
    SetShaderVariables(usize),
    DrawMesh { name: String, shader: String, layer: usize },
    ReadPixel { texture: Option<usize> },
}

/// Records every call and can be told to refuse targets or drawing.
pub struct MockGraphicsBackend {
    resources: MockRenderContext,
    width: u32,
    height: u32,
    trace: Vec<DrawCall>,
    bound: [Option<RenderTarget>; Attachment::COUNT],
    invalid_targets: Vec<GpuTexture>,
    refuse_begin: bool,
    in_draw: bool,
    pixels: AHashMap<usize, Vec4>,
    default_pixel: Vec4,
    mesh_variables: Vec<ShaderVariableContext>,
}

impl MockGraphicsBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            resources: MockRenderContext::new(),
            width,
            height,
            trace: Vec::new(),
            bound: [None, None],
            invalid_targets: Vec::new(),
            refuse_begin: false,
            in_draw: false,
            pixels: AHashMap::new(),
            default_pixel: Vec4::ZERO,
            mesh_variables: Vec::new(),
        }
    }

    pub fn mock_resources(&self) -> &MockRenderContext {
        &self.resources
    }

    pub fn trace(&self) -> &[DrawCall] {
        &self.trace
    }

    pub fn clear_trace(&mut self) {
        self.trace.clear();
        self.mesh_variables.clear();
    }

    /// Names of drawn meshes in drawing order.
    pub fn drawn_meshes(&self) -> Vec<&str> {
        self.trace
            .iter()
            .filter_map(|call| match call {
                DrawCall::DrawMesh { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Per-mesh variable contexts, parallel to [`Self::drawn_meshes`].
    pub fn drawn_mesh_variables(&self) -> &[ShaderVariableContext] {
        &self.mesh_variables
    }

    /// Makes validation fail whenever `texture` is bound.
    pub fn reject_target(&mut self, texture: GpuTexture) {
        self.invalid_targets.push(texture);
    }

    pub fn refuse_begin_draw(&mut self, refuse: bool) {
        self.refuse_begin = refuse;
    }

    pub fn set_pixel(&mut self, texture: &GpuTexture, value: Vec4) {
        if let Some(id) = texture.mock_id() {
            self.pixels.insert(id, value);
        }
    }

    pub fn set_default_pixel(&mut self, value: Vec4) {
        self.default_pixel = value;
    }

    pub fn is_drawing(&self) -> bool {
        self.in_draw
    }
}

impl GraphicsBackend for MockGraphicsBackend {
    fn resources(&self) -> &dyn RenderContext {
        &self.resources
    }

    fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn set_render_target(&mut self, attachment: Attachment, target: Option<&RenderTarget>) {
        self.bound[attachment.index()] = target.cloned();
        self.trace.push(DrawCall::SetRenderTarget {
            attachment,
            texture: target.and_then(|t| t.texture.mock_id()),
        });
    }

    fn validate_render_targets(&mut self) -> RenderResult<()> {
        for attachment in Attachment::ALL {
            if let Some(target) = &self.bound[attachment.index()]
                && self.invalid_targets.iter().any(|t| t.ptr_eq(&target.texture))
            {
                return Err(RenderError::InvalidRenderTarget {
                    attachment,
                    reason: "rejected by mock backend".into(),
                });
            }
        }
        Ok(())
    }

    fn unset_render_targets(&mut self) {
        self.bound = [None, None];
        self.trace.push(DrawCall::UnsetRenderTargets);
    }

    fn set_projection(&mut self, _projection: Mat4, aspect: f32) {
        self.trace.push(DrawCall::SetProjection { aspect });
    }

    fn set_clipper(&mut self, clipper: Option<&Clipper2D>) {
        self.trace.push(DrawCall::SetClipper(clipper.map(Clipper2D::bounds)));
    }

    fn begin_draw(&mut self, flags: DrawFlags) -> bool {
        if self.refuse_begin {
            return false;
        }
        assert!(!self.in_draw, "begin_draw while already drawing");
        self.in_draw = true;
        self.trace.push(DrawCall::BeginDraw(flags));
        true
    }

    fn finish_draw(&mut self) {
        assert!(self.in_draw, "finish_draw without begin_draw");
        self.in_draw = false;
        self.trace.push(DrawCall::FinishDraw);
    }

    fn set_world_to_camera(&mut self, _transform: &ReversibleTransform) {
        self.trace.push(DrawCall::SetWorldToCamera);
    }

    fn set_shader_variables(&mut self, variables: &ShaderVariableContext) {
        self.trace.push(DrawCall::SetShaderVariables(variables.len()));
    }

    fn draw_mesh(&mut self, mesh: &RenderMesh, shader: &ShaderHandle, layer: usize) {
        assert!(self.in_draw, "draw_mesh outside begin/finish");
        self.trace.push(DrawCall::DrawMesh {
            name: mesh.name.clone(),
            shader: shader.name().to_owned(),
            layer,
        });
        self.mesh_variables.push(mesh.variable_context.clone());
    }

    fn read_pixel(&mut self, texture: &GpuTexture) -> Option<Vec4> {
        let id = texture.mock_id();
        self.trace.push(DrawCall::ReadPixel { texture: id });
        Some(id.and_then(|id| self.pixels.get(&id).copied()).unwrap_or(self.default_pixel))
    }
}

/// Sector whose visible meshes are a fixed list.
pub struct TestSector {
    id: SectorId,
    name: String,
    meshes: Mutex<Vec<Arc<dyn MeshWrapper>>>,
}

impl TestSector {
    pub fn new(id: u64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: SectorId(id),
            name: name.to_owned(),
            meshes: Mutex::new(Vec::new()),
        })
    }

    pub fn add_mesh(&self, mesh: Arc<dyn MeshWrapper>) {
        self.meshes.lock().push(mesh);
    }
}

impl Sector for TestSector {
    fn id(&self) -> SectorId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn visible_meshes(&self, _view: &RenderView) -> Vec<Arc<dyn MeshWrapper>> {
        self.meshes.lock().clone()
    }
}

/// Quad portal in world space.
pub struct TestPortal {
    name: String,
    flags: PortalFlags,
    target: Weak<dyn Sector>,
    resolvable: bool,
    warp: ReversibleTransform,
    vertices: Vec<Vec3>,
    plane: Plane3,
    max_visit: Option<u32>,
}

impl TestPortal {
    /// Portal spanning `vertices`, counter-clockwise as seen from the viewer.
    /// The plane normal points away from the viewer, into `target`.
    pub fn new(name: &str, flags: PortalFlags, target: &Arc<dyn Sector>, vertices: Vec<Vec3>) -> Self {
        let normal = (vertices[1] - vertices[0]).cross(vertices[2] - vertices[0]);
        Self {
            name: name.to_owned(),
            flags,
            target: Arc::downgrade(target),
            resolvable: true,
            warp: ReversibleTransform::IDENTITY,
            plane: Plane3::from_point_normal(vertices[0], normal),
            vertices,
            max_visit: None,
        }
    }

    /// Unit quad at depth `z` in front of a camera at the origin.
    pub fn quad(name: &str, flags: PortalFlags, target: &Arc<dyn Sector>, z: f32) -> Self {
        Self::new(
            name,
            flags,
            target,
            vec![
                Vec3::new(-1.0, -1.0, z),
                Vec3::new(1.0, -1.0, z),
                Vec3::new(1.0, 1.0, z),
                Vec3::new(-1.0, 1.0, z),
            ],
        )
    }

    pub fn unresolvable(mut self) -> Self {
        self.resolvable = false;
        self
    }

    pub fn with_warp(mut self, warp: ReversibleTransform) -> Self {
        self.warp = warp;
        self
    }

    pub fn with_max_visit(mut self, max_visit: u32) -> Self {
        self.max_visit = Some(max_visit);
        self
    }
}

impl Portal for TestPortal {
    fn name(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> PortalFlags {
        self.flags
    }

    fn complete_sector(&self, _view: &RenderView) -> bool {
        self.resolvable && self.target.strong_count() > 0
    }

    fn sector(&self) -> Option<Arc<dyn Sector>> {
        self.target.upgrade()
    }

    fn warp(&self) -> ReversibleTransform {
        self.warp
    }

    fn material(&self) -> Option<Arc<Material>> {
        Some(Arc::new(
            Material::new("portal").with_shader("base", ShaderHandle::new("portal_tex")),
        ))
    }

    fn world_plane(&self) -> Plane3 {
        self.plane
    }

    fn world_vertices(&self) -> Vec<Vec3> {
        self.vertices.clone()
    }

    fn maximum_sector_visit(&self) -> Option<u32> {
        self.max_visit
    }
}

/// Projects its portals through the view camera.
///
/// A portal is reported with zero vertices when any corner is behind the
/// eye or its polygon lies entirely outside the view clipper; otherwise its
/// projected corners are reported unclipped.
pub struct TestPortalContainer {
    portals: Vec<Arc<TestPortal>>,
}

impl TestPortalContainer {
    pub fn new(portals: Vec<TestPortal>) -> Arc<Self> {
        Arc::new(Self {
            portals: portals.into_iter().map(Arc::new).collect(),
        })
    }
}

impl PortalContainer for TestPortalContainer {
    fn portal_count(&self) -> usize {
        self.portals.len()
    }

    fn total_vertex_count(&self) -> usize {
        self.portals.iter().map(|p| p.vertices.len()).sum()
    }

    fn portal(&self, index: usize) -> Arc<dyn Portal> {
        self.portals[index].clone()
    }

    fn compute_screen_polygons(
        &self,
        view: &RenderView,
        verts2d: &mut [Vec2],
        verts3d: &mut [Vec3],
        counts: &mut [usize],
        screen_width: u32,
        screen_height: u32,
    ) {
        let camera = view.camera();
        let mut cursor = 0;
        for (portal, count) in self.portals.iter().zip(counts.iter_mut()) {
            let camera_space: Vec<Vec3> = portal
                .vertices
                .iter()
                .map(|v| camera.transform().other_to_this(*v))
                .collect();
            let projected: Option<Vec<Vec2>> = camera_space
                .iter()
                .map(|v| camera.project(*v, screen_width as f32, screen_height as f32))
                .collect();

            let visible = match (&projected, view.clipper()) {
                (None, _) => false,
                (Some(points), Some(clipper)) => !clipper.clip(points).is_empty(),
                (Some(points), None) => {
                    let screen = Clipper2D::Box(Box2::new(0.0, 0.0, screen_width as f32, screen_height as f32));
                    !screen.clip(points).is_empty()
                }
            };

            *count = 0;
            if let (true, Some(points)) = (visible, projected) {
                for (p2, p3) in points.iter().zip(&camera_space) {
                    verts2d[cursor] = *p2;
                    verts3d[cursor] = *p3;
                    cursor += 1;
                }
                *count = points.len();
            }
        }
    }
}

/// Mesh object with fixed render meshes and optional portals.
pub struct TestMesh {
    name: String,
    priority: RenderPriority,
    transform: ReversibleTransform,
    meshes: Vec<Arc<RenderMesh>>,
    portals: Option<Arc<TestPortalContainer>>,
}

impl TestMesh {
    /// A mesh drawing one render mesh of the same name with `shader`.
    pub fn simple(name: &str, shader: &str, center: Vec3) -> Arc<Self> {
        let material = Material::new(name).with_shader("base", ShaderHandle::new(shader));
        let mesh = RenderMesh {
            name: name.to_owned(),
            material: Some(Arc::new(material)),
            bounding_center: center,
            ..Default::default()
        };
        Arc::new(Self {
            name: name.to_owned(),
            priority: RenderPriority::OBJECT,
            transform: ReversibleTransform::IDENTITY,
            meshes: vec![Arc::new(mesh)],
            portals: None,
        })
    }

    /// A mesh carrying only portals.
    pub fn portals(name: &str, portals: Arc<TestPortalContainer>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            priority: RenderPriority::PORTAL,
            transform: ReversibleTransform::IDENTITY,
            meshes: Vec::new(),
            portals: Some(portals),
        })
    }
}

impl MeshWrapper for TestMesh {
    fn name(&self) -> &str {
        &self.name
    }

    fn render_priority(&self) -> RenderPriority {
        self.priority
    }

    fn full_transform(&self) -> ReversibleTransform {
        self.transform
    }

    fn render_meshes(&self, _view: &RenderView, _frame: u64) -> Vec<Arc<RenderMesh>> {
        self.meshes.clone()
    }

    fn portal_container(&self) -> Option<Arc<dyn PortalContainer>> {
        self.portals.clone().map(|p| p as Arc<dyn PortalContainer>)
    }
}

/// Camera at the origin looking down +Z with a 90° field of view.
pub fn test_camera() -> Camera {
    Camera::perspective(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0)
}

/// 2×2 portal quad centred at `(x, 0, 4)`.
pub fn quad_at(name: &str, flags: PortalFlags, target: &Arc<dyn Sector>, x: f32) -> TestPortal {
    TestPortal::new(
        name,
        flags,
        target,
        vec![
            Vec3::new(x - 1.0, -1.0, 4.0),
            Vec3::new(x + 1.0, -1.0, 4.0),
            Vec3::new(x + 1.0, 1.0, 4.0),
            Vec3::new(x - 1.0, 1.0, 4.0),
        ],
    )
}

/// A room with a `floor`, a mirror on the left and an open doorway on the
/// right, both leading into a hall with a `statue`. Returns `(room, hall)`.
pub fn room_and_hall() -> (Arc<dyn Sector>, Arc<dyn Sector>) {
    let hall = TestSector::new(2, "hall");
    hall.add_mesh(TestMesh::simple("statue", "lit", Vec3::new(0.0, 0.0, 10.0)));
    let hall: Arc<dyn Sector> = hall;

    let room = TestSector::new(1, "room");
    room.add_mesh(TestMesh::simple("floor", "lit", Vec3::new(0.0, -1.0, 3.0)));
    room.add_mesh(TestMesh::portals(
        "walls",
        TestPortalContainer::new(vec![
            quad_at("mirror", PortalFlags::MIRROR, &hall, -2.0),
            quad_at("doorway", PortalFlags::empty(), &hall, 2.0),
        ]),
    ));
    (room, hall)
}
