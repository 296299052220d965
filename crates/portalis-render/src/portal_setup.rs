//! Recursive setup of everything visible through portals.
//!
//! [`StandardPortalSetup`] walks the portals recorded in a context. A portal
//! whose flags need nothing beyond re-clipping is *simple*: the sector behind
//! it is drawn into the same target through a new context clipped to the
//! portal polygon. Every other portal is *heavy*: the sector behind it is
//! rendered into a leased texture, and a textured triangle fan covering the
//! portal is queued in the parent context.

use std::sync::Arc;

use portalis_core::config::ConfigStore;
use portalis_core::math::{Box2, Vec2, Vec3, Vec4, mat4_from_rows};
use portalis_core::profiling::profile_function;
use portalis_test_utils::{GpuBuffer, RenderContext};

use crate::Ticks;
use crate::camera::Camera;
use crate::clipper::{BoxClipperCache, Clipper2D};
use crate::error::{RenderError, RenderResult};
use crate::render_mesh::{
    BufferHolder, MeshType, MixMode, ShaderVarName, ShaderVarStringSet, ShaderVariableValue, ZBufMode,
};
use crate::render_tree::{Attachment, ContextId, DebugFlag, DebugPersistent, DrawFlags, PortalHolder, RenderTarget, RenderTree};
use crate::resource_cache::{CacheSized, GenericResourceCache, ReuseIfOnlyOneRef, SharedHandle, SortingBySize};
use crate::scene::{DEFAULT_MAX_SECTOR_VISIT, MeshWrapper, Portal, PortalFlags, Sector};
use crate::texture_cache::{TextureCache, TextureCacheOptions, TextureProperties};

/// Ticks a portal texture stays leased.
pub const DEFAULT_TEXTURE_LIFETIME: Ticks = 20;

/// Shader variable the portal texture is bound under.
pub const SV_TEX_PORTAL: &str = "tex portal";

/// Whether a portal with `flags` can be drawn into its parent's target.
pub fn is_simple_portal(flags: PortalFlags) -> bool {
    !flags.intersects(
        PortalFlags::CLIP_DEST
            | PortalFlags::CLIP_STRADDLING
            | PortalFlags::ZFILL
            | PortalFlags::MIRROR
            | PortalFlags::FLOAT,
    )
}

/// Geometry streams of one portal footprint mesh.
#[derive(Debug, Clone)]
pub struct PortalBuffers {
    pub coords: GpuBuffer,
    pub texcoords: GpuBuffer,
    pub indices: GpuBuffer,
    pub holder: Arc<BufferHolder>,
    /// Vertices the buffers have room for.
    pub capacity: usize,
}

impl PortalBuffers {
    fn create(graphics: &dyn RenderContext, capacity: usize) -> RenderResult<Self> {
        let coords = create_stream(graphics, "portal coords", capacity * size_of::<Vec3>(), wgpu::BufferUsages::VERTEX)?;
        let texcoords = create_stream(
            graphics,
            "portal texcoords",
            capacity * size_of::<Vec4>(),
            wgpu::BufferUsages::VERTEX,
        )?;
        let indices = create_stream(graphics, "portal indices", capacity * size_of::<u32>(), wgpu::BufferUsages::INDEX)?;

        Ok(Self {
            holder: Arc::new(BufferHolder {
                index: indices.clone(),
                position: coords.clone(),
                texcoord0: texcoords.clone(),
            }),
            coords,
            texcoords,
            indices,
            capacity,
        })
    }
}

fn create_stream(
    graphics: &dyn RenderContext,
    label: &'static str,
    size: usize,
    usage: wgpu::BufferUsages,
) -> RenderResult<GpuBuffer> {
    let size = size as u64;
    graphics
        .create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
        .ok_or(RenderError::BufferAllocation { label, size })
}

impl CacheSized for PortalBuffers {
    fn cache_size(&self) -> usize {
        self.capacity
    }
}

/// Buffers are in flight while any mesh still holds their buffer holder.
impl SharedHandle for PortalBuffers {
    fn ref_count(&self) -> usize {
        Arc::strong_count(&self.holder)
    }
}

pub type PortalBufferCache = GenericResourceCache<PortalBuffers, SortingBySize, ReuseIfOnlyOneRef>;

/// Long-lived state of the portal setup, owned by the render manager.
pub struct PortalPersistentData {
    pub tex_cache: TextureCache,
    pub buf_cache: PortalBufferCache,
    pub box_clipper_cache: BoxClipperCache,
    pub sv_name_tex_portal: ShaderVarName,
    pub texture_lifetime: Ticks,
    /// Sector visit limit for portals without their own.
    pub max_sector_visit: u32,
    pub dbg_draw_portal_outlines: DebugFlag,
    pub dbg_draw_portal_planes: DebugFlag,
    pub dbg_show_portal_textures: DebugFlag,
}

impl PortalPersistentData {
    pub fn new(strings: &mut ShaderVarStringSet, debug: &mut DebugPersistent) -> Self {
        Self {
            tex_cache: TextureCache::new(
                "portal",
                TextureProperties::render_target(wgpu::TextureFormat::Rgba8Unorm),
                TextureCacheOptions::POWER_OF_TWO,
            ),
            buf_cache: PortalBufferCache::new(),
            box_clipper_cache: BoxClipperCache::new(),
            sv_name_tex_portal: strings.request(SV_TEX_PORTAL),
            texture_lifetime: DEFAULT_TEXTURE_LIFETIME,
            max_sector_visit: DEFAULT_MAX_SECTOR_VISIT,
            dbg_draw_portal_outlines: debug.register_debug_flag("draw.portals.outlines"),
            dbg_draw_portal_planes: debug.register_debug_flag("draw.portals.planes"),
            dbg_show_portal_textures: debug.register_debug_flag("textures.portals"),
        }
    }

    /// Reads `RenderManager.Portals.*` and `RenderManager.TextureCache.*`.
    pub fn from_config(config: &ConfigStore, strings: &mut ShaderVarStringSet, debug: &mut DebugPersistent) -> Self {
        let mut data = Self::new(strings, debug);

        let mut options = TextureCacheOptions::empty();
        options.set(
            TextureCacheOptions::POWER_OF_TWO,
            config.get_bool("RenderManager.TextureCache.PowerOfTwo", true),
        );
        options.set(
            TextureCacheOptions::EXACT_SIZE_MATCH,
            config.get_bool("RenderManager.TextureCache.ExactSize", false),
        );
        data.tex_cache.set_options(options);

        let lifetime = config.get_int("RenderManager.Portals.TextureLifetime", DEFAULT_TEXTURE_LIFETIME as i64);
        data.texture_lifetime = lifetime.max(0) as Ticks;
        let max_visit = config.get_int("RenderManager.Portals.DefaultMaxSectorVisit", DEFAULT_MAX_SECTOR_VISIT as i64);
        data.max_sector_visit = max_visit.max(1) as u32;
        data
    }

    /// Per-frame housekeeping; must run once before every rendered view.
    pub fn update_new_frame(&mut self, now: Ticks) {
        profile_function!();
        self.tex_cache.advance_frame(now);
        self.buf_cache.advance_time(now);
        self.box_clipper_cache.advance_time(now);
    }
}

/// Carried between the portal setups of one context chain.
#[derive(Debug, Clone, Copy)]
pub struct ContextSetupData {
    /// Simple-portal contexts are inserted after this one.
    pub last_simple_portal_ctx: ContextId,
}

impl ContextSetupData {
    pub fn new(context: ContextId) -> Self {
        Self {
            last_simple_portal_ctx: context,
        }
    }
}

/// Fills a context with meshes; called for every context portal setup creates.
///
/// Implementations are expected to run [`StandardPortalSetup`] on the
/// context themselves if they want portals followed.
pub trait ContextSetup {
    fn setup_context(
        &mut self,
        tree: &mut RenderTree<'_>,
        context: ContextId,
        setup_data: &mut ContextSetupData,
        portals: &mut PortalPersistentData,
        graphics: &dyn RenderContext,
    );
}

/// Counters of one [`StandardPortalSetup::run`] call (not including nested runs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortalSetupStats {
    pub simple: usize,
    pub heavy: usize,
    /// Destination sector could not be resolved.
    pub unresolved: usize,
    /// Clipped away entirely.
    pub offscreen: usize,
    pub recursion_skips: usize,
    pub failed: usize,
    /// Screen polygon vertices walked over.
    pub vertices_consumed: usize,
}

struct PortalFootprint<'v> {
    verts2d: &'v [Vec2],
    verts3d: &'v [Vec3],
    screen_width: u32,
    screen_height: u32,
}

pub struct StandardPortalSetup<'a> {
    persistent: &'a mut PortalPersistentData,
    graphics: &'a dyn RenderContext,
}

impl<'a> StandardPortalSetup<'a> {
    pub fn new(persistent: &'a mut PortalPersistentData, graphics: &'a dyn RenderContext) -> Self {
        Self { persistent, graphics }
    }

    /// Sets up what is visible through every portal of `context`.
    pub fn run<C: ContextSetup + ?Sized>(
        &mut self,
        tree: &mut RenderTree<'_>,
        context: ContextId,
        setup_data: &mut ContextSetupData,
        context_setup: &mut C,
    ) -> PortalSetupStats {
        profile_function!();
        let mut stats = PortalSetupStats::default();

        let (view, holders, target_size) = {
            let node = tree.context(context);
            (node.render_view.clone(), node.all_portals.clone(), node.target_dimensions())
        };
        let (screen_width, screen_height) = target_size.unwrap_or_else(|| view.graphics_dimensions());

        let draw_outlines = tree.is_debug_flag_enabled(self.persistent.dbg_draw_portal_outlines);
        let draw_planes = tree.is_debug_flag_enabled(self.persistent.dbg_draw_portal_planes);

        let mut verts2d: Vec<Vec2> = Vec::with_capacity(64);
        let mut verts3d: Vec<Vec3> = Vec::with_capacity(64);
        let mut counts: Vec<usize> = Vec::new();

        for holder in &holders {
            let portal_count = holder.container.portal_count();
            let total = holder.container.total_vertex_count();
            verts2d.clear();
            verts2d.resize(total * 3, Vec2::ZERO);
            verts3d.clear();
            verts3d.resize(total * 3, Vec3::ZERO);
            counts.clear();
            counts.resize(portal_count, 0);

            holder.container.compute_screen_polygons(
                &view,
                &mut verts2d,
                &mut verts3d,
                &mut counts,
                screen_width,
                screen_height,
            );

            let mut cursor = 0;
            for (index, &count) in counts.iter().enumerate() {
                let start = cursor;
                cursor += count;
                if cursor > verts2d.len() {
                    tracing::warn!(
                        "Portal container of '{}' reported {} vertices, room for {}",
                        holder.mesh.name(),
                        cursor,
                        verts2d.len()
                    );
                    break;
                }

                let portal = holder.container.portal(index);
                if !portal.complete_sector(&view) {
                    tracing::trace!("Portal '{}' has no resolvable destination", portal.name());
                    stats.unresolved += 1;
                    continue;
                }
                if count == 0 {
                    stats.offscreen += 1;
                    continue;
                }
                let Some(sector) = portal.sector() else {
                    stats.unresolved += 1;
                    continue;
                };

                let flags = portal.flags();
                let simple = is_simple_portal(flags);
                let max_visit = portal.maximum_sector_visit().unwrap_or(self.persistent.max_sector_visit);
                let skip_recursion = tree.rec_level(sector.id()) >= max_visit;
                let footprint = PortalFootprint {
                    verts2d: &verts2d[start..cursor],
                    verts3d: &verts3d[start..cursor],
                    screen_width,
                    screen_height,
                };

                if draw_outlines {
                    add_debug_outline(tree, &footprint, simple, skip_recursion);
                }
                if draw_planes {
                    add_debug_plane(tree, portal.as_ref(), simple, skip_recursion);
                }

                if skip_recursion {
                    tracing::trace!(
                        "Not following portal '{}': sector '{}' visited {} times",
                        portal.name(),
                        sector.name(),
                        tree.rec_level(sector.id())
                    );
                    stats.recursion_skips += 1;
                    tree.stats.recursion_skips += 1;
                    continue;
                }

                tree.inc_rec_level(sector.id());
                if simple {
                    self.setup_simple_portal(tree, context, setup_data, context_setup, &portal, &sector, &footprint, holder);
                    stats.simple += 1;
                    tree.stats.simple_portals += 1;
                } else {
                    match self.setup_heavy_portal(tree, context, context_setup, &portal, &sector, &footprint, holder) {
                        Ok(()) => {
                            stats.heavy += 1;
                            tree.stats.heavy_portals += 1;
                        }
                        Err(err) => {
                            tracing::warn!("Skipping heavy portal '{}': {}", portal.name(), err);
                            stats.failed += 1;
                            tree.stats.failed_portals += 1;
                        }
                    }
                }
                tree.dec_rec_level(sector.id());
            }
            stats.vertices_consumed += cursor;
        }

        stats
    }

    #[allow(clippy::too_many_arguments)]
    fn setup_simple_portal<C: ContextSetup + ?Sized>(
        &mut self,
        tree: &mut RenderTree<'_>,
        context: ContextId,
        setup_data: &mut ContextSetupData,
        context_setup: &mut C,
        portal: &Arc<dyn Portal>,
        sector: &Arc<dyn Sector>,
        footprint: &PortalFootprint<'_>,
        holder: &PortalHolder,
    ) {
        let parent = tree.context(context);
        let targets = parent.render_targets.clone();
        let perspective_fixup = parent.perspective_fixup;
        let depth = parent.recursion_depth;

        let mut view = parent.render_view.create_render_context();
        view.set_last_portal(Some(portal.clone()));
        view.set_previous_sector(view.this_sector().cloned());
        view.set_this_sector(Some(sector.clone()));
        view.set_clipper(Clipper2D::Polygon(footprint.verts2d.to_vec()));
        view.set_view_dimensions(footprint.screen_width, footprint.screen_height);

        if portal.flags().contains(PortalFlags::WARP) {
            setup_warp(view.create_new_camera(), holder.mesh.as_ref(), portal.as_ref());
        }

        let portal_ctx = tree.create_context(view, Some(setup_data.last_simple_portal_ctx));
        setup_data.last_simple_portal_ctx = portal_ctx;

        let node = tree.context_mut(portal_ctx);
        node.render_targets = targets;
        node.perspective_fixup = perspective_fixup;
        node.recursion_depth = depth + 1;

        tracing::trace!("Simple portal '{}' into sector '{}'", portal.name(), sector.name());
        context_setup.setup_context(tree, portal_ctx, setup_data, self.persistent, self.graphics);
    }

    #[allow(clippy::too_many_arguments)]
    fn setup_heavy_portal<C: ContextSetup + ?Sized>(
        &mut self,
        tree: &mut RenderTree<'_>,
        context: ContextId,
        context_setup: &mut C,
        portal: &Arc<dyn Portal>,
        sector: &Arc<dyn Sector>,
        footprint: &PortalFootprint<'_>,
        holder: &PortalHolder,
    ) -> RenderResult<()> {
        let verts2d = footprint.verts2d;
        let verts3d = footprint.verts3d;
        let count = verts2d.len();
        let flags = portal.flags();

        let screen_box = Box2::from_points(verts2d);
        let sb_min_x = screen_box.min.x as i32;
        let sb_min_y = screen_box.min.y as i32;
        let txt_w = (screen_box.max.x - screen_box.min.x).ceil() as u32;
        let txt_h = (screen_box.max.y - screen_box.min.y).ceil() as u32;

        let leased = self.persistent.tex_cache.query_unused_texture(
            self.graphics,
            txt_w,
            txt_h,
            self.persistent.texture_lifetime,
        )?;
        let (real_w, real_h) = (leased.real_width, leased.real_height);
        let buffers = self.acquire_buffers(count)?;

        if tree.is_debug_flag_enabled(self.persistent.dbg_show_portal_textures) {
            tree.add_debug_texture(leased.texture.clone(), real_w as f32 / real_h as f32);
        }

        let parent = tree.context(context);
        let parent_view = parent.render_view.clone();
        let depth = parent.recursion_depth;
        let parent_cam = parent_view.camera().clone();
        let mut new_cam = parent_cam.clone();

        if flags.contains(PortalFlags::WARP) {
            setup_warp(&mut new_cam, holder.mesh.as_ref(), portal.as_ref());
        }

        // Moves the portal's bounding rectangle to the corner of the texture:
        // normalized -> screen space, translate, target space -> normalized.
        {
            let screen_w = footprint.screen_width as f32;
            let screen_h = footprint.screen_height as f32;
            let irw = 1.0 / real_w as f32;
            let irh = 1.0 / real_h as f32;
            let height_slack = real_h as i32 - txt_h as i32;
            #[rustfmt::skip]
            let proj_shift = mat4_from_rows(
                screen_w * irw, 0.0, 0.0, irw * (screen_w - 2.0 * sb_min_x as f32) - 1.0,
                0.0, screen_h * irh, 0.0, irh * (screen_h + 2.0 * (height_slack - sb_min_y) as f32) - 1.0,
                0.0, 0.0, 1.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            );
            new_cam.set_projection(proj_shift * new_cam.projection());
        }

        // Push the camera slightly into the target sector so its geometry
        // overlaps the portal border instead of leaving a crack.
        {
            let mut max_z = 0.0;
            let mut max_c = 0;
            for (c, vertex) in verts3d.iter().enumerate() {
                if vertex.z > max_z {
                    max_z = vertex.z;
                    max_c = c;
                }
            }

            let z_to_post_project = parent_cam.projection() * Vec4::new(0.0, 0.0, max_z, 1.0);
            let mut p = verts2d[max_c] + Vec2::splat(1.5);
            p /= Vec2::new(0.5 * footprint.screen_width as f32, 0.5 * footprint.screen_height as f32);
            p -= Vec2::ONE;
            let p_proj = Vec4::new(
                p.x * z_to_post_project.w,
                p.y * z_to_post_project.w,
                z_to_post_project.z,
                z_to_post_project.w,
            );
            let p_proj_inv = parent_cam.inv_projection() * p_proj;
            let d = verts3d[max_c].distance(p_proj_inv.truncate());

            let normal = portal.world_plane().normal;
            let portal_dir = if flags.contains(PortalFlags::WARP) {
                portal.warp().other_to_this_relative(normal)
            } else {
                normal
            };
            let origin = new_cam.transform().origin() + d * portal_dir;
            new_cam.transform_mut().set_origin(origin);
        }

        let mut new_view = parent_view.with_camera(new_cam);
        new_view.set_last_portal(Some(portal.clone()));
        new_view.set_previous_sector(parent_view.this_sector().cloned());
        new_view.set_this_sector(Some(sector.clone()));
        new_view.set_view_dimensions(real_w, real_h);
        // One extra pixel so the portal border is covered as well.
        let clip_box = Box2::new(
            0.0,
            real_h as f32 - (txt_h + 1) as f32,
            (txt_w + 1) as f32,
            real_h as f32,
        );
        new_view.set_clipper(self.persistent.box_clipper_cache.acquire(clip_box));

        let portal_ctx = tree.create_context(new_view, None);
        {
            let node = tree.context_mut(portal_ctx);
            node.set_target(Attachment::Color0, Some(RenderTarget::new(leased.texture.clone())));
            node.draw_flags = DrawFlags::CLEAR_SCREEN | DrawFlags::CLEAR_ZBUFFER;
            node.recursion_depth = depth + 1;
        }

        tracing::trace!(
            "Heavy portal '{}' into sector '{}' via {}x{} target",
            portal.name(),
            sector.name(),
            real_w,
            real_h
        );
        let mut new_setup = ContextSetupData::new(portal_ctx);
        context_setup.setup_context(tree, portal_ctx, &mut new_setup, self.persistent, self.graphics);

        // Footprint geometry, texture coordinates projective in z.
        let xscale = 1.0 / real_w as f32;
        let yscale = 1.0 / real_h as f32;
        let texcoords: Vec<Vec4> = verts2d
            .iter()
            .zip(verts3d)
            .map(|(p2, p3)| {
                let z = p3.z;
                Vec4::new(
                    (p2.x - sb_min_x as f32) * xscale * z,
                    (txt_h as f32 - (p2.y - sb_min_y as f32)) * yscale * z,
                    0.0,
                    z,
                )
            })
            .collect();
        let indices: Vec<u32> = (0..count as u32).collect();

        self.graphics
            .write_buffer(&buffers.coords, 0, bytemuck::cast_slice(verts3d));
        self.graphics
            .write_buffer(&buffers.texcoords, 0, bytemuck::cast_slice(&texcoords));
        self.graphics
            .write_buffer(&buffers.indices, 0, bytemuck::cast_slice(&indices));

        let camera_transform = *parent_view.camera().transform();
        let center = verts3d.iter().copied().sum::<Vec3>() / count as f32;
        let from_name = parent_view.this_sector().map(|s| s.name().to_owned()).unwrap_or_default();

        let (slot, _) = tree.mesh_holder().get_unused_mesh(parent_view.frame_number());
        {
            let mesh = Arc::make_mut(slot);
            mesh.name = format!("[portal from {} to {}]", from_name, sector.name());
            mesh.material = portal.material();
            mesh.mesh_type = MeshType::TriangleFan;
            mesh.buffers = Some(buffers.holder.clone());
            mesh.z_buf_mode = ZBufMode::Use;
            mesh.object_to_world = camera_transform;
            mesh.index_start = 0;
            mesh.index_end = count as u32;
            mesh.mix_mode = MixMode::REPLACE;
            mesh.variable_context.clear();
            mesh.variable_context.set(
                self.persistent.sv_name_tex_portal,
                ShaderVariableValue::Texture(leased.texture),
            );
            mesh.bounding_center = camera_transform.this_to_other(center);
        }
        let mesh = slot.clone();

        tree.context_mut(context)
            .add_render_mesh(mesh, holder.mesh.render_priority());
        Ok(())
    }

    fn acquire_buffers(&mut self, count: usize) -> RenderResult<PortalBuffers> {
        if let Some(entry) = self.persistent.buf_cache.query(&count, false) {
            return Ok(entry.data.clone());
        }
        let buffers = PortalBuffers::create(self.graphics, count)?;
        tracing::debug!("Allocated portal buffers for {} vertices", count);
        Ok(self.persistent.buf_cache.add_active(buffers, ()).data.clone())
    }
}

fn setup_warp(camera: &mut Camera, mesh: &dyn MeshWrapper, portal: &dyn Portal) {
    let movable = mesh.full_transform();
    let mut mirror = camera.is_mirrored();
    let warp_world = portal.object_to_world(&movable);
    let mut transform = *camera.transform();
    portal.warp_space(&warp_world, &mut transform, &mut mirror);
    camera.set_transform(transform);
    camera.set_mirrored(mirror);
}

fn outline_color(simple: bool, skip_recursion: bool) -> [u8; 3] {
    let blue = if skip_recursion { 255 } else { 0 };
    if simple { [0, 255, blue] } else { [255, 0, blue] }
}

fn add_debug_outline(tree: &mut RenderTree<'_>, footprint: &PortalFootprint<'_>, simple: bool, skip_recursion: bool) {
    let color = outline_color(simple, skip_recursion);
    let height = footprint.screen_height as f32;
    let verts = footprint.verts2d;
    for i in 0..verts.len() {
        let next = (i + 1) % verts.len();
        let from = Vec2::new(verts[i].x, height - verts[i].y);
        let to = Vec2::new(verts[next].x, height - verts[next].y);
        tree.add_debug_line_screen(from, to, color);
    }
}

fn add_debug_plane(tree: &mut RenderTree<'_>, portal: &dyn Portal, simple: bool, skip_recursion: bool) {
    let vertices = portal.world_vertices();
    if vertices.is_empty() {
        return;
    }
    let center = vertices.iter().copied().sum::<Vec3>() / vertices.len() as f32;
    let blue = if skip_recursion { 1.0 } else { 0.0 };
    let color = if simple {
        Vec3::new(0.0, 1.0, blue)
    } else {
        Vec3::new(1.0, 0.0, blue)
    };
    tree.add_debug_plane(portal.world_plane(), center, color);
}
