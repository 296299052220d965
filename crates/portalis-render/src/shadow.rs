//! Configuration-driven parallel-split shadow maps.
//!
//! A shadow technique names its targets under
//! `RenderManager.Shadows.<Type>.Texture.<ID>.*`. The view frustum is cut
//! into `NumSplits` slices along its depth; every slice gets a light-space
//! projection cropped to its bounds and one context rendering into its own
//! textures. Every target has an exact-size [`TextureCache`]; the textures
//! are leased for the current frame and released again on the next one.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use portalis_core::config::ConfigStore;
use portalis_core::math::{Box2, Mat4, Vec2, Vec3, Vec4, mat4_from_rows};
use portalis_test_utils::{GpuTexture, RenderContext};

use crate::Ticks;
use crate::camera::Camera;
use crate::clipper::Clipper2D;
use crate::context_setup::StandardContextSetup;
use crate::error::{RenderError, RenderResult};
use crate::layers::{RenderLayer, RenderLayerConfig};
use crate::operations::for_each_mesh_node;
use crate::portal_setup::{ContextSetup, ContextSetupData, PortalPersistentData};
use crate::render_mesh::{ShaderHandle, ShaderVarName, ShaderVarStringSet, ShaderVariableContext, ShaderVariableValue};
use crate::render_tree::{Attachment, ContextId, ContextNode, DrawFlags, RenderTarget, RenderTree};
use crate::render_view::RenderView;
use crate::texture_cache::{TextureCache, TextureCacheOptions, TextureProperties};

/// Edge length of a shadow map in pixels.
pub const DEFAULT_SHADOW_MAP_SIZE: u32 = 1024;

pub const DEFAULT_NUM_SPLITS: u32 = 3;
pub const MAX_SPLITS: u32 = 8;
/// View-space depth range covered by the splits.
pub const DEFAULT_SPLIT_NEAR: f32 = 0.01;
pub const DEFAULT_SPLIT_FAR: f32 = 100.0;

/// Keeps the cropped depth range from collapsing when all bounds share one z.
const DEPTH_EPSILON: f32 = 1e-4;

/// Shader variable carrying `(1/w, 1/h, w, h)` of the shadow maps.
pub const SV_SHADOW_MAP_DIM: &str = "light shadow map pixel size";
/// Array of world-to-shadow-map matrices, one per split.
pub const SV_SHADOW_MAP_PROJECTION: &str = "light shadow map projection";
/// Array of `NumSplits + 1` view depths bounding the splits.
pub const SV_SHADOW_SPLIT_DISTS: &str = "light shadow split dists";

/// View depths bounding `num_splits` slices of `[near, far]`.
///
/// Each distance averages the logarithmic and the uniform split scheme, so
/// the result has `num_splits + 1` entries from `near` to `far`.
pub fn split_distances(near: f32, far: f32, num_splits: u32) -> Vec<f32> {
    let n = near.max(f32::EPSILON);
    let f = far.max(n);
    let parts = num_splits.max(1);
    (0..=parts)
        .map(|i| {
            let frac = i as f32 / parts as f32;
            (n * (f / n).powf(frac) + n + (f - n) * frac) * 0.5
        })
        .collect()
}

/// Post-projection light-space bounds of the view frustum between depths
/// `near` and `far`.
fn slice_bounds(view_camera: &Camera, view_size: Vec2, light: &Camera, near: f32, far: f32) -> Option<(Vec3, Vec3)> {
    let corners = [
        Vec2::new(0.0, 0.0),
        Vec2::new(view_size.x, 0.0),
        Vec2::new(0.0, view_size.y),
        view_size,
    ];
    let light_project = light.projection();
    let mut min = Vec3::splat(f32::INFINITY);
    let mut max = Vec3::splat(f32::NEG_INFINITY);
    for depth in [near, far] {
        for corner in corners {
            let camera_space = view_camera.inv_project(corner, depth, view_size.x, view_size.y)?;
            let world = view_camera.transform().this_to_other(camera_space);
            let light_space = light.transform().other_to_this(world);
            let projected = light_project * light_space.extend(1.0);
            if projected.w <= f32::EPSILON {
                return None;
            }
            let projected = projected.truncate() / projected.w;
            min = min.min(projected);
            max = max.max(projected);
        }
    }
    Some((min, max))
}

/// Maps `[min, max]` in x and y onto the whole map and `[min_z, max.z]` onto
/// the depth range.
#[rustfmt::skip]
fn crop_matrix(min: Vec3, max: Vec3, min_z: f32) -> Mat4 {
    let width = (max.x - min.x).max(f32::EPSILON);
    let height = (max.y - min.y).max(f32::EPSILON);
    let depth = max.z + DEPTH_EPSILON - min_z;
    mat4_from_rows(
        2.0 / width, 0.0, 0.0, -(max.x + min.x) / width,
        0.0, 2.0 / height, 0.0, -(max.y + min.y) / height,
        0.0, 0.0, 1.0 / depth, -min_z / depth,
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Errors in a shadow technique's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowConfigError {
    /// `Attachment` is not one of the known attachment names.
    UnknownAttachment { target: String, value: String },
    MissingAttachment { target: String },
    MissingShaderVar { target: String },
    MissingFormat { target: String },
    UnknownFormat { target: String, value: String },
    /// No `Texture.*` keys at all.
    NoTargets { shadow_type: String },
}

impl fmt::Display for ShadowConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShadowConfigError::UnknownAttachment { target, value } => {
                write!(f, "shadow target '{}' has unknown attachment '{}'", target, value)
            }
            ShadowConfigError::MissingAttachment { target } => {
                write!(f, "shadow target '{}' has no attachment", target)
            }
            ShadowConfigError::MissingShaderVar { target } => {
                write!(f, "shadow target '{}' has no shader variable", target)
            }
            ShadowConfigError::MissingFormat { target } => {
                write!(f, "shadow target '{}' has no texture format", target)
            }
            ShadowConfigError::UnknownFormat { target, value } => {
                write!(f, "shadow target '{}' has unknown texture format '{}'", target, value)
            }
            ShadowConfigError::NoTargets { shadow_type } => {
                write!(f, "shadow type '{}' defines no targets", shadow_type)
            }
        }
    }
}

impl std::error::Error for ShadowConfigError {}

/// Parses a texture format name as used in shadow configuration.
pub fn parse_texture_format(value: &str) -> Option<wgpu::TextureFormat> {
    let format = match value.trim().to_ascii_lowercase().as_str() {
        "d16" | "depth16" => wgpu::TextureFormat::Depth16Unorm,
        "d24" | "depth24" => wgpu::TextureFormat::Depth24Plus,
        "d24s8" => wgpu::TextureFormat::Depth24PlusStencil8,
        "d32" | "d32_f" | "depth32" => wgpu::TextureFormat::Depth32Float,
        "argb8" | "rgba8" => wgpu::TextureFormat::Rgba8Unorm,
        "r16_f" | "r16f" => wgpu::TextureFormat::R16Float,
        "r32_f" | "r32f" => wgpu::TextureFormat::R32Float,
        "rg16_f" | "rg16f" => wgpu::TextureFormat::Rg16Float,
        "abgr16_f" | "rgba16_f" | "rgba16f" => wgpu::TextureFormat::Rgba16Float,
        "abgr32_f" | "rgba32_f" | "rgba32f" => wgpu::TextureFormat::Rgba32Float,
        _ => return None,
    };
    Some(format)
}

/// One render target of a shadow map.
#[derive(Debug)]
pub struct ShadowTarget {
    pub id: String,
    pub attachment: Attachment,
    pub sv_name: ShaderVarName,
    pub format: wgpu::TextureFormat,
    pub mipmapped: bool,
    pub filtered: bool,
    pub tex_cache: TextureCache,
}

/// A leased shadow map and its target's shader variable.
#[derive(Debug, Clone)]
pub struct ShadowMapTexture {
    pub sv_name: ShaderVarName,
    pub texture: GpuTexture,
}

/// One slice of a [`ShadowMap`].
#[derive(Debug, Clone)]
pub struct ShadowSplit {
    pub context: ContextId,
    pub textures: Vec<ShadowMapTexture>,
    /// Light projection cropped to the slice.
    pub projection: Mat4,
}

/// Result of [`ShadowSettings::create_shadow_map_context`].
#[derive(Debug, Clone)]
pub struct ShadowMap {
    pub splits: Vec<ShadowSplit>,
    pub split_distances: Vec<f32>,
    pub dimensions: Vec4,
}

/// Targets and shader selection of one shadow technique.
#[derive(Debug)]
pub struct ShadowSettings {
    pub shadow_type: String,
    pub targets: Vec<ShadowTarget>,
    pub shader_type: String,
    pub default_shader: Option<ShaderHandle>,
    /// Give every mesh drawn into a shadow map a distinct integer id.
    pub provide_ids: bool,
    pub sv_mesh_id: ShaderVarName,
    pub sv_map_dim: ShaderVarName,
    pub sv_projection: ShaderVarName,
    pub sv_split_dists: ShaderVarName,
    pub map_size: u32,
    pub num_splits: u32,
    pub split_near: f32,
    pub split_far: f32,
    /// Ids handed out this frame, keyed by render mesh address.
    mesh_ids: AHashMap<usize, i32>,
    last_mesh_id: i32,
}

#[derive(Default)]
struct TargetKeys<'a> {
    attachment: Option<&'a str>,
    shader_var: Option<&'a str>,
    format: Option<&'a str>,
    no_mipmap: bool,
    no_filter: bool,
}

impl ShadowSettings {
    /// Reads the settings of shadow technique `shadow_type`.
    pub fn read_settings(
        config: &ConfigStore,
        shadow_type: &str,
        strings: &mut ShaderVarStringSet,
    ) -> Result<Self, ShadowConfigError> {
        let base = format!("RenderManager.Shadows.{}.", shadow_type);
        let texture_prefix = format!("{}Texture.", base);

        let mut grouped: BTreeMap<&str, TargetKeys<'_>> = BTreeMap::new();
        for (key, value) in config.enumerate(&texture_prefix) {
            let rest = &key[texture_prefix.len()..];
            let Some((id, field)) = rest.split_once('.') else {
                tracing::warn!("Ignoring shadow config key '{}'", key);
                continue;
            };
            let keys = grouped.entry(id).or_default();
            match field {
                "Attachment" => keys.attachment = Some(value),
                "ShaderVar" => keys.shader_var = Some(value),
                "Format" => keys.format = Some(value),
                "NoMipMap" => keys.no_mipmap = parse_flag(value),
                "NoFilter" => keys.no_filter = parse_flag(value),
                _ => tracing::warn!("Ignoring shadow config key '{}'", key),
            }
        }

        if grouped.is_empty() {
            return Err(ShadowConfigError::NoTargets {
                shadow_type: shadow_type.to_owned(),
            });
        }

        let mut targets = Vec::with_capacity(grouped.len());
        for (id, keys) in grouped {
            let target = id.to_owned();
            let attachment_name = keys
                .attachment
                .ok_or_else(|| ShadowConfigError::MissingAttachment { target: target.clone() })?;
            let attachment =
                Attachment::parse(attachment_name).ok_or_else(|| ShadowConfigError::UnknownAttachment {
                    target: target.clone(),
                    value: attachment_name.to_owned(),
                })?;
            let shader_var = keys
                .shader_var
                .ok_or_else(|| ShadowConfigError::MissingShaderVar { target: target.clone() })?;
            let format_name = keys
                .format
                .ok_or_else(|| ShadowConfigError::MissingFormat { target: target.clone() })?;
            let format = parse_texture_format(format_name).ok_or_else(|| ShadowConfigError::UnknownFormat {
                target: target.clone(),
                value: format_name.to_owned(),
            })?;

            let mipmapped = !keys.no_mipmap;
            let mut properties = TextureProperties::render_target(format).with_mipmaps(mipmapped);
            if attachment == Attachment::Depth {
                properties.usage |= wgpu::TextureUsages::COPY_SRC;
            }
            tracing::debug!(
                "Shadow '{}' target '{}': {:?} as {:?} bound to '{}'",
                shadow_type,
                target,
                attachment,
                format,
                shader_var
            );

            targets.push(ShadowTarget {
                tex_cache: TextureCache::new(
                    format!("shadow {}", target),
                    properties,
                    TextureCacheOptions::EXACT_SIZE_MATCH,
                ),
                id: target,
                attachment,
                sv_name: strings.request(shader_var),
                format,
                mipmapped,
                filtered: !keys.no_filter,
            });
        }

        let num_splits = config
            .get_int(&format!("{}NumSplits", base), DEFAULT_NUM_SPLITS as i64)
            .clamp(1, MAX_SPLITS as i64) as u32;
        let split_near = config
            .get_float(&format!("{}SplitNear", base), DEFAULT_SPLIT_NEAR)
            .max(f32::EPSILON);
        let split_far = config
            .get_float(&format!("{}SplitFar", base), DEFAULT_SPLIT_FAR)
            .max(split_near * 2.0);

        Ok(Self {
            shadow_type: shadow_type.to_owned(),
            targets,
            shader_type: config
                .get_str_or(&format!("{}Shader.Type", base), "shadow")
                .to_owned(),
            default_shader: config
                .get_str(&format!("{}Shader.Default", base))
                .map(ShaderHandle::new),
            provide_ids: config.get_bool(&format!("{}ProvideIDs", base), false),
            sv_mesh_id: strings.request(config.get_str_or(&format!("{}MeshIDName", base), "mesh id")),
            sv_map_dim: strings.request(SV_SHADOW_MAP_DIM),
            sv_projection: strings.request(SV_SHADOW_MAP_PROJECTION),
            sv_split_dists: strings.request(SV_SHADOW_SPLIT_DISTS),
            map_size: DEFAULT_SHADOW_MAP_SIZE,
            num_splits,
            split_near,
            split_far,
            mesh_ids: AHashMap::new(),
            last_mesh_id: 0,
        })
    }

    /// Like [`ShadowSettings::read_settings`] but logs the failure instead.
    pub fn try_read_settings(config: &ConfigStore, shadow_type: &str, strings: &mut ShaderVarStringSet) -> Option<Self> {
        match Self::read_settings(config, shadow_type, strings) {
            Ok(settings) => Some(settings),
            Err(err) => {
                tracing::error!("Shadows disabled: {}", err);
                None
            }
        }
    }

    pub fn target(&self, attachment: Attachment) -> Option<&ShadowTarget> {
        self.targets.iter().find(|target| target.attachment == attachment)
    }

    /// Single render layer drawing meshes with the shadow shader type.
    pub fn layer_config(&self) -> RenderLayerConfig {
        let mut layer = RenderLayer::new(format!("shadow {}", self.shadow_type), self.shader_type.clone());
        if let Some(shader) = &self.default_shader {
            layer = layer.with_default_shader(shader.clone());
        }
        let mut config = RenderLayerConfig::new();
        config.add_layer(layer);
        config
    }

    /// Releases last frame's maps and forgets the mesh ids handed out.
    pub fn advance_frame(&mut self, now: Ticks) {
        for target in &mut self.targets {
            target.tex_cache.advance_frame(now);
        }
        self.mesh_ids.clear();
        self.last_mesh_id = 0;
    }

    pub fn split_distances(&self) -> Vec<f32> {
        split_distances(self.split_near, self.split_far, self.num_splits)
    }

    /// Creates one context per split rendering `parent`'s sector from
    /// `light_camera` into freshly leased shadow maps.
    ///
    /// The maps live for the current frame only. Nothing is added to the
    /// tree if a split cannot be projected or a target cannot be leased.
    pub fn create_shadow_map_context(
        &mut self,
        tree: &mut RenderTree<'_>,
        parent: &RenderView,
        light_camera: Camera,
        graphics: &dyn RenderContext,
    ) -> RenderResult<ShadowMap> {
        let distances = self.split_distances();
        let (view_w, view_h) = parent.view_dimensions();
        let view_size = Vec2::new(view_w.max(1) as f32, view_h.max(1) as f32);

        let mut bounds = Vec::with_capacity(distances.len() - 1);
        for (split, range) in distances.windows(2).enumerate() {
            let slice = slice_bounds(parent.camera(), view_size, &light_camera, range[0], range[1])
                .ok_or(RenderError::DegenerateShadowSplit { split })?;
            bounds.push(slice);
        }
        // Casters between the light and a far split must not be clipped.
        let mut all_min_z = f32::INFINITY;
        let projections: Vec<Mat4> = bounds
            .iter()
            .map(|(min, max)| {
                all_min_z = all_min_z.min(min.z);
                crop_matrix(*min, *max, all_min_z) * light_camera.projection()
            })
            .collect();

        let size = self.map_size;
        let mut leased = Vec::with_capacity(projections.len());
        for _ in &projections {
            let mut textures = Vec::with_capacity(self.targets.len());
            for target in &mut self.targets {
                let texture = target.tex_cache.query_unused_texture(graphics, size, size, 0)?.texture;
                textures.push((target.attachment, target.sv_name, texture));
            }
            leased.push(textures);
        }

        let size_f = size as f32;
        let dimensions = Vec4::new(1.0 / size_f, 1.0 / size_f, size_f, size_f);
        let mut splits = Vec::with_capacity(projections.len());
        for (projection, textures) in projections.into_iter().zip(leased) {
            let camera = Camera::new(*light_camera.transform(), projection);
            let mut view = parent.with_camera(camera);
            view.set_view_dimensions(size, size);
            view.set_clipper(Clipper2D::Box(Box2::new(0.0, 0.0, size_f, size_f)));

            let context = tree.create_context(view, None);
            {
                let node = tree.context_mut(context);
                for (attachment, _, texture) in &textures {
                    node.set_target(*attachment, Some(RenderTarget::new(texture.clone())));
                }
                node.draw_flags = DrawFlags::CLEAR_SCREEN | DrawFlags::CLEAR_ZBUFFER;
                node.shader_variables
                    .set(self.sv_map_dim, ShaderVariableValue::Vec4(dimensions));
                node.shader_variables
                    .set(self.sv_projection, ShaderVariableValue::Mat4(projection));
            }
            for (_, _, texture) in &textures {
                tree.add_debug_texture(texture.clone(), 1.0);
            }

            splits.push(ShadowSplit {
                context,
                textures: textures
                    .into_iter()
                    .map(|(_, sv_name, texture)| ShadowMapTexture { sv_name, texture })
                    .collect(),
                projection,
            });
        }

        tracing::trace!("{} shadow split(s) for '{}'", splits.len(), self.shadow_type);
        Ok(ShadowMap {
            splits,
            split_distances: distances,
            dimensions,
        })
    }

    /// Fills every split context of `map` with the meshes the light sees.
    pub fn setup_shadow_map(
        &mut self,
        tree: &mut RenderTree<'_>,
        map: &ShadowMap,
        portals: &mut PortalPersistentData,
        graphics: &dyn RenderContext,
    ) {
        let mut setup = StandardContextSetup::new(self.layer_config()).with_portals(false);
        for split in &map.splits {
            let mut data = ContextSetupData::new(split.context);
            setup.setup_context(tree, split.context, &mut data, portals, graphics);
            if self.provide_ids {
                self.assign_mesh_ids(tree.context_mut(split.context));
            }
        }
    }

    /// Binds `map`'s textures, projections and split distances for the view
    /// receiving the shadows.
    pub fn bind_shadow_map(&self, map: &ShadowMap, variables: &mut ShaderVariableContext) {
        for (index, target) in self.targets.iter().enumerate() {
            let textures = map
                .splits
                .iter()
                .filter_map(|split| split.textures.get(index))
                .map(|map_texture| ShaderVariableValue::Texture(map_texture.texture.clone()))
                .collect();
            variables.set(target.sv_name, ShaderVariableValue::Array(textures));
        }
        variables.set(
            self.sv_projection,
            ShaderVariableValue::Array(
                map.splits
                    .iter()
                    .map(|split| ShaderVariableValue::Mat4(split.projection))
                    .collect(),
            ),
        );
        variables.set(
            self.sv_split_dists,
            ShaderVariableValue::Array(map.split_distances.iter().copied().map(ShaderVariableValue::Float).collect()),
        );
        variables.set(self.sv_map_dim, ShaderVariableValue::Vec4(map.dimensions));
    }

    /// Gives each mesh of `node` its id; a mesh seen in several splits keeps
    /// the same one.
    fn assign_mesh_ids(&mut self, node: &mut ContextNode) {
        let sv_mesh_id = self.sv_mesh_id;
        let ids = &mut self.mesh_ids;
        let last_id = &mut self.last_mesh_id;
        for_each_mesh_node(node, |mesh_node| {
            for mesh in &mut mesh_node.meshes {
                let key = Arc::as_ptr(&mesh.render_mesh) as usize;
                let id = *ids.entry(key).or_insert_with(|| {
                    *last_id += 1;
                    *last_id
                });
                Arc::make_mut(&mut mesh.render_mesh)
                    .variable_context
                    .set(sv_mesh_id, ShaderVariableValue::Int(id));
            }
        });
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "on" | "1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_render::ContextRender;
    use crate::mock::{MockGraphicsBackend, TestMesh, TestSector, test_camera};
    use crate::render_tree::TreePersistentData;
    use portalis_core::math::ReversibleTransform;
    use portalis_test_utils::MockRenderContext;

    const PSSM: &str = "
        RenderManager.Shadows.PSSM.Texture.Depth.Attachment = depth
        RenderManager.Shadows.PSSM.Texture.Depth.ShaderVar = light shadow map
        RenderManager.Shadows.PSSM.Texture.Depth.Format = d32
        RenderManager.Shadows.PSSM.Texture.Depth.NoMipMap = true
        RenderManager.Shadows.PSSM.Texture.Color.Attachment = color0
        RenderManager.Shadows.PSSM.Texture.Color.ShaderVar = light shadow map color
        RenderManager.Shadows.PSSM.Texture.Color.Format = argb8
        RenderManager.Shadows.PSSM.Shader.Type = shadow_pssm
        RenderManager.Shadows.PSSM.ProvideIDs = yes
    ";

    fn read(text: &str) -> Result<ShadowSettings, ShadowConfigError> {
        let config = ConfigStore::parse(text).expect("valid config");
        ShadowSettings::read_settings(&config, "PSSM", &mut ShaderVarStringSet::new())
    }

    #[test]
    fn test_read_targets() {
        let settings = read(PSSM).unwrap();
        assert_eq!(settings.targets.len(), 2);
        assert_eq!(settings.shader_type, "shadow_pssm");
        assert!(settings.provide_ids);

        let depth = settings.target(Attachment::Depth).unwrap();
        assert_eq!(depth.format, wgpu::TextureFormat::Depth32Float);
        assert!(!depth.mipmapped);
        assert!(depth.filtered);
        assert!(depth.tex_cache.options().contains(TextureCacheOptions::EXACT_SIZE_MATCH));

        let color = settings.target(Attachment::Color0).unwrap();
        assert_eq!(color.format, wgpu::TextureFormat::Rgba8Unorm);
        assert!(color.mipmapped);
    }

    #[test]
    fn test_unknown_attachment_is_rejected() {
        let err = read(
            "RenderManager.Shadows.PSSM.Texture.X.Attachment = stencil
             RenderManager.Shadows.PSSM.Texture.X.ShaderVar = x
             RenderManager.Shadows.PSSM.Texture.X.Format = d32",
        )
        .unwrap_err();
        assert_eq!(
            err,
            ShadowConfigError::UnknownAttachment {
                target: "X".into(),
                value: "stencil".into()
            }
        );
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let err = read("RenderManager.Shadows.PSSM.Texture.X.Attachment = depth").unwrap_err();
        assert_eq!(err, ShadowConfigError::MissingShaderVar { target: "X".into() });

        let err = read(
            "RenderManager.Shadows.PSSM.Texture.X.Attachment = depth
             RenderManager.Shadows.PSSM.Texture.X.ShaderVar = x
             RenderManager.Shadows.PSSM.Texture.X.Format = bogus",
        )
        .unwrap_err();
        assert!(matches!(err, ShadowConfigError::UnknownFormat { .. }));

        assert!(matches!(read(""), Err(ShadowConfigError::NoTargets { .. })));
    }

    fn parent_view() -> RenderView {
        RenderView::new(Camera::perspective(1.0, 4.0 / 3.0, 0.1, 100.0), 640, 480)
    }

    #[test]
    fn test_split_distances_blend_log_and_uniform() {
        let (n, f) = (0.5, 200.0);
        let distances = split_distances(n, f, 4);
        assert_eq!(distances.len(), 5);
        for (i, distance) in distances.iter().enumerate() {
            let frac = i as f32 / 4.0;
            let expected = (n * (f / n).powf(frac) + n + (f - n) * frac) * 0.5;
            assert!((distance - expected).abs() < 1e-4, "split {}: {} != {}", i, distance, expected);
        }
        assert!((distances[0] - n).abs() < 1e-6);
        assert!((distances[4] - f).abs() < 1e-3);
        assert!(distances.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_split_settings_from_config() {
        let settings = read(&format!(
            "{}
             RenderManager.Shadows.PSSM.NumSplits = 40
             RenderManager.Shadows.PSSM.SplitFar = 50",
            PSSM
        ))
        .unwrap();
        assert_eq!(settings.num_splits, MAX_SPLITS);
        assert_eq!(settings.split_far, 50.0);
        assert_eq!(settings.split_distances().len(), MAX_SPLITS as usize + 1);

        let defaults = read(PSSM).unwrap();
        assert_eq!(defaults.num_splits, DEFAULT_NUM_SPLITS);
    }

    #[test]
    fn test_split_projection_fits_the_slice() {
        let mut settings = read(PSSM).unwrap();
        let graphics = MockRenderContext::new();
        let mut persistent = TreePersistentData::new();
        let mut tree = RenderTree::new(&mut persistent);
        let parent = parent_view();
        let light = Camera::new(
            ReversibleTransform::look_at(Vec3::new(0.0, 150.0, 50.0), Vec3::new(0.0, 0.0, 50.0), Vec3::Z),
            Mat4::orthographic_lh(-200.0, 200.0, -200.0, 200.0, 1.0, 400.0),
        );

        let map = settings
            .create_shadow_map_context(&mut tree, &parent, light.clone(), &graphics)
            .unwrap();
        assert_eq!(map.splits.len(), 3);

        for (i, split) in map.splits.iter().enumerate() {
            let mut min = Vec3::splat(f32::INFINITY);
            let mut max = Vec3::splat(f32::NEG_INFINITY);
            for depth in [map.split_distances[i], map.split_distances[i + 1]] {
                for corner in [Vec2::ZERO, Vec2::new(640.0, 0.0), Vec2::new(0.0, 480.0), Vec2::new(640.0, 480.0)] {
                    let camera_space = parent.camera().inv_project(corner, depth, 640.0, 480.0).unwrap();
                    let world = parent.camera().transform().this_to_other(camera_space);
                    let mapped = split.projection.project_point3(light.transform().other_to_this(world));
                    min = min.min(mapped);
                    max = max.max(mapped);
                }
            }
            assert!(min.abs_diff_eq(Vec3::new(-1.0, -1.0, min.z), 1e-3), "split {} min {:?}", i, min);
            assert!(max.abs_diff_eq(Vec3::new(1.0, 1.0, max.z), 1e-3), "split {} max {:?}", i, max);
            assert!(min.z >= -1e-4 && max.z <= 1.0 + 1e-4);

            let camera = tree.context(split.context).render_view.camera();
            assert_eq!(camera.projection(), split.projection);
        }
    }

    #[test]
    fn test_shadow_map_context_targets_and_lifetime() {
        let mut settings = read(PSSM).unwrap();
        let graphics = MockRenderContext::new();
        let mut persistent = TreePersistentData::new();
        let mut tree = RenderTree::new(&mut persistent);
        let parent = parent_view();

        let map = settings
            .create_shadow_map_context(&mut tree, &parent, parent.camera().clone(), &graphics)
            .unwrap();
        assert_eq!(map.splits.len(), 3);
        assert_eq!(map.split_distances.len(), 4);
        assert_eq!(map.dimensions, Vec4::new(1.0 / 1024.0, 1.0 / 1024.0, 1024.0, 1024.0));

        for split in &map.splits {
            assert_eq!(split.textures.len(), 2);
            let node = tree.context(split.context);
            assert!(node.target(Attachment::Depth).is_some());
            assert!(node.target(Attachment::Color0).is_some());
            assert!(node.draw_flags.contains(DrawFlags::CLEAR_SCREEN | DrawFlags::CLEAR_ZBUFFER));
            assert_eq!(node.render_view.view_dimensions(), (1024, 1024));
            assert_eq!(node.shader_variables.len(), 2);
        }
        let first = &map.splits[0].textures[0].texture;
        assert!(!first.ptr_eq(&map.splits[1].textures[0].texture));
        assert_eq!(tree.context_count(), 3);
        assert_eq!(tree.debug_textures().len(), 6);
        drop(tree);

        let depth = &settings.target(Attachment::Depth).unwrap().tex_cache;
        assert_eq!(depth.in_use_count(), 3);

        // Leased for the current frame only.
        settings.advance_frame(1);
        let depth = &settings.target(Attachment::Depth).unwrap().tex_cache;
        assert_eq!(depth.in_use_count(), 0);
        assert_eq!(depth.available_count(), 3);
    }

    #[test]
    fn test_failed_lease_adds_no_context() {
        let mut settings = read(PSSM).unwrap();
        let graphics = MockRenderContext::new();
        graphics.fail_next_texture_creates(2);
        let mut persistent = TreePersistentData::new();
        let mut tree = RenderTree::new(&mut persistent);
        let parent = parent_view();

        let result = settings.create_shadow_map_context(&mut tree, &parent, parent.camera().clone(), &graphics);
        assert!(result.is_err());
        assert_eq!(tree.context_count(), 0);
    }

    #[test]
    fn test_light_behind_slice_is_rejected() {
        let mut settings = read(PSSM).unwrap();
        let graphics = MockRenderContext::new();
        let mut persistent = TreePersistentData::new();
        let mut tree = RenderTree::new(&mut persistent);
        let parent = parent_view();
        // A perspective light facing away from the view frustum.
        let light = parent
            .camera()
            .clone()
            .with_transform(ReversibleTransform::look_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y));

        let result = settings.create_shadow_map_context(&mut tree, &parent, light, &graphics);
        assert_eq!(result.unwrap_err(), RenderError::DegenerateShadowSplit { split: 0 });
        assert_eq!(tree.context_count(), 0);
        assert_eq!(graphics.count_texture_creates(), 0);
    }

    #[test]
    fn test_bind_shadow_map_sets_split_arrays() {
        let mut strings = ShaderVarStringSet::new();
        let config = ConfigStore::parse(PSSM).unwrap();
        let mut settings = ShadowSettings::read_settings(&config, "PSSM", &mut strings).unwrap();
        let graphics = MockRenderContext::new();
        let mut persistent = TreePersistentData::new();
        let mut tree = RenderTree::new(&mut persistent);
        let parent = parent_view();
        let map = settings
            .create_shadow_map_context(&mut tree, &parent, parent.camera().clone(), &graphics)
            .unwrap();

        let mut variables = ShaderVariableContext::new();
        settings.bind_shadow_map(&map, &mut variables);

        let depth_sv = strings.request("light shadow map");
        let depth_maps = variables.get(depth_sv).and_then(ShaderVariableValue::as_array).unwrap();
        assert_eq!(depth_maps.len(), 3);
        assert!(depth_maps[2].as_texture().unwrap().ptr_eq(&map.splits[2].textures[0].texture));

        let dists = variables
            .get(settings.sv_split_dists)
            .and_then(ShaderVariableValue::as_array)
            .unwrap();
        assert_eq!(dists.len(), 4);
        let projections = variables
            .get(settings.sv_projection)
            .and_then(ShaderVariableValue::as_array)
            .unwrap();
        assert_eq!(projections.len(), 3);
        assert_eq!(variables.get(settings.sv_map_dim).and_then(ShaderVariableValue::as_vec4), Some(map.dimensions));
    }

    fn draw_shadow_maps(provide_ids: bool) -> (MockGraphicsBackend, ShaderVarName) {
        let config = ConfigStore::parse(&format!(
            "{}
             RenderManager.Shadows.PSSM.Shader.Default = depth_only
             RenderManager.Shadows.PSSM.NumSplits = 2
             RenderManager.Shadows.PSSM.ProvideIDs = {}",
            PSSM, provide_ids
        ))
        .unwrap();
        let mut strings = ShaderVarStringSet::new();
        let mut settings = ShadowSettings::read_settings(&config, "PSSM", &mut strings).unwrap();
        let mut persistent = TreePersistentData::new();
        let mut portals = PortalPersistentData::new(&mut strings, &mut persistent.debug);
        let mut backend = MockGraphicsBackend::new(256, 256);

        let room = TestSector::new(1, "room");
        room.add_mesh(TestMesh::simple("table", "lit", Vec3::new(0.0, 0.0, 5.0)));
        room.add_mesh(TestMesh::simple("lamp", "lit", Vec3::new(1.0, 0.0, 6.0)));
        let room: Arc<dyn crate::scene::Sector> = room;
        let mut parent = RenderView::new(test_camera(), 256, 256);
        parent.set_this_sector(Some(room));

        let mut tree = RenderTree::new(&mut persistent);
        let map = settings
            .create_shadow_map_context(&mut tree, &parent, test_camera(), backend.mock_resources())
            .unwrap();
        settings.setup_shadow_map(&mut tree, &map, &mut portals, backend.mock_resources());
        ContextRender::new(&mut backend, 1).render(&tree);
        (backend, settings.sv_mesh_id)
    }

    #[test]
    fn test_mesh_ids_distinct_and_shared_across_splits() {
        let (backend, sv_mesh_id) = draw_shadow_maps(true);
        let drawn: Vec<(&str, i32)> = backend
            .drawn_meshes()
            .into_iter()
            .zip(backend.drawn_mesh_variables())
            .map(|(name, variables)| (name, variables.get(sv_mesh_id).and_then(ShaderVariableValue::as_int).unwrap()))
            .collect();
        assert_eq!(drawn.len(), 4);

        let ids_of = |mesh: &str| -> Vec<i32> { drawn.iter().filter(|(name, _)| *name == mesh).map(|(_, id)| *id).collect() };
        let (table, lamp) = (ids_of("table"), ids_of("lamp"));
        assert_eq!(table.len(), 2);
        assert_eq!(table[0], table[1]);
        assert_eq!(lamp[0], lamp[1]);
        assert_ne!(table[0], lamp[0]);
        assert!(table[0] > 0 && lamp[0] > 0);
    }

    #[test]
    fn test_mesh_ids_only_when_requested() {
        let (backend, sv_mesh_id) = draw_shadow_maps(false);
        assert_eq!(backend.drawn_meshes().len(), 4);
        assert!(backend.drawn_mesh_variables().iter().all(|variables| variables.get(sv_mesh_id).is_none()));
    }

    #[test]
    fn test_layer_config_uses_shadow_shader_type() {
        let settings = read(PSSM).unwrap();
        let layers = settings.layer_config();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers.layer(0).unwrap().shader_type, "shadow_pssm");
    }
}
