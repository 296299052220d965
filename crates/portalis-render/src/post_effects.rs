//! Full-screen post-processing chains.
//!
//! Layer 0 is the scene itself: the view renders into [`PostEffectManager::screen_target`]
//! and every further layer draws a screen quad with its shader into the next
//! intermediate texture, the last one into the output target. Intermediates
//! are grouped into buckets of layers with equal [`LayerOptions`]; within a
//! bucket a texture is reused as soon as no later layer reads it any more.

use std::cmp::Ordering;
use std::sync::Arc;

use portalis_core::config::ConfigStore;
use portalis_core::math::{Mat4, ReversibleTransform, Vec2, Vec3};
use portalis_core::profiling::profile_function;
use portalis_test_utils::{GpuBuffer, GpuTexture, RenderContext};

use crate::Ticks;
use crate::context_render::{DrawScope, GraphicsBackend};
use crate::error::{RenderError, RenderResult};
use crate::render_mesh::{
    BufferHolder, MeshType, MixMode, RenderMesh, ShaderHandle, ShaderVarName, ShaderVarStringSet, ShaderVariableContext,
    ShaderVariableValue, ZBufMode,
};
use crate::render_tree::{Attachment, DrawFlags, RenderTarget};
use crate::resource_cache::{CacheConstraint, GenericResourceCache, ReuseConditionFlagged, ReuseFlag};
use crate::texture_cache::mip_level_count;

/// Shader variable a layer's input is bound under by default.
pub const SV_INPUT_TEXTURE: &str = "tex diffuse";
pub const SV_PIXEL_SIZE: &str = "pixel size";

/// Allocation options of a layer's output texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerOptions {
    /// Output is `dimension >> downsample` pixels wide and high.
    pub downsample: u32,
    pub mipmap: bool,
    /// Highest mip level to generate when `mipmap` is set.
    pub max_mipmap: Option<u32>,
    /// Always give this layer a texture of its own.
    pub no_texture_reuse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(usize);

impl LayerId {
    /// The scene input layer.
    pub const INPUT: LayerId = LayerId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// Binds the output of `layer` under `texture_sv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerInput {
    pub layer: LayerId,
    pub texture_sv: ShaderVarName,
}

#[derive(Debug)]
struct Layer {
    shader: Option<ShaderHandle>,
    inputs: Vec<LayerInput>,
    options: LayerOptions,
    out_texture_num: usize,
    variables: ShaderVariableContext,
}

impl Layer {
    fn reads(&self, layer: usize) -> bool {
        self.inputs.iter().any(|input| input.layer.0 == layer)
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    options: LayerOptions,
    texture_num: usize,
}

#[derive(Debug)]
struct BucketTextures {
    textures: Vec<GpuTexture>,
    pixel_size: Vec2,
    positions: GpuBuffer,
    texcoords: GpuBuffer,
}

/// Per-layer resources bound when drawing the layer.
#[derive(Debug)]
struct LayerBinding {
    buffers: Arc<BufferHolder>,
    variables: ShaderVariableContext,
}

/// Intermediate textures and quads for one view size.
#[derive(Debug)]
pub struct DimensionData {
    width: u32,
    height: u32,
    buckets: Vec<BucketTextures>,
    layers: Vec<LayerBinding>,
}

impl DimensionData {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn texture_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.textures.len()).sum()
    }
}

/// Matches dimension data on its exact size.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortingByDimensions;

impl CacheConstraint<Arc<DimensionData>> for SortingByDimensions {
    type Key = (u32, u32);

    fn is_equal(data: &Arc<DimensionData>, key: &(u32, u32)) -> bool {
        data.dimensions() == *key
    }

    fn is_larger_equal(data: &Arc<DimensionData>, key: &(u32, u32)) -> bool {
        data.width >= key.0 && data.height >= key.1
    }

    fn order(a: &Arc<DimensionData>, b: &Arc<DimensionData>) -> Ordering {
        a.dimensions().cmp(&b.dimensions())
    }
}

type DimensionCache = GenericResourceCache<Arc<DimensionData>, SortingByDimensions, ReuseConditionFlagged>;

struct CurrentDimensions {
    data: Arc<DimensionData>,
    release: ReuseFlag,
}

pub struct PostEffectManager {
    layers: Vec<Layer>,
    buckets: Vec<Bucket>,
    texture_format: wgpu::TextureFormat,
    keep_all_intermediates: bool,
    layers_dirty: bool,
    dim_cache: DimensionCache,
    current: Option<CurrentDimensions>,
    current_width: u32,
    current_height: u32,
    output: Option<RenderTarget>,
    index_buffer: Option<GpuBuffer>,
    frame: Ticks,
    sv_input: ShaderVarName,
    sv_pixel_size: ShaderVarName,
    shared_variables: ShaderVariableContext,
}

impl PostEffectManager {
    pub fn new(strings: &mut ShaderVarStringSet) -> Self {
        let mut dim_cache = DimensionCache::new();
        dim_cache.purge_age = 0;

        let mut manager = Self {
            layers: Vec::new(),
            buckets: Vec::new(),
            texture_format: wgpu::TextureFormat::Rgba8Unorm,
            keep_all_intermediates: false,
            layers_dirty: true,
            dim_cache,
            current: None,
            current_width: 0,
            current_height: 0,
            output: None,
            index_buffer: None,
            frame: 0,
            sv_input: strings.request(SV_INPUT_TEXTURE),
            sv_pixel_size: strings.request(SV_PIXEL_SIZE),
            shared_variables: ShaderVariableContext::new(),
        };
        manager.push_layer(None, LayerOptions::default(), Vec::new());
        manager
    }

    /// Reads `PostEffectManager.KeepAllIntermediates`.
    pub fn from_config(config: &ConfigStore, strings: &mut ShaderVarStringSet) -> Self {
        let mut manager = Self::new(strings);
        manager.keep_all_intermediates = config.get_bool("PostEffectManager.KeepAllIntermediates", false);
        manager
    }

    pub fn set_intermediate_target_format(&mut self, format: wgpu::TextureFormat) {
        if self.texture_format != format {
            self.texture_format = format;
            self.layers_dirty = true;
        }
    }

    pub fn intermediate_target_format(&self) -> wgpu::TextureFormat {
        self.texture_format
    }

    pub fn set_keep_all_intermediates(&mut self, keep: bool) {
        if self.keep_all_intermediates != keep {
            self.keep_all_intermediates = keep;
            self.layers_dirty = true;
        }
    }

    /// Where the last layer draws to; `None` is the screen.
    pub fn set_output_target(&mut self, target: Option<GpuTexture>) {
        self.output = target.map(RenderTarget::new);
    }

    pub fn output_target(&self) -> Option<&RenderTarget> {
        self.output.as_ref()
    }

    /// Adds a layer reading the previously added one.
    pub fn add_layer(&mut self, shader: ShaderHandle, options: LayerOptions) -> LayerId {
        debug_assert!(!self.layers.is_empty(), "the scene input layer is missing");
        let input = LayerInput {
            layer: LayerId(self.layers.len().saturating_sub(1)),
            texture_sv: self.sv_input,
        };
        self.push_layer(Some(shader), options, vec![input])
    }

    pub fn add_layer_with_inputs(&mut self, shader: ShaderHandle, options: LayerOptions, inputs: Vec<LayerInput>) -> LayerId {
        self.push_layer(Some(shader), options, inputs)
    }

    fn push_layer(&mut self, shader: Option<ShaderHandle>, options: LayerOptions, inputs: Vec<LayerInput>) -> LayerId {
        let id = LayerId(self.layers.len());
        self.layers.push(Layer {
            shader,
            inputs,
            options,
            out_texture_num: 0,
            variables: ShaderVariableContext::new(),
        });
        self.layers_dirty = true;
        id
    }

    /// Removes every effect layer, keeping only the scene input.
    pub fn clear_layers(&mut self) {
        self.layers.clear();
        self.current_width = 0;
        self.current_height = 0;
        self.push_layer(None, LayerOptions::default(), Vec::new());
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Variables passed to every draw of `layer`.
    pub fn layer_variables_mut(&mut self, layer: LayerId) -> Option<&mut ShaderVariableContext> {
        self.layers.get_mut(layer.0).map(|layer| &mut layer.variables)
    }

    /// Variables passed to every layer; a layer's own variables win.
    pub fn shared_variables_mut(&mut self) -> &mut ShaderVariableContext {
        &mut self.shared_variables
    }

    /// Intermediate texture slot `layer` writes to.
    pub fn layer_texture_num(&mut self, layer: LayerId) -> Option<usize> {
        self.update_layers();
        self.layers.get(layer.0).map(|layer| layer.out_texture_num)
    }

    /// Intermediate textures bucket `options` needs.
    pub fn bucket_texture_count(&mut self, options: &LayerOptions) -> usize {
        self.update_layers();
        self.buckets
            .iter()
            .find(|bucket| bucket.options == *options)
            .map_or(0, |bucket| bucket.texture_num)
    }

    /// Prepares intermediates for a `width`×`height` view.
    ///
    /// Returns whether the textures changed, i.e. the screen target must be
    /// rebound.
    pub fn setup_view(&mut self, resources: &dyn RenderContext, width: u32, height: u32) -> RenderResult<bool> {
        profile_function!();
        let unchanged = !self.layers_dirty
            && self.current.is_some()
            && width == self.current_width
            && height == self.current_height;
        if unchanged {
            return Ok(false);
        }

        if let Some(current) = self.current.take() {
            current.release.mark_reusable();
        }
        self.update_layers();
        self.current_width = width;
        self.current_height = height;

        if let Some(entry) = self.dim_cache.query(&(width, height), true) {
            self.current = Some(CurrentDimensions {
                data: entry.data.clone(),
                release: entry.aux.clone(),
            });
            return Ok(true);
        }

        let data = match self.create_dimension_data(resources, width, height) {
            Ok(data) => Arc::new(data),
            Err(err) => {
                self.current_width = 0;
                self.current_height = 0;
                return Err(err);
            }
        };
        tracing::debug!(
            "Post effects allocated {} intermediate(s) for {}x{}",
            data.texture_count(),
            width,
            height
        );
        let entry = self.dim_cache.add_active(data, ());
        self.current = Some(CurrentDimensions {
            data: entry.data.clone(),
            release: entry.aux.clone(),
        });
        // Intermediates are large; drop other sizes at the next advance.
        self.dim_cache.aged_purge_interval = 0;
        Ok(true)
    }

    /// Texture the scene should be rendered into, if any effect is active.
    pub fn screen_target(&self) -> Option<GpuTexture> {
        if self.layers.len() > 1 {
            self.layer_output(LayerId::INPUT)
        } else {
            None
        }
    }

    /// Intermediate texture `layer` draws into.
    pub fn layer_output(&self, layer: LayerId) -> Option<GpuTexture> {
        let current = self.current.as_ref()?;
        let layer = self.layers.get(layer.0)?;
        let bucket = self.bucket_position(&layer.options)?;
        current.data.buckets.get(bucket)?.textures.get(layer.out_texture_num).cloned()
    }

    /// Whether screen-space coordinates come out flipped in y.
    pub fn screen_space_y_flipped(&self) -> bool {
        self.layers.len() > 1
    }

    /// Draws every effect layer, ping-ponging between intermediates.
    pub fn draw_post_effects<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> RenderResult<usize> {
        profile_function!();
        let Some(current) = self.current.as_ref().map(|current| current.data.clone()) else {
            return Err(RenderError::InvalidRenderTarget {
                attachment: Attachment::Color0,
                reason: "post effects have no view set up".into(),
            });
        };
        if self.layers_dirty {
            return Err(RenderError::InvalidRenderTarget {
                attachment: Attachment::Color0,
                reason: "post effect layers changed since the view was set up".into(),
            });
        }

        let mut draws = 0;
        let last = self.layers.len().saturating_sub(1);
        let mut result = Ok(());
        for (index, layer) in self.layers.iter().enumerate().skip(1) {
            let Some(shader) = &layer.shader else {
                continue;
            };
            let bucket = self.bucket_position(&layer.options).and_then(|b| current.buckets.get(b));
            let target = if index < last {
                match bucket.and_then(|bucket| bucket.textures.get(layer.out_texture_num)) {
                    Some(texture) => Some(RenderTarget::new(texture.clone())),
                    None => {
                        result = Err(RenderError::InvalidRenderTarget {
                            attachment: Attachment::Color0,
                            reason: format!("post effect layer {} has no intermediate", index),
                        });
                        break;
                    }
                }
            } else {
                self.output.clone()
            };

            backend.set_render_target(Attachment::Depth, None);
            backend.set_render_target(Attachment::Color0, target.as_ref());
            if let Err(err) = backend.validate_render_targets() {
                result = Err(err);
                break;
            }

            let binding = &current.layers[index];
            let mut quad = RenderMesh {
                name: format!("[post effect {}]", index),
                mesh_type: MeshType::TriangleFan,
                buffers: Some(binding.buffers.clone()),
                z_buf_mode: ZBufMode::None,
                index_start: 0,
                index_end: 4,
                mix_mode: MixMode::REPLACE,
                variable_context: self.shared_variables.clone(),
                ..Default::default()
            };
            for (name, value) in layer.variables.iter().chain(binding.variables.iter()) {
                quad.variable_context.set(name, value.clone());
            }

            let quad_size = bucket.map_or(Vec2::ONE, |bucket| bucket.pixel_size.recip());
            match DrawScope::begin(&mut *backend, DrawFlags::CLEAR_ZBUFFER | DrawFlags::GRAPHICS_3D) {
                Some(mut scope) => {
                    let backend = scope.backend();
                    backend.set_projection(screen_quad_projection(quad_size), quad_size.x / quad_size.y.max(1.0));
                    backend.set_world_to_camera(&ReversibleTransform::IDENTITY);
                    backend.draw_mesh(&quad, shader, 0);
                    draws += 1;
                }
                None => {
                    result = Err(RenderError::InvalidRenderTarget {
                        attachment: Attachment::Color0,
                        reason: format!("drawing post effect layer {} could not begin", index),
                    });
                    break;
                }
            }
        }
        backend.unset_render_targets();

        self.frame += 1;
        self.dim_cache.advance_time(self.frame);
        self.dim_cache.aged_purge_interval = 60;
        result.map(|()| draws)
    }

    fn bucket_position(&self, options: &LayerOptions) -> Option<usize> {
        self.buckets.iter().position(|bucket| bucket.options == *options)
    }

    fn bucket_index(&mut self, options: &LayerOptions) -> usize {
        match self.bucket_position(options) {
            Some(index) => index,
            None => {
                self.buckets.push(Bucket {
                    options: *options,
                    texture_num: 0,
                });
                self.buckets.len() - 1
            }
        }
    }

    fn update_layers(&mut self) {
        if !self.layers_dirty {
            return;
        }
        self.current = None;
        self.dim_cache.clear(true);
        self.update_texture_distribution();
        self.layers_dirty = false;
    }

    /// Assigns every layer an intermediate texture slot in its bucket.
    ///
    /// A slot is free for layer `l` once every layer reading the slot's
    /// previous owner lies before `l`.
    fn update_texture_distribution(&mut self) {
        self.buckets.clear();
        let layer_count = self.layers.len();
        let bucket_of: Vec<usize> = (0..layer_count)
            .map(|l| {
                let options = self.layers[l].options;
                self.bucket_index(&options)
            })
            .collect();

        // used[bucket][layer][slot]
        let mut used = vec![vec![Vec::<bool>::new(); layer_count]; self.buckets.len()];

        for l in 0..layer_count.saturating_sub(1) {
            let bucket = bucket_of[l];
            let bits = &mut used[bucket];

            let reuse = !(self.keep_all_intermediates || self.buckets[bucket].options.no_texture_reuse);
            let free = if reuse { bits[l].iter().position(|used| !used) } else { None };
            let slot = match free {
                Some(slot) => slot,
                None => {
                    let slot = bits[l].len();
                    for layer_bits in &mut bits[l..] {
                        layer_bits.resize(slot + 1, false);
                    }
                    slot
                }
            };
            self.layers[l].out_texture_num = slot;

            let last_reader = (l..layer_count).rev().find(|&l2| self.layers[l2].reads(l)).unwrap_or(l);
            for layer_bits in &mut bits[l..=last_reader] {
                if layer_bits.len() <= slot {
                    layer_bits.resize(slot + 1, false);
                }
                layer_bits[slot] = true;
            }
        }

        for (bucket, bits) in self.buckets.iter_mut().zip(&used) {
            bucket.texture_num = bits.last().map_or(0, Vec::len);
        }
    }

    fn create_dimension_data(&mut self, resources: &dyn RenderContext, width: u32, height: u32) -> RenderResult<DimensionData> {
        let indices = match &self.index_buffer {
            Some(buffer) => buffer.clone(),
            None => {
                let buffer = create_buffer(resources, "post effect indices", wgpu::BufferUsages::INDEX, &[0u32, 1, 2, 3])?;
                self.index_buffer = Some(buffer.clone());
                buffer
            }
        };

        let mut buckets = Vec::with_capacity(self.buckets.len());
        for bucket in &self.buckets {
            let tex_w = (width >> bucket.options.downsample).max(1);
            let tex_h = (height >> bucket.options.downsample).max(1);

            let mut textures = Vec::with_capacity(bucket.texture_num);
            for _ in 0..bucket.texture_num {
                textures.push(self.create_texture(resources, &bucket.options, tex_w, tex_h)?);
            }

            let (w, h) = (tex_w as f32, tex_h as f32);
            let positions = [Vec3::new(0.0, 0.0, 0.0), Vec3::new(w, 0.0, 0.0), Vec3::new(w, h, 0.0), Vec3::new(0.0, h, 0.0)];
            let texcoords = [Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0), Vec2::new(1.0, 1.0), Vec2::new(0.0, 1.0)];

            buckets.push(BucketTextures {
                textures,
                pixel_size: Vec2::new(1.0 / w, 1.0 / h),
                positions: create_buffer(resources, "post effect quad", wgpu::BufferUsages::VERTEX, &positions)?,
                texcoords: create_buffer(resources, "post effect texcoords", wgpu::BufferUsages::VERTEX, &texcoords)?,
            });
        }

        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let Some(this_bucket) = self.bucket_position(&layer.options) else {
                continue;
            };
            let mut variables = ShaderVariableContext::new();
            let mut texcoords = buckets[this_bucket].texcoords.clone();
            for (n, input) in layer.inputs.iter().enumerate() {
                let Some(source) = self.layers.get(input.layer.0) else {
                    continue;
                };
                let Some(in_bucket) = self.bucket_position(&source.options) else {
                    continue;
                };
                if let Some(texture) = buckets[in_bucket].textures.get(source.out_texture_num) {
                    variables.set(input.texture_sv, ShaderVariableValue::Texture(texture.clone()));
                }
                if n == 0 {
                    texcoords = buckets[in_bucket].texcoords.clone();
                }
            }
            variables.set(self.sv_pixel_size, ShaderVariableValue::Vec2(buckets[this_bucket].pixel_size));

            layers.push(LayerBinding {
                buffers: Arc::new(BufferHolder {
                    index: indices.clone(),
                    position: buckets[this_bucket].positions.clone(),
                    texcoord0: texcoords,
                }),
                variables,
            });
        }

        Ok(DimensionData {
            width,
            height,
            buckets,
            layers,
        })
    }

    fn create_texture(
        &self,
        resources: &dyn RenderContext,
        options: &LayerOptions,
        width: u32,
        height: u32,
    ) -> RenderResult<GpuTexture> {
        let mip_level_count = if options.mipmap {
            let full = mip_level_count(width, height);
            options.max_mipmap.map_or(full, |max| full.min(max + 1))
        } else {
            1
        };

        resources
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("post effect intermediate"),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: self.texture_format,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .ok_or_else(|| RenderError::TextureAllocation {
                width,
                height,
                class: "post effect".to_owned(),
            })
    }
}

/// Maps pixel positions on a `size` target, origin lower left, to clip space.
pub fn screen_quad_projection(size: Vec2) -> Mat4 {
    Mat4::orthographic_lh(0.0, size.x.max(1.0), 0.0, size.y.max(1.0), 0.0, 1.0)
}

pub(crate) fn create_buffer<T: bytemuck::Pod>(
    resources: &dyn RenderContext,
    label: &'static str,
    usage: wgpu::BufferUsages,
    contents: &[T],
) -> RenderResult<GpuBuffer> {
    let bytes: &[u8] = bytemuck::cast_slice(contents);
    let size = bytes.len() as u64;
    let buffer = resources
        .create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
        .ok_or(RenderError::BufferAllocation { label, size })?;
    resources.write_buffer(&buffer, 0, bytes);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DrawCall, MockGraphicsBackend};

    fn chain(strings: &mut ShaderVarStringSet, length: usize) -> PostEffectManager {
        let mut manager = PostEffectManager::new(strings);
        for n in 0..length {
            manager.add_layer(ShaderHandle::new(&format!("effect {}", n)), LayerOptions::default());
        }
        manager
    }

    #[test]
    fn test_linear_chain_ping_pongs() {
        let mut strings = ShaderVarStringSet::new();
        let mut manager = chain(&mut strings, 3);

        let slots: Vec<_> = (0..3).map(|l| manager.layer_texture_num(LayerId(l)).unwrap()).collect();
        assert_eq!(slots, vec![0, 1, 0]);
        assert_eq!(manager.bucket_texture_count(&LayerOptions::default()), 2);
    }

    #[test]
    fn test_long_lived_input_keeps_its_texture() {
        let mut strings = ShaderVarStringSet::new();
        let mut manager = PostEffectManager::new(&mut strings);
        let diffuse = strings.request(SV_INPUT_TEXTURE);
        let scene = strings.request("tex scene");

        let h = manager.add_layer(ShaderHandle::new("blur h"), LayerOptions::default());
        let v = manager.add_layer(ShaderHandle::new("blur v"), LayerOptions::default());
        manager.add_layer_with_inputs(
            ShaderHandle::new("combine"),
            LayerOptions::default(),
            vec![
                LayerInput { layer: LayerId::INPUT, texture_sv: scene },
                LayerInput { layer: v, texture_sv: diffuse },
            ],
        );

        assert_eq!(manager.layer_texture_num(LayerId::INPUT), Some(0));
        assert_eq!(manager.layer_texture_num(h), Some(1));
        assert_eq!(manager.layer_texture_num(v), Some(2));
        assert_eq!(manager.bucket_texture_count(&LayerOptions::default()), 3);
    }

    #[test]
    fn test_keep_all_intermediates() {
        let config = ConfigStore::parse("PostEffectManager.KeepAllIntermediates = true").unwrap();
        let mut strings = ShaderVarStringSet::new();
        let mut manager = PostEffectManager::from_config(&config, &mut strings);
        for n in 0..3 {
            manager.add_layer(ShaderHandle::new(&format!("effect {}", n)), LayerOptions::default());
        }

        let slots: Vec<_> = (0..3).map(|l| manager.layer_texture_num(LayerId(l)).unwrap()).collect();
        assert_eq!(slots, vec![0, 1, 2]);
    }

    #[test]
    fn test_downsampled_layer_gets_own_bucket() {
        let mut strings = ShaderVarStringSet::new();
        let mut manager = PostEffectManager::new(&mut strings);
        let half = LayerOptions {
            downsample: 1,
            ..Default::default()
        };
        let small = manager.add_layer(ShaderHandle::new("down"), half);
        manager.add_layer(ShaderHandle::new("up"), LayerOptions::default());

        let resources = portalis_test_utils::MockRenderContext::new();
        assert!(manager.setup_view(&resources, 640, 480).unwrap());
        let texture = manager.layer_output(small).unwrap();
        assert_eq!((texture.width(), texture.height()), (320, 240));
        assert_eq!(manager.screen_target().unwrap().width(), 640);
    }

    #[test]
    fn test_setup_view_reuses_dimension_data() {
        let mut strings = ShaderVarStringSet::new();
        let mut manager = chain(&mut strings, 2);
        let mut backend = MockGraphicsBackend::new(640, 480);

        assert!(manager.setup_view(backend.resources(), 640, 480).unwrap());
        assert!(!manager.setup_view(backend.resources(), 640, 480).unwrap());
        let first = manager.screen_target().unwrap();
        let creates = backend.mock_resources().count_texture_creates();
        assert_eq!(creates, 2);

        // Switching back and forth within one frame finds the old size again.
        assert!(manager.setup_view(backend.resources(), 800, 600).unwrap());
        manager.draw_post_effects(&mut backend).unwrap();
        assert!(manager.setup_view(backend.resources(), 640, 480).unwrap());
        assert!(manager.screen_target().unwrap().ptr_eq(&first));
        assert_eq!(backend.mock_resources().count_texture_creates(), 4);
    }

    #[test]
    fn test_draw_post_effects_targets() {
        let mut strings = ShaderVarStringSet::new();
        let mut manager = chain(&mut strings, 2);
        let mut backend = MockGraphicsBackend::new(640, 480);
        manager.setup_view(backend.resources(), 640, 480).unwrap();
        let scene = manager.screen_target().unwrap();
        let intermediate = manager.layer_output(LayerId(1)).unwrap();

        assert_eq!(manager.draw_post_effects(&mut backend).unwrap(), 2);
        assert_eq!(backend.drawn_meshes(), vec!["[post effect 1]", "[post effect 2]"]);

        let color_targets: Vec<_> = backend
            .trace()
            .iter()
            .filter_map(|call| match call {
                DrawCall::SetRenderTarget {
                    attachment: Attachment::Color0,
                    texture,
                } => Some(*texture),
                _ => None,
            })
            .collect();
        assert_eq!(color_targets, vec![intermediate.mock_id(), None]);
        assert!(!intermediate.ptr_eq(&scene));
        assert!(!backend.is_drawing());
    }

    #[test]
    fn test_single_layer_has_no_screen_target() {
        let mut strings = ShaderVarStringSet::new();
        let mut manager = PostEffectManager::new(&mut strings);
        let resources = portalis_test_utils::MockRenderContext::new();
        manager.setup_view(&resources, 640, 480).unwrap();
        assert!(manager.screen_target().is_none());
        assert!(!manager.screen_space_y_flipped());
    }

    #[test]
    fn test_add_layer_after_clear_reads_scene() {
        let mut strings = ShaderVarStringSet::new();
        let mut manager = chain(&mut strings, 3);
        manager.clear_layers();
        assert_eq!(manager.layer_count(), 1);

        let layer = manager.add_layer(ShaderHandle::new("tonemap"), LayerOptions::default());
        assert_eq!(layer.index(), 1);
        assert_eq!(manager.layers[1].inputs[0].layer, LayerId::INPUT);

        let resources = portalis_test_utils::MockRenderContext::new();
        manager.setup_view(&resources, 64, 64).unwrap();
        assert!(manager.screen_target().is_some());
    }

    #[test]
    fn test_shared_variables_reach_every_layer() {
        let mut strings = ShaderVarStringSet::new();
        let mut manager = chain(&mut strings, 2);
        let exposure = strings.request("hdr exposure");
        manager.shared_variables_mut().set(exposure, ShaderVariableValue::Float(0.5));
        manager
            .layer_variables_mut(LayerId(2))
            .unwrap()
            .set(exposure, ShaderVariableValue::Float(2.0));

        let mut backend = MockGraphicsBackend::new(64, 64);
        manager.setup_view(backend.resources(), 64, 64).unwrap();
        manager.draw_post_effects(&mut backend).unwrap();

        let values: Vec<_> = backend
            .drawn_mesh_variables()
            .iter()
            .map(|variables| match variables.get(exposure) {
                Some(ShaderVariableValue::Float(value)) => *value,
                _ => f32::NAN,
            })
            .collect();
        assert_eq!(values, vec![0.5, 2.0]);
    }

    #[test]
    fn test_screen_quad_projection_covers_target() {
        let projection = screen_quad_projection(Vec2::new(640.0, 480.0));
        let lower_left = projection.project_point3(Vec3::ZERO);
        let upper_right = projection.project_point3(Vec3::new(640.0, 480.0, 0.0));
        assert!(lower_left.abs_diff_eq(Vec3::new(-1.0, -1.0, 0.0), 1e-5));
        assert!(upper_right.abs_diff_eq(Vec3::new(1.0, 1.0, 0.0), 1e-5));
    }

    #[test]
    fn test_draw_without_setup_fails() {
        let mut strings = ShaderVarStringSet::new();
        let mut manager = chain(&mut strings, 1);
        let mut backend = MockGraphicsBackend::new(640, 480);
        assert!(manager.draw_post_effects(&mut backend).is_err());
        assert!(backend.drawn_meshes().is_empty());
    }
}
