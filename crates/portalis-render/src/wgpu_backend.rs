//! [`GraphicsBackend`] on a real wgpu device.
//!
//! Every `begin_draw`/`finish_draw` pair becomes one render pass on a shared
//! command encoder; the recorded commands go to the queue on [`WgpuBackend::submit`]
//! or when a pixel is read back.
//!
//! Shaders are looked up by [`ShaderHandle`]. Each registered pipeline must be
//! created with [`WgpuBackend::pipeline_layout`] for its [`ShaderBindings`]:
//!
//! - group 0, binding 0: [`DrawUniforms`] with a dynamic offset;
//! - group 1: one texture and one sampler per texture binding, in order.
//!
//! Vertex buffer 0 holds `vec3` positions, buffer 1 the texture coordinates
//! (see [`vertex_buffer_layouts`]). Blending, depth testing and topology come
//! from the pipeline; triangle fans are drawn as lists from consecutive
//! vertices starting at the mesh's `index_start`.

use std::sync::Arc;

use ahash::AHashMap;
use bytemuck::{Pod, Zeroable};
use portalis_core::math::{Box2, Mat4, ReversibleTransform, Vec4};
use portalis_core::profiling::profile_function;
use portalis_test_utils::{GpuTexture, RenderContext};

use crate::clipper::Clipper2D;
use crate::context::GraphicsContext;
use crate::context_render::GraphicsBackend;
use crate::error::{RenderError, RenderResult};
use crate::render_mesh::{
    MeshType, RenderMesh, ShaderHandle, ShaderVarName, ShaderVariableContext, ShaderVariableValue,
};
use crate::render_tree::{Attachment, DrawFlags, RenderTarget, RenderTargets};

/// Format of the depth buffers created for targets without one.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Vector slots in [`DrawUniforms`].
pub const MAX_SHADER_VECTORS: usize = 4;

const INITIAL_UNIFORM_SLOTS: u32 = 64;

/// Per-draw uniform block.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DrawUniforms {
    pub world_to_clip: [f32; 16],
    pub object_to_world: [f32; 16],
    /// Values of [`ShaderBindings::vectors`], zero where unset.
    pub vectors: [[f32; 4]; MAX_SHADER_VECTORS],
}

/// A texture variable bound in group 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureBinding {
    pub name: ShaderVarName,
    /// Entry of an array variable, such as one shadow split.
    pub element: usize,
    pub sample_type: wgpu::TextureSampleType,
}

impl TextureBinding {
    pub fn new(name: ShaderVarName) -> Self {
        Self {
            name,
            element: 0,
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
        }
    }

    pub fn with_element(mut self, element: usize) -> Self {
        self.element = element;
        self
    }

    pub fn with_sample_type(mut self, sample_type: wgpu::TextureSampleType) -> Self {
        self.sample_type = sample_type;
        self
    }
}

/// Shader variables a pipeline reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShaderBindings {
    pub textures: Vec<TextureBinding>,
    /// At most [`MAX_SHADER_VECTORS`]; extra entries are ignored.
    pub vectors: Vec<ShaderVarName>,
}

/// Layout of the texture coordinate stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexcoordLayout {
    Vec2,
    Vec4,
}

const POSITION_ATTRIBUTES: [wgpu::VertexAttribute; 1] = [wgpu::VertexAttribute {
    format: wgpu::VertexFormat::Float32x3,
    offset: 0,
    shader_location: 0,
}];
const TEXCOORD2_ATTRIBUTES: [wgpu::VertexAttribute; 1] = [wgpu::VertexAttribute {
    format: wgpu::VertexFormat::Float32x2,
    offset: 0,
    shader_location: 1,
}];
const TEXCOORD4_ATTRIBUTES: [wgpu::VertexAttribute; 1] = [wgpu::VertexAttribute {
    format: wgpu::VertexFormat::Float32x4,
    offset: 0,
    shader_location: 1,
}];

/// Vertex buffers of every mesh drawn by [`WgpuBackend`].
pub fn vertex_buffer_layouts(texcoords: TexcoordLayout) -> [wgpu::VertexBufferLayout<'static>; 2] {
    let (stride, attributes) = match texcoords {
        TexcoordLayout::Vec2 => (8, &TEXCOORD2_ATTRIBUTES),
        TexcoordLayout::Vec4 => (16, &TEXCOORD4_ATTRIBUTES),
    };
    [
        wgpu::VertexBufferLayout {
            array_stride: 12,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &POSITION_ATTRIBUTES,
        },
        wgpu::VertexBufferLayout {
            array_stride: stride,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes,
        },
    ]
}

/// Size and usage of a bound render target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetInfo {
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

impl TargetInfo {
    fn of(texture: &wgpu::Texture) -> Self {
        Self {
            width: texture.width(),
            height: texture.height(),
            format: texture.format(),
            usage: texture.usage(),
        }
    }
}

/// Checks that `color` and `depth` can form one render pass.
///
/// A depth target without a color target is a depth-only pass; with
/// neither, the pass draws to the screen, which must then be set.
pub fn check_targets(
    color: Option<TargetInfo>,
    depth: Option<TargetInfo>,
    screen: Option<(u32, u32)>,
) -> RenderResult<()> {
    let invalid = |attachment, reason: &str| RenderError::InvalidRenderTarget {
        attachment,
        reason: reason.to_owned(),
    };

    if let Some(color) = color {
        if color.format.is_depth_stencil_format() {
            return Err(invalid(Attachment::Color0, "depth format bound as color"));
        }
        if !color.usage.contains(wgpu::TextureUsages::RENDER_ATTACHMENT) {
            return Err(invalid(Attachment::Color0, "texture is not renderable"));
        }
    }
    if let Some(depth) = depth {
        if !depth.format.is_depth_stencil_format() {
            return Err(invalid(Attachment::Depth, "color format bound as depth"));
        }
        if !depth.usage.contains(wgpu::TextureUsages::RENDER_ATTACHMENT) {
            return Err(invalid(Attachment::Depth, "texture is not renderable"));
        }
    }
    match (color, depth) {
        (Some(color), Some(depth)) if (color.width, color.height) != (depth.width, depth.height) => {
            Err(invalid(Attachment::Depth, "depth and color sizes differ"))
        }
        (None, None) if screen.is_none() => Err(invalid(Attachment::Color0, "no screen to draw to")),
        _ => Ok(()),
    }
}

/// Scissor rectangle `(x, y, width, height)` for clipper `bounds` on a
/// `width`×`height` target.
///
/// Clipper coordinates have their origin in the lower left, scissors in the
/// upper left. `None` if nothing of the target remains.
pub fn scissor_rect(bounds: Box2, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let (w, h) = (width as f32, height as f32);
    let left = bounds.min.x.floor().clamp(0.0, w);
    let right = bounds.max.x.ceil().clamp(0.0, w);
    let bottom = bounds.min.y.floor().clamp(0.0, h);
    let top = bounds.max.y.ceil().clamp(0.0, h);
    if right <= left || top <= bottom {
        return None;
    }
    Some((left as u32, (h - top) as u32, (right - left) as u32, (top - bottom) as u32))
}

/// Triangle list indices covering a fan of `vertex_count` vertices.
pub fn fan_indices(vertex_count: u32) -> Vec<u32> {
    (1..vertex_count.saturating_sub(1)).flat_map(|i| [0, i, i + 1]).collect()
}

/// Converts a half-precision float.
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = i32::from((bits >> 10) & 0x1f);
    let mantissa = f32::from(bits & 0x3ff);
    match exponent {
        0 => sign * mantissa * 2f32.powi(-24),
        0x1f if mantissa == 0.0 => sign * f32::INFINITY,
        0x1f => f32::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f32.powi(exponent - 15),
    }
}

/// Decodes the first texel of `bytes` in `format`; missing channels read as
/// zero, missing alpha as one.
pub fn decode_texel(format: wgpu::TextureFormat, bytes: &[u8]) -> Option<Vec4> {
    use wgpu::TextureFormat as F;

    let f32_at = |i: usize| -> Option<f32> {
        let raw: [u8; 4] = bytes.get(i * 4..i * 4 + 4)?.try_into().ok()?;
        Some(f32::from_le_bytes(raw))
    };
    let f16_at = |i: usize| -> Option<f32> {
        let raw: [u8; 2] = bytes.get(i * 2..i * 2 + 2)?.try_into().ok()?;
        Some(f16_to_f32(u16::from_le_bytes(raw)))
    };
    let unorm_at = |i: usize| -> Option<f32> { bytes.get(i).map(|b| f32::from(*b) / 255.0) };

    let texel = match format {
        F::Rgba8Unorm | F::Rgba8UnormSrgb => Vec4::new(unorm_at(0)?, unorm_at(1)?, unorm_at(2)?, unorm_at(3)?),
        F::Bgra8Unorm | F::Bgra8UnormSrgb => Vec4::new(unorm_at(2)?, unorm_at(1)?, unorm_at(0)?, unorm_at(3)?),
        F::R16Float => Vec4::new(f16_at(0)?, 0.0, 0.0, 1.0),
        F::Rg16Float => Vec4::new(f16_at(0)?, f16_at(1)?, 0.0, 1.0),
        F::Rgba16Float => Vec4::new(f16_at(0)?, f16_at(1)?, f16_at(2)?, f16_at(3)?),
        F::R32Float | F::Depth32Float => Vec4::new(f32_at(0)?, 0.0, 0.0, 1.0),
        F::Rgba32Float => Vec4::new(f32_at(0)?, f32_at(1)?, f32_at(2)?, f32_at(3)?),
        _ => return None,
    };
    Some(texel)
}

fn shader_vector(value: &ShaderVariableValue) -> Option<[f32; 4]> {
    match value {
        ShaderVariableValue::Float(v) => Some([*v, 0.0, 0.0, 0.0]),
        ShaderVariableValue::Int(v) => Some([*v as f32, 0.0, 0.0, 0.0]),
        ShaderVariableValue::Vec2(v) => Some([v.x, v.y, 0.0, 0.0]),
        ShaderVariableValue::Vec4(v) => Some(v.to_array()),
        _ => None,
    }
}

fn target_view(target: &RenderTarget) -> Option<wgpu::TextureView> {
    let texture = target.texture.as_wgpu()?;
    Some(texture.create_view(&wgpu::TextureViewDescriptor {
        label: Some("portalis target"),
        dimension: Some(wgpu::TextureViewDimension::D2),
        base_array_layer: target.subtexture,
        array_layer_count: Some(1),
        mip_level_count: Some(1),
        ..Default::default()
    }))
}

struct RegisteredShader {
    pipeline: wgpu::RenderPipeline,
    bindings: ShaderBindings,
    texture_layout: Option<wgpu::BindGroupLayout>,
}

/// Growing buffer of per-draw uniforms addressed by dynamic offsets.
struct UniformRing {
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    capacity: u32,
    used: u32,
}

struct Screen {
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

/// Draws render trees with a [`GraphicsContext`].
pub struct WgpuBackend {
    context: Arc<GraphicsContext>,
    screen: Option<Screen>,
    bound: RenderTargets,
    encoder: Option<wgpu::CommandEncoder>,
    pass: Option<wgpu::RenderPass<'static>>,
    pass_size: (u32, u32),
    projection: Mat4,
    world_to_camera: Mat4,
    scissor: Option<Box2>,
    scissor_empty: bool,
    context_variables: ShaderVariableContext,
    shaders: AHashMap<ShaderHandle, RegisteredShader>,
    uniform_layout: wgpu::BindGroupLayout,
    texture_layouts: AHashMap<Vec<wgpu::TextureSampleType>, wgpu::BindGroupLayout>,
    uniform_stride: u64,
    ring: UniformRing,
    /// Rings outgrown since the last submit; their draws are still queued.
    retired_rings: Vec<UniformRing>,
    depth_buffers: AHashMap<(u32, u32), wgpu::TextureView>,
    fan_indices: Option<(u32, wgpu::Buffer)>,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
}

impl WgpuBackend {
    pub fn new(context: Arc<GraphicsContext>) -> Self {
        let device = &context.device;
        let uniform_size = std::mem::size_of::<DrawUniforms>() as u64;
        let alignment = u64::from(device.limits().min_uniform_buffer_offset_alignment.max(1));
        let uniform_stride = uniform_size.div_ceil(alignment) * alignment;

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("portalis draw uniforms"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(uniform_size),
                },
                count: None,
            }],
        });
        let ring = Self::create_ring(device, &uniform_layout, uniform_stride, INITIAL_UNIFORM_SLOTS);

        let sampler = |label: &'static str, filter: wgpu::FilterMode| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: filter,
                min_filter: filter,
                mipmap_filter: filter,
                ..Default::default()
            })
        };
        let linear_sampler = sampler("portalis linear", wgpu::FilterMode::Linear);
        let nearest_sampler = sampler("portalis nearest", wgpu::FilterMode::Nearest);

        Self {
            screen: None,
            bound: [None, None],
            encoder: None,
            pass: None,
            pass_size: (0, 0),
            projection: Mat4::IDENTITY,
            world_to_camera: Mat4::IDENTITY,
            scissor: None,
            scissor_empty: false,
            context_variables: ShaderVariableContext::new(),
            shaders: AHashMap::new(),
            uniform_layout,
            texture_layouts: AHashMap::new(),
            uniform_stride,
            ring,
            retired_rings: Vec::new(),
            depth_buffers: AHashMap::new(),
            fan_indices: None,
            linear_sampler,
            nearest_sampler,
            context,
        }
    }

    pub fn context(&self) -> &Arc<GraphicsContext> {
        &self.context
    }

    /// Sets the texture drawn to when no color target is bound.
    pub fn set_screen(&mut self, view: wgpu::TextureView, width: u32, height: u32) {
        self.screen = Some(Screen { view, width, height });
    }

    /// Pipeline layout a shader with `bindings` must be created with.
    pub fn pipeline_layout(&mut self, bindings: &ShaderBindings) -> wgpu::PipelineLayout {
        let texture_layout = self.texture_layout(bindings);
        let mut groups = vec![&self.uniform_layout];
        if let Some(layout) = &texture_layout {
            groups.push(layout);
        }
        self.context
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("portalis pipeline layout"),
                bind_group_layouts: &groups,
                push_constant_ranges: &[],
            })
    }

    /// Makes `pipeline` drawable as `shader`.
    pub fn register_shader(&mut self, shader: ShaderHandle, pipeline: wgpu::RenderPipeline, bindings: ShaderBindings) {
        if bindings.vectors.len() > MAX_SHADER_VECTORS {
            tracing::warn!(
                "Shader '{}' reads {} vectors, only {} are passed",
                shader.name(),
                bindings.vectors.len(),
                MAX_SHADER_VECTORS
            );
        }
        let texture_layout = self.texture_layout(&bindings);
        self.shaders.insert(
            shader,
            RegisteredShader {
                pipeline,
                bindings,
                texture_layout,
            },
        );
    }

    pub fn is_registered(&self, shader: &ShaderHandle) -> bool {
        self.shaders.contains_key(shader)
    }

    /// Ends any open pass and hands the recorded commands to the queue.
    pub fn submit(&mut self) {
        self.pass = None;
        if let Some(encoder) = self.encoder.take() {
            self.context.queue.submit(std::iter::once(encoder.finish()));
        }
        self.retired_rings.clear();
        self.ring.used = 0;
    }

    fn texture_layout(&mut self, bindings: &ShaderBindings) -> Option<wgpu::BindGroupLayout> {
        if bindings.textures.is_empty() {
            return None;
        }
        let sample_types: Vec<_> = bindings.textures.iter().map(|binding| binding.sample_type).collect();
        if let Some(layout) = self.texture_layouts.get(&sample_types) {
            return Some(layout.clone());
        }

        let entries: Vec<_> = sample_types
            .iter()
            .enumerate()
            .flat_map(|(n, sample_type)| {
                let sampler = if matches!(sample_type, wgpu::TextureSampleType::Float { filterable: true }) {
                    wgpu::SamplerBindingType::Filtering
                } else {
                    wgpu::SamplerBindingType::NonFiltering
                };
                [
                    wgpu::BindGroupLayoutEntry {
                        binding: 2 * n as u32,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: *sample_type,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2 * n as u32 + 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(sampler),
                        count: None,
                    },
                ]
            })
            .collect();
        let layout = self
            .context
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("portalis textures"),
                entries: &entries,
            });
        self.texture_layouts.insert(sample_types, layout.clone());
        Some(layout)
    }

    fn create_ring(device: &wgpu::Device, layout: &wgpu::BindGroupLayout, stride: u64, capacity: u32) -> UniformRing {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("portalis draw uniforms"),
            size: stride * u64::from(capacity),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("portalis draw uniforms"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(std::mem::size_of::<DrawUniforms>() as u64),
                }),
            }],
        });
        UniformRing {
            buffer,
            bind_group,
            capacity,
            used: 0,
        }
    }

    /// Queues `uniforms` and returns the dynamic offset they live at.
    fn push_uniforms(&mut self, uniforms: &DrawUniforms) -> u32 {
        if self.ring.used == self.ring.capacity {
            let capacity = self.ring.capacity * 2;
            let ring = Self::create_ring(&self.context.device, &self.uniform_layout, self.uniform_stride, capacity);
            self.retired_rings.push(std::mem::replace(&mut self.ring, ring));
        }
        let offset = u64::from(self.ring.used) * self.uniform_stride;
        self.context
            .queue
            .write_buffer(&self.ring.buffer, offset, bytemuck::bytes_of(uniforms));
        self.ring.used += 1;
        offset as u32
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.context.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("portalis frame"),
            })
        })
    }

    fn depth_buffer(&mut self, width: u32, height: u32) -> wgpu::TextureView {
        let device = &self.context.device;
        self.depth_buffers
            .entry((width, height))
            .or_insert_with(|| {
                device
                    .create_texture(&wgpu::TextureDescriptor {
                        label: Some("portalis depth"),
                        size: wgpu::Extent3d {
                            width,
                            height,
                            depth_or_array_layers: 1,
                        },
                        mip_level_count: 1,
                        sample_count: 1,
                        dimension: wgpu::TextureDimension::D2,
                        format: DEPTH_FORMAT,
                        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                        view_formats: &[],
                    })
                    .create_view(&wgpu::TextureViewDescriptor::default())
            })
            .clone()
    }

    fn fan_index_buffer(&mut self, vertex_count: u32) -> wgpu::Buffer {
        if let Some((count, buffer)) = &self.fan_indices
            && *count >= vertex_count
        {
            return buffer.clone();
        }
        let count = vertex_count.next_power_of_two().max(4);
        let indices = fan_indices(count);
        let buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("portalis fan indices"),
            size: std::mem::size_of_val(indices.as_slice()) as u64,
            usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.context
            .queue
            .write_buffer(&buffer, 0, bytemuck::cast_slice(&indices));
        self.fan_indices = Some((count, buffer.clone()));
        buffer
    }

    fn apply_scissor(&mut self) {
        let (width, height) = self.pass_size;
        let rect = match self.scissor {
            Some(bounds) => scissor_rect(bounds, width, height),
            None => Some((0, 0, width, height)),
        };
        self.scissor_empty = rect.is_none();
        if let (Some(pass), Some((x, y, w, h))) = (self.pass.as_mut(), rect) {
            pass.set_scissor_rect(x, y, w, h);
        }
    }

    fn lookup<'v>(&'v self, mesh: &'v RenderMesh, name: ShaderVarName) -> Option<&'v ShaderVariableValue> {
        mesh.variable_context
            .get(name)
            .or_else(|| mesh.material.as_ref().and_then(|material| material.variables.get(name)))
            .or_else(|| self.context_variables.get(name))
    }

    fn texture_bind_group(&self, mesh: &RenderMesh, shader: &RegisteredShader) -> Option<wgpu::BindGroup> {
        let layout = shader.texture_layout.as_ref()?;
        let mut views = Vec::with_capacity(shader.bindings.textures.len());
        for binding in &shader.bindings.textures {
            let value = self.lookup(mesh, binding.name)?;
            let texture = match value {
                ShaderVariableValue::Array(items) => items.get(binding.element)?.as_texture()?,
                other => other.as_texture()?,
            };
            views.push(texture.as_wgpu()?.create_view(&wgpu::TextureViewDescriptor::default()));
        }

        let entries: Vec<_> = views
            .iter()
            .zip(&shader.bindings.textures)
            .enumerate()
            .flat_map(|(n, (view, binding))| {
                let sampler = if matches!(binding.sample_type, wgpu::TextureSampleType::Float { filterable: true }) {
                    &self.linear_sampler
                } else {
                    &self.nearest_sampler
                };
                [
                    wgpu::BindGroupEntry {
                        binding: 2 * n as u32,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2 * n as u32 + 1,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    },
                ]
            })
            .collect();
        Some(self.context.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("portalis textures"),
            layout,
            entries: &entries,
        }))
    }

    fn read_back(&mut self, texture: &wgpu::Texture) -> Option<Vec4> {
        let format = texture.format();
        let aspect = if format.is_depth_stencil_format() {
            wgpu::TextureAspect::DepthOnly
        } else {
            wgpu::TextureAspect::All
        };
        format.block_copy_size(Some(aspect))?;

        let staging = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("portalis pixel readback"),
            size: u64::from(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.pass = None;
        self.encoder().copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
                    rows_per_image: Some(1),
                },
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        self.submit();

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.context.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });

        match rx.recv() {
            Ok(Ok(())) => {
                let texel = decode_texel(format, &slice.get_mapped_range());
                staging.unmap();
                texel
            }
            Ok(Err(err)) => {
                tracing::warn!("Pixel readback failed: {}", err);
                None
            }
            Err(_) => None,
        }
    }
}

impl GraphicsBackend for WgpuBackend {
    fn resources(&self) -> &dyn RenderContext {
        self.context.as_ref()
    }

    fn screen_size(&self) -> (u32, u32) {
        self.screen.as_ref().map_or((0, 0), |screen| (screen.width, screen.height))
    }

    fn set_render_target(&mut self, attachment: Attachment, target: Option<&RenderTarget>) {
        self.bound[attachment.index()] = target.cloned();
    }

    fn validate_render_targets(&mut self) -> RenderResult<()> {
        let mut infos = [None, None];
        for attachment in Attachment::ALL {
            if let Some(target) = &self.bound[attachment.index()] {
                let texture = target.texture.as_wgpu().ok_or_else(|| RenderError::InvalidRenderTarget {
                    attachment,
                    reason: "not a GPU texture".into(),
                })?;
                infos[attachment.index()] = Some(TargetInfo::of(texture));
            }
        }
        let screen = self.screen.as_ref().map(|screen| (screen.width, screen.height));
        check_targets(
            infos[Attachment::Color0.index()],
            infos[Attachment::Depth.index()],
            screen,
        )
    }

    fn unset_render_targets(&mut self) {
        self.bound = [None, None];
    }

    fn set_projection(&mut self, projection: Mat4, _aspect: f32) {
        self.projection = projection;
    }

    fn set_clipper(&mut self, clipper: Option<&Clipper2D>) {
        self.scissor = clipper.map(Clipper2D::bounds);
        if self.pass.is_some() {
            self.apply_scissor();
        }
    }

    fn begin_draw(&mut self, flags: DrawFlags) -> bool {
        profile_function!();
        if self.pass.is_some() {
            tracing::error!("begin_draw while a pass is open");
            return false;
        }

        let color = self.bound[Attachment::Color0.index()].clone();
        let depth = self.bound[Attachment::Depth.index()].clone();
        let (color_view, size) = match (&color, &depth) {
            (Some(target), _) => (target_view(target), (target.texture.width(), target.texture.height())),
            (None, Some(target)) => (None, (target.texture.width(), target.texture.height())),
            (None, None) => match &self.screen {
                Some(screen) => (Some(screen.view.clone()), (screen.width, screen.height)),
                None => return false,
            },
        };
        if color.is_some() && color_view.is_none() {
            return false;
        }
        let depth_view = match &depth {
            Some(target) => match target_view(target) {
                Some(view) => Some(view),
                None => return false,
            },
            None if flags.contains(DrawFlags::GRAPHICS_3D) => Some(self.depth_buffer(size.0, size.1)),
            None => None,
        };

        let color_load = if flags.contains(DrawFlags::CLEAR_SCREEN) {
            wgpu::LoadOp::Clear(wgpu::Color::BLACK)
        } else {
            wgpu::LoadOp::Load
        };
        let depth_load = if flags.contains(DrawFlags::CLEAR_ZBUFFER) {
            wgpu::LoadOp::Clear(1.0)
        } else {
            wgpu::LoadOp::Load
        };
        let color_attachments = [color_view.as_ref().map(|view| wgpu::RenderPassColorAttachment {
            view,
            resolve_target: None,
            ops: wgpu::Operations {
                load: color_load,
                store: wgpu::StoreOp::Store,
            },
            depth_slice: None,
        })];
        let attachments = if color_view.is_some() {
            &color_attachments[..]
        } else {
            &[][..]
        };

        let pass = self
            .encoder()
            .begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("portalis context"),
                color_attachments: attachments,
                depth_stencil_attachment: depth_view.as_ref().map(|view| wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: depth_load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            })
            .forget_lifetime();
        self.pass = Some(pass);
        self.pass_size = size;
        self.apply_scissor();
        true
    }

    fn finish_draw(&mut self) {
        self.pass = None;
    }

    fn set_world_to_camera(&mut self, transform: &ReversibleTransform) {
        self.world_to_camera = transform.to_mat4();
    }

    fn set_shader_variables(&mut self, variables: &ShaderVariableContext) {
        self.context_variables = variables.clone();
    }

    fn draw_mesh(&mut self, mesh: &RenderMesh, shader: &ShaderHandle, _layer: usize) {
        if self.pass.is_none() || self.scissor_empty {
            return;
        }
        let Some(buffers) = mesh.buffers.clone() else {
            tracing::debug!("Mesh '{}' has no buffers", mesh.name);
            return;
        };
        let Some(registered) = self.shaders.get(shader) else {
            tracing::debug!("Shader '{}' is not registered", shader.name());
            return;
        };
        let (Some(index), Some(position), Some(texcoord)) = (
            buffers.index.as_wgpu().cloned(),
            buffers.position.as_wgpu().cloned(),
            buffers.texcoord0.as_wgpu().cloned(),
        ) else {
            tracing::debug!("Mesh '{}' has no GPU buffers", mesh.name);
            return;
        };

        let mut uniforms = DrawUniforms {
            world_to_clip: (self.projection * self.world_to_camera).to_cols_array(),
            object_to_world: mesh.object_to_world.inverse().to_mat4().to_cols_array(),
            vectors: [[0.0; 4]; MAX_SHADER_VECTORS],
        };
        for (slot, name) in uniforms.vectors.iter_mut().zip(&registered.bindings.vectors) {
            if let Some(vector) = self.lookup(mesh, *name).and_then(shader_vector) {
                *slot = vector;
            }
        }
        let texture_group = if registered.texture_layout.is_some() {
            match self.texture_bind_group(mesh, registered) {
                Some(group) => Some(group),
                None => {
                    tracing::debug!("Mesh '{}' lacks textures for shader '{}'", mesh.name, shader.name());
                    return;
                }
            }
        } else {
            None
        };
        let pipeline = registered.pipeline.clone();

        let count = mesh.index_end.saturating_sub(mesh.index_start);
        let fan = (mesh.mesh_type == MeshType::TriangleFan).then(|| self.fan_index_buffer(count));
        let offset = self.push_uniforms(&uniforms);

        let Some(pass) = self.pass.as_mut() else {
            return;
        };
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &self.ring.bind_group, &[offset]);
        if let Some(group) = &texture_group {
            pass.set_bind_group(1, group, &[]);
        }
        pass.set_vertex_buffer(0, position.slice(..));
        pass.set_vertex_buffer(1, texcoord.slice(..));
        match fan {
            Some(fan) => {
                pass.set_index_buffer(fan.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(0..count.saturating_sub(2) * 3, mesh.index_start as i32, 0..1);
            }
            None => {
                pass.set_index_buffer(index.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(mesh.index_start..mesh.index_end, 0, 0..1);
            }
        }
    }

    fn read_pixel(&mut self, texture: &GpuTexture) -> Option<Vec4> {
        profile_function!();
        let texture = texture.as_wgpu()?.clone();
        self.read_back(&texture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(width: u32, height: u32, format: wgpu::TextureFormat) -> TargetInfo {
        TargetInfo {
            width,
            height,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        }
    }

    #[test]
    fn test_check_targets() {
        let color = target(256, 256, wgpu::TextureFormat::Rgba8Unorm);
        let depth = target(256, 256, wgpu::TextureFormat::Depth32Float);

        assert!(check_targets(Some(color), Some(depth), None).is_ok());
        assert!(check_targets(None, Some(depth), None).is_ok());
        assert!(check_targets(None, None, Some((640, 480))).is_ok());
        assert!(check_targets(None, None, None).is_err());

        let small_depth = target(128, 128, wgpu::TextureFormat::Depth32Float);
        assert_eq!(
            check_targets(Some(color), Some(small_depth), None),
            Err(RenderError::InvalidRenderTarget {
                attachment: Attachment::Depth,
                reason: "depth and color sizes differ".into(),
            })
        );
        assert!(check_targets(Some(depth), None, None).is_err());
        assert!(check_targets(None, Some(color), None).is_err());

        let sampled_only = TargetInfo {
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            ..color
        };
        assert!(check_targets(Some(sampled_only), None, None).is_err());
    }

    #[test]
    fn test_scissor_flips_y_and_clamps() {
        let bounds = Box2::new(10.0, 20.0, 110.0, 70.0);
        assert_eq!(scissor_rect(bounds, 200, 100), Some((10, 30, 100, 50)));

        let overhanging = Box2::new(-50.0, -50.0, 50.0, 500.0);
        assert_eq!(scissor_rect(overhanging, 200, 100), Some((0, 0, 50, 100)));

        assert_eq!(scissor_rect(Box2::new(300.0, 0.0, 400.0, 10.0), 200, 100), None);
    }

    #[test]
    fn test_fan_indices() {
        assert_eq!(fan_indices(4), vec![0, 1, 2, 0, 2, 3]);
        assert!(fan_indices(2).is_empty());
        assert_eq!(fan_indices(6).len(), 12);
    }

    #[test]
    fn test_f16_conversion() {
        assert_eq!(f16_to_f32(0x3c00), 1.0);
        assert_eq!(f16_to_f32(0x3400), 0.25);
        assert_eq!(f16_to_f32(0xc000), -2.0);
        assert_eq!(f16_to_f32(0x0000), 0.0);
        assert_eq!(f16_to_f32(0x7c00), f32::INFINITY);
        assert!(f16_to_f32(0x7e00).is_nan());
        assert!((f16_to_f32(0x0001) - 2f32.powi(-24)).abs() < 1e-12);
    }

    #[test]
    fn test_decode_texel_formats() {
        assert_eq!(
            decode_texel(wgpu::TextureFormat::Rgba8Unorm, &[255, 0, 51, 255]),
            Some(Vec4::new(1.0, 0.0, 0.2, 1.0))
        );
        assert_eq!(
            decode_texel(wgpu::TextureFormat::Bgra8Unorm, &[0, 0, 255, 255]),
            Some(Vec4::new(1.0, 0.0, 0.0, 1.0))
        );

        let half: Vec<u8> = [0x3400u16, 0x4000, 0, 0x3c00].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(
            decode_texel(wgpu::TextureFormat::Rgba16Float, &half),
            Some(Vec4::new(0.25, 2.0, 0.0, 1.0))
        );

        let depth = 0.5f32.to_le_bytes();
        assert_eq!(
            decode_texel(wgpu::TextureFormat::Depth32Float, &depth),
            Some(Vec4::new(0.5, 0.0, 0.0, 1.0))
        );

        assert_eq!(decode_texel(wgpu::TextureFormat::Rgba16Float, &half[..4]), None);
        assert_eq!(decode_texel(wgpu::TextureFormat::Bc1RgbaUnorm, &[0; 8]), None);
    }

    #[test]
    fn test_uniform_block_layout() {
        assert_eq!(std::mem::size_of::<DrawUniforms>(), 64 + 64 + 16 * MAX_SHADER_VECTORS);
        let layouts = vertex_buffer_layouts(TexcoordLayout::Vec4);
        assert_eq!(layouts[0].array_stride, 12);
        assert_eq!(layouts[1].array_stride, 16);
        assert_eq!(layouts[1].attributes[0].shader_location, 1);
    }
}
