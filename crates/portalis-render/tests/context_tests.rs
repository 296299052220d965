//! Graphics context tests against a real adapter.

use portalis_core::math::{Mat4, ReversibleTransform, Vec2, Vec3, Vec4};
use portalis_render::wgpu_backend::vertex_buffer_layouts;
use portalis_render::{
    Attachment, BufferHolder, DrawFlags, GraphicsBackend, GraphicsContext, MeshType, RenderMesh, RenderTarget,
    ShaderBindings, ShaderHandle, ShaderVarStringSet, ShaderVariableContext, ShaderVariableValue, TexcoordLayout,
    TextureCache, TextureCacheOptions, TextureProperties, WgpuBackend,
};
use portalis_test_utils::{GpuBuffer, RenderContext};
use std::sync::Arc;

#[test]
#[ignore] // Requires GPU - run with: cargo test --test context_tests -- --ignored
fn test_context_creation_sync() {
    match GraphicsContext::new_owned_sync() {
        Ok(ctx) => {
            assert_eq!(Arc::strong_count(&ctx), 1);
            assert!(ctx.limits().max_texture_dimension_2d > 0);
        }
        Err(e) => {
            println!("GPU not available: {}", e);
        }
    }
}

#[test]
#[ignore] // Requires GPU
fn test_texture_cache_on_real_device() {
    let Ok(ctx) = GraphicsContext::new_owned_sync() else {
        return;
    };

    let mut cache = TextureCache::new(
        "portal",
        TextureProperties::render_target(wgpu::TextureFormat::Rgba8Unorm),
        TextureCacheOptions::POWER_OF_TWO,
    );
    let leased = cache
        .query_unused_texture(ctx.as_ref() as &dyn RenderContext, 100, 60, 10)
        .expect("texture allocation");
    assert_eq!((leased.real_width, leased.real_height), (128, 64));
    assert!(leased.texture.as_wgpu().is_some());
}

const FLAT_COLOR_SHADER: &str = r#"
struct DrawUniforms {
    world_to_clip: mat4x4<f32>,
    object_to_world: mat4x4<f32>,
    vectors: array<vec4<f32>, 4>,
}

@group(0) @binding(0) var<uniform> draw: DrawUniforms;

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) texcoord: vec2<f32>) -> @builtin(position) vec4<f32> {
    return draw.world_to_clip * draw.object_to_world * vec4<f32>(position, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return draw.vectors[0];
}
"#;

fn color_target(ctx: &GraphicsContext) -> RenderTarget {
    let mut properties = TextureProperties::render_target(wgpu::TextureFormat::Rgba8Unorm);
    properties.usage |= wgpu::TextureUsages::COPY_SRC;
    let mut cache = TextureCache::new("target", properties, TextureCacheOptions::empty());
    let leased = cache
        .query_unused_texture(ctx as &dyn RenderContext, 4, 4, 0)
        .expect("texture allocation");
    RenderTarget {
        texture: leased.texture,
        subtexture: 0,
    }
}

fn gpu_buffer(ctx: &GraphicsContext, label: &str, usage: wgpu::BufferUsages, data: &[u8]) -> GpuBuffer {
    let buffer = ctx
        .create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: data.len() as u64,
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
        .expect("buffer allocation");
    ctx.write_buffer(&buffer, 0, data);
    buffer
}

/// A fan covering clip space.
fn screen_fan(ctx: &GraphicsContext) -> RenderMesh {
    let positions = [
        Vec3::new(-1.0, -1.0, 0.5),
        Vec3::new(1.0, -1.0, 0.5),
        Vec3::new(1.0, 1.0, 0.5),
        Vec3::new(-1.0, 1.0, 0.5),
    ];
    let texcoords = [Vec2::ZERO, Vec2::X, Vec2::ONE, Vec2::Y];
    let buffers = BufferHolder {
        index: gpu_buffer(ctx, "fan indices", wgpu::BufferUsages::INDEX, bytemuck::cast_slice(&[0u32, 1, 2, 3])),
        position: gpu_buffer(ctx, "fan positions", wgpu::BufferUsages::VERTEX, bytemuck::cast_slice(&positions)),
        texcoord0: gpu_buffer(ctx, "fan texcoords", wgpu::BufferUsages::VERTEX, bytemuck::cast_slice(&texcoords)),
    };
    RenderMesh {
        name: "screen".into(),
        mesh_type: MeshType::TriangleFan,
        buffers: Some(Arc::new(buffers)),
        index_start: 0,
        index_end: 4,
        ..Default::default()
    }
}

fn flat_color_pipeline(backend: &mut WgpuBackend, bindings: &ShaderBindings) -> wgpu::RenderPipeline {
    let layout = backend.pipeline_layout(bindings);
    let device = &backend.context().device;
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("flat color"),
        source: wgpu::ShaderSource::Wgsl(FLAT_COLOR_SHADER.into()),
    });
    let buffers = vertex_buffer_layouts(TexcoordLayout::Vec2);
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("flat color"),
        layout: Some(&layout),
        vertex: wgpu::VertexState {
            module: &module,
            entry_point: Some("vs_main"),
            buffers: &buffers,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &module,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: wgpu::TextureFormat::Rgba8Unorm,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState {
            cull_mode: None,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

#[test]
#[ignore] // Requires GPU
fn test_backend_clears_and_reads_back() {
    let Ok(ctx) = GraphicsContext::new_owned_sync() else {
        return;
    };
    let target = color_target(&ctx);
    let mut backend = WgpuBackend::new(ctx.clone());

    backend.set_render_target(Attachment::Color0, Some(&target));
    assert!(backend.validate_render_targets().is_ok());
    assert!(backend.begin_draw(DrawFlags::CLEAR_SCREEN));
    backend.finish_draw();

    assert_eq!(backend.read_pixel(&target.texture), Some(Vec4::new(0.0, 0.0, 0.0, 1.0)));
}

#[test]
#[ignore] // Requires GPU
fn test_backend_draws_mesh_with_shader_vector() {
    let Ok(ctx) = GraphicsContext::new_owned_sync() else {
        return;
    };
    let mut names = ShaderVarStringSet::new();
    let tint = names.request("tint");
    let bindings = ShaderBindings {
        textures: Vec::new(),
        vectors: vec![tint],
    };
    let shader = ShaderHandle::new("flat color");

    let target = color_target(&ctx);
    let mut backend = WgpuBackend::new(ctx.clone());
    let pipeline = flat_color_pipeline(&mut backend, &bindings);
    backend.register_shader(shader.clone(), pipeline, bindings);

    let mut variables = ShaderVariableContext::new();
    variables.set(tint, ShaderVariableValue::Vec4(Vec4::new(1.0, 0.0, 1.0, 1.0)));
    let mesh = screen_fan(&ctx);

    backend.set_render_target(Attachment::Color0, Some(&target));
    assert!(backend.validate_render_targets().is_ok());
    assert!(backend.begin_draw(DrawFlags::CLEAR_SCREEN));
    backend.set_projection(Mat4::IDENTITY, 1.0);
    backend.set_world_to_camera(&ReversibleTransform::IDENTITY);
    backend.set_shader_variables(&variables);
    backend.draw_mesh(&mesh, &shader, 0);
    backend.finish_draw();

    assert_eq!(backend.read_pixel(&target.texture), Some(Vec4::new(1.0, 0.0, 1.0, 1.0)));
}

#[test]
#[ignore] // Requires GPU
fn test_backend_rejects_depth_texture_as_color() {
    let Ok(ctx) = GraphicsContext::new_owned_sync() else {
        return;
    };
    let mut cache = TextureCache::new(
        "depth",
        TextureProperties::render_target(wgpu::TextureFormat::Depth32Float),
        TextureCacheOptions::empty(),
    );
    let leased = cache
        .query_unused_texture(ctx.as_ref() as &dyn RenderContext, 4, 4, 0)
        .expect("texture allocation");
    let depth = RenderTarget {
        texture: leased.texture,
        subtexture: 0,
    };

    let mut backend = WgpuBackend::new(ctx.clone());
    backend.set_render_target(Attachment::Color0, Some(&depth));
    assert!(backend.validate_render_targets().is_err());

    backend.unset_render_targets();
    backend.set_render_target(Attachment::Depth, Some(&depth));
    assert!(backend.validate_render_targets().is_ok());
}
