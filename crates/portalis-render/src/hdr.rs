//! HDR luminance measurement and exposure control.
//!
//! [`LuminanceReducer`] shrinks the rendered frame in stages of
//! `block_size`×`block_size` pixels until a single texel is left, which holds
//! the average luminance in red and the maximum in green.
//! [`LinearExposure`] then moves the exposure toward a target average.

use std::sync::Arc;

use portalis_core::config::ConfigStore;
use portalis_core::math::{ReversibleTransform, Vec2, Vec3, Vec4};
use portalis_core::profiling::profile_function;
use portalis_test_utils::{GpuTexture, RenderContext};

use crate::Ticks;
use crate::context_render::{DrawScope, GraphicsBackend};
use crate::error::RenderResult;
use crate::post_effects::{create_buffer, screen_quad_projection};
use crate::render_mesh::{
    BufferHolder, MeshType, MixMode, RenderMesh, ShaderHandle, ShaderVarName, ShaderVarStringSet, ShaderVariableValue, ZBufMode,
};
use crate::render_tree::{Attachment, DrawFlags, RenderTarget};
use crate::texture_cache::{TextureCache, TextureCacheOptions, TextureProperties};

pub const DEFAULT_BLOCK_SIZE: u32 = 4;

/// Shader variable the previous stage is bound under.
pub const SV_REDUCE_INPUT: &str = "tex diffuse";
/// Shader variable carrying `(1/w, 1/h)` of the input stage.
pub const SV_REDUCE_PIXEL_SIZE: &str = "pixel size";

/// Sizes of the reduction stages for a `width`×`height` input.
///
/// Each stage divides the previous one by `block_size`, rounding up, and the
/// last stage is always 1×1.
pub fn reduction_stages(width: u32, height: u32, block_size: u32) -> Vec<(u32, u32)> {
    let block = block_size.max(2);
    let (mut w, mut h) = (width.max(1), height.max(1));
    let mut stages = Vec::new();
    loop {
        w = w.div_ceil(block);
        h = h.div_ceil(block);
        stages.push((w, h));
        if w == 1 && h == 1 {
            return stages;
        }
    }
}

/// Result of one luminance measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LuminanceStats {
    pub average: f32,
    pub maximum: f32,
}

pub struct LuminanceReducer {
    block_size: u32,
    tex_cache: TextureCache,
    shader: ShaderHandle,
    sv_input: ShaderVarName,
    sv_pixel_size: ShaderVarName,
    quad: RenderMesh,
    frame: Ticks,
}

impl LuminanceReducer {
    /// `shader` averages and maximises one block of its input per output texel.
    pub fn new(shader: ShaderHandle, block_size: u32, strings: &mut ShaderVarStringSet) -> Self {
        let quad = RenderMesh {
            name: "[luminance reduce]".to_owned(),
            mesh_type: MeshType::TriangleFan,
            z_buf_mode: ZBufMode::None,
            mix_mode: MixMode::REPLACE,
            index_start: 0,
            index_end: 4,
            ..Default::default()
        };

        // The last stage is read back.
        let mut properties = TextureProperties::render_target(wgpu::TextureFormat::Rgba16Float);
        properties.usage |= wgpu::TextureUsages::COPY_SRC;

        Self {
            block_size: block_size.max(2),
            tex_cache: TextureCache::new("luminance", properties, TextureCacheOptions::EXACT_SIZE_MATCH),
            shader,
            sv_input: strings.request(SV_REDUCE_INPUT),
            sv_pixel_size: strings.request(SV_REDUCE_PIXEL_SIZE),
            quad,
            frame: 0,
        }
    }

    /// Reads `RenderManager.HDR.BlockSize`.
    pub fn from_config(config: &ConfigStore, shader: ShaderHandle, strings: &mut ShaderVarStringSet) -> Self {
        let block = config.get_int("RenderManager.HDR.BlockSize", DEFAULT_BLOCK_SIZE as i64);
        Self::new(shader, block.clamp(2, 64) as u32, strings)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn texture_cache(&self) -> &TextureCache {
        &self.tex_cache
    }

    /// Reduces `input` down to one texel and reads it back.
    ///
    /// Returns `None` if a stage texture cannot be allocated, a stage cannot
    /// be drawn, or the backend cannot read pixels.
    pub fn measure<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B, input: &GpuTexture) -> Option<LuminanceStats> {
        profile_function!();
        self.frame += 1;
        self.tex_cache.advance_frame(self.frame);

        let prepared = self
            .ensure_quad(backend.resources())
            .and_then(|()| self.lease_stages(backend, input.width(), input.height()));
        let stages = match prepared {
            Ok(stages) => stages,
            Err(err) => {
                tracing::warn!("Luminance measurement skipped: {}", err);
                return None;
            }
        };

        let mut source = input.clone();
        for stage in &stages {
            let target = RenderTarget::new(stage.clone());
            backend.set_render_target(Attachment::Depth, None);
            backend.set_render_target(Attachment::Color0, Some(&target));
            if let Err(err) = backend.validate_render_targets() {
                tracing::warn!("Luminance stage target rejected: {}", err);
                backend.unset_render_targets();
                return None;
            }

            let pixel_size = Vec2::new(1.0 / source.width().max(1) as f32, 1.0 / source.height().max(1) as f32);
            self.quad.variable_context.clear();
            self.quad
                .variable_context
                .set(self.sv_input, ShaderVariableValue::Texture(source.clone()));
            self.quad
                .variable_context
                .set(self.sv_pixel_size, ShaderVariableValue::Vec2(pixel_size));

            let drawn = match DrawScope::begin(&mut *backend, DrawFlags::CLEAR_ZBUFFER | DrawFlags::GRAPHICS_3D) {
                Some(mut scope) => {
                    let backend = scope.backend();
                    backend.set_projection(screen_quad_projection(Vec2::ONE), stage.width() as f32 / stage.height().max(1) as f32);
                    backend.set_world_to_camera(&ReversibleTransform::IDENTITY);
                    backend.draw_mesh(&self.quad, &self.shader, 0);
                    true
                }
                None => false,
            };
            if !drawn {
                backend.unset_render_targets();
                return None;
            }

            source = stage.clone();
        }
        backend.unset_render_targets();

        let texel = backend.read_pixel(&source)?;
        Some(LuminanceStats {
            average: texel.x,
            maximum: texel.y,
        })
    }

    /// Unit quad covering each stage target.
    fn ensure_quad(&mut self, resources: &dyn RenderContext) -> RenderResult<()> {
        if self.quad.buffers.is_some() {
            return Ok(());
        }
        let positions = [Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), Vec3::new(1.0, 1.0, 0.0), Vec3::new(0.0, 1.0, 0.0)];
        let texcoords = [Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0), Vec2::new(1.0, 1.0), Vec2::new(0.0, 1.0)];
        self.quad.buffers = Some(Arc::new(BufferHolder {
            index: create_buffer(resources, "luminance quad indices", wgpu::BufferUsages::INDEX, &[0u32, 1, 2, 3])?,
            position: create_buffer(resources, "luminance quad", wgpu::BufferUsages::VERTEX, &positions)?,
            texcoord0: create_buffer(resources, "luminance texcoords", wgpu::BufferUsages::VERTEX, &texcoords)?,
        }));
        Ok(())
    }

    fn lease_stages<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &B,
        width: u32,
        height: u32,
    ) -> RenderResult<Vec<GpuTexture>> {
        reduction_stages(width, height, self.block_size)
            .into_iter()
            .map(|(w, h)| {
                self.tex_cache
                    .query_unused_texture(backend.resources(), w, h, 0)
                    .map(|leased| leased.texture)
            })
            .collect()
    }
}

/// Exposure that drifts toward `target_average / measured_average`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearExposure {
    pub target_average: f32,
    pub min_exposure: f32,
    pub max_exposure: f32,
    /// Maximum exposure change per second.
    pub change_rate: f32,
    exposure: f32,
}

impl Default for LinearExposure {
    fn default() -> Self {
        Self {
            target_average: 0.8,
            min_exposure: 0.1,
            max_exposure: 10.0,
            change_rate: 1.0,
            exposure: 1.0,
        }
    }
}

impl LinearExposure {
    /// Reads `RenderManager.HDR.Exposure.*`.
    pub fn from_config(config: &ConfigStore) -> Self {
        let defaults = Self::default();
        let min_exposure = config.get_float("RenderManager.HDR.Exposure.MinExposure", defaults.min_exposure);
        let max_exposure = config
            .get_float("RenderManager.HDR.Exposure.MaxExposure", defaults.max_exposure)
            .max(min_exposure);
        Self {
            target_average: config.get_float("RenderManager.HDR.Exposure.TargetAverage", defaults.target_average),
            min_exposure,
            max_exposure,
            change_rate: config
                .get_float("RenderManager.HDR.Exposure.ChangeRate", defaults.change_rate)
                .max(0.0),
            exposure: defaults.exposure.clamp(min_exposure, max_exposure),
        }
    }

    pub fn exposure(&self) -> f32 {
        self.exposure
    }

    /// Moves the exposure toward the ideal value for `stats`, by at most
    /// `change_rate * elapsed_seconds`.
    pub fn update(&mut self, stats: LuminanceStats, elapsed_seconds: f32) -> f32 {
        if stats.average > f32::EPSILON {
            let ideal = (self.target_average / stats.average).clamp(self.min_exposure, self.max_exposure);
            let step = self.change_rate * elapsed_seconds.max(0.0);
            self.exposure += (ideal - self.exposure).clamp(-step, step);
        }
        self.exposure = self.exposure.clamp(self.min_exposure, self.max_exposure);
        self.exposure
    }

    /// Shader value `(exposure, 1/exposure, 0, 0)`.
    pub fn shader_value(&self) -> Vec4 {
        Vec4::new(self.exposure, 1.0 / self.exposure, 0.0, 0.0)
    }
}
