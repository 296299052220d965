//! Per-frame driver tying tree construction, portal setup and drawing together.

use std::sync::Arc;

use portalis_core::config::ConfigStore;
use portalis_core::profiling::{self, profile_function};

use crate::Ticks;
use crate::camera::Camera;
use crate::context_render::{ContextRender, GraphicsBackend, RenderStats};
use crate::context_setup::{DEFAULT_MAX_RECURSION, StandardContextSetup};
use crate::hdr::{LinearExposure, LuminanceReducer, LuminanceStats};
use crate::layers::RenderLayerConfig;
use crate::portal_setup::{ContextSetup, ContextSetupData, PortalPersistentData};
use crate::post_effects::PostEffectManager;
use crate::render_mesh::{ShaderHandle, ShaderVarName, ShaderVarStringSet, ShaderVariableValue};
use crate::render_tree::{Attachment, DebugLine, DrawFlags, RenderTarget, RenderTree, TreePersistentData, TreeStats};
use crate::render_view::RenderView;
use crate::scene::Sector;
use crate::shadow::{ShadowConfigError, ShadowSettings};

/// What one [`RenderManager::render_view`] call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub contexts: usize,
    pub tree: TreeStats,
    pub render: RenderStats,
    pub shadow_maps: usize,
    pub post_effect_draws: usize,
    /// Luminance of the scene measured after post effects, with HDR on.
    pub luminance: Option<LuminanceStats>,
    /// Exposure after this frame's measurement.
    pub exposure: Option<f32>,
    /// Portal outlines recorded while the debug flag was on.
    pub debug_lines: Vec<DebugLine>,
}

/// Shader variable the current exposure is passed to post effects under.
pub const SV_HDR_EXPOSURE: &str = "hdr exposure";

const DEFAULT_TICKS_PER_SECOND: i64 = 1000;

/// Luminance feedback driving the exposure of the post-effect chain.
struct HdrState {
    reducer: LuminanceReducer,
    exposure: LinearExposure,
    sv_exposure: ShaderVarName,
    ticks_per_second: f32,
    last_measure: Option<Ticks>,
}

pub struct RenderManager {
    strings: ShaderVarStringSet,
    tree_persistent: TreePersistentData,
    portal_persistent: PortalPersistentData,
    layers: RenderLayerConfig,
    max_recursion: u32,
    shadows: Option<ShadowSettings>,
    post_effects: Option<PostEffectManager>,
    hdr: Option<HdrState>,
    frame_number: u64,
    current_time: Ticks,
}

impl RenderManager {
    pub fn new(config: &ConfigStore, layers: RenderLayerConfig) -> Self {
        let mut strings = ShaderVarStringSet::new();
        let mut tree_persistent = TreePersistentData::new();
        let portal_persistent = PortalPersistentData::from_config(config, &mut strings, &mut tree_persistent.debug);
        let max_recursion = config.get_int("RenderManager.Portals.MaxRecursion", DEFAULT_MAX_RECURSION as i64);

        tracing::info!("Render manager ready with {} layer(s)", layers.len());
        Self {
            strings,
            tree_persistent,
            portal_persistent,
            layers,
            max_recursion: max_recursion.max(0) as u32,
            shadows: None,
            post_effects: None,
            hdr: None,
            frame_number: 0,
            current_time: 0,
        }
    }

    /// Enables shadow maps of technique `shadow_type`.
    pub fn enable_shadows(&mut self, config: &ConfigStore, shadow_type: &str) -> Result<(), ShadowConfigError> {
        let settings = ShadowSettings::read_settings(config, shadow_type, &mut self.strings)?;
        self.shadows = Some(settings);
        Ok(())
    }

    /// Enables post-processing; the manager starts out with no effect layers.
    pub fn enable_post_effects(&mut self, config: &ConfigStore) -> &mut PostEffectManager {
        let mut effects = PostEffectManager::from_config(config, &mut self.strings);
        if self.hdr.is_some() {
            effects.set_intermediate_target_format(wgpu::TextureFormat::Rgba16Float);
        }
        self.post_effects.insert(effects)
    }

    /// Enables exposure control from the luminance of the rendered scene.
    ///
    /// Needs post effects: the scene is measured in their input texture, and
    /// the exposure reaches every effect layer as [`SV_HDR_EXPOSURE`].
    pub fn enable_hdr(&mut self, config: &ConfigStore, reduce_shader: ShaderHandle) {
        let reducer = LuminanceReducer::from_config(config, reduce_shader, &mut self.strings);
        let ticks_per_second = config
            .get_int("RenderManager.HDR.TicksPerSecond", DEFAULT_TICKS_PER_SECOND)
            .max(1);
        if let Some(effects) = &mut self.post_effects {
            effects.set_intermediate_target_format(wgpu::TextureFormat::Rgba16Float);
        } else {
            tracing::warn!("HDR enabled without post effects; exposure stays fixed until they are enabled");
        }
        self.hdr = Some(HdrState {
            reducer,
            exposure: LinearExposure::from_config(config),
            sv_exposure: self.strings.request(SV_HDR_EXPOSURE),
            ticks_per_second: ticks_per_second as f32,
            last_measure: None,
        });
    }

    pub fn exposure(&self) -> Option<&LinearExposure> {
        self.hdr.as_ref().map(|hdr| &hdr.exposure)
    }

    pub fn post_effects_mut(&mut self) -> Option<&mut PostEffectManager> {
        self.post_effects.as_mut()
    }

    pub fn shadows(&self) -> Option<&ShadowSettings> {
        self.shadows.as_ref()
    }

    pub fn strings_mut(&mut self) -> &mut ShaderVarStringSet {
        &mut self.strings
    }

    pub fn portal_data(&self) -> &PortalPersistentData {
        &self.portal_persistent
    }

    pub fn layers(&self) -> &RenderLayerConfig {
        &self.layers
    }

    /// Turns a debug flag (or every flag below a prefix) on or off.
    pub fn enable_debug_flag(&mut self, name: &str, enabled: bool) -> bool {
        self.tree_persistent.debug.enable_debug_flag(name, enabled)
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn current_time(&self) -> Ticks {
        self.current_time
    }

    /// Ages every cache; call once per frame before rendering views.
    pub fn update_new_frame(&mut self, now: Ticks) {
        profiling::new_frame();
        profile_function!();
        self.current_time = now;
        self.frame_number += 1;
        self.portal_persistent.update_new_frame(now);
        if let Some(shadows) = &mut self.shadows {
            shadows.advance_frame(now);
        }
    }

    /// Renders `sector` as seen by `camera`, with one shadow map per light
    /// camera when shadows are enabled.
    pub fn render_view<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        camera: Camera,
        sector: Arc<dyn Sector>,
        lights: &[Camera],
    ) -> FrameReport {
        profile_function!();
        let mut report = FrameReport::default();
        let (width, height) = backend.screen_size();

        let screen_target = match &mut self.post_effects {
            Some(effects) => match effects.setup_view(backend.resources(), width, height) {
                Ok(_) => effects.screen_target(),
                Err(err) => {
                    tracing::warn!("Post effects disabled for this frame: {}", err);
                    None
                }
            },
            None => None,
        };

        let mut view = RenderView::new(camera, width, height);
        view.set_this_sector(Some(sector.clone()));
        view.set_frame_number(self.frame_number);

        let mut tree = RenderTree::new(&mut self.tree_persistent);
        tree.inc_rec_level(sector.id());
        let root = tree.create_context(view.clone(), None);
        {
            let node = tree.context_mut(root);
            node.draw_flags = DrawFlags::CLEAR_SCREEN | DrawFlags::CLEAR_ZBUFFER;
            if let Some(texture) = &screen_target {
                node.set_target(Attachment::Color0, Some(RenderTarget::new(texture.clone())));
            }
        }

        let graphics = backend.resources();
        if let Some(shadows) = &mut self.shadows {
            for light in lights {
                let map = match shadows.create_shadow_map_context(&mut tree, &view, light.clone(), graphics) {
                    Ok(map) => map,
                    Err(err) => {
                        tracing::warn!("Skipping shadow map: {}", err);
                        continue;
                    }
                };
                shadows.setup_shadow_map(&mut tree, &map, &mut self.portal_persistent, graphics);
                shadows.bind_shadow_map(&map, &mut tree.context_mut(root).shader_variables);
                report.shadow_maps += 1;
            }
        }

        let mut setup = StandardContextSetup::new(self.layers.clone()).with_max_recursion(self.max_recursion);
        let mut setup_data = ContextSetupData::new(root);
        setup.setup_context(&mut tree, root, &mut setup_data, &mut self.portal_persistent, graphics);
        tree.dec_rec_level(sector.id());

        report.render = ContextRender::new(&mut *backend, self.layers.len()).render(&tree);
        report.contexts = tree.context_count();
        report.tree = tree.stats;
        report.debug_lines = tree.debug_lines().to_vec();
        drop(tree);

        if let Some(scene) = &screen_target
            && let Some(effects) = &mut self.post_effects
        {
            if let Some(hdr) = &self.hdr {
                effects
                    .shared_variables_mut()
                    .set(hdr.sv_exposure, ShaderVariableValue::Vec4(hdr.exposure.shader_value()));
            }
            match effects.draw_post_effects(backend) {
                Ok(draws) => report.post_effect_draws = draws,
                Err(err) => tracing::warn!("Post effects not drawn: {}", err),
            }

            if let Some(hdr) = &mut self.hdr {
                report.luminance = hdr.reducer.measure(backend, scene);
                if let Some(stats) = report.luminance {
                    let elapsed = hdr
                        .last_measure
                        .map_or(0.0, |last| self.current_time.saturating_sub(last) as f32 / hdr.ticks_per_second);
                    hdr.exposure.update(stats, elapsed);
                    hdr.last_measure = Some(self.current_time);
                }
                report.exposure = Some(hdr.exposure.exposure());
            }
        }

        tracing::trace!(
            "Frame {}: {} contexts, {} draw calls",
            self.frame_number,
            report.contexts,
            report.render.draw_calls
        );
        report
    }
}
