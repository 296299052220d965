//! Lease-based cache of render-target textures.
//!
//! Textures are leased for a number of ticks. While leased they sit in the
//! in-use set and cannot be handed out again; once [`TextureCache::advance_frame`]
//! passes their death tick they move to the available set, which is kept
//! sorted by `(width, height)` so a linear scan finds the tightest fit first.

use bitflags::bitflags;
use portalis_test_utils::{GpuTexture, RenderContext};

use crate::Ticks;
use crate::error::{RenderError, RenderResult};

bitflags! {
    /// Allocation and matching policy of a [`TextureCache`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureCacheOptions: u32 {
        /// Round newly allocated textures up to power-of-two dimensions.
        const POWER_OF_TWO = 1 << 0;
        /// Only reuse textures whose size matches the request exactly.
        const EXACT_SIZE_MATCH = 1 << 1;
    }
}

/// Fixed properties of every texture a cache allocates.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureProperties {
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
    pub mipmapped: bool,
}

impl TextureProperties {
    /// A sampled colour target without mipmaps.
    pub fn render_target(format: wgpu::TextureFormat) -> Self {
        Self {
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            mipmapped: false,
        }
    }

    pub fn with_mipmaps(mut self, mipmapped: bool) -> Self {
        self.mipmapped = mipmapped;
        self
    }
}

/// Full mip chain length for a texture of the given size.
pub(crate) fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

#[derive(Debug)]
struct HeldTexture {
    texture: GpuTexture,
    real_width: u32,
    real_height: u32,
    death_tick: Ticks,
}

/// A texture handed out by [`TextureCache::query_unused_texture`].
#[derive(Debug, Clone)]
pub struct LeasedTexture {
    pub texture: GpuTexture,
    pub real_width: u32,
    pub real_height: u32,
}

/// Cache of same-format render-target textures.
#[derive(Debug)]
pub struct TextureCache {
    class: String,
    properties: TextureProperties,
    options: TextureCacheOptions,
    current_time: Ticks,
    in_use: Vec<HeldTexture>,
    available: Vec<HeldTexture>,
}

impl TextureCache {
    /// `class` labels the allocated textures so the renderer can group
    /// similar targets.
    pub fn new(class: impl Into<String>, properties: TextureProperties, options: TextureCacheOptions) -> Self {
        Self {
            class: class.into(),
            properties,
            options,
            current_time: 0,
            in_use: Vec::new(),
            available: Vec::new(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn options(&self) -> TextureCacheOptions {
        self.options
    }

    pub fn set_options(&mut self, options: TextureCacheOptions) {
        self.options = options;
    }

    pub fn properties(&self) -> &TextureProperties {
        &self.properties
    }

    /// Changing the properties only affects textures allocated afterwards,
    /// so the cache is cleared.
    pub fn set_properties(&mut self, properties: TextureProperties) {
        if self.properties != properties {
            self.properties = properties;
            self.clear();
        }
    }

    pub fn current_time(&self) -> Ticks {
        self.current_time
    }

    /// Leases a texture of at least (or, with `EXACT_SIZE_MATCH`, exactly)
    /// `width`×`height` until `current_time + lifetime`.
    pub fn query_unused_texture(
        &mut self,
        graphics: &dyn RenderContext,
        width: u32,
        height: u32,
        lifetime: Ticks,
    ) -> RenderResult<LeasedTexture> {
        let exact = self.options.contains(TextureCacheOptions::EXACT_SIZE_MATCH);
        let hit = self.available.iter().position(|held| {
            if exact {
                held.real_width == width && held.real_height == height
            } else {
                held.real_width >= width && held.real_height >= height
            }
        });

        let mut held = match hit {
            Some(index) => self.available.remove(index),
            None => self.allocate(graphics, width, height)?,
        };

        held.death_tick = self.current_time + lifetime;
        let leased = LeasedTexture {
            texture: held.texture.clone(),
            real_width: held.real_width,
            real_height: held.real_height,
        };
        self.in_use.push(held);
        Ok(leased)
    }

    fn allocate(&self, graphics: &dyn RenderContext, width: u32, height: u32) -> RenderResult<HeldTexture> {
        let (mut real_width, mut real_height) = (width.max(1), height.max(1));
        if self.options.contains(TextureCacheOptions::POWER_OF_TWO) {
            real_width = real_width.next_power_of_two();
            real_height = real_height.next_power_of_two();
        }

        let mip_level_count = if self.properties.mipmapped {
            mip_level_count(real_width, real_height)
        } else {
            1
        };

        let texture = graphics
            .create_texture(&wgpu::TextureDescriptor {
                label: Some(&self.class),
                size: wgpu::Extent3d {
                    width: real_width,
                    height: real_height,
                    depth_or_array_layers: 1,
                },
                mip_level_count,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: self.properties.format,
                usage: self.properties.usage,
                view_formats: &[],
            })
            .ok_or_else(|| RenderError::TextureAllocation {
                width: real_width,
                height: real_height,
                class: self.class.clone(),
            })?;

        tracing::debug!(
            "Texture cache '{}' allocated {}x{} for a {}x{} request",
            self.class,
            real_width,
            real_height,
            width,
            height
        );

        Ok(HeldTexture {
            texture,
            real_width,
            real_height,
            death_tick: 0,
        })
    }

    /// Moves every leased texture whose death tick lies before `now` back
    /// into the available set.
    pub fn advance_frame(&mut self, now: Ticks) {
        self.current_time = now;

        let mut index = 0;
        while index < self.in_use.len() {
            if now > self.in_use[index].death_tick {
                let held = self.in_use.swap_remove(index);
                let at = self
                    .available
                    .partition_point(|a| (a.real_width, a.real_height) <= (held.real_width, held.real_height));
                self.available.insert(at, held);
            } else {
                index += 1;
            }
        }
    }

    /// Drops all textures, leased or not.
    pub fn clear(&mut self) {
        self.in_use.clear();
        self.available.clear();
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn is_in_use(&self, texture: &GpuTexture) -> bool {
        self.in_use.iter().any(|held| held.texture.ptr_eq(texture))
    }

    pub fn is_available(&self, texture: &GpuTexture) -> bool {
        self.available.iter().any(|held| held.texture.ptr_eq(texture))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portalis_test_utils::MockRenderContext;

    fn cache(options: TextureCacheOptions) -> TextureCache {
        TextureCache::new(
            "target",
            TextureProperties::render_target(wgpu::TextureFormat::Rgba8Unorm),
            options,
        )
    }

    #[test]
    fn test_power_of_two_allocation() {
        let gfx = MockRenderContext::new();
        let mut cache = cache(TextureCacheOptions::POWER_OF_TWO);

        let leased = cache.query_unused_texture(&gfx, 100, 100, 1000).unwrap();
        assert_eq!((leased.real_width, leased.real_height), (128, 128));
        assert_eq!(leased.texture.width(), 128);

        let odd = cache.query_unused_texture(&gfx, 129, 3, 1000).unwrap();
        assert_eq!((odd.real_width, odd.real_height), (256, 4));
    }

    #[test]
    fn test_lease_expires_after_lifetime() {
        let gfx = MockRenderContext::new();
        let mut cache = cache(TextureCacheOptions::empty());
        cache.advance_frame(0);

        let leased = cache.query_unused_texture(&gfx, 64, 64, 500).unwrap();
        cache.advance_frame(400);
        assert!(cache.is_in_use(&leased.texture));
        assert!(!cache.is_available(&leased.texture));

        cache.advance_frame(600);
        assert!(!cache.is_in_use(&leased.texture));
        assert!(cache.is_available(&leased.texture));
    }

    #[test]
    fn test_leased_texture_not_handed_out_twice() {
        let gfx = MockRenderContext::new();
        let mut cache = cache(TextureCacheOptions::empty());

        let a = cache.query_unused_texture(&gfx, 32, 32, 10).unwrap();
        let b = cache.query_unused_texture(&gfx, 32, 32, 10).unwrap();
        assert!(!a.texture.ptr_eq(&b.texture));
        assert_eq!(gfx.count_texture_creates(), 2);

        cache.advance_frame(11);
        let c = cache.query_unused_texture(&gfx, 32, 32, 10).unwrap();
        assert!(c.texture.ptr_eq(&a.texture) || c.texture.ptr_eq(&b.texture));
        assert_eq!(gfx.count_texture_creates(), 2);
    }

    #[test]
    fn test_handle_never_in_both_sets() {
        let gfx = MockRenderContext::new();
        let mut cache = cache(TextureCacheOptions::empty());
        let mut leased = Vec::new();

        for step in 0..40u64 {
            let size = 16 + (step % 5) as u32 * 8;
            leased.push(cache.query_unused_texture(&gfx, size, size, step % 3).unwrap());
            cache.advance_frame(step);

            for lease in &leased {
                assert!(!(cache.is_in_use(&lease.texture) && cache.is_available(&lease.texture)));
            }
        }
    }

    #[test]
    fn test_exact_match_ignores_larger_textures() {
        let gfx = MockRenderContext::new();
        let mut cache = cache(TextureCacheOptions::EXACT_SIZE_MATCH);

        cache.query_unused_texture(&gfx, 256, 256, 0).unwrap();
        cache.advance_frame(1);
        assert_eq!(cache.available_count(), 1);

        let leased = cache.query_unused_texture(&gfx, 128, 128, 0).unwrap();
        assert_eq!((leased.real_width, leased.real_height), (128, 128));
        assert_eq!(gfx.count_texture_creates(), 2);
    }

    #[test]
    fn test_at_least_match_takes_first_fit_in_sorted_order() {
        let gfx = MockRenderContext::new();
        let mut cache = cache(TextureCacheOptions::empty());

        cache.query_unused_texture(&gfx, 300, 40, 0).unwrap();
        cache.query_unused_texture(&gfx, 200, 200, 0).unwrap();
        cache.query_unused_texture(&gfx, 100, 100, 0).unwrap();
        cache.advance_frame(1);
        assert_eq!(cache.available_count(), 3);

        let leased = cache.query_unused_texture(&gfx, 150, 30, 0).unwrap();
        assert_eq!((leased.real_width, leased.real_height), (200, 200));
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let gfx = MockRenderContext::new();
        gfx.fail_next_texture_creates(1);
        let mut cache = cache(TextureCacheOptions::empty());

        let err = cache.query_unused_texture(&gfx, 10, 10, 0).unwrap_err();
        assert!(matches!(err, RenderError::TextureAllocation { width: 10, height: 10, .. }));
        assert_eq!(cache.in_use_count(), 0);
    }

    #[test]
    fn test_clear_drops_everything() {
        let gfx = MockRenderContext::new();
        let mut cache = cache(TextureCacheOptions::empty());
        cache.query_unused_texture(&gfx, 8, 8, 0).unwrap();
        cache.query_unused_texture(&gfx, 8, 8, 100).unwrap();
        cache.advance_frame(1);

        cache.clear();
        assert_eq!(cache.in_use_count() + cache.available_count(), 0);
    }

    #[test]
    fn test_mip_level_count() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 64), 9);
        assert_eq!(mip_level_count(100, 3), 7);
    }
}
