//! 2D screen-space clippers.

use portalis_core::math::{Box2, Vec2};

use crate::Ticks;
use crate::resource_cache::{GenericResourceCache, NoConstraint, ReuseConditionFlagged, ReuseFlag};

/// Convex clip region in pixel coordinates.
#[derive(Debug)]
pub enum Clipper2D {
    Box(Box2),
    /// Convex polygon; either winding is accepted.
    Polygon(Vec<Vec2>),
    /// A box whose storage slot is recycled once the clipper is dropped.
    Cached(CachedBoxClipper),
}

impl Clipper2D {
    pub fn bounds(&self) -> Box2 {
        match self {
            Clipper2D::Box(bounds) => *bounds,
            Clipper2D::Polygon(points) => Box2::from_points(points),
            Clipper2D::Cached(cached) => cached.bounds,
        }
    }

    /// Whether the clipper encloses a non-zero area.
    pub fn is_valid(&self) -> bool {
        match self {
            Clipper2D::Polygon(points) => points.len() >= 3 && signed_area(points).abs() > f32::EPSILON,
            _ => {
                let bounds = self.bounds();
                !bounds.is_empty() && bounds.width() > 0.0 && bounds.height() > 0.0
            }
        }
    }

    /// Outline of the clip region, counter-clockwise.
    pub fn vertices(&self) -> Vec<Vec2> {
        match self {
            Clipper2D::Polygon(points) => {
                let mut points = points.clone();
                if signed_area(&points) < 0.0 {
                    points.reverse();
                }
                points
            }
            _ => self.bounds().corners().to_vec(),
        }
    }

    /// Clips a polygon against this region (Sutherland-Hodgman).
    pub fn clip(&self, polygon: &[Vec2]) -> Vec<Vec2> {
        let edges = self.vertices();
        let mut output = polygon.to_vec();

        for i in 0..edges.len() {
            if output.is_empty() {
                break;
            }
            let a = edges[i];
            let b = edges[(i + 1) % edges.len()];
            let inside = |p: Vec2| (b - a).perp_dot(p - a) >= 0.0;

            let input = std::mem::take(&mut output);
            for j in 0..input.len() {
                let current = input[j];
                let previous = input[(j + input.len() - 1) % input.len()];
                match (inside(previous), inside(current)) {
                    (true, true) => output.push(current),
                    (true, false) => output.push(intersect(previous, current, a, b)),
                    (false, true) => {
                        output.push(intersect(previous, current, a, b));
                        output.push(current);
                    }
                    (false, false) => {}
                }
            }
        }

        output
    }
}

fn signed_area(points: &[Vec2]) -> f32 {
    let mut area = 0.0;
    for i in 0..points.len() {
        let j = (i + 1) % points.len();
        area += points[i].perp_dot(points[j]);
    }
    area * 0.5
}

fn intersect(p: Vec2, q: Vec2, a: Vec2, b: Vec2) -> Vec2 {
    let edge = b - a;
    let denom = edge.perp_dot(q - p);
    if denom.abs() <= f32::EPSILON {
        return q;
    }
    let t = edge.perp_dot(a - p) / denom;
    p + (q - p) * t
}

/// Box clipper living in a [`BoxClipperCache`] slot.
#[derive(Debug)]
pub struct CachedBoxClipper {
    slot: usize,
    bounds: Box2,
    release: ReuseFlag,
}

impl CachedBoxClipper {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for CachedBoxClipper {
    fn drop(&mut self) {
        self.release.mark_reusable();
    }
}

/// Arena of box clipper slots.
///
/// A slot only returns to the pool once the clipper handed out for it has
/// been dropped and the cache clock advanced.
pub struct BoxClipperCache {
    slots: Vec<Box2>,
    cache: GenericResourceCache<usize, NoConstraint, ReuseConditionFlagged>,
}

impl Default for BoxClipperCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxClipperCache {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            cache: GenericResourceCache::new(),
        }
    }

    pub fn acquire(&mut self, bounds: Box2) -> Clipper2D {
        let (slot, release) = match self.cache.query(&(), false) {
            Some(entry) => (entry.data, entry.aux.clone()),
            None => {
                let slot = self.slots.len();
                self.slots.push(Box2::empty());
                let entry = self.cache.add_active(slot, ());
                (slot, entry.aux.clone())
            }
        };

        self.slots[slot] = bounds;
        Clipper2D::Cached(CachedBoxClipper { slot, bounds, release })
    }

    /// Bounds last stored in `slot`.
    pub fn slot_bounds(&self, slot: usize) -> Option<Box2> {
        self.slots.get(slot).copied()
    }

    pub fn advance_time(&mut self, now: Ticks) {
        self.cache.advance_time(now);
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.cache.active_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_clip_against_box() {
        let clipper = Clipper2D::Box(Box2::new(0.0, 0.0, 10.0, 10.0));
        let triangle = [Vec2::new(-5.0, 5.0), Vec2::new(5.0, -5.0), Vec2::new(5.0, 5.0)];
        let clipped = clipper.clip(&triangle);
        assert!(clipped.len() >= 3);
        for p in &clipped {
            assert!(p.x >= -1e-4 && p.x <= 10.0 + 1e-4 && p.y >= -1e-4 && p.y <= 10.0 + 1e-4);
        }
    }

    #[test]
    fn test_clip_fully_outside_is_empty() {
        let clipper = Clipper2D::Polygon(vec![Vec2::new(0.0, 0.0), Vec2::new(4.0, 0.0), Vec2::new(0.0, 4.0)]);
        let square = Box2::new(10.0, 10.0, 12.0, 12.0).corners();
        assert!(clipper.clip(&square).is_empty());
    }

    #[test]
    fn test_clockwise_polygon_clips_like_ccw() {
        let cw = Clipper2D::Polygon(vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(0.0, 10.0),
            Vec2::new(10.0, 10.0),
            Vec2::new(10.0, 0.0),
        ]);
        let inside = Box2::new(2.0, 2.0, 4.0, 4.0).corners();
        assert_eq!(cw.clip(&inside).len(), 4);
    }

    #[test]
    fn test_degenerate_clippers_invalid() {
        assert!(!Clipper2D::Box(Box2::new(5.0, 5.0, 5.0, 9.0)).is_valid());
        assert!(!Clipper2D::Polygon(vec![Vec2::ZERO, Vec2::X]).is_valid());
        assert!(Clipper2D::Box(Box2::new(0.0, 0.0, 1.0, 1.0)).is_valid());
    }

    #[test]
    fn test_cached_slot_recycled_after_drop() {
        let mut cache = BoxClipperCache::new();
        let first = cache.acquire(Box2::new(0.0, 0.0, 8.0, 8.0));
        let second = cache.acquire(Box2::new(0.0, 0.0, 4.0, 4.0));
        assert_eq!(cache.slot_count(), 2);

        cache.advance_time(1);
        let third = cache.acquire(Box2::new(1.0, 1.0, 2.0, 2.0));
        assert_eq!(cache.slot_count(), 3);

        let reused_slot = match &first {
            Clipper2D::Cached(cached) => cached.slot(),
            _ => unreachable!(),
        };
        drop(first);
        cache.advance_time(2);
        let fourth = cache.acquire(Box2::new(0.0, 0.0, 16.0, 16.0));
        assert_eq!(cache.slot_count(), 3);
        match &fourth {
            Clipper2D::Cached(cached) => assert_eq!(cached.slot(), reused_slot),
            _ => unreachable!(),
        }
        assert_eq!(cache.slot_bounds(reused_slot), Some(Box2::new(0.0, 0.0, 16.0, 16.0)));
        drop((second, third));
    }
}
