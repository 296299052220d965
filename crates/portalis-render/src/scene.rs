//! Interfaces the traversal consumes from the scene graph.
//!
//! Visibility culling, mesh objects and portal geometry live outside this
//! crate; the render manager only sees them through these traits.

use std::sync::Arc;

use bitflags::bitflags;
use portalis_core::math::{Plane3, ReversibleTransform, Vec2, Vec3};

use crate::render_mesh::{Material, RenderMesh, RenderPriority};
use crate::render_view::RenderView;

/// Visit limit for portals that don't set their own.
pub const DEFAULT_MAX_SECTOR_VISIT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectorId(pub u64);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PortalFlags: u32 {
        /// Clip geometry in the destination sector against the portal plane.
        const CLIP_DEST = 1 << 0;
        /// Clip objects straddling the portal.
        const CLIP_STRADDLING = 1 << 1;
        /// Fill the depth buffer behind the portal.
        const ZFILL = 1 << 2;
        const MIRROR = 1 << 3;
        /// Needs floating-point precision handling.
        const FLOAT = 1 << 4;
        /// Looking through the portal transforms space.
        const WARP = 1 << 5;
    }
}

pub trait Sector: Send + Sync {
    fn id(&self) -> SectorId;

    fn name(&self) -> &str;

    /// Meshes visible from `view`, as decided by the sector's culler.
    fn visible_meshes(&self, view: &RenderView) -> Vec<Arc<dyn MeshWrapper>>;
}

pub trait Portal: Send + Sync {
    fn name(&self) -> &str;

    fn flags(&self) -> PortalFlags;

    /// Resolves the destination sector. `false` if it is unavailable.
    fn complete_sector(&self, view: &RenderView) -> bool;

    fn sector(&self) -> Option<Arc<dyn Sector>>;

    /// Object-space warp from this side of the portal to the destination.
    fn warp(&self) -> ReversibleTransform;

    fn material(&self) -> Option<Arc<Material>>;

    fn world_plane(&self) -> Plane3;

    fn world_vertices(&self) -> Vec<Vec3>;

    /// How often the destination sector may be on the traversal stack
    /// before this portal is skipped; `None` uses the configured default.
    fn maximum_sector_visit(&self) -> Option<u32> {
        None
    }

    /// World-space warp for a portal mesh placed by `movable`.
    fn object_to_world(&self, movable: &ReversibleTransform) -> ReversibleTransform {
        movable.inverse() * self.warp() * *movable
    }

    /// Applies a world-space warp to a camera transform.
    fn warp_space(&self, warp_world: &ReversibleTransform, camera: &mut ReversibleTransform, mirror: &mut bool) {
        *camera = *camera * warp_world.inverse();
        if self.flags().contains(PortalFlags::MIRROR) {
            *mirror = !*mirror;
        }
    }
}

/// The portals of one portal-carrying mesh.
pub trait PortalContainer: Send + Sync {
    fn portal_count(&self) -> usize;

    fn total_vertex_count(&self) -> usize;

    fn portal(&self, index: usize) -> Arc<dyn Portal>;

    /// Writes every portal's clipped screen polygon (pixels) and camera-space
    /// vertices back to back, and each portal's vertex count into `counts`.
    fn compute_screen_polygons(
        &self,
        view: &RenderView,
        verts2d: &mut [Vec2],
        verts3d: &mut [Vec3],
        counts: &mut [usize],
        screen_width: u32,
        screen_height: u32,
    );
}

/// A placed mesh object.
pub trait MeshWrapper: Send + Sync {
    fn name(&self) -> &str;

    fn render_priority(&self) -> RenderPriority;

    fn full_transform(&self) -> ReversibleTransform;

    fn render_meshes(&self, view: &RenderView, frame: u64) -> Vec<Arc<RenderMesh>>;

    fn portal_container(&self) -> Option<Arc<dyn PortalContainer>> {
        None
    }
}
