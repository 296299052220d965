use std::sync::Arc;

use crate::camera::Camera;
use crate::clipper::Clipper2D;
use crate::scene::{Portal, Sector};

/// Everything a context needs to know about where it looks from.
///
/// Views are cheap to clone: the camera and clipper are shared until a
/// derived view replaces them.
#[derive(Clone)]
pub struct RenderView {
    camera: Arc<Camera>,
    clipper: Option<Arc<Clipper2D>>,
    this_sector: Option<Arc<dyn Sector>>,
    previous_sector: Option<Arc<dyn Sector>>,
    last_portal: Option<Arc<dyn Portal>>,
    view_width: u32,
    view_height: u32,
    graphics_width: u32,
    graphics_height: u32,
    frame_number: u64,
}

impl RenderView {
    pub fn new(camera: Camera, graphics_width: u32, graphics_height: u32) -> Self {
        Self {
            camera: Arc::new(camera),
            clipper: None,
            this_sector: None,
            previous_sector: None,
            last_portal: None,
            view_width: graphics_width,
            view_height: graphics_height,
            graphics_width,
            graphics_height,
            frame_number: 0,
        }
    }

    /// A child view sharing camera, clipper and sectors with this one.
    ///
    /// The parent is left untouched, so dropping the child restores it.
    pub fn create_render_context(&self) -> RenderView {
        self.clone()
    }

    /// A fresh view with the same sectors and graphics size but its own camera.
    pub fn with_camera(&self, camera: Camera) -> RenderView {
        RenderView {
            camera: Arc::new(camera),
            clipper: None,
            last_portal: None,
            ..self.clone()
        }
    }

    /// Makes the camera private to this view and returns it for editing.
    pub fn create_new_camera(&mut self) -> &mut Camera {
        Arc::make_mut(&mut self.camera)
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn shares_camera_with(&self, other: &RenderView) -> bool {
        Arc::ptr_eq(&self.camera, &other.camera)
    }

    pub fn clipper(&self) -> Option<&Clipper2D> {
        self.clipper.as_deref()
    }

    pub fn set_clipper(&mut self, clipper: Clipper2D) {
        self.clipper = Some(Arc::new(clipper));
    }

    pub fn clear_clipper(&mut self) {
        self.clipper = None;
    }

    pub fn this_sector(&self) -> Option<&Arc<dyn Sector>> {
        self.this_sector.as_ref()
    }

    pub fn set_this_sector(&mut self, sector: Option<Arc<dyn Sector>>) {
        self.this_sector = sector;
    }

    pub fn previous_sector(&self) -> Option<&Arc<dyn Sector>> {
        self.previous_sector.as_ref()
    }

    pub fn set_previous_sector(&mut self, sector: Option<Arc<dyn Sector>>) {
        self.previous_sector = sector;
    }

    pub fn last_portal(&self) -> Option<&Arc<dyn Portal>> {
        self.last_portal.as_ref()
    }

    pub fn set_last_portal(&mut self, portal: Option<Arc<dyn Portal>>) {
        self.last_portal = portal;
    }

    pub fn view_dimensions(&self) -> (u32, u32) {
        (self.view_width, self.view_height)
    }

    pub fn set_view_dimensions(&mut self, width: u32, height: u32) {
        self.view_width = width;
        self.view_height = height;
    }

    pub fn graphics_dimensions(&self) -> (u32, u32) {
        (self.graphics_width, self.graphics_height)
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn set_frame_number(&mut self, frame: u64) {
        self.frame_number = frame;
    }
}

impl std::fmt::Debug for RenderView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderView")
            .field("this_sector", &self.this_sector.as_ref().map(|s| s.name().to_owned()))
            .field("last_portal", &self.last_portal.as_ref().map(|p| p.name().to_owned()))
            .field("view", &(self.view_width, self.view_height))
            .field("frame", &self.frame_number)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portalis_core::math::{Box2, ReversibleTransform, Vec3};

    #[test]
    fn test_child_context_shares_camera_until_written() {
        let root = RenderView::new(Camera::default(), 320, 240);
        let mut child = root.create_render_context();
        assert!(child.shares_camera_with(&root));

        child
            .create_new_camera()
            .set_transform(ReversibleTransform::from_translation(Vec3::X));
        assert!(!child.shares_camera_with(&root));
        assert_eq!(root.camera().transform().origin(), Vec3::ZERO);
    }

    #[test]
    fn test_child_clipper_leaves_parent_alone() {
        let root = RenderView::new(Camera::default(), 320, 240);
        let mut child = root.create_render_context();
        child.set_clipper(Clipper2D::Box(Box2::new(0.0, 0.0, 10.0, 10.0)));
        child.set_view_dimensions(64, 64);
        assert!(root.clipper().is_none());
        assert_eq!(root.view_dimensions(), (320, 240));
        assert_eq!(child.graphics_dimensions(), (320, 240));
    }
}
