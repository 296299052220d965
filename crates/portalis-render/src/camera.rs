use portalis_core::math::{Mat4, ReversibleTransform, Vec2, Vec3, Vec4};

/// A camera with a custom projection matrix.
///
/// The transform maps world space ("other") to camera space ("this"). The
/// projection maps camera space to normalized device coordinates with `y`
/// pointing up; screen pixels follow the same convention, with the origin in
/// the lower left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    transform: ReversibleTransform,
    projection: Mat4,
    inv_projection: Mat4,
    mirrored: bool,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(ReversibleTransform::IDENTITY, Mat4::IDENTITY)
    }
}

impl Camera {
    pub fn new(transform: ReversibleTransform, projection: Mat4) -> Self {
        Self {
            transform,
            projection,
            inv_projection: projection.inverse(),
            mirrored: false,
        }
    }

    /// Left-handed perspective camera at the world origin looking down +Z.
    pub fn perspective(fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self::new(
            ReversibleTransform::IDENTITY,
            Mat4::perspective_lh(fov_y_radians, aspect, near, far),
        )
    }

    pub fn transform(&self) -> &ReversibleTransform {
        &self.transform
    }

    pub fn transform_mut(&mut self) -> &mut ReversibleTransform {
        &mut self.transform
    }

    pub fn set_transform(&mut self, transform: ReversibleTransform) {
        self.transform = transform;
    }

    pub fn with_transform(mut self, transform: ReversibleTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn inv_projection(&self) -> Mat4 {
        self.inv_projection
    }

    pub fn set_projection(&mut self, projection: Mat4) {
        self.projection = projection;
        self.inv_projection = projection.inverse();
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    pub fn set_mirrored(&mut self, mirrored: bool) {
        self.mirrored = mirrored;
    }

    pub fn world_to_camera(&self) -> Mat4 {
        self.transform.to_mat4()
    }

    /// Projects a camera-space point to pixel coordinates on a
    /// `width`×`height` target. Returns `None` behind the eye.
    pub fn project(&self, point: Vec3, width: f32, height: f32) -> Option<Vec2> {
        let clip = self.projection * point.extend(1.0);
        if clip.w <= f32::EPSILON {
            return None;
        }
        let ndc = Vec2::new(clip.x, clip.y) / clip.w;
        Some((ndc + Vec2::ONE) * 0.5 * Vec2::new(width, height))
    }

    /// Camera-space point at `depth` that projects to `pixel` on a
    /// `width`×`height` target. `None` if the projection has no depth there.
    pub fn inv_project(&self, pixel: Vec2, depth: f32, width: f32, height: f32) -> Option<Vec3> {
        let ndc = pixel / Vec2::new(width.max(1.0), height.max(1.0)) * 2.0 - Vec2::ONE;
        let ray = self.inv_projection * Vec4::new(ndc.x, ndc.y, 0.0, 1.0);
        if ray.w.abs() <= f32::EPSILON {
            return None;
        }
        let ray = ray.truncate() / ray.w;
        if ray.z.abs() <= f32::EPSILON {
            return None;
        }
        Some(ray * (depth / ray.z))
    }

    /// Projects a world-space point to pixel coordinates.
    pub fn project_world(&self, point: Vec3, width: f32, height: f32) -> Option<Vec2> {
        self.project(self.transform.other_to_this(point), width, height)
    }
}
