//! Math types for portal traversal.
//!
//! Vector and matrix types come straight from [`glam`]. On top of those this
//! module adds the few geometric primitives the render manager needs: an
//! axis-aligned 2D box for screen-space bounds, a 3D plane, and a reversible
//! rigid transform that keeps both directions of a space change around.
//!
//! [`glam`]: https://docs.rs/glam

pub use glam::*;

use std::ops::Mul;

/// Axis-aligned 2D bounding box.
///
/// An empty box has `min > max`; adding the first point makes it degenerate
/// (zero-sized) at that point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Box2 {
    pub min: Vec2,
    pub max: Vec2,
}

impl Box2 {
    pub const fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self {
            min: Vec2::new(min_x, min_y),
            max: Vec2::new(max_x, max_y),
        }
    }

    pub const fn empty() -> Self {
        Self {
            min: Vec2::splat(f32::INFINITY),
            max: Vec2::splat(f32::NEG_INFINITY),
        }
    }

    /// Bounding box of `points`, or an empty box if there are none.
    pub fn from_points(points: &[Vec2]) -> Self {
        let mut bounds = Self::empty();
        for point in points {
            bounds.add_point(*point);
        }
        bounds
    }

    pub fn add_point(&mut self, point: Vec2) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y
    }

    pub fn width(&self) -> f32 {
        (self.max.x - self.min.x).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.max.y - self.min.y).max(0.0)
    }

    pub fn contains(&self, point: Vec2) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Corners in counter-clockwise order starting at `min`.
    pub fn corners(&self) -> [Vec2; 4] {
        [
            self.min,
            Vec2::new(self.max.x, self.min.y),
            self.max,
            Vec2::new(self.min.x, self.max.y),
        ]
    }
}

/// Plane in Hessian normal form: `normal · p + d = 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane3 {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane3 {
    pub const fn new(normal: Vec3, d: f32) -> Self {
        Self { normal, d }
    }

    /// Plane through `point` facing `normal`.
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Self {
        let normal = normal.normalize_or_zero();
        Self {
            normal,
            d: -normal.dot(point),
        }
    }

    /// Signed distance (scaled by the normal's length) of `point`.
    pub fn classify(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }
}

/// A rigid transform between an "other" space and "this" space.
///
/// `other_to_this(v) = o2t * (v - origin)`, and `origin` is the position of
/// this space's origin expressed in the other space. The inverse matrix is
/// stored alongside so both directions are cheap.
///
/// For a camera, "other" is world space and "this" is camera space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReversibleTransform {
    o2t: Mat3,
    t2o: Mat3,
    origin: Vec3,
}

impl Default for ReversibleTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl ReversibleTransform {
    pub const IDENTITY: Self = Self {
        o2t: Mat3::IDENTITY,
        t2o: Mat3::IDENTITY,
        origin: Vec3::ZERO,
    };

    /// Builds a transform from its other→this matrix and origin.
    ///
    /// Returns `None` if the matrix is singular.
    pub fn new(o2t: Mat3, origin: Vec3) -> Option<Self> {
        let det = o2t.determinant();
        if det.abs() <= f32::EPSILON {
            return None;
        }
        Some(Self {
            o2t,
            t2o: o2t.inverse(),
            origin,
        })
    }

    /// Builds a transform when both matrices are already known.
    pub const fn from_parts(o2t: Mat3, t2o: Mat3, origin: Vec3) -> Self {
        Self { o2t, t2o, origin }
    }

    pub fn from_translation(origin: Vec3) -> Self {
        Self {
            origin,
            ..Self::IDENTITY
        }
    }

    /// A camera at `eye` looking at `target`, left-handed with +Z forward.
    pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Self {
        let forward = (target - eye).normalize_or_zero();
        let right = up.cross(forward).normalize_or_zero();
        let up = forward.cross(right);
        // Rows are the camera axes expressed in world space.
        let o2t = Mat3::from_cols(right, up, forward).transpose();
        Self {
            o2t,
            t2o: o2t.transpose(),
            origin: eye,
        }
    }

    pub fn o2t(&self) -> Mat3 {
        self.o2t
    }

    pub fn t2o(&self) -> Mat3 {
        self.t2o
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn set_origin(&mut self, origin: Vec3) {
        self.origin = origin;
    }

    pub fn other_to_this(&self, v: Vec3) -> Vec3 {
        self.o2t * (v - self.origin)
    }

    pub fn this_to_other(&self, v: Vec3) -> Vec3 {
        self.t2o * v + self.origin
    }

    /// Rotates a direction from other space into this space.
    pub fn other_to_this_relative(&self, v: Vec3) -> Vec3 {
        self.o2t * v
    }

    pub fn this_to_other_relative(&self, v: Vec3) -> Vec3 {
        self.t2o * v
    }

    pub fn inverse(&self) -> Self {
        Self {
            o2t: self.t2o,
            t2o: self.o2t,
            origin: -(self.o2t * self.origin),
        }
    }

    /// Whether the transform flips handedness.
    pub fn is_mirrored(&self) -> bool {
        self.o2t.determinant() < 0.0
    }

    /// The other→this mapping as a homogeneous matrix.
    pub fn to_mat4(&self) -> Mat4 {
        let translation = -(self.o2t * self.origin);
        Mat4::from_cols(
            self.o2t.x_axis.extend(0.0),
            self.o2t.y_axis.extend(0.0),
            self.o2t.z_axis.extend(0.0),
            translation.extend(1.0),
        )
    }
}

/// Composition: `(a * b).other_to_this(v) == a.other_to_this(b.other_to_this(v))`.
impl Mul for ReversibleTransform {
    type Output = ReversibleTransform;

    fn mul(self, rhs: ReversibleTransform) -> ReversibleTransform {
        ReversibleTransform {
            o2t: self.o2t * rhs.o2t,
            t2o: rhs.t2o * self.t2o,
            origin: rhs.this_to_other(self.origin),
        }
    }
}

/// Builds a matrix from row-major values, matching how projection matrices
/// are usually written down.
#[rustfmt::skip]
pub fn mat4_from_rows(
    m11: f32, m12: f32, m13: f32, m14: f32,
    m21: f32, m22: f32, m23: f32, m24: f32,
    m31: f32, m32: f32, m33: f32, m34: f32,
    m41: f32, m42: f32, m43: f32, m44: f32,
) -> Mat4 {
    Mat4::from_cols_array(&[
        m11, m21, m31, m41,
        m12, m22, m32, m42,
        m13, m23, m33, m43,
        m14, m24, m34, m44,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn test_box2_from_points() {
        let bounds = Box2::from_points(&[Vec2::new(3.0, 1.0), Vec2::new(-1.0, 4.0), Vec2::new(2.0, 2.0)]);
        assert_eq!(bounds.min, Vec2::new(-1.0, 1.0));
        assert_eq!(bounds.max, Vec2::new(3.0, 4.0));
        assert_eq!(bounds.width(), 4.0);
        assert_eq!(bounds.height(), 3.0);
    }

    #[test]
    fn test_box2_empty() {
        let bounds = Box2::from_points(&[]);
        assert!(bounds.is_empty());
        assert_eq!(bounds.width(), 0.0);
    }

    #[test]
    fn test_plane_classify() {
        let plane = Plane3::from_point_normal(Vec3::new(0.0, 0.0, 5.0), Vec3::Z);
        assert!(plane.classify(Vec3::new(0.0, 0.0, 6.0)) > 0.0);
        assert!(plane.classify(Vec3::new(0.0, 0.0, 4.0)) < 0.0);
    }

    #[test]
    fn test_transform_round_trip() {
        let xf = ReversibleTransform::new(Mat3::from_rotation_y(0.7), Vec3::new(1.0, 2.0, 3.0)).unwrap();
        let v = Vec3::new(-4.0, 0.5, 9.0);
        assert!(approx(xf.this_to_other(xf.other_to_this(v)), v));
        assert!(approx(xf.inverse().other_to_this(v), xf.this_to_other(v)));
    }

    #[test]
    fn test_transform_composition_order() {
        let a = ReversibleTransform::new(Mat3::from_rotation_x(0.3), Vec3::new(0.0, 1.0, 0.0)).unwrap();
        let b = ReversibleTransform::new(Mat3::from_rotation_z(-1.1), Vec3::new(2.0, 0.0, -1.0)).unwrap();
        let v = Vec3::new(1.0, 1.0, 1.0);
        assert!(approx((a * b).other_to_this(v), a.other_to_this(b.other_to_this(v))));
        assert!(approx((a * b).this_to_other(v), b.this_to_other(a.this_to_other(v))));
    }

    #[test]
    fn test_transform_to_mat4_matches_other_to_this() {
        let xf = ReversibleTransform::new(Mat3::from_rotation_y(1.2), Vec3::new(5.0, -2.0, 0.5)).unwrap();
        let v = Vec3::new(0.25, 3.0, -7.0);
        assert!(approx(xf.to_mat4().transform_point3(v), xf.other_to_this(v)));
    }

    #[test]
    fn test_singular_transform_rejected() {
        assert!(ReversibleTransform::new(Mat3::ZERO, Vec3::ZERO).is_none());
    }

    #[test]
    fn test_look_at_puts_target_on_forward_axis() {
        let xf = ReversibleTransform::look_at(Vec3::new(0.0, 0.0, -10.0), Vec3::ZERO, Vec3::Y);
        assert!(approx(xf.other_to_this(Vec3::ZERO), Vec3::new(0.0, 0.0, 10.0)));
    }

    #[test]
    fn test_mat4_from_rows_layout() {
        let m = mat4_from_rows(
            1.0, 0.0, 0.0, 7.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        assert_eq!(m.transform_point3(Vec3::ZERO), Vec3::new(7.0, 0.0, 0.0));
    }
}
