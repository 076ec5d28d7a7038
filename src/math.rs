//! Types, aliases and helper operations for doing math with `ultraviolet`.
pub use ultraviolet as uv;

pub type Vec3 = uv::DVec3;
/// Column-major 3x3 matrix, used for per-vertex Hessian blocks.
pub type Mat3 = uv::DMat3;

/// Get the `i`th component of a vector (0 = x, 1 = y, 2 = z).
#[inline]
pub fn component(v: Vec3, i: usize) -> f64 {
    match i {
        0 => v.x,
        1 => v.y,
        _ => v.z,
    }
}

/// Get the entry of a matrix at the given row and column.
#[inline]
pub fn entry(m: &Mat3, row: usize, col: usize) -> f64 {
    component(m.cols[col], row)
}

/// The outer product `a * b^T`.
#[inline]
pub fn outer(a: Vec3, b: Vec3) -> Mat3 {
    Mat3::new(a * b.x, a * b.y, a * b.z)
}

/// Multiply every entry of a matrix by a scalar.
#[inline]
pub fn scaled(m: &Mat3, s: f64) -> Mat3 {
    Mat3::new(m.cols[0] * s, m.cols[1] * s, m.cols[2] * s)
}

/// Largest absolute component of a vector.
#[inline]
pub fn abs_max(v: Vec3) -> f64 {
    v.x.abs().max(v.y.abs()).max(v.z.abs())
}

/// An axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl Aabb {
    /// A box that contains nothing. Extending it with a point gives a box around that point.
    pub fn empty() -> Self {
        Self {
            min: Vec3::broadcast(f64::INFINITY),
            max: Vec3::broadcast(f64::NEG_INFINITY),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Grow the box to contain the given point.
    #[inline]
    pub fn extend(&mut self, p: Vec3) {
        self.min = Vec3::new(self.min.x.min(p.x), self.min.y.min(p.y), self.min.z.min(p.z));
        self.max = Vec3::new(self.max.x.max(p.x), self.max.y.max(p.y), self.max.z.max(p.z));
    }

    /// The smallest box containing both boxes.
    #[inline]
    pub fn merged(self, other: Aabb) -> Aabb {
        let mut ret = self;
        if !other.is_empty() {
            ret.extend(other.min);
            ret.extend(other.max);
        }
        ret
    }

    pub fn extents(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::zero()
        } else {
            self.max - self.min
        }
    }
}
