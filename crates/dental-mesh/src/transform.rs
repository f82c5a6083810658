//! Object transforms with explicit world-matrix freshness.
//!
//! Setters only record the new position, rotation or scale. The cached world
//! matrix is recomputed by [`Transform::update_matrix_world`], and reading it
//! while changes are pending is an error rather than a silently stale value.

use nalgebra::{Matrix4, Point3, UnitQuaternion, Vector3};

use crate::error::{DentalError, DentalResult};

/// Position, rotation and scale of an object with a cached world matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    position: Vector3<f64>,
    rotation: UnitQuaternion<f64>,
    scale: Vector3<f64>,
    matrix_world: Matrix4<f64>,
    dirty: bool,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    /// Identity transform, already fresh.
    pub fn identity() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            scale: Vector3::repeat(1.0),
            matrix_world: Matrix4::identity(),
            dirty: false,
        }
    }

    /// Fresh transform translated to `position`.
    pub fn from_position(position: Vector3<f64>) -> Self {
        let mut t = Self::identity();
        t.set_position(position);
        t.update_matrix_world();
        t
    }

    #[inline]
    pub fn position(&self) -> Vector3<f64> {
        self.position
    }

    #[inline]
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.rotation
    }

    #[inline]
    pub fn scale(&self) -> Vector3<f64> {
        self.scale
    }

    /// True if the cached matrix does not reflect the current components.
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.dirty
    }

    pub fn set_position(&mut self, position: Vector3<f64>) {
        self.position = position;
        self.dirty = true;
    }

    pub fn translate(&mut self, offset: Vector3<f64>) {
        self.position += offset;
        self.dirty = true;
    }

    pub fn set_rotation(&mut self, rotation: UnitQuaternion<f64>) {
        self.rotation = rotation;
        self.dirty = true;
    }

    pub fn set_scale(&mut self, scale: Vector3<f64>) {
        self.scale = scale;
        self.dirty = true;
    }

    /// Recompute the cached world matrix (translation * rotation * scale).
    pub fn update_matrix_world(&mut self) {
        self.matrix_world = self.compose();
        self.dirty = false;
    }

    fn compose(&self) -> Matrix4<f64> {
        Matrix4::new_translation(&self.position)
            * self.rotation.to_homogeneous()
            * Matrix4::new_nonuniform_scaling(&self.scale)
    }

    /// The cached world matrix. Fails with [`DentalError::StaleTransform`]
    /// if a setter ran since the last [`update_matrix_world`](Self::update_matrix_world).
    pub fn matrix_world(&self) -> DentalResult<&Matrix4<f64>> {
        if self.dirty {
            return Err(DentalError::StaleTransform);
        }
        Ok(&self.matrix_world)
    }

    /// Inverse of the world matrix, subject to the same freshness check.
    pub fn inverse_matrix_world(&self) -> DentalResult<Matrix4<f64>> {
        let m = self.matrix_world()?;
        m.try_inverse()
            .ok_or_else(|| DentalError::invalid_parameter("scale", "transform is singular"))
    }

    /// Map a local point to world space through the fresh matrix.
    pub fn to_world(&self, local: &Point3<f64>) -> DentalResult<Point3<f64>> {
        Ok(self.matrix_world()?.transform_point(local))
    }
}
