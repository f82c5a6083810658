//! Mesh-local points to viewport pixels.
//!
//! local -> world (model matrix) -> clip (view-projection) -> NDC -> pixels.

use nalgebra::{Matrix4, Point3, Vector4};

use crate::error::DentalResult;
use crate::scene::{Camera, Viewport};
use crate::transform::Transform;

/// A projected vertex. `x`/`y` are pixels from the viewport's top-left,
/// `depth` is the NDC depth in [-1, 1] for points inside the frustum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedVertex {
    pub x: f64,
    pub y: f64,
    pub depth: f64,
}

/// Precomputed model-view-projection chain for one object and camera.
#[derive(Debug, Clone)]
pub struct ScreenProjector {
    model: Matrix4<f64>,
    view_projection: Matrix4<f64>,
    mvp: Matrix4<f64>,
    viewport: Viewport,
}

impl ScreenProjector {
    /// Build from an explicit model matrix.
    pub fn new(model: Matrix4<f64>, camera: &Camera, viewport: Viewport) -> Self {
        let view_projection = camera.view_projection();
        Self {
            model,
            view_projection,
            mvp: view_projection * model,
            viewport,
        }
    }

    /// Build from an object transform. Fails if the transform has pending changes,
    /// which would otherwise project against last frame's matrix.
    pub fn for_transform(
        transform: &Transform,
        camera: &Camera,
        viewport: Viewport,
    ) -> DentalResult<Self> {
        Ok(Self::new(*transform.matrix_world()?, camera, viewport))
    }

    pub fn model_matrix(&self) -> &Matrix4<f64> {
        &self.model
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    /// Local point to world space.
    #[inline]
    pub fn to_world(&self, local: &Point3<f64>) -> Point3<f64> {
        self.model.transform_point(local)
    }

    /// Project a mesh-local point. `None` for points behind the camera
    /// or non-finite input.
    pub fn project(&self, local: &Point3<f64>) -> Option<ProjectedVertex> {
        self.project_with(&self.mvp, local)
    }

    /// Project a world-space point, bypassing the model matrix.
    pub fn project_world(&self, world: &Point3<f64>) -> Option<ProjectedVertex> {
        self.project_with(&self.view_projection, world)
    }

    fn project_with(&self, matrix: &Matrix4<f64>, p: &Point3<f64>) -> Option<ProjectedVertex> {
        let clip = matrix * Vector4::new(p.x, p.y, p.z, 1.0);
        if !(clip.w > 1e-12) || !clip.iter().all(|c| c.is_finite()) {
            return None;
        }
        let ndc_x = clip.x / clip.w;
        let ndc_y = clip.y / clip.w;
        let depth = clip.z / clip.w;
        let (x, y) = self.viewport.from_ndc(ndc_x, ndc_y);
        Some(ProjectedVertex { x, y, depth })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DentalError;
    use nalgebra::Vector3;

    fn front_camera() -> Camera {
        Camera::perspective(Point3::new(0.0, 0.0, 10.0), Point3::origin(), 1.0)
    }

    #[test]
    fn test_center_projects_to_viewport_center() {
        let p = ScreenProjector::new(Matrix4::identity(), &front_camera(), Viewport::new(400.0, 400.0));
        let v = p.project(&Point3::origin()).expect("in front");
        assert!((v.x - 200.0).abs() < 1e-9);
        assert!((v.y - 200.0).abs() < 1e-9);
        assert!(v.depth > -1.0 && v.depth < 1.0);
    }

    #[test]
    fn test_screen_y_grows_downward() {
        let p = ScreenProjector::new(Matrix4::identity(), &front_camera(), Viewport::new(400.0, 400.0));
        let up = p.project(&Point3::new(0.0, 1.0, 0.0)).expect("in front");
        let right = p.project(&Point3::new(1.0, 0.0, 0.0)).expect("in front");
        assert!(up.y < 200.0);
        assert!(right.x > 200.0);
    }

    #[test]
    fn test_behind_camera_is_none() {
        let p = ScreenProjector::new(Matrix4::identity(), &front_camera(), Viewport::new(400.0, 400.0));
        assert!(p.project(&Point3::new(0.0, 0.0, 20.0)).is_none());
    }

    #[test]
    fn test_model_matrix_applied() {
        let camera = front_camera();
        let vp = Viewport::new(400.0, 400.0);
        let transform = Transform::from_position(Vector3::new(1.0, 0.0, 0.0));
        let p = ScreenProjector::for_transform(&transform, &camera, vp).expect("fresh");
        let moved = p.project(&Point3::origin()).expect("in front");
        let direct = ScreenProjector::new(Matrix4::identity(), &camera, vp)
            .project(&Point3::new(1.0, 0.0, 0.0))
            .expect("in front");
        assert!((moved.x - direct.x).abs() < 1e-9);
    }

    #[test]
    fn test_stale_transform_rejected() {
        let mut transform = Transform::identity();
        transform.translate(Vector3::new(0.0, 1.0, 0.0));
        let result =
            ScreenProjector::for_transform(&transform, &front_camera(), Viewport::new(10.0, 10.0));
        assert!(matches!(result, Err(DentalError::StaleTransform)));
    }

    #[test]
    fn test_viewport_offset() {
        let vp = Viewport {
            x: 100.0,
            y: 50.0,
            width: 200.0,
            height: 200.0,
        };
        let p = ScreenProjector::new(Matrix4::identity(), &front_camera(), vp);
        let v = p.project(&Point3::origin()).expect("in front");
        assert!((v.x - 200.0).abs() < 1e-9);
        assert!((v.y - 150.0).abs() < 1e-9);
    }
}
