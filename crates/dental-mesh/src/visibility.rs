//! Is a world-space surface point the nearest surface along its camera ray?
//!
//! Two independent checks:
//! 1. Back-face rejection: the normal must face the viewer.
//! 2. Occlusion: no scene hit may lie strictly closer than the point itself,
//!    up to a tolerance that absorbs self-intersection noise.

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::scene::{Camera, Raycaster};

/// Which visibility checks a selection pass applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityStrategy {
    /// Select through the model.
    None,
    /// Normal test only.
    BackFaceOnly,
    /// Normal test plus occlusion raycast.
    #[default]
    FullRaycast,
}

/// Visibility tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityParams {
    /// Enable back-face rejection.
    pub back_face_culling: bool,

    /// Enable raycast occlusion.
    pub occlusion_test: bool,

    /// Points whose `dot(normal, view_dir)` falls below this are back-facing.
    pub back_face_threshold: f64,

    /// Distance slack for the occlusion test, in model units.
    /// Scans in millimeters work well between 1e-3 and 1e-1.
    pub occlusion_tolerance: f64,
}

impl Default for VisibilityParams {
    fn default() -> Self {
        Self {
            back_face_culling: true,
            occlusion_test: true,
            back_face_threshold: 0.0,
            occlusion_tolerance: 1e-2,
        }
    }
}

impl VisibilityParams {
    /// Params for a strategy, keeping default thresholds.
    pub fn for_strategy(strategy: VisibilityStrategy) -> Self {
        let (back_face_culling, occlusion_test) = match strategy {
            VisibilityStrategy::None => (false, false),
            VisibilityStrategy::BackFaceOnly => (true, false),
            VisibilityStrategy::FullRaycast => (true, true),
        };
        Self {
            back_face_culling,
            occlusion_test,
            ..Default::default()
        }
    }

    /// Tolerance scaled to a model's bounding diagonal (1e-4 of it, at least 1e-3).
    pub fn with_scale(mut self, model_diagonal: f64) -> Self {
        if model_diagonal.is_finite() && model_diagonal > 0.0 {
            self.occlusion_tolerance = (model_diagonal * 1e-4).max(1e-3);
        }
        self
    }

    pub fn strategy(&self) -> VisibilityStrategy {
        match (self.back_face_culling, self.occlusion_test) {
            (false, false) => VisibilityStrategy::None,
            (true, false) => VisibilityStrategy::BackFaceOnly,
            _ => VisibilityStrategy::FullRaycast,
        }
    }
}

/// Answers visibility queries against a camera and an optional raycaster.
pub struct VisibilityResolver<'a> {
    camera: &'a Camera,
    raycaster: Option<&'a dyn Raycaster>,
    params: VisibilityParams,
}

impl<'a> VisibilityResolver<'a> {
    pub fn new(
        camera: &'a Camera,
        raycaster: Option<&'a dyn Raycaster>,
        params: VisibilityParams,
    ) -> Self {
        Self {
            camera,
            raycaster,
            params,
        }
    }

    pub fn params(&self) -> &VisibilityParams {
        &self.params
    }

    /// True if no check is enabled, letting callers skip per-vertex work.
    pub fn is_passthrough(&self) -> bool {
        !self.params.back_face_culling && (!self.params.occlusion_test || self.raycaster.is_none())
    }

    /// Whether `point` (world space) is visible from the camera.
    ///
    /// A missing normal skips the back-face check. Degenerate input, such as a
    /// point at the camera position or non-finite coordinates, is reported as
    /// not visible.
    pub fn is_visible(&self, point: &Point3<f64>, normal: Option<&Vector3<f64>>) -> bool {
        if !point.coords.iter().all(|c| c.is_finite()) {
            return false;
        }

        if self.params.back_face_culling
            && let Some(n) = normal
            && !self.faces_viewer(point, n)
        {
            return false;
        }

        if self.params.occlusion_test
            && let Some(raycaster) = self.raycaster
        {
            return self.unoccluded(raycaster, point);
        }

        true
    }

    /// Back-face test alone.
    pub fn faces_viewer(&self, point: &Point3<f64>, normal: &Vector3<f64>) -> bool {
        let Some(view_dir) = self.camera.view_direction(point) else {
            return false;
        };
        normal.dot(&view_dir) >= self.params.back_face_threshold
    }

    fn unoccluded(&self, raycaster: &dyn Raycaster, point: &Point3<f64>) -> bool {
        let Some((ray, distance)) = self.camera.ray_to(point) else {
            return false;
        };
        if !(distance > 0.0) {
            return false;
        }
        let limit = distance - self.params.occlusion_tolerance;
        if limit <= 0.0 {
            return true;
        }
        raycaster.first_hit(&ray, limit).is_none()
    }
}
