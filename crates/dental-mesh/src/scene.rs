//! Camera, viewport and ray-queryable scene.
//!
//! The selection and visibility code talks to the scene only through the
//! [`Raycaster`] trait, so tests can substitute a mock without any renderer.

use nalgebra::{Isometry3, Matrix4, Orthographic3, Perspective3, Point3, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bvh::TriangleBvh;
use crate::error::{DentalError, DentalResult};
use crate::transform::Transform;
use crate::types::{Aabb, Mesh};

/// Camera projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Projection {
    /// Vertical field of view in radians.
    Perspective { fov_y: f64, near: f64, far: f64 },
    /// Half-height of the view volume in world units.
    Orthographic {
        half_height: f64,
        near: f64,
        far: f64,
    },
}

/// A look-at camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub position: Point3<f64>,
    pub target: Point3<f64>,
    pub up: Vector3<f64>,
    pub projection: Projection,
    /// Width over height; normally taken from the viewport.
    pub aspect: f64,
}

impl Camera {
    /// Perspective camera with a 50 degree vertical field of view.
    pub fn perspective(position: Point3<f64>, target: Point3<f64>, aspect: f64) -> Self {
        Self {
            position,
            target,
            up: Vector3::y(),
            projection: Projection::Perspective {
                fov_y: 50f64.to_radians(),
                near: 0.1,
                far: 2000.0,
            },
            aspect,
        }
    }

    /// Orthographic camera showing `half_height` world units above and below the target.
    pub fn orthographic(
        position: Point3<f64>,
        target: Point3<f64>,
        half_height: f64,
        aspect: f64,
    ) -> Self {
        Self {
            position,
            target,
            up: Vector3::y(),
            projection: Projection::Orthographic {
                half_height,
                near: 0.1,
                far: 2000.0,
            },
            aspect,
        }
    }

    /// Unit vector from the camera toward its target.
    pub fn forward(&self) -> Vector3<f64> {
        (self.target - self.position)
            .try_normalize(1e-12)
            .unwrap_or_else(|| -Vector3::z())
    }

    /// World-to-camera matrix.
    pub fn view_matrix(&self) -> Matrix4<f64> {
        Isometry3::look_at_rh(&self.position, &self.target, &self.up).to_homogeneous()
    }

    /// Camera-to-clip matrix.
    pub fn projection_matrix(&self) -> Matrix4<f64> {
        match self.projection {
            Projection::Perspective { fov_y, near, far } => {
                Perspective3::new(self.aspect, fov_y, near, far).to_homogeneous()
            }
            Projection::Orthographic {
                half_height,
                near,
                far,
            } => {
                let hw = half_height * self.aspect;
                Orthographic3::new(-hw, hw, -half_height, half_height, near, far).to_homogeneous()
            }
        }
    }

    pub fn view_projection(&self) -> Matrix4<f64> {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn is_orthographic(&self) -> bool {
        matches!(self.projection, Projection::Orthographic { .. })
    }

    /// Ray from the eye through a point given in normalized device coordinates.
    pub fn ray_through_ndc(&self, ndc_x: f64, ndc_y: f64) -> Option<Ray> {
        let inv = self.view_projection().try_inverse()?;
        let unproject = |z: f64| {
            let h = inv * Vector4::new(ndc_x, ndc_y, z, 1.0);
            (h.w.abs() > 1e-15).then(|| Point3::new(h.x / h.w, h.y / h.w, h.z / h.w))
        };
        let near = unproject(-1.0)?;
        let far = unproject(1.0)?;
        let origin = if self.is_orthographic() {
            near
        } else {
            self.position
        };
        Ray::new(origin, far - near)
    }

    /// Ray from the camera toward `point`, with the distance at which it reaches the point.
    ///
    /// For orthographic cameras the ray runs parallel to the view direction
    /// and starts on the camera plane.
    pub fn ray_to(&self, point: &Point3<f64>) -> Option<(Ray, f64)> {
        if self.is_orthographic() {
            let forward = self.forward();
            let depth = (point - self.position).dot(&forward);
            let origin = point - forward * depth;
            Some((Ray::new(origin, forward)?, depth))
        } else {
            let to_point = point - self.position;
            let distance = to_point.norm();
            Some((Ray::new(self.position, to_point)?, distance))
        }
    }

    /// Direction from `point` toward the viewer.
    pub fn view_direction(&self, point: &Point3<f64>) -> Option<Vector3<f64>> {
        if self.is_orthographic() {
            Some(-self.forward())
        } else {
            (self.position - point).try_normalize(1e-12)
        }
    }
}

/// Pixel rectangle the camera renders into; origin at the top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
        }
    }

    pub fn aspect(&self) -> f64 {
        if self.height > 0.0 {
            self.width / self.height
        } else {
            1.0
        }
    }

    /// Pixel coordinates to NDC.
    pub fn to_ndc(&self, px: f64, py: f64) -> (f64, f64) {
        (
            (px - self.x) / self.width * 2.0 - 1.0,
            1.0 - (py - self.y) / self.height * 2.0,
        )
    }

    /// NDC to pixel coordinates.
    pub fn from_ndc(&self, ndc_x: f64, ndc_y: f64) -> (f64, f64) {
        (
            (ndc_x + 1.0) * 0.5 * self.width + self.x,
            (1.0 - ndc_y) * 0.5 * self.height + self.y,
        )
    }
}

/// A ray with unit direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Point3<f64>,
    pub direction: Vector3<f64>,
}

impl Ray {
    /// Normalizes `direction`; `None` for a zero or non-finite direction.
    pub fn new(origin: Point3<f64>, direction: Vector3<f64>) -> Option<Self> {
        if !origin.coords.iter().all(|c| c.is_finite()) {
            return None;
        }
        let direction = direction.try_normalize(1e-12)?;
        direction
            .iter()
            .all(|c| c.is_finite())
            .then_some(Self { origin, direction })
    }

    #[inline]
    pub fn at(&self, t: f64) -> Point3<f64> {
        self.origin + self.direction * t
    }
}

/// Identifier of an object in a [`Scene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// One ray/surface intersection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// World-space distance from the ray origin.
    pub distance: f64,
    pub point: Point3<f64>,
    pub object: ObjectId,
    pub face: usize,
}

/// Anything that can answer ray queries in world space.
pub trait Raycaster: Send + Sync {
    /// All hits within `max_distance`, nearest first.
    fn intersect(&self, ray: &Ray, max_distance: f64) -> Vec<RayHit>;

    /// Nearest hit within `max_distance`.
    fn first_hit(&self, ray: &Ray, max_distance: f64) -> Option<RayHit> {
        self.intersect(ray, max_distance).into_iter().next()
    }
}

/// A mesh placed in the scene with its acceleration structure.
#[derive(Debug)]
pub struct SceneObject {
    pub id: ObjectId,
    pub mesh: Mesh,
    pub visible: bool,
    transform: Transform,
    inverse: Matrix4<f64>,
    bvh: TriangleBvh,
}

impl SceneObject {
    fn new(id: ObjectId, mesh: Mesh, transform: &Transform) -> DentalResult<Self> {
        let inverse = transform.inverse_matrix_world()?;
        let bvh = TriangleBvh::from_mesh(&mesh);
        Ok(Self {
            id,
            mesh,
            visible: true,
            transform: transform.clone(),
            inverse,
            bvh,
        })
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// World-space bounds.
    pub fn world_bounds(&self) -> Option<Aabb> {
        let local = self.bvh.bounds()?;
        let m = self.transform.matrix_world().ok()?;
        Some(local.transformed(m))
    }

    fn local_ray(&self, ray: &Ray) -> (Point3<f64>, Vector3<f64>) {
        // Not renormalized: t along the local direction equals world distance
        let origin = self.inverse.transform_point(&ray.origin);
        let direction = self.inverse.transform_vector(&ray.direction);
        (origin, direction)
    }

    fn hit(&self, ray: &Ray, t: f64, face: usize) -> RayHit {
        RayHit {
            distance: t,
            point: ray.at(t),
            object: self.id,
            face,
        }
    }
}

/// Collection of meshes answering world-space ray queries.
#[derive(Debug, Default)]
pub struct Scene {
    objects: Vec<SceneObject>,
    next_id: u64,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mesh. The transform must be fresh.
    pub fn add(&mut self, mesh: Mesh, transform: &Transform) -> DentalResult<ObjectId> {
        let id = ObjectId(self.next_id);
        let object = SceneObject::new(id, mesh, transform)?;
        self.next_id += 1;
        debug!(
            object = id.0,
            triangles = object.bvh.triangle_count(),
            "Added scene object"
        );
        self.objects.push(object);
        Ok(id)
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<SceneObject> {
        let pos = self.objects.iter().position(|o| o.id == id)?;
        Some(self.objects.remove(pos))
    }

    pub fn get(&self, id: ObjectId) -> Option<&SceneObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &SceneObject> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn set_visible(&mut self, id: ObjectId, visible: bool) -> bool {
        match self.objects.iter_mut().find(|o| o.id == id) {
            Some(o) => {
                o.visible = visible;
                true
            }
            None => false,
        }
    }

    /// Replace an object's transform. The transform must be fresh.
    pub fn set_transform(&mut self, id: ObjectId, transform: &Transform) -> DentalResult<()> {
        let inverse = transform.inverse_matrix_world()?;
        let object = self
            .objects
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| DentalError::invalid_parameter("object", format!("{:?}", id)))?;
        object.transform = transform.clone();
        object.inverse = inverse;
        Ok(())
    }

    /// Swap an object's geometry. The new BVH is built before the old one is
    /// dropped, so no query ever observes a half-replaced object.
    pub fn replace_geometry(&mut self, id: ObjectId, mesh: Mesh) -> DentalResult<()> {
        let bvh = TriangleBvh::from_mesh(&mesh);
        let object = self
            .objects
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| DentalError::invalid_parameter("object", format!("{:?}", id)))?;
        object.mesh = mesh;
        object.bvh = bvh;
        Ok(())
    }
}

impl Raycaster for Scene {
    fn intersect(&self, ray: &Ray, max_distance: f64) -> Vec<RayHit> {
        let mut hits: Vec<RayHit> = self
            .objects
            .iter()
            .filter(|o| o.visible)
            .flat_map(|o| {
                let (origin, direction) = o.local_ray(ray);
                o.bvh
                    .all_hits(&origin, &direction)
                    .into_iter()
                    .filter(|(t, _)| *t <= max_distance)
                    .map(move |(t, face)| o.hit(ray, t, face))
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits
    }

    fn first_hit(&self, ray: &Ray, max_distance: f64) -> Option<RayHit> {
        let mut best: Option<RayHit> = None;
        for o in self.objects.iter().filter(|o| o.visible) {
            let limit = best.map(|b| b.distance).unwrap_or(max_distance);
            let (origin, direction) = o.local_ray(ray);
            if let Some((t, face)) = o.bvh.closest_hit(&origin, &direction, limit) {
                best = Some(o.hit(ray, t, face));
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_meshes::unit_cube;

    #[test]
    fn test_viewport_ndc_round_trip_corners() {
        let vp = Viewport::new(800.0, 600.0);
        assert_eq!(vp.from_ndc(-1.0, 1.0), (0.0, 0.0));
        assert_eq!(vp.from_ndc(1.0, -1.0), (800.0, 600.0));
        assert_eq!(vp.to_ndc(400.0, 300.0), (0.0, 0.0));
    }

    #[test]
    fn test_center_ray_points_forward() {
        let cam = Camera::perspective(Point3::new(0.0, 0.0, 10.0), Point3::origin(), 1.0);
        let ray = cam.ray_through_ndc(0.0, 0.0).expect("ray");
        assert!((ray.direction - Vector3::new(0.0, 0.0, -1.0)).norm() < 1e-9);
        assert!((ray.origin - cam.position).norm() < 1e-9);
    }

    #[test]
    fn test_scene_first_hit_respects_transform() {
        let mut scene = Scene::new();
        let transform = Transform::from_position(Vector3::new(0.0, 0.0, -5.0));
        let id = scene.add(unit_cube(), &transform).expect("fresh");

        let ray = Ray::new(Point3::new(0.3, 0.6, 10.0), -Vector3::z()).expect("ray");
        let hit = scene.first_hit(&ray, f64::INFINITY).expect("hit");
        assert_eq!(hit.object, id);
        // Cube top is at z = -4 after translation
        assert!((hit.distance - 14.0).abs() < 1e-9);
        assert!((hit.point.z + 4.0).abs() < 1e-9);

        let all = scene.intersect(&ray, f64::INFINITY);
        assert_eq!(all.len(), 2);
        assert!(all[0].distance < all[1].distance);
    }

    #[test]
    fn test_scene_rejects_stale_transform() {
        let mut scene = Scene::new();
        let mut transform = Transform::identity();
        transform.set_position(Vector3::new(1.0, 0.0, 0.0));
        assert!(matches!(
            scene.add(unit_cube(), &transform),
            Err(DentalError::StaleTransform)
        ));
    }

    #[test]
    fn test_hidden_objects_do_not_occlude() {
        let mut scene = Scene::new();
        let id = scene
            .add(unit_cube(), &Transform::identity())
            .expect("fresh");
        scene.set_visible(id, false);
        let ray = Ray::new(Point3::new(0.3, 0.6, 10.0), -Vector3::z()).expect("ray");
        assert!(scene.first_hit(&ray, f64::INFINITY).is_none());
    }

    #[test]
    fn test_orthographic_ray_to() {
        let cam = Camera::orthographic(Point3::new(0.0, 0.0, 10.0), Point3::origin(), 5.0, 1.0);
        let (ray, depth) = cam.ray_to(&Point3::new(2.0, 1.0, 0.0)).expect("ray");
        assert!((depth - 10.0).abs() < 1e-12);
        assert!((ray.origin - Point3::new(2.0, 1.0, 10.0)).norm() < 1e-12);
    }
}
