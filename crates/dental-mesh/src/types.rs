//! Core mesh data types.

use nalgebra::{Matrix4, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{DentalError, DentalResult};

/// RGB color with 8-bit components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl VertexColor {
    /// Create a new color from RGB components.
    #[inline]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Create a color from floating point values in [0, 1] range.
    #[inline]
    pub fn from_float(r: f32, g: f32, b: f32) -> Self {
        Self {
            r: (r.clamp(0.0, 1.0) * 255.0) as u8,
            g: (g.clamp(0.0, 1.0) * 255.0) as u8,
            b: (b.clamp(0.0, 1.0) * 255.0) as u8,
        }
    }

    /// Create a color from HSL components, all in [0, 1].
    pub fn from_hsl(h: f32, s: f32, l: f32) -> Self {
        let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
        let hp = (h.rem_euclid(1.0)) * 6.0;
        let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
        let (r, g, b) = match hp as u32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        let m = l - c / 2.0;
        Self::from_float(r + m, g + m, b + m)
    }

    /// Convert to floating point values in [0, 1] range.
    #[inline]
    pub fn to_float(&self) -> (f32, f32, f32) {
        (
            self.r as f32 / 255.0,
            self.g as f32 / 255.0,
            self.b as f32 / 255.0,
        )
    }
}

/// A vertex with optional attributes.
///
/// Coordinates are in millimeters for dental scans, but nothing here depends on units.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// Position in mesh-local space.
    pub position: Point3<f64>,

    /// Unit normal vector, computed from adjacent faces.
    pub normal: Option<Vector3<f64>>,

    /// Vertex color (RGB).
    pub color: Option<VertexColor>,
}

impl Vertex {
    /// Create a new vertex with only position set.
    #[inline]
    pub fn new(position: Point3<f64>) -> Self {
        Self {
            position,
            normal: None,
            color: None,
        }
    }

    /// Create a vertex from raw coordinates.
    #[inline]
    pub fn from_coords(x: f64, y: f64, z: f64) -> Self {
        Self::new(Point3::new(x, y, z))
    }

    /// Create a vertex with position and normal.
    #[inline]
    pub fn with_normal(position: Point3<f64>, normal: Vector3<f64>) -> Self {
        Self {
            position,
            normal: Some(normal),
            color: None,
        }
    }
}

/// How triangles reference vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferLayout {
    /// Faces share vertices through an index buffer.
    #[default]
    Indexed,
    /// Triangle soup: face `i` is `[3i, 3i + 1, 3i + 2]` and nothing is shared.
    NonIndexed,
}

/// A triangle mesh in local coordinates.
///
/// The model-to-world transform is owned by whoever displays the mesh
/// (a [`SceneObject`](crate::scene::SceneObject) or a
/// [`ToothSegment`](crate::segment::ToothSegment)), never by the mesh itself.
#[derive(Debug, Clone)]
pub struct Mesh {
    /// Vertex data.
    pub vertices: Vec<Vertex>,

    /// Triangle faces as indices into the vertex array, counter-clockwise winding.
    pub faces: Vec<[u32; 3]>,

    /// Whether faces share vertices.
    pub layout: BufferLayout,
}

impl Mesh {
    /// Create a new empty indexed mesh.
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            faces: Vec::new(),
            layout: BufferLayout::Indexed,
        }
    }

    /// Create an empty mesh with the given layout and capacity.
    pub fn with_layout(layout: BufferLayout, vertex_count: usize, face_count: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(vertex_count),
            faces: Vec::with_capacity(face_count),
            layout,
        }
    }

    /// Build a non-indexed mesh from a list of triangles.
    pub fn from_triangle_soup(triangles: &[[Point3<f64>; 3]]) -> Self {
        let mut mesh = Self::with_layout(
            BufferLayout::NonIndexed,
            triangles.len() * 3,
            triangles.len(),
        );
        for tri in triangles {
            let base = mesh.vertices.len() as u32;
            mesh.vertices.extend(tri.iter().map(|&p| Vertex::new(p)));
            mesh.faces.push([base, base + 1, base + 2]);
        }
        mesh
    }

    /// Number of vertices in the mesh.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of faces (triangles) in the mesh.
    #[inline]
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if mesh is empty (no vertices or faces).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// True if faces share vertices through an index buffer.
    #[inline]
    pub fn is_indexed(&self) -> bool {
        self.layout == BufferLayout::Indexed
    }

    /// True if every vertex carries a normal.
    pub fn has_normals(&self) -> bool {
        !self.vertices.is_empty() && self.vertices.iter().all(|v| v.normal.is_some())
    }

    /// Check that every face index refers to an existing vertex.
    pub fn validate_indices(&self) -> DentalResult<()> {
        let count = self.vertices.len();
        for (face_index, face) in self.faces.iter().enumerate() {
            for &vertex_index in face {
                if vertex_index as usize >= count {
                    return Err(DentalError::InvalidVertexIndex {
                        face_index,
                        vertex_index,
                        vertex_count: count,
                    });
                }
            }
        }
        Ok(())
    }

    /// Axis-aligned bounding box, or `None` if the mesh has no vertices.
    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(self.vertices.iter().map(|v| v.position))
    }

    /// Iterate over triangles, yielding Triangle structs with actual vertex data.
    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        self.faces.iter().map(|&[i0, i1, i2]| Triangle {
            v0: self.vertices[i0 as usize].position,
            v1: self.vertices[i1 as usize].position,
            v2: self.vertices[i2 as usize].position,
        })
    }

    /// Get a specific triangle by face index.
    pub fn triangle(&self, face_idx: usize) -> Option<Triangle> {
        self.faces.get(face_idx).map(|&[i0, i1, i2]| Triangle {
            v0: self.vertices[i0 as usize].position,
            v1: self.vertices[i1 as usize].position,
            v2: self.vertices[i2 as usize].position,
        })
    }

    /// Mean vertex position. `None` for a mesh without vertices.
    pub fn centroid(&self) -> Option<Point3<f64>> {
        if self.vertices.is_empty() {
            return None;
        }
        let sum: Vector3<f64> = self.vertices.iter().map(|v| v.position.coords).sum();
        Some(Point3::from(sum / self.vertices.len() as f64))
    }

    /// Recompute area-weighted vertex normals from the faces.
    ///
    /// Vertices not referenced by any non-degenerate face are left without a normal.
    pub fn compute_vertex_normals(&mut self) {
        let mut accum = vec![Vector3::zeros(); self.vertices.len()];
        for face in &self.faces {
            let tri = Triangle::new(
                self.vertices[face[0] as usize].position,
                self.vertices[face[1] as usize].position,
                self.vertices[face[2] as usize].position,
            );
            // length = 2 * area, so the sum is area weighted
            let n = tri.normal_unnormalized();
            for &vi in face {
                accum[vi as usize] += n;
            }
        }
        for (vertex, n) in self.vertices.iter_mut().zip(accum) {
            let len = n.norm();
            vertex.normal = (len > 1e-12).then(|| n / len);
        }
    }

    /// Translate mesh by the given vector.
    pub fn translate(&mut self, offset: Vector3<f64>) {
        for vertex in &mut self.vertices {
            vertex.position += offset;
        }
    }

    /// Copy of this mesh with positions and normals mapped through `matrix`.
    pub fn transformed(&self, matrix: &Matrix4<f64>) -> Mesh {
        let normal_matrix = normal_matrix(matrix);
        let vertices = self
            .vertices
            .iter()
            .map(|v| Vertex {
                position: matrix.transform_point(&v.position),
                normal: v
                    .normal
                    .and_then(|n| (normal_matrix * n).try_normalize(1e-12)),
                color: v.color,
            })
            .collect();
        Mesh {
            vertices,
            faces: self.faces.clone(),
            layout: self.layout,
        }
    }

    /// Signed volume via the divergence theorem; positive for outward-facing closed meshes.
    pub fn signed_volume(&self) -> f64 {
        self.triangles()
            .map(|t| t.v0.coords.dot(&t.v1.coords.cross(&t.v2.coords)))
            .sum::<f64>()
            / 6.0
    }

    /// Absolute enclosed volume. Only meaningful for closed meshes.
    #[inline]
    pub fn volume(&self) -> f64 {
        self.signed_volume().abs()
    }

    /// Total surface area.
    pub fn surface_area(&self) -> f64 {
        self.triangles().map(|tri| tri.area()).sum()
    }

    /// Mean edge length over all faces, 0 for an empty mesh.
    pub fn mean_edge_length(&self) -> f64 {
        if self.faces.is_empty() {
            return 0.0;
        }
        let total: f64 = self.triangles().map(|t| t.edge_lengths().iter().sum::<f64>()).sum();
        total / (self.faces.len() * 3) as f64
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

/// Inverse-transpose of the upper 3x3 block, for mapping normals.
/// Falls back to the plain 3x3 block for singular matrices.
pub fn normal_matrix(matrix: &Matrix4<f64>) -> nalgebra::Matrix3<f64> {
    let m3 = matrix.fixed_view::<3, 3>(0, 0).into_owned();
    m3.try_inverse().map(|inv| inv.transpose()).unwrap_or(m3)
}

/// A triangle with concrete vertex positions.
#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    pub v0: Point3<f64>,
    pub v1: Point3<f64>,
    pub v2: Point3<f64>,
}

impl Triangle {
    /// Create a new triangle from three points.
    #[inline]
    pub fn new(v0: Point3<f64>, v1: Point3<f64>, v2: Point3<f64>) -> Self {
        Self { v0, v1, v2 }
    }

    /// Unnormalized face normal (right-hand rule, length = twice the area).
    #[inline]
    pub fn normal_unnormalized(&self) -> Vector3<f64> {
        let e1 = self.v1 - self.v0;
        let e2 = self.v2 - self.v0;
        e1.cross(&e2)
    }

    /// Unit face normal, `None` for degenerate triangles.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        let n = self.normal_unnormalized();
        let len_sq = n.norm_squared();
        if len_sq > f64::EPSILON {
            Some(n / len_sq.sqrt())
        } else {
            None
        }
    }

    /// Area of the triangle.
    #[inline]
    pub fn area(&self) -> f64 {
        self.normal_unnormalized().norm() * 0.5
    }

    /// Centroid (center of mass).
    #[inline]
    pub fn centroid(&self) -> Point3<f64> {
        Point3::from((self.v0.coords + self.v1.coords + self.v2.coords) / 3.0)
    }

    /// Lengths of the three edges `[v0v1, v1v2, v2v0]`.
    #[inline]
    pub fn edge_lengths(&self) -> [f64; 3] {
        [
            (self.v1 - self.v0).norm(),
            (self.v2 - self.v1).norm(),
            (self.v0 - self.v2).norm(),
        ]
    }

    /// Closest point on the triangle to `p` (Ericson, Real-Time Collision Detection 5.1.5).
    pub fn closest_point(&self, p: &Point3<f64>) -> Point3<f64> {
        let (a, b, c) = (self.v0, self.v1, self.v2);
        let ab = b - a;
        let ac = c - a;
        let ap = p - a;
        let d1 = ab.dot(&ap);
        let d2 = ac.dot(&ap);
        if d1 <= 0.0 && d2 <= 0.0 {
            return a;
        }
        let bp = p - b;
        let d3 = ab.dot(&bp);
        let d4 = ac.dot(&bp);
        if d3 >= 0.0 && d4 <= d3 {
            return b;
        }
        let vc = d1 * d4 - d3 * d2;
        if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
            let v = d1 / (d1 - d3);
            return a + ab * v;
        }
        let cp = p - c;
        let d5 = ab.dot(&cp);
        let d6 = ac.dot(&cp);
        if d6 >= 0.0 && d5 <= d6 {
            return c;
        }
        let vb = d5 * d2 - d1 * d6;
        if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
            let w = d2 / (d2 - d6);
            return a + ac * w;
        }
        let va = d3 * d6 - d5 * d4;
        if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
            let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
            return b + (c - b) * w;
        }
        let denom = va + vb + vc;
        if denom.abs() < f64::EPSILON {
            return a;
        }
        let v = vb / denom;
        let w = vc / denom;
        a + ab * v + ac * w
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    /// Create a box from its corners.
    #[inline]
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// Bounding box of a set of points, `None` if the iterator is empty.
    pub fn from_points(points: impl IntoIterator<Item = Point3<f64>>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut aabb = Aabb::new(first, first);
        for p in iter {
            aabb.include(&p);
        }
        Some(aabb)
    }

    /// Grow the box to contain `p`.
    #[inline]
    pub fn include(&mut self, p: &Point3<f64>) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::new(self.min.inf(&other.min), self.max.sup(&other.max))
    }

    /// Closed-interval overlap test (touching boxes overlap).
    #[inline]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Intersection box, `None` if the boxes do not overlap.
    pub fn intersection(&self, other: &Aabb) -> Option<Aabb> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Aabb::new(self.min.sup(&other.min), self.max.inf(&other.max)))
    }

    /// Check whether `p` lies inside or on the box.
    #[inline]
    pub fn contains(&self, p: &Point3<f64>) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// Box grown by `margin` on every side.
    pub fn expanded(&self, margin: f64) -> Aabb {
        let m = Vector3::repeat(margin);
        Aabb::new(self.min - m, self.max + m)
    }

    #[inline]
    pub fn size(&self) -> Vector3<f64> {
        self.max - self.min
    }

    #[inline]
    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    /// Volume, 0 for flat boxes.
    pub fn volume(&self) -> f64 {
        let s = self.size();
        s.x.max(0.0) * s.y.max(0.0) * s.z.max(0.0)
    }

    /// Area of the largest face.
    pub fn largest_face_area(&self) -> f64 {
        let s = self.size();
        (s.x * s.y).max(s.y * s.z).max(s.x * s.z)
    }

    /// Smallest of the three extents.
    pub fn min_extent(&self) -> f64 {
        let s = self.size();
        s.x.min(s.y).min(s.z)
    }

    /// Length of the diagonal.
    pub fn diagonal(&self) -> f64 {
        self.size().norm()
    }

    /// The eight corners.
    pub fn corners(&self) -> [Point3<f64>; 8] {
        let (a, b) = (self.min, self.max);
        [
            Point3::new(a.x, a.y, a.z),
            Point3::new(b.x, a.y, a.z),
            Point3::new(a.x, b.y, a.z),
            Point3::new(b.x, b.y, a.z),
            Point3::new(a.x, a.y, b.z),
            Point3::new(b.x, a.y, b.z),
            Point3::new(a.x, b.y, b.z),
            Point3::new(b.x, b.y, b.z),
        ]
    }

    /// Bounding box of this box's corners mapped through `matrix`.
    pub fn transformed(&self, matrix: &Matrix4<f64>) -> Aabb {
        let corners = self.corners().map(|c| matrix.transform_point(&c));
        let mut aabb = Aabb::new(corners[0], corners[0]);
        for c in &corners[1..] {
            aabb.include(c);
        }
        aabb
    }

    /// Slab test. Returns the entry and exit distances along the ray, if any.
    pub fn ray_intersect(
        &self,
        origin: &Point3<f64>,
        dir_inv: &Vector3<f64>,
    ) -> Option<(f64, f64)> {
        let t1 = (self.min.x - origin.x) * dir_inv.x;
        let t2 = (self.max.x - origin.x) * dir_inv.x;
        let t3 = (self.min.y - origin.y) * dir_inv.y;
        let t4 = (self.max.y - origin.y) * dir_inv.y;
        let t5 = (self.min.z - origin.z) * dir_inv.z;
        let t6 = (self.max.z - origin.z) * dir_inv.z;

        let tmin = t1.min(t2).max(t3.min(t4)).max(t5.min(t6));
        let tmax = t1.max(t2).min(t3.max(t4)).min(t5.max(t6));

        if tmax < 0.0 || tmin > tmax {
            None
        } else {
            Some((tmin, tmax))
        }
    }
}
