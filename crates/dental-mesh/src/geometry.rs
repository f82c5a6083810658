//! Per-vertex differential geometry and point-set clustering.
//!
//! Everything here is a pure function over vertex/face buffers. Degenerate
//! input produces neutral values (zero curvature, no clusters) instead of errors.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use hashbrown::{HashMap, HashSet};
use nalgebra::{Matrix3, Point3, Vector3};
use tracing::debug;

use crate::spatial::SpatialIndex;
use crate::types::Mesh;

/// Decimal places used when matching vertices by coordinate.
pub const POSITION_KEY_DECIMALS: i32 = 6;

/// Quantized coordinate key, used to match vertices across buffers that
/// share no index space.
pub type PositionKey = (i64, i64, i64);

/// Round a position to [`POSITION_KEY_DECIMALS`] places.
#[inline]
pub fn position_key(p: &Point3<f64>) -> PositionKey {
    let scale = 10f64.powi(POSITION_KEY_DECIMALS);
    (
        (p.x * scale).round() as i64,
        (p.y * scale).round() as i64,
        (p.z * scale).round() as i64,
    )
}

/// One-ring vertex adjacency.
///
/// For non-indexed meshes coincident vertices are welded by [`position_key`]
/// first, so adjacency crosses triangle boundaries the way it would on the
/// indexed equivalent. `neighbors` are always reported as representative ids.
#[derive(Debug, Clone)]
pub struct VertexAdjacency {
    /// Representative vertex for each vertex (itself for indexed meshes).
    representative: Vec<u32>,
    /// Vertices sharing each representative.
    members: HashMap<u32, Vec<u32>>,
    neighbors: Vec<Vec<u32>>,
}

impl VertexAdjacency {
    pub fn build(mesh: &Mesh) -> Self {
        let n = mesh.vertices.len();
        let representative: Vec<u32> = if mesh.is_indexed() {
            (0..n as u32).collect()
        } else {
            let mut first: HashMap<PositionKey, u32> = HashMap::with_capacity(n);
            mesh.vertices
                .iter()
                .enumerate()
                .map(|(i, v)| *first.entry(position_key(&v.position)).or_insert(i as u32))
                .collect()
        };

        let mut members: HashMap<u32, Vec<u32>> = HashMap::new();
        if !mesh.is_indexed() {
            for (i, &r) in representative.iter().enumerate() {
                members.entry(r).or_default().push(i as u32);
            }
        }

        let mut sets: Vec<HashSet<u32>> = vec![HashSet::new(); n];
        for face in &mesh.faces {
            let r = face.map(|v| representative[v as usize]);
            for k in 0..3 {
                let a = r[k];
                let b = r[(k + 1) % 3];
                if a != b {
                    sets[a as usize].insert(b);
                    sets[b as usize].insert(a);
                }
            }
        }
        let neighbors = sets
            .into_iter()
            .map(|s| {
                let mut v: Vec<u32> = s.into_iter().collect();
                v.sort_unstable();
                v
            })
            .collect();

        Self {
            representative,
            members,
            neighbors,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.representative.len()
    }

    #[inline]
    pub fn representative(&self, v: u32) -> u32 {
        self.representative[v as usize]
    }

    /// Neighbors of `v` (as representatives).
    #[inline]
    pub fn neighbors(&self, v: u32) -> &[u32] {
        &self.neighbors[self.representative(v) as usize]
    }

    /// All vertices welded to the same position as `v`, including `v`.
    pub fn coincident(&self, v: u32) -> Vec<u32> {
        let r = self.representative(v);
        match self.members.get(&r) {
            Some(m) => m.clone(),
            None => vec![v],
        }
    }

    /// Expand a set of representatives to every coincident vertex.
    pub fn expand_coincident(&self, vertices: &BTreeSet<u32>) -> BTreeSet<u32> {
        if self.members.is_empty() {
            return vertices.clone();
        }
        vertices.iter().flat_map(|&v| self.coincident(v)).collect()
    }

    /// Connected pieces of `subset`, using only edges inside it. Largest first.
    pub fn components_within(&self, subset: &BTreeSet<u32>) -> Vec<BTreeSet<u32>> {
        let reps: BTreeSet<u32> = subset.iter().map(|&v| self.representative(v)).collect();
        let mut seen: HashSet<u32> = HashSet::with_capacity(reps.len());
        let mut components = Vec::new();
        for &start in &reps {
            if !seen.insert(start) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut stack = vec![start];
            while let Some(v) = stack.pop() {
                component.insert(v);
                for &n in &self.neighbors[v as usize] {
                    if reps.contains(&n) && seen.insert(n) {
                        stack.push(n);
                    }
                }
            }
            let full: BTreeSet<u32> = self
                .expand_coincident(&component)
                .into_iter()
                .filter(|v| subset.contains(v))
                .collect();
            components.push(full);
        }
        components.sort_by_key(|c| Reverse(c.len()));
        components
    }
}

/// Per-vertex curvature estimate.
///
/// For vertex `i` with neighbors `j`, the mean of
/// `|(n_i - n_j) . (p_i - p_j)| / |p_i - p_j|^2`. Vertices with no neighbors
/// or no normal get 0. Normals should be unit length.
pub fn vertex_curvature(mesh: &Mesh, adjacency: &VertexAdjacency) -> Vec<f64> {
    (0..mesh.vertices.len() as u32)
        .map(|i| {
            let vi = &mesh.vertices[adjacency.representative(i) as usize];
            let Some(ni) = vi.normal else {
                return 0.0;
            };
            let mut sum = 0.0;
            let mut count = 0usize;
            for &j in adjacency.neighbors(i) {
                let vj = &mesh.vertices[j as usize];
                let Some(nj) = vj.normal else { continue };
                let d = vi.position - vj.position;
                let len_sq = d.norm_squared();
                if len_sq < 1e-24 {
                    continue;
                }
                sum += ((ni - nj).dot(&d)).abs() / len_sq;
                count += 1;
            }
            if count == 0 { 0.0 } else { sum / count as f64 }
        })
        .collect()
}

/// Uniform-weight Laplacian smoothing of positions.
///
/// Each iteration moves every vertex `lambda` of the way toward the mean of its
/// neighbors. Vertices without neighbors stay put.
pub fn laplacian_smooth(
    positions: &[Point3<f64>],
    adjacency: &VertexAdjacency,
    iterations: usize,
    lambda: f64,
) -> Vec<Point3<f64>> {
    let mut current = positions.to_vec();
    for _ in 0..iterations {
        let next: Vec<Point3<f64>> = (0..current.len() as u32)
            .map(|i| {
                let neighbors = adjacency.neighbors(i);
                if neighbors.is_empty() {
                    return current[i as usize];
                }
                let mean: Vector3<f64> = neighbors
                    .iter()
                    .map(|&j| current[j as usize].coords)
                    .sum::<Vector3<f64>>()
                    / neighbors.len() as f64;
                let p = current[i as usize];
                p + (Point3::from(mean) - p) * lambda
            })
            .collect();
        current = next;
    }
    current
}

/// Average a per-vertex scalar with its neighbors, `iterations` times.
pub fn smooth_scalar_field(
    values: &[f64],
    adjacency: &VertexAdjacency,
    iterations: usize,
) -> Vec<f64> {
    let mut current = values.to_vec();
    for _ in 0..iterations {
        current = (0..current.len() as u32)
            .map(|i| {
                let neighbors = adjacency.neighbors(i);
                let sum: f64 = neighbors.iter().map(|&j| current[j as usize]).sum();
                (current[i as usize] + sum) / (neighbors.len() + 1) as f64
            })
            .collect();
    }
    current
}

/// DBSCAN labels: `Some(cluster)` for clustered points, `None` for noise.
#[derive(Debug, Clone)]
pub struct Clustering {
    pub labels: Vec<Option<usize>>,
    pub cluster_count: usize,
}

impl Clustering {
    /// Point indices of each cluster.
    pub fn clusters(&self) -> Vec<Vec<u32>> {
        let mut out = vec![Vec::new(); self.cluster_count];
        for (i, label) in self.labels.iter().enumerate() {
            if let Some(c) = label {
                out[*c].push(i as u32);
            }
        }
        out
    }

    pub fn noise_count(&self) -> usize {
        self.labels.iter().filter(|l| l.is_none()).count()
    }
}

/// Density-based clustering.
///
/// A point is a core point if at least `min_points` points (itself included)
/// lie within `eps`. Clusters grow from core points; non-core points reachable
/// from a core point join its cluster, the rest are noise. Cluster ids are
/// assigned in order of the lowest point index, so output is deterministic.
pub fn dbscan(points: &[Point3<f64>], eps: f64, min_points: usize) -> Clustering {
    let n = points.len();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let Ok(index) = SpatialIndex::from_points(points.to_vec(), eps) else {
        return Clustering {
            labels,
            cluster_count: 0,
        };
    };

    let mut visited = vec![false; n];
    let mut cluster_count = 0usize;

    for start in 0..n {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let seeds = index.query(&points[start], eps);
        if seeds.len() < min_points {
            continue;
        }

        let cluster = cluster_count;
        cluster_count += 1;
        labels[start] = Some(cluster);

        let mut queue: Vec<u32> = seeds;
        while let Some(q) = queue.pop() {
            let q = q as usize;
            if labels[q].is_none() {
                labels[q] = Some(cluster);
            }
            if visited[q] {
                continue;
            }
            visited[q] = true;
            let reach = index.query(&points[q], eps);
            if reach.len() >= min_points {
                queue.extend(reach.into_iter().filter(|&r| !visited[r as usize]));
            }
        }
    }

    debug!(points = n, eps, min_points, clusters = cluster_count, "DBSCAN finished");

    Clustering {
        labels,
        cluster_count,
    }
}

/// Principal axes of a point set.
#[derive(Debug, Clone, Copy)]
pub struct PrincipalAxes {
    pub centroid: Point3<f64>,
    /// Unit axes, largest variance first.
    pub axes: [Vector3<f64>; 3],
    /// Variance along each axis, descending.
    pub variances: [f64; 3],
}

impl PrincipalAxes {
    /// Axis of largest variance.
    pub fn major(&self) -> Vector3<f64> {
        self.axes[0]
    }

    /// Axis of smallest variance.
    pub fn minor(&self) -> Vector3<f64> {
        self.axes[2]
    }

    /// Coordinates of `p` along each axis, relative to the centroid.
    pub fn project(&self, p: &Point3<f64>) -> [f64; 3] {
        let d = p - self.centroid;
        [d.dot(&self.axes[0]), d.dot(&self.axes[1]), d.dot(&self.axes[2])]
    }
}

/// PCA over `points`. `None` for an empty set.
pub fn principal_axes(points: &[Point3<f64>]) -> Option<PrincipalAxes> {
    if points.is_empty() {
        return None;
    }
    let centroid = Point3::from(
        points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / points.len() as f64,
    );
    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p - centroid;
        cov += d * d.transpose();
    }
    cov /= points.len() as f64;

    let eigen = cov.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let axis = |k: usize| {
        let v: Vector3<f64> = eigen.eigenvectors.column(order[k]).into_owned();
        v.try_normalize(1e-12).unwrap_or_else(|| {
            let mut e = Vector3::zeros();
            e[k] = 1.0;
            e
        })
    };

    Some(PrincipalAxes {
        centroid,
        axes: [axis(0), axis(1), axis(2)],
        variances: [
            eigen.eigenvalues[order[0]].max(0.0),
            eigen.eigenvalues[order[1]].max(0.0),
            eigen.eigenvalues[order[2]].max(0.0),
        ],
    })
}

/// Face indices of each edge-connected component, largest first.
pub fn face_components(mesh: &Mesh) -> Vec<Vec<u32>> {
    if mesh.faces.is_empty() {
        return Vec::new();
    }

    let mut edge_faces: HashMap<(u32, u32), Vec<u32>> = HashMap::new();
    for (fi, face) in mesh.faces.iter().enumerate() {
        for k in 0..3 {
            let a = face[k];
            let b = face[(k + 1) % 3];
            let key = if a < b { (a, b) } else { (b, a) };
            edge_faces.entry(key).or_default().push(fi as u32);
        }
    }

    let mut face_neighbors: Vec<Vec<u32>> = vec![Vec::new(); mesh.faces.len()];
    for faces in edge_faces.values() {
        for (i, &f0) in faces.iter().enumerate() {
            for &f1 in &faces[i + 1..] {
                face_neighbors[f0 as usize].push(f1);
                face_neighbors[f1 as usize].push(f0);
            }
        }
    }

    let mut visited = vec![false; mesh.faces.len()];
    let mut components = Vec::new();
    for start in 0..mesh.faces.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let mut component = vec![start as u32];
        let mut stack = vec![start as u32];
        while let Some(f) = stack.pop() {
            for &n in &face_neighbors[f as usize] {
                if !visited[n as usize] {
                    visited[n as usize] = true;
                    component.push(n);
                    stack.push(n);
                }
            }
        }
        component.sort_unstable();
        components.push(component);
    }
    components.sort_by_key(|c| Reverse(c.len()));
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_meshes::{grid, unit_cube};
    use crate::types::Vertex;

    #[test]
    fn test_position_key_rounds_to_six_places() {
        let a = position_key(&Point3::new(1.0000001, 2.0, 3.0));
        let b = position_key(&Point3::new(1.0, 2.0, 3.0));
        assert_eq!(a, b);
        let c = position_key(&Point3::new(1.00001, 2.0, 3.0));
        assert_ne!(a, c);
    }

    #[test]
    fn test_adjacency_on_grid() {
        let mesh = grid(2);
        let adj = VertexAdjacency::build(&mesh);
        // Center vertex of a 3x3 grid with diagonal splits has 6 neighbors
        assert_eq!(adj.neighbors(4).len(), 6);
        // Corner (0,0) touches two faces: neighbors 1, 3, 4
        assert_eq!(adj.neighbors(0), &[1, 3, 4]);
    }

    #[test]
    fn test_non_indexed_adjacency_welds() {
        let mut indexed = grid(1);
        indexed.compute_vertex_normals();
        let soup: Vec<[Point3<f64>; 3]> = indexed
            .triangles()
            .map(|t| [t.v0, t.v1, t.v2])
            .collect();
        let soup = Mesh::from_triangle_soup(&soup);
        let adj = VertexAdjacency::build(&soup);
        // Vertex 0 is (0,0,0), shared by both triangles in the indexed grid
        assert_eq!(adj.coincident(0).len(), 2);
        assert_eq!(adj.neighbors(0).len(), 3);
    }

    #[test]
    fn test_flat_surface_has_zero_curvature() {
        let mesh = grid(4);
        let adj = VertexAdjacency::build(&mesh);
        let k = vertex_curvature(&mesh, &adj);
        assert!(k.iter().all(|&c| c.abs() < 1e-12));
    }

    #[test]
    fn test_cube_corners_curved() {
        let mesh = unit_cube();
        let adj = VertexAdjacency::build(&mesh);
        let k = vertex_curvature(&mesh, &adj);
        assert!(k.iter().all(|&c| c > 0.1));
    }

    #[test]
    fn test_missing_normals_give_zero_curvature() {
        let mut mesh = grid(2);
        for v in &mut mesh.vertices {
            v.normal = None;
        }
        let adj = VertexAdjacency::build(&mesh);
        assert!(vertex_curvature(&mesh, &adj).iter().all(|&c| c == 0.0));
    }

    #[test]
    fn test_laplacian_smooth_pulls_spike_down() {
        let mut mesh = grid(2);
        mesh.vertices[4].position.z = 1.0;
        let adj = VertexAdjacency::build(&mesh);
        let positions: Vec<_> = mesh.vertices.iter().map(|v| v.position).collect();
        let smoothed = laplacian_smooth(&positions, &adj, 1, 0.5);
        assert!(smoothed[4].z < 1.0);
        assert!(smoothed[4].z > 0.0);
    }

    #[test]
    fn test_smooth_scalar_field_preserves_constant() {
        let mesh = grid(3);
        let adj = VertexAdjacency::build(&mesh);
        let values = vec![2.5; mesh.vertices.len()];
        let smoothed = smooth_scalar_field(&values, &adj, 3);
        assert!(smoothed.iter().all(|&v| (v - 2.5).abs() < 1e-12));
    }

    #[test]
    fn test_dbscan_two_blobs_and_noise() {
        let mut points = Vec::new();
        for i in 0..10 {
            points.push(Point3::new(i as f64 * 0.1, 0.0, 0.0));
            points.push(Point3::new(100.0 + i as f64 * 0.1, 0.0, 0.0));
        }
        points.push(Point3::new(50.0, 50.0, 50.0));
        let result = dbscan(&points, 0.25, 3);
        assert_eq!(result.cluster_count, 2);
        assert_eq!(result.noise_count(), 1);
        assert_eq!(result.labels[0], Some(0));
        assert_eq!(result.labels[1], Some(1));
        let clusters = result.clusters();
        assert_eq!(clusters[0].len(), 10);
        assert_eq!(clusters[1].len(), 10);
    }

    #[test]
    fn test_dbscan_invalid_eps_is_all_noise() {
        let points = vec![Point3::origin(); 5];
        let result = dbscan(&points, 0.0, 2);
        assert_eq!(result.cluster_count, 0);
        assert_eq!(result.noise_count(), 5);
    }

    #[test]
    fn test_principal_axes_of_elongated_cloud() {
        let points: Vec<Point3<f64>> = (0..50)
            .flat_map(|i| {
                let x = i as f64;
                [Point3::new(x, 0.5, 0.0), Point3::new(x, -0.5, 0.1)]
            })
            .collect();
        let pca = principal_axes(&points).expect("non-empty");
        assert!(pca.major().x.abs() > 0.99);
        assert!(pca.variances[0] >= pca.variances[1]);
        assert!(pca.variances[1] >= pca.variances[2]);
    }

    #[test]
    fn test_face_components() {
        let mut mesh = Mesh::new();
        for &(x, y) in &[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
            mesh.vertices.push(Vertex::from_coords(x, y, 0.0));
        }
        for &(x, y) in &[(10.0, 0.0), (11.0, 0.0), (10.0, 1.0)] {
            mesh.vertices.push(Vertex::from_coords(x, y, 0.0));
        }
        mesh.faces = vec![[0, 1, 2], [1, 3, 2], [4, 5, 6]];
        let components = face_components(&mesh);
        assert_eq!(components, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_components_within_subset() {
        let mesh = grid(4);
        let adj = VertexAdjacency::build(&mesh);
        // Two separate corners of the grid
        let subset: BTreeSet<u32> = [0, 1, 5, 24].into_iter().collect();
        let comps = adj.components_within(&subset);
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].len(), 3);
        assert!(comps[1].contains(&24));
    }
}
