//! Local automatic tooth segmentation.
//!
//! A fallback for when the segmentation service is unavailable. Stages run in
//! order until one produces segments:
//!
//! 1. edge-connected components of plausible tooth size,
//! 2. DBSCAN over vertex samples for each configured `eps`, best-scoring run,
//! 3. voxel occupancy with morphological opening and 6-connected labelling,
//! 4. spatial slicing along the principal axes of the arch.
//!
//! Every produced segment records the stage that made it in `method`.
//!
//! ```
//! use dental_mesh::autoseg::{SegmentationConfig, classify_tooth_type};
//! use dental_mesh::segment::ToothType;
//!
//! let config = SegmentationConfig::default();
//! assert_eq!(config.expected_tooth_count, 28);
//! assert_eq!(classify_tooth_type(60.0), ToothType::Molar);
//! ```

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;

use hashbrown::{HashMap, HashSet};
use nalgebra::Point3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::editor::SegmentGeometry;
use crate::error::{DentalError, DentalResult};
use crate::geometry::{dbscan, face_components, position_key, principal_axes};
use crate::segment::{DentalModel, SegmentId, ToothType};
use crate::tracing_ext::{OperationTimer, log_mesh_stats};
use crate::types::{Aabb, BufferLayout, Mesh, Vertex};

/// Clusters with fewer sample points are ignored.
const MIN_CLUSTER_SAMPLES: usize = 20;

/// Clusters mapping to fewer triangles are ignored before the size check.
const MIN_CLUSTER_TRIANGLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchType {
    #[default]
    Full,
    Upper,
    Lower,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelQuality {
    High,
    #[default]
    Medium,
    Low,
}

/// How close neighbouring teeth sit in the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeparationLevel {
    Natural,
    #[default]
    Touching,
    Connected,
}

/// User-facing segmentation settings.
///
/// Field names serialize in camelCase, matching what the segmentation service
/// accepts, so the same document configures both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentationConfig {
    pub arch_type: ArchType,
    pub expected_tooth_count: usize,
    pub model_quality: ModelQuality,
    pub separation_level: SeparationLevel,
    /// Minimum triangles per tooth.
    pub min_tooth_size: usize,
    /// Vertices below this height percentile count as gum.
    pub gum_height_percentile: f64,
    pub voxel_size: f64,
    /// Voxel components smaller than this are discarded.
    pub min_voxel_count: usize,
    /// Overrides the eps values implied by `separation_level`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clustering_eps_range: Option<Vec<f64>>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            arch_type: ArchType::Full,
            expected_tooth_count: 28,
            model_quality: ModelQuality::Medium,
            separation_level: SeparationLevel::Touching,
            min_tooth_size: 100,
            gum_height_percentile: 25.0,
            voxel_size: 0.4,
            min_voxel_count: 30,
            clustering_eps_range: None,
        }
    }
}

impl SegmentationConfig {
    /// Single arch with all teeth.
    pub fn single_arch(arch: ArchType) -> Self {
        Self {
            arch_type: arch,
            expected_tooth_count: 14,
            ..Default::default()
        }
    }

    pub fn eps_range(&self) -> Vec<f64> {
        if let Some(range) = &self.clustering_eps_range {
            return range.clone();
        }
        match self.separation_level {
            SeparationLevel::Natural => vec![0.5, 1.0, 1.5],
            SeparationLevel::Touching => vec![0.8, 1.2, 1.8],
            SeparationLevel::Connected => vec![1.0, 1.5, 2.0, 2.5],
        }
    }

    /// Maximum vertex samples fed to clustering.
    pub fn sample_count(&self) -> usize {
        match self.model_quality {
            ModelQuality::High => 75_000,
            ModelQuality::Medium => 50_000,
            ModelQuality::Low => 30_000,
        }
    }

    /// DBSCAN `min_points` for the first eps; each later eps adds 5.
    pub fn min_cluster_points(&self) -> usize {
        match self.model_quality {
            ModelQuality::High => 15,
            ModelQuality::Medium => 25,
            ModelQuality::Low => 35,
        }
    }

    /// Slices per side of the arch in the slicing fallback.
    pub fn arch_regions(&self) -> usize {
        let n = self.expected_tooth_count;
        match self.arch_type {
            ArchType::Full => (n / 4).max(6),
            ArchType::Upper | ArchType::Lower => (n / 2).max(4),
            ArchType::Partial => (n / 3).max(2),
        }
    }

    pub fn validate(&self) -> DentalResult<()> {
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            return Err(DentalError::invalid_parameter(
                "voxel_size",
                format!("must be positive, got {}", self.voxel_size),
            ));
        }
        if !(0.0..=100.0).contains(&self.gum_height_percentile) {
            return Err(DentalError::invalid_parameter(
                "gum_height_percentile",
                format!("must be within 0..=100, got {}", self.gum_height_percentile),
            ));
        }
        if self.eps_range().iter().any(|e| !(e.is_finite() && *e > 0.0)) {
            return Err(DentalError::invalid_parameter(
                "clustering_eps_range",
                "every eps must be positive",
            ));
        }
        Ok(())
    }
}

/// Stage that produced a segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationStage {
    ConnectedComponents,
    Clustering,
    Voxel,
    SpatialSlice,
}

impl fmt::Display for SegmentationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SegmentationStage::ConnectedComponents => "connected components",
            SegmentationStage::Clustering => "clustering",
            SegmentationStage::Voxel => "voxel",
            SegmentationStage::SpatialSlice => "spatial slice",
        })
    }
}

/// One automatically produced segment.
#[derive(Debug, Clone)]
pub struct AutoSegment {
    pub geometry: SegmentGeometry,
    pub method: String,
}

impl AutoSegment {
    pub fn triangle_count(&self) -> usize {
        self.geometry.mesh.faces.len()
    }

    pub fn bbox_volume(&self) -> f64 {
        self.geometry.mesh.bounds().map(|b| b.volume()).unwrap_or(0.0)
    }

    pub fn tooth_type(&self) -> ToothType {
        classify_tooth_type(self.bbox_volume())
    }

    /// Export name for the `number`-th segment, e.g. `tooth_03_voxel_cc.stl`.
    pub fn file_name(&self, number: usize) -> String {
        format!("tooth_{:02}_{}.stl", number, self.method)
    }
}

/// Result of [`auto_segment`].
#[derive(Debug, Clone, Default)]
pub struct AutoSegmentation {
    pub segments: Vec<AutoSegment>,
    /// `None` when every stage came up empty.
    pub stage: Option<SegmentationStage>,
    /// Score of the chosen clustering run.
    pub score: Option<f64>,
}

impl AutoSegmentation {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Add every segment to `model` as `tooth_NN_method`, numbered from 1.
    pub fn add_to_model(self, model: &mut DentalModel) -> Vec<SegmentId> {
        let mut ids = Vec::with_capacity(self.segments.len());
        for (i, segment) in self.segments.into_iter().enumerate() {
            let number = i + 1;
            let tooth_type = segment.tooth_type();
            let name = format!("tooth_{:02}_{}", number, segment.method);
            let id = model.add_segment(name, segment.geometry, tooth_type);
            if let Ok(added) = model.segment_mut(id) {
                added.tooth_number = Some(number as u32);
                added.method = Some(segment.method);
            }
            ids.push(id);
        }
        ids
    }
}

impl fmt::Display for AutoSegmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "{} segments via {}", self.segments.len(), stage)?,
            None => write!(f, "no segments found")?,
        }
        if let Some(score) = self.score {
            write!(f, " (score {:.2})", score)?;
        }
        Ok(())
    }
}

/// Tooth type from the bounding-box volume of a segment, in mm³.
pub fn classify_tooth_type(bbox_volume: f64) -> ToothType {
    if bbox_volume > 50.0 {
        ToothType::Molar
    } else if bbox_volume > 25.0 {
        ToothType::Premolar
    } else if bbox_volume > 15.0 {
        ToothType::Canine
    } else {
        ToothType::Incisor
    }
}

/// Quality of a candidate segmentation: `0.7 * count + 0.3 * uniformity`.
///
/// The count term falls off linearly with distance from `expected`; the
/// uniformity term is `1 / (1 + variance / mean)` of the triangle counts.
pub fn score_segmentation(triangle_counts: &[usize], expected: usize) -> f64 {
    if triangle_counts.is_empty() {
        return 0.0;
    }
    let n = triangle_counts.len() as f64;
    let count_score = if expected == 0 {
        0.0
    } else {
        let e = expected as f64;
        (1.0 - (n - e).abs() / e).max(0.0)
    };

    let quality_score = if triangle_counts.len() > 1 {
        let mean = triangle_counts.iter().sum::<usize>() as f64 / n;
        let variance = triangle_counts
            .iter()
            .map(|&c| (c as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        if mean > 0.0 {
            1.0 / (1.0 + variance / mean)
        } else {
            1.0
        }
    } else {
        1.0
    };

    count_score * 0.7 + quality_score * 0.3
}

/// Run the stages in order and keep the first non-empty result.
pub fn auto_segment(mesh: &Mesh, config: &SegmentationConfig) -> DentalResult<AutoSegmentation> {
    if mesh.faces.is_empty() {
        return Err(DentalError::empty_mesh("nothing to segment"));
    }
    config.validate()?;
    let _timer = OperationTimer::for_mesh("auto_segment", mesh);

    let mesh = welded(mesh);
    log_mesh_stats(&mesh, "welded");

    let components = connected_component_segments(&mesh, config);
    if !components.is_empty() {
        return Ok(finish(components, SegmentationStage::ConnectedComponents, None));
    }

    if let Some((segments, score)) = clustering_segments(&mesh, config) {
        return Ok(finish(segments, SegmentationStage::Clustering, Some(score)));
    }
    debug!("Clustering found no teeth, trying voxels");

    let voxels = voxel_segments(&mesh, config);
    if !voxels.is_empty() {
        return Ok(finish(voxels, SegmentationStage::Voxel, None));
    }
    debug!("Voxel labelling found no teeth, slicing");

    let slices = spatial_slice_segments(&mesh, config);
    if !slices.is_empty() {
        return Ok(finish(slices, SegmentationStage::SpatialSlice, None));
    }

    warn!("Auto-segmentation produced no segments");
    Ok(AutoSegmentation::default())
}

fn finish(
    segments: Vec<AutoSegment>,
    stage: SegmentationStage,
    score: Option<f64>,
) -> AutoSegmentation {
    info!(segments = segments.len(), %stage, "Auto-segmentation finished");
    AutoSegmentation {
        segments,
        stage: Some(stage),
        score,
    }
}

/// Indexed copy of a triangle soup with coincident vertices merged. Face
/// order is kept, so face indices stay valid for the original.
fn welded(mesh: &Mesh) -> Cow<'_, Mesh> {
    if mesh.layout == BufferLayout::Indexed {
        return Cow::Borrowed(mesh);
    }
    let mut out = Mesh::with_layout(BufferLayout::Indexed, mesh.vertices.len() / 3, mesh.faces.len());
    let mut remap: HashMap<_, u32> = HashMap::new();
    for face in &mesh.faces {
        let welded_face = face.map(|vi| {
            let p = mesh.vertices[vi as usize].position;
            *remap.entry(position_key(&p)).or_insert_with(|| {
                out.vertices.push(Vertex::new(p));
                (out.vertices.len() - 1) as u32
            })
        });
        out.faces.push(welded_face);
    }
    Cow::Owned(out)
}

fn segment_from_faces(mesh: &Mesh, faces: &[u32], method: impl Into<String>) -> AutoSegment {
    AutoSegment {
        geometry: SegmentGeometry::from_faces(mesh, faces),
        method: method.into(),
    }
}

/// Edge-connected components with `min_tooth_size..=total/3` triangles.
///
/// Empty unless the mesh has more than one component.
pub fn connected_component_segments(mesh: &Mesh, config: &SegmentationConfig) -> Vec<AutoSegment> {
    let components = face_components(mesh);
    debug!(components = components.len(), "Connected components");
    if components.len() < 2 {
        return Vec::new();
    }
    let max = mesh.faces.len() / 3;
    components
        .iter()
        .filter(|c| (config.min_tooth_size..=max).contains(&c.len()))
        .map(|c| segment_from_faces(mesh, c, "connected_components"))
        .collect()
}

/// Best DBSCAN segmentation over the configured eps values, with its score.
///
/// `None` if no run produced a segment.
pub fn clustering_segments(
    mesh: &Mesh,
    config: &SegmentationConfig,
) -> Option<(Vec<AutoSegment>, f64)> {
    let samples = sample_vertices(mesh, config.sample_count());
    let points: Vec<Point3<f64>> = samples
        .iter()
        .map(|&vi| mesh.vertices[vi as usize].position)
        .collect();
    let base = config.min_cluster_points();

    let runs: Vec<(f64, Vec<AutoSegment>)> = config
        .eps_range()
        .into_par_iter()
        .enumerate()
        .map(|(i, eps)| {
            let clustering = dbscan(&points, eps, base + 5 * i);
            let segments: Vec<AutoSegment> = clustering
                .clusters()
                .into_iter()
                .filter(|c| c.len() >= MIN_CLUSTER_SAMPLES)
                .filter_map(|cluster| {
                    let vertices: HashSet<u32> =
                        cluster.iter().map(|&s| samples[s as usize]).collect();
                    cluster_segment(mesh, &vertices, eps, config.min_tooth_size)
                })
                .collect();
            (eps, segments)
        })
        .collect();

    let mut best: Option<(Vec<AutoSegment>, f64)> = None;
    for (eps, segments) in runs {
        let counts: Vec<usize> = segments.iter().map(AutoSegment::triangle_count).collect();
        let score = score_segmentation(&counts, config.expected_tooth_count);
        debug!(eps, segments = segments.len(), score, "Clustering run");
        if score > best.as_ref().map_or(0.0, |(_, s)| *s) {
            best = Some((segments, score));
        }
    }
    best.filter(|(segments, _)| !segments.is_empty())
}

/// Triangles with at least two vertices in the cluster.
fn cluster_segment(
    mesh: &Mesh,
    vertices: &HashSet<u32>,
    eps: f64,
    min_triangles: usize,
) -> Option<AutoSegment> {
    let faces: Vec<u32> = mesh
        .faces
        .iter()
        .enumerate()
        .filter(|(_, f)| f.iter().filter(|v| vertices.contains(*v)).count() >= 2)
        .map(|(i, _)| i as u32)
        .collect();
    if faces.len() < MIN_CLUSTER_TRIANGLES || faces.len() < min_triangles {
        return None;
    }
    Some(segment_from_faces(mesh, &faces, format!("dbscan_eps_{}", eps)))
}

/// Up to `count` vertex indices at a fixed stride.
fn sample_vertices(mesh: &Mesh, count: usize) -> Vec<u32> {
    let total = mesh.vertices.len();
    if total <= count {
        return (0..total as u32).collect();
    }
    (0..count).map(|i| (i * total / count) as u32).collect()
}

type Voxel = [i64; 3];

const FACE_NEIGHBORS: [Voxel; 6] = [
    [1, 0, 0],
    [-1, 0, 0],
    [0, 1, 0],
    [0, -1, 0],
    [0, 0, 1],
    [0, 0, -1],
];

fn neighbors(v: Voxel) -> impl Iterator<Item = Voxel> {
    FACE_NEIGHBORS
        .iter()
        .map(move |d| [v[0] + d[0], v[1] + d[1], v[2] + d[2]])
}

/// Voxel components of the opened occupancy grid, cropped back to triangles.
pub fn voxel_segments(mesh: &Mesh, config: &SegmentationConfig) -> Vec<AutoSegment> {
    let Some(bounds) = mesh.bounds() else {
        return Vec::new();
    };
    let size = config.voxel_size;
    let voxel_of = |p: &Point3<f64>| -> Voxel {
        let d = (p - bounds.min) / size;
        [d.x.floor() as i64, d.y.floor() as i64, d.z.floor() as i64]
    };

    let centroids: Vec<Point3<f64>> = mesh.triangles().map(|t| t.centroid()).collect();
    let occupied: HashSet<Voxel> = mesh
        .vertices
        .iter()
        .map(|v| voxel_of(&v.position))
        .chain(centroids.iter().map(&voxel_of))
        .collect();

    let opened = open(&occupied);
    let labels = label_components(&opened);
    debug!(
        occupied = occupied.len(),
        opened = opened.len(),
        components = labels.len(),
        "Voxel labelling"
    );

    labels
        .into_iter()
        .filter(|c| c.len() >= config.min_voxel_count)
        .filter_map(|component| {
            let lo = component.iter().fold([i64::MAX; 3], |acc, v| {
                [acc[0].min(v[0]), acc[1].min(v[1]), acc[2].min(v[2])]
            });
            let hi = component.iter().fold([i64::MIN; 3], |acc, v| {
                [acc[0].max(v[0]), acc[1].max(v[1]), acc[2].max(v[2])]
            });
            let corner = |v: Voxel| {
                Point3::new(
                    bounds.min.x + v[0] as f64 * size,
                    bounds.min.y + v[1] as f64 * size,
                    bounds.min.z + v[2] as f64 * size,
                )
            };
            let crop = Aabb::new(corner(lo), corner([hi[0] + 1, hi[1] + 1, hi[2] + 1]));
            let faces: Vec<u32> = centroids
                .iter()
                .enumerate()
                .filter(|(_, c)| crop.contains(c))
                .map(|(i, _)| i as u32)
                .collect();
            (faces.len() >= config.min_tooth_size)
                .then(|| segment_from_faces(mesh, &faces, "voxel_cc"))
        })
        .collect()
}

/// Erosion then dilation with the 6-neighbour cross.
fn open(occupied: &HashSet<Voxel>) -> HashSet<Voxel> {
    let eroded: HashSet<Voxel> = occupied
        .iter()
        .copied()
        .filter(|&v| neighbors(v).all(|n| occupied.contains(&n)))
        .collect();
    let mut dilated = eroded.clone();
    for &v in &eroded {
        dilated.extend(neighbors(v));
    }
    dilated
}

/// 6-connected components, in order of their smallest voxel.
fn label_components(voxels: &HashSet<Voxel>) -> Vec<Vec<Voxel>> {
    let mut ordered: Vec<Voxel> = voxels.iter().copied().collect();
    ordered.sort_unstable();

    let mut seen: HashSet<Voxel> = HashSet::with_capacity(voxels.len());
    let mut components = Vec::new();
    for start in ordered {
        if !seen.insert(start) {
            continue;
        }
        let mut component = vec![start];
        let mut queue = VecDeque::from([start]);
        while let Some(v) = queue.pop_front() {
            for n in neighbors(v) {
                if voxels.contains(&n) && seen.insert(n) {
                    component.push(n);
                    queue.push_back(n);
                }
            }
        }
        components.push(component);
    }
    components
}

/// Left/right halves of the arch cut into equal slices along its length.
pub fn spatial_slice_segments(mesh: &Mesh, config: &SegmentationConfig) -> Vec<AutoSegment> {
    let centroids: Vec<Point3<f64>> = mesh.triangles().map(|t| t.centroid()).collect();
    let Some(axes) = principal_axes(&centroids) else {
        return Vec::new();
    };

    let coords: Vec<[f64; 3]> = centroids.iter().map(|c| axes.project(c)).collect();
    let side: Vec<f64> = coords.iter().map(|c| c[0]).collect();
    let arch: Vec<f64> = coords.iter().map(|c| c[1]).collect();
    let side_center = percentile(&side, 50.0);
    let arch_min = arch.iter().copied().fold(f64::INFINITY, f64::min);
    let arch_max = arch.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let regions = config.arch_regions();
    let width = (arch_max - arch_min) / regions as f64;
    let slice_of = |a: f64| -> usize {
        if width > 0.0 {
            (((a - arch_min) / width).floor() as usize).min(regions - 1)
        } else {
            0
        }
    };

    let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); regions * 2];
    for (fi, (&s, &a)) in side.iter().zip(&arch).enumerate() {
        let half = usize::from(s > side_center);
        buckets[half * regions + slice_of(a)].push(fi as u32);
    }

    buckets
        .iter()
        .enumerate()
        .filter(|(_, faces)| faces.len() >= config.min_tooth_size)
        .map(|(b, faces)| {
            let side_name = if b < regions { "left" } else { "right" };
            segment_from_faces(
                mesh,
                faces,
                format!("spatial_slice_{}_{}", side_name, b % regions),
            )
        })
        .collect()
}

/// Linear-interpolated percentile, `p` in `0..=100`.
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Gum and teeth halves of a scan, split by height.
///
/// The vertical axis is the direction of least variance. A triangle is gum
/// when all three vertices lie below the `percentile` height. Either half
/// may be empty.
pub fn split_gum_and_teeth(mesh: &Mesh, percentile_height: f64) -> (SegmentGeometry, SegmentGeometry) {
    let positions: Vec<Point3<f64>> = mesh.vertices.iter().map(|v| v.position).collect();
    let Some(axes) = principal_axes(&positions) else {
        return (
            SegmentGeometry::imported(Mesh::new()),
            SegmentGeometry::imported(mesh.clone()),
        );
    };

    let heights: Vec<f64> = positions.iter().map(|p| axes.project(p)[2]).collect();
    let threshold = percentile(&heights, percentile_height);

    let (gum, teeth): (Vec<u32>, Vec<u32>) = (0..mesh.faces.len() as u32).partition(|&fi| {
        mesh.faces[fi as usize]
            .iter()
            .all(|&v| heights[v as usize] < threshold)
    });
    debug!(
        gum = gum.len(),
        teeth = teeth.len(),
        threshold,
        "Gum split"
    );
    (
        SegmentGeometry::from_faces(mesh, &gum),
        SegmentGeometry::from_faces(mesh, &teeth),
    )
}
