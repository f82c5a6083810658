//! Uniform-grid spatial hash over mesh vertices.
//!
//! Vertices are bucketed by `floor(coord / cell_size)` per axis. Queries visit
//! the cells overlapping the query region and then filter by exact distance.
//!
//! The index stores mesh-local coordinates, so it survives rigid moves of the
//! owning segment and only has to be rebuilt when the geometry itself changes.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use tracing::debug;

use crate::error::{DentalError, DentalResult};
use crate::types::{Aabb, Mesh};

/// Integer cell coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellCoord {
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The 26 surrounding cells.
    pub fn neighbors(self) -> impl Iterator<Item = CellCoord> {
        (-1..=1).flat_map(move |dz| {
            (-1..=1).flat_map(move |dy| {
                (-1..=1).filter_map(move |dx| {
                    (dx != 0 || dy != 0 || dz != 0)
                        .then(|| {
                            CellCoord::new(
                                self.x.saturating_add(dx),
                                self.y.saturating_add(dy),
                                self.z.saturating_add(dz),
                            )
                        })
                })
            })
        })
    }
}

/// Spatial hash from cells to the vertex indices they contain.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    cell_size: f64,
    cells: HashMap<CellCoord, Vec<u32>>,
    positions: Vec<Point3<f64>>,
}

impl SpatialIndex {
    /// Index every vertex of `mesh`.
    ///
    /// An empty mesh yields an empty index. `cell_size` must be positive and finite.
    pub fn build(mesh: &Mesh, cell_size: f64) -> DentalResult<Self> {
        let positions: Vec<Point3<f64>> = mesh.vertices.iter().map(|v| v.position).collect();
        Self::from_points(positions, cell_size)
    }

    /// Index an arbitrary point set; indices refer to positions in `points`.
    pub fn from_points(points: Vec<Point3<f64>>, cell_size: f64) -> DentalResult<Self> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(DentalError::invalid_parameter(
                "cell_size",
                format!("must be positive and finite, got {}", cell_size),
            ));
        }

        let mut cells: HashMap<CellCoord, Vec<u32>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            if !p.coords.iter().all(|c| c.is_finite()) {
                continue;
            }
            cells
                .entry(cell_of(p, cell_size))
                .or_default()
                .push(i as u32);
        }

        debug!(
            points = points.len(),
            cells = cells.len(),
            cell_size,
            "Built spatial index"
        );

        Ok(Self {
            cell_size,
            cells,
            positions: points,
        })
    }

    /// Cell size heuristic: twice the mean edge length, or 1.0 for meshes without faces.
    pub fn suggest_cell_size(mesh: &Mesh) -> f64 {
        let mean = mesh.mean_edge_length();
        if mean > 0.0 && mean.is_finite() {
            mean * 2.0
        } else {
            1.0
        }
    }

    #[inline]
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Number of indexed points.
    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Position of an indexed point.
    pub fn position(&self, index: u32) -> Option<&Point3<f64>> {
        self.positions.get(index as usize)
    }

    /// Cell containing `point`.
    #[inline]
    pub fn cell_of(&self, point: &Point3<f64>) -> CellCoord {
        cell_of(point, self.cell_size)
    }

    /// World-space bounds of a cell in the index's coordinate frame.
    pub fn cell_bounds(&self, cell: CellCoord) -> Aabb {
        let s = self.cell_size;
        let min = Point3::new(cell.x as f64 * s, cell.y as f64 * s, cell.z as f64 * s);
        Aabb::new(min, min + Vector3::repeat(s))
    }

    /// Occupied cells with their bounds and members.
    pub fn cells(&self) -> impl Iterator<Item = (CellCoord, Aabb, &[u32])> + '_ {
        self.cells
            .iter()
            .map(move |(c, members)| (*c, self.cell_bounds(*c), members.as_slice()))
    }

    /// Indices within `radius` of `point`, in ascending order.
    ///
    /// Visits at least the 3x3x3 neighborhood of the point's cell and grows the
    /// range when the radius spans more than one cell. A negative or
    /// non-finite radius matches nothing.
    pub fn query(&self, point: &Point3<f64>, radius: f64) -> Vec<u32> {
        if self.cells.is_empty() || !(radius.is_finite() && radius >= 0.0) {
            return Vec::new();
        }
        // Cell coordinates are i32, so a reach of u32::MAX already spans them all
        let reach = ((radius / self.cell_size).ceil() as i64).clamp(1, u32::MAX as i64);
        let center = self.cell_of(point);
        let lo = [
            center.x as i64 - reach,
            center.y as i64 - reach,
            center.z as i64 - reach,
        ];
        let hi = [
            center.x as i64 + reach,
            center.y as i64 + reach,
            center.z as i64 + reach,
        ];
        let r2 = radius * radius;
        self.collect_range(lo, hi, |p| (p - point).norm_squared() <= r2)
    }

    /// Indices of points inside `aabb`, in ascending order.
    pub fn query_aabb(&self, aabb: &Aabb) -> Vec<u32> {
        if self.cells.is_empty() {
            return Vec::new();
        }
        let lo = self.cell_of(&aabb.min);
        let hi = self.cell_of(&aabb.max);
        self.collect_range(
            [lo.x as i64, lo.y as i64, lo.z as i64],
            [hi.x as i64, hi.y as i64, hi.z as i64],
            |p| aabb.contains(p),
        )
    }

    /// Members of the cells in the inclusive range `lo..=hi` that pass `keep`.
    ///
    /// Walks the occupied cells instead of the range when the range holds more
    /// cells than the map, so the cost is bounded by the index size.
    fn collect_range(
        &self,
        lo: [i64; 3],
        hi: [i64; 3],
        keep: impl Fn(&Point3<f64>) -> bool,
    ) -> Vec<u32> {
        let extent = |axis: usize| (hi[axis] - lo[axis] + 1).max(0) as u128;
        let span = extent(0) * extent(1) * extent(2);
        let in_range = |c: &CellCoord| {
            (lo[0]..=hi[0]).contains(&(c.x as i64))
                && (lo[1]..=hi[1]).contains(&(c.y as i64))
                && (lo[2]..=hi[2]).contains(&(c.z as i64))
        };
        let mut result = Vec::new();
        let mut take = |members: &[u32]| {
            result.extend(members.iter().copied().filter(|&i| {
                self.positions.get(i as usize).is_some_and(&keep)
            }));
        };

        if span > self.cells.len() as u128 {
            for (cell, members) in &self.cells {
                if in_range(cell) {
                    take(members);
                }
            }
        } else {
            for z in lo[2]..=hi[2] {
                for y in lo[1]..=hi[1] {
                    for x in lo[0]..=hi[0] {
                        let (Ok(x), Ok(y), Ok(z)) =
                            (i32::try_from(x), i32::try_from(y), i32::try_from(z))
                        else {
                            continue;
                        };
                        if let Some(members) = self.cells.get(&CellCoord::new(x, y, z)) {
                            take(members);
                        }
                    }
                }
            }
        }
        result.sort_unstable();
        result
    }

    /// Nearest indexed point within `max_radius`.
    pub fn nearest(&self, point: &Point3<f64>, max_radius: f64) -> Option<(u32, f64)> {
        self.query(point, max_radius)
            .into_iter()
            .map(|i| (i, (self.positions[i as usize] - point).norm()))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }
}

#[inline]
fn cell_of(p: &Point3<f64>, cell_size: f64) -> CellCoord {
    CellCoord::new(
        (p.x / cell_size).floor() as i32,
        (p.y / cell_size).floor() as i32,
        (p.z / cell_size).floor() as i32,
    )
}
