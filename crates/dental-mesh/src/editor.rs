//! Triangle-set editing between a source scan and tooth segments.
//!
//! Selections are vertex indices into the source mesh. Segments extracted
//! from the source remember which source faces they hold, so later edits
//! work in index space. Imported segments have no such mapping and fall
//! back to matching vertices by rounded coordinates.

use std::collections::BTreeSet;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info};

use crate::error::{DentalError, DentalResult};
use crate::geometry::{PositionKey, position_key};
use crate::segment::ToothSegment;
use crate::types::{BufferLayout, Mesh, Vertex};

/// Geometry for a segment: a compact mesh plus its source faces, if known.
#[derive(Debug, Clone)]
pub struct SegmentGeometry {
    pub mesh: Mesh,
    /// Source face indices, ascending, parallel to `mesh.faces`.
    pub source_faces: Option<Vec<u32>>,
}

impl SegmentGeometry {
    /// Geometry with no link back to a source scan.
    pub fn imported(mesh: Mesh) -> Self {
        Self {
            mesh,
            source_faces: None,
        }
    }

    /// Compact copy of the given source faces.
    ///
    /// Indexed sources keep only referenced vertices; triangle soups copy
    /// three vertices per face. Normals are recomputed. Out-of-range face
    /// indices are skipped.
    pub fn from_faces(source: &Mesh, faces: &[u32]) -> Self {
        let mut faces: Vec<u32> = faces
            .iter()
            .copied()
            .filter(|&f| (f as usize) < source.faces.len())
            .collect();
        faces.sort_unstable();
        faces.dedup();

        let mut mesh = match source.layout {
            BufferLayout::Indexed => compact_indexed(source, &faces),
            BufferLayout::NonIndexed => {
                let mut mesh =
                    Mesh::with_layout(BufferLayout::NonIndexed, faces.len() * 3, faces.len());
                for &f in &faces {
                    let base = mesh.vertices.len() as u32;
                    for &vi in &source.faces[f as usize] {
                        mesh.vertices.push(plain_vertex(&source.vertices[vi as usize]));
                    }
                    mesh.faces.push([base, base + 1, base + 2]);
                }
                mesh
            }
        };
        mesh.compute_vertex_normals();

        Self {
            mesh,
            source_faces: Some(faces),
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.mesh.faces.len()
    }
}

/// Result of [`SegmentEditor::extract`].
#[derive(Debug, Clone)]
pub struct ExtractedSegment {
    pub geometry: SegmentGeometry,
    /// Selected vertices that ended up in no extracted triangle.
    pub dropped_vertices: usize,
}

impl std::fmt::Display for ExtractedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Extracted {} triangles, {} vertices",
            self.geometry.triangle_count(),
            self.geometry.mesh.vertex_count()
        )?;
        if self.dropped_vertices > 0 {
            write!(f, " ({} stray selected vertices dropped)", self.dropped_vertices)?;
        }
        Ok(())
    }
}

/// Extract, add and remove triangle sets against one source mesh.
#[derive(Debug, Clone, Copy)]
pub struct SegmentEditor<'a> {
    source: &'a Mesh,
}

impl<'a> SegmentEditor<'a> {
    pub fn new(source: &'a Mesh) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &'a Mesh {
        self.source
    }

    /// Every source triangle with at least two of its three vertices selected.
    ///
    /// Two-of-three over-includes boundary triangles, which avoids ragged edges.
    /// `None` when no triangle qualifies.
    pub fn extract(&self, selection: &BTreeSet<u32>) -> Option<ExtractedSegment> {
        let faces: Vec<u32> = self
            .source
            .faces
            .iter()
            .enumerate()
            .filter(|(_, face)| face.iter().filter(|&&v| selection.contains(&v)).count() >= 2)
            .map(|(i, _)| i as u32)
            .collect();

        if faces.is_empty() {
            debug!(selected = selection.len(), "No triangle has two selected vertices");
            return None;
        }

        let used: HashSet<u32> = faces
            .iter()
            .flat_map(|&f| self.source.faces[f as usize])
            .collect();
        let dropped_vertices = selection.iter().filter(|v| !used.contains(*v)).count();

        let geometry = SegmentGeometry::from_faces(self.source, &faces);
        info!(
            selected = selection.len(),
            triangles = geometry.triangle_count(),
            dropped_vertices,
            "Extracted segment"
        );
        Some(ExtractedSegment {
            geometry,
            dropped_vertices,
        })
    }

    /// Grow `target` by the source triangles touching the selection.
    ///
    /// A triangle qualifies when at least one vertex is selected and not all
    /// three vertices are already part of the segment.
    pub fn add_vertices(
        &self,
        target: &ToothSegment,
        selection: &BTreeSet<u32>,
    ) -> DentalResult<SegmentGeometry> {
        let geometry = match target.source_faces.as_deref() {
            Some(current) => self.add_indexed(current, selection),
            None => self.add_by_position(&target.mesh, selection),
        };
        match geometry {
            Some((geometry, added)) => {
                info!(segment = %target.id, added, triangles = geometry.triangle_count(), "Added to segment");
                Ok(geometry)
            }
            None => Err(DentalError::NothingToAdd { segment: target.id }),
        }
    }

    /// Drop every triangle of `target` that references a selected vertex.
    ///
    /// Fails without touching the segment when nothing matches or when
    /// every triangle would go.
    pub fn remove_vertices(
        &self,
        target: &ToothSegment,
        selection: &BTreeSet<u32>,
    ) -> DentalResult<SegmentGeometry> {
        let total = target.mesh.faces.len();
        let (geometry, removed) = match target.source_faces.as_deref() {
            Some(current) => {
                let hit = self.selection_hit(selection);
                let kept: Vec<u32> = current
                    .iter()
                    .copied()
                    .filter(|&f| {
                        self.source
                            .faces
                            .get(f as usize)
                            .is_some_and(|face| !face.iter().any(|&v| hit(v)))
                    })
                    .collect();
                let removed = current.len() - kept.len();
                (SegmentGeometry::from_faces(self.source, &kept), removed)
            }
            None => {
                let keys = self.selection_keys(selection);
                let mesh = &target.mesh;
                let kept: Vec<[u32; 3]> = mesh
                    .faces
                    .iter()
                    .copied()
                    .filter(|face| {
                        !face
                            .iter()
                            .any(|&v| keys.contains(&position_key(&mesh.vertices[v as usize].position)))
                    })
                    .collect();
                let removed = total - kept.len();
                let mut rebuilt = rebuild(mesh, &kept);
                rebuilt.compute_vertex_normals();
                (SegmentGeometry::imported(rebuilt), removed)
            }
        };

        if removed == 0 {
            return Err(DentalError::NothingToRemove { segment: target.id });
        }
        if geometry.mesh.faces.is_empty() {
            return Err(DentalError::WouldEmptySegment {
                segment: target.id,
                removed,
            });
        }
        info!(segment = %target.id, removed, remaining = geometry.triangle_count(), "Removed from segment");
        Ok(geometry)
    }

    fn add_indexed(&self, current: &[u32], selection: &BTreeSet<u32>) -> Option<(SegmentGeometry, usize)> {
        let current_set: HashSet<u32> = current.iter().copied().collect();
        let present = self.vertex_membership(current);
        let hit = self.selection_hit(selection);

        let new_faces: Vec<u32> = self
            .source
            .faces
            .iter()
            .enumerate()
            .filter(|(i, face)| {
                !current_set.contains(&(*i as u32))
                    && face.iter().any(|&v| hit(v))
                    && !face.iter().all(|&v| present(v))
            })
            .map(|(i, _)| i as u32)
            .collect();

        if new_faces.is_empty() {
            return None;
        }
        let added = new_faces.len();
        let mut all = current.to_vec();
        all.extend(new_faces);
        Some((SegmentGeometry::from_faces(self.source, &all), added))
    }

    fn add_by_position(&self, target: &Mesh, selection: &BTreeSet<u32>) -> Option<(SegmentGeometry, usize)> {
        let keys = self.selection_keys(selection);
        let target_keys: HashSet<PositionKey> = target
            .vertices
            .iter()
            .map(|v| position_key(&v.position))
            .collect();

        let candidates: Vec<[u32; 3]> = self
            .source
            .faces
            .iter()
            .copied()
            .filter(|face| {
                let fk = face.map(|v| position_key(&self.source.vertices[v as usize].position));
                fk.iter().any(|k| keys.contains(k)) && !fk.iter().all(|k| target_keys.contains(k))
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut mesh = rebuild(target, &target.faces);
        match mesh.layout {
            BufferLayout::Indexed => {
                let mut by_key: HashMap<PositionKey, u32> = mesh
                    .vertices
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (position_key(&v.position), i as u32))
                    .collect();
                for face in &candidates {
                    let mapped = face.map(|v| {
                        let vertex = &self.source.vertices[v as usize];
                        *by_key.entry(position_key(&vertex.position)).or_insert_with(|| {
                            mesh.vertices.push(plain_vertex(vertex));
                            (mesh.vertices.len() - 1) as u32
                        })
                    });
                    mesh.faces.push(mapped);
                }
            }
            BufferLayout::NonIndexed => {
                for face in &candidates {
                    let base = mesh.vertices.len() as u32;
                    for &v in face {
                        mesh.vertices.push(plain_vertex(&self.source.vertices[v as usize]));
                    }
                    mesh.faces.push([base, base + 1, base + 2]);
                }
            }
        }
        mesh.compute_vertex_normals();
        Some((SegmentGeometry::imported(mesh), candidates.len()))
    }

    /// Selection test that treats coincident soup vertices as one.
    fn selection_hit<'s>(&'s self, selection: &'s BTreeSet<u32>) -> impl Fn(u32) -> bool + 's {
        let keys = match self.source.layout {
            BufferLayout::Indexed => None,
            BufferLayout::NonIndexed => Some(self.selection_keys(selection)),
        };
        move |v| match &keys {
            None => selection.contains(&v),
            Some(keys) => self
                .source
                .vertices
                .get(v as usize)
                .is_some_and(|vx| keys.contains(&position_key(&vx.position))),
        }
    }

    /// Membership test for the vertices of a source face set.
    fn vertex_membership(&self, faces: &[u32]) -> impl Fn(u32) -> bool + '_ {
        let mut indices = HashSet::new();
        let mut keys = HashSet::new();
        for &f in faces {
            if let Some(face) = self.source.faces.get(f as usize) {
                for &v in face {
                    indices.insert(v);
                    keys.insert(position_key(&self.source.vertices[v as usize].position));
                }
            }
        }
        let indexed = self.source.is_indexed();
        move |v| {
            if indexed {
                indices.contains(&v)
            } else {
                self.source
                    .vertices
                    .get(v as usize)
                    .is_some_and(|vx| keys.contains(&position_key(&vx.position)))
            }
        }
    }

    fn selection_keys(&self, selection: &BTreeSet<u32>) -> HashSet<PositionKey> {
        selection
            .iter()
            .filter_map(|&v| self.source.vertices.get(v as usize))
            .map(|v| position_key(&v.position))
            .collect()
    }
}

fn plain_vertex(v: &Vertex) -> Vertex {
    Vertex {
        position: v.position,
        normal: None,
        color: v.color,
    }
}

fn compact_indexed(source: &Mesh, faces: &[u32]) -> Mesh {
    let mut old_to_new: HashMap<u32, u32> = HashMap::new();
    let mut mesh = Mesh::with_layout(BufferLayout::Indexed, 0, faces.len());
    for &f in faces {
        let mapped = source.faces[f as usize].map(|old| {
            *old_to_new.entry(old).or_insert_with(|| {
                mesh.vertices.push(plain_vertex(&source.vertices[old as usize]));
                (mesh.vertices.len() - 1) as u32
            })
        });
        mesh.faces.push(mapped);
    }
    mesh
}

/// Copy of `mesh` restricted to `faces`, keeping its layout.
fn rebuild(mesh: &Mesh, faces: &[[u32; 3]]) -> Mesh {
    let mut out = Mesh::with_layout(mesh.layout, 0, faces.len());
    match mesh.layout {
        BufferLayout::Indexed => {
            let mut old_to_new: HashMap<u32, u32> = HashMap::new();
            for face in faces {
                let mapped = face.map(|old| {
                    *old_to_new.entry(old).or_insert_with(|| {
                        out.vertices.push(plain_vertex(&mesh.vertices[old as usize]));
                        (out.vertices.len() - 1) as u32
                    })
                });
                out.faces.push(mapped);
            }
        }
        BufferLayout::NonIndexed => {
            for face in faces {
                let base = out.vertices.len() as u32;
                for &v in face {
                    out.vertices.push(plain_vertex(&mesh.vertices[v as usize]));
                }
                out.faces.push([base, base + 1, base + 2]);
            }
        }
    }
    out
}
