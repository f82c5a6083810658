//! Mesh file I/O: STL and OBJ in, binary and ASCII STL out.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;

use nalgebra::{Point3, Vector3};
use tracing::{debug, info, warn};

use crate::error::{DentalError, DentalResult};
use crate::types::{BufferLayout, Mesh, Triangle, Vertex};

/// Supported mesh file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshFormat {
    Stl,
    Obj,
}

impl MeshFormat {
    /// Detect format from file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .and_then(|ext| match ext.as_str() {
                "stl" => Some(MeshFormat::Stl),
                "obj" => Some(MeshFormat::Obj),
                _ => None,
            })
    }
}

/// Load a mesh from file, auto-detecting format from extension.
pub fn load_mesh(path: &Path) -> DentalResult<Mesh> {
    let format = MeshFormat::from_path(path).ok_or_else(|| {
        DentalError::unsupported_format(path.extension().and_then(|e| e.to_str()).map(String::from))
    })?;

    info!(path = %path.display(), ?format, "Loading mesh");

    let mesh = match format {
        MeshFormat::Stl => {
            let file = File::open(path).map_err(|e| DentalError::io_read(path, e))?;
            parse_stl(&mut BufReader::new(file), path)?
        }
        MeshFormat::Obj => load_obj(path)?,
    };

    finish_load(mesh, path)
}

/// Decode STL bytes (binary or ASCII), e.g. a downloaded segment.
///
/// `origin` names the source in error messages.
pub fn read_stl_bytes(bytes: &[u8], origin: &str) -> DentalResult<Mesh> {
    let mesh = parse_stl(&mut Cursor::new(bytes), Path::new(origin))?;
    finish_load(mesh, Path::new(origin))
}

fn finish_load(mesh: Mesh, path: &Path) -> DentalResult<Mesh> {
    if mesh.vertices.is_empty() || mesh.faces.is_empty() {
        return Err(DentalError::empty_mesh(format!(
            "{} has no vertices or faces",
            path.display()
        )));
    }
    mesh.validate_indices()?;

    if let Some(bounds) = mesh.bounds() {
        let dims = bounds.size();
        info!(
            vertices = mesh.vertex_count(),
            faces = mesh.face_count(),
            "Loaded mesh"
        );
        debug!(
            "Dimensions: {:.1} x {:.1} x {:.1}",
            dims.x, dims.y, dims.z
        );
        let max_dim = dims.x.max(dims.y).max(dims.z);
        if max_dim < 0.1 {
            warn!(max_dim, "Mesh is tiny; scans are expected in millimetres");
        }
    }
    Ok(mesh)
}

/// Parse STL into an indexed mesh; `stl_io` merges shared corners.
fn parse_stl<R: Read + Seek>(reader: &mut R, path: &Path) -> DentalResult<Mesh> {
    let stl = stl_io::read_stl(reader).map_err(|e| DentalError::parse_error(path, e.to_string()))?;

    let mut mesh = Mesh::with_layout(BufferLayout::Indexed, stl.vertices.len(), stl.faces.len());
    mesh.vertices.extend(
        stl.vertices
            .iter()
            .map(|v| Vertex::from_coords(v.0[0] as f64, v.0[1] as f64, v.0[2] as f64)),
    );

    let mut degenerate = 0usize;
    for face in &stl.faces {
        let [a, b, c] = face.vertices.map(|i| i as u32);
        if a != b && b != c && a != c {
            mesh.faces.push([a, b, c]);
        } else {
            degenerate += 1;
        }
    }
    if degenerate > 0 {
        debug!(degenerate, "Skipped collapsed STL triangles");
    }

    mesh.compute_vertex_normals();
    Ok(mesh)
}

fn load_obj(path: &Path) -> DentalResult<Mesh> {
    let (models, _materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
    )
    .map_err(|e| DentalError::parse_error(path, e.to_string()))?;

    if models.is_empty() {
        return Err(DentalError::empty_mesh("OBJ file contains no models"));
    }

    let mut mesh = Mesh::new();
    for model in &models {
        let offset = mesh.vertices.len() as u32;
        let obj = &model.mesh;
        mesh.vertices.extend(obj.positions.chunks_exact(3).map(|c| {
            Vertex::from_coords(c[0] as f64, c[1] as f64, c[2] as f64)
        }));
        mesh.faces.extend(
            obj.indices
                .chunks_exact(3)
                .map(|c| [c[0] + offset, c[1] + offset, c[2] + offset]),
        );
        debug!(model = %model.name, faces = obj.indices.len() / 3, "OBJ model loaded");
    }

    mesh.compute_vertex_normals();
    Ok(mesh)
}

fn stl_triangles(mesh: &Mesh) -> Vec<stl_io::Triangle> {
    mesh.triangles()
        .map(|t| {
            let n = t.normal().unwrap_or_else(Vector3::zeros);
            stl_io::Triangle {
                normal: stl_io::Normal::new([n.x as f32, n.y as f32, n.z as f32]),
                vertices: [t.v0, t.v1, t.v2]
                    .map(|v| stl_io::Vertex::new([v.x as f32, v.y as f32, v.z as f32])),
            }
        })
        .collect()
}

/// Save mesh to STL file (binary format).
pub fn save_stl(mesh: &Mesh, path: &Path) -> DentalResult<()> {
    info!(path = %path.display(), "Saving mesh");

    let file = File::create(path).map_err(|e| DentalError::io_write(path, e))?;
    let mut writer = BufWriter::new(file);
    stl_io::write_stl(&mut writer, stl_triangles(mesh).iter())
        .map_err(|e| DentalError::io_write(path, e))?;
    writer.flush().map_err(|e| DentalError::io_write(path, e))?;

    info!(faces = mesh.face_count(), path = %path.display(), "Saved STL");
    Ok(())
}

/// Binary STL encoding of `mesh`.
pub fn stl_bytes(mesh: &Mesh) -> DentalResult<Vec<u8>> {
    let mut out = Vec::with_capacity(84 + 50 * mesh.face_count());
    stl_io::write_stl(&mut out, stl_triangles(mesh).iter())
        .map_err(|e| DentalError::io_write("<memory>", e))?;
    Ok(out)
}

/// ASCII STL listing of `triangles`: one facet with its normal and three
/// vertices per triangle.
pub fn write_ascii_stl<W: Write>(
    writer: &mut W,
    name: &str,
    triangles: &[[Point3<f64>; 3]],
) -> std::io::Result<()> {
    writeln!(writer, "solid {}", name)?;
    for [a, b, c] in triangles {
        let n = Triangle::new(*a, *b, *c).normal().unwrap_or_else(Vector3::zeros);
        writeln!(writer, "  facet normal {} {} {}", n.x, n.y, n.z)?;
        writeln!(writer, "    outer loop")?;
        for v in [a, b, c] {
            writeln!(writer, "      vertex {} {} {}", v.x, v.y, v.z)?;
        }
        writeln!(writer, "    endloop")?;
        writeln!(writer, "  endfacet")?;
    }
    writeln!(writer, "endsolid {}", name)
}

/// [`write_ascii_stl`] into a file.
pub fn save_ascii_stl(path: &Path, name: &str, triangles: &[[Point3<f64>; 3]]) -> DentalResult<()> {
    let file = File::create(path).map_err(|e| DentalError::io_write(path, e))?;
    let mut writer = BufWriter::new(file);
    write_ascii_stl(&mut writer, name, triangles)
        .and_then(|()| writer.flush())
        .map_err(|e| DentalError::io_write(path, e))?;
    debug!(triangles = triangles.len(), path = %path.display(), "Saved ASCII STL");
    Ok(())
}
