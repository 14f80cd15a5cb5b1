//! Indexed triangle meshes.

extern crate itertools;
extern crate nalgebra as na;
extern crate ply_rs;

use itertools::Itertools;
use na::Point3;
use ply_rs::parser::Parser;
use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
    ScalarType,
};
use ply_rs::writer::Writer;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::Error;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangleMesh {
    pub vertices: Vec<Point3<f64>>,
    /// Counter-clockwise vertex indices of each face.
    pub triangles: Vec<[usize; 3]>,
}

impl TriangleMesh {
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_triangles(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Build a mesh from a vertex buffer and a flat index buffer, three indices per face. Faces
    /// that reuse a vertex are dropped, as are vertices no face refers to.
    pub fn from_buffers(vertices: &[Point3<f64>], indices: &[u32]) -> Self {
        let triangles = indices
            .chunks_exact(3)
            .map(|t| [t[0] as usize, t[1] as usize, t[2] as usize])
            .filter(|t| t[0] != t[1] && t[1] != t[2] && t[0] != t[2])
            .collect::<Vec<_>>();
        let mut unused = vec![true; vertices.len()];
        for t in triangles.iter() {
            for &i in t.iter() {
                unused[i] = false;
            }
        }

        let mut mesh = TriangleMesh {
            vertices: vertices.to_vec(),
            triangles: triangles,
        };
        mesh.remove_vertices_by_mask(&unused);
        mesh
    }

    /// Remove the vertices where `mask` is true along with every face touching them. Remaining
    /// vertices keep their relative order.
    pub fn remove_vertices_by_mask(&mut self, mask: &[bool]) {
        let mut remap = vec![std::usize::MAX; self.vertices.len()];
        let mut next = 0;
        for (i, removed) in mask.iter().enumerate() {
            if !removed {
                remap[i] = next;
                next += 1;
            }
        }

        self.vertices = self
            .vertices
            .iter()
            .zip(mask.iter())
            .filter(|(_, removed)| !**removed)
            .map(|(v, _)| *v)
            .collect();
        self.triangles = self
            .triangles
            .iter()
            .filter(|t| t.iter().all(|&i| !mask[i]))
            .map(|t| [remap[t[0]], remap[t[1]], remap[t[2]]])
            .collect();
    }

    /// Drop vertices whose density is below the `quantile` (in [0, 1]) of all densities.
    ///
    /// Poisson reconstruction extrapolates surface where the input has no samples; those regions
    /// have low density. Returns the densities of the remaining vertices.
    pub fn remove_low_density(&mut self, densities: &[f64], quantile: f64) -> Vec<f64> {
        let threshold = quantile_of(densities, quantile);
        let mask = densities.iter().map(|&d| d < threshold).collect::<Vec<_>>();
        self.remove_vertices_by_mask(&mask);
        densities
            .iter()
            .zip(mask.iter())
            .filter(|(_, removed)| !**removed)
            .map(|(d, _)| *d)
            .collect()
    }

    /// Write the mesh as a binary .ply with a `vertex` and a `face` element.
    pub fn write_ply(&self, path: &Path) -> Result<(), Error> {
        let mut ply = Ply::<DefaultElement>::new();
        ply.header.encoding = Encoding::BinaryLittleEndian;
        let mut vertex_element = ElementDef::new("vertex".to_string());
        for name in ["x", "y", "z"].iter() {
            vertex_element.properties.add(PropertyDef::new(
                name.to_string(),
                PropertyType::Scalar(ScalarType::Float),
            ));
        }
        ply.header.elements.add(vertex_element);
        let mut face_element = ElementDef::new("face".to_string());
        face_element.properties.add(PropertyDef::new(
            "vertex_indices".to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::Int),
        ));
        ply.header.elements.add(face_element);

        let vertices = self
            .vertices
            .iter()
            .map(|v| {
                let mut e = DefaultElement::new();
                e.insert("x".to_string(), Property::Float(v.x as f32));
                e.insert("y".to_string(), Property::Float(v.y as f32));
                e.insert("z".to_string(), Property::Float(v.z as f32));
                e
            })
            .collect();
        ply.payload.insert("vertex".to_string(), vertices);

        let faces = self
            .triangles
            .iter()
            .map(|t| {
                let mut e = DefaultElement::new();
                e.insert(
                    "vertex_indices".to_string(),
                    Property::ListInt(t.iter().map(|&i| i as i32).collect()),
                );
                e
            })
            .collect();
        ply.payload.insert("face".to_string(), faces);

        let mut file = BufWriter::new(File::create(path)?);
        let writer = Writer::new();
        writer.write_ply(&mut file, &mut ply)?;
        Ok(())
    }

    /// Read a triangle mesh from a .ply file. Polygons with more than three corners are fanned
    /// into triangles.
    pub fn from_ply(path: &Path) -> Result<Self, Error> {
        let mut file = BufReader::new(File::open(path)?);
        let parser = Parser::<DefaultElement>::new();
        let ply = parser
            .read_ply(&mut file)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))?;

        let coord = |e: &DefaultElement, k: &str| match e.get(k) {
            Some(Property::Float(x)) => Some(*x as f64),
            Some(Property::Double(x)) => Some(*x),
            _ => None,
        };
        let vertices = ply
            .payload
            .get("vertex")
            .map(|vs| {
                vs.iter()
                    .map(|v| {
                        Some(Point3::new(coord(v, "x")?, coord(v, "y")?, coord(v, "z")?))
                    })
                    .collect::<Option<Vec<_>>>()
            })
            .unwrap_or_else(|| Some(Vec::new()))
            .ok_or_else(|| Error::ParseError(format!("{}: bad vertex", path.display())))?;

        let mut triangles = Vec::new();
        for face in ply.payload.get("face").into_iter().flatten() {
            let indices: Vec<usize> = match face
                .get("vertex_indices")
                .or_else(|| face.get("vertex_index"))
            {
                Some(Property::ListInt(l)) => l.iter().map(|&i| i as usize).collect(),
                Some(Property::ListUInt(l)) => l.iter().map(|&i| i as usize).collect(),
                _ => return Err(Error::ParseError(format!("{}: bad face", path.display()))),
            };
            if indices.iter().any(|&i| i >= vertices.len()) {
                return Err(Error::ParseError(format!(
                    "{}: face index out of range",
                    path.display()
                )));
            }
            if let Some((&first, rest)) = indices.split_first() {
                for (&b, &c) in rest.iter().tuple_windows() {
                    triangles.push([first, b, c]);
                }
            }
        }

        Ok(TriangleMesh {
            vertices: vertices,
            triangles: triangles,
        })
    }
}

/// Linearly interpolated quantile of `values`, `q` clamped to [0, 1].
pub fn quantile_of(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sorted = values
        .iter()
        .cloned()
        .sorted_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .collect::<Vec<_>>();
    let pos = q.max(0.0).min(1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[cfg(test)]
fn two_triangle_square() -> TriangleMesh {
    TriangleMesh {
        vertices: vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ],
        triangles: vec![[0, 1, 2], [0, 2, 3]],
    }
}

#[test]
fn test_from_buffers() {
    let square = two_triangle_square();
    let mut vertices = square.vertices.clone();
    // left over from a face that was never emitted
    vertices.push(Point3::new(5.0, 5.0, 5.0));
    let mesh = TriangleMesh::from_buffers(&vertices, &[0, 1, 2, 0, 2, 3]);
    assert_eq!(mesh, square);
}

#[test]
fn test_degenerate_faces_dropped() {
    let square = two_triangle_square();
    let mesh = TriangleMesh::from_buffers(&square.vertices, &[0, 1, 0, 1, 2, 3, 3, 3]);
    assert_eq!(mesh.triangles, vec![[0, 1, 2]]);
    assert_eq!(mesh.num_vertices(), 3);

    let empty = TriangleMesh::from_buffers(&square.vertices, &[0, 1, 0]);
    assert!(empty.is_empty());
    assert_eq!(empty.num_vertices(), 0);
}

#[test]
fn test_remove_vertices_reindexes() {
    let mut mesh = two_triangle_square();
    mesh.remove_vertices_by_mask(&[false, true, false, false]);
    assert_eq!(mesh.num_vertices(), 3);
    assert_eq!(mesh.triangles, vec![[0, 1, 2]]);
    assert_eq!(mesh.vertices[1], Point3::new(1.0, 1.0, 0.0));
}

#[test]
fn test_remove_low_density() {
    let mut mesh = two_triangle_square();
    let kept = mesh.remove_low_density(&[5.0, 6.0, 7.0, 1.0], 0.2);
    assert_eq!(kept, vec![5.0, 6.0, 7.0]);
    assert_eq!(mesh.triangles, vec![[0, 1, 2]]);

    let mut untouched = two_triangle_square();
    untouched.remove_low_density(&[5.0, 6.0, 7.0, 1.0], 0.0);
    assert_eq!(untouched, two_triangle_square());
}

#[test]
fn test_quantile() {
    assert_eq!(quantile_of(&[3.0, 1.0, 2.0], 0.5), 2.0);
    assert_eq!(quantile_of(&[1.0, 2.0], 0.25), 1.25);
    assert_eq!(quantile_of(&[], 0.5), 0.0);
}

#[test]
fn test_mesh_ply_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mesh.ply");
    let mesh = two_triangle_square();
    mesh.write_ply(&path).unwrap();
    let read = TriangleMesh::from_ply(&path).unwrap();
    assert_eq!(read, mesh);
}
