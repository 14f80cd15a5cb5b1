//! Point clouds loaded from PLY files and per-point normal estimation.

extern crate nalgebra as na;
extern crate ply_rs;
extern crate rayon;
extern crate rstar;

use log::debug;
use na::{Matrix3, Point3, SymmetricEigen, Vector3};
use ply_rs::parser::Parser;
use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
    ScalarType,
};
use ply_rs::writer::Writer;
use rayon::prelude::*;
use rstar::RTree;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::Error;

/// Neighborhood used for normal estimation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchParam {
    /// The `k` nearest neighbors.
    Knn(usize),
    /// All neighbors within `radius`.
    Radius(f64),
    /// At most `max_nn` nearest neighbors, all within `radius`.
    Hybrid { radius: f64, max_nn: usize },
}

impl Default for SearchParam {
    fn default() -> Self {
        SearchParam::Hybrid {
            radius: 0.1,
            max_nn: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Copy)]
pub(crate) struct IndexedPoint {
    pub id: usize,
    pub p: Point3<f64>,
}

impl rstar::Point for IndexedPoint {
    type Scalar = f64;
    const DIMENSIONS: usize = 3;

    fn generate(generator: impl Fn(usize) -> Self::Scalar) -> Self {
        IndexedPoint {
            id: std::usize::MAX,
            p: Point3::new(generator(0), generator(1), generator(2)),
        }
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        match index {
            0 => self.p.x,
            1 => self.p.y,
            2 => self.p.z,
            _ => unreachable!(),
        }
    }

    fn nth_mut(&mut self, _index: usize) -> &mut Self::Scalar {
        unimplemented!()
    }
}

/// Build a spatial index over `points`.
pub(crate) fn index_points(points: &[Point3<f64>]) -> RTree<IndexedPoint> {
    RTree::bulk_load(
        points
            .iter()
            .enumerate()
            .map(|(i, p)| IndexedPoint { id: i, p: *p })
            .collect(),
    )
}

/// Indices of the neighbors of `p` (including `p` itself if it is in the tree).
pub(crate) fn neighbors(tree: &RTree<IndexedPoint>, p: Point3<f64>, param: SearchParam) -> Vec<usize> {
    let query = IndexedPoint {
        id: std::usize::MAX,
        p,
    };
    match param {
        SearchParam::Knn(k) => tree.nearest_neighbor_iter(&query).take(k).map(|q| q.id).collect(),
        SearchParam::Radius(r) => tree
            .locate_within_distance(query, r * r)
            .map(|q| q.id)
            .collect(),
        SearchParam::Hybrid { radius, max_nn } => tree
            .nearest_neighbor_iter(&query)
            .take(max_nn)
            .take_while(|q| na::distance_squared(&q.p, &p) <= radius * radius)
            .map(|q| q.id)
            .collect(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    pub points: Vec<Point3<f64>>,
    pub normals: Option<Vec<Vector3<f64>>>,
    pub colors: Option<Vec<[u8; 3]>>,
}

fn as_f64(prop: &Property) -> Option<f64> {
    match *prop {
        Property::Char(x) => Some(x as f64),
        Property::UChar(x) => Some(x as f64),
        Property::Short(x) => Some(x as f64),
        Property::UShort(x) => Some(x as f64),
        Property::Int(x) => Some(x as f64),
        Property::UInt(x) => Some(x as f64),
        Property::Float(x) => Some(x as f64),
        Property::Double(x) => Some(x),
        _ => None,
    }
}

fn as_u8(prop: &Property) -> Option<u8> {
    match *prop {
        Property::UChar(x) => Some(x),
        // some writers store colors as floats in [0, 1]
        Property::Float(x) => Some((x.max(0.0).min(1.0) * 255.0).round() as u8),
        Property::Double(x) => Some((x.max(0.0).min(1.0) * 255.0).round() as u8),
        _ => as_f64(prop).map(|x| x.max(0.0).min(255.0) as u8),
    }
}

fn get_triple<T>(
    element: &DefaultElement,
    keys: [&str; 3],
    convert: impl Fn(&Property) -> Option<T>,
) -> Option<[T; 3]> {
    let a = convert(element.get(keys[0])?)?;
    let b = convert(element.get(keys[1])?)?;
    let c = convert(element.get(keys[2])?)?;
    Some([a, b, c])
}

impl PointCloud {
    pub fn new(points: Vec<Point3<f64>>) -> Self {
        PointCloud {
            points: points,
            normals: None,
            colors: None,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    /// Load a point cloud from an ASCII or binary .ply file.
    ///
    /// Requires a `vertex` element with `x`, `y`, `z`. Normals (`nx`, `ny`, `nz`) and colors
    /// (`red`, `green`, `blue`) are read when every vertex has them.
    pub fn from_ply(path: &Path) -> Result<Self, Error> {
        let mut file = BufReader::new(File::open(path)?);
        let parser = Parser::<DefaultElement>::new();
        let ply = parser
            .read_ply(&mut file)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))?;

        let vertices = ply.payload.get("vertex").ok_or_else(|| {
            Error::ParseError(format!("{}: no vertex element", path.display()))
        })?;

        let points = vertices
            .iter()
            .map(|v| {
                get_triple(v, ["x", "y", "z"], as_f64)
                    .map(|[x, y, z]| Point3::new(x, y, z))
                    .ok_or_else(|| {
                        Error::ParseError(format!("{}: vertex without x, y, z", path.display()))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if points.is_empty() {
            return Err(Error::EmptyPointCloud(path.display().to_string()));
        }

        let normals = vertices
            .iter()
            .map(|v| get_triple(v, ["nx", "ny", "nz"], as_f64).map(|[x, y, z]| Vector3::new(x, y, z)))
            .collect::<Option<Vec<_>>>();
        let colors = vertices
            .iter()
            .map(|v| get_triple(v, ["red", "green", "blue"], as_u8))
            .collect::<Option<Vec<_>>>();

        debug!(
            "Read {} points from {} (normals: {}, colors: {})",
            points.len(),
            path.display(),
            normals.is_some(),
            colors.is_some()
        );

        Ok(PointCloud {
            points: points,
            normals: normals,
            colors: colors,
        })
    }

    /// Write the cloud as a binary .ply. Normals and colors are included when present.
    pub fn write_ply(&self, path: &Path) -> Result<(), Error> {
        let mut ply = Ply::<DefaultElement>::new();
        ply.header.encoding = Encoding::BinaryLittleEndian;
        let mut point_element = ElementDef::new("vertex".to_string());
        let mut names = vec!["x", "y", "z"];
        if self.normals.is_some() {
            names.extend(&["nx", "ny", "nz"]);
        }
        for name in names.iter() {
            point_element.properties.add(PropertyDef::new(
                name.to_string(),
                PropertyType::Scalar(ScalarType::Double),
            ));
        }
        if self.colors.is_some() {
            for name in ["red", "green", "blue"].iter() {
                point_element.properties.add(PropertyDef::new(
                    name.to_string(),
                    PropertyType::Scalar(ScalarType::UChar),
                ));
            }
        }
        ply.header.elements.add(point_element);

        let vertices = self
            .points
            .iter()
            .enumerate()
            .map(|(i, point)| {
                let mut e = DefaultElement::new();
                e.insert("x".to_string(), Property::Double(point.x));
                e.insert("y".to_string(), Property::Double(point.y));
                e.insert("z".to_string(), Property::Double(point.z));
                if let Some(normals) = &self.normals {
                    e.insert("nx".to_string(), Property::Double(normals[i].x));
                    e.insert("ny".to_string(), Property::Double(normals[i].y));
                    e.insert("nz".to_string(), Property::Double(normals[i].z));
                }
                if let Some(colors) = &self.colors {
                    e.insert("red".to_string(), Property::UChar(colors[i][0]));
                    e.insert("green".to_string(), Property::UChar(colors[i][1]));
                    e.insert("blue".to_string(), Property::UChar(colors[i][2]));
                }
                e
            })
            .collect();
        ply.payload.insert("vertex".to_string(), vertices);

        let mut file = BufWriter::new(File::create(path)?);
        let writer = Writer::new();
        writer.write_ply(&mut file, &mut ply)?;
        Ok(())
    }

    pub fn centroid(&self) -> Point3<f64> {
        let n = self.points.len().max(1) as f64;
        Point3::from(
            self.points
                .iter()
                .fold(Vector3::zeros(), |acc, p| acc + p.coords / n),
        )
    }

    /// Axis aligned bounds as (min, max).
    pub fn extent(&self) -> (Point3<f64>, Point3<f64>) {
        let inf = std::f64::INFINITY;
        self.points.iter().fold(
            (Point3::new(inf, inf, inf), Point3::new(-inf, -inf, -inf)),
            |(lo, hi), p| (lo.inf(p), hi.sup(p)),
        )
    }
}

/// Normal of the plane best fitting `points`: the eigenvector of the smallest eigenvalue of their
/// covariance. `None` when there are too few points to define a plane.
fn fit_normal(points: &[Point3<f64>]) -> Option<Vector3<f64>> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let cov = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = p.coords - mean;
        acc + d * d.transpose()
    }) / n;
    let eig = SymmetricEigen::new(cov);
    let i = eig.eigenvalues.imin();
    let normal = eig.eigenvectors.column(i).into_owned();
    normal.try_normalize(1e-12)
}

/// Estimate a unit normal for every point from the covariance of its neighborhood.
///
/// When the cloud already has normals, each estimate is flipped to agree with the existing one
/// and points whose neighborhood is too small keep it. Otherwise normals point away from the
/// centroid of the cloud, which orients closed scans outwards, and degenerate neighborhoods get
/// +z.
pub fn estimate_normals(cloud: &mut PointCloud, param: SearchParam) {
    let tree = index_points(&cloud.points);
    let centroid = cloud.centroid();
    let points = &cloud.points;
    let prior = cloud.normals.as_ref();

    let normals = points
        .par_iter()
        .enumerate()
        .map(|(i, p)| {
            let hood = neighbors(&tree, *p, param)
                .into_iter()
                .map(|j| points[j])
                .collect::<Vec<_>>();
            let reference = match prior {
                Some(normals) => normals[i],
                None => p - centroid,
            };
            match fit_normal(&hood) {
                Some(n) if n.dot(&reference) < 0.0 => -n,
                Some(n) => n,
                None => prior
                    .and_then(|normals| normals[i].try_normalize(1e-12))
                    .unwrap_or_else(Vector3::z),
            }
        })
        .collect::<Vec<_>>();

    cloud.normals = Some(normals);
}

#[cfg(test)]
pub(crate) fn fibonacci_sphere(n: usize, radius: f64) -> Vec<Point3<f64>> {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - y * y).sqrt();
            let theta = golden * i as f64;
            Point3::new(r * theta.cos() * radius, y * radius, r * theta.sin() * radius)
        })
        .collect()
}

#[test]
fn test_plane_normals() {
    let mut points = Vec::new();
    for i in 0..20 {
        for j in 0..20 {
            points.push(Point3::new(i as f64 * 0.02, j as f64 * 0.02, 1.0));
        }
    }
    let mut cloud = PointCloud::new(points);
    cloud.normals = Some(vec![Vector3::new(0.0, 0.0, -1.0); cloud.len()]);
    estimate_normals(&mut cloud, SearchParam::default());
    for n in cloud.normals.unwrap() {
        assert!((n - Vector3::new(0.0, 0.0, -1.0)).norm() < 1e-6);
    }
}

#[test]
fn test_sphere_normals_point_outwards() {
    let mut cloud = PointCloud::new(fibonacci_sphere(5000, 1.0));
    estimate_normals(&mut cloud, SearchParam::default());
    let normals = cloud.normals.as_ref().unwrap();
    for (p, n) in cloud.points.iter().zip(normals.iter()) {
        assert!((n.norm() - 1.0).abs() < 1e-9);
        assert!(n.dot(&p.coords) > 0.9);
    }
}

#[test]
fn test_isolated_point_gets_default_normal() {
    let mut cloud = PointCloud::new(vec![Point3::new(0.0, 0.0, 0.0), Point3::new(5.0, 0.0, 0.0)]);
    estimate_normals(&mut cloud, SearchParam::default());
    assert_eq!(cloud.normals.unwrap(), vec![Vector3::z(), Vector3::z()]);
}

#[test]
fn test_hybrid_search_limits() {
    let points = (0..100)
        .map(|i| Point3::new(i as f64 * 0.01, 0.0, 0.0))
        .collect::<Vec<_>>();
    let tree = index_points(&points);
    let hybrid = SearchParam::Hybrid {
        radius: 0.105,
        max_nn: 30,
    };
    // 0.105 around the first point holds 11 points, fewer than max_nn
    assert_eq!(neighbors(&tree, points[0], hybrid).len(), 11);
    // in the middle the radius holds 21 points
    assert_eq!(neighbors(&tree, points[50], hybrid).len(), 21);
    let capped = SearchParam::Hybrid {
        radius: 1.0,
        max_nn: 30,
    };
    assert_eq!(neighbors(&tree, points[50], capped).len(), 30);
    assert_eq!(neighbors(&tree, points[50], SearchParam::Knn(5)).len(), 5);
}

#[test]
fn test_ply_roundtrip_keeps_attributes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cloud.ply");
    let mut cloud = PointCloud::new(vec![Point3::new(1.0, 2.0, 3.0), Point3::new(-1.0, 0.5, 0.0)]);
    cloud.normals = Some(vec![Vector3::x(), Vector3::y()]);
    cloud.colors = Some(vec![[255, 0, 0], [0, 0, 255]]);
    cloud.write_ply(&path).unwrap();

    let read = PointCloud::from_ply(&path).unwrap();
    assert_eq!(read.points, cloud.points);
    assert_eq!(read.normals, cloud.normals);
    assert_eq!(read.colors, cloud.colors);
}

#[test]
fn test_ascii_ply_without_normals() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ascii.ply");
    std::fs::write(
        &path,
        "ply\nformat ascii 1.0\nelement vertex 2\nproperty float x\nproperty float y\n\
         property float z\nend_header\n0 0 0\n1 2 3\n",
    )
    .unwrap();
    let cloud = PointCloud::from_ply(&path).unwrap();
    assert_eq!(cloud.len(), 2);
    assert_eq!(cloud.points[1], Point3::new(1.0, 2.0, 3.0));
    assert!(!cloud.has_normals());
}

#[test]
fn test_invalid_ply() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.ply");
    std::fs::write(&path, "this is not a ply file").unwrap();
    match PointCloud::from_ply(&path) {
        Err(Error::ParseError(_)) => (),
        other => panic!("expected a parse error, got {:?}", other),
    }
    match PointCloud::from_ply(&dir.path().join("missing.ply")) {
        Err(Error::IOError(_)) => (),
        other => panic!("expected an io error, got {:?}", other),
    }
}
