//! Surface reconstruction from point clouds.
//!
//! The pipeline is: load a point cloud, estimate oriented normals, run Poisson surface
//! reconstruction and write the resulting mesh. The Poisson solver itself comes from the
//! `poisson_reconstruction` crate.
//!
//! ```no_run
//! use photopipe::reconstruct::*;
//! use std::path::Path;
//!
//! let summary = reconstruct(
//!     Path::new("fused.ply"),
//!     Path::new("out"),
//!     &ReconstructOptions::default(),
//! )
//! .unwrap();
//! println!("{}", summary);
//! ```

extern crate nalgebra as na;
extern crate poisson_reconstruction;
extern crate rayon;

use log::{debug, info, warn};
use poisson_reconstruction::PoissonReconstruction;
use rayon::prelude::*;

use std::path::{Path, PathBuf};

use crate::mesh::TriangleMesh;
use crate::pointcloud::{estimate_normals, index_points, neighbors, PointCloud, SearchParam};
use crate::Error;

/// Name of the mesh written by [reconstruct].
pub const MESH_FILENAME: &str = "reconstructed_mesh.ply";

/// Settings of the Poisson solver.
///
/// The run time grows roughly fourfold with every extra level of `depth`, since the finest grid
/// follows the surface. With optimizations a cloud of a few hundred thousand points takes minutes
/// at the default depth of 9; depth 7 or 8 gives a quick preview.
#[derive(Debug, Clone, Copy)]
pub struct PoissonParams {
    /// Maximum octree depth. Each extra level doubles the resolution of the mesh along every
    /// axis.
    pub depth: usize,
    /// Octree depth used to estimate the sampling density of the input. Clamped to `depth`.
    /// Lower values tolerate holes and uneven sampling better.
    pub density_estimation_depth: usize,
    /// Weight pulling the surface towards the input points. 0 is unscreened Poisson, which is
    /// much cheaper to solve.
    pub screening: f64,
    /// Conjugate gradient iterations per octree level.
    pub max_relaxation_iters: usize,
    /// Radius in which input points are counted to get the density of each output vertex.
    pub density_radius: f64,
}

impl Default for PoissonParams {
    fn default() -> Self {
        PoissonParams {
            depth: 9,
            density_estimation_depth: 5,
            screening: 0.0,
            max_relaxation_iters: 8,
            density_radius: 0.1,
        }
    }
}

/// Count the input points within `radius` of every mesh vertex. Vertices far from any sample
/// get a density of 0; they come from the solver extrapolating the surface.
pub fn vertex_densities(mesh: &TriangleMesh, cloud: &PointCloud, radius: f64) -> Vec<f64> {
    let tree = index_points(&cloud.points);
    mesh.vertices
        .par_iter()
        .map(|v| neighbors(&tree, *v, SearchParam::Radius(radius)).len() as f64)
        .collect()
}

/// Run Poisson surface reconstruction on a cloud with normals.
///
/// Returns the mesh and a density value for each of its vertices.
pub fn reconstruct_poisson(
    cloud: &PointCloud,
    params: &PoissonParams,
) -> Result<(TriangleMesh, Vec<f64>), Error> {
    let normals = cloud
        .normals
        .as_ref()
        .ok_or_else(|| Error::Reconstruction("point cloud has no normals".to_string()))?;
    if cloud.is_empty() {
        return Err(Error::Reconstruction("point cloud is empty".to_string()));
    }
    let depth = params.depth.max(1);

    let poisson = PoissonReconstruction::from_points_and_normals(
        &cloud.points,
        normals,
        params.screening,
        params.density_estimation_depth.min(depth),
        depth,
        params.max_relaxation_iters,
    );
    let buffers = poisson.reconstruct_mesh_buffers();
    debug!(
        "Marching cubes produced {} vertices and {} indices",
        buffers.vertices().len(),
        buffers.indices().len()
    );

    let mesh = TriangleMesh::from_buffers(buffers.vertices(), buffers.indices());
    if mesh.is_empty() {
        return Err(Error::Reconstruction("no surface was extracted".to_string()));
    }
    let densities = vertex_densities(&mesh, cloud, params.density_radius);

    Ok((mesh, densities))
}

#[derive(Debug, Clone)]
pub struct ReconstructOptions {
    /// Neighborhood used for normal estimation.
    pub search: SearchParam,
    pub poisson: PoissonParams,
    /// Remove vertices below this density quantile. `None` keeps the mesh as reconstructed.
    pub density_quantile: Option<f64>,
    /// Also write the cloud with its estimated normals here.
    pub normals_out: Option<PathBuf>,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        ReconstructOptions {
            search: SearchParam::default(),
            poisson: PoissonParams::default(),
            density_quantile: None,
            normals_out: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconstructSummary {
    pub num_points: usize,
    pub num_vertices: usize,
    pub num_triangles: usize,
    pub output: PathBuf,
}

impl std::fmt::Display for ReconstructSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Loaded point cloud with {} points", self.num_points)?;
        writeln!(
            f,
            "Mesh created with {} vertices and {} triangles",
            self.num_vertices, self.num_triangles
        )?;
        write!(f, "Mesh saved to {}", self.output.display())
    }
}

/// Reconstruct a mesh from the point cloud at `input` and write it to
/// `output_dir/reconstructed_mesh.ply`, replacing any previous result.
pub fn reconstruct(
    input: &Path,
    output_dir: &Path,
    opts: &ReconstructOptions,
) -> Result<ReconstructSummary, Error> {
    let mut cloud = PointCloud::from_ply(input)?;
    info!("Loaded point cloud with {} points", cloud.len());

    estimate_normals(&mut cloud, opts.search);
    info!("Estimated normals with {:?}", opts.search);
    if let Some(path) = &opts.normals_out {
        cloud.write_ply(path)?;
        info!("Wrote oriented point cloud to {}", path.display());
    }

    let (mut mesh, densities) = reconstruct_poisson(&cloud, &opts.poisson)?;
    info!(
        "Mesh created with {} vertices and {} triangles",
        mesh.num_vertices(),
        mesh.num_triangles()
    );

    if let Some(q) = opts.density_quantile {
        let before = mesh.num_vertices();
        mesh.remove_low_density(&densities, q);
        info!(
            "Removed {} low density vertices",
            before - mesh.num_vertices()
        );
        if mesh.is_empty() {
            warn!("Density trimming removed every triangle");
        }
    }

    std::fs::create_dir_all(output_dir)?;
    let output = output_dir.join(MESH_FILENAME);
    mesh.write_ply(&output)?;
    info!("Mesh saved to {}", output.display());

    Ok(ReconstructSummary {
        num_points: cloud.len(),
        num_vertices: mesh.num_vertices(),
        num_triangles: mesh.num_triangles(),
        output: output,
    })
}

#[cfg(test)]
use na::Point3;

/// Coarse settings that keep a small sphere fast to reconstruct.
#[cfg(test)]
fn fast_options() -> ReconstructOptions {
    ReconstructOptions {
        search: SearchParam::Hybrid {
            radius: 0.2,
            max_nn: 30,
        },
        poisson: PoissonParams {
            depth: 5,
            density_estimation_depth: 3,
            ..PoissonParams::default()
        },
        ..ReconstructOptions::default()
    }
}

#[test]
fn test_default_parameters() {
    let opts = ReconstructOptions::default();
    assert_eq!(opts.poisson.depth, 9);
    assert!(opts.poisson.density_estimation_depth <= opts.poisson.depth);
    assert_eq!(
        opts.search,
        SearchParam::Hybrid {
            radius: 0.1,
            max_nn: 30
        }
    );
    assert_eq!(opts.density_quantile, None);
    assert_eq!(opts.normals_out, None);
}

#[test]
fn test_reconstruct_sphere() {
    use crate::pointcloud::fibonacci_sphere;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sphere.ply");
    PointCloud::new(fibonacci_sphere(2000, 1.0))
        .write_ply(&input)
        .unwrap();

    let out = dir.path().join("out");
    let summary = reconstruct(&input, &out, &fast_options()).unwrap();
    assert_eq!(summary.num_points, 2000);
    assert!(summary.num_vertices > 0);
    assert!(summary.num_triangles > 0);
    assert_eq!(summary.output, out.join(MESH_FILENAME));

    let mesh = TriangleMesh::from_ply(&summary.output).unwrap();
    assert_eq!(mesh.num_vertices(), summary.num_vertices);
    assert_eq!(mesh.num_triangles(), summary.num_triangles);

    // the surface should hug the samples
    let mean_radius = mesh
        .vertices
        .iter()
        .map(|v| v.coords.norm())
        .sum::<f64>()
        / mesh.num_vertices() as f64;
    assert!(
        (mean_radius - 1.0).abs() < 0.15,
        "mean radius {}",
        mean_radius
    );
}

#[test]
fn test_reconstruct_requires_normals() {
    let cloud = PointCloud::new(vec![Point3::new(0.0, 0.0, 0.0)]);
    match reconstruct_poisson(&cloud, &PoissonParams::default()) {
        Err(Error::Reconstruction(_)) => (),
        other => panic!("expected a reconstruction error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_missing_input() {
    let dir = tempfile::tempdir().unwrap();
    let result = reconstruct(
        &dir.path().join("nope.ply"),
        dir.path(),
        &ReconstructOptions::default(),
    );
    assert!(matches!(result, Err(Error::IOError(_))));
    assert!(!dir.path().join(MESH_FILENAME).exists());
}

#[test]
fn test_vertex_densities() {
    let cloud = PointCloud::new(vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(0.05, 0.0, 0.0),
        Point3::new(3.0, 0.0, 0.0),
    ]);
    let mesh = TriangleMesh {
        vertices: vec![Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0)],
        triangles: vec![],
    };
    assert_eq!(vertex_densities(&mesh, &cloud, 0.1), vec![2.0, 0.0]);
}
