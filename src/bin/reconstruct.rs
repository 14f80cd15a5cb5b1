extern crate photopipe;
extern crate structopt;

use photopipe::reconstruct::*;
use photopipe::SearchParam;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "reconstruct")]
/// Reconstruct a triangle mesh from a point cloud with Poisson surface reconstruction.
struct Opt {
    /// Input point cloud in .ply format.
    #[structopt(name = "INPUT", parse(from_os_str))]
    input: std::path::PathBuf,

    /// Directory to write reconstructed_mesh.ply to.
    #[structopt(name = "OUTPUT_DIR", parse(from_os_str), default_value = ".")]
    output_dir: std::path::PathBuf,

    /// Maximum octree depth of the reconstruction. Each extra level costs about four times as
    /// much; use 7 or 8 for a quick preview.
    #[structopt(long = "depth", default_value = "9")]
    depth: usize,

    /// Search radius for normal estimation.
    #[structopt(long = "radius", default_value = "0.1")]
    radius: f64,

    /// Maximum number of neighbors used for normal estimation.
    #[structopt(long = "max-nn", default_value = "30")]
    max_nn: usize,

    /// Remove mesh vertices whose density is below this quantile (0 to 1).
    #[structopt(long = "density-quantile")]
    density_quantile: Option<f64>,

    /// Also write the point cloud with estimated normals to this file.
    #[structopt(long = "normals-out", parse(from_os_str))]
    normals_out: Option<std::path::PathBuf>,
}

fn main() -> Result<(), photopipe::Error> {
    let opt = Opt::from_args();
    photopipe::init_logging();

    if !opt.input.is_file() {
        println!("Error: Input file '{}' does not exist", opt.input.display());
        std::process::exit(1);
    }

    let opts = ReconstructOptions {
        search: SearchParam::Hybrid {
            radius: opt.radius,
            max_nn: opt.max_nn,
        },
        poisson: PoissonParams {
            depth: opt.depth,
            ..PoissonParams::default()
        },
        density_quantile: opt.density_quantile,
        normals_out: opt.normals_out,
    };

    let summary = reconstruct(&opt.input, &opt.output_dir, &opts)?;
    println!("{}", summary);

    Ok(())
}
