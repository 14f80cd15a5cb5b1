//! Tools for a photogrammetry pipeline: simulated image capture, panorama preprocessing and
//! surface reconstruction from point clouds.
//!
//! Each stage is an independent batch job that only talks to the others through files on disk:
//! - [capture] drives a simulator and saves camera frames.
//! - [imagery] sets up an authenticated Mapillary client.
//! - [equirect] splits 360° panoramas into four rectilinear views.
//! - [reconstruct] turns a point cloud into a mesh with Poisson reconstruction.

extern crate ctrlc;
extern crate image;
extern crate indicatif;
extern crate log;

use indicatif::{ProgressBar, ProgressStyle};

pub mod capture;
#[cfg(feature = "carla")]
pub mod carla;
pub mod equirect;
pub mod imagery;
pub mod mesh;
pub mod pointcloud;
pub mod reconstruct;

pub use equirect::{classify, process_directory, project_to_rectilinear, Direction, ImageKind};
pub use mesh::TriangleMesh;
pub use pointcloud::{estimate_normals, PointCloud, SearchParam};
pub use reconstruct::{reconstruct, ReconstructOptions};

#[derive(Debug)]
pub enum Error {
    ParseError(String),
    EmptyPointCloud(String),
    MissingEnv(String),
    NoSpawnPoint,
    Simulator(String),
    Interrupted,
    Reconstruction(String),
    IOError(std::io::Error),
    ImageError(image::ImageError),
    HttpError(reqwest::Error),
    SignalError(ctrlc::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IOError(e)
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::ImageError(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::HttpError(e)
    }
}

impl From<ctrlc::Error> for Error {
    fn from(e: ctrlc::Error) -> Self {
        Error::SignalError(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ParseError(msg) => write!(f, "invalid format: {}", msg),
            Error::EmptyPointCloud(path) => write!(f, "point cloud {} has no points", path),
            Error::MissingEnv(var) => write!(f, "environment variable {} is not set", var),
            Error::NoSpawnPoint => write!(f, "no spawn point available for the ego vehicle"),
            Error::Simulator(msg) => write!(f, "simulator error: {}", msg),
            Error::Interrupted => write!(f, "interrupted"),
            Error::Reconstruction(msg) => write!(f, "reconstruction failed: {}", msg),
            Error::IOError(e) => write!(f, "{}", e),
            Error::ImageError(e) => write!(f, "{}", e),
            Error::HttpError(e) => write!(f, "{}", e),
            Error::SignalError(e) => write!(f, "cannot install Ctrl-C handler: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IOError(e) => Some(e),
            Error::ImageError(e) => Some(e),
            Error::HttpError(e) => Some(e),
            Error::SignalError(e) => Some(e),
            _ => None,
        }
    }
}

/// Progress bar in the shared style. Hidden when `verbose` is false so library calls stay quiet
/// in tests.
pub(crate) fn progress_bar(length: u64, message: &str, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {pos}/{len} ({eta})")
            .progress_chars("#-"),
    );
    pb.set_message(message);
    pb
}

/// Install the `env_logger` backend with `info` as the default level. `RUST_LOG` overrides it.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .try_init();
}

#[test]
fn test_signal_error() {
    let e = Error::from(ctrlc::Error::MultipleHandlers);
    assert!(matches!(e, Error::SignalError(_)));
    assert!(e.to_string().starts_with("cannot install Ctrl-C handler: "));
    assert!(std::error::Error::source(&e).is_some());
}
