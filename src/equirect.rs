//! Preprocessing of input imagery for structure from motion.
//!
//! 360° photos are stored as equirectangular panoramas, which SfM tools cannot use directly. Each
//! panorama is split into four 90° rectilinear views looking front, right, back and left. Regular
//! photos are passed through untouched.
//!
//! ```no_run
//! use photopipe::equirect::*;
//! use std::path::Path;
//!
//! let report = process_directory(Path::new("raw"), Path::new("images")).unwrap();
//! for (path, err) in report.failed.iter() {
//!     eprintln!("{}: {}", path.display(), err);
//! }
//! ```

extern crate image;
extern crate indicatif;
extern crate nalgebra as na;
extern crate rayon;

use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use indicatif::ProgressIterator;
use log::{debug, info, warn};
use na::{Rotation3, Vector3};
use rayon::prelude::*;

use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use crate::{progress_bar, Error};

/// Extensions considered images. Compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Aspect ratio band accepted as a 2:1 panorama. Both bounds are exclusive.
pub const EQUIRECT_MIN_RATIO: f64 = 1.9;
pub const EQUIRECT_MAX_RATIO: f64 = 2.1;

/// Side length of the square views cut from a panorama.
pub const VIEW_SIZE: u32 = 1024;

/// Field of view of the views cut from a panorama, in degrees.
pub const VIEW_FOV: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Full-sphere panorama with a (roughly) 2:1 aspect ratio.
    Equirectangular,
    Standard,
}

/// Viewing direction of a rectilinear view cut from a panorama.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Front,
    Right,
    Back,
    Left,
}

impl Direction {
    /// All directions, in output order.
    pub const ALL: [Direction; 4] = [
        Direction::Front,
        Direction::Right,
        Direction::Back,
        Direction::Left,
    ];

    /// Yaw in degrees, clockwise seen from above.
    pub fn yaw(self) -> f64 {
        match self {
            Direction::Front => 0.0,
            Direction::Right => 90.0,
            Direction::Back => 180.0,
            Direction::Left => 270.0,
        }
    }

    /// Suffix used in output filenames.
    pub fn suffix(self) -> &'static str {
        match self {
            Direction::Front => "front",
            Direction::Right => "right",
            Direction::Back => "back",
            Direction::Left => "left",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Parameters of a perspective view extracted from a panorama.
#[derive(Debug, Clone, Copy)]
pub struct ViewParams {
    /// Horizontal field of view in degrees.
    pub fov: f64,
    /// Rotation around the vertical axis in degrees. Positive turns right.
    pub yaw: f64,
    /// Rotation around the horizontal axis in degrees. Positive looks up.
    pub pitch: f64,
    pub width: u32,
    pub height: u32,
}

impl Default for ViewParams {
    fn default() -> Self {
        ViewParams {
            fov: VIEW_FOV,
            yaw: 0.0,
            pitch: 0.0,
            width: VIEW_SIZE,
            height: VIEW_SIZE,
        }
    }
}

/// Classify an image by its dimensions. A ratio of exactly 1.9 or 2.1 is not a panorama.
pub fn classify(width: u32, height: u32) -> ImageKind {
    if height == 0 {
        return ImageKind::Standard;
    }
    let ratio = width as f64 / height as f64;
    if EQUIRECT_MIN_RATIO < ratio && ratio < EQUIRECT_MAX_RATIO {
        ImageKind::Equirectangular
    } else {
        ImageKind::Standard
    }
}

pub fn classify_image(img: &DynamicImage) -> ImageKind {
    let (w, h) = img.dimensions();
    classify(w, h)
}

/// Classify an image on disk. Only the header is read.
pub fn classify_path(path: &Path) -> Result<ImageKind, Error> {
    let (w, h) = image::image_dimensions(path)?;
    Ok(classify(w, h))
}

/// Sample `img` at continuous pixel coordinates with bilinear interpolation. The horizontal axis
/// wraps around, the vertical axis is clamped.
fn sample_bilinear(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Rgb([0, 0, 0]);
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let wrap = |i: f64| (i as i64).rem_euclid(w as i64) as u32;
    let clamp = |i: f64| (i.max(0.0) as u32).min(h - 1);
    let (xa, xb) = (wrap(x0), wrap(x0 + 1.0));
    let (ya, yb) = (clamp(y0), clamp(y0 + 1.0));

    let p00 = img.get_pixel(xa, ya);
    let p10 = img.get_pixel(xb, ya);
    let p01 = img.get_pixel(xa, yb);
    let p11 = img.get_pixel(xb, yb);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().max(0.0).min(255.0) as u8;
    }
    Rgb(out)
}

/// Render a perspective view of an equirectangular panorama.
///
/// The camera looks down +z with +x to the right and +y up. Longitude 0 is the horizontal center
/// of the panorama and latitude 0 its vertical center.
///
/// An empty view or panorama gives a black image of the requested size.
pub fn project(pano: &RgbImage, view: &ViewParams) -> RgbImage {
    let mut out = RgbImage::new(view.width, view.height);
    let (src_w, src_h) = pano.dimensions();
    if view.width == 0 || view.height == 0 || src_w == 0 || src_h == 0 {
        return out;
    }
    let (w, h) = (view.width as usize, view.height as usize);
    let half_w = (view.fov.to_radians() / 2.0).tan();
    let half_h = half_w * h as f64 / w as f64;

    // pitch first, then yaw, so that yaw stays a rotation around the world vertical
    let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), view.yaw.to_radians())
        * Rotation3::from_axis_angle(&Vector3::x_axis(), -view.pitch.to_radians());

    out.par_chunks_mut(w * 3)
        .enumerate()
        .for_each(|(row, pixels)| {
            let v = (1.0 - 2.0 * (row as f64 + 0.5) / h as f64) * half_h;
            for col in 0..w {
                let u = (2.0 * (col as f64 + 0.5) / w as f64 - 1.0) * half_w;
                let d = rotation * Vector3::new(u, v, 1.0);
                let lon = d.x.atan2(d.z);
                let lat = d.y.atan2((d.x * d.x + d.z * d.z).sqrt());
                let sx = (lon / (2.0 * PI) + 0.5) * src_w as f64 - 0.5;
                let sy = (0.5 - lat / PI) * src_h as f64 - 0.5;
                let p = sample_bilinear(pano, sx, sy);
                pixels[col * 3..col * 3 + 3].copy_from_slice(&p.0);
            }
        });

    out
}

/// Cut the four horizontal 90° views (front, right, back, left) out of a panorama.
pub fn project_to_rectilinear(pano: &DynamicImage) -> Vec<(Direction, RgbImage)> {
    let rgb = pano.to_rgb8();
    Direction::ALL
        .iter()
        .map(|&dir| {
            let view = ViewParams {
                yaw: dir.yaw(),
                ..ViewParams::default()
            };
            (dir, project(&rgb, &view))
        })
        .collect()
}

/// Output filename of one view of the panorama at `source`.
pub fn view_filename(source: &Path, dir: Direction) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    PathBuf::from(format!("{}_{}.jpg", stem, dir.suffix()))
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Write `img` to `path`, picking the encoder from the extension. JPEG cannot hold alpha or
/// 16 bit channels so those are reduced to 8 bit RGB first.
pub fn save_image(img: &DynamicImage, path: &Path) -> Result<(), Error> {
    let jpeg = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false);
    match img {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => img.save(path)?,
        _ if jpeg => DynamicImage::ImageRgb8(img.to_rgb8()).save(path)?,
        _ => img.save(path)?,
    }
    Ok(())
}

/// What happened to the images of one [process_directory] run.
#[derive(Debug, Default)]
pub struct ProcessReport {
    /// Classification of every image that could be read, in processing order.
    pub classified: Vec<(PathBuf, ImageKind)>,
    /// Files written to the output directory.
    pub written: Vec<PathBuf>,
    /// Images that could not be processed. The rest of the batch is unaffected.
    pub failed: Vec<(PathBuf, Error)>,
}

impl ProcessReport {
    pub fn num_panoramas(&self) -> usize {
        self.classified
            .iter()
            .filter(|(_, k)| *k == ImageKind::Equirectangular)
            .count()
    }

    pub fn num_standard(&self) -> usize {
        self.classified.len() - self.num_panoramas()
    }
}

impl std::fmt::Display for ProcessReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Processed {} panoramas and {} standard images into {} files, {} failures",
            self.num_panoramas(),
            self.num_standard(),
            self.written.len(),
            self.failed.len()
        )
    }
}

/// Process one image. Returns its classification and the files written.
fn process_file(path: &Path, output_dir: &Path) -> Result<(ImageKind, Vec<PathBuf>), Error> {
    let img = image::open(path)?;
    let kind = classify_image(&img);
    let mut written = Vec::new();
    match kind {
        ImageKind::Equirectangular => {
            for (dir, view) in project_to_rectilinear(&img) {
                let out = output_dir.join(view_filename(path, dir));
                view.save(&out)?;
                written.push(out);
            }
        }
        ImageKind::Standard => {
            // file_name is always present for entries of a directory listing
            let out = output_dir.join(path.file_name().unwrap_or_default());
            save_image(&img, &out)?;
            written.push(out);
        }
    }
    Ok((kind, written))
}

/// Preprocess every image in `input_dir` into `output_dir`. See [process_directory_verbose].
pub fn process_directory(input_dir: &Path, output_dir: &Path) -> Result<ProcessReport, Error> {
    process_directory_verbose(input_dir, output_dir, false)
}

/// Preprocess every image in `input_dir` into `output_dir`.
///
/// Panoramas are replaced by their four rectilinear views, other images are re-encoded under
/// their original name. Files without an image extension are ignored. Files are handled one at a
/// time in directory-listing order. A file that fails is recorded in the report and does not stop
/// the batch; only problems with the directories themselves return an error.
pub fn process_directory_verbose(
    input_dir: &Path,
    output_dir: &Path,
    verbose: bool,
) -> Result<ProcessReport, Error> {
    std::fs::create_dir_all(output_dir)?;

    let mut files = Vec::new();
    for entry in std::fs::read_dir(input_dir)? {
        let path = entry?.path();
        if path.is_file() && is_image_path(&path) {
            files.push(path);
        } else {
            debug!("Skipping {}", path.display());
        }
    }
    info!(
        "Preprocessing {} images from {}",
        files.len(),
        input_dir.display()
    );

    let mut report = ProcessReport::default();
    let pb = progress_bar(files.len() as u64, "Preprocessing", verbose);
    for path in files.into_iter().progress_with(pb) {
        match process_file(&path, output_dir) {
            Ok((kind, written)) => {
                debug!("{} classified as {:?}", path.display(), kind);
                report.classified.push((path, kind));
                report.written.extend(written);
            }
            Err(e) => {
                warn!("Failed to process {}: {}", path.display(), e);
                report.failed.push((path, e));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
fn quadrant_panorama(width: u32, height: u32) -> RgbImage {
    // columns are colored by the direction that looks at them
    RgbImage::from_fn(width, height, |x, _| {
        let lon = (x as f64 + 0.5) / width as f64 * 360.0 - 180.0;
        if lon >= -45.0 && lon < 45.0 {
            Rgb([255, 0, 0])
        } else if lon >= 45.0 && lon < 135.0 {
            Rgb([0, 255, 0])
        } else if lon >= -135.0 && lon < -45.0 {
            Rgb([255, 255, 0])
        } else {
            Rgb([0, 0, 255])
        }
    })
}

#[test]
fn test_classify_bounds() {
    assert_eq!(classify(4000, 2000), ImageKind::Equirectangular);
    assert_eq!(classify(1901, 1000), ImageKind::Equirectangular);
    assert_eq!(classify(2099, 1000), ImageKind::Equirectangular);
    assert_eq!(classify(19, 10), ImageKind::Standard);
    assert_eq!(classify(21, 10), ImageKind::Standard);
    assert_eq!(classify(800, 600), ImageKind::Standard);
    assert_eq!(classify(1000, 2000), ImageKind::Standard);
    assert_eq!(classify(100, 0), ImageKind::Standard);
}

#[test]
fn test_project_empty() {
    let pano = quadrant_panorama(64, 32);
    let view = ViewParams {
        width: 0,
        height: 16,
        ..ViewParams::default()
    };
    assert_eq!(project(&pano, &view).dimensions(), (0, 16));

    let flat = RgbImage::new(64, 0);
    let view = ViewParams {
        width: 8,
        height: 8,
        ..ViewParams::default()
    };
    let out = project(&flat, &view);
    assert_eq!(out.dimensions(), (8, 8));
    assert!(out.pixels().all(|p| *p == Rgb([0, 0, 0])));
    assert_eq!(sample_bilinear(&flat, 3.5, 0.5), Rgb([0, 0, 0]));
}

#[test]
fn test_image_extensions() {
    assert!(is_image_path(Path::new("a/b.jpg")));
    assert!(is_image_path(Path::new("b.JPEG")));
    assert!(is_image_path(Path::new("c.Png")));
    assert!(!is_image_path(Path::new("d.tiff")));
    assert!(!is_image_path(Path::new("jpg")));
}

#[test]
fn test_view_filenames() {
    let src = Path::new("/data/pano.v2.jpg");
    let names = Direction::ALL
        .iter()
        .map(|d| view_filename(src, *d))
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        vec![
            PathBuf::from("pano.v2_front.jpg"),
            PathBuf::from("pano.v2_right.jpg"),
            PathBuf::from("pano.v2_back.jpg"),
            PathBuf::from("pano.v2_left.jpg"),
        ]
    );
}

#[test]
fn test_project_directions() {
    let pano = quadrant_panorama(400, 200);
    let expected = [
        (0.0, Rgb([255, 0, 0])),
        (90.0, Rgb([0, 255, 0])),
        (180.0, Rgb([0, 0, 255])),
        (270.0, Rgb([255, 255, 0])),
    ];
    for (yaw, color) in expected.iter() {
        let view = ViewParams {
            yaw: *yaw,
            width: 64,
            height: 64,
            ..ViewParams::default()
        };
        let out = project(&pano, &view);
        assert_eq!(out.dimensions(), (64, 64));
        assert_eq!(*out.get_pixel(32, 32), *color, "yaw {}", yaw);
    }
}

#[test]
fn test_project_pitch_looks_at_poles() {
    // top half white, bottom half black
    let pano = RgbImage::from_fn(200, 100, |_, y| {
        if y < 50 {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    });
    let up = ViewParams {
        pitch: 60.0,
        width: 16,
        height: 16,
        ..ViewParams::default()
    };
    let down = ViewParams { pitch: -60.0, ..up };
    assert_eq!(*project(&pano, &up).get_pixel(8, 8), Rgb([255, 255, 255]));
    assert_eq!(*project(&pano, &down).get_pixel(8, 8), Rgb([0, 0, 0]));
}

#[test]
fn test_project_to_rectilinear_sizes() {
    let pano = DynamicImage::ImageRgb8(quadrant_panorama(256, 128));
    let views = project_to_rectilinear(&pano);
    assert_eq!(
        views.iter().map(|(d, _)| *d).collect::<Vec<_>>(),
        Direction::ALL.to_vec()
    );
    for (_, view) in views.iter() {
        assert_eq!(view.dimensions(), (VIEW_SIZE, VIEW_SIZE));
    }
}

#[test]
fn test_bilinear_wraps_horizontally() {
    let img = RgbImage::from_fn(4, 2, |x, _| if x == 0 { Rgb([200, 0, 0]) } else { Rgb([0, 0, 0]) });
    // halfway between the last and the first column
    let p = sample_bilinear(&img, 3.5, 0.0);
    assert_eq!(p, Rgb([100, 0, 0]));
}

#[test]
fn test_standard_png_passes_through() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let img = RgbImage::from_fn(37, 23, |x, y| Rgb([(x * 7) as u8, (y * 11) as u8, (x ^ y) as u8]));
    img.save(input.path().join("photo.png")).unwrap();
    std::fs::write(input.path().join("notes.txt"), "not an image").unwrap();

    let report = process_directory(input.path(), output.path()).unwrap();
    assert_eq!(report.written, vec![output.path().join("photo.png")]);
    assert!(report.failed.is_empty());

    let copied = image::open(output.path().join("photo.png")).unwrap().to_rgb8();
    assert_eq!(copied, img);
    assert!(!output.path().join("notes.txt").exists());
}

#[test]
fn test_corrupt_image_does_not_abort_batch() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("broken.jpg"), b"definitely not a jpeg").unwrap();
    RgbImage::new(40, 30)
        .save(input.path().join("good.png"))
        .unwrap();

    let report = process_directory(input.path(), output.path()).unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, input.path().join("broken.jpg"));
    assert_eq!(report.num_standard(), 1);
    assert!(output.path().join("good.png").exists());
}

#[test]
fn test_process_directory_is_idempotent() {
    let input = tempfile::tempdir().unwrap();
    DynamicImage::ImageRgb8(quadrant_panorama(400, 200))
        .save(input.path().join("pano.png"))
        .unwrap();
    RgbImage::new(60, 40)
        .save(input.path().join("flat.png"))
        .unwrap();

    let names = |dir: &Path| {
        let mut names = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect::<Vec<_>>();
        names.sort();
        names
    };
    let sorted = |report: &ProcessReport| {
        let mut c = report
            .classified
            .iter()
            .map(|(p, k)| (p.file_name().unwrap().to_owned(), *k))
            .collect::<Vec<_>>();
        c.sort_by(|a, b| a.0.cmp(&b.0));
        c
    };

    let out1 = tempfile::tempdir().unwrap();
    let out2 = tempfile::tempdir().unwrap();
    let r1 = process_directory(input.path(), out1.path()).unwrap();
    let r2 = process_directory(input.path(), out2.path()).unwrap();
    assert_eq!(sorted(&r1), sorted(&r2));
    assert_eq!(names(out1.path()), names(out2.path()));
    assert_eq!(names(out1.path()).len(), 5);
}

#[test]
fn test_output_dir_is_created() {
    let input = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let output = root.path().join("nested").join("out");
    let report = process_directory(input.path(), &output).unwrap();
    assert!(output.is_dir());
    assert!(report.written.is_empty());
}
