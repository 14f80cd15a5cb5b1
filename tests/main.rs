use assert_cmd::prelude::*;
use nalgebra::Point3;
use photopipe::{PointCloud, TriangleMesh};
use predicates::prelude::*;
use std::path::*;
use std::process::Command;
use tempfile::tempdir;

/// Points spread evenly over a sphere.
fn sphere(n: usize, radius: f64) -> Vec<Point3<f64>> {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - y * y).sqrt();
            let theta = golden * i as f64;
            Point3::new(
                radius * r * theta.cos(),
                radius * y,
                radius * r * theta.sin(),
            )
        })
        .collect()
}

fn write_image(path: &Path, width: u32, height: u32) {
    image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    })
    .save(path)
    .unwrap();
}

#[test]
fn preprocess_mixed_directory() -> Result<(), Box<dyn std::error::Error>> {
    let input = tempdir()?;
    let output = tempdir()?;
    write_image(&input.path().join("pano.jpg"), 4000, 2000);
    write_image(&input.path().join("flat.jpg"), 800, 600);
    std::fs::write(input.path().join("notes.txt"), "not an image")?;

    let mut cmd = Command::cargo_bin("preprocess")?;
    cmd.arg(input.path()).arg(output.path());
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("1 panoramas and 1 standard images"));

    let mut names = std::fs::read_dir(output.path())?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<Result<Vec<_>, _>>()?;
    names.sort();
    assert_eq!(
        names,
        vec![
            "flat.jpg",
            "pano_back.jpg",
            "pano_front.jpg",
            "pano_left.jpg",
            "pano_right.jpg"
        ]
    );
    assert_eq!(
        image::image_dimensions(output.path().join("pano_front.jpg"))?,
        (1024, 1024)
    );
    assert_eq!(
        image::image_dimensions(output.path().join("flat.jpg"))?,
        (800, 600)
    );

    Ok(())
}

#[test]
fn preprocess_reports_corrupt_image() -> Result<(), Box<dyn std::error::Error>> {
    let input = tempdir()?;
    let output = input.path().join("nested").join("out");
    write_image(&input.path().join("good.png"), 64, 48);
    std::fs::write(input.path().join("bad.jpg"), b"definitely not a jpeg")?;

    let mut cmd = Command::cargo_bin("preprocess")?;
    cmd.arg(input.path()).arg(&output);
    cmd.assert()
        .failure()
        .stdout(predicate::str::contains("1 failures"));
    assert!(output.join("good.png").exists());

    Ok(())
}

#[test]
fn reconstruct_missing_input() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let missing = dir.path().join("missing.ply");

    let mut cmd = Command::cargo_bin("reconstruct")?;
    cmd.arg(&missing).arg(dir.path());
    cmd.assert().failure().stdout(predicate::str::contains(format!(
        "Error: Input file '{}' does not exist",
        missing.display()
    )));
    assert!(!dir.path().join("reconstructed_mesh.ply").exists());

    Ok(())
}

#[test]
fn reconstruct_directory_input() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let out = dir.path().join("out");

    let mut cmd = Command::cargo_bin("reconstruct")?;
    cmd.arg(dir.path()).arg(&out);
    cmd.assert().failure().stdout(predicate::str::contains(format!(
        "Error: Input file '{}' does not exist",
        dir.path().display()
    )));
    assert!(!out.exists());

    Ok(())
}

#[test]
fn reconstruct_sphere() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("sphere.ply");
    PointCloud::new(sphere(2000, 1.0)).write_ply(&input)?;
    let out = dir.path().join("mesh");
    let normals = dir.path().join("normals.ply");

    let mut cmd = Command::cargo_bin("reconstruct")?;
    cmd.arg(&input)
        .arg(&out)
        .arg("--depth")
        .arg("5")
        .arg("--radius")
        .arg("0.2")
        .arg("--normals-out")
        .arg(&normals);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "Loaded point cloud with 2000 points",
        ))
        .stdout(predicate::str::contains("Mesh created with"))
        .stdout(predicate::str::contains("Mesh saved to"));

    let mesh = TriangleMesh::from_ply(&out.join("reconstructed_mesh.ply"))?;
    assert!(mesh.num_triangles() > 0);
    let oriented = PointCloud::from_ply(&normals)?;
    assert!(oriented.has_normals());
    assert_eq!(oriented.len(), 2000);

    Ok(())
}

#[test]
fn imagery_requires_token() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;

    let mut cmd = Command::cargo_bin("imagery")?;
    cmd.current_dir(dir.path())
        .env_remove("MAPILLARY_ACCESS_TOKEN");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("MAPILLARY_ACCESS_TOKEN"));

    Ok(())
}

#[test]
fn imagery_reads_dotenv() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    std::fs::write(dir.path().join(".env"), "MAPILLARY_ACCESS_TOKEN=MLY|1|abc\n")?;

    let mut cmd = Command::cargo_bin("imagery")?;
    cmd.current_dir(dir.path())
        .env_remove("MAPILLARY_ACCESS_TOKEN");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("authentication configured"));

    Ok(())
}
